//! Charset detection and conversion.
//!
//! Recorded bodies are normalized to UTF-8 on disk so they stay readable
//! and diffable; playback restores the original bytes and rewrites the
//! outgoing `Content-Type`. Detection looks at the `charset=` parameter
//! first, then at the document prologue (HTML `<meta charset>` within the
//! first 1024 bytes, CSS `@charset` within the first 512).
//!
//! Conversion goes through encoding_rs, except the UTF-16 family: encoding_rs
//! only decodes UTF-16, so the encode path is done by hand.

use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::error::{Error, Result};

static HTML_META_CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta[^>]+charset\s*=\s*["']?([^"'\s>]+)["']?[^>]*>"#).unwrap()
});

static CSS_CHARSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"@charset\s+["']([^"']+)["']"#).unwrap());

/// How many leading bytes of an HTML body are scanned for a meta charset.
const HTML_SCAN_LIMIT: usize = 1024;
/// How many leading bytes of a CSS body are scanned for an @charset rule.
const CSS_SCAN_LIMIT: usize = 512;

/// UTF-16 flavors that need the manual conversion path.
#[derive(Clone, Copy, PartialEq)]
enum Utf16Flavor {
    /// Plain `utf-16`: BOM-aware decode, BOM-prefixed big-endian encode.
    WithBom,
    Be,
    Le,
}

/// Extracts the declared charsets from the `Content-Type` header and, for
/// HTML/CSS, from the body prologue. Both results are lowercased; empty
/// strings mean "not declared".
pub fn detect_charset(content_type: &str, body: &[u8]) -> (String, String) {
    let http_charset = header_charset(content_type);

    let lowered = content_type.to_ascii_lowercase();
    let content_charset = if lowered.contains("text/html") {
        scan_charset(&HTML_META_CHARSET, body, HTML_SCAN_LIMIT)
    } else if lowered.contains("text/css") {
        scan_charset(&CSS_CHARSET, body, CSS_SCAN_LIMIT)
    } else {
        String::new()
    };

    (http_charset, content_charset)
}

/// The token after `charset=` in a media type, trimmed of quotes and
/// whitespace and lowercased.
fn header_charset(content_type: &str) -> String {
    let lowered = content_type.to_ascii_lowercase();
    let Some(idx) = lowered.find("charset=") else {
        return String::new();
    };
    let mut token = &content_type[idx + "charset=".len()..];
    if let Some(semi) = token.find(';') {
        token = &token[..semi];
    }
    token
        .trim_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'')
        .to_ascii_lowercase()
}

fn scan_charset(pattern: &Regex, body: &[u8], limit: usize) -> String {
    let window = &body[..body.len().min(limit)];
    pattern
        .captures(window)
        .and_then(|caps| caps.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).to_ascii_lowercase())
        .unwrap_or_default()
}

/// The parsed media type (lowercased) and charset parameter of a
/// `Content-Type` header value.
pub fn parse_content_type(content_type: &str) -> (Option<String>, Option<String>) {
    let trimmed = content_type.trim();
    if trimmed.is_empty() {
        return (None, None);
    }
    let mime = trimmed
        .split(';')
        .next()
        .map(|m| m.trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty());
    let charset = Some(header_charset(content_type)).filter(|c| !c.is_empty());
    (mime, charset)
}

fn utf16_flavor(label: &str) -> Option<Utf16Flavor> {
    match label {
        "utf-16" | "utf16" => Some(Utf16Flavor::WithBom),
        "utf-16be" | "utf16be" => Some(Utf16Flavor::Be),
        "utf-16le" | "utf16le" => Some(Utf16Flavor::Le),
        _ => None,
    }
}

fn lookup_encoding(label: &str) -> Option<&'static encoding_rs::Encoding> {
    use encoding_rs::*;
    let enc: &'static Encoding = match label {
        "utf-8" | "utf8" => UTF_8,
        "shift_jis" | "shift-jis" | "sjis" | "ms_kanji" => SHIFT_JIS,
        "euc-jp" | "eucjp" => EUC_JP,
        "iso-2022-jp" | "iso2022jp" => ISO_2022_JP,
        "euc-kr" | "euckr" => EUC_KR,
        // GB18030 is a superset of GB2312.
        "gb2312" | "gb-2312" | "gb18030" | "gb-18030" => GB18030,
        "gbk" => GBK,
        "big5" | "big-5" => BIG5,
        "iso-8859-2" | "iso8859-2" | "latin2" => ISO_8859_2,
        "iso-8859-15" | "iso8859-15" => ISO_8859_15,
        "windows-1252" | "cp1252" => WINDOWS_1252,
        "windows-1251" | "cp1251" => WINDOWS_1251,
        _ => return None,
    };
    Some(enc)
}

/// ISO-8859-1 labels. encoding_rs follows WHATWG and has no standalone
/// ISO-8859-1 codec (the label resolves to windows-1252 there), but the
/// real table is 1:1 bytes to U+0000..=U+00FF — including the C1 controls
/// windows-1252 cannot represent — so it is converted directly.
fn is_latin1(label: &str) -> bool {
    matches!(label, "iso-8859-1" | "iso8859-1" | "latin1")
}

fn latin1_to_utf8(content: &[u8]) -> Vec<u8> {
    content
        .iter()
        .map(|&byte| byte as char)
        .collect::<String>()
        .into_bytes()
}

fn utf8_to_latin1(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| {
            let code_point = c as u32;
            if code_point <= 0xFF {
                Ok(code_point as u8)
            } else {
                Err(Error::encoding(
                    "iso-8859-1",
                    format!("U+{code_point:04X} is outside the Latin-1 range"),
                ))
            }
        })
        .collect()
}

/// Transcodes `content` from `from_charset` into UTF-8. Empty and UTF-8
/// labels are a no-op; unknown labels and malformed input are errors.
pub fn to_utf8(content: &[u8], from_charset: &str) -> Result<Vec<u8>> {
    let label = from_charset.to_ascii_lowercase();
    if label.is_empty() || label == "utf-8" || label == "utf8" {
        return Ok(content.to_vec());
    }

    if let Some(flavor) = utf16_flavor(&label) {
        return utf16_to_utf8(content, flavor);
    }
    if is_latin1(&label) {
        return Ok(latin1_to_utf8(content));
    }

    let encoding = lookup_encoding(&label)
        .ok_or_else(|| Error::encoding(from_charset, "unsupported charset"))?;
    let (decoded, _, had_errors) = encoding.decode(content);
    if had_errors {
        return Err(Error::encoding(
            from_charset,
            "input is not valid in the declared charset",
        ));
    }
    Ok(decoded.into_owned().into_bytes())
}

/// Transcodes UTF-8 `content` into `to_charset`. Empty and UTF-8 labels are
/// a no-op; unknown labels and unmappable characters are errors.
pub fn from_utf8(content: &[u8], to_charset: &str) -> Result<Vec<u8>> {
    let label = to_charset.to_ascii_lowercase();
    if label.is_empty() || label == "utf-8" || label == "utf8" {
        return Ok(content.to_vec());
    }

    let text = std::str::from_utf8(content)
        .map_err(|e| Error::encoding(to_charset, format!("stored body is not UTF-8: {e}")))?;

    if let Some(flavor) = utf16_flavor(&label) {
        return Ok(utf8_to_utf16(text, flavor));
    }
    if is_latin1(&label) {
        return utf8_to_latin1(text);
    }

    let encoding = lookup_encoding(&label)
        .ok_or_else(|| Error::encoding(to_charset, "unsupported charset"))?;
    let (encoded, _, had_errors) = encoding.encode(text);
    if had_errors {
        return Err(Error::encoding(
            to_charset,
            "content has characters outside the target charset",
        ));
    }
    Ok(encoded.into_owned())
}

fn utf16_to_utf8(content: &[u8], flavor: Utf16Flavor) -> Result<Vec<u8>> {
    if content.is_empty() {
        return Ok(Vec::new());
    }
    if content.len() % 2 != 0 {
        return Err(Error::encoding("utf-16", "odd byte length"));
    }

    let (big_endian, start) = match flavor {
        Utf16Flavor::Be => (true, 0),
        Utf16Flavor::Le => (false, 0),
        Utf16Flavor::WithBom => match (content[0], content[1]) {
            (0xfe, 0xff) => (true, 2),
            (0xff, 0xfe) => (false, 2),
            _ => (true, 0),
        },
    };

    let units: Vec<u16> = content[start..]
        .chunks_exact(2)
        .map(|pair| {
            if big_endian {
                u16::from_be_bytes([pair[0], pair[1]])
            } else {
                u16::from_le_bytes([pair[0], pair[1]])
            }
        })
        .collect();

    let text = String::from_utf16(&units)
        .map_err(|e| Error::encoding("utf-16", e.to_string()))?;
    Ok(text.into_bytes())
}

fn utf8_to_utf16(text: &str, flavor: Utf16Flavor) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() * 2 + 2);
    let big_endian = match flavor {
        Utf16Flavor::WithBom => {
            out.extend_from_slice(&[0xfe, 0xff]);
            true
        }
        Utf16Flavor::Be => true,
        Utf16Flavor::Le => false,
    };
    for unit in text.encode_utf16() {
        let bytes = if big_endian {
            unit.to_be_bytes()
        } else {
            unit.to_le_bytes()
        };
        out.extend_from_slice(&bytes);
    }
    out
}

/// Outcome of [`normalize_for_recording`].
#[derive(Debug)]
pub struct RecordingCharsets {
    /// Body bytes to persist (UTF-8 on success, original bytes otherwise).
    pub body: Vec<u8>,
    /// Charset declared in the `Content-Type` header, lowercased.
    pub http_charset: String,
    /// Charset actually applied to the stored body; carries a `-failed`
    /// suffix when transcoding did not succeed. Empty when none applied.
    pub content_charset: String,
}

/// Normalizes a recorded body to UTF-8.
///
/// The final charset is the body-declared one if present, else the header
/// one. Nothing to do for empty/UTF-8. A transcoding failure keeps the
/// original bytes and marks the charset `-failed` so playback leaves the
/// body alone.
pub fn normalize_for_recording(content_type: &str, body: &[u8]) -> RecordingCharsets {
    let (http_charset, content_charset) = detect_charset(content_type, body);

    let final_charset = if content_charset.is_empty() {
        http_charset.clone()
    } else {
        content_charset
    };

    if final_charset.is_empty() || final_charset == "utf-8" {
        return RecordingCharsets {
            body: body.to_vec(),
            http_charset,
            content_charset: final_charset,
        };
    }

    match to_utf8(body, &final_charset) {
        Ok(converted) => RecordingCharsets {
            body: converted,
            http_charset,
            content_charset: final_charset,
        },
        Err(err) => {
            tracing::warn!(charset = %final_charset, error = %err, "charset normalization failed, keeping original bytes");
            RecordingCharsets {
                body: body.to_vec(),
                http_charset,
                content_charset: format!("{final_charset}-failed"),
            }
        }
    }
}

/// Restores a stored UTF-8 body to its recorded charset for playback.
///
/// No-op for empty, UTF-8 and `-failed` charsets. On success the caller
/// must advertise the restored charset via
/// [`rewrite_content_type_charset`].
pub fn restore_for_playback(body: &[u8], content_charset: &str) -> Result<Vec<u8>> {
    let label = content_charset.to_ascii_lowercase();
    if label.is_empty() || label == "utf-8" || label.ends_with("-failed") {
        return Ok(body.to_vec());
    }
    from_utf8(body, content_charset)
}

/// Rewrites a `Content-Type` value to carry `charset=<charset>`, replacing
/// any existing charset parameter.
pub fn rewrite_content_type_charset(content_type: &str, charset: &str) -> String {
    let mut value = content_type.to_string();

    if let Some(idx) = value.to_ascii_lowercase().find("charset=") {
        let before = value[..idx].to_string();
        let after = &value[idx..];
        let rest = match after.find(';') {
            Some(semi) => after[semi..].to_string(),
            None => String::new(),
        };
        value = format!("{}{}", before.trim(), rest);
    }

    if !value.is_empty() && !value.ends_with(';') {
        value.push_str("; ");
    }
    value.push_str(&format!("charset={charset}"));
    value
}
