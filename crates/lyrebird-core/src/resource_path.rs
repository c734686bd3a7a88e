//! URL <-> file path codec.
//!
//! The inventory stores one body file per `(method, URL)` under
//! `contents/<method>/<scheme>/<host>/<path>`, so the tree stays browsable
//! with ordinary file tools. Query strings are folded into the final file
//! name with `~` as the separator; over-long queries are truncated and
//! capped with a SHA-1 suffix so the mapping stays deterministic.
//!
//! The reverse direction is best-effort: it is lossless as long as
//! sanitization did not rewrite characters and the query fit under
//! [`PathOptions::max_param_length`].

use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::{Digest, Sha1};
use url::Url;

use crate::error::{Error, Result};

/// Limits for embedding query strings into file names.
#[derive(Debug, Clone, Copy)]
pub struct PathOptions {
    /// Longest encoded query kept verbatim before hashing kicks in.
    pub max_param_length: usize,
    /// Length of the Base64(SHA-1) suffix appended to truncated queries.
    pub hash_length: usize,
}

impl Default for PathOptions {
    fn default() -> Self {
        PathOptions {
            max_param_length: 32,
            hash_length: 8,
        }
    }
}

/// Base names Windows refuses to create, case-insensitive.
const DOS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Converts a method and URL to the relative content path, sanitized for
/// safe filesystem use. This is the store's authoritative mapping.
pub fn resource_file_path(method: &str, raw_url: &str) -> Result<String> {
    let path = encode(method, raw_url, PathOptions::default())?;
    Ok(sanitize(&path))
}

/// Converts a method and URL to a relative file path without sanitization.
pub fn encode(method: &str, raw_url: &str, options: PathOptions) -> Result<String> {
    let parsed = Url::parse(raw_url)
        .map_err(|e| Error::PathCodec(format!("failed to parse URL {raw_url}: {e}")))?;

    let method_lower = method.to_ascii_lowercase();

    let mut scheme = parsed.scheme().to_ascii_lowercase();
    if scheme.is_empty() {
        scheme = "http".to_string();
    }

    let host = parsed
        .host_str()
        .map(|h| h.to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::PathCodec(format!("hostname is required in URL: {raw_url}")))?;

    let mut path = parsed.path().to_string();
    if path.is_empty() {
        path = "/".to_string();
    }
    path = normalize_path(&path);

    if let Some(query) = parsed.query().filter(|q| !q.is_empty()) {
        path = embed_query(&path, query, options);
    }

    Ok(format!(
        "{method_lower}/{scheme}/{host}/{}",
        path.trim_start_matches('/')
    ))
}

/// Appends `index.html` to directory-like paths: a trailing `/`, or a final
/// segment with no extension (treated as a directory).
fn normalize_path(path: &str) -> String {
    if path.ends_with('/') {
        return format!("{path}index.html");
    }
    if extension(path).is_none() {
        return format!("{path}/index.html");
    }
    path.to_string()
}

/// The extension of the final path segment including the dot, if any.
fn extension(path: &str) -> Option<&str> {
    let base = path.rsplit('/').next().unwrap_or(path);
    base.rfind('.').map(|idx| &base[idx..])
}

/// Re-encodes a raw query pair-wise: percent-decode best-effort, split on
/// `&` and the first `=`, then path-style re-encode each side. Literal `=`
/// and `&` survive, which keeps the file names readable.
fn encode_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let decoded = match urlencoding::decode(query) {
        Ok(d) => d.into_owned(),
        Err(_) => query.to_string(),
    };

    decoded
        .split('&')
        .map(|param| match param.split_once('=') {
            Some((name, value)) => format!(
                "{}={}",
                urlencoding::encode(name),
                urlencoding::encode(value)
            ),
            None => urlencoding::encode(param).into_owned(),
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Percent-decodes an embedded query pair-wise.
fn decode_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    query
        .split('&')
        .map(|param| match param.split_once('=') {
            Some((name, value)) => {
                let name = urlencoding::decode(name)
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| name.to_string());
                let value = urlencoding::decode(value)
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| value.to_string());
                format!("{name}={value}")
            }
            None => urlencoding::decode(param)
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| param.to_string()),
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Folds an encoded query into the file name, hashing the overflow.
fn embed_query(path: &str, raw_query: &str, options: PathOptions) -> String {
    let mut encoded = encode_query(raw_query);

    // The encoded query is pure ASCII, so byte slicing is safe here.
    if encoded.len() > options.max_param_length {
        let prefix = &encoded[..options.max_param_length];
        let remainder = &encoded[options.max_param_length..];
        let digest = Sha1::digest(remainder.as_bytes());
        let hash_b64 = STANDARD.encode(digest);
        let suffix = &hash_b64[..options.hash_length.min(hash_b64.len())];
        encoded = format!("{prefix}{suffix}");
    }

    if let Some(base) = path.strip_suffix("/index.html") {
        return format!("{base}/index~{encoded}.html");
    }

    match extension(path) {
        Some(ext) => {
            let base = &path[..path.len() - ext.len()];
            format!("{base}~{encoded}{ext}")
        }
        None => format!("{path}~{encoded}"),
    }
}

/// Converts a relative content path back to `(method, url)`.
///
/// Inverts [`encode`] approximately: `index.html` collapses back to a
/// trailing slash, and a `~`-embedded query is extracted and decoded. Not
/// lossless when sanitization rewrote characters or the query overflowed
/// into its hash suffix.
pub fn decode(file_path: &str) -> Result<(String, String)> {
    let normalized = file_path.replace('\\', "/");
    let parts: Vec<&str> = normalized.split('/').collect();
    if parts.len() < 3 {
        return Err(Error::PathCodec(format!(
            "invalid file path format: {file_path}"
        )));
    }

    let method = parts[0].to_ascii_uppercase();
    let scheme = parts[1];
    let host = parts[2];

    let mut path = format!("/{}", parts[3..].join("/"));

    if path.ends_with("/index.html") {
        // Keep the trailing slash for directory paths.
        path.truncate(path.len() - "index.html".len());
    }

    let mut query = String::new();
    if let Some(tilde) = path.rfind('~') {
        match extension(&path) {
            Some(ext) => {
                let ext = ext.to_string();
                let query_with_ext = &path[tilde + 1..];
                query = query_with_ext
                    .strip_suffix(ext.as_str())
                    .unwrap_or(query_with_ext)
                    .to_string();

                if path[..tilde].ends_with("/index") && ext == ".html" {
                    // The index file name stands in for a directory access.
                    let before = path[..tilde].strip_suffix("/index").unwrap_or("");
                    path = if before.is_empty() {
                        "/".to_string()
                    } else {
                        before.to_string()
                    };
                } else {
                    path = format!("{}{}", &path[..tilde], ext);
                }
            }
            None => {
                query = path[tilde + 1..].to_string();
                path = path[..tilde].to_string();
            }
        }
        query = decode_query(&query);
    }

    let mut url = format!("{scheme}://{host}{path}");
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query);
    }

    Ok((method, url))
}

/// Replaces characters that are unsafe on common filesystems and prefixes
/// path segments whose base name is a DOS-reserved device name.
pub fn sanitize(path: &str) -> String {
    let mut result = path.to_string();
    for unsafe_char in ['<', '>', ':', '"', '|', '?', '*'] {
        result = result.replace(unsafe_char, "_");
    }

    result
        .split('/')
        .map(|segment| {
            let base = match segment.rfind('.') {
                Some(idx) => &segment[..idx],
                None => segment,
            };
            if DOS_RESERVED
                .iter()
                .any(|reserved| base.eq_ignore_ascii_case(reserved))
            {
                format!("_{segment}")
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
