//! Inventory data model.
//!
//! A [`Resource`] is one captured HTTP transaction keyed by `(method, URL)`.
//! The [`Inventory`] is the aggregate persisted as indented JSON at
//! `<base>/inventory.json`, with decoded bodies in a parallel `contents/`
//! tree. Absent optional fields are omitted from the JSON, never null.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// HTTP headers as a name -> last-value-seen mapping.
///
/// Ordering is insignificant on the wire; a BTreeMap keeps manifests stable
/// across runs so inventories diff cleanly.
pub type HttpHeaders = BTreeMap<String, String>;

/// Looks up a header value, ignoring name case.
pub fn header_get<'a>(headers: &'a HttpHeaders, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Sets a header value, replacing any existing entry regardless of name case.
///
/// The existing key's spelling is preserved when replacing.
pub fn header_set(headers: &mut HttpHeaders, name: &str, value: impl Into<String>) {
    if let Some(key) = headers
        .keys()
        .find(|k| k.eq_ignore_ascii_case(name))
        .cloned()
    {
        headers.insert(key, value.into());
    } else {
        headers.insert(name.to_string(), value.into());
    }
}

/// Supported wire compression formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    Gzip,
    Deflate,
    Br,
    Zstd,
    Compress,
    Identity,
}

impl ContentEncoding {
    /// The wire token for this encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
            ContentEncoding::Br => "br",
            ContentEncoding::Zstd => "zstd",
            ContentEncoding::Compress => "compress",
            ContentEncoding::Identity => "identity",
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentEncoding {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gzip" => Ok(ContentEncoding::Gzip),
            "deflate" => Ok(ContentEncoding::Deflate),
            "br" => Ok(ContentEncoding::Br),
            "zstd" => Ok(ContentEncoding::Zstd),
            "compress" => Ok(ContentEncoding::Compress),
            "identity" => Ok(ContentEncoding::Identity),
            other => Err(crate::Error::Validation(format!(
                "unknown content encoding: {other}"
            ))),
        }
    }
}

/// Device class a recording was made as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
}

/// One captured HTTP transaction, keyed by `(method, url)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub method: String,
    pub url: String,
    /// Time to first byte in milliseconds, clamped to [0, 3_600_000].
    #[serde(default)]
    pub ttfb_ms: i64,
    /// Body transfer rate in binary megabits (1024*1024 bits) per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub raw_headers: HttpHeaders,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<ContentEncoding>,
    /// Parsed media type, lowercased.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type_mime: Option<String>,
    /// Charset token originally declared in `Content-Type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type_charset: Option<String>,
    /// Charset actually applied to the stored body. A `-failed` suffix means
    /// the stored body is the original bytes and playback must not transcode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_charset: Option<String>,
    /// Relative path under `contents/`; the path codec output for the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_utf8: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_base64: Option<String>,
    /// Minify the body during playback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minify: Option<bool>,
    /// Request start instant; used only for the dedup tie-break.
    #[serde(skip)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Resource {
    /// The `METHOD:URL` lookup key this resource is stored under.
    pub fn key(&self) -> String {
        format!("{}:{}", self.method, self.url)
    }
}

/// A contacted domain, kept for latency simulation tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    pub name: String,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
}

/// The on-disk manifest: entry metadata plus the resource set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    #[serde(default)]
    pub domains: Vec<Domain>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// An in-flight transaction while recording.
#[derive(Debug, Clone)]
pub struct RecordingTransaction {
    pub method: String,
    pub url: String,
    pub request_started: Instant,
    pub response_started: Option<Instant>,
    pub response_finished: Option<Instant>,
    /// Wall-clock request start, carried into [`Resource::timestamp`].
    pub timestamp: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub raw_headers: HttpHeaders,
    pub body: Vec<u8>,
}

impl RecordingTransaction {
    /// Starts a new in-flight transaction for `method` and `url`.
    pub fn begin(method: impl Into<String>, url: impl Into<String>) -> Self {
        RecordingTransaction {
            method: method.into(),
            url: url.into(),
            request_started: Instant::now(),
            response_started: None,
            response_finished: None,
            timestamp: Utc::now(),
            status_code: None,
            error_message: None,
            raw_headers: HttpHeaders::new(),
            body: Vec::new(),
        }
    }
}

/// One slice of a replayed body and its emission deadline.
///
/// `target_offset` is measured from request receipt to the moment the
/// chunk's last byte should have been emitted.
#[derive(Debug, Clone)]
pub struct BodyChunk {
    pub bytes: Bytes,
    pub target_offset: Duration,
}

/// A fully prepared transaction ready to replay: re-encoded wire bytes,
/// restored headers and pre-computed timed chunks.
#[derive(Debug, Clone)]
pub struct PlaybackTransaction {
    pub method: String,
    pub url: String,
    pub ttfb: Duration,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub raw_headers: HttpHeaders,
    pub chunks: Vec<BodyChunk>,
}

impl PlaybackTransaction {
    /// The `METHOD:URL` lookup key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.method, self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_encoding_round_trips_through_str() {
        for enc in [
            ContentEncoding::Gzip,
            ContentEncoding::Deflate,
            ContentEncoding::Br,
            ContentEncoding::Zstd,
            ContentEncoding::Compress,
            ContentEncoding::Identity,
        ] {
            assert_eq!(enc.as_str().parse::<ContentEncoding>().unwrap(), enc);
        }
    }

    #[test]
    fn content_encoding_rejects_unknown_tag() {
        assert!("snappy".parse::<ContentEncoding>().is_err());
    }

    #[test]
    fn resource_serializes_camel_case_and_omits_absent_fields() {
        let resource = Resource {
            method: "GET".into(),
            url: "http://example.com/".into(),
            ttfb_ms: 120,
            mbps: Some(1.5),
            ..Default::default()
        };
        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["method"], "GET");
        assert_eq!(json["ttfbMs"], 120);
        assert_eq!(json["mbps"], 1.5);
        assert!(json.get("statusCode").is_none());
        assert!(json.get("contentFilePath").is_none());
        assert!(json.get("rawHeaders").is_none());
        assert!(json.get("timestamp").is_none());
    }

    #[test]
    fn inventory_parses_manifest_with_unknown_optionals_absent() {
        let json = r#"{
            "entryUrl": "https://example.com/",
            "domains": [],
            "resources": [
                { "method": "GET", "url": "https://example.com/", "ttfbMs": 42 }
            ]
        }"#;
        let inventory: Inventory = serde_json::from_str(json).unwrap();
        assert_eq!(inventory.entry_url.as_deref(), Some("https://example.com/"));
        assert_eq!(inventory.resources.len(), 1);
        assert_eq!(inventory.resources[0].ttfb_ms, 42);
        assert!(inventory.resources[0].mbps.is_none());
    }

    #[test]
    fn header_helpers_are_case_insensitive() {
        let mut headers = HttpHeaders::new();
        headers.insert("content-type".into(), "text/html".into());

        assert_eq!(header_get(&headers, "Content-Type"), Some("text/html"));

        header_set(&mut headers, "Content-Type", "text/css");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("content-type").map(String::as_str), Some("text/css"));

        header_set(&mut headers, "Content-Length", "10");
        assert_eq!(header_get(&headers, "content-length"), Some("10"));
    }

    #[test]
    fn resource_key_joins_method_and_url() {
        let resource = Resource {
            method: "GET".into(),
            url: "https://example.com/a?b=1".into(),
            ..Default::default()
        };
        assert_eq!(resource.key(), "GET:https://example.com/a?b=1");
    }
}
