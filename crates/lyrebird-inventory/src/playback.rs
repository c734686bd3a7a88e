//! Reading the inventory back into replayable transactions.
//!
//! Each stored resource becomes a [`PlaybackTransaction`]: body bytes
//! resolved by the content precedence rule, optionally minified, restored
//! to the recorded charset, re-encoded to the recorded wire format, and cut
//! into timed chunks. Per-resource failures degrade (warn and fall back)
//! rather than abort the load, so one bad entry cannot take playback down.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};

use lyrebird_core::charset;
use lyrebird_core::coding;
use lyrebird_core::error::Result;
use lyrebird_core::optimize::ContentOptimizer;
use lyrebird_core::types::{
    header_get, header_set, ContentEncoding, PlaybackTransaction, Resource,
};

use crate::chunking::{self, DEFAULT_CHUNK_SIZE};
use crate::persistence;

/// Loads stored resources and prepares them for replay.
pub struct PlaybackManager {
    base_dir: PathBuf,
    chunk_size: usize,
}

impl PlaybackManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        PlaybackManager {
            base_dir: base_dir.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Overrides the chunk size; values of zero are ignored.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.chunk_size = size;
        }
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Loads the manifest and converts every resource.
    ///
    /// Unconvertible resources are skipped with a warning.
    pub fn load_playback_transactions(&self) -> Result<Vec<PlaybackTransaction>> {
        let manifest = self.base_dir.join("inventory.json");
        let inventory = persistence::load_inventory_with_retry(&manifest)?;

        let mut transactions = Vec::with_capacity(inventory.resources.len());
        for resource in &inventory.resources {
            match self.convert_resource(resource) {
                Ok(transaction) => transactions.push(transaction),
                Err(err) => {
                    tracing::warn!(url = %resource.url, error = %err, "skipping unconvertible resource");
                }
            }
        }
        Ok(transactions)
    }

    /// Prepares one resource for replay.
    pub fn convert_resource(&self, resource: &Resource) -> Result<PlaybackTransaction> {
        let decoded = self.resolve_body(resource);

        let decoded = self.apply_minify(resource, decoded);

        // Restore the recorded charset; on failure the UTF-8 form is served.
        let (restored, charset_restored) = match resource.content_charset.as_deref() {
            Some(charset_label) if !charset_label.is_empty() => {
                match charset::restore_for_playback(&decoded, charset_label) {
                    Ok(body) => {
                        let transcoded = !charset_label.eq_ignore_ascii_case("utf-8")
                            && !charset_label.ends_with("-failed");
                        (body, transcoded)
                    }
                    Err(err) => {
                        tracing::warn!(url = %resource.url, error = %err, "charset restoration failed, serving UTF-8 body");
                        (decoded, false)
                    }
                }
            }
            _ => (decoded, false),
        };

        // Re-encode to the recorded wire format.
        let wire_body = match resource.content_encoding {
            Some(encoding) if encoding != ContentEncoding::Identity => {
                match coding::encode(&restored, encoding, coding::DEFAULT_LEVEL) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        tracing::warn!(url = %resource.url, error = %err, "re-encoding failed, serving unencoded body");
                        restored
                    }
                }
            }
            _ => restored,
        };

        let mut raw_headers = resource.raw_headers.clone();
        if !wire_body.is_empty() {
            header_set(&mut raw_headers, "Content-Length", wire_body.len().to_string());
        }
        if charset_restored {
            if let Some(content_type) = header_get(&raw_headers, "Content-Type") {
                let rewritten = charset::rewrite_content_type_charset(
                    content_type,
                    resource.content_charset.as_deref().unwrap_or(""),
                );
                header_set(&mut raw_headers, "Content-Type", rewritten);
            }
        }

        let ttfb = Duration::from_millis(resource.ttfb_ms.max(0) as u64);
        let chunks = chunking::plan_chunks(&wire_body, resource.mbps, ttfb, self.chunk_size);

        Ok(PlaybackTransaction {
            method: resource.method.clone(),
            url: resource.url.clone(),
            ttfb,
            status_code: resource.status_code,
            error_message: resource.error_message.clone(),
            raw_headers,
            chunks,
        })
    }

    /// Resolves the stored body by precedence:
    /// `contentUtf8 > contentBase64 > contentFilePath`. Failures degrade to
    /// an empty body with a warning.
    fn resolve_body(&self, resource: &Resource) -> Vec<u8> {
        if let Some(text) = &resource.content_utf8 {
            return text.clone().into_bytes();
        }
        if let Some(encoded) = &resource.content_base64 {
            return match STANDARD.decode(encoded) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(url = %resource.url, error = %err, "base64 body decode failed, serving empty body");
                    Vec::new()
                }
            };
        }
        if let Some(relative) = &resource.content_file_path {
            let path = self.base_dir.join("contents").join(relative);
            return match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(url = %resource.url, path = %path.display(), error = %err, "content file unreadable, serving empty body");
                    Vec::new()
                }
            };
        }
        Vec::new()
    }

    /// Minifies the body when the resource asks for it and the type allows.
    fn apply_minify(&self, resource: &Resource, body: Vec<u8>) -> Vec<u8> {
        if resource.minify != Some(true) {
            return body;
        }
        let Some(mime) = resource.content_type_mime.as_deref() else {
            return body;
        };
        let optimizer = ContentOptimizer::new();
        if !optimizer.accept(mime) {
            return body;
        }
        match std::str::from_utf8(&body) {
            Ok(text) => match optimizer.minify(mime, text) {
                Ok(minified) => minified.into_bytes(),
                Err(err) => {
                    tracing::warn!(url = %resource.url, error = %err, "minification failed, serving stored body");
                    body
                }
            },
            Err(_) => body,
        }
    }
}
