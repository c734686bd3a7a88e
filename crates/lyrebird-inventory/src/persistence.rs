//! Writing recorded traffic to the inventory.
//!
//! Conversion from an in-flight [`RecordingTransaction`] to a stored
//! [`Resource`] never fails the flow: a body that will not decode is kept
//! raw, a charset that will not transcode is marked `-failed`, and a
//! beautifier error just leaves the body unformatted. Only an unusable URL
//! drops the transaction.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lyrebird_core::charset;
use lyrebird_core::coding;
use lyrebird_core::error::{Error, Result};
use lyrebird_core::optimize::ContentOptimizer;
use lyrebird_core::resource_path;
use lyrebird_core::types::{
    header_get, ContentEncoding, Domain, Inventory, RecordingTransaction, Resource,
};

/// Upper bound on a believable TTFB, one hour.
const MAX_TTFB_MS: i64 = 3_600_000;
/// Upper bound on a believable transfer rate, 10 Gbit/s.
const MAX_MBPS: f64 = 10_000.0;

/// How often and how patiently a reader retries a manifest that is mid-write.
const READ_ATTEMPTS: u32 = 5;
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Writes recorded transactions to a base directory.
pub struct PersistenceManager {
    base_dir: PathBuf,
}

impl PersistenceManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        PersistenceManager {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn inventory_path(&self) -> PathBuf {
        self.base_dir.join("inventory.json")
    }

    fn content_path(&self, relative: &str) -> PathBuf {
        self.base_dir.join("contents").join(relative)
    }

    /// Converts and saves a batch of transactions as a fresh manifest.
    ///
    /// Duplicate `(method, URL)` keys collapse to one resource: a newer
    /// capture replaces an older one, as does one that carries a positive
    /// transfer rate the existing entry lacks. Body content is written only
    /// for accepted resources.
    pub fn save_recorded_transactions(
        &self,
        transactions: &[RecordingTransaction],
        domains: &[Domain],
        entry_url: &str,
        no_beautify: bool,
    ) -> Result<()> {
        let mut accepted: Vec<Resource> = Vec::new();

        for transaction in transactions {
            let mut resource = match convert_transaction(transaction) {
                Ok(resource) => resource,
                Err(err) => {
                    tracing::warn!(
                        method = %transaction.method,
                        url = %transaction.url,
                        error = %err,
                        "dropping unconvertible transaction"
                    );
                    continue;
                }
            };

            if let Some(existing) = accepted.iter().position(|r| r.key() == resource.key()) {
                if replaces(&resource, &accepted[existing]) {
                    self.write_body(&mut resource, transaction, no_beautify)?;
                    accepted[existing] = resource;
                }
                continue;
            }

            self.write_body(&mut resource, transaction, no_beautify)?;
            accepted.push(resource);
        }

        let inventory = Inventory {
            entry_url: Some(entry_url.to_string()),
            device_type: None,
            domains: merge_domains(&[], domains),
            resources: accepted,
        };
        self.save_inventory(&inventory)
    }

    /// Appends one transaction to the manifest on disk, applying the same
    /// replace-by-key rule against the stored entry.
    pub fn append_recorded_transaction(
        &self,
        transaction: &RecordingTransaction,
        no_beautify: bool,
    ) -> Result<()> {
        let mut inventory = if self.inventory_path().exists() {
            load_inventory(&self.inventory_path())?
        } else {
            Inventory::default()
        };

        let mut resource = convert_transaction(transaction)?;

        if let Some(existing) = inventory
            .resources
            .iter()
            .position(|r| r.key() == resource.key())
        {
            if !replaces(&resource, &inventory.resources[existing]) {
                return Ok(());
            }
            self.write_body(&mut resource, transaction, no_beautify)?;
            inventory.resources[existing] = resource;
        } else {
            self.write_body(&mut resource, transaction, no_beautify)?;
            inventory.resources.push(resource);
        }

        self.save_inventory(&inventory)
    }

    /// Writes the decoded, normalized, optionally beautified body to the
    /// contents tree and fills in the resource's charset fields.
    fn write_body(
        &self,
        resource: &mut Resource,
        transaction: &RecordingTransaction,
        no_beautify: bool,
    ) -> Result<()> {
        let Some(relative) = resource.content_file_path.clone() else {
            return Ok(());
        };

        let mut body = transaction.body.clone();
        if let Some(encoding) = resource.content_encoding {
            if encoding != ContentEncoding::Identity {
                match coding::decode(&body, encoding) {
                    Ok(decoded) => body = decoded,
                    Err(err) => tracing::warn!(
                        url = %resource.url,
                        error = %err,
                        "body decode failed, saving raw bytes"
                    ),
                }
            }
        }

        let content_type = header_get(&transaction.raw_headers, "Content-Type").unwrap_or("");
        let normalized = charset::normalize_for_recording(content_type, &body);
        let mut body = normalized.body;
        if !normalized.http_charset.is_empty() {
            resource.content_type_charset = Some(normalized.http_charset);
        }
        if !normalized.content_charset.is_empty() {
            resource.content_charset = Some(normalized.content_charset);
        }

        if !no_beautify && !content_type.is_empty() {
            let optimizer = ContentOptimizer::new();
            if optimizer.accept(content_type) {
                match std::str::from_utf8(&body) {
                    Ok(text) => match optimizer.beautify(content_type, text) {
                        Ok(beautified) => body = beautified.into_bytes(),
                        Err(err) => tracing::warn!(
                            url = %resource.url,
                            error = %err,
                            "beautification failed, keeping unformatted body"
                        ),
                    },
                    Err(_) => tracing::debug!(
                        url = %resource.url,
                        "body is not UTF-8, skipping beautification"
                    ),
                }
            }
        }

        let path = self.content_path(&relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &body)?;
        Ok(())
    }

    /// Writes the manifest as indented JSON, creating directories as needed.
    pub fn save_inventory(&self, inventory: &Inventory) -> Result<()> {
        let path = self.inventory_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(inventory).map_err(|e| {
            Error::Filesystem(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        fs::write(&path, json)?;
        Ok(())
    }
}

/// Whether `candidate` should replace `existing` under the same key:
/// a newer capture wins, and so does one carrying a positive transfer rate
/// the existing entry lacks.
pub fn replaces(candidate: &Resource, existing: &Resource) -> bool {
    let newer = match (candidate.timestamp, existing.timestamp) {
        (Some(new), Some(old)) => new > old,
        (Some(_), None) => true,
        _ => false,
    };
    let richer = candidate.mbps.is_some_and(|m| m > 0.0)
        && !existing.mbps.is_some_and(|m| m > 0.0);
    newer || richer
}

/// Merges domain lists by name; the later list wins on conflicts.
pub fn merge_domains(existing: &[Domain], incoming: &[Domain]) -> Vec<Domain> {
    let mut by_name: std::collections::BTreeMap<String, Domain> = std::collections::BTreeMap::new();
    for domain in existing.iter().chain(incoming) {
        by_name.insert(domain.name.clone(), domain.clone());
    }
    by_name.into_values().collect()
}

/// Converts an in-flight transaction into a manifest resource.
///
/// Fails only when no content path can be derived from the URL.
pub fn convert_transaction(transaction: &RecordingTransaction) -> Result<Resource> {
    let ttfb_ms = match transaction.response_started {
        Some(started) => {
            let ms = started
                .checked_duration_since(transaction.request_started)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(-1);
            if !(0..=MAX_TTFB_MS).contains(&ms) {
                tracing::warn!(ttfb_ms = ms, url = %transaction.url, "implausible TTFB, clamping to 0");
                0
            } else {
                ms
            }
        }
        None => {
            tracing::warn!(url = %transaction.url, "no response timing, TTFB set to 0");
            0
        }
    };

    let mbps = transfer_rate(transaction);

    let (content_type_mime, _header_charset) = header_get(&transaction.raw_headers, "Content-Type")
        .map(charset::parse_content_type)
        .unwrap_or((None, None));

    let content_encoding = header_get(&transaction.raw_headers, "Content-Encoding")
        .and_then(|value| match value.parse::<ContentEncoding>() {
            Ok(encoding) => Some(encoding),
            Err(_) => {
                tracing::debug!(encoding = value, "unrecognized content encoding ignored");
                None
            }
        });

    let content_file_path =
        resource_path::resource_file_path(&transaction.method, &transaction.url)?;

    Ok(Resource {
        method: transaction.method.clone(),
        url: transaction.url.clone(),
        ttfb_ms,
        mbps,
        status_code: transaction.status_code,
        error_message: transaction.error_message.clone(),
        raw_headers: transaction.raw_headers.clone(),
        content_encoding,
        content_type_mime,
        content_type_charset: None,
        content_charset: None,
        content_file_path: Some(content_file_path),
        content_utf8: None,
        content_base64: None,
        minify: None,
        timestamp: Some(transaction.timestamp),
    })
}

/// Body transfer rate in binary megabits per second, or `None` when the
/// timing or size makes the figure meaningless.
fn transfer_rate(transaction: &RecordingTransaction) -> Option<f64> {
    let started = transaction.response_started?;
    let finished = transaction.response_finished?;
    if transaction.body.is_empty() {
        return None;
    }
    let duration = finished.checked_duration_since(started)?;
    let seconds = duration.as_secs_f64();
    if seconds <= 0.0 {
        return None;
    }
    let total_bits = (transaction.body.len() * 8) as f64;
    let mbps = total_bits / (seconds * 1024.0 * 1024.0);
    if mbps > 0.0 && mbps < MAX_MBPS {
        Some(mbps)
    } else {
        tracing::warn!(mbps, url = %transaction.url, "implausible transfer rate discarded");
        None
    }
}

/// Reads and parses the manifest once.
pub fn load_inventory(path: &Path) -> Result<Inventory> {
    let data = fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| {
        Error::Filesystem(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

/// Reads the manifest, retrying a few times so a reader racing the single
/// writer sees a complete file rather than a partial one.
pub fn load_inventory_with_retry(path: &Path) -> Result<Inventory> {
    let mut last_err = None;
    for attempt in 1..=READ_ATTEMPTS {
        match load_inventory(path) {
            Ok(inventory) => return Ok(inventory),
            Err(err) => {
                if attempt < READ_ATTEMPTS {
                    tracing::warn!(attempt, error = %err, "inventory read failed, retrying");
                    std::thread::sleep(READ_RETRY_DELAY);
                }
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        Error::Filesystem(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "inventory unreadable",
        ))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use lyrebird_core::types::header_set;
    use tempfile::TempDir;

    fn transaction(
        method: &str,
        url: &str,
        body: &[u8],
        headers: &[(&str, &str)],
    ) -> RecordingTransaction {
        let mut tx = RecordingTransaction::begin(method, url);
        let start = tx.request_started;
        tx.response_started = Some(start + Duration::from_millis(120));
        tx.response_finished = Some(start + Duration::from_millis(220));
        tx.status_code = Some(200);
        tx.body = body.to_vec();
        for (name, value) in headers {
            header_set(&mut tx.raw_headers, name, *value);
        }
        tx
    }

    #[test]
    fn convert_fills_timing_and_content_fields() {
        let tx = transaction(
            "GET",
            "http://h:9/api/users.json",
            br#"{"n":1}"#,
            &[("Content-Type", "application/json; charset=utf-8")],
        );
        let resource = convert_transaction(&tx).unwrap();

        assert_eq!(resource.ttfb_ms, 120);
        assert!(resource.mbps.unwrap() > 0.0);
        assert_eq!(resource.status_code, Some(200));
        assert_eq!(
            resource.content_type_mime.as_deref(),
            Some("application/json")
        );
        assert_eq!(
            resource.content_file_path.as_deref(),
            Some("get/http/h/api/users.json")
        );
        assert!(resource.timestamp.is_some());
    }

    #[test]
    fn convert_leaves_rate_unset_without_timing() {
        let mut tx = transaction("GET", "http://h/x.bin", b"abc", &[]);
        tx.response_finished = None;
        let resource = convert_transaction(&tx).unwrap();
        assert!(resource.mbps.is_none());
    }

    #[test]
    fn convert_leaves_rate_unset_for_empty_body() {
        let tx = transaction("GET", "http://h/empty", b"", &[]);
        let resource = convert_transaction(&tx).unwrap();
        assert!(resource.mbps.is_none());
    }

    #[test]
    fn convert_clamps_implausible_ttfb() {
        let mut tx = transaction("GET", "http://h/slow", b"x", &[]);
        tx.response_started = Some(tx.request_started + Duration::from_secs(7200));
        tx.response_finished = Some(tx.request_started + Duration::from_secs(7201));
        let resource = convert_transaction(&tx).unwrap();
        assert_eq!(resource.ttfb_ms, 0);
    }

    #[test]
    fn convert_rejects_unparseable_url() {
        let tx = transaction("GET", "not a url", b"", &[]);
        assert!(convert_transaction(&tx).is_err());
    }

    #[test]
    fn convert_ignores_unknown_content_encoding() {
        let tx = transaction("GET", "http://h/a.txt", b"x", &[("Content-Encoding", "snappy")]);
        let resource = convert_transaction(&tx).unwrap();
        assert!(resource.content_encoding.is_none());
    }

    #[test]
    fn save_writes_manifest_and_decoded_content() {
        let dir = TempDir::new().unwrap();
        let pm = PersistenceManager::new(dir.path());

        let tx = transaction(
            "GET",
            "http://h:9/api/users.json",
            br#"{"n":1}"#,
            &[("Content-Type", "application/json; charset=utf-8")],
        );
        pm.save_recorded_transactions(&[tx], &[], "http://h:9/", false)
            .unwrap();

        let stored = fs::read(dir.path().join("contents/get/http/h/api/users.json")).unwrap();
        assert_eq!(stored, br#"{"n":1}"#);

        let inventory = load_inventory(&dir.path().join("inventory.json")).unwrap();
        assert_eq!(inventory.entry_url.as_deref(), Some("http://h:9/"));
        assert_eq!(inventory.resources.len(), 1);
        let resource = &inventory.resources[0];
        assert!(resource.ttfb_ms >= 0);
        assert!(resource.mbps.unwrap() > 0.0);
        assert_eq!(resource.content_type_mime.as_deref(), Some("application/json"));
        assert_eq!(resource.content_type_charset.as_deref(), Some("utf-8"));
    }

    #[test]
    fn save_decodes_gzip_bodies_to_plaintext() {
        let dir = TempDir::new().unwrap();
        let pm = PersistenceManager::new(dir.path());

        let plain = br#"{"users":[1,2,3]}"#;
        let gzipped =
            coding::encode(plain, ContentEncoding::Gzip, coding::DEFAULT_LEVEL).unwrap();
        let tx = transaction(
            "GET",
            "http://h/api/users.json?compression=gzip",
            &gzipped,
            &[
                ("Content-Type", "application/json"),
                ("Content-Encoding", "gzip"),
            ],
        );
        pm.save_recorded_transactions(&[tx], &[], "http://h/", false)
            .unwrap();

        let inventory = load_inventory(&dir.path().join("inventory.json")).unwrap();
        let resource = &inventory.resources[0];
        assert_eq!(resource.content_encoding, Some(ContentEncoding::Gzip));

        let stored = fs::read(
            dir.path()
                .join("contents")
                .join(resource.content_file_path.as_deref().unwrap()),
        )
        .unwrap();
        assert_eq!(stored, plain);
    }

    #[test]
    fn save_keeps_raw_bytes_when_decode_fails() {
        let dir = TempDir::new().unwrap();
        let pm = PersistenceManager::new(dir.path());

        let tx = transaction(
            "GET",
            "http://h/broken.bin",
            b"not actually gzip",
            &[("Content-Encoding", "gzip")],
        );
        pm.save_recorded_transactions(&[tx], &[], "http://h/", false)
            .unwrap();

        let stored = fs::read(dir.path().join("contents/get/http/h/broken.bin")).unwrap();
        assert_eq!(stored, b"not actually gzip");
    }

    #[test]
    fn save_transcodes_shift_jis_to_utf8() {
        let dir = TempDir::new().unwrap();
        let pm = PersistenceManager::new(dir.path());

        let html = "<html><body>日本語</body></html>";
        let sjis = charset::from_utf8(html.as_bytes(), "shift_jis").unwrap();
        let tx = transaction(
            "GET",
            "http://h/html/shift_jis.html",
            &sjis,
            &[("Content-Type", "text/html; charset=Shift_JIS")],
        );
        pm.save_recorded_transactions(&[tx], &[], "http://h/", true)
            .unwrap();

        let inventory = load_inventory(&dir.path().join("inventory.json")).unwrap();
        let resource = &inventory.resources[0];
        assert_eq!(resource.content_charset.as_deref(), Some("shift_jis"));
        assert_eq!(resource.content_type_charset.as_deref(), Some("shift_jis"));

        let stored = fs::read(dir.path().join("contents/get/http/h/html/shift_jis.html")).unwrap();
        assert_eq!(stored, html.as_bytes());
    }

    #[test]
    fn save_beautifies_html_unless_disabled() {
        let dir = TempDir::new().unwrap();
        let pm = PersistenceManager::new(dir.path());

        let html = "<html><body><p>hi</p></body></html>";
        let tx = transaction(
            "GET",
            "http://h/page.html",
            html.as_bytes(),
            &[("Content-Type", "text/html")],
        );
        pm.save_recorded_transactions(&[tx.clone()], &[], "http://h/", false)
            .unwrap();
        let beautified = fs::read(dir.path().join("contents/get/http/h/page.html")).unwrap();
        assert!(beautified.len() > html.len());
        assert!(String::from_utf8(beautified).unwrap().contains("\n  <body>"));

        pm.save_recorded_transactions(&[tx], &[], "http://h/", true)
            .unwrap();
        let raw = fs::read(dir.path().join("contents/get/http/h/page.html")).unwrap();
        assert_eq!(raw, html.as_bytes());
    }

    #[test]
    fn duplicate_keys_collapse_to_newest() {
        let dir = TempDir::new().unwrap();
        let pm = PersistenceManager::new(dir.path());

        let older = transaction("GET", "http://h/a.txt", b"old", &[]);
        let mut newer = transaction("GET", "http://h/a.txt", b"new", &[]);
        newer.timestamp = older.timestamp + chrono::Duration::seconds(5);

        pm.save_recorded_transactions(
            &[older.clone(), newer.clone()],
            &[],
            "http://h/",
            true,
        )
        .unwrap();

        let inventory = load_inventory(&dir.path().join("inventory.json")).unwrap();
        assert_eq!(inventory.resources.len(), 1);
        let stored = fs::read(dir.path().join("contents/get/http/h/a.txt")).unwrap();
        assert_eq!(stored, b"new");
    }

    #[test]
    fn replaces_prefers_positive_rate_over_missing_one() {
        let with_rate = Resource {
            mbps: Some(2.0),
            timestamp: None,
            ..Default::default()
        };
        let without_rate = Resource {
            mbps: None,
            timestamp: None,
            ..Default::default()
        };
        assert!(replaces(&with_rate, &without_rate));
        assert!(!replaces(&without_rate, &with_rate));
    }

    #[test]
    fn append_updates_existing_manifest() {
        let dir = TempDir::new().unwrap();
        let pm = PersistenceManager::new(dir.path());

        let first = transaction("GET", "http://h/one.txt", b"one", &[]);
        pm.append_recorded_transaction(&first, true).unwrap();

        let second = transaction("GET", "http://h/two.txt", b"two", &[]);
        pm.append_recorded_transaction(&second, true).unwrap();

        let inventory = load_inventory(&dir.path().join("inventory.json")).unwrap();
        assert_eq!(inventory.resources.len(), 2);
    }

    #[test]
    fn merge_domains_deduplicates_by_name() {
        let existing = vec![Domain {
            name: "a.example".into(),
            ip_address: "10.0.0.1".into(),
            latency_ms: None,
        }];
        let incoming = vec![
            Domain {
                name: "a.example".into(),
                ip_address: "10.0.0.9".into(),
                latency_ms: Some(12),
            },
            Domain {
                name: "b.example".into(),
                ip_address: "10.0.0.2".into(),
                latency_ms: None,
            },
        ];
        let merged = merge_domains(&existing, &incoming);
        assert_eq!(merged.len(), 2);
        let a = merged.iter().find(|d| d.name == "a.example").unwrap();
        assert_eq!(a.ip_address, "10.0.0.9");
    }

    #[test]
    fn load_with_retry_surfaces_parse_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.json");
        fs::write(&path, b"{ definitely not json").unwrap();
        // Exhausts its attempts, then reports the failure.
        assert!(load_inventory_with_retry(&path).is_err());
    }
}
