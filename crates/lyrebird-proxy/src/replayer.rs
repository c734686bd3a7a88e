//! Traffic replay.
//!
//! The [`Replayer`] owns the `METHOD:URL` -> transaction map behind a
//! reader/writer lock. Lookups clone an `Arc` out of the map and release
//! the lock before any pacing starts, so a watcher-driven reload can swap
//! the map while replays built from the old one run to completion.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hudsucker::hyper::{Request, Response};
use hudsucker::{Body, HttpContext, HttpHandler, RequestOrResponse};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::StatusCode;
use parking_lot::RwLock;

use lyrebird_core::error::Result;
use lyrebird_core::types::PlaybackTransaction;
use lyrebird_inventory::PlaybackManager;

use crate::flow::absolute_url;
use crate::upstream::UpstreamClient;
use crate::PLAYBACK_HEADER;

/// Spacing of the legacy per-chunk fallback schedule.
const LEGACY_CHUNK_SPACING: Duration = Duration::from_millis(50);

/// Serves recorded transactions with their original timing.
pub struct Replayer {
    inventory_dir: PathBuf,
    transactions: RwLock<HashMap<String, Arc<PlaybackTransaction>>>,
}

impl Replayer {
    /// Loads the inventory and builds the lookup map.
    ///
    /// A missing inventory is not an error: the map starts empty and every
    /// request falls through to the upstream.
    pub fn new(inventory_dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let inventory_dir = inventory_dir.into();
        let transactions = load_transaction_map(&inventory_dir)?;
        tracing::info!(
            transactions = transactions.len(),
            dir = %inventory_dir.display(),
            "loaded inventory"
        );
        Ok(Arc::new(Replayer {
            inventory_dir,
            transactions: RwLock::new(transactions),
        }))
    }

    /// Reloads the inventory from disk and swaps the map wholesale.
    ///
    /// Returns the new transaction count. In-flight replays keep the
    /// transactions they already cloned out.
    pub fn reload(&self) -> Result<usize> {
        let fresh = load_transaction_map(&self.inventory_dir)?;
        let count = fresh.len();
        *self.transactions.write() = fresh;
        Ok(count)
    }

    /// Number of loaded transactions.
    pub fn transaction_count(&self) -> usize {
        self.transactions.read().len()
    }

    /// Looks up a transaction by `METHOD:URL` key.
    pub fn lookup(&self, key: &str) -> Option<Arc<PlaybackTransaction>> {
        self.transactions.read().get(key).cloned()
    }

    /// Assembles the response for a recorded transaction, pacing each chunk
    /// against its absolute deadline from request receipt.
    ///
    /// Deadlines already in the past emit immediately; nothing is dropped.
    /// Cancellation (client disconnect) just abandons the future between
    /// chunks, with no inventory side effects.
    pub async fn replay(&self, transaction: &PlaybackTransaction) -> Response<Body> {
        let request_start = tokio::time::Instant::now();

        let total: usize = transaction.chunks.iter().map(|c| c.bytes.len()).sum();
        let mut body = Vec::with_capacity(total);

        for (index, chunk) in transaction.chunks.iter().enumerate() {
            let offset = if chunk.target_offset > Duration::ZERO {
                chunk.target_offset
            } else if index == 0 {
                // Legacy inventories carry no offsets; fall back to TTFB
                // plus a fixed spacing per chunk.
                transaction.ttfb
            } else {
                transaction.ttfb + LEGACY_CHUNK_SPACING * index as u32
            };
            tokio::time::sleep_until(request_start + offset).await;
            body.extend_from_slice(&chunk.bytes);
        }

        let mut response = Response::new(Body::from(Full::new(Bytes::from(body))));
        *response.status_mut() = transaction
            .status_code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::OK);

        let headers = response.headers_mut();
        for (name, value) in &transaction.raw_headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::debug!(header = name, "skipping unrepresentable stored header"),
            }
        }
        headers.insert(
            HeaderName::from_static(PLAYBACK_HEADER),
            HeaderValue::from_static("1"),
        );

        response
    }
}

fn load_transaction_map(
    inventory_dir: &std::path::Path,
) -> Result<HashMap<String, Arc<PlaybackTransaction>>> {
    let mut map = HashMap::new();

    if !inventory_dir.join("inventory.json").exists() {
        tracing::warn!(
            dir = %inventory_dir.display(),
            "no inventory found, all requests will go upstream"
        );
        return Ok(map);
    }

    let manager = PlaybackManager::new(inventory_dir);
    for transaction in manager.load_playback_transactions()? {
        let key = transaction.key();
        if map.insert(key.clone(), Arc::new(transaction)).is_some() {
            tracing::warn!(key, "duplicate transaction key, keeping the last one");
        }
    }
    Ok(map)
}

/// Flow handler for playback mode: answer from the inventory, or forward.
#[derive(Clone)]
pub struct PlaybackHandler {
    replayer: Arc<Replayer>,
    upstream: Arc<UpstreamClient>,
}

impl PlaybackHandler {
    pub fn new(replayer: Arc<Replayer>, upstream: Arc<UpstreamClient>) -> Self {
        PlaybackHandler { replayer, upstream }
    }
}

impl HttpHandler for PlaybackHandler {
    async fn handle_request(
        &mut self,
        _ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        // Let hudsucker establish the TLS tunnel; the decrypted requests
        // come back through this handler individually.
        if req.method() == hyper::Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let Some(url) = absolute_url(&req) else {
            return RequestOrResponse::Response(crate::upstream::plain_text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "request has no resolvable URL".to_string(),
            ));
        };

        let key = format!("{}:{}", req.method(), url);
        match self.replayer.lookup(&key) {
            Some(transaction) => {
                tracing::debug!(key, "replaying recorded transaction");
                RequestOrResponse::Response(self.replayer.replay(&transaction).await)
            }
            None => {
                tracing::debug!(key, "no recorded transaction, forwarding upstream");
                RequestOrResponse::Response(self.upstream.forward(req, &url).await)
            }
        }
    }
}
