//! Traffic recording.
//!
//! The [`Recorder`] keeps a bounded, insertion-ordered list of in-flight
//! transactions behind a mutex. The flow handler registers a transaction on
//! request and completes the most recent matching entry on response; the
//! whole list is converted and flushed to the inventory on graceful
//! shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full};
use hudsucker::hyper::{Request, Response};
use hudsucker::{Body, HttpContext, HttpHandler, RequestOrResponse};
use parking_lot::Mutex;

use lyrebird_core::error::Result;
use lyrebird_core::types::{HttpHeaders, RecordingTransaction};
use lyrebird_inventory::PersistenceManager;

use crate::flow::{absolute_url, collapse_headers};

/// Cap on concurrently tracked transactions, to bound memory.
const MAX_IN_FLIGHT: usize = 10_000;

/// Responses that took longer than this are assumed to have streamed; the
/// synthesized transfer window is carved out of the real elapsed time.
const STREAMED_THRESHOLD: Duration = Duration::from_millis(100);
/// Slack subtracted from the elapsed time for streamed responses.
const STREAMED_MARGIN: Duration = Duration::from_millis(50);
/// Nominal transfer window for responses delivered in a single callback.
const INSTANT_TRANSFER: Duration = Duration::from_millis(10);

/// Captures live transactions and flushes them to the inventory.
pub struct Recorder {
    transactions: Mutex<Vec<RecordingTransaction>>,
    entry_url: String,
    inventory_dir: PathBuf,
    no_beautify: bool,
}

impl Recorder {
    /// Creates a recorder writing to `inventory_dir` on flush.
    ///
    /// The directory is created immediately so a recording session that
    /// captures nothing still leaves a valid, empty inventory location.
    pub fn new(
        entry_url: impl Into<String>,
        inventory_dir: impl Into<PathBuf>,
        no_beautify: bool,
    ) -> Result<Arc<Self>> {
        let inventory_dir = inventory_dir.into();
        std::fs::create_dir_all(&inventory_dir)?;

        Ok(Arc::new(Recorder {
            transactions: Mutex::new(Vec::new()),
            entry_url: entry_url.into(),
            inventory_dir,
            no_beautify,
        }))
    }

    /// Registers an in-flight transaction for a request that just arrived.
    pub fn on_request(&self, method: &str, url: &str) {
        let mut transactions = self.transactions.lock();
        if transactions.len() >= MAX_IN_FLIGHT {
            tracing::warn!(limit = MAX_IN_FLIGHT, "transaction list full, not recording");
            return;
        }
        transactions.push(RecordingTransaction::begin(method, url));
    }

    /// Completes the most recent in-flight transaction matching the key.
    ///
    /// The scan runs backwards so pipelined repeats of the same request
    /// complete in reverse order of arrival, matching the proxy's own
    /// response ordering.
    pub fn on_response(
        &self,
        method: &str,
        url: &str,
        status: u16,
        headers: HttpHeaders,
        body: &[u8],
    ) {
        let now = Instant::now();
        let mut transactions = self.transactions.lock();
        let Some(transaction) = transactions
            .iter_mut()
            .rev()
            .find(|t| t.method == method && t.url == url && t.response_started.is_none())
        else {
            tracing::debug!(method, url, "response without a matching in-flight request");
            return;
        };

        transaction.response_started = Some(now);
        transaction.status_code = Some(status);
        transaction.raw_headers = headers;
        transaction.body = body.to_vec();

        // The proxy delivers the body in one callback, so the transfer
        // window has to be synthesized from the observed round trip.
        let elapsed = now.duration_since(transaction.request_started);
        transaction.response_finished = Some(if elapsed > STREAMED_THRESHOLD {
            now + (elapsed - STREAMED_MARGIN)
        } else {
            now + INSTANT_TRANSFER
        });

        tracing::debug!(method, url, bytes = body.len(), "recorded transaction");
    }

    /// Number of transactions currently tracked.
    pub fn transaction_count(&self) -> usize {
        self.transactions.lock().len()
    }

    /// Converts and writes everything captured so far.
    pub fn save_inventory(&self) -> Result<()> {
        let transactions = self.transactions.lock().clone();
        let manager = PersistenceManager::new(&self.inventory_dir);
        manager.save_recorded_transactions(
            &transactions,
            &[],
            &self.entry_url,
            self.no_beautify,
        )?;
        tracing::info!(
            transactions = transactions.len(),
            dir = %self.inventory_dir.display(),
            "saved inventory"
        );
        Ok(())
    }
}

/// Flow handler for recording mode: forwards everything and captures the
/// response on the way back.
#[derive(Clone)]
pub struct RecordingHandler {
    recorder: Arc<Recorder>,
    /// Key of the request currently in flight on this connection.
    current: Option<(String, String)>,
}

impl RecordingHandler {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        RecordingHandler {
            recorder,
            current: None,
        }
    }
}

impl HttpHandler for RecordingHandler {
    async fn handle_request(
        &mut self,
        _ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        // CONNECT is tunnel plumbing, not a transaction.
        if req.method() == hyper::Method::CONNECT {
            return RequestOrResponse::Request(req);
        }
        if let Some(url) = absolute_url(&req) {
            let method = req.method().as_str().to_string();
            self.recorder.on_request(&method, &url);
            self.current = Some((method, url));
        }
        RequestOrResponse::Request(req)
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let Some((method, url)) = self.current.take() else {
            return res;
        };

        let status = res.status().as_u16();
        let (parts, body) = res.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(url, error = %e, "failed to read response body");
                return Response::from_parts(parts, Body::empty());
            }
        };

        self.recorder.on_response(
            &method,
            &url,
            status,
            collapse_headers(&parts.headers),
            &bytes,
        );

        Response::from_parts(parts, Body::from(Full::new(bytes)))
    }
}
