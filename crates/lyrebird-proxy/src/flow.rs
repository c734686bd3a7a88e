//! Helpers shared by the flow handlers.

use hudsucker::hyper::Request;
use hudsucker::Body;
use hyper::header::HOST;
use hyper::HeaderMap;

use lyrebird_core::types::HttpHeaders;

/// Reconstructs the absolute URL a flow is addressed to.
///
/// hudsucker hands intercepted requests an absolute URI; plain-HTTP proxy
/// requests arrive in absolute form anyway. The Host header covers the
/// leftover origin-form case.
pub fn absolute_url(req: &Request<Body>) -> Option<String> {
    if req.uri().host().is_some() {
        return Some(req.uri().to_string());
    }

    let host = req.headers().get(HOST)?.to_str().ok()?;
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Some(format!("http://{host}{path}"))
}

/// Collapses a wire header map to name -> last-value-seen.
///
/// Values that are not valid UTF-8 are dropped; the inventory is a text
/// format and such headers are not worth preserving.
pub fn collapse_headers(headers: &HeaderMap) -> HttpHeaders {
    let mut collapsed = HttpHeaders::new();
    for (name, value) in headers {
        if let Ok(text) = value.to_str() {
            collapsed.insert(name.as_str().to_string(), text.to_string());
        }
    }
    collapsed
}
