//! Upstream fallback for requests the inventory cannot answer.
//!
//! A single shared client forwards misses to the live origin. Automatic
//! decompression stays off so the original wire format passes through
//! untouched, and the connection pool mirrors the recording-side settings.

use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hudsucker::hyper::{Request, Response};
use hudsucker::Body;
use hyper::body::Bytes;
use hyper::StatusCode;

use crate::error::{ProxyError, Result};

const MAX_IDLE_CONNS: usize = 100;
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared forwarding client.
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_CONNS)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Proxy(format!("failed to build upstream client: {e}")))?;
        Ok(UpstreamClient { client })
    }

    /// Forwards a request to the origin and returns its response verbatim.
    ///
    /// A request that cannot be rebuilt is a 500; a transport or read
    /// failure is a 502. Both carry a plain-text explanation.
    pub async fn forward(&self, req: Request<Body>, url: &str) -> Response<Body> {
        let method = req.method().clone();
        let headers = req.headers().clone();

        let (_, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return plain_text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to read request body: {e}"),
                );
            }
        };

        let mut builder = self.client.request(method, url);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        if !body_bytes.is_empty() {
            builder = builder.body(body_bytes);
        }

        let request = match builder.build() {
            Ok(request) => request,
            Err(e) => {
                return plain_text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to create upstream request: {e}"),
                );
            }
        };

        let upstream = match self.client.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                return plain_text_response(
                    StatusCode::BAD_GATEWAY,
                    format!("upstream request failed: {e}"),
                );
            }
        };

        let status = upstream.status();
        let response_headers = upstream.headers().clone();
        let response_body = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                return plain_text_response(
                    StatusCode::BAD_GATEWAY,
                    format!("failed to read upstream response: {e}"),
                );
            }
        };

        let mut response = Response::new(Body::from(Full::new(response_body)));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }
}

/// Builds a plain-text response for error reporting.
pub fn plain_text_response(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(Full::new(Bytes::from(message))));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds() {
        assert!(UpstreamClient::new().is_ok());
    }

    #[test]
    fn plain_text_response_sets_status_and_type() {
        let response =
            plain_text_response(StatusCode::BAD_GATEWAY, "upstream request failed".into());
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["content-type"], "text/plain");
    }

    #[tokio::test]
    async fn unreachable_origin_returns_502() {
        let client = UpstreamClient::new().unwrap();
        // Discard port on loopback; the connection is refused immediately.
        let req = Request::builder()
            .method("GET")
            .uri("http://127.0.0.1:9/x")
            .body(Body::empty())
            .unwrap();
        let response = client.forward(req, "http://127.0.0.1:9/x").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
