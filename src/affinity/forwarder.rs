//! Forwarding requests to the owning instance
//!
//! [`Forwarder`] is the seam the filter depends on. [`HttpForwarder`] relays
//! over HTTP with `reqwest`: request and response bodies are streamed in both
//! directions, so an event stream stays open for as long as the owner keeps
//! it open. Only connecting is time-boxed.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use thiserror::Error;
use url::Url;

/// Transport-level forwarding failure. HTTP error statuses are not errors.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Invalid forwarding destination '{destination}': {reason}")]
    InvalidDestination { destination: String, reason: String },
    #[error("Upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Could not build upstream response: {0}")]
    Response(#[from] axum::http::Error),
}

/// Relays a request to another instance and returns its response
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// `destination` is a base URI (`scheme://host:port`); the request's own
    /// path and query are appended. `Ok` carries whatever status the remote
    /// answered with.
    async fn forward(&self, destination: &str, request: Request) -> Result<Response, ForwardError>;
}

/// Headers that describe a single hop and must not be relayed
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// [`Forwarder`] backed by a shared `reqwest::Client`
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(connect_timeout: Duration) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, destination: &str, request: Request) -> Result<Response, ForwardError> {
        let (parts, body) = request.into_parts();
        let target = target_url(destination, &parts.uri)?;

        let mut headers = strip_hop_by_hop(&parts.headers);
        if let Some(host) = parts.headers.get(header::HOST) {
            headers.insert(HeaderName::from_static(X_FORWARDED_HOST), host.clone());
        }
        headers.remove(header::HOST);

        tracing::debug!(method = %parts.method, target = %target, "Forwarding request");

        let upstream = self
            .client
            .request(parts.method, target)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await?;

        let mut builder = Response::builder().status(upstream.status());
        if let Some(response_headers) = builder.headers_mut() {
            *response_headers = strip_hop_by_hop(upstream.headers());
        }
        Ok(builder.body(Body::from_stream(upstream.bytes_stream()))?)
    }
}

/// `destination` base joined with the original path and query
fn target_url(destination: &str, uri: &axum::http::Uri) -> Result<Url, ForwardError> {
    let invalid = |reason: String| ForwardError::InvalidDestination {
        destination: destination.to_string(),
        reason,
    };

    let mut url = Url::parse(destination).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    url.set_path(uri.path());
    url.set_query(uri.query());
    Ok(url)
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(*name);
    }

    // Headers named by `Connection` are hop-by-hop as well
    for value in headers.get_all(header::CONNECTION) {
        if let Ok(list) = value.to_str() {
            for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                out.remove(name);
            }
        }
    }
    out
}

/// 502 returned when the owner cannot be reached
pub fn bad_gateway(session_id: &str) -> Response {
    let body = serde_json::json!({
        "error": "Bad gateway",
        "hint": "The instance owning this session could not be reached",
        "session_id": session_id,
    });
    Response::builder()
        .status(axum::http::StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
