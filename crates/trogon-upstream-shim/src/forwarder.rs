//! Transparent HTTP forwarder.
//!
//! Every inbound request, whatever its method or path, is reissued against the
//! upstream with the same method, path, query, headers and body. The upstream
//! response is relayed unchanged. The only response produced locally is the
//! `502` payload returned when the upstream cannot be reached.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::error::ShimError;

/// Headers that describe a single connection and never cross a proxy.
const HOP_BY_HOP_HEADERS: &[&str] = &[
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

#[derive(Clone)]
pub struct ForwarderState {
    client: reqwest::Client,
    upstream_base: String,
}

impl ForwarderState {
    /// `upstream_base` is scheme and authority only, e.g.
    /// `http://127.0.0.1:3000`; inbound paths are appended verbatim.
    pub fn new(upstream_base: impl Into<String>, timeout: Duration) -> Result<Self, ShimError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let upstream_base = upstream_base.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            upstream_base,
        })
    }

    pub fn upstream_base(&self) -> &str {
        &self.upstream_base
    }
}

/// Build the forwarding router. There are no routes: the fallback handles
/// every method and path.
pub fn router(state: ForwarderState) -> Router {
    Router::new().fallback(forward).with_state(state)
}

#[instrument(
    name = "forward",
    skip_all,
    fields(
        request_id = %Uuid::new_v4(),
        method = %req.method(),
        uri = %req.uri(),
    )
)]
async fn forward(
    State(state): State<ForwarderState>,
    req: Request,
) -> Result<Response, ForwardError> {
    let (parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream_base, path_and_query);

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    // Recomputed by the client for the outbound connection.
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);

    let mut outbound = state
        .client
        .request(parts.method.clone(), &url)
        .headers(headers);

    if carries_body(&parts.method) {
        let bytes: Bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| ForwardError::ReadRequestBody(e.to_string()))?;
        outbound = outbound.body(bytes);
    }

    let upstream = outbound.send().await.map_err(ForwardError::from_send)?;

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    let body = upstream.bytes().await.map_err(ForwardError::from_body)?;

    debug!(status = status.as_u16(), bytes = body.len(), "Relayed upstream response");

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Methods whose request body is read and forwarded. Bodies on other methods
/// are ignored.
fn carries_body(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Drop hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in &named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Why a request could not be relayed.
#[derive(Debug)]
pub enum ForwardError {
    /// Nothing accepted the connection on the upstream port.
    Connect(String),
    /// The upstream did not answer within the request timeout.
    Timeout(String),
    /// Any other transport failure while sending.
    Request(String),
    /// The upstream response body could not be read.
    ResponseBody(String),
    /// The caller's body could not be read.
    ReadRequestBody(String),
}

impl ForwardError {
    fn from_send(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }

    /// The request timeout also covers reading the response body.
    fn from_body(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::ResponseBody(e.to_string())
        }
    }

    /// Short machine-readable tag used in the error payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Timeout(_) => "timeout",
            Self::Request(_) => "request",
            Self::ResponseBody(_) => "body",
            Self::ReadRequestBody(_) => "request_body",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ReadRequestBody(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "Upstream refused the connection: {e}"),
            Self::Timeout(e) => write!(f, "Upstream timed out: {e}"),
            Self::Request(e) => write!(f, "Upstream request failed: {e}"),
            Self::ResponseBody(e) => write!(f, "Failed to read upstream response body: {e}"),
            Self::ReadRequestBody(e) => write!(f, "Failed to read request body: {e}"),
        }
    }
}

impl std::error::Error for ForwardError {}

/// JSON body of every locally produced error response.
#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub error: &'static str,
    pub kind: &'static str,
    pub message: String,
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        error!(error = %self, kind = self.kind(), "Forwarding failed");

        let error = match self {
            Self::ReadRequestBody(_) => "bad_request",
            _ => "upstream_unavailable",
        };
        let payload = ErrorPayload {
            error,
            kind: self.kind(),
            message: self.to_string(),
        };
        (self.status(), axum::Json(payload)).into_response()
    }
}
