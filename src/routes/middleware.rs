//! HTTP middleware: request ids, redacting request logs, CORS, body limits

use std::time::Instant;

use axum::{
    extract::Request,
    http::{header, HeaderValue, Method, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::info;
use uuid::Uuid;

/// Initial guard only; the Content-Length header may be absent or lying.
const MAX_BODY_SIZE: u64 = 100_000;

/// Correlation id attached to every request and echoed in error details.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Request log with secrets redacted: token values never hit the log, and
/// dropbox-indirected paths collapse entirely because the payload encodes a
/// URL that may carry credentials.
pub async fn log_requests(req: Request, next: Next) -> Response {
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let endpoint = redact_uri(req.uri());
    let method = req.method().clone();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    info!(%request_id, %method, %endpoint, "request started");
    let started = Instant::now();

    let response = next.run(req).await;

    info!(
        %request_id,
        %method,
        %endpoint,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "request finished"
    );
    response
}

pub(crate) fn redact_uri(uri: &Uri) -> String {
    if uri.path().starts_with("/documents/dropbox/") {
        return "/documents/dropbox/[REDACTED]".to_string();
    }

    let path = uri.path();
    let Some(query) = uri.query() else {
        return path.to_string();
    };

    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some(("token", _)) => "token=[REDACTED]".to_string(),
            _ => pair.to_string(),
        })
        .collect();
    format!("{}?{}", path, redacted.join("&"))
}

/// Reject requests whose declared payload is oversized before reading any of
/// it.
pub async fn limit_body(req: Request, next: Next) -> Response {
    if let Some(raw) = req.headers().get(header::CONTENT_LENGTH) {
        let parsed = raw.to_str().ok().and_then(|v| v.parse::<u64>().ok());
        match parsed {
            Some(length) if length > MAX_BODY_SIZE => {
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
            Some(_) => {}
            None => return StatusCode::BAD_REQUEST.into_response(),
        }
    }
    next.run(req).await
}

/// CORS for the documents routes. Preflights echo the requested headers
/// back; everything else gets the permissive origin and method headers.
pub async fn cors(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, OPTIONS"),
        );
        if let Some(requested) = req.headers().get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        return response;
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    response
}
