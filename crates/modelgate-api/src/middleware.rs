// HTTP middleware: request ids, metrics, body caps, security headers

use axum::extract::{MatchedPath, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use modelgate_core::GatewayError;
use uuid::Uuid;

use crate::error::{ApiError, RequestId};
use crate::state::AppState;

/// Ensure every request carries an x-request-id and echo it on the response
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let req_id = req
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(req_id.clone()));

    let mut response = next.run(req).await;
    if !response.headers().contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&req_id) {
            response.headers_mut().insert("x-request-id", value);
        }
    }
    response
}

/// Request counter + latency histogram, plus security headers on the way out
pub async fn metrics(State(state): State<AppState>, req: Request, next: Next) -> Response {
    // Matched route template keeps label cardinality bounded
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let timer = state
        .metrics
        .request_latency
        .with_label_values(&[&route])
        .start_timer();
    let mut response = next.run(req).await;
    timer.observe_duration();

    state
        .metrics
        .requests_total
        .with_label_values(&[&route, response.status().as_str()])
        .inc();

    if state.settings.security_headers_enabled {
        let headers = response.headers_mut();
        for (name, value) in [
            ("x-content-type-options", "nosniff"),
            ("x-frame-options", "DENY"),
            ("referrer-policy", "strict-origin-when-cross-origin"),
            ("x-xss-protection", "0"),
            ("cross-origin-opener-policy", "same-origin"),
            ("cross-origin-resource-policy", "same-origin"),
        ] {
            if !headers.contains_key(name) {
                headers.insert(name, HeaderValue::from_static(value));
            }
        }
    }
    response
}

/// Enforce the body cap when Content-Length is present
pub async fn body_size_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let declared = req
        .headers()
        .get("content-length")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    if let Some(length) = declared {
        if length > state.settings.request_max_body_bytes {
            let request_id = req
                .extensions()
                .get::<RequestId>()
                .cloned()
                .unwrap_or_default();
            return ApiError::new(GatewayError::PayloadTooLarge, &request_id).into_response();
        }
    }
    next.run(req).await
}
