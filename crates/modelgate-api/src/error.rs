// Standardized error envelope
//
// Every error response is { "error": { "code", "message" }, "request_id" }.
// Handlers bubble typed GatewayErrors up to this boundary; the request id is
// attached from the extension the request-id middleware installed.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use modelgate_core::GatewayError;
use serde_json::json;

/// Request id minted or propagated by the middleware
#[derive(Debug, Clone, Default)]
pub struct RequestId(pub String);

#[derive(Debug)]
pub struct ApiError {
    pub error: GatewayError,
    pub request_id: String,
}

impl ApiError {
    pub fn new(error: impl Into<GatewayError>, request_id: &RequestId) -> Self {
        Self {
            error: error.into(),
            request_id: request_id.0.clone(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.error.status_code();
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if code >= 500 {
            tracing::error!(request_id = %self.request_id, error = %self.error, "request failed");
        }

        let mut body = json!({
            "error": { "code": code, "message": self.error.to_string() },
            "request_id": self.request_id,
        });
        if let GatewayError::ReadTimeout { retry_after, .. } = &self.error {
            body["error"]["retry_after"] = json!(retry_after);
            body["error"]["type"] = json!("timeout_error");
        }
        if let GatewayError::Lifecycle(
            modelgate_core::LifecycleError::ImageUnavailableOffline { remediation, .. },
        ) = &self.error
        {
            body["error"]["remediation"] = json!(remediation);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_core::LifecycleError;

    fn rid() -> RequestId {
        RequestId("req-123".into())
    }

    #[test]
    fn envelope_carries_code_message_and_request_id() {
        let err = ApiError::new(GatewayError::NoUpstreams, &rid());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn timeout_carries_retry_advisory() {
        let err = ApiError::new(
            GatewayError::ReadTimeout {
                model: "m".into(),
                retry_after: 30,
            },
            &rid(),
        );
        assert_eq!(err.into_response().status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn lifecycle_errors_map_to_400() {
        let err = ApiError::new(
            LifecycleError::IncompleteMultipart {
                base: "m".into(),
                found: 2,
                expected: 3,
            },
            &rid(),
        );
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
