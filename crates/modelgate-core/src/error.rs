// Error types shared across the gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors raised on the request path. Each maps to one HTTP status; the API
/// crate turns them into the standard envelope.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// 400
    #[error("{0}")]
    BadRequest(String),

    /// 401
    #[error("{0}")]
    Unauthorized(String),

    /// 403
    #[error("{0}")]
    Forbidden(String),

    /// 404
    #[error("{0}")]
    NotFound(String),

    /// 408 read timeout against upstream, carries a retry advisory
    #[error("Request timeout - model is processing but taking longer than expected. Please try again with a shorter prompt or fewer tokens.")]
    ReadTimeout { model: String, retry_after: u64 },

    /// 409 unique-name conflict
    #[error("{0}")]
    Conflict(String),

    /// 413
    #[error("Request entity too large")]
    PayloadTooLarge,

    /// 429 rate limit or concurrency slot exceeded
    #[error("{0}")]
    RateLimited(String),

    /// 502 upstream unreachable after retries
    #[error("upstream_unreachable")]
    UpstreamUnreachable,

    /// 503 no candidate upstreams for the request
    #[error("no_upstreams_available")]
    NoUpstreams,

    /// 503 a collaborator is not ready (database, HTTP client)
    #[error("{0}")]
    Unavailable(String),

    /// 504 admin operation exceeded its budget
    #[error("{0}")]
    OperationTimeout(String),

    /// Lifecycle validation failure, surfaced as 400 on admin endpoints
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// 500
    #[error("internal_server_error")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::BadRequest(_) => 400,
            GatewayError::Unauthorized(_) => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::NotFound(_) => 404,
            GatewayError::ReadTimeout { .. } => 408,
            GatewayError::Conflict(_) => 409,
            GatewayError::PayloadTooLarge => 413,
            GatewayError::RateLimited(_) => 429,
            GatewayError::UpstreamUnreachable => 502,
            GatewayError::NoUpstreams | GatewayError::Unavailable(_) => 503,
            GatewayError::OperationTimeout(_) => 504,
            GatewayError::Lifecycle(_) => 400,
            GatewayError::Internal(_) => 500,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        GatewayError::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        GatewayError::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        GatewayError::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        GatewayError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        GatewayError::Conflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        GatewayError::Unavailable(msg.into())
    }
}

/// Typed failures from the engine lifecycle manager.
///
/// These carry enough structure for the admin UI to render a remediation
/// block instead of a bare string.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Engine image is not in the local cache and pulling is not allowed
    #[error("image_unavailable_offline: {image}")]
    ImageUnavailableOffline { image: String, remediation: String },

    /// A multi-part GGUF set is missing one or more parts
    #[error("incomplete_multipart: {base} has {found} of {expected} parts")]
    IncompleteMultipart {
        base: String,
        found: usize,
        expected: usize,
    },

    /// A user-supplied startup argument is on the deny list
    #[error("forbidden_custom_arg: {flag}")]
    ForbiddenCustomArg { flag: String },

    /// Tensor-parallel degree exceeds the selected GPU count
    #[error("gpu_count_exceeded: tensor parallel size {tp_size} exceeds {gpu_count} selected GPUs")]
    GpuCountExceeded { tp_size: u32, gpu_count: usize },

    /// Estimated VRAM does not fit the selected GPUs
    #[error("insufficient_vram: need {required_gb:.1} GB, {free_gb:.1} GB free on GPU {gpu_index}")]
    InsufficientVram {
        gpu_index: usize,
        required_gb: f64,
        free_gb: f64,
    },

    /// Artifact path is missing, unreadable, or not a GGUF file/directory
    #[error("invalid_artifact: {0}")]
    InvalidArtifact(String),

    /// Container runtime rejected the operation
    #[error("container_runtime: {0}")]
    Runtime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_envelope_mapping() {
        assert_eq!(GatewayError::bad_request("x").status_code(), 400);
        assert_eq!(GatewayError::unauthorized("x").status_code(), 401);
        assert_eq!(GatewayError::forbidden("x").status_code(), 403);
        assert_eq!(
            GatewayError::ReadTimeout {
                model: "m".into(),
                retry_after: 30
            }
            .status_code(),
            408
        );
        assert_eq!(GatewayError::conflict("x").status_code(), 409);
        assert_eq!(GatewayError::PayloadTooLarge.status_code(), 413);
        assert_eq!(GatewayError::RateLimited("x".into()).status_code(), 429);
        assert_eq!(GatewayError::UpstreamUnreachable.status_code(), 502);
        assert_eq!(GatewayError::NoUpstreams.status_code(), 503);
        assert_eq!(GatewayError::unavailable("db").status_code(), 503);
    }

    #[test]
    fn lifecycle_errors_surface_as_400() {
        let err = GatewayError::from(LifecycleError::ForbiddenCustomArg {
            flag: "--port".into(),
        });
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("--port"));
    }
}
