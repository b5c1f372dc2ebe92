use hyper::StatusCode;
use serde_json::json;
use thiserror::Error;

use crate::pipeline::RequestContext;

pub type AppResult<T> = Result<T, AppError>;

/// Application error type for the request pipeline.
///
/// Recoverable identity failures (bad header, bad credentials, bad token) are
/// never surfaced through this enum; the resolver swallows them and leaves the
/// caller anonymous. What travels here is the fatal/contract tier plus
/// transport-level failures: everything that must reach the recovery boundary
/// and become an isolated error response.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("authentication error: {0}")]
    Auth(String),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The signing secret is absent from configuration. Continuing would
    /// silently disable token authentication for every caller, so this is an
    /// internal invariant violation, not a per-request auth failure.
    #[error("jwt_secret is not configured")]
    MissingSecret,

    /// A verified token whose claims do not carry a well-formed `user`
    /// mapping. The issuer and this service share a contract; a shape
    /// mismatch here fails loudly instead of degrading to anonymous.
    #[error("malformed claims payload: {0}")]
    MalformedClaims(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Auth(_) | AppError::Jwt(_) => StatusCode::UNAUTHORIZED,
            AppError::MissingSecret
            | AppError::MalformedClaims(_)
            | AppError::Config(_)
            | AppError::Json(_)
            | AppError::Io(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable code for programmatic handling.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "AUTH_ERROR",
            AppError::Jwt(_) => "JWT_ERROR",
            AppError::MissingSecret => "MISSING_SECRET",
            AppError::MalformedClaims(_) => "MALFORMED_CLAIMS",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// User-facing message. Server-side details stay out of 5xx bodies.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Auth(msg) => format!("Authentication failed: {}", msg),
            AppError::Jwt(_) => "Invalid or expired token".to_string(),
            _ => "Internal server error".to_string(),
        }
    }

    /// Log with a level matching the failure class.
    pub fn log(&self) {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, error_code = %self.error_code(), "server error");
        } else {
            tracing::warn!(error = %self, error_code = %self.error_code(), "request error");
        }
    }

    /// Render this error into the context's response. Used by the recovery
    /// boundary when converting a propagated fault.
    pub fn write_response(&self, ctx: &mut RequestContext) {
        self.log();

        let status = self.status_code();
        let body = json!({
            "error": self.user_message(),
            "error_code": self.error_code(),
            "status": status.as_u16(),
        });

        ctx.response.status = status;
        ctx.response.headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
        ctx.response.body = body.to_string();
    }
}
