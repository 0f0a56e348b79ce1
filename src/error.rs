//! Gateway error types with wire code and HTTP status mapping.
//!
//! [`GatewayError`] is the central error type for the gateway. Each variant
//! maps to a numeric error code (used in WebSocket `error` payloads) and an
//! HTTP status for the REST surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::domain::EventScope;

/// Structured JSON error response body.
///
/// All REST error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 1003,
///     "message": "invalid message: missing event_type",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Numeric error code (see code ranges below).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Server-side error enum with wire code and HTTP status mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category               | HTTP Status               |
/// |-----------|------------------------|---------------------------|
/// | 1000–1999 | Protocol/Validation    | 400 Bad Request           |
/// | 2000–2999 | Lookup/State           | 404 Not Found             |
/// | 3000–3999 | Server                 | 500 Internal Server Error |
/// | 4000–4999 | Authorization/Capacity | 403 Forbidden / 422       |
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Inbound payload was not valid JSON.
    #[error("Invalid JSON format")]
    InvalidJson,

    /// Inbound envelope carried an unrecognized `type` tag.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Inbound payload failed validation.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Connection with the given ID was not found.
    #[error("connection not found: {0}")]
    ConnectionNotFound(uuid::Uuid),

    /// Subscription with the given ID was not found or not owned by the
    /// caller.
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(uuid::Uuid),

    /// Operation requires an authenticated connection.
    #[error("authentication required")]
    AuthenticationRequired,

    /// Connection lacks the capability or identity the scope demands.
    #[error("scope {scope} not permitted: {reason}")]
    ScopeNotPermitted {
        /// The scope that was requested.
        scope: EventScope,
        /// Why the subscription was refused.
        reason: String,
    },

    /// Per-connection subscription cap reached.
    #[error("subscription limit reached ({max} per connection)")]
    SubscriptionLimitReached {
        /// The configured cap.
        max: usize,
    },

    /// Client exhausted its send-rate window.
    #[error("rate limit exceeded; retry after {retry_after_secs} s")]
    RateLimited {
        /// Seconds until the token bucket refills.
        retry_after_secs: u64,
    },

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidJson => 1001,
            Self::UnknownMessageType(_) => 1002,
            Self::InvalidMessage(_) => 1003,
            Self::ConnectionNotFound(_) => 2001,
            Self::SubscriptionNotFound(_) => 2002,
            Self::AuthenticationRequired => 4001,
            Self::ScopeNotPermitted { .. } => 4002,
            Self::SubscriptionLimitReached { .. } => 4003,
            Self::RateLimited { .. } => 429,
            Self::Configuration(_) => 3001,
            Self::Internal(_) => 3000,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidJson | Self::UnknownMessageType(_) | Self::InvalidMessage(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::ConnectionNotFound(_) | Self::SubscriptionNotFound(_) => StatusCode::NOT_FOUND,
            Self::AuthenticationRequired | Self::ScopeNotPermitted { .. } => StatusCode::FORBIDDEN,
            Self::SubscriptionLimitReached { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Configuration(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}
