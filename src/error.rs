// ============================================================================
// Engine Errors
// ============================================================================
//
// Every business-rule failure in the engine is an `EngineError`. Errors carry
// an HTTP-like status so the API layer can render them without re-deciding
// what went wrong. Only `TransientConflict` is handled below the unit-of-work
// boundary (it is retried); everything else rolls back and surfaces.
//
// ============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// Coarse error taxonomy exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    LimitExceeded,
    Unauthorized,
    Forbidden,
    InsufficientResource,
    TransientConflict,
    ExternalService,
    Internal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Malformed or missing input, rejected before any lock is taken
    Validation(String),
    NotFound { entity: &'static str, id: String },
    /// Wrong status for the operation (already resolved, already completed, ...)
    Conflict(String),
    LimitExceeded { limit: &'static str, value: u64, max: u64 },
    SlippageExceeded { expected: u64, actual: u64, tolerance: u64 },
    Unauthorized(String),
    Forbidden(String),
    InsufficientFunds { required: u64, available: u64 },
    InsufficientShares { required: u64, available: u64 },
    InsufficientLiquidity { required: u64, available: u64 },
    /// Row lock contention; retried by the unit of work
    TransientConflict(String),
    ExternalService(String),
    Internal(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        EngineError::NotFound { entity, id: id.to_string() }
    }

    pub fn lock_conflict(entity: &'static str, id: impl fmt::Display) -> Self {
        EngineError::TransientConflict(format!("{} {} is locked by another unit of work", entity, id))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::LimitExceeded { .. } | EngineError::SlippageExceeded { .. } => {
                ErrorKind::LimitExceeded
            }
            EngineError::Unauthorized(_) => ErrorKind::Unauthorized,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::InsufficientFunds { .. }
            | EngineError::InsufficientShares { .. }
            | EngineError::InsufficientLiquidity { .. } => ErrorKind::InsufficientResource,
            EngineError::TransientConflict(_) => ErrorKind::TransientConflict,
            EngineError::ExternalService(_) => ErrorKind::ExternalService,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP-like status for the API layer
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Validation(_) => 400,
            EngineError::Unauthorized(_) => 401,
            EngineError::InsufficientFunds { .. } => 402,
            EngineError::Forbidden(_) => 403,
            EngineError::NotFound { .. } => 404,
            EngineError::Conflict(_) => 409,
            EngineError::LimitExceeded { .. }
            | EngineError::SlippageExceeded { .. }
            | EngineError::InsufficientShares { .. }
            | EngineError::InsufficientLiquidity { .. } => 422,
            EngineError::Internal(_) => 500,
            EngineError::ExternalService(_) => 502,
            EngineError::TransientConflict(_) => 503,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientConflict(_))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "Invalid request: {}", msg),
            EngineError::NotFound { entity, id } => write!(f, "{} not found: {}", entity, id),
            EngineError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            EngineError::LimitExceeded { limit, value, max } => {
                write!(f, "Limit exceeded: {} is {} (max {})", limit, value, max)
            }
            EngineError::SlippageExceeded { expected, actual, tolerance } => write!(
                f,
                "Slippage exceeded: expected {}, actual {} (tolerance {})",
                expected, actual, tolerance
            ),
            EngineError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            EngineError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            EngineError::InsufficientFunds { required, available } => {
                write!(f, "Insufficient balance: have {}, need {}", available, required)
            }
            EngineError::InsufficientShares { required, available } => {
                write!(f, "Insufficient shares: have {}, need {}", available, required)
            }
            EngineError::InsufficientLiquidity { required, available } => write!(
                f,
                "Insufficient pool liquidity: required {}, available {}",
                required, available
            ),
            EngineError::TransientConflict(msg) => write!(f, "Lock conflict: {}", msg),
            EngineError::ExternalService(msg) => write!(f, "External service error: {}", msg),
            EngineError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "success": false,
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_kind() {
        assert_eq!(EngineError::Validation("x".into()).status_code(), 400);
        assert_eq!(EngineError::not_found("market", "m1").status_code(), 404);
        assert_eq!(EngineError::Conflict("resolved".into()).status_code(), 409);
        assert_eq!(
            EngineError::InsufficientFunds { required: 10, available: 5 }.status_code(),
            402
        );
        assert_eq!(EngineError::lock_conflict("option", "o1").status_code(), 503);
    }

    #[test]
    fn test_slippage_is_a_limit() {
        let err = EngineError::SlippageExceeded { expected: 100, actual: 110, tolerance: 2 };
        assert_eq!(err.kind(), ErrorKind::LimitExceeded);
        assert!(err.to_string().contains("expected 100"));
    }

    #[test]
    fn test_only_lock_conflicts_are_transient() {
        assert!(EngineError::lock_conflict("wallet", "u1").is_transient());
        assert!(!EngineError::ExternalService("timeout".into()).is_transient());
    }
}
