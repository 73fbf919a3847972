//! Error taxonomy for the ingestion core.
//!
//! Decode errors are local to a single uplink, connection errors drive the
//! connection manager's state machine, and store errors flag a broken
//! capacity invariant. Only [`PushError`] ever reaches an HTTP caller.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// ---

/// Failure to turn a raw payload into a [`crate::SensorRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload is not a valid JSON object: {0}")]
    InvalidEncoding(String),

    #[error("missing or malformed field `{0}`")]
    MissingField(&'static str),

    #[error("unparseable timestamp: {0}")]
    BadTimestamp(String),
}

impl DecodeError {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidEncoding(_) => "invalid_encoding",
            Self::MissingField(_) => "missing_field",
            Self::BadTimestamp(_) => "bad_timestamp",
        }
    }
}

/// Failure to establish or keep a broker session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("transport rejected: {0}")]
    TransportRejected(String),
}

impl ConnectionError {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::HandshakeFailed(_) => "handshake_failed",
            Self::Timeout(_) => "timeout",
            Self::TransportRejected(_) => "transport_rejected",
        }
    }
}

/// Raised when the bounded store is found holding more than its capacity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store holds {len} records but capacity is {capacity}")]
    CapacityInvariantViolation { len: usize, capacity: usize },
}

/// Refusal of a runtime ingestion-control request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("broker credentials are not configured (TTN_APP_ID / TTN_API_KEY)")]
    MissingCredentials,
}

impl ControlError {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "kind": self.kind(),
            "error": self.to_string(),
        });
        (StatusCode::CONFLICT, Json(body)).into_response()
    }
}

impl StoreError {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CapacityInvariantViolation { .. } => "store_invariant_violation",
        }
    }
}

/// Outcome reported to a caller of the push ingress.
#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PushError {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Decode(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }

    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Decode(DecodeError::InvalidEncoding(_)) => StatusCode::BAD_REQUEST,
            Self::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PushError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "kind": self.kind(),
            "error": self.to_string(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_non_json_is_distinct_from_validation_failure() {
        // ---
        let bad_json = PushError::from(DecodeError::InvalidEncoding("eof".into()));
        let missing = PushError::from(DecodeError::MissingField("received_at"));
        let bad_ts = PushError::from(DecodeError::BadTimestamp("yesterday".into()));

        assert_eq!(bad_json.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(missing.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(bad_ts.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_ne!(bad_json.kind(), missing.kind());
    }

    #[test]
    fn test_store_violation_is_server_error() {
        // ---
        let err = PushError::from(StoreError::CapacityInvariantViolation {
            len: 101,
            capacity: 100,
        });
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.kind(), "store_invariant_violation");
        assert!(err.to_string().contains("101"));
    }

    #[test]
    fn test_missing_credentials_is_conflict() {
        // ---
        let response = ControlError::MissingCredentials.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(ControlError::MissingCredentials.kind(), "missing_credentials");
    }
}
