use thiserror::Error;

use crate::schema_mapper::BackendKind;

/// Errors surfaced by [`crate::store::RecordStore`] implementations.
///
/// Lookup misses are not errors: read paths return `Option::None` instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A required field is missing or an owning record does not exist.
    /// Never retried against another backend.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Connection-level or transient failure of a backend.
    #[error("{backend} backend unavailable: {message}")]
    BackendUnavailable {
        backend: BackendKind,
        message: String,
    },

    /// A stored row could not be turned into a canonical record.
    #[error("{backend} row could not be decoded: {message}")]
    Decode {
        backend: BackendKind,
        message: String,
    },
}

impl StoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unavailable(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend,
            message: message.into(),
        }
    }

    pub fn decode(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::Decode {
            backend,
            message: message.into(),
        }
    }

    /// Whether the same logical operation may be retried on a fallback backend.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    /// Short error code used in API error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            Self::Decode { .. } => "RECORD_DECODE_FAILED",
        }
    }
}
