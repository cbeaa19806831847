// Error type shared by every layer of the substrate

use thiserror::Error;

/// Result type alias for substrate operations
pub type Result<T> = std::result::Result<T, WorldError>;

/// Errors surfaced by storage, queue and streaming operations
#[derive(Debug, Error)]
pub enum WorldError {
    /// Entity missing for get/update/cancel/pause/resume/dispose
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Primary key already exists, or a state-conditional write lost
    #[error("{kind} already exists: {id}")]
    Conflict { kind: &'static str, id: String },

    /// Queue name does not match the workflow/step grammar
    #[error("invalid queue name: {0}")]
    InvalidQueueName(String),

    /// Driver/network errors pass through unchanged
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Payload (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value that should be well-formed is not (e.g. an unknown
    /// status string)
    #[error("decode error: {0}")]
    Decode(String),
}

impl WorldError {
    /// Create a not-found error for an entity kind
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        WorldError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a conflict error for an entity kind
    pub fn conflict(kind: &'static str, id: impl Into<String>) -> Self {
        WorldError::Conflict {
            kind,
            id: id.into(),
        }
    }

    /// Whether this is a missing-entity error (maps to HTTP 404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, WorldError::NotFound { .. })
    }

    /// Whether this is a duplicate/conflict error (maps to HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, WorldError::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = WorldError::not_found("run", "wrun_123");
        assert_eq!(err.to_string(), "run not found: wrun_123");
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_conflict_display() {
        let err = WorldError::conflict("hook", "whook_abc");
        assert_eq!(err.to_string(), "hook already exists: whook_abc");
        assert!(err.is_conflict());
    }

    #[test]
    fn test_invalid_queue_name_display() {
        let err = WorldError::InvalidQueueName("bogus".into());
        assert_eq!(err.to_string(), "invalid queue name: bogus");
    }
}
