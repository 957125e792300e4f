use thiserror::Error;

use crate::backend::storage::StoreError;

/// All errors an engine operation can report to a client.
///
/// Each variant maps onto one of the scoped `*_error` wire events; the
/// operation that failed picks the event, the variant supplies the message.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or malformed field in an inbound payload.
    #[error("{field}: {message}")]
    Validation { field: &'static str, message: String },

    /// The identity is not a member of the chat it tried to act in.
    #[error("You are not a member of this chat")]
    NotAMember { chat_id: i64 },

    /// The identity lacks the role the operation requires.
    #[error("{0}")]
    Forbidden(String),

    /// A referenced entity does not exist.
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// Referenced message missing or in a different chat.
    #[error("Referenced message not found or not in this chat")]
    InvalidReference,

    /// File exceeds the configured upload cap.
    #[error("File size exceeds {limit_mib}MB limit ({size_mib:.2}MB)")]
    FileTooLarge { size_mib: f64, limit_mib: u64 },

    /// Critical-path persistence failure. Never partially broadcast.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Blob storage collaborator failed before any database write.
    #[error("Failed to save file: {0}")]
    StorageWrite(String),
}

impl EngineError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation { field, message: message.into() }
    }

    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Self::NotFound { what, id: id.to_string() }
    }

    /// Whether this error came from a backing dependency rather than the
    /// request itself. Dependency failures get logged at error level.
    pub fn is_dependency(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::StorageWrite(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_message() {
        let err = EngineError::validation("chat_id", "chat_id is required");
        assert_eq!(err.to_string(), "chat_id: chat_id is required");
        assert!(!err.is_dependency());
    }

    #[test]
    fn test_file_too_large_message() {
        let err = EngineError::FileTooLarge { size_mib: 51.5, limit_mib: 50 };
        assert!(err.to_string().contains("50MB"));
        assert!(err.to_string().contains("51.50MB"));
    }

    #[test]
    fn test_dependency_classification() {
        let err = EngineError::Persistence(StoreError::Backend("db down".into()));
        assert!(err.is_dependency());
        let err = EngineError::NotAMember { chat_id: 3 };
        assert!(!err.is_dependency());
    }
}
