use parley_core::errors::StorageError;

/// Failures surfaced to the caller of a session operation. Turn-level
/// failures are not errors here: they reach observers as terminal events.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("a turn is already in progress for session {0}")]
    TurnInProgress(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("store error: {0}")]
    Store(#[from] StorageError),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::TurnInProgress(_) => "turn_in_progress",
            Self::SessionClosed(_) => "session_closed",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Store(_) => "store_error",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_display() {
        let err = EngineError::TurnInProgress("s1".into());
        assert_eq!(err.error_kind(), "turn_in_progress");
        assert_eq!(err.to_string(), "a turn is already in progress for session s1");

        let err: EngineError = StorageError::Backend("disk full".into()).into();
        assert_eq!(err.error_kind(), "store_error");
    }
}
