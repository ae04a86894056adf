use parley_core::errors::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for StorageError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => StorageError::NotFound(what),
            StoreError::Conflict(what) => StorageError::Conflict(what),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_row_display() {
        let err = StoreError::CorruptRow {
            table: "messages",
            column: "role",
            detail: "unknown role: system".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt row in messages.role: unknown role: system"
        );
    }

    #[test]
    fn converts_to_storage_error() {
        let err: StorageError = StoreError::NotFound("session s1".into()).into();
        assert!(matches!(err, StorageError::NotFound(_)));
        let err: StorageError = StoreError::Database("locked".into()).into();
        assert!(matches!(err, StorageError::Backend(msg) if msg.contains("locked")));
    }
}
