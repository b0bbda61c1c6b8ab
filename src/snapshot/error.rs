//! Error types for the snapshot ledger

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Database error ({context}): {source}")]
    Database {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Lock poisoned: {0}")]
    Lock(String),

    #[error("Blocking task failed: {0}")]
    Join(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },
}

impl SnapshotError {
    /// Busy/locked database and lock contention are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            SnapshotError::Database {
                source: rusqlite::Error::SqliteFailure(err, _),
                ..
            } => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            SnapshotError::Lock(_) => true,
            _ => false,
        }
    }
}

/// Attach context to a rusqlite error
pub(crate) fn db_err(context: &str) -> impl FnOnce(rusqlite::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Database {
        context: context.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_transient() {
        let busy = SnapshotError::Database {
            context: "insert".into(),
            source: rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                None,
            ),
        };
        assert!(busy.is_transient());

        let missing = SnapshotError::Database {
            context: "select".into(),
            source: rusqlite::Error::QueryReturnedNoRows,
        };
        assert!(!missing.is_transient());
        assert!(!SnapshotError::NotFound("k".into()).is_transient());
    }
}
