use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("segment storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("settings database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("settings database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("settings storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("settings transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("settings table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("settings commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("segment {id} is corrupt: {reason}")]
    CorruptSegment { id: String, reason: String },

    #[error("analysis error: {0}")]
    Analysis(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    pub(crate) fn corrupt(
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::CorruptSegment {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same read may succeed.
    ///
    /// Only transient storage failures qualify; corrupt segments need a
    /// re-index and configuration errors need operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}
