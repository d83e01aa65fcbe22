use thiserror::Error;

#[derive(Debug, Error)]
pub enum PostsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Index error: {0}")]
    Index(#[from] redb::Error),

    #[error("Invalid post input: {0}")]
    Validation(String),

    #[error("Post already exists: {0}")]
    AlreadyExists(String),

    #[error("Post not found: {0}")]
    PostNotFound(String),

    #[error("Corrupt post record: {0}")]
    CorruptRecord(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// The coarse failure classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    AlreadyExists,
    NotFound,
    CorruptRecord,
    Io,
}

impl PostsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PostsError::Validation(_) => ErrorKind::Validation,
            PostsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            PostsError::PostNotFound(_) => ErrorKind::NotFound,
            PostsError::CorruptRecord(_) | PostsError::Encoding(_) => ErrorKind::CorruptRecord,
            PostsError::IoError(_) | PostsError::Index(_) => ErrorKind::Io,
        }
    }
}

impl From<serde_json::Error> for PostsError {
    fn from(e: serde_json::Error) -> Self {
        PostsError::Encoding(e.to_string())
    }
}

impl From<redb::DatabaseError> for PostsError {
    fn from(e: redb::DatabaseError) -> Self {
        PostsError::Index(e.into())
    }
}

impl From<redb::TransactionError> for PostsError {
    fn from(e: redb::TransactionError) -> Self {
        PostsError::Index(e.into())
    }
}

impl From<redb::TableError> for PostsError {
    fn from(e: redb::TableError) -> Self {
        PostsError::Index(e.into())
    }
}

impl From<redb::StorageError> for PostsError {
    fn from(e: redb::StorageError) -> Self {
        PostsError::Index(e.into())
    }
}

impl From<redb::CommitError> for PostsError {
    fn from(e: redb::CommitError) -> Self {
        PostsError::Index(e.into())
    }
}
