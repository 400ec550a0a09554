use thiserror::Error;

/// Error returned by the resolver boundary when a real backend lookup fails.
///
/// The errno and message are recorded on the entry that failed to resolve
/// and replayed to callers until the next explicit resolve attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("resolver failed (errno {errno}): {message}")]
pub struct BackendError {
    pub errno: i32,
    pub message: String,
}

impl BackendError {
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("entry is destroyed; caller must re-lookup")]
    Destroyed,

    #[error("operation would block")]
    WouldBlock,

    #[error("parent entry is not a directory")]
    NotDirectory,
}

pub type Result<T> = std::result::Result<T, CacheError>;
