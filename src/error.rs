use reqwest::StatusCode;
use thiserror::Error;

/// Terminal error of a transfer.
///
/// Every variant ends the transfer; the core performs no retries. The
/// error is stored on the [`Response`](crate::Response) and surfaced
/// through [`Response::err`](crate::Response::err) once the done signal
/// has closed.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("bad destination: {0}")]
    BadDestination(String),

    #[error("no filename could be determined")]
    NoFilename,

    #[error("illegal filename: {0:?}")]
    IllegalFilename(String),

    #[error("server returned {0}")]
    BadStatusCode(StatusCode),

    #[error("bad length: expected {expected} bytes, got {actual}")]
    BadLength { expected: u64, actual: u64 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("destination accepted fewer bytes than offered")]
    ShortWrite,

    #[error("download canceled")]
    Canceled,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("filesystem error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("hook error: {0}")]
    Hook(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DownloadError {
    /// True when the transfer was ended by its cancellation token.
    pub fn is_canceled(&self) -> bool {
        matches!(self, DownloadError::Canceled)
    }
}

/// Crate-wide result type defaulting to [`DownloadError`].
pub type Result<T, E = DownloadError> = std::result::Result<T, E>;
