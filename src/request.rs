//! Declarative description of a single download.
//!
//! A [`Request`] is built with chained mutators, handed to a
//! [`Client`](crate::Client), and is immutable from that point on. The
//! matching [`Response`](crate::Response) keeps a back-reference to it
//! for the lifetime of the transfer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use reqwest::header::{HeaderMap, HeaderValue, IntoHeaderName};
use reqwest::{Method, Url};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::error::{DownloadError, Result};
use crate::rate::RateLimiter;
use crate::response::Response;
use crate::verify::Hasher;

/// A caller-supplied byte destination used in place of a filesystem
/// path. The core writes body bytes into it but never shuts it down;
/// the caller closes it after the done signal.
pub trait ByteSink: AsyncWrite + Send + Unpin {}

impl<T> ByteSink for T where T: AsyncWrite + Send + Unpin {}

/// Callback invoked around the body copy with the live [`Response`].
pub type Hook =
    Arc<dyn Fn(&Response) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync>;

pub(crate) enum Destination {
    Path(PathBuf),
    // The sink is taken exactly once by the transfer task; the cell
    // lets the Response keep an immutable back-reference meanwhile.
    Sink(Mutex<Option<Box<dyn ByteSink>>>),
}

/// Immutable declaration of what to fetch and how.
pub struct Request {
    pub(crate) url: Url,
    pub(crate) method: Method,
    pub(crate) headers: HeaderMap,
    pub(crate) destination: Destination,
    pub(crate) size: Option<u64>,
    pub(crate) checksum: Option<Vec<u8>>,
    pub(crate) hasher: Mutex<Option<Box<dyn Hasher>>>,
    pub(crate) delete_on_error: bool,
    pub(crate) no_resume: bool,
    pub(crate) no_create_directories: bool,
    pub(crate) no_store: bool,
    pub(crate) rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub(crate) buffer_size: Option<usize>,
    pub(crate) before_copy: Option<Hook>,
    pub(crate) after_copy: Option<Hook>,
    pub(crate) cancel: CancellationToken,
}

impl Request {
    /// Creates a request downloading `url` to a filesystem path.
    ///
    /// `destination` may name a file, or an existing directory in which
    /// case the filename is resolved from the server response and the
    /// URL.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] when `url` does not parse
    /// as an absolute http(s) URL.
    pub fn new(destination: impl Into<PathBuf>, url: &str) -> Result<Self> {
        let destination = destination.into();
        if destination.as_os_str().is_empty() {
            return Err(DownloadError::BadDestination(
                "destination path is empty".into(),
            ));
        }
        Self::with_destination(Destination::Path(destination), url)
    }

    /// Creates a request streaming the body into a caller-owned sink.
    ///
    /// No filename resolution, resume, or disk I/O happens for sink
    /// destinations; the caller keeps ownership and closes the sink
    /// after the transfer is done.
    pub fn to_sink(sink: impl ByteSink + 'static, url: &str) -> Result<Self> {
        Self::with_destination(Destination::Sink(Mutex::new(Some(Box::new(sink)))), url)
    }

    fn with_destination(destination: Destination, url: &str) -> Result<Self> {
        let url =
            Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidUrl(format!(
                "{url}: unsupported scheme {:?}",
                url.scheme()
            )));
        }

        Ok(Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            destination,
            size: None,
            checksum: None,
            hasher: Mutex::new(None),
            delete_on_error: false,
            no_resume: false,
            no_create_directories: false,
            no_store: false,
            rate_limiter: None,
            buffer_size: None,
            before_copy: None,
            after_copy: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Sets the HTTP method (default GET).
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Adds a request header sent with the transfer.
    #[must_use]
    pub fn header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Declares the expected resource size in bytes.
    ///
    /// A declared size skips the HEAD probe and lets an existing local
    /// file of the same length short-circuit to success. It is a hint:
    /// lengths observed from the server override it.
    #[must_use]
    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Attaches an integrity policy: the transferred bytes must hash to
    /// `expected` under `hasher`, else the transfer fails with
    /// [`DownloadError::ChecksumMismatch`]. With `delete_on_error` the
    /// local file is removed on failure.
    #[must_use]
    pub fn checksum(
        mut self,
        hasher: impl Hasher + 'static,
        expected: impl Into<Vec<u8>>,
        delete_on_error: bool,
    ) -> Self {
        self.hasher = Mutex::new(Some(Box::new(hasher)));
        self.checksum = Some(expected.into());
        self.delete_on_error = delete_on_error;
        self
    }

    /// Attaches a hasher without an expected digest. The digest is
    /// computed and discarded; useful for observing hash cost or for
    /// hooks that log it.
    #[must_use]
    pub fn hasher(mut self, hasher: impl Hasher + 'static) -> Self {
        self.hasher = Mutex::new(Some(Box::new(hasher)));
        self
    }

    /// Disables range-resume; an existing partial file is restarted
    /// from scratch.
    #[must_use]
    pub fn no_resume(mut self, no_resume: bool) -> Self {
        self.no_resume = no_resume;
        self
    }

    /// Disables mkdir-p of parent directories.
    #[must_use]
    pub fn no_create_directories(mut self, no_create_directories: bool) -> Self {
        self.no_create_directories = no_create_directories;
        self
    }

    /// Do not persist the body even for path destinations. Useful for
    /// checksum-only verification passes.
    #[must_use]
    pub fn no_store(mut self, no_store: bool) -> Self {
        self.no_store = no_store;
        self
    }

    /// Throttles the transfer through `limiter`.
    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Overrides the copy-buffer size for this request.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Runs `hook` after the connection phase, immediately before body
    /// bytes flow. An error aborts the transfer.
    #[must_use]
    pub fn before_copy<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Response) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.before_copy = Some(Arc::new(hook));
        self
    }

    /// Runs `hook` after the body copy and validation. Its error
    /// becomes the transfer's terminal error unless one already exists.
    #[must_use]
    pub fn after_copy<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Response) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.after_copy = Some(Arc::new(hook));
        self
    }

    /// Attaches a cancellation token; cancelling it (or calling
    /// [`Response::cancel`]) ends the transfer with
    /// [`DownloadError::Canceled`].
    #[must_use]
    pub fn cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The absolute URL this request fetches.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The destination path, when the destination is the filesystem.
    pub fn path(&self) -> Option<&Path> {
        match &self.destination {
            Destination::Path(p) => Some(p),
            Destination::Sink(_) => None,
        }
    }

    pub(crate) fn is_sink(&self) -> bool {
        matches!(self.destination, Destination::Sink(_))
    }

    /// Whether an existing partial file may be extended.
    pub(crate) fn resume_allowed(&self) -> bool {
        !self.no_resume && !self.no_store && !self.is_sink()
    }

    pub(crate) fn take_sink(&self) -> Option<Box<dyn ByteSink>> {
        match &self.destination {
            Destination::Sink(cell) => cell.lock().ok()?.take(),
            Destination::Path(_) => None,
        }
    }

    pub(crate) fn take_hasher(&self) -> Option<Box<dyn Hasher>> {
        self.hasher.lock().ok()?.take()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url.as_str())
            .field("method", &self.method)
            .field("destination", &self.path())
            .field("size", &self.size)
            .field("checksum", &self.checksum.as_deref().map(hex::encode))
            .field("no_resume", &self.no_resume)
            .field("no_store", &self.no_store)
            .field("delete_on_error", &self.delete_on_error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_and_non_http_urls() {
        assert!(matches!(
            Request::new("out.bin", "not a url"),
            Err(DownloadError::InvalidUrl(_))
        ));
        assert!(matches!(
            Request::new("out.bin", "ftp://example.com/file"),
            Err(DownloadError::InvalidUrl(_))
        ));
    }

    #[test]
    fn rejects_empty_destination() {
        assert!(matches!(
            Request::new("", "https://example.com/file"),
            Err(DownloadError::BadDestination(_))
        ));
    }

    #[test]
    fn sink_requests_have_no_path_and_never_resume() {
        let request = Request::to_sink(tokio::io::sink(), "https://example.com/file").unwrap();
        assert!(request.path().is_none());
        assert!(request.is_sink());
        assert!(!request.resume_allowed());
        assert!(request.take_sink().is_some());
        // The sink is gone after the transfer takes it.
        assert!(request.take_sink().is_none());
    }

    #[test]
    fn builder_mutators_compose() {
        let request = Request::new("/tmp/out.bin", "https://example.com/a/b.iso")
            .unwrap()
            .size(42)
            .no_resume(true)
            .buffer_size(0)
            .header(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        assert_eq!(request.size, Some(42));
        assert!(request.no_resume);
        assert!(!request.resume_allowed());
        // A zero buffer size is clamped rather than honored.
        assert_eq!(request.buffer_size, Some(1));
        assert!(request.headers.contains_key(reqwest::header::ACCEPT));
    }
}
