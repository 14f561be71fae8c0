//! Live handle on an in-flight or completed download.
//!
//! A [`Response`] is created when a request is dispatched and stays
//! observable indefinitely after the transfer reaches its terminal
//! state. Progress counters are plain atomics mutated only by the
//! transfer task; the done signal is a latched watch channel, so every
//! observer wakes exactly once and late subscribers see the final state
//! immediately.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tokio::sync::watch;

use crate::error::DownloadError;
use crate::request::Request;

/// Smoothing factor of the exponential moving average byte rate.
const RATE_SMOOTHING: f64 = 0.1;
/// Minimum interval between rate samples.
const RATE_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Snapshot of the initial server reply, taken before any body bytes
/// are copied.
#[derive(Debug, Clone)]
pub struct HttpSnapshot {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Handle on one transfer. Cheap to clone; all clones observe the same
/// underlying state.
#[derive(Clone)]
pub struct Response {
    inner: Arc<Shared>,
}

struct Shared {
    request: Arc<Request>,
    filename: OnceLock<PathBuf>,
    http: OnceLock<HttpSnapshot>,
    size_total: AtomicU64,
    size_known: AtomicBool,
    bytes_resumed: AtomicU64,
    bytes_written: AtomicU64,
    did_resume: AtomicBool,
    rate: RateEstimator,
    start_wall: SystemTime,
    start: Instant,
    end: OnceLock<SystemTime>,
    elapsed: OnceLock<Duration>,
    err: OnceLock<DownloadError>,
    done: watch::Sender<bool>,
}

impl Response {
    pub(crate) fn new(request: Arc<Request>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Shared {
                request,
                filename: OnceLock::new(),
                http: OnceLock::new(),
                size_total: AtomicU64::new(0),
                size_known: AtomicBool::new(false),
                bytes_resumed: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                did_resume: AtomicBool::new(false),
                rate: RateEstimator::new(),
                start_wall: SystemTime::now(),
                start: Instant::now(),
                end: OnceLock::new(),
                elapsed: OnceLock::new(),
                err: OnceLock::new(),
                done,
            }),
        }
    }

    /// The request this transfer was created from.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Status of the initial server reply, once received.
    pub fn http_status(&self) -> Option<StatusCode> {
        self.inner.http.get().map(|s| s.status)
    }

    /// Headers of the initial server reply, once received.
    pub fn http_headers(&self) -> Option<&HeaderMap> {
        self.inner.http.get().map(|s| &s.headers)
    }

    /// Final resolved local path; `None` for sink destinations or while
    /// resolution is pending.
    pub fn filename(&self) -> Option<&Path> {
        self.inner.filename.get().map(PathBuf::as_path)
    }

    /// Resource size in bytes once known, else 0.
    pub fn size_total(&self) -> u64 {
        self.inner.size_total.load(Ordering::Acquire)
    }

    /// Bytes already on disk when the transfer started.
    pub fn bytes_resumed(&self) -> u64 {
        self.inner.bytes_resumed.load(Ordering::Acquire)
    }

    /// Bytes written during this invocation, excluding resumed bytes.
    pub fn bytes_complete(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Acquire)
    }

    /// Total bytes accounted for: resumed plus written.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_resumed() + self.bytes_complete()
    }

    /// Exponentially smoothed transfer rate in bytes per second.
    pub fn bytes_per_second(&self) -> f64 {
        self.inner.rate.current()
    }

    /// Completion ratio in `[0, 1]`, or 0 while the size is unknown.
    pub fn progress(&self) -> f64 {
        if !self.inner.size_known.load(Ordering::Acquire) {
            return 0.0;
        }
        let total = self.size_total();
        if total == 0 {
            return 1.0;
        }
        (self.bytes_transferred() as f64 / total as f64).min(1.0)
    }

    /// Estimated time to completion from the current rate, when both
    /// the size and a non-zero rate are known.
    pub fn eta(&self) -> Option<Duration> {
        if !self.inner.size_known.load(Ordering::Acquire) || self.is_done() {
            return None;
        }
        let remaining = self.size_total().saturating_sub(self.bytes_transferred());
        let rate = self.bytes_per_second();
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    /// True when a pre-existing partial (or complete) file was reused.
    pub fn did_resume(&self) -> bool {
        self.inner.did_resume.load(Ordering::Acquire)
    }

    /// Wall-clock time the transfer started.
    pub fn start(&self) -> SystemTime {
        self.inner.start_wall
    }

    /// Wall-clock time the transfer reached its terminal state.
    pub fn end(&self) -> Option<SystemTime> {
        self.inner.end.get().copied()
    }

    /// Elapsed transfer time; stops advancing at the terminal state.
    pub fn duration(&self) -> Duration {
        match self.inner.elapsed.get() {
            Some(elapsed) => *elapsed,
            None => self.inner.start.elapsed(),
        }
    }

    /// Waits for the transfer to reach its terminal state. Returns
    /// immediately if it already has.
    pub async fn done(&self) {
        let mut rx = self.inner.done.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// True once the done signal has closed.
    pub fn is_done(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// The terminal error, readable after the done signal closes.
    /// Returns `None` before completion and after success.
    pub fn err(&self) -> Option<&DownloadError> {
        if !self.is_done() {
            return None;
        }
        self.inner.err.get()
    }

    /// Cancels the transfer. Idempotent; safe from any task.
    pub fn cancel(&self) {
        self.inner.request.cancel.cancel();
    }

    // Mutators below are reserved for the transfer task.

    pub(crate) fn set_filename(&self, path: PathBuf) {
        let _ = self.inner.filename.set(path);
    }

    pub(crate) fn set_http(&self, status: StatusCode, headers: HeaderMap) {
        let _ = self.inner.http.set(HttpSnapshot { status, headers });
    }

    pub(crate) fn set_size_total(&self, total: u64) {
        self.inner.size_total.store(total, Ordering::Release);
        self.inner.size_known.store(true, Ordering::Release);
    }

    pub(crate) fn size_total_known(&self) -> Option<u64> {
        if self.inner.size_known.load(Ordering::Acquire) {
            Some(self.size_total())
        } else {
            None
        }
    }

    pub(crate) fn set_bytes_resumed(&self, bytes: u64) {
        self.inner.bytes_resumed.store(bytes, Ordering::Release);
    }

    pub(crate) fn set_did_resume(&self, did_resume: bool) {
        self.inner.did_resume.store(did_resume, Ordering::Release);
    }

    pub(crate) fn add_bytes_written(&self, bytes: u64) {
        self.inner.bytes_written.fetch_add(bytes, Ordering::AcqRel);
        self.inner.rate.record(bytes, self.inner.start.elapsed());
    }

    /// Stores the terminal outcome and latches the done signal. The
    /// first call wins; later calls are no-ops.
    pub(crate) fn finalize(&self, result: Result<(), DownloadError>) {
        if let Err(err) = result {
            let _ = self.inner.err.set(err);
        }
        let _ = self.inner.elapsed.set(self.inner.start.elapsed());
        let _ = self.inner.end.set(SystemTime::now());
        self.inner.done.send_replace(true);
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.request().url().as_str())
            .field("filename", &self.filename())
            .field("size_total", &self.size_total())
            .field("bytes_transferred", &self.bytes_transferred())
            .field("did_resume", &self.did_resume())
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

/// Exponential moving average of the byte rate, stored as atomics so
/// observers read it without locks. Only the transfer task records.
struct RateEstimator {
    rate_bits: AtomicU64,
    window_start_nanos: AtomicU64,
    window_bytes: AtomicU64,
}

impl RateEstimator {
    fn new() -> Self {
        Self {
            rate_bits: AtomicU64::new(0f64.to_bits()),
            window_start_nanos: AtomicU64::new(0),
            window_bytes: AtomicU64::new(0),
        }
    }

    fn record(&self, bytes: u64, since_start: Duration) {
        self.window_bytes.fetch_add(bytes, Ordering::Relaxed);

        let now = since_start.as_nanos() as u64;
        let window_start = self.window_start_nanos.load(Ordering::Relaxed);
        let dt = now.saturating_sub(window_start);
        if dt < RATE_SAMPLE_INTERVAL.as_nanos() as u64 {
            return;
        }

        let window_bytes = self.window_bytes.swap(0, Ordering::Relaxed);
        self.window_start_nanos.store(now, Ordering::Relaxed);

        let instantaneous = window_bytes as f64 / (dt as f64 / 1e9);
        let previous = f64::from_bits(self.rate_bits.load(Ordering::Relaxed));
        let next = if previous == 0.0 {
            instantaneous
        } else {
            previous + RATE_SMOOTHING * (instantaneous - previous)
        };
        self.rate_bits.store(next.to_bits(), Ordering::Relaxed);
    }

    fn current(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_response() -> Response {
        let request =
            Request::new("/tmp/out.bin", "https://example.com/a/b.iso").unwrap();
        Response::new(Arc::new(request))
    }

    #[tokio::test]
    async fn done_latches_and_wakes_all_observers() {
        let response = test_response();
        assert!(!response.is_done());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let r = response.clone();
                tokio::spawn(async move { r.done().await })
            })
            .collect();

        response.finalize(Ok(()));
        for w in waiters {
            w.await.unwrap();
        }
        assert!(response.is_done());

        // A late observer returns immediately.
        response.done().await;
    }

    #[test]
    fn err_is_hidden_until_done_and_stable_after() {
        let response = test_response();
        assert!(response.err().is_none());

        response.finalize(Err(DownloadError::Canceled));
        assert!(matches!(response.err(), Some(DownloadError::Canceled)));

        // A second finalize does not replace the terminal error.
        response.finalize(Ok(()));
        assert!(matches!(response.err(), Some(DownloadError::Canceled)));
    }

    #[test]
    fn progress_tracks_known_size() {
        let response = test_response();
        assert_eq!(response.progress(), 0.0);

        response.set_size_total(100);
        response.set_bytes_resumed(25);
        response.add_bytes_written(25);
        assert!((response.progress() - 0.5).abs() < f64::EPSILON);
        assert_eq!(response.bytes_transferred(), 50);
        assert_eq!(response.bytes_complete(), 25);
    }

    #[test]
    fn zero_length_resource_reports_complete() {
        let response = test_response();
        response.set_size_total(0);
        assert_eq!(response.progress(), 1.0);
    }

    #[test]
    fn rate_estimator_smooths_samples() {
        let rate = RateEstimator::new();
        rate.record(1000, Duration::from_millis(200));
        let first = rate.current();
        assert!(first > 0.0);

        rate.record(1000, Duration::from_millis(400));
        let second = rate.current();
        // Smoothed, not replaced wholesale.
        assert!(second > 0.0);
        assert!((second - first).abs() < first);
    }
}
