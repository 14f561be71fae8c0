//! The transfer state machine.
//!
//! One [`Transfer`] drives a single request to its terminal state:
//! stat the destination, negotiate range resume with the server, stream
//! the body with admission control and progress accounting, validate
//! length and checksum, and latch the done signal. The connection phase
//! runs inline in [`Client::download`](crate::Client::download); the
//! body copy runs in its own task.

use std::path::PathBuf;
use std::time::SystemTime;

use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, LAST_MODIFIED, RANGE};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{DownloadError, Result};
use crate::filename;
use crate::request::{ByteSink, Destination, Request};
use crate::response::Response;
use crate::verify::{self, Hasher};

pub(crate) struct Transfer {
    http: reqwest::Client,
    buffer_size: usize,
    request: Arc<Request>,
    response: Response,
}

/// Everything the body-copy task needs, assembled by the connection
/// phase. `body` is `None` when the transfer short-circuited and there
/// is nothing left to stream.
pub(crate) struct Prepared {
    body: Option<reqwest::Response>,
    file: Option<tokio::fs::File>,
    sink: Option<Box<dyn ByteSink>>,
    stream_hasher: Option<Box<dyn Hasher>>,
    last_modified: Option<SystemTime>,
}

impl Prepared {
    fn short_circuit() -> Self {
        Self {
            body: None,
            file: None,
            sink: None,
            stream_hasher: None,
            last_modified: None,
        }
    }
}

/// What the destination looks like on disk before the request goes out.
#[derive(Default)]
struct DestPlan {
    /// Set when the destination is an existing directory; the filename
    /// is then subject to server-side resolution.
    dir: Option<PathBuf>,
    /// Concrete target file. Tentative while `dir` is set.
    path: Option<PathBuf>,
    /// Length of an existing regular file at `path`.
    existing_len: Option<u64>,
}

impl Transfer {
    pub(crate) fn new(
        http: reqwest::Client,
        default_buffer_size: usize,
        request: Arc<Request>,
        response: Response,
    ) -> Self {
        let buffer_size = request.buffer_size.unwrap_or(default_buffer_size).max(1);
        Self {
            http,
            buffer_size,
            request,
            response,
        }
    }

    /// Runs the phases up to and including the `before_copy` hook:
    /// stat, optional HEAD probe, range negotiation, file open.
    pub(crate) async fn connect(&self) -> Result<Prepared> {
        let req = &*self.request;
        if req.cancel.is_cancelled() {
            return Err(DownloadError::Canceled);
        }

        let mut plan = self.stat_destination().await?;

        // A declared size lets an already-complete file skip the
        // network entirely; checksum policy still runs in validation.
        if let Some(size) = req.size
            && req.resume_allowed()
            && plan.existing_len == Some(size)
            && let Some(path) = plan.path.clone()
        {
            debug!(url = %req.url, path = %path.display(), "local file already complete");
            self.mark_resumed_complete(path, size);
            return Ok(Prepared::short_circuit());
        }

        if self.should_probe(&plan)
            && let Some(size) = self.probe(&mut plan).await?
        {
            match plan.existing_len {
                Some(len) if req.resume_allowed() && len == size => {
                    if let Some(path) = plan.path.clone() {
                        debug!(url = %req.url, path = %path.display(), "local file already complete");
                        self.mark_resumed_complete(path, size);
                        return Ok(Prepared::short_circuit());
                    }
                }
                // A local file longer than the remote resource cannot
                // be extended; restart it.
                Some(len) if len > size => plan.existing_len = None,
                _ => {}
            }
        }

        let resume_from = if req.resume_allowed() {
            plan.existing_len.unwrap_or(0)
        } else {
            0
        };

        let mut builder = self
            .http
            .request(req.method.clone(), req.url.clone())
            .headers(req.headers.clone());
        if resume_from > 0 {
            builder = builder.header(RANGE, format!("bytes={resume_from}-"));
        }

        let http_response = tokio::select! {
            _ = req.cancel.cancelled() => return Err(DownloadError::Canceled),
            sent = builder.send() => sent.map_err(DownloadError::Transport)?,
        };

        self.accept(http_response, plan, resume_from).await
    }

    /// Interprets the server reply, resolves the final filename, opens
    /// the local file and fires `before_copy`.
    async fn accept(
        &self,
        http_response: reqwest::Response,
        plan: DestPlan,
        resume_from: u64,
    ) -> Result<Prepared> {
        let req = &*self.request;
        let status = http_response.status();
        let headers = http_response.headers().clone();
        let final_url = http_response.url().clone();

        let mut did_resume = false;
        let mut bytes_resumed = 0u64;
        let mut size_total = None;
        let mut complete = false;

        if status == StatusCode::PARTIAL_CONTENT {
            did_resume = true;
            bytes_resumed = resume_from;
            match parse_content_range(&headers) {
                Some(range) => {
                    if range.start != resume_from {
                        return Err(DownloadError::BadLength {
                            expected: resume_from,
                            actual: range.start,
                        });
                    }
                    size_total = range
                        .total
                        .or_else(|| content_length(&headers).map(|l| resume_from + l));
                }
                None => {
                    size_total = content_length(&headers).map(|l| resume_from + l);
                }
            }
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE && resume_from > 0 {
            // The local file is at least as long as the remote
            // resource; equal lengths mean it is already complete.
            let total = parse_unsatisfied_range(&headers);
            match (total, plan.existing_len) {
                (Some(total), Some(len)) if len == total => {
                    did_resume = true;
                    bytes_resumed = len;
                    size_total = Some(total);
                    complete = true;
                }
                (Some(total), len) => {
                    return Err(DownloadError::BadLength {
                        expected: total,
                        actual: len.unwrap_or(0),
                    });
                }
                (None, _) => return Err(DownloadError::BadStatusCode(status)),
            }
        } else if status.is_success() {
            if resume_from > 0 {
                debug!(url = %req.url, "server ignored the range header, restarting");
            }
            size_total = content_length(&headers);
        } else {
            return Err(DownloadError::BadStatusCode(status));
        }

        let final_path = self.resolve_final_path(&plan, &headers, &final_url, did_resume)?;

        if let Some(path) = &final_path {
            self.response.set_filename(path.clone());
        }
        self.response.set_bytes_resumed(bytes_resumed);
        self.response.set_did_resume(did_resume);
        if let Some(total) = size_total {
            self.response.set_size_total(total);
        }
        self.response.set_http(status, headers.clone());

        if let Some(hook) = &req.before_copy {
            hook(&self.response).map_err(DownloadError::Hook)?;
        }

        if complete {
            return Ok(Prepared::short_circuit());
        }

        let file = match &final_path {
            Some(path) if !req.no_store => Some(self.open_file(path, bytes_resumed > 0).await?),
            _ => None,
        };
        let sink = req.take_sink();
        let stream_hasher = if sink.is_some() || req.no_store {
            req.take_hasher()
        } else {
            None
        };
        let last_modified = parse_last_modified(&headers);

        Ok(Prepared {
            body: Some(http_response),
            file,
            sink,
            stream_hasher,
            last_modified,
        })
    }

    /// Spawned continuation: body copy, validation, finalization.
    pub(crate) async fn run(self, prepared: Prepared) {
        let result = self.execute_body(prepared).await;
        self.finish(result).await;
    }

    async fn execute_body(&self, mut prepared: Prepared) -> Result<()> {
        let mut result = match prepared.body.take() {
            Some(body) => self.copy_body(body, &mut prepared).await,
            None => Ok(()),
        };

        // Flush and release the file handle before validation re-reads
        // the content from disk.
        if let Some(mut file) = prepared.file.take() {
            if let Err(e) = file.flush().await
                && result.is_ok()
            {
                result = Err(DownloadError::FileSystem(e));
            }
            if result.is_ok()
                && let Some(modified) = prepared.last_modified
            {
                let file = file.into_std().await;
                let _ = file.set_modified(modified);
            }
        }

        if result.is_ok() {
            result = self.validate(prepared.stream_hasher.take()).await;
        }

        if let Some(hook) = &self.request.after_copy {
            let hook_result = hook(&self.response);
            if result.is_ok() {
                result = hook_result.map_err(DownloadError::Hook);
            }
        }

        result
    }

    async fn copy_body(
        &self,
        mut body: reqwest::Response,
        prepared: &mut Prepared,
    ) -> Result<()> {
        let req = &*self.request;

        loop {
            let chunk = tokio::select! {
                _ = req.cancel.cancelled() => return Err(DownloadError::Canceled),
                read = body.chunk() => match read {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(_) if req.cancel.is_cancelled() => return Err(DownloadError::Canceled),
                    Err(e) => return Err(DownloadError::Transport(e)),
                },
            };

            // Slices bound the admission granularity and the
            // cancellation latency to one buffer of I/O.
            for piece in chunk.chunks(self.buffer_size) {
                if req.cancel.is_cancelled() {
                    return Err(DownloadError::Canceled);
                }
                if let Some(limiter) = &req.rate_limiter {
                    limiter.wait_n(piece.len(), &req.cancel).await?;
                }
                if let Some(file) = prepared.file.as_mut() {
                    file.write_all(piece).await.map_err(write_error)?;
                } else if let Some(sink) = prepared.sink.as_mut() {
                    sink.write_all(piece).await.map_err(write_error)?;
                }
                if let Some(hasher) = prepared.stream_hasher.as_mut() {
                    hasher.update(piece);
                }
                self.response.add_bytes_written(piece.len() as u64);
            }
        }

        Ok(())
    }

    async fn validate(&self, stream_hasher: Option<Box<dyn Hasher>>) -> Result<()> {
        let req = &*self.request;

        if let Some(total) = self.response.size_total_known() {
            let transferred = self.response.bytes_transferred();
            if transferred != total {
                return Err(DownloadError::BadLength {
                    expected: total,
                    actual: transferred,
                });
            }
        }

        let Some(expected) = &req.checksum else {
            // A hasher without an expected digest is computed and
            // discarded.
            if let Some(hasher) = stream_hasher {
                let _ = hasher.finish();
            }
            return Ok(());
        };

        let digest = match (stream_hasher, self.response.filename()) {
            // Sink and no-store transfers hashed the stream directly.
            (Some(hasher), _) => hasher.finish(),
            // Path destinations hash the final file from disk, which
            // also covers resumed bytes the loop never saw.
            (None, Some(path)) => {
                let Some(hasher) = req.take_hasher() else {
                    return Ok(());
                };
                verify::hash_file(path, hasher, self.buffer_size).await?
            }
            (None, None) => return Ok(()),
        };

        if !verify::constant_time_eq(&digest, expected) {
            return Err(DownloadError::ChecksumMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(digest),
            });
        }

        Ok(())
    }

    /// Terminal bookkeeping: partial-file deletion policy, tracing,
    /// done-signal latch. Called exactly once per transfer.
    pub(crate) async fn finish(&self, result: Result<()>) {
        match &result {
            Ok(()) => {
                debug!(
                    url = %self.request.url,
                    bytes = self.response.bytes_transferred(),
                    "transfer complete"
                );
            }
            Err(err) => {
                debug!(url = %self.request.url, error = %err, "transfer failed");
                // Cancellation keeps the partial file so the next
                // dispatch can resume it cheaply.
                if self.request.delete_on_error
                    && !err.is_canceled()
                    && !self.request.no_store
                    && let Some(path) = self.response.filename()
                    && let Err(e) = tokio::fs::remove_file(path).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to remove file after error"
                    );
                }
            }
        }
        self.response.finalize(result);
    }

    async fn stat_destination(&self) -> Result<DestPlan> {
        let req = &*self.request;
        let mut plan = DestPlan::default();

        let Destination::Path(path) = &req.destination else {
            return Ok(plan);
        };
        if req.no_store {
            return Ok(plan);
        }

        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {
                plan.dir = Some(path.clone());
                if let Some(segment) = filename::from_url(&req.url)
                    && let Ok(name) = filename::sanitize(&segment)
                {
                    let candidate = path.join(name);
                    plan.existing_len = stat_file_len(&candidate).await?;
                    plan.path = Some(candidate);
                }
            }
            Ok(meta) if meta.is_file() => {
                plan.existing_len = Some(meta.len());
                plan.path = Some(path.clone());
            }
            Ok(_) => {
                return Err(DownloadError::BadDestination(format!(
                    "{} is neither a file nor a directory",
                    path.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                plan.path = Some(path.clone());
            }
            Err(e) => return Err(DownloadError::FileSystem(e)),
        }

        Ok(plan)
    }

    fn should_probe(&self, plan: &DestPlan) -> bool {
        let req = &*self.request;
        if req.method != Method::GET || req.no_store || req.is_sink() {
            return false;
        }
        // A directory destination with no usable URL segment needs the
        // server's headers before anything can be statted.
        if plan.dir.is_some() && plan.path.is_none() {
            return true;
        }
        // A partial file with no declared size needs the remote length
        // to decide between short-circuit, resume, and restart.
        req.size.is_none() && req.resume_allowed() && plan.existing_len.unwrap_or(0) > 0
    }

    /// HEAD probe. Resolves the filename for directory destinations and
    /// returns the remote size when the server reports one. Probe
    /// failures are non-fatal; the GET remains authoritative.
    async fn probe(&self, plan: &mut DestPlan) -> Result<Option<u64>> {
        let req = &*self.request;
        let probe = self
            .http
            .head(req.url.clone())
            .headers(req.headers.clone())
            .send();

        let head_response = tokio::select! {
            _ = req.cancel.cancelled() => return Err(DownloadError::Canceled),
            sent = probe => match sent {
                Ok(r) if r.status().is_success() => r,
                _ => return Ok(None),
            },
        };

        if let Some(dir) = &plan.dir {
            match filename::resolve(head_response.headers(), head_response.url()) {
                Ok(name) => {
                    let candidate = dir.join(name);
                    if plan.path.as_ref() != Some(&candidate) {
                        plan.existing_len = stat_file_len(&candidate).await?;
                        plan.path = Some(candidate);
                    }
                }
                Err(e @ DownloadError::IllegalFilename(_)) => return Err(e),
                // Leave the URL-derived candidate in place; the GET
                // response gets another chance to resolve it.
                Err(_) => {}
            }
        }

        Ok(content_length(head_response.headers()))
    }

    fn resolve_final_path(
        &self,
        plan: &DestPlan,
        headers: &HeaderMap,
        final_url: &reqwest::Url,
        did_resume: bool,
    ) -> Result<Option<PathBuf>> {
        let req = &*self.request;
        if req.is_sink() || req.no_store {
            return Ok(None);
        }

        match (&plan.path, &plan.dir) {
            // A range was issued for this exact file; the name sticks
            // even if the server advertises another.
            (Some(path), _) if did_resume => Ok(Some(path.clone())),
            (_, Some(dir)) => {
                let name = filename::resolve(headers, final_url).or_else(|err| {
                    // No header, no URL segment: fall back to the
                    // pre-request candidate when one exists.
                    match (&plan.path, err) {
                        (Some(path), DownloadError::NoFilename) => path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .ok_or(DownloadError::NoFilename),
                        (_, err) => Err(err),
                    }
                })?;
                Ok(Some(dir.join(name)))
            }
            (Some(path), None) => Ok(Some(path.clone())),
            (None, None) => Err(DownloadError::BadDestination(
                "destination path could not be resolved".into(),
            )),
        }
    }

    fn mark_resumed_complete(&self, path: PathBuf, size: u64) {
        self.response.set_filename(path);
        self.response.set_bytes_resumed(size);
        self.response.set_did_resume(true);
        self.response.set_size_total(size);
    }

    async fn open_file(&self, path: &std::path::Path, append: bool) -> Result<tokio::fs::File> {
        let req = &*self.request;

        if !req.no_create_directories
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true);
        if append {
            options.append(true);
        } else {
            options.truncate(true);
        }
        Ok(options.open(path).await?)
    }
}

fn write_error(e: std::io::Error) -> DownloadError {
    if e.kind() == std::io::ErrorKind::WriteZero {
        DownloadError::ShortWrite
    } else {
        DownloadError::FileSystem(e)
    }
}

async fn stat_file_len(path: &std::path::Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Err(DownloadError::BadDestination(format!(
            "{} exists and is not a file",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DownloadError::FileSystem(e)),
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
}

struct ContentRange {
    start: u64,
    total: Option<u64>,
}

/// Parses `Content-Range: bytes <start>-<end>/<total|*>`.
fn parse_content_range(headers: &HeaderMap) -> Option<ContentRange> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let (start, _) = range.split_once('-')?;
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        total,
    })
}

/// Parses the total from a 416 reply: `Content-Range: bytes */<total>`.
fn parse_unsatisfied_range(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    if range.trim() != "*" {
        return None;
    }
    total.trim().parse().ok()
}

fn parse_last_modified(headers: &HeaderMap) -> Option<SystemTime> {
    let value = headers.get(LAST_MODIFIED)?.to_str().ok()?;
    let parsed = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    Some(SystemTime::from(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers_with(name: reqwest::header::HeaderName, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn content_range_with_total() {
        let headers = headers_with(CONTENT_RANGE, "bytes 6-10/11");
        let range = parse_content_range(&headers).unwrap();
        assert_eq!(range.start, 6);
        assert_eq!(range.total, Some(11));
    }

    #[test]
    fn content_range_with_unknown_total() {
        let headers = headers_with(CONTENT_RANGE, "bytes 100-199/*");
        let range = parse_content_range(&headers).unwrap();
        assert_eq!(range.start, 100);
        assert_eq!(range.total, None);
    }

    #[test]
    fn content_range_garbage_is_none() {
        let headers = headers_with(CONTENT_RANGE, "pages 1-2/3");
        assert!(parse_content_range(&headers).is_none());
        assert!(parse_content_range(&HeaderMap::new()).is_none());
    }

    #[test]
    fn unsatisfied_range_total() {
        let headers = headers_with(CONTENT_RANGE, "bytes */11");
        assert_eq!(parse_unsatisfied_range(&headers), Some(11));

        let headers = headers_with(CONTENT_RANGE, "bytes 0-5/11");
        assert_eq!(parse_unsatisfied_range(&headers), None);
    }

    #[test]
    fn content_length_parses_header() {
        let headers = headers_with(CONTENT_LENGTH, "1024");
        assert_eq!(content_length(&headers), Some(1024));

        let headers = headers_with(CONTENT_LENGTH, "not-a-number");
        assert_eq!(content_length(&headers), None);
    }

    #[test]
    fn last_modified_parses_rfc2822() {
        let headers = headers_with(LAST_MODIFIED, "Wed, 21 Oct 2015 07:28:00 GMT");
        assert!(parse_last_modified(&headers).is_some());

        let headers = headers_with(LAST_MODIFIED, "yesterday");
        assert!(parse_last_modified(&headers).is_none());
    }
}
