//! Resolution of the local filename for a transfer.
//!
//! When the destination is a directory, the filename is chosen from the
//! server's `Content-Disposition` header, falling back to the last path
//! segment of the final (post-redirect) URL. Candidates are sanitized
//! before use so a hostile header can never escape the destination
//! directory.

use reqwest::header::{HeaderMap, CONTENT_DISPOSITION};
use reqwest::Url;

use crate::error::{DownloadError, Result};

/// Picks the filename for a directory destination.
///
/// Preference order: `Content-Disposition` filename, then the last path
/// segment of `final_url`. Returns [`DownloadError::NoFilename`] when
/// neither source yields a candidate and [`DownloadError::IllegalFilename`]
/// when the winning candidate does not survive sanitization.
pub(crate) fn resolve(headers: &HeaderMap, final_url: &Url) -> Result<String> {
    if let Some(candidate) = from_headers(headers) {
        return sanitize(&candidate);
    }
    match from_url(final_url) {
        Some(candidate) => sanitize(&candidate),
        None => Err(DownloadError::NoFilename),
    }
}

/// Extracts the `filename=` parameter from a `Content-Disposition` header.
///
/// Both quoted and bare forms are accepted; the RFC 5987 `filename*`
/// form is ignored.
pub(crate) fn from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;

    for part in value.split(';') {
        let part = part.trim();
        let Some(raw) = part.strip_prefix("filename=") else {
            continue;
        };
        let raw = raw.trim().trim_matches('"').trim();
        if !raw.is_empty() {
            return Some(raw.to_string());
        }
    }
    None
}

/// Takes the last non-empty path segment of a URL.
pub(crate) fn from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    Some(segment.to_string())
}

/// Validates a candidate filename.
///
/// A candidate must be non-empty, must not be `.` or `..`, and must not
/// contain path separators or NUL after trimming.
pub(crate) fn sanitize(candidate: &str) -> Result<String> {
    let name = candidate.trim();

    if name.is_empty() || name == "." || name == ".." {
        return Err(DownloadError::IllegalFilename(candidate.to_string()));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(DownloadError::IllegalFilename(candidate.to_string()));
    }

    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn disposition(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_DISPOSITION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn filename_from_quoted_disposition() {
        let headers = disposition("attachment; filename=\"report.pdf\"");
        assert_eq!(from_headers(&headers).as_deref(), Some("report.pdf"));
    }

    #[test]
    fn filename_from_bare_disposition() {
        let headers = disposition("attachment; filename=archive.tar.gz");
        assert_eq!(from_headers(&headers).as_deref(), Some("archive.tar.gz"));
    }

    #[test]
    fn disposition_without_filename_is_ignored() {
        let headers = disposition("inline");
        assert_eq!(from_headers(&headers), None);
    }

    #[test]
    fn filename_from_url_takes_last_segment() {
        let url = Url::parse("https://example.com/a/b/c.txt").unwrap();
        assert_eq!(from_url(&url).as_deref(), Some("c.txt"));

        let url = Url::parse("https://example.com/a/b/").unwrap();
        assert_eq!(from_url(&url).as_deref(), Some("b"));

        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(from_url(&url), None);
    }

    #[test]
    fn sanitize_rejects_traversal_and_separators() {
        assert!(sanitize("ok.iso").is_ok());
        assert!(matches!(
            sanitize(".."),
            Err(DownloadError::IllegalFilename(_))
        ));
        assert!(matches!(
            sanitize("."),
            Err(DownloadError::IllegalFilename(_))
        ));
        assert!(matches!(
            sanitize(""),
            Err(DownloadError::IllegalFilename(_))
        ));
        assert!(matches!(
            sanitize("a/b"),
            Err(DownloadError::IllegalFilename(_))
        ));
        assert!(matches!(
            sanitize("a\\b"),
            Err(DownloadError::IllegalFilename(_))
        ));
    }

    #[test]
    fn resolve_prefers_disposition_over_url() {
        let url = Url::parse("https://example.com/pkg/download").unwrap();
        let headers = disposition("attachment; filename=\"pkg-1.2.3.tar.gz\"");
        assert_eq!(resolve(&headers, &url).unwrap(), "pkg-1.2.3.tar.gz");

        let empty = HeaderMap::new();
        assert_eq!(resolve(&empty, &url).unwrap(), "download");
    }

    #[test]
    fn resolve_without_any_source_fails() {
        let url = Url::parse("https://example.com/").unwrap();
        let empty = HeaderMap::new();
        assert!(matches!(
            resolve(&empty, &url),
            Err(DownloadError::NoFilename)
        ));
    }

    #[test]
    fn hostile_disposition_cannot_escape_the_directory() {
        let url = Url::parse("https://example.com/a.txt").unwrap();
        let headers = disposition("attachment; filename=\"../../etc/passwd\"");
        assert!(matches!(
            resolve(&headers, &url),
            Err(DownloadError::IllegalFilename(_))
        ));
    }
}
