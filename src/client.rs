//! The download client.
//!
//! A [`Client`] owns a shared HTTP transport (connection pool, redirect
//! policy, TLS) and default configuration, and acts as the factory for
//! transfers. Cloning is cheap; clones share the transport.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;

use crate::batch;
use crate::error::{DownloadError, Result};
use crate::request::Request;
use crate::response::Response;
use crate::transfer::Transfer;

/// Default copy-buffer size: 32 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

const DEFAULT_USER_AGENT: &str = concat!("haul/", env!("CARGO_PKG_VERSION"));

/// Factory for transfers, sharing one HTTP transport across all of
/// them.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    buffer_size: usize,
}

impl Client {
    /// Creates a client with the default transport and configuration.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .user_agent(DEFAULT_USER_AGENT)
                .build()
                .unwrap_or_default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Starts building a customized client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Dispatches one transfer asynchronously.
    ///
    /// Returns as soon as the connection phase resolves (through the
    /// `before_copy` hook point) or fails; the body copy continues in
    /// its own task. The returned [`Response`] never blocks on body
    /// bytes — observe progress through its counters and await
    /// [`Response::done`] for the terminal state. Errors, including
    /// connection-phase errors, surface via [`Response::err`].
    pub async fn download(&self, request: Request) -> Response {
        let request = Arc::new(request);
        let response = Response::new(request.clone());
        let transfer = Transfer::new(
            self.http.clone(),
            self.buffer_size,
            request,
            response.clone(),
        );

        match transfer.connect().await {
            Ok(prepared) => {
                tokio::spawn(transfer.run(prepared));
            }
            Err(err) => transfer.finish(Err(err)).await,
        }

        response
    }

    /// Reads requests from `requests` and emits each completed
    /// [`Response`] on `responses`, one transfer at a time.
    ///
    /// Returns once the input channel is closed and the last transfer
    /// has finalized. For concurrent execution use
    /// [`Client::download_batch`], which multiplexes several of these
    /// workers over shared channels.
    pub async fn download_channel(
        &self,
        requests: mpsc::Receiver<Request>,
        responses: mpsc::Sender<Response>,
    ) {
        batch::run(self.clone(), 1, requests, responses).await;
    }

    /// Downloads a fixed set of requests with `workers` concurrent
    /// transfers (`workers == 0` means one per request). The returned
    /// stream carries each response exactly once, in completion order,
    /// and closes after the last transfer finalizes.
    pub fn download_batch(
        &self,
        workers: usize,
        requests: Vec<Request>,
    ) -> mpsc::Receiver<Response> {
        let capacity = requests.len().max(1);
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (response_tx, response_rx) = mpsc::channel(capacity);

        for request in requests {
            // Capacity covers every request, so this cannot fail.
            let _ = request_tx.try_send(request);
        }
        drop(request_tx);

        let client = self.clone();
        tokio::spawn(async move {
            batch::run(client, workers, request_rx, response_tx).await;
        });

        response_rx
    }

    /// The underlying HTTP transport.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a customized [`Client`].
pub struct ClientBuilder {
    user_agent: String,
    buffer_size: usize,
    http: Option<reqwest::Client>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            http: None,
        }
    }

    /// Overrides the user agent sent with every request.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Overrides the default copy-buffer size for transfers that do
    /// not set their own.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Supplies a pre-configured transport (proxies, timeouts, redirect
    /// policy, cookie jar). The user agent set on this builder is
    /// ignored in that case.
    #[must_use]
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// # Errors
    ///
    /// Returns [`DownloadError::Transport`] when the underlying HTTP
    /// client fails to initialize.
    pub fn build(self) -> Result<Client> {
        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .user_agent(self.user_agent)
                .build()
                .map_err(DownloadError::Transport)?,
        };
        Ok(Client {
            http,
            buffer_size: self.buffer_size,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Downloads `url` to `destination` with the shared default client.
///
/// One-shot convenience for callers that do not need custom
/// configuration:
///
/// ```no_run
/// # async fn example() -> Result<(), haul::DownloadError> {
/// let response = haul::get(".", "https://example.com/archive.tar.gz").await?;
/// response.done().await;
/// # Ok(())
/// # }
/// ```
pub async fn get(destination: impl Into<PathBuf>, url: &str) -> Result<Response> {
    static DEFAULT: OnceLock<Client> = OnceLock::new();
    let client = DEFAULT.get_or_init(Client::new);
    let request = Request::new(destination, url)?;
    Ok(client.download(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_buffer_size() {
        let client = Client::builder().buffer_size(0).build().unwrap();
        assert_eq!(client.buffer_size, 1);
    }

    #[test]
    fn default_client_uses_package_user_agent() {
        assert!(DEFAULT_USER_AGENT.starts_with("haul/"));
        let _ = Client::new();
    }
}
