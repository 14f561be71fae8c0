//! haul — concurrent HTTP(S) download engine
//!
//! `haul` turns a declarative [`Request`] into a live, observable
//! transfer: streaming to disk or a caller-supplied sink, range resume
//! of interrupted downloads, checksum verification, cooperative
//! cancellation and optional rate limiting. It is built for workloads
//! like package mirrors and ISO repositories, where long-running
//! processes pull many large immutable files in parallel over a shared
//! connection pool.
//!
//! # Example
//!
//! ```no_run
//! use haul::{Client, Request};
//!
//! # async fn example() -> Result<(), haul::DownloadError> {
//! let client = Client::new();
//! let request = Request::new("downloads", "https://example.com/a/b/c.iso")?;
//!
//! let response = client.download(request).await;
//! // Observe progress from any task while the body streams.
//! println!("{:.1}% of {}", 100.0 * response.progress(), response.size_total());
//!
//! response.done().await;
//! if let Some(err) = response.err() {
//!     eprintln!("download failed: {err}");
//! }
//! # Ok(())
//! # }
//! ```

mod batch;
mod filename;
mod transfer;

pub mod client;
pub mod error;
pub mod rate;
pub mod request;
pub mod response;
pub mod verify;

pub use client::{get, Client, ClientBuilder, DEFAULT_BUFFER_SIZE};
pub use error::DownloadError;
pub use rate::{RateLimiter, TokenBucket};
pub use request::{ByteSink, Hook, Request};
pub use response::{HttpSnapshot, Response};
pub use verify::Hasher;
