//! Bounded-concurrency dispatch over a stream of requests.
//!
//! Workers pull requests from a shared channel, run each transfer to
//! completion, and forward the finished responses downstream. Output
//! order is completion order, not submission order.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::client::Client;
use crate::request::Request;
use crate::response::Response;

/// Drains `requests`, keeping at most `workers` transfers in flight
/// (`workers == 0` spawns one task per request). Returns when the
/// input channel has closed and the last worker has exited; dropping
/// the final `responses` sender then closes the output stream.
pub(crate) async fn run(
    client: Client,
    workers: usize,
    mut requests: mpsc::Receiver<Request>,
    responses: mpsc::Sender<Response>,
) {
    let mut tasks = Vec::new();

    if workers == 0 {
        // Unbounded fanout: every request gets its own task as soon as
        // it arrives.
        while let Some(request) = requests.recv().await {
            let client = client.clone();
            let responses = responses.clone();
            tasks.push(tokio::spawn(async move {
                let response = client.download(request).await;
                response.done().await;
                let _ = responses.send(response).await;
            }));
        }
    } else {
        let requests = Arc::new(Mutex::new(requests));
        for _ in 0..workers {
            let client = client.clone();
            let requests = requests.clone();
            let responses = responses.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    // Hold the lock only for the pull, so the other
                    // workers stay busy during the transfer.
                    let request = { requests.lock().await.recv().await };
                    let Some(request) = request else { break };

                    let response = client.download(request).await;
                    response.done().await;
                    if responses.send(response).await.is_err() {
                        break;
                    }
                }
            }));
        }
    }

    drop(responses);
    for joined in join_all(tasks).await {
        if let Err(e) = joined {
            warn!(error = %e, "batch worker terminated abnormally");
        }
    }
}
