use std::time::Duration;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

use haul::{Client, Request};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration
    let url = "https://proof.ovh.net/files/10Mb.dat";
    let output_dir = ".";

    println!("Starting example download...");
    println!("URL: {}", url);

    // 1. Setup the client (shared connection pool, custom user agent)
    let client = Client::builder().user_agent("haul-example/0.1").build()?;

    // 2. Build and dispatch the request
    let request = Request::new(output_dir, url)?;
    let response = client.download(request).await;

    // 3. Drive a progress bar off the live counters
    let pb = ProgressBar::new(response.size_total());
    pb.set_style(
        ProgressStyle::with_template(
            "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )?
        .progress_chars("=>-"),
    );
    pb.set_message("Downloading");

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = response.done() => break,
            _ = ticker.tick() => {
                pb.set_position(response.bytes_transferred());
            }
        }
    }
    pb.finish_with_message("Done");

    // 4. Surface the outcome
    if let Some(err) = response.err() {
        eprintln!("Download failed: {err}");
        return Ok(());
    }

    println!(
        "Downloaded {} bytes to {} in {:.1}s",
        response.bytes_transferred(),
        response
            .filename()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        response.duration().as_secs_f64(),
    );

    Ok(())
}
