//! In-process streaming example.
//!
//! A simulated model answer and a background lookup write to the same
//! stream concurrently; the client rebuilds the message and prints it
//! after every update.
//!
//! Run with:
//! ```bash
//! RUST_LOG=partstream=debug cargo run --example pipeline
//! ```

use std::time::Duration;

use futures::{stream, StreamExt};
use partstream::prelude::*;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("🌊 partstream pipeline example\n");

    let mut frames = ui_message_stream(WriterSettings::new(), |writer| async move {
        writer
            .write_data("weather", "w1", json!({"city": "Berlin", "status": "loading"}))
            .await?;

        let lookup = writer.clone();
        let background = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            lookup
                .write_data("weather", "w1", json!({"city": "Berlin", "status": "done", "temp": 12}))
                .await
        });

        let answer = ["It is ", "12°C ", "in Berlin ", "right now."]
            .into_iter()
            .map(|delta| Ok::<_, StreamError>(GenerationFragment::TextDelta(delta.to_string())));
        let paced = stream::iter(answer).then(|fragment| async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            fragment
        });
        writer.merge_generation(Box::pin(paced), GenerationOptions::default())?;

        background.await.map_err(StreamError::from_err)?
    });

    let mut client = UiMessageClient::default();
    while let Some(frame) = frames.next().await {
        for message in client.feed(&frame)? {
            let data = message
                .data_parts("weather")
                .next()
                .map(|p| p.data.to_string())
                .unwrap_or_default();
            println!("[{:?}] text={:?} weather={}", message.status, message.text(), data);
        }
    }

    for message in client.messages() {
        println!("\n✅ {} finished as {:?}: {}", message.id, message.status, message.text());
    }

    Ok(())
}
