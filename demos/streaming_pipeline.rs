//! Example: stream a completion through the pipeline with response patterns.
//!
//! Uses `MockBackend` so it runs offline. Point `OllamaBackend` at a local
//! server to stream from a real model.
//!
//! Run with: `cargo run --example streaming_pipeline`

use futures::StreamExt;
use std::io::Write;
use std::sync::Arc;
use textile::backend::{ChatMessage, MockBackend};
use textile::completion::CompletionClient;
use textile::patterns::ResponsePattern;
use textile::transformers::DecayTransformer;
use textile::{Pipeline, Role};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let backend = Arc::new(MockBackend::fixed(
        "Sure <USER>, your appointment is confirmed. Call <PHONE_1> to reschedule.",
    ));

    let client = CompletionClient::builder(backend, "llama3.2")
        .pipeline(Pipeline::builder().transformer(DecayTransformer::new(3, 0.1, 2)?).build()?)
        .pattern(ResponsePattern::literal("<USER>", "Ada")?)
        .pattern(ResponsePattern::with(r"<PHONE_(\d+)>", |c| format!("555-010{}", &c[1]))?)
        .build();

    let messages = vec![
        ChatMessage::new(Role::System, "You book appointments."),
        ChatMessage::new(Role::User, "Book me for Tuesday at 10."),
    ];

    let response = client.stream(messages, Vec::new()).await?;
    println!("Sent {} messages", response.context.snapshot.len());

    let mut chunks = response.chunks;
    let mut stdout = std::io::stdout();
    while let Some(chunk) = chunks.next().await {
        write!(stdout, "{}", chunk?.delta)?;
        stdout.flush()?;
    }
    println!();
    Ok(())
}
