//! Example: decay, embedding and semantic pruning over a short conversation.
//!
//! Run with: `cargo run --example basic_pipeline`
//! Set `RUST_LOG=textile=debug` to see per-step decisions.

use std::sync::Arc;
use textile::embeddings::{CachedEmbedder, HashEmbedding};
use textile::hooks::MetricsCollector;
use textile::transformers::{DecayTransformer, EmbedMessages, SemanticPruneTransformer};
use textile::{shared_cache, ConversationSnapshot, Message, Pipeline, TurnState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Offline embeddings; swap in OllamaEmbedding for real vectors.
    let embedder = CachedEmbedder::new(Arc::new(HashEmbedding::new(256)), shared_cache());
    let metrics = Arc::new(MetricsCollector::new());

    let pipeline = Pipeline::builder()
        .transformer(EmbedMessages::new(embedder))
        .transformer(SemanticPruneTransformer::new(0.1)?)
        .transformer(DecayTransformer::new(6, 0.1, 2)?)
        .on_metric(metrics.clone())
        .build()?;

    let snapshot = ConversationSnapshot::from_messages(vec![
        Message::system("You are a travel assistant."),
        Message::user("Find me flights from Seattle to Tokyo").at_turn(0),
        Message::assistant("There are three direct flights from Seattle to Tokyo tomorrow.")
            .at_turn(0),
        Message::user("What's a good sushi recipe?").at_turn(1),
        Message::assistant("Start with short-grain rice seasoned with vinegar.").at_turn(1),
        Message::user("Which of those flights is cheapest?").at_turn(2),
    ])?;
    let state = TurnState::new("Which of those flights is cheapest?", 2);

    let out = pipeline.run_async(snapshot, state).await?;

    println!("Kept {} messages:", out.snapshot.len());
    for msg in out.snapshot.messages() {
        println!("  [{}] {:.2} {}", msg.role(), msg.metadata.prominence(), msg.content());
    }

    let summary = metrics.summary();
    println!(
        "\n{} steps ({} skipped), {} messages removed, {:.3}ms average",
        summary.total_executions,
        summary.skipped,
        summary.total_messages_removed,
        summary.avg_duration_ms
    );
    Ok(())
}
