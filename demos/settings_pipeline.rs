//! Example: build a pipeline from JSON settings and inspect the debug trace.
//!
//! Run with: `cargo run --example settings_pipeline`

use std::sync::Arc;
use textile::embeddings::HashEmbedding;
use textile::{ConversationSnapshot, Message, PipelineSettings, TurnState};

const SETTINGS: &str = r#"{
    "transformers": [
        { "kind": "decay", "half_life_turns": 2, "threshold": 0.2, "min_recent_messages": 1 },
        { "kind": "embed_messages" },
        { "kind": "tool_selection", "max_tools": 1, "threshold": 0.0 }
    ],
    "reinstate": "most_recent",
    "step_timeout_ms": 500,
    "cache": { "max_entries": 1000, "ttl_secs": 600 }
}"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let settings = PipelineSettings::from_json_str(SETTINGS)?;
    let pipeline = settings.build(Some(Arc::new(HashEmbedding::new(128))))?;
    println!("{:?}", pipeline);

    let tools = vec![
        serde_json::json!({
            "type": "function",
            "function": {"name": "get_weather", "description": "weather forecast for a city"}
        }),
        serde_json::json!({
            "type": "function",
            "function": {"name": "send_email", "description": "send an email"}
        }),
    ];
    let snapshot = ConversationSnapshot::from_messages(vec![
        Message::system("You are helpful."),
        Message::user("hello").at_turn(0),
        Message::user("will it rain in Paris, what is the weather forecast").at_turn(6),
    ])?;
    let state =
        TurnState::new("will it rain in Paris, what is the weather forecast", 6).with_tools(tools);

    let (out, trace) = pipeline.run_async_traced(snapshot, state).await?;
    for step in &trace {
        println!(
            "step {} {:<15} {:?}: {} -> {} messages",
            step.step,
            step.transformer.as_deref().unwrap_or("<input>"),
            step.status,
            step.messages_before,
            step.messages_after
        );
    }
    let names: Vec<_> = out.state.tools.iter().filter_map(TurnState::tool_name).collect();
    println!("tools offered to the model: {:?}", names);
    Ok(())
}
