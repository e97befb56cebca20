//! Route and execute a single task.
//!
//! Requires the Gemini CLI on PATH (or set credentials in the
//! environment so the auth chain has something beyond OAuth).
//!
//! Run with: cargo run --example single_task

use agent_relay::prelude::*;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_relay=info".into()),
        )
        .init();

    let config = RelayConfig::from_env()?;
    let services = Services::new(config, Arc::new(GeminiCli::default()))?;
    let driver = Driver::new(Arc::clone(&services));

    // Warm the cache from a previous run, if one exists.
    let loaded = services.load_cache().await.unwrap_or(0);
    if loaded > 0 {
        println!("loaded {} cached response(s)", loaded);
    }

    let request = TaskRequest::builder("What are the three laws of thermodynamics, briefly?")
        .tool_tag("ask_gemini")
        .build()?;

    let outcome = driver.execute(&request).await?;
    println!(
        "model: {} (auth: {}, cached: {})",
        outcome.model, outcome.auth_used, outcome.cached
    );
    println!(
        "tokens: {} in / {} out",
        outcome.usage.input_tokens, outcome.usage.output_tokens
    );
    println!("\n{}", outcome.response_text);

    services.persist_cache().await?;
    Ok(())
}
