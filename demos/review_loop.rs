//! Drive a task through the supervisor/worker review loop while watching
//! the typed progress phases.
//!
//! Run with: cargo run --example review_loop

use agent_relay::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;

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
    let orchestrator = Orchestrator::new(Driver::new(services));

    let request = TaskRequest::builder(
        "Write a Rust function that merges two sorted slices into one sorted Vec.",
    )
    .tool_tag("draft_code_implementation")
    .build()?;

    let (progress_tx, mut progress_rx) = mpsc::channel::<Phase>(16);
    let observer = tokio::spawn(async move {
        while let Some(phase) = progress_rx.recv().await {
            println!("phase: {:?}", phase);
        }
    });

    let result = orchestrator
        .run_with_progress(&request, Some(progress_tx))
        .await?;
    observer.await?;

    println!(
        "\napproved: {} after {} attempt(s) on {}",
        result.approved, result.attempts, result.worker_model
    );
    for step in &result.steps {
        println!(
            "  [{} #{}] {:?} on {}",
            step.agent, step.attempt, step.kind, step.model
        );
    }
    if let Some(note) = &result.note {
        println!("note: {}", note);
    }
    println!("\n{}", result.final_text);
    Ok(())
}
