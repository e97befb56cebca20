//! # agent-relay
//!
//! A multi-model AI worker orchestrator that brokers between an expensive
//! "supervisor" reasoning model and cheaper "worker" models driven through
//! their command-line frontends as long-lived child processes.
//!
//! ## Overview
//!
//! The crate classifies each inbound task, picks the cheapest model capable
//! of handling it, and executes it by spawning the worker CLI with the
//! prompt on stdin and a stream of structured records on stdout. Around
//! that core sit the services that make the arrangement dependable:
//!
//! - **Routing**: complexity classification and tier-matched model
//!   selection that honors rate limits and credential gates
//! - **Auth fallback**: an ordered credential chain (OAuth → api-key →
//!   enterprise-key → marketplace-key) with five-minute failure memory
//! - **Rate & cost tracking**: per-model availability plus a token/cost
//!   ledger with an optional daily ceiling
//! - **Response cache**: prompt-fingerprinted memoization with TTL and
//!   LRU eviction, persistable to a single JSON file
//! - **Conversations**: budgeted multi-turn history with prompt building
//! - **Agent sessions**: autonomous worker runs with tools enabled, under
//!   iteration and wall-clock quotas, with full side-effect accounting and
//!   never-truncated on-disk transcripts
//! - **Orchestration**: a supervisor/worker review-and-correct loop with
//!   typed progress phases
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use agent_relay::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig::from_env()?;
//!     let services = Services::new(config, Arc::new(GeminiCli::default()))?;
//!     let driver = Driver::new(services);
//!
//!     let request = TaskRequest::builder("summarize the README")
//!         .tool_tag("summarize_files")
//!         .build()?;
//!     let outcome = driver.execute(&request).await?;
//!     println!("[{}] {}", outcome.model, outcome.response_text);
//!     Ok(())
//! }
//! ```
//!
//! ## Review loop
//!
//! ```rust,no_run
//! use agent_relay::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let services = Services::new(RelayConfig::from_env()?, Arc::new(GeminiCli::default()))?;
//! let orchestrator = Orchestrator::new(Driver::new(services));
//!
//! let request = TaskRequest::builder("implement an LRU cache in Rust")
//!     .tool_tag("draft_code_implementation")
//!     .build()?;
//! let result = orchestrator.run(&request).await?;
//! println!("approved: {} after {} attempt(s)", result.approved, result.attempts);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Leaves first: `auth`, `limits`, `sizer`, and `cache` have no internal
//! dependencies; `adapter` and `events` form the worker boundary; `driver`
//! composes them with `router`; `conversation` and `agent` layer state on
//! top of the driver; `orchestrator` multiplexes the lot.

/// Worker adapter seam: the capability record one worker family implements,
/// and the Gemini CLI production adapter.
mod adapter;

/// Autonomous agent sessions: registry, quotas, side-effect accounting,
/// artifact capture.
mod agent;

/// Ordered credential chain with failure stamps and sweep.
mod auth;

/// Prompt-fingerprinted response cache with TTL + LRU and file persistence.
mod cache;

/// Environment-derived runtime configuration.
mod config;

/// Budgeted multi-turn conversation store.
mod conversation;

/// The execution engine: routing, cache, dispatch, fallback, deadline,
/// cancellation.
mod driver;

/// Error types and the crate-wide `Result` alias.
mod error;

/// Worker record decoding and split-line assembly.
mod events;

/// Rate-limit memory and the cost ledger.
mod limits;

/// HTTP client for the external model-aggregator marketplace.
mod marketplace;

/// Supervisor/worker review-and-correct protocol.
mod orchestrator;

/// Task complexity classification and model selection.
mod router;

/// Shared service bundle with explicit construction.
mod services;

/// Output shaping against downstream budgets.
mod sizer;

/// Core request/model/result types.
mod types;

// --- Errors ---

pub use error::{Error, Result};

// --- Core types ---

pub use types::{
    ExecutionOutcome, ModelSpec, RELIABLE_DEFAULT_MODEL, TaskComplexity, TaskRequest,
    TaskRequestBuilder, Tier, TokenUsage, estimate_tokens, find_model, known_models,
    truncate_middle,
};

// --- Configuration ---

pub use config::RelayConfig;

// --- Authentication ---

pub use auth::{AuthChain, AuthMethod, Credential, FAILURE_STAMP_TTL, mask_secret};

// --- Rate limits and cost ---

pub use limits::{
    CostLedger, LedgerStats, ModelLedgerEntry, ModelRateStats, RateStats, RateTracker,
};

// --- Response cache ---

pub use cache::{CacheEntry, CacheStats, ResponseCache, fingerprint};

// --- Routing ---

pub use router::{ModelChoice, Router, RouterConfig};

// --- Worker boundary ---

pub use adapter::{
    GeminiCli, InvocationOptions, TermSignal, WorkerAdapter, WorkerControl, WorkerExit, WorkerRun,
};
pub use events::{LineAssembler, WorkerEvent, decode_line};

// --- Execution ---

pub use driver::{
    CancelHandle, DEFAULT_DEADLINE, Driver, ExecOptions, FailureClass, StderrLexicon,
};

// --- Marketplace ---

pub use marketplace::{MarketplaceBackoff, MarketplaceClient, MarketplaceReply};

// --- Conversations ---

pub use conversation::{
    ConversationBudgets, ConversationState, ConversationStats, ConversationStore,
    ConversationSummary, Role, StoredMessage,
};

// --- Agent sessions ---

pub use agent::{
    AgentLimits, AgentRunOutcome, AgentRunSpec, AgentSession, AgentStatus, AgentSummary,
    AgentSupervisor, ShellRecord, SideEffects, ToolCallRecord,
};

// --- Output shaping ---

pub use sizer::{ShapedOutput, SizerBudgets, shape_output};

// --- Orchestration ---

pub use orchestrator::{
    APPROVAL_SENTINEL, Orchestrator, OrchestratorConfig, OrchestrationResult, Phase,
    ReviewVerdict, StepKind, StepRecord, parse_review,
};

// --- Services ---

pub use services::{ServiceStats, Services};

/// Convenience module with the types most hosts need.
///
/// Import with `use agent_relay::prelude::*;`.
pub mod prelude {
    pub use crate::{
        AgentLimits, CancelHandle, Driver, Error, ExecutionOutcome, GeminiCli, Orchestrator,
        OrchestrationResult, Phase, RelayConfig, Result, Services, TaskComplexity, TaskRequest,
        TokenUsage, WorkerAdapter,
    };
}
