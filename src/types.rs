//! Core type definitions for agent-relay.
//!
//! Three groups live here:
//!
//! - [`TaskRequest`]: a validated unit of work submitted by the host, with a
//!   builder that rejects empty tasks and unknown model hints up front.
//! - [`ModelSpec`] and the model catalog: immutable descriptors for every
//!   model the router may pick, with capability tier, per-million pricing,
//!   and the auth method each is gated behind.
//! - [`ExecutionOutcome`] and [`TokenUsage`]: the normalized result of one
//!   worker execution, whatever transport carried it.
//!
//! # Example
//!
//! ```
//! use agent_relay::{TaskRequest, known_models};
//!
//! let request = TaskRequest::builder("summarize the README")
//!     .model("gemini-2.5-flash")
//!     .cache_enabled(true)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(request.model_hint.as_deref(), Some("gemini-2.5-flash"));
//! assert!(known_models().iter().any(|m| m.name == "gemini-2.5-flash"));
//! ```

use crate::Error;
use crate::auth::AuthMethod;
use serde::{Deserialize, Serialize};

// ============================================================================
// MODEL CATALOG
// ============================================================================

/// Capability tier of a model: 1 = most capable, 3 = fastest/cheapest.
pub type Tier = u8;

/// Immutable descriptor for one known model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSpec {
    /// Canonical model name passed on the CLI `--model` flag (or to the
    /// marketplace API for aggregator-gated models).
    pub name: &'static str,

    /// Capability tier, 1 (most capable) through 3 (fastest/cheapest).
    pub tier: Tier,

    /// Price per million input units, in USD. Zero on free models.
    pub input_price_per_m: f64,

    /// Price per million output units, in USD. Zero on free models.
    pub output_price_per_m: f64,

    /// When present, the model is only served through this auth method
    /// (or, for [`AuthMethod::ApiKey`], any keyed method).
    pub gate: Option<AuthMethod>,
}

impl ModelSpec {
    /// Cost in USD for the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_price_per_m
            + (output_tokens as f64 / 1_000_000.0) * self.output_price_per_m
    }

    /// True when this model runs over the marketplace HTTP path instead of
    /// the worker CLI.
    pub fn is_marketplace(&self) -> bool {
        self.gate == Some(AuthMethod::MarketplaceKey)
    }
}

/// The model the router falls back to when every candidate is unavailable.
pub const RELIABLE_DEFAULT_MODEL: &str = "gemini-2.5-flash";

static MODEL_CATALOG: &[ModelSpec] = &[
    ModelSpec {
        name: "gemini-2.5-pro",
        tier: 1,
        input_price_per_m: 1.25,
        output_price_per_m: 10.0,
        gate: None,
    },
    ModelSpec {
        name: "gemini-2.5-pro-preview",
        tier: 1,
        input_price_per_m: 1.25,
        output_price_per_m: 10.0,
        // Preview models are not served on the free OAuth tier.
        gate: Some(AuthMethod::ApiKey),
    },
    ModelSpec {
        name: "gemini-2.5-flash",
        tier: 2,
        input_price_per_m: 0.30,
        output_price_per_m: 2.50,
        gate: None,
    },
    ModelSpec {
        name: "gemini-2.5-flash-lite",
        tier: 3,
        input_price_per_m: 0.10,
        output_price_per_m: 0.40,
        gate: None,
    },
    ModelSpec {
        name: "qwen/qwen3-coder:free",
        tier: 2,
        input_price_per_m: 0.0,
        output_price_per_m: 0.0,
        gate: Some(AuthMethod::MarketplaceKey),
    },
];

/// All models the router may choose from.
pub fn known_models() -> &'static [ModelSpec] {
    MODEL_CATALOG
}

/// Look up one model by canonical name.
pub fn find_model(name: &str) -> Option<&'static ModelSpec> {
    MODEL_CATALOG.iter().find(|m| m.name == name)
}

// ============================================================================
// TASK COMPLEXITY
// ============================================================================

/// Classified complexity of an inbound task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskComplexity {
    Trivial,
    Standard,
    Complex,
    Critical,
}

impl TaskComplexity {
    /// The model tier best matched to this complexity.
    pub fn preferred_tier(&self) -> Tier {
        match self {
            TaskComplexity::Trivial => 3,
            TaskComplexity::Standard => 2,
            TaskComplexity::Complex | TaskComplexity::Critical => 1,
        }
    }
}

impl std::fmt::Display for TaskComplexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskComplexity::Trivial => "trivial",
            TaskComplexity::Standard => "standard",
            TaskComplexity::Complex => "complex",
            TaskComplexity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// TASK REQUEST
// ============================================================================

/// One unit of work submitted by the host.
///
/// Construct through [`TaskRequest::builder`]; the builder enforces the two
/// request invariants (non-empty task text, known model hint).
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Free-form task text. Never empty.
    pub task: String,

    /// Explicit model override. When present, always names a catalog model.
    pub model_hint: Option<String>,

    /// Conversation or agent-session identifier to thread state through.
    pub session_id: Option<String>,

    /// Working directory for the worker child process.
    pub working_dir: Option<String>,

    /// Glob patterns of context files to append to the prompt.
    pub context_globs: Vec<String>,

    /// Override for the response-cache TTL, in seconds.
    pub cache_ttl_secs: Option<u64>,

    /// Whether the response cache may serve and store this request.
    pub cache_enabled: bool,

    /// Whether the worker runs with tools enabled (agent mode).
    pub agent_mode: bool,

    /// Categorical hint from the calling tool, e.g. `ask_gemini`.
    pub tool_tag: Option<String>,

    /// Force tier-3 selection regardless of classified complexity.
    pub prefer_fast: bool,
}

impl TaskRequest {
    /// Start building a request for the given task text.
    pub fn builder(task: impl Into<String>) -> TaskRequestBuilder {
        TaskRequestBuilder::new(task)
    }
}

/// Builder for [`TaskRequest`] with construction-time validation.
#[derive(Debug, Clone)]
pub struct TaskRequestBuilder {
    task: String,
    model_hint: Option<String>,
    session_id: Option<String>,
    working_dir: Option<String>,
    context_globs: Vec<String>,
    cache_ttl_secs: Option<u64>,
    cache_enabled: bool,
    agent_mode: bool,
    tool_tag: Option<String>,
    prefer_fast: bool,
}

impl TaskRequestBuilder {
    fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            model_hint: None,
            session_id: None,
            working_dir: None,
            context_globs: Vec::new(),
            cache_ttl_secs: None,
            cache_enabled: true,
            agent_mode: false,
            tool_tag: None,
            prefer_fast: false,
        }
    }

    /// Explicitly request a model by catalog name.
    pub fn model(mut self, name: impl Into<String>) -> Self {
        self.model_hint = Some(name.into());
        self
    }

    /// Attach a session identifier.
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Set the worker's working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add a context-file glob pattern.
    pub fn context_glob(mut self, pattern: impl Into<String>) -> Self {
        self.context_globs.push(pattern.into());
        self
    }

    /// Override the cache TTL in seconds.
    pub fn cache_ttl_secs(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = Some(secs);
        self
    }

    /// Enable or disable the response cache for this request.
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Run the worker with tools enabled.
    pub fn agent_mode(mut self, enabled: bool) -> Self {
        self.agent_mode = enabled;
        self
    }

    /// Categorical hint from the calling tool.
    pub fn tool_tag(mut self, tag: impl Into<String>) -> Self {
        self.tool_tag = Some(tag.into());
        self
    }

    /// Force selection of the fastest tier.
    pub fn prefer_fast(mut self, prefer: bool) -> Self {
        self.prefer_fast = prefer;
        self
    }

    /// Validate and build the request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the task text is empty or the
    /// model hint does not name a catalog model.
    pub fn build(self) -> crate::Result<TaskRequest> {
        if self.task.trim().is_empty() {
            return Err(Error::validation("task", "task text must not be empty"));
        }

        if let Some(hint) = &self.model_hint {
            if find_model(hint).is_none() {
                return Err(Error::validation(
                    "model",
                    format!("unknown model `{}`", hint),
                ));
            }
        }

        Ok(TaskRequest {
            task: self.task,
            model_hint: self.model_hint,
            session_id: self.session_id,
            working_dir: self.working_dir,
            context_globs: self.context_globs,
            cache_ttl_secs: self.cache_ttl_secs,
            cache_enabled: self.cache_enabled,
            agent_mode: self.agent_mode,
            tool_tag: self.tool_tag,
            prefer_fast: self.prefer_fast,
        })
    }
}

// ============================================================================
// EXECUTION RESULTS
// ============================================================================

/// Token counts for a single worker execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Merge another usage record into this one.
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Normalized result of one worker execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Accumulated assistant text.
    pub response_text: String,

    /// The model that actually answered (may differ from the hint after
    /// rate-limit fallback).
    pub model: String,

    /// Label of the credential the call succeeded with.
    pub auth_used: String,

    /// Token accounting reported by the worker.
    pub usage: TokenUsage,

    /// True when the response was served from the cache.
    pub cached: bool,

    /// External session id emitted by the worker, when one was captured.
    pub external_session_id: Option<String>,
}

/// Estimate tokens for a piece of content: one token per 4 characters,
/// rounded up. Deterministic, used for every budget check in the crate.
pub fn estimate_tokens(content: &str) -> u64 {
    (content.len() as u64).div_ceil(4)
}

/// Keep the head and tail of an oversized string, inserting an elision
/// marker in the middle. Used for stored tool-call payloads and log samples.
pub fn truncate_middle(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let marker = "\n... [elided] ...\n";
    if max_len <= marker.len() {
        return text.chars().take(max_len).collect();
    }
    let keep = max_len - marker.len();
    let head_len = keep / 2;
    let tail_len = keep - head_len;

    // Snap to char boundaries so multi-byte content cannot split a code point.
    let mut head_end = head_len.min(text.len());
    while !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len() - tail_len.min(text.len());
    while !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }

    format!("{}{}{}", &text[..head_end], marker, &text[tail_start..])
}
