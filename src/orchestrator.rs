//! Supervisor/worker orchestration loop.
//!
//! Tasks whose type warrants verification go through a review-and-correct
//! protocol: the selected worker produces a candidate, the supervisor
//! model reviews it under explicit decision rules, and the loop either
//! accepts (`APPROVED` sentinel, optionally with a polished version in a
//! fenced code block), swaps in the supervisor's corrected version, or
//! feeds the supervisor's feedback back to the worker for another
//! attempt. The sentinel is matched anywhere in the response; a response
//! carrying both the sentinel and a code block resolves in favor of
//! approval.
//!
//! Progress is published as typed phases on a channel the caller may
//! observe; a slow or dropped observer never blocks the loop.

use crate::driver::Driver;
use crate::types::{TaskRequest, TokenUsage, truncate_middle};
use crate::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Sentinel the supervisor uses to accept a candidate.
pub const APPROVAL_SENTINEL: &str = "APPROVED";

/// Default bound on review/correction attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[a-zA-Z0-9_+-]*\n(.*?)```").unwrap());

/// Typed progress phases published while a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Routing,
    Executing,
    Review,
    Correction,
    Complete,
}

/// What one review or correction step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Review,
    Correction,
}

/// Log entry for one protocol step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Which side performed the step.
    pub agent: String,
    pub model: String,
    pub kind: StepKind,
    pub attempt: u32,
    pub input_sample: String,
    pub output_sample: String,
}

/// Final result of an orchestrated task.
#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    pub final_text: String,
    /// True when the supervisor approved a candidate.
    pub approved: bool,
    pub attempts: u32,
    pub worker_model: String,
    pub usage: TokenUsage,
    pub steps: Vec<StepRecord>,
    /// Present when the attempt budget ran out before approval.
    pub note: Option<String>,
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model the review subsession runs on.
    pub supervisor_model: String,
    /// Tool tags whose output requires review.
    pub review_required: HashSet<String>,
    /// Read-only analysis tags, never reviewed.
    pub read_only: HashSet<String>,
    pub max_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let set = |tags: &[&str]| tags.iter().map(|t| t.to_string()).collect();
        Self {
            supervisor_model: "gemini-2.5-pro".to_string(),
            review_required: set(&[
                "draft_code_implementation",
                "fix_bug",
                "refactor_code",
            ]),
            read_only: set(&[
                "ask_gemini",
                "summarize_files",
                "research_topic",
                "analyze_codebase",
            ]),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Outcome of parsing one supervisor review response.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewVerdict {
    /// Approved; carries the polished version when one followed the sentinel.
    Approved(Option<String>),
    /// The supervisor supplied a corrected version directly.
    Corrected(String),
    /// Textual feedback for the worker to act on.
    Feedback(String),
}

/// Parse the supervisor's review response under the canonical rules.
pub fn parse_review(response: &str) -> ReviewVerdict {
    if let Some(pos) = response.find(APPROVAL_SENTINEL) {
        // Approval wins even when a code block is also present; a block
        // after the sentinel is the polished version.
        let after = &response[pos + APPROVAL_SENTINEL.len()..];
        let polished = FENCED_BLOCK
            .captures(after)
            .map(|cap| cap[1].trim_end().to_string());
        return ReviewVerdict::Approved(polished);
    }
    if let Some(cap) = FENCED_BLOCK.captures(response) {
        return ReviewVerdict::Corrected(cap[1].trim_end().to_string());
    }
    ReviewVerdict::Feedback(response.to_string())
}

/// The supervisor/worker review loop.
#[derive(Clone)]
pub struct Orchestrator {
    driver: Driver,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(driver: Driver) -> Self {
        Self {
            driver,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(driver: Driver, config: OrchestratorConfig) -> Self {
        Self { driver, config }
    }

    /// Whether a task type goes through review.
    pub fn needs_review(&self, tool_tag: Option<&str>) -> bool {
        match tool_tag {
            Some(tag) => {
                self.config.review_required.contains(tag) && !self.config.read_only.contains(tag)
            }
            None => false,
        }
    }

    /// Run a task with no progress observer.
    pub async fn run(&self, request: &TaskRequest) -> Result<OrchestrationResult> {
        self.run_with_progress(request, None).await
    }

    /// Run a task, publishing [`Phase`] values to the given channel. The
    /// channel is closed (sender dropped) when the run finishes or fails.
    pub async fn run_with_progress(
        &self,
        request: &TaskRequest,
        progress: Option<mpsc::Sender<Phase>>,
    ) -> Result<OrchestrationResult> {
        let publish = |phase: Phase| {
            if let Some(tx) = &progress {
                // Never block the loop on a slow observer.
                let _ = tx.try_send(phase);
            }
        };

        publish(Phase::Routing);
        publish(Phase::Executing);
        let first = self.driver.execute(request).await?;
        let worker_model = first.model.clone();
        let mut usage = first.usage;
        let mut candidate = first.response_text;
        let mut steps = Vec::new();

        if !self.needs_review(request.tool_tag.as_deref()) {
            publish(Phase::Complete);
            return Ok(OrchestrationResult {
                final_text: candidate,
                approved: false,
                attempts: 0,
                worker_model,
                usage,
                steps,
                note: None,
            });
        }

        for attempt in 1..=self.config.max_attempts {
            publish(Phase::Review);
            let review_prompt = build_review_prompt(&request.task, &candidate);
            let review_request = TaskRequest::builder(review_prompt.clone())
                .model(self.config.supervisor_model.clone())
                .cache_enabled(false)
                .build()?;
            let review = self.driver.execute(&review_request).await?;
            usage.add(review.usage);
            steps.push(StepRecord {
                agent: "supervisor".to_string(),
                model: review.model.clone(),
                kind: StepKind::Review,
                attempt,
                input_sample: truncate_middle(&review_prompt, 400),
                output_sample: truncate_middle(&review.response_text, 400),
            });

            match parse_review(&review.response_text) {
                ReviewVerdict::Approved(polished) => {
                    info!(attempt, "supervisor approved candidate");
                    publish(Phase::Complete);
                    return Ok(OrchestrationResult {
                        final_text: polished.unwrap_or(candidate),
                        approved: true,
                        attempts: attempt,
                        worker_model,
                        usage,
                        steps,
                        note: None,
                    });
                }
                ReviewVerdict::Corrected(corrected) => {
                    debug!(attempt, "supervisor supplied corrected version");
                    candidate = corrected;
                }
                ReviewVerdict::Feedback(feedback) => {
                    publish(Phase::Correction);
                    let correction_prompt =
                        build_correction_prompt(&request.task, &candidate, &feedback);
                    let correction_request = TaskRequest::builder(correction_prompt.clone())
                        .model(worker_model.clone())
                        .cache_enabled(false)
                        .build()?;
                    let corrected = self.driver.execute(&correction_request).await?;
                    usage.add(corrected.usage);
                    steps.push(StepRecord {
                        agent: "worker".to_string(),
                        model: corrected.model.clone(),
                        kind: StepKind::Correction,
                        attempt,
                        input_sample: truncate_middle(&correction_prompt, 400),
                        output_sample: truncate_middle(&corrected.response_text, 400),
                    });
                    candidate = corrected.response_text;
                }
            }
        }

        publish(Phase::Complete);
        Ok(OrchestrationResult {
            final_text: candidate,
            approved: false,
            attempts: self.config.max_attempts,
            worker_model,
            usage,
            steps,
            note: Some(format!(
                "review budget of {} attempt(s) exhausted without approval",
                self.config.max_attempts
            )),
        })
    }
}

fn build_review_prompt(task: &str, candidate: &str) -> String {
    format!(
        "You are a senior reviewer checking another model's work.\n\n\
         Original task:\n{task}\n\n\
         Proposed solution:\n{candidate}\n\n\
         Decision rules:\n\
         - If the solution is correct and complete, reply with the single word {sentinel} \
         (optionally followed by a polished version in a fenced code block).\n\
         - Otherwise, list the issues you found and provide a corrected version in a \
         fenced code block.",
        task = task,
        candidate = candidate,
        sentinel = APPROVAL_SENTINEL,
    )
}

fn build_correction_prompt(task: &str, candidate: &str, feedback: &str) -> String {
    format!(
        "Your previous answer to the task below was reviewed and needs fixes.\n\n\
         Task:\n{task}\n\n\
         Your previous answer:\n{candidate}\n\n\
         Reviewer feedback:\n{feedback}\n\n\
         Produce a corrected answer.",
    )
}
