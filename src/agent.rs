//! Autonomous agent sessions.
//!
//! Agent sessions let the worker run with its own filesystem and shell
//! tools enabled, under explicit quotas and with full side-effect
//! accounting. The supervisor keeps a registry of sessions, records
//! every tool call with a derived semantic side-effect, enforces the
//! iteration limit and wall-clock deadline atomically on each tool call,
//! and captures output into two sinks: a complete on-disk transcript and
//! a capped in-memory buffer for the caller-facing response.
//!
//! Agent mode is opt-in: `create` fails fast unless the operator enabled
//! it, because agent mode relaxes the tool restrictions passed to the
//! worker CLI.

use crate::adapter::{InvocationOptions, TermSignal, WorkerAdapter, WorkerExit};
use crate::config::RelayConfig;
use crate::events::WorkerEvent;
use crate::types::{TokenUsage, estimate_tokens, truncate_middle};
use crate::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default per-session iteration limit.
pub const DEFAULT_MAX_ITERATIONS: u32 = 25;

/// Default per-session wall-clock limit.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(600);

/// Grace period between the polite and the forceful termination signal.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Full-output artifacts older than this are pruned.
pub const DEFAULT_ARTIFACT_RETENTION_DAYS: i64 = 30;

/// Minimum interval between artifact prune sweeps.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Completed or failed sessions idle longer than this are dropped by cleanup.
pub const DEFAULT_SESSION_RETENTION_HOURS: i64 = 24;

/// Cap on the in-memory response buffer, in characters.
const CAPPED_BUFFER_CHARS: usize = 16_000;

/// Cap on stored tool-call payload samples, in characters.
const PAYLOAD_SAMPLE_CHARS: usize = 2_000;

/// Lifecycle of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Per-session quotas.
#[derive(Debug, Clone, Copy)]
pub struct AgentLimits {
    pub max_iterations: u32,
    pub timeout: Duration,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }
}

/// One recorded tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub iteration: u32,
    pub tool: String,
    /// Mid-truncated input payload sample.
    pub input_sample: String,
    /// Mid-truncated output sample, filled when the matching result arrives.
    pub output_sample: Option<String>,
    pub at: DateTime<Utc>,
}

/// One recorded shell command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRecord {
    pub command: String,
    pub exit_status: Option<i64>,
    pub at: DateTime<Utc>,
}

/// Filesystem paths touched by the session, by effect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SideEffects {
    pub created: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
    pub read: BTreeSet<String>,
}

impl SideEffects {
    fn previously_touched(&self, path: &str) -> bool {
        self.created.contains(path) || self.modified.contains(path) || self.read.contains(path)
    }
}

/// Full state of one agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: String,
    /// CLI-native session id, absent until the worker emits it.
    pub external_id: Option<String>,
    pub status: AgentStatus,
    pub task: String,
    pub working_dir: Option<String>,
    pub model: Option<String>,
    pub iterations: u32,
    pub max_iterations: u32,
    pub deadline: DateTime<Utc>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub side_effects: SideEffects,
    pub shell_commands: Vec<ShellRecord>,
    pub usage: TokenUsage,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Human-facing summary of a session, including the resume command and
/// the recovery options shown on terminal failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub external_id: Option<String>,
    pub status: AgentStatus,
    pub task: String,
    pub iterations: u32,
    pub max_iterations: u32,
    pub files_created: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub files_read: usize,
    pub shell_commands: usize,
    pub usage: TokenUsage,
    /// Exactly `<cli> --resume <externalId>` once an external id is known.
    pub resume_command: Option<String>,
    pub full_output_path: Option<String>,
    pub error: Option<String>,
    pub recovery_options: Vec<String>,
}

/// Outcome of one agent run, success or failure.
#[derive(Debug, Clone)]
pub struct AgentRunOutcome {
    pub session_id: String,
    pub status: AgentStatus,
    /// Caller-facing text from the capped buffer.
    pub response_text: String,
    pub full_output_path: PathBuf,
    pub summary_output_path: PathBuf,
    pub usage: TokenUsage,
    pub error: Option<String>,
}

/// Parameters for one agent run.
#[derive(Debug, Clone)]
pub struct AgentRunSpec {
    pub task: String,
    pub model: String,
    pub working_dir: Option<String>,
    pub context_files: Vec<PathBuf>,
    pub limits: AgentLimits,
    /// Resume a previous session by local id.
    pub resume_local_id: Option<String>,
}

// ============================================================================
// CAPPED BUFFER
// ============================================================================

/// In-memory output buffer that keeps its head and the incoming tail once
/// the cap is reached, with an elision marker naming the full artifact.
#[derive(Debug)]
struct CappedBuffer {
    head: String,
    tail: String,
    overflowed: bool,
    cap: usize,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            head: String::new(),
            tail: String::new(),
            overflowed: false,
            cap,
        }
    }

    fn push(&mut self, text: &str) {
        if !self.overflowed {
            if self.head.len() + text.len() <= self.cap {
                self.head.push_str(text);
                return;
            }
            self.overflowed = true;
        }
        self.tail.push_str(text);
        let tail_cap = self.cap / 2;
        if self.tail.len() > tail_cap {
            let cut = self.tail.len() - tail_cap;
            let mut boundary = cut;
            while !self.tail.is_char_boundary(boundary) {
                boundary += 1;
            }
            self.tail.drain(..boundary);
        }
    }

    fn render(&self, full_path: &Path) -> String {
        if !self.overflowed {
            return self.head.clone();
        }
        let head_keep = self.cap / 2;
        let mut boundary = head_keep.min(self.head.len());
        while !self.head.is_char_boundary(boundary) {
            boundary -= 1;
        }
        format!(
            "{}\n... [output elided, full transcript: {}] ...\n{}",
            &self.head[..boundary],
            full_path.display(),
            self.tail
        )
    }
}

// ============================================================================
// SUPERVISOR
// ============================================================================

/// Registry and runner for agent sessions.
pub struct AgentSupervisor {
    config: RelayConfig,
    adapter: Arc<dyn WorkerAdapter>,
    sessions: RwLock<HashMap<String, AgentSession>>,
    artifact_dir: PathBuf,
    session_retention_hours: i64,
    artifact_retention_days: i64,
    prune_interval: Duration,
    last_prune: Mutex<Option<Instant>>,
}

impl AgentSupervisor {
    pub fn new(
        config: RelayConfig,
        adapter: Arc<dyn WorkerAdapter>,
        artifact_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            adapter,
            sessions: RwLock::new(HashMap::new()),
            artifact_dir,
            session_retention_hours: DEFAULT_SESSION_RETENTION_HOURS,
            artifact_retention_days: DEFAULT_ARTIFACT_RETENTION_DAYS,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            last_prune: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Registry operations
    // ------------------------------------------------------------------

    /// Create a session in the pending state. Fails fast when agent mode
    /// is disabled by configuration.
    pub async fn create(
        &self,
        task: impl Into<String>,
        working_dir: Option<String>,
        model: Option<String>,
        limits: AgentLimits,
    ) -> Result<String> {
        self.config.ensure_agent_mode()?;

        let task = task.into();
        if task.trim().is_empty() {
            return Err(Error::validation("task", "task text must not be empty"));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let session = AgentSession {
            id: id.clone(),
            external_id: None,
            status: AgentStatus::Pending,
            task,
            working_dir,
            model,
            iterations: 0,
            max_iterations: limits.max_iterations,
            deadline: now
                + ChronoDuration::from_std(limits.timeout)
                    .unwrap_or_else(|_| ChronoDuration::zero()),
            tool_calls: Vec::new(),
            side_effects: SideEffects::default(),
            shell_commands: Vec::new(),
            usage: TokenUsage::default(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.sessions.write().await.insert(id.clone(), session);
        info!(session = %id, "agent session created");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<AgentSession> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::session(id, "unknown agent session"))
    }

    /// Record the CLI-native session id once the worker emits it.
    pub async fn set_external_id(&self, id: &str, external_id: impl Into<String>) -> Result<()> {
        self.mutate(id, |s| {
            s.external_id = Some(external_id.into());
        })
        .await
    }

    /// Advance the session status. Transitions follow
    /// pending → running → {completed, failed}.
    pub async fn set_status(&self, id: &str, status: AgentStatus) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::session(id, "unknown agent session"))?;
        let legal = matches!(
            (session.status, status),
            (AgentStatus::Pending, AgentStatus::Running)
                | (AgentStatus::Running, AgentStatus::Completed)
                | (AgentStatus::Running, AgentStatus::Failed)
                | (AgentStatus::Completed, AgentStatus::Running)
                | (AgentStatus::Failed, AgentStatus::Running)
        );
        if !legal {
            return Err(Error::session(
                id,
                format!("illegal transition {:?} -> {:?}", session.status, status),
            ));
        }
        session.status = status;
        session.updated_at = Utc::now();
        Ok(())
    }

    pub async fn set_result(&self, id: &str, result: impl Into<String>) -> Result<()> {
        self.mutate(id, |s| {
            s.result = Some(result.into());
        })
        .await
    }

    pub async fn set_error(&self, id: &str, error: impl Into<String>) -> Result<()> {
        self.mutate(id, |s| {
            s.error = Some(error.into());
        })
        .await
    }

    pub async fn update_tokens(&self, id: &str, usage: TokenUsage) -> Result<()> {
        self.mutate(id, |s| {
            s.usage.add(usage);
        })
        .await
    }

    /// Record one tool call: bumps the iteration counter by exactly one
    /// and derives the semantic side-effect from the tool's input.
    pub async fn record_tool_call(&self, id: &str, tool: &str, input: &Value) -> Result<u32> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::session(id, "unknown agent session"))?;

        session.iterations += 1;
        let iteration = session.iterations;
        let now = Utc::now();

        apply_side_effect(session, tool, input, now);

        session.tool_calls.push(ToolCallRecord {
            iteration,
            tool: tool.to_string(),
            input_sample: truncate_middle(&input.to_string(), PAYLOAD_SAMPLE_CHARS),
            output_sample: None,
            at: now,
        });
        session.updated_at = now;
        Ok(iteration)
    }

    /// Attach a result sample to the most recent tool call.
    pub async fn record_tool_result(&self, id: &str, output: &str) -> Result<()> {
        self.mutate(id, |s| {
            if let Some(last) = s.tool_calls.last_mut() {
                last.output_sample = Some(truncate_middle(output, PAYLOAD_SAMPLE_CHARS));
            }
        })
        .await
    }

    /// Check the session against its quotas. `Ok(())` means the run may
    /// continue; an error names the breached limit.
    pub async fn check_limits(&self, id: &str) -> Result<()> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(id)
            .ok_or_else(|| Error::session(id, "unknown agent session"))?;
        if session.iterations >= session.max_iterations {
            return Err(Error::budget(
                "agent_iterations",
                format!(
                    "iteration limit of {} reached",
                    session.max_iterations
                ),
            ));
        }
        if Utc::now() >= session.deadline {
            return Err(Error::budget(
                "agent_deadline",
                "session deadline reached".to_string(),
            ));
        }
        Ok(())
    }

    /// Human-facing summary, with resume command and recovery options.
    pub async fn summary(&self, id: &str) -> Result<AgentSummary> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(id)
            .ok_or_else(|| Error::session(id, "unknown agent session"))?;

        let resume_command = session
            .external_id
            .as_ref()
            .map(|ext| format!("{} --resume {}", self.adapter.program_name(), ext));
        let full_output_path = self.full_path(&session.id);
        let full_output = full_output_path
            .exists()
            .then(|| full_output_path.display().to_string());

        let mut recovery_options = Vec::new();
        if session.status == AgentStatus::Failed {
            if let Some(resume) = &resume_command {
                recovery_options.push(format!("resume: {}", resume));
            }
            if let Some(path) = &full_output {
                recovery_options.push(format!("inspect: {}", path));
            }
            if !session.side_effects.created.is_empty()
                || !session.side_effects.modified.is_empty()
            {
                recovery_options.push(format!(
                    "rollback: review {} created and {} modified path(s) before rerunning",
                    session.side_effects.created.len(),
                    session.side_effects.modified.len()
                ));
            }
        }

        Ok(AgentSummary {
            id: session.id.clone(),
            external_id: session.external_id.clone(),
            status: session.status,
            task: truncate_middle(&session.task, 400),
            iterations: session.iterations,
            max_iterations: session.max_iterations,
            files_created: session.side_effects.created.len(),
            files_modified: session.side_effects.modified.len(),
            files_deleted: session.side_effects.deleted.len(),
            files_read: session.side_effects.read.len(),
            shell_commands: session.shell_commands.len(),
            usage: session.usage,
            resume_command,
            full_output_path: full_output,
            error: session.error.clone(),
            recovery_options,
        })
    }

    pub async fn list(&self, status: Option<AgentStatus>) -> Vec<AgentSession> {
        let sessions = self.sessions.read().await;
        let mut rows: Vec<AgentSession> = sessions
            .values()
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.sessions
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::session(id, "unknown agent session"))
    }

    /// Drop terminal sessions idle past the retention window.
    pub async fn cleanup(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(self.session_retention_hours);
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| {
            !(matches!(s.status, AgentStatus::Completed | AgentStatus::Failed)
                && s.updated_at < cutoff)
        });
        before - sessions.len()
    }

    /// Drop everything. Intended for tests.
    pub async fn reset(&self) {
        self.sessions.write().await.clear();
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    /// Run one agent session to completion.
    ///
    /// New runs allocate and seed a session; resumes locate the session
    /// by local id, require a captured external id, and rejoin the same
    /// CLI-native conversation.
    pub async fn run(&self, spec: AgentRunSpec) -> Result<AgentRunOutcome> {
        self.config.ensure_agent_mode()?;
        self.maybe_spawn_prune().await;

        let (session_id, resume_external_id) = match &spec.resume_local_id {
            Some(local_id) => {
                let session = self.get(local_id).await?;
                let external = session.external_id.clone().ok_or_else(|| {
                    Error::session(local_id, "no external id captured, cannot resume")
                })?;
                // Reset quotas for the resumed leg.
                {
                    let mut sessions = self.sessions.write().await;
                    if let Some(s) = sessions.get_mut(local_id) {
                        s.deadline = Utc::now()
                            + ChronoDuration::from_std(spec.limits.timeout)
                                .unwrap_or_else(|_| ChronoDuration::zero());
                        s.max_iterations = spec.limits.max_iterations;
                        s.iterations = 0;
                        s.error = None;
                    }
                }
                self.set_status(local_id, AgentStatus::Running).await?;
                (local_id.clone(), Some(external))
            }
            None => {
                let id = self
                    .create(
                        spec.task.clone(),
                        spec.working_dir.clone(),
                        Some(spec.model.clone()),
                        spec.limits,
                    )
                    .await?;
                self.set_status(&id, AgentStatus::Running).await?;
                (id, None)
            }
        };

        let prompt = self.build_prompt(&spec).await?;
        let options = InvocationOptions {
            model: spec.model.clone(),
            agent_mode: true,
            resume_external_id,
            working_dir: spec.working_dir.clone(),
            env: Vec::new(),
        };

        let run = self.adapter.spawn(&prompt, &options).await?;
        self.drive(&session_id, &spec, run).await
    }

    /// Stream the worker's events to both sinks, enforcing quotas on
    /// every tool call.
    async fn drive(
        &self,
        session_id: &str,
        spec: &AgentRunSpec,
        run: crate::adapter::WorkerRun,
    ) -> Result<AgentRunOutcome> {
        let crate::adapter::WorkerRun {
            mut events,
            exit,
            control,
        } = run;
        let full_path = self.full_path(session_id);
        let summary_path = self.summary_path(session_id);
        tokio::fs::create_dir_all(&self.artifact_dir)
            .await
            .map_err(|e| {
                Error::filesystem(self.artifact_dir.display().to_string(), e.to_string())
            })?;

        let started_at = Utc::now();
        let mut full_file = tokio::fs::File::create(&full_path).await.map_err(|e| {
            Error::filesystem(full_path.display().to_string(), e.to_string())
        })?;
        let header = format!(
            "=== agent session {} ===\nstarted: {}\ntask: {}\n\n",
            session_id,
            started_at.to_rfc3339(),
            spec.task
        );
        let mut full_bytes = 0usize;
        write_artifact(&mut full_file, &full_path, &header, &mut full_bytes).await?;

        let mut buffer = CappedBuffer::new(CAPPED_BUFFER_CHARS);
        let mut final_text: Option<String> = None;
        let mut limit_error: Option<Error> = None;
        let mut stream_error: Option<String> = None;
        let deadline = Instant::now() + spec.limits.timeout;

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = tokio::time::sleep_until(deadline) => {
                    limit_error = Some(Error::budget(
                        "agent_deadline",
                        "session deadline reached".to_string(),
                    ));
                    escalate_termination(control.clone());
                    break;
                }
            };
            let Some(event) = event else { break };

            match event {
                WorkerEvent::Session { id } => {
                    self.set_external_id(session_id, id.as_str()).await?;
                    debug!(session = %session_id, external = %id, "external session id captured");
                }
                WorkerEvent::ToolUse { name, input } => {
                    // Quota check happens before the call is forwarded;
                    // breach kills the child before any further tool call.
                    if let Err(breach) = self.check_limits(session_id).await {
                        warn!(session = %session_id, error = %breach, "limit breached, terminating worker");
                        limit_error = Some(breach);
                        escalate_termination(control.clone());
                        break;
                    }
                    self.record_tool_call(session_id, &name, &input).await?;
                    let line = format!("[tool_use] {} {}\n", name, truncate_middle(&input.to_string(), 400));
                    write_artifact(&mut full_file, &full_path, &line, &mut full_bytes).await?;
                }
                WorkerEvent::ToolResult { output } => {
                    self.record_tool_result(session_id, &output).await?;
                    let line = format!("[tool_result] {}\n", truncate_middle(&output, 400));
                    write_artifact(&mut full_file, &full_path, &line, &mut full_bytes).await?;
                }
                WorkerEvent::Text(text) => {
                    buffer.push(&text);
                    write_artifact(&mut full_file, &full_path, &text, &mut full_bytes).await?;
                }
                WorkerEvent::Usage(usage) => {
                    self.update_tokens(session_id, usage).await?;
                }
                WorkerEvent::Error(message) => {
                    stream_error = Some(message);
                }
                WorkerEvent::Done { text, usage } => {
                    if let Some(usage) = usage {
                        self.update_tokens(session_id, usage).await?;
                    }
                    if let Some(text) = text {
                        buffer.push(&text);
                        write_artifact(&mut full_file, &full_path, &text, &mut full_bytes).await?;
                        final_text = Some(buffer.render(&full_path));
                    }
                }
            }
        }

        // Unblock the reader task before reaping the exit status; a full
        // event channel must not stall the child's teardown.
        drop(events);
        let exit = exit.await.unwrap_or(WorkerExit {
            code: None,
            stderr: String::new(),
        });

        // Flush the footer even on failure; the artifact must always be
        // complete.
        let footer = format!(
            "\n=== finished: {} ({} bytes) ===\n",
            Utc::now().to_rfc3339(),
            full_bytes
        );
        write_artifact(&mut full_file, &full_path, &footer, &mut full_bytes).await?;
        let _ = full_file.flush().await;

        let response_text = final_text.unwrap_or_else(|| buffer.render(&full_path));
        self.write_summary_artifact(&summary_path, &full_path, session_id, &response_text)
            .await?;

        let session = self.get(session_id).await?;
        let error_message = if let Some(limit) = &limit_error {
            Some(limit.to_string())
        } else if let Some(code) = exit.code.filter(|&c| c != 0) {
            Some(describe_exit(code, &exit.stderr))
        } else if exit.code.is_none() && limit_error.is_none() {
            Some("worker terminated by signal".to_string())
        } else {
            stream_error
        };

        let status = match &error_message {
            None => {
                self.set_result(session_id, response_text.as_str()).await?;
                self.set_status(session_id, AgentStatus::Completed).await?;
                AgentStatus::Completed
            }
            Some(message) => {
                self.set_error(session_id, message.as_str()).await?;
                self.set_status(session_id, AgentStatus::Failed).await?;
                AgentStatus::Failed
            }
        };

        Ok(AgentRunOutcome {
            session_id: session_id.to_string(),
            status,
            response_text,
            full_output_path: full_path,
            summary_output_path: summary_path,
            usage: session.usage,
            error: error_message,
        })
    }

    async fn build_prompt(&self, spec: &AgentRunSpec) -> Result<String> {
        let mut prompt = spec.task.clone();
        for path in &spec.context_files {
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::filesystem(path.display().to_string(), e.to_string())
            })?;
            prompt.push_str(&format!(
                "\n\n--- context: {} ---\n{}",
                path.display(),
                content
            ));
        }
        Ok(prompt)
    }

    async fn write_summary_artifact(
        &self,
        summary_path: &Path,
        full_path: &Path,
        session_id: &str,
        response_text: &str,
    ) -> Result<()> {
        // The summary always names the full artifact.
        let reader_budget_chars = 25_000usize * 4;
        let body = truncate_middle(response_text, reader_budget_chars);
        let summary = format!(
            "agent session {}\nfull transcript: {}\nestimated tokens: {}\n\n{}",
            session_id,
            full_path.display(),
            estimate_tokens(&body),
            body
        );
        tokio::fs::write(summary_path, summary).await.map_err(|e| {
            Error::filesystem(summary_path.display().to_string(), e.to_string())
        })
    }

    fn full_path(&self, session_id: &str) -> PathBuf {
        self.artifact_dir.join(format!("{}-full.txt", session_id))
    }

    fn summary_path(&self, session_id: &str) -> PathBuf {
        self.artifact_dir.join(format!("{}-summary.txt", session_id))
    }

    /// Fire-and-forget artifact prune, at most once per interval.
    async fn maybe_spawn_prune(&self) {
        let mut last = self.last_prune.lock().await;
        if last.is_some_and(|at| at.elapsed() < self.prune_interval) {
            return;
        }
        *last = Some(Instant::now());
        drop(last);

        let dir = self.artifact_dir.clone();
        let retention_days = self.artifact_retention_days;
        tokio::spawn(async move {
            if let Err(e) = prune_artifacts(&dir, retention_days).await {
                warn!(error = %e, "artifact prune sweep failed");
            }
        });
    }

    async fn mutate(&self, id: &str, f: impl FnOnce(&mut AgentSession)) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::session(id, "unknown agent session"))?;
        f(session);
        session.updated_at = Utc::now();
        Ok(())
    }
}

/// Fire the graceful-then-forceful sequence without blocking the stream loop.
fn escalate_termination(control: crate::adapter::WorkerControl) {
    tokio::spawn(async move {
        control.terminate(TermSignal::Graceful);
        tokio::time::sleep(TERMINATION_GRACE).await;
        control.terminate(TermSignal::Forceful);
    });
}

async fn write_artifact(
    file: &mut tokio::fs::File,
    path: &Path,
    text: &str,
    counter: &mut usize,
) -> Result<()> {
    file.write_all(text.as_bytes())
        .await
        .map_err(|e| Error::filesystem(path.display().to_string(), e.to_string()))?;
    *counter += text.len();
    Ok(())
}

async fn prune_artifacts(dir: &Path, retention_days: i64) -> Result<()> {
    let cutoff = std::time::SystemTime::now()
        - Duration::from_secs((retention_days.max(0) as u64) * 24 * 3600);
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::filesystem(dir.display().to_string(), e.to_string())),
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let stale = metadata
            .modified()
            .map(|modified| modified < cutoff)
            .unwrap_or(false);
        if stale {
            debug!(path = %entry.path().display(), "pruning aged artifact");
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
    Ok(())
}

/// Derive the semantic side-effect of one tool call.
fn apply_side_effect(session: &mut AgentSession, tool: &str, input: &Value, at: DateTime<Utc>) {
    let path = || {
        input
            .get("path")
            .or_else(|| input.get("file_path"))
            .or_else(|| input.get("filename"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
    };

    match tool {
        "write_file" | "save_file" | "create_file" => {
            if let Some(path) = path() {
                if session.side_effects.previously_touched(&path) {
                    session.side_effects.modified.insert(path);
                } else {
                    session.side_effects.created.insert(path);
                }
            }
        }
        "read_file" | "view_file" => {
            if let Some(path) = path() {
                session.side_effects.read.insert(path);
            }
        }
        "delete_file" | "remove_file" => {
            if let Some(path) = path() {
                session.side_effects.deleted.insert(path);
            }
        }
        "run_shell_command" | "shell" | "execute" | "bash" => {
            let command = input
                .get("command")
                .or_else(|| input.get("cmd"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let exit_status = input.get("exit_status").and_then(Value::as_i64);
            session.shell_commands.push(ShellRecord {
                command,
                exit_status,
                at,
            });
        }
        _ => {}
    }
}

/// Map a non-zero worker exit code to an actionable message.
fn describe_exit(code: i32, stderr: &str) -> String {
    let base = match code {
        1 => "task failed; check the task description".to_string(),
        41 => "authentication failure".to_string(),
        44 => "filesystem access denied".to_string(),
        53 => "session too long".to_string(),
        137 => "worker killed (timeout or memory)".to_string(),
        other => format!("worker exited with code {}", other),
    };
    let stderr = stderr.trim();
    if stderr.is_empty() {
        base
    } else {
        format!("{}: {}", base, truncate_middle(stderr, 400))
    }
}
