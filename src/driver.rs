//! The execution driver.
//!
//! One entry point, [`Driver::execute`], takes a validated request
//! through the whole pipeline: credential sweep, cost gate, routing,
//! cache lookup, worker dispatch (CLI child or marketplace HTTP),
//! stream consumption, and bookkeeping. Authentication failures walk the
//! credential chain transparently; rate-limit and model errors get one
//! opportunistic retry on a faster alternative. Every invocation runs
//! under a deadline and can be cancelled; both trip the same
//! graceful-then-forceful termination sequence.
//!
//! The stderr classifier's word lists are deliberately configuration
//! ([`StderrLexicon`]): worker CLIs restyle their error text often
//! enough that operators need to extend them without recompiling.

use crate::adapter::{InvocationOptions, TermSignal, WorkerControl, WorkerExit};
use crate::agent::{AgentLimits, AgentRunOutcome, AgentRunSpec};
use crate::auth::Credential;
use crate::conversation::Role;
use crate::events::WorkerEvent;
use crate::services::Services;
use crate::types::{ExecutionOutcome, TaskRequest, TokenUsage};
use crate::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default deadline for one worker invocation.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(120);

/// Grace period between the polite and the forceful termination signal.
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Caller-held handle for cancelling an in-flight execution.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Create a handle and the receiver the driver watches.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Cancel the execution. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Per-call knobs beyond the request itself.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Deadline for the invocation; [`DEFAULT_DEADLINE`] when absent.
    pub deadline: Option<Duration>,
    /// Cancellation receiver from [`CancelHandle::new`].
    pub cancel: Option<watch::Receiver<bool>>,
}

/// How a failed worker invocation is classified from its stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    RateLimit,
    /// Unsupported or unknown model; treated like a rate limit for
    /// fallback purposes.
    ModelError,
    AuthError,
    Generic,
}

/// Substring word lists used to classify worker stderr.
#[derive(Debug, Clone)]
pub struct StderrLexicon {
    pub rate_limit: Vec<String>,
    pub model: Vec<String>,
    pub auth: Vec<String>,
}

impl Default for StderrLexicon {
    fn default() -> Self {
        let list = |words: &[&str]| words.iter().map(|w| w.to_string()).collect();
        Self {
            rate_limit: list(&[
                "rate limit",
                "quota",
                "429",
                "resource exhausted",
                "resource_exhausted",
                "too many requests",
            ]),
            model: list(&[
                "model not found",
                "unknown model",
                "unsupported model",
                "invalid model",
            ]),
            auth: list(&[
                "unauthenticated",
                "unauthorized",
                "401",
                "403",
                "invalid api key",
                "permission denied",
                "credential",
            ]),
        }
    }
}

impl StderrLexicon {
    /// Classify stderr text by substring match, in fixed priority order.
    pub fn classify(&self, stderr: &str) -> FailureClass {
        let lower = stderr.to_lowercase();
        let hits = |words: &[String]| words.iter().any(|w| lower.contains(w.as_str()));
        if hits(&self.rate_limit) {
            FailureClass::RateLimit
        } else if hits(&self.model) {
            FailureClass::ModelError
        } else if hits(&self.auth) {
            FailureClass::AuthError
        } else {
            FailureClass::Generic
        }
    }
}

/// Collected result of one CLI child run.
struct CliReply {
    text: String,
    usage: TokenUsage,
    external_session_id: Option<String>,
    exit: WorkerExit,
    stream_error: Option<String>,
}

/// The execution engine. Cheap to clone via the shared services handle.
#[derive(Clone)]
pub struct Driver {
    services: Arc<Services>,
    lexicon: Arc<StderrLexicon>,
}

impl Driver {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            lexicon: Arc::new(StderrLexicon::default()),
        }
    }

    pub fn with_lexicon(services: Arc<Services>, lexicon: StderrLexicon) -> Self {
        Self {
            services,
            lexicon: Arc::new(lexicon),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Execute a request with default options.
    pub async fn execute(&self, request: &TaskRequest) -> Result<ExecutionOutcome> {
        self.execute_with(request, ExecOptions::default()).await
    }

    /// Execute a request under an explicit deadline and/or cancellation.
    pub async fn execute_with(
        &self,
        request: &TaskRequest,
        options: ExecOptions,
    ) -> Result<ExecutionOutcome> {
        let services = &self.services;
        services.auth.write().await.sweep();
        services
            .ledger
            .write()
            .await
            .check_daily_limit(services.config.cost_limit_usd_per_day)?;

        let deadline = options.deadline.unwrap_or(DEFAULT_DEADLINE);
        let mut credential = services
            .auth
            .read()
            .await
            .active()
            .ok_or_else(|| Error::config("no credentials configured"))?;
        let mut auth_attempts: Vec<String> = Vec::new();
        let mut model_retry_done = false;
        let mut prefer_fast = request.prefer_fast;

        loop {
            let hint = request
                .model_hint
                .as_deref()
                .or(services.config.default_model.as_deref());
            let choice = {
                let mut rate = services.rate.write().await;
                services.router.select(
                    &request.task,
                    request.tool_tag.as_deref(),
                    hint,
                    prefer_fast,
                    credential.method(),
                    &mut rate,
                )
            };
            let model = choice.model.name;
            debug!(model, complexity = %choice.complexity, "routed");

            // Cache lookup keys on the actually-selected model.
            if request.cache_enabled {
                if let Some(entry) = services.cache.write().await.get(&request.task, model) {
                    debug!(model, "cache hit");
                    return Ok(ExecutionOutcome {
                        response_text: entry.response,
                        model: model.to_string(),
                        auth_used: credential.label().to_string(),
                        usage: TokenUsage::default(),
                        cached: true,
                        external_session_id: None,
                    });
                }
            }

            // Marketplace-gated models run over HTTP, not the CLI.
            if choice.model.is_marketplace() {
                let key = credential
                    .secret()
                    .ok_or_else(|| Error::config("marketplace model without marketplace key"))?
                    .to_string();
                let reply = self
                    .services
                    .marketplace
                    .complete(&key, model, None, &request.task)
                    .await?;
                return self
                    .finish_success(
                        request,
                        model,
                        &credential,
                        reply.text,
                        reply.usage,
                        None,
                    )
                    .await;
            }

            let reply = self
                .run_cli(&request.task, model, &credential, request, deadline, &options)
                .await?;

            match reply.exit.code {
                Some(0) => {
                    return self
                        .finish_success(
                            request,
                            model,
                            &credential,
                            reply.text,
                            reply.usage,
                            reply.external_session_id,
                        )
                        .await;
                }
                code => {
                    let mut stderr = reply.exit.stderr.clone();
                    if let Some(event_error) = &reply.stream_error {
                        stderr.push('\n');
                        stderr.push_str(event_error);
                    }
                    let class = if code == Some(41) {
                        FailureClass::AuthError
                    } else {
                        self.lexicon.classify(&stderr)
                    };

                    match class {
                        FailureClass::RateLimit | FailureClass::ModelError => {
                            services.rate.write().await.record_failure(model);
                            if !model_retry_done {
                                // One opportunistic retry on a faster or
                                // otherwise-available alternative.
                                model_retry_done = true;
                                prefer_fast = true;
                                info!(model, "rate limited, retrying with alternative");
                                continue;
                            }
                            return Err(if class == FailureClass::ModelError {
                                Error::model_unavailable(model, excerpt(&stderr))
                            } else {
                                Error::rate_limit(model, excerpt(&stderr))
                            });
                        }
                        FailureClass::AuthError => {
                            let reason = excerpt(&stderr);
                            auth_attempts
                                .push(format!("{}: {}", credential.label(), reason));
                            let next = {
                                let mut auth = services.auth.write().await;
                                auth.record_failure(&credential, &reason);
                                auth.next(&credential)
                            };
                            match next {
                                Some(next_credential) => {
                                    info!(
                                        from = credential.label(),
                                        to = next_credential.label(),
                                        "auth failure, migrating credential"
                                    );
                                    credential = next_credential;
                                    continue;
                                }
                                None => {
                                    return Err(Error::authentication(auth_attempts));
                                }
                            }
                        }
                        FailureClass::Generic => {
                            return Err(Error::process(format!(
                                "worker exited with {:?}: {}",
                                code,
                                excerpt(&stderr)
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Execute one turn of a stored conversation: build the prompt with
    /// embedded history, run it, and append both sides on success.
    pub async fn converse(&self, conversation_id: &str, user_text: &str) -> Result<ExecutionOutcome> {
        let store = &self.services.conversations;
        let prompt = store.build_prompt(conversation_id, user_text).await?;
        let model = store.model_of(conversation_id).await?;

        let request = TaskRequest::builder(prompt)
            .model(model)
            .session_id(conversation_id)
            // History-embedding prompts are unique per turn, so caching
            // them would only pollute the index.
            .cache_enabled(false)
            .build()?;

        let outcome = self.execute(&request).await?;
        store.append(conversation_id, Role::User, user_text).await?;
        store
            .append(conversation_id, Role::Assistant, outcome.response_text.clone())
            .await?;
        Ok(outcome)
    }

    /// Route and run an autonomous agent session.
    pub async fn run_agent(
        &self,
        request: &TaskRequest,
        limits: AgentLimits,
        resume_local_id: Option<String>,
    ) -> Result<AgentRunOutcome> {
        let services = &self.services;
        services.config.ensure_agent_mode()?;
        services.auth.write().await.sweep();

        let credential = services
            .auth
            .read()
            .await
            .active()
            .ok_or_else(|| Error::config("no credentials configured"))?;
        let choice = {
            let mut rate = services.rate.write().await;
            services.router.select(
                &request.task,
                request.tool_tag.as_deref(),
                request.model_hint.as_deref(),
                request.prefer_fast,
                credential.method(),
                &mut rate,
            )
        };

        let spec = AgentRunSpec {
            task: request.task.clone(),
            model: choice.model.name.to_string(),
            working_dir: request.working_dir.clone(),
            context_files: request.context_globs.iter().map(PathBuf::from).collect(),
            limits,
            resume_local_id,
        };
        let outcome = services.agents.run(spec).await?;

        services
            .ledger
            .write()
            .await
            .record(choice.model.name, outcome.usage, credential.is_free());
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn finish_success(
        &self,
        request: &TaskRequest,
        model: &str,
        credential: &Credential,
        text: String,
        usage: TokenUsage,
        external_session_id: Option<String>,
    ) -> Result<ExecutionOutcome> {
        let services = &self.services;
        services.rate.write().await.record_success(model);
        services
            .ledger
            .write()
            .await
            .record(model, usage, credential.is_free());
        if request.cache_enabled {
            services.cache.write().await.set(
                &request.task,
                model,
                &text,
                request.cache_ttl_secs,
            );
        }
        Ok(ExecutionOutcome {
            response_text: text,
            model: model.to_string(),
            auth_used: credential.label().to_string(),
            usage,
            cached: false,
            external_session_id,
        })
    }

    /// Spawn the CLI child and consume its stream under the deadline.
    async fn run_cli(
        &self,
        prompt: &str,
        model: &str,
        credential: &Credential,
        request: &TaskRequest,
        deadline: Duration,
        options: &ExecOptions,
    ) -> Result<CliReply> {
        let invocation = InvocationOptions {
            model: model.to_string(),
            agent_mode: false,
            resume_external_id: None,
            working_dir: request.working_dir.clone(),
            env: credential_env(credential),
        };
        let mut run = self.services.adapter.spawn(prompt, &invocation).await?;

        let deadline_at = Instant::now() + deadline;
        let mut cancel = options.cancel.clone();
        let mut text = String::new();
        let mut usage = TokenUsage::default();
        let mut external_session_id = None;
        let mut stream_error = None;

        loop {
            let event = tokio::select! {
                event = run.events.recv() => event,
                _ = tokio::time::sleep_until(deadline_at) => {
                    escalate_termination(run.control.clone());
                    return Err(Error::timeout("execute", deadline.as_secs()));
                }
                changed = watch_cancel(&mut cancel) => {
                    if changed {
                        escalate_termination(run.control.clone());
                        return Err(Error::cancelled("execute"));
                    }
                    continue;
                }
            };
            let Some(event) = event else { break };

            match event {
                WorkerEvent::Session { id } => external_session_id = Some(id),
                WorkerEvent::Text(chunk) => text.push_str(&chunk),
                WorkerEvent::Usage(u) => usage.add(u),
                WorkerEvent::Error(message) => stream_error = Some(message),
                WorkerEvent::Done {
                    text: final_text,
                    usage: final_usage,
                } => {
                    if let Some(u) = final_usage {
                        usage.add(u);
                    }
                    if let Some(t) = final_text {
                        if text.is_empty() {
                            text = t;
                        }
                    }
                }
                // Tool traffic only appears in agent sessions; a stray
                // record in a plain call carries nothing we report.
                WorkerEvent::ToolUse { .. } | WorkerEvent::ToolResult { .. } => {}
            }
        }

        let remaining = deadline_at.saturating_duration_since(Instant::now());
        let exit = match tokio::time::timeout(remaining, run.exit).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(_)) => WorkerExit {
                code: None,
                stderr: String::new(),
            },
            Err(_) => {
                escalate_termination(run.control.clone());
                return Err(Error::timeout("execute", deadline.as_secs()));
            }
        };

        Ok(CliReply {
            text,
            usage,
            external_session_id,
            exit,
            stream_error,
        })
    }
}

/// Await a cancellation edge; pends forever when no handle was supplied.
/// A dropped handle disables the watch instead of spinning.
async fn watch_cancel(cancel: &mut Option<watch::Receiver<bool>>) -> bool {
    let Some(rx) = cancel.as_mut() else {
        return std::future::pending().await;
    };
    if *rx.borrow() {
        return true;
    }
    if rx.changed().await.is_ok() {
        return *rx.borrow();
    }
    *cancel = None;
    false
}

/// Fire the graceful-then-forceful sequence without blocking the caller.
fn escalate_termination(control: WorkerControl) {
    tokio::spawn(async move {
        control.terminate(TermSignal::Graceful);
        tokio::time::sleep(TERMINATION_GRACE).await;
        control.terminate(TermSignal::Forceful);
    });
}

/// Environment handed to the child for the credential being tried.
fn credential_env(credential: &Credential) -> Vec<(String, String)> {
    match credential {
        Credential::OAuth => Vec::new(),
        Credential::ApiKey { key } => vec![("GEMINI_API_KEY".to_string(), key.clone())],
        Credential::EnterpriseKey {
            key,
            project,
            location,
        } => vec![
            ("GOOGLE_API_KEY".to_string(), key.clone()),
            ("GOOGLE_CLOUD_PROJECT".to_string(), project.clone()),
            ("GOOGLE_CLOUD_LOCATION".to_string(), location.clone()),
            ("GOOGLE_GENAI_USE_VERTEXAI".to_string(), "true".to_string()),
        ],
        // Marketplace keys never reach the CLI path.
        Credential::MarketplaceKey { .. } => Vec::new(),
    }
}

fn excerpt(stderr: &str) -> String {
    crate::types::truncate_middle(stderr.trim(), 400)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::WorkerAdapter;
    use crate::adapter::testing::{ScriptedAdapter, ScriptedRun};
    use crate::config::RelayConfig;

    fn success_run(text: &str) -> ScriptedRun {
        ScriptedRun {
            events: vec![
                WorkerEvent::Session {
                    id: "gem-1".to_string(),
                },
                WorkerEvent::Text(text.to_string()),
                WorkerEvent::Usage(TokenUsage::new(10, 5)),
                WorkerEvent::Done {
                    text: None,
                    usage: None,
                },
            ],
            exit: Some(WorkerExit {
                code: Some(0),
                stderr: String::new(),
            }),
            delay: None,
        }
    }

    fn failed_run(code: i32, stderr: &str) -> ScriptedRun {
        ScriptedRun {
            events: Vec::new(),
            exit: Some(WorkerExit {
                code: Some(code),
                stderr: stderr.to_string(),
            }),
            delay: None,
        }
    }

    fn driver_with(runs: Vec<ScriptedRun>, config: RelayConfig) -> (Driver, Arc<ScriptedAdapter>) {
        let adapter = ScriptedAdapter::new(runs);
        let services = Services::with_state_dir(
            config,
            adapter.clone() as Arc<dyn WorkerAdapter>,
            std::env::temp_dir().join(format!("agent-relay-driver-{}", uuid::Uuid::new_v4())),
        )
        .unwrap();
        (Driver::new(services), adapter)
    }

    #[tokio::test]
    async fn test_execute_success_accumulates() {
        let (driver, _) = driver_with(vec![success_run("the answer")], RelayConfig::default());
        let request = TaskRequest::builder("what is 2+2")
            .tool_tag("ask_gemini")
            .build()
            .unwrap();

        let outcome = driver.execute(&request).await.unwrap();
        assert_eq!(outcome.response_text, "the answer");
        assert_eq!(outcome.model, "gemini-2.5-flash-lite");
        assert_eq!(outcome.auth_used, "oauth");
        assert_eq!(outcome.usage, TokenUsage::new(10, 5));
        assert!(!outcome.cached);
        assert_eq!(outcome.external_session_id.as_deref(), Some("gem-1"));
    }

    #[tokio::test]
    async fn test_second_call_served_from_cache() {
        // Only one scripted run exists; the second call must not spawn.
        let (driver, adapter) = driver_with(vec![success_run("cached!")], RelayConfig::default());
        let request = TaskRequest::builder("what is 2+2")
            .tool_tag("ask_gemini")
            .build()
            .unwrap();

        let first = driver.execute(&request).await.unwrap();
        assert!(!first.cached);

        // Whitespace-only differences hit the same entry.
        let padded = TaskRequest::builder("  what is 2+2  ")
            .tool_tag("ask_gemini")
            .build()
            .unwrap();
        let second = driver.execute(&padded).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.response_text, "cached!");
        assert_eq!(adapter.models_spawned().len(), 1);
    }

    #[tokio::test]
    async fn test_auth_fallback_on_unauthenticated() {
        let config = RelayConfig {
            api_key: Some("AIzaSyTestKey123456".to_string()),
            ..Default::default()
        };
        let (driver, _) = driver_with(
            vec![failed_run(1, "request failed: unauthenticated"), success_run("ok")],
            config,
        );
        let request = TaskRequest::builder("what is 2+2")
            .tool_tag("ask_gemini")
            .cache_enabled(false)
            .build()
            .unwrap();

        let outcome = driver.execute(&request).await.unwrap();
        assert_eq!(outcome.auth_used, "api-key");

        // The failed credential carries a fresh stamp.
        let report = driver.services().auth.read().await.failure_report();
        assert_eq!(report.len(), 1);
        assert!(report[0].starts_with("oauth:"));
    }

    #[tokio::test]
    async fn test_auth_exhaustion_aggregates_attempts() {
        let config = RelayConfig {
            api_key: Some("AIzaSyTestKey123456".to_string()),
            ..Default::default()
        };
        let (driver, _) = driver_with(
            vec![
                failed_run(41, "unauthenticated"),
                failed_run(41, "invalid api key"),
            ],
            config,
        );
        let request = TaskRequest::builder("what is 2+2")
            .cache_enabled(false)
            .build()
            .unwrap();

        let err = driver.execute(&request).await.unwrap_err();
        match err {
            Error::Authentication { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts[0].starts_with("oauth:"));
                assert!(attempts[1].starts_with("api-key:"));
            }
            other => panic!("expected Authentication, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_retries_faster_alternative() {
        let (driver, adapter) = driver_with(
            vec![failed_run(1, "429 quota exceeded"), success_run("fallback answer")],
            RelayConfig::default(),
        );
        let request = TaskRequest::builder("implement a cache")
            .tool_tag("draft_code_implementation")
            .cache_enabled(false)
            .build()
            .unwrap();

        let outcome = driver.execute(&request).await.unwrap();
        let models = adapter.models_spawned();
        assert_eq!(models[0], "gemini-2.5-pro");
        assert_ne!(models[1], "gemini-2.5-pro");
        assert_eq!(outcome.model, models[1]);

        // The failure was recorded against the limited model.
        let stats = driver.services().rate.write().await.stats();
        assert_eq!(stats.models["gemini-2.5-pro"].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_generic_failure_surfaces_process_error() {
        let (driver, _) = driver_with(
            vec![failed_run(1, "segmentation fault")],
            RelayConfig::default(),
        );
        let request = TaskRequest::builder("what is 2+2")
            .cache_enabled(false)
            .build()
            .unwrap();

        let err = driver.execute(&request).await.unwrap_err();
        assert!(matches!(err, Error::Process(_)));
        assert!(err.to_string().contains("segmentation fault"));
    }

    #[tokio::test]
    async fn test_deadline_trips_timeout() {
        let (driver, _) = driver_with(
            vec![ScriptedRun {
                events: Vec::new(),
                exit: None,
                delay: Some(Duration::from_secs(30)),
            }],
            RelayConfig::default(),
        );
        let request = TaskRequest::builder("slow task")
            .cache_enabled(false)
            .build()
            .unwrap();

        let err = driver
            .execute_with(
                &request,
                ExecOptions {
                    deadline: Some(Duration::from_millis(50)),
                    cancel: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_trips_cancelled() {
        let (driver, _) = driver_with(
            vec![ScriptedRun {
                events: Vec::new(),
                exit: None,
                delay: Some(Duration::from_secs(30)),
            }],
            RelayConfig::default(),
        );
        let request = TaskRequest::builder("slow task")
            .cache_enabled(false)
            .build()
            .unwrap();

        let (handle, rx) = CancelHandle::new();
        let driver_clone = driver.clone();
        let task = tokio::spawn(async move {
            driver_clone
                .execute_with(
                    &request,
                    ExecOptions {
                        deadline: None,
                        cancel: Some(rx),
                    },
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_cost_limit_gates_execution() {
        let config = RelayConfig {
            cost_limit_usd_per_day: Some(0.000001),
            api_key: Some("AIzaSyTestKey123456".to_string()),
            ..Default::default()
        };
        let (driver, _) = driver_with(vec![success_run("one")], config);
        let request = TaskRequest::builder("what is 2+2")
            .cache_enabled(false)
            .build()
            .unwrap();

        // Pre-accrue paid cost past the ceiling; the next call is gated
        // before anything spawns.
        driver
            .services()
            .ledger
            .write()
            .await
            .record("gemini-2.5-pro", TokenUsage::new(1_000_000, 0), false);

        let err = driver.execute(&request).await.unwrap_err();
        assert!(matches!(err, Error::Budget { .. }));
    }

    #[tokio::test]
    async fn test_converse_threads_history() {
        let (driver, adapter) = driver_with(
            vec![success_run("Paris."), success_run("About 2.1 million.")],
            RelayConfig::default(),
        );
        let store = &driver.services().conversations;
        let id = store
            .start(
                "geography",
                "gemini-2.5-flash",
                Some("Answer tersely.".to_string()),
                None,
            )
            .await;

        let first = driver.converse(&id, "Capital of France?").await.unwrap();
        assert_eq!(first.response_text, "Paris.");

        let second = driver.converse(&id, "Its population?").await.unwrap();
        assert_eq!(second.response_text, "About 2.1 million.");

        // The second prompt embedded the first exchange.
        let prompts = adapter.prompts();
        assert!(prompts[1].contains("[user]: Capital of France?"));
        assert!(prompts[1].contains("[assistant]: Paris."));
        assert!(prompts[1].contains("[user]: Its population?"));
        assert!(prompts[1].starts_with("Answer tersely."));

        let stats = store.stats(&id).await.unwrap();
        assert_eq!(stats.message_count, 4);
        assert_eq!(stats.user_messages, 2);
        assert_eq!(stats.assistant_messages, 2);
    }

    #[test]
    fn test_stderr_lexicon_classification() {
        let lexicon = StderrLexicon::default();
        assert_eq!(
            lexicon.classify("Error: 429 Too Many Requests"),
            FailureClass::RateLimit
        );
        assert_eq!(
            lexicon.classify("RESOURCE_EXHAUSTED: quota"),
            FailureClass::RateLimit
        );
        assert_eq!(
            lexicon.classify("model not found: gemini-9"),
            FailureClass::ModelError
        );
        assert_eq!(
            lexicon.classify("request unauthenticated"),
            FailureClass::AuthError
        );
        assert_eq!(lexicon.classify("segfault"), FailureClass::Generic);
    }

    #[test]
    fn test_credential_env_mapping() {
        assert!(credential_env(&Credential::OAuth).is_empty());
        let env = credential_env(&Credential::ApiKey {
            key: "k1".to_string(),
        });
        assert_eq!(env, vec![("GEMINI_API_KEY".to_string(), "k1".to_string())]);

        let env = credential_env(&Credential::EnterpriseKey {
            key: "k2".to_string(),
            project: "proj".to_string(),
            location: "us-central1".to_string(),
        });
        assert!(env.iter().any(|(k, _)| k == "GOOGLE_CLOUD_PROJECT"));
        assert!(env.iter().any(|(k, v)| k == "GOOGLE_GENAI_USE_VERTEXAI" && v == "true"));
    }
}
