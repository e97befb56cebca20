//! Worker adapters: the capability seam between the orchestration core
//! and a concrete worker CLI family.
//!
//! [`WorkerAdapter`] is the full capability record — spawn a run, list
//! and price models, name the default. The driver and the agent
//! supervisor depend only on this trait, so a test (or a future worker
//! family) can slot in without touching either.
//!
//! [`GeminiCli`] is the production implementation: it composes the argv
//! for the Gemini CLI, pipes the prompt over stdin, and turns the
//! child's newline-delimited records into [`WorkerEvent`]s on a channel.
//! Arguments are always passed as an array; no shell interpretation is
//! ever used. On Windows, interpreter-shaped command filenames (`.cmd`,
//! `.bat`) cannot be spawned directly, so the invocation is wrapped in
//! the OS command processor with a literal-argv directive; the arguments
//! still travel as an array, so nothing is shell-expanded.

use crate::events::{LineAssembler, WorkerEvent, decode_line};
use crate::types::{ModelSpec, RELIABLE_DEFAULT_MODEL, TokenUsage, find_model, known_models};
use crate::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Options for one worker invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationOptions {
    /// Model passed on `--model`.
    pub model: String,
    /// Tools enabled: adds `--yolo`, omits `--extensions none`.
    pub agent_mode: bool,
    /// Rejoin a previous CLI-native session via `--resume`.
    pub resume_external_id: Option<String>,
    /// Working directory for the child.
    pub working_dir: Option<String>,
    /// Extra environment for the child, e.g. the credential being tried.
    pub env: Vec<(String, String)>,
}

/// How the worker exited.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    /// Exit code; `None` when the child was killed by a signal.
    pub code: Option<i32>,
    /// Collected standard-error output.
    pub stderr: String,
}

/// Termination severity, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    /// Ask the child to stop (SIGTERM on unix).
    Graceful,
    /// Kill it.
    Forceful,
}

/// Handle for terminating an in-flight run. Cloneable; safe to signal
/// after the child has already exited.
#[derive(Debug, Clone)]
pub struct WorkerControl {
    pid: Option<u32>,
    tx: mpsc::UnboundedSender<TermSignal>,
}

impl WorkerControl {
    pub fn terminate(&self, signal: TermSignal) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let sig = match signal {
                TermSignal::Graceful => libc::SIGTERM,
                TermSignal::Forceful => libc::SIGKILL,
            };
            unsafe {
                libc::kill(pid as libc::pid_t, sig);
            }
            return;
        }
        // Elsewhere the owning task applies the signal between reads.
        let _ = self.tx.send(signal);
    }
}

/// One in-flight worker run: a lazy event sequence, a completion signal,
/// and a termination handle.
#[derive(Debug)]
pub struct WorkerRun {
    pub events: mpsc::Receiver<WorkerEvent>,
    pub exit: oneshot::Receiver<WorkerExit>,
    pub control: WorkerControl,
}

impl WorkerRun {
    /// Assemble a run from raw parts. Used by in-process test adapters;
    /// the resulting control handle has no process behind it.
    pub fn from_parts(
        events: mpsc::Receiver<WorkerEvent>,
        exit: oneshot::Receiver<WorkerExit>,
        control_tx: mpsc::UnboundedSender<TermSignal>,
    ) -> Self {
        Self {
            events,
            exit,
            control: WorkerControl {
                pid: None,
                tx: control_tx,
            },
        }
    }
}

/// Capability record for one worker family.
#[async_trait]
pub trait WorkerAdapter: Send + Sync {
    /// Spawn a run: deliver the prompt, stream back events.
    async fn spawn(&self, prompt: &str, options: &InvocationOptions) -> Result<WorkerRun>;

    /// Models this family can serve.
    fn list_models(&self) -> &[ModelSpec] {
        known_models()
    }

    /// The model used when nothing better is available.
    fn default_model(&self) -> &str {
        RELIABLE_DEFAULT_MODEL
    }

    /// Cost in USD for a completed call.
    fn estimate_cost(&self, model: &str, usage: TokenUsage) -> f64 {
        find_model(model)
            .map(|spec| spec.cost(usage.input_tokens, usage.output_tokens))
            .unwrap_or(0.0)
    }

    /// The program invoked, for resume instructions shown to humans.
    fn program_name(&self) -> &str;
}

// ============================================================================
// GEMINI CLI ADAPTER
// ============================================================================

/// Adapter for the Gemini CLI worker family.
#[derive(Debug, Clone)]
pub struct GeminiCli {
    /// Program to execute. Defaults to `gemini`.
    pub program: String,
    /// Arguments inserted before the composed flags. Lets tests target a
    /// protocol-speaking stub script.
    pub leading_args: Vec<String>,
}

impl Default for GeminiCli {
    fn default() -> Self {
        Self {
            program: "gemini".to_string(),
            leading_args: Vec::new(),
        }
    }
}

impl GeminiCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Compose the full argv for an invocation.
    fn compose_args(&self, options: &InvocationOptions) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.push("--model".to_string());
        args.push(options.model.clone());
        args.push("--output-format".to_string());
        args.push("stream-json".to_string());
        if options.agent_mode {
            args.push("--yolo".to_string());
        } else {
            args.push("--extensions".to_string());
            args.push("none".to_string());
        }
        if let Some(id) = &options.resume_external_id {
            args.push("--resume".to_string());
            args.push(id.clone());
        }
        args
    }
}

/// Resolve the (program, argv) pair for a platform. On Windows,
/// interpreter-shaped filenames are wrapped in `cmd /c` with the real
/// argv passed through as an array.
fn platform_command(program: &str, args: Vec<String>, windows: bool) -> (String, Vec<String>) {
    let lower = program.to_lowercase();
    let interpreter_shaped = lower.ends_with(".cmd") || lower.ends_with(".bat");
    if windows && interpreter_shaped {
        let mut wrapped = vec!["/c".to_string(), program.to_string()];
        wrapped.extend(args);
        ("cmd".to_string(), wrapped)
    } else {
        (program.to_string(), args)
    }
}

#[async_trait]
impl WorkerAdapter for GeminiCli {
    async fn spawn(&self, prompt: &str, options: &InvocationOptions) -> Result<WorkerRun> {
        let (program, args) =
            platform_command(&self.program, self.compose_args(options), cfg!(windows));

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &options.env {
            command.env(key, value);
        }

        debug!(program = %program, model = %options.model, "spawning worker");
        let mut child = command
            .spawn()
            .map_err(|e| Error::process(format!("failed to spawn `{}`: {}", program, e)))?;
        let pid = child.id();

        // Prompt goes over stdin, then the pipe is closed. This sidesteps
        // argv length limits entirely.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::process("worker stdin unavailable"))?;
        let prompt_bytes = prompt.as_bytes().to_vec();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&prompt_bytes).await {
                warn!(error = %e, "failed writing prompt to worker stdin");
            }
            drop(stdin);
        });

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::process("worker stdout unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::process("worker stderr unavailable"))?;

        let (event_tx, event_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<TermSignal>();

        // Single owner of the child: reads stdout into events, then reaps
        // the exit status and the collected stderr.
        tokio::spawn(async move {
            let mut assembler = LineAssembler::new();
            let mut buf = [0u8; 4096];
            let mut control_open = true;

            loop {
                tokio::select! {
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            for line in assembler.feed(&buf[..n]) {
                                if let Some(event) = decode_line(&line) {
                                    if event_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "worker stdout read failed");
                            break;
                        }
                    },
                    // Channel-delivered signals only matter on platforms
                    // without pid-based kill; unix handles them in-line in
                    // WorkerControl::terminate.
                    signal = control_rx.recv(), if control_open => {
                        match signal {
                            Some(_) => {
                                let _ = child.start_kill();
                            }
                            None => control_open = false,
                        }
                    },
                }
            }

            if let Some(line) = assembler.flush() {
                if let Some(event) = decode_line(&line) {
                    let _ = event_tx.send(event).await;
                }
            }
            drop(event_tx);

            let mut stderr_buf = Vec::new();
            let _ = stderr.read_to_end(&mut stderr_buf).await;

            let status = child.wait().await;
            let exit = WorkerExit {
                code: status.ok().and_then(|s| s.code()),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            };
            let _ = exit_tx.send(exit);
        });

        Ok(WorkerRun {
            events: event_rx,
            exit: exit_rx,
            control: WorkerControl {
                pid,
                tx: control_tx,
            },
        })
    }

    fn program_name(&self) -> &str {
        &self.program
    }
}
