//! Agent supervisor: manages concurrent worker-CLI processes.
//!
//! The supervisor owns the set of in-flight and historical agent records,
//! wraps the process runner, and adds liveness diagnostics, output capture,
//! and crash-safe cross-process persistence. All bookkeeping happens on the
//! control thread; worker processes run concurrently as OS processes and
//! report back through the runner's event stream.
//!
//! Every timer and stream callback captures the record's `run_token` at
//! spawn time and re-checks it when it fires: a mismatch means the process
//! instance it describes is gone (killed, restarted) and the callback is a
//! no-op. This is what keeps a late exit event from overwriting newer state.

pub mod events;
pub mod record;
pub mod registry;
pub mod runner;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{FailureKind, ForemanError, Result};
use events::{AgentEvent, EventContext, OutputStream, RunOutcome};
use record::{AgentRecord, AgentStatus, AgentView};
use registry::AgentRegistry;
use runner::{pid_alive, ProcessEvent, ProcessHandle, ProcessRunner, ProcessSpec};

/// Debounce window for coalescing non-terminal registry flushes.
const FLUSH_DEBOUNCE_MS: u64 = 200;

/// Broadcast capacity per agent subscription.
const SUBSCRIBER_CAPACITY: usize = 256;

/// Liveness-timer configuration for supervised agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// One diagnostic if no output arrives within this window after spawn.
    #[serde(default = "default_startup_silence_timeout_ms")]
    pub startup_silence_timeout_ms: u64,

    /// Interval between elapsed/idle heartbeat diagnostics.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Idle time after which escalation diagnostics begin (one per
    /// additional multiple of this threshold).
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,

    /// Default execution timeout for run-to-completion dispatches.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_startup_silence_timeout_ms() -> u64 {
    15_000
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_idle_threshold_ms() -> u64 {
    120_000
}
fn default_timeout_ms() -> u64 {
    1_800_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_silence_timeout_ms: default_startup_silence_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            idle_threshold_ms: default_idle_threshold_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Hook fired when an agent reaches FAILED.
///
/// Injected at construction time so the supervisor never has to reach into
/// the state machine at runtime.
pub trait AgentFailureHook: Send + Sync {
    fn on_agent_failure(&self, view: &AgentView, summary: &str);
}

/// Input for `start` / `run_to_completion`.
#[derive(Debug, Clone)]
pub struct StartAgentInput {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub adapter_id: Option<String>,
    pub phase_id: Option<String>,
    pub task_id: Option<String>,
    pub project_name: Option<String>,
    /// Prompt delivered on stdin, closed after writing.
    pub stdin: Option<String>,
    /// Execution timeout override; `None` uses the configured default for
    /// run-to-completion and no timeout for detached starts.
    pub timeout_ms: Option<u64>,
    /// Capability gate: only vetted command builders may spawn processes.
    pub approved_adapter_spawn: bool,
}

impl StartAgentInput {
    /// Minimal input with the capability flag set.
    #[must_use]
    pub fn approved(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            cwd: cwd.into(),
            adapter_id: None,
            phase_id: None,
            task_id: None,
            project_name: None,
            stdin: None,
            timeout_ms: None,
            approved_adapter_spawn: true,
        }
    }
}

/// Result of a run-to-completion dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedRun {
    pub command: String,
    pub args: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Runtime state of one process generation; dropped once the generation
/// settles or is superseded.
struct SpawnRuntime {
    handle: ProcessHandle,
    spawned_at: Instant,
    last_output_at: Option<Instant>,
    stdout: String,
    stderr: String,
    timed_out: bool,
    completion: Option<oneshot::Sender<Result<CompletedRun>>>,
}

struct LiveAgent {
    record: AgentRecord,
    spec: ProcessSpec,
    effective_timeout_ms: u64,
    runtime: Option<SpawnRuntime>,
}

struct Inner {
    config: SupervisorConfig,
    runner: Arc<dyn ProcessRunner>,
    registry: AgentRegistry,
    agents: Mutex<HashMap<Uuid, LiveAgent>>,
    subscribers: Mutex<HashMap<Uuid, broadcast::Sender<AgentEvent>>>,
    flush_scheduled: AtomicBool,
    failure_hook: Option<Arc<dyn AgentFailureHook>>,
}

/// Supervisor over a set of worker-CLI processes.
#[derive(Clone)]
pub struct AgentSupervisor {
    inner: Arc<Inner>,
}

impl AgentSupervisor {
    /// Create a supervisor persisting its registry under `registry_dir`.
    #[must_use]
    pub fn new(
        registry_dir: impl AsRef<Path>,
        runner: Arc<dyn ProcessRunner>,
        config: SupervisorConfig,
    ) -> Self {
        Self::build(registry_dir, runner, config, None)
    }

    /// Create a supervisor with a failure hook injected.
    #[must_use]
    pub fn with_failure_hook(
        registry_dir: impl AsRef<Path>,
        runner: Arc<dyn ProcessRunner>,
        config: SupervisorConfig,
        hook: Arc<dyn AgentFailureHook>,
    ) -> Self {
        Self::build(registry_dir, runner, config, Some(hook))
    }

    fn build(
        registry_dir: impl AsRef<Path>,
        runner: Arc<dyn ProcessRunner>,
        config: SupervisorConfig,
        failure_hook: Option<Arc<dyn AgentFailureHook>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                runner,
                registry: AgentRegistry::new(registry_dir),
                agents: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                flush_scheduled: AtomicBool::new(false),
                failure_hook,
            }),
        }
    }

    // ========================================================================
    // Spawning
    // ========================================================================

    /// Start a detached agent, returning its view once the RUNNING record is
    /// persisted. A second process observing the same registry sees the new
    /// agent without delay.
    pub async fn start(&self, input: StartAgentInput) -> Result<AgentView> {
        let id = self.spawn_generation(input, false, None).await?;
        self.view(id)
    }

    /// Dispatch a worker and wait for it to terminate.
    ///
    /// # Errors
    ///
    /// Rejects with a classified [`ForemanError::WorkerFailed`]
    /// (auth | network | missing-binary | timeout | unknown) when the
    /// process fails, times out, or is killed before settling.
    pub async fn run_to_completion(&self, input: StartAgentInput) -> Result<CompletedRun> {
        let (tx, rx) = oneshot::channel();
        self.spawn_generation(input, true, Some(tx)).await?;
        rx.await.unwrap_or_else(|_| {
            Err(ForemanError::WorkerFailed {
                kind: FailureKind::Unknown,
                message: "worker superseded before completion".into(),
                exit_code: None,
            })
        })
    }

    async fn spawn_generation(
        &self,
        input: StartAgentInput,
        waited: bool,
        completion: Option<oneshot::Sender<Result<CompletedRun>>>,
    ) -> Result<Uuid> {
        if !input.approved_adapter_spawn {
            return Err(ForemanError::spawn_blocked(
                "approved_adapter_spawn was not set by a vetted command builder",
            ));
        }

        let mut record = AgentRecord::new(
            &input.name,
            &input.command,
            input.args.clone(),
            input.cwd.display().to_string(),
        );
        record.view.adapter_id = input.adapter_id.clone();
        record.view.phase_id = input.phase_id.clone();
        record.view.task_id = input.task_id.clone();
        record.view.project_name = input.project_name.clone();
        let id = record.view.id;
        let token = record.run_token;

        let spec = ProcessSpec {
            command: input.command.clone(),
            args: input.args.clone(),
            cwd: input.cwd.clone(),
            stdin: input.stdin.clone(),
        };
        let effective_timeout_ms = match input.timeout_ms {
            Some(ms) => ms,
            None if waited => self.inner.config.timeout_ms,
            None => 0,
        };

        let spawned = match self.inner.runner.spawn(spec.clone()).await {
            Ok(s) => s,
            Err(e) => {
                record.mark_failed(None);
                self.inner.agents.lock().expect("agents lock").insert(
                    id,
                    LiveAgent {
                        record,
                        spec,
                        effective_timeout_ms,
                        runtime: None,
                    },
                );
                flush_now(&self.inner)?;
                return Err(e);
            }
        };

        record.view.pid = spawned.pid;
        {
            let mut agents = self.inner.agents.lock().expect("agents lock");
            agents.insert(
                id,
                LiveAgent {
                    record,
                    spec,
                    effective_timeout_ms,
                    runtime: Some(SpawnRuntime {
                        handle: spawned.handle.clone(),
                        spawned_at: Instant::now(),
                        last_output_at: None,
                        stdout: String::new(),
                        stderr: String::new(),
                        timed_out: false,
                        completion,
                    }),
                },
            );
        }

        flush_now(&self.inner)?;
        emit(&self.inner, id, |ctx| AgentEvent::TaskLifecycle {
            context: ctx,
            message: "worker process started".into(),
        });
        start_generation_tasks(
            self.inner.clone(),
            id,
            token,
            spawned.events,
            effective_timeout_ms,
        );
        Ok(id)
    }

    // ========================================================================
    // Lifecycle control
    // ========================================================================

    /// Kill an agent: the status flips to STOPPED immediately and the OS
    /// process is signalled without waiting for confirmation.
    pub fn kill(&self, id: Uuid) -> Result<AgentView> {
        let (view, handle) = {
            let mut agents = self.inner.agents.lock().expect("agents lock");
            let agent = agents
                .get_mut(&id)
                .ok_or_else(|| ForemanError::UnknownAgent { id: id.to_string() })?;
            let handle = agent.runtime.as_ref().map(|r| r.handle.clone());
            if agent.record.view.status == AgentStatus::Running {
                agent.record.stop_requested = true;
                agent.record.mark_stopped(None);
            }
            (agent.record.view.clone(), handle)
        };

        flush_now(&self.inner)?;
        if let Some(handle) = handle {
            handle.kill();
        }
        Ok(view)
    }

    /// Restart an agent with identical command/args. The run token is bumped
    /// first so any in-flight callback from the previous process instance is
    /// fenced out.
    pub async fn restart(&self, id: Uuid) -> Result<AgentView> {
        let (spec, token, old_handle, effective_timeout_ms) = {
            let mut agents = self.inner.agents.lock().expect("agents lock");
            let agent = agents
                .get_mut(&id)
                .ok_or_else(|| ForemanError::UnknownAgent { id: id.to_string() })?;

            let old_handle = agent.runtime.take().map(|r| r.handle);
            agent.record.begin_generation();
            (
                agent.spec.clone(),
                agent.record.run_token,
                old_handle,
                agent.effective_timeout_ms,
            )
        };

        if let Some(handle) = old_handle {
            handle.kill();
        }

        let spawned = match self.inner.runner.spawn(spec).await {
            Ok(s) => s,
            Err(e) => {
                {
                    let mut agents = self.inner.agents.lock().expect("agents lock");
                    if let Some(agent) = agents.get_mut(&id) {
                        agent.record.mark_failed(None);
                    }
                }
                flush_now(&self.inner)?;
                return Err(e);
            }
        };

        {
            let mut agents = self.inner.agents.lock().expect("agents lock");
            let agent = agents
                .get_mut(&id)
                .ok_or_else(|| ForemanError::UnknownAgent { id: id.to_string() })?;
            agent.record.view.pid = spawned.pid;
            agent.runtime = Some(SpawnRuntime {
                handle: spawned.handle.clone(),
                spawned_at: Instant::now(),
                last_output_at: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
                completion: None,
            });
        }

        flush_now(&self.inner)?;
        start_generation_tasks(
            self.inner.clone(),
            id,
            token,
            spawned.events,
            effective_timeout_ms,
        );
        self.view(id)
    }

    /// Update task/phase correlation metadata. Clearing the task also clears
    /// the phase.
    pub fn assign(
        &self,
        id: Uuid,
        phase_id: Option<String>,
        task_id: Option<String>,
    ) -> Result<AgentView> {
        let view = {
            let mut agents = self.inner.agents.lock().expect("agents lock");
            let agent = agents
                .get_mut(&id)
                .ok_or_else(|| ForemanError::UnknownAgent { id: id.to_string() })?;
            agent.record.assign(phase_id, task_id);
            agent.record.view.clone()
        };
        schedule_flush(&self.inner);
        Ok(view)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Merge the in-memory record set with the persisted set (dedup by id,
    /// in-memory wins). This is what gives cross-process visibility.
    pub fn list(&self) -> Result<Vec<AgentView>> {
        let disk = self.inner.registry.load()?;
        let agents = self.inner.agents.lock().expect("agents lock");

        let mut merged: Vec<AgentView> = Vec::with_capacity(disk.len() + agents.len());
        let mut seen: HashSet<Uuid> = HashSet::new();
        for view in disk {
            let view = agents
                .get(&view.id)
                .map(|a| a.record.view.clone())
                .unwrap_or(view);
            seen.insert(view.id);
            merged.push(view);
        }
        for agent in agents.values() {
            if !seen.contains(&agent.record.view.id) {
                merged.push(agent.record.view.clone());
            }
        }
        Ok(merged)
    }

    fn view(&self, id: Uuid) -> Result<AgentView> {
        let agents = self.inner.agents.lock().expect("agents lock");
        agents
            .get(&id)
            .map(|a| a.record.view.clone())
            .ok_or_else(|| ForemanError::UnknownAgent { id: id.to_string() })
    }

    /// Subscribe to the live event feed for one agent.
    pub fn subscribe(&self, id: Uuid) -> broadcast::Receiver<AgentEvent> {
        subscriber(&self.inner, id).subscribe()
    }

    /// Emit a free-form task-lifecycle progress message on an agent's feed.
    pub fn publish_task_lifecycle(&self, id: Uuid, message: impl Into<String>) {
        let message = message.into();
        emit(&self.inner, id, |ctx| AgentEvent::TaskLifecycle {
            context: ctx,
            message: message.clone(),
        });
    }

    /// Force a synchronous registry flush.
    pub fn flush_registry(&self) -> Result<()> {
        flush_now(&self.inner)
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Flip persisted RUNNING records whose owning process is dead to
    /// STOPPED. Required after a hard process kill, which leaves no terminal
    /// event to update the registry. Returns the number of records flipped.
    pub fn reconcile_stale_running_agents(&self) -> Result<u32> {
        self.reconcile_running_agents_where(|view| view.pid.is_none_or(|pid| !pid_alive(pid)))
    }

    /// Flip persisted RUNNING records matching `predicate` to STOPPED,
    /// skipping records whose process this supervisor instance owns.
    pub fn reconcile_running_agents_where(
        &self,
        predicate: impl Fn(&AgentView) -> bool,
    ) -> Result<u32> {
        let owned: Vec<Uuid> = {
            let agents = self.inner.agents.lock().expect("agents lock");
            agents
                .values()
                .filter(|a| a.runtime.is_some())
                .map(|a| a.record.view.id)
                .collect()
        };

        let disk = self.inner.registry.load()?;
        let mut flipped = Vec::new();
        for mut view in disk {
            if view.status != AgentStatus::Running || owned.contains(&view.id) {
                continue;
            }
            if predicate(&view) {
                view.status = AgentStatus::Stopped;
                view.stopped_at = Some(chrono::Utc::now());
                flipped.push(view);
            }
        }

        let count = flipped.len() as u32;
        if !flipped.is_empty() {
            debug!("Reconciling {} stale RUNNING agent(s)", count);
            self.inner.registry.merge_write(&flipped)?;
        }
        Ok(count)
    }
}

// ============================================================================
// Control-thread callbacks (all fenced by run token)
// ============================================================================

fn start_generation_tasks(
    inner: Arc<Inner>,
    id: Uuid,
    token: u64,
    mut events: tokio::sync::mpsc::Receiver<ProcessEvent>,
    timeout_ms: u64,
) {
    // Output pump: appends lines and observes settlement.
    {
        let inner = inner.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Stdout(line) => {
                        record_output(&inner, id, token, OutputStream::Stdout, &line);
                    }
                    ProcessEvent::Stderr(line) => {
                        record_output(&inner, id, token, OutputStream::Stderr, &line);
                    }
                    ProcessEvent::Exited { code } => {
                        settle(&inner, id, token, code);
                        break;
                    }
                }
            }
        });
    }

    // Startup silence watchdog.
    if inner.config.startup_silence_timeout_ms > 0 {
        let inner = inner.clone();
        let silence_ms = inner.config.startup_silence_timeout_ms;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(silence_ms)).await;
            let silent = {
                let agents = inner.agents.lock().expect("agents lock");
                agents.get(&id).is_some_and(|a| {
                    a.record.run_token == token
                        && a.record.view.status == AgentStatus::Running
                        && a.runtime
                            .as_ref()
                            .is_some_and(|r| r.last_output_at.is_none())
                })
            };
            if silent {
                append_diagnostic(
                    &inner,
                    id,
                    token,
                    &format!("[diagnostic] no output within {silence_ms}ms of startup"),
                );
            }
        });
    }

    // Heartbeat + idle escalation.
    if inner.config.heartbeat_interval_ms > 0 {
        let inner = inner.clone();
        let heartbeat_ms = inner.config.heartbeat_interval_ms;
        let idle_threshold_ms = inner.config.idle_threshold_ms;
        tokio::spawn(async move {
            let mut last_idle_bucket: u64 = 0;
            let mut ticker = tokio::time::interval(Duration::from_millis(heartbeat_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let snapshot = {
                    let agents = inner.agents.lock().expect("agents lock");
                    agents.get(&id).and_then(|a| {
                        if a.record.run_token != token
                            || a.record.view.status != AgentStatus::Running
                        {
                            return None;
                        }
                        a.runtime.as_ref().map(|r| {
                            let elapsed = r.spawned_at.elapsed();
                            let idle = r.last_output_at.map_or(elapsed, |at| at.elapsed());
                            (elapsed, idle)
                        })
                    })
                };
                let Some((elapsed, idle)) = snapshot else {
                    break;
                };

                append_diagnostic(
                    &inner,
                    id,
                    token,
                    &format!(
                        "[heartbeat] elapsed {}s, idle {}s",
                        elapsed.as_secs(),
                        idle.as_secs()
                    ),
                );

                // One escalation per additional idle-threshold multiple,
                // bucketed so it does not repeat every heartbeat.
                if idle_threshold_ms > 0 {
                    let bucket = idle.as_millis() as u64 / idle_threshold_ms;
                    if bucket >= 1 && bucket > last_idle_bucket {
                        last_idle_bucket = bucket;
                        append_diagnostic(
                            &inner,
                            id,
                            token,
                            &format!(
                                "[diagnostic] worker idle for {bucket}x the {idle_threshold_ms}ms threshold"
                            ),
                        );
                    }
                }
            }
        });
    }

    // Execution timeout.
    if timeout_ms > 0 {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let handle = {
                let mut agents = inner.agents.lock().expect("agents lock");
                agents.get_mut(&id).and_then(|a| {
                    if a.record.run_token != token
                        || a.record.view.status != AgentStatus::Running
                    {
                        return None;
                    }
                    a.runtime.as_mut().map(|r| {
                        r.timed_out = true;
                        r.handle.clone()
                    })
                })
            };
            if let Some(handle) = handle {
                append_diagnostic(
                    &inner,
                    id,
                    token,
                    &format!("[diagnostic] execution timeout after {timeout_ms}ms, killing worker"),
                );
                handle.kill();
            }
        });
    }
}

fn record_output(inner: &Arc<Inner>, id: Uuid, token: u64, stream: OutputStream, line: &str) {
    {
        let mut agents = inner.agents.lock().expect("agents lock");
        let Some(agent) = agents.get_mut(&id) else {
            return;
        };
        if agent.record.run_token != token {
            return;
        }
        agent.record.push_output_line(line, false);
        if let Some(runtime) = agent.runtime.as_mut() {
            runtime.last_output_at = Some(Instant::now());
            match stream {
                OutputStream::Stdout => {
                    runtime.stdout.push_str(line);
                    runtime.stdout.push('\n');
                }
                OutputStream::Stderr => {
                    runtime.stderr.push_str(line);
                    runtime.stderr.push('\n');
                }
                OutputStream::System => {}
            }
        }
    }

    let line = line.to_string();
    emit(inner, id, |ctx| AgentEvent::AdapterOutput {
        context: ctx,
        stream,
        line: line.clone(),
        is_diagnostic: false,
    });
    schedule_flush(inner);
}

fn append_diagnostic(inner: &Arc<Inner>, id: Uuid, token: u64, text: &str) {
    {
        let mut agents = inner.agents.lock().expect("agents lock");
        let Some(agent) = agents.get_mut(&id) else {
            return;
        };
        if agent.record.run_token != token {
            return;
        }
        agent.record.push_output_line(text, true);
    }
    let text = text.to_string();
    emit(inner, id, |ctx| AgentEvent::AdapterOutput {
        context: ctx,
        stream: OutputStream::System,
        line: text.clone(),
        is_diagnostic: true,
    });
    schedule_flush(inner);
}

fn settle(inner: &Arc<Inner>, id: Uuid, token: u64, exit_code: Option<i32>) {
    enum Settled {
        Cancelled,
        TimedOut,
        Success,
        Failure(FailureKind),
    }

    let (settled, completion, run, view) = {
        let mut agents = inner.agents.lock().expect("agents lock");
        let Some(agent) = agents.get_mut(&id) else {
            return;
        };
        if agent.record.run_token != token {
            return;
        }
        let Some(mut runtime) = agent.runtime.take() else {
            return;
        };

        let duration_ms = runtime.spawned_at.elapsed().as_millis() as u64;
        let run = CompletedRun {
            command: agent.record.view.command.clone(),
            args: agent.record.view.args.clone(),
            stdout: std::mem::take(&mut runtime.stdout),
            stderr: std::mem::take(&mut runtime.stderr),
            duration_ms,
        };

        let settled = if runtime.timed_out {
            agent.record.mark_failed(exit_code);
            Settled::TimedOut
        } else if agent.record.stop_requested {
            // kill() already flipped the status; only record the exit code.
            agent.record.mark_stopped(exit_code);
            Settled::Cancelled
        } else if exit_code == Some(0) {
            agent.record.mark_stopped(exit_code);
            Settled::Success
        } else {
            agent.record.mark_failed(exit_code);
            Settled::Failure(runner::classify_failure(exit_code, &run.stderr, false))
        };

        (
            settled,
            runtime.completion.take(),
            run,
            agent.record.view.clone(),
        )
    };

    // Terminal transition: the registry must reflect it before anything
    // observes the settled agent.
    if let Err(e) = flush_now(inner) {
        warn!("Registry flush after settle failed: {}", e);
    }

    let (outcome, summary, result) = match settled {
        Settled::Success => (
            RunOutcome::Success,
            format!("worker exited cleanly in {}ms", run.duration_ms),
            Ok(run),
        ),
        Settled::Cancelled => (
            RunOutcome::Cancelled,
            "worker killed before completion".to_string(),
            Err(ForemanError::WorkerFailed {
                kind: FailureKind::Unknown,
                message: "worker killed before completion".into(),
                exit_code,
            }),
        ),
        Settled::TimedOut => (
            RunOutcome::Failure,
            "worker killed after execution timeout".to_string(),
            Err(ForemanError::WorkerFailed {
                kind: FailureKind::Timeout,
                message: "worker killed after execution timeout".into(),
                exit_code,
            }),
        ),
        Settled::Failure(kind) => {
            let summary = match exit_code {
                Some(code) => format!("worker exited with code {code}"),
                None => "worker terminated by signal".to_string(),
            };
            let message = if run.stderr.is_empty() {
                summary.clone()
            } else {
                format!("{summary}: {}", run.stderr.trim_end())
            };
            (
                RunOutcome::Failure,
                summary,
                Err(ForemanError::WorkerFailed {
                    kind,
                    message,
                    exit_code,
                }),
            )
        }
    };

    if matches!(outcome, RunOutcome::Failure) {
        if let Some(hook) = &inner.failure_hook {
            hook.on_agent_failure(&view, &summary);
        }
    }

    let summary_for_event = summary.clone();
    emit(inner, id, |ctx| AgentEvent::TerminalOutcome {
        context: ctx,
        outcome,
        summary: summary_for_event.clone(),
        exit_code,
    });

    if let Some(tx) = completion {
        let _ = tx.send(result);
    }
}

fn subscriber(inner: &Arc<Inner>, id: Uuid) -> broadcast::Sender<AgentEvent> {
    let mut subscribers = inner.subscribers.lock().expect("subscribers lock");
    subscribers
        .entry(id)
        .or_insert_with(|| broadcast::channel(SUBSCRIBER_CAPACITY).0)
        .clone()
}

fn emit(inner: &Arc<Inner>, id: Uuid, build: impl Fn(EventContext) -> AgentEvent) {
    let context = {
        let agents = inner.agents.lock().expect("agents lock");
        let Some(agent) = agents.get(&id) else {
            return;
        };
        EventContext {
            source: "supervisor".into(),
            agent_id: id,
            adapter_id: agent.record.view.adapter_id.clone(),
            phase_id: agent.record.view.phase_id.clone(),
            task_id: agent.record.view.task_id.clone(),
            project_name: agent.record.view.project_name.clone(),
        }
    };
    let sender = subscriber(inner, id);
    let _ = sender.send(build(context));
}

/// Coalesce non-terminal mutations into one debounced flush.
fn schedule_flush(inner: &Arc<Inner>) {
    if inner.flush_scheduled.swap(true, Ordering::SeqCst) {
        return;
    }
    let inner = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(FLUSH_DEBOUNCE_MS)).await;
        inner.flush_scheduled.store(false, Ordering::SeqCst);
        if let Err(e) = flush_now(&inner) {
            warn!("Debounced registry flush failed: {}", e);
        }
    });
}

/// Synchronous flush: snapshot every record and merge-write the registry.
fn flush_now(inner: &Arc<Inner>) -> Result<()> {
    let views: Vec<AgentView> = {
        let agents = inner.agents.lock().expect("agents lock");
        agents.values().map(|a| a.record.view.clone()).collect()
    };
    inner.registry.merge_write(&views)
}
