//! Child-process execution engine.
//!
//! Each active execution owns one reader task per output pipe, both feeding
//! a single bounded channel, and one engine task that drains the channel in
//! read order, drives the state machine, commits persistence, and publishes
//! deltas. Persistence never drops a line (the disk-writer path blocks);
//! fan-out may drop for lagging subscribers (see `hub.rs`).
//!
//! Executions are isolated: the only shared state is the store handle, the
//! hub, and the active-execution registry.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::EngineError;
use crate::files::{format_log_line, FileStore, LogWriterHandle};
use crate::hub::{EventHub, HubEvent};
use crate::marker::{parse_line, MarkerEvent};
use crate::models::{
    Artifact, Execution, ExecutionDetail, ExecutionStatus, LogEntry, LogLevel, Step, StepStatus,
    StreamKind,
};
use crate::state::{ExecutionState, StateChange};
use crate::store::StoreHandle;

/// How long a cancelled child gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Bounded ingest channel between the pipe readers and the engine task.
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Per-step ring of recent log entries kept for snapshots.
const RECENT_LOG_CAPACITY: usize = 1024;

/// How many recent entries per step an `initial_state` snapshot carries.
const SNAPSHOT_LOG_TAIL: usize = 50;

/// Why an execution is being torn down early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    Requested,
    Timeout(u64),
    Shutdown,
}

impl CancelReason {
    fn execution_error(&self) -> String {
        match self {
            Self::Requested => "cancelled".to_string(),
            Self::Timeout(secs) => format!("execution timed out after {}s", secs),
            Self::Shutdown => "server_shutdown".to_string(),
        }
    }

    fn step_error(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            _ => "cancelled",
        }
    }
}

/// One line (or line fragment) read from a child pipe.
#[derive(Debug)]
struct RawLine {
    stream: StreamKind,
    content: String,
    truncated: bool,
}

/// Live, in-memory view of one active execution. Shared between the engine
/// task and snapshot builders; locked only for short critical sections,
/// never across an await.
pub struct LiveState {
    pub state: ExecutionState,
    recent: HashMap<String, VecDeque<LogEntry>>,
    recent_unassigned: VecDeque<LogEntry>,
}

impl LiveState {
    fn new(execution: Execution) -> Self {
        Self {
            state: ExecutionState::new(execution),
            recent: HashMap::new(),
            recent_unassigned: VecDeque::new(),
        }
    }

    fn push_recent(&mut self, entry: &LogEntry) {
        let ring = match &entry.step_id {
            Some(step_id) => self.recent.entry(step_id.clone()).or_default(),
            None => &mut self.recent_unassigned,
        };
        if ring.len() >= RECENT_LOG_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(entry.clone());
    }

    /// Execution + steps with their recent log tails.
    fn detail(&self, artifacts: Vec<Artifact>) -> ExecutionDetail {
        let steps = self
            .state
            .steps
            .iter()
            .map(|s| {
                let mut step = s.clone();
                if let Some(ring) = self.recent.get(&s.id) {
                    let skip = ring.len().saturating_sub(SNAPSHOT_LOG_TAIL);
                    step.logs = ring.iter().skip(skip).cloned().collect();
                }
                step
            })
            .collect();
        ExecutionDetail {
            execution: self.state.execution.clone(),
            steps,
            artifacts,
        }
    }
}

struct ActiveExecution {
    live: Arc<std::sync::Mutex<LiveState>>,
    cancel: Arc<std::sync::Mutex<Option<CancelReason>>>,
    pgid: Arc<std::sync::Mutex<Option<i32>>>,
    done_rx: watch::Receiver<bool>,
}

/// Cheap to clone; every field is a handle.
#[derive(Clone)]
pub struct ExecutionEngine {
    config: Config,
    store: StoreHandle,
    hub: Arc<EventHub>,
    files: Arc<FileStore>,
    log_writer: LogWriterHandle,
    active: Arc<Mutex<HashMap<String, ActiveExecution>>>,
    accepting: Arc<AtomicBool>,
}

impl ExecutionEngine {
    pub fn new(
        config: Config,
        store: StoreHandle,
        hub: Arc<EventHub>,
        files: Arc<FileStore>,
        log_writer: LogWriterHandle,
    ) -> Self {
        Self {
            config,
            store,
            hub,
            files,
            log_writer,
            active: Arc::new(Mutex::new(HashMap::new())),
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn is_active(&self, id: &str) -> bool {
        self.active.lock().await.contains_key(id)
    }

    /// Begin a run. Persists the execution as pending, registers it, spawns
    /// the engine task, and returns immediately.
    pub async fn start(
        &self,
        execution: Execution,
        timeout: Option<Duration>,
    ) -> Result<Execution, EngineError> {
        if execution.command.trim().is_empty() {
            return Err(EngineError::EmptyCommand);
        }
        if !self.is_accepting() {
            return Err(EngineError::Overloaded {
                limit: self.config.max_concurrent_executions,
            });
        }

        let live = Arc::new(std::sync::Mutex::new(LiveState::new(execution.clone())));
        let cancel = Arc::new(std::sync::Mutex::new(None));
        let pgid = Arc::new(std::sync::Mutex::new(None));
        let (done_tx, done_rx) = watch::channel(false);

        {
            let mut active = self.active.lock().await;
            if active.len() >= self.config.max_concurrent_executions {
                return Err(EngineError::Overloaded {
                    limit: self.config.max_concurrent_executions,
                });
            }
            active.insert(
                execution.id.clone(),
                ActiveExecution {
                    live: live.clone(),
                    cancel: cancel.clone(),
                    pgid: pgid.clone(),
                    done_rx,
                },
            );
        }

        {
            let e = execution.clone();
            if let Err(err) = self.store.call(move |store| store.save_execution(&e)).await {
                self.active.lock().await.remove(&execution.id);
                return Err(err.into());
            }
        }

        let engine = self.clone();
        let id = execution.id.clone();
        tokio::spawn(async move {
            engine.run(live, cancel, pgid, done_tx, timeout).await;
            engine.active.lock().await.remove(&id);
        });

        Ok(execution)
    }

    /// Cancel an active execution. Idempotent while it is active; a cancel
    /// after the terminal state is a conflict.
    pub async fn cancel(&self, id: &str, reason: CancelReason) -> Result<(), EngineError> {
        let handle = {
            let active = self.active.lock().await;
            active
                .get(id)
                .map(|h| (h.cancel.clone(), h.pgid.clone(), h.done_rx.clone()))
        };

        let Some((cancel, pgid, done_rx)) = handle else {
            let owned = id.to_string();
            let execution = self
                .store
                .call(move |store| store.get_execution(&owned))
                .await
                .map_err(|_| EngineError::NotFound { id: id.to_string() })?;
            return Err(EngineError::AlreadyTerminal {
                id: id.to_string(),
                status: execution.status.to_string(),
            });
        };

        {
            let mut guard = cancel.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                // Already cancelling; a second cancel changes nothing.
                return Ok(());
            }
            *guard = Some(reason.clone());
        }
        info!(execution_id = %id, reason = ?reason, "cancelling execution");

        let group = *pgid.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(group) = group {
            signal_group(group, libc::SIGTERM);
            let mut done_rx = done_rx;
            tokio::spawn(async move {
                let exited = tokio::time::timeout(KILL_GRACE, async {
                    while !*done_rx.borrow_and_update() {
                        if done_rx.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await;
                if exited.is_err() {
                    warn!(pgid = group, "grace window elapsed, sending SIGKILL");
                    signal_group(group, libc::SIGKILL);
                }
            });
        }
        Ok(())
    }

    /// Block until the execution reaches a terminal state.
    pub async fn wait(&self, id: &str) -> Result<(), EngineError> {
        let done_rx = {
            let active = self.active.lock().await;
            active.get(id).map(|h| h.done_rx.clone())
        };
        match done_rx {
            Some(mut rx) => {
                while !*rx.borrow_and_update() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                Ok(())
            }
            None => {
                let owned = id.to_string();
                self.store
                    .call(move |store| store.get_execution(&owned))
                    .await?;
                Ok(())
            }
        }
    }

    /// Live snapshot for `initial_state`, or None when the execution is not
    /// active (the caller falls back to the store).
    pub async fn snapshot(&self, id: &str) -> Option<ExecutionDetail> {
        let live = {
            let active = self.active.lock().await;
            active.get(id).map(|h| h.live.clone())
        }?;
        let owned = id.to_string();
        let artifacts = self
            .store
            .call(move |store| store.get_artifacts(&owned))
            .await
            .unwrap_or_default();
        let guard = live.lock().unwrap_or_else(|e| e.into_inner());
        Some(guard.detail(artifacts))
    }

    /// Refuse new work and cancel everything active with reason
    /// `server_shutdown`, then wait for the engine tasks to flush.
    pub async fn shutdown(&self) {
        self.set_accepting(false);
        let ids: Vec<String> = {
            let active = self.active.lock().await;
            active.keys().cloned().collect()
        };
        for id in &ids {
            if let Err(e) = self.cancel(id, CancelReason::Shutdown).await {
                debug!(execution_id = %id, error = %e, "cancel during shutdown");
            }
        }
        let waiters: Vec<watch::Receiver<bool>> = {
            let active = self.active.lock().await;
            active.values().map(|h| h.done_rx.clone()).collect()
        };
        for mut rx in waiters {
            let _ = tokio::time::timeout(KILL_GRACE + Duration::from_secs(2), async {
                while !*rx.borrow_and_update() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }
    }

    // ── Engine task ───────────────────────────────────────────────────

    async fn run(
        &self,
        live: Arc<std::sync::Mutex<LiveState>>,
        cancel: Arc<std::sync::Mutex<Option<CancelReason>>>,
        pgid: Arc<std::sync::Mutex<Option<i32>>>,
        done_tx: watch::Sender<bool>,
        timeout: Option<Duration>,
    ) {
        let (id, command, workdir, environment) = {
            let guard = live.lock().unwrap_or_else(|e| e.into_inner());
            let e = &guard.state.execution;
            (
                e.id.clone(),
                e.command.clone(),
                PathBuf::from(&e.working_directory),
                e.environment.clone(),
            )
        };

        // Prepare the working directory.
        if let Err(e) = tokio::fs::create_dir_all(&workdir).await {
            self.fail_before_spawn(
                &live,
                &id,
                &format!("failed to create working directory: {}", e),
            )
            .await;
            let _ = done_tx.send(true);
            return;
        }
        let workdir_canonical = tokio::fs::canonicalize(&workdir)
            .await
            .unwrap_or_else(|_| workdir.clone());

        // Spawn.
        let mut cmd = build_command(&command);
        cmd.current_dir(&workdir)
            .envs(&environment)
            .env("STEPFLOW_EXECUTION_ID", &id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.fail_before_spawn(&live, &id, &EngineError::SpawnFailed(e).to_string())
                    .await;
                let _ = done_tx.send(true);
                return;
            }
        };
        if let Some(raw_pid) = child.id() {
            *pgid.lock().unwrap_or_else(|e| e.into_inner()) = Some(raw_pid as i32);
        }

        // Pending -> running on kickoff.
        let execution = {
            let mut guard = live.lock().unwrap_or_else(|e| e.into_inner());
            let e = &mut guard.state.execution;
            e.status = ExecutionStatus::Running;
            e.started_at = Some(Utc::now());
            e.clone()
        };
        self.persist_execution(&execution).await;
        self.hub.publish_global(&HubEvent::ExecutionStarted {
            execution: execution.clone(),
        });
        self.hub
            .publish_execution(&id, &HubEvent::ExecutionUpdate { execution });
        info!(execution_id = %id, command = %command, "execution started");

        // Stream.
        let (line_tx, mut line_rx) = mpsc::channel::<RawLine>(LINE_CHANNEL_CAPACITY);
        let max_line = self.config.max_line_bytes;
        if let Some(stdout) = child.stdout.take() {
            let tx = line_tx.clone();
            tokio::spawn(read_lines(stdout, StreamKind::Stdout, max_line, tx));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = line_tx.clone();
            tokio::spawn(read_lines(stderr, StreamKind::Stderr, max_line, tx));
        }
        drop(line_tx);

        let consume = async {
            while let Some(raw) = line_rx.recv().await {
                self.handle_line(&live, &cancel, &pgid, &id, &workdir_canonical, raw)
                    .await;
            }
        };

        let mut timed_out = false;
        match timeout {
            Some(limit) => {
                tokio::select! {
                    _ = consume => {}
                    _ = tokio::time::sleep(limit) => {
                        warn!(execution_id = %id, timeout_secs = limit.as_secs(), "execution timed out");
                        timed_out = true;
                        {
                            let mut guard = cancel.lock().unwrap_or_else(|e| e.into_inner());
                            if guard.is_none() {
                                *guard = Some(CancelReason::Timeout(limit.as_secs()));
                            }
                        }
                        let group = *pgid.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(group) = group {
                            signal_group(group, libc::SIGTERM);
                        }
                    }
                }
            }
            None => consume.await,
        }

        // Finalize. After a timeout the child gets the grace window to obey
        // SIGTERM before SIGKILL.
        let status = if timed_out {
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    let group = *pgid.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(group) = group {
                        warn!(execution_id = %id, "grace window elapsed, sending SIGKILL");
                        signal_group(group, libc::SIGKILL);
                    }
                    child.wait().await
                }
            }
        } else {
            child.wait().await
        };
        let exit_code = match &status {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                error!(execution_id = %id, error = %e, "failed waiting for child");
                -1
            }
        };
        self.finalize(&live, &cancel, &id, exit_code).await;
        let _ = done_tx.send(true);
    }

    async fn fail_before_spawn(
        &self,
        live: &Arc<std::sync::Mutex<LiveState>>,
        id: &str,
        message: &str,
    ) {
        error!(execution_id = %id, error = %message, "execution failed before spawn");
        let execution = {
            let mut guard = live.lock().unwrap_or_else(|e| e.into_inner());
            let e = &mut guard.state.execution;
            e.status = ExecutionStatus::Failed;
            e.error_message = Some(message.to_string());
            e.completed_at = Some(Utc::now());
            e.clone()
        };
        self.persist_execution(&execution).await;
        self.hub.publish_execution(
            id,
            &HubEvent::ExecutionCompleted {
                execution: execution.clone(),
            },
        );
        self.hub
            .publish_global(&HubEvent::ExecutionCompleted { execution });
        self.hub.remove_topic(id);
    }

    /// Process one line: log entry + marker event + resulting transitions.
    async fn handle_line(
        &self,
        live: &Arc<std::sync::Mutex<LiveState>>,
        cancel: &Arc<std::sync::Mutex<Option<CancelReason>>>,
        pgid: &Arc<std::sync::Mutex<Option<i32>>>,
        id: &str,
        workdir: &Path,
        raw: RawLine,
    ) {
        let marker = parse_line(&raw.content);
        eprintln!("DEBUG handle_line content={:?} marker={:?}", raw.content, marker);

        // Collect everything under one short lock, then do I/O.
        let collected = {
            let mut guard = live.lock().unwrap_or_else(|e| e.into_inner());

            let cancelled = cancel.lock().unwrap_or_else(|e| e.into_inner()).is_some();
            if guard.state.execution.status.is_terminal() || cancelled {
                // Terminal executions accept no further steps or logs.
                return;
            }

            let changes = match &marker {
                Some(event) => guard.state.apply_marker(event, Utc::now()),
                None => Vec::new(),
            };

            // Bind the line to the step running after the event applied,
            // falling back to the step the event just closed.
            let step_binding = guard
                .state
                .running_step()
                .map(|s| (s.id.clone(), s.index))
                .or_else(|| {
                    changes.iter().rev().find_map(|c| match c {
                        StateChange::StepCompleted(i) | StateChange::StepFailed(i) => {
                            let s = &guard.state.steps[*i];
                            Some((s.id.clone(), s.index))
                        }
                        _ => None,
                    })
                });

            let entry = LogEntry {
                seq: guard.state.next_seq(),
                timestamp: Utc::now(),
                stream: raw.stream,
                content: raw.content,
                step_id: step_binding.as_ref().map(|(id, _)| id.clone()),
                level: LogLevel::Info,
                truncated: raw.truncated,
                marker: marker.as_ref().map(|m| m.kind().to_string()),
            };
            guard.push_recent(&entry);

            let log_path = match &step_binding {
                Some((step_id, index)) => self.files.step_log_path(id, *index, step_id),
                None => self.files.execution_log_path(id),
            };

            let steps_to_save: Vec<Step> = changes
                .iter()
                .filter_map(|c| match c {
                    StateChange::StepStarted(i)
                    | StateChange::StepUpdated(i)
                    | StateChange::StepCompleted(i)
                    | StateChange::StepFailed(i) => Some(guard.state.steps[*i].clone()),
                    _ => None,
                })
                .collect();
            let execution_to_save = changes
                .iter()
                .any(|c| matches!(c, StateChange::ExecutionUpdated))
                .then(|| guard.state.execution.clone());
            let kill = changes
                .iter()
                .any(|c| matches!(c, StateChange::ExecutionFailed));

            let artifact_req = match &marker {
                Some(MarkerEvent::Artifact { path, description }) => Some((
                    path.clone(),
                    description.clone(),
                    step_binding.as_ref().map(|(id, _)| id.clone()),
                )),
                _ => None,
            };

            let progress = guard.state.execution.progress_percentage();
            let events: Vec<HubEvent> = changes
                .iter()
                .filter_map(|c| match c {
                    StateChange::StepStarted(i) => Some(HubEvent::StepStarted {
                        execution_id: id.to_string(),
                        step: guard.state.steps[*i].clone(),
                        execution_progress: progress,
                    }),
                    StateChange::StepUpdated(i) => Some(HubEvent::StepUpdated {
                        execution_id: id.to_string(),
                        step: guard.state.steps[*i].clone(),
                        execution_progress: progress,
                    }),
                    StateChange::StepCompleted(i) => Some(HubEvent::StepCompleted {
                        execution_id: id.to_string(),
                        step: guard.state.steps[*i].clone(),
                        execution_progress: progress,
                    }),
                    StateChange::StepFailed(i) => Some(HubEvent::StepFailed {
                        execution_id: id.to_string(),
                        step: guard.state.steps[*i].clone(),
                        execution_progress: progress,
                    }),
                    StateChange::ExecutionUpdated => Some(HubEvent::ExecutionUpdate {
                        execution: guard.state.execution.clone(),
                    }),
                    StateChange::ExecutionFailed => None,
                })
                .collect();

            (
                entry,
                log_path,
                events,
                steps_to_save,
                execution_to_save,
                kill,
                artifact_req,
            )
        };
        let (entry, log_path, events, steps_to_save, execution_to_save, kill, artifact_req) =
            collected;

        // Persistence path: blocking, never drops.
        self.log_writer
            .write(log_path, format_log_line(&entry.timestamp, &entry.content))
            .await;

        // Fan-out path: may drop for slow subscribers.
        self.hub.publish_execution(
            id,
            &HubEvent::LogEntry {
                execution_id: id.to_string(),
                entry,
            },
        );

        for step in &steps_to_save {
            self.persist_step(step).await;
        }
        if let Some(execution) = &execution_to_save {
            self.persist_execution(execution).await;
        }
        for event in &events {
            self.hub.publish_execution(id, event);
        }

        if let Some((path, description, step_id)) = artifact_req {
            self.handle_artifact(live, id, workdir, &path, &description, step_id)
                .await;
        }

        if kill {
            // stop_on_error tripped: the execution is failed, stop the child.
            let group = *pgid.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(group) = group {
                warn!(execution_id = %id, "critical step failed, terminating child");
                signal_group(group, libc::SIGTERM);
                tokio::spawn(async move {
                    tokio::time::sleep(KILL_GRACE).await;
                    signal_group(group, libc::SIGKILL);
                });
            }
        }
    }

    /// Resolve, validate, and ingest a declared artifact. Every failure is
    /// local: a warning log entry, never a step failure.
    async fn handle_artifact(
        &self,
        live: &Arc<std::sync::Mutex<LiveState>>,
        id: &str,
        workdir: &Path,
        declared_path: &str,
        description: &str,
        step_id: Option<String>,
    ) {
        let candidate = if Path::new(declared_path).is_absolute() {
            PathBuf::from(declared_path)
        } else {
            workdir.join(declared_path)
        };

        let resolved = match tokio::fs::canonicalize(&candidate).await {
            Ok(p) => p,
            Err(_) => {
                self.emit_warning(
                    live,
                    id,
                    step_id,
                    format!("artifact file not found: {}", declared_path),
                )
                .await;
                return;
            }
        };
        if !resolved.starts_with(workdir) {
            self.emit_warning(
                live,
                id,
                step_id,
                format!("artifact path escapes working directory: {}", declared_path),
            )
            .await;
            return;
        }

        let meta = match tokio::fs::metadata(&resolved).await {
            Ok(m) if m.is_file() => m,
            _ => {
                self.emit_warning(
                    live,
                    id,
                    step_id,
                    format!("artifact is not a regular file: {}", declared_path),
                )
                .await;
                return;
            }
        };
        if meta.len() > self.config.max_artifact_bytes {
            self.emit_warning(
                live,
                id,
                step_id,
                format!(
                    "artifact too large ({} bytes, limit {}): {}",
                    meta.len(),
                    self.config.max_artifact_bytes,
                    declared_path
                ),
            )
            .await;
            return;
        }

        let file_name = resolved
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        let mut artifact = Artifact::new(id, step_id.clone(), &file_name);
        artifact.description = description.to_string();
        artifact.file_size = meta.len() as i64;
        let (mime, kind) = crate::files::describe_file(&file_name);
        artifact.mime_type = mime;
        artifact.artifact_type = kind;

        if let Err(e) = self.files.ingest_artifact(&mut artifact, &resolved).await {
            self.emit_warning(
                live,
                id,
                step_id,
                format!("failed to store artifact {}: {}", declared_path, e),
            )
            .await;
            return;
        }

        let saved = {
            let a = artifact.clone();
            self.store.call(move |store| store.save_artifact(&a)).await
        };
        if let Err(e) = saved {
            error!(execution_id = %id, error = %e, "failed to persist artifact");
            return;
        }

        debug!(execution_id = %id, artifact = %artifact.file_name, "artifact registered");
        self.hub.publish_execution(
            id,
            &HubEvent::ArtifactCreated {
                execution_id: id.to_string(),
                artifact,
            },
        );
    }

    /// Write a synthetic warning entry into history and the live stream.
    async fn emit_warning(
        &self,
        live: &Arc<std::sync::Mutex<LiveState>>,
        id: &str,
        step_id: Option<String>,
        message: String,
    ) {
        warn!(execution_id = %id, "{}", message);
        let (entry, log_path) = {
            let mut guard = live.lock().unwrap_or_else(|e| e.into_inner());
            let step_binding = step_id.and_then(|sid| {
                guard
                    .state
                    .steps
                    .iter()
                    .find(|s| s.id == sid)
                    .map(|s| (s.id.clone(), s.index))
            });
            let entry = LogEntry {
                seq: guard.state.next_seq(),
                timestamp: Utc::now(),
                stream: StreamKind::Stdout,
                content: format!("WARNING: {}", message),
                step_id: step_binding.as_ref().map(|(id, _)| id.clone()),
                level: LogLevel::Warning,
                truncated: false,
                marker: None,
            };
            guard.push_recent(&entry);
            let log_path = match &step_binding {
                Some((step_id, index)) => self.files.step_log_path(id, *index, step_id),
                None => self.files.execution_log_path(id),
            };
            (entry, log_path)
        };
        self.log_writer
            .write(log_path, format_log_line(&entry.timestamp, &entry.content))
            .await;
        self.hub.publish_execution(
            id,
            &HubEvent::LogEntry {
                execution_id: id.to_string(),
                entry,
            },
        );
    }

    async fn finalize(
        &self,
        live: &Arc<std::sync::Mutex<LiveState>>,
        cancel: &Arc<std::sync::Mutex<Option<CancelReason>>>,
        id: &str,
        exit_code: i32,
    ) {
        let now = Utc::now();
        let reason = cancel.lock().unwrap_or_else(|e| e.into_inner()).clone();

        let (execution, closed_steps) = {
            let mut guard = live.lock().unwrap_or_else(|e| e.into_inner());
            let mut closed = Vec::new();

            match &reason {
                Some(reason) => {
                    if let Some(idx) = guard.state.close_running_step(
                        StepStatus::Failed,
                        Some(reason.step_error()),
                        now,
                    ) {
                        closed.push(guard.state.steps[idx].clone());
                    }
                    let e = &mut guard.state.execution;
                    e.status = ExecutionStatus::Cancelled;
                    e.error_message = Some(reason.execution_error());
                    e.exit_code = Some(exit_code);
                    e.completed_at = Some(now);
                }
                None if guard.state.execution.status == ExecutionStatus::Failed => {
                    // stop_on_error already failed the execution.
                    let e = &mut guard.state.execution;
                    e.exit_code = Some(exit_code);
                    e.completed_at = Some(now);
                }
                None => {
                    // A step left running when the pipes close is implicitly
                    // completed.
                    if let Some(idx) =
                        guard
                            .state
                            .close_running_step(StepStatus::Completed, None, now)
                    {
                        closed.push(guard.state.steps[idx].clone());
                    }
                    let last_error = guard.state.last_step_error().map(str::to_string);
                    let e = &mut guard.state.execution;
                    e.exit_code = Some(exit_code);
                    e.completed_at = Some(now);
                    if exit_code == 0 {
                        e.status = ExecutionStatus::Completed;
                    } else {
                        e.status = ExecutionStatus::Failed;
                        e.error_message = Some(last_error.unwrap_or_else(|| {
                            format!("command exited with code {}", exit_code)
                        }));
                    }
                }
            }
            (guard.state.execution.clone(), closed)
        };
        eprintln!("DEBUG finalize execution.total_steps={}", execution.total_steps);

        for step in &closed_steps {
            self.persist_step(step).await;
            let event = match step.status {
                StepStatus::Failed => HubEvent::StepFailed {
                    execution_id: id.to_string(),
                    step: step.clone(),
                    execution_progress: execution.progress_percentage(),
                },
                _ => HubEvent::StepCompleted {
                    execution_id: id.to_string(),
                    step: step.clone(),
                    execution_progress: execution.progress_percentage(),
                },
            };
            self.hub.publish_execution(id, &event);
        }
        self.persist_execution(&execution).await;

        // All buffered log lines reach disk before completion is announced.
        self.log_writer.flush().await;

        info!(
            execution_id = %id,
            status = %execution.status,
            exit_code = exit_code,
            "execution finished"
        );
        self.hub.publish_execution(
            id,
            &HubEvent::ExecutionCompleted {
                execution: execution.clone(),
            },
        );
        self.hub
            .publish_global(&HubEvent::ExecutionCompleted { execution });
        self.hub.remove_topic(id);
    }

    async fn persist_execution(&self, execution: &Execution) {
        let e = execution.clone();
        eprintln!("DEBUG persist_execution id={} total_steps={}", e.id, e.total_steps);
        if let Err(err) = self.store.call(move |store| store.save_execution(&e)).await {
            eprintln!("DEBUG persist_execution FAILED: {}", err);
            error!(execution_id = %execution.id, error = %err, "failed to persist execution");
        } else {
            eprintln!("DEBUG persist_execution OK");
        }
    }

    async fn persist_step(&self, step: &Step) {
        let s = step.clone();
        eprintln!("DEBUG persist_step id={} execution_id={} name={} status={:?}", s.id, s.execution_id, s.name, s.status);
        if let Err(err) = self.store.call(move |store| store.save_step(&s)).await {
            eprintln!("DEBUG persist_step FAILED: {}", err);
            error!(step_id = %step.id, error = %err, "failed to persist step");
        } else {
            eprintln!("DEBUG persist_step OK");
        }
    }
}

/// Shell out when the command needs a shell, argv-split otherwise.
fn build_command(command: &str) -> Command {
    if needs_shell(command) {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    } else {
        let mut parts = command.split_whitespace();
        let program = parts.next().unwrap_or("");
        let mut cmd = Command::new(program);
        cmd.args(parts);
        cmd
    }
}

fn needs_shell(command: &str) -> bool {
    command.chars().any(|c| "|&;<>()$`\\\"'*?[]{}~".contains(c))
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|s| -s))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: libc::c_int) {
    unsafe {
        libc::kill(-pgid, signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: i32) {}

/// Read one pipe line by line, splitting anything longer than `max_line`
/// without buffering the whole oversized line. The first chunk of a split
/// line is flagged truncated; every chunk is preserved in order.
async fn read_lines<R: AsyncRead + Unpin>(
    inner: R,
    stream: StreamKind,
    max_line: usize,
    tx: mpsc::Sender<RawLine>,
) {
    let mut reader = BufReader::new(inner);
    let mut pending: Vec<u8> = Vec::new();
    let mut emitted_parts = 0usize;

    loop {
        let (consumed, line_done, eof) = {
            let chunk = match reader.fill_buf().await {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(stream = stream.as_str(), error = %e, "pipe read error");
                    break;
                }
            };
            if chunk.is_empty() {
                (0, false, true)
            } else {
                match chunk.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        pending.extend_from_slice(&chunk[..pos]);
                        (pos + 1, true, false)
                    }
                    None => {
                        let len = chunk.len();
                        pending.extend_from_slice(chunk);
                        (len, false, false)
                    }
                }
            }
        };
        reader.consume(consumed);

        if eof {
            if !pending.is_empty() {
                let content = String::from_utf8_lossy(&pending).into_owned();
                let _ = tx
                    .send(RawLine {
                        stream,
                        content,
                        truncated: false,
                    })
                    .await;
            }
            break;
        }

        if line_done {
            if pending.last() == Some(&b'\r') {
                pending.pop();
            }
            let content = String::from_utf8_lossy(&pending).into_owned();
            pending.clear();
            // The tail of a split line that landed exactly on a chunk edge
            // would be empty; nothing to emit then.
            if !(content.is_empty() && emitted_parts > 0) {
                if tx
                    .send(RawLine {
                        stream,
                        content,
                        truncated: false,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            emitted_parts = 0;
            continue;
        }

        // Overlong line still in progress: emit full chunks now.
        while pending.len() >= max_line {
            let split = floor_char_boundary(&pending, max_line);
            let head: Vec<u8> = pending.drain(..split).collect();
            let content = String::from_utf8_lossy(&head).into_owned();
            let truncated = emitted_parts == 0;
            emitted_parts += 1;
            if tx
                .send(RawLine {
                    stream,
                    content,
                    truncated,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

/// Largest split point `<= max` that does not cut a UTF-8 sequence.
fn floor_char_boundary(bytes: &[u8], max: usize) -> usize {
    let mut end = max.min(bytes.len());
    while end > 0 && end < bytes.len() && (bytes[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    if end == 0 {
        max.min(bytes.len())
    } else {
        end
    }
}
