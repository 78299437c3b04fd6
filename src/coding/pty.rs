// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! PTY-subprocess coding-agent backends.
//!
//! Local CLI agents (`claude`, `codex`, `gemini`) run attached to a
//! pseudo-terminal. Output is streamed to the caller and kept in a bounded
//! replay buffer; any output counts as activity for the idle monitor.
//!
//! Two ways to stop a session:
//! - [`PtyClient::kill`] marks the session killed; the result is a failure.
//! - [`PtyClient::graceful_exit`] sends the same signals but the exit is
//!   reported as success.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::PtyBackendConfig;
use crate::error::BackendError;
use crate::git::Git;

use super::activity::{ActivityConfig, ActivityMonitor, ActivitySignal, MonitorOutcome};
use super::cancel::CancelToken;
use super::events::{from_pty_exit, from_pty_output};
use super::ring_buffer::{ReplayBuffer, DEFAULT_REPLAY_BYTES};
use super::summary::{extract_summary, DEFAULT_SUMMARY_CHARS, DEFAULT_SUMMARY_LINES};
use super::types::{
    CodingAgentClient, CodingAgentTaskResult, CodingBackend, TaskCallbacks, TaskErrorCode,
};

/// Default grace between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// How long to keep draining output after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// How long teardown waits for the output reader to see EOF.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 4096;

/// Environment forwarded to coding CLIs when set.
const FORWARDED_ENV: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GEMINI_API_KEY",
    "GOOGLE_API_KEY",
    "GITHUB_TOKEN",
    "GH_TOKEN",
];

/// Built-in invocation for a known CLI flavour.
pub fn flavour_defaults(agent_type: &str) -> Option<PtyBackendConfig> {
    let config = |program: &str, args: &[&str], approval: &[&str], task_flag: Option<&str>| {
        PtyBackendConfig {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            model_flag: Some("--model".to_string()),
            approval_args: Some(approval.iter().map(|s| s.to_string()).collect()),
            task_flag: task_flag.map(str::to_string),
            env: Default::default(),
        }
    };
    match agent_type {
        "claude-code" => Some(config("claude", &["-p"], &["--dangerously-skip-permissions"], None)),
        "codex" => Some(config("codex", &["exec"], &["--full-auto"], None)),
        "gemini" => Some(config("gemini", &[], &["--yolo"], Some("-p"))),
        _ => None,
    }
}

/// Argument vector for one task (program excluded).
pub fn command_args(config: &PtyBackendConfig, model: Option<&str>, task: &str) -> Vec<String> {
    let mut args = config.args.clone();
    if let Some(approval) = &config.approval_args {
        args.extend(approval.iter().cloned());
    }
    if let (Some(flag), Some(model)) = (&config.model_flag, model) {
        args.push(flag.clone());
        args.push(model.to_string());
    }
    if let Some(flag) = &config.task_flag {
        args.push(flag.clone());
    }
    args.push(task.to_string());
    args
}

/// Locate `program` on `PATH` (or as a path).
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

/// Settings shared by every PTY client of one backend.
#[derive(Debug, Clone)]
pub struct PtySettings {
    pub activity: ActivityConfig,
    pub kill_grace: Duration,
    pub replay_bytes: usize,
    pub git: Git,
}

impl Default for PtySettings {
    fn default() -> Self {
        Self {
            activity: ActivityConfig::default(),
            kill_grace: DEFAULT_KILL_GRACE,
            replay_bytes: DEFAULT_REPLAY_BYTES,
            git: Git::default(),
        }
    }
}

/// Factory for one CLI flavour.
#[derive(Debug, Clone)]
pub struct PtyBackend {
    agent_type: String,
    config: PtyBackendConfig,
    settings: PtySettings,
}

impl PtyBackend {
    pub fn new(agent_type: impl Into<String>, config: PtyBackendConfig, settings: PtySettings) -> Self {
        Self {
            agent_type: agent_type.into(),
            config,
            settings,
        }
    }

    /// Backend for a built-in flavour, or `None` for unknown agent types.
    pub fn for_flavour(agent_type: &str, settings: PtySettings) -> Option<Self> {
        flavour_defaults(agent_type).map(|config| Self::new(agent_type, config, settings))
    }

    pub fn config(&self) -> &PtyBackendConfig {
        &self.config
    }

    /// Concrete client, for callers that need terminal control.
    pub fn pty_client(&self, workdir: &Path, model: Option<&str>) -> Arc<PtyClient> {
        Arc::new(PtyClient {
            agent_type: self.agent_type.clone(),
            config: self.config.clone(),
            model: model.map(str::to_string),
            workdir: workdir.to_path_buf(),
            settings: self.settings.clone(),
            shared: Arc::new(PtyShared::new(self.settings.replay_bytes)),
        })
    }
}

#[async_trait]
impl CodingBackend for PtyBackend {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    async fn is_ready(&self) -> bool {
        let found = resolve_program(&self.config.program).is_some();
        if !found {
            debug!(program = %self.config.program, "Coding CLI not found on PATH");
        }
        found
    }

    fn client(&self, workdir: &Path, model: Option<&str>) -> Arc<dyn CodingAgentClient> {
        self.pty_client(workdir, model)
    }
}

/// State shared between the client handle and the running session.
struct PtyShared {
    buffer: Mutex<ReplayBuffer>,
    running: AtomicBool,
    killed: AtomicBool,
    graceful: AtomicBool,
    pid: Mutex<Option<u32>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
}

impl PtyShared {
    fn new(replay_bytes: usize) -> Self {
        Self {
            buffer: Mutex::new(ReplayBuffer::new(replay_bytes)),
            running: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            graceful: AtomicBool::new(false),
            pid: Mutex::new(None),
            writer: Mutex::new(None),
            master: Mutex::new(None),
            killer: Mutex::new(None),
        }
    }

    fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, chunk: &[u8]) {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(chunk);
    }

    fn detach(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.pid.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.master.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.killer.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(unix)]
fn send_signal(_shared: &PtyShared, pid: u32, signal: libc::c_int) {
    let pid = pid as libc::pid_t;
    // The child leads its own session; signal the whole group first.
    // SAFETY: kill(2) has no memory-safety preconditions.
    let group = unsafe { libc::kill(-pid, signal) };
    if group != 0 {
        // SAFETY: as above.
        unsafe { libc::kill(pid, signal) };
    }
}

#[cfg(not(unix))]
fn send_signal(shared: &PtyShared, _pid: u32, _signal: i32) {
    if let Some(killer) = shared
        .killer
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .as_mut()
    {
        let _ = killer.kill();
    }
}

#[cfg(unix)]
const SIGTERM: libc::c_int = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: libc::c_int = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// SIGTERM now, SIGKILL after `grace` if the same process is still alive.
fn terminate(shared: &Arc<PtyShared>, grace: Duration) {
    let Some(pid) = shared.pid() else {
        return;
    };
    debug!(pid, "Sending SIGTERM to coding agent");
    send_signal(shared, pid, SIGTERM);

    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if shared.running.load(Ordering::SeqCst) && shared.pid() == Some(pid) {
            warn!(pid, "Coding agent ignored SIGTERM; sending SIGKILL");
            send_signal(&shared, pid, SIGKILL);
        }
    });
}

/// Wait for the output reader to finish. Processes the agent left behind
/// keep the terminal open, so they are killed if the reader outlives it.
async fn join_reader(shared: &PtyShared, mut reader: JoinHandle<()>, pid: Option<u32>) {
    if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut reader).await.is_ok() {
        return;
    }
    if let Some(pid) = pid {
        warn!(pid, "Terminal still held open after exit; killing leftover processes");
        send_signal(shared, pid, SIGKILL);
    }
    if tokio::time::timeout(READER_JOIN_TIMEOUT, reader).await.is_err() {
        warn!("PTY reader still blocked; abandoning it");
    }
}

struct Spawned {
    child: Box<dyn portable_pty::Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
}

/// One CLI session at a time, bound to a working directory.
pub struct PtyClient {
    agent_type: String,
    config: PtyBackendConfig,
    model: Option<String>,
    workdir: PathBuf,
    settings: PtySettings,
    shared: Arc<PtyShared>,
}

impl PtyClient {
    /// Send bytes to the agent's terminal.
    pub fn write_input(&self, data: &[u8]) -> Result<(), BackendError> {
        let mut writer = self.shared.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = writer
            .as_mut()
            .ok_or_else(|| BackendError::NotReady("no running session".to_string()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the terminal.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), BackendError> {
        let master = self.shared.master.lock().unwrap_or_else(|e| e.into_inner());
        let master = master
            .as_ref()
            .ok_or_else(|| BackendError::NotReady("no running session".to_string()))?;
        master
            .resize(PtySize {
                rows: rows.max(1),
                cols: cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BackendError::Io(std::io::Error::other(e.to_string())))
    }

    /// Stop the session; the result reports failure.
    pub fn kill(&self) {
        self.shared.killed.store(true, Ordering::SeqCst);
        terminate(&self.shared, self.settings.kill_grace);
    }

    /// Stop the session; the result reports success.
    pub fn graceful_exit(&self) {
        self.shared.graceful.store(true, Ordering::SeqCst);
        terminate(&self.shared, self.settings.kill_grace);
    }

    /// Recent output, oldest first.
    pub fn replay_buffer(&self) -> Vec<u8> {
        self.shared
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn spawn(&self, task: &str) -> Result<Spawned, BackendError> {
        let spawn_err = |e: anyhow::Error| BackendError::Spawn(format!("{}: {}", self.config.program, e));

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 40,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(spawn_err)?;

        let mut cmd = CommandBuilder::new(&self.config.program);
        cmd.args(command_args(&self.config, self.model.as_deref(), task));
        cmd.cwd(&self.workdir);
        cmd.env("TERM", "xterm-256color");
        for key in FORWARDED_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(spawn_err)?;
        // The reader sees EOF only once every slave handle is gone.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(spawn_err)?;
        let writer = pair.master.take_writer().map_err(spawn_err)?;

        *self.shared.pid.lock().unwrap_or_else(|e| e.into_inner()) = child.process_id();
        *self.shared.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(writer);
        *self.shared.master.lock().unwrap_or_else(|e| e.into_inner()) = Some(pair.master);
        *self.shared.killer.lock().unwrap_or_else(|e| e.into_inner()) = Some(child.clone_killer());
        self.shared.running.store(true, Ordering::SeqCst);

        Ok(Spawned { child, reader })
    }

    fn build_result(
        &self,
        exit_code: Option<u32>,
        outcome: &MonitorOutcome,
        summary: String,
    ) -> CodingAgentTaskResult {
        if self.shared.killed.load(Ordering::SeqCst) {
            return CodingAgentTaskResult::failed(TaskErrorCode::Killed, "killed").with_summary(summary);
        }
        if self.shared.graceful.load(Ordering::SeqCst) {
            return CodingAgentTaskResult::succeeded(summary);
        }
        if let Some(code) = outcome.error_code() {
            return CodingAgentTaskResult::failed(code, outcome.describe(&self.settings.activity))
                .with_summary(summary);
        }
        match exit_code {
            Some(0) => CodingAgentTaskResult::succeeded(summary),
            Some(code) => CodingAgentTaskResult::failed(
                TaskErrorCode::ExitFailure,
                format!("{} exited with code {}", self.config.program, code),
            )
            .with_summary(summary),
            None => CodingAgentTaskResult::failed(
                TaskErrorCode::ExitFailure,
                format!("{} exit status unavailable", self.config.program),
            )
            .with_summary(summary),
        }
    }
}

#[async_trait]
impl CodingAgentClient for PtyClient {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    #[instrument(skip(self, task, callbacks), fields(agent_type = %self.agent_type, workdir = %self.workdir.display()))]
    async fn execute_task(&self, task: &str, callbacks: TaskCallbacks) -> CodingAgentTaskResult {
        if self.is_running() {
            return CodingAgentTaskResult::from_backend_error(&BackendError::NotReady(
                "a session is already running".to_string(),
            ));
        }
        self.shared.killed.store(false, Ordering::SeqCst);
        self.shared.graceful.store(false, Ordering::SeqCst);
        self.shared
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        let session_id = format!("pty-{}", uuid::Uuid::new_v4());
        let Spawned { mut child, mut reader } = match self.spawn(task) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!("Failed to start coding agent: {}", e);
                return CodingAgentTaskResult::from_backend_error(&e);
            }
        };
        info!(session_id = %session_id, pid = ?self.shared.pid(), "Coding agent started");

        let pid = self.shared.pid();
        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(256);
        let reader_task = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        let mut exit = tokio::task::spawn_blocking(move || child.wait());

        let cancel = CancelToken::new();
        let (signal_tx, signal_rx) = mpsc::channel(256);
        let monitor = {
            let monitor = ActivityMonitor::new(self.settings.activity);
            let cancel = cancel.clone();
            tokio::spawn(async move { monitor.watch(signal_rx, &cancel).await })
        };

        let mut output_open = true;
        let mut terminated = false;
        let status = loop {
            tokio::select! {
                chunk = output_rx.recv(), if output_open => match chunk {
                    Some(bytes) => {
                        self.shared.record(&bytes);
                        callbacks.emit(from_pty_output(&self.agent_type, &bytes));
                        let _ = signal_tx.try_send(ActivitySignal::Activity { session_id: None });
                    }
                    None => output_open = false,
                },
                status = &mut exit => break status,
                _ = cancel.cancelled(), if !terminated => {
                    terminated = true;
                    terminate(&self.shared, self.settings.kill_grace);
                }
            }
        };

        let drain_until = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while let Ok(Some(bytes)) = tokio::time::timeout_at(drain_until, output_rx.recv()).await {
            self.shared.record(&bytes);
            callbacks.emit(from_pty_output(&self.agent_type, &bytes));
        }
        self.shared.detach();
        drop(output_rx);
        join_reader(&self.shared, reader_task, pid).await;

        cancel.cancel();
        let outcome = monitor.await.unwrap_or_else(|e| {
            warn!("Activity monitor task failed: {}", e);
            MonitorOutcome::Completed
        });

        let exit_code = match status {
            Ok(Ok(status)) => Some(status.exit_code()),
            Ok(Err(e)) => {
                warn!("Failed to wait for coding agent: {}", e);
                None
            }
            Err(e) => {
                warn!("Exit waiter failed: {}", e);
                None
            }
        };
        let killed = self.shared.killed.load(Ordering::SeqCst);
        callbacks.emit(from_pty_exit(&self.agent_type, exit_code, killed));
        info!(session_id = %session_id, ?exit_code, killed, "Coding agent exited");

        let raw = self
            .shared
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .text();
        let summary = extract_summary(&raw, DEFAULT_SUMMARY_LINES, DEFAULT_SUMMARY_CHARS);
        let diff = self.settings.git.compute_git_diff(&self.workdir).await;

        self.build_result(exit_code, &outcome, summary)
            .with_diff(diff)
            .with_session(Some(session_id))
    }

    async fn abort(&self) {
        self.kill();
    }
}
