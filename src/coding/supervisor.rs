// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Supervisor for a managed backend server process.
//!
//! Owns the child handle, the restart count and the backoff timer. A backend
//! holds one supervisor and calls [`ProcessSupervisor::ensure_running`]
//! before each task.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::BackendError;

/// Default restart budget.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;
/// First backoff delay; doubles per restart.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Backoff ceiling.
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Backoff before restart number `restart` (0-based).
pub fn backoff_delay(restart: u32) -> Duration {
    let factor = 1u32.checked_shl(restart).unwrap_or(u32::MAX);
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX)
}

#[derive(Debug, Default)]
struct SupervisorState {
    child: Option<Child>,
    started_once: bool,
    restarts: u32,
    next_start_allowed: Option<Instant>,
}

/// Keeps one command running, restarting it with exponential backoff.
#[derive(Debug)]
pub struct ProcessSupervisor {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    max_restarts: u32,
    state: Mutex<SupervisorState>,
}

impl ProcessSupervisor {
    /// Supervise `command` (program followed by arguments).
    pub fn new(command: &[String], cwd: Option<PathBuf>, max_restarts: u32) -> Result<Self, BackendError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| BackendError::Spawn("empty serve command".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd,
            max_restarts,
            state: Mutex::new(SupervisorState::default()),
        })
    }

    /// Restarts performed so far.
    pub async fn restart_count(&self) -> u32 {
        self.state.lock().await.restarts
    }

    /// Whether the process is currently alive.
    pub async fn is_running(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Start the process if it is not running.
    ///
    /// The first start is free; later starts count as restarts, wait out the
    /// backoff, and fail once the restart budget is spent.
    pub async fn ensure_running(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;

        if let Some(child) = state.child.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => {
                    warn!(program = %self.program, %status, "Supervised process exited");
                }
                Err(e) => warn!(program = %self.program, "Failed to poll supervised process: {}", e),
            }
            state.child = None;
        }

        if state.started_once {
            if state.restarts >= self.max_restarts {
                return Err(BackendError::NotReady(format!(
                    "{} exceeded {} restarts",
                    self.program, self.max_restarts
                )));
            }
            if let Some(at) = state.next_start_allowed {
                tokio::time::sleep_until(at).await;
            }
            state.restarts += 1;
            state.next_start_allowed = Some(Instant::now() + backoff_delay(state.restarts));
        } else {
            state.next_start_allowed = Some(Instant::now() + backoff_delay(0));
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        let child = cmd
            .spawn()
            .map_err(|e| BackendError::Spawn(format!("{}: {}", self.program, e)))?;

        info!(
            program = %self.program,
            pid = ?child.id(),
            restarts = state.restarts,
            "Started supervised process"
        );
        state.child = Some(child);
        state.started_once = true;
        Ok(())
    }

    /// Stop the process.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut child) = state.child.take() {
            let _ = child.kill().await;
        }
    }
}
