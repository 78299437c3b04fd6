// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Idle-timeout and hard-cap detection for running coding-agent sessions.
//!
//! A backend runs its task and an [`ActivityMonitor`] concurrently, sharing a
//! [`CancelToken`]. Whichever finishes first cancels the token:
//!
//! - the task completing cancels the monitor, which resolves `Completed`;
//! - the monitor firing (idle, hard cap, session error) cancels the task.
//!
//! Activity arrives either as pushed [`ActivitySignal`]s (SSE, PTY output) or,
//! when no stream is available, by polling a progress counter.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use super::cancel::CancelToken;
use super::types::TaskErrorCode;

/// Default inactivity window.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default absolute ceiling on task duration.
pub const DEFAULT_HARD_CAP: Duration = Duration::from_secs(30 * 60);
/// Default polling interval for the fallback path.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Monitor timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityConfig {
    pub idle_timeout: Duration,
    pub hard_cap: Duration,
    pub poll_interval: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            hard_cap: DEFAULT_HARD_CAP,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Something observed on a backend's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivitySignal {
    /// Any event. `None` session id means "not session-scoped".
    Activity { session_id: Option<String> },
    /// The backend reported a failure for a session.
    SessionError {
        session_id: Option<String>,
        message: String,
    },
}

impl ActivitySignal {
    pub fn activity(session_id: impl Into<String>) -> Self {
        Self::Activity {
            session_id: Some(session_id.into()),
        }
    }

    fn session_id(&self) -> Option<&str> {
        match self {
            Self::Activity { session_id } | Self::SessionError { session_id, .. } => {
                session_id.as_deref()
            }
        }
    }
}

/// How the monitor resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// The token was cancelled by the task side.
    Completed,
    Idle,
    HardCap,
    Error(String),
}

impl MonitorOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Idle => "idle",
            Self::HardCap => "hard_cap",
            Self::Error(_) => "error",
        }
    }

    /// Task error code for a monitor-initiated stop.
    pub fn error_code(&self) -> Option<TaskErrorCode> {
        match self {
            Self::Completed => None,
            Self::Idle => Some(TaskErrorCode::IdleTimeout),
            Self::HardCap => Some(TaskErrorCode::HardTimeout),
            Self::Error(_) => Some(TaskErrorCode::SessionError),
        }
    }

    /// Human-readable failure description.
    pub fn describe(&self, config: &ActivityConfig) -> String {
        match self {
            Self::Completed => "completed".to_string(),
            Self::Idle => format!(
                "no activity for {}s; session presumed stalled",
                config.idle_timeout.as_secs()
            ),
            Self::HardCap => format!(
                "exceeded hard cap of {}s",
                config.hard_cap.as_secs()
            ),
            Self::Error(msg) => format!("session error: {}", msg),
        }
    }
}

/// Watches one session for inactivity.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    config: ActivityConfig,
    session_id: Option<String>,
}

impl ActivityMonitor {
    pub fn new(config: ActivityConfig) -> Self {
        Self {
            config,
            session_id: None,
        }
    }

    /// Only count signals tagged with this session.
    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn config(&self) -> &ActivityConfig {
        &self.config
    }

    fn matches(&self, signal: &ActivitySignal) -> bool {
        match (&self.session_id, signal.session_id()) {
            (None, _) => true,
            (Some(ours), Some(theirs)) => ours == theirs,
            (Some(_), None) => false,
        }
    }

    /// Watch pushed signals until the token is cancelled or a limit fires.
    ///
    /// If the signal channel closes, the monitor keeps enforcing the timers.
    pub async fn watch(
        &self,
        mut signals: mpsc::Receiver<ActivitySignal>,
        cancel: &CancelToken,
    ) -> MonitorOutcome {
        let started = Instant::now();
        let hard_deadline = started + self.config.hard_cap;
        let mut idle_deadline = started + self.config.idle_timeout;
        let mut stream_open = true;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break MonitorOutcome::Completed,
                _ = sleep_until(hard_deadline) => break MonitorOutcome::HardCap,
                _ = sleep_until(idle_deadline) => break MonitorOutcome::Idle,
                signal = signals.recv(), if stream_open => match signal {
                    Some(signal) if self.matches(&signal) => match signal {
                        ActivitySignal::Activity { .. } => {
                            idle_deadline = Instant::now() + self.config.idle_timeout;
                        }
                        ActivitySignal::SessionError { message, .. } => {
                            break MonitorOutcome::Error(message);
                        }
                    },
                    Some(_) => {}
                    None => {
                        debug!("Activity stream closed; timers only");
                        stream_open = false;
                    }
                },
            }
        };

        self.finish(outcome, cancel)
    }

    /// Poll `sample` for a progress counter (e.g. message count). Any change
    /// counts as activity; `None` means the sample failed and is ignored.
    pub async fn watch_polling<F, Fut>(&self, mut sample: F, cancel: &CancelToken) -> MonitorOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<u64>>,
    {
        let started = Instant::now();
        let hard_deadline = started + self.config.hard_cap;
        let mut idle_deadline = started + self.config.idle_timeout;
        let mut last_seen: Option<u64> = None;

        let outcome = loop {
            let next_poll = Instant::now() + self.config.poll_interval;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break MonitorOutcome::Completed,
                _ = sleep_until(hard_deadline) => break MonitorOutcome::HardCap,
                _ = sleep_until(idle_deadline) => break MonitorOutcome::Idle,
                _ = sleep_until(next_poll) => {
                    if let Some(count) = sample().await {
                        if last_seen.is_some_and(|prev| prev != count) {
                            idle_deadline = Instant::now() + self.config.idle_timeout;
                        }
                        last_seen = Some(count);
                    }
                }
            }
        };

        self.finish(outcome, cancel)
    }

    fn finish(&self, outcome: MonitorOutcome, cancel: &CancelToken) -> MonitorOutcome {
        if outcome != MonitorOutcome::Completed {
            warn!(
                session_id = ?self.session_id,
                outcome = outcome.as_str(),
                "Activity monitor cancelling task"
            );
            cancel.cancel();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn config(idle_ms: u64, hard_ms: u64) -> ActivityConfig {
        ActivityConfig {
            idle_timeout: Duration::from_millis(idle_ms),
            hard_cap: Duration::from_millis(hard_ms),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_without_events() {
        let monitor = ActivityMonitor::new(config(100, 10_000)).for_session("s1");
        let (_tx, rx) = mpsc::channel(8);
        let cancel = CancelToken::new();

        let outcome = monitor.watch(rx, &cancel).await;
        assert_eq!(outcome, MonitorOutcome::Idle);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_error_aborts_immediately() {
        let monitor = ActivityMonitor::new(config(10_000, 60_000)).for_session("s1");
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancelToken::new();

        tx.send(ActivitySignal::SessionError {
            session_id: Some("s1".into()),
            message: "provider exploded".into(),
        })
        .await
        .unwrap();

        let outcome = monitor.watch(rx, &cancel).await;
        assert_eq!(outcome, MonitorOutcome::Error("provider exploded".into()));
        assert_eq!(outcome.error_code(), Some(TaskErrorCode::SessionError));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_cap_despite_activity() {
        let monitor = ActivityMonitor::new(config(100, 500)).for_session("s1");
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancelToken::new();

        let feeder = tokio::spawn(async move {
            loop {
                if tx.send(ActivitySignal::activity("s1")).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let outcome = monitor.watch(rx, &cancel).await;
        assert_eq!(outcome, MonitorOutcome::HardCap);
        feeder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_sessions_do_not_reset_idle() {
        let monitor = ActivityMonitor::new(config(100, 10_000)).for_session("mine");
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancelToken::new();

        let feeder = tokio::spawn(async move {
            loop {
                if tx.send(ActivitySignal::activity("theirs")).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        assert_eq!(monitor.watch(rx, &cancel).await, MonitorOutcome::Idle);
        feeder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_completion_resolves_completed() {
        let monitor = ActivityMonitor::new(config(1_000, 10_000));
        let (_tx, rx) = mpsc::channel(8);
        let cancel = CancelToken::new();

        let task_side = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            task_side.cancel();
        });

        assert_eq!(monitor.watch(rx, &cancel).await, MonitorOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_stream_still_times_out() {
        let monitor = ActivityMonitor::new(config(100, 10_000));
        let (tx, rx) = mpsc::channel(8);
        drop(tx);
        let cancel = CancelToken::new();
        assert_eq!(monitor.watch(rx, &cancel).await, MonitorOutcome::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_progress_keeps_alive_until_stall() {
        let monitor = ActivityMonitor::new(config(100, 10_000));
        let cancel = CancelToken::new();
        let counter = Arc::new(AtomicU64::new(0));

        // Progress for the first 20 polls, then stall.
        let sample_counter = counter.clone();
        let polls = Arc::new(AtomicU64::new(0));
        let sample_polls = polls.clone();
        let outcome = monitor
            .watch_polling(
                move || {
                    let n = sample_polls.fetch_add(1, Ordering::SeqCst);
                    if n < 20 {
                        sample_counter.fetch_add(1, Ordering::SeqCst);
                    }
                    let value = sample_counter.load(Ordering::SeqCst);
                    async move { Some(value) }
                },
                &cancel,
            )
            .await;

        assert_eq!(outcome, MonitorOutcome::Idle);
        assert!(polls.load(Ordering::SeqCst) > 20);
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}
