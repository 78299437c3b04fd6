// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Coding-agent execution.
//!
//! Workers hand tasks to autonomous coding agents through the
//! [`CodingAgentClient`] contract. Two backend families implement it:
//!
//! - [`remote`]: a coding-agent server reached over HTTP with an SSE event
//!   stream.
//! - [`pty`]: a local CLI attached to a pseudo-terminal.
//!
//! Both race the task against an [`ActivityMonitor`] and always produce one
//! [`CodingAgentTaskResult`], salvaging partial summaries and diffs on
//! timeouts.

pub mod activity;
pub mod cancel;
pub mod classifier;
pub mod events;
pub mod pty;
pub mod registry;
pub mod remote;
pub mod ring_buffer;
pub mod summary;
pub mod supervisor;
pub mod types;

pub use activity::{ActivityConfig, ActivityMonitor, ActivitySignal, MonitorOutcome};
pub use cancel::CancelToken;
pub use classifier::{NeverAsk, QuestionClassifier, TrailingQuestion};
pub use events::{NativeEvent, SessionEndStatus, SessionEvent, SessionEventSink};
pub use pty::{PtyBackend, PtyClient, PtySettings};
pub use registry::{backend_kind_for, BackendKind, BackendRegistry};
pub use remote::{RemoteBackend, RemoteClient, RemoteSettings};
pub use ring_buffer::ReplayBuffer;
pub use supervisor::ProcessSupervisor;
pub use types::{
    CodingAgentClient, CodingAgentTaskResult, CodingBackend, HumanResponder, PermissionDecision,
    PermissionHandler, PermissionRequest, TaskCallbacks, TaskErrorCode, TokenUsage,
};
