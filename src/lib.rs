// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! foreman - multi-agent task orchestration.
//!
//! A coordinator (COO) delegates goals to per-project team leads, which split
//! them into tasks for workers. Workers hand code-editing tasks to autonomous
//! coding agents, each in its own git worktree, and the team lead merges
//! finished branches into trunk one at a time.
//!
//! # Architecture
//!
//! - [`bus`] - persisted addressed and broadcast messaging with request/response
//! - [`store`] - SQLite persistence for messages and agent records
//! - [`agents`] - COO, team leads, workers, merge queue and the agent registry
//! - [`coding`] - coding-agent clients (remote HTTP/SSE and PTY), activity
//!   monitoring and the normalized session event envelope
//! - [`git`] - repository bootstrap, worktree isolation and diff computation
//! - [`breaker`] - per-provider circuit breakers
//! - [`config`] - configuration loading and merging
//! - [`telemetry`] - tracing subscriber setup
//! - [`error`] - error types
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use foreman::agents::{AgentRecord, AgentRole, AgentServices, Worker};
//! use foreman::bus::{BusMessage, MessageBus};
//! use foreman::config::{load_config, CliOptions};
//! use foreman::store::Store;
//!
//! let config = load_config(".".as_ref(), CliOptions::default())?;
//! let bus = MessageBus::new(Arc::new(Store::open_in_memory()?));
//! let services = Arc::new(AgentServices::from_config(bus, &config)?);
//!
//! let record = services.registry.create(
//!     AgentRecord::new(AgentRole::Worker, None).with_coding_agent(Some("opencode".into())),
//! )?;
//! let _worker = Worker::spawn(services.clone(), &record);
//! let report = services
//!     .bus
//!     .request(&record.id, BusMessage::directive(None, &record.id, "Fix the flaky test"), timeout)
//!     .await?;
//! ```

pub mod agents;
pub mod breaker;
pub mod bus;
pub mod coding;
pub mod config;
pub mod error;
pub mod git;
pub mod store;
pub mod telemetry;

pub use error::{AgentError, BackendError, BusError, ConfigError, GitError, StoreError};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
