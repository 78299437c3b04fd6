// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Structured logging.
//!
//! Call [`init_telemetry`] once at startup and keep the guard:
//!
//! ```rust,ignore
//! use foreman::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! Code logs through `tracing` with structured fields (`worker_id`,
//! `session_id`, `branch`, `provider`) and `#[instrument]` on async entry
//! points. Keep secrets out of fields.

mod init;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
