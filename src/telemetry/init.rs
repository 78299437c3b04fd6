// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber setup.

use std::io;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Level used when neither `RUST_LOG` nor a directive is set.
    pub default_level: Level,
    /// Log span enter/close events.
    pub span_events: bool,
    pub file_line: bool,
    pub target: bool,
    pub ansi: bool,
    /// Compact single-line format instead of the full one.
    pub compact: bool,
    /// Explicit filter directive; wins over `RUST_LOG`.
    pub directive: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            span_events: false,
            file_line: false,
            target: true,
            ansi: true,
            compact: true,
            directive: None,
        }
    }
}

impl TelemetryConfig {
    /// Verbose output for local work.
    pub fn development() -> Self {
        Self {
            default_level: Level::DEBUG,
            span_events: true,
            file_line: true,
            compact: false,
            ..Self::default()
        }
    }

    /// Warnings only, no colours.
    pub fn production() -> Self {
        Self {
            default_level: Level::WARN,
            target: false,
            ansi: false,
            ..Self::default()
        }
    }

    /// Everything from this crate, plain text.
    pub fn testing() -> Self {
        Self {
            default_level: Level::TRACE,
            span_events: true,
            file_line: true,
            ansi: false,
            compact: false,
            directive: Some("foreman=trace".to_string()),
            ..Self::default()
        }
    }

    /// Preset by name: `default`, `development`, `production` or `testing`.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::default()),
            "development" | "dev" => Some(Self::development()),
            "production" | "prod" => Some(Self::production()),
            "testing" | "test" => Some(Self::testing()),
            _ => None,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = Some(directive.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Filter for this configuration.
    ///
    /// An explicit directive wins, then `RUST_LOG`, then the default level.
    /// An unparsable directive falls back to the default level.
    pub fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_level.as_str());
        match &self.directive {
            Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Keeps logging alive; hold it for the life of the program.
#[must_use]
pub struct TelemetryGuard {
    _private: (),
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi)
        .with_target(config.target)
        .with_file(config.file_line)
        .with_line_number(config.file_line)
        .with_span_events(span_events);

    let registry = tracing_subscriber::registry().with(config.env_filter());
    let installed = if config.compact {
        registry.with(layer.compact()).try_init()
    } else {
        registry.with(layer).try_init()
    };
    installed.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    Ok(TelemetryGuard { _private: () })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(TelemetryConfig::preset("default"), Some(TelemetryConfig::default()));
        assert_eq!(
            TelemetryConfig::preset("dev").unwrap().default_level,
            Level::DEBUG
        );
        let prod = TelemetryConfig::preset("production").unwrap();
        assert_eq!(prod.default_level, Level::WARN);
        assert!(!prod.ansi);
        assert_eq!(
            TelemetryConfig::testing().directive.as_deref(),
            Some("foreman=trace")
        );
        assert!(TelemetryConfig::preset("loud").is_none());
    }

    #[test]
    fn test_directive_wins() {
        let config = TelemetryConfig::default().with_directive("foreman::bus=debug");
        assert_eq!(config.env_filter().to_string(), "foreman::bus=debug");
    }

    #[test]
    fn test_bad_directive_falls_back() {
        let config = TelemetryConfig::default()
            .with_level(Level::WARN)
            .with_directive("foreman=[");
        assert!(config.env_filter().to_string().eq_ignore_ascii_case("warn"));
    }
}
