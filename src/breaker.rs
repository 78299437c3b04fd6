// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-provider circuit breaker.
//!
//! Workers consult the breaker before dispatching to a coding-agent backend.
//! A provider that keeps failing is skipped (the worker falls back to the
//! direct LLM loop) until a cool-down elapses, after which a single trial
//! attempt is allowed. A trial that ends without saying anything about the
//! provider (a timeout, a non-zero exit) is handed back with
//! [`CircuitBreaker::release_attempt`], which reopens the circuit for another
//! cool-down instead of leaving it half-open.
//!
//! ```text
//! Closed ──N consecutive failures──▶ Open ──reset timeout──▶ HalfOpen
//!   ▲                                 ▲                        │
//!   └────────────── success ──────────┼────────────────────────┤
//!                                     └──────── failure ───────┘
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing a trial attempt.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker for a single provider.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
        }
    }

    /// Current state, without applying the cool-down transition.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failures recorded since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// When the most recent failure was recorded.
    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// Whether a call may be attempted now.
    pub fn can_attempt(&mut self) -> bool {
        self.can_attempt_at(Instant::now())
    }

    /// Whether a call may be attempted at `now`.
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open and
    /// admits exactly one attempt; further calls are refused until its
    /// outcome is recorded.
    pub fn can_attempt_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let cooled = self
                    .last_failure
                    .map(|t| now.saturating_duration_since(t) >= self.config.reset_timeout)
                    .unwrap_or(true);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                }
                cooled
            }
        }
    }

    /// Record a successful call; closes the circuit.
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
    }

    /// Record a failed call.
    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    /// Record a failed call at `now`.
    pub fn record_failure_at(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        self.last_failure = Some(now);
        if self.state == CircuitState::HalfOpen
            || self.consecutive_failures >= self.config.failure_threshold
        {
            self.state = CircuitState::Open;
        }
    }

    /// Give back a half-open attempt whose outcome neither proves nor disproves
    /// the provider's health. Reopens the circuit; the failure count is left
    /// alone. No effect in any other state.
    pub fn release_attempt(&mut self) {
        self.release_attempt_at(Instant::now());
    }

    /// [`release_attempt`](Self::release_attempt) at `now`.
    pub fn release_attempt_at(&mut self, now: Instant) {
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Open;
            self.last_failure = Some(now);
        }
    }
}

/// Breakers keyed by provider.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry applying `config` to every provider.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn with_breaker<T>(&self, provider: &str, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let breaker = breakers
            .entry(provider.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        f(breaker)
    }

    /// Whether the provider may be used now.
    pub fn is_provider_available(&self, provider: &str) -> bool {
        self.with_breaker(provider, |b| b.can_attempt())
    }

    /// Record a successful call for the provider.
    pub fn record_success(&self, provider: &str) {
        self.with_breaker(provider, |b| {
            if b.state() != CircuitState::Closed {
                info!(provider, "Circuit closed");
            }
            b.record_success();
        });
    }

    /// Record a failed call for the provider.
    pub fn record_failure(&self, provider: &str) {
        self.with_breaker(provider, |b| {
            let was_open = b.state() == CircuitState::Open;
            b.record_failure();
            if !was_open && b.state() == CircuitState::Open {
                warn!(
                    provider,
                    failures = b.consecutive_failures(),
                    "Circuit opened"
                );
            }
        });
    }

    /// Record an outcome that does not reflect the provider's health.
    pub fn record_neutral(&self, provider: &str) {
        self.with_breaker(provider, |b| {
            if b.state() == CircuitState::HalfOpen {
                info!(provider, "Half-open attempt inconclusive, circuit reopened");
            }
            b.release_attempt();
        });
    }

    /// Current state for the provider.
    pub fn state(&self, provider: &str) -> CircuitState {
        self.with_breaker(provider, |b| b.state())
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(config());
        let t0 = Instant::now();

        breaker.record_failure_at(t0);
        breaker.record_failure_at(t0);
        assert!(breaker.can_attempt_at(t0));
        breaker.record_failure_at(t0);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_attempt_at(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_half_open_admits_one_attempt() {
        let mut breaker = CircuitBreaker::new(config());
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(t0);
        }

        let later = t0 + Duration::from_secs(10);
        assert!(breaker.can_attempt_at(later));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.can_attempt_at(later));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_attempt_at(later));
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut breaker = CircuitBreaker::new(config());
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(t0);
        }
        let later = t0 + Duration::from_secs(11);
        assert!(breaker.can_attempt_at(later));

        breaker.record_failure_at(later);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_attempt_at(later + Duration::from_secs(1)));
    }

    #[test]
    fn test_success_resets_count() {
        let mut breaker = CircuitBreaker::new(config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_is_per_provider() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        });

        registry.record_failure("anthropic");
        assert!(!registry.is_provider_available("anthropic"));
        assert!(registry.is_provider_available("openai"));

        registry.record_success("anthropic");
        assert!(registry.is_provider_available("anthropic"));
    }

    #[test]
    fn test_registry_reopens_after_timeout() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(20),
        });
        registry.record_failure("p");
        registry.record_failure("p");
        assert!(!registry.is_provider_available("p"));

        std::thread::sleep(Duration::from_millis(30));
        assert!(registry.is_provider_available("p"));
        assert!(!registry.is_provider_available("p"));
        registry.record_success("p");
        assert!(registry.is_provider_available("p"));
    }

    #[test]
    fn test_released_attempt_reopens_for_another_cool_down() {
        let mut breaker = CircuitBreaker::new(config());
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(t0);
        }

        let trial = t0 + Duration::from_secs(10);
        assert!(breaker.can_attempt_at(trial));
        breaker.release_attempt_at(trial);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.consecutive_failures(), 3);
        assert!(!breaker.can_attempt_at(trial + Duration::from_secs(5)));

        assert!(breaker.can_attempt_at(trial + Duration::from_secs(10)));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_release_attempt_ignored_when_closed() {
        let mut breaker = CircuitBreaker::new(config());
        breaker.release_attempt();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_attempt());
    }

    #[test]
    fn test_registry_recovers_after_inconclusive_attempts() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(20),
        });
        registry.record_failure("p");

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(30));
            assert!(registry.is_provider_available("p"));
            registry.record_neutral("p");
            assert_eq!(registry.state("p"), CircuitState::Open);
        }
    }
}
