//! Circuit breaker
//!
//! State changes are computed by [`transition`], a pure function of the
//! current state, an event and the configuration. [`CircuitBreaker`] wraps it
//! with interior mutability so concurrent domain tasks can share one breaker.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ResilienceConfig;
use crate::error::{ProvisionError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl From<&ResilienceConfig> for BreakerConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::seconds(config.cooldown_secs as i64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState {
    Closed { failures: u32 },
    Open { failures: u32, opened_at: DateTime<Utc> },
    HalfOpen { failures: u32 },
}

impl BreakerState {
    pub fn failures(&self) -> u32 {
        match *self {
            BreakerState::Closed { failures }
            | BreakerState::Open { failures, .. }
            | BreakerState::HalfOpen { failures } => failures,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, BreakerState::Open { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen { .. } => "half_open",
        }
    }
}

impl Default for BreakerState {
    fn default() -> Self {
        BreakerState::Closed { failures: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Success,
    Failure { at: DateTime<Utc> },
    /// Opens the breaker regardless of the failure count
    Trip { at: DateTime<Utc> },
    /// Time passes; lets an open breaker move to half-open
    Tick { now: DateTime<Utc> },
}

/// Compute the next breaker state
pub fn transition(state: BreakerState, event: BreakerEvent, config: &BreakerConfig) -> BreakerState {
    match (state, event) {
        (BreakerState::Closed { .. }, BreakerEvent::Success) => BreakerState::Closed { failures: 0 },
        (BreakerState::Closed { failures }, BreakerEvent::Failure { at }) => {
            let failures = failures.saturating_add(1);
            if failures >= config.failure_threshold {
                BreakerState::Open {
                    failures,
                    opened_at: at,
                }
            } else {
                BreakerState::Closed { failures }
            }
        }

        (BreakerState::Open { failures, opened_at }, BreakerEvent::Tick { now }) => {
            if now - opened_at >= config.cooldown {
                BreakerState::HalfOpen { failures }
            } else {
                state
            }
        }
        // In-flight work finishing while open does not close the breaker
        (BreakerState::Open { .. }, BreakerEvent::Success) => state,
        (BreakerState::Open { failures, opened_at }, BreakerEvent::Failure { .. }) => BreakerState::Open {
            failures: failures.saturating_add(1),
            opened_at,
        },

        (BreakerState::HalfOpen { .. }, BreakerEvent::Success) => BreakerState::Closed { failures: 0 },
        (BreakerState::HalfOpen { failures }, BreakerEvent::Failure { at }) => BreakerState::Open {
            failures: failures.saturating_add(1),
            opened_at: at,
        },

        (BreakerState::Open { failures, opened_at }, BreakerEvent::Trip { .. }) => BreakerState::Open {
            failures: failures.saturating_add(1),
            opened_at,
        },
        (_, BreakerEvent::Trip { at }) => BreakerState::Open {
            failures: state.failures().saturating_add(1),
            opened_at: at,
        },

        (_, BreakerEvent::Tick { .. }) => state,
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// A half-open breaker admits a single trial
    probe_in_flight: bool,
}

/// Shared breaker guarding one phase
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_state(name, config, BreakerState::default())
    }

    /// Resume from a checkpointed state
    pub fn with_state(name: impl Into<String>, config: BreakerConfig, state: BreakerState) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Admit new work at `now`, or reject it with `CircuitOpen`
    pub fn check(&self, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        let before = inner.state;
        inner.state = transition(before, BreakerEvent::Tick { now }, &self.config);

        if before.is_open() && !inner.state.is_open() {
            info!(breaker = %self.name, "Cooldown elapsed, circuit half-open");
        }

        match inner.state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::HalfOpen { .. } if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Ok(())
            }
            BreakerState::HalfOpen { .. } => Err(ProvisionError::CircuitOpen { remaining_secs: 0 }),
            BreakerState::Open { opened_at, .. } => {
                let remaining = (opened_at + self.config.cooldown - now).num_seconds().max(0);
                Err(ProvisionError::CircuitOpen {
                    remaining_secs: remaining as u64,
                })
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        let before = inner.state;
        inner.state = transition(before, BreakerEvent::Success, &self.config);
        inner.probe_in_flight = false;

        if matches!(before, BreakerState::HalfOpen { .. }) {
            info!(breaker = %self.name, "Trial succeeded, circuit closed");
        }
    }

    /// Returns true when this failure opened the breaker
    pub fn record_failure(&self, at: DateTime<Utc>) -> bool {
        self.apply_failure(BreakerEvent::Failure { at })
    }

    /// Open the breaker now, whatever the failure count
    pub fn trip(&self, at: DateTime<Utc>) -> bool {
        self.apply_failure(BreakerEvent::Trip { at })
    }

    fn apply_failure(&self, event: BreakerEvent) -> bool {
        let mut inner = self.lock();
        let before = inner.state;
        inner.state = transition(before, event, &self.config);
        inner.probe_in_flight = false;

        let tripped = !before.is_open() && inner.state.is_open();
        if tripped {
            warn!(
                breaker = %self.name,
                failures = inner.state.failures(),
                cooldown_secs = self.config.cooldown.num_seconds(),
                "Circuit opened"
            );
        }
        tripped
    }

    /// Time until an open breaker admits a trial
    pub fn remaining_cooldown(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        match self.state() {
            BreakerState::Open { opened_at, .. } => (opened_at + self.config.cooldown - now).to_std().ok(),
            _ => None,
        }
    }
}
