//! Resilience control loop
//!
//! Each phase runs under its own [`ResilienceController`]: a circuit breaker,
//! a resource monitor consulted before new work, a concurrency budget and the
//! checkpoint store used for recovery.

pub mod budget;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod resource_monitor;

use std::collections::BTreeSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::warn;

pub use budget::CognitiveBudget;
pub use checkpoint::{CheckpointState, CheckpointStore};
pub use circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use resource_monitor::{ResourceLimits, ResourceMonitor, ResourceSampler, ResourceSnapshot};

use crate::config::ResilienceConfig;
use crate::error::{ProvisionError, Result};

pub struct ResilienceController {
    phase: String,
    breaker: CircuitBreaker,
    monitor: ResourceMonitor,
    budget: CognitiveBudget,
    checkpoints: CheckpointStore,
    last_snapshot: Mutex<Option<ResourceSnapshot>>,
}

impl ResilienceController {
    pub fn new(
        phase: impl Into<String>,
        config: &ResilienceConfig,
        monitor: ResourceMonitor,
        checkpoints: CheckpointStore,
        breaker_state: BreakerState,
    ) -> Result<Self> {
        let phase = phase.into();
        Ok(Self {
            breaker: CircuitBreaker::with_state(phase.clone(), BreakerConfig::from(config), breaker_state),
            budget: CognitiveBudget::new(config.concurrency)?,
            phase,
            monitor,
            checkpoints,
            last_snapshot: Mutex::new(None),
        })
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn budget(&self) -> &CognitiveBudget {
        &self.budget
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn last_snapshot(&self) -> Option<ResourceSnapshot> {
        *self.last_snapshot.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Gate for new work: the breaker must admit it and resources must be
    /// within budget. A resource violation trips the breaker at once.
    pub fn admit(&self, now: DateTime<Utc>) -> Result<()> {
        self.breaker.check(now)?;

        match self.monitor.check() {
            Ok(snapshot) => {
                *self.last_snapshot.lock().unwrap_or_else(|p| p.into_inner()) = Some(snapshot);
                Ok(())
            }
            Err(e) => {
                if let Ok(snapshot) = self.monitor.sample() {
                    *self.last_snapshot.lock().unwrap_or_else(|p| p.into_inner()) = Some(snapshot);
                }
                warn!(phase = %self.phase, error = %e, "Resource budget exceeded");
                self.breaker.trip(now);
                Err(e)
            }
        }
    }

    /// Feed a unit-of-work outcome into the breaker. Returns true when this
    /// outcome opened the breaker.
    pub fn record<T>(&self, result: &Result<T>, now: DateTime<Utc>) -> bool {
        match result {
            Ok(_) => {
                self.breaker.record_success();
                false
            }
            Err(e) if e.counts_as_failure() => self.breaker.record_failure(now),
            Err(_) => false,
        }
    }

    pub fn record_failure(&self, error: &ProvisionError, now: DateTime<Utc>) -> bool {
        error.counts_as_failure() && self.breaker.record_failure(now)
    }

    /// Overwrite the checkpoint with the current progress
    pub fn checkpoint(
        &self,
        fingerprint: &str,
        completed: &BTreeSet<String>,
        pending_count: usize,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.checkpoints.save(&CheckpointState {
            timestamp: now,
            phase: self.phase.clone(),
            fingerprint: fingerprint.to_string(),
            resource_snapshot: self.last_snapshot(),
            breaker_state: self.breaker.state(),
            completed_count: completed.len(),
            pending_count,
            completed: completed.clone(),
        })
    }
}
