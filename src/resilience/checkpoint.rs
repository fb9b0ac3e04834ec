//! Recovery checkpoint
//!
//! Overwritten on every breaker trip and phase boundary, removed when a phase
//! completes cleanly. Domains listed as completed are skipped on restart.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::circuit_breaker::BreakerState;
use super::resource_monitor::ResourceSnapshot;
use crate::error::Result;
use crate::install::write_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    /// Configuration fingerprint the checkpoint belongs to
    pub fingerprint: String,
    pub resource_snapshot: Option<ResourceSnapshot>,
    pub breaker_state: BreakerState,
    pub completed_count: usize,
    pub pending_count: usize,
    pub completed: BTreeSet<String>,
}

impl CheckpointState {
    /// Whether this checkpoint can resume `phase` under `fingerprint`
    pub fn resumes(&self, phase: &str, fingerprint: &str) -> bool {
        self.phase == phase && self.fingerprint == fingerprint
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, state: &CheckpointState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(&self.path, json.as_bytes(), Some(0o600))?;
        debug!(
            phase = %state.phase,
            completed = state.completed_count,
            pending = state.pending_count,
            breaker = state.breaker_state.name(),
            "Checkpoint written"
        );
        Ok(())
    }

    /// A corrupt checkpoint is ignored; the phase then starts from scratch
    pub fn load(&self) -> Result<Option<CheckpointState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path)?;
        match serde_json::from_str(&json) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable checkpoint");
                Ok(None)
            }
        }
    }

    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
