//! Append-only phase completion log (`phases.log`, one JSON object per line)

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    /// Every domain succeeded
    Completed,
    /// At least one domain failed
    Partial,
    /// The breaker refused to start the phase
    Blocked,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseLogEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub outcome: PhaseOutcome,
    pub fingerprint: String,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct PhaseLog {
    path: PathBuf,
}

impl PhaseLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, entry: &PhaseLogEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// All readable entries; malformed lines are skipped
    pub fn entries(&self) -> Result<Vec<PhaseLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed phase log line");
                    None
                }
            })
            .collect())
    }

    /// Most recent entry for `phase`
    pub fn latest(&self, phase: &str) -> Result<Option<PhaseLogEntry>> {
        Ok(self.entries()?.into_iter().rev().find(|e| e.phase == phase))
    }

    /// Whether the latest run of `phase` completed under `fingerprint`
    pub fn is_completed(&self, phase: &str, fingerprint: &str) -> Result<bool> {
        Ok(self
            .latest(phase)?
            .map_or(false, |e| e.outcome == PhaseOutcome::Completed && e.fingerprint == fingerprint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(phase: &str, outcome: PhaseOutcome, fingerprint: &str) -> PhaseLogEntry {
        PhaseLogEntry {
            timestamp: Utc::now(),
            phase: phase.to_string(),
            outcome,
            fingerprint: fingerprint.to_string(),
            succeeded: 2,
            failed: 0,
        }
    }

    #[test]
    fn test_append_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let log = PhaseLog::new(dir.path().join("state/phases.log"));
        assert!(!log.is_completed("infra", "fp1").unwrap());

        log.append(&entry("infra", PhaseOutcome::Completed, "fp1")).unwrap();
        log.append(&entry("deploy", PhaseOutcome::Partial, "fp1")).unwrap();

        assert_eq!(log.entries().unwrap().len(), 2);
        assert!(log.is_completed("infra", "fp1").unwrap());
        assert!(!log.is_completed("infra", "fp2").unwrap());
        assert!(!log.is_completed("deploy", "fp1").unwrap());

        // A later partial run supersedes the earlier completion
        log.append(&entry("infra", PhaseOutcome::Partial, "fp1")).unwrap();
        assert!(!log.is_completed("infra", "fp1").unwrap());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phases.log");
        fs::write(&path, "garbage\n\n").unwrap();
        let log = PhaseLog::new(&path);
        log.append(&entry("infra", PhaseOutcome::Completed, "fp")).unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 1);
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.lines().last().unwrap().contains("\"outcome\":\"completed\""));
    }
}
