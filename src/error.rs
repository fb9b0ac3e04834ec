//! Error taxonomy for the provisioner
//!
//! Per-domain failures are collected as [`DomainFailure`] values and never
//! abort a run; only configuration and setup problems are fatal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dns::dnssec::DnssecError;
use crate::dns::dnssec_keys::DnssecKeyError;

/// Result type alias for provisioner operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Errors that can occur while provisioning
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Malformed domain or application entry
    #[error("Validation error for '{entity}': {reason}")]
    Validation { entity: String, reason: String },

    /// Key generation, signing, ACME or a reload command failed
    #[error("{tool} failed: {reason}")]
    ExternalTool { tool: String, reason: String },

    /// Sampled utilisation exceeded a configured maximum
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Circuit breaker is open; new work is blocked until the cooldown elapses
    #[error("Circuit open: new work blocked for another {remaining_secs}s")]
    CircuitOpen { remaining_secs: u64 },

    /// A single attempt exceeded its hard timeout
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// Bounded retries were used up
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("DNSSEC error: {0}")]
    Dnssec(#[from] DnssecError),

    #[error("DNSSEC key error: {0}")]
    DnssecKey(#[from] DnssecKeyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProvisionError {
    pub fn validation(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        ProvisionError::Validation {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        ProvisionError::ExternalTool {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error should count against the circuit breaker.
    ///
    /// Circuit-open rejections are a consequence of the breaker, not a new
    /// failure, and validation errors are fatal for their entity only.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            ProvisionError::CircuitOpen { .. } | ProvisionError::Validation { .. }
        )
    }
}

/// Component of the pipeline a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Model,
    Zone,
    Certificate,
    Routing,
    Firewall,
    Backend,
    Resilience,
    Cleanup,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Model => "model",
            Component::Zone => "zone",
            Component::Certificate => "certificate",
            Component::Routing => "routing",
            Component::Firewall => "firewall",
            Component::Backend => "backend",
            Component::Resilience => "resilience",
            Component::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// A failure isolated to one domain (or one phase-wide step)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainFailure {
    pub domain: String,
    pub component: Component,
    pub reason: String,
}

impl DomainFailure {
    pub fn new(domain: impl Into<String>, component: Component, reason: impl ToString) -> Self {
        let failure = Self {
            domain: domain.into(),
            component,
            reason: reason.to_string(),
        };
        tracing::error!(
            domain = %failure.domain,
            component = %failure.component,
            reason = %failure.reason,
            "Provisioning step failed"
        );
        failure
    }
}
