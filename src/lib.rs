// Library interface for the edge provisioner
// Exposes the phase orchestrator and its synthesizers for the CLI and tests

pub mod acme;
pub mod config;
pub mod dns;
pub mod domain_model;
pub mod error;
pub mod firewall;
pub mod install;
pub mod orchestrator;
pub mod resilience;
pub mod retry;
pub mod routing;
pub mod state_log;
pub mod tools;

pub use config::Config;
pub use error::{ProvisionError, Result};
pub use orchestrator::{Orchestrator, Phase, PhaseReport, RunOptions, Services};
