//! External command execution
//!
//! Reload and validation commands are argv vectors taken from the
//! configuration. They are spawned directly, never through a shell, and
//! every invocation carries a hard timeout.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::CONFIG_PLACEHOLDER;
use crate::error::{ProvisionError, Result};

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` to completion, returning stdout on a zero exit status
    async fn run(&self, argv: &[String]) -> Result<String>;
}

/// Spawns real processes with `tokio::process`
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, argv: &[String]) -> Result<String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProvisionError::Config("empty command line".to_string()))?;

        info!(command = %argv.join(" "), "Executing command");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| ProvisionError::tool(program.as_str(), format!("cannot spawn: {}", e)))?;

        match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();

                if output.status.success() {
                    debug!(command = %program, "Command succeeded");
                    Ok(stdout)
                } else {
                    Err(ProvisionError::tool(
                        program.as_str(),
                        format!("exited with {}: {}", output.status, stderr.trim()),
                    ))
                }
            }
            Ok(Err(e)) => Err(ProvisionError::tool(
                program.as_str(),
                format!("failed to execute: {}", e),
            )),
            Err(_) => Err(ProvisionError::Timeout {
                operation: program.clone(),
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

/// Replace every `{config}` placeholder with `path`
pub fn substitute_config(argv: &[String], path: &Path) -> Vec<String> {
    let path = path.display().to_string();
    argv.iter()
        .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &path))
        .collect()
}
