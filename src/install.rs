//! Staged installation of generated configuration files
//!
//! New content is written next to the active file, checked with the
//! service's own validator, swapped in with a rename and only then
//! activated. A failed validation leaves the active file untouched; a failed
//! activation restores the previous file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{ProvisionError, Result};
use crate::tools::{substitute_config, CommandRunner};

/// Write `contents` to `path` through a same-directory temp file and rename
pub fn write_atomic(path: &Path, contents: &[u8], mode: Option<u32>) -> io::Result<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
    temp_file.write_all(contents)?;
    temp_file.as_file().sync_all()?;

    if let Some(mode) = mode {
        set_mode(temp_file.as_file(), mode)?;
    }

    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Result of an install attempt that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Active file already had this content; nothing was reloaded
    Unchanged,
    /// New content validated, swapped in and activated
    Installed,
}

/// Validate-then-swap installer for one managed file
pub struct StagedInstall<'a> {
    /// Human-readable name used in logs and errors ("proxy", "firewall")
    pub label: &'a str,
    pub target: &'a Path,
    pub validate: &'a [String],
    pub activate: &'a [String],
}

impl<'a> StagedInstall<'a> {
    pub fn staging_path(&self) -> PathBuf {
        sibling(self.target, "staged")
    }

    fn backup_path(&self) -> PathBuf {
        sibling(self.target, "prev")
    }

    /// Stage, validate, swap and activate `contents`
    pub async fn install(&self, runner: &dyn CommandRunner, contents: &str) -> Result<InstallOutcome> {
        if let Ok(current) = fs::read_to_string(self.target) {
            if current == contents {
                info!(path = %self.target.display(), "{} configuration unchanged", self.label);
                return Ok(InstallOutcome::Unchanged);
            }
        }

        let staged = self.staging_path();
        write_atomic(&staged, contents.as_bytes(), None)?;

        if let Err(e) = runner.run(&substitute_config(self.validate, &staged)).await {
            let _ = fs::remove_file(&staged);
            warn!(label = self.label, error = %e, "Staged configuration rejected; active file kept");
            return Err(ProvisionError::validation(
                format!("{} configuration", self.label),
                e.to_string(),
            ));
        }

        let backup = self.backup_path();
        let had_previous = self.target.exists();
        if had_previous {
            fs::copy(self.target, &backup)?;
        }

        fs::rename(&staged, self.target)?;

        if let Err(e) = runner.run(&substitute_config(self.activate, self.target)).await {
            warn!(label = self.label, error = %e, "Activation failed; restoring previous configuration");
            if had_previous {
                fs::rename(&backup, self.target)?;
            } else {
                fs::remove_file(self.target)?;
            }
            return Err(e);
        }

        if had_previous {
            let _ = fs::remove_file(&backup);
        }

        info!(path = %self.target.display(), "{} configuration installed", self.label);
        Ok(InstallOutcome::Installed)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fake::FakeRunner;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_write_atomic_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/file.txt");

        write_atomic(&path, b"one", None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "one");

        write_atomic(&path, b"two", Some(0o600)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // No temp files left behind
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_install_validates_staged_then_activates() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("haproxy.cfg");
        let validate = argv(&["haproxy", "-c", "-f", "{config}"]);
        let activate = argv(&["systemctl", "reload", "haproxy"]);
        let runner = FakeRunner::default();

        let install = StagedInstall {
            label: "proxy",
            target: &target,
            validate: &validate,
            activate: &activate,
        };

        let outcome = install.install(&runner, "global\n").await.unwrap();
        assert_eq!(outcome, InstallOutcome::Installed);
        assert_eq!(fs::read_to_string(&target).unwrap(), "global\n");

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][3], install.staging_path().display().to_string());
        assert_eq!(calls[1], activate);
        assert!(!install.staging_path().exists());
    }

    #[tokio::test]
    async fn test_unchanged_content_skips_reload() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("pf.conf");
        fs::write(&target, "block in all\n").unwrap();
        let validate = argv(&["pfctl", "-nf", "{config}"]);
        let activate = argv(&["pfctl", "-f", "{config}"]);
        let runner = FakeRunner::default();

        let install = StagedInstall {
            label: "firewall",
            target: &target,
            validate: &validate,
            activate: &activate,
        };

        let outcome = install.install(&runner, "block in all\n").await.unwrap();
        assert_eq!(outcome, InstallOutcome::Unchanged);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_config_leaves_active_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("haproxy.cfg");
        fs::write(&target, "old\n").unwrap();
        let validate = argv(&["haproxy", "-c", "-f", "{config}"]);
        let activate = argv(&["systemctl", "reload", "haproxy"]);
        let runner = FakeRunner::failing_on("-c");

        let install = StagedInstall {
            label: "proxy",
            target: &target,
            validate: &validate,
            activate: &activate,
        };

        let err = install.install(&runner, "broken\n").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Validation { .. }));
        assert_eq!(fs::read_to_string(&target).unwrap(), "old\n");
        assert_eq!(runner.calls_to("systemctl"), 0);
        assert!(!install.staging_path().exists());
    }

    #[tokio::test]
    async fn test_failed_activation_restores_previous() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("haproxy.cfg");
        fs::write(&target, "old\n").unwrap();
        let validate = argv(&["haproxy", "-c", "-f", "{config}"]);
        let activate = argv(&["systemctl", "reload", "haproxy"]);
        let runner = FakeRunner::failing_on("reload");

        let install = StagedInstall {
            label: "proxy",
            target: &target,
            validate: &validate,
            activate: &activate,
        };

        let err = install.install(&runner, "new\n").await.unwrap_err();
        assert!(matches!(err, ProvisionError::ExternalTool { .. }));
        assert_eq!(fs::read_to_string(&target).unwrap(), "old\n");
    }
}
