//! Resource budget checks
//!
//! Utilisation is sampled before new work starts. Any value above its
//! configured maximum is reported as [`ProvisionError::ResourceExhaustion`]
//! and counts as a breaker failure.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::debug;

use crate::config::ResilienceConfig;
use crate::error::{ProvisionError, Result};

/// Utilisation percentages at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
}

impl std::fmt::Display for ResourceSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu {:.1}%, memory {:.1}%, disk {:.1}%",
            self.cpu_percent, self.memory_percent, self.disk_percent
        )
    }
}

/// Source of utilisation samples
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Result<ResourceSnapshot>;
}

/// Samples the local host with `sysinfo`
pub struct SystemSampler {
    system: Mutex<System>,
    /// Disk usage is measured for the filesystem holding this path
    disk_path: PathBuf,
}

impl SystemSampler {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        // First CPU refresh only establishes a baseline
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
            disk_path: disk_path.into(),
        }
    }

    fn disk_percent(&self) -> f32 {
        let disks = Disks::new_with_refreshed_list();
        let best = disks
            .list()
            .iter()
            .filter(|d| self.disk_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());

        match best {
            Some(disk) if disk.total_space() > 0 => {
                let used = disk.total_space().saturating_sub(disk.available_space());
                used as f32 / disk.total_space() as f32 * 100.0
            }
            _ => 0.0,
        }
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> Result<ResourceSnapshot> {
        let mut system = self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_cpu();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_info().cpu_usage();
        let total_memory = system.total_memory();
        let memory_percent = if total_memory > 0 {
            system.used_memory() as f32 / total_memory as f32 * 100.0
        } else {
            0.0
        };
        drop(system);

        Ok(ResourceSnapshot {
            cpu_percent,
            memory_percent,
            disk_percent: self.disk_percent(),
        })
    }
}

/// Maximum utilisation allowed before new work is refused
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub max_cpu_percent: f32,
    pub max_memory_percent: f32,
    pub max_disk_percent: f32,
}

impl From<&ResilienceConfig> for ResourceLimits {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            max_cpu_percent: config.max_cpu_percent,
            max_memory_percent: config.max_memory_percent,
            max_disk_percent: config.max_disk_percent,
        }
    }
}

impl ResourceLimits {
    /// Every limit the snapshot exceeds
    pub fn violations(&self, snapshot: &ResourceSnapshot) -> Vec<String> {
        [
            ("cpu", snapshot.cpu_percent, self.max_cpu_percent),
            ("memory", snapshot.memory_percent, self.max_memory_percent),
            ("disk", snapshot.disk_percent, self.max_disk_percent),
        ]
        .into_iter()
        .filter(|(_, value, max)| value > max)
        .map(|(name, value, max)| format!("{} {:.1}% > {:.1}%", name, value, max))
        .collect()
    }
}

pub struct ResourceMonitor {
    sampler: Arc<dyn ResourceSampler>,
    limits: ResourceLimits,
}

impl ResourceMonitor {
    pub fn new(sampler: Arc<dyn ResourceSampler>, limits: ResourceLimits) -> Self {
        Self { sampler, limits }
    }

    /// Production monitor for the filesystem holding `state_dir`
    pub fn system(config: &ResilienceConfig, state_dir: &Path) -> Self {
        Self::new(Arc::new(SystemSampler::new(state_dir)), ResourceLimits::from(config))
    }

    pub fn sample(&self) -> Result<ResourceSnapshot> {
        self.sampler.sample()
    }

    /// Sample and compare against the limits
    pub fn check(&self) -> Result<ResourceSnapshot> {
        let snapshot = self.sampler.sample()?;
        let violations = self.limits.violations(&snapshot);
        debug!(%snapshot, "Resource sample");

        if violations.is_empty() {
            Ok(snapshot)
        } else {
            Err(ProvisionError::ResourceExhaustion(violations.join(", ")))
        }
    }
}
