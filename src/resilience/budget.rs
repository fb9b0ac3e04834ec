//! Concurrency budget for per-domain work

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::MAX_CONCURRENCY;
use crate::error::{ProvisionError, Result};

/// Default number of domains processed at once
pub const DEFAULT_BUDGET: usize = 7;

/// Caps how many domains are in flight (7 ± 2)
#[derive(Debug, Clone)]
pub struct CognitiveBudget {
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl CognitiveBudget {
    pub fn new(limit: usize) -> Result<Self> {
        if !(1..=MAX_CONCURRENCY).contains(&limit) {
            return Err(ProvisionError::Config(format!(
                "concurrency budget must be between 1 and {}, got {}",
                MAX_CONCURRENCY, limit
            )));
        }
        Ok(Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a slot; the slot is released when the permit drops
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProvisionError::Config("concurrency budget closed".to_string()))
    }
}

impl Default for CognitiveBudget {
    fn default() -> Self {
        Self {
            limit: DEFAULT_BUDGET,
            semaphore: Arc::new(Semaphore::new(DEFAULT_BUDGET)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_range() {
        assert!(CognitiveBudget::new(0).is_err());
        assert!(CognitiveBudget::new(1).is_ok());
        assert!(CognitiveBudget::new(9).is_ok());
        assert!(CognitiveBudget::new(10).is_err());
        assert_eq!(CognitiveBudget::default().limit(), 7);
    }

    #[tokio::test]
    async fn test_caps_concurrent_work() {
        let budget = CognitiveBudget::new(2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let budget = budget.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _permit = budget.acquire().await.unwrap();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(budget.available(), 2);
    }
}
