use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::model::ResourceId;

/// In-process, per-resource admission in front of the distributed lock.
///
/// Callers on the same instance queue on a local semaphore instead of all
/// polling the lock service for the same key.
#[derive(Debug)]
pub struct LocalAdmission {
    permits_per_resource: usize,
    semaphores: DashMap<ResourceId, Arc<Semaphore>>,
}

impl LocalAdmission {
    pub fn new(permits_per_resource: usize) -> Self {
        Self {
            permits_per_resource: permits_per_resource.max(1),
            semaphores: DashMap::new(),
        }
    }

    fn semaphore(&self, resource_id: &ResourceId) -> Arc<Semaphore> {
        self.semaphores
            .entry(resource_id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.permits_per_resource)))
            .clone()
    }

    /// Wait up to `wait` for a permit. `None` means the budget ran out.
    pub async fn acquire(&self, resource_id: &ResourceId, wait: Duration) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.semaphore(resource_id);
        match tokio::time::timeout(wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Some(permit),
            // Closed semaphores are never created here; treat like a timeout.
            Ok(Err(_)) | Err(_) => {
                metrics::counter!(crate::observability::ADMISSION_REJECTED_TOTAL).increment(1);
                None
            }
        }
    }

    /// Drop semaphores that no caller holds or waits on.
    pub fn prune_idle(&self) -> usize {
        let before = self.semaphores.len();
        self.semaphores.retain(|_, s| {
            Arc::strong_count(s) > 1 || s.available_permits() < self.permits_per_resource
        });
        before - self.semaphores.len()
    }

    pub fn active_count(&self) -> usize {
        self.semaphores.len()
    }
}
