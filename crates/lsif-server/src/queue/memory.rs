use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use super::{QueueBackend, QueuedJob};
use crate::Result;

#[derive(Debug)]
struct StoredJob {
    queue: String,
    payload: String,
    worker: Option<String>,
}

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    jobs: BTreeMap<i64, StoredJob>,
    workers: HashMap<String, DateTime<Utc>>,
    leases: HashMap<String, Lease>,
}

/// Process-local queue backend for tests and single-node development.
///
/// Nothing survives a restart and nothing is shared between processes.
#[derive(Debug, Default)]
pub struct MemoryQueueBackend {
    state: Mutex<State>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn push(&self, queue: &str, payload: &str, _now: DateTime<Utc>) -> Result<i64> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.insert(
            id,
            StoredJob { queue: queue.to_string(), payload: payload.to_string(), worker: None },
        );
        Ok(id)
    }

    async fn pop(&self, queue: &str, worker: &str, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        let mut state = self.lock();
        state.workers.insert(worker.to_string(), now);

        let claimed = state
            .jobs
            .iter_mut()
            .find(|(_, job)| job.queue == queue && job.worker.is_none())
            .map(|(id, job)| {
                job.worker = Some(worker.to_string());
                QueuedJob { id: *id, queue: job.queue.clone(), payload: job.payload.clone() }
            });
        Ok(claimed)
    }

    async fn heartbeat(&self, worker: &str, now: DateTime<Utc>) -> Result<()> {
        self.lock().workers.insert(worker.to_string(), now);
        Ok(())
    }

    async fn complete(&self, job_id: i64) -> Result<()> {
        self.lock().jobs.remove(&job_id);
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let mut state = self.lock();
        let available = state
            .leases
            .get(name)
            .is_none_or(|lease| lease.holder == holder || lease.expires_at <= now);
        if available {
            let expires_at = TimeDelta::from_std(ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            state
                .leases
                .insert(name.to_string(), Lease { holder: holder.to_string(), expires_at });
        }
        Ok(available)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let mut state = self.lock();
        if state.leases.get(name).is_some_and(|lease| lease.holder == holder) {
            state.leases.remove(name);
        }
        Ok(())
    }

    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut workers: Vec<String> = self
            .lock()
            .workers
            .iter()
            .filter(|(_, last_seen)| **last_seen < cutoff)
            .map(|(worker, _)| worker.clone())
            .collect();
        workers.sort();
        Ok(workers)
    }

    async fn requeue_worker(&self, worker: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut state = self.lock();
        if !state.workers.get(worker).is_some_and(|last_seen| *last_seen < cutoff) {
            return Ok(0);
        }
        state.workers.remove(worker);

        let mut requeued = 0;
        for job in state.jobs.values_mut() {
            if job.worker.as_deref() == Some(worker) {
                job.worker = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn pending(&self, queue: &str) -> Result<usize> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.worker.is_none())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::tests::backend_contract;

    #[tokio::test]
    async fn test_memory_backend_contract() {
        backend_contract(&MemoryQueueBackend::new()).await;
    }
}
