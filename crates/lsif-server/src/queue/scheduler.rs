//! Lease-elected scheduler that requeues jobs of dead workers
//!
//! Every server process runs a [`Scheduler`]. On each tick it tries to
//! acquire or renew the namespace's scheduler lease; only the holder scans
//! for stale workers. A crashed leader simply stops renewing and another
//! process takes over once the lease expires.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use metrics::{counter, gauge};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ConversionQueue;
use crate::Result;

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader { requeued: usize },
    Follower,
}

pub struct Scheduler {
    queue: ConversionQueue,
    holder: String,
    poll_interval: Duration,
    lease_ttl: Duration,
    stale_after: Duration,
}

impl Scheduler {
    pub fn new(
        queue: ConversionQueue,
        poll_interval: Duration,
        lease_ttl: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            queue,
            holder: format!("scheduler-{}", Uuid::new_v4()),
            poll_interval,
            lease_ttl,
            stale_after,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Acquires or renews the lease and, if held, requeues the jobs of
    /// workers silent since before `now - stale_after`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Role> {
        let backend = self.queue.backend();
        let lease = self.queue.lease_name();

        if !backend.try_acquire_lease(&lease, &self.holder, now, self.lease_ttl).await? {
            gauge!("lsif_scheduler_leader").set(0.0);
            return Ok(Role::Follower);
        }
        gauge!("lsif_scheduler_leader").set(1.0);

        let cutoff = TimeDelta::from_std(self.stale_after)
            .ok()
            .and_then(|stale_after| now.checked_sub_signed(stale_after))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut requeued = 0;
        for worker in backend.stale_workers(cutoff).await? {
            let count = backend.requeue_worker(&worker, cutoff).await?;
            if count > 0 {
                warn!(worker = %worker, jobs = count, "Requeued jobs of unresponsive worker");
            }
            requeued += count;
        }

        counter!("lsif_scheduler_requeued_jobs_total").increment(requeued as u64);
        Ok(Role::Leader { requeued })
    }

    /// Ticks every poll interval until `shutdown` is cancelled, then
    /// releases the lease.
    ///
    /// Returns an error, without releasing, if the queue backend fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut leading = false;

        info!(holder = %self.holder, "Scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick(Utc::now()).await {
                Ok(Role::Leader { requeued }) => {
                    if !leading {
                        info!(holder = %self.holder, "Acquired scheduler lease");
                    }
                    leading = true;
                    debug!(requeued, "Scheduler tick");
                }
                Ok(Role::Follower) => {
                    if leading {
                        warn!(holder = %self.holder, "Lost scheduler lease");
                    }
                    leading = false;
                }
                Err(e) => {
                    error!(holder = %self.holder, error = %e, "Scheduler tick failed");
                    return Err(e);
                }
            }
        }

        if leading {
            self.queue.backend().release_lease(&self.queue.lease_name(), &self.holder).await?;
            info!(holder = %self.holder, "Released scheduler lease");
        }
        Ok(())
    }
}
