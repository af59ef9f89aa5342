//! Durable conversion job queue
//!
//! The HTTP layer produces [`ConversionJob`]s; conversion workers consume
//! them. Jobs live in a [`QueueBackend`] shared by every server process so
//! they survive a crash of the process that enqueued them.

mod memory;
mod scheduler;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lsif_domain::ConversionJob;
use metrics::counter;
use tracing::{info, warn};

pub use memory::MemoryQueueBackend;
pub use scheduler::{Role, Scheduler};
pub use sqlite::SqliteQueueBackend;

use crate::{LsifError, Result};

/// A job claimed from or stored in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: i64,
    pub queue: String,
    pub payload: String,
}

/// Storage contract shared by every queue implementation.
///
/// A job is pending until a worker pops it, then in flight until the worker
/// completes it. Jobs of a worker that stops heartbeating are moved back to
/// pending by [`QueueBackend::requeue_worker`]. Leases give one holder at a
/// time exclusive ownership of a name until they expire.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Appends a pending job and returns its id.
    async fn push(&self, queue: &str, payload: &str, now: DateTime<Utc>) -> Result<i64>;

    /// Claims the oldest pending job of `queue` for `worker`. Also counts as
    /// a heartbeat of `worker`.
    async fn pop(&self, queue: &str, worker: &str, now: DateTime<Utc>) -> Result<Option<QueuedJob>>;

    async fn heartbeat(&self, worker: &str, now: DateTime<Utc>) -> Result<()>;

    /// Removes a finished job.
    async fn complete(&self, job_id: i64) -> Result<()>;

    /// Acquires or renews the lease `name` for `holder` until `now + ttl`.
    /// Fails only if another holder has an unexpired lease.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool>;

    /// Drops the lease if `holder` still owns it.
    async fn release_lease(&self, name: &str, holder: &str) -> Result<()>;

    /// Workers whose last heartbeat is older than `cutoff`.
    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    /// Forgets `worker` and moves its in-flight jobs back to pending, unless
    /// it heartbeated after `cutoff`. Returns the number of requeued jobs.
    async fn requeue_worker(&self, worker: &str, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Number of jobs waiting to be claimed.
    async fn pending(&self, queue: &str) -> Result<usize>;
}

/// Opens the backend named by `url`: `sqlite://<path>` or `memory://`.
///
/// The SQLite backend is the durable one. Servers coordinate through it only
/// when they reach the same database file, e.g. on a shared volume. A
/// networked store would be another [`QueueBackend`] behind a new scheme.
pub async fn connect(url: &str) -> Result<Arc<dyn QueueBackend>> {
    if url.starts_with("memory:") {
        info!("Using in-memory queue backend");
        return Ok(Arc::new(MemoryQueueBackend::new()));
    }
    if url.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteQueueBackend::connect(url).await?));
    }
    Err(LsifError::configuration_error(format!(
        "queue_url: unsupported scheme in {url}, expected sqlite:// or memory://"
    )))
}

pub(crate) fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// A job claimed by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: i64,
    pub job: ConversionJob,
}

/// Typed view of the conversion queue within a namespace.
#[derive(Clone)]
pub struct ConversionQueue {
    backend: Arc<dyn QueueBackend>,
    namespace: String,
}

impl ConversionQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, namespace: impl Into<String>) -> Self {
        Self { backend, namespace: namespace.into() }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn queue_name(&self) -> String {
        format!("{}:convert", self.namespace)
    }

    pub fn lease_name(&self) -> String {
        format!("{}:scheduler", self.namespace)
    }

    pub async fn enqueue(&self, job: &ConversionJob) -> Result<i64> {
        let payload = serde_json::to_string(job)
            .map_err(|e| LsifError::internal_error(format!("cannot encode conversion job: {e}")))?;
        let id = self.backend.push(&self.queue_name(), &payload, Utc::now()).await?;

        counter!("lsif_jobs_enqueued_total").increment(1);
        info!(job_id = id, repository = %job.repository, commit = %job.commit, "Enqueued conversion job");
        Ok(id)
    }

    /// Claims the next job for `worker`. Jobs whose payload cannot be
    /// decoded are dropped.
    pub async fn dequeue(&self, worker: &str) -> Result<Option<ClaimedJob>> {
        loop {
            let Some(queued) = self.backend.pop(&self.queue_name(), worker, Utc::now()).await? else {
                return Ok(None);
            };

            match serde_json::from_str(&queued.payload) {
                Ok(job) => return Ok(Some(ClaimedJob { id: queued.id, job })),
                Err(e) => {
                    warn!(job_id = queued.id, error = %e, "Dropping undecodable conversion job");
                    self.backend.complete(queued.id).await?;
                }
            }
        }
    }

    pub async fn heartbeat(&self, worker: &str) -> Result<()> {
        self.backend.heartbeat(worker, Utc::now()).await
    }

    pub async fn complete(&self, job_id: i64) -> Result<()> {
        self.backend.complete(job_id).await
    }

    pub async fn pending(&self) -> Result<usize> {
        self.backend.pending(&self.queue_name()).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeDelta;
    use lsif_domain::RepositoryCommit;
    use pretty_assertions::assert_eq;

    use super::*;

    pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + TimeDelta::seconds(1_700_000_000 + seconds)
    }

    /// Contract every backend implementation must satisfy.
    pub(crate) async fn backend_contract(backend: &dyn QueueBackend) {
        let first = backend.push("q", "one", at(0)).await.unwrap();
        let second = backend.push("q", "two", at(1)).await.unwrap();
        backend.push("other", "x", at(1)).await.unwrap();
        assert!(second > first);
        assert_eq!(backend.pending("q").await.unwrap(), 2);

        // FIFO claims
        let claimed = backend.pop("q", "w1", at(2)).await.unwrap().unwrap();
        assert_eq!(claimed, QueuedJob { id: first, queue: "q".to_string(), payload: "one".to_string() });
        assert_eq!(backend.pending("q").await.unwrap(), 1);

        // A silent worker loses its job
        assert_eq!(backend.stale_workers(at(10)).await.unwrap(), vec!["w1".to_string()]);
        assert_eq!(backend.requeue_worker("w1", at(10)).await.unwrap(), 1);
        assert_eq!(backend.pending("q").await.unwrap(), 2);
        assert!(backend.stale_workers(at(10)).await.unwrap().is_empty());

        // A worker that heartbeated after the cutoff keeps its job
        let claimed = backend.pop("q", "w2", at(20)).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        backend.heartbeat("w2", at(30)).await.unwrap();
        assert_eq!(backend.requeue_worker("w2", at(25)).await.unwrap(), 0);
        assert_eq!(backend.pending("q").await.unwrap(), 1);

        backend.complete(first).await.unwrap();
        let claimed = backend.pop("q", "w2", at(31)).await.unwrap().unwrap();
        assert_eq!(claimed.payload, "two");
        assert_eq!(backend.pop("q", "w2", at(31)).await.unwrap(), None);

        // Leases
        let ttl = Duration::from_secs(60);
        assert!(backend.try_acquire_lease("lock", "a", at(0), ttl).await.unwrap());
        assert!(!backend.try_acquire_lease("lock", "b", at(30), ttl).await.unwrap());
        assert!(backend.try_acquire_lease("lock", "a", at(50), ttl).await.unwrap());
        assert!(!backend.try_acquire_lease("lock", "b", at(100), ttl).await.unwrap());
        assert!(backend.try_acquire_lease("lock", "b", at(111), ttl).await.unwrap());
        backend.release_lease("lock", "a").await.unwrap();
        assert!(!backend.try_acquire_lease("lock", "a", at(112), ttl).await.unwrap());
        backend.release_lease("lock", "b").await.unwrap();
        assert!(backend.try_acquire_lease("lock", "a", at(113), ttl).await.unwrap());
    }

    fn job() -> ConversionJob {
        let key = RepositoryCommit::new("github.com/acme/widget", "a".repeat(40)).unwrap();
        ConversionJob::new(&key, "/storage/uploads/widget.lsif.gz")
    }

    #[tokio::test]
    async fn test_conversion_queue_round_trip() {
        let fixture = ConversionQueue::new(Arc::new(MemoryQueueBackend::new()), "lsif");

        let id = fixture.enqueue(&job()).await.unwrap();
        let actual = fixture.dequeue("worker-1").await.unwrap();

        assert_eq!(actual, Some(ClaimedJob { id, job: job() }));
        assert_eq!(fixture.pending().await.unwrap(), 0);
        fixture.complete(id).await.unwrap();
        assert_eq!(fixture.dequeue("worker-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dequeue_drops_undecodable_jobs() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let fixture = ConversionQueue::new(backend.clone(), "lsif");
        backend.push(&fixture.queue_name(), "not json", Utc::now()).await.unwrap();
        let id = fixture.enqueue(&job()).await.unwrap();

        let actual = fixture.dequeue("worker-1").await.unwrap().map(|claimed| claimed.id);

        assert_eq!(actual, Some(id));
        assert_eq!(fixture.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::new());
        let a = ConversionQueue::new(backend.clone(), "a");
        let b = ConversionQueue::new(backend, "b");

        a.enqueue(&job()).await.unwrap();

        assert_eq!(a.pending().await.unwrap(), 1);
        assert_eq!(b.pending().await.unwrap(), 0);
        assert_eq!(a.lease_name(), "a:scheduler");
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let actual = connect("redis://localhost:6379").await.err().unwrap();

        assert_eq!(actual.error_code(), "CONFIGURATION_ERROR");
    }
}
