//! Bounded worker pool for deferred background work.
//!
//! A fixed set of executors drains a bounded queue; jobs are dispatched to
//! per-type handlers registered before the pool starts. Submission is
//! non-blocking; the bounded queue is the sole backpressure mechanism, and a
//! full queue fails fast with [`SubmitError::QueueFull`]. Callers that need to
//! wait put a [`crate::TokenBucket`] in front of `submit`.
//!
//! Lifecycle is one-way: Unstarted → Running → Stopped. `stop` waits for
//! in-flight handlers to finish (never aborts them) and discards jobs still
//! sitting in the queue.

mod job;

pub use job::{BoxError, Job, JobError, JobHandle, JobHandler, JobStatus};

use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATE_UNSTARTED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Default number of executors.
pub const DEFAULT_WORKER_COUNT: usize = 5;
/// Default queue capacity.
pub const DEFAULT_QUEUE_SIZE: usize = 100;
/// Default per-job execution deadline.
pub const DEFAULT_HANDLER_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of executors draining the queue.
    pub worker_count: usize,
    /// Capacity of the bounded job queue.
    pub queue_size: usize,
    /// Execution deadline applied to every handler invocation.
    pub handler_deadline: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_size: DEFAULT_QUEUE_SIZE,
            handler_deadline: DEFAULT_HANDLER_DEADLINE,
        }
    }
}

/// Rejected pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPoolConfig {
    #[error("worker_count must be >= 1")]
    ZeroWorkers,
    #[error("queue_size must be >= 1")]
    ZeroQueue,
    #[error("handler_deadline must be > 0")]
    ZeroDeadline,
}

/// Returned by `start` when the pool has already been stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("worker pool has been stopped and cannot be restarted")]
pub struct PoolStopped;

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The bounded queue is full; backpressure hint.
    #[error("job queue is full")]
    QueueFull,
    /// The pool is unstarted or stopped.
    #[error("worker pool is not running")]
    NotRunning,
}

struct QueuedJob {
    job: Job,
    status_tx: watch::Sender<JobStatus>,
    error: Arc<OnceLock<JobError>>,
}

type HandlerMap = HashMap<String, Arc<dyn JobHandler>>;

/// Fixed-size worker pool over a bounded job queue.
pub struct WorkerPool {
    config: PoolConfig,
    handlers: HandlerMap,
    state: AtomicU8,
    queue_tx: mpsc::Sender<QueuedJob>,
    queue_rx: Mutex<Option<mpsc::Receiver<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .field("running", &self.is_running())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self, InvalidPoolConfig> {
        if config.worker_count == 0 {
            return Err(InvalidPoolConfig::ZeroWorkers);
        }
        if config.queue_size == 0 {
            return Err(InvalidPoolConfig::ZeroQueue);
        }
        if config.handler_deadline.is_zero() {
            return Err(InvalidPoolConfig::ZeroDeadline);
        }

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size);
        Ok(Self {
            config,
            handlers: HashMap::new(),
            state: AtomicU8::new(STATE_UNSTARTED),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            workers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Register the handler for a job type. Registering the same type twice
    /// overwrites silently.
    ///
    /// Registration takes `&mut self`, so the handler table is frozen once the
    /// pool is shared and started; there is no late-registration race to
    /// guard against.
    pub fn register_handler<H>(&mut self, job_type: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(job_type.into(), Arc::new(handler));
    }

    /// Launch the executors. A second call while running is a no-op; calling
    /// after `stop` is rejected.
    pub fn start(&self) -> Result<(), PoolStopped> {
        match self.state.compare_exchange(
            STATE_UNSTARTED,
            STATE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_RUNNING) => return Ok(()),
            Err(_) => return Err(PoolStopped),
        }

        let receiver = self
            .queue_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .expect("queue receiver is present until the first start");
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let handlers = Arc::new(self.handlers.clone());

        let mut workers = self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for worker_id in 0..self.config.worker_count {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&receiver),
                Arc::clone(&handlers),
                self.shutdown.clone(),
                self.config.handler_deadline,
            )));
        }

        info!(
            worker_count = self.config.worker_count,
            queue_size = self.config.queue_size,
            "worker pool started"
        );
        Ok(())
    }

    /// Non-blocking enqueue. On success the returned [`JobHandle`] observes
    /// the job's status transitions and terminal error.
    pub fn submit(&self, job: Job) -> Result<JobHandle, SubmitError> {
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Err(SubmitError::NotRunning);
        }

        let (status_tx, status_rx) = watch::channel(JobStatus::Pending);
        let error = Arc::new(OnceLock::new());
        let handle =
            JobHandle { id: job.id().to_string(), status: status_rx, error: Arc::clone(&error) };

        let queued = QueuedJob { job, status_tx, error };
        match self.queue_tx.try_send(queued) {
            Ok(()) => {
                debug!(job_id = %handle.id(), "job enqueued");
                Ok(handle)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(SubmitError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::NotRunning),
        }
    }

    /// Signal the executors to stop and wait for in-flight jobs to finish.
    ///
    /// In-flight handlers are never aborted; their job tokens are cancelled
    /// and `stop` blocks until they return. Jobs still queued are discarded.
    /// A no-op unless the pool is running.
    pub async fn stop(&self) {
        if self
            .state
            .compare_exchange(STATE_RUNNING, STATE_STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        info!("worker pool stopping");
        self.shutdown.cancel();

        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            // Workers never panic; dispatch catches handler panics.
            let _ = worker.await;
        }

        info!("worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedJob>>>,
    handlers: Arc<HandlerMap>,
    shutdown: CancellationToken,
    handler_deadline: Duration,
) {
    info!(worker_id, "worker started");

    loop {
        // Hold the receiver lock only while waiting for the next job; prefer
        // the stop signal so queued jobs are discarded at shutdown.
        let queued = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                next = receiver.recv() => next,
            }
        };

        let Some(queued) = queued else { break };
        run_job(worker_id, queued, &handlers, &shutdown, handler_deadline).await;
    }

    info!(worker_id, "worker stopped");
}

async fn run_job(
    worker_id: usize,
    queued: QueuedJob,
    handlers: &HandlerMap,
    shutdown: &CancellationToken,
    handler_deadline: Duration,
) {
    let QueuedJob { job, status_tx, error } = queued;

    let _ = status_tx.send(JobStatus::Running);
    info!(worker_id, job_id = %job.id(), job_type = %job.job_type(), "job started");

    let Some(handler) = handlers.get(job.job_type()).cloned() else {
        warn!(worker_id, job_id = %job.id(), job_type = %job.job_type(), "no handler for job type");
        let _ = error.set(JobError::NoHandler { job_type: job.job_type().to_string() });
        let _ = status_tx.send(JobStatus::Failed);
        return;
    };

    // The job token is a child of the shutdown token: pool shutdown and the
    // execution deadline both cancel it, and a cooperative handler winds down.
    let cancel = job_token(shutdown);
    let deadline_token = cancel.clone();
    let deadline_timer = tokio::spawn(async move {
        tokio::time::sleep(handler_deadline).await;
        deadline_token.cancel();
    });

    let outcome = AssertUnwindSafe(handler.handle(&job, cancel)).catch_unwind().await;
    let deadline_fired = deadline_timer.is_finished();
    deadline_timer.abort();

    match outcome {
        Ok(Ok(())) => {
            info!(worker_id, job_id = %job.id(), "job completed");
            let _ = status_tx.send(JobStatus::Completed);
        }
        Ok(Err(cause)) => {
            let job_error = if deadline_fired {
                JobError::DeadlineExceeded { deadline: handler_deadline }
            } else if shutdown.is_cancelled() {
                JobError::Cancelled
            } else {
                JobError::HandlerFailed(cause)
            };
            warn!(worker_id, job_id = %job.id(), %job_error, "job failed");
            let _ = error.set(job_error);
            let _ = status_tx.send(JobStatus::Failed);
        }
        Err(panic) => {
            let message = panic_message(panic);
            warn!(worker_id, job_id = %job.id(), panic = %message, "handler panicked");
            let _ = error.set(JobError::HandlerPanicked(message));
            let _ = status_tx.send(JobStatus::Failed);
        }
    }
}

fn job_token(shutdown: &CancellationToken) -> CancellationToken {
    shutdown.child_token()
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _job: &Job, _cancel: CancellationToken) -> Result<(), BoxError> {
            Ok(())
        }
    }

    struct Counting {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn handle(&self, _job: &Job, _cancel: CancellationToken) -> Result<(), BoxError> {
            self.count.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl JobHandler for AlwaysFails {
        async fn handle(&self, _job: &Job, _cancel: CancellationToken) -> Result<(), BoxError> {
            Err("database unavailable".into())
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn handle(&self, _job: &Job, _cancel: CancellationToken) -> Result<(), BoxError> {
            panic!("handler bug");
        }
    }

    struct SleepThenOk {
        duration: Duration,
    }

    #[async_trait]
    impl JobHandler for SleepThenOk {
        async fn handle(&self, _job: &Job, _cancel: CancellationToken) -> Result<(), BoxError> {
            tokio::time::sleep(self.duration).await;
            Ok(())
        }
    }

    struct Cooperative;

    #[async_trait]
    impl JobHandler for Cooperative {
        async fn handle(&self, _job: &Job, cancel: CancellationToken) -> Result<(), BoxError> {
            tokio::select! {
                _ = cancel.cancelled() => Err("cancelled mid-flight".into()),
                _ = tokio::time::sleep(Duration::from_secs(600)) => Ok(()),
            }
        }
    }

    fn pool_with(config: PoolConfig) -> WorkerPool {
        WorkerPool::new(config).expect("valid test config")
    }

    fn small_config() -> PoolConfig {
        PoolConfig { worker_count: 2, queue_size: 10, handler_deadline: Duration::from_secs(5) }
    }

    #[test]
    fn config_validation() {
        assert_eq!(
            WorkerPool::new(PoolConfig { worker_count: 0, ..Default::default() }).err(),
            Some(InvalidPoolConfig::ZeroWorkers)
        );
        assert_eq!(
            WorkerPool::new(PoolConfig { queue_size: 0, ..Default::default() }).err(),
            Some(InvalidPoolConfig::ZeroQueue)
        );
        assert_eq!(
            WorkerPool::new(PoolConfig {
                handler_deadline: Duration::ZERO,
                ..Default::default()
            })
            .err(),
            Some(InvalidPoolConfig::ZeroDeadline)
        );
        assert!(WorkerPool::new(PoolConfig::default()).is_ok());
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = PoolConfig::default();
        assert_eq!(config.worker_count, 5);
        assert_eq!(config.queue_size, 100);
        assert_eq!(config.handler_deadline, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn submit_before_start_is_rejected() {
        let mut pool = pool_with(small_config());
        pool.register_handler("noop", Noop);

        let err = pool.submit(Job::new("j1", "noop", Vec::new())).unwrap_err();
        assert_eq!(err, SubmitError::NotRunning);
    }

    #[tokio::test]
    async fn job_runs_to_completion() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut pool = pool_with(small_config());
        pool.register_handler("count", Counting { count: Arc::clone(&count) });
        pool.start().unwrap();

        let mut handle = pool.submit(Job::new("j1", "count", Vec::new())).unwrap();
        assert_eq!(handle.wait().await, JobStatus::Completed);
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
        assert!(handle.error().is_none());

        pool.stop().await;
    }

    #[tokio::test]
    async fn start_twice_is_a_noop() {
        let mut pool = pool_with(small_config());
        pool.register_handler("noop", Noop);
        pool.start().unwrap();
        pool.start().unwrap();
        assert!(pool.is_running());
        pool.stop().await;
    }

    #[tokio::test]
    async fn start_after_stop_is_rejected() {
        let pool = pool_with(small_config());
        pool.start().unwrap();
        pool.stop().await;
        assert_eq!(pool.start(), Err(PoolStopped));
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_noop_when_unstarted() {
        let pool = pool_with(small_config());
        pool.stop().await; // Unstarted: no-op
        pool.start().unwrap();
        pool.stop().await;
        pool.stop().await; // Second stop: no-op
    }

    #[tokio::test]
    async fn submit_after_stop_is_rejected() {
        let mut pool = pool_with(small_config());
        pool.register_handler("noop", Noop);
        pool.start().unwrap();
        pool.stop().await;

        let err = pool.submit(Job::new("j1", "noop", Vec::new())).unwrap_err();
        assert_eq!(err, SubmitError::NotRunning);
    }

    #[tokio::test]
    async fn unknown_job_type_fails_without_a_handler() {
        let mut pool = pool_with(small_config());
        pool.register_handler("known", Noop);
        pool.start().unwrap();

        let mut handle = pool.submit(Job::new("j1", "unknown", Vec::new())).unwrap();
        assert_eq!(handle.wait().await, JobStatus::Failed);
        assert!(matches!(handle.error(), Some(JobError::NoHandler { job_type }) if job_type.as_str() == "unknown"));

        pool.stop().await;
    }

    #[tokio::test]
    async fn handler_error_marks_job_failed() {
        let mut pool = pool_with(small_config());
        pool.register_handler("flaky", AlwaysFails);
        pool.start().unwrap();

        let mut handle = pool.submit(Job::new("j1", "flaky", Vec::new())).unwrap();
        assert_eq!(handle.wait().await, JobStatus::Failed);
        match handle.error() {
            Some(JobError::HandlerFailed(cause)) => {
                assert!(cause.to_string().contains("database unavailable"))
            }
            other => panic!("expected HandlerFailed, got {:?}", other),
        }

        pool.stop().await;
    }

    #[tokio::test]
    async fn handler_panic_is_contained_and_worker_survives() {
        let mut config = small_config();
        config.worker_count = 1;
        let mut pool = pool_with(config);
        pool.register_handler("bad", Panics);
        pool.register_handler("good", Noop);
        pool.start().unwrap();

        let mut bad = pool.submit(Job::new("j1", "bad", Vec::new())).unwrap();
        assert_eq!(bad.wait().await, JobStatus::Failed);
        assert!(matches!(bad.error(), Some(JobError::HandlerPanicked(msg)) if msg.contains("handler bug")));

        // The single worker survived the panic and still drains the queue.
        let mut good = pool.submit(Job::new("j2", "good", Vec::new())).unwrap();
        assert_eq!(good.wait().await, JobStatus::Completed);

        pool.stop().await;
    }

    #[tokio::test]
    async fn registering_twice_overwrites() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut pool = pool_with(small_config());
        pool.register_handler("job", AlwaysFails);
        pool.register_handler("job", Counting { count: Arc::clone(&count) });
        pool.start().unwrap();

        let mut handle = pool.submit(Job::new("j1", "job", Vec::new())).unwrap();
        assert_eq!(handle.wait().await, JobStatus::Completed);
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);

        pool.stop().await;
    }

    #[tokio::test]
    async fn cooperative_handler_hits_the_execution_deadline() {
        let mut config = small_config();
        config.handler_deadline = Duration::from_millis(50);
        let mut pool = pool_with(config);
        pool.register_handler("slow", Cooperative);
        pool.start().unwrap();

        let mut handle = pool.submit(Job::new("j1", "slow", Vec::new())).unwrap();
        assert_eq!(handle.wait().await, JobStatus::Failed);
        assert!(matches!(handle.error(), Some(JobError::DeadlineExceeded { .. })));

        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_job() {
        let mut pool = pool_with(small_config());
        pool.register_handler("sleep", SleepThenOk { duration: Duration::from_millis(200) });
        pool.start().unwrap();

        let mut handle = pool.submit(Job::new("j1", "sleep", Vec::new())).unwrap();
        // Let the worker pick the job up before stopping.
        while handle.status() == JobStatus::Pending {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let start = std::time::Instant::now();
        pool.stop().await;
        assert!(
            start.elapsed() >= Duration::from_millis(150),
            "stop must wait for the in-flight handler"
        );
        assert_eq!(handle.wait().await, JobStatus::Completed);
    }
}
