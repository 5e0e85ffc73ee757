//! Job types for the worker pool.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Boxed error returned by job handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Lifecycle status of a job.
///
/// `Completed` and `Failed` are terminal; a job never leaves a terminal
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is waiting in the queue
    Pending,
    /// Job is currently being processed
    Running,
    /// Job completed successfully
    Completed,
    /// Job failed; see the handle's error for the cause
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of deferred work.
///
/// The payload is opaque bytes the registered handler knows how to decode;
/// [`Job::decode`] deserializes a JSON payload into a declared type so payload
/// misuse surfaces as a deserialization error instead of a cast gone wrong.
#[derive(Debug, Clone)]
pub struct Job {
    id: String,
    job_type: String,
    payload: Vec<u8>,
    created_at: SystemTime,
}

impl Job {
    /// Create a job with a caller-chosen identifier, a type tag that routes to
    /// a registered handler, and an opaque payload.
    pub fn new(
        id: impl Into<String>,
        job_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            payload: payload.into(),
            created_at: SystemTime::now(),
        }
    }

    /// Create a job whose payload is the JSON encoding of `payload`.
    pub fn with_json<T: Serialize>(
        id: impl Into<String>,
        job_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(id, job_type, serde_json::to_vec(payload)?))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Decode the payload as JSON into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Why a job reached `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("no handler registered for job type `{job_type}`")]
    NoHandler { job_type: String },

    #[error("handler failed: {0}")]
    HandlerFailed(#[source] BoxError),

    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("handler exceeded its execution deadline of {deadline:?}")]
    DeadlineExceeded { deadline: Duration },

    #[error("job cancelled by pool shutdown")]
    Cancelled,
}

/// The work behind a job type.
///
/// Handlers are registered before the pool starts and may be invoked from any
/// executor; they must not share mutable state implicitly. The cancellation
/// token fires when the handler's execution deadline elapses or the pool shuts
/// down. Handlers that observe it can wind down early, handlers that ignore
/// it simply run to completion.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> Result<(), BoxError>;
}

/// Observer side of a submitted job.
///
/// Each successful submission yields exactly one handle, and the job behind it
/// makes exactly one transition to a terminal status (unless it is discarded
/// by `stop` while still queued, in which case the handle keeps reporting
/// `Pending` after the pool is gone).
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub(crate) id: String,
    pub(crate) status: watch::Receiver<JobStatus>,
    pub(crate) error: Arc<OnceLock<JobError>>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status of the job.
    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// The terminal error, if the job failed.
    pub fn error(&self) -> Option<&JobError> {
        self.error.get()
    }

    /// Wait until the job reaches a terminal status and return it.
    ///
    /// Returns the last observed status if the job was discarded by pool
    /// shutdown before running.
    pub async fn wait(&mut self) -> JobStatus {
        loop {
            let current = *self.status.borrow();
            if current.is_terminal() {
                return current;
            }
            if self.status.changed().await.is_err() {
                // Pool dropped the job without running it.
                return *self.status.borrow();
            }
        }
    }
}
