//! Error taxonomy shared by the pool, the runner and the schedulers.
//!
//! Per-job failures ([`JobError`]) are recorded on the job and seed that
//! produced them and never propagate past the owning scheduler. Only
//! [`PoolError`] and [`RunError`] abort a phase.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a training or attack backend for a single call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Resource contention, flaky external call. Safe to retry.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Malformed configuration, incompatible checkpoint. Never retried.
    #[error("permanent backend error: {0}")]
    Permanent(String),
}

/// Terminal failure of one job, after the retry policy has been applied.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobError {
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("job exceeded its {0:?} budget")]
    Timeout(#[serde(with = "duration_ms")] Duration),

    #[error("permanent backend error: {0}")]
    Permanent(String),

    /// The job panicked; the pool caught it at the task boundary.
    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Transient(_) | JobError::Timeout(_))
    }
}

impl From<BackendError> for JobError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transient(msg) => JobError::Transient(msg),
            BackendError::Permanent(msg) => JobError::Permanent(msg),
        }
    }
}

/// Submission-level failures of the worker pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool '{pool}' overloaded: {waiting} jobs already waiting (limit {queue_limit})")]
    Overloaded {
        pool: String,
        waiting: usize,
        queue_limit: usize,
    },

    #[error("worker pool '{0}' is shut down")]
    ShutDown(String),
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Population(#[from] crate::population::TableError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(JobError::Transient("busy".into()).is_retryable());
        assert!(JobError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!JobError::Permanent("bad config".into()).is_retryable());
        assert!(!JobError::Cancelled.is_retryable());
        assert!(!JobError::Panicked("boom".into()).is_retryable());
    }

    #[test]
    fn test_backend_error_maps_onto_job_error() {
        let job: JobError = BackendError::Permanent("incompatible checkpoint".into()).into();
        assert_eq!(job, JobError::Permanent("incompatible checkpoint".into()));
    }

    #[test]
    fn test_job_error_serializes_with_kind_tag() {
        let value = serde_json::to_value(JobError::Timeout(Duration::from_millis(1500))).unwrap();
        assert_eq!(value["kind"], "timeout");
        assert_eq!(value["detail"], 1500);
    }
}
