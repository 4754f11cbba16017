//! Units of scheduled work and their outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{AttackResult, TrainResult};
use crate::error::JobError;
use crate::population::{SeedId, SeedSnapshot};
use crate::settings::AttackLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Training,
    Attack,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Training => f.write_str("training"),
            JobKind::Attack => f.write_str("attack"),
        }
    }
}

/// What a job asks the backend to do.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobSpec {
    Training,
    Attack { level: AttackLevel, repetition: u32 },
}

/// A unit of work against one seed snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub spec: JobSpec,
    pub seed: SeedSnapshot,
    /// Attempts started so far; 0 until the runner picks the job up.
    pub attempt: u32,
}

impl Job {
    pub fn training(seed: SeedSnapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec: JobSpec::Training,
            seed,
            attempt: 0,
        }
    }

    pub fn attack(seed: SeedSnapshot, level: AttackLevel, repetition: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec: JobSpec::Attack { level, repetition },
            seed,
            attempt: 0,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self.spec {
            JobSpec::Training => JobKind::Training,
            JobSpec::Attack { .. } => JobKind::Attack,
        }
    }

    pub fn seed_id(&self) -> SeedId {
        self.seed.id
    }
}

/// Successful payload of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResult {
    Trained(TrainResult),
    Attacked(AttackResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    Pending,
    Succeeded { result: JobResult },
    Failed { error: JobError },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }

    pub fn error(&self) -> Option<&JobError> {
        match self {
            JobOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Terminal record of a job, returned through its pool handle.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: Job,
    pub outcome: JobOutcome,
    pub duration_ms: u64,
}

impl JobReport {
    pub fn failed(job: Job, error: JobError, duration_ms: u64) -> Self {
        Self {
            job,
            outcome: JobOutcome::Failed { error },
            duration_ms,
        }
    }
}
