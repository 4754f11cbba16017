//! Adversarial attack phase: every target seed against every level.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::backend::AttackResult;
use crate::cancel::CancelToken;
use crate::error::{JobError, RunError};
use crate::events::{EventEmitter, RunEvent};
use crate::job::{Job, JobOutcome, JobReport, JobResult, JobSpec};
use crate::pool::WorkerPool;
use crate::population::{AgentId, SeedId, SeedSnapshot};
use crate::settings::AttackLevel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttackOutcome {
    Succeeded { attack_metric: f64 },
    Failed { error: JobError },
}

impl AttackOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttackOutcome::Succeeded { .. })
    }
}

/// Terminal outcome of one (seed, level, repetition) attack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackRecord {
    /// Attack job id; `None` when the pair never reached the pool.
    pub job_id: Option<Uuid>,
    /// Defended agent of the victim seed.
    pub agent: AgentId,
    pub attacker_agent: AgentId,
    pub seed_id: SeedId,
    pub generation: u32,
    pub level: AttackLevel,
    pub repetition: u32,
    pub attempts: u32,
    pub duration_ms: u64,
    pub outcome: AttackOutcome,
}

impl AttackRecord {
    fn from_report(report: JobReport) -> Self {
        let (level, repetition) = match report.job.spec {
            JobSpec::Attack { level, repetition } => (level, repetition),
            JobSpec::Training => (0, 0),
        };
        let outcome = match report.outcome {
            JobOutcome::Succeeded {
                result: JobResult::Attacked(result),
            } => AttackOutcome::Succeeded {
                attack_metric: result.attack_metric,
            },
            JobOutcome::Failed { error } => AttackOutcome::Failed { error },
            _ => AttackOutcome::Failed {
                error: JobError::Permanent("attack job returned no attack result".to_string()),
            },
        };
        let agent = report.job.seed.agent;
        Self {
            job_id: Some(report.job.id),
            agent,
            attacker_agent: 1 - agent,
            seed_id: report.job.seed.id,
            generation: report.job.seed.generation,
            level,
            repetition,
            attempts: report.job.attempt,
            duration_ms: report.duration_ms,
            outcome,
        }
    }
}

/// Result of one attack phase.
#[derive(Debug, Clone, Default)]
pub struct AttackRun {
    pub records: Vec<AttackRecord>,
    /// The run was cancelled before every pair finished on its own.
    pub cancelled: bool,
}

pub struct AttackScheduler {
    levels: Vec<AttackLevel>,
    repetitions: u32,
    events: EventEmitter,
    cancel: CancelToken,
}

impl AttackScheduler {
    pub fn new(levels: Vec<AttackLevel>, repetitions: u32, events: EventEmitter, cancel: CancelToken) -> Self {
        Self {
            levels,
            repetitions: repetitions.max(1),
            events,
            cancel,
        }
    }

    /// Number of outcomes `run_attacks` produces for `seeds` targets.
    pub fn matrix_size(&self, seeds: usize) -> usize {
        seeds * self.levels.len() * self.repetitions as usize
    }

    /// Attack every seed at every level, `repetitions` times each, and wait
    /// for all of them. Seeds without a checkpoint fail their pairs without
    /// reaching the pool.
    #[instrument(skip_all, fields(group = %self.events.group(), seeds = seeds.len()))]
    pub async fn run_attacks(&self, pool: &WorkerPool, seeds: &[SeedSnapshot]) -> Result<AttackRun, RunError> {
        let mut records = Vec::with_capacity(self.matrix_size(seeds.len()));
        let mut jobs = Vec::new();

        for seed in seeds {
            for &level in &self.levels {
                for repetition in 0..self.repetitions {
                    if seed.checkpoint.is_some() {
                        jobs.push(Job::attack(seed.clone(), level, repetition));
                        continue;
                    }
                    warn!(seed = seed.id, level, "Seed has no checkpoint; attack pair failed");
                    let record = AttackRecord {
                        job_id: None,
                        agent: seed.agent,
                        attacker_agent: 1 - seed.agent,
                        seed_id: seed.id,
                        generation: seed.generation,
                        level,
                        repetition,
                        attempts: 0,
                        duration_ms: 0,
                        outcome: AttackOutcome::Failed {
                            error: JobError::Permanent(format!("seed {} has no checkpoint", seed.id)),
                        },
                    };
                    self.emit(&record);
                    records.push(record);
                }
            }
        }

        info!(
            "Submitting {} attack jobs over levels {:?} ({} repetitions)",
            jobs.len(),
            self.levels,
            self.repetitions
        );

        let reports = pool
            .run_all(jobs, |report| {
                self.events.emit(RunEvent::JobCompleted {
                    job_id: report.job.id,
                    kind: report.job.kind(),
                    agent: report.job.seed.agent,
                    seed_id: report.job.seed_id(),
                    generation: report.job.seed.generation,
                    attempts: report.job.attempt,
                    outcome: report.outcome.clone(),
                });
                self.emit(&AttackRecord::from_report(report.clone()));
            })
            .await?;
        records.extend(reports.into_iter().map(AttackRecord::from_report));

        let failed = records.iter().filter(|r| !r.outcome.is_success()).count();
        info!("Attack phase finished: {} outcomes, {} failed", records.len(), failed);

        Ok(AttackRun {
            records,
            cancelled: self.cancel.is_cancelled(),
        })
    }

    fn emit(&self, record: &AttackRecord) {
        let outcome = match &record.outcome {
            AttackOutcome::Succeeded { attack_metric } => JobOutcome::Succeeded {
                result: JobResult::Attacked(AttackResult {
                    attack_metric: *attack_metric,
                }),
            },
            AttackOutcome::Failed { error } => JobOutcome::Failed { error: error.clone() },
        };
        self.events.emit(RunEvent::AttackCompleted {
            job_id: record.job_id,
            agent: record.agent,
            attacker_agent: record.attacker_agent,
            seed_id: record.seed_id,
            generation: record.generation,
            level: record.level,
            repetition: record.repetition,
            outcome,
        });
    }
}
