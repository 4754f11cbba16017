//! Executes a single job against the backend with timeout and retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backend::{AttackRequest, Backend, TrainRequest};
use crate::cancel::CancelToken;
use crate::error::JobError;
use crate::job::{Job, JobOutcome, JobReport, JobResult, JobSpec};
use crate::settings::RetryConfig;

/// Bounded retry policy with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wall-clock budget of a single attempt.
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            timeout: Duration::from_secs(config.job_timeout_secs),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

/// Run-wide values every request carries.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub group: String,
    /// Timesteps budget per job.
    pub timesteps: u64,
}

pub struct JobRunner {
    backend: Arc<dyn Backend>,
    policy: RetryPolicy,
    context: JobContext,
    cancel: CancelToken,
}

impl JobRunner {
    pub fn new(backend: Arc<dyn Backend>, policy: RetryPolicy, context: JobContext, cancel: CancelToken) -> Self {
        Self {
            backend,
            policy,
            context,
            cancel,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `job` to a terminal outcome. Never fails outright; every problem
    /// ends up in the report.
    ///
    /// Cancellation is honoured before each attempt and during backoff. An
    /// attempt already in flight is left to the pool's grace deadline.
    pub async fn run(&self, mut job: Job) -> JobReport {
        let started = Instant::now();
        let elapsed_ms = |started: Instant| started.elapsed().as_millis() as u64;

        loop {
            if self.cancel.is_cancelled() {
                return JobReport::failed(job, JobError::Cancelled, elapsed_ms(started));
            }

            job.attempt += 1;
            debug!(job_id = %job.id, kind = %job.kind(), seed = job.seed_id(), attempt = job.attempt, "Starting attempt");

            let result = match tokio::time::timeout(self.policy.timeout, self.attempt(&job)).await {
                Ok(result) => result,
                Err(_) => Err(JobError::Timeout(self.policy.timeout)),
            };

            match result {
                Ok(result) => {
                    info!(job_id = %job.id, kind = %job.kind(), seed = job.seed_id(), attempt = job.attempt, "Job succeeded");
                    return JobReport {
                        job,
                        outcome: JobOutcome::Succeeded { result },
                        duration_ms: elapsed_ms(started),
                    };
                }
                Err(error) if error.is_retryable() && job.attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(job.attempt);
                    warn!(
                        job_id = %job.id,
                        seed = job.seed_id(),
                        attempt = job.attempt,
                        "Job attempt failed: {}; retrying in {:?}",
                        error,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            return JobReport::failed(job, JobError::Cancelled, elapsed_ms(started));
                        }
                    }
                }
                Err(error) => {
                    warn!(job_id = %job.id, kind = %job.kind(), seed = job.seed_id(), attempt = job.attempt, "Job failed: {}", error);
                    return JobReport::failed(job, error, elapsed_ms(started));
                }
            }
        }
    }

    async fn attempt(&self, job: &Job) -> Result<JobResult, JobError> {
        let seed = &job.seed;
        match job.spec {
            JobSpec::Training => {
                let request = TrainRequest {
                    job_id: job.id,
                    group: self.context.group.clone(),
                    seed_id: seed.id,
                    generation: seed.generation,
                    attempt: job.attempt,
                    hyperparameters: seed.hyperparameters.as_ref().clone(),
                    prior_checkpoint: seed.checkpoint.clone(),
                    main_agent: seed.agent,
                    timesteps: self.context.timesteps,
                };
                Ok(JobResult::Trained(self.backend.train_once(request).await?))
            }
            JobSpec::Attack { level, repetition } => {
                let victim_checkpoint = seed.checkpoint.clone().ok_or_else(|| {
                    JobError::Permanent(format!("seed {} has no checkpoint to attack", seed.id))
                })?;
                let request = AttackRequest {
                    job_id: job.id,
                    group: self.context.group.clone(),
                    seed_id: seed.id,
                    generation: seed.generation,
                    attempt: job.attempt,
                    victim_checkpoint,
                    level,
                    repetition,
                    attacker_agent: 1 - seed.agent,
                    timesteps: self.context.timesteps,
                };
                Ok(JobResult::Attacked(self.backend.evaluate_attack(request).await?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AttackResult, TrainResult};
    use crate::cancel::CancelHandle;
    use crate::error::BackendError;
    use crate::population::{CheckpointRef, Hyperparameters, Seed};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a fixed script of training results, then hangs.
    struct Scripted {
        script: Mutex<VecDeque<Result<TrainResult, BackendError>>>,
        attack_requests: Mutex<Vec<AttackRequest>>,
    }

    impl Scripted {
        fn new(script: Vec<Result<TrainResult, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                attack_requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Backend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn train_once(&self, _request: TrainRequest) -> Result<TrainResult, BackendError> {
            let next = self.script.lock().pop_front();
            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }

        async fn evaluate_attack(&self, request: AttackRequest) -> Result<AttackResult, BackendError> {
            self.attack_requests.lock().push(request);
            Ok(AttackResult { attack_metric: 0.5 })
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(250),
        }
    }

    fn context() -> JobContext {
        JobContext {
            group: "unit".into(),
            timesteps: 1_000,
        }
    }

    fn snapshot(checkpoint: Option<&str>) -> crate::population::SeedSnapshot {
        Seed::new(7, 1, None, Hyperparameters::new(), checkpoint.map(CheckpointRef::new)).snapshot()
    }

    fn trained(fitness: f64) -> Result<TrainResult, BackendError> {
        Ok(TrainResult {
            checkpoint: CheckpointRef::new("ck"),
            fitness,
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(250));
        assert_eq!(p.backoff(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let backend = Scripted::new(vec![
            Err(BackendError::Transient("gpu busy".into())),
            Err(BackendError::Transient("gpu busy".into())),
            trained(1.5),
        ]);
        let runner = JobRunner::new(backend, policy(3), context(), CancelToken::never());

        let report = runner.run(Job::training(snapshot(None))).await;
        assert!(report.outcome.is_success());
        assert_eq!(report.job.attempt, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let backend = Scripted::new(vec![Err(BackendError::Permanent("bad config".into())), trained(1.0)]);
        let runner = JobRunner::new(backend, policy(3), context(), CancelToken::never());

        let report = runner.run(Job::training(snapshot(None))).await;
        assert_eq!(report.outcome.error(), Some(&JobError::Permanent("bad config".into())));
        assert_eq!(report.job.attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let backend = Scripted::new(vec![
            Err(BackendError::Transient("a".into())),
            Err(BackendError::Transient("b".into())),
            trained(1.0),
        ]);
        let runner = JobRunner::new(backend, policy(2), context(), CancelToken::never());

        let report = runner.run(Job::training(snapshot(None))).await;
        assert_eq!(report.outcome.error(), Some(&JobError::Transient("b".into())));
        assert_eq!(report.job.attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_attempt_times_out() {
        let backend = Scripted::new(vec![]);
        let mut p = policy(1);
        p.timeout = Duration::from_secs(2);
        let runner = JobRunner::new(backend, p, context(), CancelToken::never());

        let started = tokio::time::Instant::now();
        let report = runner.run(Job::training(snapshot(None))).await;
        assert_eq!(report.outcome.error(), Some(&JobError::Timeout(Duration::from_secs(2))));
        assert!(started.elapsed() < Duration::from_secs(2) + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let backend = Scripted::new(vec![Err(BackendError::Transient("busy".into())), trained(1.0)]);
        let cancel = CancelHandle::new();
        let mut p = policy(3);
        p.backoff_base = Duration::from_secs(60);
        p.backoff_max = Duration::from_secs(60);
        let runner = JobRunner::new(backend, p, context(), cancel.token());

        let handle = tokio::spawn(async move { runner.run(Job::training(snapshot(None))).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let report = handle.await.unwrap();
        assert_eq!(report.outcome.error(), Some(&JobError::Cancelled));
        assert_eq!(report.job.attempt, 1);
    }

    #[tokio::test]
    async fn test_attack_targets_opposite_agent() {
        let backend = Scripted::new(vec![]);
        let runner = JobRunner::new(backend.clone(), policy(1), context(), CancelToken::never());

        let report = runner.run(Job::attack(snapshot(Some("ck-7")), 4, 1)).await;
        assert!(report.outcome.is_success());
        let requests = backend.attack_requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].attacker_agent, 1);
        assert_eq!(requests[0].level, 4);
        assert_eq!(requests[0].victim_checkpoint.as_str(), "ck-7");
    }

    #[tokio::test]
    async fn test_second_agent_is_attacked_by_first() {
        let backend = Scripted::new(vec![]);
        let runner = JobRunner::new(backend.clone(), policy(1), context(), CancelToken::never());

        let victim = Seed::new(2, 0, None, Hyperparameters::new(), Some(CheckpointRef::new("ck-2")))
            .with_agent(1)
            .snapshot();
        assert!(runner.run(Job::attack(victim, 2, 0)).await.outcome.is_success());
        assert_eq!(backend.attack_requests.lock()[0].attacker_agent, 0);
    }

    #[tokio::test]
    async fn test_attack_without_checkpoint_fails_permanently() {
        let backend = Scripted::new(vec![]);
        let runner = JobRunner::new(backend, policy(3), context(), CancelToken::never());

        let report = runner.run(Job::attack(snapshot(None), 2, 0)).await;
        assert!(matches!(report.outcome.error(), Some(JobError::Permanent(_))));
        assert_eq!(report.job.attempt, 1);
    }
}
