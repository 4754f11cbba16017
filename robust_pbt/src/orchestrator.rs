//! Runs the PBT phase to termination, then attacks the resulting seeds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, Utc};
use futures::future::join_all;
use tracing::{info, instrument, warn};

use crate::attack::{AttackRecord, AttackScheduler};
use crate::backend::Backend;
use crate::cancel::{CancelHandle, CancelToken};
use crate::error::RunError;
use crate::events::{EventEmitter, EventSink, FanoutSink, JsonLinesSink, RunEvent, TracingSink};
use crate::pbt::{PbtScheduler, Termination, TrainedPopulation};
use crate::pool::{PoolConfig, WorkerPool};
use crate::population::{SeedSnapshot, SeedStatus};
use crate::report::{AttackPhase, RunReport};
use crate::runner::{JobContext, JobRunner, RetryPolicy};
use crate::settings::{AttackTarget, Settings};

pub const EVENTS_FILE: &str = "events.jsonl";

pub struct Orchestrator {
    settings: Settings,
    group: String,
    output_dir: PathBuf,
    backend: Arc<dyn Backend>,
    sinks: Vec<Arc<dyn EventSink>>,
    cancel: CancelHandle,
}

impl Orchestrator {
    /// Validate `settings` and resolve the run-wide group label.
    ///
    /// Output goes to `<run.output_dir>/<group>`; the event log is opened
    /// there right away when enabled.
    pub fn new(settings: Settings, backend: Arc<dyn Backend>) -> Result<Self, RunError> {
        settings.validate()?;

        let group = settings.resolve_group(Local::now());
        let output_dir = settings.run.output_dir.join(&group);

        let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink)];
        if settings.run.write_events {
            sinks.push(Arc::new(JsonLinesSink::create(output_dir.join(EVENTS_FILE))?));
        }

        info!(group = %group, backend = backend.name(), "Orchestrator ready");
        Ok(Self {
            settings,
            group,
            output_dir,
            backend,
            sinks,
            cancel: CancelHandle::new(),
        })
    }

    /// Also deliver events to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Handle that cancels this run from anywhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    #[instrument(skip(self), fields(group = %self.group))]
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let started_at = Utc::now();
        let cancel = self.cancel.token();
        let events = EventEmitter::new(
            self.group.clone(),
            Arc::new(self.sinks.iter().cloned().fold(FanoutSink::new(), FanoutSink::with)),
        );

        let agents = self.settings.population.defended_agents();
        info!(
            "Starting run: agents {:?}, population {}, generations 0..={}, attack levels {:?}",
            agents, self.settings.population.size, self.settings.population.generations, self.settings.attack.levels
        );

        // One population per defended agent, sharing the training pool.
        let training_pool = self.training_pool(cancel.clone());
        let mut schedulers: Vec<PbtScheduler> = agents
            .into_iter()
            .map(|agent| {
                PbtScheduler::new(
                    self.settings.population.clone(),
                    agent,
                    self.settings.mutation.clone(),
                    self.settings.run.rng_seed,
                    events.clone(),
                    cancel.clone(),
                )
            })
            .collect();
        let terminations = join_all(schedulers.iter_mut().map(|pbt| pbt.run(&training_pool))).await;
        training_pool.shutdown().await;
        let populations = schedulers
            .into_iter()
            .zip(terminations)
            .map(|(pbt, termination)| Ok(pbt.into_population(termination?)))
            .collect::<Result<Vec<TrainedPopulation>, RunError>>()?;

        let (attacks, attack_phase) = self.attack_phase(&populations, &events, cancel).await?;

        let report = RunReport::build(&self.group, &populations, attacks, attack_phase, started_at);
        events.emit(RunEvent::RunFinished {
            report: Arc::new(report.clone()),
        });
        info!(status = ?report.status, "Run finished in {}ms", report.duration_ms());
        Ok(report)
    }

    async fn attack_phase(
        &self,
        populations: &[TrainedPopulation],
        events: &EventEmitter,
        cancel: CancelToken,
    ) -> Result<(Vec<AttackRecord>, AttackPhase), RunError> {
        if populations
            .iter()
            .any(|p| matches!(p.termination, Termination::Cancelled { .. }))
        {
            warn!("Run cancelled during training; skipping attacks");
            return Ok((Vec::new(), AttackPhase::Skipped));
        }

        let targets: Vec<SeedSnapshot> = populations.iter().flat_map(|p| self.attack_targets(p)).collect();
        if targets.is_empty() {
            warn!("No completed seeds to attack");
            return Ok((Vec::new(), AttackPhase::Skipped));
        }

        let config = &self.settings.attack;
        let scheduler = AttackScheduler::new(config.levels.clone(), config.repetitions, events.clone(), cancel.clone());
        info!(
            "Attacking {} seeds ({} outcomes expected)",
            targets.len(),
            scheduler.matrix_size(targets.len())
        );

        let attack_pool = self.attack_pool(cancel);
        let attacks = scheduler.run_attacks(&attack_pool, &targets).await;
        attack_pool.shutdown().await;
        let attacks = attacks?;

        let phase = if attacks.cancelled {
            AttackPhase::Cancelled
        } else {
            AttackPhase::Completed
        };
        Ok((attacks.records, phase))
    }

    /// Completed seed records of one population the attack phase targets.
    fn attack_targets(&self, population: &TrainedPopulation) -> Vec<SeedSnapshot> {
        let table = &population.table;
        match self.settings.attack.target {
            AttackTarget::FinalGeneration => table
                .completed(population.termination.generation())
                .into_iter()
                .map(|s| s.snapshot())
                .collect(),
            AttackTarget::AllSeeds => table
                .all_seeds()
                .filter(|s| s.status == SeedStatus::Completed)
                .map(|s| s.snapshot())
                .collect(),
        }
    }

    fn training_pool(&self, cancel: CancelToken) -> WorkerPool {
        let config = &self.settings.training;
        let runner = JobRunner::new(
            self.backend.clone(),
            RetryPolicy::from(&config.retry),
            JobContext {
                group: self.group.clone(),
                timesteps: config.timesteps,
            },
            cancel.clone(),
        );
        WorkerPool::new(
            PoolConfig {
                name: "training".to_string(),
                capacity: config.capacity,
                queue_limit: config.queue_limit,
                grace_period: self.settings.training_grace(),
            },
            Arc::new(runner),
            cancel,
        )
    }

    fn attack_pool(&self, cancel: CancelToken) -> WorkerPool {
        let config = &self.settings.attack;
        let runner = JobRunner::new(
            self.backend.clone(),
            RetryPolicy::from(&config.retry),
            JobContext {
                group: self.group.clone(),
                timesteps: config.timesteps,
            },
            cancel.clone(),
        );
        WorkerPool::new(
            PoolConfig {
                name: "attack".to_string(),
                capacity: config.capacity,
                queue_limit: config.queue_limit,
                grace_period: self.settings.attack_grace(),
            },
            Arc::new(runner),
            cancel,
        )
    }
}
