//! Generation driver for population-based training.
//!
//! Each generation moves through `Spawning -> AwaitingCompletion ->
//! Selecting -> Producing`. The scheduler is the only writer of the
//! [`PopulationTable`]; training jobs receive snapshots.

use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::error::RunError;
use crate::events::{EventEmitter, RunEvent};
use crate::job::{Job, JobOutcome, JobReport, JobResult};
use crate::mutation::Mutator;
use crate::pool::WorkerPool;
use crate::population::{AgentId, PopulationTable, Seed, SeedId};
use crate::selection::{self, Collapsed, SelectionPlan};
use crate::settings::{MutationConfig, PopulationConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    Spawning,
    AwaitingCompletion,
    Selecting,
    Producing,
    Terminated,
}

/// Why the PBT phase ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    /// The last configured generation finished training.
    MaxGenerations { generation: u32 },
    /// Fewer than two seeds of `generation` completed.
    PopulationCollapsed { generation: u32, completed: usize },
    Cancelled { generation: u32 },
}

impl Termination {
    pub fn generation(&self) -> u32 {
        match self {
            Termination::MaxGenerations { generation }
            | Termination::PopulationCollapsed { generation, .. }
            | Termination::Cancelled { generation } => *generation,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::MaxGenerations { generation } => {
                write!(f, "completed generation {generation}")
            }
            Termination::PopulationCollapsed { generation, completed } => {
                write!(f, "population collapsed in generation {generation} ({completed} completed)")
            }
            Termination::Cancelled { generation } => write!(f, "cancelled during generation {generation}"),
        }
    }
}

/// Outcome of the PBT phase for one defended agent.
#[derive(Debug)]
pub struct TrainedPopulation {
    pub agent: AgentId,
    pub termination: Termination,
    pub table: PopulationTable,
}

pub struct PbtScheduler {
    config: PopulationConfig,
    agent: AgentId,
    mutator: Mutator,
    table: PopulationTable,
    rng: StdRng,
    phase: GenerationPhase,
    events: EventEmitter,
    cancel: CancelToken,
}

impl PbtScheduler {
    /// Scheduler for the population defending `agent`. A fixed `rng_seed`
    /// is offset by the agent id so each population draws its own stream.
    pub fn new(
        config: PopulationConfig,
        agent: AgentId,
        mutation: MutationConfig,
        rng_seed: Option<u64>,
        events: EventEmitter,
        cancel: CancelToken,
    ) -> Self {
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(u64::from(agent))),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            agent,
            mutator: Mutator::new(mutation),
            table: PopulationTable::new(),
            rng,
            phase: GenerationPhase::Spawning,
            events,
            cancel,
        }
    }

    pub fn table(&self) -> &PopulationTable {
        &self.table
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn into_population(self, termination: Termination) -> TrainedPopulation {
        TrainedPopulation {
            agent: self.agent,
            termination,
            table: self.table,
        }
    }

    pub fn phase(&self) -> GenerationPhase {
        self.phase
    }

    /// Train generations until the configured count is reached, the
    /// population collapses or the run is cancelled.
    ///
    /// Per-seed failures end up in the table. Only a pool-wide fault is
    /// returned as an error.
    #[instrument(skip_all, fields(group = %self.events.group(), agent = self.agent))]
    pub async fn run(&mut self, pool: &WorkerPool) -> Result<Termination, RunError> {
        if self.table.current_generation().is_none() {
            let initial = self.initial_generation();
            self.table.push_generation(initial)?;
        }

        let agent = self.agent;
        let termination = loop {
            let generation = self.table.current_generation().unwrap_or(0);
            if self.cancel.is_cancelled() {
                break Termination::Cancelled { generation };
            }

            self.phase = GenerationPhase::Spawning;
            let jobs = self.spawn(generation)?;
            self.events.emit(RunEvent::GenerationStarted {
                agent,
                generation,
                seeds: jobs.len(),
            });

            self.phase = GenerationPhase::AwaitingCompletion;
            let events = self.events.clone();
            let reports = pool
                .run_all(jobs, |report| {
                    events.emit(RunEvent::JobCompleted {
                        job_id: report.job.id,
                        kind: report.job.kind(),
                        agent,
                        seed_id: report.job.seed_id(),
                        generation,
                        attempts: report.job.attempt,
                        outcome: report.outcome.clone(),
                    })
                })
                .await?;
            for report in reports {
                self.record(generation, report)?;
            }

            let completed = self.table.completed(generation).len();
            info!(
                "Generation {} finished: {}/{} seeds completed",
                generation,
                completed,
                self.table.generation(generation).len()
            );

            if self.cancel.is_cancelled() {
                break Termination::Cancelled { generation };
            }
            if generation >= self.config.generations {
                break Termination::MaxGenerations { generation };
            }

            self.phase = GenerationPhase::Selecting;
            let plan = match selection::plan(
                self.table.generation(generation),
                self.config.bottom_fraction,
                self.config.top_fraction,
                &mut self.rng,
            ) {
                Ok(plan) => plan,
                Err(Collapsed { completed }) => {
                    warn!("Population collapsed in generation {}", generation);
                    self.events.emit(RunEvent::PopulationCollapsed {
                        agent,
                        generation,
                        completed,
                    });
                    break Termination::PopulationCollapsed { generation, completed };
                }
            };
            self.events.emit(RunEvent::GenerationSelected {
                agent,
                generation,
                survivors: plan.survivors.clone(),
                replaced: plan.replacements.clone(),
            });

            self.phase = GenerationPhase::Producing;
            let next = self.produce(generation, &plan);
            self.table.push_generation(next)?;
        };

        self.phase = GenerationPhase::Terminated;
        info!("PBT phase ended: {}", termination);
        Ok(termination)
    }

    fn initial_generation(&mut self) -> Vec<Seed> {
        let base = &self.config.hyperparameters;
        let mut seeds = Vec::with_capacity(self.config.size);
        for _ in 0..self.config.size {
            let params = if self.config.randomize_initial {
                self.mutator.sample_initial(base, &mut self.rng)
            } else {
                base.clone()
            };
            let id = self.table.allocate_id();
            seeds.push(Seed::new(id, 0, None, params, None).with_agent(self.agent));
        }
        seeds
    }

    /// Mark every pending seed of `generation` running and build its job.
    fn spawn(&mut self, generation: u32) -> Result<Vec<Job>, RunError> {
        let pending: Vec<SeedId> = self
            .table
            .generation(generation)
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.id)
            .collect();

        pending
            .into_iter()
            .map(|id| Ok(Job::training(self.table.mark_running(generation, id)?)))
            .collect()
    }

    fn record(&mut self, generation: u32, report: JobReport) -> Result<(), RunError> {
        let id = report.job.seed_id();
        let attempts = report.job.attempt;
        match report.outcome {
            JobOutcome::Succeeded {
                result: JobResult::Trained(result),
            } => {
                self.table
                    .record_success(generation, id, result.checkpoint, result.fitness, attempts)?;
            }
            JobOutcome::Failed { error } => {
                warn!(seed = id, generation, "Seed failed: {}", error);
                self.table.record_failure(generation, id, error.to_string(), attempts)?;
            }
            _ => {
                self.table
                    .record_failure(generation, id, "training job returned no training result", attempts)?;
            }
        }
        Ok(())
    }

    /// Build the next generation. Each slot keeps its position: survivors
    /// carry over, replaced slots get a mutated clone of their donor.
    fn produce(&mut self, generation: u32, plan: &SelectionPlan) -> Vec<Seed> {
        let current: Vec<Seed> = self.table.generation(generation).to_vec();
        let mut next = Vec::with_capacity(current.len());

        for seed in &current {
            if plan.survivors.contains(&seed.id) {
                next.push(seed.survivor());
                continue;
            }
            let Some(replacement) = plan.replacements.iter().find(|r| r.replaced == seed.id) else {
                continue;
            };
            let Some(donor) = current.iter().find(|s| s.id == replacement.donor) else {
                continue;
            };

            let params = self.mutator.explore(&donor.hyperparameters, &mut self.rng);
            let id = self.table.allocate_id();
            info!("Seed {} replaced by {} (cloned from {})", seed.id, id, donor.id);
            next.push(
                Seed::new(id, generation + 1, Some(donor.id), params, donor.checkpoint.clone()).with_agent(self.agent),
            );
        }
        next
    }
}
