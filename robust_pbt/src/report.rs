//! Final run report: seed lineage, training fitness and attack outcomes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::attack::{AttackOutcome, AttackRecord};
use crate::pbt::{Termination, TrainedPopulation};
use crate::population::{AgentId, CheckpointRef, Hyperparameters, SeedId, SeedStatus};

pub const REPORT_FILE: &str = "report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Some seeds or attack pairs failed.
    PartialSuccess,
    PopulationCollapsed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackPhase {
    Completed,
    /// No seed qualified as a target, or the run was cancelled before it.
    Skipped,
    Cancelled,
}

/// One seed record with its ancestry and the attacks run against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedReport {
    pub id: SeedId,
    pub agent: AgentId,
    pub generation: u32,
    pub parent_id: Option<SeedId>,
    /// The seed itself first, then its ancestors back to generation 0.
    pub lineage: Vec<SeedId>,
    pub hyperparameters: Hyperparameters,
    pub checkpoint: Option<CheckpointRef>,
    pub fitness: Option<f64>,
    pub status: SeedStatus,
    pub error: Option<String>,
    pub attempts: u32,
    pub attacks: Vec<AttackRecord>,
}

impl SeedReport {
    /// Mean attack metric over the successful repetitions of `level`.
    pub fn mean_attack_metric(&self, level: u32) -> Option<f64> {
        let metrics: Vec<f64> = self
            .attacks
            .iter()
            .filter(|a| a.level == level)
            .filter_map(|a| match a.outcome {
                AttackOutcome::Succeeded { attack_metric } => Some(attack_metric),
                AttackOutcome::Failed { .. } => None,
            })
            .collect();
        (!metrics.is_empty()).then(|| metrics.iter().sum::<f64>() / metrics.len() as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTotals {
    pub seeds_completed: usize,
    pub seeds_failed: usize,
    pub attacks_succeeded: usize,
    pub attacks_failed: usize,
}

/// How the PBT phase of one defended population ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationSummary {
    pub agent: AgentId,
    pub termination: Termination,
    /// Number of generations that were trained.
    pub generations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub group: String,
    pub status: RunStatus,
    pub populations: Vec<PopulationSummary>,
    pub attack_phase: AttackPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub totals: ReportTotals,
    /// Every seed record, grouped by agent and in generation order.
    pub seeds: Vec<SeedReport>,
}

impl RunReport {
    pub fn build(
        group: &str,
        populations: &[TrainedPopulation],
        mut attacks: Vec<AttackRecord>,
        attack_phase: AttackPhase,
        started_at: DateTime<Utc>,
    ) -> Self {
        attacks.sort_by_key(|a| (a.agent, a.generation, a.seed_id, a.level, a.repetition));

        let mut totals = ReportTotals::default();
        for attack in &attacks {
            match attack.outcome {
                AttackOutcome::Succeeded { .. } => totals.attacks_succeeded += 1,
                AttackOutcome::Failed { .. } => totals.attacks_failed += 1,
            }
        }

        let seeds: Vec<SeedReport> = populations
            .iter()
            .flat_map(|population| population.table.all_seeds().map(move |seed| (&population.table, seed)))
            .map(|(table, seed)| {
                match seed.status {
                    SeedStatus::Completed => totals.seeds_completed += 1,
                    SeedStatus::Failed => totals.seeds_failed += 1,
                    _ => {}
                }
                SeedReport {
                    id: seed.id,
                    agent: seed.agent,
                    generation: seed.generation,
                    parent_id: seed.parent_id,
                    lineage: table.lineage(seed.id),
                    hyperparameters: seed.hyperparameters.as_ref().clone(),
                    checkpoint: seed.checkpoint.clone(),
                    fitness: seed.fitness,
                    status: seed.status,
                    error: seed.error.clone(),
                    attempts: seed.attempts,
                    attacks: attacks
                        .iter()
                        .filter(|a| a.agent == seed.agent && a.seed_id == seed.id && a.generation == seed.generation)
                        .cloned()
                        .collect(),
                }
            })
            .collect();

        let cancelled = populations
            .iter()
            .any(|p| matches!(p.termination, Termination::Cancelled { .. }));
        let collapsed = populations
            .iter()
            .any(|p| matches!(p.termination, Termination::PopulationCollapsed { .. }));
        let status = if cancelled || attack_phase == AttackPhase::Cancelled {
            RunStatus::Cancelled
        } else if collapsed {
            RunStatus::PopulationCollapsed
        } else if totals.seeds_failed > 0 || totals.attacks_failed > 0 {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Success
        };

        Self {
            group: group.to_string(),
            status,
            populations: populations
                .iter()
                .map(|p| PopulationSummary {
                    agent: p.agent,
                    termination: p.termination.clone(),
                    generations: p.table.generation_count() as u32,
                })
                .collect(),
            attack_phase,
            started_at,
            finished_at: Utc::now(),
            totals,
            seeds,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// How the population defending `agent` ended.
    pub fn termination(&self, agent: AgentId) -> Option<&Termination> {
        self.populations
            .iter()
            .find(|p| p.agent == agent)
            .map(|p| &p.termination)
    }

    /// Seed records of one generation, across agents.
    pub fn generation(&self, generation: u32) -> impl Iterator<Item = &SeedReport> {
        self.seeds.iter().filter(move |s| s.generation == generation)
    }

    pub fn agent_seeds(&self, agent: AgentId) -> impl Iterator<Item = &SeedReport> {
        self.seeds.iter().filter(move |s| s.agent == agent)
    }

    pub fn failed_seeds(&self) -> impl Iterator<Item = &SeedReport> {
        self.seeds.iter().filter(|s| s.status == SeedStatus::Failed)
    }

    pub fn attacks(&self) -> impl Iterator<Item = &AttackRecord> {
        self.seeds.iter().flat_map(|s| s.attacks.iter())
    }

    pub fn print_summary(&self) {
        println!("\n=== Robust PBT Summary ===");
        println!("Group: {}", self.group);
        println!("Status: {:?}", self.status);
        for population in &self.populations {
            println!(
                "Agent {}: {} ({} generations trained)",
                population.agent, population.termination, population.generations
            );
        }
        println!(
            "Seeds: {} completed, {} failed",
            self.totals.seeds_completed, self.totals.seeds_failed
        );
        println!(
            "Attacks: {} succeeded, {} failed",
            self.totals.attacks_succeeded, self.totals.attacks_failed
        );
        println!("Duration: {}ms", self.duration_ms());

        let attacked: Vec<&SeedReport> = self.seeds.iter().filter(|s| !s.attacks.is_empty()).collect();
        if !attacked.is_empty() {
            println!("\nAttacked seeds:");
            for seed in attacked {
                let mut levels: Vec<u32> = seed.attacks.iter().map(|a| a.level).collect();
                levels.dedup();
                let metrics: Vec<String> = levels
                    .iter()
                    .map(|level| match seed.mean_attack_metric(*level) {
                        Some(m) => format!("L{level}={m:.3}"),
                        None => format!("L{level}=failed"),
                    })
                    .collect();
                println!(
                    "  - agent {} seed {} gen {} (lineage {:?}) fitness {}: {}",
                    seed.agent,
                    seed.id,
                    seed.generation,
                    seed.lineage,
                    seed.fitness.map(|f| format!("{f:.4}")).unwrap_or_else(|| "-".into()),
                    metrics.join(" ")
                );
            }
        }

        if self.totals.seeds_failed > 0 {
            println!("\nFailed seeds:");
            for seed in self.failed_seeds() {
                println!(
                    "  - agent {} seed {} gen {}: {}",
                    seed.agent,
                    seed.id,
                    seed.generation,
                    seed.error.as_deref().unwrap_or("Unknown error")
                );
            }
        }

        if self.totals.attacks_failed > 0 {
            println!("\nFailed attacks:");
            for attack in self.attacks() {
                if let AttackOutcome::Failed { error } = &attack.outcome {
                    println!(
                        "  - agent {} seed {} gen {} level {} rep {}: {}",
                        attack.agent, attack.seed_id, attack.generation, attack.level, attack.repetition, error
                    );
                }
            }
        }
        println!("==========================\n");
    }

    /// Write the report as pretty JSON into `dir`.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create output directory: {:?}", dir))?;
        let path = dir.join(REPORT_FILE);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write report to: {:?}", path))?;

        info!("Run report saved to: {:?}", path);
        Ok(path)
    }
}
