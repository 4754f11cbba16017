//! Seed records and the population table that owns them.
//!
//! The table keeps one vector of seed records per generation. Records of
//! finished generations are never edited again; jobs only ever see a
//! [`SeedSnapshot`], so replacing a seed in the next generation cannot leak
//! into work that was dispatched against the old record.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stable seed identifier. Survivors keep their id across generations.
pub type SeedId = u64;

/// Agent slot in a two-player environment (0 or 1).
pub type AgentId = u8;

/// A single hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HyperValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Categorical(String),
}

impl HyperValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HyperValue::Int(v) => Some(*v as f64),
            HyperValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for HyperValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HyperValue::Bool(v) => write!(f, "{v}"),
            HyperValue::Int(v) => write!(f, "{v}"),
            HyperValue::Float(v) => write!(f, "{v}"),
            HyperValue::Categorical(v) => f.write_str(v),
        }
    }
}

pub type Hyperparameters = BTreeMap<String, HyperValue>;

/// Opaque handle to a trained model state, produced by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointRef(pub String);

impl CheckpointRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SeedStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SeedStatus::Completed | SeedStatus::Failed)
    }
}

/// One seed record in one generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seed {
    pub id: SeedId,
    /// Agent whose policy this seed trains.
    pub agent: AgentId,
    pub generation: u32,
    pub parent_id: Option<SeedId>,
    pub hyperparameters: Arc<Hyperparameters>,
    pub checkpoint: Option<CheckpointRef>,
    pub fitness: Option<f64>,
    pub status: SeedStatus,
    /// Terminal error of the training job, if it failed.
    pub error: Option<String>,
    /// Attempts used by the training job of this generation.
    pub attempts: u32,
}

impl Seed {
    pub fn new(
        id: SeedId,
        generation: u32,
        parent_id: Option<SeedId>,
        hyperparameters: Hyperparameters,
        checkpoint: Option<CheckpointRef>,
    ) -> Self {
        Self {
            id,
            agent: 0,
            generation,
            parent_id,
            hyperparameters: Arc::new(hyperparameters),
            checkpoint,
            fitness: None,
            status: SeedStatus::Pending,
            error: None,
            attempts: 0,
        }
    }

    pub fn with_agent(mut self, agent: AgentId) -> Self {
        self.agent = agent;
        self
    }

    /// The same seed one generation later, keeping its id, agent, parent,
    /// hyperparameters and trained checkpoint.
    pub fn survivor(&self) -> Seed {
        Seed {
            hyperparameters: Arc::clone(&self.hyperparameters),
            ..Seed::new(self.id, self.generation + 1, self.parent_id, Hyperparameters::new(), self.checkpoint.clone())
                .with_agent(self.agent)
        }
    }

    /// Read-only view handed to jobs.
    pub fn snapshot(&self) -> SeedSnapshot {
        SeedSnapshot {
            id: self.id,
            agent: self.agent,
            generation: self.generation,
            hyperparameters: Arc::clone(&self.hyperparameters),
            checkpoint: self.checkpoint.clone(),
        }
    }
}

/// Immutable copy of the parts of a seed a job is allowed to read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeedSnapshot {
    pub id: SeedId,
    pub agent: AgentId,
    pub generation: u32,
    pub hyperparameters: Arc<Hyperparameters>,
    pub checkpoint: Option<CheckpointRef>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TableError {
    #[error("generation {got} appended out of order (expected {expected})")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("seed {id} has generation {got}, expected {expected}")]
    GenerationMismatch { id: SeedId, expected: u32, got: u32 },

    #[error("seed {id} not found in generation {generation}")]
    UnknownSeed { id: SeedId, generation: u32 },

    #[error("seed {id} in generation {generation} is already terminal")]
    AlreadyTerminal { id: SeedId, generation: u32 },
}

/// Owns every seed record of a run.
#[derive(Debug, Default)]
pub struct PopulationTable {
    generations: Vec<Vec<Seed>>,
    next_id: SeedId,
}

impl PopulationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh, never used seed id.
    pub fn allocate_id(&mut self) -> SeedId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Append the next generation. Generations are dense, starting at 0.
    pub fn push_generation(&mut self, seeds: Vec<Seed>) -> Result<u32, TableError> {
        let expected = self.generations.len() as u32;
        if let Some(seed) = seeds.iter().find(|s| s.generation != expected) {
            return Err(if self.generations.is_empty() || seed.generation > expected {
                TableError::OutOfOrder { expected, got: seed.generation }
            } else {
                TableError::GenerationMismatch { id: seed.id, expected, got: seed.generation }
            });
        }
        for seed in &seeds {
            self.next_id = self.next_id.max(seed.id + 1);
        }
        self.generations.push(seeds);
        Ok(expected)
    }

    /// Latest generation number, `None` while the table is empty.
    pub fn current_generation(&self) -> Option<u32> {
        self.generations.len().checked_sub(1).map(|g| g as u32)
    }

    pub fn generation_count(&self) -> usize {
        self.generations.len()
    }

    pub fn generation(&self, generation: u32) -> &[Seed] {
        self.generations
            .get(generation as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn seed(&self, generation: u32, id: SeedId) -> Option<&Seed> {
        self.generation(generation).iter().find(|s| s.id == id)
    }

    fn seed_mut(&mut self, generation: u32, id: SeedId) -> Result<&mut Seed, TableError> {
        self.generations
            .get_mut(generation as usize)
            .and_then(|seeds| seeds.iter_mut().find(|s| s.id == id))
            .ok_or(TableError::UnknownSeed { id, generation })
    }

    pub fn mark_running(&mut self, generation: u32, id: SeedId) -> Result<SeedSnapshot, TableError> {
        let seed = self.seed_mut(generation, id)?;
        if seed.status.is_terminal() {
            return Err(TableError::AlreadyTerminal { id, generation });
        }
        seed.status = SeedStatus::Running;
        Ok(seed.snapshot())
    }

    /// Record a successful training job. Checkpoint and fitness are written
    /// together.
    pub fn record_success(
        &mut self,
        generation: u32,
        id: SeedId,
        checkpoint: CheckpointRef,
        fitness: f64,
        attempts: u32,
    ) -> Result<(), TableError> {
        let seed = self.seed_mut(generation, id)?;
        if seed.status.is_terminal() {
            return Err(TableError::AlreadyTerminal { id, generation });
        }
        seed.checkpoint = Some(checkpoint);
        seed.fitness = Some(fitness);
        seed.status = SeedStatus::Completed;
        seed.attempts = attempts;
        Ok(())
    }

    pub fn record_failure(
        &mut self,
        generation: u32,
        id: SeedId,
        error: impl Into<String>,
        attempts: u32,
    ) -> Result<(), TableError> {
        let seed = self.seed_mut(generation, id)?;
        if seed.status.is_terminal() {
            return Err(TableError::AlreadyTerminal { id, generation });
        }
        seed.status = SeedStatus::Failed;
        seed.error = Some(error.into());
        seed.attempts = attempts;
        Ok(())
    }

    /// Every record ever produced, in generation order.
    pub fn all_seeds(&self) -> impl Iterator<Item = &Seed> {
        self.generations.iter().flatten()
    }

    pub fn completed(&self, generation: u32) -> Vec<&Seed> {
        self.generation(generation)
            .iter()
            .filter(|s| s.status == SeedStatus::Completed)
            .collect()
    }

    /// Ancestry of a seed, starting with the seed itself and ending at its
    /// generation 0 root.
    pub fn lineage(&self, id: SeedId) -> Vec<SeedId> {
        let mut chain = vec![id];
        let mut current = id;
        while let Some(parent) = self.first_record(current).and_then(|s| s.parent_id) {
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// The record in which a seed id first appeared.
    fn first_record(&self, id: SeedId) -> Option<&Seed> {
        self.all_seeds().find(|s| s.id == id)
    }
}
