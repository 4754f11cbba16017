//! Experiment-tracking event stream.
//!
//! Every event is wrapped in an [`EventEnvelope`] carrying the run-wide
//! group label and a UTC timestamp, then handed to an [`EventSink`].

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::RunError;
use crate::job::{JobKind, JobOutcome};
use crate::population::{AgentId, SeedId};
use crate::report::RunReport;
use crate::selection::Replacement;
use crate::settings::AttackLevel;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    GenerationStarted {
        agent: AgentId,
        generation: u32,
        seeds: usize,
    },
    JobCompleted {
        job_id: Uuid,
        kind: JobKind,
        agent: AgentId,
        seed_id: SeedId,
        generation: u32,
        attempts: u32,
        outcome: JobOutcome,
    },
    GenerationSelected {
        agent: AgentId,
        generation: u32,
        survivors: Vec<SeedId>,
        replaced: Vec<Replacement>,
    },
    PopulationCollapsed {
        agent: AgentId,
        generation: u32,
        completed: usize,
    },
    AttackCompleted {
        job_id: Option<Uuid>,
        agent: AgentId,
        attacker_agent: AgentId,
        seed_id: SeedId,
        generation: u32,
        level: AttackLevel,
        repetition: u32,
        outcome: JobOutcome,
    },
    RunFinished {
        report: Arc<RunReport>,
    },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::GenerationStarted { .. } => "generation_started",
            RunEvent::JobCompleted { .. } => "job_completed",
            RunEvent::GenerationSelected { .. } => "generation_selected",
            RunEvent::PopulationCollapsed { .. } => "population_collapsed",
            RunEvent::AttackCompleted { .. } => "attack_completed",
            RunEvent::RunFinished { .. } => "run_finished",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub group: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Destination of run events. Sinks must not fail the run; delivery
/// problems are logged and dropped.
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &EventEnvelope);
}

/// Stamps events with the group label and forwards them to a sink.
#[derive(Clone)]
pub struct EventEmitter {
    group: String,
    sink: Arc<dyn EventSink>,
}

impl EventEmitter {
    pub fn new(group: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            group: group.into(),
            sink,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn emit(&self, event: RunEvent) {
        let envelope = EventEnvelope {
            group: self.group.clone(),
            timestamp: Utc::now(),
            event,
        };
        self.sink.emit(&envelope);
    }
}

/// Logs one line per event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, envelope: &EventEnvelope) {
        match &envelope.event {
            RunEvent::GenerationStarted { agent, generation, seeds } => {
                info!(group = %envelope.group, agent, "Generation {} started with {} seeds", generation, seeds)
            }
            RunEvent::JobCompleted { .. } | RunEvent::AttackCompleted { .. } => {}
            RunEvent::GenerationSelected {
                agent,
                generation,
                survivors,
                replaced,
            } => info!(
                group = %envelope.group,
                agent,
                "Generation {} selected: {} survivors, {} replaced",
                generation,
                survivors.len(),
                replaced.len()
            ),
            RunEvent::PopulationCollapsed {
                agent,
                generation,
                completed,
            } => warn!(
                group = %envelope.group,
                agent,
                "Population collapsed in generation {} ({} completed seeds)",
                generation,
                completed
            ),
            RunEvent::RunFinished { report } => {
                info!(group = %envelope.group, status = ?report.status, "Run finished")
            }
        }
    }
}

/// Appends one JSON document per event to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, RunError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonLinesSink {
    fn emit(&self, envelope: &EventEnvelope) {
        let line = match serde_json::to_string(envelope) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode {} event: {}", envelope.event.name(), e);
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            warn!("Failed to append to {:?}: {}", self.path, e);
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: RwLock<Vec<EventEnvelope>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.read().clone()
    }

    /// Event names in emission order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.read().iter().map(|e| e.event.name()).collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, envelope: &EventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, envelope: &EventEnvelope) {
        for sink in &self.sinks {
            sink.emit(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_envelope_flattens_event() {
        let sink = Arc::new(MemorySink::new());
        let emitter = EventEmitter::new("grp", sink.clone());
        emitter.emit(RunEvent::GenerationStarted {
            agent: 0,
            generation: 2,
            seeds: 4,
        });

        let events = sink.events();
        assert_eq!(events.len(), 1);
        let value = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(value["group"], "grp");
        assert_eq!(value["event"], "generation_started");
        assert_eq!(value["generation"], 2);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_json_lines_sink_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("events.jsonl");
        let file_sink = Arc::new(JsonLinesSink::create(&path).unwrap());
        let memory = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new().with(file_sink).with(memory.clone());
        let emitter = EventEmitter::new("grp", Arc::new(fanout));

        emitter.emit(RunEvent::GenerationStarted {
            agent: 1,
            generation: 0,
            seeds: 2,
        });
        emitter.emit(RunEvent::PopulationCollapsed {
            agent: 1,
            generation: 0,
            completed: 1,
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "population_collapsed");
        assert_eq!(memory.names(), vec!["generation_started", "population_collapsed"]);
    }
}
