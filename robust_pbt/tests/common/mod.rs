//! Shared test backend and settings helpers.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use robust_pbt::backend::{AttackRequest, AttackResult, Backend, TrainRequest, TrainResult};
use robust_pbt::error::BackendError;
use robust_pbt::population::{CheckpointRef, SeedId};
use robust_pbt::settings::AttackLevel;
use robust_pbt::Settings;
use tokio::sync::Notify;

/// Deterministic backend: fitness is `10 * generation - seed id`, so it grows
/// every generation and lower ids rank higher within one.
#[derive(Default)]
pub struct ScriptedBackend {
    /// (seed, generation) pairs whose training always fails transiently.
    pub failing_training: HashSet<(SeedId, u32)>,
    /// (seed, level) pairs whose attacks fail permanently.
    pub failing_attacks: HashSet<(SeedId, AttackLevel)>,
    /// Training at this generation or later hangs for a minute.
    pub slow_from_generation: Option<u32>,
    pub slow_started: Notify,
    /// Attacks hang for a minute.
    pub slow_attacks: bool,
    pub attack_started: Notify,
    pub train_calls: AtomicUsize,
    pub attack_calls: AtomicUsize,
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn train_once(&self, request: TrainRequest) -> Result<TrainResult, BackendError> {
        self.train_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_training.contains(&(request.seed_id, request.generation)) {
            return Err(BackendError::Transient(format!("seed {} out of memory", request.seed_id)));
        }
        if self.slow_from_generation.is_some_and(|g| request.generation >= g) {
            self.slow_started.notify_one();
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(TrainResult {
            checkpoint: CheckpointRef::new(format!(
                "{}/seed-{}/gen-{}",
                request.group, request.seed_id, request.generation
            )),
            fitness: 10.0 * f64::from(request.generation) - request.seed_id as f64,
        })
    }

    async fn evaluate_attack(&self, request: AttackRequest) -> Result<AttackResult, BackendError> {
        self.attack_calls.fetch_add(1, Ordering::SeqCst);
        if self.slow_attacks {
            self.attack_started.notify_one();
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.failing_attacks.contains(&(request.seed_id, request.level)) {
            return Err(BackendError::Permanent("victim checkpoint unreadable".into()));
        }
        Ok(AttackResult {
            attack_metric: f64::from(request.level) / 10.0,
        })
    }
}

/// Small, fast settings writing into `output_dir`.
pub fn settings(output_dir: &Path, size: usize, generations: u32) -> Settings {
    let mut settings = Settings::from_toml_str(&format!(
        r#"
[run]
group = "itest"
timestamp_group = false
write_events = false
rng_seed = 17

[population]
size = {size}
generations = {generations}
bottom_fraction = 0.25
top_fraction = 0.25

[population.hyperparameters]
lr = 0.001
activation = "tanh"

[mutation.bounds.lr]
min = 0.0001
max = 0.1

[mutation.choices]
activation = ["tanh", "relu"]

[training]
capacity = 2
grace_period_secs = 1

[training.retry]
max_attempts = 2
job_timeout_secs = 5
backoff_base_ms = 1
backoff_max_ms = 2

[attack]
levels = [2, 4]
capacity = 3
grace_period_secs = 1

[attack.retry]
max_attempts = 1
job_timeout_secs = 5
backoff_base_ms = 1
backoff_max_ms = 1

[backend]
kind = "synthetic"
"#
    ))
    .expect("test settings are valid");
    settings.run.output_dir = output_dir.to_path_buf();
    settings
}
