//! Training and attack backends.
//!
//! The orchestrator never runs RL itself. It hands a [`TrainRequest`] or an
//! [`AttackRequest`] to a [`Backend`] and receives a checkpoint and a metric
//! back.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::BackendError;
use crate::population::{AgentId, CheckpointRef, Hyperparameters, SeedId};
use crate::settings::{AttackLevel, BackendConfig, BackendKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainRequest {
    pub job_id: Uuid,
    pub group: String,
    pub seed_id: SeedId,
    pub generation: u32,
    pub attempt: u32,
    pub hyperparameters: Hyperparameters,
    pub prior_checkpoint: Option<CheckpointRef>,
    /// Agent id of the defended policy.
    pub main_agent: AgentId,
    pub timesteps: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainResult {
    pub checkpoint: CheckpointRef,
    pub fitness: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackRequest {
    pub job_id: Uuid,
    pub group: String,
    pub seed_id: SeedId,
    pub generation: u32,
    pub attempt: u32,
    pub victim_checkpoint: CheckpointRef,
    pub level: AttackLevel,
    pub repetition: u32,
    /// Agent id the adversary controls.
    pub attacker_agent: AgentId,
    pub timesteps: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackResult {
    /// Attack success metric; higher means the adversary did better.
    pub attack_metric: f64,
}

/// An external RL backend.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn train_once(&self, request: TrainRequest) -> Result<TrainResult, BackendError>;

    async fn evaluate_attack(&self, request: AttackRequest) -> Result<AttackResult, BackendError>;
}

/// Build the backend selected in configuration.
pub fn from_config(config: &BackendConfig) -> Box<dyn Backend> {
    match config.kind {
        BackendKind::Process => Box::new(ProcessBackend::new(config)),
        BackendKind::Synthetic => Box::new(SyntheticBackend::default()),
    }
}

// --- Process backend ---

/// Runs every job in a fresh OS process.
///
/// The request goes to the child's stdin as one JSON document. The last
/// non-empty stdout line must be the JSON result. The child is killed when
/// the job future is dropped (timeout or cancellation).
pub struct ProcessBackend {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    transient_exit_codes: Vec<i32>,
}

impl ProcessBackend {
    pub fn new(config: &BackendConfig) -> Self {
        let mut command = config.command.iter().cloned();
        Self {
            program: command.next().unwrap_or_default(),
            args: command.collect(),
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
            transient_exit_codes: config.transient_exit_codes.clone(),
        }
    }

    async fn invoke<Req, Res>(&self, subcommand: &str, request: &Req) -> Result<Res, BackendError>
    where
        Req: Serialize,
        Res: for<'de> Deserialize<'de>,
    {
        let payload = serde_json::to_vec(request)
            .map_err(|e| BackendError::Permanent(format!("Failed to encode request: {e}")))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(subcommand)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        // Spawn failures are usually resource exhaustion, so they are retried.
        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Transient(format!("Failed to spawn '{}': {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                // A worker may exit without reading its request; the exit
                // status below decides the outcome.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!("Worker closed stdin before reading the request");
                }
                Err(e) => return Err(BackendError::Transient(format!("Failed to write request: {e}"))),
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackendError::Transient(format!("Failed to collect worker output: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            return match output.status.code() {
                Some(code) if self.transient_exit_codes.contains(&code) => {
                    warn!(code, "Worker reported a transient failure");
                    Err(BackendError::Transient(format!("worker exited with {code}: {tail}")))
                }
                Some(code) => Err(BackendError::Permanent(format!("worker exited with {code}: {tail}"))),
                None => Err(BackendError::Transient(format!("worker terminated by signal: {tail}"))),
            };
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| BackendError::Permanent("worker produced no output".to_string()))?;

        serde_json::from_str(line)
            .map_err(|e| BackendError::Permanent(format!("Invalid worker output '{line}': {e}")))
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    #[instrument(skip(self, request), fields(seed = request.seed_id, generation = request.generation))]
    async fn train_once(&self, request: TrainRequest) -> Result<TrainResult, BackendError> {
        debug!("Spawning training worker");
        self.invoke("train", &request).await
    }

    #[instrument(skip(self, request), fields(seed = request.seed_id, level = request.level))]
    async fn evaluate_attack(&self, request: AttackRequest) -> Result<AttackResult, BackendError> {
        debug!("Spawning attack worker");
        self.invoke("attack", &request).await
    }
}

// --- Synthetic backend ---

/// Deterministic in-process backend for dry runs.
///
/// Fitness grows with the generation and peaks when numeric hyperparameters
/// sit near the middle of their magnitudes; attack success grows with the
/// level and shrinks with the victim's fitness.
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    pub latency: Duration,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(20),
        }
    }
}

impl SyntheticBackend {
    fn score(params: &Hyperparameters) -> f64 {
        params
            .values()
            .filter_map(|v| v.as_f64())
            .map(|v| 1.0 / (1.0 + v.abs().max(f64::MIN_POSITIVE).log10().powi(2)))
            .sum()
    }
}

#[async_trait]
impl Backend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn train_once(&self, request: TrainRequest) -> Result<TrainResult, BackendError> {
        tokio::time::sleep(self.latency).await;
        let fitness = Self::score(&request.hyperparameters) + f64::from(request.generation);
        Ok(TrainResult {
            checkpoint: CheckpointRef::new(format!(
                "{}/agent-{}/seed-{}/gen-{}",
                request.group, request.main_agent, request.seed_id, request.generation
            )),
            fitness,
        })
    }

    async fn evaluate_attack(&self, request: AttackRequest) -> Result<AttackResult, BackendError> {
        tokio::time::sleep(self.latency).await;
        let resistance = 1.0 + f64::from(request.generation);
        let attack_metric = f64::from(request.level) / (f64::from(request.level) + resistance);
        Ok(AttackResult { attack_metric })
    }
}
