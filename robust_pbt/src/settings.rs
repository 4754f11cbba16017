//! Run configuration with layered sources and fail-fast validation.
//!
//! Sources, lowest priority first: the embedded `config.toml`, an optional
//! `robust_pbt.toml` in the working directory, an explicit file passed on the
//! command line, then `RPBT__SECTION__KEY` environment variables. Every
//! section rejects unknown keys.
//!
//! Hyperparameter names are passed to the backend verbatim and must be
//! lowercase, since the layered loader folds keys to lowercase.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::RunError;
use crate::population::{AgentId, HyperValue, Hyperparameters};

/// Adversary intensity, e.g. the number of opponents the attacker trains.
pub type AttackLevel = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Base experiment group label.
    pub group: String,
    /// Append `-pbt+attack-<timestamp>` so repeated runs get distinct groups.
    pub timestamp_group: bool,
    /// Directory receiving `report.json` and `events.jsonl`.
    pub output_dir: PathBuf,
    pub write_events: bool,
    /// Seed for selection and mutation randomness.
    pub rng_seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            group: "robust-pbt".to_string(),
            timestamp_group: true,
            output_dir: PathBuf::from("runs"),
            write_events: true,
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PopulationConfig {
    pub size: usize,
    /// Index of the last trained generation; generation 0 is the first.
    pub generations: u32,
    /// Share of survivors replaced each generation.
    pub bottom_fraction: f64,
    /// Share of survivors eligible as exploit donors.
    pub top_fraction: f64,
    /// Agent id of the defended policy (0 or 1).
    pub main_agent: AgentId,
    /// Train and attack one population per agent instead of `main_agent`
    /// alone.
    pub both_agents: bool,
    /// Sample generation 0 within the mutation bounds and choices instead
    /// of starting every seed from the same values.
    pub randomize_initial: bool,
    pub hyperparameters: Hyperparameters,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            size: 8,
            generations: 5,
            bottom_fraction: 0.2,
            top_fraction: 0.2,
            main_agent: 0,
            both_agents: false,
            randomize_initial: true,
            hyperparameters: Hyperparameters::new(),
        }
    }
}

impl PopulationConfig {
    /// Agents that get their own defended population.
    pub fn defended_agents(&self) -> Vec<AgentId> {
        if self.both_agents {
            vec![0, 1]
        } else {
            vec![self.main_agent]
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamBounds {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MutationConfig {
    /// Numeric parameters are multiplied or divided by a factor drawn from
    /// `[1, max_perturb_factor]`.
    pub max_perturb_factor: f64,
    pub resample_probability: f64,
    pub bounds: BTreeMap<String, ParamBounds>,
    pub choices: BTreeMap<String, Vec<HyperValue>>,
    pub frozen: Vec<String>,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            max_perturb_factor: 1.2,
            resample_probability: 0.25,
            bounds: BTreeMap::new(),
            choices: BTreeMap::new(),
            frozen: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub job_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            job_timeout_secs: 4 * 60 * 60,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    /// Concurrent training jobs.
    pub capacity: usize,
    /// Waiting jobs allowed beyond capacity; unbounded when unset.
    pub queue_limit: Option<usize>,
    /// Time in-flight jobs get to finish after cancellation.
    pub grace_period_secs: u64,
    /// Environment timesteps per training job.
    pub timesteps: u64,
    pub retry: RetryConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            queue_limit: None,
            grace_period_secs: 30,
            timesteps: 1_000_000,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackTarget {
    /// Completed seeds of the last trained generation.
    FinalGeneration,
    /// Every completed seed record of every generation.
    AllSeeds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AttackConfig {
    pub levels: Vec<AttackLevel>,
    /// Independent attacks per (seed, level) pair.
    pub repetitions: u32,
    pub target: AttackTarget,
    pub capacity: usize,
    pub queue_limit: Option<usize>,
    pub grace_period_secs: u64,
    pub timesteps: u64,
    pub retry: RetryConfig,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            levels: vec![2, 4],
            repetitions: 1,
            target: AttackTarget::FinalGeneration,
            capacity: 8,
            queue_limit: None,
            grace_period_secs: 30,
            timesteps: 500_000,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One OS process per job.
    Process,
    /// Deterministic in-process stand-in for dry runs.
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Program and leading arguments; `train` or `attack` is appended.
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Exit codes that signal a retryable failure.
    pub transient_exit_codes: Vec<i32>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Process,
            command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "aprl_defense.worker".to_string(),
            ],
            working_dir: None,
            env: BTreeMap::new(),
            transient_exit_codes: vec![75],
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub run: RunConfig,
    pub population: PopulationConfig,
    pub mutation: MutationConfig,
    pub training: TrainingConfig,
    pub attack: AttackConfig,
    pub backend: BackendConfig,
}

impl Settings {
    /// Load settings from the embedded defaults, optional files and the
    /// environment, then validate them.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from_str(include_str!("../config.toml"), FileFormat::Toml))
            .add_source(File::with_name("robust_pbt").required(false));

        let local = Path::new("robust_pbt.toml");
        if local.exists() {
            check_parameter_case(local)?;
        }
        if let Some(path) = path {
            check_parameter_case(path)?;
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("RPBT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("attack.levels")
                    .with_list_parse_key("backend.command")
                    .with_list_parse_key("backend.transient_exit_codes")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration sources")?;

        let settings: Settings = config
            .try_deserialize()
            .context("Failed to deserialize settings")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse a complete TOML document without layering. Used by tests and
    /// tools that already hold a resolved configuration.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(contents).context("Failed to parse TOML settings")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings for consistency before a run starts.
    pub fn validate(&self) -> Result<(), RunError> {
        let invalid = |msg: String| Err(RunError::InvalidConfig(msg));

        if self.run.group.trim().is_empty() {
            return invalid("run.group cannot be empty".into());
        }

        let pop = &self.population;
        if pop.size < 2 {
            return invalid(format!("population.size must be at least 2, got {}", pop.size));
        }
        if !(0.0..1.0).contains(&pop.bottom_fraction) {
            return invalid(format!("population.bottom_fraction must be in [0, 1), got {}", pop.bottom_fraction));
        }
        if !(pop.top_fraction > 0.0 && pop.top_fraction <= 1.0) {
            return invalid(format!("population.top_fraction must be in (0, 1], got {}", pop.top_fraction));
        }
        if pop.bottom_fraction + pop.top_fraction > 1.0 {
            return invalid("population.bottom_fraction + population.top_fraction cannot exceed 1".into());
        }
        if pop.main_agent > 1 {
            return invalid(format!("population.main_agent must be 0 or 1, got {}", pop.main_agent));
        }

        let mutation = &self.mutation;
        if let Some(name) = parameter_names(self).find(|n| has_uppercase(n)) {
            return invalid(format!("hyperparameter name '{name}' must be lowercase"));
        }
        if !(mutation.max_perturb_factor >= 1.0 && mutation.max_perturb_factor.is_finite()) {
            return invalid("mutation.max_perturb_factor must be a finite number >= 1".into());
        }
        if !(0.0..=1.0).contains(&mutation.resample_probability) {
            return invalid("mutation.resample_probability must be in [0, 1]".into());
        }
        for (name, bounds) in &mutation.bounds {
            let Some(value) = pop.hyperparameters.get(name) else {
                return invalid(format!("mutation.bounds.{name} names an unknown hyperparameter"));
            };
            if value.as_f64().is_none() {
                return invalid(format!("mutation.bounds.{name} applies to a non-numeric hyperparameter"));
            }
            if !(bounds.min.is_finite() && bounds.max.is_finite() && bounds.min <= bounds.max) {
                return invalid(format!("mutation.bounds.{name} must satisfy min <= max"));
            }
        }
        for (name, choices) in &mutation.choices {
            if !pop.hyperparameters.contains_key(name) {
                return invalid(format!("mutation.choices.{name} names an unknown hyperparameter"));
            }
            if choices.is_empty() {
                return invalid(format!("mutation.choices.{name} cannot be empty"));
            }
        }
        if let Some(name) = mutation.frozen.iter().find(|n| !pop.hyperparameters.contains_key(*n)) {
            return invalid(format!("mutation.frozen names an unknown hyperparameter '{name}'"));
        }

        if self.training.capacity == 0 {
            return invalid("training.capacity must be at least 1".into());
        }
        Self::validate_retry("training.retry", &self.training.retry)?;

        let attack = &self.attack;
        if attack.capacity == 0 {
            return invalid("attack.capacity must be at least 1".into());
        }
        if attack.repetitions == 0 {
            return invalid("attack.repetitions must be at least 1".into());
        }
        let mut levels = attack.levels.clone();
        levels.sort_unstable();
        levels.dedup();
        if levels.len() != attack.levels.len() {
            return invalid("attack.levels contains duplicates".into());
        }
        Self::validate_retry("attack.retry", &attack.retry)?;

        if self.backend.kind == BackendKind::Process && self.backend.command.is_empty() {
            return invalid("backend.command is required for the process backend".into());
        }

        Ok(())
    }

    fn validate_retry(section: &str, retry: &RetryConfig) -> Result<(), RunError> {
        if retry.max_attempts == 0 {
            return Err(RunError::InvalidConfig(format!("{section}.max_attempts must be at least 1")));
        }
        if retry.job_timeout_secs == 0 {
            return Err(RunError::InvalidConfig(format!("{section}.job_timeout_secs must be positive")));
        }
        if retry.backoff_base_ms > retry.backoff_max_ms {
            return Err(RunError::InvalidConfig(format!(
                "{section}.backoff_base_ms cannot exceed backoff_max_ms"
            )));
        }
        Ok(())
    }

    /// Run-wide group label threaded through every job and event.
    pub fn resolve_group(&self, now: DateTime<Local>) -> String {
        if self.run.timestamp_group {
            format!("{}-pbt+attack-{}", self.run.group, now.format("%Y-%m-%d-%H-%M-%S"))
        } else {
            self.run.group.clone()
        }
    }

    pub fn training_grace(&self) -> Duration {
        Duration::from_secs(self.training.grace_period_secs)
    }

    pub fn attack_grace(&self) -> Duration {
        Duration::from_secs(self.attack.grace_period_secs)
    }
}

fn parameter_names(settings: &Settings) -> impl Iterator<Item = &String> {
    let mutation = &settings.mutation;
    settings
        .population
        .hyperparameters
        .keys()
        .chain(mutation.bounds.keys())
        .chain(mutation.choices.keys())
        .chain(mutation.frozen.iter())
}

fn has_uppercase(name: &str) -> bool {
    name.chars().any(char::is_uppercase)
}

/// Reject mixed-case hyperparameter names in a TOML file before the layered
/// loader lowercases them.
fn check_parameter_case(path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("Failed to read config file: {:?}", path))?;
    let doc: toml::Table = toml::from_str(&contents).with_context(|| format!("Failed to parse config file: {:?}", path))?;

    let table_keys = |section: &str, key: &str| -> Vec<String> {
        doc.get(section)
            .and_then(|s| s.get(key))
            .and_then(toml::Value::as_table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    };
    let mut names = table_keys("population", "hyperparameters");
    names.extend(table_keys("mutation", "bounds"));
    names.extend(table_keys("mutation", "choices"));
    if let Some(frozen) = doc
        .get("mutation")
        .and_then(|m| m.get("frozen"))
        .and_then(toml::Value::as_array)
    {
        names.extend(frozen.iter().filter_map(toml::Value::as_str).map(str::to_string));
    }

    match names.iter().find(|n| has_uppercase(n)) {
        Some(name) => Err(RunError::InvalidConfig(format!(
            "hyperparameter name '{name}' in {:?} must be lowercase",
            path
        ))
        .into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_settings_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_embedded_defaults_match_default_impl() {
        let from_file: Settings = toml::from_str(include_str!("../config.toml")).unwrap();
        let defaults = Settings::default();
        assert_eq!(from_file.population.size, defaults.population.size);
        assert_eq!(from_file.attack.levels, defaults.attack.levels);
        assert_eq!(from_file.training.retry.max_attempts, defaults.training.retry.max_attempts);
        from_file.validate().unwrap();
    }

    #[test]
    fn test_unknown_field_fails_fast() {
        let err = Settings::from_toml_str(
            r#"
[population]
size = 4
mutation_rate = 0.3
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("mutation_rate"));
    }

    #[test]
    fn test_validation_rejects_bad_fractions() {
        let mut settings = Settings::default();
        settings.population.bottom_fraction = 0.7;
        settings.population.top_fraction = 0.5;
        assert!(matches!(settings.validate(), Err(RunError::InvalidConfig(_))));

        settings.population.top_fraction = 0.0;
        settings.population.bottom_fraction = 0.2;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bounds_for_unknown_parameter() {
        let mut settings = Settings::default();
        settings.population.hyperparameters.insert("lr".into(), HyperValue::Float(3e-4));
        settings
            .mutation
            .bounds
            .insert("entropy_coeff".into(), ParamBounds { min: 0.0, max: 0.1 });
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("entropy_coeff"));
    }

    #[test]
    fn test_mixed_case_parameter_names_are_rejected() {
        let err = Settings::from_toml_str(
            r#"
[population.hyperparameters]
clipParam = 0.2
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("clipParam"));

        let mut settings = Settings::default();
        settings.population.hyperparameters.insert("lr".into(), HyperValue::Float(3e-4));
        settings.mutation.frozen.push("LR".into());
        assert!(matches!(settings.validate(), Err(RunError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_rejects_mixed_case_parameter_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
[population.hyperparameters]
clipParam = 0.2

[mutation.bounds.clipParam]
min = 0.1
max = 0.3

[backend]
kind = "synthetic"
"#,
        )
        .unwrap();

        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("clipParam"));
    }

    #[test]
    fn test_both_agents_defends_each_agent() {
        let mut settings = Settings::default();
        assert_eq!(settings.population.defended_agents(), vec![0]);
        settings.population.main_agent = 1;
        assert_eq!(settings.population.defended_agents(), vec![1]);
        settings.population.both_agents = true;
        assert_eq!(settings.population.defended_agents(), vec![0, 1]);
    }

    #[test]
    fn test_validation_rejects_duplicate_levels() {
        let mut settings = Settings::default();
        settings.attack.levels = vec![2, 4, 2];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_group_label_is_timestamped() {
        let settings = Settings::default();
        let now = Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(settings.resolve_group(now), "robust-pbt-pbt+attack-2024-03-01-12-30-05");

        let mut plain = Settings::default();
        plain.run.timestamp_group = false;
        assert_eq!(plain.resolve_group(now), "robust-pbt");
    }

    #[test]
    fn test_load_layers_user_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
[population]
size = 6
generations = 2

[population.hyperparameters]
lr = 0.0003
activation = "relu"

[mutation.bounds.lr]
min = 0.00001
max = 0.01

[mutation.choices]
activation = ["relu", "tanh"]

[attack]
levels = [1, 3, 5]
target = "all_seeds"

[backend]
kind = "synthetic"
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.population.size, 6);
        assert_eq!(settings.population.generations, 2);
        assert_eq!(settings.attack.levels, vec![1, 3, 5]);
        assert_eq!(settings.attack.target, AttackTarget::AllSeeds);
        assert_eq!(settings.backend.kind, BackendKind::Synthetic);
        assert_eq!(settings.population.hyperparameters["lr"], HyperValue::Float(0.0003));
        assert_eq!(settings.mutation.choices["activation"].len(), 2);
        // untouched keys keep the embedded defaults
        assert_eq!(settings.training.capacity, 4);
    }
}
