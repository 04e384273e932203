//! Orchestrator configuration and training-config validation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trainvisor_state::{is_path_safe, TrainingConfig};

use crate::error::ConfigError;

/// Default number of log lines retained per run.
pub const DEFAULT_LOG_CAPACITY: usize = 2000;
/// Default number of log lines returned by a log query.
pub const DEFAULT_LOG_TAIL: usize = 200;
/// Default delay between SIGTERM and a forced kill.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(10);
/// Default heartbeat period of the status stream.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(2);
/// Default buffer size of the status stream.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Environment variables a worker inherits from the orchestrator.
pub const DEFAULT_ENV_PASSTHROUGH: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TMPDIR",
    "PYTHONPATH",
    "VIRTUAL_ENV",
    "CUDA_VISIBLE_DEVICES",
];

/// How to launch the external worker program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Executable to run
    pub program: PathBuf,
    /// Arguments placed before the generated training flags
    pub args: Vec<String>,
    /// Variables inherited from the orchestrator's environment, when set
    pub env_passthrough: Vec<String>,
    /// Extra variables set for every worker
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerSpec {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("TRAINVISOR_MODE".to_string(), "training".to_string());
        Self {
            program: PathBuf::from("python3"),
            args: vec!["scripts/train_worker.py".to_string()],
            env_passthrough: DEFAULT_ENV_PASSTHROUGH
                .iter()
                .map(|s| s.to_string())
                .collect(),
            env,
        }
    }
}

impl WorkerSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Settings shared by the registry, supervisor and status stream.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Directory holding per-run state documents
    pub state_dir: PathBuf,
    /// Checkpoint directory; `<state_dir>/checkpoints` when unset
    pub checkpoint_dir: Option<PathBuf>,
    pub worker: WorkerSpec,
    pub log_capacity: usize,
    pub cancel_grace: Duration,
    pub heartbeat_interval: Duration,
    pub broadcast_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".trainvisor"),
            checkpoint_dir: None,
            worker: WorkerSpec::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Create from environment variables
    ///
    /// Reads (all optional):
    /// - TRAINVISOR_STATE_DIR
    /// - TRAINVISOR_CHECKPOINT_DIR
    /// - TRAINVISOR_WORKER (worker executable)
    /// - TRAINVISOR_WORKER_ARGS (whitespace-separated prefix arguments)
    /// - TRAINVISOR_LOG_CAPACITY
    /// - TRAINVISOR_CANCEL_GRACE_SECS
    /// - TRAINVISOR_HEARTBEAT_SECS
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(dir) = lookup("TRAINVISOR_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("TRAINVISOR_CHECKPOINT_DIR") {
            config.checkpoint_dir = Some(PathBuf::from(dir));
        }
        if let Some(program) = lookup("TRAINVISOR_WORKER") {
            config.worker.program = PathBuf::from(program);
            config.worker.args.clear();
        }
        if let Some(args) = lookup("TRAINVISOR_WORKER_ARGS") {
            config.worker.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = lookup("TRAINVISOR_LOG_CAPACITY") {
            config.log_capacity = parse_env("TRAINVISOR_LOG_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("TRAINVISOR_CANCEL_GRACE_SECS") {
            config.cancel_grace =
                Duration::from_secs(parse_env("TRAINVISOR_CANCEL_GRACE_SECS", &v)?);
        }
        if let Some(v) = lookup("TRAINVISOR_HEARTBEAT_SECS") {
            config.heartbeat_interval =
                Duration::from_secs(parse_env("TRAINVISOR_HEARTBEAT_SECS", &v)?);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn with_worker(mut self, worker: WorkerSpec) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Resolved checkpoint directory.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("checkpoints"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("state_dir", "must not be empty"));
        }
        if self.worker.program.as_os_str().is_empty() {
            return Err(ConfigError::invalid("worker.program", "must not be empty"));
        }
        if self.log_capacity == 0 {
            return Err(ConfigError::invalid("log_capacity", "must be at least 1"));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::invalid(
                "broadcast_capacity",
                "must be at least 1",
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::invalid(
                "heartbeat_interval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var: var.to_string(),
        reason: format!("{value:?}: {e}"),
    })
}

fn require_path(field: &str, path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    if !path.exists() {
        return Err(ConfigError::MissingPath {
            field: field.to_string(),
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Check a training configuration before a worker is spawned for it.
pub fn validate_training(config: &TrainingConfig) -> Result<(), ConfigError> {
    require_path("base_model", &config.base_model)?;
    require_path("dataset", &config.dataset)?;
    if config.output_dir.as_os_str().is_empty() {
        return Err(ConfigError::invalid("output_dir", "must not be empty"));
    }
    if config.epochs == 0 {
        return Err(ConfigError::invalid("epochs", "must be at least 1"));
    }
    if config.batch_size == 0 {
        return Err(ConfigError::invalid("batch_size", "must be at least 1"));
    }
    if !config.learning_rate.is_finite() || config.learning_rate <= 0.0 {
        return Err(ConfigError::invalid(
            "learning_rate",
            format!("must be a positive number, got {}", config.learning_rate),
        ));
    }
    if config.max_steps == Some(0) {
        return Err(ConfigError::invalid("max_steps", "must be at least 1"));
    }
    if config.checkpoint_interval == Some(0) {
        return Err(ConfigError::invalid(
            "checkpoint_interval",
            "must be at least 1",
        ));
    }
    if let Some(id) = &config.resume_checkpoint {
        if !is_path_safe(id) {
            return Err(ConfigError::invalid(
                "resume_checkpoint",
                format!("{id:?} is not a valid checkpoint id"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    fn inputs() -> (tempfile::TempDir, TrainingConfig) {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model");
        let data = dir.path().join("data.jsonl");
        std::fs::create_dir(&model).unwrap();
        std::fs::write(&data, b"{}\n").unwrap();
        let config = TrainingConfig::new(model, data, dir.path().join("out"));
        (dir, config)
    }

    #[test]
    fn defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.log_capacity, 2000);
        assert_eq!(config.cancel_grace, Duration::from_secs(10));
        assert_eq!(config.checkpoint_dir(), PathBuf::from(".trainvisor/checkpoints"));
        assert_eq!(
            config.worker.env.get("TRAINVISOR_MODE").map(String::as_str),
            Some("training")
        );
        config.validate().unwrap();
    }

    #[test]
    fn from_lookup_reads_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("TRAINVISOR_STATE_DIR", "/var/lib/tv"),
            ("TRAINVISOR_WORKER", "/usr/bin/trainer"),
            ("TRAINVISOR_WORKER_ARGS", "-u  run.py"),
            ("TRAINVISOR_LOG_CAPACITY", "50"),
            ("TRAINVISOR_CANCEL_GRACE_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/tv"));
        assert_eq!(config.worker.program, PathBuf::from("/usr/bin/trainer"));
        assert_eq!(config.worker.args, vec!["-u", "run.py"]);
        assert_eq!(config.log_capacity, 50);
        assert_eq!(config.cancel_grace, Duration::from_secs(3));
    }

    #[test]
    fn from_lookup_rejects_garbage() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("TRAINVISOR_LOG_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));

        let err = OrchestratorConfig::from_lookup(lookup(&[("TRAINVISOR_LOG_CAPACITY", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn training_config_accepts_valid_inputs() {
        let (_dir, config) = inputs();
        validate_training(&config).unwrap();
    }

    #[test]
    fn training_config_rejects_missing_dataset() {
        let (dir, mut config) = inputs();
        config.dataset = dir.path().join("missing.jsonl");
        let err = validate_training(&config).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPath { ref field, .. } if field == "dataset"));
    }

    #[test]
    fn training_config_rejects_bad_numbers() {
        let (_dir, config) = inputs();
        for bad in [
            config.clone().with_epochs(0),
            config.clone().with_batch_size(0),
            config.clone().with_learning_rate(0.0),
            config.clone().with_learning_rate(f64::NAN),
            config.clone().with_max_steps(0),
            config.clone().with_checkpoint_interval(0),
            config.clone().resume_from("../../etc/passwd"),
        ] {
            assert!(
                matches!(validate_training(&bad), Err(ConfigError::Invalid { .. })),
                "{bad:?}"
            );
        }
    }
}
