//! Worker command line and environment construction.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use trainvisor_core::WorkerSpec;
use trainvisor_state::{RunId, TrainingConfig};

/// Environment variable carrying a checkpoint's resume token.
pub const RESUME_TOKEN_ENV: &str = "TRAINVISOR_RESUME_TOKEN";

/// Environment variable carrying the run id.
pub const RUN_ID_ENV: &str = "TRAINVISOR_RUN_ID";

/// A fully resolved worker invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// The complete environment; nothing else is inherited
    pub env: BTreeMap<String, String>,
}

impl WorkerCommand {
    /// Resolve `worker` for one run, reading passthrough variables from the
    /// process environment.
    pub fn build(
        worker: &WorkerSpec,
        run_id: &RunId,
        config: &TrainingConfig,
        resume_token: Option<&str>,
    ) -> Self {
        Self::build_with(worker, run_id, config, resume_token, |k| std::env::var(k).ok())
    }

    /// Like [`WorkerCommand::build`] with an explicit variable lookup.
    pub fn build_with<F>(
        worker: &WorkerSpec,
        run_id: &RunId,
        config: &TrainingConfig,
        resume_token: Option<&str>,
        lookup: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = BTreeMap::new();
        for key in &worker.env_passthrough {
            if let Some(value) = lookup(key) {
                env.insert(key.clone(), value);
            }
        }
        env.extend(worker.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert(RUN_ID_ENV.to_string(), run_id.to_string());
        if let Some(token) = resume_token {
            env.insert(RESUME_TOKEN_ENV.to_string(), token.to_string());
        }

        let mut args = worker.args.clone();
        args.extend(training_args(run_id, config));

        Self {
            program: worker.program.clone(),
            args,
            env,
        }
    }

    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// A `tokio` command with piped output, a null stdin, a cleared
    /// environment and, on unix, its own process group.
    pub fn to_command(&self) -> Command {
        let mut std_cmd = std::process::Command::new(&self.program);
        std_cmd.args(&self.args).env_clear().envs(&self.env);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = Command::from(std_cmd);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn training_args(run_id: &RunId, config: &TrainingConfig) -> Vec<String> {
    let mut args = vec![
        "--job-id".to_string(),
        run_id.to_string(),
        "--base-model".to_string(),
        config.base_model.display().to_string(),
        "--dataset".to_string(),
        config.dataset.display().to_string(),
        "--output".to_string(),
        config.output_dir.display().to_string(),
        "--epochs".to_string(),
        config.epochs.to_string(),
        "--lr".to_string(),
        config.learning_rate.to_string(),
        "--batch-size".to_string(),
        config.batch_size.to_string(),
    ];
    if let Some(steps) = config.max_steps {
        args.push("--max-steps".to_string());
        args.push(steps.to_string());
    }
    if let Some(seed) = config.seed {
        args.push("--seed".to_string());
        args.push(seed.to_string());
    }
    if !config.use_gpu {
        args.push("--cpu-only".to_string());
    }
    if let Some(checkpoint) = &config.resume_checkpoint {
        args.push("--resume".to_string());
        args.push(checkpoint.clone());
    }
    if let Some(every) = config.checkpoint_interval {
        args.push("--checkpoint-every".to_string());
        args.push(every.to_string());
    }
    args
}

/// Send `signal` (e.g. `TERM`, `KILL`) to the process group led by `pid`.
///
/// Returns whether `kill` reported success.
#[cfg(unix)]
pub(crate) async fn signal_group(pid: u32, signal: &str) -> std::io::Result<bool> {
    let status = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    Ok(status.success())
}

#[cfg(not(unix))]
pub(crate) async fn signal_group(_pid: u32, _signal: &str) -> std::io::Result<bool> {
    Ok(false)
}
