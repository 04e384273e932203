//! Trainvisor - Training Job Orchestrator CLI
//!
//! The `trainvisor` command launches training workers and inspects the runs
//! they produce.
//!
//! ## Commands
//!
//! - `train`: Start a worker and follow it until it exits
//! - `resume`: Start a new run from a stored checkpoint
//! - `runs` / `status`: List runs or show one in detail
//! - `logs` / `metrics`: Show a run's log tail or metric history
//! - `checkpoints`: Save, list, show or delete checkpoints
//! - `delete` / `export`: Remove a run or print the whole state document

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};
use trainvisor_core::{
    analytics, Broadcaster, JobRegistry, OrchestratorConfig, RegistryOptions, StatusEvent,
    METRICS,
};
use trainvisor_state::{
    CheckpointStore, CheckpointTag, FsCheckpointStore, FsStateStore, Job, MetricGoal, Phase,
    RunId, SaveCheckpoint, TrainingConfig,
};
use trainvisor_supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "trainvisor")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Training Job Orchestrator", long_about = None)]
struct Cli {
    /// State directory (runs and checkpoints)
    #[arg(long, global = true, env = "TRAINVISOR_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct WorkerArgs {
    /// Worker executable (overrides TRAINVISOR_WORKER)
    #[arg(long)]
    worker: Option<PathBuf>,

    /// Argument placed before the training flags; repeatable
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    worker_args: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a training run and follow it until the worker exits
    Train {
        /// Base model path
        #[arg(long)]
        base_model: PathBuf,

        /// Dataset path
        #[arg(long)]
        dataset: PathBuf,

        /// Output directory for the trained model
        #[arg(short, long)]
        output: PathBuf,

        /// Human-readable run label
        #[arg(short, long, default_value = "training run")]
        label: String,

        #[arg(long, default_value = "10")]
        epochs: u32,

        #[arg(long = "lr", default_value = "0.0001")]
        learning_rate: f64,

        #[arg(long, default_value = "16")]
        batch_size: u32,

        #[arg(long)]
        max_steps: Option<u64>,

        #[arg(long)]
        seed: Option<u64>,

        /// Ask the worker to save a checkpoint every N steps
        #[arg(long)]
        checkpoint_every: Option<u64>,

        /// Train without a GPU
        #[arg(long)]
        cpu_only: bool,

        /// Continue from a stored checkpoint
        #[arg(long)]
        resume: Option<String>,

        #[command(flatten)]
        worker: WorkerArgs,
    },

    /// Start a new run from a checkpoint, reusing its run's configuration
    Resume {
        /// Checkpoint ID
        checkpoint: String,

        #[arg(short, long, default_value = "resumed run")]
        label: String,

        #[command(flatten)]
        worker: WorkerArgs,
    },

    /// List all runs
    Runs,

    /// Show one run (default: the active run)
    Status {
        run: Option<String>,
    },

    /// Show the tail of a run's log
    Logs {
        run: String,

        /// Number of lines to show
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show a run's metric history
    Metrics {
        run: String,

        /// Print summary statistics instead of samples
        #[arg(long)]
        summary: bool,
    },

    /// Manage checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Delete a run with its metrics, logs and checkpoint links
    Delete {
        run: String,
    },

    /// Print the full state document as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Store a checkpoint payload for a run
    Save {
        #[arg(long)]
        run: String,

        /// Checkpoint ID
        #[arg(long)]
        id: String,

        /// File holding the checkpoint payload
        #[arg(long)]
        file: PathBuf,

        /// latest, best or manual
        #[arg(long, default_value = "latest")]
        tag: String,

        /// Metric justifying a `best` tag
        #[arg(long)]
        metric: Option<f64>,

        /// Higher metric is better (default: lower is better)
        #[arg(long)]
        maximize: bool,

        /// Opaque token handed back to a resumed worker
        #[arg(long)]
        resume_token: Option<String>,
    },

    /// List checkpoints, optionally for one run
    List {
        #[arg(long)]
        run: Option<String>,
    },

    /// Show a checkpoint's metadata
    Show {
        id: String,
    },

    /// Delete a checkpoint
    Delete {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    trainvisor_core::init_tracing(cli.json, level);

    let mut config =
        OrchestratorConfig::from_env().context("Invalid TRAINVISOR_* environment")?;
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }

    let code = match cli.command {
        Commands::Train {
            base_model,
            dataset,
            output,
            label,
            epochs,
            learning_rate,
            batch_size,
            max_steps,
            seed,
            checkpoint_every,
            cpu_only,
            resume,
            worker,
        } => {
            let mut training = TrainingConfig::new(base_model, dataset, output)
                .with_epochs(epochs)
                .with_learning_rate(learning_rate)
                .with_batch_size(batch_size);
            if let Some(steps) = max_steps {
                training = training.with_max_steps(steps);
            }
            if let Some(seed) = seed {
                training = training.with_seed(seed);
            }
            if let Some(every) = checkpoint_every {
                training = training.with_checkpoint_interval(every);
            }
            if cpu_only {
                training = training.cpu_only();
            }
            if let Some(checkpoint) = resume {
                training = training.resume_from(checkpoint);
            }
            apply_worker_args(&mut config, worker);
            cmd_train(&config, Launch::Fresh { label, training }).await?
        }
        Commands::Resume {
            checkpoint,
            label,
            worker,
        } => {
            apply_worker_args(&mut config, worker);
            cmd_train(&config, Launch::FromCheckpoint { checkpoint, label }).await?
        }
        Commands::Runs => {
            cmd_runs(&config).await?;
            0
        }
        Commands::Status { run } => {
            cmd_status(&config, run.as_deref()).await?;
            0
        }
        Commands::Logs { run, limit } => {
            cmd_logs(&config, &run, limit).await?;
            0
        }
        Commands::Metrics { run, summary } => {
            cmd_metrics(&config, &run, summary).await?;
            0
        }
        Commands::Checkpoints { action } => {
            cmd_checkpoints(&config, action).await?;
            0
        }
        Commands::Delete { run } => {
            cmd_delete(&config, &run).await?;
            0
        }
        Commands::Export { output } => {
            cmd_export(&config, output.as_deref()).await?;
            0
        }
    };
    Ok(ExitCode::from(code))
}

fn apply_worker_args(config: &mut OrchestratorConfig, args: WorkerArgs) {
    if let Some(program) = args.worker {
        config.worker.program = program;
        config.worker.args.clear();
    }
    if !args.worker_args.is_empty() {
        config.worker.args = args.worker_args;
    }
}

/// Open the registry. Only the supervising `train` process recovers
/// interrupted runs; inspection commands leave them as found.
async fn open_registry(config: &OrchestratorConfig, supervising: bool) -> Result<Arc<JobRegistry>> {
    let store = FsStateStore::new(&config.state_dir)
        .with_context(|| format!("Failed to open state dir {}", config.state_dir.display()))?;
    let options = RegistryOptions {
        log_capacity: config.log_capacity,
        recover_interrupted: supervising,
        ..RegistryOptions::default()
    };
    let registry = JobRegistry::open(
        Arc::new(store),
        Broadcaster::new(config.broadcast_capacity),
        options,
    )
    .await
    .context("Failed to load run state")?;
    Ok(Arc::new(registry))
}

fn open_checkpoints(config: &OrchestratorConfig) -> Result<FsCheckpointStore> {
    let dir = config.checkpoint_dir();
    FsCheckpointStore::new(&dir)
        .with_context(|| format!("Failed to open checkpoint dir {}", dir.display()))
}

fn find_run(registry: &JobRegistry, run: &str) -> Result<Job> {
    registry
        .get_run(&RunId::from(run))
        .with_context(|| format!("Run not found: {run}"))
}

/// Process exit code for a finished run.
fn exit_code_for(job: &Job) -> u8 {
    match job.phase {
        Phase::Completed => 0,
        Phase::Error => match job.exit_code {
            Some(code) if (1..=255).contains(&code) => code as u8,
            _ => 1,
        },
        _ => 1,
    }
}

enum Launch {
    Fresh {
        label: String,
        training: TrainingConfig,
    },
    FromCheckpoint {
        checkpoint: String,
        label: String,
    },
}

/// Start a worker, stream its progress and wait for it to exit.
async fn cmd_train(config: &OrchestratorConfig, launch: Launch) -> Result<u8> {
    let registry = open_registry(config, true).await?;
    let checkpoints = Arc::new(open_checkpoints(config)?);
    let supervisor = Supervisor::new(registry.clone(), checkpoints, config);

    let mut events = registry.broadcaster().subscribe();
    let job = match launch {
        Launch::Fresh { label, training } => supervisor.start_job(label, training).await?,
        Launch::FromCheckpoint { checkpoint, label } => {
            supervisor.resume_from_checkpoint(&checkpoint, label).await?
        }
    };
    if job.phase == Phase::Error {
        registry.flush().await;
        bail!(
            "{}",
            job.error.as_deref().unwrap_or("worker failed to start")
        );
    }
    println!("Started run {} ({})", job.id, job.label);

    let heartbeat_source = registry.clone();
    let _heartbeat = registry
        .broadcaster()
        .spawn_heartbeat(config.heartbeat_interval, move || {
            heartbeat_source.get_current_run()
        });

    let wait = supervisor.wait(&job.id);
    tokio::pin!(wait);
    let mut cancelled = false;
    let mut last_phase = job.phase;
    let finished = loop {
        tokio::select! {
            result = &mut wait => break result?,
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                cancelled = true;
                warn!(run_id = %job.id, "Interrupted; stopping worker");
                if let Err(e) = supervisor.cancel_job(&job.id).await {
                    warn!(run_id = %job.id, error = %e, "Cancel failed");
                }
            }
            Some(event) = events.recv() => print_event(&job.id, &event, &mut last_phase),
        }
    };

    supervisor.shutdown().await;
    METRICS.flush();
    match finished.phase {
        Phase::Completed => println!("Run {} completed", finished.id),
        Phase::Stopped => println!("Run {} stopped", finished.id),
        _ => println!(
            "Run {} failed: {}",
            finished.id,
            finished.error.as_deref().unwrap_or("unknown error")
        ),
    }
    Ok(exit_code_for(&finished))
}

fn print_event(run_id: &RunId, event: &StatusEvent, last_phase: &mut Phase) {
    match event {
        StatusEvent::Status(job) if &job.id == run_id && job.phase != *last_phase => {
            *last_phase = job.phase;
            println!("[{}] {}", job.phase, job.phase_label);
        }
        StatusEvent::Metric(sample) if &sample.run_id == run_id => {
            let mut line = format!(
                "epoch {} step {} loss {:.4}",
                sample.epoch, sample.step, sample.loss
            );
            if let Some(acc) = sample.accuracy {
                line.push_str(&format!(" acc {acc:.4}"));
            }
            println!("{line}");
        }
        StatusEvent::Heartbeat(job) if &job.id == run_id => {
            info!(run_id = %job.id, progress = job.progress, phase = %job.phase, "Heartbeat");
        }
        StatusEvent::Checkpoint(ckpt) if &ckpt.run_id == run_id => {
            println!("checkpoint {} ({})", ckpt.id, ckpt.tag);
        }
        StatusEvent::Error { message, .. } => warn!("{message}"),
        _ => {}
    }
}

async fn cmd_runs(config: &OrchestratorConfig) -> Result<()> {
    let registry = open_registry(config, false).await?;
    let runs = registry.list_runs();
    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }
    for job in runs {
        println!(
            "{}  {:<10} {:>3}%  {}  {}",
            job.id,
            job.phase.as_str(),
            job.progress,
            job.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            job.label
        );
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    run: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    eta: Option<analytics::Eta>,
}

async fn cmd_status(config: &OrchestratorConfig, run: Option<&str>) -> Result<()> {
    let registry = open_registry(config, false).await?;
    let job = match run {
        Some(run) => find_run(&registry, run)?,
        None => match registry.get_current_run() {
            Some(job) => job,
            None => {
                println!("No active training run.");
                return Ok(());
            }
        },
    };
    let eta = if job.is_terminal() {
        None
    } else {
        let samples = registry.get_metrics(&job.id)?;
        analytics::eta(&samples, job.target_epochs, chrono::Utc::now())
    };
    let report = StatusReport { run: job, eta };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_logs(config: &OrchestratorConfig, run: &str, limit: Option<usize>) -> Result<()> {
    let registry = open_registry(config, false).await?;
    let job = find_run(&registry, run)?;
    for line in registry.get_logs(&job.id, limit)? {
        println!("{} {}", line.timestamp.format("%H:%M:%S"), line.text);
    }
    Ok(())
}

async fn cmd_metrics(config: &OrchestratorConfig, run: &str, summary: bool) -> Result<()> {
    let registry = open_registry(config, false).await?;
    let job = find_run(&registry, run)?;
    let samples = registry.get_metrics(&job.id)?;
    if summary {
        match analytics::summarize(&samples) {
            Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
            None => println!("No metrics recorded for {}", job.id),
        }
        return Ok(());
    }
    for sample in samples {
        println!("{}", serde_json::to_string(&sample)?);
    }
    Ok(())
}

fn parse_tag(tag: &str) -> Result<CheckpointTag> {
    match tag.to_ascii_lowercase().as_str() {
        "latest" => Ok(CheckpointTag::Latest),
        "best" => Ok(CheckpointTag::Best),
        "manual" => Ok(CheckpointTag::Manual),
        other => bail!("Unknown checkpoint tag '{other}' (expected latest, best or manual)"),
    }
}

async fn cmd_checkpoints(config: &OrchestratorConfig, action: CheckpointAction) -> Result<()> {
    match action {
        CheckpointAction::Save {
            run,
            id,
            file,
            tag,
            metric,
            maximize,
            resume_token,
        } => {
            let registry = open_registry(config, false).await?;
            let supervisor =
                Supervisor::new(registry.clone(), Arc::new(open_checkpoints(config)?), config);
            let job = find_run(&registry, &run)?;
            let payload = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let mut request = SaveCheckpoint::new(job.id, id, payload).with_tag(parse_tag(&tag)?);
            if let Some(metric) = metric {
                request = request.with_metric(metric);
            }
            if maximize {
                request = request.with_goal(MetricGoal::Maximize);
            }
            if let Some(token) = resume_token {
                request = request.with_resume_token(token);
            }
            let record = supervisor.save_checkpoint(request).await?;
            registry.flush().await;
            println!("Saved checkpoint {} as {}", record.id, record.tag);
        }
        CheckpointAction::List { run } => {
            let store = open_checkpoints(config)?;
            let run_id = run.map(RunId::from);
            let infos = store.list_checkpoints(run_id.as_ref()).await?;
            if infos.is_empty() {
                println!("No checkpoints found.");
            }
            for info in infos {
                let metric = info
                    .metric
                    .map(|m| format!("{m:.4}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {}  {:<7} {:>8}  {}",
                    info.id,
                    info.run_id,
                    info.tag.as_str(),
                    metric,
                    info.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        CheckpointAction::Show { id } => {
            let store = open_checkpoints(config)?;
            let record = store.load_checkpoint(&id).await?;
            println!("{}", serde_json::to_string_pretty(&record.info())?);
        }
        CheckpointAction::Delete { id } => {
            let store = open_checkpoints(config)?;
            store.delete_checkpoint(&id).await?;
            println!("Deleted checkpoint {id}");
        }
    }
    Ok(())
}

async fn cmd_delete(config: &OrchestratorConfig, run: &str) -> Result<()> {
    let registry = open_registry(config, false).await?;
    let job = find_run(&registry, run)?;
    if !job.is_terminal() && job.phase != Phase::Idle {
        bail!("Run {} is {}; stop it before deleting", job.id, job.phase);
    }
    registry.delete_run(&job.id)?;
    registry.flush().await;
    println!("Deleted run {}", job.id);
    Ok(())
}

async fn cmd_export(config: &OrchestratorConfig, output: Option<&Path>) -> Result<()> {
    let registry = open_registry(config, false).await?;
    let json = serde_json::to_string_pretty(&registry.snapshot())?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Exported state to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trainvisor_core::WorkerSpec;

    fn fixture() -> (tempfile::TempDir, OrchestratorConfig) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("base.bin"), b"w").unwrap();
        std::fs::write(dir.path().join("data.jsonl"), b"{}\n").unwrap();
        let config = OrchestratorConfig::new(dir.path().join("state")).with_worker(
            WorkerSpec::new("/bin/sh").with_args([
                "-c",
                "echo 'Training'; echo 'Epoch 1/1 Step 1/1'; echo 'loss: 0.25'; exit ${EXIT:-0}",
                "worker",
            ]),
        );
        (dir, config)
    }

    fn training(dir: &Path) -> TrainingConfig {
        TrainingConfig::new(dir.join("base.bin"), dir.join("data.jsonl"), dir.join("out"))
            .with_epochs(1)
    }

    #[test]
    fn cli_parses_train_flags() {
        let cli = Cli::try_parse_from([
            "trainvisor",
            "--state-dir",
            "/tmp/s",
            "train",
            "--base-model",
            "m",
            "--dataset",
            "d",
            "-o",
            "out",
            "--lr",
            "0.01",
            "--cpu-only",
            "--worker-arg",
            "-u",
            "--worker-arg",
            "train.py",
        ])
        .unwrap();
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/s")));
        match cli.command {
            Commands::Train {
                learning_rate,
                cpu_only,
                epochs,
                worker,
                ..
            } => {
                assert_eq!(learning_rate, 0.01);
                assert!(cpu_only);
                assert_eq!(epochs, 10);
                assert_eq!(worker.worker_args, vec!["-u", "train.py"]);
            }
            _ => panic!("expected train"),
        }
    }

    #[test]
    fn exit_codes_follow_final_phase() {
        let mut job = Job::new(RunId::from("r"), "x", TrainingConfig::new("m", "d", "o"));
        job.phase = Phase::Completed;
        assert_eq!(exit_code_for(&job), 0);
        job.phase = Phase::Error;
        job.exit_code = Some(7);
        assert_eq!(exit_code_for(&job), 7);
        job.exit_code = None;
        assert_eq!(exit_code_for(&job), 1);
        job.phase = Phase::Stopped;
        assert_eq!(exit_code_for(&job), 1);
    }

    #[test]
    fn worker_flag_replaces_prefix_args() {
        let mut config = OrchestratorConfig::default();
        apply_worker_args(
            &mut config,
            WorkerArgs {
                worker: Some(PathBuf::from("/opt/trainer")),
                worker_args: Vec::new(),
            },
        );
        assert_eq!(config.worker.program, PathBuf::from("/opt/trainer"));
        assert!(config.worker.args.is_empty());
    }

    #[tokio::test]
    async fn train_then_inspect() {
        let (dir, config) = fixture();
        let code = cmd_train(
            &config,
            Launch::Fresh {
                label: "cli".to_string(),
                training: training(dir.path()),
            },
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let registry = open_registry(&config, false).await.unwrap();
        let runs = registry.list_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].phase, Phase::Completed);
        assert_eq!(registry.get_metrics(&runs[0].id).unwrap()[0].loss, 0.25);

        let out = dir.path().join("export.json");
        cmd_export(&config, Some(&out)).await.unwrap();
        let exported: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert!(exported["runs"][runs[0].id.as_str()].is_object());

        cmd_delete(&config, runs[0].id.as_str()).await.unwrap();
        let registry = open_registry(&config, false).await.unwrap();
        assert!(registry.list_runs().is_empty());
    }

    #[tokio::test]
    async fn failed_worker_forwards_exit_code() {
        let (dir, mut config) = fixture();
        config.worker = config.worker.with_env("EXIT", "4");
        let code = cmd_train(
            &config,
            Launch::Fresh {
                label: "fails".to_string(),
                training: training(dir.path()),
            },
        )
        .await
        .unwrap();
        assert_eq!(code, 4);
    }

    #[tokio::test]
    async fn missing_dataset_is_an_error() {
        let (dir, config) = fixture();
        let mut bad = training(dir.path());
        bad.dataset = dir.path().join("nope.jsonl");
        let result = cmd_train(
            &config,
            Launch::Fresh {
                label: "bad".to_string(),
                training: bad,
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn checkpoint_save_and_resume() {
        let (dir, config) = fixture();
        cmd_train(
            &config,
            Launch::Fresh {
                label: "first".to_string(),
                training: training(dir.path()),
            },
        )
        .await
        .unwrap();
        let run = open_registry(&config, false).await.unwrap().list_runs()[0]
            .id
            .clone();

        let payload = dir.path().join("ckpt.bin");
        std::fs::write(&payload, b"weights-v1").unwrap();
        cmd_checkpoints(
            &config,
            CheckpointAction::Save {
                run: run.to_string(),
                id: "ckpt-1".to_string(),
                file: payload,
                tag: "best".to_string(),
                metric: Some(0.25),
                maximize: false,
                resume_token: Some("tok".to_string()),
            },
        )
        .await
        .unwrap();

        let registry = open_registry(&config, false).await.unwrap();
        assert_eq!(registry.get_run(&run).unwrap().best_metric, Some(0.25));

        let code = cmd_train(
            &config,
            Launch::FromCheckpoint {
                checkpoint: "ckpt-1".to_string(),
                label: "second".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
        let runs = open_registry(&config, false).await.unwrap().list_runs();
        assert_eq!(runs.len(), 2);
        assert!(runs
            .iter()
            .any(|r| r.config.resume_checkpoint.as_deref() == Some("ckpt-1")));
    }

    #[test]
    fn tags_parse_case_insensitively() {
        assert_eq!(parse_tag("BEST").unwrap(), CheckpointTag::Best);
        assert!(parse_tag("golden").is_err());
    }
}
