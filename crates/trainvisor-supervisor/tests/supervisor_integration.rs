//! End-to-end supervision with `/bin/sh` scripts standing in for workers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use regex::Captures;
use trainvisor_core::{
    Broadcaster, Extracted, JobRegistry, LogParser, OrchestratorConfig, ParseRule,
    RegistryOptions, StatusEvent, WorkerSpec,
};
use trainvisor_state::fakes::{MemoryCheckpointStore, MemoryStateStore};
use trainvisor_state::{
    CheckpointStore, CheckpointTag, Job, LogStream, Phase, RunId, SaveCheckpoint, TrainingConfig,
};
use trainvisor_supervisor::{Supervisor, SupervisorError};

struct Fixture {
    dir: TempDir,
    supervisor: Supervisor,
    checkpoints: Arc<MemoryCheckpointStore>,
}

fn sh(script: &str) -> WorkerSpec {
    WorkerSpec::new("/bin/sh").with_args(["-c", script, "worker"])
}

fn fixture(worker: WorkerSpec) -> Fixture {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("base.bin"), b"weights").unwrap();
    std::fs::write(dir.path().join("data.jsonl"), b"{}\n").unwrap();

    let config = OrchestratorConfig::new(dir.path().join("state"))
        .with_worker(worker)
        .with_cancel_grace(Duration::from_millis(300));
    let registry = Arc::new(JobRegistry::new(
        Arc::new(MemoryStateStore::new()),
        Broadcaster::new(1024),
        RegistryOptions::default(),
    ));
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let supervisor = Supervisor::new(registry, checkpoints.clone(), &config);
    Fixture {
        dir,
        supervisor,
        checkpoints,
    }
}

fn training_config(dir: &Path) -> TrainingConfig {
    TrainingConfig::new(dir.join("base.bin"), dir.join("data.jsonl"), dir.join("out"))
        .with_epochs(2)
}

fn log_texts(sup: &Supervisor, id: &RunId) -> Vec<String> {
    sup.registry()
        .get_logs(id, Some(1000))
        .unwrap()
        .into_iter()
        .map(|l| l.text)
        .collect()
}

async fn wait_for_log(sup: &Supervisor, id: &RunId, needle: &str) {
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if log_texts(sup, id).iter().any(|l| l.contains(needle)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(found.is_ok(), "log line {needle:?} never appeared");
}

async fn wait_final(sup: &Supervisor, id: &RunId) -> Job {
    tokio::time::timeout(Duration::from_secs(15), sup.wait(id))
        .await
        .expect("worker did not finish in time")
        .unwrap()
}

const HAPPY: &str = r#"
echo "Preparing dataset"
echo "Training started"
echo "Epoch 1/2 Step 5/10"
echo "loss: 0.9"
echo "disk is slow" >&2
echo "Epoch 2/2 Step 10/10"
printf "loss: 0.4"
"#;

#[tokio::test]
async fn successful_run_completes_with_metrics() {
    let fx = fixture(sh(HAPPY));
    let started = fx
        .supervisor
        .start_job("happy", training_config(fx.dir.path()))
        .await
        .unwrap();
    assert_eq!(started.phase, Phase::Preparing);
    assert!(started.started_at.is_some());

    let job = wait_final(&fx.supervisor, &started.id).await;
    assert_eq!(job.phase, Phase::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.exit_code, Some(0));
    assert_eq!(job.target_epochs, 2);
    assert!(job.finished_at.is_some());
    assert!(!fx.supervisor.is_live(&job.id));

    let losses: Vec<f64> = fx
        .supervisor
        .registry()
        .get_metrics(&job.id)
        .unwrap()
        .iter()
        .map(|m| m.loss)
        .collect();
    assert_eq!(losses, vec![0.9, 0.4]);

    let logs = fx.supervisor.registry().get_logs(&job.id, None).unwrap();
    let stderr: Vec<_> = logs
        .iter()
        .filter(|l| l.stream == LogStream::Stderr)
        .map(|l| l.text.as_str())
        .collect();
    assert_eq!(stderr, vec!["[ERROR] disk is slow"]);
    let stdout: Vec<_> = logs
        .iter()
        .filter(|l| l.stream == LogStream::Stdout)
        .map(|l| l.text.as_str())
        .collect();
    assert_eq!(stdout.first(), Some(&"Preparing dataset"));
    assert_eq!(stdout.last(), Some(&"loss: 0.4"));
}

#[tokio::test]
async fn nonzero_exit_marks_run_failed() {
    let fx = fixture(sh(
        "echo 'Epoch 1/3 Step 1/10'; echo 'CUDA out of memory' >&2; exit 3",
    ));
    let started = fx
        .supervisor
        .start_job("oom", training_config(fx.dir.path()))
        .await
        .unwrap();
    let job = wait_final(&fx.supervisor, &started.id).await;

    assert_eq!(job.phase, Phase::Error);
    assert_eq!(job.exit_code, Some(3));
    assert_eq!(job.error.as_deref(), Some("worker exited with code 3"));
    assert!(log_texts(&fx.supervisor, &job.id).contains(&"[ERROR] CUDA out of memory".to_string()));
}

#[tokio::test]
async fn missing_executable_fails_without_preparing() {
    let fx = fixture(WorkerSpec::new("/nonexistent/trainer"));
    let job = fx
        .supervisor
        .start_job("ghost", training_config(fx.dir.path()))
        .await
        .unwrap();

    assert_eq!(job.phase, Phase::Error);
    assert!(job.error.as_deref().is_some_and(|e| !e.is_empty()));
    assert!(job.started_at.is_none());
    assert!(!fx.supervisor.is_live(&job.id));
    assert!(fx.supervisor.live_jobs().is_empty());
    let runs = fx.supervisor.registry().list_runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].phase, Phase::Error);
    assert!(matches!(
        fx.supervisor.cancel_job(&job.id).await,
        Err(SupervisorError::AlreadyFinished(_))
    ));
}

#[tokio::test]
async fn invalid_config_never_creates_a_run() {
    let fx = fixture(sh("exit 0"));
    let mut config = training_config(fx.dir.path());
    config.dataset = fx.dir.path().join("missing.jsonl");

    let err = fx.supervisor.start_job("bad", config).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Config(_)));
    assert!(fx.supervisor.registry().list_runs().is_empty());
    assert!(fx.supervisor.live_jobs().is_empty());

    let zero_epochs = training_config(fx.dir.path()).with_epochs(0);
    assert!(fx.supervisor.start_job("bad", zero_epochs).await.is_err());
    assert!(fx.supervisor.registry().list_runs().is_empty());
}

#[tokio::test]
async fn cancel_stops_run_and_releases_handle() {
    let fx = fixture(sh("echo 'Training'; exec sleep 30"));
    let started = fx
        .supervisor
        .start_job("long", training_config(fx.dir.path()))
        .await
        .unwrap();
    wait_for_log(&fx.supervisor, &started.id, "Training").await;

    let stopped = fx.supervisor.cancel_job(&started.id).await.unwrap();
    assert_eq!(stopped.phase, Phase::Stopped);

    let job = wait_final(&fx.supervisor, &started.id).await;
    assert_eq!(job.phase, Phase::Stopped);
    assert!(!fx.supervisor.is_live(&job.id));
    assert!(fx.supervisor.live_jobs().is_empty());

    assert!(matches!(
        fx.supervisor.cancel_job(&job.id).await,
        Err(SupervisorError::AlreadyFinished(_))
    ));
    let unknown = fx.supervisor.cancel_job(&RunId::from("nope")).await;
    assert!(matches!(unknown, Err(SupervisorError::NotFound(_))));
}

#[tokio::test]
async fn cancel_escalates_when_worker_ignores_sigterm() {
    let fx = fixture(sh(
        "trap '' TERM; echo ready; while true; do sleep 0.1; done",
    ));
    let started = fx
        .supervisor
        .start_job("stubborn", training_config(fx.dir.path()))
        .await
        .unwrap();
    wait_for_log(&fx.supervisor, &started.id, "ready").await;

    fx.supervisor.cancel_job(&started.id).await.unwrap();
    let job = wait_final(&fx.supervisor, &started.id).await;
    assert_eq!(job.phase, Phase::Stopped);
    assert!(!fx.supervisor.is_live(&job.id));
}

#[tokio::test]
async fn pause_is_bookkeeping_only() {
    let fx = fixture(sh(
        "echo 'Training'; sleep 0.5; echo 'Evaluating'; exec sleep 30",
    ));
    let started = fx
        .supervisor
        .start_job("pausable", training_config(fx.dir.path()))
        .await
        .unwrap();
    wait_for_log(&fx.supervisor, &started.id, "Training").await;

    let paused = fx.supervisor.pause_job(&started.id).unwrap();
    assert_eq!(paused.phase, Phase::Paused);
    assert_eq!(paused.paused_from, Some(Phase::Training));

    // The worker keeps running; a phase keyword while paused moves the resume target.
    wait_for_log(&fx.supervisor, &started.id, "Evaluating").await;
    let resumed = fx.supervisor.resume_job(&started.id).unwrap();
    assert_eq!(resumed.phase, Phase::Evaluating);

    fx.supervisor.cancel_job(&started.id).await.unwrap();
    let job = wait_final(&fx.supervisor, &started.id).await;
    assert!(matches!(
        fx.supervisor.pause_job(&job.id),
        Err(SupervisorError::AlreadyFinished(_))
    ));
}

#[tokio::test]
async fn checkpoint_resume_passes_token_to_new_worker() {
    let fx = fixture(sh(r#"echo "token=$TRAINVISOR_RESUME_TOKEN args=$*""#));
    let first = fx
        .supervisor
        .start_job("first", training_config(fx.dir.path()))
        .await
        .unwrap();
    wait_final(&fx.supervisor, &first.id).await;

    let record = fx
        .supervisor
        .save_checkpoint(
            SaveCheckpoint::new(first.id.clone(), "ckpt-1", b"state".to_vec())
                .with_tag(CheckpointTag::Best)
                .with_metric(0.4)
                .with_resume_token("tok-123"),
        )
        .await
        .unwrap();
    assert_eq!(record.tag, CheckpointTag::Best);

    let first_job = fx.supervisor.registry().get_run(&first.id).unwrap();
    assert_eq!(first_job.best_metric, Some(0.4));
    assert_eq!(first_job.last_checkpoint.as_deref(), Some("ckpt-1"));
    assert_eq!(
        fx.supervisor.registry().get_checkpoints(&first.id).unwrap(),
        vec!["ckpt-1"]
    );

    let resumed = fx
        .supervisor
        .resume_from_checkpoint("ckpt-1", "second")
        .await
        .unwrap();
    assert_eq!(resumed.config.resume_checkpoint.as_deref(), Some("ckpt-1"));
    let job = wait_final(&fx.supervisor, &resumed.id).await;
    assert_eq!(job.phase, Phase::Completed);

    let logs = log_texts(&fx.supervisor, &job.id);
    assert!(logs[0].starts_with("token=tok-123 "), "got {logs:?}");
    assert!(logs[0].contains("--resume ckpt-1"));
}

#[tokio::test]
async fn checkpoint_for_unknown_run_is_rejected() {
    let fx = fixture(sh("exit 0"));
    let err = fx
        .supervisor
        .save_checkpoint(SaveCheckpoint::new(RunId::from("ghost"), "c", vec![1]))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(fx
        .checkpoints
        .list_checkpoints(None)
        .await
        .unwrap()
        .is_empty());

    let missing = fx.supervisor.resume_from_checkpoint("nope", "x").await;
    assert!(missing.unwrap_err().is_not_found());
}

#[tokio::test]
async fn status_stream_reports_lifecycle() {
    let fx = fixture(sh(HAPPY));
    let mut sub = fx.supervisor.registry().broadcaster().subscribe();
    let started = fx
        .supervisor
        .start_job("observed", training_config(fx.dir.path()))
        .await
        .unwrap();
    wait_final(&fx.supervisor, &started.id).await;

    let mut phases = Vec::new();
    let mut metrics = 0;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), sub.recv()).await
    {
        match event {
            StatusEvent::Status(job) => {
                if phases.last() != Some(&job.phase) {
                    phases.push(job.phase);
                }
            }
            StatusEvent::Metric(_) => metrics += 1,
            _ => {}
        }
    }
    assert_eq!(metrics, 2);
    assert_eq!(phases.first(), Some(&Phase::Idle));
    assert_eq!(phases.last(), Some(&Phase::Completed));
    assert!(phases.contains(&Phase::Training));
}

#[tokio::test]
async fn shutdown_stops_all_live_workers() {
    let fx = fixture(sh("echo 'Training'; exec sleep 30"));
    let a = fx
        .supervisor
        .start_job("a", training_config(fx.dir.path()))
        .await
        .unwrap();
    let b = fx
        .supervisor
        .start_job("b", training_config(fx.dir.path()))
        .await
        .unwrap();
    assert_eq!(fx.supervisor.live_jobs().len(), 2);

    tokio::time::timeout(Duration::from_secs(15), fx.supervisor.shutdown())
        .await
        .unwrap();
    for id in [&a.id, &b.id] {
        assert_eq!(
            fx.supervisor.registry().get_run(id).unwrap().phase,
            Phase::Stopped
        );
    }
    assert!(fx.supervisor.live_jobs().is_empty());
}

#[tokio::test]
async fn progress_line_then_clean_exit_completes_with_counters() {
    let fx = fixture(sh("echo 'Epoch 2/10 [Step 150/500]'"));
    let started = fx
        .supervisor
        .start_job("counters", training_config(fx.dir.path()))
        .await
        .unwrap();
    let job = wait_final(&fx.supervisor, &started.id).await;

    assert_eq!(job.phase, Phase::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.metrics.epoch, Some(2));
    assert_eq!(job.metrics.step, Some(150));
    assert_eq!(job.metrics.total_steps, Some(500));
    assert_eq!(job.target_epochs, 10);
}

#[tokio::test]
async fn cancelled_run_keeps_last_loss() {
    let fx = fixture(sh("echo 'loss: 0.4321'; exec sleep 30"));
    let started = fx
        .supervisor
        .start_job("cancelled", training_config(fx.dir.path()))
        .await
        .unwrap();
    wait_for_log(&fx.supervisor, &started.id, "loss: 0.4321").await;

    fx.supervisor.cancel_job(&started.id).await.unwrap();
    let job = wait_final(&fx.supervisor, &started.id).await;
    assert_eq!(job.phase, Phase::Stopped);
    assert_eq!(job.metrics.loss, Some(0.4321));
    assert!(job.error.is_none());
    let history = fx.supervisor.registry().get_metrics(&job.id).unwrap();
    assert_eq!(history.last().map(|m| m.loss), Some(0.4321));
}

#[tokio::test]
async fn cancel_of_unknown_run_changes_nothing() {
    let fx = fixture(sh("echo 'loss: 0.5'"));
    let started = fx
        .supervisor
        .start_job("finished", training_config(fx.dir.path()))
        .await
        .unwrap();
    wait_final(&fx.supervisor, &started.id).await;
    let before = fx.supervisor.registry().snapshot();

    let err = fx
        .supervisor
        .cancel_job(&RunId::from("run_0_deadbeef"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(fx.supervisor.registry().snapshot(), before);
}

#[tokio::test]
async fn carriage_return_progress_is_parsed_while_running() {
    let fx = fixture(sh(
        r"printf '10%%|# | loss: 0.9\r20%%|## | loss: 0.8\r'; exec sleep 30",
    ));
    let started = fx
        .supervisor
        .start_job("tqdm", training_config(fx.dir.path()))
        .await
        .unwrap();
    wait_for_log(&fx.supervisor, &started.id, "loss: 0.8").await;

    let live = fx.supervisor.registry().get_run(&started.id).unwrap();
    assert_eq!(live.metrics.loss, Some(0.8));
    assert!(log_texts(&fx.supervisor, &started.id)
        .iter()
        .any(|l| l == "10%|# | loss: 0.9"));

    fx.supervisor.cancel_job(&started.id).await.unwrap();
    wait_final(&fx.supervisor, &started.id).await;
}

#[tokio::test]
async fn stderr_lines_are_parsed_too() {
    let fx = fixture(sh("echo 'Epoch 1/1 Step 4/8' >&2; echo 'loss: 0.25' >&2"));
    let started = fx
        .supervisor
        .start_job("stderr", training_config(fx.dir.path()))
        .await
        .unwrap();
    let job = wait_final(&fx.supervisor, &started.id).await;

    assert_eq!(job.phase, Phase::Completed);
    assert_eq!(job.metrics.loss, Some(0.25));
    assert_eq!(job.metrics.step, Some(4));
    assert!(log_texts(&fx.supervisor, &job.id).contains(&"[ERROR] loss: 0.25".to_string()));
}

#[tokio::test]
async fn custom_parser_is_used_for_new_workers() {
    let bleu = ParseRule::new("bleu", r"BLEU (\d+\.\d+)", |caps: &Captures<'_>| {
        caps.get(1)?.as_str().parse().ok().map(Extracted::Accuracy)
    })
    .unwrap();
    let fx = fixture(sh("echo 'BLEU 31.5'; echo 'loss: 0.7'"));
    let supervisor = fx
        .supervisor
        .clone()
        .with_parser(LogParser::with_rules(vec![bleu]));
    let started = supervisor
        .start_job("bleu", training_config(fx.dir.path()))
        .await
        .unwrap();
    let job = wait_final(&supervisor, &started.id).await;

    assert_eq!(job.phase, Phase::Completed);
    assert_eq!(job.metrics.accuracy, Some(31.5));
    assert_eq!(job.metrics.loss, None);
}
