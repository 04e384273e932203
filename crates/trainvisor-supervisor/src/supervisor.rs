//! Owned service that starts, tracks and cancels worker processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};
use tracing::{info, warn, Instrument};
use trainvisor_core::{
    emit_cancel_requested, emit_checkpoint_saved, emit_spawn_failed, emit_worker_spawned,
    run_span, validate_training, JobRegistry, LogParser, OrchestratorConfig, RegistryError,
    RunPatch, StatusEvent, WorkerSpec, METRICS,
};
use trainvisor_state::{
    CheckpointRecord, CheckpointStore, CheckpointTag, Job, Phase, RunId, SaveCheckpoint,
    TrainingConfig,
};

use crate::command::{signal_group, WorkerCommand};
use crate::error::{Result, SupervisorError};
use crate::runner::{lock, HandleMap, ProcessHandle, RunContext};

/// Supervises worker processes on behalf of a [`JobRegistry`].
///
/// Cheap to clone; clones share the same set of live workers.
#[derive(Clone)]
pub struct Supervisor {
    registry: Arc<JobRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    parser: Arc<LogParser>,
    worker: WorkerSpec,
    cancel_grace: Duration,
    handles: HandleMap,
}

impl Supervisor {
    pub fn new(
        registry: Arc<JobRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            parser: Arc::new(LogParser::default()),
            worker: config.worker.clone(),
            cancel_grace: config.cancel_grace,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replace the log parser used for new workers.
    pub fn with_parser(mut self, parser: LogParser) -> Self {
        self.parser = Arc::new(parser);
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Validate `config`, register a run and spawn its worker.
    ///
    /// Returns once the worker is spawned, before it produces output. A
    /// worker that cannot be started is reported through the returned job's
    /// `error` phase rather than as an `Err`.
    pub async fn start_job(&self, label: impl Into<String>, config: TrainingConfig) -> Result<Job> {
        validate_training(&config)?;
        let resume_token = match &config.resume_checkpoint {
            Some(checkpoint_id) => {
                self.checkpoints
                    .load_checkpoint(checkpoint_id)
                    .await?
                    .resume_token
            }
            None => None,
        };

        let job = self.registry.create_run(label, config);
        let command =
            WorkerCommand::build(&self.worker, &job.id, &job.config, resume_token.as_deref());

        let child = match command.to_command().spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = SupervisorError::Spawn {
                    program: command.program_name(),
                    source,
                };
                emit_spawn_failed(job.id.as_str(), &err);
                return Ok(self.registry.fail_run(&job.id, err.to_string(), None)?);
            }
        };

        let pid = child.id();
        METRICS.inc_runs_started();
        emit_worker_spawned(job.id.as_str(), pid, &command.program_name());

        let force_kill = Arc::new(Notify::new());
        let (done_tx, done_rx) = watch::channel(false);
        lock(&self.handles).insert(
            job.id.to_string(),
            ProcessHandle {
                pid,
                force_kill: force_kill.clone(),
                done: done_rx,
            },
        );
        let job = self.registry.transition(&job.id, Phase::Preparing)?;

        let ctx = RunContext {
            run_id: job.id.clone(),
            registry: self.registry.clone(),
            parser: self.parser.clone(),
            handles: self.handles.clone(),
            force_kill,
            done: done_tx,
            started: Instant::now(),
        };
        tokio::spawn(ctx.supervise(child).instrument(run_span(job.id.as_str())));
        Ok(job)
    }

    /// Start a new run that continues from a stored checkpoint.
    ///
    /// The new run reuses the checkpoint's run configuration; the worker
    /// receives the checkpoint's resume token verbatim.
    pub async fn resume_from_checkpoint(
        &self,
        checkpoint_id: &str,
        label: impl Into<String>,
    ) -> Result<Job> {
        let record = self.checkpoints.load_checkpoint(checkpoint_id).await?;
        let source = self
            .registry
            .get_run(&record.run_id)
            .ok_or_else(|| SupervisorError::NotFound(record.run_id.to_string()))?;
        let config = source.config.resume_from(record.id);
        self.start_job(label, config).await
    }

    fn live_handle(&self, id: &RunId) -> Result<ProcessHandle> {
        if let Some(handle) = lock(&self.handles).get(id.as_str()) {
            return Ok(handle.clone());
        }
        match self.registry.get_run(id) {
            Some(_) => Err(SupervisorError::AlreadyFinished(id.to_string())),
            None => Err(SupervisorError::NotFound(id.to_string())),
        }
    }

    /// Ask a live worker to stop and mark its run `stopped`.
    ///
    /// The worker gets SIGTERM now and is killed if it is still running
    /// after the grace period.
    pub async fn cancel_job(&self, id: &RunId) -> Result<Job> {
        let handle = self.live_handle(id)?;
        let job = self.registry.stop_run(id).map_err(|e| match e {
            RegistryError::InvalidTransition(_) => SupervisorError::AlreadyFinished(id.to_string()),
            other => other.into(),
        })?;
        emit_cancel_requested(id.as_str());

        match handle.pid {
            Some(pid) => match signal_group(pid, "TERM").await {
                Ok(true) => {}
                Ok(false) => warn!(run_id = %id, pid, "SIGTERM not delivered"),
                Err(e) => warn!(run_id = %id, error = %e, "Failed to send SIGTERM"),
            },
            None => handle.force_kill.notify_one(),
        }

        let grace = self.cancel_grace;
        let mut done = handle.done;
        let force_kill = handle.force_kill;
        tokio::spawn(async move {
            tokio::select! {
                _ = done.wait_for(|finished| *finished) => {}
                _ = tokio::time::sleep(grace) => force_kill.notify_one(),
            }
        });
        Ok(job)
    }

    /// Mark a live run paused. The worker is not signalled.
    pub fn pause_job(&self, id: &RunId) -> Result<Job> {
        self.live_handle(id)?;
        Ok(self.registry.pause_run(id)?)
    }

    /// Return a paused live run to the phase it was paused from.
    pub fn resume_job(&self, id: &RunId) -> Result<Job> {
        self.live_handle(id)?;
        Ok(self.registry.resume_run(id)?)
    }

    /// Store a checkpoint and link it to its run.
    pub async fn save_checkpoint(&self, request: SaveCheckpoint) -> Result<CheckpointRecord> {
        let run_id = request.run_id.clone();
        if self.registry.get_run(&run_id).is_none() {
            return Err(SupervisorError::NotFound(run_id.to_string()));
        }
        let record = self.checkpoints.save_checkpoint(request).await?;
        self.registry.add_checkpoint(&run_id, record.id.clone())?;
        if record.tag == CheckpointTag::Best {
            self.registry.update_run(
                &run_id,
                RunPatch {
                    best_metric: record.metric,
                    ..RunPatch::default()
                },
            )?;
        }

        METRICS.inc_checkpoints_saved();
        emit_checkpoint_saved(run_id.as_str(), &record.id, record.tag.as_str());
        self.registry
            .broadcaster()
            .publish(StatusEvent::Checkpoint(record.info()));
        Ok(record)
    }

    /// Wait for a run's worker to exit and return the final job.
    pub async fn wait(&self, id: &RunId) -> Result<Job> {
        let done = lock(&self.handles).get(id.as_str()).map(|h| h.done.clone());
        if let Some(mut done) = done {
            // An error means the supervising task is gone; the registry is final.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.registry
            .get_run(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    pub fn is_live(&self, id: &RunId) -> bool {
        lock(&self.handles).contains_key(id.as_str())
    }

    pub fn live_jobs(&self) -> Vec<RunId> {
        lock(&self.handles)
            .keys()
            .map(|k| RunId::from(k.as_str()))
            .collect()
    }

    /// Cancel every live worker and wait for all of them to exit.
    pub async fn shutdown(&self) {
        let live = self.live_jobs();
        if !live.is_empty() {
            info!(count = live.len(), "Stopping live workers");
        }
        for id in &live {
            if let Err(e) = self.cancel_job(id).await {
                warn!(run_id = %id, error = %e, "Cancel during shutdown failed");
            }
        }
        for id in &live {
            let _ = self.wait(id).await;
        }
        self.registry.flush().await;
    }
}
