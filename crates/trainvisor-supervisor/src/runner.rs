//! The per-worker supervising task.
//!
//! One task owns each child process. It reads stdout and stderr
//! concurrently, feeds lines from both into the registry and log parser,
//! waits for the exit status and records the final phase.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};
use trainvisor_core::{apply_extracted, emit_worker_exited, Extracted, JobRegistry, LogParser, METRICS};
use trainvisor_state::{Job, LogStream, MetricSample, Phase, RunId, TransitionError};

use crate::command::signal_group;
use crate::lines::LineSplitter;

/// How long to keep draining output after the worker has exited.
const DRAIN_AFTER_EXIT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// Prefix given to stderr lines in the run log.
pub const STDERR_PREFIX: &str = "[ERROR] ";

/// Live worker bookkeeping; exists exactly while the process runs.
#[derive(Debug, Clone)]
pub(crate) struct ProcessHandle {
    pub pid: Option<u32>,
    pub force_kill: Arc<Notify>,
    pub done: watch::Receiver<bool>,
}

pub(crate) type HandleMap = Arc<Mutex<HashMap<String, ProcessHandle>>>;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the supervising task needs besides the child itself.
pub(crate) struct RunContext {
    pub run_id: RunId,
    pub registry: Arc<JobRegistry>,
    pub parser: Arc<LogParser>,
    pub handles: HandleMap,
    pub force_kill: Arc<Notify>,
    pub done: watch::Sender<bool>,
    pub started: Instant,
}

async fn read_chunk<R>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

impl RunContext {
    /// Drive `child` to completion.
    pub async fn supervise(self, mut child: Child) {
        let pid = child.id();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_lines = LineSplitter::new();
        let mut err_lines = LineSplitter::new();
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let mut exit = None;
        let drain = tokio::time::sleep(Duration::MAX);
        tokio::pin!(drain);

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
                    Ok(n) if n > 0 => {
                        for line in out_lines.push(&out_buf[..n]) {
                            self.on_line(LogStream::Stdout, line);
                        }
                    }
                    result => {
                        if let Err(e) = result {
                            warn!(run_id = %self.run_id, error = %e, "Failed reading worker stdout");
                        }
                        if let Some(line) = out_lines.finish() {
                            self.on_line(LogStream::Stdout, line);
                        }
                        stdout = None;
                    }
                },
                read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                    Ok(n) if n > 0 => {
                        for line in err_lines.push(&err_buf[..n]) {
                            self.on_line(LogStream::Stderr, line);
                        }
                    }
                    result => {
                        if let Err(e) = result {
                            warn!(run_id = %self.run_id, error = %e, "Failed reading worker stderr");
                        }
                        if let Some(line) = err_lines.finish() {
                            self.on_line(LogStream::Stderr, line);
                        }
                        stderr = None;
                    }
                },
                status = child.wait(), if exit.is_none() => {
                    exit = Some(status);
                    drain.as_mut().reset(tokio::time::Instant::now() + DRAIN_AFTER_EXIT);
                },
                _ = self.force_kill.notified() => self.kill(&mut child, pid).await,
                _ = &mut drain => {
                    debug!(run_id = %self.run_id, "Output still open after worker exit; closing");
                    break;
                }
            }
        }
        // Flush partial lines if the drain deadline cut the streams short.
        if let Some(line) = out_lines.finish() {
            self.on_line(LogStream::Stdout, line);
        }
        if let Some(line) = err_lines.finish() {
            self.on_line(LogStream::Stderr, line);
        }

        let status = match exit {
            Some(status) => status,
            None => tokio::select! {
                status = child.wait() => status,
                _ = self.force_kill.notified() => {
                    self.kill(&mut child, pid).await;
                    child.wait().await
                }
            },
        };
        self.finish(status);
    }

    async fn kill(&self, child: &mut Child, pid: Option<u32>) {
        warn!(run_id = %self.run_id, "Worker ignored termination; killing");
        if let Some(pid) = pid {
            if let Err(e) = signal_group(pid, "KILL").await {
                debug!(run_id = %self.run_id, error = %e, "Process group kill failed");
            }
        }
        if let Err(e) = child.start_kill() {
            debug!(run_id = %self.run_id, error = %e, "Kill failed; worker already gone");
        }
    }

    /// Record one output line and apply whatever the parser finds in it.
    /// Stderr lines are logged with [`STDERR_PREFIX`] and parsed without it.
    fn on_line(&self, stream: LogStream, line: String) {
        let parsed = self.parser.extract(&line);
        let text = match stream {
            LogStream::Stderr => format!("{STDERR_PREFIX}{line}"),
            _ => line,
        };
        if let Err(e) = self.registry.add_log(&self.run_id, stream, text) {
            warn!(run_id = %self.run_id, error = %e, "Dropping worker output");
            return;
        }
        let Some((rule, value)) = parsed else {
            return;
        };
        METRICS.inc_lines_parsed();
        let applied = self.registry.apply(&self.run_id, |job| {
            if job.is_terminal() {
                return None;
            }
            let changed = apply_extracted(value, job);
            let sample = match value {
                Extracted::Loss(_) if changed => MetricSample::from_job(job),
                _ => None,
            };
            Some(sample)
        });
        match applied {
            Ok(Some(Some(sample))) => {
                if let Err(e) = self.registry.append_metric(sample) {
                    warn!(run_id = %self.run_id, error = %e, "Failed to record metric");
                }
            }
            Ok(_) => debug!(run_id = %self.run_id, rule, "Applied parsed line"),
            Err(e) => warn!(run_id = %self.run_id, error = %e, "Failed to apply parsed line"),
        }
    }

    fn finish(self, status: io::Result<std::process::ExitStatus>) {
        let exit = match &status {
            Ok(status) => match status.code() {
                Some(code) => WorkerExit::Code(code),
                None => WorkerExit::Signal,
            },
            Err(e) => WorkerExit::WaitFailed(e.to_string()),
        };
        match self.registry.apply(&self.run_id, |job| settle(job, &exit)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(run_id = %self.run_id, error = %e, "Failed to record worker exit"),
            Err(e) => warn!(run_id = %self.run_id, error = %e, "Failed to record worker exit"),
        }

        lock(&self.handles).remove(self.run_id.as_str());
        METRICS.inc_runs_finished();
        emit_worker_exited(
            self.run_id.as_str(),
            exit.code(),
            self.started.elapsed().as_millis() as u64,
        );
        self.done.send_replace(true);
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq)]
enum WorkerExit {
    Code(i32),
    Signal,
    WaitFailed(String),
}

impl WorkerExit {
    fn code(&self) -> Option<i32> {
        match self {
            WorkerExit::Code(code) => Some(*code),
            _ => None,
        }
    }
}

/// Record a worker exit on its job.
///
/// A run that already reached a terminal phase (usually `stopped` by a
/// cancel) keeps it and only gains the exit code. Otherwise exit code 0
/// completes the run and anything else fails it.
fn settle(job: &mut Job, exit: &WorkerExit) -> Result<(), TransitionError> {
    if !job.is_terminal() {
        match exit {
            WorkerExit::Code(0) => job.transition(Phase::Completed)?,
            WorkerExit::Code(code) => {
                job.transition(Phase::Error)?;
                job.error = Some(format!("worker exited with code {code}"));
            }
            WorkerExit::Signal => {
                job.transition(Phase::Error)?;
                job.error = Some("worker terminated by signal".to_string());
            }
            WorkerExit::WaitFailed(e) => {
                job.transition(Phase::Error)?;
                job.error = Some(format!("failed to wait for worker: {e}"));
            }
        }
    }
    if let Some(code) = exit.code() {
        job.exit_code = Some(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trainvisor_state::TrainingConfig;

    fn job(phase: Phase) -> Job {
        let mut job = Job::new(
            RunId::from("run-1"),
            "r",
            TrainingConfig::new("m", "d", "o"),
        );
        job.transition(Phase::Training).unwrap();
        job.transition(phase).unwrap();
        job
    }

    #[test]
    fn clean_exit_completes() {
        let mut job = job(Phase::Training);
        settle(&mut job, &WorkerExit::Code(0)).unwrap();
        assert_eq!(job.phase, Phase::Completed);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn nonzero_exit_fails_with_message() {
        let mut job = job(Phase::Evaluating);
        settle(&mut job, &WorkerExit::Code(3)).unwrap();
        assert_eq!(job.phase, Phase::Error);
        assert_eq!(job.exit_code, Some(3));
        assert_eq!(job.error.as_deref(), Some("worker exited with code 3"));
    }

    #[test]
    fn exit_after_cancel_keeps_stopped_and_records_code() {
        for exit in [WorkerExit::Code(0), WorkerExit::Code(143)] {
            let mut job = job(Phase::Stopped);
            settle(&mut job, &exit).unwrap();
            assert_eq!(job.phase, Phase::Stopped);
            assert_eq!(job.exit_code, exit.code());
            assert!(job.error.is_none());
        }

        let mut job = job(Phase::Stopped);
        settle(&mut job, &WorkerExit::Signal).unwrap();
        assert_eq!(job.phase, Phase::Stopped);
        assert_eq!(job.exit_code, None);
    }

    #[test]
    fn exit_while_paused_completes() {
        let mut job = job(Phase::Paused);
        settle(&mut job, &WorkerExit::Code(0)).unwrap();
        assert_eq!(job.phase, Phase::Completed);
    }

    #[test]
    fn signal_death_is_an_error() {
        let mut job = job(Phase::Training);
        settle(&mut job, &WorkerExit::Signal).unwrap();
        assert_eq!(job.phase, Phase::Error);
        assert_eq!(job.exit_code, None);
        assert_eq!(job.error.as_deref(), Some("worker terminated by signal"));
    }
}
