//! The CLI runner: admission control and three-tier timeout supervision.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::errors::{FailureKind, RunFailure};
use crate::output::{OutputSink, StreamKind, pump};
use crate::spawn::{self, CommandSpec, SpawnMode, SpawnedChild};

/// Tunables for one [`CliRunner`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Admission slots: how many agent CLIs may run at once.
    pub max_concurrent: usize,
    /// Hard wall-clock limit per invocation.
    pub main_timeout: Duration,
    /// Kill the child when no output arrives for this long.
    pub idle_timeout: Duration,
    /// Slack added to the main timeout for the safety backstop.
    pub safety_slack: Duration,
    /// How long to wait between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Combined stdout+stderr cap in bytes.
    pub max_output_bytes: u64,
    /// Try a pseudo-terminal first, fall back to pipes.
    pub prefer_pty: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            main_timeout: Duration::from_millis(300_000),
            idle_timeout: Duration::from_millis(60_000),
            safety_slack: Duration::from_millis(5_000),
            kill_grace: Duration::from_millis(2_000),
            max_output_bytes: 10 * 1024 * 1024,
            prefer_pty: true,
        }
    }
}

/// A completed, zero-exit invocation.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub spawn_mode: SpawnMode,
}

/// Snapshot of the admission queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub available: usize,
    pub waiting: usize,
    pub max_concurrent: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Returns an admission slot to the semaphore at most once, no matter how
/// many cleanup paths race to do it. The permit sits behind a mutex-held
/// `Option`; whoever takes it performs the release, everyone after is a
/// no-op.
struct SlotGuard {
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl SlotGuard {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Mutex::new(Some(permit)),
        }
    }

    /// Release the slot; true when this call actually performed it.
    fn release(&self) -> bool {
        self.permit.lock().take().is_some()
    }
}

enum ExitCause {
    Exited(std::io::Result<std::process::ExitStatus>),
    MainTimeout,
    IdleTimeout,
    Overflow,
}

/// Keeps the waiting counter honest across cancelled acquisitions.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawns and supervises agent-CLI invocations.
///
/// Admission is FIFO through a counting semaphore. Three timers are armed
/// per invocation: the main deadline, the idle watchdog (reset by any
/// output byte) and the safety backstop at `main + slack` that
/// force-releases the slot should every other path have failed. The
/// safety timer firing is a bug signal and is logged as an error with the
/// request id.
pub struct CliRunner {
    config: RunnerConfig,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
}

impl CliRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Current admission-queue snapshot, without blocking.
    pub fn queue_status(&self) -> QueueStatus {
        let available = self.semaphore.available_permits();
        let waiting = self.waiting.load(Ordering::SeqCst);
        let warning = (available == 0 && waiting > 0).then(|| {
            format!(
                "all {} execution slots busy, {} request(s) queued",
                self.config.max_concurrent, waiting
            )
        });
        QueueStatus {
            available,
            waiting,
            max_concurrent: self.config.max_concurrent,
            warning,
        }
    }

    /// Run one agent-CLI invocation to completion under supervision.
    ///
    /// Blocks (asynchronously) until an admission slot is free, then until
    /// the child exits or a supervisor kill fires. The slot is guaranteed
    /// released exactly once within `main + slack` of admission.
    pub async fn run(
        &self,
        request_id: &str,
        spec: CommandSpec,
    ) -> Result<RunOutput, RunFailure> {
        let acquired = {
            // Guarded so the counter also unwinds if a waiter is dropped
            // before admission.
            let _waiting = WaitingGuard::enter(&self.waiting);
            self.semaphore.clone().acquire_owned().await
        };

        let permit = match acquired {
            Ok(permit) => permit,
            Err(_) => {
                return Err(RunFailure::spawn("execution queue is closed", Duration::ZERO));
            },
        };

        let started = Instant::now();
        let guard = Arc::new(SlotGuard::new(permit));

        // Safety backstop: unconditional release at main + slack. Under
        // correct operation the release below wins and this stays silent.
        let safety_guard = guard.clone();
        let safety_deadline = self.config.main_timeout + self.config.safety_slack;
        let safety_request_id = request_id.to_string();
        let safety: JoinHandle<()> = tokio::spawn(async move {
            tokio::time::sleep(safety_deadline).await;
            if safety_guard.release() {
                error!(
                    request_id = %safety_request_id,
                    "safety timeout fired: execution slot force-released"
                );
            }
        });

        let result = self.supervise(request_id, &spec, started).await;

        if guard.release() {
            debug!(request_id, "execution slot released");
        }
        safety.abort();

        result
    }

    async fn supervise(
        &self,
        request_id: &str,
        spec: &CommandSpec,
        started: Instant,
    ) -> Result<RunOutput, RunFailure> {
        let (spawned, spawn_mode) = match spawn::spawn(spec, self.config.prefer_pty) {
            Ok(pair) => pair,
            Err(error) => {
                return Err(RunFailure::spawn(error.to_string(), started.elapsed()));
            },
        };

        let sink = Arc::new(OutputSink::new(self.config.max_output_bytes));
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        // The PTY write half is parked here so the master stays open until
        // supervision ends.
        let mut _pty_writer = None;

        let mut child: Child = match spawned {
            SpawnedChild::Pty {
                child,
                reader,
                writer,
            } => {
                readers.push(tokio::spawn(pump(reader, sink.clone(), StreamKind::Stdout)));
                _pty_writer = Some(writer);
                child
            },
            SpawnedChild::Pipe {
                child,
                stdout,
                stderr,
            } => {
                readers.push(tokio::spawn(pump(stdout, sink.clone(), StreamKind::Stdout)));
                readers.push(tokio::spawn(pump(stderr, sink.clone(), StreamKind::Stderr)));
                child
            },
        };

        let pid = child.id().map(|p| p as i32);

        let cause = {
            let main_sleep = tokio::time::sleep(self.config.main_timeout);
            tokio::pin!(main_sleep);
            let idle_wait = idle_expired(sink.clone(), self.config.idle_timeout);
            tokio::pin!(idle_wait);
            let overflow_wait = sink.wait_overflow();
            tokio::pin!(overflow_wait);

            // Biased so a child exiting exactly at the main deadline is
            // reported with its real exit code, and so the first-fired
            // timer wins when several are due.
            tokio::select! {
                biased;
                status = child.wait() => ExitCause::Exited(status),
                _ = &mut overflow_wait => ExitCause::Overflow,
                _ = &mut main_sleep => ExitCause::MainTimeout,
                _ = &mut idle_wait => ExitCause::IdleTimeout,
            }
        };

        if !matches!(cause, ExitCause::Exited(_)) {
            spawn::terminate(&mut child, pid, self.config.kill_grace).await;
        }

        for handle in readers {
            let _ = handle.await;
        }

        let (stdout, stderr) = sink.snapshot();
        let duration = started.elapsed();

        match cause {
            ExitCause::Exited(Ok(status)) => {
                let exit_code = status.code().unwrap_or(-1);
                // A child can write past the cap and exit before the
                // supervisor reacts; the cap violation still wins.
                if sink.overflowed() {
                    return Err(RunFailure {
                        kind: FailureKind::OutputOverflow {
                            limit_bytes: self.config.max_output_bytes,
                        },
                        stdout,
                        stderr,
                        exit_code: Some(exit_code),
                        duration,
                    });
                }
                if exit_code == 0 {
                    info!(
                        request_id,
                        duration_ms = duration.as_millis() as u64,
                        "agent CLI completed"
                    );
                    Ok(RunOutput {
                        stdout,
                        stderr,
                        exit_code,
                        duration,
                        spawn_mode,
                    })
                } else {
                    Err(RunFailure {
                        kind: FailureKind::NonZeroExit { code: exit_code },
                        stdout,
                        stderr,
                        exit_code: Some(exit_code),
                        duration,
                    })
                }
            },
            ExitCause::Exited(Err(error)) => Err(RunFailure {
                kind: FailureKind::SpawnFailure {
                    message: format!("wait failed: {error}"),
                },
                stdout,
                stderr,
                exit_code: None,
                duration,
            }),
            ExitCause::MainTimeout => {
                info!(
                    request_id,
                    limit_ms = self.config.main_timeout.as_millis() as u64,
                    "main timeout fired, child killed"
                );
                Err(RunFailure {
                    kind: FailureKind::Timeout {
                        limit_ms: self.config.main_timeout.as_millis() as u64,
                    },
                    stdout,
                    stderr,
                    exit_code: None,
                    duration,
                })
            },
            ExitCause::IdleTimeout => {
                info!(
                    request_id,
                    limit_ms = self.config.idle_timeout.as_millis() as u64,
                    "idle timeout fired, child killed"
                );
                Err(RunFailure {
                    kind: FailureKind::IdleTimeout {
                        limit_ms: self.config.idle_timeout.as_millis() as u64,
                    },
                    stdout,
                    stderr,
                    exit_code: None,
                    duration,
                })
            },
            ExitCause::Overflow => Err(RunFailure {
                kind: FailureKind::OutputOverflow {
                    limit_bytes: self.config.max_output_bytes,
                },
                stdout,
                stderr,
                exit_code: None,
                duration,
            }),
        }
    }
}

/// Resolves when the sink has seen no activity for `idle`. Re-arms itself
/// whenever a byte arrived during the sleep.
async fn idle_expired(sink: Arc<OutputSink>, idle: Duration) {
    loop {
        let last = sink.last_activity();
        let deadline = last + idle;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        if sink.last_activity() == last {
            return;
        }
    }
}
