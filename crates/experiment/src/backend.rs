//! Worker backends.
//!
//! A [`WorkerBackend`] starts a worker bound to a [`WorkerLink`] and returns a
//! [`WorkerHandle`] the supervisor uses to observe and stop it. Two backends
//! exist:
//!
//! - [`ProcessBackend`] runs `mxscan worker` as a child process and mirrors
//!   the command channel and abort flag over its stdin, and its stdout into
//!   the result channel.
//! - [`InProcessBackend`] runs the [`Scanner`] as a tokio task on the shared
//!   channels directly.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use common::{decode_line, encode_line, Channel, ScanError, ScanResult, WorkerFrame};
use hardware::{Instrument, Scanner, WorkerLink};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited after being asked to.
    Clean,
    /// Did not exit within the stop timeout and was killed.
    Killed,
    /// Crashed, exited with a failure status, or exited unasked.
    Faulted(String),
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerExit::Clean => write!(f, "clean"),
            WorkerExit::Killed => write!(f, "killed"),
            WorkerExit::Faulted(reason) => write!(f, "faulted ({})", reason),
        }
    }
}

#[async_trait]
pub trait WorkerHandle: Send {
    /// OS process id, if the worker is a process.
    fn pid(&self) -> Option<u32>;

    /// `Some` once the worker has ended, without waiting.
    fn try_exit(&mut self) -> Option<WorkerExit>;

    /// Ask the worker to stop and wait at most `timeout` before killing it.
    async fn shutdown(&mut self, timeout: Duration) -> WorkerExit;
}

#[async_trait]
pub trait WorkerBackend: Send + Sync {
    async fn launch(&self, link: WorkerLink) -> common::Result<Box<dyn WorkerHandle>>;
}

// =============================================================================
// ProcessBackend
// =============================================================================

/// Runs the worker as `<program> worker`.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["worker".to_string()],
        }
    }

    /// Re-run the current executable as the worker.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Replace the worker arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl WorkerBackend for ProcessBackend {
    async fn launch(&self, link: WorkerLink) -> common::Result<Box<dyn WorkerHandle>> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(ScanError::WorkerSpawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ScanError::Protocol("worker stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScanError::Protocol("worker stdout was not captured".into()))?;
        let pid = child.id();
        info!(pid, program = %self.program.display(), "Worker process started");

        let pump = tokio::spawn(pump_frames(stdin, link.clone()));
        let reader = tokio::spawn(read_results(
            stdout,
            link.channels.results.clone(),
            link.stop.clone(),
            pid,
        ));

        Ok(Box::new(ProcessHandle {
            child,
            pid,
            stop: link.stop,
            pump: Some(pump),
            reader: Some(reader),
        }))
    }
}

struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    stop: CancellationToken,
    pump: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    fn classify(&self, status: std::process::ExitStatus) -> WorkerExit {
        if !self.stop.is_cancelled() {
            WorkerExit::Faulted(format!("exited unexpectedly with {}", status))
        } else if status.success() {
            WorkerExit::Clean
        } else {
            WorkerExit::Faulted(format!("exited with {}", status))
        }
    }
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn try_exit(&mut self) -> Option<WorkerExit> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(self.classify(status)),
            Ok(None) => None,
            Err(e) => Some(WorkerExit::Faulted(e.to_string())),
        }
    }

    async fn shutdown(&mut self, timeout: Duration) -> WorkerExit {
        self.stop.cancel();
        let exit = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => self.classify(status),
            Ok(Err(e)) => WorkerExit::Faulted(e.to_string()),
            Err(_) => {
                warn!(pid = self.pid, ?timeout, "Worker did not exit in time, killing it");
                if let Err(e) = self.child.kill().await {
                    error!(pid = self.pid, error = %e, "Failed to kill worker");
                }
                WorkerExit::Killed
            }
        };

        // The reader ends at stdout EOF, after the last result has been queued
        for task in [self.pump.take(), self.reader.take()].into_iter().flatten() {
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!(pid = self.pid, "Worker I/O task did not finish");
            }
        }
        debug!(pid = self.pid, %exit, "Worker process ended");
        exit
    }
}

async fn write_frame(stdin: &mut ChildStdin, frame: &WorkerFrame) -> common::Result<()> {
    let line = encode_line(frame)?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

/// Controller → worker: commands and abort transitions until stop, then `shutdown`.
async fn pump_frames(mut stdin: ChildStdin, link: WorkerLink) {
    let mut abort_rx = link.abort.subscribe();
    let mut pending = if *abort_rx.borrow_and_update() {
        Some(WorkerFrame::Abort)
    } else {
        None
    };

    loop {
        let frame = match pending.take() {
            Some(frame) => frame,
            None => tokio::select! {
                biased;
                _ = link.stop.cancelled() => break,
                changed = abort_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*abort_rx.borrow_and_update() {
                        continue;
                    }
                    WorkerFrame::Abort
                }
                command = link.channels.commands.recv() => WorkerFrame::Command(command),
            },
        };
        if let Err(e) = write_frame(&mut stdin, &frame).await {
            warn!(error = %e, "Failed to write to worker stdin");
            return;
        }
    }

    if let Err(e) = write_frame(&mut stdin, &WorkerFrame::Shutdown).await {
        debug!(error = %e, "Worker stdin already closed");
    }
}

/// Worker → controller: one result per stdout line until EOF.
async fn read_results(
    stdout: ChildStdout,
    results: Channel<ScanResult>,
    stop: CancellationToken,
    pid: Option<u32>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_line::<ScanResult>(&line) {
                Ok(result) => results.send(result),
                Err(e) => warn!(pid, error = %e, line = %line, "Ignoring malformed worker output"),
            },
            Ok(None) => {
                if !stop.is_cancelled() {
                    error!(pid, "Worker fault: stdout closed before shutdown was requested");
                }
                break;
            }
            Err(e) => {
                warn!(pid, error = %e, "Failed to read worker stdout");
                break;
            }
        }
    }
}

// =============================================================================
// InProcessBackend
// =============================================================================

/// Runs a [`Scanner`] as a tokio task, building a fresh instrument per launch.
pub struct InProcessBackend<F> {
    factory: F,
}

impl<F, I> InProcessBackend<F>
where
    F: Fn() -> I + Send + Sync,
    I: Instrument + 'static,
{
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<F, I> WorkerBackend for InProcessBackend<F>
where
    F: Fn() -> I + Send + Sync,
    I: Instrument + 'static,
{
    async fn launch(&self, link: WorkerLink) -> common::Result<Box<dyn WorkerHandle>> {
        let stop = link.stop.clone();
        let task = tokio::spawn(Scanner::new(link, (self.factory)()).run());
        debug!("In-process worker started");
        Ok(Box::new(TaskHandle {
            stop,
            task: Some(task),
            exit: None,
        }))
    }
}

struct TaskHandle {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    exit: Option<WorkerExit>,
}

impl TaskHandle {
    fn classify(&self, joined: Result<(), tokio::task::JoinError>) -> WorkerExit {
        match joined {
            Err(e) => WorkerExit::Faulted(e.to_string()),
            Ok(()) if self.stop.is_cancelled() => WorkerExit::Clean,
            Ok(()) => WorkerExit::Faulted("worker task ended unexpectedly".into()),
        }
    }
}

#[async_trait]
impl WorkerHandle for TaskHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn try_exit(&mut self) -> Option<WorkerExit> {
        if self.exit.is_none() && self.task.as_ref().is_some_and(JoinHandle::is_finished) {
            self.task = None;
            self.exit = Some(if self.stop.is_cancelled() {
                WorkerExit::Clean
            } else {
                WorkerExit::Faulted("worker task ended unexpectedly".into())
            });
        }
        self.exit.clone()
    }

    async fn shutdown(&mut self, timeout: Duration) -> WorkerExit {
        self.stop.cancel();
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let Some(mut task) = self.task.take() else {
            return WorkerExit::Clean;
        };
        let exit = match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => self.classify(joined),
            Err(_) => {
                warn!(?timeout, "Worker task did not stop in time, aborting it");
                task.abort();
                WorkerExit::Killed
            }
        };
        self.exit = Some(exit.clone());
        exit
    }
}
