// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process supervisor for the pooler binary.
//!
//! Spawns exactly one child with piped stdout and stderr. Each pipe is
//! drained by its own task into a [`LogRecordTranslator`]. After the child
//! exits each copy task keeps reading until its pipe stays idle for the
//! drain grace, since descendants of the child may keep the write end open.
//! Output still arriving when the drain limit expires is dropped and
//! reported as a [`CopyFailure`]. The child is never restarted.

use std::fmt;
use std::io::{self, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::logpipe::{LogRecordTranslator, Pipe};

/// Size of a single read from a child pipe.
pub const COPY_CHUNK_SIZE: usize = 8 * 1024;

/// Idle time after which a pipe counts as drained once the child exited.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Upper bound on draining after the child exited.
pub const DEFAULT_DRAIN_LIMIT: Duration = Duration::from_secs(30);

/// Errors from process supervision.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// Child could not be started.
    #[error("Failed to launch {program}: {source}")]
    Launch {
        /// Program that failed to start.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: io::Error,
    },

    /// Waiting on the child failed.
    #[error("Failed to wait for child: {0}")]
    Wait(#[source] io::Error),

    /// Waiter task ended without reporting.
    #[error("Process waiter terminated without a report")]
    WaiterLost,

    /// Signal delivery failed.
    #[error("Failed to send {signal} to pid {pid}: {source}")]
    Signal {
        /// Signal name.
        signal: &'static str,
        /// Target pid.
        pid: u32,
        /// Errno returned by kill(2).
        #[source]
        source: Errno,
    },

    /// Child exited with a non-zero code.
    #[error("Process exited with code {0}")]
    NonZeroExit(i32),

    /// Child was terminated by a signal.
    #[error("Process terminated by signal {0}")]
    Signaled(i32),

    /// Copying one of the output streams failed.
    #[error("Copying {pipe} failed: {message}")]
    CopyFailed {
        /// Stream that failed.
        pipe: Pipe,
        /// Failure description.
        message: String,
    },
}

/// Program and arguments of the supervised child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable path.
    pub program: PathBuf,
    /// Arguments, not including the program.
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Command without arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Normal exit with a status code.
    Exited {
        /// Exit code.
        code: i32,
    },
    /// Killed by a signal.
    Signaled {
        /// Signal number.
        signal: i32,
    },
}

impl Termination {
    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Termination::Exited { code },
            None => Termination::Signaled {
                signal: status.signal().unwrap_or_default(),
            },
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited { code } => write!(f, "exited with code {}", code),
            Termination::Signaled { signal } => write!(f, "terminated by signal {}", signal),
        }
    }
}

/// I/O failure while copying one output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFailure {
    /// Stream that failed.
    pub pipe: Pipe,
    /// Kind of the underlying I/O error.
    pub kind: io::ErrorKind,
    /// Error description.
    pub message: String,
}

impl CopyFailure {
    fn new(pipe: Pipe, error: &io::Error) -> Self {
        Self {
            pipe,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Outcome of a supervised run.
///
/// Copy failures are reported next to the termination instead of replacing
/// it. The supervisor does not judge either; see [`into_result`](Self::into_result).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    /// Child pid.
    pub pid: u32,
    /// How the child ended.
    pub termination: Termination,
    /// Streams whose copy failed.
    pub copy_failures: Vec<CopyFailure>,
}

impl ProcessReport {
    /// Exit code zero and both streams copied fully.
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited { code: 0 } && self.copy_failures.is_empty()
    }

    /// Treat non-zero exit, signal termination or a copy failure as an error.
    pub fn into_result(self) -> Result<(), SupervisorError> {
        match self.termination {
            Termination::Exited { code: 0 } => {}
            Termination::Exited { code } => return Err(SupervisorError::NonZeroExit(code)),
            Termination::Signaled { signal } => return Err(SupervisorError::Signaled(signal)),
        }
        match self.copy_failures.into_iter().next() {
            Some(failure) => Err(SupervisorError::CopyFailed {
                pipe: failure.pipe,
                message: failure.message,
            }),
            None => Ok(()),
        }
    }
}

/// Cloneable reference to a running child for signal delivery.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    running: Arc<AtomicBool>,
}

impl ProcessHandle {
    /// Child pid.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the child has not been reaped yet.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Send SIGINT, asking the pooler for a safe shutdown.
    ///
    /// Returns `Ok(false)` when the child already exited.
    pub fn interrupt(&self) -> Result<bool, SupervisorError> {
        self.signal(Signal::SIGINT)
    }

    /// Send SIGHUP, asking the pooler to reload its configuration.
    ///
    /// Returns `Ok(false)` when the child already exited.
    pub fn reload(&self) -> Result<bool, SupervisorError> {
        self.signal(Signal::SIGHUP)
    }

    /// Deliver `sig` to the child.
    pub fn signal(&self, sig: Signal) -> Result<bool, SupervisorError> {
        if !self.is_running() {
            return Ok(false);
        }
        match signal::kill(Pid::from_raw(self.pid as i32), sig) {
            Ok(()) => {
                debug!(pid = self.pid, signal = sig.as_str(), "Signal delivered");
                Ok(true)
            }
            Err(Errno::ESRCH) => Ok(false),
            Err(source) => Err(SupervisorError::Signal {
                signal: sig.as_str(),
                pid: self.pid,
                source,
            }),
        }
    }
}

/// A spawned child whose report can be awaited once.
pub struct SupervisedProcess {
    handle: ProcessHandle,
    report: oneshot::Receiver<Result<ProcessReport, SupervisorError>>,
}

impl SupervisedProcess {
    /// Handle for signal delivery.
    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    /// Child pid.
    pub fn pid(&self) -> u32 {
        self.handle.pid
    }

    /// Wait for the child to exit and its output to be drained.
    pub async fn wait(self) -> Result<ProcessReport, SupervisorError> {
        self.report.await.map_err(|_| SupervisorError::WaiterLost)?
    }
}

/// Spawns and supervises the child.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    drain: Drain,
    chunk_size: usize,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self {
            drain: Drain {
                grace: DEFAULT_DRAIN_GRACE,
                limit: DEFAULT_DRAIN_LIMIT,
            },
            chunk_size: COPY_CHUNK_SIZE,
        }
    }
}

/// Post-exit draining bounds shared by both copy tasks.
#[derive(Debug, Clone, Copy)]
struct Drain {
    grace: Duration,
    limit: Duration,
}

impl ProcessSupervisor {
    /// Supervisor with the default drain grace and chunk size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the idle time that ends draining after exit.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain.grace = grace;
        self
    }

    /// Override the upper bound on draining after exit.
    pub fn with_drain_limit(mut self, limit: Duration) -> Self {
        self.drain.limit = limit;
        self
    }

    /// Start `spec` and begin draining its output.
    ///
    /// Must be called from within a Tokio runtime. On launch failure nothing
    /// is left running.
    pub fn spawn(
        &self,
        spec: &CommandSpec,
        stdout: LogRecordTranslator,
        stderr: LogRecordTranslator,
    ) -> Result<SupervisedProcess, SupervisorError> {
        let launch_error = |source| SupervisorError::Launch {
            program: spec.program.display().to_string(),
            source,
        };

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(launch_error)?;

        let pid = child
            .id()
            .ok_or_else(|| launch_error(io::Error::other("child exited before its pid was read")))?;

        info!(pid, command = %spec, "Started supervised process");

        let copy = CopyControl {
            exited: CancellationToken::new(),
            stop: CancellationToken::new(),
            drain: self.drain,
            chunk_size: self.chunk_size,
        };
        let stdout_task = spawn_copy(child.stdout.take(), stdout, copy.clone());
        let stderr_task = spawn_copy(child.stderr.take(), stderr, copy.clone());

        let running = Arc::new(AtomicBool::new(true));
        let handle = ProcessHandle {
            pid,
            running: running.clone(),
        };

        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let status = child.wait().await;
            running.store(false, Ordering::SeqCst);

            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    error!(pid, error = %e, "Failed to wait for supervised process");
                    copy.stop.cancel();
                    let _ = tx.send(Err(SupervisorError::Wait(e)));
                    return;
                }
            };

            let termination = Termination::from_status(status);
            info!(pid, termination = %termination, "Supervised process exited");

            copy.exited.cancel();

            let mut copy_failures = Vec::new();
            for (pipe, task) in [(Pipe::Stdout, stdout_task), (Pipe::Stderr, stderr_task)] {
                match task.await {
                    Ok(Some(failure)) => copy_failures.push(failure),
                    Ok(None) => {}
                    Err(e) => {
                        error!(pipe = %pipe, error = %e, "Copy task panicked");
                        copy_failures.push(CopyFailure {
                            pipe,
                            kind: io::ErrorKind::Other,
                            message: e.to_string(),
                        });
                    }
                }
            }

            let _ = tx.send(Ok(ProcessReport {
                pid,
                termination,
                copy_failures,
            }));
        });

        Ok(SupervisedProcess { handle, report: rx })
    }
}

/// Cancellation and drain settings handed to each copy task.
#[derive(Clone)]
struct CopyControl {
    /// Cancelled once the child has been reaped.
    exited: CancellationToken,
    /// Cancelled when either copy fails.
    stop: CancellationToken,
    drain: Drain,
    chunk_size: usize,
}

fn spawn_copy<R>(
    reader: Option<R>,
    translator: LogRecordTranslator,
    control: CopyControl,
) -> JoinHandle<Option<CopyFailure>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match reader {
            Some(reader) => copy_stream(reader, translator, control).await,
            None => None,
        }
    })
}

/// Drains `reader` into `translator` until EOF, failure, or after the child
/// exited, an idle pipe or the drain limit.
async fn copy_stream<R>(
    mut reader: R,
    mut translator: LogRecordTranslator,
    control: CopyControl,
) -> Option<CopyFailure>
where
    R: AsyncRead + Unpin,
{
    let pipe = translator.pipe();
    let mut buf = vec![0u8; control.chunk_size];
    let mut deadline: Option<Instant> = None;

    let failure = loop {
        let read = match deadline {
            None => tokio::select! {
                biased;
                _ = control.stop.cancelled() => {
                    debug!(pipe = %pipe, "Copy cancelled");
                    break None;
                }
                _ = control.exited.cancelled() => {
                    deadline = Some(Instant::now() + control.drain.limit);
                    continue;
                }
                read = reader.read(&mut buf) => read,
            },
            Some(deadline) => {
                // The idle timer restarts with every read.
                let idle = (Instant::now() + control.drain.grace).min(deadline);
                tokio::select! {
                    biased;
                    _ = control.stop.cancelled() => {
                        debug!(pipe = %pipe, "Copy cancelled");
                        break None;
                    }
                    read = tokio::time::timeout_at(idle, reader.read(&mut buf)) => match read {
                        Ok(read) => read,
                        Err(_) if idle < deadline => {
                            debug!(pipe = %pipe, "Pipe idle after exit, copy finished");
                            break None;
                        }
                        Err(_) => {
                            break Some(io::Error::new(
                                io::ErrorKind::TimedOut,
                                format!(
                                    "output still arriving {:?} after exit, rest dropped",
                                    control.drain.limit
                                ),
                            ));
                        }
                    },
                }
            }
        };

        match read {
            Ok(0) => break None,
            Ok(n) => {
                if let Err(e) = translator.write_all(&buf[..n]) {
                    break Some(e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Some(e),
        }
    };

    let failure = match failure {
        Some(e) => Some(e),
        None => translator.finish().err(),
    };

    failure.map(|e| {
        warn!(pipe = %pipe, error = %e, "Copying output failed, stopping both streams");
        control.stop.cancel();
        CopyFailure::new(pipe, &e)
    })
}
