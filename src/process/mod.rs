//! Supervision of external processes
//!
//! A [`SupervisedProcess`] owns exactly one child. Its combined output is
//! drained on a dedicated task and re-emitted through `tracing` at the level
//! recovered by a per-program [`LineClassifier`]. A second task owns the
//! child handle and reaps it. It publishes the exit status as soon as the
//! child is reaped, then fires the completion signal once output is drained.

pub mod classify;

pub use classify::{HaproxyLog, LineClassifier, LogLevel, PlainLog, PrivoxyLog, TorLog};

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{Result, RotatorError};

/// How long the monitor waits for buffered output after the child exits
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Everything needed to launch one supervised program
#[derive(Clone)]
pub struct ProcessSpec {
    pub service: String,
    pub port: u16,
    pub program: String,
    pub args: Vec<String>,
    pub classifier: Arc<dyn LineClassifier>,
    pub settle: Duration,
}

impl ProcessSpec {
    pub fn new(service: impl Into<String>, port: u16, program: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            port,
            program: program.into(),
            args: Vec::new(),
            classifier: Arc::new(PlainLog),
            settle: Duration::from_millis(250),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn LineClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn launch_error(&self, reason: impl Into<String>) -> RotatorError {
        RotatorError::Launch {
            service: self.service.clone(),
            port: self.port,
            reason: reason.into(),
        }
    }
}

impl fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSpec")
            .field("service", &self.service)
            .field("port", &self.port)
            .field("program", &self.program)
            .field("args", &self.args)
            .field("settle", &self.settle)
            .finish()
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process ended on its own
    Exited(ExitStatus),
    /// The process was killed through [`SupervisedProcess::terminate`] or drop
    Killed,
    /// The exit status could not be collected
    Unknown,
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(status) => write!(f, "{}", status),
            ExitOutcome::Killed => write!(f, "killed"),
            ExitOutcome::Unknown => write!(f, "unknown exit"),
        }
    }
}

/// One-shot completion signal that any number of waiters can observe
#[derive(Clone)]
pub struct ExitSignal {
    rx: watch::Receiver<Option<ExitOutcome>>,
}

impl ExitSignal {
    /// Whether the process has already exited
    pub fn has_fired(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<ExitOutcome> {
        *self.rx.borrow()
    }

    /// Suspend until the process has exited; returns immediately if it already has
    pub async fn fired(&mut self) -> ExitOutcome {
        let result = self.rx.wait_for(Option::is_some).await.map(|outcome| *outcome);
        match result {
            Ok(Some(outcome)) => outcome,
            // monitor went away without reporting
            _ => self.outcome().unwrap_or(ExitOutcome::Unknown),
        }
    }
}

type KillReply = oneshot::Sender<io::Result<()>>;

/// A running external program
pub struct SupervisedProcess {
    service: String,
    port: u16,
    pid: u32,
    reaped: ExitSignal,
    exit: ExitSignal,
    control: mpsc::Sender<KillReply>,
}

impl SupervisedProcess {
    /// Spawn the program and wait out the settle window
    ///
    /// Output draining starts immediately so the child can never stall on a
    /// full pipe. A process that exits before the settle window elapses is
    /// reported as a launch failure.
    pub async fn start(spec: ProcessSpec) -> Result<Self> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spec.launch_error(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| spec.launch_error("process exited before it could be tracked"))?;
        let span = info_span!("process", service = %spec.service, port = spec.port, pid);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spec.launch_error("stdout pipe missing"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spec.launch_error("stderr pipe missing"))?;

        let drain = tokio::spawn(
            drain_output(
                lines(stdout).merge(lines(stderr)),
                spec.classifier.clone(),
                spec.service.clone(),
            )
            .instrument(span.clone()),
        );

        let (reaped_tx, reaped_rx) = watch::channel(None);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (control_tx, control_rx) = mpsc::channel(1);
        let signals = MonitorSignals {
            reaped: reaped_tx,
            exit: exit_tx,
        };
        tokio::spawn(monitor(child, control_rx, signals, drain).instrument(span));

        let process = Self {
            service: spec.service.clone(),
            port: spec.port,
            pid,
            reaped: ExitSignal { rx: reaped_rx },
            exit: ExitSignal { rx: exit_rx },
            control: control_tx,
        };

        // the reap status, not the drained signal: a grandchild may hold the pipes open
        let mut reaped = process.reaped.clone();
        if let Ok(outcome) = tokio::time::timeout(spec.settle, reaped.fired()).await {
            return Err(spec.launch_error(outcome.to_string()));
        }

        info!(service = %process.service, port = process.port, pid, "running");
        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Signal fired as soon as the child is reaped, before its output is drained
    pub fn reaped(&self) -> ExitSignal {
        self.reaped.clone()
    }

    /// Completion signal for this process
    pub fn exited(&self) -> ExitSignal {
        self.exit.clone()
    }

    /// Suspend until the process has exited and its output is drained
    pub async fn wait(&self) -> ExitOutcome {
        self.exited().fired().await
    }

    /// Kill and reap the process
    ///
    /// An already exited process is not killed again; this only waits for its output to drain.
    pub async fn terminate(&self) -> Result<()> {
        if self.reaped.has_fired() {
            self.wait().await;
            return Ok(());
        }

        debug!(service = %self.service, port = self.port, pid = self.pid, "killing process");
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.control.send(reply_tx).await.is_ok() {
            if let Ok(Err(e)) = reply_rx.await {
                return Err(RotatorError::Termination {
                    service: self.service.clone(),
                    pid: self.pid,
                    reason: e.to_string(),
                });
            }
            // a dropped reply means the process exited on its own first
        }

        debug!(service = %self.service, port = self.port, pid = self.pid, "waiting for process to exit");
        self.wait().await;
        Ok(())
    }
}

impl fmt::Debug for SupervisedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisedProcess")
            .field("service", &self.service)
            .field("port", &self.port)
            .field("pid", &self.pid)
            .field("exited", &self.exit.outcome())
            .finish()
    }
}

struct MonitorSignals {
    reaped: watch::Sender<Option<ExitOutcome>>,
    exit: watch::Sender<Option<ExitOutcome>>,
}

/// Owns the child: reaps it on natural exit or kills it on request, then
/// fires the completion signal once the output has been drained.
async fn monitor(
    mut child: Child,
    mut control: mpsc::Receiver<KillReply>,
    signals: MonitorSignals,
    drain: JoinHandle<()>,
) {
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                if status.success() {
                    info!(%status, "process exited");
                } else {
                    warn!(%status, "process exited");
                }
                ExitOutcome::Exited(status)
            }
            Err(e) => {
                error!(error = %e, "failed to collect exit status");
                ExitOutcome::Unknown
            }
        },
        // `None` means the owning handle was dropped; the child goes with it
        request = control.recv() => {
            let result = match child.start_kill() {
                Ok(()) => child.wait().await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Some(reply) = request {
                let _ = reply.send(result);
            }
            ExitOutcome::Killed
        }
    };

    signals.reaped.send_replace(Some(outcome));

    if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
        debug!("output still open after exit; detaching reader");
    }

    signals.exit.send_replace(Some(outcome));
}

/// Emit each output line at its classified level
async fn drain_output<S>(mut output: S, classifier: Arc<dyn LineClassifier>, service: String)
where
    S: Stream<Item = io::Result<String>> + Unpin,
{
    while let Some(line) = output.next().await {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => {
                let (level, message) = classifier.classify(&line);
                match level {
                    LogLevel::Debug => debug!("{}", message),
                    LogLevel::Info => info!("{}", message),
                    LogLevel::Warn => warn!("{}", message),
                    LogLevel::Error => error!("{}", message),
                }
            }
            Err(source) => {
                let e = RotatorError::Stream {
                    service: service.clone(),
                    source,
                };
                error!(error = %e, "output error");
            }
        }
    }
}

/// Line stream over a pipe, tolerant of invalid UTF-8
fn lines<R>(reader: R) -> std::pin::Pin<Box<dyn Stream<Item = io::Result<String>> + Send>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    Box::pin(futures::stream::unfold(
        Some(BufReader::new(reader)),
        |state| async move {
            let mut reader = state?;
            let mut buf = Vec::new();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => None,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    Some((Ok(line), Some(reader)))
                }
                Err(e) => Some((Err(e), None)),
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("test", 0, "sh")
            .arg("-c")
            .arg(script)
            .settle(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_start_reports_early_exit_as_launch_error() {
        let err = SupervisedProcess::start(sh("exit 3")).await.unwrap_err();
        match err {
            RotatorError::Launch { service, reason, .. } => {
                assert_eq!(service, "test");
                assert!(reason.contains('3'), "reason was {reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_start_fails_when_child_exits_but_grandchild_keeps_pipes() {
        let spec = sh("sleep 3 & exit 1").settle(Duration::from_millis(250));
        let started = std::time::Instant::now();

        let err = SupervisedProcess::start(spec).await.unwrap_err();
        assert!(matches!(err, RotatorError::Launch { .. }), "got {err}");
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_reaped_fires_before_output_drains() {
        let process = SupervisedProcess::start(sh("sleep 0.3; sleep 3 & exit 4"))
            .await
            .unwrap();

        let mut reaped = process.reaped();
        let outcome = tokio::time::timeout(Duration::from_secs(1), reaped.fired())
            .await
            .unwrap();
        assert!(matches!(outcome, ExitOutcome::Exited(status) if status.code() == Some(4)));
        assert!(!process.exited().has_fired());

        // nothing left to kill; terminate only waits for the output to drain
        tokio::time::timeout(Duration::from_secs(5), process.terminate())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(process.exited().outcome(), Some(outcome));
    }

    #[tokio::test]
    async fn test_start_missing_program() {
        let spec = ProcessSpec::new("ghost", 1, "/nonexistent/definitely-not-here");
        let err = SupervisedProcess::start(spec).await.unwrap_err();
        assert!(matches!(err, RotatorError::Launch { port: 1, .. }));
    }

    #[tokio::test]
    async fn test_terminate_running_process() {
        let process = SupervisedProcess::start(sh("exec sleep 30")).await.unwrap();
        assert!(process.pid() > 0);
        assert!(!process.exited().has_fired());

        process.terminate().await.unwrap();
        assert_eq!(process.exited().outcome(), Some(ExitOutcome::Killed));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let process = SupervisedProcess::start(sh("sleep 0.3")).await.unwrap();
        let outcome = process.wait().await;
        assert!(matches!(outcome, ExitOutcome::Exited(status) if status.success()));

        process.terminate().await.unwrap();
        process.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_signal_observable_by_late_subscribers() {
        let process = SupervisedProcess::start(sh("sleep 0.2; exit 7")).await.unwrap();
        let mut early = process.exited();
        let first = early.fired().await;

        // subscribe after the signal has fired
        let mut late = process.exited();
        assert!(late.has_fired());
        assert_eq!(late.fired().await, first);
        assert_eq!(early.fired().await, first);
        assert!(matches!(first, ExitOutcome::Exited(status) if status.code() == Some(7)));
    }

    #[tokio::test]
    async fn test_chatty_process_does_not_stall() {
        // far more output than a pipe buffer holds
        let process = SupervisedProcess::start(sh(
            "i=0; while [ $i -lt 20000 ]; do echo line $i; echo err $i >&2; i=$((i+1)); done; sleep 0.5",
        ))
        .await
        .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(20), process.wait())
            .await
            .unwrap();
        assert!(matches!(outcome, ExitOutcome::Exited(status) if status.success()));
    }

    #[tokio::test]
    async fn test_drop_kills_child() {
        let process = SupervisedProcess::start(sh("exec sleep 30")).await.unwrap();
        let mut exit = process.exited();
        drop(process);

        let outcome = tokio::time::timeout(Duration::from_secs(5), exit.fired())
            .await
            .unwrap();
        assert_eq!(outcome, ExitOutcome::Killed);
    }

    #[tokio::test]
    async fn test_lines_handles_invalid_utf8() {
        let data: &[u8] = b"ok\r\n\xff\xfe bad\nlast";
        let collected: Vec<String> = lines(data)
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0], "ok");
        assert!(collected[1].ends_with(" bad"));
        assert_eq!(collected[2], "last");
    }
}
