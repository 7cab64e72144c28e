//! Child process plumbing
//!
//! [`ProcessRunner`] is the seam between the supervisor and the operating
//! system. A spawned process is represented by a [`ProcessHandle`] (used to
//! request termination) and a stream of [`ProcessEvent`]s carrying its output
//! lines followed by exactly one exit notification.

use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait for output readers after the process exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Termination request delivered to a running process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    None,
    /// SIGTERM, escalated to a kill after the runner's grace period
    Graceful,
    /// Immediate kill
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    /// Whether termination was requested through the handle
    pub stopped: bool,
}

impl ExitInfo {
    /// A non-zero exit that nobody asked for
    pub fn is_failure(&self) -> bool {
        !self.stopped && matches!(self.code, Some(code) if code != 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { stream: OutputStream, line: String },
    Exited(ExitInfo),
}

/// Handle used to terminate a spawned process
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stop_tx: watch::Sender<StopRequest>,
    /// Set for OS children; cleared once the child has been reaped
    alive: Option<Arc<AtomicBool>>,
}

impl ProcessHandle {
    /// Create a handle and the receiver the process owner watches for stop requests
    pub fn new(pid: Option<u32>) -> (Self, watch::Receiver<StopRequest>) {
        let (stop_tx, stop_rx) = watch::channel(StopRequest::None);
        let handle = Self {
            pid,
            stop_tx,
            alive: None,
        };
        (handle, stop_rx)
    }

    /// Handle for an OS child that `force_kill` may signal directly
    fn for_child(pid: Option<u32>) -> (Self, watch::Receiver<StopRequest>, Arc<AtomicBool>) {
        let (mut handle, stop_rx) = Self::new(pid);
        let alive = Arc::new(AtomicBool::new(true));
        handle.alive = Some(Arc::clone(&alive));
        (handle, stop_rx, alive)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the process to terminate gracefully. Never blocks.
    pub fn kill(&self) {
        self.request(StopRequest::Graceful);
    }

    /// Kill the process immediately. Never blocks.
    ///
    /// OS children are signalled before returning, so the kill lands even if
    /// the runtime shuts down before the watcher task runs again.
    pub fn force_kill(&self) {
        self.request(StopRequest::Force);

        #[cfg(unix)]
        if let (Some(pid), Some(alive)) = (self.pid, &self.alive) {
            if alive.load(Ordering::SeqCst) {
                debug!(pid, "Sending SIGKILL");
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
            }
        }
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow() != StopRequest::None
    }

    fn request(&self, request: StopRequest) {
        self.stop_tx.send_if_modified(|current| {
            let escalates = matches!(
                (*current, request),
                (StopRequest::None, StopRequest::Graceful | StopRequest::Force)
                    | (StopRequest::Graceful, StopRequest::Force)
            );
            if escalates {
                *current = request;
            }
            escalates
        });
    }
}

/// A freshly spawned process
#[derive(Debug)]
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    /// Output lines, then one [`ProcessEvent::Exited`]
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Capability to launch child processes
pub trait ProcessRunner: Send + Sync {
    /// Spawn `program` with `args`. Must be called from within a tokio runtime.
    fn spawn(&self, program: &Path, args: &[OsString]) -> std::io::Result<SpawnedProcess>;
}

/// Runner backed by `tokio::process`
#[derive(Debug, Clone)]
pub struct TokioRunner {
    grace_period: Duration,
}

impl TokioRunner {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }
}

impl Default for TokioRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ProcessRunner for TokioRunner {
    fn spawn(&self, program: &Path, args: &[OsString]) -> std::io::Result<SpawnedProcess> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        info!(program = %program.display(), pid, "Process spawned");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(
                stdout,
                OutputStream::Stdout,
                events_tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(
                stderr,
                OutputStream::Stderr,
                events_tx.clone(),
            )));
        }

        let (handle, stop_rx, alive) = ProcessHandle::for_child(pid);
        tokio::spawn(watch_child(
            child,
            stop_rx,
            alive,
            readers,
            events_tx,
            self.grace_period,
        ));

        Ok(SpawnedProcess {
            handle,
            events: events_rx,
        })
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(ProcessEvent::Output { stream, line }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(stream = stream.as_str(), error = %e, "Stopped reading process output");
                break;
            }
        }
    }
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Stop(StopRequest),
    HandleDropped,
    GraceExpired,
}

async fn watch_child(
    mut child: Child,
    mut stop_rx: watch::Receiver<StopRequest>,
    alive: Arc<AtomicBool>,
    readers: Vec<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    grace_period: Duration,
) {
    let pid = child.id();
    let mut handle_alive = true;
    let mut kill_deadline: Option<tokio::time::Instant> = None;

    let status = loop {
        let deadline = kill_deadline;
        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            changed = stop_rx.changed(), if handle_alive => match changed {
                Ok(()) => Wake::Stop(*stop_rx.borrow_and_update()),
                Err(_) => Wake::HandleDropped,
            },
            _ = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => Wake::GraceExpired,
        };

        match wake {
            Wake::Exited(status) => {
                // The pid may be reused from here on
                alive.store(false, Ordering::SeqCst);
                break status;
            }
            Wake::Stop(StopRequest::Graceful) => {
                terminate(&mut child);
                kill_deadline.get_or_insert(tokio::time::Instant::now() + grace_period);
            }
            Wake::Stop(StopRequest::Force) => {
                debug!(pid, "Killing process");
                let _ = child.start_kill();
                kill_deadline = None;
            }
            Wake::Stop(StopRequest::None) => {}
            Wake::HandleDropped => handle_alive = false,
            Wake::GraceExpired => {
                warn!(
                    pid,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, killing process"
                );
                let _ = child.start_kill();
                kill_deadline = None;
            }
        }
    };

    // Let buffered output reach the receiver before the exit notification
    for reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
            debug!(pid, "Output reader did not finish after exit");
        }
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(pid, error = %e, "Error waiting for process");
            None
        }
    };
    let stopped = *stop_rx.borrow() != StopRequest::None;
    debug!(pid, ?code, stopped, "Process exited");
    let _ = events_tx.send(ProcessEvent::Exited(ExitInfo { code, stopped }));
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        debug!(pid, "Sending SIGTERM");
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        return;
    }

    let _ = child.start_kill();
}
