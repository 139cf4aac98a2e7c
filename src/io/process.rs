//! Process-backed transport
//!
//! Spawns the agent as a child process and speaks NDJSON over its
//! stdin/stdout. Closing asks the process to exit (stdin EOF plus SIGTERM on
//! unix) and force-kills it if it is still alive after
//! [`GRACEFUL_SHUTDOWN_TIMEOUT`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::io::transport::{DEFAULT_BUFFER_CAPACITY, StdioTransport, Transport, TransportError};
use crate::rpc::message::JsonRpcMessage;

/// Time a process gets to exit on its own before it is killed
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Configuration
// ============================================================================

/// Callback receiving the agent's stderr, one line at a time
pub type StderrHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Where the agent's stderr goes
#[derive(Clone, Default)]
pub enum StderrSink {
    /// Share the host's own stderr
    #[default]
    Inherit,
    /// Drop everything
    Discard,
    /// Forward each non-empty line to a callback
    Handler(StderrHandler),
}

impl fmt::Debug for StderrSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StderrSink::Inherit => f.write_str("Inherit"),
            StderrSink::Discard => f.write_str("Discard"),
            StderrSink::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// How to launch the agent process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Command to execute
    pub command: String,

    /// Command arguments
    pub args: Vec<String>,

    /// Variables added to the inherited environment
    pub env: HashMap<String, String>,

    /// Working directory for the process (optional)
    pub working_dir: Option<PathBuf>,

    /// Destination of the process's stderr
    pub stderr: StderrSink,

    /// Capacity of the inbound message queue
    pub buffer_capacity: usize,
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            stderr: StderrSink::default(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn stderr(mut self, sink: StderrSink) -> Self {
        self.stderr = sink;
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }
}

// ============================================================================
// Process State Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,

    #[error("Exit status of the process could not be collected")]
    ExitStatusUnavailable,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is currently running
    Running { pid: Option<u32> },
    /// Process has exited; `None` if its status could not be collected
    Exited(Option<ExitStatus>),
}

impl ProcessState {
    pub fn is_exited(&self) -> bool {
        matches!(self, ProcessState::Exited(_))
    }
}

// ============================================================================
// Process Transport
// ============================================================================

/// Transport that owns a spawned agent process
pub struct ProcessTransport {
    transport: StdioTransport,

    pid: Option<u32>,

    /// Published by the wait task
    state: watch::Receiver<ProcessState>,

    /// Requests for the wait task, which is the only place the child is signalled
    signals: mpsc::UnboundedSender<Signal>,
}

/// Request handled by the wait task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// SIGTERM on unix
    Terminate,
    Kill,
}

impl ProcessTransport {
    /// Spawn the process and connect a transport to its stdio
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: ProcessConfig) -> Result<Self, ProcessError> {
        info!("Starting process: {} {:?}", config.command, config.args);

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(match config.stderr {
                StderrSink::Inherit => Stdio::inherit(),
                StderrSink::Discard => Stdio::null(),
                StderrSink::Handler(_) => Stdio::piped(),
            });

        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: config.command.clone(),
            source,
        })?;

        let pid = child.id();
        info!("Process started with PID: {:?}", pid);

        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;

        if let StderrSink::Handler(handler) = config.stderr {
            let stderr = child
                .stderr
                .take()
                .ok_or(ProcessError::StderrNotAvailable)?;
            tokio::spawn(Self::stderr_task(stderr, handler));
        }

        let (state_tx, state_rx) = watch::channel(ProcessState::Running { pid });
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::wait_task(child, signal_rx, state_tx));

        Ok(Self {
            transport: StdioTransport::with_capacity(stdout, stdin, config.buffer_capacity),
            pid,
            state: state_rx,
            signals: signal_tx,
        })
    }

    /// OS process id, if the platform reported one
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Check if the process has exited
    pub fn is_terminated(&self) -> bool {
        self.state.borrow().is_exited()
    }

    /// Wait for the process to exit and return its status
    pub async fn wait(&self) -> Result<ExitStatus, ProcessError> {
        let mut state = self.state.clone();
        let exited = state
            .wait_for(ProcessState::is_exited)
            .await
            .map_err(|_| ProcessError::ExitStatusUnavailable)?;

        match &*exited {
            ProcessState::Exited(Some(status)) => Ok(*status),
            _ => Err(ProcessError::ExitStatusUnavailable),
        }
    }

    /// Forward stderr lines to the handler until the pipe closes
    async fn stderr_task(stderr: ChildStderr, handler: StderrHandler) {
        let mut lines = BufReader::new(stderr).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end().to_string();
                    if !line.is_empty() {
                        trace!("ProcessTransport: stderr line: {}", line);
                        handler(line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read from stderr: {}", e);
                    break;
                }
            }
        }

        trace!("ProcessTransport: stderr monitoring finished");
    }

    /// Own the child until it exits, signalling it on request and killing it
    /// when the transport is dropped
    ///
    /// The child is only reaped here, so a signal sent from this task can never
    /// reach a recycled pid.
    async fn wait_task(
        mut child: Child,
        mut signals: mpsc::UnboundedReceiver<Signal>,
        state: watch::Sender<ProcessState>,
    ) {
        let status = loop {
            let signal = tokio::select! {
                status = child.wait() => break status,
                signal = signals.recv() => signal,
            };

            match signal {
                Some(Signal::Terminate) => Self::send_terminate(&child),
                // Kill request, or every sender is gone
                Some(Signal::Kill) | None => {
                    debug!("ProcessTransport: force killing process");
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill process: {}", e);
                    }
                    break child.wait().await;
                }
            }
        };

        match status {
            Ok(status) => {
                info!("Process exited with status: {}", status);
                state.send_replace(ProcessState::Exited(Some(status)));
            }
            Err(e) => {
                error!("Error waiting for child process: {}", e);
                state.send_replace(ProcessState::Exited(None));
            }
        }
    }

    /// Ask a child that has not been reaped yet to exit on its own
    fn send_terminate(child: &Child) {
        #[cfg(unix)]
        {
            let Some(pid) = child.id() else { return };
            // SAFETY: kill(2) has no memory-safety preconditions; `child` is
            // owned by the caller and not reaped, so the pid is still ours.
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
                debug!("Sent SIGTERM to process {}", pid);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child;
            debug!("No graceful termination signal on this platform; relying on stdin EOF");
        }
    }

    /// Graceful-then-forced shutdown of the process
    async fn terminate(&self) {
        if self.is_terminated() {
            return;
        }

        // Fails only when the wait task is gone, i.e. the child was reaped
        let _ = self.signals.send(Signal::Terminate);

        if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, self.wait())
            .await
            .is_ok()
        {
            return;
        }

        warn!(
            "Process {:?} did not exit within {:?}, killing it",
            self.pid, GRACEFUL_SHUTDOWN_TIMEOUT
        );
        let _ = self.signals.send(Signal::Kill);
        if let Err(e) = self.wait().await {
            warn!("Failed to collect exit status after kill: {}", e);
        }
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        self.transport.send(message).await
    }

    async fn receive(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<JsonRpcMessage>, TransportError> {
        self.transport.receive(timeout).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Closing stdin first lets well-behaved agents exit on EOF
        self.transport.close().await?;
        self.terminate().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}
