//! Server process management
//!
//! Owns the lifecycle of the external language server process and drains
//! its stderr, independent of the transport that talks over its stdio.

use crate::io::transport::{StdioTransport, Transport};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// How long a graceful stop waits for the process to exit by itself
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a graceful stop waits after SIGTERM before escalating to SIGKILL
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for the exit to be observed after SIGKILL
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Process State
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Close stdin and give the process a moment to exit, then SIGTERM,
    /// then SIGKILL
    Graceful,
    /// SIGKILL
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running { pid: u32 },
    Stopped,
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

/// Event fired when the server process exits on its own
#[derive(Debug, Clone)]
pub struct ProcessExitEvent {
    pub pid: Option<u32>,
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
}

/// Handler for process exit events
#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

// ============================================================================
// Process Manager Trait
// ============================================================================

#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Spawn the process
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Stop the process
    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    fn is_running(&self) -> bool;

    /// Take the stdio transport created at start. Can only be taken once.
    fn create_stdio_transport(&mut self) -> Result<StdioTransport, Self::Error>;

    /// Synchronous SIGKILL for Drop implementations
    fn kill_sync(&mut self);
}

// ============================================================================
// Server Process
// ============================================================================

type StderrHandler = Box<dyn Fn(String) + Send + Sync>;

/// A language server child process with piped stdio
pub struct ServerProcess {
    command: PathBuf,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    state: Arc<Mutex<ProcessState>>,
    stdio_transport: Option<StdioTransport>,
    stderr_handler: Option<StderrHandler>,
    stderr_task: Option<JoinHandle<()>>,
    wait_task: Option<JoinHandle<()>>,
    exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

impl ServerProcess {
    pub fn new(
        command: impl Into<PathBuf>,
        args: Vec<String>,
        working_directory: Option<PathBuf>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            working_directory,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdio_transport: None,
            stderr_handler: None,
            stderr_task: None,
            wait_task: None,
            exit_handler: None,
        }
    }

    /// Get current process state
    pub fn get_state(&self) -> ProcessState {
        // Poisoned mutex indicates a bug elsewhere, panic is appropriate
        self.state.lock().unwrap().clone()
    }

    /// Install a handler for lines written to stderr. Must be set before `start`.
    pub fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Box::new(handler));
    }

    /// Install a handler fired when the process exits. Must be set before `start`.
    pub fn on_process_exit(&mut self, handler: Arc<dyn ProcessExitHandler>) {
        self.exit_handler = Some(handler);
    }

    /// Always drains stderr so a chatty server never blocks on a full pipe
    fn spawn_stderr_monitor(&mut self, stderr: tokio::process::ChildStderr) {
        if self.stderr_task.is_some() {
            return;
        }

        let handler = self.stderr_handler.take();
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ServerProcess: stderr EOF reached");
                        break;
                    }
                    Ok(_) => {
                        let content = line.trim_end().to_string();
                        if content.is_empty() {
                            continue;
                        }
                        match handler {
                            Some(ref handler) => handler(content),
                            None => trace!("ServerProcess: stderr drained: {}", content),
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from server stderr: {}", e);
                        break;
                    }
                }
            }
        });

        self.stderr_task = Some(task);
    }

    fn spawn_wait_task(&mut self, mut child: Child) {
        let pid = self.get_state().pid();
        let exit_handler = self.exit_handler.clone();
        let state = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    info!("Server process {:?} exited with status: {}", pid, status);
                    status.code()
                }
                Err(e) => {
                    error!("Error waiting for server process: {}", e);
                    None
                }
            };

            if let Ok(mut process_state) = state.lock() {
                *process_state = ProcessState::Stopped;
            }

            if let Some(handler) = &exit_handler {
                handler.on_process_exit(ProcessExitEvent { pid, code }).await;
            }
        });

        self.wait_task = Some(task);
    }

    /// Wait for the wait task to observe the exit; true once it has
    async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let Some(task) = self.wait_task.as_mut() else {
            return !self.get_state().is_running();
        };
        if tokio::time::timeout(timeout, task).await.is_err() {
            return false;
        }
        self.wait_task = None;
        true
    }

    fn finish_stop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        *self.state.lock().unwrap() = ProcessState::Stopped;
    }

    #[cfg(unix)]
    fn signal(pid: u32, signal: libc::c_int) -> bool {
        // SAFETY: kill(2) has no memory-safety preconditions
        unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
    }
}

#[async_trait]
impl ProcessManager for ServerProcess {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.is_running() {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting server process: {}", self.command.display());

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(working_dir) = &self.working_directory {
            command.current_dir(working_dir);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: self.command.display().to_string(),
            source,
        })?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Io(io::Error::other("Failed to get process ID")))?;
        debug!("Server process started with PID: {}", pid);
        *self.state.lock().unwrap() = ProcessState::Running { pid };

        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        self.stdio_transport = Some(StdioTransport::new(stdin, stdout));
        self.spawn_stderr_monitor(stderr);
        self.spawn_wait_task(child);

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return Err(ProcessError::NotStarted),
        };

        // Closing stdin is often enough for a server that already got `exit`
        if let Some(mut transport) = self.stdio_transport.take() {
            let _ = transport.close().await;
        }

        if mode == StopMode::Graceful {
            if self.wait_for_exit(GRACEFUL_EXIT_TIMEOUT).await {
                debug!("Server process {} exited on its own", pid);
                self.finish_stop();
                return Ok(());
            }

            #[cfg(unix)]
            {
                if Self::signal(pid, libc::SIGTERM) {
                    debug!("Sent SIGTERM to server process {}", pid);
                }
            }

            if self.wait_for_exit(TERMINATE_TIMEOUT).await {
                self.finish_stop();
                return Ok(());
            }
            warn!("Server process {} ignored SIGTERM, killing it", pid);
        }

        #[cfg(unix)]
        {
            if Self::signal(pid, libc::SIGKILL) {
                debug!("Sent SIGKILL to server process {}", pid);
            }
        }
        #[cfg(not(unix))]
        {
            warn!("Process termination by signal is not supported on this platform");
        }

        if !self.wait_for_exit(KILL_TIMEOUT).await {
            error!("Server process {} still not reaped after SIGKILL", pid);
        }
        self.finish_stop();

        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn create_stdio_transport(&mut self) -> Result<StdioTransport, Self::Error> {
        self.stdio_transport.take().ok_or(ProcessError::NotStarted)
    }

    fn kill_sync(&mut self) {
        let Some(pid) = self.get_state().pid() else {
            return;
        };

        #[cfg(unix)]
        {
            if Self::signal(pid, libc::SIGKILL) {
                debug!("Sent SIGKILL to server process {}", pid);
            }
        }
        #[cfg(not(unix))]
        {
            warn!("Synchronous kill not supported, server process {} may remain", pid);
        }

        self.finish_stop();
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.is_running() {
            debug!("ServerProcess dropped while running, killing it");
            self.kill_sync();
        }
    }
}
