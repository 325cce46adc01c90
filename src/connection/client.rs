//! Client connection to the language server
//!
//! [`LanguageClient`] launches the server, performs the handshake, forwards
//! document and file-change notifications for the documents its selector
//! accepts, and tears everything down on stop. A connection is single use:
//! once stopped it never starts again.

use async_trait::async_trait;
use lsp_types::{ClientInfo, FileChangeType, FileEvent};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::connection::config::{ConnectionConfig, SERVER_NAME};
use crate::connection::error::ConnectionError;
use crate::connection::watcher::{FileChange, FileChangeKind, FileWatcher};
use crate::host::Notifier;
use crate::io::{ProcessExitEvent, ProcessExitHandler, ProcessManager, ServerProcess, StopMode};
use crate::lsp::{LspClient, to_lsp_uri};

// ============================================================================
// Client Connection Trait
// ============================================================================

/// A startable, stoppable connection to the server
///
/// Both operations take `&self` so a start can run in the background while
/// the owner keeps the ability to stop.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClientConnection: Send + Sync {
    /// Launch the server and complete the handshake
    async fn start(&self) -> Result<(), ConnectionError>;

    /// Tear down; a no-op when nothing is running
    async fn stop(&self) -> Result<(), ConnectionError>;

    fn is_running(&self) -> bool;
}

// ============================================================================
// Language Client
// ============================================================================

enum ConnectionState {
    Idle,
    Running(Box<RunningSession>),
    Stopped,
}

struct RunningSession {
    process: ServerProcess,
    client: Arc<Mutex<LspClient>>,
    watch_cancel: CancellationToken,
    watch_task: Option<JoinHandle<()>>,
}

/// Handshake results that outlive `launch`
struct Attached {
    client: Arc<Mutex<LspClient>>,
    watch_cancel: CancellationToken,
    watch_task: JoinHandle<()>,
}

pub struct LanguageClient {
    config: ConnectionConfig,
    notifier: Arc<dyn Notifier>,
    state: Mutex<ConnectionState>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    open_documents: StdMutex<HashSet<Url>>,
}

impl LanguageClient {
    pub fn new(config: ConnectionConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            notifier,
            state: Mutex::new(ConnectionState::Idle),
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            open_documents: StdMutex::new(HashSet::new()),
        }
    }

    async fn launch(&self) -> Result<RunningSession, ConnectionError> {
        let root_url = workspace_url(&self.config.workspace_root)?;

        let mut process = ServerProcess::new(
            &self.config.command,
            Vec::new(),
            self.config.working_directory.clone(),
        );
        process.on_stderr_line(|line| debug!(target: "confit_lsp::stderr", "{}", line));
        process.on_process_exit(Arc::new(ServerExitWatch {
            running: Arc::clone(&self.running),
        }));
        process.start().await?;

        match self.attach(&mut process, &root_url).await {
            Ok(attached) => Ok(RunningSession {
                process,
                client: attached.client,
                watch_cancel: attached.watch_cancel,
                watch_task: Some(attached.watch_task),
            }),
            Err(e) => {
                if process.is_running() {
                    let _ = process.stop(StopMode::Force).await;
                }
                Err(e)
            }
        }
    }

    async fn attach(
        &self,
        process: &mut ServerProcess,
        root_url: &Url,
    ) -> Result<Attached, ConnectionError> {
        let lsp = &self.config.lsp_config;
        let transport = process.create_stdio_transport()?;
        let client_info = ClientInfo {
            name: lsp.client_name.clone(),
            version: Some(lsp.client_version.clone()),
        };

        let mut client = LspClient::new(transport, client_info, lsp.request_timeout).await;
        client
            .initialize(Some(root_url), lsp.initialization_timeout)
            .await?;
        let client = Arc::new(Mutex::new(client));

        let watcher = FileWatcher::new(
            &self.config.workspace_root,
            self.config.watch_pattern.clone(),
            self.config.watch_debounce,
        )?;
        let watch_cancel = self.cancel.child_token();
        let watch_task = tokio::spawn(forward_file_changes(
            watcher,
            Arc::clone(&client),
            watch_cancel.clone(),
        ));

        Ok(Attached {
            client,
            watch_cancel,
            watch_task,
        })
    }

    async fn lsp_client(&self) -> Result<Arc<Mutex<LspClient>>, ConnectionError> {
        match &*self.state.lock().await {
            ConnectionState::Running(_) if !self.is_running() => {
                Err(ConnectionError::ServerExited)
            }
            ConnectionState::Running(session) => Ok(Arc::clone(&session.client)),
            _ => Err(ConnectionError::NotStarted),
        }
    }

    fn selector_accepts(&self, uri: &Url, language_id: &str) -> bool {
        let accepted = self.config.document_selector.matches(uri, language_id);
        if !accepted {
            trace!("Document outside selector: {} ({})", uri, language_id);
        }
        accepted
    }

    fn is_open(&self, uri: &Url) -> bool {
        self.open_documents.lock().unwrap().contains(uri)
    }

    // ------------------------------------------------------------------
    // Document synchronization
    //
    // Each returns whether the notification was forwarded. Only documents
    // accepted by the selector at open time are tracked; later events for
    // other documents are ignored.
    // ------------------------------------------------------------------

    pub async fn did_open(
        &self,
        uri: &Url,
        language_id: &str,
        version: i32,
        text: String,
    ) -> Result<bool, ConnectionError> {
        if !self.selector_accepts(uri, language_id) {
            return Ok(false);
        }
        let client = self.lsp_client().await?;
        client.lock().await.did_open(uri, language_id, version, text)?;
        self.open_documents.lock().unwrap().insert(uri.clone());
        Ok(true)
    }

    pub async fn did_change(
        &self,
        uri: &Url,
        version: i32,
        text: String,
    ) -> Result<bool, ConnectionError> {
        if !self.is_open(uri) {
            return Ok(false);
        }
        let client = self.lsp_client().await?;
        client.lock().await.did_change(uri, version, text)?;
        Ok(true)
    }

    pub async fn did_save(&self, uri: &Url, text: Option<String>) -> Result<bool, ConnectionError> {
        if !self.is_open(uri) {
            return Ok(false);
        }
        let client = self.lsp_client().await?;
        client.lock().await.did_save(uri, text)?;
        Ok(true)
    }

    pub async fn did_close(&self, uri: &Url) -> Result<bool, ConnectionError> {
        if !self.open_documents.lock().unwrap().remove(uri) {
            return Ok(false);
        }
        let client = self.lsp_client().await?;
        client.lock().await.did_close(uri)?;
        Ok(true)
    }
}

impl RunningSession {
    async fn shutdown(mut self) -> Result<(), ConnectionError> {
        self.watch_cancel.cancel();
        if let Some(task) = self.watch_task.take() {
            let _ = task.await;
        }

        {
            let mut client = self.client.lock().await;
            if let Err(e) = client.shutdown().await {
                warn!("Server did not acknowledge shutdown: {}", e);
            }
            client.close().await;
        }

        if self.process.is_running() {
            self.process.stop(StopMode::Graceful).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ClientConnection for LanguageClient {
    async fn start(&self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        match &*state {
            ConnectionState::Idle => {}
            ConnectionState::Running(_) => return Err(ConnectionError::AlreadyStarted),
            ConnectionState::Stopped => return Err(ConnectionError::Stopped),
        }

        info!(
            "Starting {} from {}",
            SERVER_NAME,
            self.config.command.display()
        );

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConnectionError::Cancelled),
            result = self.launch() => result,
        };

        match result {
            Ok(session) => {
                self.running.store(true, Ordering::SeqCst);
                // The exit watch only clears a flag that is already set
                if !session.process.is_running() {
                    self.running.store(false, Ordering::SeqCst);
                    warn!("{} exited right after the handshake", SERVER_NAME);
                }
                *state = ConnectionState::Running(Box::new(session));
                info!("{} is running", SERVER_NAME);
                Ok(())
            }
            Err(ConnectionError::Cancelled) => {
                debug!("Start of {} cancelled by stop", SERVER_NAME);
                *state = ConnectionState::Stopped;
                Err(ConnectionError::Cancelled)
            }
            Err(e) => {
                error!("Failed to start {}: {}", SERVER_NAME, e);
                self.notifier
                    .show_error_message(&format!("Couldn't start client {SERVER_NAME}: {e}"));
                *state = ConnectionState::Stopped;
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<(), ConnectionError> {
        // Abandon a start still in flight
        self.cancel.cancel();

        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, ConnectionState::Stopped);
        self.running.store(false, Ordering::SeqCst);
        self.open_documents.lock().unwrap().clear();

        match previous {
            ConnectionState::Running(session) => {
                info!("Stopping {}", SERVER_NAME);
                session.shutdown().await?;
                info!("{} stopped", SERVER_NAME);
                Ok(())
            }
            ConnectionState::Idle | ConnectionState::Stopped => {
                debug!("Stop requested with no running {}", SERVER_NAME);
                Ok(())
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Marks the connection as no longer running when the server exits by itself
struct ServerExitWatch {
    running: Arc<AtomicBool>,
}

#[async_trait]
impl ProcessExitHandler for ServerExitWatch {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        if self.running.swap(false, Ordering::SeqCst) {
            error!(
                "{} (pid {:?}) exited unexpectedly with code {:?}",
                SERVER_NAME, event.pid, event.code
            );
        }
    }
}

// ============================================================================
// File change forwarding
// ============================================================================

async fn forward_file_changes(
    mut watcher: FileWatcher,
    client: Arc<Mutex<LspClient>>,
    cancel: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = watcher.recv() => batch,
        };
        let Some(batch) = batch else {
            break;
        };

        let events = to_file_events(batch);
        if events.is_empty() {
            continue;
        }
        debug!("Forwarding {} watched file change(s)", events.len());
        if let Err(e) = client.lock().await.did_change_watched_files(events) {
            warn!("Failed to forward file changes: {}", e);
        }
    }
    trace!("File change forwarding finished");
}

/// Convert watcher output to protocol events, dropping paths with no file URI
pub fn to_file_events(changes: Vec<FileChange>) -> Vec<FileEvent> {
    changes
        .into_iter()
        .filter_map(|change| {
            let url = Url::from_file_path(&change.path).ok()?;
            let uri = to_lsp_uri(&url).ok()?;
            let typ = match change.kind {
                FileChangeKind::Created => FileChangeType::CREATED,
                FileChangeKind::Changed => FileChangeType::CHANGED,
                FileChangeKind::Deleted => FileChangeType::DELETED,
            };
            Some(FileEvent::new(uri, typ))
        })
        .collect()
}

fn workspace_url(root: &Path) -> Result<Url, ConnectionError> {
    let invalid = || ConnectionError::InvalidWorkspaceRoot {
        path: root.to_path_buf(),
    };
    let absolute = std::path::absolute(root).map_err(|_| invalid())?;
    Url::from_directory_path(&absolute).map_err(|_| invalid())
}
