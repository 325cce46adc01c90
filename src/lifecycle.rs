//! Client lifecycle
//!
//! [`LifecycleManager`] owns at most one connection. Activation resolves the
//! server command, builds the connection configuration and starts the
//! connection in the background. Deactivation stops it exactly once.
//!
//! ```text
//! Uninitialized --activate--> Started --deactivate--> Stopped
//!                                ^                       |
//!                                +-------activate--------+
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::config::{DocumentSelector, TOML_WATCH_GLOB};
use crate::connection::{
    ClientConnection, ConnectionConfig, ConnectionConfigError, ConnectionError, LanguageClient,
};
use crate::host::{ExtensionContext, Notifier};
use crate::resolver::{ResolvedCommand, resolve_server_command};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Client already started")]
    AlreadyStarted,

    #[error("Configuration error: {0}")]
    Config(#[from] ConnectionConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Started,
    Stopped,
}

/// Builds the connection for an activation
pub trait ConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: ConnectionConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<dyn ClientConnection>;
}

/// Produces [`LanguageClient`]s
#[derive(Debug, Default)]
pub struct LanguageClientFactory;

impl ConnectionFactory for LanguageClientFactory {
    fn create(
        &self,
        config: ConnectionConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<dyn ClientConnection> {
        Arc::new(LanguageClient::new(config, notifier))
    }
}

/// Overrides applied to every connection configuration
#[derive(Debug, Clone, Default)]
pub struct LifecycleOptions {
    pub initialization_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

/// Completion of the background start; awaiting it is optional
#[must_use = "dropping the handle detaches the start, it does not cancel it"]
pub struct StartHandle(JoinHandle<Result<(), ConnectionError>>);

impl StartHandle {
    pub async fn wait(self) -> Result<(), LifecycleError> {
        self.0.await??;
        Ok(())
    }
}

/// Completion of the stop issued by `deactivate`
#[must_use = "dropping the handle detaches the stop, it does not cancel it"]
pub struct StopHandle(JoinHandle<Result<(), ConnectionError>>);

impl StopHandle {
    pub async fn wait(self) -> Result<(), LifecycleError> {
        self.0.await??;
        Ok(())
    }
}

pub struct LifecycleManager {
    factory: Arc<dyn ConnectionFactory>,
    options: LifecycleOptions,
    connection: Option<Arc<dyn ClientConnection>>,
    state: LifecycleState,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(Arc::new(LanguageClientFactory))
    }
}

impl LifecycleManager {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            options: LifecycleOptions::default(),
            connection: None,
            state: LifecycleState::Uninitialized,
        }
    }

    pub fn with_options(mut self, options: LifecycleOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Resolve the server, configure the connection and start it in the
    /// background. Returns without waiting for the handshake.
    pub async fn activate(
        &mut self,
        context: &ExtensionContext,
    ) -> Result<StartHandle, LifecycleError> {
        if self.state == LifecycleState::Started {
            warn!("Activation requested while the client is running");
            return Err(LifecycleError::AlreadyStarted);
        }

        let command = resolve_server_command(&context.registry, context.notifier.as_ref()).await;
        let config = self.connection_config(command, &context.workspace_root)?;
        debug!("Connection config: {:?}", config);

        let connection = self
            .factory
            .create(config, Arc::clone(&context.notifier));
        self.connection = Some(Arc::clone(&connection));
        self.state = LifecycleState::Started;
        info!("Client activated");

        // Start failures are reported by the connection itself
        let handle = tokio::spawn(async move {
            let result = connection.start().await;
            if let Err(e) = &result {
                debug!("Background start finished with error: {}", e);
            }
            result
        });
        Ok(StartHandle(handle))
    }

    /// Stop the connection if there is one
    ///
    /// Returns `None`, doing nothing, when no connection exists.
    pub fn deactivate(&mut self) -> Option<StopHandle> {
        let Some(connection) = self.connection.take() else {
            debug!("Deactivation with no client, nothing to stop");
            return None;
        };

        self.state = LifecycleState::Stopped;
        info!("Client deactivating");
        let handle = tokio::spawn(async move { connection.stop().await });
        Some(StopHandle(handle))
    }

    fn connection_config(
        &self,
        command: ResolvedCommand,
        workspace_root: &Path,
    ) -> Result<ConnectionConfig, ConnectionConfigError> {
        let mut builder = ConnectionConfig::builder(command.into_path_buf(), workspace_root)
            .document_selector(DocumentSelector::toml_files())
            .watch_glob(TOML_WATCH_GLOB);

        if let Some(timeout) = self.options.initialization_timeout {
            builder = builder.initialization_timeout(timeout);
        }
        if let Some(timeout) = self.options.request_timeout {
            builder = builder.request_timeout(timeout);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::client::MockClientConnection;
    use crate::environment::discovery::MockEnvironmentDiscovery;
    use crate::environment::{EnvironmentPath, ExtensionRegistry, PYTHON_EXTENSION_ID};
    use crate::host::MockNotifier;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    /// Counts calls; optionally fails or blocks in `start`
    #[derive(Default)]
    struct RecordingConnection {
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_start: bool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl ClientConnection for RecordingConnection {
        async fn start(&self) -> Result<(), ConnectionError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_start {
                Err(ConnectionError::NotStarted)
            } else {
                Ok(())
            }
        }

        async fn stop(&self) -> Result<(), ConnectionError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.starts.load(Ordering::SeqCst) > self.stops.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        fail_start: bool,
        gate: Option<Arc<Notify>>,
        created: Mutex<Vec<(ConnectionConfig, Arc<RecordingConnection>)>>,
    }

    impl RecordingFactory {
        fn created(&self) -> Vec<(ConnectionConfig, Arc<RecordingConnection>)> {
            self.created.lock().unwrap().clone()
        }
    }

    impl ConnectionFactory for RecordingFactory {
        fn create(
            &self,
            config: ConnectionConfig,
            _notifier: Arc<dyn Notifier>,
        ) -> Arc<dyn ClientConnection> {
            let connection = Arc::new(RecordingConnection {
                fail_start: self.fail_start,
                gate: self.gate.clone(),
                ..Default::default()
            });
            self.created
                .lock()
                .unwrap()
                .push((config, Arc::clone(&connection)));
            connection
        }
    }

    /// Hands out one fixed connection
    struct FixedFactory(Arc<dyn ClientConnection>);

    impl ConnectionFactory for FixedFactory {
        fn create(&self, _: ConnectionConfig, _: Arc<dyn Notifier>) -> Arc<dyn ClientConnection> {
            Arc::clone(&self.0)
        }
    }

    fn context() -> ExtensionContext {
        let mut discovery = MockEnvironmentDiscovery::new();
        discovery.expect_is_active().return_const(true);
        discovery
            .expect_active_environment_path()
            .returning(|| Ok(Some(EnvironmentPath::new("/env/bin/python"))));
        let mut registry = ExtensionRegistry::new();
        registry.register(PYTHON_EXTENSION_ID, Arc::new(discovery));

        let mut notifier = MockNotifier::new();
        notifier.expect_show_error_message().never();

        ExtensionContext::new("/srv/app", Arc::new(registry), Arc::new(notifier))
    }

    #[tokio::test]
    async fn test_deactivate_before_activate_is_noop() {
        let factory = Arc::new(RecordingFactory::default());
        let mut manager = LifecycleManager::new(factory.clone());

        assert!(manager.deactivate().is_none());
        assert_eq!(manager.state(), LifecycleState::Uninitialized);
        assert!(factory.created().is_empty());
    }

    #[tokio::test]
    async fn test_activate_then_deactivate_stops_once() {
        let factory = Arc::new(RecordingFactory::default());
        let mut manager = LifecycleManager::new(factory.clone());

        manager.activate(&context()).await.unwrap().wait().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Started);

        let stop = manager.deactivate().expect("stop handle");
        stop.wait().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert!(manager.deactivate().is_none());

        let created = factory.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].1.starts.load(Ordering::SeqCst), 1);
        assert_eq!(created[0].1.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_config_targets_toml() {
        let factory = Arc::new(RecordingFactory::default());
        let mut manager = LifecycleManager::new(factory.clone());

        manager.activate(&context()).await.unwrap().wait().await.unwrap();

        let (config, _) = &factory.created()[0];
        assert_eq!(config.command, PathBuf::from("/env/bin/confit-lsp"));
        assert_eq!(config.workspace_root, PathBuf::from("/srv/app"));
        assert_eq!(config.document_selector, DocumentSelector::toml_files());
        assert_eq!(config.watch_pattern.as_str(), "**/*.toml");
    }

    #[tokio::test]
    async fn test_missing_python_extension_still_activates() {
        let factory = Arc::new(RecordingFactory::default());
        let mut manager = LifecycleManager::new(factory.clone());

        let mut notifier = MockNotifier::new();
        notifier
            .expect_show_error_message()
            .times(1)
            .return_const(());
        let context = ExtensionContext::new(
            "/srv/app",
            Arc::new(ExtensionRegistry::new()),
            Arc::new(notifier),
        );

        manager.activate(&context).await.unwrap().wait().await.unwrap();
        assert_eq!(
            factory.created()[0].0.command,
            PathBuf::from(".venv/bin/confit-lsp")
        );
    }

    #[tokio::test]
    async fn test_second_activation_is_rejected() {
        let factory = Arc::new(RecordingFactory::default());
        let mut manager = LifecycleManager::new(factory.clone());

        manager.activate(&context()).await.unwrap().wait().await.unwrap();
        assert!(matches!(
            manager.activate(&context()).await,
            Err(LifecycleError::AlreadyStarted)
        ));
        assert_eq!(factory.created().len(), 1);
    }

    #[tokio::test]
    async fn test_reactivation_after_stop_builds_fresh_connection() {
        let factory = Arc::new(RecordingFactory::default());
        let mut manager = LifecycleManager::new(factory.clone());

        manager.activate(&context()).await.unwrap().wait().await.unwrap();
        manager.deactivate().unwrap().wait().await.unwrap();
        manager.activate(&context()).await.unwrap().wait().await.unwrap();

        let created = factory.created();
        assert_eq!(created.len(), 2);
        assert!(!Arc::ptr_eq(&created[0].1, &created[1].1));
        assert_eq!(manager.state(), LifecycleState::Started);
    }

    #[tokio::test]
    async fn test_activate_does_not_wait_for_start() {
        let gate = Arc::new(Notify::new());
        let factory = Arc::new(RecordingFactory {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let mut manager = LifecycleManager::new(factory.clone());

        let start = tokio::time::timeout(Duration::from_secs(1), manager.activate(&context()))
            .await
            .expect("activate blocked on start")
            .unwrap();

        gate.notify_one();
        start.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_is_not_retried_and_still_stops() {
        let factory = Arc::new(RecordingFactory {
            fail_start: true,
            ..Default::default()
        });
        let mut manager = LifecycleManager::new(factory.clone());

        let start = manager.activate(&context()).await.unwrap();
        assert!(matches!(
            start.wait().await,
            Err(LifecycleError::Connection(_))
        ));

        manager.deactivate().unwrap().wait().await.unwrap();
        let (_, connection) = &factory.created()[0];
        assert_eq!(connection.starts.load(Ordering::SeqCst), 1);
        assert_eq!(connection.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_called_exactly_once_on_mock() {
        let mut connection = MockClientConnection::new();
        connection.expect_start().times(1).returning(|| Ok(()));
        connection.expect_stop().times(1).returning(|| Ok(()));
        let connection: Arc<dyn ClientConnection> = Arc::new(connection);

        let mut manager = LifecycleManager::new(Arc::new(FixedFactory(connection)));
        manager.activate(&context()).await.unwrap().wait().await.unwrap();
        manager.deactivate().unwrap().wait().await.unwrap();
        assert!(manager.deactivate().is_none());
    }

    #[tokio::test]
    async fn test_options_override_timeouts() {
        let factory = Arc::new(RecordingFactory::default());
        let mut manager = LifecycleManager::new(factory.clone()).with_options(LifecycleOptions {
            initialization_timeout: Some(Duration::from_secs(5)),
            request_timeout: None,
        });

        manager.activate(&context()).await.unwrap().wait().await.unwrap();
        let (config, _) = &factory.created()[0];
        assert_eq!(
            config.lsp_config.initialization_timeout,
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn test_invalid_options_fail_activation() {
        let factory = Arc::new(RecordingFactory::default());
        let mut manager = LifecycleManager::new(factory.clone()).with_options(LifecycleOptions {
            initialization_timeout: Some(Duration::ZERO),
            request_timeout: None,
        });

        assert!(matches!(
            manager.activate(&context()).await,
            Err(LifecycleError::Config(_))
        ));
        assert_eq!(manager.state(), LifecycleState::Uninitialized);
        assert!(manager.deactivate().is_none());
    }
}
