//! Host editor contract
//!
//! What the integration needs from the editor it runs in: a way to show an
//! error to the user and the context handed over at activation.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::error;

use crate::environment::ExtensionRegistry;

/// User-visible error channel of the host
#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    fn show_error_message(&self, message: &str);
}

/// Everything activation receives from the host
#[derive(Clone)]
pub struct ExtensionContext {
    pub workspace_root: PathBuf,
    pub registry: Arc<ExtensionRegistry>,
    pub notifier: Arc<dyn Notifier>,
}

impl ExtensionContext {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        registry: Arc<ExtensionRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            registry,
            notifier,
        }
    }
}

impl std::fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("workspace_root", &self.workspace_root)
            .field("registry", &self.registry)
            .field("notifier", &"dyn Notifier")
            .finish()
    }
}

/// Headless notifier: stderr plus an `error` event
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn show_error_message(&self, message: &str) {
        error!("{}", message);
        eprintln!("error: {message}");
    }
}
