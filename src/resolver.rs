//! Server executable resolution
//!
//! The server is expected to be installed into the same environment as the
//! interpreter the user picked, so its binary sits next to that interpreter.
//! Without an environment the conventional project virtualenv is assumed.
//! Resolution never fails; it degrades to the fallback path.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::environment::{
    EnvironmentDiscovery, EnvironmentPath, ExtensionRegistry, PYTHON_EXTENSION_ID,
};
use crate::host::Notifier;

pub const SERVER_BINARY_NAME: &str = "confit-lsp";

/// Binary directory of a project-local virtualenv, relative to the cwd
pub const FALLBACK_BIN_DIR: &str = ".venv/bin";

pub const MISSING_PYTHON_EXTENSION_MESSAGE: &str = "Python extension is not installed";

/// Path of the server executable to launch, absolute or relative
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand(PathBuf);

impl ResolvedCommand {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// `.venv/bin/confit-lsp`
    pub fn fallback() -> Self {
        Self(Path::new(FALLBACK_BIN_DIR).join(SERVER_BINARY_NAME))
    }

    /// The server binary next to the interpreter at `interpreter`
    pub fn sibling_of(interpreter: &EnvironmentPath) -> Self {
        let path = interpreter.as_path();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            // A bare name or root has no directory part; use it as the directory
            _ => path,
        };
        Self(dir.join(SERVER_BINARY_NAME))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

/// Decide which server binary to launch
pub async fn resolve_server_command(
    registry: &ExtensionRegistry,
    notifier: &dyn Notifier,
) -> ResolvedCommand {
    let Some(discovery) = registry.environment_discovery(PYTHON_EXTENSION_ID) else {
        warn!("{}, falling back to {}", MISSING_PYTHON_EXTENSION_MESSAGE, FALLBACK_BIN_DIR);
        notifier.show_error_message(MISSING_PYTHON_EXTENSION_MESSAGE);
        return ResolvedCommand::fallback();
    };

    let command = match active_environment(discovery.as_ref()).await {
        Some(environment) => {
            debug!("Active environment: {}", environment.as_path().display());
            ResolvedCommand::sibling_of(&environment)
        }
        None => ResolvedCommand::fallback(),
    };

    info!("Resolved server command: {}", command.as_path().display());
    command
}

/// Activate discovery if needed and ask for the environment; failures are
/// logged and read as "no environment"
async fn active_environment(discovery: &dyn EnvironmentDiscovery) -> Option<EnvironmentPath> {
    if !discovery.is_active() {
        debug!("Activating environment discovery");
        if let Err(e) = discovery.activate().await {
            warn!("Environment discovery failed to activate: {}", e);
            return None;
        }
    }

    match discovery.active_environment_path().await {
        Ok(Some(path)) => Some(path),
        Ok(None) => {
            debug!("No active environment reported");
            None
        }
        Err(e) => {
            warn!("Active environment lookup failed: {}", e);
            None
        }
    }
}
