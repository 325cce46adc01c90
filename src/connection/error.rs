//! Error types for the server connection

use std::path::PathBuf;
use std::time::Duration;

use crate::io::ProcessError;
use crate::lsp::LspError;

// ============================================================================
// Connection Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("LSP error: {0}")]
    Lsp(#[from] LspError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Invalid workspace root: {path}")]
    InvalidWorkspaceRoot { path: PathBuf },

    #[error("Connection already started")]
    AlreadyStarted,

    #[error("Connection not started")]
    NotStarted,

    #[error("Server process exited")]
    ServerExited,

    #[error("Connection already stopped")]
    Stopped,

    #[error("Connection start cancelled")]
    Cancelled,
}

// ============================================================================
// Configuration Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConnectionConfigError {
    #[error("Invalid timeout: {timeout:?} - {reason}")]
    InvalidTimeout { timeout: Duration, reason: String },

    #[error("Invalid watch pattern: {pattern}")]
    InvalidWatchPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("Invalid document selector: {reason}")]
    InvalidSelector { reason: String },
}

impl ConnectionConfigError {
    pub fn invalid_timeout(timeout: Duration, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            timeout,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// File Watch Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Failed to create filesystem watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("Failed to watch {path}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}
