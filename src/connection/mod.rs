//! Connection to the confit-lsp server
//!
//! Configuration, document scoping, workspace file watching, and the
//! [`LanguageClient`] that ties them to a running server process.

pub mod client;
pub mod config;
pub mod error;
pub mod watcher;

pub use client::{ClientConnection, LanguageClient};
pub use config::{
    ConnectionConfig, ConnectionConfigBuilder, DocumentSelector, FileWatchPattern, LspConfig,
};
pub use error::{ConnectionConfigError, ConnectionError, WatchError};
pub use watcher::{FileChange, FileChangeKind, FileWatcher};
