//! Editor integration for the confit-lsp TOML language server
//!
//! [`resolver`] decides which `confit-lsp` binary to launch, following the
//! user's active Python environment. [`lifecycle`] owns the single client
//! connection and starts or stops it when the host activates or deactivates
//! the integration.

pub mod connection;
pub mod environment;
pub mod host;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod lsp;
pub mod resolver;

#[cfg(test)]
mod test_utils;

pub use host::{ExtensionContext, Notifier};
pub use lifecycle::{LifecycleError, LifecycleManager, LifecycleState, StartHandle, StopHandle};
pub use resolver::{ResolvedCommand, resolve_server_command};
