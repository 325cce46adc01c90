//! Environment discovery capability
//!
//! Another extension may report which Python environment the user selected.
//! This crate only consumes the reported interpreter path.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Environment discovery has not been activated")]
    NotActivated,

    #[error("Environment discovery failed to activate: {0}")]
    Activation(String),

    #[error("Active environment lookup failed: {0}")]
    Lookup(String),
}

/// Path to the interpreter executable of the active environment,
/// e.g. `/env/bin/python`. Never validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentPath(PathBuf);

impl EnvironmentPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl From<PathBuf> for EnvironmentPath {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnvironmentDiscovery: Send + Sync {
    fn is_active(&self) -> bool;

    /// One-time initialization; calling it again is harmless
    async fn activate(&self) -> Result<(), DiscoveryError>;

    /// `Ok(None)` when no environment is selected
    async fn active_environment_path(&self) -> Result<Option<EnvironmentPath>, DiscoveryError>;
}
