//! Connection configuration
//!
//! [`ConnectionConfig`] is built once per activation and never mutated. It
//! carries the resolved server command, the document selector that scopes
//! which documents the connection handles, and the file-watch pattern.

use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{GlobBuilder, GlobMatcher};
use lsp_types::DocumentFilter;
use url::Url;

use crate::connection::error::ConnectionConfigError;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Name the server is known by in logs and user-facing messages
pub const SERVER_NAME: &str = "confit-lsp";

pub const CLIENT_NAME: &str = "confit-client";

pub const DOCUMENT_SCHEME: &str = "file";

pub const DOCUMENT_LANGUAGE: &str = "toml";

/// Every TOML file at any depth under the workspace root
pub const TOML_WATCH_GLOB: &str = "**/*.toml";

/// Default timeout for the initialize handshake (30 seconds)
pub const DEFAULT_INITIALIZATION_TIMEOUT_SECS: u64 = 30;

/// Default timeout for individual requests such as shutdown (10 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Upper bound on the initialization timeout (5 minutes)
pub const MAX_INITIALIZATION_TIMEOUT_SECS: u64 = 300;

/// Default debounce applied to filesystem events
pub const DEFAULT_WATCH_DEBOUNCE_MS: u64 = 200;

// ============================================================================
// Document Selector
// ============================================================================

/// Restricts which open documents are forwarded to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSelector {
    filter: DocumentFilter,
}

impl DocumentSelector {
    pub fn new(scheme: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            filter: DocumentFilter {
                language: Some(language.into()),
                scheme: Some(scheme.into()),
                pattern: None,
            },
        }
    }

    /// On-disk TOML documents
    pub fn toml_files() -> Self {
        Self::new(DOCUMENT_SCHEME, DOCUMENT_LANGUAGE)
    }

    pub fn filter(&self) -> &DocumentFilter {
        &self.filter
    }

    /// A document matches when every field set on the filter agrees with it
    pub fn matches(&self, uri: &Url, language_id: &str) -> bool {
        let scheme_ok = self
            .filter
            .scheme
            .as_deref()
            .is_none_or(|scheme| scheme == uri.scheme());
        let language_ok = self
            .filter
            .language
            .as_deref()
            .is_none_or(|language| language == language_id);
        scheme_ok && language_ok
    }
}

// ============================================================================
// File Watch Pattern
// ============================================================================

/// Glob evaluated against paths relative to the workspace root
#[derive(Debug, Clone)]
pub struct FileWatchPattern {
    glob: String,
    matcher: GlobMatcher,
}

impl FileWatchPattern {
    pub fn new(glob: impl Into<String>) -> Result<Self, ConnectionConfigError> {
        let glob = glob.into();
        let matcher = GlobBuilder::new(&glob)
            .literal_separator(true)
            .build()
            .map_err(|source| ConnectionConfigError::InvalidWatchPattern {
                pattern: glob.clone(),
                source,
            })?
            .compile_matcher();
        Ok(Self { glob, matcher })
    }

    pub fn toml_files() -> Result<Self, ConnectionConfigError> {
        Self::new(TOML_WATCH_GLOB)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }

    pub fn matches(&self, relative_path: &Path) -> bool {
        self.matcher.is_match(relative_path)
    }
}

impl PartialEq for FileWatchPattern {
    fn eq(&self, other: &Self) -> bool {
        self.glob == other.glob
    }
}

// ============================================================================
// Connection Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server executable; launched without arguments
    pub command: PathBuf,

    /// Working directory for the server process, `None` inherits ours
    pub working_directory: Option<PathBuf>,

    /// Root reported to the server and watched for file changes
    pub workspace_root: PathBuf,

    pub document_selector: DocumentSelector,

    pub watch_pattern: FileWatchPattern,

    pub lsp_config: LspConfig,

    pub watch_debounce: Duration,
}

#[derive(Debug, Clone)]
pub struct LspConfig {
    pub initialization_timeout: Duration,

    pub request_timeout: Duration,

    pub client_name: String,

    pub client_version: String,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            initialization_timeout: Duration::from_secs(DEFAULT_INITIALIZATION_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            client_name: CLIENT_NAME.to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn builder(
        command: impl Into<PathBuf>,
        workspace_root: impl Into<PathBuf>,
    ) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new(command, workspace_root)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ConnectionConfig`]; defaults target TOML files
pub struct ConnectionConfigBuilder {
    command: PathBuf,
    workspace_root: PathBuf,
    working_directory: Option<PathBuf>,
    document_selector: Option<DocumentSelector>,
    watch_glob: Option<String>,
    lsp_config: LspConfig,
    watch_debounce: Duration,
}

impl ConnectionConfigBuilder {
    pub fn new(command: impl Into<PathBuf>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workspace_root: workspace_root.into(),
            working_directory: None,
            document_selector: None,
            watch_glob: None,
            lsp_config: LspConfig::default(),
            watch_debounce: Duration::from_millis(DEFAULT_WATCH_DEBOUNCE_MS),
        }
    }

    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn document_selector(mut self, selector: DocumentSelector) -> Self {
        self.document_selector = Some(selector);
        self
    }

    pub fn watch_glob(mut self, glob: impl Into<String>) -> Self {
        self.watch_glob = Some(glob.into());
        self
    }

    pub fn initialization_timeout(mut self, timeout: Duration) -> Self {
        self.lsp_config.initialization_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.lsp_config.request_timeout = timeout;
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.lsp_config.client_name = name.into();
        self
    }

    pub fn client_version(mut self, version: impl Into<String>) -> Self {
        self.lsp_config.client_version = version.into();
        self
    }

    pub fn watch_debounce(mut self, debounce: Duration) -> Self {
        self.watch_debounce = debounce;
        self
    }

    /// Validate and build
    ///
    /// The command path is deliberately not checked here: a bad path
    /// surfaces as a launch failure when the connection starts.
    pub fn build(self) -> Result<ConnectionConfig, ConnectionConfigError> {
        Self::validate_timeouts(&self.lsp_config)?;

        let document_selector = self
            .document_selector
            .unwrap_or_else(DocumentSelector::toml_files);
        if document_selector.filter().scheme.is_none()
            && document_selector.filter().language.is_none()
        {
            return Err(ConnectionConfigError::InvalidSelector {
                reason: "selector must constrain scheme or language".to_string(),
            });
        }

        let watch_pattern = match self.watch_glob {
            Some(glob) => FileWatchPattern::new(glob)?,
            None => FileWatchPattern::toml_files()?,
        };

        Ok(ConnectionConfig {
            command: self.command,
            working_directory: self.working_directory,
            workspace_root: self.workspace_root,
            document_selector,
            watch_pattern,
            lsp_config: self.lsp_config,
            watch_debounce: self.watch_debounce,
        })
    }

    fn validate_timeouts(lsp_config: &LspConfig) -> Result<(), ConnectionConfigError> {
        let init = lsp_config.initialization_timeout;
        if init.is_zero() {
            return Err(ConnectionConfigError::invalid_timeout(
                init,
                "initialization timeout must be greater than zero",
            ));
        }
        if init > Duration::from_secs(MAX_INITIALIZATION_TIMEOUT_SECS) {
            return Err(ConnectionConfigError::invalid_timeout(
                init,
                format!("initialization timeout exceeds {MAX_INITIALIZATION_TIMEOUT_SECS}s"),
            ));
        }
        if lsp_config.request_timeout.is_zero() {
            return Err(ConnectionConfigError::invalid_timeout(
                lsp_config.request_timeout,
                "request timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}
