//! Built-in Python environment provider
//!
//! Stands in for an editor's Python extension when running headless. The
//! interpreter is chosen from an explicit path, then `VIRTUAL_ENV`, then
//! `CONDA_PREFIX`.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::environment::discovery::{DiscoveryError, EnvironmentDiscovery, EnvironmentPath};

const VIRTUAL_ENV_VAR: &str = "VIRTUAL_ENV";
const CONDA_PREFIX_VAR: &str = "CONDA_PREFIX";

#[derive(Debug, Default)]
pub struct PythonEnvironmentProvider {
    explicit_interpreter: Option<PathBuf>,
    active: OnceCell<Option<EnvironmentPath>>,
}

impl PythonEnvironmentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this interpreter regardless of the process environment
    pub fn with_interpreter(path: impl Into<PathBuf>) -> Self {
        Self {
            explicit_interpreter: Some(path.into()),
            active: OnceCell::new(),
        }
    }
}

#[async_trait]
impl EnvironmentDiscovery for PythonEnvironmentProvider {
    fn is_active(&self) -> bool {
        self.active.initialized()
    }

    async fn activate(&self) -> Result<(), DiscoveryError> {
        self.active
            .get_or_init(|| async {
                let detected = detect_interpreter(self.explicit_interpreter.as_deref(), |name| {
                    std::env::var_os(name)
                });
                match &detected {
                    Some(path) => info!("Active Python environment: {}", path.display()),
                    None => info!("No active Python environment"),
                }
                detected.map(EnvironmentPath::from)
            })
            .await;
        Ok(())
    }

    async fn active_environment_path(&self) -> Result<Option<EnvironmentPath>, DiscoveryError> {
        self.active
            .get()
            .cloned()
            .ok_or(DiscoveryError::NotActivated)
    }
}

/// Pick the interpreter path; `lookup` reads environment variables
pub fn detect_interpreter<F>(explicit: Option<&Path>, lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<OsString>,
{
    if let Some(path) = explicit {
        debug!("Using explicit interpreter {}", path.display());
        return Some(path.to_path_buf());
    }

    [VIRTUAL_ENV_VAR, CONDA_PREFIX_VAR]
        .into_iter()
        .find_map(|name| {
            let prefix = lookup(name).filter(|value| !value.is_empty())?;
            debug!("Interpreter prefix from {}", name);
            Some(interpreter_in(Path::new(&prefix), name == CONDA_PREFIX_VAR))
        })
}

#[cfg(not(windows))]
fn interpreter_in(prefix: &Path, _conda: bool) -> PathBuf {
    prefix.join("bin").join("python")
}

#[cfg(windows)]
fn interpreter_in(prefix: &Path, conda: bool) -> PathBuf {
    if conda {
        prefix.join("python.exe")
    } else {
        prefix.join("Scripts").join("python.exe")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let vars: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_explicit_interpreter_wins() {
        let detected = detect_interpreter(
            Some(Path::new("/opt/py/bin/python3")),
            env(&[(VIRTUAL_ENV_VAR, "/home/dev/.venv")]),
        );
        assert_eq!(detected, Some(PathBuf::from("/opt/py/bin/python3")));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_virtual_env_before_conda() {
        let detected = detect_interpreter(
            None,
            env(&[
                (VIRTUAL_ENV_VAR, "/home/dev/app/.venv"),
                (CONDA_PREFIX_VAR, "/opt/conda"),
            ]),
        );
        assert_eq!(detected, Some(PathBuf::from("/home/dev/app/.venv/bin/python")));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_conda_prefix() {
        let detected = detect_interpreter(None, env(&[(CONDA_PREFIX_VAR, "/opt/conda/envs/cfg")]));
        assert_eq!(detected, Some(PathBuf::from("/opt/conda/envs/cfg/bin/python")));
    }

    #[test]
    fn test_empty_variables_are_ignored() {
        let detected = detect_interpreter(None, env(&[(VIRTUAL_ENV_VAR, "")]));
        assert_eq!(detected, None);
    }

    #[tokio::test]
    async fn test_lookup_before_activation_fails() {
        let provider = PythonEnvironmentProvider::with_interpreter("/env/bin/python");
        assert!(!provider.is_active());
        assert!(matches!(
            provider.active_environment_path().await,
            Err(DiscoveryError::NotActivated)
        ));
    }

    #[tokio::test]
    async fn test_activate_reports_explicit_interpreter() {
        let provider = PythonEnvironmentProvider::with_interpreter("/env/bin/python");

        provider.activate().await.unwrap();
        provider.activate().await.unwrap();

        assert!(provider.is_active());
        assert_eq!(
            provider.active_environment_path().await.unwrap(),
            Some(EnvironmentPath::new("/env/bin/python"))
        );
    }
}
