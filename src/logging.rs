//! tracing-subscriber setup
//!
//! Logs go to stderr unless a file is configured, keeping stdout clean for
//! whatever the host wants to print there.

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_VAR: &str = "CONFIT_LOG_FILE";
const LOG_UNIQUE_VAR: &str = "CONFIT_LOG_UNIQUE";
const LOG_JSON_VAR: &str = "CONFIT_LOG_JSON";

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. "info" or "confit_client=debug"
    pub level: String,
    /// Log file; stderr when `None`
    pub file_path: Option<PathBuf>,
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Read `RUST_LOG`, `CONFIT_LOG_FILE`, `CONFIT_LOG_UNIQUE` and `CONFIT_LOG_JSON`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());
        let unique = lookup(LOG_UNIQUE_VAR).is_some_and(|v| v == "true");
        let file_path = lookup(LOG_FILE_VAR).map(|path| {
            let path = PathBuf::from(path);
            if unique {
                with_pid_suffix(path, std::process::id())
            } else {
                path
            }
        });
        let json_format = lookup(LOG_JSON_VAR).is_some_and(|v| v == "true");

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Command-line values win over the environment
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// `client.log` -> `client.<pid>.log`
fn with_pid_suffix(mut path: PathBuf, pid: u32) -> PathBuf {
    let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
        return path;
    };
    let file_name = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if !ext.is_empty() => format!("{stem}.{pid}.{ext}"),
        _ => format!("{stem}.{pid}"),
    };
    path.set_file_name(file_name);
    path
}

/// Install the global subscriber
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;
    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            subscriber
                .with(fmt::layer().json().with_writer(file).with_ansi(false))
                .try_init()?;
        }
        (Some(file_path), false) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            subscriber
                .with(
                    fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_target(true)
                        .with_line_number(true),
                )
                .try_init()?;
        }
        (None, true) => {
            subscriber
                .with(fmt::layer().json().with_writer(io::stderr).with_ansi(false))
                .try_init()?;
        }
        (None, false) => {
            subscriber
                .with(
                    fmt::layer()
                        .with_writer(io::stderr)
                        .with_target(true)
                        .with_line_number(true),
                )
                .try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = LogConfig::from_lookup(lookup(&[]));
        assert_eq!(config.level, "info");
        assert!(config.file_path.is_none());
        assert!(!config.json_format);
    }

    #[test]
    fn test_environment_values() {
        let config = LogConfig::from_lookup(lookup(&[
            ("RUST_LOG", "confit_client=debug"),
            (LOG_FILE_VAR, "/tmp/confit.log"),
            (LOG_JSON_VAR, "true"),
        ]));
        assert_eq!(config.level, "confit_client=debug");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/confit.log")));
        assert!(config.json_format);
    }

    #[test]
    fn test_unique_file_gets_pid() {
        let config = LogConfig::from_lookup(lookup(&[
            (LOG_FILE_VAR, "/tmp/confit.log"),
            (LOG_UNIQUE_VAR, "true"),
        ]));
        let expected = format!("/tmp/confit.{}.log", std::process::id());
        assert_eq!(config.file_path, Some(PathBuf::from(expected)));
    }

    #[test]
    fn test_pid_suffix_without_extension() {
        assert_eq!(
            with_pid_suffix(PathBuf::from("/var/log/confit"), 42),
            PathBuf::from("/var/log/confit.42")
        );
    }

    #[test]
    fn test_overrides_win() {
        let config = LogConfig::default()
            .with_overrides(Some("trace".to_string()), Some(PathBuf::from("out.log")));
        assert_eq!(config.level, "trace");
        assert_eq!(config.file_path, Some(PathBuf::from("out.log")));

        let untouched = LogConfig::default().with_overrides(None, None);
        assert_eq!(untouched.level, "info");
    }
}
