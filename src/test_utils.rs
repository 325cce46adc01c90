//! Test-only helpers

/// Test logging, enabled with `--features test-logging`
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Install a test-writer subscriber once per test binary
    ///
    /// Test modules call this from a constructor:
    ///
    /// ```rust,ignore
    /// #[cfg(feature = "test-logging")]
    /// #[ctor::ctor]
    /// fn init_test_logging() {
    ///     crate::test_utils::logging::init();
    /// }
    /// ```
    ///
    /// `RUST_LOG=confit_client=trace cargo test --features test-logging`
    /// narrows the output.
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info,notify=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// A stand-in `confit-lsp`: a shell script that speaks just enough LSP to
/// get through the handshake and records every method it receives
#[cfg(all(test, unix))]
pub mod fake_server {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    /// What the server does once the client reports `initialized`
    #[derive(Debug, Clone, Copy)]
    pub enum AfterInitialized {
        Serve,
        Exit(i32),
    }

    const SCRIPT: &str = r##"#!/bin/sh
log="$(dirname "$0")/received.log"
reply() {
    printf 'Content-Length: %s\r\n\r\n%s' "${#1}" "$1"
}
while :; do
    length=
    while IFS= read -r line; do
        line=$(printf '%s' "$line" | tr -d '\r')
        [ -z "$line" ] && break
        case "$line" in
            Content-Length:*) length=${line#Content-Length: } ;;
        esac
    done
    if [ -z "$length" ]; then
        echo EOF >> "$log"
        exit 0
    fi
    body=$(dd bs=1 count="$length" 2>/dev/null)
    method=$(printf '%s' "$body" | sed -n 's/.*"method":"\([^"]*\)".*/\1/p')
    id=$(printf '%s' "$body" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
    echo "${method:-<response>}" >> "$log"
    case "$method" in
        initialize) reply "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"capabilities\":{}}}" ;;
        initialized) @AFTER_INITIALIZED@ ;;
        shutdown) reply "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":null}" ;;
        exit) exit 0 ;;
    esac
done
"##;

    pub struct FakeServer {
        _dir: TempDir,
        command: PathBuf,
        log: PathBuf,
    }

    impl FakeServer {
        pub fn install(after_initialized: AfterInitialized) -> Self {
            let dir = TempDir::new().unwrap();
            let command = dir.path().join("confit-lsp");
            let action = match after_initialized {
                AfterInitialized::Serve => ":".to_string(),
                AfterInitialized::Exit(code) => format!("exit {code}"),
            };
            std::fs::write(&command, SCRIPT.replace("@AFTER_INITIALIZED@", &action)).unwrap();
            std::fs::set_permissions(&command, std::fs::Permissions::from_mode(0o755)).unwrap();

            Self {
                log: dir.path().join("received.log"),
                command,
                _dir: dir,
            }
        }

        pub fn command(&self) -> &Path {
            &self.command
        }

        /// Methods received so far, `<response>` for replies, `EOF` on stdin close
        pub fn received(&self) -> Vec<String> {
            std::fs::read_to_string(&self.log)
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        pub async fn wait_for(&self, method: &str, timeout: Duration) -> bool {
            let deadline = tokio::time::Instant::now() + timeout;
            while tokio::time::Instant::now() < deadline {
                if self.received().iter().any(|m| m == method) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            false
        }
    }
}
