use clap::Parser;
use confit_client::environment::{
    ExtensionRegistry, PYTHON_EXTENSION_ID, PythonEnvironmentProvider,
};
use confit_client::host::ConsoleNotifier;
use confit_client::lifecycle::LifecycleOptions;
use confit_client::logging::{LogConfig, init_logging};
use confit_client::{ExtensionContext, LifecycleManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Headless host for the confit-lsp client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workspace root reported to the server and watched for TOML changes
    /// (defaults to current directory)
    #[arg(long, value_name = "DIR")]
    workspace: Option<PathBuf>,

    /// Python interpreter of the environment the server is installed in
    #[arg(long, value_name = "PATH")]
    python: Option<PathBuf>,

    /// Act as if this extension were not installed (repeatable)
    #[arg(long, value_name = "ID")]
    disable_extension: Vec<String>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides CONFIT_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Seconds to wait for the server's initialize response
    #[arg(long, value_name = "SECS")]
    init_timeout: Option<u64>,
}

fn build_registry(python: Option<PathBuf>, disabled: &[String]) -> ExtensionRegistry {
    let mut registry = ExtensionRegistry::new();
    let provider = match python {
        Some(path) => PythonEnvironmentProvider::with_interpreter(path),
        None => PythonEnvironmentProvider::new(),
    };
    registry.register(PYTHON_EXTENSION_ID, Arc::new(provider));

    for id in disabled {
        if registry.unregister(id) {
            info!("{} disabled on the command line", id);
        } else {
            warn!("Ignoring --disable-extension {}: no such extension", id);
        }
    }
    registry
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config = LogConfig::from_env().with_overrides(args.log_level, args.log_file);
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let workspace_root = match args.workspace {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let registry = build_registry(args.python, &args.disable_extension);
    let context = ExtensionContext::new(
        workspace_root,
        Arc::new(registry),
        Arc::new(ConsoleNotifier),
    );

    let options = LifecycleOptions {
        initialization_timeout: args.init_timeout.map(Duration::from_secs),
        request_timeout: None,
    };
    let mut manager = LifecycleManager::default().with_options(options);

    info!(
        "Activating confit-lsp client for {}",
        context.workspace_root.display()
    );
    let start = manager.activate(&context).await?;
    tokio::spawn(async move {
        match start.wait().await {
            Ok(()) => info!("confit-lsp client ready"),
            Err(e) => warn!("confit-lsp client did not start: {}", e),
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, deactivating");

    if let Some(stop) = manager.deactivate() {
        if let Err(e) = stop.wait().await {
            error!("Failed to stop confit-lsp client: {}", e);
        }
    }

    Ok(())
}
