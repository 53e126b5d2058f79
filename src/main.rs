use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use qrexec_proxy::commands;
use qrexec_proxy::config::{self, Config, LogOutput, LoggingConfig};
use qrexec_proxy::logging;
use qrexec_proxy::plugin::PluginFactory;
use qrexec_proxy::transport::TransportLeg;
use qrexec_proxy::{ProxyError, Relay};

/// Reading stdin happens on a blocking thread that cannot be interrupted
const RUNTIME_SHUTDOWN: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "qrexec-proxy", version)]
#[command(about = "Relay a qrexec call to its destination through a chain of plugins", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Name of the calling domain
    #[arg(long, env = "QREXEC_REMOTE_DOMAIN", value_name = "DOMAIN")]
    source_domain: Option<String>,

    /// `[chain+]domain+service[+argument...]`
    #[arg(env = "QREXEC_SERVICE_ARGUMENT", value_name = "SERVICE_ARGUMENT")]
    argument: Option<String>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Relay one call over stdin/stdout (default)
    Run,
    /// Check configuration and list the configured chains
    Check,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load_from_path(path),
        None => config::load_default(),
    };

    let fallback = LoggingConfig::default();
    let logging_config = config.as_ref().map_or(&fallback, |c| &c.logging);
    let _guard = match logging::init(logging_config, args.debug) {
        Ok(guard) => guard,
        Err(e) => {
            // stderr reaches the calling domain, so only report there on request
            if logging_config.output == LogOutput::Stderr {
                eprintln!("qrexec-proxy: failed to initialise logging: {e}");
            }
            return ExitCode::from(2);
        }
    };

    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let code = match args.command {
        Some(Command::Check) => match commands::run_config_check(&config, &PluginFactory::with_builtins()) {
            Ok(_) => 0,
            Err(e) => {
                error!("Configuration check failed: {}", e);
                e.exit_code()
            }
        },
        Some(Command::Run) | None => run(args, config),
    };
    ExitCode::from(code)
}

fn run(args: Args, config: Config) -> u8 {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return 1;
        }
    };

    let code = runtime.block_on(serve(args, config));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
    code
}

async fn serve(args: Args, config: Config) -> u8 {
    let relay = match Relay::from_config(&config, &PluginFactory::with_builtins()) {
        Ok(relay) => relay,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return e.exit_code();
        }
    };

    let Some(argument) = args.argument else {
        error!("No service argument given (argument or QREXEC_SERVICE_ARGUMENT)");
        return 2;
    };
    let Some(source) = args.source_domain else {
        error!("No source domain given (--source-domain or QREXEC_REMOTE_DOMAIN)");
        return 2;
    };
    info!(%argument, %source, chains = relay.registry().len(), "qrexec-proxy v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let local = match TransportLeg::stdio() {
        Ok(local) => local,
        Err(e) => {
            error!("Failed to set up stdio: {}", e);
            return ProxyError::from(e).exit_code();
        }
    };

    relay
        .serve(&argument, &source, local, &shutdown)
        .await
        .exit_code()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
