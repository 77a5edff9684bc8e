//! tielink - unified control of two broadcast video routers over tie-lines

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tielink::app::{metrics, Orchestrator};
use tielink::config::Config;
use tielink::error::Result;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&Config::example()).unwrap()
        );
        return Ok(());
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    // Load configuration
    let config = if let Some(path) = args.config {
        Config::load(&path)?
    } else {
        info!("No config file specified, starting with an empty configuration");
        Config::default()
    };

    info!("tielink v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (shutdown_tx, _) = broadcast::channel(1);

        let orchestrator = Orchestrator::new(config);
        orchestrator.bootstrap().await;

        // Metrics endpoint if requested
        if let Some(addr) = args.metrics_listen {
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                metrics::serve_metrics(addr, shutdown_rx).await;
            });
        }

        // Wait for shutdown signal (Ctrl+C)
        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");

        orchestrator.stop_bridge();
        let _ = shutdown_tx.send(());
        Ok::<(), tielink::Error>(())
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: bool,
    version: bool,
    metrics_listen: Option<SocketAddr>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = false;
        let mut version = false;
        let mut metrics_listen = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "--metrics" => {
                    if i + 1 < args.len() {
                        metrics_listen = args[i + 1].parse().ok();
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            gen_config,
            version,
            metrics_listen,
        }
    }
}

fn print_help() {
    println!(
        r#"tielink - unified control of two broadcast video routers

USAGE:
    tielink [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config            Print an example configuration
    --metrics <ADDR>        Prometheus metrics listen address (e.g. 127.0.0.1:9090)
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    tielink -c routers.json
    tielink -c routers.json --metrics 127.0.0.1:9090
    tielink --gen-config > routers.json

The northbound bridge re-exports the combined matrix as a VideoHub 2.8
device (default 0.0.0.0:9990) so third-party panels can drive it.
"#
    );
}

fn print_version() {
    println!("tielink v{}", env!("CARGO_PKG_VERSION"));
    println!("Two broadcast routers, one virtual matrix");
}
