//! Portlens entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio::sync::Notify;

use portlens::{EngineConfig, PortAnalytics, ReplaySession};
use portlens_server::rest::{self, AppState};

#[derive(Parser)]
#[command(
    name = "portlens",
    about = "Company port and trade-lane analytics from a live browser session",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// JSON config file. Environment and flags override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// DevTools endpoint (host:port or URL).
    #[arg(long, global = true)]
    debugger: Option<String>,

    /// Cache TTL in seconds.
    #[arg(long, global = true)]
    cache_ttl: Option<u64>,

    /// Capture window in milliseconds.
    #[arg(long, global = true)]
    capture_timeout_ms: Option<u64>,

    /// Navigation timeout in milliseconds.
    #[arg(long, global = true)]
    navigation_timeout_ms: Option<u64>,

    /// Serve recorded responses from a fixture file instead of a browser.
    #[arg(long, global = true)]
    replay: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API (default).
    Serve {
        /// Listen address (host:port).
        #[arg(long, default_value = "0.0.0.0:8081")]
        addr: SocketAddr,

        /// Company list file, one name per line.
        #[arg(long, default_value = "consumerBCO.txt")]
        companies: PathBuf,

        /// Seconds between expired-entry sweeps.
        #[arg(long, default_value_t = 300)]
        maintenance_secs: u64,
    },

    /// Extract one company and print the result as JSON.
    Lookup {
        /// Company name.
        company: String,

        /// Skip the cache.
        #[arg(long)]
        refresh: bool,
    },

    /// Check that the browser is reachable.
    Check,

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    let command = cli.command.take().unwrap_or_else(default_command);
    if let Commands::Completions { shell } = command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "portlens", &mut std::io::stdout());
        return Ok(());
    }

    let config = resolve_config(&cli)?;
    let analytics = build_service(&cli, config)?;

    match command {
        Commands::Serve {
            addr,
            companies,
            maintenance_secs,
        } => {
            tracing::info!("Portlens API");
            tracing::info!("Debugger: {}", analytics.config().debugger_endpoint);
            tracing::info!("Companies: {}", companies.display());

            let shutdown = Arc::new(Notify::new());
            let maintenance = analytics.spawn_maintenance(
                Duration::from_secs(maintenance_secs.max(1)),
                Arc::clone(&shutdown),
            );
            let state = Arc::new(AppState {
                analytics,
                companies_path: companies,
            });

            tokio::select! {
                result = rest::start(addr, state) => result?,
                _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
            }
            shutdown.notify_one();
            let _ = maintenance.await;
        }

        Commands::Lookup { company, refresh } => {
            let outcome = if refresh {
                analytics.refresh(&company).await
            } else {
                analytics.get_port_analytics(&company).await
            };
            match outcome {
                Ok(found) => {
                    println!("{}", serde_json::to_string_pretty(found.result.as_ref())?);
                }
                Err(report) => {
                    eprintln!("{}", serde_json::to_string_pretty(&report)?);
                    std::process::exit(1);
                }
            }
        }

        Commands::Check => {
            let health = analytics.health_check().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            if !health.browser_reachable {
                std::process::exit(1);
            }
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn default_command() -> Commands {
    Commands::Serve {
        addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
        companies: PathBuf::from("consumerBCO.txt"),
        maintenance_secs: 300,
    }
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Defaults, then the config file, then `PORTLENS_*` variables, then flags.
fn resolve_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.apply_env();

    if let Some(endpoint) = &cli.debugger {
        config.debugger_endpoint = endpoint.clone();
    }
    if let Some(ttl) = cli.cache_ttl {
        config.cache_ttl_secs = ttl;
    }
    if let Some(ms) = cli.capture_timeout_ms {
        config.capture_timeout_ms = ms;
    }
    if let Some(ms) = cli.navigation_timeout_ms {
        config.navigation_timeout_ms = ms;
    }

    config.validate()?;
    Ok(config)
}

fn build_service(cli: &Cli, config: EngineConfig) -> anyhow::Result<PortAnalytics> {
    let analytics = match &cli.replay {
        Some(path) => {
            tracing::info!("Replaying responses from {}", path.display());
            let session = ReplaySession::from_fixture(path)?;
            PortAnalytics::new(Arc::new(session), config)?
        }
        None => PortAnalytics::connect(config)?,
    };
    Ok(analytics)
}
