//! Focuslock daemon - Entry point.
//!
//! Runs the DNS filtering tunnel on a Linux TUN device, and exposes the
//! blocklist and lock commands for scripting.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use focuslock::blocklist::{BlocklistStore, DomainListParser, JsonFileStore};
use focuslock::commands::{BlockerCommands, HeadlessPlatform};
use focuslock::config::Config;
use focuslock::dns::UpstreamForwarder;
use focuslock::lock::{LockGate, LockTransition, LockWatcher};
use focuslock::monitor::{ForegroundMonitor, WindowEvent};
use focuslock::network::TunnelProvider;
use focuslock::tunnel::TunnelController;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (falls back to $CONFIG_PATH, then focuslock.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the tunnel from the persisted state and run until Ctrl-C
    Run,
    /// Apply the restart-after-boot rule, then run if the tunnel came up
    Boot,
    /// Manage the blocked domain list
    Domains {
        #[command(subcommand)]
        action: DomainsAction,
    },
    /// Manage the blocked application list
    Apps {
        #[command(subcommand)]
        action: AppsAction,
    },
    /// Manage the lock
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Print the persisted lock and list summary
    Status,
    /// Feed one foreground change through the app monitor
    Foreground { package: String },
}

#[derive(Subcommand, Debug)]
enum DomainsAction {
    /// Replace the list
    Set {
        domains: Vec<String>,
        /// Read one domain per line from a file
        #[arg(short, long, conflicts_with = "domains")]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum AppsAction {
    /// Replace the list
    Set { packages: Vec<String> },
    /// Empty the list
    Clear,
}

#[derive(Subcommand, Debug)]
enum LockAction {
    /// Extend the lock by a number of hours
    Extend { hours: u32 },
    /// Set the expiry to an RFC 3339 timestamp
    Set { expiry: String },
    /// Remove the expiry
    Clear,
}

/// Shared state for every subcommand.
struct App {
    config: Config,
    store: BlocklistStore,
    gate: LockGate,
    commands: BlockerCommands,
}

fn tunnel_provider() -> Arc<dyn TunnelProvider> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(focuslock::network::TunProvider)
    }
    #[cfg(not(target_os = "linux"))]
    {
        use focuslock::config::TunnelSettings;
        use focuslock::network::TunnelDevice;

        Arc::new(
            |_: &TunnelSettings| -> focuslock::Result<Box<dyn TunnelDevice>> {
                Err(focuslock::Error::Unsupported("TUN device"))
            },
        )
    }
}

fn build_app(config: Config) -> Result<App> {
    let state = JsonFileStore::open(&config.state_path)
        .with_context(|| format!("Failed to open state file {}", config.state_path.display()))?;
    let store = BlocklistStore::new(Arc::new(state));
    let gate = LockGate::new(store.clone());

    // Only the DNS peer address is routed into the device; upstream queries
    // leave through the default route and need no protection.
    let forwarder = UpstreamForwarder::new(config.upstream_resolver, config.forward_timeout());
    let tunnel = Arc::new(TunnelController::new(
        tunnel_provider(),
        Arc::new(forwarder),
        store.clone(),
        config.tunnel.clone(),
    ));

    let commands = BlockerCommands::new(
        store.clone(),
        gate.clone(),
        tunnel,
        Arc::new(HeadlessPlatform),
    );

    Ok(App {
        config,
        store,
        gate,
        commands,
    })
}

/// Supervise a running tunnel until Ctrl-C, lock expiry or worker failure.
async fn supervise(app: &App) -> Result<()> {
    let tunnel = Arc::clone(app.commands.tunnel());
    let mut watcher = LockWatcher::new(app.gate.clone());
    let mut bound_to_lock = app.gate.is_locked();
    let mut ticker = tokio::time::interval(app.config.lock_check_interval());
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down...");
                break;
            }
            _ = ticker.tick() => {
                match watcher.tick() {
                    LockTransition::Engaged => bound_to_lock = true,
                    LockTransition::Expired if bound_to_lock => {
                        info!("lock expired, tearing down tunnel");
                        break;
                    }
                    _ => {}
                }
                if !tunnel.is_running() {
                    warn!("tunnel worker stopped on its own");
                    break;
                }
            }
        }
    }

    tokio::task::spawn_blocking(move || tunnel.stop())
        .await
        .context("Tunnel shutdown task failed")?;
    info!("Shutdown complete.");
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(|| {
        std::env::var_os("CONFIG_PATH")
            .map_or_else(|| PathBuf::from("focuslock.toml"), PathBuf::from)
    });
    let config = Config::load_or_default(&config_path).context("Failed to load configuration")?;
    let app = build_app(config)?;

    match cli.command {
        Command::Run => {
            focuslock::metrics::init(&app.config.metrics)
                .context("Failed to initialize metrics")?;
            info!(
                upstream = %app.config.upstream_resolver,
                tunnel = %app.config.tunnel.name,
                "Starting focuslock tunnel..."
            );
            let tunnel = Arc::clone(app.commands.tunnel());
            tokio::task::spawn_blocking(move || tunnel.start())
                .await
                .context("Tunnel start task failed")?
                .context("Failed to start tunnel")?;
            supervise(&app).await?;
        }
        Command::Boot => {
            let restarted = tokio::task::block_in_place(|| app.commands.on_boot())
                .context("Boot restart failed")?;
            if restarted {
                focuslock::metrics::init(&app.config.metrics)
                    .context("Failed to initialize metrics")?;
                supervise(&app).await?;
            }
        }
        Command::Domains {
            action: DomainsAction::Set { domains, file },
        } => {
            let domains = match file {
                Some(path) => DomainListParser
                    .parse_file(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => domains,
            };
            app.store.save_domains(&domains)?;
            info!(count = domains.len(), "domain list saved");
        }
        Command::Apps { action } => match action {
            AppsAction::Set { packages } => app.commands.update_blocked_apps(&packages)?,
            AppsAction::Clear => app.commands.stop_app_blocker()?,
        },
        Command::Lock { action } => match action {
            LockAction::Extend { hours } => {
                println!("{}", app.commands.extend_lock(hours)?);
            }
            LockAction::Set { expiry } => {
                if focuslock::lock::parse_expiry(&expiry).is_none() {
                    bail!("not a valid timestamp: {expiry}");
                }
                app.commands.save_lock_expiry(&expiry)?;
            }
            LockAction::Clear => app.gate.clear_expiry()?,
        },
        Command::Status => {
            let status = serde_json::json!({
                "lock": app.commands.lock_state(),
                "domains": app.store.domains()?.len(),
                "blockedApps": app.store.blocked_apps()?.len(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Foreground { package } => {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let monitor = ForegroundMonitor::new(
                app.store.clone(),
                app.gate.clone(),
                Arc::new(tx),
                &app.config.app_blocker,
            );
            let decision = monitor.handle_event(&WindowEvent::foreground(package));
            println!("{decision:?}");
            while let Ok(blocked) = rx.try_recv() {
                println!("redirect: {blocked}");
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    run(Cli::parse()).await
}
