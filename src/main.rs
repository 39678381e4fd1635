mod config;
mod healthcheck;
mod port;
mod proxy;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use crate::config::ProxyConfig;
use crate::proxy::upstream::UpstreamClient;
use crate::proxy::{ProxyService, router as proxy_router};
use crate::state::ProxyState;

#[derive(Parser, Debug)]
#[command(name = "spark-proxy")]
#[command(about = "Local proxy for Spark chat-completion traffic", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP proxy server (default when no subcommand is given)
    Serve {
        /// Base listen port; the first free port at or above it is used (default 3001)
        #[arg(long)]
        port: Option<u16>,
        /// Path to a TOML config file (default: ./spark-proxy.toml, then ~/.spark-proxy/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("{}", format!("{err:#}").red());
        // Port-bind failures get their own exit code so supervising scripts
        // can tell them apart from config mistakes.
        let code = if err.downcast_ref::<port::PortBindError>().is_some() {
            2
        } else {
            1
        };
        std::process::exit(code);
    }
}

async fn real_main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let Command::Serve { port, config } = cli.command.unwrap_or(Command::Serve {
        port: None,
        config: None,
    });

    let mut cfg = config::load_config(config.as_deref()).await?;
    if let Some(port) = port {
        cfg.server.base_port = port;
    }

    run_server(cfg).await
}

fn init_tracing() {
    // Default to info logs unless the user sets RUST_LOG.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

async fn run_server(cfg: ProxyConfig) -> anyhow::Result<()> {
    let upstream = UpstreamClient::new(&cfg).context("failed to build upstream client")?;
    if !upstream.has_auth_token() {
        tracing::warn!(
            "no upstream credential configured; forwarding requests without Authorization"
        );
    }

    let (listener, bound_port) = port::bind_first_free_port(cfg.server.base_port).await?;
    let addr = SocketAddr::from(([127, 0, 0, 1], bound_port));
    tracing::info!("spark-proxy listening on http://{addr}");

    let state = ProxyState::new();
    let service = ProxyService::new(
        upstream.clone(),
        state.clone(),
        cfg.server.registry_file.clone(),
    );
    let app = proxy_router(service);

    match port::write_port_registry(&cfg.server.registry_file, bound_port).await {
        Ok(()) => tracing::info!(
            "port registry written to {} ({bound_port})",
            cfg.server.registry_file.display()
        ),
        Err(err) => tracing::warn!("failed to persist port registry: {err:#}"),
    }

    print_startup_banner(bound_port);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            tracing::info!("shutdown signal received, draining in-flight requests");
            let _ = shutdown_tx.send(true);
        });
    }

    tokio::spawn(healthcheck::run_health_monitor(
        upstream,
        state,
        cfg.health.interval(),
        shutdown_rx.clone(),
    ));

    let server_shutdown = {
        let mut rx = shutdown_rx;
        async move {
            let _ = rx.changed().await;
        }
    };
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(server_shutdown)
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

fn print_startup_banner(bound_port: u16) {
    if !atty::is(atty::Stream::Stdout) {
        return;
    }
    println!(
        "{}",
        format!("spark-proxy started on http://localhost:{bound_port}").green()
    );
    println!(
        "{}",
        format!("  chat endpoint:        http://localhost:{bound_port}/api/spark").green()
    );
    println!(
        "{}",
        format!("  diagnostics endpoint: http://localhost:{bound_port}/api/test").green()
    );
    println!(
        "{}",
        "  make sure the frontend is pointed at this address".green()
    );
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
