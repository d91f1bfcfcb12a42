//! Demo gateway server with a scripted executor.
//!
//! Run with: cargo run -p gateway-server -- --debugger --monitor
//!
//! Open a monitor with `curl -N localhost:3000/agent/agent-1/monitor`, then
//! start a live debug run with
//! `curl -XPOST -H 'X-AGENT-ID: agent-1' -H 'X-MONITOR-ID: <id>' localhost:3000/api/go`.

use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use agent_gateway_transport::{
    DispatcherBuilder, DualPathDispatcher, GatewayConfig, LoopbackMode, create_router,
};
use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod scripted;

use scripted::{ScriptedExecutor, StaticDirectory};

/// Agent gateway with live debug sessions and push monitors
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Host address to bind to
    #[arg(long, env = "GATEWAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "GATEWAY_PORT", default_value = "3000")]
    port: u16,

    /// Enable live debug sessions
    #[arg(long, env = "GATEWAY_DEBUGGER")]
    debugger: bool,

    /// Enable push monitors
    #[arg(long, env = "GATEWAY_MONITOR")]
    monitor: bool,

    /// Enable trigger endpoints
    #[arg(long, env = "GATEWAY_TRIGGERS")]
    triggers: bool,

    /// Seconds a debug session may stay pending
    #[arg(long, env = "GATEWAY_SESSION_TTL", default_value = "3600")]
    session_ttl: u64,

    /// Seconds a push connection may stay idle
    #[arg(long, env = "GATEWAY_IDLE_TIMEOUT", default_value = "3600")]
    idle_timeout: u64,

    /// Host suffix treated as a test identity
    #[arg(long, env = "GATEWAY_TEST_DOMAIN")]
    test_domain: Option<String>,

    /// Launch debug runs over HTTP to this server instead of in-process
    #[arg(long, env = "GATEWAY_HTTP_LOOPBACK")]
    http_loopback: bool,

    /// Served agents, as `name` or `name:debug`
    #[arg(
        long,
        env = "GATEWAY_AGENTS",
        value_delimiter = ',',
        default_value = "agent-1:debug"
    )]
    agents: Vec<String>,

    /// Steps the scripted executor plays per debug run
    #[arg(long, env = "GATEWAY_DEMO_STEPS", default_value = "3")]
    demo_steps: u32,

    /// Logging level (info, debug, trace)
    #[arg(long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "GATEWAY_JSON_LOGS")]
    json_logs: bool,
}

impl Cli {
    fn gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        let loopback = if self.http_loopback {
            LoopbackMode::Http { port: self.port }
        } else {
            LoopbackMode::InProcess
        };
        let config = GatewayConfig::try_new(
            Duration::from_secs(self.session_ttl),
            Duration::from_secs(self.idle_timeout),
            loopback,
        )
        .context("invalid gateway configuration")?
        .with_debugger(self.debugger)
        .with_monitor(self.monitor)
        .with_triggers(self.triggers)
        .with_test_domain(self.test_domain.clone());
        Ok(config)
    }
}

fn init_tracing(log_level: &str, json: bool) {
    let level = Level::from_str(&log_level.to_lowercase()).unwrap_or(Level::INFO);
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true),
            )
            .init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let config = cli.gateway_config()?;
    let directory = StaticDirectory::parse(&cli.agents);
    info!(
        version = %env!("CARGO_PKG_VERSION"),
        agents = directory.len(),
        debugger = config.debugger_enabled,
        monitor = config.monitor_enabled,
        loopback = ?config.loopback,
        "Starting agent gateway"
    );

    let dispatcher = DispatcherBuilder::new(
        Arc::new(ScriptedExecutor::new(cli.demo_steps, Duration::from_millis(500))),
        Arc::new(directory),
    )
    .config(config)
    .build()
    .context("failed to build dispatcher")?;

    let shutdown_token = CancellationToken::new();
    tokio::spawn(handle_shutdown_signals(shutdown_token.clone()));

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .context("failed to parse socket address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(addr = %addr, "Listening for connections");

    axum::serve(listener, create_router(dispatcher.clone()))
        .with_graceful_shutdown(shutdown(shutdown_token, dispatcher))
        .await
        .context("server error")?;

    info!("Agent gateway shut down gracefully");
    Ok(())
}

async fn handle_shutdown_signals(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown"),
        () = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }

    shutdown_token.cancel();
}

/// Resolves once shutdown is requested; open monitors are closed first so
/// their streams do not hold the server open.
async fn shutdown(token: CancellationToken, dispatcher: DualPathDispatcher) {
    token.cancelled().await;
    dispatcher.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_maps_to_gateway_config() {
        let cli = Cli::parse_from([
            "gateway-server",
            "--debugger",
            "--http-loopback",
            "--port",
            "4000",
            "--test-domain",
            "agents.test",
            "--agents",
            "a:debug,b",
        ]);
        let config = cli.gateway_config().unwrap();
        assert!(config.debugger_enabled);
        assert!(!config.monitor_enabled);
        assert_eq!(config.loopback, LoopbackMode::Http { port: 4000 });
        assert_eq!(config.test_domain.as_deref(), Some("agents.test"));
        assert_eq!(cli.agents, vec!["a:debug", "b"]);
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let cli = Cli::parse_from(["gateway-server", "--session-ttl", "0"]);
        assert!(cli.gateway_config().is_err());
    }
}
