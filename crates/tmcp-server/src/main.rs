#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tmcp_config::ServerConfig;
use tmcp_server::audit::StderrSink;
use tmcp_server::{build_app, build_state};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How often the audit buffer is flushed.
const AUDIT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "tmcp-server", version, about = "Task MCP HTTP daemon")]
struct Args {
    /// Bind address (host:port); overrides HOST/PORT from the environment.
    #[arg(long)]
    bind: Option<String>,

    /// Enable request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServerConfig::from_env().context("read configuration")?;

    let filter = if args.debug {
        EnvFilter::new("tmcp=debug,tower_http=debug")
    } else {
        EnvFilter::new(format!("tmcp={}", config.log_level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bind = args
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.host, config.port));
    let state = build_state(config, Arc::new(StderrSink)).context("build server state")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = state
        .audit
        .spawn_flusher(AUDIT_FLUSH_INTERVAL, shutdown_rx);

    let app = build_app(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(
        bind = %bind,
        sandbox = %state.ops.sandbox().root().display(),
        "tmcp-server listening"
    );

    let teardown = state.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining");
        teardown.tearing_down.store(true, Ordering::Relaxed);
    })
    .await
    .context("serve")?;

    // Final audit flush before exit.
    let _ = shutdown_tx.send(true);
    let _ = flusher.await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
