use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use remote_prompt::api;
use remote_prompt::config::ServerConfig;
use remote_prompt::events::EventBus;
use remote_prompt::jobs::{JobManager, notify};
use remote_prompt::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("Invalid configuration")?;

    // Logging: stderr + daily-rotated file
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log dir {}", config.log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "server.log");
    let (non_blocking, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    eprintln!("📱 Remote Prompt v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: http://{}", config.bind_addr);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Logs: {}", config.log_dir.display());
    eprintln!(
        "   Jobs: timeout {}s, {} concurrent, threads compat {}",
        config.jobs.job_timeout.as_secs(),
        config.jobs.max_concurrent_jobs,
        if config.jobs.threads_compat_mode { "on" } else { "off" },
    );
    match &config.notifications.relay_url {
        Some(url) => eprintln!("   Notifications: {url}"),
        None => eprintln!("   Notifications: log only"),
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Jobs ─────────────────────────────────────────────────────────────
    let events = EventBus::new(config.events.clone());
    let notifier = notify::from_config(&config.notifications);
    let manager = Arc::new(JobManager::new(
        config.jobs.clone(),
        Arc::clone(&db),
        events,
        notifier,
    ));

    let recovered = manager.recover_interrupted().await?;
    if recovered > 0 {
        eprintln!("   Failed {recovered} jobs interrupted by the last shutdown");
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::routes(Arc::clone(&manager)).layer(api::cors(&config.allowed_origins));
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "Server started");

    let shutdown_manager = Arc::clone(&manager);
    let shutdown_grace = config.shutdown_grace;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
            shutdown_manager.broadcast_event(
                "server_shutdown",
                serde_json::json!({"reason": "server stopping"}),
            );
            // Open streams hold their connections; closing them lets serve return.
            shutdown_manager.shutdown(shutdown_grace).await;
        })
        .await
        .context("Server error")?;

    Ok(())
}
