use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use onboard_bot::chat::{ChatClient, DiscordClient};
use onboard_bot::config::BotConfig;
use onboard_bot::followup::{FollowupJob, FollowupScheduler, spawn_followup_ticker};
use onboard_bot::onboarding::{
    DispatcherConfig, OnboardingDispatcher, OnboardingRouteState, onboarding_routes,
};
use onboard_bot::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BotConfig::from_env().context("Failed to load configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Onboard bot starting");

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Chat platform ────────────────────────────────────────────────────
    let chat: Arc<dyn ChatClient> = Arc::new(DiscordClient::new(&config.discord));

    // ── Onboarding ───────────────────────────────────────────────────────
    let dispatcher = Arc::new(OnboardingDispatcher::new(
        db.clone(),
        Arc::clone(&chat),
        DispatcherConfig {
            member_role_id: config.discord.member_role_id.clone(),
            announce_channel_id: config.discord.announce_channel_id.clone(),
            public_url: config.public_url.clone(),
        },
    ));

    // ── Follow-ups ───────────────────────────────────────────────────────
    let scheduler = Arc::new(FollowupScheduler::new(
        db.clone(),
        db.clone(),
        Arc::clone(&chat),
        config.followup.clone(),
    ));
    let _ticker = spawn_followup_ticker(
        scheduler,
        FollowupJob::builtin(),
        config.followup.interval,
    );
    tracing::info!(
        interval_secs = config.followup.interval.as_secs(),
        fanout = config.followup.fanout,
        policy = %config.followup.policy,
        "Follow-up ticker started"
    );

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = onboarding_routes(OnboardingRouteState { dispatcher });
    let listener = TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    tracing::info!(
        port = config.http_port,
        public_url = %config.public_url,
        "HTTP server started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    tracing::info!("Onboard bot stopped");
    Ok(())
}

/// Stderr logging, plus a daily rolling file when `log_dir` is set.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "onboard-bot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
