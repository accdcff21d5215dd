use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use voice_bridge::bridge::{build_router, AppState};
use voice_bridge::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let config = Config::parse();
    config.validate()?;
    let config = Arc::new(config);

    info!(
        listen = config.listen_addr(),
        upstream = %config.upstream_url,
        bot_name = %config.bot_name,
        "🚀 voice-bridge starting"
    );

    // Root cancellation: ctrl-c stops the listener and is the parent
    // signal every live session observes.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let state = AppState {
        config: config.clone(),
        shutdown: shutdown.clone(),
    };
    let app = build_router(state);

    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!(addr = %config.listen_addr(), "✅ listening, browsers connect at /ws/realtime");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("voice-bridge shut down");
    Ok(())
}
