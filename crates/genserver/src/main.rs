use std::net::SocketAddr;

use anyhow::Context;
use nanogen_genserver::{router, tasks::run_sweeper, AppState, Config};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    let port = config.port;
    let sweep_interval = config.video_sweep_interval;
    let task_ttl = config.video_task_ttl;

    let state = AppState::from_config(config)?;

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(run_sweeper(
        state.tracker.clone(),
        sweep_interval,
        task_ttl,
        cancel.clone(),
    ));

    let app = router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!("genserver listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("genserver failed")?;

    cancel.cancel();
    sweeper.await.context("sweeper task failed")?;
    Ok(())
}
