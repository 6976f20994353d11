use anyhow::{Context, Result};
use faceswap_core::{LazySwapper, OnnxFaceSwapper, RequestHandler, StagingArea};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod page;
mod web;

/// Resolves on SIGTERM or Ctrl+C.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("faceswapd starting");

    let config = config::Config::from_env();
    tracing::debug!(?config, "configuration loaded");

    let paths = config.model_paths();
    for model in paths.status().iter().filter(|m| !m.present) {
        tracing::warn!(model = model.name, path = %model.path.display(), "model file missing; swaps will fail until it is installed");
    }

    // Sessions are built on the engine thread at the first swap.
    let options = config.swapper_options();
    let swapper = LazySwapper::new(move || OnnxFaceSwapper::load(&paths, &options));

    let handler = RequestHandler::new(StagingArea::new(&config.staging_dir)).with_jpeg_quality(config.jpeg_quality);
    let engine = engine::spawn_engine(Box::new(swapper), handler).context("failed to start engine")?;

    let pages = page::Pages::new().context("failed to load page templates")?;
    let app = web::router(web::AppState::new(engine, pages), config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "faceswapd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("faceswapd stopped");
    Ok(())
}
