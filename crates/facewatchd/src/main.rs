use anyhow::{Context, Result};
use facewatch_core::{arcface_matcher, OnnxFaceEncoder};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod error;
mod pipeline;
mod server;
mod settings;
mod store;
mod webhook;

use config::Config;
use pipeline::Pipeline;
use settings::SettingsHandle;
use store::Store;
use webhook::Notifier;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("facewatchd starting");

    let config = Config::from_env();

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("opening face database {}", config.db_path.display()))?;
    let settings = SettingsHandle::load(store.clone(), config.initial_settings.clone()).await?;

    // Load both models up front so a missing file fails startup.
    let scrfd_path = config.scrfd_model_path();
    let arcface_path = config.arcface_model_path();
    let encoder = OnnxFaceEncoder::load(&scrfd_path, &arcface_path)?;
    tracing::info!(scrfd = %scrfd_path, arcface = %arcface_path, "face models loaded");

    let engine = engine::spawn_engine(Box::new(encoder), config.detect_timeout())?;
    let notifier = Notifier::new(config.webhook_style, config.webhook_timeout())?;
    let pipeline = Pipeline::new(
        store.clone(),
        engine,
        settings.clone(),
        arcface_matcher(config.metric),
        notifier,
        config.record_empty_events,
    );

    let state = server::AppState::new(pipeline, store, settings, config.response_style);
    let app = server::create_app(state, config.max_upload_bytes);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(
        addr = %config.bind_addr,
        metric = %config.metric,
        response_style = %config.response_style,
        webhook_style = %config.webhook_style,
        "facewatchd ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("facewatchd shutting down");
    Ok(())
}
