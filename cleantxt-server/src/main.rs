//! cleantxt-server - streaming transcription job service
//!
//! Accepts a media source (uploaded file or video link), runs the external
//! download/transcription pipeline and streams status, log, progress and the
//! final transcript back to the client over SSE.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

use cleantxt_common::config::RootFolderInitializer;
use cleantxt_server::config::{Args, ServiceConfig};
use cleantxt_server::inference::InferenceClient;
use cleantxt_server::job::{JobController, PythonPreflight};
use cleantxt_server::translate::ChatTranslator;
use cleantxt_server::workspace::WorkspaceManager;
use cleantxt_server::{build_router, AppState, JobRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Step 1: Initialize tracing (RUST_LOG wins; otherwise the configured
    // level is applied once the TOML file is resolved)
    let env_filter = EnvFilter::try_from_default_env().ok();
    let from_env = env_filter.is_some();
    let bootstrap_level = args.log_level.clone().unwrap_or_else(|| "info".to_string());
    let (filter, filter_handle) = reload::Layer::new(
        env_filter.unwrap_or_else(|| EnvFilter::new(log_directives(&bootstrap_level))),
    );
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Step 2: Load TOML and resolve configuration
    let config = ServiceConfig::load(&args).context("Invalid configuration")?;

    if !from_env && config.log_level != bootstrap_level {
        if let Err(e) = filter_handle.reload(EnvFilter::new(log_directives(&config.log_level))) {
            warn!("Failed to apply configured log level {}: {}", config.log_level, e);
        }
    }

    info!("Starting cleantxt-server (Transcription Streaming) microservice");
    info!(
        "cleantxt-server v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    // Step 3: Root folder layout
    let initializer = RootFolderInitializer::new(config.root_folder.clone());
    initializer
        .ensure_directory_exists()
        .map_err(|e| anyhow::anyhow!("Failed to initialize root folder: {}", e))?;
    info!("Root folder: {}", initializer.root().display());

    // Step 4: Pipeline
    let workspaces = WorkspaceManager::new(initializer.uploads_dir(), initializer.jobs_dir());
    let preflight = Arc::new(PythonPreflight::new(
        config.preflight.interpreter.clone(),
        config.preflight.required_modules.clone(),
        config.preflight.env.clone(),
        config.preflight.timeout,
    ));
    let mut controller = JobController::new(config.pipeline.clone(), workspaces, preflight);
    if let Some(inference) = &config.inference {
        let client = InferenceClient::new(
            inference.endpoint.clone(),
            inference.api_key.clone(),
            inference.timeout,
        )
        .context("Failed to create inference client")?;
        info!("Remote inference endpoint: {}", client.endpoint());
        controller = controller.with_inference(Arc::new(client));
    }
    info!(backend = ?config.pipeline.backend, "Transcription backend selected");

    let mut state = AppState::new(controller, config.upload.clone(), config.event_buffer);
    if let Some(translation) = &config.translation {
        let translator = ChatTranslator::new(
            translation.endpoint.clone(),
            translation.api_key.clone(),
            translation.model.clone(),
            translation.timeout,
        )
        .context("Failed to create translation client")?;
        state = state.with_translator(Arc::new(translator), translation.batch_size);
        info!("Subtitle translation enabled (model {})", translation.model);
    }

    let jobs = state.jobs.clone();
    let app = build_router(state);

    // Step 5: Serve
    let bind_address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_address))?;
    info!("Listening on http://{}", bind_address);
    info!("Health check: http://{}/health", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(jobs))
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

fn log_directives(level: &str) -> String {
    format!("{},tower_http=info", level)
}

/// Wait for Ctrl+C or SIGTERM, then cancel running jobs so their streams close
async fn shutdown_signal(jobs: JobRegistry) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }

    let cancelled = jobs.cancel_all().await;
    if cancelled > 0 {
        info!("Cancelled {} running job(s)", cancelled);
    }
}
