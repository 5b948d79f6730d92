use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hf_hub::api::tokio::Api;
use kiln_core::{gpu_available, load_pipeline, log_memory, Generator, GpuTelemetry};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod args;
mod routes;
mod state;
mod telemetry;
mod tunnel;

use args::Args;
use state::AppState;
use telemetry::{NoGpu, NvidiaSmi};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let server = args.server_config();

    info!("Starting Kiln image generation server");
    let pipeline = load_pipeline(args.pipeline_config(), Api::new()?, args.device_map())
        .await
        .context("failed to load pipelines")?;
    let loaded = pipeline.loaded();
    info!(
        txt2img = loaded.txt2img,
        img2img = loaded.img2img,
        inpaint = loaded.inpaint,
        "Pipelines ready on {}",
        pipeline.device()
    );

    let telemetry: Arc<dyn GpuTelemetry> = if gpu_available() && !args.cpu {
        Arc::new(NvidiaSmi {
            ordinal: args.device,
        })
    } else {
        Arc::new(NoGpu)
    };
    log_memory(telemetry.as_ref());

    // Build application state and wrap in Arc.
    let generator =
        Generator::new(pipeline, args.generation_defaults()).with_telemetry(telemetry.clone());
    let shared_state = Arc::new(AppState::new(generator, telemetry));
    let app = routes::router(shared_state, server.body_limit);

    // --- Start the server ---
    let listener = TcpListener::bind(server.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", server.bind_address()))?;
    let local_addr = listener.local_addr()?;
    info!("Started server on {local_addr}");

    let tunnel = match args.tunnel_config(local_addr.port()) {
        Some(config) => match tunnel::start(config).await {
            Ok(tunnel) => {
                if let Some(url) = tunnel.url() {
                    info!("Public URL: {url}");
                }
                Some(tunnel)
            }
            Err(e) => {
                warn!("Tunnel unavailable: {e:#}");
                None
            }
        },
        None => None,
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(tunnel) = tunnel {
        tunnel.shutdown().await;
    }
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
