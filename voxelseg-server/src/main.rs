// Voxelseg server - interactive segmentation over HTTP

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use voxelseg_core::EngineConfig;
use voxelseg_engine::gateway::{RemoteModelGateway, RemoteRecognitionBackend};
use voxelseg_engine::ply::AsciiPlyCodec;
use voxelseg_engine::session::SessionStore;
use voxelseg_server::http::{create_router, ApiState};

#[derive(Debug, Parser)]
#[command(name = "voxelseg-server", about = "Interactive 3D segmentation session server")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Directory for per-round artifacts.
    #[arg(long, default_value = "./outputs")]
    output_dir: PathBuf,

    /// Voxel quantization cell size, in scene units.
    #[arg(long, default_value_t = 0.05)]
    voxel_size: f64,

    /// Segmentation model inference endpoint.
    #[arg(long, default_value = "http://127.0.0.1:9001/predict")]
    model_endpoint: String,

    /// Vision-language recognition endpoint.
    #[arg(long, default_value = "http://127.0.0.1:9002/recognize")]
    recognition_endpoint: String,

    /// Request timeout for both collaborator services, in seconds.
    #[arg(long, default_value_t = 120)]
    collaborator_timeout_secs: u64,

    /// Upper bound on concurrent recognition tasks.
    #[arg(long, default_value_t = 8)]
    max_recognition_workers: usize,

    /// Seconds a packaged download survives before deletion.
    #[arg(long, default_value_t = 300)]
    artifact_grace_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig {
        voxel_size: args.voxel_size,
        output_dir: args.output_dir.clone(),
        max_recognition_workers: args.max_recognition_workers,
        artifact_grace_secs: args.artifact_grace_secs,
        ..EngineConfig::default()
    };
    config.validate()?;

    let timeout = Duration::from_secs(args.collaborator_timeout_secs);
    let gateway = Arc::new(RemoteModelGateway::new(args.model_endpoint.clone(), timeout)?);
    let recognizer = Arc::new(RemoteRecognitionBackend::new(
        args.recognition_endpoint.clone(),
        timeout,
    )?);
    let store = Arc::new(SessionStore::new(
        config,
        Arc::new(AsciiPlyCodec),
        gateway,
        recognizer,
    )?);

    let app = create_router(ApiState { store });

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    info!(%addr, model = %args.model_endpoint, "Starting voxelseg server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
