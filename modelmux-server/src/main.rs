use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::{self, Method},
    routing::{get, post},
    Router,
};
use clap::Parser;
use modelmux_core::{initialize_logging, EchoLoader, ModelMux, ModelMuxBuilder};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

mod cache;
mod forward;
mod handlers;

use cache::{DiskResponseCache, ResponseCache};
use forward::forward;
use handlers::{health, models};

// Accept up to 50mb input
const N_INPUT_SIZE: usize = 50;
const MB_TO_B: usize = 1024 * 1024; // 1024 kb in a mb

pub struct ServerState {
    pub mux: Arc<ModelMux>,
    pub cache: Option<Arc<dyn ResponseCache>>,
}

pub type SharedServerState = Arc<ServerState>;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// IP to serve on. Defaults to the `LM_SERVER_URL` environment variable, or "0.0.0.0".
    #[arg(long)]
    serve_ip: Option<String>,

    /// Port to serve on. Defaults to the `LM_PORT_NO` environment variable, or 8000.
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of accelerator devices to place models on. With 0, everything runs on the CPU.
    #[arg(short, long, default_value_t = 0)]
    devices: usize,

    /// Unload models that have been idle for longer than this many seconds.
    #[arg(long, default_value_t = 3600)]
    inactivity_timeout_secs: u64,

    /// Fail a request with 504 if its outcome takes longer than this many seconds.
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Directory for the response cache. Caching is disabled when omitted.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Model id prefixes this server refuses to load.
    #[arg(long, value_delimiter = ',', default_value = "gpt")]
    reserved: Vec<String>,
}

fn get_router(state: SharedServerState) -> Router {
    let allow_origin = AllowOrigin::any();
    let cors_layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION])
        .allow_origin(allow_origin);

    Router::new()
        .route("/forward", post(forward))
        .route("/models", get(models))
        .route("/health", get(health))
        .route("/", get(health))
        .layer(cors_layer)
        .layer(DefaultBodyLimit::max(N_INPUT_SIZE * MB_TO_B))
        .with_state(state)
}

fn port_from_env() -> Result<Option<u16>> {
    match std::env::var("LM_PORT_NO") {
        Ok(raw) => {
            let port = raw
                .parse()
                .with_context(|| format!("`LM_PORT_NO` is not a valid port number: {raw}"))?;
            Ok(Some(port))
        }
        Err(_) => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging();

    let port = match args.port {
        Some(port) => port,
        None => port_from_env()?.unwrap_or(8000),
    };
    let ip = args
        .serve_ip
        .or_else(|| std::env::var("LM_SERVER_URL").ok())
        .unwrap_or_else(|| "0.0.0.0".to_string());

    // Create listener early to validate address before model loading
    let listener = tokio::net::TcpListener::bind(format!("{ip}:{port}")).await?;

    let mux = ModelMuxBuilder::new(Arc::new(EchoLoader::new(args.devices)))
        .with_inactivity_timeout(Duration::from_secs(args.inactivity_timeout_secs))
        .with_reserved_prefixes(args.reserved)
        .with_opt_request_deadline(args.request_timeout_secs.map(Duration::from_secs))
        .build();

    let cache: Option<Arc<dyn ResponseCache>> = match &args.cache_dir {
        Some(dir) => {
            info!("Caching responses under {}.", dir.display());
            Some(Arc::new(DiskResponseCache::new(dir)?))
        }
        None => None,
    };

    let state = Arc::new(ServerState { mux, cache });

    let app = get_router(state);
    info!("Serving on http://{ip}:{}.", port);
    axum::serve(listener, app).await?;

    Ok(())
}
