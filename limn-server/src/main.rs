use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use hf_hub::api::tokio::Api;
use image::ImageFormat;
use limn_core::{
    data_url::{data_url_to_image, image_to_data_url},
    load_model, model_spec, DeviceMap, DiffusionRequest, ModelSpec, Orchestrator,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::{net::TcpListener, task};
use tracing::{error, info};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Limn image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model identifier to load at startup
    #[arg(long, default_value = "dreamshaper")]
    model: String,

    /// Number of images generated per request
    #[arg(long, default_value_t = 5)]
    num_images: usize,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[derive(Serialize)]
struct DiffusionResponse {
    images: Vec<String>,
}

// Application state containing the preloaded pipeline and its defaults.
struct AppState {
    orchestrator: Orchestrator,
    spec: &'static ModelSpec,
    num_images: usize,
}

/// Liveness probe; responds regardless of what the pipeline is doing.
async fn health_handler() -> &'static str {
    "Online"
}

async fn diffusion_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DiffusionRequest>,
) -> Response {
    // Malformed transport strings are the client's fault.
    let init_image = match data_url_to_image(&request.image_data_url) {
        Ok(image) => image,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("Error: {e}")).into_response(),
    };
    let params = request.params.resolve(&state.spec.defaults);
    let prompt = request.prompt;

    // The batch blocks for seconds per image; keep it off the async runtime.
    let worker = Arc::clone(&state);
    let generated = task::spawn_blocking(move || {
        worker
            .orchestrator
            .generate(&prompt, &init_image, worker.num_images, &params)
    })
    .await;

    let images = match generated {
        Ok(Ok(images)) => images,
        Ok(Err(e)) => {
            error!(error = %e, "generation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}")).into_response();
        }
        Err(e) => {
            error!(error = %e, "generation task aborted");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error: generation task aborted".to_string(),
            )
                .into_response();
        }
    };

    let encoded: Result<Vec<String>, _> = images
        .iter()
        .map(|image| image_to_data_url(image, ImageFormat::Png))
        .collect();
    match encoded {
        Ok(images) => Json(DiffusionResponse { images }).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode generated image");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}")).into_response()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };

    // Load the pipeline once; it is cached in process state for its lifetime.
    let spec = model_spec(&args.model)?;
    let pipeline = load_model(&args.model, Api::new()?, device_map).await?;

    let app_state = Arc::new(AppState {
        orchestrator: Orchestrator::new(pipeline),
        spec,
        num_images: args.num_images,
    });

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/test", get(health_handler))
        .route("/diffusion", post(diffusion_handler))
        .with_state(app_state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!(address = %listener.local_addr()?, "started server");
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
