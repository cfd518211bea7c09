mod artifact;
mod cached_engine;
mod config;
mod engine;
mod error;
mod newsgroups_model;
mod pipeline;
mod types;

use anyhow::Context;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use clap::Parser;
use metrics::counter;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use artifact::ArtifactSource;
use cached_engine::{CachedPredictor, PredictionCache};
use config::Config;
use engine::Predictor;
use newsgroups_model::NewsgroupsModel;
use types::{PredictionInput, PredictionOutput};

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,newsgroups_server=debug".into());

    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(&config);
    tracing::info!("Starting prediction server with config: {:?}", config);

    let model_file = ArtifactSource::from(&config)
        .fetch()
        .await
        .context("Failed to fetch model artifact")?;
    let device = pipeline::device(config.cpu_only)?;

    // The model must be loaded before the listener accepts anything
    tracing::info!("Loading newsgroups model...");
    let mut model = NewsgroupsModel::new(model_file, device);
    model.load().context("Failed to load model")?;
    anyhow::ensure!(model.is_loaded(), "Model is not loaded after startup");
    tracing::info!(labels = ?model.labels(), "Model loaded successfully");

    let cache = config
        .cache_enabled
        .then(|| Arc::new(PredictionCache::new(config.cache_capacity)));
    let predictor: Arc<dyn Predictor + Send + Sync> = match &cache {
        Some(cache) => {
            tracing::info!(capacity = config.cache_capacity, "Prediction cache enabled");
            Arc::new(CachedPredictor::new(model, Arc::clone(cache)))
        }
        None => Arc::new(model),
    };

    let app = with_observability(router(AppState::new(predictor, cache)));

    let listener = TcpListener::bind(&config.server_address()).await?;
    tracing::info!("Server running on http://{}", config.server_address());

    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    predictor: Arc<dyn Predictor + Send + Sync>,
    cache: Option<Arc<PredictionCache>>,
}

impl AppState {
    fn new(
        predictor: Arc<dyn Predictor + Send + Sync>,
        cache: Option<Arc<PredictionCache>>,
    ) -> Self {
        Self { predictor, cache }
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/prediction", post(prediction_handler))
        .route("/cache", delete(delete_cache_handler))
        .with_state(state)
}

/// Adds `/metrics` and the request tracing and Prometheus layers.
///
/// Installs the global metrics recorder, so call it once per process.
fn with_observability(app: Router) -> Router {
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    app.route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(prometheus_layer),
        )
}

#[tracing::instrument(
    skip(state, input),
    fields(text_len = input.text.len(), request_id = %uuid::Uuid::new_v4().simple())
)]
async fn prediction_handler(
    State(state): State<AppState>,
    Json(input): Json<PredictionInput>,
) -> Result<Json<PredictionOutput>, StatusCode> {
    counter!("prediction_requests_total").increment(1);

    match state.predictor.predict(input).await {
        Ok(output) => {
            tracing::info!(category = %output.category, "Prediction completed");
            Ok(Json(output))
        }
        Err(e) => {
            counter!("prediction_failures_total").increment(1);
            tracing::error!(error = %e, "Prediction failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[tracing::instrument(skip(state))]
async fn delete_cache_handler(State(state): State<AppState>) -> StatusCode {
    if let Some(cache) = &state.cache {
        let cleared = cache.clear().await;
        tracing::info!(cleared, "Prediction cache cleared");
    }
    StatusCode::NO_CONTENT
}
