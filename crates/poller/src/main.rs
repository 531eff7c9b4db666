//! Forecast poller - periodic forecasting inference
//!
//! Loads a trained model once, then every resample period pulls fresh
//! data, predicts the next horizon and writes the predictions to SQL.

use anyhow::{Context, Result};
use clap::Parser;
use poller_lib::{
    config::{InferenceParams, RuntimeConfig, TrainingConfig, DEFAULT_CONFIG_PATH},
    dataset::SqliteSource,
    health::HealthRegistry,
    observability::{PollerMetrics, StructuredLogger},
    predictor::{Forecaster, ModelRegistry, ModelSpec},
    scheduler::{PollContext, PollSchedulerBuilder},
    sink::SqliteSinkFactory,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;

const POLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "forecast-poller")]
#[command(author, version, about = "Periodic forecasting inference poller", long_about = None)]
struct Cli {
    /// Runtime config file
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    info!(config = %cli.config.display(), "Starting forecast-poller");

    // Load configuration
    let config = RuntimeConfig::load(&cli.config)
        .with_context(|| format!("Failed to load runtime config {}", cli.config.display()))?;
    let training = TrainingConfig::load(&config.train_kwargs).with_context(|| {
        format!(
            "Failed to load training config {}",
            config.train_kwargs.display()
        )
    })?;
    let params = InferenceParams::from_training(&training, config.past)
        .context("Failed to translate training dataset parameters")?;

    // Initialize health registry
    let health_registry = HealthRegistry::with_poller_components().await;

    // Start health and metrics server
    let metrics = PollerMetrics::new();
    if let Some(port) = config.metrics_port {
        let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
        api::spawn(port, app_state);
    }

    // Load the model once; an unknown class ends startup here
    let mut spec = ModelSpec::new(training.model_class()?, &config.model_path);
    if let Some(quantiles) = training.quantiles()? {
        spec = spec.with_quantiles(quantiles);
    }
    let model: Arc<dyn Forecaster> = Arc::from(ModelRegistry::with_defaults().load(&spec)?);

    let logger = StructuredLogger::new(instance_name());
    logger.log_startup(POLLER_VERSION, model.name(), params.resample_seconds());

    let sinks = SqliteSinkFactory::from_config(&config.engine_kwargs)
        .context("Invalid engine_kwargs")?;

    let scheduler = PollSchedulerBuilder::new()
        .context(PollContext::from_config(model, params, &config))
        .source(Arc::new(SqliteSource::new()))
        .sinks(Arc::new(sinks))
        .metrics(metrics)
        .health(health_registry.clone())
        .logger(logger.clone())
        .build()?;

    // Mark poller as ready after initialization
    health_registry.set_ready(true).await;

    tokio::select! {
        result = scheduler.run_forever() => {
            let error = match result {
                Ok(never) => match never {},
                Err(e) => e,
            };
            health_registry.set_ready(false).await;
            logger.log_shutdown("poll cycle failed");
            return Err(error);
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
        }
    }

    info!("Shutting down");
    Ok(())
}

fn instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "forecast-poller".to_string())
}
