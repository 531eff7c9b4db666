//! Poll scheduling loop
//!
//! One cycle fetches a fresh dataset snapshot, runs inference, reshapes
//! the output and writes it to a freshly connected sink. The loop then
//! sleeps for whatever remains of the resample period and goes again.
//! Any cycle error stops the loop.

mod clock;


pub use clock::{Clock, SystemClock};

#[cfg(test)]
pub(crate) use clock::ManualClock;

use crate::config::{InferenceParams, RuntimeConfig};
use crate::dataset::DatasetSource;
use crate::health::{components, HealthRegistry};
use crate::models::{DatasetSnapshot, PredictMode};
use crate::observability::{PollerMetrics, StructuredLogger};
use crate::predictor::{Forecaster, PredictionReshaper};
use crate::sink::{SinkFactory, WriteOptions};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Where the poll loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Fetching,
    Inferring,
    Writing,
    Sleeping,
}

/// Outcome of a cycle that finished without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// Not enough history; nothing was predicted or written
    NoData,
    Written { rows: usize },
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleStatus::NoData => f.write_str("null"),
            CycleStatus::Written { .. } => f.write_str("true"),
        }
    }
}

/// Timings of one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub status: CycleStatus,
    /// Dataset refresh
    pub dt_data: Duration,
    /// Inference, reshaping and writing
    pub dt_pred: Duration,
    pub dt_total: Duration,
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, status: {}, dt_data: {:.3}, dt_pred: {:.3}, dt_total: {:.3}",
            self.started_at.format("%Y-%m-%d %H:%M:%S%.6f"),
            self.status,
            self.dt_data.as_secs_f64(),
            self.dt_pred.as_secs_f64(),
            self.dt_total.as_secs_f64(),
        )
    }
}

/// Time left to sleep so cycles start once per period; never negative
pub fn sleep_budget(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

/// Everything that stays fixed across cycles
pub struct PollContext {
    pub model: Arc<dyn Forecaster>,
    /// Template cloned into every refresh
    pub params: InferenceParams,
    pub mode: PredictMode,
    pub reshaper: PredictionReshaper,
    pub write_options: WriteOptions,
    /// Target cycle period, the resample interval
    pub period: Duration,
    pub verbose: bool,
}

impl PollContext {
    pub fn new(
        model: Arc<dyn Forecaster>,
        params: InferenceParams,
        mode: PredictMode,
        prefix: impl Into<String>,
        write_options: WriteOptions,
    ) -> Self {
        let reshaper = PredictionReshaper::new(mode, model.quantiles().to_vec(), prefix);
        let period = params.resample();
        Self {
            model,
            params,
            mode,
            reshaper,
            write_options,
            period,
            verbose: false,
        }
    }

    pub fn from_config(
        model: Arc<dyn Forecaster>,
        params: InferenceParams,
        config: &RuntimeConfig,
    ) -> Self {
        Self::new(
            model,
            params,
            config.predict_kwargs.mode,
            config.prediction_prefix.clone(),
            config.write_kwargs.clone(),
        )
        .verbose(config.verbose)
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Drives poll cycles against a dataset source and a sink
pub struct PollScheduler {
    context: PollContext,
    source: Arc<dyn DatasetSource>,
    sinks: Arc<dyn SinkFactory>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<CycleState>,
    metrics: Option<PollerMetrics>,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
}

impl PollScheduler {
    pub fn context(&self) -> &PollContext {
        &self.context
    }

    pub fn state(&self) -> CycleState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<CycleState> {
        self.state.subscribe()
    }

    fn enter(&self, next: CycleState) {
        let previous = self.state.send_replace(next);
        debug!(from = ?previous, to = ?next, "Poll state transition");
    }

    async fn component_failed(&self, component: &str, error: &anyhow::Error) {
        if let Some(health) = &self.health {
            health.set_unhealthy(component, format!("{:#}", error)).await;
        }
    }

    async fn component_healthy(&self, component: &str) {
        if let Some(health) = &self.health {
            health.set_healthy(component).await;
        }
    }

    /// Run one fetch, infer, write cycle.
    ///
    /// The parameter template is cloned for the refresh. A source that
    /// reports insufficient history ends the cycle with
    /// [`CycleStatus::NoData`] and nothing is written.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let t0 = self.clock.now();
        let started_at = self.clock.utc_now();

        self.enter(CycleState::Fetching);
        let snapshot = match self.source.refresh(self.context.params.clone()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.component_failed(components::DATASET, &e).await;
                return Err(e.context("Dataset refresh failed"));
            }
        };
        let dt_data = self.clock.now().saturating_duration_since(t0);

        let status = match snapshot {
            None => {
                debug!("No data available for inference");
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::DATASET, "Insufficient history")
                        .await;
                }
                CycleStatus::NoData
            }
            Some(snapshot) => {
                self.component_healthy(components::DATASET).await;
                let rows = self.predict_and_write(snapshot).await?;
                CycleStatus::Written { rows }
            }
        };

        let dt_total = self.clock.now().saturating_duration_since(t0);
        let report = CycleReport {
            started_at,
            status,
            dt_data,
            dt_pred: dt_total.saturating_sub(dt_data),
            dt_total,
        };

        self.enter(CycleState::Idle);
        self.logger.log_cycle(&report, self.context.verbose);
        if let Some(metrics) = &self.metrics {
            metrics.observe_cycle(&report);
        }

        Ok(report)
    }

    async fn predict_and_write(&self, snapshot: DatasetSnapshot) -> Result<usize> {
        self.enter(CycleState::Inferring);
        let model = Arc::clone(&self.context.model);
        let mode = self.context.mode;
        let inference = tokio::task::spawn_blocking(move || {
            model
                .predict(&snapshot, mode)
                .map(|output| (snapshot, output))
        })
        .await
        .context("Inference task panicked")?;

        let (snapshot, output) = match inference {
            Ok(result) => result,
            Err(e) => {
                self.component_failed(components::MODEL, &e).await;
                return Err(e.context("Model inference failed"));
            }
        };

        let table = match self.context.reshaper.reshape(&snapshot, &output) {
            Ok(table) => table,
            Err(e) => {
                let e = anyhow::Error::new(e);
                self.component_failed(components::MODEL, &e).await;
                return Err(e.context("Failed to reshape predictions"));
            }
        };
        self.component_healthy(components::MODEL).await;

        self.enter(CycleState::Writing);
        let options = &self.context.write_options;
        let written = match self.sinks.connect() {
            Ok(sink) => sink.write(&table, options).await,
            Err(e) => Err(e),
        };

        match written {
            Ok(rows) => {
                self.component_healthy(components::SINK).await;
                Ok(rows)
            }
            Err(e) => {
                self.component_failed(components::SINK, &e).await;
                Err(e.context(format!("Failed to write predictions to {}", options.name)))
            }
        }
    }

    /// Run cycles back to back, sleeping out the rest of each period.
    ///
    /// Only returns when a cycle fails.
    pub async fn run_forever(&self) -> Result<Infallible> {
        loop {
            let report = match self.run_cycle().await {
                Ok(report) => report,
                Err(e) => {
                    self.enter(CycleState::Idle);
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_cycle_errors();
                    }
                    self.logger.log_cycle_failure(&e);
                    return Err(e);
                }
            };

            let pause = sleep_budget(self.context.period, report.dt_total);
            self.enter(CycleState::Sleeping);
            self.clock.sleep(pause).await;
            self.enter(CycleState::Idle);
        }
    }
}

/// Builder for the poll scheduler
pub struct PollSchedulerBuilder {
    context: Option<PollContext>,
    source: Option<Arc<dyn DatasetSource>>,
    sinks: Option<Arc<dyn SinkFactory>>,
    clock: Arc<dyn Clock>,
    metrics: Option<PollerMetrics>,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
}

impl PollSchedulerBuilder {
    pub fn new() -> Self {
        Self {
            context: None,
            source: None,
            sinks: None,
            clock: Arc::new(SystemClock),
            metrics: None,
            health: None,
            logger: StructuredLogger::new("forecast-poller"),
        }
    }

    pub fn context(mut self, context: PollContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn source(mut self, source: Arc<dyn DatasetSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn sinks(mut self, sinks: Arc<dyn SinkFactory>) -> Self {
        self.sinks = Some(sinks);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: PollerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn build(self) -> Result<PollScheduler> {
        let context = self
            .context
            .ok_or_else(|| anyhow::anyhow!("Poll context is required"))?;
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Dataset source is required"))?;
        let sinks = self
            .sinks
            .ok_or_else(|| anyhow::anyhow!("Sink factory is required"))?;

        if let Some(metrics) = &self.metrics {
            metrics.set_model_info(context.model.name(), context.mode.as_str());
        }

        let (state, _) = watch::channel(CycleState::Idle);
        Ok(PollScheduler {
            context,
            source,
            sinks,
            clock: self.clock,
            state,
            metrics: self.metrics,
            health: self.health,
            logger: self.logger,
        })
    }
}

impl Default for PollSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
