//! Run metrics.
//!
//! An explicit [`Metrics`] handle owns the prometheus registry; the manager
//! records run lifecycle observations through it and the server renders the
//! text exposition at `/metrics`.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::error::LacquerError;

pub struct Metrics {
    registry: Registry,
    pub runs_total: IntCounter,
    pub runs_active: IntGauge,
    pub run_duration_seconds: HistogramVec,
    pub run_status_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, LacquerError> {
        let registry = Registry::new();

        let runs_total = IntCounter::with_opts(Opts::new(
            "lacquer_runs_total",
            "Workflow executions accepted",
        ))
        .map_err(internal)?;
        let runs_active = IntGauge::with_opts(Opts::new(
            "lacquer_runs_active",
            "Workflow executions currently running",
        ))
        .map_err(internal)?;
        let run_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "lacquer_run_duration_seconds",
                "Wall-clock duration of finished executions",
            ),
            &["workflow_id", "status"],
        )
        .map_err(internal)?;
        let run_status_total = IntCounterVec::new(
            Opts::new("lacquer_run_status_total", "Finished executions by status"),
            &["workflow_id", "status"],
        )
        .map_err(internal)?;

        registry
            .register(Box::new(runs_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(runs_active.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(run_duration_seconds.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(run_status_total.clone()))
            .map_err(internal)?;

        Ok(Self {
            registry,
            runs_total,
            runs_active,
            run_duration_seconds,
            run_status_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode_text(&self) -> Result<String, LacquerError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(internal)?;
        String::from_utf8(buffer).map_err(|err| LacquerError::internal(err.to_string()))
    }
}

fn internal(err: impl std::fmt::Display) -> LacquerError {
    LacquerError::internal(format!("metrics: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_encode() {
        let metrics = Metrics::new().unwrap();
        metrics.runs_total.inc();
        metrics.runs_active.set(2);
        metrics
            .run_duration_seconds
            .with_label_values(&["wf", "completed"])
            .observe(1.5);
        metrics
            .run_status_total
            .with_label_values(&["wf", "completed"])
            .inc();

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("lacquer_runs_total 1"));
        assert!(text.contains("lacquer_runs_active 2"));
        assert!(text.contains("lacquer_run_duration_seconds"));
    }
}
