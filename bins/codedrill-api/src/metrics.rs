// Prometheus metrics for execution requests
use anyhow::{anyhow, Result};
use codedrill_common::types::ExecutionReport;
use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

struct Metrics {
    registry: Registry,
    executions: IntCounterVec,
    duration: HistogramVec,
}

impl Metrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let executions = IntCounterVec::new(
            Opts::new("codedrill_executions_total", "Execution requests by mode and outcome"),
            &["mode", "outcome"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "codedrill_execution_duration_seconds",
                "Wall time of execution requests, sandbox included",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["mode"],
        )?;

        registry.register(Box::new(executions.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            executions,
            duration,
        })
    }
}

lazy_static! {
    static ref METRICS: prometheus::Result<Metrics> = Metrics::new();
}

fn metrics() -> Result<&'static Metrics> {
    METRICS
        .as_ref()
        .map_err(|e| anyhow!("Failed to register metrics: {}", e))
}

/// Register metrics up front so a broken definition fails startup.
pub fn init() -> Result<()> {
    metrics().map(|_| ())
}

/// `passed`, `failed`, or the failure category of a request-wide failure.
pub fn outcome_label(report: &ExecutionReport) -> &'static str {
    match report.failure {
        Some(kind) => kind.as_str(),
        None if report.all_passed => "passed",
        None => "failed",
    }
}

pub fn observe_execution(mode: &str, report: &ExecutionReport, elapsed: Duration) {
    if let Ok(m) = metrics() {
        m.executions
            .with_label_values(&[mode, outcome_label(report)])
            .inc();
        m.duration
            .with_label_values(&[mode])
            .observe(elapsed.as_secs_f64());
    }
}

/// Text exposition format.
pub fn render() -> Result<String> {
    let m = metrics()?;
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&m.registry.gather(), &mut buffer)
        .map_err(|e| anyhow!("Failed to encode metrics: {}", e))?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedrill_common::types::{FailureKind, SubmissionOutcome};

    fn outcome(passed: bool) -> SubmissionOutcome {
        SubmissionOutcome {
            fixture_index: 0,
            passed,
            input: "f()".to_string(),
            expected: "1".to_string(),
            actual: String::new(),
            error: None,
            failure: None,
        }
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&ExecutionReport::from_outcomes(vec![outcome(true)])), "passed");
        assert_eq!(outcome_label(&ExecutionReport::from_outcomes(vec![outcome(false)])), "failed");

        let mut report = ExecutionReport::from_outcomes(vec![outcome(false)]);
        report.failure = Some(FailureKind::Timeout);
        assert_eq!(outcome_label(&report), "timeout");
    }

    #[test]
    fn test_render_includes_observed_series() {
        init().unwrap();
        let report = ExecutionReport::from_outcomes(vec![outcome(true)]);
        observe_execution("metrics_test", &report, Duration::from_millis(120));

        let text = render().unwrap();
        assert!(text.contains("codedrill_executions_total{mode=\"metrics_test\",outcome=\"passed\"}"));
        assert!(text.contains("codedrill_execution_duration_seconds_bucket"));
    }
}
