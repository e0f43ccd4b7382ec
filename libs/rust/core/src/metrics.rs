//! Prometheus metrics for the serving path and the model lifecycle.
//!
//! Everything registers into the default registry so `/metrics` can gather it in one pass.

use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter_vec, register_int_gauge_vec, Encoder, Histogram, IntCounterVec, IntGaugeVec, TextEncoder};
use std::time::Duration;

pub struct GatewayMetrics {
    pub predictions_total: IntCounterVec,
    pub inference_latency_seconds: Histogram,
    pub model_loads_total: IntCounterVec,
    pub model_load_seconds: Histogram,
    pub active_model_info: IntGaugeVec,
}

pub static GATEWAY_METRICS: Lazy<GatewayMetrics> = Lazy::new(|| GatewayMetrics {
    predictions_total: register_int_counter_vec!(
        "gateway_predictions_total",
        "Prediction requests by outcome",
        &["outcome"]
    )
    .expect("valid predictions_total definition"),
    inference_latency_seconds: register_histogram!(
        "gateway_inference_latency_seconds",
        "Time spent inside the inference engine",
        vec![0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.05]
    )
    .expect("valid inference_latency definition"),
    model_loads_total: register_int_counter_vec!(
        "gateway_model_loads_total",
        "Model load attempts by outcome (success|failure|rejected)",
        &["outcome"]
    )
    .expect("valid model_loads_total definition"),
    model_load_seconds: register_histogram!(
        "gateway_model_load_seconds",
        "Resolve + fetch duration of model loads",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0]
    )
    .expect("valid model_load_seconds definition"),
    active_model_info: register_int_gauge_vec!(
        "gateway_active_model_info",
        "Set to 1 for the version currently answering predictions",
        &["version"]
    )
    .expect("valid active_model_info definition"),
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome { Success, Failure, Rejected }

impl LoadOutcome {
    fn label(self) -> &'static str { match self { Self::Success => "success", Self::Failure => "failure", Self::Rejected => "rejected" } }
}

pub fn record_load(outcome: LoadOutcome, elapsed: Option<Duration>) {
    GATEWAY_METRICS.model_loads_total.with_label_values(&[outcome.label()]).inc();
    if let Some(d) = elapsed { GATEWAY_METRICS.model_load_seconds.observe(d.as_secs_f64()); }
}

pub fn record_prediction(outcome: &str, elapsed: Duration) {
    GATEWAY_METRICS.predictions_total.with_label_values(&[outcome]).inc();
    GATEWAY_METRICS.inference_latency_seconds.observe(elapsed.as_secs_f64());
}

/// Only one version is ever reported as active.
pub fn set_active_model(version: &str) {
    GATEWAY_METRICS.active_model_info.reset();
    GATEWAY_METRICS.active_model_info.with_label_values(&[version]).set(1);
}

pub fn encode_text() -> anyhow::Result<Vec<u8>> {
    Lazy::force(&GATEWAY_METRICS);
    let families = prometheus::gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&families, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_model_is_exclusive() {
        set_active_model("run-a");
        set_active_model("run-b");
        assert_eq!(GATEWAY_METRICS.active_model_info.with_label_values(&["run-b"]).get(), 1);
        let text = String::from_utf8(encode_text().unwrap()).unwrap();
        assert!(!text.contains("version=\"run-a\""));
    }

    #[test]
    fn load_outcomes_are_counted() {
        let before = GATEWAY_METRICS.model_loads_total.with_label_values(&["rejected"]).get();
        record_load(LoadOutcome::Rejected, None);
        assert!(GATEWAY_METRICS.model_loads_total.with_label_values(&["rejected"]).get() > before);
    }
}
