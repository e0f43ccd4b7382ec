//! Demo trainer: multinomial logistic regression on Iris, logged as a tracking run.

use crate::dataset::{self, Dataset};
use crate::engine::{classify, softmax, FeatureVector, LogisticRegression, FEATURE_NAMES, N_FEATURES};
use crate::store::{LocalStore, RunInfo, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

pub const RUN_NAME: &str = "logreg_demo";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainParams {
    /// Inverse L2 regularisation strength.
    pub c: f64,
    pub max_iter: usize,
    pub learning_rate: f64,
}

impl Default for TrainParams { fn default() -> Self { Self { c: 1.0, max_iter: 200, learning_rate: 0.5 } } }

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainMetrics { pub accuracy: f64, pub f1_micro: f64 }

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid training parameters: {0}")] InvalidParams(String),
    #[error("dataset error: {0}")] Dataset(#[from] csv::Error),
    #[error(transparent)] Store(#[from] StoreError),
}

/// Fit on the 80% stratified split and score on the held-out 20%.
pub fn train_demo(params: TrainParams) -> Result<(LogisticRegression, TrainMetrics), TrainError> {
    if !(params.c > 0.0) || params.max_iter == 0 || !(params.learning_rate > 0.0) {
        return Err(TrainError::InvalidParams(format!("{params:?}")));
    }
    let (train, test) = dataset::iris()?.stratified_split(0.2, 42);
    let model = fit(&train, params);
    let metrics = evaluate(&model, &test);
    info!(c = params.c, max_iter = params.max_iter, accuracy = metrics.accuracy, f1_micro = metrics.f1_micro, "demo model trained");
    Ok((model, metrics))
}

/// Train and record the run (params, metrics, model artifact) in the tracking store.
pub async fn train_and_log(store: &LocalStore, experiment: &str, params: TrainParams) -> Result<(RunInfo, TrainMetrics), TrainError> {
    let start_time = serve_core::now_ms();
    let (model, metrics) = train_demo(params)?;
    let run_params = BTreeMap::from([
        ("C".to_string(), params.c.to_string()),
        ("max_iter".to_string(), params.max_iter.to_string()),
    ]);
    let run_metrics = BTreeMap::from([
        ("accuracy".to_string(), metrics.accuracy),
        ("f1_micro".to_string(), metrics.f1_micro),
    ]);
    let run = store.log_run(experiment, RUN_NAME, run_params, run_metrics, &model, start_time).await?;
    Ok((run, metrics))
}

fn standardize_stats(ds: &Dataset) -> ([f64; N_FEATURES], [f64; N_FEATURES]) {
    let n = ds.len().max(1) as f64;
    let mut mean = [0.0; N_FEATURES];
    let mut scale = [0.0; N_FEATURES];
    for x in &ds.features { for j in 0..N_FEATURES { mean[j] += x[j] / n; } }
    for x in &ds.features { for j in 0..N_FEATURES { scale[j] += (x[j] - mean[j]).powi(2) / n; } }
    for s in scale.iter_mut() { *s = if *s > 0.0 { s.sqrt() } else { 1.0 }; }
    (mean, scale)
}

/// Full-batch gradient descent on standardized features; the scaling is folded back
/// into the weights so the artifact consumes raw measurements.
fn fit(ds: &Dataset, params: TrainParams) -> LogisticRegression {
    let k = ds.classes.len();
    let n = ds.len().max(1) as f64;
    let (mean, scale) = standardize_stats(ds);
    let z: Vec<[f64; N_FEATURES]> = ds.features.iter()
        .map(|x| std::array::from_fn(|j| (x[j] - mean[j]) / scale[j]))
        .collect();
    let penalty = 1.0 / (params.c * n);
    let mut w = vec![[0.0f64; N_FEATURES]; k];
    let mut b = vec![0.0f64; k];

    for _ in 0..params.max_iter {
        let mut gw = vec![[0.0f64; N_FEATURES]; k];
        let mut gb = vec![0.0f64; k];
        for (x, &y) in z.iter().zip(&ds.labels) {
            let mut p: Vec<f64> = (0..k).map(|c| w[c].iter().zip(x).map(|(wi, xi)| wi * xi).sum::<f64>() + b[c]).collect();
            softmax(&mut p);
            for c in 0..k {
                let err = p[c] - if c == y { 1.0 } else { 0.0 };
                for j in 0..N_FEATURES { gw[c][j] += err * x[j] / n; }
                gb[c] += err / n;
            }
        }
        for c in 0..k {
            for j in 0..N_FEATURES { w[c][j] -= params.learning_rate * (gw[c][j] + penalty * w[c][j]); }
            b[c] -= params.learning_rate * gb[c];
        }
    }

    let coef: Vec<Vec<f64>> = w.iter().map(|row| (0..N_FEATURES).map(|j| row[j] / scale[j]).collect()).collect();
    let intercept: Vec<f64> = (0..k).map(|c| b[c] - (0..N_FEATURES).map(|j| w[c][j] * mean[j] / scale[j]).sum::<f64>()).collect();
    LogisticRegression {
        classes: ds.classes.clone(),
        feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        coef,
        intercept,
    }
}

fn evaluate(model: &LogisticRegression, ds: &Dataset) -> TrainMetrics {
    let correct = ds.features.iter().zip(&ds.labels)
        .filter(|(x, y)| classify(model, &FeatureVector(**x)).map(|c| c.label_index).ok() == Some(**y))
        .count() as f64;
    let total = ds.len().max(1) as f64;
    // micro-averaged: every miss is one false positive and one false negative
    let (tp, fp, fn_) = (correct, total - correct, total - correct);
    let precision = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
    let recall = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
    let f1_micro = if precision + recall > 0.0 { 2.0 * precision * recall / (precision + recall) } else { 0.0 };
    TrainMetrics { accuracy: correct / total, f1_micro }
}
