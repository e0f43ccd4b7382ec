//! Inference engine: pure classification over an opaque, immutable model handle.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Number of features every model in this gateway consumes.
pub const N_FEATURES: usize = 4;
pub const FEATURE_NAMES: [&str; N_FEATURES] = ["sepal_length", "sepal_width", "petal_length", "petal_width"];
/// Label encoding of the demo classifier; index order matches training-time encoding.
pub const IRIS_CLASSES: [&str; 3] = ["setosa", "versicolor", "virginica"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub [f64; N_FEATURES]);

impl FeatureVector {
    pub fn new(sepal_length: f64, sepal_width: f64, petal_length: f64, petal_width: f64) -> Self {
        Self([sepal_length, sepal_width, petal_length, petal_width])
    }
    pub fn as_slice(&self) -> &[f64] { &self.0 }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    #[error("model expects {expected} features, got {got}")]
    Shape { expected: usize, got: usize },
    #[error("model produced {got} scores for {expected} classes")]
    Output { expected: usize, got: usize },
    #[error("model produced a non-finite probability")]
    NonFinite,
    #[error("model has no classes")]
    NoClasses,
}

/// A deserialized classifier. Implementations are immutable once built.
pub trait Classifier: Send + Sync + std::fmt::Debug {
    /// Class names in label-index order.
    fn classes(&self) -> &[String];
    fn n_features(&self) -> usize;
    fn predict_proba(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError>;
}

pub type ModelHandle = Arc<dyn Classifier>;

/// Multinomial logistic regression over raw features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    pub classes: Vec<String>,
    pub feature_names: Vec<String>,
    pub coef: Vec<Vec<f64>>,
    pub intercept: Vec<f64>,
}

impl LogisticRegression {
    pub fn into_handle(self) -> ModelHandle { Arc::new(self) }
}

impl Classifier for LogisticRegression {
    fn classes(&self) -> &[String] { &self.classes }
    fn n_features(&self) -> usize { self.feature_names.len() }

    fn predict_proba(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError> {
        if features.len() != self.n_features() {
            return Err(InferenceError::Shape { expected: self.n_features(), got: features.len() });
        }
        let mut scores: Vec<f64> = self.coef.iter().zip(&self.intercept)
            .map(|(row, b)| row.iter().zip(features).map(|(w, x)| w * x).sum::<f64>() + b)
            .collect();
        softmax(&mut scores);
        Ok(scores)
    }
}

/// Label plus per-class probabilities; the caller attaches the version that answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub label_index: usize,
    /// `(class, probability)` in the model's class order.
    pub probabilities: Vec<(String, f64)>,
}

pub fn classify(handle: &dyn Classifier, features: &FeatureVector) -> Result<Classification, InferenceError> {
    let probs = handle.predict_proba(features.as_slice())?;
    let classes = handle.classes();
    if probs.len() != classes.len() {
        return Err(InferenceError::Output { expected: classes.len(), got: probs.len() });
    }
    if probs.is_empty() { return Err(InferenceError::NoClasses); }
    if probs.iter().any(|p| !p.is_finite()) { return Err(InferenceError::NonFinite); }
    // first maximum wins on ties
    let label_index = probs.iter().enumerate()
        .fold(0usize, |best, (i, p)| if *p > probs[best] { i } else { best });
    Ok(Classification {
        label: classes[label_index].clone(),
        label_index,
        probabilities: classes.iter().cloned().zip(probs).collect(),
    })
}

pub(crate) fn softmax(v: &mut [f64]) {
    if v.is_empty() { return; }
    let max = v.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for x in v.iter_mut() { *x = (*x - max).exp(); sum += *x; }
    if sum > 0.0 { for x in v.iter_mut() { *x /= sum; } }
}
