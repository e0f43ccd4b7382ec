#![allow(dead_code)]

use async_trait::async_trait;
use inference_gateway::engine::{LogisticRegression, FEATURE_NAMES, IRIS_CLASSES};
use inference_gateway::store::{Experiment, ModelReference, ModelVersion, RegisteredModel, RunInfo};
use inference_gateway::{ModelHandle, ModelSource, ModelStore, Stage, StoreError, VersionId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

pub fn model(bias: f64) -> LogisticRegression {
    LogisticRegression {
        classes: IRIS_CLASSES.iter().map(|s| s.to_string()).collect(),
        feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        coef: vec![vec![0.0; 4]; 3],
        intercept: vec![bias, 0.0, 0.0],
    }
}

pub fn run(id: &str) -> ModelSource { ModelSource::RunId(id.to_string()) }

/// In-memory store whose fetches can be held open until the test releases them.
#[derive(Default)]
pub struct GatedStore {
    runs: Mutex<HashMap<String, LogisticRegression>>,
    failing: Mutex<HashSet<String>>,
    gated: Mutex<HashMap<String, Arc<Semaphore>>>,
    pub fetch_started: Notify,
}

impl GatedStore {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn add_run(&self, id: &str) { self.runs.lock().insert(id.to_string(), model(0.0)); }

    /// Resolves, but fetch fails with a transport error.
    pub fn add_failing_run(&self, id: &str) {
        self.add_run(id);
        self.failing.lock().insert(id.to_string());
    }

    /// Fetch of `id` blocks until the returned semaphore gets a permit.
    pub fn gate(&self, id: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gated.lock().insert(id.to_string(), gate.clone());
        gate
    }
}

#[async_trait]
impl ModelStore for GatedStore {
    async fn resolve_latest(&self, experiment: &str, _: &str) -> Result<ModelReference, StoreError> {
        Err(StoreError::NotFound(format!("experiment '{experiment}'")))
    }

    async fn resolve_by_run_id(&self, run_id: &str) -> Result<ModelReference, StoreError> {
        if !self.runs.lock().contains_key(run_id) { return Err(StoreError::NotFound(format!("run '{run_id}'"))); }
        Ok(ModelReference { version: VersionId::run(run_id), run_id: run_id.to_string(), artifact_uri: format!("mem://{run_id}") })
    }

    async fn resolve_by_registry(&self, name: &str, stage: Stage) -> Result<ModelReference, StoreError> {
        Err(StoreError::NotFound(format!("model '{name}' in {stage}")))
    }

    async fn fetch(&self, reference: &ModelReference) -> Result<ModelHandle, StoreError> {
        self.fetch_started.notify_one();
        let gate = self.gated.lock().get(&reference.run_id).cloned();
        if let Some(gate) = gate {
            let permit = gate.acquire().await.map_err(|_| StoreError::Fetch("gate closed".into()))?;
            permit.forget();
        }
        if self.failing.lock().contains(&reference.run_id) { return Err(StoreError::Fetch("connection reset".into())); }
        let model = self.runs.lock().get(&reference.run_id).cloned();
        model.map(LogisticRegression::into_handle).ok_or_else(|| StoreError::NotFound(reference.run_id.clone()))
    }

    async fn register(&self, _: &str, _: &str) -> Result<ModelVersion, StoreError> { Err(StoreError::Registry("read-only".into())) }
    async fn promote(&self, _: &str, _: u32, _: Stage, _: bool) -> Result<ModelVersion, StoreError> { Err(StoreError::Registry("read-only".into())) }
    async fn delete_version(&self, _: &str, _: u32) -> Result<(), StoreError> { Err(StoreError::Registry("read-only".into())) }
    async fn delete_model(&self, _: &str) -> Result<(), StoreError> { Err(StoreError::Registry("read-only".into())) }
    async fn list_experiments(&self) -> Result<Vec<Experiment>, StoreError> { Ok(Vec::new()) }
    async fn list_runs(&self, _: &str) -> Result<Vec<RunInfo>, StoreError> { Ok(Vec::new()) }
    async fn list_models(&self) -> Result<Vec<RegisteredModel>, StoreError> { Ok(Vec::new()) }
    async fn list_versions(&self, _: &str) -> Result<Vec<ModelVersion>, StoreError> { Ok(Vec::new()) }
}
