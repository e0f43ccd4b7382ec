//! Model cache: the single source of truth for which model answers predictions.
//!
//! Readers take a lock-free snapshot of the active slot. Loads are serialized by a
//! try-lock gate, run resolve + fetch without holding anything readers touch, and
//! publish with one atomic swap. A failed reload never disturbs a ready model.

use crate::engine::ModelHandle;
use crate::store::{ModelSource, ModelStore, StoreError, VersionId};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serve_core::metrics::{record_load, set_active_model, LoadOutcome};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// The model currently answering predictions. Cloning is two refcount bumps.
#[derive(Debug, Clone)]
pub struct ActiveModel {
    pub handle: ModelHandle,
    pub version: VersionId,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CacheState {
    Empty,
    Loading,
    Ready(ActiveModel),
    Failed(String),
}

impl CacheState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Loading => "loading",
            Self::Ready(_) => "ready",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Model not loaded")]
    NotReady,
    #[error("a model load is already in progress")]
    LoadInProgress,
    #[error(transparent)]
    Fetch(#[from] StoreError),
    #[error("model fetch timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadFailure {
    pub source: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub state: &'static str,
    pub model_version: Option<VersionId>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
    pub last_error: Option<LoadFailure>,
}

pub struct ModelCache {
    state: ArcSwap<CacheState>,
    store: Arc<dyn ModelStore>,
    load_gate: Mutex<()>,
    fetch_timeout: Duration,
    last_error: RwLock<Option<LoadFailure>>,
}

impl ModelCache {
    pub fn new(store: Arc<dyn ModelStore>, fetch_timeout: Duration) -> Self {
        Self {
            state: ArcSwap::from_pointee(CacheState::Empty),
            store,
            load_gate: Mutex::new(()),
            fetch_timeout,
            last_error: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn ModelStore> { &self.store }

    /// Snapshot of the active model. Never waits on a load in flight.
    pub fn get(&self) -> Result<ActiveModel, CacheError> {
        match &**self.state.load() {
            CacheState::Ready(active) => Ok(active.clone()),
            _ => Err(CacheError::NotReady),
        }
    }

    pub fn state(&self) -> Arc<CacheState> { self.state.load_full() }

    pub fn status(&self) -> CacheStatus {
        let state = self.state.load();
        let (model_version, loaded_at, failure) = match &**state {
            CacheState::Ready(a) => (Some(a.version.clone()), Some(a.loaded_at), None),
            CacheState::Failed(reason) => (None, None, Some(reason.clone())),
            _ => (None, None, None),
        };
        CacheStatus { state: state.label(), model_version, loaded_at, failure, last_error: self.last_error.read().clone() }
    }

    /// Resolve, fetch and publish a model using the configured fetch timeout.
    pub async fn load(&self, source: &ModelSource) -> Result<VersionId, CacheError> {
        self.load_with_timeout(source, self.fetch_timeout).await
    }

    /// Rejects with `LoadInProgress` while another load holds the gate.
    pub async fn load_with_timeout(&self, source: &ModelSource, timeout: Duration) -> Result<VersionId, CacheError> {
        let Ok(_gate) = self.load_gate.try_lock() else {
            warn!(%source, "model load rejected: another load is in progress");
            record_load(LoadOutcome::Rejected, None);
            return Err(CacheError::LoadInProgress);
        };

        let prior = self.state.load_full();
        let had_ready = matches!(*prior, CacheState::Ready(_));
        let mut marker = LoadingMarker::arm(&self.state, prior.clone(), !had_ready);

        info!(%source, timeout_ms = timeout.as_millis() as u64, "model load started");
        let started = Instant::now();
        let fetched = tokio::time::timeout(timeout, async {
            let reference = self.store.resolve(source).await?;
            let handle = self.store.fetch(&reference).await?;
            Ok::<_, StoreError>((reference, handle))
        }).await;
        let result = match fetched {
            Ok(Ok(pair)) => Ok(pair),
            Ok(Err(e)) => Err(CacheError::Fetch(e)),
            Err(_) => Err(CacheError::Timeout(timeout)),
        };
        let elapsed = started.elapsed();
        marker.disarm();

        match result {
            Ok((reference, handle)) => {
                let version = reference.version.clone();
                let active = ActiveModel { handle, version: version.clone(), loaded_at: Utc::now() };
                let previous = self.state.swap(Arc::new(CacheState::Ready(active)));
                match &*previous {
                    CacheState::Ready(old) => {
                        info!(old_version = %old.version, new_version = %version, elapsed_ms = elapsed.as_millis() as u64, "model swapped")
                    }
                    _ => info!(version = %version, elapsed_ms = elapsed.as_millis() as u64, "model published"),
                }
                *self.last_error.write() = None;
                set_active_model(version.as_str());
                serve_core::mark_ready();
                record_load(LoadOutcome::Success, Some(elapsed));
                Ok(version)
            }
            Err(e) => {
                if had_ready {
                    warn!(%source, error = %e, "model reload failed; keeping active model");
                } else {
                    error!(%source, error = %e, "model load failed; no model active");
                    self.state.store(Arc::new(CacheState::Failed(e.to_string())));
                }
                *self.last_error.write() = Some(LoadFailure { source: source.to_string(), reason: e.to_string(), at: Utc::now() });
                record_load(LoadOutcome::Failure, Some(elapsed));
                Err(e)
            }
        }
    }
}

/// Shows `Loading` while a first load runs and puts the prior state back if the load
/// future is dropped before it finishes.
struct LoadingMarker<'a> {
    state: &'a ArcSwap<CacheState>,
    prior: Arc<CacheState>,
    loading: Option<Arc<CacheState>>,
}

impl<'a> LoadingMarker<'a> {
    fn arm(state: &'a ArcSwap<CacheState>, prior: Arc<CacheState>, show_loading: bool) -> Self {
        let loading = show_loading.then(|| {
            let loading = Arc::new(CacheState::Loading);
            state.store(loading.clone());
            loading
        });
        Self { state, prior, loading }
    }

    fn disarm(&mut self) { self.loading = None; }
}

impl Drop for LoadingMarker<'_> {
    fn drop(&mut self) {
        if let Some(loading) = self.loading.take() {
            let _ = self.state.compare_and_swap(&loading, self.prior.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LogisticRegression, FEATURE_NAMES, IRIS_CLASSES};
    use crate::store::{Experiment, ModelReference, ModelVersion, RegisteredModel, RunInfo, Stage};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Runs listed in `models` resolve and fetch; anything else is not found.
    struct FakeStore { models: HashMap<String, LogisticRegression>, fetch_delay: Duration }

    fn model(bias: f64) -> LogisticRegression {
        LogisticRegression {
            classes: IRIS_CLASSES.iter().map(|s| s.to_string()).collect(),
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            coef: vec![vec![0.0; 4]; 3],
            intercept: vec![bias, 0.0, 0.0],
        }
    }

    fn cache_with(runs: &[&str], fetch_delay: Duration) -> ModelCache {
        let models = runs.iter().enumerate().map(|(i, r)| (r.to_string(), model(i as f64))).collect();
        ModelCache::new(Arc::new(FakeStore { models, fetch_delay }), Duration::from_millis(200))
    }

    #[async_trait]
    impl ModelStore for FakeStore {
        async fn resolve_latest(&self, _: &str, _: &str) -> Result<ModelReference, StoreError> { Err(StoreError::NotFound("latest".into())) }
        async fn resolve_by_run_id(&self, run_id: &str) -> Result<ModelReference, StoreError> {
            if !self.models.contains_key(run_id) { return Err(StoreError::NotFound(run_id.into())); }
            Ok(ModelReference { version: VersionId::run(run_id), run_id: run_id.into(), artifact_uri: run_id.into() })
        }
        async fn resolve_by_registry(&self, name: &str, _: Stage) -> Result<ModelReference, StoreError> { Err(StoreError::NotFound(name.into())) }
        async fn fetch(&self, reference: &ModelReference) -> Result<ModelHandle, StoreError> {
            tokio::time::sleep(self.fetch_delay).await;
            self.models.get(&reference.run_id).cloned().map(LogisticRegression::into_handle).ok_or_else(|| StoreError::Fetch("gone".into()))
        }
        async fn register(&self, _: &str, _: &str) -> Result<ModelVersion, StoreError> { unimplemented!() }
        async fn promote(&self, _: &str, _: u32, _: Stage, _: bool) -> Result<ModelVersion, StoreError> { unimplemented!() }
        async fn delete_version(&self, _: &str, _: u32) -> Result<(), StoreError> { unimplemented!() }
        async fn delete_model(&self, _: &str) -> Result<(), StoreError> { unimplemented!() }
        async fn list_experiments(&self) -> Result<Vec<Experiment>, StoreError> { Ok(vec![]) }
        async fn list_runs(&self, _: &str) -> Result<Vec<RunInfo>, StoreError> { Ok(vec![]) }
        async fn list_models(&self) -> Result<Vec<RegisteredModel>, StoreError> { Ok(vec![]) }
        async fn list_versions(&self, _: &str) -> Result<Vec<ModelVersion>, StoreError> { Ok(vec![]) }
    }

    fn run(id: &str) -> ModelSource { ModelSource::RunId(id.into()) }

    #[tokio::test]
    async fn empty_cache_is_not_ready() {
        let cache = cache_with(&[], Duration::ZERO);
        assert!(matches!(cache.get(), Err(CacheError::NotReady)));
        assert_eq!(cache.status().state, "empty");
    }

    #[tokio::test]
    async fn lifecycle_scenario() {
        let cache = cache_with(&["run-abc", "run-def"], Duration::ZERO);
        assert!(matches!(cache.get(), Err(CacheError::NotReady)));

        assert_eq!(cache.load(&run("run-abc")).await.unwrap().as_str(), "run-abc");
        assert_eq!(cache.get().unwrap().version.as_str(), "run-abc");

        assert!(matches!(cache.load(&run("missing")).await, Err(CacheError::Fetch(StoreError::NotFound(_)))));
        assert_eq!(cache.get().unwrap().version.as_str(), "run-abc");
        let status = cache.status();
        assert_eq!(status.state, "ready");
        assert!(status.last_error.is_some());

        cache.load(&run("run-def")).await.unwrap();
        assert_eq!(cache.get().unwrap().version.as_str(), "run-def");
        assert!(cache.status().last_error.is_none());
    }

    #[tokio::test]
    async fn first_failure_moves_to_failed_then_recovers() {
        let cache = cache_with(&["run-abc"], Duration::ZERO);
        assert!(cache.load(&run("nope")).await.is_err());
        assert!(matches!(*cache.state(), CacheState::Failed(_)));
        assert!(cache.load(&run("nope")).await.is_err());
        assert!(matches!(*cache.state(), CacheState::Failed(_)));
        cache.load(&run("run-abc")).await.unwrap();
        assert!(matches!(*cache.state(), CacheState::Ready(_)));
    }

    #[tokio::test]
    async fn timeout_is_a_fail_safe_fetch_failure() {
        let cache = cache_with(&["run-abc", "run-def"], Duration::from_millis(50));
        cache.load_with_timeout(&run("run-abc"), Duration::from_secs(2)).await.unwrap();
        let err = cache.load_with_timeout(&run("run-def"), Duration::from_millis(5)).await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));
        assert_eq!(cache.get().unwrap().version.as_str(), "run-abc");

        let fresh = cache_with(&["run-abc"], Duration::from_millis(50));
        assert!(fresh.load_with_timeout(&run("run-abc"), Duration::from_millis(5)).await.is_err());
        assert!(matches!(*fresh.state(), CacheState::Failed(_)));
    }

    #[tokio::test]
    async fn second_concurrent_load_is_rejected() {
        let cache = Arc::new(cache_with(&["run-a", "run-b"], Duration::from_millis(100)));
        let first = { let c = cache.clone(); tokio::spawn(async move { c.load(&run("run-a")).await }) };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(cache.load(&run("run-b")).await, Err(CacheError::LoadInProgress)));
        assert_eq!(first.await.unwrap().unwrap().as_str(), "run-a");
        assert_eq!(cache.get().unwrap().version.as_str(), "run-a");
    }

    #[tokio::test]
    async fn loading_is_visible_only_without_a_ready_model() {
        let cache = Arc::new(cache_with(&["run-a", "run-b"], Duration::from_millis(80)));
        let c = cache.clone();
        let pending = tokio::spawn(async move { c.load(&run("run-a")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.status().state, "loading");
        pending.await.unwrap().unwrap();

        let c = cache.clone();
        let pending = tokio::spawn(async move { c.load(&run("run-b")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get().unwrap().version.as_str(), "run-a");
        pending.await.unwrap().unwrap();
        assert_eq!(cache.get().unwrap().version.as_str(), "run-b");
    }

    #[tokio::test]
    async fn cancelled_first_load_restores_prior_state() {
        let cache = cache_with(&["run-a"], Duration::from_millis(200));
        let _ = tokio::time::timeout(Duration::from_millis(20), cache.load(&run("run-a"))).await;
        assert_eq!(cache.status().state, "empty");
        assert!(cache.load_gate.try_lock().is_ok());
    }

    #[tokio::test]
    async fn in_flight_reader_keeps_old_handle() {
        let cache = cache_with(&["run-a", "run-b"], Duration::ZERO);
        cache.load(&run("run-a")).await.unwrap();
        let captured = cache.get().unwrap();
        cache.load(&run("run-b")).await.unwrap();
        assert_eq!(captured.version.as_str(), "run-a");
        assert_eq!(captured.handle.classes().len(), 3);
        assert_eq!(cache.get().unwrap().version.as_str(), "run-b");
    }
}
