//! File-backed tracking directory (`file:./mlruns` style) holding experiments, runs,
//! model artifacts and the model registry.

use super::{Experiment, ModelReference, ModelStore, ModelVersion, RegisteredModel, RunInfo, RunStatus, Stage, StoreError, VersionId};
use crate::engine::{LogisticRegression, ModelHandle, N_FEATURES};
use async_trait::async_trait;
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serve_core::{now_ms, retry_async_when, RetryConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

const ARTIFACT_FILE: &str = "model.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ModelArtifact {
    LogisticRegression(LogisticRegression),
}

#[derive(Debug, Serialize, Deserialize)]
struct RegisteredMeta { name: String, created_at: i64 }

#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
    retry: RetryConfig,
    // registry read-modify-write sequences
    registry_lock: Mutex<()>,
}

impl LocalStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(root.join("experiments"))?;
        std::fs::create_dir_all(root.join("registry"))?;
        Ok(Self { root, retry: RetryConfig::default(), registry_lock: Mutex::new(()) })
    }

    /// Accepts `file:<path>`, `file://<path>` or a bare path.
    pub fn from_tracking_uri(uri: &str) -> Result<Self, StoreError> {
        let path = if let Some(rest) = uri.strip_prefix("file://") { rest }
            else if let Some(rest) = uri.strip_prefix("file:") { rest }
            else if uri.contains("://") { return Err(StoreError::UnsupportedUri(uri.to_string())); }
            else { uri };
        Self::open(path)
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self { self.retry = retry; self }
    pub fn root(&self) -> &Path { &self.root }

    fn experiments_dir(&self) -> PathBuf { self.root.join("experiments") }
    fn experiment_dir(&self, experiment: &str) -> PathBuf { self.experiments_dir().join(experiment) }
    fn run_dir(&self, experiment: &str, run_id: &str) -> PathBuf { self.experiment_dir(experiment).join("runs").join(run_id) }
    fn artifact_path(run_dir: &Path) -> PathBuf { run_dir.join("artifacts").join("model").join(ARTIFACT_FILE) }
    fn registry_dir(&self, name: &str) -> PathBuf { self.root.join("registry").join(name) }
    fn version_path(&self, name: &str, version: u32) -> PathBuf { self.registry_dir(name).join("versions").join(format!("{version}.json")) }

    /// Record a finished training run together with its model artifact.
    pub async fn log_run(
        &self,
        experiment: &str,
        run_name: &str,
        params: BTreeMap<String, String>,
        metrics: BTreeMap<String, f64>,
        model: &LogisticRegression,
        start_time: i64,
    ) -> Result<RunInfo, StoreError> {
        check_name(experiment)?;
        let exp_meta = self.experiment_dir(experiment).join("meta.json");
        if !exists(&exp_meta).await {
            write_json(&exp_meta, &Experiment { name: experiment.to_string(), created_at: now_ms() }).await?;
        }
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.run_dir(experiment, &run_id);
        write_json(&Self::artifact_path(&dir), &ModelArtifact::LogisticRegression(model.clone())).await?;
        let run = RunInfo {
            run_id, run_name: run_name.to_string(), experiment: experiment.to_string(),
            status: RunStatus::Finished, start_time, end_time: Some(now_ms()), params, metrics,
        };
        write_json(&dir.join("meta.json"), &run).await?;
        info!(run_id = %run.run_id, experiment, run_name, "run logged");
        Ok(run)
    }

    async fn find_run(&self, run_id: &str) -> Result<(RunInfo, PathBuf), StoreError> {
        check_name(run_id)?;
        for exp in self.list_experiments().await? {
            let dir = self.run_dir(&exp.name, run_id);
            if exists(&dir.join("meta.json")).await {
                let run: RunInfo = read_json(&dir.join("meta.json")).await?;
                return Ok((run, dir));
            }
        }
        Err(StoreError::NotFound(format!("run '{run_id}'")))
    }

    async fn run_reference(&self, run: &RunInfo, dir: &Path, version: VersionId) -> Result<ModelReference, StoreError> {
        let artifact = Self::artifact_path(dir);
        if !exists(&artifact).await {
            return Err(StoreError::NotFound(format!("run '{}' has no model artifact", run.run_id)));
        }
        Ok(ModelReference { version, run_id: run.run_id.clone(), artifact_uri: artifact.to_string_lossy().into_owned() })
    }

    async fn read_version(&self, name: &str, version: u32) -> Result<ModelVersion, StoreError> {
        check_name(name)?;
        read_json(&self.version_path(name, version)).await.map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::NotFound(format!("model '{name}' version {version}")),
            other => other,
        })
    }
}

#[async_trait]
impl ModelStore for LocalStore {
    async fn resolve_latest(&self, experiment: &str, run_name_pattern: &str) -> Result<ModelReference, StoreError> {
        let pattern = Regex::new(run_name_pattern)?;
        let candidates: Vec<RunInfo> = self.list_runs(experiment).await?
            .into_iter()
            .filter(|r| r.status == RunStatus::Finished && pattern.is_match(&r.run_name))
            .collect();
        // list_runs is newest first
        for run in candidates {
            let dir = self.run_dir(experiment, &run.run_id);
            if exists(&Self::artifact_path(&dir)).await {
                debug!(run_id = %run.run_id, experiment, "resolved latest run");
                return self.run_reference(&run, &dir, VersionId::run(&run.run_id)).await;
            }
        }
        Err(StoreError::NotFound(format!("no finished run matching /{run_name_pattern}/ in experiment '{experiment}'")))
    }

    async fn resolve_by_run_id(&self, run_id: &str) -> Result<ModelReference, StoreError> {
        let (run, dir) = self.find_run(run_id).await?;
        self.run_reference(&run, &dir, VersionId::run(run_id)).await
    }

    async fn resolve_by_registry(&self, name: &str, stage: Stage) -> Result<ModelReference, StoreError> {
        let mv = self.list_versions(name).await?
            .into_iter()
            .filter(|v| v.stage == stage)
            .max_by_key(|v| v.version)
            .ok_or_else(|| StoreError::NotFound(format!("model '{name}' has no version in stage {stage}")))?;
        let (run, dir) = self.find_run(&mv.run_id).await?;
        self.run_reference(&run, &dir, VersionId::registry(name, mv.version)).await
    }

    async fn fetch(&self, reference: &ModelReference) -> Result<ModelHandle, StoreError> {
        let path = PathBuf::from(&reference.artifact_uri);
        let artifact: ModelArtifact = retry_async_when(&self.retry, StoreError::is_transient, |_| read_json(&path)).await?;
        let ModelArtifact::LogisticRegression(model) = artifact;
        validate(&model)?;
        debug!(version = %reference.version, classes = model.classes.len(), "artifact fetched");
        Ok(model.into_handle())
    }

    async fn register(&self, run_id: &str, model_name: &str) -> Result<ModelVersion, StoreError> {
        check_name(model_name)?;
        let (run, dir) = self.find_run(run_id).await?;
        self.run_reference(&run, &dir, VersionId::run(run_id)).await?;
        let _guard = self.registry_lock.lock().await;
        let meta_path = self.registry_dir(model_name).join("meta.json");
        if !exists(&meta_path).await {
            write_json(&meta_path, &RegisteredMeta { name: model_name.to_string(), created_at: now_ms() }).await?;
        }
        let next = self.list_versions(model_name).await?.last().map(|v| v.version + 1).unwrap_or(1);
        let mv = ModelVersion { name: model_name.to_string(), version: next, stage: Stage::None, run_id: run_id.to_string(), created_at: now_ms() };
        write_json(&self.version_path(model_name, next), &mv).await?;
        info!(model = model_name, version = next, run_id, "model version registered");
        Ok(mv)
    }

    async fn promote(&self, name: &str, version: u32, stage: Stage, archive_existing: bool) -> Result<ModelVersion, StoreError> {
        let _guard = self.registry_lock.lock().await;
        let mut mv = self.read_version(name, version).await?;
        if archive_existing && matches!(stage, Stage::Staging | Stage::Production) {
            for mut other in self.list_versions(name).await? {
                if other.version != version && other.stage == stage {
                    other.stage = Stage::Archived;
                    write_json(&self.version_path(name, other.version), &other).await?;
                    info!(model = name, version = other.version, "archived previous {stage} version");
                }
            }
        }
        mv.stage = stage;
        write_json(&self.version_path(name, version), &mv).await?;
        info!(model = name, version, %stage, "model version stage changed");
        Ok(mv)
    }

    async fn delete_version(&self, name: &str, version: u32) -> Result<(), StoreError> {
        let _guard = self.registry_lock.lock().await;
        self.read_version(name, version).await?;
        tokio::fs::remove_file(self.version_path(name, version)).await?;
        info!(model = name, version, "model version deleted");
        Ok(())
    }

    async fn delete_model(&self, name: &str) -> Result<(), StoreError> {
        check_name(name)?;
        let _guard = self.registry_lock.lock().await;
        let dir = self.registry_dir(name);
        if !exists(&dir).await { return Err(StoreError::NotFound(format!("model '{name}'"))); }
        tokio::fs::remove_dir_all(dir).await?;
        info!(model = name, "registered model deleted");
        Ok(())
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>, StoreError> {
        let mut out = Vec::new();
        for dir in subdirs(&self.experiments_dir()).await? {
            let meta = dir.join("meta.json");
            if exists(&meta).await { out.push(read_json::<Experiment>(&meta).await?); }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn list_runs(&self, experiment: &str) -> Result<Vec<RunInfo>, StoreError> {
        check_name(experiment)?;
        let exp_dir = self.experiment_dir(experiment);
        if !exists(&exp_dir.join("meta.json")).await { return Err(StoreError::NotFound(format!("experiment '{experiment}'"))); }
        let mut runs = Vec::new();
        for dir in subdirs(&exp_dir.join("runs")).await? {
            let meta = dir.join("meta.json");
            if exists(&meta).await { runs.push(read_json::<RunInfo>(&meta).await?); }
        }
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(runs)
    }

    async fn list_models(&self) -> Result<Vec<RegisteredModel>, StoreError> {
        let mut out = Vec::new();
        for dir in subdirs(&self.root.join("registry")).await? {
            let meta_path = dir.join("meta.json");
            if !exists(&meta_path).await { continue; }
            let meta: RegisteredMeta = read_json(&meta_path).await?;
            let latest_version = self.list_versions(&meta.name).await?.last().map(|v| v.version);
            out.push(RegisteredModel { name: meta.name, created_at: meta.created_at, latest_version });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<ModelVersion>, StoreError> {
        check_name(name)?;
        let dir = self.registry_dir(name);
        if !exists(&dir.join("meta.json")).await { return Err(StoreError::NotFound(format!("model '{name}'"))); }
        let mut versions = Vec::new();
        let versions_dir = dir.join("versions");
        if exists(&versions_dir).await {
            let mut rd = tokio::fs::read_dir(&versions_dir).await?;
            while let Some(entry) = rd.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    versions.push(read_json::<ModelVersion>(&path).await?);
                }
            }
        }
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }
}

fn validate(model: &LogisticRegression) -> Result<(), StoreError> {
    let k = model.classes.len();
    if k == 0 { return Err(StoreError::Invalid("empty class list".into())); }
    if model.feature_names.len() != N_FEATURES {
        return Err(StoreError::Invalid(format!("expected {N_FEATURES} features, artifact declares {}", model.feature_names.len())));
    }
    if model.coef.len() != k || model.intercept.len() != k {
        return Err(StoreError::Invalid(format!("{k} classes but {} coefficient rows and {} intercepts", model.coef.len(), model.intercept.len())));
    }
    if model.coef.iter().any(|row| row.len() != N_FEATURES) {
        return Err(StoreError::Invalid("coefficient row width does not match feature count".into()));
    }
    if model.coef.iter().flatten().chain(&model.intercept).any(|v| !v.is_finite()) {
        return Err(StoreError::Invalid("non-finite parameter".into()));
    }
    Ok(())
}

fn check_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name == "." || name.contains("..") || name.contains(['/', '\\']) {
        return Err(StoreError::Registry(format!("invalid name '{name}'")));
    }
    Ok(())
}

async fn exists(path: &Path) -> bool { tokio::fs::metadata(path).await.is_ok() }

async fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut out = Vec::new();
    if !exists(dir).await { return Ok(out); }
    let mut rd = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.file_type().await?.is_dir() { out.push(entry.path()); }
    }
    Ok(out)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::NotFound(path.display().to_string()),
        _ => StoreError::Io(e),
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

// Write-then-rename so readers never observe a half-written record.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() { tokio::fs::create_dir_all(parent).await?; }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
