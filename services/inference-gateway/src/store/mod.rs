//! Model store client: the cache's only window onto the tracking server and registry.
//!
//! Resolution has three explicit modes (latest run by name pattern, explicit run id,
//! registry name + stage). Callers pick one; nothing guesses paths.

use crate::engine::ModelHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod local;
pub use local::LocalStore;

/// Provenance of a loaded model: a run id, or `name@version` for registry loads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    pub fn run(run_id: &str) -> Self { Self(run_id.to_string()) }
    pub fn registry(name: &str, version: u32) -> Self { Self(format!("{name}@{version}")) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for VersionId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Stage {
    #[default]
    None,
    Staging,
    Production,
    Archived,
}

impl FromStr for Stage {
    type Err = StoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            "archived" => Ok(Self::Archived),
            other => Err(StoreError::Registry(format!("unknown stage '{other}' (expected None|Staging|Production|Archived)"))),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "None",
            Self::Staging => "Staging",
            Self::Production => "Production",
            Self::Archived => "Archived",
        })
    }
}

/// How an operator asks for a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Latest { experiment: String, run_name_pattern: String },
    RunId(String),
    Registry { name: String, stage: Stage },
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest { experiment, run_name_pattern } => write!(f, "latest({experiment}, /{run_name_pattern}/)"),
            Self::RunId(id) => write!(f, "run:{id}"),
            Self::Registry { name, stage } => write!(f, "registry:{name}:{stage}"),
        }
    }
}

/// A resolved, fetchable artifact location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReference {
    pub version: VersionId,
    pub run_id: String,
    pub artifact_uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus { Running, Finished, Failed }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment { pub name: String, pub created_at: i64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub run_name: String,
    pub experiment: String,
    pub status: RunStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredModel { pub name: String, pub created_at: i64, pub latest_version: Option<u32> }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: u32,
    pub stage: Stage,
    pub run_id: String,
    pub created_at: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")] NotFound(String),
    #[error("fetch failed: {0}")] Fetch(String),
    #[error("invalid model artifact: {0}")] Invalid(String),
    #[error("registry rejected request: {0}")] Registry(String),
    #[error("unsupported tracking uri: {0}")] UnsupportedUri(String),
    #[error("invalid run name pattern: {0}")] Pattern(#[from] regex::Error),
    #[error("io error: {0}")] Io(#[from] std::io::Error),
    #[error("serde error: {0}")] Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Worth another attempt: the store may answer differently in a moment.
    pub fn is_transient(&self) -> bool { matches!(self, Self::Fetch(_) | Self::Io(_)) }
}

#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn resolve_latest(&self, experiment: &str, run_name_pattern: &str) -> Result<ModelReference, StoreError>;
    async fn resolve_by_run_id(&self, run_id: &str) -> Result<ModelReference, StoreError>;
    async fn resolve_by_registry(&self, name: &str, stage: Stage) -> Result<ModelReference, StoreError>;
    async fn fetch(&self, reference: &ModelReference) -> Result<ModelHandle, StoreError>;

    async fn register(&self, run_id: &str, model_name: &str) -> Result<ModelVersion, StoreError>;
    async fn promote(&self, name: &str, version: u32, stage: Stage, archive_existing: bool) -> Result<ModelVersion, StoreError>;
    async fn delete_version(&self, name: &str, version: u32) -> Result<(), StoreError>;
    async fn delete_model(&self, name: &str) -> Result<(), StoreError>;

    async fn list_experiments(&self) -> Result<Vec<Experiment>, StoreError>;
    async fn list_runs(&self, experiment: &str) -> Result<Vec<RunInfo>, StoreError>;
    async fn list_models(&self) -> Result<Vec<RegisteredModel>, StoreError>;
    async fn list_versions(&self, name: &str) -> Result<Vec<ModelVersion>, StoreError>;

    async fn resolve(&self, source: &ModelSource) -> Result<ModelReference, StoreError> {
        match source {
            ModelSource::Latest { experiment, run_name_pattern } => self.resolve_latest(experiment, run_name_pattern).await,
            ModelSource::RunId(id) => self.resolve_by_run_id(id).await,
            ModelSource::Registry { name, stage } => self.resolve_by_registry(name, *stage).await,
        }
    }
}
