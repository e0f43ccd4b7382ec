use crate::store::{ModelSource, Stage};
use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::time::Duration;

pub const SERVICE: &str = "inference-gateway";
pub const ENV_PREFIX: &str = "GATEWAY";

const DEFAULTS: &[(&str, &str)] = &[
    ("bind_addr", "0.0.0.0:8000"),
    ("tracking_uri", "file:./mlruns"),
    ("experiment_name", "Default"),
    ("run_name_pattern", "^logreg_demo$"),
    ("fetch_timeout_ms", "30000"),
    ("fetch_retries", "0"),
    ("autoload", "none"),
];

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub service_name: String,
    pub bind_addr: String,
    pub tracking_uri: String,
    pub experiment_name: String,
    pub run_name_pattern: String,
    pub fetch_timeout_ms: u64,
    pub fetch_retries: usize,
    /// `none` | `latest` | `run:<run_id>` | `registry:<name>:<stage>`
    pub autoload: String,
}

impl GatewayConfig {
    /// Read once at startup: defaults, config file, `GATEWAY__*`, then the tracking
    /// environment (`MLFLOW_TRACKING_URI`, `MLFLOW_EXPERIMENT_NAME`, `PORT`).
    pub fn load() -> Result<Self> {
        let mut cfg: Self = serve_core::load_config(SERVICE, ENV_PREFIX, DEFAULTS)?;
        cfg.apply_env_overrides(|k| std::env::var(k).ok());
        Ok(cfg)
    }

    /// `GATEWAY__*` settings win over the tracking variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let explicit = |key: &str| lookup(&format!("{ENV_PREFIX}__{}", key.to_ascii_uppercase())).is_some();
        if let (Some(uri), false) = (lookup("MLFLOW_TRACKING_URI"), explicit("tracking_uri")) { self.tracking_uri = uri; }
        if let (Some(name), false) = (lookup("MLFLOW_EXPERIMENT_NAME"), explicit("experiment_name")) { self.experiment_name = name; }
        if let (Some(port), false) = (lookup("PORT"), explicit("bind_addr")) {
            if let Ok(port) = port.parse::<u16>() { self.bind_addr = format!("0.0.0.0:{port}"); }
        }
    }

    pub fn fetch_timeout(&self) -> Duration { Duration::from_millis(self.fetch_timeout_ms) }

    pub fn latest_source(&self) -> ModelSource {
        ModelSource::Latest { experiment: self.experiment_name.clone(), run_name_pattern: self.run_name_pattern.clone() }
    }

    pub fn autoload_source(&self) -> Result<Option<ModelSource>> {
        let value = self.autoload.trim();
        match value.split(':').collect::<Vec<_>>().as_slice() {
            [] | [""] | ["none"] => Ok(None),
            ["latest"] => Ok(Some(self.latest_source())),
            ["run", id] if !id.is_empty() => Ok(Some(ModelSource::RunId(id.to_string()))),
            ["registry", name, stage] if !name.is_empty() => Ok(Some(ModelSource::Registry { name: name.to_string(), stage: stage.parse::<Stage>()? })),
            _ => Err(anyhow!("invalid autoload '{value}' (expected none | latest | run:<id> | registry:<name>:<stage>)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> GatewayConfig {
        GatewayConfig {
            service_name: SERVICE.into(), bind_addr: "0.0.0.0:8000".into(), tracking_uri: "file:./mlruns".into(),
            experiment_name: "Default".into(), run_name_pattern: "^logreg_demo$".into(), fetch_timeout_ms: 30_000,
            fetch_retries: 0, autoload: "none".into(),
        }
    }

    #[test]
    fn autoload_forms() {
        let mut cfg = base();
        assert_eq!(cfg.autoload_source().unwrap(), None);
        cfg.autoload = "latest".into();
        assert!(matches!(cfg.autoload_source().unwrap(), Some(ModelSource::Latest { .. })));
        cfg.autoload = "run:abc123".into();
        assert_eq!(cfg.autoload_source().unwrap(), Some(ModelSource::RunId("abc123".into())));
        cfg.autoload = "registry:iris:Production".into();
        assert_eq!(cfg.autoload_source().unwrap(), Some(ModelSource::Registry { name: "iris".into(), stage: Stage::Production }));
        cfg.autoload = "registry:iris".into();
        assert!(cfg.autoload_source().is_err());
    }

    #[test]
    fn tracking_env_fills_gaps_only() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MLFLOW_TRACKING_URI", "file:/data/mlruns"),
            ("MLFLOW_EXPERIMENT_NAME", "iris"),
            ("GATEWAY__EXPERIMENT_NAME", "pinned"),
            ("PORT", "9000"),
        ]);
        let mut cfg = base();
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.tracking_uri, "file:/data/mlruns");
        assert_eq!(cfg.experiment_name, "Default");
        assert_eq!(cfg.bind_addr, "0.0.0.0:9000");
    }
}
