//! Core shared utilities for model-serving services.

use anyhow::Result;
use axum::{http::{header, StatusCode}, response::IntoResponse, routing::get, Router};
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }
pub fn is_live() -> bool { NODE_LIVENESS.load(Ordering::SeqCst) }

/// Install the global tracing subscriber once per process.
///
/// `RUST_LOG` drives the filter (default `info`); `GATEWAY_JSON_LOG=1|true` switches to
/// flattened JSON lines for log shippers.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("GATEWAY_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if json {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .boxed()
        };
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry().with(fmt_layer).with(env_filter).try_init()?;
        Ok(())
    })?;
    info!(target: "serve_core", service, "tracing initialized");
    Ok(())
}

/// Liveness, readiness and Prometheus exposition routes, meant to be merged into a
/// service router.
pub fn health_router() -> Router {
    Router::new()
        .route("/live", get(|| async {
            let live = is_live();
            let status = if live { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
            (status, axum::Json(serde_json::json!({"live": live})))
        }))
        .route("/ready", get(|| async {
            let ready = is_ready();
            let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
            (status, axum::Json(serde_json::json!({"ready": ready})))
        }))
        .route("/metrics", get(metrics_handler))
}

async fn metrics_handler() -> axum::response::Response {
    match metrics::encode_text() {
        Ok(buf) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response(),
    }
}

/// Layered configuration: caller defaults, then the optional file named by
/// `<PREFIX>_CONFIG_FILE`, then `<PREFIX>__*` environment variables.
pub fn load_config<T: DeserializeOwned>(service: &str, env_prefix: &str, defaults: &[(&str, &str)]) -> Result<T> {
    let mut builder = config::Config::builder().set_default("service_name", service)?;
    for (key, value) in defaults { builder = builder.set_default(*key, *value)?; }
    if let Ok(file) = std::env::var(format!("{env_prefix}_CONFIG_FILE")) {
        info!(target: "serve_core", %file, "adding config file source");
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix(env_prefix).separator("__").try_parsing(true));
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 { chrono::Utc::now().timestamp_millis() }

mod resilience;
pub use resilience::{retry_async_when, RetryConfig};
pub mod metrics;
pub use metrics::{GatewayMetrics, GATEWAY_METRICS};
