use anyhow::Result;
use clap::{Parser, Subcommand};
use inference_gateway::api::{self, AppState};
use inference_gateway::train::{self, TrainParams};
use inference_gateway::{GatewayConfig, LocalStore, ModelCache, ModelStore};
use serve_core::{init_tracing, RetryConfig};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "inference-gateway", about = "Model serving gateway with hot-swappable models")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve predictions over HTTP (default).
    Serve,
    /// Train the logistic regression demo and log it as a run.
    TrainDemo {
        #[arg(long, default_value_t = 1.0)]
        c: f64,
        #[arg(long, default_value_t = 200)]
        max_iter: usize,
    },
    /// Train, log, and optionally register the result under a model name.
    RunPipeline {
        #[arg(long)]
        model_name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(inference_gateway::config::SERVICE)?;
    let cli = Cli::parse();
    let cfg = GatewayConfig::load()?;
    info!(?cfg, "config loaded");
    let store = LocalStore::from_tracking_uri(&cfg.tracking_uri)?.with_retry(RetryConfig::with_retries(cfg.fetch_retries));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cfg, store).await,
        Command::TrainDemo { c, max_iter } => {
            let (run, metrics) = train::train_and_log(&store, &cfg.experiment_name, TrainParams { c, max_iter, ..Default::default() }).await?;
            println!("{}", serde_json::json!({"run_id": run.run_id, "metrics": metrics}));
            Ok(())
        }
        Command::RunPipeline { model_name } => {
            let (run, metrics) = train::train_and_log(&store, &cfg.experiment_name, TrainParams::default()).await?;
            let registered = match model_name {
                Some(name) => Some(store.register(&run.run_id, &name).await?),
                None => None,
            };
            println!("{}", serde_json::json!({"run_id": run.run_id, "metrics": metrics, "registered": registered}));
            Ok(())
        }
    }
}

async fn serve(cfg: GatewayConfig, store: LocalStore) -> Result<()> {
    let autoload = cfg.autoload_source()?;
    let cache = Arc::new(ModelCache::new(Arc::new(store), cfg.fetch_timeout()));
    if let Some(source) = autoload {
        // startup load is fail-safe: the gateway still comes up empty
        if let Err(e) = cache.load(&source).await { warn!(%source, error = %e, "autoload failed; serving without a model"); }
    }
    api::serve(&cfg.bind_addr, AppState::new(cache)).await?;
    info!("shutdown");
    Ok(())
}
