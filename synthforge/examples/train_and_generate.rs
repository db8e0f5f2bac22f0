//! Train a model, generate synthetic rows and evaluate them.
//!
//! Runs the real engine scripts, so it needs an interpreter with the
//! training stack installed and a dataset under the storage root:
//!
//! ```text
//! SYNTHFORGE_ENGINE_DIR=./engine SYNTHFORGE_STORAGE=./storage \
//!     RUST_LOG=synthforge=debug \
//!     cargo run --example train_and_generate -- datasets/customers.csv
//! ```

use std::time::Duration;

use serde_json::json;
use synthforge::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("synthforge=info")),
        )
        .init();

    let dataset_file = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "datasets/sample.csv".to_string());

    let config = EngineConfig::from_env();
    info!(?config, "starting engine");
    let engine = StandardEngineBuilder::new(config).build()?;

    let dataset = DatasetRef::new(ProjectId::new(), "demo", &dataset_file);

    match engine.dataset_stats(&dataset).await {
        Ok(stats) => info!(%stats, "dataset statistics"),
        Err(err) => error!(error = %err, "could not compute statistics"),
    }

    let mut events = engine.subscribe();
    let model_id = engine
        .submit_training(
            dataset.clone(),
            "CTGAN",
            json!({"epochs": 10, "batchSize": 100, "generatorDim": [128, 128]}),
        )
        .await?;
    info!(%model_id, "training submitted");

    loop {
        let event = tokio::time::timeout(Duration::from_secs(3600), events.recv()).await??;
        if event.model_id() != model_id {
            continue;
        }
        info!(payload = ?event.payload, "model event");
        if engine.model_status(model_id).await?.status.is_terminal() {
            break;
        }
    }

    let view = engine.model_status(model_id).await?;
    if view.status != ModelStatus::Completed {
        error!(failure = ?view.failure, "training did not complete");
        engine.shutdown().await;
        return Ok(());
    }

    let output = std::env::temp_dir().join(format!("synthetic_{model_id}.csv"));
    let anomalies = AnomalySpec::new([AnomalyRule::null("email").with_ratio(0.02)]);
    let generated = engine
        .generate(model_id, 1_000, &output, Some(&anomalies))
        .await?;
    info!(path = %generated.output_path.display(), rows = generated.requested, "generated");

    let report = engine.evaluate(model_id, 1_000).await?;
    info!(%report, "evaluation");

    engine.shutdown().await;
    Ok(())
}
