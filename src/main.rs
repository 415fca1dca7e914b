use anyhow::Result;
use cluster_forecast::{config, pipeline, repo, telemetry};
use config::Config;
use pipeline::{Inputs, Pipeline};
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    let store = repo::open(&cfg.outputs);
    let inputs = Inputs::load(&cfg.inputs)?;

    let pipeline = Pipeline::new(cfg.clone(), store)?;
    let target = pipeline.target_date();
    info!(%target, timezone = %cfg.clock.timezone, "starting cluster forecast run");

    let report = pipeline
        .run_until(inputs, target, telemetry::shutdown_signal())
        .await?;
    let written = report.write(&cfg.outputs)?;
    for path in &written {
        info!(path = %path.display(), "output written");
    }

    if report.is_fatal() {
        anyhow::bail!(
            "no cluster produced a forecast for {target} ({} failed, {} skipped)",
            report.summary.failed,
            report.summary.skipped
        );
    }
    if report.summary.failed > 0 || report.summary.skipped > 0 {
        warn!(
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            "run finished with per-cluster failures"
        );
    }
    info!(forecasted = report.summary.forecasted, "run complete");
    Ok(())
}
