// Staging cleanup: one sweep, then exit. External scheduling (cron)
// decides the cadence.

use bag_courier::cleanup::StagingCleanup;
use bag_courier::workers::PipelineContext;
use bag_courier::{config, Result, VERSION};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(config::load_from_args(std::env::args().skip(1))?);
    config::init_logging(&config)?;
    info!(
        "courier-cleanup {} starting as {}",
        VERSION, config.local_node
    );

    let ctx = PipelineContext::from_config(Arc::clone(&config))?;
    let cleanup = StagingCleanup::new(Arc::clone(&config), Arc::clone(&ctx.local));
    let report = cleanup.run().await?;
    info!(
        "cleanup finished: {} removed, {} retained, {} ignored, {} failed",
        report.removed, report.retained, report.ignored, report.failed
    );
    Ok(())
}
