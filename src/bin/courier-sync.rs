// Registry synchronizer: one incremental pull from every peer, then
// exit. External scheduling (cron) decides the cadence.

use bag_courier::sync::RegistrySynchronizer;
use bag_courier::workers::PipelineContext;
use bag_courier::{config, Result, VERSION};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(config::load_from_args(std::env::args().skip(1))?);
    config::init_logging(&config)?;
    info!("courier-sync {} starting as {}", VERSION, config.local_node);

    let ctx = PipelineContext::from_config(Arc::clone(&config))?;
    let synchronizer = RegistrySynchronizer::new(
        Arc::clone(&ctx.local),
        Arc::clone(&ctx.remotes),
        &config.local_node,
    );
    let report = synchronizer.sync_all().await?;
    info!(
        "sync finished: {} peers ok, {} failed, {} bags, {} replications, {} restores",
        report.peers_synced,
        report.peers_failed,
        report.counts.bags,
        report.counts.replications,
        report.counts.restores
    );
    Ok(())
}
