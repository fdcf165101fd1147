// Record stage worker: registry records, receipts, replication fan-out.

use bag_courier::pipeline::TOPIC_RECORD;
use bag_courier::workers::{self, PipelineContext, RecordStage};
use bag_courier::{config, Result, VERSION};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(config::load_from_args(std::env::args().skip(1))?);
    config::init_logging(&config)?;
    info!(
        "courier-recorder {} starting as {}",
        VERSION, config.local_node
    );

    let ctx = PipelineContext::from_config(config)?;
    let stage = Arc::new(RecordStage::new(Arc::clone(&ctx)));
    workers::run_stage_worker(&ctx, stage, TOPIC_RECORD).await
}
