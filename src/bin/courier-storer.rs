// Store stage worker: uploads validated tarballs to long-term storage.

use bag_courier::pipeline::TOPIC_STORE;
use bag_courier::workers::{self, PipelineContext, StoreStage};
use bag_courier::{config, Result, VERSION};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(config::load_from_args(std::env::args().skip(1))?);
    config::init_logging(&config)?;
    info!("courier-storer {} starting as {}", VERSION, config.local_node);

    let ctx = PipelineContext::from_config(config)?;
    let stage = Arc::new(StoreStage::new(Arc::clone(&ctx)));
    workers::run_stage_worker(&ctx, stage, TOPIC_STORE).await
}
