// Validate stage worker: structural and fixity checks.

use bag_courier::pipeline::TOPIC_VALIDATE;
use bag_courier::workers::{self, PipelineContext, ValidateStage};
use bag_courier::{config, Result, VERSION};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(config::load_from_args(std::env::args().skip(1))?);
    config::init_logging(&config)?;
    info!(
        "courier-validator {} starting as {}",
        VERSION, config.local_node
    );

    let ctx = PipelineContext::from_config(config)?;
    let stage = Arc::new(ValidateStage::new(Arc::clone(&ctx)));
    workers::run_stage_worker(&ctx, stage, TOPIC_VALIDATE).await
}
