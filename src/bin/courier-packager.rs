// Package stage worker: assembles deposited bags into staged tarballs.

use bag_courier::pipeline::TOPIC_PACKAGE;
use bag_courier::workers::{self, DirectoryAssembler, PackageStage, PipelineContext};
use bag_courier::{config, Result, VERSION};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(config::load_from_args(std::env::args().skip(1))?);
    config::init_logging(&config)?;
    info!(
        "courier-packager {} starting as {}",
        VERSION, config.local_node
    );

    let ctx = PipelineContext::from_config(Arc::clone(&config))?;
    let assembler = Arc::new(DirectoryAssembler::new(
        &config.deposit_dir,
        config.default_metadata.clone(),
    ));
    let stage = Arc::new(PackageStage::new(Arc::clone(&ctx), assembler));
    workers::run_stage_worker(&ctx, stage, TOPIC_PACKAGE).await
}
