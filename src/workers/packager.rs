//! Package assembly stage.
//!
//! Assembly itself (gathering deposited files into a bag tree) is an
//! external collaborator behind [`PackageAssembler`]; the stage wraps
//! it with disk reservation, digesting, work-item bookkeeping and the
//! bag-record skeleton the storer and recorder complete.

use super::PipelineContext;
use crate::error::{CourierError, Result};
use crate::items::WorkItemStatus;
use crate::pipeline::{Message, ResultEnvelope, Stage, StageOutcome, StageTag, TOPIC_STORE};
use crate::registry::models::{Bag, BagType};
use crate::staging::package_estimate;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// A freshly-built tarball in staging.
#[derive(Debug, Clone)]
pub struct AssembledPackage {
    pub tar_path: PathBuf,
    pub md5: String,
    pub sha256: String,
    pub size: u64,
}

#[async_trait]
pub trait PackageAssembler: Send + Sync {
    /// Materializes the package as `dest`, returning its digests.
    async fn assemble(&self, local_id: &str, uuid: Uuid, dest: &Path) -> Result<AssembledPackage>;
}

/// Tars a bag tree that the deposit layer already laid out under
/// `<source_root>/<uuid>/`, filling in any ambient tag files the
/// deposit left out from the node's default metadata.
pub struct DirectoryAssembler {
    source_root: PathBuf,
    metadata: crate::config::DefaultMetadata,
}

impl DirectoryAssembler {
    pub fn new(source_root: &Path, metadata: crate::config::DefaultMetadata) -> Self {
        Self {
            source_root: source_root.to_path_buf(),
            metadata,
        }
    }

    fn stamp_missing_tags(&self, source: &Path, local_id: &str, uuid: Uuid) -> Result<()> {
        let bagit = source.join("bagit.txt");
        if !bagit.is_file() {
            std::fs::write(
                &bagit,
                format!(
                    "BagIt-Version: {}\nTag-File-Character-Encoding: {}\n",
                    self.metadata.bagit_version, self.metadata.bagit_encoding
                ),
            )?;
        }
        let dpn_info = source.join("dpn-tags/dpn-info.txt");
        if !dpn_info.is_file() {
            std::fs::create_dir_all(source.join("dpn-tags"))?;
            std::fs::write(
                &dpn_info,
                format!(
                    "DPN-Object-ID: {uuid}\n\
                     Local-ID: {local_id}\n\
                     Ingest-Node-Name: {}\n\
                     Ingest-Node-Address: {}\n\
                     Ingest-Node-Contact-Name: {}\n\
                     Ingest-Node-Contact-Email: {}\n\
                     Version-Number: 1\n\
                     First-Version-Object-ID: {uuid}\n\
                     Rights-Object-ID:\n\
                     Bag-Type: data\n",
                    self.metadata.ingest_node_name,
                    self.metadata.ingest_node_address,
                    self.metadata.ingest_node_contact_name,
                    self.metadata.ingest_node_contact_email,
                ),
            )?;
        }
        Ok(())
    }
}

#[async_trait]
impl PackageAssembler for DirectoryAssembler {
    async fn assemble(
        &self,
        local_id: &str,
        uuid: Uuid,
        dest: &Path,
    ) -> Result<AssembledPackage> {
        let source = self.source_root.join(uuid.to_string());
        if !source.is_dir() {
            return Err(CourierError::NotFound(format!(
                "no deposited bag at {}",
                source.display()
            )));
        }
        self.stamp_missing_tags(&source, local_id, uuid)?;
        let dest = dest.to_path_buf();
        let tar_path = dest.clone();
        let name = uuid.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::create(&dest)?;
            let mut builder = tar::Builder::new(file);
            builder.append_dir_all(&name, &source)?;
            builder.finish()?;
            Ok(())
        })
        .await
        .map_err(|e| CourierError::Logic(format!("assembler task: {}", e)))??;

        let digests = {
            let tar_path = tar_path.clone();
            tokio::task::spawn_blocking(move || crate::bag::digest_file(&tar_path))
                .await
                .map_err(|e| CourierError::Logic(format!("digest task: {}", e)))??
        };
        Ok(AssembledPackage {
            tar_path,
            md5: digests.md5,
            sha256: digests.sha256,
            size: digests.size,
        })
    }
}

pub struct PackageStage {
    ctx: Arc<PipelineContext>,
    assembler: Arc<dyn PackageAssembler>,
}

impl PackageStage {
    pub fn new(ctx: Arc<PipelineContext>, assembler: Arc<dyn PackageAssembler>) -> Self {
        Self { ctx, assembler }
    }
}

#[async_trait]
impl Stage for PackageStage {
    fn name(&self) -> &'static str {
        "package"
    }

    async fn process(
        &self,
        envelope: &mut ResultEnvelope,
        message: &Message,
    ) -> Result<StageOutcome> {
        let work_item_id = envelope
            .work_item_id
            .clone()
            .ok_or_else(|| CourierError::Logic("package stage needs a work item".into()))?;
        let item = self.ctx.items.get(&work_item_id).await?;
        self.ctx
            .items
            .mark(
                &work_item_id,
                StageTag::Package,
                WorkItemStatus::Started,
                "assembling package",
            )
            .await?;

        // The deposit front-end fills in the expected payload size; a
        // build needs roughly twice that while tarring.
        let _reservation = match envelope.size {
            Some(expected) if expected > 0 => {
                Some(self.ctx.staging.reserve(package_estimate(expected))?)
            }
            _ => None,
        };

        let dest = self.ctx.staging.tar_path(envelope.uuid);
        message.touch();
        let assembled = self
            .assembler
            .assemble(&item.local_id, envelope.uuid, &dest)
            .await?;
        message.touch();

        envelope.package_result.tar_path = Some(assembled.tar_path.clone());
        envelope.package_result.md5 = Some(assembled.md5.clone());
        envelope.package_result.sha256 = Some(assembled.sha256.clone());
        envelope.package_result.size = Some(assembled.size);
        envelope.local_path = Some(assembled.tar_path);
        envelope.md5 = Some(assembled.md5);
        envelope.size = Some(assembled.size);

        if envelope.bag.is_none() {
            let now = Utc::now();
            envelope.bag = Some(Bag {
                uuid: envelope.uuid,
                local_id: item.local_id.clone(),
                size: assembled.size,
                first_version_uuid: envelope.uuid,
                version: 1,
                ingest_node: self.ctx.config.local_node.clone(),
                admin_node: self.ctx.config.local_node.clone(),
                bag_type: BagType::Data,
                rights: vec![],
                interpretive: vec![],
                replicating_nodes: vec![],
                fixities: BTreeMap::from([("sha256".to_string(), assembled.sha256)]),
                member: None,
                created_at: now,
                updated_at: now,
            });
        }

        envelope.stage = StageTag::Store;
        Ok(StageOutcome::Advance(TOPIC_STORE))
    }
}
