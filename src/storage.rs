//! Long-term object storage, as consumed by the storer stage.
//!
//! The production backend is an object-store gateway; the trait carries
//! exactly what the pipeline needs (keyed PUT with checksum header and
//! tags). The filesystem implementation backs tests and single-node
//! deployments, keeping headers in a metadata sidecar.

use crate::error::{CourierError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `file` under `key`, returning the resulting object URL.
    async fn put(
        &self,
        key: &str,
        file: &Path,
        content_type: &str,
        content_md5: &str,
        tags: &[(String, String)],
    ) -> Result<String>;

    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectMeta {
    content_type: String,
    content_md5: String,
    tags: Vec<(String, String)>,
}

pub struct FsObjectStore {
    root: PathBuf,
    bucket: String,
}

impl FsObjectStore {
    pub fn new(root: &Path, bucket: &str) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
            bucket: bucket.to_string(),
        };
        std::fs::create_dir_all(store.bucket_dir())?;
        Ok(store)
    }

    fn bucket_dir(&self) -> PathBuf {
        self.root.join(&self.bucket)
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.bucket_dir().join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        key: &str,
        file: &Path,
        content_type: &str,
        content_md5: &str,
        tags: &[(String, String)],
    ) -> Result<String> {
        let dest = self.object_path(key);
        let tmp = self.bucket_dir().join(format!("{}.tmp", key));
        tokio::fs::copy(file, &tmp)
            .await
            .map_err(|e| CourierError::Storage(format!("put {}: {}", key, e)))?;
        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(|e| CourierError::Storage(format!("put {}: {}", key, e)))?;

        let meta = ObjectMeta {
            content_type: content_type.to_string(),
            content_md5: content_md5.to_string(),
            tags: tags.to_vec(),
        };
        tokio::fs::write(
            self.bucket_dir().join(format!("{}.meta.json", key)),
            serde_json::to_vec_pretty(&meta)?,
        )
        .await
        .map_err(|e| CourierError::Storage(format!("put {}: {}", key, e)))?;

        Ok(format!("file://{}", dest.display()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        tokio::fs::remove_file(self.object_path(key))
            .await
            .map_err(|e| CourierError::Storage(format!("delete {}: {}", key, e)))?;
        let _ = tokio::fs::remove_file(self.bucket_dir().join(format!("{}.meta.json", key))).await;
        Ok(())
    }
}
