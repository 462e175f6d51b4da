use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::app::ports::SilverStorePort;
use crate::error::{PipelineError, Result};
use crate::pipeline::storage::{
    CancelFlag, PartitionDraft, RejectionEntry, SilverCatalog, SilverManifest, SilverPartition,
    SilverWriter,
};

/// Filesystem implementation of SilverStorePort.
/// Blocking file work runs on the tokio blocking pool.
#[derive(Debug, Clone)]
pub struct FsSilverStore {
    writer: SilverWriter,
    catalog: SilverCatalog,
}

impl FsSilverStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            writer: SilverWriter::new(root.clone()),
            catalog: SilverCatalog::new(root),
        }
    }

    pub fn root(&self) -> &Path {
        self.writer.root()
    }

    async fn blocking<T, F>(f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl SilverStorePort for FsSilverStore {
    async fn commit(&self, draft: PartitionDraft, cancel: CancelFlag) -> Result<SilverManifest> {
        let writer = self.writer.clone();
        Self::blocking(move || writer.commit(draft, &cancel)).await
    }

    async fn list(&self) -> Result<Vec<SilverManifest>> {
        let catalog = self.catalog.clone();
        Self::blocking(move || catalog.list()).await
    }

    async fn read_partition(&self, partition_id: &str) -> Result<SilverPartition> {
        let catalog = self.catalog.clone();
        let id = partition_id.to_string();
        Self::blocking(move || catalog.read_partition(&id)).await
    }

    async fn read_rejections(&self, partition_id: &str) -> Result<Vec<RejectionEntry>> {
        let catalog = self.catalog.clone();
        let id = partition_id.to_string();
        Self::blocking(move || catalog.read_rejections(&id)).await
    }
}
