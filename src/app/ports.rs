use async_trait::async_trait;

use crate::error::Result;
use crate::pipeline::storage::{CancelFlag, PartitionDraft, RejectionEntry, SilverManifest, SilverPartition};

/// Where Silver partitions are published and read back
#[async_trait]
pub trait SilverStorePort: Send + Sync {
    /// Publish a draft atomically; nothing is visible unless this returns `Ok`
    async fn commit(&self, draft: PartitionDraft, cancel: CancelFlag) -> Result<SilverManifest>;

    async fn list(&self) -> Result<Vec<SilverManifest>>;

    async fn read_partition(&self, partition_id: &str) -> Result<SilverPartition>;

    async fn read_rejections(&self, partition_id: &str) -> Result<Vec<RejectionEntry>>;
}
