// Silver storage: manifests, the atomic partition writer, and the catalog of committed partitions

pub mod catalog;
pub mod manifest;
pub mod silver_writer;

pub use catalog::SilverCatalog;
pub use manifest::{RejectionEntry, RejectionStage, RunCounts, SilverManifest, SilverPartition};
pub use silver_writer::{validate_partition_id, CancelFlag, PartitionDraft, SilverWriter};
