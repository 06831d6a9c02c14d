//! voxelvault - versioned, chunked block storage for scientific volumes
//!
//! A storage engine for large n-dimensional volumes (electron-microscopy
//! grayscale, multi-channel, and dense label data). Voxels are partitioned
//! into fixed-size blocks addressed by a ZYX spatial index over an ordered
//! key-value backend, and composed with a per-dataset DAG of versions so
//! branches and locked read-only nodes are supported.
//!
//! # Features
//!
//! - 2D orthogonal slice (XY/XZ/YZ) and 3D subvolume reads and writes
//! - Bit-stable block key layout and snappy+crc32 record framing
//! - Per-(data, version) write serialization with concurrent chunk handlers
//! - Double-buffered bulk XY image ingestion
//! - Version DAG with UUID-prefix addressing, locking, and branching
//! - Pluggable ordered key-value backend (in-memory reference included)
//!
//! # Example
//!
//! ```rust,ignore
//! use voxelvault::{
//!     BlockEngine, DataOptions, Datastore, EngineOptions, LayoutRegistry,
//!     MemoryKvStore, Point3, View,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> voxelvault::Result<()> {
//! let store = Arc::new(MemoryKvStore::new());
//! let datastore = Datastore::new(store.clone(), LayoutRegistry::builtin());
//! let (root, id) = datastore.new_dataset().await?;
//! let uuid = root.simple().to_string();
//! let data = datastore
//!     .new_data(&uuid, "grayscale", "uint8", DataOptions::default())
//!     .await?;
//!
//! let engine = BlockEngine::new(store, EngineOptions::default());
//! let view = View::slice_xy(Point3::new(0, 0, 100), 512, 256);
//! let dataset = datastore.dataset(id)?;
//! let dataset = dataset.read().await;
//! let image = engine.get_voxels(&dataset, &data, &uuid, &view).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod codec;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod extents;
pub mod index;
pub mod keys;
pub mod transfer;
pub mod types;
pub mod version;
pub mod view;
pub mod writer;

// Re-exports
pub use backend::{Batcher, KeyValue, KvStore, MemoryKvStore, WriteBatch};
pub use codec::{deserialize_record, serialize_record, Checksum, Compression};
pub use dataset::{DataInstance, DataOptions, Dataset, Datastore};
pub use engine::{BlockEngine, EngineOptions};
pub use error::{Result, VaultError};
pub use extents::{Extents, ExtentsSnapshot};
pub use index::{block_spans, decode_index, encode_index, BlockSpan, SPATIAL_INDEX_BYTES};
pub use keys::{BlockKey, BLOCK_KEY_BYTES, KEY_HEADER_BYTES};
pub use types::{
    DataLocalId, DatasetLocalId, LayoutRegistry, Point3, ValueKind, ValueLayout, VersionLocalId,
};
pub use version::{VersionDag, VersionNode};
pub use view::{View, ViewShape};
pub use writer::{AsyncWriter, DirtyBlock, WriteTicket};

/// Version of the voxelvault crate
pub const VOXELVAULT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VOXELVAULT_VERSION.is_empty());
    }
}
