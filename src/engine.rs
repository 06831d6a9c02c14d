//! Block engine: the public voxel read/write API
//!
//! The engine maps views onto block records through the spatial index,
//! scatters and gathers voxel data via the transfer routines, and hands
//! dirty blocks to the [`AsyncWriter`]. Writes to one (dataset, data,
//! version) triple are serialized by a per-triple mutex created on demand
//! under a brief global lock; writes to different versions of the same data
//! proceed concurrently.

use crate::backend::KvStore;
use crate::codec::{deserialize_record, Checksum, Compression};
use crate::dataset::{DataInstance, Dataset};
use crate::error::{Result, VaultError};
use crate::index::block_spans;
use crate::keys::{data_metadata_key, BlockKey};
use crate::transfer::{read_block, write_block};
use crate::types::{DataLocalId, DatasetLocalId, Point3, VersionLocalId};
use crate::view::View;
use crate::writer::{AsyncWriter, DirtyBlock, WriteTicket};
use bytes::Bytes;
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Tuning knobs for a block engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Reject requests covering more voxels than this
    pub max_request_voxels: u64,
    /// Chunk-handler tokens per detected core
    pub handlers_per_core: usize,
    /// Concurrent submissions allowed in the async writer
    pub max_write_tasks: usize,
    /// Framing applied to committed block records
    pub compression: Compression,
    pub checksum: Checksum,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_request_voxels: 1_000_000_000,
            handlers_per_core: 2,
            max_write_tasks: 8,
            compression: Compression::Snappy,
            checksum: Checksum::Crc32,
        }
    }
}

type VersionKey = (DatasetLocalId, DataLocalId, VersionLocalId);

/// Voxel block engine over an ordered key-value backend
pub struct BlockEngine {
    store: Arc<dyn KvStore>,
    writer: AsyncWriter,
    options: EngineOptions,
    chunk_tokens: Arc<Semaphore>,
    version_locks: Mutex<HashMap<VersionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl BlockEngine {
    pub fn new(store: Arc<dyn KvStore>, options: EngineOptions) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let tokens = (cores * options.handlers_per_core).max(1);
        let writer = AsyncWriter::new(
            store.clone(),
            options.max_write_tasks,
            options.compression,
            options.checksum,
        );
        Self {
            store,
            writer,
            options,
            chunk_tokens: Arc::new(Semaphore::new(tokens)),
            version_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The mutex serializing writes to one (dataset, data, version) triple.
    ///
    /// The map lock is dropped before the returned mutex is ever locked.
    fn version_mutex(&self, key: VersionKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.version_locks.lock();
        map.entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn check_size(&self, voxels: u64) -> Result<()> {
        if voxels > self.options.max_request_voxels {
            return Err(VaultError::OversizeRequest {
                requested: voxels,
                cap: self.options.max_request_voxels,
            });
        }
        Ok(())
    }

    /// Local version id used in block keys: unversioned data collapses every
    /// node onto the DAG root so all versions share one copy.
    fn key_version(dataset: &Dataset, data: &DataInstance, node_id: VersionLocalId) -> VersionLocalId {
        if data.versioned() {
            node_id
        } else {
            dataset.dag().root_id()
        }
    }

    fn decode_block(value: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let (payload, _) = deserialize_record(value, true)?;
        if payload.len() != expected_len {
            return Err(VaultError::Corrupt(format!(
                "block payload is {} bytes, expected {}",
                payload.len(),
                expected_len
            )));
        }
        Ok(payload)
    }

    /// Read the voxels of `view` at the version matching `uuid`.
    ///
    /// Returns the packed view buffer; regions no block covers come back
    /// zeroed. Each backend record is decoded and transferred by a
    /// chunk-handler task gated by the bounded token pool, and any decode
    /// failure fails the whole request.
    pub async fn get_voxels(
        &self,
        dataset: &Dataset,
        data: &DataInstance,
        uuid: &str,
        view: &View,
    ) -> Result<Vec<u8>> {
        let node = dataset.dag().resolve(uuid)?;
        let version = Self::key_version(dataset, data, node.id);
        self.check_size(view.num_voxels())?;

        let bpv = data.layout().bytes_per_voxel();
        let block_size = data.block_size();
        let block_len = block_size.num_voxels() as usize * bpv;
        let buf = vec![0u8; view.buffer_len(bpv)];
        if view.num_voxels() == 0 {
            return Ok(buf);
        }

        let shared = Arc::new(Mutex::new(buf));
        let mut handlers = Vec::new();
        for span in block_spans(view.start(), view.end(), block_size) {
            let (begin, end) =
                BlockKey::range(dataset.id(), data.id(), version, span.first, span.last);
            let records = self.store.get_range(&begin, &end).await?;
            for record in records {
                let tokens = self.chunk_tokens.clone();
                let shared = shared.clone();
                let view = *view;
                handlers.push(tokio::spawn(async move {
                    let _permit = tokens.acquire_owned().await.map_err(|e| {
                        VaultError::Backend(format!("chunk token pool closed: {}", e))
                    })?;
                    let key = BlockKey::decode(&record.key)?;
                    let payload = Self::decode_block(&record.value, block_len)?;
                    let mut buf = shared.lock();
                    read_block(&view, &mut buf, key.coord, &payload, block_size, bpv)
                }));
            }
        }
        let results = try_join_all(handlers)
            .await
            .map_err(|e| VaultError::Backend(format!("chunk handler aborted: {}", e)))?;
        for result in results {
            result?;
        }

        let buf = Arc::try_unwrap(shared)
            .map_err(|_| VaultError::Backend("view buffer still shared".to_string()))?
            .into_inner();
        Ok(buf)
    }

    /// Write the voxels of `view` at the version matching `uuid`.
    ///
    /// Existing blocks are read, modified, and re-enqueued; blocks the view
    /// touches for the first time start zeroed. The call returns once every
    /// dirty block is enqueued on the writer; it does not wait for commit
    /// (see [`flush`](Self::flush) and [`bulk_load_xy`](Self::bulk_load_xy)).
    pub async fn put_voxels(
        &self,
        dataset: &Dataset,
        data: &DataInstance,
        uuid: &str,
        view: &View,
        payload: &[u8],
    ) -> Result<()> {
        let node = dataset.dag().resolve(uuid)?;
        if node.locked {
            return Err(VaultError::VersionLocked(node.hex()));
        }
        let version = Self::key_version(dataset, data, node.id);
        self.check_size(view.num_voxels())?;

        let bpv = data.layout().bytes_per_voxel();
        if payload.len() != view.buffer_len(bpv) {
            return Err(VaultError::Configuration(format!(
                "payload is {} bytes, {} expects {}",
                payload.len(),
                view,
                view.buffer_len(bpv)
            )));
        }
        if view.num_voxels() == 0 {
            return Ok(());
        }

        let vmutex = self.version_mutex((dataset.id(), data.id(), version));
        let _guard = vmutex.lock().await;

        let dirty = self
            .modify_blocks(dataset.id(), data, version, view, payload)
            .await?;
        debug!(
            "enqueueing {} dirty blocks for '{}' version {}",
            dirty.len(),
            data.name(),
            version
        );
        self.writer.submit_detached(dirty);

        self.update_extents(data, view).await;
        Ok(())
    }

    /// Read-modify phase shared by `put_voxels` and the bulk loader's layer
    /// preload: walk spans, match scanned records to block coordinates in
    /// key order, and produce the modified block buffers.
    async fn modify_blocks(
        &self,
        dataset_id: DatasetLocalId,
        data: &DataInstance,
        version: VersionLocalId,
        view: &View,
        payload: &[u8],
    ) -> Result<Vec<DirtyBlock>> {
        let bpv = data.layout().bytes_per_voxel();
        let block_size = data.block_size();
        let block_len = block_size.num_voxels() as usize * bpv;

        let mut dirty = Vec::new();
        for span in block_spans(view.start(), view.end(), block_size) {
            let (begin, end) = BlockKey::range(dataset_id, data.id(), version, span.first, span.last);
            let existing = self.store.get_range(&begin, &end).await?;
            let mut existing = existing.into_iter().peekable();
            for x in span.first.x..=span.last.x {
                let coord = Point3::new(x, span.first.y, span.first.z);
                let key = BlockKey::new(dataset_id, data.id(), version, coord).encode();
                let mut block = match existing.peek() {
                    Some(kv) if kv.key.as_ref() == key.as_ref() => {
                        let kv = existing.next().unwrap();
                        Self::decode_block(&kv.value, block_len)?
                    }
                    _ => data.layout().new_block_buffer(block_size),
                };
                write_block(view, payload, coord, &mut block, block_size, bpv)?;
                dirty.push(DirtyBlock::new(Bytes::copy_from_slice(&key), block));
            }
        }
        Ok(dirty)
    }

    /// Bulk-load a run of equally sized XY images starting at `offset`.
    ///
    /// Image `i` lands at z = `offset.z + i`. Two z-layers of blocks are
    /// double-buffered: a layer's blocks are preloaded when its first image
    /// arrives, handed to the writer after its last image, and the slot is
    /// reused only after that commit finishes. Unlike `put_voxels` this
    /// waits for every commit before returning.
    pub async fn bulk_load_xy(
        &self,
        dataset: &Dataset,
        data: &DataInstance,
        uuid: &str,
        offset: Point3,
        width: u32,
        height: u32,
        images: &[Vec<u8>],
    ) -> Result<()> {
        let node = dataset.dag().resolve(uuid)?;
        if node.locked {
            return Err(VaultError::VersionLocked(node.hex()));
        }
        let version = Self::key_version(dataset, data, node.id);
        if images.is_empty() {
            return Ok(());
        }
        let voxels = width as u64 * height as u64 * images.len() as u64;
        self.check_size(voxels)?;

        let bpv = data.layout().bytes_per_voxel();
        let block_size = data.block_size();
        let image_len = width as usize * height as usize * bpv;
        for (i, image) in images.iter().enumerate() {
            if image.len() != image_len {
                return Err(VaultError::Configuration(format!(
                    "image {} is {} bytes, expected {}",
                    i,
                    image.len(),
                    image_len
                )));
            }
        }

        let vmutex = self.version_mutex((dataset.id(), data.id(), version));
        let _guard = vmutex.lock().await;

        let mut slots: [HashMap<Point3, Vec<u8>>; 2] = [HashMap::new(), HashMap::new()];
        let mut tickets: [Option<WriteTicket>; 2] = [None, None];

        for (i, image) in images.iter().enumerate() {
            let z = offset.z + i as i32;
            let block_z = z.div_euclid(block_size.z);
            let slot = block_z.rem_euclid(2) as usize;
            let view = View::slice_xy(Point3::new(offset.x, offset.y, z), width, height);

            if i == 0 || z.rem_euclid(block_size.z) == 0 {
                if let Some(ticket) = tickets[slot].take() {
                    ticket.wait().await?;
                }
                slots[slot] = self
                    .load_block_layer(dataset.id(), data, version, &view, block_z)
                    .await?;
            }

            for (coord, block) in slots[slot].iter_mut() {
                write_block(&view, image, *coord, block, block_size, bpv)?;
            }

            let last_of_layer =
                z.rem_euclid(block_size.z) == block_size.z - 1 || i == images.len() - 1;
            if last_of_layer {
                let blocks = std::mem::take(&mut slots[slot]);
                let dirty = blocks
                    .into_iter()
                    .map(|(coord, block)| {
                        let key = BlockKey::new(dataset.id(), data.id(), version, coord);
                        DirtyBlock::new(key.encode_bytes(), block)
                    })
                    .collect();
                tickets[slot] = Some(self.writer.submit(dirty));
            }
        }

        for ticket in tickets.into_iter().flatten() {
            ticket.wait().await?;
        }

        let span_view = View::volume(offset, width, height, images.len() as u32);
        self.update_extents(data, &span_view).await;
        Ok(())
    }

    /// All zeroed-or-preloaded blocks of one z-layer intersecting the XY
    /// footprint of `view`
    async fn load_block_layer(
        &self,
        dataset_id: DatasetLocalId,
        data: &DataInstance,
        version: VersionLocalId,
        view: &View,
        block_z: i32,
    ) -> Result<HashMap<Point3, Vec<u8>>> {
        let bpv = data.layout().bytes_per_voxel();
        let block_size = data.block_size();
        let block_len = block_size.num_voxels() as usize * bpv;
        let layer_z = block_z * block_size.z;
        let start = Point3::new(view.start().x, view.start().y, layer_z);
        let end = Point3::new(view.end().x, view.end().y, layer_z);

        let mut blocks = HashMap::new();
        for span in block_spans(start, end, block_size) {
            let (begin, range_end) =
                BlockKey::range(dataset_id, data.id(), version, span.first, span.last);
            let existing = self.store.get_range(&begin, &range_end).await?;
            let mut existing = existing.into_iter().peekable();
            for x in span.first.x..=span.last.x {
                let coord = Point3::new(x, span.first.y, span.first.z);
                let key = BlockKey::new(dataset_id, data.id(), version, coord).encode();
                let block = match existing.peek() {
                    Some(kv) if kv.key.as_ref() == key.as_ref() => {
                        let kv = existing.next().unwrap();
                        Self::decode_block(&kv.value, block_len)?
                    }
                    _ => data.layout().new_block_buffer(block_size),
                };
                blocks.insert(coord, block);
            }
        }
        Ok(blocks)
    }

    /// Fold the written region into the instance extents and re-persist the
    /// metadata record when they moved. Persist failures only log: the
    /// in-memory extents are already updated and the voxel write stands.
    async fn update_extents(&self, data: &DataInstance, view: &View) {
        let block_size = data.block_size();
        let changed_points = data.extents().adjust_points(view.start(), view.end());
        let changed_indices = data.extents().adjust_indices(
            view.start().block_coord(block_size),
            view.end().block_coord(block_size),
        );
        if changed_points || changed_indices {
            let key = data_metadata_key(data.dataset_id(), data.id());
            let result = match data.metadata_blob() {
                Ok(blob) => self.store.put(&key, blob.into()).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(
                    "failed to persist extents for data '{}': {}",
                    data.name(),
                    e
                );
            }
        }
    }

    /// Wait until every block enqueued by earlier `put_voxels` calls has
    /// committed, establishing read-your-write for subsequent gets.
    pub async fn flush(&self) -> Result<()> {
        self.writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryKvStore;
    use crate::dataset::{DataOptions, Datastore};
    use crate::types::LayoutRegistry;

    async fn fixture(
        block_size: Point3,
    ) -> (Arc<MemoryKvStore>, Datastore, BlockEngine, String, Arc<DataInstance>) {
        let store = Arc::new(MemoryKvStore::new());
        let datastore = Datastore::new(store.clone(), LayoutRegistry::builtin());
        let (root, _) = datastore.new_dataset().await.unwrap();
        let uuid = root.simple().to_string();
        let options = DataOptions::default().with_block_size(block_size);
        let data = datastore
            .new_data(&uuid, "gray", "uint8", options)
            .await
            .unwrap();
        let engine = BlockEngine::new(store.clone(), EngineOptions::default());
        (store, datastore, engine, uuid, data)
    }

    #[tokio::test]
    async fn test_get_unwritten_region_is_zeroed() {
        let (_, datastore, engine, uuid, data) = fixture(Point3::new(16, 16, 16)).await;
        let handle = datastore.dataset(1).unwrap();
        let dataset = handle.read().await;
        let view = View::slice_xy(Point3::new(-5, -5, 3), 20, 20);
        let out = engine.get_voxels(&dataset, &data, &uuid, &view).await.unwrap();
        assert_eq!(out.len(), 400);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_put_then_get_after_flush() {
        let (_, datastore, engine, uuid, data) = fixture(Point3::new(16, 16, 16)).await;
        let handle = datastore.dataset(1).unwrap();
        let dataset = handle.read().await;
        let view = View::slice_xz(Point3::new(3, 9, -10), 40, 25);
        let payload: Vec<u8> = (0..view.buffer_len(1)).map(|i| (i % 255) as u8 + 1).collect();
        engine
            .put_voxels(&dataset, &data, &uuid, &view, &payload)
            .await
            .unwrap();
        engine.flush().await.unwrap();
        let out = engine.get_voxels(&dataset, &data, &uuid, &view).await.unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_put_to_locked_version_fails() {
        let (_, datastore, engine, uuid, data) = fixture(Point3::new(16, 16, 16)).await;
        datastore.lock(&uuid).await.unwrap();
        let handle = datastore.dataset(1).unwrap();
        let dataset = handle.read().await;
        let view = View::slice_xy(Point3::new(0, 0, 0), 4, 4);
        let err = engine
            .put_voxels(&dataset, &data, &uuid, &view, &[0u8; 16])
            .await;
        assert!(matches!(err, Err(VaultError::VersionLocked(_))));
    }

    #[tokio::test]
    async fn test_oversize_request_rejected() {
        let (store, datastore, _, uuid, data) = fixture(Point3::new(16, 16, 16)).await;
        let engine = BlockEngine::new(
            store,
            EngineOptions {
                max_request_voxels: 1_000,
                ..Default::default()
            },
        );
        let handle = datastore.dataset(1).unwrap();
        let dataset = handle.read().await;
        let view = View::slice_xy(Point3::new(0, 0, 0), 64, 64);
        let err = engine.get_voxels(&dataset, &data, &uuid, &view).await;
        assert!(matches!(err, Err(VaultError::OversizeRequest { .. })));
    }

    #[tokio::test]
    async fn test_payload_length_validated() {
        let (_, datastore, engine, uuid, data) = fixture(Point3::new(16, 16, 16)).await;
        let handle = datastore.dataset(1).unwrap();
        let dataset = handle.read().await;
        let view = View::slice_xy(Point3::new(0, 0, 0), 10, 10);
        let err = engine
            .put_voxels(&dataset, &data, &uuid, &view, &[0u8; 99])
            .await;
        assert!(matches!(err, Err(VaultError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_extents_updated_and_persisted() {
        let (store, datastore, engine, uuid, data) = fixture(Point3::new(16, 16, 16)).await;
        let handle = datastore.dataset(1).unwrap();
        let dataset = handle.read().await;
        let view = View::slice_xy(Point3::new(0, 0, 100), 512, 256);
        let payload = vec![1u8; view.buffer_len(1)];
        engine
            .put_voxels(&dataset, &data, &uuid, &view, &payload)
            .await
            .unwrap();
        assert_eq!(
            data.extents().points(),
            Some((Point3::new(0, 0, 100), Point3::new(511, 255, 100)))
        );
        assert_eq!(
            data.extents().indices(),
            Some((Point3::new(0, 0, 6), Point3::new(31, 15, 6)))
        );
        // The standalone metadata record was refreshed.
        let record = store
            .get(&data_metadata_key(data.dataset_id(), data.id()))
            .await
            .unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn test_unversioned_data_shared_across_versions() {
        let store = Arc::new(MemoryKvStore::new());
        let datastore = Datastore::new(store.clone(), LayoutRegistry::builtin());
        let (root, _) = datastore.new_dataset().await.unwrap();
        let uuid = root.simple().to_string();
        let options = DataOptions::default()
            .with_block_size(Point3::new(16, 16, 16))
            .with_versioned(false);
        let data = datastore
            .new_data(&uuid, "shared", "uint8", options)
            .await
            .unwrap();
        let engine = BlockEngine::new(store, EngineOptions::default());

        datastore.lock(&uuid).await.unwrap();
        let child = datastore.branch(&uuid).await.unwrap().simple().to_string();

        let handle = datastore.dataset(1).unwrap();
        let dataset = handle.read().await;
        let view = View::slice_xy(Point3::new(0, 0, 0), 8, 8);
        let payload = vec![0x5au8; 64];
        engine
            .put_voxels(&dataset, &data, &child, &view, &payload)
            .await
            .unwrap();
        engine.flush().await.unwrap();

        // Visible through the root UUID too: unversioned data has one copy.
        let through_root = engine
            .get_voxels(&dataset, &data, &uuid, &view)
            .await
            .unwrap();
        assert_eq!(through_root, payload);
    }
}
