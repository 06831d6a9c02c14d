//! Datasets, typed data instances, and the datastore service that persists them
//!
//! A dataset owns a version DAG and a set of named data instances. The
//! [`Datastore`] is the service façade over the backend: it creates and loads
//! datasets, allocates local ids, applies structural DAG changes, and writes
//! the self-describing metadata blobs back on every structural change.

use crate::backend::KvStore;
use crate::codec::{deserialize_record, serialize_record, Checksum, Compression};
use crate::error::{Result, VaultError};
use crate::extents::{Extents, ExtentsSnapshot};
use crate::keys::{data_metadata_key, dataset_blob_key, directory_key};
use crate::types::{
    DataLocalId, DatasetLocalId, LayoutRegistry, Point3, ValueLayout, DEFAULT_BLOCK_SIZE,
};
use crate::version::VersionDag;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Options applied when creating a data instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataOptions {
    /// Block edge lengths; every component must be positive
    pub block_size: Point3,
    /// Voxel resolution along each axis, in nanometers
    pub resolution: [f32; 3],
    /// Unit label per axis
    pub units: [String; 3],
    /// Whether writes are kept per version node
    pub versioned: bool,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            block_size: Point3::new(DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE),
            resolution: [1.0; 3],
            units: ["nm".to_string(), "nm".to_string(), "nm".to_string()],
            versioned: true,
        }
    }
}

impl DataOptions {
    pub fn with_block_size(mut self, block_size: Point3) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_resolution(mut self, resolution: [f32; 3]) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_versioned(mut self, versioned: bool) -> Self {
        self.versioned = versioned;
        self
    }
}

/// A typed store within a dataset.
///
/// Block size, value layout, and the versioned flag are fixed at creation
/// for the lifetime of the instance; only the extents mutate afterwards.
#[derive(Debug)]
pub struct DataInstance {
    name: String,
    id: DataLocalId,
    dataset: DatasetLocalId,
    layout: ValueLayout,
    block_size: Point3,
    resolution: [f32; 3],
    units: [String; 3],
    versioned: bool,
    extents: Extents,
}

/// Serialized form of a data instance, stored standalone and inside the
/// dataset blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataInstanceRecord {
    pub name: String,
    pub id: DataLocalId,
    pub dataset: DatasetLocalId,
    pub layout: ValueLayout,
    pub block_size: Point3,
    pub resolution: [f32; 3],
    pub units: [String; 3],
    pub versioned: bool,
    pub extents: ExtentsSnapshot,
}

impl DataInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> DataLocalId {
        self.id
    }

    pub fn dataset_id(&self) -> DatasetLocalId {
        self.dataset
    }

    pub fn layout(&self) -> ValueLayout {
        self.layout
    }

    pub fn block_size(&self) -> Point3 {
        self.block_size
    }

    pub fn resolution(&self) -> [f32; 3] {
        self.resolution
    }

    pub fn units(&self) -> &[String; 3] {
        &self.units
    }

    pub fn versioned(&self) -> bool {
        self.versioned
    }

    pub fn extents(&self) -> &Extents {
        &self.extents
    }

    /// Snapshot this instance for persistence
    pub fn record(&self) -> DataInstanceRecord {
        DataInstanceRecord {
            name: self.name.clone(),
            id: self.id,
            dataset: self.dataset,
            layout: self.layout,
            block_size: self.block_size,
            resolution: self.resolution,
            units: self.units.clone(),
            versioned: self.versioned,
            extents: self.extents.snapshot(),
        }
    }

    fn from_record(record: DataInstanceRecord) -> Self {
        Self {
            name: record.name,
            id: record.id,
            dataset: record.dataset,
            layout: record.layout,
            block_size: record.block_size,
            resolution: record.resolution,
            units: record.units,
            versioned: record.versioned,
            extents: Extents::restore(record.extents),
        }
    }

    /// Encode this instance's metadata record with the standard blob framing
    pub fn metadata_blob(&self) -> Result<Vec<u8>> {
        encode_blob(&self.record())
    }
}

/// Serialized form of a dataset: DAG plus data directory
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatasetRecord {
    root: Uuid,
    id: DatasetLocalId,
    dag: VersionDag,
    data: Vec<DataInstanceRecord>,
    next_data_id: DataLocalId,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

/// A named collection owning a version DAG and a set of data instances
#[derive(Debug)]
pub struct Dataset {
    root: Uuid,
    id: DatasetLocalId,
    dag: VersionDag,
    data: HashMap<String, Arc<DataInstance>>,
    next_data_id: DataLocalId,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl Dataset {
    fn new(id: DatasetLocalId) -> Self {
        let dag = VersionDag::new();
        let now = Utc::now();
        Self {
            root: dag.root_uuid(),
            id,
            dag,
            data: HashMap::new(),
            next_data_id: 1,
            created_at: now,
            modified_at: now,
        }
    }

    /// UUID of the root version node
    pub fn root(&self) -> Uuid {
        self.root
    }

    pub fn id(&self) -> DatasetLocalId {
        self.id
    }

    pub fn dag(&self) -> &VersionDag {
        &self.dag
    }

    pub fn dag_mut(&mut self) -> &mut VersionDag {
        self.modified_at = Utc::now();
        &mut self.dag
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Look up a data instance by name
    pub fn data(&self, name: &str) -> Result<Arc<DataInstance>> {
        self.data.get(name).cloned().ok_or_else(|| {
            VaultError::Configuration(format!("dataset has no data instance named '{}'", name))
        })
    }

    /// Data instances in no particular order
    pub fn data_instances(&self) -> impl Iterator<Item = &Arc<DataInstance>> {
        self.data.values()
    }

    /// Create a new data instance inside this dataset
    pub fn new_data(
        &mut self,
        name: impl Into<String>,
        layout: ValueLayout,
        options: DataOptions,
    ) -> Result<Arc<DataInstance>> {
        let name = name.into();
        if self.data.contains_key(&name) {
            return Err(VaultError::Configuration(format!(
                "data instance '{}' already exists",
                name
            )));
        }
        let bs = options.block_size;
        if bs.x <= 0 || bs.y <= 0 || bs.z <= 0 {
            return Err(VaultError::Configuration(format!(
                "block size {} must be positive in every dimension",
                bs
            )));
        }
        if layout.count == 0 {
            return Err(VaultError::Configuration(
                "value layout must have at least one channel".to_string(),
            ));
        }
        if self.next_data_id == DataLocalId::MAX {
            return Err(VaultError::Configuration(
                "data local id space exhausted".to_string(),
            ));
        }
        let instance = Arc::new(DataInstance {
            name: name.clone(),
            id: self.next_data_id,
            dataset: self.id,
            layout,
            block_size: bs,
            resolution: options.resolution,
            units: options.units,
            versioned: options.versioned,
            extents: Extents::new(),
        });
        self.next_data_id += 1;
        self.modified_at = Utc::now();
        self.data.insert(name, instance.clone());
        Ok(instance)
    }

    fn record(&self) -> DatasetRecord {
        DatasetRecord {
            root: self.root,
            id: self.id,
            dag: self.dag.clone(),
            data: self.data.values().map(|d| d.record()).collect(),
            next_data_id: self.next_data_id,
            created_at: self.created_at,
            modified_at: self.modified_at,
        }
    }

    fn from_record(record: DatasetRecord) -> Self {
        let data = record
            .data
            .into_iter()
            .map(|r| (r.name.clone(), Arc::new(DataInstance::from_record(r))))
            .collect();
        Self {
            root: record.root,
            id: record.id,
            dag: record.dag,
            data,
            next_data_id: record.next_data_id,
            created_at: record.created_at,
            modified_at: record.modified_at,
        }
    }
}

/// Metadata framing used for every persisted blob
const META_COMPRESSION: Compression = Compression::Snappy;
const META_CHECKSUM: Checksum = Checksum::Crc32;

fn encode_blob<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    serialize_record(&json, META_COMPRESSION, META_CHECKSUM)
}

fn decode_blob<T: for<'de> Deserialize<'de>>(record: &[u8]) -> Result<T> {
    let (json, _) = deserialize_record(record, true)?;
    Ok(serde_json::from_slice(&json)?)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DirectoryRecord {
    dataset_ids: Vec<DatasetLocalId>,
    next_dataset_id: DatasetLocalId,
}

/// Service coupling an open backend with the datasets stored in it
pub struct Datastore {
    store: Arc<dyn KvStore>,
    registry: LayoutRegistry,
    datasets: RwLock<HashMap<DatasetLocalId, Arc<tokio::sync::RwLock<Dataset>>>>,
    next_dataset_id: parking_lot::Mutex<DatasetLocalId>,
}

impl Datastore {
    /// A datastore over an empty or fresh backend
    pub fn new(store: Arc<dyn KvStore>, registry: LayoutRegistry) -> Self {
        Self {
            store,
            registry,
            datasets: RwLock::new(HashMap::new()),
            next_dataset_id: parking_lot::Mutex::new(1),
        }
    }

    /// Open a datastore, loading the directory and every dataset blob.
    ///
    /// Standalone data-instance records are preferred over the copies
    /// embedded in the dataset blob since the engine refreshes them on every
    /// extents change.
    pub async fn open(store: Arc<dyn KvStore>, registry: LayoutRegistry) -> Result<Self> {
        let directory: DirectoryRecord = match store.get(&directory_key()).await? {
            Some(bytes) => decode_blob(&bytes)?,
            None => DirectoryRecord {
                dataset_ids: Vec::new(),
                next_dataset_id: 1,
            },
        };

        let mut datasets = HashMap::new();
        for id in &directory.dataset_ids {
            let blob = store.get(&dataset_blob_key(*id)).await?.ok_or_else(|| {
                VaultError::Corrupt(format!("dataset {} listed but its blob is missing", id))
            })?;
            let mut record: DatasetRecord = decode_blob(&blob)?;
            for data in record.data.iter_mut() {
                if let Some(bytes) = store.get(&data_metadata_key(*id, data.id)).await? {
                    *data = decode_blob(&bytes)?;
                }
            }
            datasets.insert(*id, Arc::new(tokio::sync::RwLock::new(Dataset::from_record(record))));
        }

        Ok(Self {
            store,
            registry,
            datasets: RwLock::new(datasets),
            next_dataset_id: parking_lot::Mutex::new(directory.next_dataset_id.max(1)),
        })
    }

    pub fn registry(&self) -> &LayoutRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn KvStore> {
        self.store.clone()
    }

    /// Handle to a dataset by local id
    pub fn dataset(&self, id: DatasetLocalId) -> Result<Arc<tokio::sync::RwLock<Dataset>>> {
        self.datasets.read().get(&id).cloned().ok_or_else(|| {
            VaultError::Configuration(format!("no dataset with local id {}", id))
        })
    }

    /// Handle to the dataset containing the version matching a UUID prefix
    pub async fn dataset_for_uuid(
        &self,
        prefix: &str,
    ) -> Result<Arc<tokio::sync::RwLock<Dataset>>> {
        let handles: Vec<_> = self.datasets.read().values().cloned().collect();
        let mut matched = None;
        for handle in handles {
            match handle.read().await.dag().resolve(prefix) {
                Ok(_) => {
                    if matched.is_some() {
                        return Err(VaultError::AmbiguousUuid(prefix.to_string()));
                    }
                    matched = Some(handle.clone());
                }
                Err(VaultError::AmbiguousUuid(p)) => {
                    return Err(VaultError::AmbiguousUuid(p));
                }
                Err(_) => {}
            }
        }
        matched.ok_or_else(|| VaultError::UnknownUuid(prefix.to_string()))
    }

    /// Create a new dataset with an open root version
    pub async fn new_dataset(&self) -> Result<(Uuid, DatasetLocalId)> {
        let id = {
            let mut next = self.next_dataset_id.lock();
            if *next == DatasetLocalId::MAX {
                return Err(VaultError::Configuration(
                    "dataset local id space exhausted".to_string(),
                ));
            }
            let id = *next;
            *next += 1;
            id
        };
        let dataset = Dataset::new(id);
        let root = dataset.root();
        self.datasets
            .write()
            .insert(id, Arc::new(tokio::sync::RwLock::new(dataset)));
        self.save_directory().await?;
        self.save_dataset(id).await?;
        Ok((root, id))
    }

    /// Create a data instance of a registered type in the dataset holding
    /// the given version
    pub async fn new_data(
        &self,
        uuid_prefix: &str,
        name: &str,
        type_name: &str,
        options: DataOptions,
    ) -> Result<Arc<DataInstance>> {
        let layout = self.registry.get(type_name)?;
        let handle = self.dataset_for_uuid(uuid_prefix).await?;
        let (id, instance) = {
            let mut dataset = handle.write().await;
            let instance = dataset.new_data(name, layout, options)?;
            (dataset.id(), instance)
        };
        self.save_dataset(id).await?;
        self.save_data(&instance).await?;
        Ok(instance)
    }

    /// Lock the version matching the prefix against writes
    pub async fn lock(&self, uuid_prefix: &str) -> Result<Uuid> {
        let handle = self.dataset_for_uuid(uuid_prefix).await?;
        let (id, locked) = {
            let mut dataset = handle.write().await;
            let locked = dataset.dag_mut().lock(uuid_prefix)?;
            (dataset.id(), locked)
        };
        self.save_dataset(id).await?;
        Ok(locked)
    }

    /// Branch a new open child off the locked version matching the prefix
    pub async fn branch(&self, uuid_prefix: &str) -> Result<Uuid> {
        let handle = self.dataset_for_uuid(uuid_prefix).await?;
        let (id, child) = {
            let mut dataset = handle.write().await;
            let child = dataset.dag_mut().branch(uuid_prefix)?;
            (dataset.id(), child)
        };
        self.save_dataset(id).await?;
        Ok(child)
    }

    /// Persist one dataset's blob
    pub async fn save_dataset(&self, id: DatasetLocalId) -> Result<()> {
        let handle = self.dataset(id)?;
        let blob = {
            let dataset = handle.read().await;
            encode_blob(&dataset.record())?
        };
        self.store.put(&dataset_blob_key(id), blob.into()).await
    }

    /// Persist one data instance's standalone metadata record
    pub async fn save_data(&self, data: &DataInstance) -> Result<()> {
        let blob = encode_blob(&data.record())?;
        self.store
            .put(&data_metadata_key(data.dataset_id(), data.id()), blob.into())
            .await
    }

    async fn save_directory(&self) -> Result<()> {
        let record = {
            let datasets = self.datasets.read();
            let mut ids: Vec<_> = datasets.keys().copied().collect();
            ids.sort_unstable();
            DirectoryRecord {
                dataset_ids: ids,
                next_dataset_id: *self.next_dataset_id.lock(),
            }
        };
        let blob = encode_blob(&record)?;
        self.store.put(&directory_key(), blob.into()).await
    }

    /// JSON listing of every dataset: root UUID, local id, and data chart
    pub async fn datasets_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct DataSummary<'a> {
            name: &'a str,
            layout: ValueLayout,
            block_size: Point3,
            versioned: bool,
        }
        #[derive(Serialize)]
        struct DatasetSummary {
            root: String,
            id: DatasetLocalId,
            versions: usize,
            data: Vec<serde_json::Value>,
        }

        let handles: Vec<_> = self.datasets.read().values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let dataset = handle.read().await;
            let mut data: Vec<serde_json::Value> = Vec::new();
            for instance in dataset.data_instances() {
                data.push(serde_json::to_value(DataSummary {
                    name: instance.name(),
                    layout: instance.layout(),
                    block_size: instance.block_size(),
                    versioned: instance.versioned(),
                })?);
            }
            summaries.push(DatasetSummary {
                root: dataset.root().simple().to_string(),
                id: dataset.id(),
                versions: dataset.dag().len(),
                data,
            });
        }
        summaries.sort_by_key(|s| s.id);
        Ok(serde_json::to_string_pretty(&summaries)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryKvStore;
    use crate::types::ValueKind;

    fn registry() -> LayoutRegistry {
        LayoutRegistry::builtin()
    }

    #[tokio::test]
    async fn test_new_dataset_and_data() {
        let store = Arc::new(MemoryKvStore::new());
        let datastore = Datastore::new(store.clone(), registry());
        let (root, id) = datastore.new_dataset().await.unwrap();
        assert_eq!(id, 1);

        let prefix = root.simple().to_string();
        let data = datastore
            .new_data(&prefix, "grayscale", "uint8", DataOptions::default())
            .await
            .unwrap();
        assert_eq!(data.id(), 1);
        assert_eq!(data.layout(), ValueLayout::new(ValueKind::U8, 1));
        assert_eq!(data.block_size(), Point3::new(32, 32, 32));

        let err = datastore
            .new_data(&prefix, "grayscale", "uint8", DataOptions::default())
            .await;
        assert!(matches!(err, Err(VaultError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let store = Arc::new(MemoryKvStore::new());
        let datastore = Datastore::new(store, registry());
        let (root, _) = datastore.new_dataset().await.unwrap();
        let err = datastore
            .new_data(&root.simple().to_string(), "x", "float128", DataOptions::default())
            .await;
        assert!(matches!(err, Err(VaultError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_bad_block_size_rejected() {
        let store = Arc::new(MemoryKvStore::new());
        let datastore = Datastore::new(store, registry());
        let (root, _) = datastore.new_dataset().await.unwrap();
        let options = DataOptions::default().with_block_size(Point3::new(0, 32, 32));
        let err = datastore
            .new_data(&root.simple().to_string(), "x", "uint8", options)
            .await;
        assert!(matches!(err, Err(VaultError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let store = Arc::new(MemoryKvStore::new());
        let (root, id) = {
            let datastore = Datastore::new(store.clone(), registry());
            let (root, id) = datastore.new_dataset().await.unwrap();
            let prefix = root.simple().to_string();
            datastore
                .new_data(&prefix, "labels", "labels64", DataOptions::default())
                .await
                .unwrap();
            datastore.lock(&prefix).await.unwrap();
            datastore.branch(&prefix).await.unwrap();
            (root, id)
        };

        let reopened = Datastore::open(store, registry()).await.unwrap();
        let handle = reopened.dataset(id).unwrap();
        let dataset = handle.read().await;
        assert_eq!(dataset.root(), root);
        assert_eq!(dataset.dag().len(), 2);
        assert!(dataset.dag().resolve(&root.simple().to_string()).unwrap().locked);
        let data = dataset.data("labels").unwrap();
        assert_eq!(data.layout().bytes_per_voxel(), 8);
    }

    #[tokio::test]
    async fn test_reopen_prefers_standalone_data_record() {
        let store = Arc::new(MemoryKvStore::new());
        let datastore = Datastore::new(store.clone(), registry());
        let (root, id) = datastore.new_dataset().await.unwrap();
        let prefix = root.simple().to_string();
        let data = datastore
            .new_data(&prefix, "gray", "uint8", DataOptions::default())
            .await
            .unwrap();

        // Extents change persisted standalone, as the engine does on writes.
        data.extents()
            .adjust_points(Point3::new(0, 0, 0), Point3::new(99, 99, 0));
        datastore.save_data(&data).await.unwrap();

        let reopened = Datastore::open(store, registry()).await.unwrap();
        let handle = reopened.dataset(id).unwrap();
        let dataset = handle.read().await;
        let loaded = dataset.data("gray").unwrap();
        assert_eq!(
            loaded.extents().points(),
            Some((Point3::new(0, 0, 0), Point3::new(99, 99, 0)))
        );
    }

    #[tokio::test]
    async fn test_datasets_json_listing() {
        let store = Arc::new(MemoryKvStore::new());
        let datastore = Datastore::new(store, registry());
        let (root, _) = datastore.new_dataset().await.unwrap();
        datastore
            .new_data(&root.simple().to_string(), "em", "uint8", DataOptions::default())
            .await
            .unwrap();
        let json = datastore.datasets_json().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["data"][0]["name"], "em");
        assert_eq!(parsed[0]["versions"], 1);
    }
}
