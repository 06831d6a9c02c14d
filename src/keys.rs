//! Backend key construction: local-id header plus spatial index
//!
//! Every key is `DatasetLocalId(2B BE) | DataLocalId(2B BE) |
//! VersionLocalId(2B BE) | SpatialIndex(12B)`. All keys of one
//! (dataset, data, version) triple share a 6-byte prefix, so a scan over a
//! spatial index span is one contiguous backend range.

use crate::error::{Result, VaultError};
use crate::index::{decode_index, encode_index, SPATIAL_INDEX_BYTES};
use crate::types::{DataLocalId, DatasetLocalId, Point3, VersionLocalId};
use bytes::Bytes;

/// Width of the local-id header
pub const KEY_HEADER_BYTES: usize = 6;

/// Total width of a block key
pub const BLOCK_KEY_BYTES: usize = KEY_HEADER_BYTES + SPATIAL_INDEX_BYTES;

/// Spatial index value reserved for metadata records.
///
/// Metadata keys carry `VersionLocalId = 0`, which is never allocated to a
/// version node, so the sentinel cannot collide with block data.
pub const METADATA_INDEX_SENTINEL: [u8; SPATIAL_INDEX_BYTES] = [0u8; SPATIAL_INDEX_BYTES];

/// A fully-qualified block address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockKey {
    pub dataset: DatasetLocalId,
    pub data: DataLocalId,
    pub version: VersionLocalId,
    pub coord: Point3,
}

impl BlockKey {
    pub fn new(
        dataset: DatasetLocalId,
        data: DataLocalId,
        version: VersionLocalId,
        coord: Point3,
    ) -> Self {
        Self {
            dataset,
            data,
            version,
            coord,
        }
    }

    /// Compose the backend key bytes
    pub fn encode(&self) -> [u8; BLOCK_KEY_BYTES] {
        let mut key = [0u8; BLOCK_KEY_BYTES];
        key[0..2].copy_from_slice(&self.dataset.to_be_bytes());
        key[2..4].copy_from_slice(&self.data.to_be_bytes());
        key[4..6].copy_from_slice(&self.version.to_be_bytes());
        key[6..].copy_from_slice(&encode_index(self.coord));
        key
    }

    /// Compose the backend key as shared bytes
    pub fn encode_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.encode())
    }

    /// Split backend key bytes back into header ids and block coordinate
    pub fn decode(key: &[u8]) -> Result<Self> {
        if key.len() != BLOCK_KEY_BYTES {
            return Err(VaultError::MalformedKey(format!(
                "block key must be {} bytes, got {}",
                BLOCK_KEY_BYTES,
                key.len()
            )));
        }
        Ok(Self {
            dataset: u16::from_be_bytes(key[0..2].try_into().unwrap()),
            data: u16::from_be_bytes(key[2..4].try_into().unwrap()),
            version: u16::from_be_bytes(key[4..6].try_into().unwrap()),
            coord: decode_index(&key[KEY_HEADER_BYTES..])?,
        })
    }

    /// Inclusive key pair used to scan every block between two coordinates
    pub fn range(
        dataset: DatasetLocalId,
        data: DataLocalId,
        version: VersionLocalId,
        first: Point3,
        last: Point3,
    ) -> ([u8; BLOCK_KEY_BYTES], [u8; BLOCK_KEY_BYTES]) {
        (
            Self::new(dataset, data, version, first).encode(),
            Self::new(dataset, data, version, last).encode(),
        )
    }
}

fn metadata_record_key(dataset: DatasetLocalId, data: DataLocalId) -> [u8; BLOCK_KEY_BYTES] {
    let mut key = [0u8; BLOCK_KEY_BYTES];
    key[0..2].copy_from_slice(&dataset.to_be_bytes());
    key[2..4].copy_from_slice(&data.to_be_bytes());
    // VersionLocalId 0 and the sentinel index are already zero.
    key
}

/// Key of the datastore directory record listing all dataset ids
pub fn directory_key() -> [u8; BLOCK_KEY_BYTES] {
    metadata_record_key(0, 0)
}

/// Key of a dataset's metadata blob (version DAG plus data directory)
pub fn dataset_blob_key(dataset: DatasetLocalId) -> [u8; BLOCK_KEY_BYTES] {
    metadata_record_key(dataset, 0)
}

/// Key of one data instance's metadata record (layout plus extents)
pub fn data_metadata_key(
    dataset: DatasetLocalId,
    data: DataLocalId,
) -> [u8; BLOCK_KEY_BYTES] {
    metadata_record_key(dataset, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip() {
        let key = BlockKey::new(7, 3, 12, Point3::new(-4, 9, 100));
        let decoded = BlockKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_decode_rejects_undersized() {
        assert!(matches!(
            BlockKey::decode(&[0u8; 10]),
            Err(VaultError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_shared_prefix() {
        let a = BlockKey::new(1, 2, 3, Point3::new(0, 0, 0)).encode();
        let b = BlockKey::new(1, 2, 3, Point3::new(500, -9, 41)).encode();
        assert_eq!(a[..KEY_HEADER_BYTES], b[..KEY_HEADER_BYTES]);
    }

    #[test]
    fn test_range_orders_with_index() {
        let (begin, end) = BlockKey::range(1, 1, 1, Point3::new(0, 5, 5), Point3::new(9, 5, 5));
        assert!(begin < end);
        let mid = BlockKey::new(1, 1, 1, Point3::new(4, 5, 5)).encode();
        assert!(begin <= mid && mid <= end);
    }

    #[test]
    fn test_metadata_keys_disjoint_from_blocks() {
        // Version ids for nodes start at 1, so a block key can never equal a
        // metadata key even at the all-zero coordinate encoding.
        let meta = dataset_blob_key(4);
        let block = BlockKey::new(4, 1, 1, Point3::new(i32::MIN, i32::MIN, i32::MIN)).encode();
        assert_ne!(meta, block);
        assert_eq!(directory_key(), [0u8; BLOCK_KEY_BYTES]);
        assert_ne!(data_metadata_key(4, 2), dataset_blob_key(4));
    }
}
