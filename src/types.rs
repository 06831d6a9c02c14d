//! Core data types: voxel value layouts, integer points, and local identifiers

use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, Sub};

/// Compact identifier for a dataset, embedded in every block key.
///
/// Id 0 is reserved for the datastore directory record.
pub type DatasetLocalId = u16;

/// Compact identifier for a data instance within a dataset.
///
/// Id 0 is reserved for the dataset metadata blob.
pub type DataLocalId = u16;

/// Compact identifier for a version node within a dataset.
///
/// Id 0 is reserved so metadata keys never collide with block keys.
pub type VersionLocalId = u16;

/// Scalar kinds supported for voxel values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueKind {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    U64 = 6,
    I64 = 7,
    F32 = 8,
    F64 = 9,
}

impl ValueKind {
    /// Size in bytes of a single value of this kind
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ValueKind::U8 | ValueKind::I8 => 1,
            ValueKind::U16 | ValueKind::I16 => 2,
            ValueKind::U32 | ValueKind::I32 | ValueKind::F32 => 4,
            ValueKind::U64 | ValueKind::I64 | ValueKind::F64 => 8,
        }
    }

    /// Check if this is a floating point kind
    pub fn is_float(&self) -> bool {
        matches!(self, ValueKind::F32 | ValueKind::F64)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Per-voxel value layout: a scalar kind times a channel count.
///
/// A grayscale volume is `{U8, 1}`, an RGBA volume `{U8, 4}`, a dense label
/// volume `{U64, 1}`. Immutable for the lifetime of a data instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueLayout {
    pub kind: ValueKind,
    pub count: u8,
}

impl ValueLayout {
    pub fn new(kind: ValueKind, count: u8) -> Self {
        Self { kind, count }
    }

    /// Total bytes occupied by one voxel
    pub fn bytes_per_voxel(&self) -> usize {
        self.kind.size_in_bytes() * self.count as usize
    }

    /// Allocate a zeroed block buffer for the given block dimensions
    pub fn new_block_buffer(&self, block_size: Point3) -> Vec<u8> {
        vec![0u8; self.bytes_per_voxel() * block_size.num_voxels() as usize]
    }
}

impl fmt::Display for ValueLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {}", self.kind, self.count)
    }
}

/// A 3d integer point, used both for voxel coordinates and block coordinates.
///
/// Block coordinate `c` addresses the chunk whose voxel origin is
/// `c * block_size`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Point3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Point3 {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Component-wise minimum
    pub fn min(self, other: Self) -> Self {
        Self::new(self.x.min(other.x), self.y.min(other.y), self.z.min(other.z))
    }

    /// Component-wise maximum
    pub fn max(self, other: Self) -> Self {
        Self::new(self.x.max(other.x), self.y.max(other.y), self.z.max(other.z))
    }

    /// Component-wise product interpreted as a voxel count
    pub fn num_voxels(self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// The block coordinate containing this voxel, rounding toward -inf
    pub fn block_coord(self, block_size: Point3) -> Point3 {
        Self::new(
            self.x.div_euclid(block_size.x),
            self.y.div_euclid(block_size.y),
            self.z.div_euclid(block_size.z),
        )
    }

    /// Voxel origin of the block with this block coordinate
    pub fn block_origin(self, block_size: Point3) -> Point3 {
        Self::new(
            self.x * block_size.x,
            self.y * block_size.y,
            self.z * block_size.z,
        )
    }
}

impl Add for Point3 {
    type Output = Point3;

    fn add(self, rhs: Point3) -> Point3 {
        Point3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Point3 {
    type Output = Point3;

    fn sub(self, rhs: Point3) -> Point3 {
        Point3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl fmt::Display for Point3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Default block edge length per axis
pub const DEFAULT_BLOCK_SIZE: i32 = 32;

/// Registry of named value layouts available to a datastore.
///
/// Replaces a process-global table of compiled-in types: the registry is
/// built once at datastore initialization and threaded through to data
/// instance creation.
#[derive(Debug, Clone)]
pub struct LayoutRegistry {
    layouts: HashMap<String, ValueLayout>,
}

impl LayoutRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            layouts: HashMap::new(),
        }
    }

    /// Registry pre-populated with the layouts shipped with the engine
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("uint8", ValueLayout::new(ValueKind::U8, 1));
        registry.register("uint16", ValueLayout::new(ValueKind::U16, 1));
        registry.register("uint32", ValueLayout::new(ValueKind::U32, 1));
        registry.register("uint64", ValueLayout::new(ValueKind::U64, 1));
        registry.register("rgba8", ValueLayout::new(ValueKind::U8, 4));
        registry.register("labels64", ValueLayout::new(ValueKind::U64, 1));
        registry
    }

    /// Register a layout under a type name, replacing any previous entry
    pub fn register(&mut self, name: impl Into<String>, layout: ValueLayout) {
        self.layouts.insert(name.into(), layout);
    }

    /// Look up a layout by type name
    pub fn get(&self, name: &str) -> Result<ValueLayout> {
        self.layouts.get(name).copied().ok_or_else(|| {
            VaultError::Configuration(format!("value layout '{}' is not registered", name))
        })
    }

    /// Names of all registered layouts, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.layouts.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for LayoutRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
