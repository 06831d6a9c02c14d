//! View geometry: orthogonal slices and 3d subvolumes addressed in voxel space

use crate::error::{Result, VaultError};
use crate::types::Point3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Orientation of an externally visible rectangular region.
///
/// The engine moves data for these four shapes only; anything else is
/// rejected with [`VaultError::UnsupportedShape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewShape {
    /// 2d rectangle of voxels sharing a z coordinate
    XY,
    /// 2d rectangle of voxels sharing a y coordinate
    XZ,
    /// 2d rectangle of voxels sharing an x coordinate
    YZ,
    /// 3d box of voxels
    Volume,
}

impl FromStr for ViewShape {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "xy" | "0_1" | "0,1" => Ok(ViewShape::XY),
            "xz" | "0_2" | "0,2" => Ok(ViewShape::XZ),
            "yz" | "1_2" | "1,2" => Ok(ViewShape::YZ),
            "vol" | "0_1_2" | "0,1,2" => Ok(ViewShape::Volume),
            other => Err(VaultError::UnsupportedShape(other.to_string())),
        }
    }
}

impl fmt::Display for ViewShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViewShape::XY => "XY slice",
            ViewShape::XZ => "XZ slice",
            ViewShape::YZ => "YZ slice",
            ViewShape::Volume => "3d volume",
        };
        write!(f, "{}", name)
    }
}

/// An externally visible rectangular region with its own packed buffer.
///
/// The buffer associated with a view is row-major with the first shape axis
/// fastest: x for XY and XZ slices, y for YZ slices, x for volumes. `size`
/// always carries three components; the axis a slice collapses has extent 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    shape: ViewShape,
    offset: Point3,
    size: Point3,
}

impl View {
    /// An XY slice of `width x height` voxels with upper-left voxel `offset`
    pub fn slice_xy(offset: Point3, width: u32, height: u32) -> Self {
        Self {
            shape: ViewShape::XY,
            offset,
            size: Point3::new(width as i32, height as i32, 1),
        }
    }

    /// An XZ slice of `width x depth` voxels with upper-left voxel `offset`
    pub fn slice_xz(offset: Point3, width: u32, depth: u32) -> Self {
        Self {
            shape: ViewShape::XZ,
            offset,
            size: Point3::new(width as i32, 1, depth as i32),
        }
    }

    /// A YZ slice of `width x depth` voxels with upper-left voxel `offset`.
    ///
    /// The slice's horizontal axis runs along y, the vertical along z.
    pub fn slice_yz(offset: Point3, width: u32, depth: u32) -> Self {
        Self {
            shape: ViewShape::YZ,
            offset,
            size: Point3::new(1, width as i32, depth as i32),
        }
    }

    /// A 3d subvolume of the given size with origin `offset`
    pub fn volume(offset: Point3, size_x: u32, size_y: u32, size_z: u32) -> Self {
        Self {
            shape: ViewShape::Volume,
            offset,
            size: Point3::new(size_x as i32, size_y as i32, size_z as i32),
        }
    }

    /// A view of the given shape with a 2d size mapped onto the shape axes
    pub fn slice(shape: ViewShape, offset: Point3, width: u32, height: u32) -> Result<Self> {
        match shape {
            ViewShape::XY => Ok(Self::slice_xy(offset, width, height)),
            ViewShape::XZ => Ok(Self::slice_xz(offset, width, height)),
            ViewShape::YZ => Ok(Self::slice_yz(offset, width, height)),
            ViewShape::Volume => Err(VaultError::UnsupportedShape(
                "2d size given for a 3d volume view".to_string(),
            )),
        }
    }

    pub fn shape(&self) -> ViewShape {
        self.shape
    }

    /// Voxel coordinate of the first voxel
    pub fn start(&self) -> Point3 {
        self.offset
    }

    /// Extent in each dimension (collapsed axes have extent 1)
    pub fn size(&self) -> Point3 {
        self.size
    }

    /// Voxel coordinate of the last voxel, inclusive
    pub fn end(&self) -> Point3 {
        self.offset + self.size - Point3::new(1, 1, 1)
    }

    /// Number of voxels within this view
    pub fn num_voxels(&self) -> u64 {
        self.size.num_voxels()
    }

    /// Required buffer length for this view at the given bytes-per-voxel
    pub fn buffer_len(&self, bytes_per_voxel: usize) -> usize {
        self.num_voxels() as usize * bytes_per_voxel
    }

    /// Byte offset of the given voxel within this view's packed buffer.
    ///
    /// The caller must pass a voxel inside the view.
    pub(crate) fn buffer_offset(&self, p: Point3, bytes_per_voxel: usize) -> usize {
        let local = p - self.offset;
        ((local.z as usize * self.size.y as usize + local.y as usize) * self.size.x as usize
            + local.x as usize)
            * bytes_per_voxel
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} @ offset {}", self.shape, self.size, self.offset)
    }
}
