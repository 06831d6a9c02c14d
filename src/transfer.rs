//! Gather/scatter between external view buffers and block-local buffers
//!
//! Both buffers are row-major with x fastest. The intersection of the view
//! with one block is clamped component-wise and then copied one x-run per
//! (z, y) row; for XY and XZ slices one of the outer loops collapses to a
//! single iteration, and for YZ slices the x-run degenerates to a single
//! voxel so the copy proceeds voxel-by-voxel.

use crate::error::{Result, VaultError};
use crate::types::Point3;
use crate::view::View;

struct Overlap {
    beg: Point3,
    end: Point3,
    block_origin: Point3,
    run_bytes: usize,
}

fn clamp_to_block(view: &View, block_coord: Point3, block_size: Point3, bpv: usize) -> Option<Overlap> {
    let block_origin = block_coord.block_origin(block_size);
    let block_last = block_origin + block_size - Point3::new(1, 1, 1);
    let beg = view.start().max(block_origin);
    let end = view.end().min(block_last);
    if end.x < beg.x || end.y < beg.y || end.z < beg.z {
        return None;
    }
    Some(Overlap {
        beg,
        end,
        block_origin,
        run_bytes: (end.x - beg.x + 1) as usize * bpv,
    })
}

fn block_buffer_offset(p: Point3, block_origin: Point3, block_size: Point3, bpv: usize) -> usize {
    let local = p - block_origin;
    ((local.z as usize * block_size.y as usize + local.y as usize) * block_size.x as usize
        + local.x as usize)
        * bpv
}

fn check_lengths(
    view: &View,
    view_len: usize,
    block_len: usize,
    block_size: Point3,
    bpv: usize,
) -> Result<()> {
    let want_view = view.buffer_len(bpv);
    if view_len != want_view {
        return Err(VaultError::Configuration(format!(
            "view buffer is {} bytes, {} expects {}",
            view_len, view, want_view
        )));
    }
    let want_block = block_size.num_voxels() as usize * bpv;
    if block_len != want_block {
        return Err(VaultError::Configuration(format!(
            "block buffer is {} bytes, block size {} expects {}",
            block_len, block_size, want_block
        )));
    }
    Ok(())
}

/// Copy the intersection of `view` and the given block from the block buffer
/// into the view buffer.
pub fn read_block(
    view: &View,
    view_buf: &mut [u8],
    block_coord: Point3,
    block: &[u8],
    block_size: Point3,
    bytes_per_voxel: usize,
) -> Result<()> {
    check_lengths(view, view_buf.len(), block.len(), block_size, bytes_per_voxel)?;
    let Some(o) = clamp_to_block(view, block_coord, block_size, bytes_per_voxel) else {
        return Ok(());
    };
    for z in o.beg.z..=o.end.z {
        for y in o.beg.y..=o.end.y {
            let p = Point3::new(o.beg.x, y, z);
            let vi = view.buffer_offset(p, bytes_per_voxel);
            let bi = block_buffer_offset(p, o.block_origin, block_size, bytes_per_voxel);
            view_buf[vi..vi + o.run_bytes].copy_from_slice(&block[bi..bi + o.run_bytes]);
        }
    }
    Ok(())
}

/// Copy the intersection of `view` and the given block from the view buffer
/// into the block buffer. Bytes of the block outside the view are untouched.
pub fn write_block(
    view: &View,
    view_buf: &[u8],
    block_coord: Point3,
    block: &mut [u8],
    block_size: Point3,
    bytes_per_voxel: usize,
) -> Result<()> {
    check_lengths(view, view_buf.len(), block.len(), block_size, bytes_per_voxel)?;
    let Some(o) = clamp_to_block(view, block_coord, block_size, bytes_per_voxel) else {
        return Ok(());
    };
    for z in o.beg.z..=o.end.z {
        for y in o.beg.y..=o.end.y {
            let p = Point3::new(o.beg.x, y, z);
            let vi = view.buffer_offset(p, bytes_per_voxel);
            let bi = block_buffer_offset(p, o.block_origin, block_size, bytes_per_voxel);
            block[bi..bi + o.run_bytes].copy_from_slice(&view_buf[vi..vi + o.run_bytes]);
        }
    }
    Ok(())
}
