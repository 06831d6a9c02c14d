//! Running extents bookkeeping for a data instance
//!
//! Point and block-index extents are kept under independent locks and may be
//! observed mutually inconsistent for the duration of a write. They are hints
//! for iteration bounds, not a read-correctness invariant.

use crate::types::Point3;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Serializable extents state, embedded in data instance metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentsSnapshot {
    /// Min/max voxel coordinate observed, if any write has landed
    pub points: Option<(Point3, Point3)>,
    /// Min/max block coordinate observed, if any write has landed
    pub indices: Option<(Point3, Point3)>,
}

/// Concurrency-safe running min/max of voxel and block-index coordinates
#[derive(Debug, Default)]
pub struct Extents {
    points: Mutex<Option<(Point3, Point3)>>,
    indices: Mutex<Option<(Point3, Point3)>>,
}

fn widen(bounds: &mut Option<(Point3, Point3)>, begin: Point3, end: Point3) -> bool {
    match bounds {
        None => {
            *bounds = Some((begin, end));
            true
        }
        Some((min, max)) => {
            let new_min = (*min).min(begin);
            let new_max = (*max).max(end);
            let changed = new_min != *min || new_max != *max;
            *min = new_min;
            *max = new_max;
            changed
        }
    }
}

impl Extents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a written voxel range into the point extents.
    ///
    /// Returns true iff at least one bound was strictly extended.
    pub fn adjust_points(&self, begin: Point3, end: Point3) -> bool {
        widen(&mut self.points.lock(), begin, end)
    }

    /// Fold a written block coordinate range into the index extents.
    ///
    /// Returns true iff at least one bound was strictly extended.
    pub fn adjust_indices(&self, first: Point3, last: Point3) -> bool {
        widen(&mut self.indices.lock(), first, last)
    }

    /// Min/max voxel coordinate observed so far
    pub fn points(&self) -> Option<(Point3, Point3)> {
        *self.points.lock()
    }

    /// Min/max block coordinate observed so far
    pub fn indices(&self) -> Option<(Point3, Point3)> {
        *self.indices.lock()
    }

    /// Copy the current state for persistence
    pub fn snapshot(&self) -> ExtentsSnapshot {
        ExtentsSnapshot {
            points: self.points(),
            indices: self.indices(),
        }
    }

    /// Rebuild extents from a persisted snapshot
    pub fn restore(snapshot: ExtentsSnapshot) -> Self {
        Self {
            points: Mutex::new(snapshot.points),
            indices: Mutex::new(snapshot.indices),
        }
    }
}
