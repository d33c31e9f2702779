//! Physical and logical volumes.

use crate::segment::{Area, Segment};
use lvx_alloc::ExtentMap;
use lvx_error::{LvxError, Result};
use lvx_types::{AllocPolicy, LvId, LvStatus, PvId};
use serde::{Deserialize, Serialize};

/// A backing block device contributing extents to a volume group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalVolume {
    pub(crate) id: PvId,
    /// Device name as handed out by the naming layer (e.g. `/dev/sdb`).
    pub(crate) name: String,
    pub(crate) extents: ExtentMap,
    /// Whether new allocations may draw from this device.
    pub allocatable: bool,
}

impl PhysicalVolume {
    #[must_use]
    pub fn id(&self) -> PvId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn pe_count(&self) -> u32 {
        self.extents.pe_count()
    }

    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.extents.free_count()
    }

    #[must_use]
    pub fn extents(&self) -> &ExtentMap {
        &self.extents
    }
}

/// A logical volume: an ordered, gapless list of segments covering
/// `[0, le_count)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolume {
    pub(crate) id: LvId,
    pub(crate) name: String,
    pub status: LvStatus,
    pub alloc: AllocPolicy,
    pub(crate) segments: Vec<Segment>,
}

impl LogicalVolume {
    #[must_use]
    pub fn id(&self) -> LvId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Total logical extents covered.
    #[must_use]
    pub fn le_count(&self) -> u32 {
        self.segments.last().map_or(0, Segment::le_end)
    }

    /// Index of the segment containing logical extent `le`.
    #[must_use]
    pub fn segment_index_by_le(&self, le: u32) -> Option<usize> {
        let idx = self.segments.partition_point(|seg| seg.le_end() <= le);
        self.segments
            .get(idx)
            .filter(|seg| seg.contains_le(le))
            .map(|_| idx)
    }

    /// The segment containing logical extent `le`.
    #[must_use]
    pub fn find_segment_by_le(&self, le: u32) -> Option<&Segment> {
        self.segment_index_by_le(le).map(|idx| &self.segments[idx])
    }

    /// Whether any area of this volume stacks on `lv`.
    #[must_use]
    pub fn references_lv(&self, lv: LvId) -> bool {
        self.areas().any(|(_, area)| area.is_on_lv(lv))
    }

    /// Whether any area of this volume maps extents on `pv`.
    #[must_use]
    pub fn uses_pv(&self, pv: PvId) -> bool {
        self.areas().any(|(_, area)| area.is_on_pv(pv))
    }

    /// Every `(segment, area)` pair in logical order.
    pub fn areas(&self) -> impl Iterator<Item = (&Segment, &Area)> {
        self.segments
            .iter()
            .flat_map(|seg| seg.areas.iter().map(move |area| (seg, area)))
    }

    /// Check that segments cover `[0, le_count)` in order with no gap or overlap.
    pub fn check_contiguity(&self) -> Result<()> {
        let mut expected = 0u32;
        for seg in &self.segments {
            if seg.le != expected {
                return Err(LvxError::InconsistentState {
                    lv: self.name.clone(),
                    detail: format!("segment starts at LE {} but {expected} expected", seg.le),
                });
            }
            if seg.len == 0 || seg.areas.is_empty() {
                return Err(LvxError::InconsistentState {
                    lv: self.name.clone(),
                    detail: format!("empty segment at LE {}", seg.le),
                });
            }
            if seg.copied_extents > seg.len {
                return Err(LvxError::InconsistentState {
                    lv: self.name.clone(),
                    detail: format!(
                        "segment at LE {} claims {} of {} extents copied",
                        seg.le, seg.copied_extents, seg.len
                    ),
                });
            }
            expected = seg.le_end();
        }
        Ok(())
    }
}
