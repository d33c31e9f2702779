#![forbid(unsafe_code)]
//! Physical-extent allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on per-PV extent bitmaps.
//! 2. **ExtentMap**: a PV's used/free state with a cached free count.
//! 3. **plan_areas**: policy-driven placement of the areas of one new
//!    segment across a set of candidate PVs.
//!
//! Planning never mutates the candidate maps. The caller applies the returned
//! placements with [`ExtentMap::mark_used`] once it has committed to them.

use lvx_error::{LvxError, Result};
use lvx_types::{AllocPolicy, PvId};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// Find `n` contiguous free bits in the first `count` bits of `bitmap`,
/// starting the search at `from`. First fit: the lowest qualifying start wins.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u32, n: u32, from: u32) -> Option<u32> {
    if n == 0 {
        return Some(from.min(count));
    }
    let mut run_start = from;
    let mut run_len = 0u32;

    for idx in from..count {
        if bitmap_get(bitmap, idx) {
            run_start = idx + 1;
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= n {
                return Some(run_start);
            }
        }
    }
    None
}

// ── Extent map ──────────────────────────────────────────────────────────────

/// Used/free state of every physical extent on one PV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentMap {
    pe_count: u32,
    used: Vec<u8>,
    free: u32,
}

impl ExtentMap {
    /// A map of `pe_count` extents, all free.
    #[must_use]
    pub fn new(pe_count: u32) -> Self {
        Self {
            pe_count,
            used: vec![0_u8; pe_count.div_ceil(8) as usize],
            free: pe_count,
        }
    }

    #[must_use]
    pub fn pe_count(&self) -> u32 {
        self.pe_count
    }

    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.free
    }

    #[must_use]
    pub fn used_count(&self) -> u32 {
        self.pe_count - self.free
    }

    #[must_use]
    pub fn is_used(&self, pe: u32) -> bool {
        bitmap_get(&self.used, pe)
    }

    /// Whether `[start, start + count)` lies on the device and is entirely free.
    #[must_use]
    pub fn is_free_run(&self, start: u32, count: u32) -> bool {
        match start.checked_add(count) {
            Some(end) if end <= self.pe_count => (start..end).all(|pe| !self.is_used(pe)),
            _ => false,
        }
    }

    /// First free run of `count` extents starting at or after `from`.
    #[must_use]
    pub fn find_free_run(&self, count: u32, from: u32) -> Option<u32> {
        if count > self.free {
            return None;
        }
        bitmap_find_contiguous(&self.used, self.pe_count, count, from)
    }

    /// Length of the longest free run on the device.
    #[must_use]
    pub fn largest_free_run(&self) -> u32 {
        let mut best = 0u32;
        let mut run = 0u32;
        for pe in 0..self.pe_count {
            if self.is_used(pe) {
                run = 0;
            } else {
                run += 1;
                best = best.max(run);
            }
        }
        best
    }

    /// Mark `[start, start + count)` as allocated.
    ///
    /// Fails without changing anything if the run leaves the device or any
    /// extent in it is already allocated.
    pub fn mark_used(&mut self, start: u32, count: u32) -> Result<()> {
        if !self.is_free_run(start, count) {
            return Err(LvxError::Allocation(format!(
                "extents {start}+{count} are not free on a device of {} extents",
                self.pe_count
            )));
        }
        for pe in start..start + count {
            bitmap_set(&mut self.used, pe);
        }
        self.free -= count;
        Ok(())
    }

    /// Return `[start, start + count)` to the free pool.
    ///
    /// Fails without changing anything if any extent in the run is not
    /// currently allocated.
    pub fn mark_free(&mut self, start: u32, count: u32) -> Result<()> {
        let in_bounds = start
            .checked_add(count)
            .is_some_and(|end| end <= self.pe_count);
        if !in_bounds || !(start..start + count).all(|pe| self.is_used(pe)) {
            return Err(LvxError::Allocation(format!(
                "extents {start}+{count} are not allocated on a device of {} extents",
                self.pe_count
            )));
        }
        for pe in start..start + count {
            bitmap_clear(&mut self.used, pe);
        }
        self.free += count;
        Ok(())
    }
}

// ── Area planning ───────────────────────────────────────────────────────────

/// A contiguous run of physical extents on one PV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PvArea {
    pub pv: PvId,
    pub pe: u32,
    pub len: u32,
}

impl PvArea {
    /// First extent past the run.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.pe + self.len
    }
}

/// A PV the allocator may draw from, in caller preference order.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub pv: PvId,
    pub map: &'a ExtentMap,
}

/// What to allocate for one new segment.
#[derive(Debug, Clone, Default)]
pub struct AreaRequest {
    /// Number of areas to place.
    pub count: u32,
    /// Physical extents per area.
    pub area_len: u32,
    pub policy: AllocPolicy,
    /// PV areas of the volume's current last segment, index-aligned with the
    /// areas being placed. Only `Contiguous` consults them.
    pub previous: Vec<PvArea>,
    /// PVs already hosting a parallel area of the same segment.
    pub avoid: Vec<PvId>,
}

/// Choose a placement for every area in `req`.
///
/// Candidates are searched in the order given. The returned areas are
/// pairwise disjoint and free in the candidate maps, which are left untouched.
pub fn plan_areas(candidates: &[Candidate<'_>], req: &AreaRequest) -> Result<Vec<PvArea>> {
    if req.count == 0 {
        return Ok(Vec::new());
    }
    if req.area_len == 0 {
        return Err(LvxError::InvalidArgument(
            "cannot allocate areas of 0 extents".into(),
        ));
    }

    // Scratch copies absorb the tentative reservations of earlier areas.
    let mut scratch: Vec<(PvId, ExtentMap)> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if scratch.iter().all(|(pv, _)| *pv != candidate.pv) {
            scratch.push((candidate.pv, candidate.map.clone()));
        }
    }

    let needed = req.area_len.saturating_mul(req.count);
    let available: u32 = scratch.iter().map(|(_, map)| map.free_count()).sum();
    if available < needed {
        debug!(
            target: "lvx::alloc",
            event = "alloc_insufficient_total",
            needed,
            available
        );
        return Err(LvxError::NoSpace { needed, available });
    }

    let mut used_pvs = req.avoid.clone();
    let mut placed = Vec::with_capacity(req.count as usize);

    for index in 0..req.count as usize {
        let area = match req.policy {
            AllocPolicy::Contiguous => match req.previous.get(index) {
                Some(prev) => place_adjacent(&scratch, prev, req.area_len),
                None => place_first_fit(&scratch, req.area_len, &[]),
            },
            AllocPolicy::Normal => place_first_fit(&scratch, req.area_len, &used_pvs)
                .or_else(|| place_first_fit(&scratch, req.area_len, &[])),
            AllocPolicy::Strict => place_first_fit(&scratch, req.area_len, &used_pvs),
            AllocPolicy::Anywhere => place_first_fit(&scratch, req.area_len, &[]),
        };

        let Some(area) = area else {
            let largest = scratch
                .iter()
                .map(|(_, map)| map.largest_free_run())
                .max()
                .unwrap_or(0);
            debug!(
                target: "lvx::alloc",
                event = "alloc_no_run",
                policy = %req.policy,
                area_index = index,
                area_len = req.area_len,
                largest
            );
            return Err(LvxError::NoSpace {
                needed: req.area_len,
                available: largest,
            });
        };

        if let Some((_, map)) = scratch.iter_mut().find(|(pv, _)| *pv == area.pv) {
            map.mark_used(area.pe, area.len)?;
        }
        trace!(
            target: "lvx::alloc",
            event = "alloc_area_planned",
            pv = area.pv.0,
            pe = area.pe,
            len = area.len
        );
        used_pvs.push(area.pv);
        placed.push(area);
    }

    Ok(placed)
}

fn place_first_fit(scratch: &[(PvId, ExtentMap)], len: u32, exclude: &[PvId]) -> Option<PvArea> {
    scratch
        .iter()
        .filter(|(pv, _)| !exclude.contains(pv))
        .find_map(|(pv, map)| {
            map.find_free_run(len, 0)
                .map(|pe| PvArea { pv: *pv, pe, len })
        })
}

fn place_adjacent(scratch: &[(PvId, ExtentMap)], prev: &PvArea, len: u32) -> Option<PvArea> {
    let (pv, map) = scratch.iter().find(|(pv, _)| *pv == prev.pv)?;
    let pe = prev.end();
    map.is_free_run(pe, len).then_some(PvArea { pv: *pv, pe, len })
}
