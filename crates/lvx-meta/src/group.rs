//! The volume group arena and its mutators.
//!
//! Every PV and LV lives in one of two maps keyed by stable handles. Areas
//! refer to their targets by handle, so the LV ↔ segment ↔ area graph can be
//! traversed in both directions without owning cycles.

use crate::segment::{Area, Segment};
use crate::volume::{LogicalVolume, PhysicalVolume};
use lvx_alloc::{AreaRequest, Candidate, ExtentMap, PvArea, plan_areas};
use lvx_error::{LvxError, Result};
use lvx_extent::stripe_multiplier;
use lvx_types::{AllocPolicy, LvId, LvStatus, PvId, SegmentType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// Shape and placement of a segment to append with [`VolumeGroup::extend`].
#[derive(Debug, Clone)]
pub struct ExtendRequest {
    pub segtype: SegmentType,
    /// Total areas of the new segment, including `preassigned` ones.
    pub area_count: u32,
    /// Logical extents to add.
    pub len: u32,
    /// Leading areas whose extents are already owned elsewhere in the group
    /// and move to the new segment rather than being allocated.
    pub preassigned: Vec<Area>,
    /// PVs to allocate the remaining areas from, in preference order.
    pub candidates: Vec<PvId>,
    pub policy: AllocPolicy,
    /// Status bits for the new segment.
    pub status: LvStatus,
}

impl ExtendRequest {
    /// A plain linear segment of `len` extents.
    #[must_use]
    pub fn linear(len: u32, candidates: Vec<PvId>) -> Self {
        Self::striped(1, len, candidates)
    }

    /// A striped segment of `len` extents spread over `stripes` areas.
    #[must_use]
    pub fn striped(stripes: u32, len: u32, candidates: Vec<PvId>) -> Self {
        Self {
            segtype: SegmentType::Striped,
            area_count: stripes,
            len,
            preassigned: Vec::new(),
            candidates,
            policy: AllocPolicy::Normal,
            status: LvStatus::EMPTY,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: AllocPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroup {
    name: String,
    /// Extent size in 512-byte sectors.
    extent_size: u64,
    pvs: BTreeMap<PvId, PhysicalVolume>,
    lvs: BTreeMap<LvId, LogicalVolume>,
    next_pv: u32,
    next_lv: u32,
}

impl VolumeGroup {
    #[must_use]
    pub fn new(name: impl Into<String>, extent_size: u64) -> Self {
        Self {
            name: name.into(),
            extent_size,
            pvs: BTreeMap::new(),
            lvs: BTreeMap::new(),
            next_pv: 1,
            next_lv: 1,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn extent_size(&self) -> u64 {
        self.extent_size
    }

    // ── Arena access ────────────────────────────────────────────────────────

    /// Register a device of `pe_count` free extents.
    pub fn add_pv(&mut self, name: impl Into<String>, pe_count: u32) -> Result<PvId> {
        let name = name.into();
        if self.pv_by_name(&name).is_some() {
            return Err(LvxError::InvalidArgument(format!(
                "PV {name} already in volume group {}",
                self.name
            )));
        }
        let id = PvId(self.next_pv);
        self.next_pv = self.next_pv.saturating_add(1);
        self.pvs.insert(
            id,
            PhysicalVolume {
                id,
                name,
                extents: ExtentMap::new(pe_count),
                allocatable: true,
            },
        );
        Ok(id)
    }

    /// Create an empty logical volume.
    pub fn create_lv(&mut self, name: impl Into<String>, status: LvStatus) -> Result<LvId> {
        let name = name.into();
        if self.lv_by_name(&name).is_some() {
            return Err(LvxError::InvalidArgument(format!(
                "LV {name} already exists in volume group {}",
                self.name
            )));
        }
        let id = LvId(self.next_lv);
        self.next_lv = self.next_lv.saturating_add(1);
        self.lvs.insert(
            id,
            LogicalVolume {
                id,
                name,
                status,
                alloc: AllocPolicy::Normal,
                segments: Vec::new(),
            },
        );
        Ok(id)
    }

    #[must_use]
    pub fn pv(&self, id: PvId) -> Option<&PhysicalVolume> {
        self.pvs.get(&id)
    }

    pub fn pv_mut(&mut self, id: PvId) -> Option<&mut PhysicalVolume> {
        self.pvs.get_mut(&id)
    }

    #[must_use]
    pub fn lv(&self, id: LvId) -> Option<&LogicalVolume> {
        self.lvs.get(&id)
    }

    /// Mutable access to an LV's name-independent attributes (status, policy).
    ///
    /// Segments stay reachable only through the group's mutators.
    pub fn lv_mut(&mut self, id: LvId) -> Option<&mut LogicalVolume> {
        self.lvs.get_mut(&id)
    }

    #[must_use]
    pub fn pv_by_name(&self, name: &str) -> Option<&PhysicalVolume> {
        self.pvs.values().find(|pv| pv.name == name)
    }

    #[must_use]
    pub fn lv_by_name(&self, name: &str) -> Option<&LogicalVolume> {
        self.lvs.values().find(|lv| lv.name == name)
    }

    pub fn pvs(&self) -> impl Iterator<Item = &PhysicalVolume> {
        self.pvs.values()
    }

    pub fn lvs(&self) -> impl Iterator<Item = &LogicalVolume> {
        self.lvs.values()
    }

    #[must_use]
    pub fn lv_ids(&self) -> Vec<LvId> {
        self.lvs.keys().copied().collect()
    }

    /// `vg/lv` display name, or the bare handle if the LV is gone.
    #[must_use]
    pub fn lv_display(&self, id: LvId) -> String {
        self.lvs
            .get(&id)
            .map_or_else(|| format!("{}/{id}", self.name), |lv| format!("{}/{}", self.name, lv.name))
    }

    fn lv_ref(&self, id: LvId) -> Result<&LogicalVolume> {
        self.lvs
            .get(&id)
            .ok_or_else(|| LvxError::NotFound(format!("{}/{id}", self.name)))
    }

    fn lv_ref_mut(&mut self, id: LvId) -> Result<&mut LogicalVolume> {
        let vg = &self.name;
        self.lvs
            .get_mut(&id)
            .ok_or_else(|| LvxError::NotFound(format!("{vg}/{id}")))
    }

    // ── Mutators ────────────────────────────────────────────────────────────

    /// Split the segment of `lv` containing `at_le` so a boundary falls there.
    ///
    /// Succeeds trivially when `at_le` already is a boundary (including the
    /// volume's end).
    pub fn split_segment(&mut self, lv: LvId, at_le: u32) -> Result<()> {
        let vol = self.lv_ref_mut(lv)?;
        if at_le == vol.le_count() {
            return Ok(());
        }
        let Some(idx) = vol.segment_index_by_le(at_le) else {
            return Err(LvxError::Allocation(format!(
                "LE {at_le} beyond end of {} ({} extents)",
                vol.name,
                vol.le_count()
            )));
        };
        if let Some(tail) = vol.segments[idx].split_at(at_le)? {
            trace!(
                target: "lvx::meta",
                event = "segment_split",
                lv = %vol.name,
                at_le,
                head_len = vol.segments[idx].len,
                tail_len = tail.len
            );
            vol.segments.insert(idx + 1, tail);
        }
        Ok(())
    }

    /// Append a segment to `lv`, allocating its non-preassigned areas.
    ///
    /// Returns the first logical extent of the new segment.
    pub fn extend(&mut self, lv: LvId, req: &ExtendRequest) -> Result<u32> {
        if req.len == 0 {
            return Err(LvxError::InvalidArgument("cannot extend by 0 extents".into()));
        }
        let preassigned = u32::try_from(req.preassigned.len())
            .map_err(|_| LvxError::Allocation("too many preassigned areas".into()))?;
        if req.area_count == 0 || preassigned > req.area_count {
            return Err(LvxError::Allocation(format!(
                "{} segment needs between {preassigned} and {} areas",
                req.segtype, req.area_count
            )));
        }
        let multiplier = stripe_multiplier(req.segtype, req.area_count);
        if req.len % multiplier != 0 {
            return Err(LvxError::Allocation(format!(
                "{} extents do not divide into {} stripes",
                req.len, req.area_count
            )));
        }
        let area_len = req.len / multiplier;

        let vol = self.lv_ref(lv)?;
        let start_le = vol.le_count();
        if start_le.checked_add(req.len).is_none() {
            return Err(LvxError::Allocation(format!(
                "{} cannot grow past {start_le} extents",
                vol.name
            )));
        }
        let previous = self.previous_pv_areas(vol, req.area_count, preassigned);
        for area in &req.preassigned {
            self.check_preassigned(area, area_len)?;
        }

        let mut candidates = Vec::with_capacity(req.candidates.len());
        for id in &req.candidates {
            let pv = self
                .pvs
                .get(id)
                .ok_or_else(|| LvxError::NotFound(format!("{}/{id}", self.name)))?;
            if pv.allocatable {
                candidates.push(Candidate {
                    pv: *id,
                    map: &pv.extents,
                });
            }
        }
        let placed = plan_areas(
            &candidates,
            &AreaRequest {
                count: req.area_count - preassigned,
                area_len,
                policy: req.policy,
                previous,
                avoid: req.preassigned.iter().filter_map(|a| a.pv().map(|(pv, _)| pv)).collect(),
            },
        )?;

        for area in &placed {
            if let Some(pv) = self.pvs.get_mut(&area.pv) {
                pv.extents.mark_used(area.pe, area.len)?;
            }
        }

        let mut areas = req.preassigned.clone();
        areas.extend(placed.iter().map(|a| Area::Pv { pv: a.pv, pe: a.pe }));
        let segment = Segment::new(start_le, req.segtype, area_len, areas, req.status)?;

        let vg_name = self.name.clone();
        let vol = self.lv_ref_mut(lv)?;
        debug!(
            target: "lvx::meta",
            event = "lv_extended",
            vg = %vg_name,
            lv = %vol.name,
            segtype = %req.segtype,
            start_le,
            len = req.len,
            area_count = req.area_count,
            policy = %req.policy
        );
        vol.segments.push(segment);
        Ok(start_le)
    }

    /// PV areas of the last segment, aligned with the areas to be allocated.
    fn previous_pv_areas(&self, vol: &LogicalVolume, area_count: u32, skip: u32) -> Vec<PvArea> {
        let Some(last) = vol.segments.last() else {
            return Vec::new();
        };
        if last.area_count() != area_count {
            return Vec::new();
        }
        last.areas
            .iter()
            .skip(skip as usize)
            .filter_map(Area::pv)
            .map(|(pv, pe)| PvArea {
                pv,
                pe,
                len: last.area_len,
            })
            .collect()
    }

    fn check_preassigned(&self, area: &Area, area_len: u32) -> Result<()> {
        match *area {
            Area::Pv { pv, pe } => {
                let dev = self
                    .pvs
                    .get(&pv)
                    .ok_or_else(|| LvxError::NotFound(format!("{}/{pv}", self.name)))?;
                let owned = pe
                    .checked_add(area_len)
                    .is_some_and(|end| end <= dev.pe_count() && (pe..end).all(|p| dev.extents.is_used(p)));
                if !owned {
                    return Err(LvxError::Allocation(format!(
                        "preassigned extents {}:{pe}+{area_len} are not allocated",
                        dev.name
                    )));
                }
            }
            Area::Lv { lv, le } => {
                let target = self.lv_ref(lv)?;
                if le.checked_add(area_len).is_none_or(|end| end > target.le_count()) {
                    return Err(LvxError::Allocation(format!(
                        "preassigned area {}:{le}+{area_len} past end of volume",
                        target.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Coalesce neighbouring segments of `lv` that continue each other.
    ///
    /// Best-effort: a pair that cannot be merged is logged and skipped.
    /// Returns the number of merges performed.
    pub fn merge_adjacent_segments(&mut self, lv: LvId) -> usize {
        let Some(vol) = self.lvs.get_mut(&lv) else {
            warn!(target: "lvx::meta", event = "merge_missing_lv", lv = lv.0);
            return 0;
        };
        let segments = std::mem::take(&mut vol.segments);
        let mut merged = 0usize;
        let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
        for seg in segments {
            if let Some(last) = out.last_mut() {
                match last.try_merge(&seg) {
                    Ok(true) => {
                        merged += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(
                            target: "lvx::meta",
                            event = "merge_failed",
                            lv = %vol.name,
                            le = seg.le,
                            error = %err
                        );
                    }
                }
            }
            out.push(seg);
        }
        vol.segments = out;
        if merged > 0 {
            trace!(
                target: "lvx::meta",
                event = "segments_merged",
                lv = %vol.name,
                merged,
                remaining = vol.segments.len()
            );
        }
        merged
    }

    /// Point area `area_index` of the segment of `lv` starting at `seg_le`
    /// at `target`.
    ///
    /// The caller guarantees extent ownership; this only checks that the
    /// target exists and is long enough.
    pub fn set_area_target(
        &mut self,
        lv: LvId,
        seg_le: u32,
        area_index: usize,
        target: Area,
    ) -> Result<()> {
        let (area_len, owner) = {
            let vol = self.lv_ref(lv)?;
            let seg = vol
                .segments
                .iter()
                .find(|seg| seg.le == seg_le)
                .ok_or_else(|| {
                    LvxError::NotFound(format!("segment at LE {seg_le} of {}", vol.name))
                })?;
            if area_index >= seg.areas.len() {
                return Err(LvxError::Allocation(format!(
                    "segment at LE {seg_le} of {} has no area {area_index}",
                    vol.name
                )));
            }
            (seg.area_len, vol.name.clone())
        };

        let fits = match target {
            Area::Pv { pv, pe } => {
                let dev = self
                    .pvs
                    .get(&pv)
                    .ok_or_else(|| LvxError::NotFound(format!("{}/{pv}", self.name)))?;
                pe.checked_add(area_len).is_some_and(|end| end <= dev.pe_count())
            }
            Area::Lv { lv: target_lv, le } => {
                if target_lv == lv {
                    return Err(LvxError::Allocation(format!(
                        "{owner} cannot stack on itself"
                    )));
                }
                let t = self.lv_ref(target_lv)?;
                le.checked_add(area_len).is_some_and(|end| end <= t.le_count())
            }
        };
        if !fits {
            return Err(LvxError::Allocation(format!(
                "target {target:?} cannot hold {area_len} extents for {owner}"
            )));
        }

        let vol = self.lv_ref_mut(lv)?;
        if let Some(seg) = vol.segments.iter_mut().find(|seg| seg.le == seg_le) {
            trace!(
                target: "lvx::meta",
                event = "area_retargeted",
                lv = %vol.name,
                seg_le,
                area_index,
                from = ?seg.areas[area_index],
                to = ?target
            );
            seg.areas[area_index] = target;
        }
        Ok(())
    }

    /// Raise the copied-extent counter of the mirrored segment of `lv`
    /// starting at `seg_le`. Lower values are ignored; values past the
    /// segment length are clamped. Returns the resulting counter.
    pub fn record_copied_extents(&mut self, lv: LvId, seg_le: u32, copied: u32) -> Result<u32> {
        let vol = self.lv_ref_mut(lv)?;
        let seg = vol
            .segments
            .iter_mut()
            .find(|seg| seg.le == seg_le)
            .ok_or_else(|| LvxError::NotFound(format!("segment at LE {seg_le} of {}", vol.name)))?;
        if !seg.is_mirrored() {
            return Err(LvxError::InvalidArgument(format!(
                "segment at LE {seg_le} of {} is not mirrored",
                vol.name
            )));
        }
        seg.copied_extents = seg.copied_extents.max(copied.min(seg.len));
        Ok(seg.copied_extents)
    }

    /// Demote the mirrored segment of `lv` starting at `seg_le` to a plain
    /// segment keeping leg `keep`.
    pub fn demote_mirror_segment(&mut self, lv: LvId, seg_le: u32, keep: usize) -> Result<Area> {
        let vol = self.lv_ref_mut(lv)?;
        let seg = vol
            .segments
            .iter_mut()
            .find(|seg| seg.le == seg_le)
            .ok_or_else(|| LvxError::NotFound(format!("segment at LE {seg_le} of {}", vol.name)))?;
        seg.demote_to_leg(keep)
    }

    /// Delete `lv`, returning every physical extent it still maps to the free
    /// pool. Refused while another volume stacks on it.
    pub fn remove_lv(&mut self, lv: LvId) -> Result<()> {
        let name = self.lv_ref(lv)?.name.clone();
        if let Some(user) = self.lvs.values().find(|other| other.id != lv && other.references_lv(lv)) {
            return Err(LvxError::InvalidArgument(format!(
                "{name} is still referenced by {}",
                user.name
            )));
        }
        let Some(vol) = self.lvs.remove(&lv) else {
            return Ok(());
        };
        let mut freed = 0u32;
        for (seg, area) in vol.areas() {
            if let Some((pv, pe)) = area.pv() {
                match self.pvs.get_mut(&pv) {
                    Some(dev) => {
                        if let Err(err) = dev.extents.mark_free(pe, seg.area_len) {
                            warn!(
                                target: "lvx::meta",
                                event = "free_extents_failed",
                                lv = %name,
                                pv = %dev.name,
                                pe,
                                len = seg.area_len,
                                error = %err
                            );
                        } else {
                            freed += seg.area_len;
                        }
                    }
                    None => warn!(target: "lvx::meta", event = "free_missing_pv", lv = %name, pv = pv.0),
                }
            }
        }
        debug!(target: "lvx::meta", event = "lv_removed", lv = %name, freed);
        Ok(())
    }

    // ── Consistency ─────────────────────────────────────────────────────────

    /// Check the whole group: every LV is gapless, every area target exists
    /// and is long enough, and every allocated PV extent is mapped by exactly
    /// one PV-backed area.
    pub fn verify(&self) -> Result<()> {
        let mut owners: BTreeMap<PvId, Vec<u8>> = self
            .pvs
            .iter()
            .map(|(id, pv)| (*id, vec![0_u8; pv.pe_count() as usize]))
            .collect();

        for vol in self.lvs.values() {
            vol.check_contiguity()?;
            for (seg, area) in vol.areas() {
                let inconsistent = |detail: String| LvxError::InconsistentState {
                    lv: vol.name.clone(),
                    detail,
                };
                match *area {
                    Area::Pv { pv, pe } => {
                        let map = owners
                            .get_mut(&pv)
                            .ok_or_else(|| inconsistent(format!("unknown {pv}")))?;
                        let end = pe as usize + seg.area_len as usize;
                        if end > map.len() {
                            return Err(inconsistent(format!("{pv} extents {pe}+{} past end", seg.area_len)));
                        }
                        for slot in &mut map[pe as usize..end] {
                            *slot += 1;
                            if *slot > 1 {
                                return Err(inconsistent(format!("{pv} extent mapped twice near {pe}")));
                            }
                        }
                    }
                    Area::Lv { lv, le } => {
                        let target = self
                            .lvs
                            .get(&lv)
                            .ok_or_else(|| inconsistent(format!("area targets missing {lv}")))?;
                        if u64::from(le) + u64::from(seg.area_len) > u64::from(target.le_count()) {
                            return Err(inconsistent(format!(
                                "area at LE {} overruns {}",
                                seg.le, target.name
                            )));
                        }
                    }
                }
            }
        }

        for (id, counts) in &owners {
            let Some(pv) = self.pvs.get(id) else { continue };
            for (pe, count) in counts.iter().enumerate() {
                let pe = u32::try_from(pe).unwrap_or(u32::MAX);
                if (*count == 1) != pv.extents.is_used(pe) {
                    return Err(LvxError::InconsistentState {
                        lv: self.name.clone(),
                        detail: format!("{} extent {pe} accounting mismatch", pv.name),
                    });
                }
            }
        }
        Ok(())
    }
}
