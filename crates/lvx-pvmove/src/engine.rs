//! Mirror insertion, progress tracking and collapse.
//!
//! A migration stacks the affected areas of an origin LV on a temporary
//! mirror LV. Each mirror segment has two legs: leg 0 is the area's existing
//! extents on the source PV, leg 1 is freshly allocated on a destination PV.
//! Once the external copier has synchronised a segment, collapsing it points
//! the origin area at leg 1; collapsing an unsynchronised segment points it
//! back at leg 0. Whichever leg is not chosen stays with the mirror LV and is
//! freed when that LV is removed.

use lvx_error::{LvxError, Result};
use lvx_extent::{PeRange, split_points_for_range, validate_ranges};
use lvx_meta::{Area, ExtendRequest, VolumeGroup};
use lvx_types::{AllocPolicy, LvId, LvStatus, PvId, SegmentType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, error, info, trace};

use crate::executor::MappingExecutor;

/// Which extents of one origin LV to shadow, and where to put the copies.
#[derive(Debug, Clone)]
pub struct MirrorRequest<'a> {
    pub lv: LvId,
    pub source_pv: PvId,
    pub ranges: &'a [PeRange],
    pub mirror_lv: LvId,
    pub candidates: &'a [PvId],
    pub policy: AllocPolicy,
}

/// Result of [`insert_pvmove_mirrors`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvmoveInsert {
    /// Physical extents now shadowed by a mirror.
    pub extents_moved: u32,
    /// Origin LVs that gained at least one mirrored area, each listed once.
    pub changed_lvs: Vec<LvId>,
}

/// Result of a collapse pass over the whole group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvmoveRemoval {
    /// LVs whose areas were redirected off the mirror.
    pub changed_lvs: Vec<LvId>,
    /// Extents that now live on the destination leg.
    pub committed_extents: u32,
    /// Extents pointed back at their original location.
    pub reverted_extents: u32,
    /// LVs skipped because their mirror segments failed validation.
    pub failed_lvs: Vec<LvId>,
}

impl PvmoveRemoval {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed_lvs.is_empty()
    }
}

// ── Insertion ───────────────────────────────────────────────────────────────

/// Shadow every area of `req.lv` on `req.source_pv` that falls inside
/// `req.ranges` with a two-leg mirror segment appended to `req.mirror_lv`.
///
/// Segments are first split so each source area lies wholly inside or wholly
/// outside every range. Splits already made are not undone when a later step
/// fails; the extra boundaries are harmless and merge away later.
pub fn insert_pvmove_mirrors(
    vg: &mut VolumeGroup,
    executor: &dyn MappingExecutor,
    req: &MirrorRequest<'_>,
) -> Result<PvmoveInsert> {
    if !executor.target_present(SegmentType::Mirror) {
        return Err(LvxError::TargetUnavailable(
            SegmentType::Mirror.name().to_owned(),
        ));
    }
    if req.lv == req.mirror_lv {
        return Err(LvxError::InvalidArgument(format!(
            "{} cannot mirror into itself",
            vg.lv_display(req.lv)
        )));
    }
    if vg.lv(req.mirror_lv).is_none() {
        return Err(LvxError::NotFound(vg.lv_display(req.mirror_lv)));
    }
    let source = vg
        .pv(req.source_pv)
        .ok_or_else(|| LvxError::NotFound(format!("{}/{}", vg.name(), req.source_pv)))?;
    validate_ranges(req.ranges, source.pe_count())?;
    let source_name = source.name().to_owned();

    split_for_ranges(vg, req)?;

    // Snapshot the aligned areas first; retargeting does not move segments.
    let lv = vg
        .lv(req.lv)
        .ok_or_else(|| LvxError::NotFound(vg.lv_display(req.lv)))?;
    let matches: Vec<(u32, usize, u32, u32)> = lv
        .segments()
        .iter()
        .flat_map(|seg| {
            seg.areas
                .iter()
                .enumerate()
                .filter_map(move |(s, area)| match *area {
                    Area::Pv { pv, pe } if pv == req.source_pv => {
                        Some((seg.le, s, pe, seg.area_len))
                    }
                    _ => None,
                })
        })
        .filter(|&(_, _, pe, _)| req.ranges.iter().any(|range| range.contains(pe)))
        .collect();

    // The device being emptied never receives a destination leg.
    let destinations: Vec<PvId> = req
        .candidates
        .iter()
        .copied()
        .filter(|pv| *pv != req.source_pv)
        .collect();

    let mut result = PvmoveInsert::default();
    for (seg_le, area_index, pe, area_len) in matches {
        let mirror_req = ExtendRequest {
            segtype: SegmentType::Mirror,
            area_count: 2,
            len: area_len,
            preassigned: vec![Area::Pv {
                pv: req.source_pv,
                pe,
            }],
            candidates: destinations.clone(),
            policy: req.policy,
            status: LvStatus::PVMOVE,
        };
        let mirror_le = vg.extend(req.mirror_lv, &mirror_req)?;
        vg.set_area_target(
            req.lv,
            seg_le,
            area_index,
            Area::Lv {
                lv: req.mirror_lv,
                le: mirror_le,
            },
        )?;
        result.extents_moved += area_len;
        trace!(
            target: "lvx::pvmove",
            event = "pvmove_range_matched",
            lv = %vg.lv_display(req.lv),
            seg_le,
            area_index,
            source = %source_name,
            pe,
            area_len,
            mirror_le
        );
        if !result.changed_lvs.contains(&req.lv) {
            if let Some(origin) = vg.lv_mut(req.lv) {
                origin.status.insert(LvStatus::LOCKED);
            }
            result.changed_lvs.push(req.lv);
        }
    }

    info!(
        target: "lvx::pvmove",
        event = "pvmove_mirrors_inserted",
        lv = %vg.lv_display(req.lv),
        mirror = %vg.lv_display(req.mirror_lv),
        source = %source_name,
        extents_moved = result.extents_moved
    );
    Ok(result)
}

fn split_for_ranges(vg: &mut VolumeGroup, req: &MirrorRequest<'_>) -> Result<()> {
    let lv = vg
        .lv(req.lv)
        .ok_or_else(|| LvxError::NotFound(vg.lv_display(req.lv)))?;
    let mut points = BTreeSet::new();
    for seg in lv.segments() {
        for area in &seg.areas {
            let Some((pv, pe)) = area.pv() else { continue };
            if pv != req.source_pv {
                continue;
            }
            for range in req.ranges {
                points.extend(split_points_for_range(seg, pe, seg.area_len, range).iter());
            }
        }
    }
    debug!(
        target: "lvx::pvmove",
        event = "pvmove_split_plan",
        lv = %vg.lv_display(req.lv),
        splits = points.len()
    );
    for at_le in points {
        vg.split_segment(req.lv, at_le)?;
    }
    Ok(())
}

// ── Collapse ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegChoice {
    /// Destination when fully synchronised, else the original location.
    BySync,
    /// Always the original location.
    Original,
}

#[derive(Debug, Clone, Copy)]
struct CollapseStep {
    seg_le: u32,
    area_index: usize,
    mirror_le: u32,
    leg: usize,
    target: Area,
    len: u32,
}

/// Redirect every area that stacks on `mirror_lv` to one of the mirror's
/// legs, demote the mirror segments and merge the affected LVs.
///
/// A synchronised segment commits to its new location; any other segment
/// reverts to the original one. An LV whose mirror segments fail validation
/// is logged and left untouched; the rest of the group is still processed.
pub fn remove_pvmove_mirrors(vg: &mut VolumeGroup, mirror_lv: LvId) -> Result<PvmoveRemoval> {
    collapse(vg, mirror_lv, LegChoice::BySync)
}

/// Like [`remove_pvmove_mirrors`], but every area returns to its original
/// location regardless of copy progress.
pub fn abort_pvmove(vg: &mut VolumeGroup, mirror_lv: LvId) -> Result<PvmoveRemoval> {
    collapse(vg, mirror_lv, LegChoice::Original)
}

fn collapse(vg: &mut VolumeGroup, mirror_lv: LvId, choice: LegChoice) -> Result<PvmoveRemoval> {
    if vg.lv(mirror_lv).is_none() {
        return Err(LvxError::NotFound(vg.lv_display(mirror_lv)));
    }
    let mut report = PvmoveRemoval::default();

    for id in vg.lv_ids() {
        if id == mirror_lv {
            continue;
        }
        let steps = match plan_collapse(vg, id, mirror_lv, choice) {
            Ok(steps) => steps,
            Err(err) => {
                error!(
                    target: "lvx::pvmove",
                    event = "pvmove_collapse_skipped",
                    lv = %vg.lv_display(id),
                    mirror = %vg.lv_display(mirror_lv),
                    error = %err
                );
                report.failed_lvs.push(id);
                continue;
            }
        };
        if steps.is_empty() {
            continue;
        }
        if let Err(err) = apply_collapse(vg, id, mirror_lv, &steps, &mut report) {
            error!(
                target: "lvx::pvmove",
                event = "pvmove_collapse_failed",
                lv = %vg.lv_display(id),
                error = %err
            );
            report.failed_lvs.push(id);
        } else {
            report.changed_lvs.push(id);
        }
        vg.merge_adjacent_segments(id);
    }

    info!(
        target: "lvx::pvmove",
        event = "pvmove_mirrors_removed",
        mirror = %vg.lv_display(mirror_lv),
        committed = report.committed_extents,
        reverted = report.reverted_extents,
        failed = report.failed_lvs.len()
    );
    Ok(report)
}

/// Validate every area of `lv` stacked on `mirror_lv` and decide its leg.
fn plan_collapse(
    vg: &VolumeGroup,
    lv: LvId,
    mirror_lv: LvId,
    choice: LegChoice,
) -> Result<Vec<CollapseStep>> {
    let origin = vg.lv(lv).ok_or_else(|| LvxError::NotFound(vg.lv_display(lv)))?;
    let mirror = vg
        .lv(mirror_lv)
        .ok_or_else(|| LvxError::NotFound(vg.lv_display(mirror_lv)))?;
    let inconsistent = |detail: String| LvxError::InconsistentState {
        lv: vg.lv_display(lv),
        detail,
    };

    let mut steps = Vec::new();
    for seg in origin.segments() {
        for (area_index, area) in seg.areas.iter().enumerate() {
            let Some((target, mirror_le)) = area.lv() else { continue };
            if target != mirror_lv {
                continue;
            }
            let mir = mirror.find_segment_by_le(mirror_le).ok_or_else(|| {
                inconsistent(format!("no segment of {} at LE {mirror_le}", mirror.name()))
            })?;
            if !mir.is_mirrored()
                || !mir.status.contains(LvStatus::PVMOVE)
                || mir.le != mirror_le
                || mir.area_count() != 2
                || mir.area_len != seg.area_len
            {
                return Err(inconsistent(format!(
                    "segment at LE {} of {} is not a pvmove mirror matching LE {} ({} extents)",
                    mir.le,
                    mirror.name(),
                    seg.le,
                    seg.area_len
                )));
            }
            let leg = match choice {
                LegChoice::BySync if mir.copied_extents == mir.area_len => 1,
                LegChoice::BySync | LegChoice::Original => 0,
            };
            steps.push(CollapseStep {
                seg_le: seg.le,
                area_index,
                mirror_le,
                leg,
                target: mir.areas[leg],
                len: mir.area_len,
            });
        }
    }
    Ok(steps)
}

fn apply_collapse(
    vg: &mut VolumeGroup,
    lv: LvId,
    mirror_lv: LvId,
    steps: &[CollapseStep],
    report: &mut PvmoveRemoval,
) -> Result<()> {
    for step in steps {
        vg.set_area_target(lv, step.seg_le, step.area_index, step.target)?;
        vg.demote_mirror_segment(mirror_lv, step.mirror_le, 1 - step.leg)?;
        if step.leg == 1 {
            report.committed_extents += step.len;
        } else {
            report.reverted_extents += step.len;
        }
        trace!(
            target: "lvx::pvmove",
            event = "pvmove_area_collapsed",
            lv = %vg.lv_display(lv),
            seg_le = step.seg_le,
            area_index = step.area_index,
            leg = step.leg,
            len = step.len
        );
    }
    if let Some(origin) = vg.lv_mut(lv) {
        origin.status.remove(LvStatus::LOCKED);
    }
    Ok(())
}

// ── Progress ────────────────────────────────────────────────────────────────

/// Synchronised share of `mirror_lv`, in percent.
///
/// Non-mirrored segments count as fully copied. A volume with no segments
/// reports `100.0`.
pub fn copy_percent(vg: &VolumeGroup, mirror_lv: LvId) -> Result<f64> {
    let mirror = vg
        .lv(mirror_lv)
        .ok_or_else(|| LvxError::NotFound(vg.lv_display(mirror_lv)))?;
    let mut numerator = 0.0_f64;
    let mut denominator = 0.0_f64;
    for seg in mirror.segments() {
        denominator += f64::from(seg.len);
        numerator += f64::from(if seg.is_mirrored() {
            seg.copied_extents
        } else {
            seg.len
        });
    }
    if mirror.segments().is_empty() {
        return Ok(100.0);
    }
    Ok(numerator * 100.0 / denominator)
}

/// Feed the copier's progress for the mirror segment starting at `le` into
/// the model. Returns the recorded count.
pub fn record_copy_progress(
    vg: &mut VolumeGroup,
    mirror_lv: LvId,
    le: u32,
    copied: u32,
) -> Result<u32> {
    let recorded = vg.record_copied_extents(mirror_lv, le, copied)?;
    trace!(
        target: "lvx::pvmove",
        event = "pvmove_progress",
        mirror = %vg.lv_display(mirror_lv),
        le,
        copied = recorded
    );
    Ok(recorded)
}

/// Create the temporary mirror LV, named `<prefix><n>` for the first unused
/// `n`.
pub fn create_pvmove_lv(vg: &mut VolumeGroup, prefix: &str) -> Result<LvId> {
    let name = (0_u32..)
        .map(|n| format!("{prefix}{n}"))
        .find(|name| vg.lv_by_name(name).is_none())
        .ok_or_else(|| LvxError::Allocation(format!("no free {prefix}N name")))?;
    let id = vg.create_lv(name, LvStatus::PVMOVE | LvStatus::LOCKED)?;
    debug!(
        target: "lvx::pvmove",
        event = "pvmove_lv_created",
        mirror = %vg.lv_display(id)
    );
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{AllTargets, TargetRegistry};

    struct Fixture {
        vg: VolumeGroup,
        a: PvId,
        b: PvId,
        data: LvId,
        mirror: LvId,
    }

    fn fixture(len: u32) -> Fixture {
        let mut vg = VolumeGroup::new("vg0", 8192);
        let a = vg.add_pv("/dev/sda", 100).unwrap();
        let b = vg.add_pv("/dev/sdb", 100).unwrap();
        let data = vg.create_lv("data", LvStatus::ACTIVE).unwrap();
        vg.extend(data, &ExtendRequest::linear(len, vec![a])).unwrap();
        let mirror = create_pvmove_lv(&mut vg, "pvmove").unwrap();
        Fixture {
            vg,
            a,
            b,
            data,
            mirror,
        }
    }

    fn insert(f: &mut Fixture, ranges: &[PeRange]) -> Result<PvmoveInsert> {
        let candidates = [f.b];
        insert_pvmove_mirrors(
            &mut f.vg,
            &AllTargets,
            &MirrorRequest {
                lv: f.data,
                source_pv: f.a,
                ranges,
                mirror_lv: f.mirror,
                candidates: &candidates,
                policy: AllocPolicy::Normal,
            },
        )
    }

    #[test]
    fn missing_mirror_target_fails_before_mutation() {
        let mut f = fixture(100);
        let before = f.vg.clone();
        let candidates = [f.b];
        let ranges = [PeRange::new(20, 30).unwrap()];
        let err = insert_pvmove_mirrors(
            &mut f.vg,
            &TargetRegistry::from_listing("striped v1.0.0").unwrap(),
            &MirrorRequest {
                lv: f.data,
                source_pv: f.a,
                ranges: &ranges,
                mirror_lv: f.mirror,
                candidates: &candidates,
                policy: AllocPolicy::Normal,
            },
        )
        .unwrap_err();
        assert!(matches!(err, LvxError::TargetUnavailable(_)));
        assert_eq!(f.vg, before);
    }

    #[test]
    fn out_of_device_range_rejected() {
        let mut f = fixture(100);
        let err = insert(&mut f, &[PeRange::new(90, 20).unwrap()]).unwrap_err();
        assert!(matches!(err, LvxError::InvalidArgument(_)));
    }

    #[test]
    fn insert_marks_lv_locked_and_keeps_accounting() {
        let mut f = fixture(100);
        let out = insert(&mut f, &[PeRange::new(20, 30).unwrap()]).unwrap();
        assert_eq!(out.extents_moved, 30);
        assert_eq!(out.changed_lvs, vec![f.data]);
        assert!(f.vg.lv(f.data).unwrap().status.contains(LvStatus::LOCKED));
        assert_eq!(f.vg.pv(f.b).unwrap().free_count(), 70);
        f.vg.verify().unwrap();
    }

    #[test]
    fn range_missing_the_lv_changes_nothing() {
        let mut f = fixture(50);
        let out = insert(&mut f, &[PeRange::new(60, 10).unwrap()]).unwrap();
        assert_eq!(out, PvmoveInsert::default());
        assert_eq!(f.vg.lv(f.data).unwrap().segments().len(), 1);
        assert!(!f.vg.lv(f.data).unwrap().status.contains(LvStatus::LOCKED));
    }

    #[test]
    fn no_space_on_destination() {
        let mut f = fixture(100);
        let filler = f.vg.create_lv("filler", LvStatus::ACTIVE).unwrap();
        f.vg
            .extend(filler, &ExtendRequest::linear(95, vec![f.b]))
            .unwrap();
        let err = insert(&mut f, &[PeRange::new(0, 10).unwrap()]).unwrap_err();
        assert!(matches!(err, LvxError::NoSpace { .. }));
    }

    #[test]
    fn copy_percent_empty_and_partial() {
        let mut f = fixture(100);
        assert!((copy_percent(&f.vg, f.mirror).unwrap() - 100.0).abs() < f64::EPSILON);
        insert(&mut f, &[PeRange::new(0, 40).unwrap()]).unwrap();
        assert!(copy_percent(&f.vg, f.mirror).unwrap().abs() < f64::EPSILON);
        record_copy_progress(&mut f.vg, f.mirror, 0, 10).unwrap();
        assert!((copy_percent(&f.vg, f.mirror).unwrap() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn collapse_rejects_foreign_segment_type() {
        let mut f = fixture(100);
        insert(&mut f, &[PeRange::new(0, 10).unwrap()]).unwrap();
        // Turn the mirror segment into a plain one behind the engine's back.
        f.vg.demote_mirror_segment(f.mirror, 0, 0).unwrap();
        let before = f.vg.lv(f.data).unwrap().clone();
        let report = remove_pvmove_mirrors(&mut f.vg, f.mirror).unwrap();
        assert_eq!(report.failed_lvs, vec![f.data]);
        assert!(!report.is_clean());
        assert_eq!(f.vg.lv(f.data).unwrap(), &before);
    }

    #[test]
    fn pvmove_lv_names_are_unique() {
        let mut f = fixture(10);
        let second = create_pvmove_lv(&mut f.vg, "pvmove").unwrap();
        assert_eq!(f.vg.lv(f.mirror).unwrap().name(), "pvmove0");
        assert_eq!(f.vg.lv(second).unwrap().name(), "pvmove1");
        assert!(
            f.vg
                .lv(second)
                .unwrap()
                .status
                .contains(LvStatus::PVMOVE | LvStatus::LOCKED)
        );
    }
}
