//! Read-only traversals used to find and describe migrations in progress.
//!
//! Nothing here mutates the group. A lookup that simply matches nothing
//! returns `None` or an empty list; only an unresolvable input name is an
//! error.

use lvx_error::{LvxError, Result};
use lvx_meta::{Area, VolumeGroup};
use lvx_types::{LvId, LvStatus, PvId};

/// First LV carrying any bit of `status_mask` with a segment whose leading
/// area lies on `pv`.
#[must_use]
pub fn find_pvmove_lv(vg: &VolumeGroup, pv: PvId, status_mask: LvStatus) -> Option<LvId> {
    vg.lvs()
        .filter(|lv| lv.status.intersects(status_mask))
        .find(|lv| {
            lv.segments()
                .iter()
                .any(|seg| seg.areas.first().is_some_and(|area| area.is_on_pv(pv)))
        })
        .map(lvx_meta::LogicalVolume::id)
}

/// [`find_pvmove_lv`] keyed by device name.
pub fn find_pvmove_lv_from_pv_name(
    vg: &VolumeGroup,
    pv_name: &str,
    status_mask: LvStatus,
) -> Result<Option<LvId>> {
    let pv = vg
        .pv_by_name(pv_name)
        .ok_or_else(|| LvxError::NotFound(format!("physical volume {pv_name} in {}", vg.name())))?;
    Ok(find_pvmove_lv(vg, pv.id(), status_mask))
}

/// Every LV other than `lv` with at least one area stacked on `lv`, each
/// listed once.
#[must_use]
pub fn lvs_referencing(vg: &VolumeGroup, lv: LvId) -> Vec<LvId> {
    vg.lvs()
        .filter(|other| other.id() != lv && other.references_lv(lv))
        .map(lvx_meta::LogicalVolume::id)
        .collect()
}

/// Name of the source PV of a pvmove mirror: leg 0 of its first mirrored
/// segment.
#[must_use]
pub fn pvmove_source_pv_name(vg: &VolumeGroup, mirror_lv: LvId) -> Option<&str> {
    let mirror = vg.lv(mirror_lv)?;
    let seg = mirror.segments().iter().find(|seg| seg.is_mirrored())?;
    let (pv, _) = seg.areas.first()?.pv()?;
    vg.pv(pv).map(lvx_meta::PhysicalVolume::name)
}

/// Source PV name of the migration `lv` is currently part of, found through
/// its first LV-backed area.
#[must_use]
pub fn pvmove_pv_name_for_lv(vg: &VolumeGroup, lv: LvId) -> Option<&str> {
    let origin = vg.lv(lv)?;
    let mirror = origin.areas().find_map(|(_, area)| match *area {
        Area::Lv { lv: target, .. } => Some(target),
        Area::Pv { .. } => None,
    })?;
    pvmove_source_pv_name(vg, mirror)
}
