//! A pvmove run from lock acquisition to commit or revert.

use crate::config::PvmoveOptions;
use lvx_error::{LvxError, Result};
use lvx_extent::PeRange;
use lvx_lock::{LockManager, LockScope, LockType};
use lvx_meta::VolumeGroup;
use lvx_pvmove::{
    AllTargets, MappingExecutor, MirrorRequest, PvmoveRemoval, PvmoveState, abort_pvmove,
    copy_percent, create_pvmove_lv, insert_pvmove_mirrors, record_copy_progress,
    remove_pvmove_mirrors,
};
use lvx_types::{LvId, LvStatus, PvId};
use tracing::{error, info, warn};

/// One migration off a source PV, holding the volume group lock from
/// [`start`](Self::start) until [`complete`](Self::complete) or
/// [`abort`](Self::abort).
///
/// Dropping an unfinished session releases the lock but leaves the mirror in
/// place, so the migration can be resumed or reverted later.
#[derive(Debug)]
pub struct PvmoveSession<'a> {
    vg: &'a mut VolumeGroup,
    locks: &'a mut LockManager,
    mirror_lv: LvId,
    source_pv: PvId,
    state: PvmoveState,
    extents_moved: u32,
    changed_lvs: Vec<LvId>,
    lock_held: bool,
}

impl<'a> PvmoveSession<'a> {
    /// Lock the group and shadow the data in `ranges` of `source_pv_name`
    /// (the whole PV when `ranges` is empty) with a new mirror LV.
    ///
    /// Destination legs come from `candidate_pv_names`, or from every other
    /// allocatable PV when that list is empty. The source PV is never a
    /// destination, even when named. On failure the lock is
    /// released and any mirrors already inserted are reverted; segment
    /// splits are left in place.
    pub fn start(
        vg: &'a mut VolumeGroup,
        locks: &'a mut LockManager,
        executor: &dyn MappingExecutor,
        source_pv_name: &str,
        ranges: &[PeRange],
        candidate_pv_names: &[&str],
        options: &PvmoveOptions,
    ) -> Result<Self> {
        let source = vg.pv_by_name(source_pv_name).ok_or_else(|| {
            LvxError::NotFound(format!("physical volume {source_pv_name} in {}", vg.name()))
        })?;
        let source_pv = source.id();
        let ranges = if ranges.is_empty() {
            vec![PeRange::new(0, source.pe_count())?]
        } else {
            ranges.to_vec()
        };
        let candidates = resolve_candidates(vg, source_pv, candidate_pv_names)?;

        if locks.read_only_fallback() {
            return Err(LvxError::LockingInit(
                "locking unavailable, metadata is read-only".into(),
            ));
        }
        locks.lock_volume(vg.name(), LockScope::VolumeGroup, LockType::Exclusive, true)?;

        let executor: &dyn MappingExecutor = if options.activation {
            executor
        } else {
            &AllTargets
        };
        let mirror_lv = match create_pvmove_lv(vg, &options.mirror_name_prefix) {
            Ok(id) => id,
            Err(err) => {
                release_vg_lock(vg, locks);
                return Err(err);
            }
        };

        let mut session = Self {
            vg,
            locks,
            mirror_lv,
            source_pv,
            state: PvmoveState::Planning,
            extents_moved: 0,
            changed_lvs: Vec::new(),
            lock_held: true,
        };
        match session.insert_mirrors(executor, &ranges, &candidates, options) {
            Ok(()) => {
                session.state.advance(PvmoveState::InProgress)?;
                info!(
                    target: "lvx::session",
                    event = "pvmove_started",
                    vg = %session.vg.name(),
                    source = source_pv_name,
                    mirror = %session.vg.lv_display(mirror_lv),
                    extents = session.extents_moved,
                    lvs = session.changed_lvs.len()
                );
                Ok(session)
            }
            Err(err) => {
                error!(
                    target: "lvx::session",
                    event = "pvmove_start_failed",
                    vg = %session.vg.name(),
                    source = source_pv_name,
                    error = %err
                );
                session.unwind();
                Err(err)
            }
        }
    }

    fn insert_mirrors(
        &mut self,
        executor: &dyn MappingExecutor,
        ranges: &[PeRange],
        candidates: &[PvId],
        options: &PvmoveOptions,
    ) -> Result<()> {
        self.state.advance(PvmoveState::Splitting)?;
        let origins: Vec<LvId> = self
            .vg
            .lvs()
            .filter(|lv| lv.id() != self.mirror_lv && !lv.status.contains(LvStatus::PVMOVE))
            .filter(|lv| lv.uses_pv(self.source_pv))
            .map(lvx_meta::LogicalVolume::id)
            .collect();

        self.state.advance(PvmoveState::Mirroring)?;
        for lv in origins {
            let inserted = insert_pvmove_mirrors(
                self.vg,
                executor,
                &MirrorRequest {
                    lv,
                    source_pv: self.source_pv,
                    ranges,
                    mirror_lv: self.mirror_lv,
                    candidates,
                    policy: options.alloc,
                },
            )?;
            self.extents_moved += inserted.extents_moved;
            self.changed_lvs.extend(inserted.changed_lvs);
        }
        if self.extents_moved == 0 {
            return Err(LvxError::InvalidArgument(format!(
                "no data to move in the requested extents of {}",
                self.source_pv_name()
            )));
        }
        Ok(())
    }

    /// Revert whatever was inserted, drop the mirror and release the lock.
    fn unwind(&mut self) {
        if self.state.can_advance_to(PvmoveState::Reverting) {
            self.state = PvmoveState::Reverting;
        }
        match abort_pvmove(self.vg, self.mirror_lv) {
            Ok(report) if report.is_clean() => {
                if let Err(err) = self.vg.remove_lv(self.mirror_lv) {
                    warn!(target: "lvx::session", event = "mirror_cleanup_failed", error = %err);
                }
            }
            Ok(report) => warn!(
                target: "lvx::session",
                event = "mirror_cleanup_partial",
                failed = report.failed_lvs.len()
            ),
            Err(err) => warn!(target: "lvx::session", event = "mirror_cleanup_failed", error = %err),
        }
        self.state = PvmoveState::Done;
        self.release_lock();
    }

    #[must_use]
    pub fn state(&self) -> PvmoveState {
        self.state
    }

    #[must_use]
    pub fn mirror_lv(&self) -> LvId {
        self.mirror_lv
    }

    /// Extents shadowed by the mirror at start.
    #[must_use]
    pub fn extents_moved(&self) -> u32 {
        self.extents_moved
    }

    #[must_use]
    pub fn changed_lvs(&self) -> &[LvId] {
        &self.changed_lvs
    }

    #[must_use]
    pub fn vg(&self) -> &VolumeGroup {
        self.vg
    }

    fn source_pv_name(&self) -> String {
        self.vg
            .pv(self.source_pv)
            .map_or_else(|| self.source_pv.to_string(), |pv| pv.name().to_owned())
    }

    /// Copy progress of the mirror, in percent.
    pub fn progress(&self) -> Result<f64> {
        copy_percent(self.vg, self.mirror_lv)
    }

    /// Record that the copier finished `copied` extents of the mirror
    /// segment starting at `le`.
    pub fn record_progress(&mut self, le: u32, copied: u32) -> Result<u32> {
        self.ensure_in_progress()?;
        record_copy_progress(self.vg, self.mirror_lv, le, copied)
    }

    /// Commit every area to its new location, drop the mirror and release
    /// the lock. Refused with `MigrationIncomplete` until fully synchronised.
    pub fn complete(&mut self) -> Result<PvmoveRemoval> {
        self.ensure_in_progress()?;
        let percent = self.progress()?;
        if percent < 100.0 {
            return Err(LvxError::MigrationIncomplete {
                lv: self.vg.lv_display(self.mirror_lv),
                percent,
            });
        }
        self.state.advance(PvmoveState::Completing)?;
        let report = remove_pvmove_mirrors(self.vg, self.mirror_lv)?;
        self.finish(report)
    }

    /// Point every area back at its original location regardless of copy
    /// progress, drop the mirror and release the lock.
    pub fn abort(&mut self) -> Result<PvmoveRemoval> {
        self.ensure_in_progress()?;
        self.state.advance(PvmoveState::Reverting)?;
        let report = abort_pvmove(self.vg, self.mirror_lv)?;
        self.finish(report)
    }

    fn ensure_in_progress(&self) -> Result<()> {
        if self.state == PvmoveState::InProgress {
            Ok(())
        } else {
            Err(LvxError::InvalidArgument(format!(
                "pvmove session is {}, not in progress",
                self.state
            )))
        }
    }

    fn finish(&mut self, report: PvmoveRemoval) -> Result<PvmoveRemoval> {
        if !report.is_clean() {
            return Err(LvxError::InconsistentState {
                lv: self.vg.lv_display(self.mirror_lv),
                detail: format!(
                    "{} volume(s) still stacked on the mirror",
                    report.failed_lvs.len()
                ),
            });
        }
        self.vg.remove_lv(self.mirror_lv)?;
        self.state.advance(PvmoveState::Done)?;
        info!(
            target: "lvx::session",
            event = "pvmove_finished",
            vg = %self.vg.name(),
            committed = report.committed_extents,
            reverted = report.reverted_extents
        );
        self.release_lock();
        Ok(report)
    }

    fn release_lock(&mut self) {
        if !self.lock_held {
            return;
        }
        self.lock_held = false;
        release_vg_lock(self.vg, self.locks);
    }
}

impl Drop for PvmoveSession<'_> {
    fn drop(&mut self) {
        if self.lock_held {
            warn!(
                target: "lvx::session",
                event = "pvmove_session_dropped",
                vg = %self.vg.name(),
                state = %self.state,
                mirror = %self.vg.lv_display(self.mirror_lv)
            );
            self.release_lock();
        }
    }
}

fn release_vg_lock(vg: &VolumeGroup, locks: &mut LockManager) {
    if let Err(err) = locks.lock_volume(vg.name(), LockScope::VolumeGroup, LockType::Unlock, false)
    {
        warn!(target: "lvx::session", event = "vg_unlock_failed", vg = %vg.name(), error = %err);
    }
}

fn resolve_candidates(vg: &VolumeGroup, source: PvId, names: &[&str]) -> Result<Vec<PvId>> {
    if names.is_empty() {
        return Ok(vg
            .pvs()
            .filter(|pv| pv.id() != source && pv.allocatable)
            .map(lvx_meta::PhysicalVolume::id)
            .collect());
    }
    let mut candidates = Vec::with_capacity(names.len());
    for name in names {
        let pv = vg
            .pv_by_name(name)
            .ok_or_else(|| LvxError::NotFound(format!("physical volume {name} in {}", vg.name())))?;
        if pv.id() != source {
            candidates.push(pv.id());
        }
    }
    Ok(candidates)
}
