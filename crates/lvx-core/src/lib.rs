#![forbid(unsafe_code)]
//! Volume management core: configuration and pvmove orchestration.
//!
//! [`PvmoveSession`] ties the pieces together: it takes the volume group lock
//! through a [`LockManager`], drives the migration engine over the
//! [`VolumeGroup`], and releases the lock once the mirror is collapsed.

mod config;
mod session;

pub use config::{LvxConfig, PvmoveOptions};
pub use session::PvmoveSession;

pub use lvx_error::{LvxError, Result};
pub use lvx_extent::PeRange;
pub use lvx_lock::{
    ExternalLocking, FileLocking, InProcessCoordinator, LockBackend, LockCoordinator, LockManager,
    LockRequest, LockScope, LockType, LockingConfig, LockingType, NoLocking, SignalMask,
};
pub use lvx_meta::{
    Area, ExtendRequest, LogicalVolume, PhysicalVolume, Segment, VolumeGroup,
};
pub use lvx_pvmove::{
    AllTargets, MappingExecutor, PvmoveRemoval, PvmoveState, TargetRegistry, copy_percent,
    find_pvmove_lv, find_pvmove_lv_from_pv_name, lvs_referencing, pvmove_pv_name_for_lv,
    pvmove_source_pv_name,
};
pub use lvx_types::{AllocPolicy, LvId, LvStatus, PvId, SegmentType};
