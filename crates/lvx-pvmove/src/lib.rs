#![forbid(unsafe_code)]
//! Online migration of logical-volume data off a physical volume.
//!
//! The engine works purely on the in-memory [`VolumeGroup`]: it splits the
//! affected segments, stacks them on a temporary mirror LV, tracks the
//! copier's progress, and finally collapses each mirror onto the new or the
//! original location. Copying the data itself is left to the execution
//! backend, consulted only through [`MappingExecutor`].
//!
//! [`VolumeGroup`]: lvx_meta::VolumeGroup

mod engine;
mod executor;
mod lookup;
mod state;

pub use engine::{
    MirrorRequest, PvmoveInsert, PvmoveRemoval, abort_pvmove, copy_percent, create_pvmove_lv,
    insert_pvmove_mirrors, record_copy_progress, remove_pvmove_mirrors,
};
pub use executor::{AllTargets, MappingExecutor, TargetRegistry, TargetVersion};
pub use lookup::{
    find_pvmove_lv, find_pvmove_lv_from_pv_name, lvs_referencing, pvmove_pv_name_for_lv,
    pvmove_source_pv_name,
};
pub use state::PvmoveState;
