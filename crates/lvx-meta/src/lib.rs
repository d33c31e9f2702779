#![forbid(unsafe_code)]
//! In-memory volume group metadata.
//!
//! A [`VolumeGroup`] owns every physical and logical volume as an arena keyed
//! by [`PvId`] / [`LvId`]. Logical volumes are gapless lists of [`Segment`]s;
//! each segment maps onto one or more [`Area`]s that point either at physical
//! extents or, for stacked volumes, at another volume's logical extents.

mod group;
mod segment;
mod volume;

pub use group::{ExtendRequest, VolumeGroup};
pub use segment::{Area, Segment};
pub use volume::{LogicalVolume, PhysicalVolume};

pub use lvx_types::{AllocPolicy, LvId, LvStatus, PvId, SegmentType};
