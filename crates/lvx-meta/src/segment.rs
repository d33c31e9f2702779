//! Segments and their areas.

use lvx_error::{LvxError, Result};
use lvx_extent::{SegmentShape, physical_offset_for_logical, stripe_multiplier};
use lvx_types::{LvId, LvStatus, PvId, SegmentType};
use serde::{Deserialize, Serialize};

/// One mapping target of a segment.
///
/// `Lv` is a non-owning reference: removing the referencing segment never
/// touches the target volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Area {
    /// Physical extents starting at `pe` on `pv`.
    Pv { pv: PvId, pe: u32 },
    /// Logical extents starting at `le` on another volume.
    Lv { lv: LvId, le: u32 },
}

impl Area {
    #[must_use]
    pub fn pv(&self) -> Option<(PvId, u32)> {
        match *self {
            Self::Pv { pv, pe } => Some((pv, pe)),
            Self::Lv { .. } => None,
        }
    }

    #[must_use]
    pub fn lv(&self) -> Option<(LvId, u32)> {
        match *self {
            Self::Lv { lv, le } => Some((lv, le)),
            Self::Pv { .. } => None,
        }
    }

    /// Whether this area targets physical extents on `pv`.
    #[must_use]
    pub fn is_on_pv(&self, pv: PvId) -> bool {
        matches!(*self, Self::Pv { pv: p, .. } if p == pv)
    }

    /// Whether this area stacks on `lv`.
    #[must_use]
    pub fn is_on_lv(&self, lv: LvId) -> bool {
        matches!(*self, Self::Lv { lv: l, .. } if l == lv)
    }

    /// The same target moved `delta` extents further along.
    #[must_use]
    pub fn advanced(self, delta: u32) -> Self {
        match self {
            Self::Pv { pv, pe } => Self::Pv { pv, pe: pe + delta },
            Self::Lv { lv, le } => Self::Lv { lv, le: le + delta },
        }
    }

    /// Whether `next` continues exactly where this area's `len` extents end.
    #[must_use]
    pub fn is_followed_by(&self, next: &Self, len: u32) -> bool {
        match (*self, *next) {
            (Self::Pv { pv: a, pe }, Self::Pv { pv: b, pe: next_pe }) => {
                a == b && pe.checked_add(len) == Some(next_pe)
            }
            (Self::Lv { lv: a, le }, Self::Lv { lv: b, le: next_le }) => {
                a == b && le.checked_add(len) == Some(next_le)
            }
            _ => false,
        }
    }
}

/// A contiguous run `[le, le + len)` of a volume's logical extents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub le: u32,
    pub len: u32,
    pub segtype: SegmentType,
    pub status: LvStatus,
    /// Extents each area contributes: `len / area_count` when striped, `len`
    /// when mirrored.
    pub area_len: u32,
    /// Mirror synchronisation progress, `0..=len`. Unused for striped segments.
    pub copied_extents: u32,
    pub areas: Vec<Area>,
}

impl Segment {
    /// Build a segment starting at `le` whose areas each span `area_len` extents.
    pub fn new(
        le: u32,
        segtype: SegmentType,
        area_len: u32,
        areas: Vec<Area>,
        status: LvStatus,
    ) -> Result<Self> {
        if areas.is_empty() {
            return Err(LvxError::Allocation(format!(
                "{segtype} segment at LE {le} needs at least one area"
            )));
        }
        if area_len == 0 {
            return Err(LvxError::Allocation(format!(
                "{segtype} segment at LE {le} has zero-length areas"
            )));
        }
        let area_count = u32::try_from(areas.len())
            .map_err(|_| LvxError::Allocation("too many areas".into()))?;
        let len = area_len
            .checked_mul(stripe_multiplier(segtype, area_count))
            .filter(|len| le.checked_add(*len).is_some())
            .ok_or_else(|| {
                LvxError::Allocation(format!("segment at LE {le} overflows the address space"))
            })?;
        Ok(Self {
            le,
            len,
            segtype,
            status,
            area_len,
            copied_extents: 0,
            areas,
        })
    }

    #[must_use]
    pub fn area_count(&self) -> u32 {
        u32::try_from(self.areas.len()).unwrap_or(u32::MAX)
    }

    /// First logical extent past this segment.
    #[must_use]
    pub fn le_end(&self) -> u32 {
        self.le + self.len
    }

    #[must_use]
    pub fn contains_le(&self, le: u32) -> bool {
        le >= self.le && le < self.le_end()
    }

    #[must_use]
    pub fn is_mirrored(&self) -> bool {
        self.segtype.is_mirrored()
    }

    /// Whether every extent of a mirrored segment has been synchronised.
    #[must_use]
    pub fn is_in_sync(&self) -> bool {
        self.copied_extents >= self.len
    }

    /// Split at `at_le`, keeping `[le, at_le)` here and returning the tail.
    ///
    /// Returns `Ok(None)` when `at_le` is already a boundary of this segment.
    /// Fails when `at_le` lies outside the segment or inside a stripe row.
    pub fn split_at(&mut self, at_le: u32) -> Result<Option<Self>> {
        if at_le == self.le || at_le == self.le_end() {
            return Ok(None);
        }
        if !self.contains_le(at_le) {
            return Err(LvxError::Allocation(format!(
                "LE {at_le} outside segment {}..{}",
                self.le,
                self.le_end()
            )));
        }

        let offset = at_le - self.le;
        let area_offset = physical_offset_for_logical(&*self, offset).ok_or_else(|| {
            LvxError::Allocation(format!(
                "LE {at_le} is not on a stripe boundary of the {}-way segment at LE {}",
                self.area_count(),
                self.le
            ))
        })?;

        let tail = Self {
            le: at_le,
            len: self.len - offset,
            segtype: self.segtype,
            status: self.status,
            area_len: self.area_len - area_offset,
            copied_extents: self.copied_extents.saturating_sub(offset),
            areas: self
                .areas
                .iter()
                .map(|area| area.advanced(area_offset))
                .collect(),
        };

        self.len = offset;
        self.area_len = area_offset;
        self.copied_extents = self.copied_extents.min(offset);
        Ok(Some(tail))
    }

    /// Absorb `next` if it continues this segment both logically and on every
    /// area. Returns whether the merge happened.
    ///
    /// Mirrored segments only absorb their successor once fully synchronised,
    /// so the copied counter keeps describing a prefix.
    pub fn try_merge(&mut self, next: &Self) -> Result<bool> {
        if self.segtype != next.segtype
            || self.status != next.status
            || self.areas.len() != next.areas.len()
            || self.le_end() != next.le
        {
            return Ok(false);
        }
        if self.is_mirrored() && !self.is_in_sync() {
            return Ok(false);
        }
        let contiguous = self
            .areas
            .iter()
            .zip(&next.areas)
            .all(|(a, b)| a.is_followed_by(b, self.area_len));
        if !contiguous {
            return Ok(false);
        }

        let len = self.len.checked_add(next.len);
        let area_len = self.area_len.checked_add(next.area_len);
        let (Some(len), Some(area_len)) = (len, area_len) else {
            return Err(LvxError::Allocation(format!(
                "merging segments at LE {} and {} overflows",
                self.le, next.le
            )));
        };
        self.len = len;
        self.area_len = area_len;
        self.copied_extents = self.copied_extents.saturating_add(next.copied_extents);
        Ok(true)
    }

    /// Turn a mirror into a plain single-area segment keeping leg `keep`.
    pub fn demote_to_leg(&mut self, keep: usize) -> Result<Area> {
        let Some(area) = self.areas.get(keep).copied() else {
            return Err(LvxError::Allocation(format!(
                "segment at LE {} has no leg {keep}",
                self.le
            )));
        };
        self.segtype = SegmentType::Striped;
        self.areas = vec![area];
        self.copied_extents = 0;
        self.status.remove(LvStatus::PVMOVE);
        Ok(area)
    }
}

impl SegmentShape for Segment {
    fn le(&self) -> u32 {
        self.le
    }

    fn segtype(&self) -> SegmentType {
        self.segtype
    }

    fn area_count(&self) -> u32 {
        Segment::area_count(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(le: u32, pv: u32, pe: u32, len: u32) -> Segment {
        Segment::new(
            le,
            SegmentType::Striped,
            len,
            vec![Area::Pv { pv: PvId(pv), pe }],
            LvStatus::EMPTY,
        )
        .unwrap()
    }

    #[test]
    fn split_linear_advances_area() {
        let mut seg = linear(0, 1, 0, 100);
        let tail = seg.split_at(20).unwrap().unwrap();
        assert_eq!((seg.le, seg.len, seg.area_len), (0, 20, 20));
        assert_eq!((tail.le, tail.len, tail.area_len), (20, 80, 80));
        assert_eq!(tail.areas[0], Area::Pv { pv: PvId(1), pe: 20 });
    }

    #[test]
    fn split_on_boundary_is_noop() {
        let mut seg = linear(10, 1, 0, 5);
        assert!(seg.split_at(10).unwrap().is_none());
        assert!(seg.split_at(15).unwrap().is_none());
        assert!(seg.split_at(30).is_err());
    }

    #[test]
    fn split_striped_respects_rows() {
        let mut seg = Segment::new(
            0,
            SegmentType::Striped,
            50,
            vec![
                Area::Pv { pv: PvId(1), pe: 0 },
                Area::Pv { pv: PvId(2), pe: 10 },
            ],
            LvStatus::EMPTY,
        )
        .unwrap();
        assert_eq!(seg.len, 100);
        assert!(seg.split_at(33).is_err(), "mid-row split refused");
        let tail = seg.split_at(40).unwrap().unwrap();
        assert_eq!(seg.area_len, 20);
        assert_eq!(tail.area_len, 30);
        assert_eq!(tail.areas[1], Area::Pv { pv: PvId(2), pe: 30 });
    }

    #[test]
    fn split_mirror_divides_copied_extents() {
        let mut seg = Segment::new(
            0,
            SegmentType::Mirror,
            10,
            vec![
                Area::Pv { pv: PvId(1), pe: 0 },
                Area::Pv { pv: PvId(2), pe: 0 },
            ],
            LvStatus::PVMOVE,
        )
        .unwrap();
        seg.copied_extents = 7;
        let tail = seg.split_at(4).unwrap().unwrap();
        assert_eq!(seg.copied_extents, 4);
        assert_eq!(tail.copied_extents, 3);
    }

    #[test]
    fn merge_requires_physical_contiguity() {
        let mut a = linear(0, 1, 0, 20);
        let b = linear(20, 1, 20, 30);
        assert!(a.try_merge(&b).unwrap());
        assert_eq!((a.len, a.area_len), (50, 50));

        let mut c = linear(0, 1, 0, 20);
        let gap = linear(20, 1, 21, 5);
        assert!(!c.try_merge(&gap).unwrap());
        let other_pv = linear(20, 2, 20, 5);
        assert!(!c.try_merge(&other_pv).unwrap());
    }

    #[test]
    fn unsynced_mirror_does_not_merge() {
        let legs = |pe| {
            vec![
                Area::Pv { pv: PvId(1), pe },
                Area::Pv { pv: PvId(2), pe },
            ]
        };
        let mut a = Segment::new(0, SegmentType::Mirror, 10, legs(0), LvStatus::EMPTY).unwrap();
        let b = Segment::new(10, SegmentType::Mirror, 10, legs(10), LvStatus::EMPTY).unwrap();
        assert!(!a.try_merge(&b).unwrap());
        a.copied_extents = 10;
        assert!(a.try_merge(&b).unwrap());
        assert_eq!(a.len, 20);
    }

    #[test]
    fn demote_keeps_requested_leg() {
        let mut seg = Segment::new(
            0,
            SegmentType::Mirror,
            10,
            vec![
                Area::Pv { pv: PvId(1), pe: 5 },
                Area::Pv { pv: PvId(2), pe: 0 },
            ],
            LvStatus::PVMOVE,
        )
        .unwrap();
        let kept = seg.demote_to_leg(1).unwrap();
        assert_eq!(kept, Area::Pv { pv: PvId(2), pe: 0 });
        assert_eq!(seg.segtype, SegmentType::Striped);
        assert_eq!(seg.area_count(), 1);
        assert_eq!(seg.len, 10);
        assert!(!seg.status.contains(LvStatus::PVMOVE));
        assert!(seg.demote_to_leg(3).is_err());
    }
}
