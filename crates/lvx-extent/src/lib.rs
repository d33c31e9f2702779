#![forbid(unsafe_code)]
//! Extent arithmetic: translating physical-extent positions on one area of a
//! segment into logical-extent positions in the owning volume.
//!
//! A striped segment of width `k` interleaves its logical extents across `k`
//! areas, so one physical extent on a single area corresponds to `k` logical
//! extents. Every other segment type maps one-to-one.
//!
//! Nothing here holds state or fails on valid input; callers guarantee that
//! the physical extent being converted actually lies inside the segment.

use lvx_error::{LvxError, Result};
use lvx_types::SegmentType;
use serde::{Deserialize, Serialize};

/// The shape of a segment as far as extent arithmetic is concerned.
pub trait SegmentShape {
    /// First logical extent the segment covers.
    fn le(&self) -> u32;
    /// Mapping type.
    fn segtype(&self) -> SegmentType;
    /// Number of areas (stripes or mirror legs).
    fn area_count(&self) -> u32;
}

/// Logical extents represented by one physical extent on a single area.
#[must_use]
pub fn stripe_multiplier(segtype: SegmentType, area_count: u32) -> u32 {
    if segtype.is_striped() {
        area_count.max(1)
    } else {
        1
    }
}

/// Logical-extent delta corresponding to `physical_delta` extents on one area.
#[must_use]
pub fn logical_offset_for_physical<S: SegmentShape + ?Sized>(seg: &S, physical_delta: u32) -> u32 {
    let multiplier = stripe_multiplier(seg.segtype(), seg.area_count());
    debug_assert!(
        physical_delta.checked_mul(multiplier).is_some(),
        "physical delta {physical_delta} overflows with multiplier {multiplier}"
    );
    physical_delta.saturating_mul(multiplier)
}

/// Physical-extent delta on one area corresponding to `logical_delta`.
///
/// Returns `None` when `logical_delta` does not fall on a stripe boundary.
#[must_use]
pub fn physical_offset_for_logical<S: SegmentShape + ?Sized>(
    seg: &S,
    logical_delta: u32,
) -> Option<u32> {
    let multiplier = stripe_multiplier(seg.segtype(), seg.area_count());
    (logical_delta % multiplier == 0).then(|| logical_delta / multiplier)
}

// ── Physical-extent ranges ──────────────────────────────────────────────────

/// A run of physical extents on one PV: `[start, start + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeRange {
    pub start: u32,
    pub count: u32,
}

impl PeRange {
    /// Create a non-empty range.
    pub fn new(start: u32, count: u32) -> Result<Self> {
        if count == 0 {
            return Err(LvxError::InvalidArgument(format!(
                "empty PE range at {start}"
            )));
        }
        if start.checked_add(count).is_none() {
            return Err(LvxError::InvalidArgument(format!(
                "PE range {start}+{count} overflows"
            )));
        }
        Ok(Self { start, count })
    }

    /// Last extent in the range (inclusive).
    #[must_use]
    pub fn end(&self) -> u32 {
        self.start + self.count.saturating_sub(1)
    }

    #[must_use]
    pub fn contains(&self, pe: u32) -> bool {
        pe >= self.start && pe <= self.end()
    }

    /// Whether the inclusive span `[pe_start, pe_end]` intersects this range.
    #[must_use]
    pub fn overlaps(&self, pe_start: u32, pe_end: u32) -> bool {
        !(pe_end < self.start || pe_start > self.end())
    }
}

/// Check a caller-supplied range set against a PV of `pe_count` extents.
///
/// Ranges must be non-empty, inside the device, and pairwise disjoint.
pub fn validate_ranges(ranges: &[PeRange], pe_count: u32) -> Result<()> {
    let mut sorted: Vec<PeRange> = ranges.to_vec();
    sorted.sort_unstable();
    for range in &sorted {
        if range.count == 0 || range.end() >= pe_count {
            return Err(LvxError::InvalidArgument(format!(
                "PE range {}-{} outside device of {pe_count} extents",
                range.start,
                range.end()
            )));
        }
    }
    for pair in sorted.windows(2) {
        if pair[1].start <= pair[0].end() {
            return Err(LvxError::InvalidArgument(format!(
                "PE ranges {}-{} and {}-{} overlap",
                pair[0].start,
                pair[0].end(),
                pair[1].start,
                pair[1].end()
            )));
        }
    }
    Ok(())
}

// ── Split planning ──────────────────────────────────────────────────────────

/// Logical positions at which a segment must be split so that one of its
/// areas lies wholly inside or wholly outside a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SplitPoints {
    /// Split where the range begins, if it begins strictly inside the area.
    pub at_range_start: Option<u32>,
    /// Split just past the range end, if it ends strictly inside the area.
    pub after_range_end: Option<u32>,
}

impl SplitPoints {
    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.at_range_start.into_iter().chain(self.after_range_end)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.at_range_start.is_none() && self.after_range_end.is_none()
    }
}

/// Compute the split points for an area spanning physical extents
/// `[pe_start, pe_start + area_len)` against `range`.
///
/// Returns no split points when the area and range are disjoint.
#[must_use]
pub fn split_points_for_range<S: SegmentShape + ?Sized>(
    seg: &S,
    pe_start: u32,
    area_len: u32,
    range: &PeRange,
) -> SplitPoints {
    if area_len == 0 {
        return SplitPoints::default();
    }
    let pe_end = pe_start + (area_len - 1);
    if !range.overlaps(pe_start, pe_end) {
        return SplitPoints::default();
    }

    let range_end = range.end();
    let at_range_start = (range.start > pe_start)
        .then(|| seg.le() + logical_offset_for_physical(seg, range.start - pe_start));
    let after_range_end = (range_end < pe_end)
        .then(|| seg.le() + logical_offset_for_physical(seg, range_end - pe_start + 1));

    SplitPoints {
        at_range_start,
        after_range_end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Shape {
        le: u32,
        segtype: SegmentType,
        area_count: u32,
    }

    impl SegmentShape for Shape {
        fn le(&self) -> u32 {
            self.le
        }
        fn segtype(&self) -> SegmentType {
            self.segtype
        }
        fn area_count(&self) -> u32 {
            self.area_count
        }
    }

    fn linear(le: u32) -> Shape {
        Shape {
            le,
            segtype: SegmentType::Striped,
            area_count: 1,
        }
    }

    #[test]
    fn striped_multiplier_scales_by_width() {
        let seg = Shape {
            le: 0,
            segtype: SegmentType::Striped,
            area_count: 3,
        };
        assert_eq!(logical_offset_for_physical(&seg, 5), 15);
        assert_eq!(physical_offset_for_logical(&seg, 15), Some(5));
        assert_eq!(physical_offset_for_logical(&seg, 16), None);
    }

    #[test]
    fn mirror_multiplier_is_one() {
        let seg = Shape {
            le: 0,
            segtype: SegmentType::Mirror,
            area_count: 2,
        };
        assert_eq!(logical_offset_for_physical(&seg, 5), 5);
        assert_eq!(physical_offset_for_logical(&seg, 7), Some(7));
    }

    #[test]
    fn range_inside_area_splits_twice() {
        // Area covers PE 0..100, range 20..50.
        let range = PeRange::new(20, 30).unwrap();
        let points = split_points_for_range(&linear(0), 0, 100, &range);
        assert_eq!(points.at_range_start, Some(20));
        assert_eq!(points.after_range_end, Some(50));
        assert_eq!(points.iter().collect::<Vec<_>>(), vec![20, 50]);
    }

    #[test]
    fn range_covering_area_needs_no_split() {
        let range = PeRange::new(10, 50).unwrap();
        let points = split_points_for_range(&linear(100), 20, 10, &range);
        assert!(points.is_empty());
    }

    #[test]
    fn range_overlapping_area_tail() {
        // Area PE 40..60 at LE 7, range 50..80.
        let range = PeRange::new(50, 30).unwrap();
        let points = split_points_for_range(&linear(7), 40, 20, &range);
        assert_eq!(points.at_range_start, Some(17));
        assert_eq!(points.after_range_end, None);
    }

    #[test]
    fn disjoint_range_is_ignored() {
        let range = PeRange::new(200, 10).unwrap();
        assert!(split_points_for_range(&linear(0), 0, 100, &range).is_empty());
        let touching = PeRange::new(100, 1).unwrap();
        assert!(split_points_for_range(&linear(0), 0, 100, &touching).is_empty());
    }

    #[test]
    fn striped_split_positions_are_scaled() {
        let seg = Shape {
            le: 0,
            segtype: SegmentType::Striped,
            area_count: 2,
        };
        // Stripe area PE 0..50 (segment LE 0..100), range 10..20.
        let range = PeRange::new(10, 10).unwrap();
        let points = split_points_for_range(&seg, 0, 50, &range);
        assert_eq!(points.at_range_start, Some(20));
        assert_eq!(points.after_range_end, Some(40));
    }

    #[test]
    fn pe_range_rejects_empty_and_overflow() {
        assert!(PeRange::new(5, 0).is_err());
        assert!(PeRange::new(u32::MAX, 2).is_err());
        let r = PeRange::new(5, 1).unwrap();
        assert_eq!(r.end(), 5);
        assert!(r.contains(5));
        assert!(!r.contains(6));
    }

    #[test]
    fn validate_ranges_detects_overlap_and_bounds() {
        let a = PeRange::new(0, 10).unwrap();
        let b = PeRange::new(10, 5).unwrap();
        let c = PeRange::new(12, 5).unwrap();
        assert!(validate_ranges(&[b, a], 100).is_ok());
        assert!(validate_ranges(&[a, b, c], 100).is_err());
        assert!(validate_ranges(&[a], 10).is_ok());
        assert!(validate_ranges(&[b], 14).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn split_points_fall_strictly_inside_segment(
            width in 1_u32..5,
            area_len in 1_u32..200,
            start in 0_u32..300,
            count in 1_u32..100,
        ) {
            let seg = Shape { le: 1000, segtype: SegmentType::Striped, area_count: width };
            let range = PeRange::new(start, count).unwrap();
            let points = split_points_for_range(&seg, 50, area_len, &range);
            let len = area_len * width;
            for le in points.iter() {
                prop_assert!(le > seg.le && le < seg.le + len);
                prop_assert_eq!((le - seg.le) % width, 0);
            }
        }
    }
}
