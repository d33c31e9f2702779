#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of a physical volume inside its volume group's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PvId(pub u32);

/// Handle of a logical volume inside its volume group's arena.
///
/// Areas that stack on another LV store this handle; it never owns the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LvId(pub u32);

impl fmt::Display for PvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pv#{}", self.0)
    }
}

impl fmt::Display for LvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lv#{}", self.0)
    }
}

// ── Segment types ───────────────────────────────────────────────────────────

/// Mapping type of a segment, as understood by the execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentType {
    /// Linear (one area) or striped (several areas, data interleaved).
    Striped,
    /// Every area holds a full copy of the segment.
    Mirror,
}

impl SegmentType {
    /// Target name used by the execution backend.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Striped => "striped",
            Self::Mirror => "mirror",
        }
    }

    #[must_use]
    pub fn is_mirrored(self) -> bool {
        matches!(self, Self::Mirror)
    }

    #[must_use]
    pub fn is_striped(self) -> bool {
        matches!(self, Self::Striped)
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Allocation policy ───────────────────────────────────────────────────────

/// How free physical extents are chosen when a segment is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocPolicy {
    /// Each new area must start right after the matching area of the LV's
    /// last segment, on the same PV.
    Contiguous,
    /// First fit. Parallel areas prefer distinct PVs but may share one.
    #[default]
    Normal,
    /// First fit. Parallel areas must sit on distinct PVs.
    Strict,
    /// First fit with no placement restriction.
    Anywhere,
}

impl AllocPolicy {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Contiguous => "contiguous",
            Self::Normal => "normal",
            Self::Strict => "strict",
            Self::Anywhere => "anywhere",
        }
    }
}

impl fmt::Display for AllocPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Status bit-sets ─────────────────────────────────────────────────────────

/// Status bit-set carried by logical volumes and segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LvStatus(u32);

impl LvStatus {
    pub const ACTIVE: Self = Self(0x0000_0001);
    pub const READ: Self = Self(0x0000_0100);
    pub const WRITE: Self = Self(0x0000_0200);
    /// Volume is part of a running migration; other tools must leave it alone.
    pub const LOCKED: Self = Self(0x0020_0000);
    /// Temporary migration mirror (on the mirror LV and on its segments).
    pub const PVMOVE: Self = Self(0x0000_2000);

    pub const EMPTY: Self = Self(0);

    /// Flag names in export order.
    const NAMES: [(Self, &'static str); 5] = [
        (Self::ACTIVE, "ACTIVE"),
        (Self::READ, "READ"),
        (Self::WRITE, "WRITE"),
        (Self::LOCKED, "LOCKED"),
        (Self::PVMOVE, "PVMOVE"),
    ];

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for LvStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Renders as a bracketed, quoted list: `["ACTIVE", "READ"]`.
///
/// Unknown bits are appended as a hex remainder so nothing is silently lost.
impl fmt::Display for LvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = self.0;
        let mut first = true;
        f.write_str("[")?;
        for (flag, name) in Self::NAMES {
            if rest & flag.0 == 0 {
                continue;
            }
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "\"{name}\"")?;
            rest &= !flag.0;
        }
        if rest != 0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{rest:#x}")?;
        }
        f.write_str("]")
    }
}
