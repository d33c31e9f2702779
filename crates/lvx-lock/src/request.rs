//! Lock request vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest resource name handed to a backend, in bytes.
pub const MAX_RESOURCE_LEN: usize = 257;

/// Granularity of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    VolumeGroup,
    LogicalVolume,
}

impl LockScope {
    /// Single-letter tag used in lock file names.
    #[must_use]
    pub fn tag(self) -> char {
        match self {
            Self::VolumeGroup => 'V',
            Self::LogicalVolume => 'L',
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VolumeGroup => "vg",
            Self::LogicalVolume => "lv",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Shared,
    Exclusive,
    Unlock,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
            Self::Unlock => "unlock",
        })
    }
}

/// One call to the lock manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRequest {
    resource: String,
    pub scope: LockScope,
    pub lock_type: LockType,
    /// Keep the lock after acquiring it. Without `hold` a non-unlock request
    /// only checks that the resource is obtainable.
    pub hold: bool,
}

impl LockRequest {
    /// Build a request; `resource` is truncated to [`MAX_RESOURCE_LEN`] bytes.
    #[must_use]
    pub fn new(resource: &str, scope: LockScope, lock_type: LockType, hold: bool) -> Self {
        Self {
            resource: truncate_resource(resource).to_owned(),
            scope,
            lock_type,
            hold,
        }
    }

    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Whether the manager should release right after acquiring.
    #[must_use]
    pub fn is_probe(&self) -> bool {
        !self.hold && self.lock_type != LockType::Unlock
    }
}

/// Cut `name` to at most [`MAX_RESOURCE_LEN`] bytes on a char boundary.
#[must_use]
pub fn truncate_resource(name: &str) -> &str {
    if name.len() <= MAX_RESOURCE_LEN {
        return name;
    }
    let mut end = MAX_RESOURCE_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_names_are_truncated() {
        let long = "v".repeat(400);
        let req = LockRequest::new(&long, LockScope::VolumeGroup, LockType::Exclusive, true);
        assert_eq!(req.resource().len(), MAX_RESOURCE_LEN);
        assert_eq!(truncate_resource("vg0"), "vg0");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; 256 ASCII + 'é' straddles the limit.
        let name = format!("{}é", "a".repeat(256));
        let cut = truncate_resource(&name);
        assert_eq!(cut.len(), 256);
        assert!(cut.chars().all(|c| c == 'a'));
    }

    #[test]
    fn probe_detection() {
        assert!(LockRequest::new("vg", LockScope::VolumeGroup, LockType::Shared, false).is_probe());
        assert!(!LockRequest::new("vg", LockScope::VolumeGroup, LockType::Shared, true).is_probe());
        assert!(!LockRequest::new("vg", LockScope::VolumeGroup, LockType::Unlock, false).is_probe());
    }
}
