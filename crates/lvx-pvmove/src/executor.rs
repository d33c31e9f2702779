//! The execution backend contract.
//!
//! The block-remapping layer that actually activates segment tables is an
//! external collaborator. Before mutating metadata the engine only needs to
//! know whether that layer can execute a given segment type.

use lvx_error::{LvxError, Result};
use lvx_types::SegmentType;
use std::collections::BTreeMap;
use tracing::debug;

/// Answers whether a mapping of a given segment type can be executed.
pub trait MappingExecutor {
    fn target_present(&self, segtype: SegmentType) -> bool;
}

/// Executor that accepts every segment type; used when activation is off.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllTargets;

impl MappingExecutor for AllTargets {
    fn target_present(&self, _segtype: SegmentType) -> bool {
        true
    }
}

/// Target version triple as reported by the remapping layer.
pub type TargetVersion = (u32, u32, u32);

/// The set of targets a remapping layer reports as loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetRegistry {
    targets: BTreeMap<String, TargetVersion>,
}

impl TargetRegistry {
    /// Parse a target listing: one `name vMAJOR.MINOR.PATCH` per line.
    ///
    /// Blank lines are ignored. A malformed line is an `InvalidArgument`.
    pub fn from_listing(listing: &str) -> Result<Self> {
        let mut targets = BTreeMap::new();
        for (lineno, line) in listing.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(name), Some(version), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(malformed(lineno, line));
            };
            let version = parse_version(version).ok_or_else(|| malformed(lineno, line))?;
            targets.insert(name.to_owned(), version);
        }
        debug!(
            target: "lvx::pvmove",
            event = "targets_loaded",
            count = targets.len()
        );
        Ok(Self { targets })
    }

    /// Register a target by hand.
    pub fn insert(&mut self, name: impl Into<String>, version: TargetVersion) {
        self.targets.insert(name.into(), version);
    }

    #[must_use]
    pub fn version(&self, name: &str) -> Option<TargetVersion> {
        self.targets.get(name).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl MappingExecutor for TargetRegistry {
    fn target_present(&self, segtype: SegmentType) -> bool {
        self.targets.contains_key(segtype.name())
    }
}

fn malformed(lineno: usize, line: &str) -> LvxError {
    LvxError::InvalidArgument(format!(
        "target listing line {}: expected `name vX.Y.Z`, got {line:?}",
        lineno + 1
    ))
}

fn parse_version(text: &str) -> Option<TargetVersion> {
    let mut parts = text.strip_prefix('v')?.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listing() {
        let registry = TargetRegistry::from_listing(
            "striped          v1.0.0\nmirror           v1.0.1\n\nerror v1.0.0\n",
        )
        .unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.version("mirror"), Some((1, 0, 1)));
        assert!(registry.target_present(SegmentType::Mirror));
        assert!(registry.target_present(SegmentType::Striped));
    }

    #[test]
    fn missing_mirror_target() {
        let registry = TargetRegistry::from_listing("striped v1.0.0").unwrap();
        assert!(!registry.target_present(SegmentType::Mirror));
    }

    #[test]
    fn rejects_malformed_lines() {
        for bad in ["striped", "striped 1.0.0", "striped v1.0", "striped v1.0.0 extra", "x vA.B.C"] {
            assert!(
                matches!(TargetRegistry::from_listing(bad), Err(LvxError::InvalidArgument(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn all_targets_accepts_everything() {
        assert!(AllTargets.target_present(SegmentType::Mirror));
        assert!(TargetRegistry::default().is_empty());
    }
}
