//! Locking configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LOCKING_DIR: &str = "/var/lock/lvm";
pub const DEFAULT_EXTERNAL_TIMEOUT_MS: u64 = 30_000;

/// Which backend a [`LockManager`](crate::LockManager) runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockingType {
    /// No locking at all.
    None,
    /// Host-local lock files.
    #[default]
    File,
    /// A coordinator shared with other processes or nodes.
    External,
}

impl LockingType {
    /// Map the classic numeric `locking_type` setting (0, 1, 2).
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::File),
            2 => Some(Self::External),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    pub locking_type: LockingType,
    /// Where the file backend keeps its lock files.
    pub locking_dir: PathBuf,
    /// Fall back to no locking, read-only, if the backend cannot start.
    pub ignore_locking_failure: bool,
    /// Block on conflicting locks instead of failing at once.
    pub wait: bool,
    pub external_timeout_ms: u64,
}

impl LockingConfig {
    #[must_use]
    pub fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external_timeout_ms)
    }
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            locking_type: LockingType::File,
            locking_dir: PathBuf::from(DEFAULT_LOCKING_DIR),
            ignore_locking_failure: false,
            wait: true,
            external_timeout_ms: DEFAULT_EXTERNAL_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_use_defaults() {
        let cfg: LockingConfig = serde_json::from_str(r#"{"locking_type": "external"}"#).unwrap();
        assert_eq!(cfg.locking_type, LockingType::External);
        assert_eq!(cfg.locking_dir, PathBuf::from("/var/lock/lvm"));
        assert!(cfg.wait);
        assert_eq!(cfg.external_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn unknown_locking_type_rejected() {
        assert!(serde_json::from_str::<LockingConfig>(r#"{"locking_type": "cluster"}"#).is_err());
        assert_eq!(LockingType::from_code(3), None);
        assert_eq!(LockingType::from_code(2), Some(LockingType::External));
    }
}
