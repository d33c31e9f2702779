//! Top-level configuration.

use lvx_error::{LvxError, Result};
use lvx_lock::LockingConfig;
use lvx_types::AllocPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// How a pvmove session allocates and activates its temporary mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PvmoveOptions {
    /// Placement policy for the new mirror legs.
    pub alloc: AllocPolicy,
    /// Ask the execution backend whether mirrors can be activated. When
    /// off, every segment type is assumed available.
    pub activation: bool,
    /// Temporary mirror LVs are named `<prefix><n>`.
    pub mirror_name_prefix: String,
}

impl Default for PvmoveOptions {
    fn default() -> Self {
        Self {
            alloc: AllocPolicy::Normal,
            activation: true,
            mirror_name_prefix: "pvmove".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LvxConfig {
    pub locking: LockingConfig,
    pub pvmove: PvmoveOptions,
}

impl LvxConfig {
    /// Parse a JSON document; absent keys keep their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| LvxError::InvalidArgument(format!("configuration: {err}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        debug!(
            target: "lvx::session",
            event = "config_loaded",
            path = %path.display(),
            locking = ?config.locking.locking_type,
            alloc = %config.pvmove.alloc
        );
        Ok(config)
    }
}
