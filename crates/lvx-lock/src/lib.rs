#![forbid(unsafe_code)]
//! Resource lock manager.
//!
//! A [`LockManager`] guards volume-group and logical-volume names through one
//! of three backends chosen at start-up: [`NoLocking`], host-local
//! [`FileLocking`], or [`ExternalLocking`] delegating to a shared
//! [`LockCoordinator`]. All process-level state (backend, held-lock count,
//! saved signal mask) lives in the manager value rather than in statics.

mod backend;
mod config;
mod external;
mod file;
mod manager;
mod request;
mod signals;

pub use backend::{LockBackend, NoLocking};
pub use config::{DEFAULT_EXTERNAL_TIMEOUT_MS, DEFAULT_LOCKING_DIR, LockingConfig, LockingType};
pub use external::{ExternalLocking, InProcessCoordinator, LockCoordinator, OwnerId};
pub use file::FileLocking;
pub use manager::LockManager;
pub use request::{LockRequest, LockScope, LockType, MAX_RESOURCE_LEN, truncate_resource};
pub use signals::{ProcessSignalMask, SignalMask};
