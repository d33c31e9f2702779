//! The backend contract and the disabled backend.

use crate::request::{LockScope, LockType};
use lvx_error::Result;

/// A lock implementation selected once per manager.
///
/// `acquire` and `release` return `Ok(false)` when the backend refuses the
/// request (the resource is held elsewhere); `Err` is reserved for failures
/// of the locking machinery itself.
pub trait LockBackend: Send {
    fn name(&self) -> &'static str;

    /// Take `resource` in `lock_type` mode. Never called with
    /// [`LockType::Unlock`]; the manager routes those to `release`.
    fn acquire(&mut self, resource: &str, scope: LockScope, lock_type: LockType) -> Result<bool>;

    fn release(&mut self, resource: &str, scope: LockScope) -> Result<bool>;

    /// Drop every lock still held. Called at most once.
    fn shutdown(&mut self);
}

/// Grants everything. Only safe when nothing else touches the metadata.
#[derive(Debug, Default)]
pub struct NoLocking;

impl LockBackend for NoLocking {
    fn name(&self) -> &'static str {
        "none"
    }

    fn acquire(&mut self, _resource: &str, _scope: LockScope, _lock_type: LockType) -> Result<bool> {
        Ok(true)
    }

    fn release(&mut self, _resource: &str, _scope: LockScope) -> Result<bool> {
        Ok(true)
    }

    fn shutdown(&mut self) {}
}
