//! The lock manager: one backend, one set of held resources, one signal mask.

use crate::backend::{LockBackend, NoLocking};
use crate::config::{LockingConfig, LockingType};
use crate::external::{ExternalLocking, LockCoordinator};
use crate::file::FileLocking;
use crate::request::{LockRequest, LockScope, LockType};
use crate::signals::{ProcessSignalMask, SignalMask};
use lvx_error::{LvxError, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Serialises metadata changes through the selected backend.
///
/// While at least one lock is held every signal is blocked, so a lock
/// transition cannot be interrupted half way. The mask is restored once the
/// last held resource is unlocked.
pub struct LockManager {
    backend: Box<dyn LockBackend>,
    mask: Box<dyn SignalMask>,
    /// Resources currently held, keyed by scope and (truncated) name.
    held: BTreeSet<(LockScope, String)>,
    signals_blocked: bool,
    read_only: bool,
    shut_down: bool,
}

impl LockManager {
    /// Start the backend named by `config`, masking the real process
    /// signals. `coordinator` is required for external locking.
    pub fn init(
        config: &LockingConfig,
        coordinator: Option<Arc<dyn LockCoordinator>>,
    ) -> Result<Self> {
        Self::init_with_mask(config, coordinator, Box::new(ProcessSignalMask::new()))
    }

    /// [`LockManager::init`] with a caller-supplied signal mask.
    pub fn init_with_mask(
        config: &LockingConfig,
        coordinator: Option<Arc<dyn LockCoordinator>>,
        mask: Box<dyn SignalMask>,
    ) -> Result<Self> {
        let backend: Result<Box<dyn LockBackend>> = match config.locking_type {
            LockingType::None => {
                warn!(
                    target: "lvx::lock",
                    event = "locking_disabled",
                    "Locking disabled. Be careful! This could corrupt your metadata."
                );
                return Ok(Self::with_backend(Box::new(NoLocking), mask));
            }
            LockingType::File => FileLocking::new(&config.locking_dir, config.wait)
                .map(|backend| Box::new(backend) as Box<dyn LockBackend>),
            LockingType::External => coordinator
                .map(|coordinator| {
                    Box::new(ExternalLocking::new(
                        coordinator,
                        config.wait,
                        config.external_timeout(),
                    )) as Box<dyn LockBackend>
                })
                .ok_or_else(|| {
                    LvxError::LockingInit("external locking needs a coordinator".into())
                }),
        };

        match backend {
            Ok(backend) => {
                debug!(target: "lvx::lock", event = "locking_enabled", backend = backend.name());
                Ok(Self::with_backend(backend, mask))
            }
            Err(err) if config.ignore_locking_failure => {
                warn!(
                    target: "lvx::lock",
                    event = "locking_fallback",
                    requested = ?config.locking_type,
                    error = %err,
                    "Locking disabled - only read operations permitted."
                );
                let mut manager = Self::with_backend(Box::new(NoLocking), mask);
                manager.read_only = true;
                Ok(manager)
            }
            Err(err) => Err(err),
        }
    }

    #[must_use]
    pub fn with_backend(backend: Box<dyn LockBackend>, mask: Box<dyn SignalMask>) -> Self {
        Self {
            backend,
            mask,
            held: BTreeSet::new(),
            signals_blocked: false,
            read_only: false,
            shut_down: false,
        }
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Distinct resources currently held through this manager.
    #[must_use]
    pub fn held_count(&self) -> u32 {
        u32::try_from(self.held.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn is_held(&self, resource: &str, scope: LockScope) -> bool {
        self.held.contains(&(scope, resource.to_owned()))
    }

    #[must_use]
    pub fn signals_blocked(&self) -> bool {
        self.signals_blocked
    }

    /// Whether the requested backend failed and locking silently degraded to
    /// none. Callers should then refuse metadata writes.
    #[must_use]
    pub fn read_only_fallback(&self) -> bool {
        self.read_only
    }

    /// Lock, unlock or probe `resource`.
    ///
    /// Without `hold`, a shared or exclusive request is released again right
    /// after it succeeds, unless the resource was already held. A refusal is
    /// returned as [`LvxError::LockDenied`].
    pub fn lock_volume(
        &mut self,
        resource: &str,
        scope: LockScope,
        lock_type: LockType,
        hold: bool,
    ) -> Result<()> {
        self.lock(&LockRequest::new(resource, scope, lock_type, hold))
    }

    pub fn lock(&mut self, req: &LockRequest) -> Result<()> {
        if self.shut_down {
            return Err(LvxError::LockingInit("lock manager already shut down".into()));
        }
        let was_held = self.is_held(req.resource(), req.scope);
        self.lock_once(req.resource(), req.scope, req.lock_type)?;
        if req.is_probe() && !was_held {
            self.lock_once(req.resource(), req.scope, LockType::Unlock)?;
        }
        Ok(())
    }

    fn lock_once(&mut self, resource: &str, scope: LockScope, lock_type: LockType) -> Result<()> {
        self.block_signals();
        let outcome = match lock_type {
            LockType::Unlock => self.backend.release(resource, scope),
            LockType::Shared | LockType::Exclusive => {
                self.backend.acquire(resource, scope, lock_type)
            }
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => {
                self.unblock_signals();
                return Err(LvxError::LockDenied {
                    resource: format!("{scope}/{resource}"),
                });
            }
            Err(err) => {
                self.unblock_signals();
                return Err(err);
            }
        }

        let key = (scope, resource.to_owned());
        if lock_type == LockType::Unlock {
            if !self.held.remove(&key) {
                warn!(target: "lvx::lock", event = "unlock_without_lock", resource, scope = %scope);
            }
        } else {
            self.held.insert(key);
        }
        trace!(
            target: "lvx::lock",
            event = "lock_transition",
            resource,
            scope = %scope,
            mode = %lock_type,
            held = self.held.len()
        );
        self.unblock_signals();
        Ok(())
    }

    fn block_signals(&mut self) {
        if self.signals_blocked {
            return;
        }
        match self.mask.block_all() {
            Ok(()) => self.signals_blocked = true,
            Err(err) => warn!(target: "lvx::lock", event = "signal_block_failed", error = %err),
        }
    }

    fn unblock_signals(&mut self) {
        if !self.signals_blocked || !self.held.is_empty() {
            return;
        }
        match self.mask.restore() {
            Ok(()) => self.signals_blocked = false,
            Err(err) => warn!(target: "lvx::lock", event = "signal_restore_failed", error = %err),
        }
    }

    /// Release everything through the backend and restore signals.
    /// Later calls are no-ops.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if !self.held.is_empty() {
            warn!(
                target: "lvx::lock",
                event = "shutdown_with_locks_held",
                backend = self.backend.name(),
                held = self.held.len()
            );
        }
        self.backend.shutdown();
        self.held.clear();
        self.unblock_signals();
        info!(target: "lvx::lock", event = "locking_shutdown", backend = self.backend.name());
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("backend", &self.backend.name())
            .field("held", &self.held.len())
            .field("signals_blocked", &self.signals_blocked)
            .field("read_only", &self.read_only)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records mask transitions instead of touching the real mask.
    #[derive(Clone, Default)]
    struct RecordingMask {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl SignalMask for RecordingMask {
        fn block_all(&mut self) -> Result<()> {
            self.log.lock().push("block");
            Ok(())
        }

        fn restore(&mut self) -> Result<()> {
            self.log.lock().push("restore");
            Ok(())
        }
    }

    /// Grants everything except resources named `busy`.
    struct Picky;

    impl LockBackend for Picky {
        fn name(&self) -> &'static str {
            "picky"
        }
        fn acquire(&mut self, resource: &str, _: LockScope, _: LockType) -> Result<bool> {
            Ok(resource != "busy")
        }
        fn release(&mut self, _: &str, _: LockScope) -> Result<bool> {
            Ok(true)
        }
        fn shutdown(&mut self) {}
    }

    fn manager() -> (LockManager, RecordingMask) {
        let mask = RecordingMask::default();
        (
            LockManager::with_backend(Box::new(Picky), Box::new(mask.clone())),
            mask,
        )
    }

    #[test]
    fn hold_keeps_signals_blocked_until_unlock() {
        let (mut mgr, mask) = manager();
        mgr.lock_volume("vg0", LockScope::VolumeGroup, LockType::Exclusive, true)
            .unwrap();
        assert_eq!(mgr.held_count(), 1);
        assert!(mgr.signals_blocked());

        mgr.lock_volume("vg0", LockScope::VolumeGroup, LockType::Unlock, false)
            .unwrap();
        assert_eq!(mgr.held_count(), 0);
        assert!(!mgr.signals_blocked());
        assert_eq!(*mask.log.lock(), vec!["block", "restore"]);
    }

    #[test]
    fn probe_acquires_and_releases() {
        let (mut mgr, mask) = manager();
        mgr.lock_volume("vg0", LockScope::VolumeGroup, LockType::Shared, false)
            .unwrap();
        assert_eq!(mgr.held_count(), 0);
        assert!(!mgr.signals_blocked());
        // Blocked for the acquire, kept across the immediate release.
        assert_eq!(*mask.log.lock(), vec!["block", "restore"]);
    }

    #[test]
    fn denial_restores_signals_and_keeps_count() {
        let (mut mgr, mask) = manager();
        let err = mgr
            .lock_volume("busy", LockScope::VolumeGroup, LockType::Exclusive, true)
            .unwrap_err();
        assert!(matches!(err, LvxError::LockDenied { .. }));
        assert!(err.is_retryable());
        assert_eq!(mgr.held_count(), 0);
        assert!(!mgr.signals_blocked());
        assert_eq!(*mask.log.lock(), vec!["block", "restore"]);
    }

    #[test]
    fn denial_while_holding_keeps_signals_blocked() {
        let (mut mgr, _) = manager();
        mgr.lock_volume("vg0", LockScope::VolumeGroup, LockType::Exclusive, true)
            .unwrap();
        assert!(
            mgr.lock_volume("busy", LockScope::LogicalVolume, LockType::Exclusive, true)
                .is_err()
        );
        assert_eq!(mgr.held_count(), 1);
        assert!(mgr.signals_blocked());
    }

    #[test]
    fn stray_unlock_never_goes_negative() {
        let (mut mgr, _) = manager();
        mgr.lock_volume("vg0", LockScope::VolumeGroup, LockType::Unlock, false)
            .unwrap();
        assert_eq!(mgr.held_count(), 0);
        assert!(!mgr.signals_blocked());
    }

    #[test]
    fn unlocking_another_resource_keeps_signals_blocked() {
        let (mut mgr, mask) = manager();
        mgr.lock_volume("a", LockScope::VolumeGroup, LockType::Exclusive, true)
            .unwrap();
        mgr.lock_volume("b", LockScope::VolumeGroup, LockType::Unlock, false)
            .unwrap();
        assert_eq!(mgr.held_count(), 1);
        assert!(mgr.is_held("a", LockScope::VolumeGroup));
        assert!(mgr.signals_blocked());

        // Same name, other scope: a different resource.
        mgr.lock_volume("a", LockScope::LogicalVolume, LockType::Unlock, false)
            .unwrap();
        assert!(mgr.signals_blocked());

        mgr.lock_volume("a", LockScope::VolumeGroup, LockType::Unlock, false)
            .unwrap();
        assert_eq!(mgr.held_count(), 0);
        assert!(!mgr.signals_blocked());
        assert_eq!(*mask.log.lock(), vec!["block", "restore"]);
    }

    #[test]
    fn relocking_and_probing_a_held_resource_keeps_it() {
        let (mut mgr, _) = manager();
        mgr.lock_volume("vg0", LockScope::VolumeGroup, LockType::Shared, true)
            .unwrap();
        mgr.lock_volume("vg0", LockScope::VolumeGroup, LockType::Exclusive, true)
            .unwrap();
        assert_eq!(mgr.held_count(), 1);
        mgr.lock_volume("vg0", LockScope::VolumeGroup, LockType::Shared, false)
            .unwrap();
        assert!(mgr.is_held("vg0", LockScope::VolumeGroup));
        mgr.lock_volume("vg0", LockScope::VolumeGroup, LockType::Unlock, false)
            .unwrap();
        assert!(!mgr.signals_blocked());
    }

    #[test]
    fn shutdown_is_idempotent_and_final() {
        let (mut mgr, mask) = manager();
        mgr.lock_volume("vg0", LockScope::VolumeGroup, LockType::Exclusive, true)
            .unwrap();
        mgr.shutdown();
        mgr.shutdown();
        assert_eq!(mgr.held_count(), 0);
        assert!(!mgr.signals_blocked());
        assert_eq!(*mask.log.lock(), vec!["block", "restore"]);
        assert!(matches!(
            mgr.lock_volume("vg0", LockScope::VolumeGroup, LockType::Shared, false),
            Err(LvxError::LockingInit(_))
        ));
    }

    #[test]
    fn init_none_and_failed_file_fallback() {
        let none = LockingConfig {
            locking_type: LockingType::None,
            ..LockingConfig::default()
        };
        let mgr =
            LockManager::init_with_mask(&none, None, Box::new(RecordingMask::default())).unwrap();
        assert_eq!(mgr.backend_name(), "none");
        assert!(!mgr.read_only_fallback());

        let external = LockingConfig {
            locking_type: LockingType::External,
            ..LockingConfig::default()
        };
        assert!(matches!(
            LockManager::init_with_mask(&external, None, Box::new(RecordingMask::default())),
            Err(LvxError::LockingInit(_))
        ));

        let tolerant = LockingConfig {
            ignore_locking_failure: true,
            ..external
        };
        let mgr = LockManager::init_with_mask(&tolerant, None, Box::new(RecordingMask::default()))
            .unwrap();
        assert_eq!(mgr.backend_name(), "none");
        assert!(mgr.read_only_fallback());
    }
}
