//! Locking delegated to a coordinator shared by cooperating managers.
//!
//! The coordination protocol between nodes is outside this crate; it only
//! depends on the [`LockCoordinator`] contract. [`InProcessCoordinator`]
//! implements that contract for managers living in one process.

use crate::backend::LockBackend;
use crate::request::{LockScope, LockType};
use lvx_error::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Identity of one participant in a coordinator.
pub type OwnerId = u64;

/// Serialises lock requests across participants.
///
/// Conflicting exclusive requests for the same resource must never both be
/// granted. `acquire` may block up to `timeout` waiting for a conflicting
/// holder to go away.
pub trait LockCoordinator: Send + Sync {
    fn register(&self) -> OwnerId;

    fn acquire(
        &self,
        owner: OwnerId,
        resource: &str,
        scope: LockScope,
        lock_type: LockType,
        timeout: Duration,
    ) -> Result<bool>;

    fn release(&self, owner: OwnerId, resource: &str, scope: LockScope) -> Result<bool>;

    /// Drop every lock `owner` holds.
    fn disconnect(&self, owner: OwnerId);
}

pub struct ExternalLocking {
    coordinator: Arc<dyn LockCoordinator>,
    owner: OwnerId,
    timeout: Duration,
}

impl ExternalLocking {
    /// Join `coordinator`. With `wait` unset, conflicting requests fail at
    /// once instead of waiting up to `timeout`.
    #[must_use]
    pub fn new(coordinator: Arc<dyn LockCoordinator>, wait: bool, timeout: Duration) -> Self {
        let owner = coordinator.register();
        debug!(target: "lvx::lock", event = "external_locking_joined", owner);
        Self {
            coordinator,
            owner,
            timeout: if wait { timeout } else { Duration::ZERO },
        }
    }

    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

impl LockBackend for ExternalLocking {
    fn name(&self) -> &'static str {
        "external"
    }

    fn acquire(&mut self, resource: &str, scope: LockScope, lock_type: LockType) -> Result<bool> {
        self.coordinator
            .acquire(self.owner, resource, scope, lock_type, self.timeout)
    }

    fn release(&mut self, resource: &str, scope: LockScope) -> Result<bool> {
        self.coordinator.release(self.owner, resource, scope)
    }

    fn shutdown(&mut self) {
        self.coordinator.disconnect(self.owner);
    }
}

// ── In-process coordinator ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Holders {
    Shared(BTreeSet<OwnerId>),
    Exclusive(OwnerId),
}

impl Holders {
    /// Whether `owner` may take the resource in `lock_type` mode now.
    fn admits(&self, owner: OwnerId, lock_type: LockType) -> bool {
        match (self, lock_type) {
            (Self::Shared(_), LockType::Shared) => true,
            (Self::Shared(owners), _) => owners.iter().all(|o| *o == owner),
            (Self::Exclusive(holder), _) => *holder == owner,
        }
    }
}

/// A [`LockCoordinator`] for managers sharing one address space.
#[derive(Debug, Default)]
pub struct InProcessCoordinator {
    table: Mutex<HashMap<(LockScope, String), Holders>>,
    changed: Condvar,
    next_owner: AtomicU64,
}

impl InProcessCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resources currently held by anyone.
    #[must_use]
    pub fn held_resources(&self) -> usize {
        self.table.lock().len()
    }
}

impl LockCoordinator for InProcessCoordinator {
    fn register(&self) -> OwnerId {
        self.next_owner.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn acquire(
        &self,
        owner: OwnerId,
        resource: &str,
        scope: LockScope,
        lock_type: LockType,
        timeout: Duration,
    ) -> Result<bool> {
        let key = (scope, resource.to_owned());
        let deadline = Instant::now().checked_add(timeout);
        let mut table = self.table.lock();
        loop {
            let admitted = table
                .get(&key)
                .is_none_or(|holders| holders.admits(owner, lock_type));
            if admitted {
                let next = match (table.remove(&key), lock_type) {
                    (Some(Holders::Shared(mut owners)), LockType::Shared) => {
                        owners.insert(owner);
                        Holders::Shared(owners)
                    }
                    (_, LockType::Shared) => Holders::Shared(BTreeSet::from([owner])),
                    (_, _) => Holders::Exclusive(owner),
                };
                trace!(
                    target: "lvx::lock",
                    event = "coordinator_granted",
                    owner,
                    resource,
                    scope = %scope,
                    mode = %lock_type
                );
                table.insert(key, next);
                return Ok(true);
            }
            let timed_out = match deadline {
                Some(deadline) => self.changed.wait_until(&mut table, deadline).timed_out(),
                None => {
                    self.changed.wait(&mut table);
                    false
                }
            };
            if timed_out {
                debug!(
                    target: "lvx::lock",
                    event = "coordinator_denied",
                    owner,
                    resource,
                    scope = %scope,
                    mode = %lock_type
                );
                return Ok(false);
            }
        }
    }

    fn release(&self, owner: OwnerId, resource: &str, scope: LockScope) -> Result<bool> {
        let key = (scope, resource.to_owned());
        let mut table = self.table.lock();
        let remaining = match table.remove(&key) {
            Some(Holders::Shared(mut owners)) => {
                owners.remove(&owner);
                (!owners.is_empty()).then_some(Holders::Shared(owners))
            }
            Some(Holders::Exclusive(holder)) if holder != owner => Some(Holders::Exclusive(holder)),
            Some(Holders::Exclusive(_)) | None => None,
        };
        if let Some(holders) = remaining {
            table.insert(key, holders);
        }
        drop(table);
        self.changed.notify_all();
        Ok(true)
    }

    fn disconnect(&self, owner: OwnerId) {
        let mut table = self.table.lock();
        table.retain(|_, holders| match holders {
            Holders::Shared(owners) => {
                owners.remove(&owner);
                !owners.is_empty()
            }
            Holders::Exclusive(holder) => *holder != owner,
        });
        drop(table);
        self.changed.notify_all();
        debug!(target: "lvx::lock", event = "coordinator_disconnected", owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pair() -> (Arc<InProcessCoordinator>, ExternalLocking, ExternalLocking) {
        let coordinator = Arc::new(InProcessCoordinator::new());
        let shared: Arc<dyn LockCoordinator> = coordinator.clone();
        let a = ExternalLocking::new(Arc::clone(&shared), false, Duration::ZERO);
        let b = ExternalLocking::new(shared, false, Duration::ZERO);
        (coordinator, a, b)
    }

    #[test]
    fn exclusive_requests_never_both_succeed() {
        let (_, mut a, mut b) = pair();
        assert_ne!(a.owner(), b.owner());
        assert!(a.acquire("vg0", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
        assert!(!b.acquire("vg0", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
        assert!(!b.acquire("vg0", LockScope::VolumeGroup, LockType::Shared).unwrap());
        a.release("vg0", LockScope::VolumeGroup).unwrap();
        assert!(b.acquire("vg0", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
    }

    #[test]
    fn shared_holders_block_foreign_exclusive_only() {
        let (coordinator, mut a, mut b) = pair();
        assert!(a.acquire("vg0", LockScope::VolumeGroup, LockType::Shared).unwrap());
        assert!(b.acquire("vg0", LockScope::VolumeGroup, LockType::Shared).unwrap());
        assert!(!a.acquire("vg0", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
        b.release("vg0", LockScope::VolumeGroup).unwrap();
        // Sole shared holder may upgrade.
        assert!(a.acquire("vg0", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
        assert_eq!(coordinator.held_resources(), 1);
    }

    #[test]
    fn disconnect_frees_owner_locks() {
        let (coordinator, mut a, mut b) = pair();
        assert!(a.acquire("vg0", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
        assert!(a.acquire("lv0", LockScope::LogicalVolume, LockType::Shared).unwrap());
        a.shutdown();
        assert_eq!(coordinator.held_resources(), 0);
        assert!(b.acquire("vg0", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
    }

    #[test]
    fn waiting_acquire_is_granted_after_release() {
        let coordinator: Arc<dyn LockCoordinator> = Arc::new(InProcessCoordinator::new());
        let mut holder = ExternalLocking::new(Arc::clone(&coordinator), true, Duration::from_secs(5));
        let mut waiter = ExternalLocking::new(Arc::clone(&coordinator), true, Duration::from_secs(5));
        assert!(holder.acquire("vg0", LockScope::VolumeGroup, LockType::Exclusive).unwrap());

        let handle = thread::spawn(move || {
            waiter
                .acquire("vg0", LockScope::VolumeGroup, LockType::Exclusive)
                .unwrap()
        });
        thread::sleep(Duration::from_millis(50));
        holder.release("vg0", LockScope::VolumeGroup).unwrap();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn waiting_acquire_times_out() {
        let coordinator: Arc<dyn LockCoordinator> = Arc::new(InProcessCoordinator::new());
        let mut holder = ExternalLocking::new(Arc::clone(&coordinator), true, Duration::from_millis(20));
        let mut waiter = ExternalLocking::new(coordinator, true, Duration::from_millis(20));
        assert!(holder.acquire("vg0", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
        let started = Instant::now();
        assert!(!waiter.acquire("vg0", LockScope::VolumeGroup, LockType::Shared).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
