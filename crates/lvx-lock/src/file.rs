//! Host-local advisory locking with `flock(2)` on per-resource files.
//!
//! Each resource maps to `<dir>/<tag>_<name>` where the tag is `V` for volume
//! groups and `L` for logical volumes. Locks are tied to the open file, so
//! two managers in the same process conflict just as two processes would.

use crate::backend::LockBackend;
use crate::request::{LockScope, LockType};
use lvx_error::{LvxError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

pub struct FileLocking {
    dir: PathBuf,
    wait: bool,
    held: HashMap<(LockScope, String), Flock<File>>,
}

impl FileLocking {
    /// Prepare the lock directory, creating it if missing.
    pub fn new(dir: impl Into<PathBuf>, wait: bool) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|err| {
            LvxError::LockingInit(format!("lock directory {}: {err}", dir.display()))
        })?;
        debug!(target: "lvx::lock", event = "file_locking_ready", dir = %dir.display(), wait);
        Ok(Self {
            dir,
            wait,
            held: HashMap::new(),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the lock file for `resource`.
    #[must_use]
    pub fn lock_path(&self, resource: &str, scope: LockScope) -> PathBuf {
        let safe: String = resource
            .chars()
            .map(|c| if c == '/' { '_' } else { c })
            .collect();
        self.dir.join(format!("{}_{safe}", scope.tag()))
    }

    fn flock_arg(&self, lock_type: LockType) -> FlockArg {
        match (lock_type, self.wait) {
            (LockType::Exclusive, true) => FlockArg::LockExclusive,
            (LockType::Exclusive, false) => FlockArg::LockExclusiveNonblock,
            (_, true) => FlockArg::LockShared,
            (_, false) => FlockArg::LockSharedNonblock,
        }
    }
}

impl LockBackend for FileLocking {
    fn name(&self) -> &'static str {
        "file"
    }

    fn acquire(&mut self, resource: &str, scope: LockScope, lock_type: LockType) -> Result<bool> {
        let key = (scope, resource.to_owned());
        // Re-locking converts the mode on the already-open file. As with
        // flock(2), a refused conversion leaves the resource unlocked.
        let file = match self.held.remove(&key) {
            Some(existing) => existing
                .unlock()
                .map_err(|(_, errno)| LvxError::Io(errno.into()))?,
            None => {
                let path = self.lock_path(resource, scope);
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?
            }
        };

        match Flock::lock(file, self.flock_arg(lock_type)) {
            Ok(lock) => {
                trace!(
                    target: "lvx::lock",
                    event = "file_lock_acquired",
                    resource,
                    scope = %scope,
                    mode = %lock_type
                );
                self.held.insert(key, lock);
                Ok(true)
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                debug!(
                    target: "lvx::lock",
                    event = "file_lock_busy",
                    resource,
                    scope = %scope,
                    mode = %lock_type
                );
                Ok(false)
            }
            Err((_, errno)) => Err(LvxError::Io(errno.into())),
        }
    }

    fn release(&mut self, resource: &str, scope: LockScope) -> Result<bool> {
        let Some(lock) = self.held.remove(&(scope, resource.to_owned())) else {
            debug!(target: "lvx::lock", event = "file_unlock_not_held", resource, scope = %scope);
            return Ok(true);
        };
        match lock.unlock() {
            Ok(_file) => {
                trace!(target: "lvx::lock", event = "file_lock_released", resource, scope = %scope);
                Ok(true)
            }
            Err((lock, errno)) => {
                self.held.insert((scope, resource.to_owned()), lock);
                Err(LvxError::Io(errno.into()))
            }
        }
    }

    fn shutdown(&mut self) {
        for ((scope, resource), lock) in self.held.drain() {
            if let Err((_, errno)) = lock.unlock() {
                warn!(
                    target: "lvx::lock",
                    event = "file_unlock_failed",
                    resource = %resource,
                    scope = %scope,
                    errno = %errno
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_conflicts_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let mut one = FileLocking::new(dir.path(), false).unwrap();
        let mut two = FileLocking::new(dir.path(), false).unwrap();

        assert!(one.acquire("vg0", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
        assert!(!two.acquire("vg0", LockScope::VolumeGroup, LockType::Shared).unwrap());
        assert!(two.acquire("vg0", LockScope::LogicalVolume, LockType::Exclusive).unwrap());

        assert!(one.release("vg0", LockScope::VolumeGroup).unwrap());
        assert!(two.acquire("vg0", LockScope::VolumeGroup, LockType::Shared).unwrap());
        assert!(dir.path().join("V_vg0").exists());
        assert!(dir.path().join("L_vg0").exists());
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let mut one = FileLocking::new(dir.path(), false).unwrap();
        let mut two = FileLocking::new(dir.path(), false).unwrap();
        assert!(one.acquire("vg0", LockScope::VolumeGroup, LockType::Shared).unwrap());
        assert!(two.acquire("vg0", LockScope::VolumeGroup, LockType::Shared).unwrap());
        assert!(!one.acquire("vg0", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
    }

    #[test]
    fn shutdown_drops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut one = FileLocking::new(dir.path(), false).unwrap();
        let mut two = FileLocking::new(dir.path(), false).unwrap();
        assert!(one.acquire("a", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
        assert!(one.acquire("b", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
        one.shutdown();
        assert!(two.acquire("a", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
        assert!(two.acquire("b", LockScope::VolumeGroup, LockType::Exclusive).unwrap());
    }

    #[test]
    fn slashes_in_names_stay_inside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let locking = FileLocking::new(dir.path(), true).unwrap();
        let path = locking.lock_path("vg0/lvol0", LockScope::LogicalVolume);
        assert_eq!(path, dir.path().join("L_vg0_lvol0"));
    }
}
