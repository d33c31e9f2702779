#![forbid(unsafe_code)]
//! Error types for lvx.
//!
//! # Error Taxonomy
//!
//! Every fallible lvx operation returns [`LvxError`]. The variants follow the
//! failure classes of volume metadata work:
//!
//! | Variant | Raised by | Retry? |
//! |---------|-----------|--------|
//! | `NoSpace` | extent allocation (`extend`, pvmove mirror allocation) | no |
//! | `Allocation` | structural split/extend violations | no |
//! | `TargetUnavailable` | pvmove, before any mutation, when the execution backend lacks a segment type | no |
//! | `InconsistentState` | mirror removal validation | no (that LV is skipped) |
//! | `LockDenied` | lock manager, when the backend refuses a resource | caller policy |
//! | `NotFound` | name lookups (PV, LV, device) | no |
//! | `MigrationIncomplete` | committing a pvmove that has not finished copying | yes, later |
//! | `InvalidArgument` | malformed requests (zero-length extents, bad ranges) | no |
//! | `LockingInit` | lock backend initialisation | no |
//! | `Io` | lock files, configuration files | depends |
//!
//! ## Propagation Policy
//!
//! Structural errors abort the current migration step immediately. Splits
//! already applied are **not** rolled back: an aborted pvmove may leave extra
//! segment boundaries behind, which a later merge pass removes.
//!
//! Batch operations (segment merging, group-wide mirror removal) are
//! best-effort. They log a failing entity and keep going; they never surface
//! one entity's error as the result of the whole batch.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`LvxError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `NoSpace` | `ENOSPC` |
//! | `Allocation` | `EINVAL` |
//! | `TargetUnavailable` | `EOPNOTSUPP` |
//! | `InconsistentState` | `EIO` |
//! | `LockDenied` | `EAGAIN` |
//! | `NotFound` | `ENOENT` |
//! | `MigrationIncomplete` | `EBUSY` |
//! | `InvalidArgument` | `EINVAL` |
//! | `LockingInit` | `ENOLCK` |

use thiserror::Error;

/// Unified error type for all lvx operations.
///
/// Every variant carries enough identity (volume, segment, resource name) to be
/// logged at the call site without further context.
#[derive(Debug, Error)]
pub enum LvxError {
    /// Operating system I/O error (lock files, configuration).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not enough free physical extents in the candidate set.
    #[error("insufficient free extents: need {needed}, {available} available")]
    NoSpace { needed: u32, available: u32 },

    /// A split or extend would violate the segment's shape constraints.
    #[error("allocation error: {0}")]
    Allocation(String),

    /// The execution backend cannot run the requested segment type.
    #[error("segment type {0} not available in the execution backend")]
    TargetUnavailable(String),

    /// Mirror removal found a mapping it cannot reconcile.
    #[error("inconsistent state in {lv}: {detail}")]
    InconsistentState { lv: String, detail: String },

    /// The lock backend refused the resource.
    #[error("lock denied for resource {resource}")]
    LockDenied { resource: String },

    /// Named PV, LV or device could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),

    /// A migration was asked to commit before every extent was copied.
    #[error("migration of {lv} incomplete: {percent:.1}% copied")]
    MigrationIncomplete { lv: String, percent: f64 },

    /// Caller supplied a malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested lock backend could not be initialised.
    #[error("locking initialisation failed: {0}")]
    LockingInit(String),
}

impl LvxError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive. Adding a variant without updating this
    /// function is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NoSpace { .. } => libc::ENOSPC,
            Self::Allocation(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::TargetUnavailable(_) => libc::EOPNOTSUPP,
            Self::InconsistentState { .. } => libc::EIO,
            Self::LockDenied { .. } => libc::EAGAIN,
            Self::NotFound(_) => libc::ENOENT,
            Self::MigrationIncomplete { .. } => libc::EBUSY,
            Self::LockingInit(_) => libc::ENOLCK,
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    ///
    /// The core never retries on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockDenied { .. } | Self::MigrationIncomplete { .. }
        )
    }
}

/// Result alias using `LvxError`.
pub type Result<T> = std::result::Result<T, LvxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(LvxError, libc::c_int)> = vec![
            (LvxError::Io(std::io::Error::other("test")), libc::EIO),
            (
                LvxError::NoSpace {
                    needed: 10,
                    available: 3,
                },
                libc::ENOSPC,
            ),
            (LvxError::Allocation("split".into()), libc::EINVAL),
            (LvxError::TargetUnavailable("mirror".into()), libc::EOPNOTSUPP),
            (
                LvxError::InconsistentState {
                    lv: "vg0/data".into(),
                    detail: "bad leg".into(),
                },
                libc::EIO,
            ),
            (
                LvxError::LockDenied {
                    resource: "vg0".into(),
                },
                libc::EAGAIN,
            ),
            (LvxError::NotFound("/dev/sdz".into()), libc::ENOENT),
            (
                LvxError::MigrationIncomplete {
                    lv: "pvmove0".into(),
                    percent: 40.0,
                },
                libc::EBUSY,
            ),
            (LvxError::InvalidArgument("len=0".into()), libc::EINVAL),
            (LvxError::LockingInit("no dir".into()), libc::ENOLCK),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EWOULDBLOCK);
        let err = LvxError::Io(raw);
        assert_eq!(err.to_errno(), libc::EWOULDBLOCK);
    }

    #[test]
    fn display_formatting() {
        let err = LvxError::NoSpace {
            needed: 30,
            available: 12,
        };
        assert_eq!(
            err.to_string(),
            "insufficient free extents: need 30, 12 available"
        );

        let err = LvxError::InconsistentState {
            lv: "vg0/data".into(),
            detail: "mirror segment at LE 20 has 1 areas".into(),
        };
        assert_eq!(
            err.to_string(),
            "inconsistent state in vg0/data: mirror segment at LE 20 has 1 areas"
        );

        let err = LvxError::MigrationIncomplete {
            lv: "vg0/pvmove0".into(),
            percent: 37.5,
        };
        assert_eq!(
            err.to_string(),
            "migration of vg0/pvmove0 incomplete: 37.5% copied"
        );

        let err = LvxError::TargetUnavailable("mirror".into());
        assert_eq!(
            err.to_string(),
            "segment type mirror not available in the execution backend"
        );
    }

    #[test]
    fn only_lock_and_progress_errors_are_retryable() {
        assert!(
            LvxError::LockDenied {
                resource: "vg0".into()
            }
            .is_retryable()
        );
        assert!(
            LvxError::MigrationIncomplete {
                lv: "pvmove0".into(),
                percent: 1.0
            }
            .is_retryable()
        );
        assert!(
            !LvxError::NoSpace {
                needed: 1,
                available: 0
            }
            .is_retryable()
        );
        assert!(!LvxError::NotFound("x".into()).is_retryable());
    }
}
