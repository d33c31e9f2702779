//! Signal suppression while locks are held.

use lvx_error::{LvxError, Result};
use nix::sys::signal::{SigSet, SigmaskHow, sigprocmask};

/// Blocks and restores signal delivery for the lock manager.
pub trait SignalMask: Send {
    /// Block every signal, remembering the previous mask.
    fn block_all(&mut self) -> Result<()>;

    /// Reinstate the mask saved by the last `block_all`.
    fn restore(&mut self) -> Result<()>;
}

/// The calling thread's real signal mask, via `sigprocmask(2)`.
#[derive(Debug, Default)]
pub struct ProcessSignalMask {
    saved: Option<SigSet>,
}

impl ProcessSignalMask {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignalMask for ProcessSignalMask {
    fn block_all(&mut self) -> Result<()> {
        let mut old = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), Some(&mut old))
            .map_err(|errno| LvxError::Io(errno.into()))?;
        self.saved = Some(old);
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        let Some(old) = self.saved.take() else {
            return Ok(());
        };
        if let Err(errno) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old), None) {
            self.saved = Some(old);
            return Err(LvxError::Io(errno.into()));
        }
        Ok(())
    }
}
