//! Lifecycle of a single migration.

use lvx_error::{LvxError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PvmoveState {
    Planning,
    Splitting,
    Mirroring,
    InProgress,
    Completing,
    Reverting,
    Done,
}

impl PvmoveState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Splitting => "splitting",
            Self::Mirroring => "mirroring",
            Self::InProgress => "in_progress",
            Self::Completing => "completing",
            Self::Reverting => "reverting",
            Self::Done => "done",
        }
    }

    /// Whether `next` is a legal successor.
    ///
    /// Any pre-`Done` state may drop to `Reverting`, since a failed
    /// insertion is unwound through the same collapse path.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Planning, Self::Splitting)
                | (Self::Splitting, Self::Mirroring)
                | (Self::Mirroring, Self::InProgress)
                | (Self::InProgress, Self::Completing)
                | (Self::Completing | Self::Reverting, Self::Done)
                | (
                    Self::Planning | Self::Splitting | Self::Mirroring | Self::InProgress,
                    Self::Reverting
                )
        )
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn advance(&mut self, next: Self) -> Result<()> {
        if !self.can_advance_to(next) {
            return Err(LvxError::InvalidArgument(format!(
                "pvmove cannot go from {self} to {next}"
            )));
        }
        *self = next;
        Ok(())
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Done
    }
}

impl fmt::Display for PvmoveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_commit() {
        let mut state = PvmoveState::Planning;
        for next in [
            PvmoveState::Splitting,
            PvmoveState::Mirroring,
            PvmoveState::InProgress,
            PvmoveState::Completing,
            PvmoveState::Done,
        ] {
            state.advance(next).unwrap();
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn revert_from_in_progress() {
        let mut state = PvmoveState::InProgress;
        state.advance(PvmoveState::Reverting).unwrap();
        state.advance(PvmoveState::Done).unwrap();
    }

    #[test]
    fn illegal_transitions_rejected() {
        let mut state = PvmoveState::Planning;
        assert!(state.advance(PvmoveState::InProgress).is_err());
        assert_eq!(state, PvmoveState::Planning);

        let mut done = PvmoveState::Done;
        assert!(done.advance(PvmoveState::Reverting).is_err());
        assert!(!PvmoveState::Completing.can_advance_to(PvmoveState::Reverting));
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&PvmoveState::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
