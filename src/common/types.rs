//! Core identifiers used throughout the crate

use serde::{Deserialize, Serialize};

/// Which of the two physical routers a port belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouterId {
    A,
    B,
}

impl RouterId {
    /// The far side of a tie-line starting on this router.
    pub fn other(self) -> RouterId {
        match self {
            RouterId::A => RouterId::B,
            RouterId::B => RouterId::A,
        }
    }
}

impl std::fmt::Display for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterId::A => write!(f, "A"),
            RouterId::B => write!(f, "B"),
        }
    }
}

/// Lock state of a router output as seen by one control session.
///
/// Only VideoHub surfaces locks on the wire; the other protocols report
/// `Unlocked` unconditionally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    /// Not locked
    #[default]
    Unlocked,
    /// Locked by this session
    Owned,
    /// Locked by another session
    Locked,
}

impl LockState {
    /// Wire character for the VideoHub lock sections.
    pub fn as_char(self) -> char {
        match self {
            LockState::Unlocked => 'U',
            LockState::Owned => 'O',
            LockState::Locked => 'L',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'U' => Some(LockState::Unlocked),
            'O' => Some(LockState::Owned),
            'L' => Some(LockState::Locked),
            _ => None,
        }
    }
}

/// A lock request issued against an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCommand {
    /// Acquire the lock for this session (`O`)
    Own,
    /// Release a lock held by this session (`U`)
    Release,
    /// Force-release any lock (`F`)
    Force,
}

impl LockCommand {
    pub fn as_char(self) -> char {
        match self {
            LockCommand::Own => 'O',
            LockCommand::Release => 'U',
            LockCommand::Force => 'F',
        }
    }
}

/// A single crosspoint: `output` is fed by `input`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTally {
    pub output: u16,
    pub input: u16,
}

impl RouteTally {
    pub fn new(output: u16, input: u16) -> Self {
        Self { output, input }
    }
}
