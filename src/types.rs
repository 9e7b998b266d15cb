//! Common identifiers shared across the kernel
//!
//! Ids are handed out by the tables that own the objects, never by a global
//! counter, so two kernels booted in the same host process do not interfere.

use core::fmt;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(pub u32);

impl Pid {
    /// Value placed in a user return register
    pub fn as_raw(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// IPC object identifier, shared by pipes, locks and condition variables
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct IpcId(pub u32);

impl IpcId {
    pub fn from_raw(raw: usize) -> Option<Self> {
        u32::try_from(raw).ok().map(IpcId)
    }

    pub fn as_raw(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for IpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
