//! Virtual memory subsystem
//!
//! - pmap: page table entries, protection bits and per-region page tables
//! - vm_page: the physical frame bitmap

pub mod pmap;
pub mod vm_page;

use core::fmt;

pub use pmap::{PageTable, Pte, VmProt};
pub use vm_page::FrameAllocator;

/// Errors from frame allocation and page table manipulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum VmError {
    /// Fewer free frames than requested
    OutOfMemory = -1,
    /// Slot range falls outside the page table
    BadRange = -2,
    /// Target slot already holds a valid mapping
    AlreadyMapped = -3,
    /// Frame number outside physical memory or already owned
    BadFrame = -4,
    /// Address has no valid mapping
    NotMapped = -5,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::OutOfMemory => "out of physical frames",
            VmError::BadRange => "page range outside table",
            VmError::AlreadyMapped => "page already mapped",
            VmError::BadFrame => "bad physical frame",
            VmError::NotMapped => "address not mapped",
        };
        f.write_str(msg)
    }
}
