//! Physical map - page table entries and per-region page tables
//!
//! Each address space is described by flat, single-level tables: one for
//! region 0 shared by the kernel, and per process one for its user region
//! and one for its private kernel stack. An entry that is not valid carries
//! no meaningful frame number.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::{PAGE_MASK, PAGE_SHIFT};

bitflags! {
    /// Page protection bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmProt: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl VmProt {
    /// Read/write data
    pub const RW: Self = Self::READ.union(Self::WRITE);
    /// Read/execute text
    pub const RX: Self = Self::READ.union(Self::EXEC);
}

// ============================================================================
// Page Table Entry
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pte {
    pub valid: bool,
    pub pfn: usize,
    pub prot: VmProt,
}

impl Pte {
    pub const INVALID: Self = Self {
        valid: false,
        pfn: 0,
        prot: VmProt::empty(),
    };

    pub const fn new(pfn: usize, prot: VmProt) -> Self {
        Self {
            valid: true,
            pfn,
            prot,
        }
    }

    /// Whether the entry is valid and grants every bit in `need`
    pub fn permits(&self, need: VmProt) -> bool {
        self.valid && self.prot.contains(need)
    }
}

// ============================================================================
// Page Table
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTable {
    entries: Vec<Pte>,
}

impl PageTable {
    pub fn new(len: usize) -> Self {
        Self {
            entries: vec![Pte::INVALID; len],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Pte> {
        self.entries.get(index)
    }

    /// Install `pte` at `index`; out-of-range indices are ignored
    pub fn set(&mut self, index: usize, pte: Pte) {
        if let Some(slot) = self.entries.get_mut(index) {
            *slot = pte;
        }
    }

    pub fn clear(&mut self, index: usize) {
        self.set(index, Pte::INVALID);
    }

    pub fn is_valid(&self, index: usize) -> bool {
        self.entries.get(index).map_or(false, |pte| pte.valid)
    }

    /// Iterate valid entries with their slot index
    pub fn valid_entries(&self) -> impl Iterator<Item = (usize, &Pte)> + '_ {
        self.entries.iter().enumerate().filter(|(_, pte)| pte.valid)
    }

    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|pte| pte.valid).count()
    }

    /// Physical address for `va` in a table covering the region starting at `base`
    ///
    /// Returns `None` when the address is outside the table, the entry is
    /// invalid, or the entry lacks any bit of `need`.
    pub fn translate(&self, base: usize, va: usize, need: VmProt) -> Option<usize> {
        let page = va.checked_sub(base)? >> PAGE_SHIFT;
        let pte = self.entries.get(page)?;
        if !pte.permits(need) {
            return None;
        }
        Some((pte.pfn << PAGE_SHIFT) | (va & PAGE_MASK))
    }
}
