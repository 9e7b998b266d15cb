//! Physical frame bitmap
//!
//! One bit per physical frame, set while the frame is mapped by a valid
//! page table entry. A separate free counter tracks the number of clear
//! bits so capacity checks are constant time.
//!
//! Allocation is first-fit from frame zero on every call. Multi-page
//! operations are expected to pre-flight with [`FrameAllocator::check_capacity`]
//! so that they never have to roll back a partial allocation.

use alloc::vec;
use alloc::vec::Vec;

use super::pmap::{PageTable, Pte, VmProt};
use super::VmError;

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Debug, Clone)]
pub struct FrameAllocator {
    bitmap: Vec<u64>,
    total: usize,
    free: usize,
}

impl FrameAllocator {
    pub fn new(total: usize) -> Self {
        Self {
            bitmap: vec![0; (total + WORD_BITS - 1) / WORD_BITS],
            total,
            free: total,
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total
    }

    pub fn free_frames(&self) -> usize {
        self.free
    }

    pub fn used_frames(&self) -> usize {
        self.total - self.free
    }

    pub fn is_used(&self, pfn: usize) -> bool {
        pfn < self.total && self.bitmap[pfn / WORD_BITS] & (1 << (pfn % WORD_BITS)) != 0
    }

    /// Number of set bits, counted the slow way
    pub fn count_used(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True iff `count` frames can be allocated right now
    pub fn check_capacity(&self, count: usize) -> bool {
        count <= self.free
    }

    fn first_free(&self) -> Option<usize> {
        for (i, word) in self.bitmap.iter().enumerate() {
            if *word != u64::MAX {
                let pfn = i * WORD_BITS + word.trailing_ones() as usize;
                return (pfn < self.total).then_some(pfn);
            }
        }
        None
    }

    fn mark(&mut self, pfn: usize) {
        self.bitmap[pfn / WORD_BITS] |= 1 << (pfn % WORD_BITS);
        self.free -= 1;
    }

    fn unmark(&mut self, pfn: usize) {
        self.bitmap[pfn / WORD_BITS] &= !(1 << (pfn % WORD_BITS));
        self.free += 1;
    }

    /// Claim a specific frame, used for boot-time identity mappings
    pub fn reserve(&mut self, pfn: usize) -> Result<(), VmError> {
        if pfn >= self.total || self.is_used(pfn) {
            return Err(VmError::BadFrame);
        }
        self.mark(pfn);
        Ok(())
    }

    /// Back `count` consecutive slots starting at `start` with fresh frames
    ///
    /// Nothing is changed on failure.
    pub fn allocate(
        &mut self,
        table: &mut PageTable,
        start: usize,
        count: usize,
        prot: VmProt,
    ) -> Result<(), VmError> {
        let end = start.checked_add(count).ok_or(VmError::BadRange)?;
        if end > table.len() {
            return Err(VmError::BadRange);
        }
        if !self.check_capacity(count) {
            ktrace!(1, "vm: need {} frames, {} free", count, self.free);
            return Err(VmError::OutOfMemory);
        }
        if (start..end).any(|slot| table.is_valid(slot)) {
            return Err(VmError::AlreadyMapped);
        }
        for slot in start..end {
            let pfn = self.first_free().ok_or(VmError::OutOfMemory)?;
            self.mark(pfn);
            table.set(slot, Pte::new(pfn, prot));
            ktrace!(3, "vm: slot {} -> frame {}", slot, pfn);
        }
        Ok(())
    }

    /// Release the frames behind `count` slots starting at `start`
    ///
    /// Invalid slots are skipped; every slot in range ends up invalid.
    pub fn deallocate(&mut self, table: &mut PageTable, start: usize, count: usize) {
        let end = start.saturating_add(count).min(table.len());
        for slot in start..end {
            if let Some(pte) = table.get(slot).copied() {
                if pte.valid && self.is_used(pte.pfn) {
                    self.unmark(pte.pfn);
                }
            }
            table.clear(slot);
        }
    }
}
