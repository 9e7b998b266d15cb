//! Host-side simulated machine
//!
//! Physical memory is a plain byte vector. The "CPU" kernel register file is
//! a [`KernelContext`] that save/restore copy in and out, which is enough to
//! check that every switch restores exactly what was saved for the target.

use alloc::vec;
use alloc::vec::Vec;

use super::{HalError, KernelContext, Machine, Register, TlbFlush};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub saves: u64,
    pub restores: u64,
    pub flushes: u64,
}

pub struct SimMachine {
    memory: Vec<u8>,
    registers: [usize; Register::COUNT],
    live: KernelContext,
    last_flush: Option<TlbFlush>,
    fail_transfer: bool,
    halted: bool,
    stats: SimStats,
}

impl SimMachine {
    pub fn new(pmem_size: usize) -> Self {
        let mut live = KernelContext::default();
        // stamp word so restored contexts are distinguishable from zeroed ones
        live.regs[0] = 0x5eed;
        Self {
            memory: vec![0; pmem_size],
            registers: [0; Register::COUNT],
            live,
            last_flush: None,
            fail_transfer: false,
            halted: false,
            stats: SimStats::default(),
        }
    }

    pub fn register(&self, reg: Register) -> usize {
        self.registers[reg.index()]
    }

    pub fn last_flush(&self) -> Option<TlbFlush> {
        self.last_flush
    }

    /// Make the next context restore fail
    pub fn fail_next_transfer(&mut self) {
        self.fail_transfer = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn stats(&self) -> SimStats {
        self.stats
    }

    pub fn live_context(&self) -> &KernelContext {
        &self.live
    }
}

impl Machine for SimMachine {
    fn write_register(&mut self, reg: Register, value: usize) {
        self.registers[reg.index()] = value;
    }

    fn flush_tlb(&mut self, what: TlbFlush) {
        self.last_flush = Some(what);
        self.stats.flushes += 1;
    }

    fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    fn save_context(&mut self, into: &mut KernelContext) -> Result<(), HalError> {
        if self.halted {
            return Err(HalError::ContextSave);
        }
        self.stats.saves += 1;
        // each save gets a fresh stamp
        self.live.regs[1] = self.live.regs[1].wrapping_add(1);
        *into = self.live.clone();
        Ok(())
    }

    fn restore_context(&mut self, from: &KernelContext) -> Result<(), HalError> {
        if self.halted || core::mem::take(&mut self.fail_transfer) {
            return Err(HalError::ContextRestore);
        }
        self.stats.restores += 1;
        self.live = from.clone();
        Ok(())
    }

    fn halt(&mut self) {
        self.halted = true;
    }
}
