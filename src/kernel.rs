//! Kernel state
//!
//! Everything the kernel knows lives in one [`Kernel`] value: the frame
//! bitmap, the region 0 page table, the process table, scheduler lists, the
//! IPC registry and terminal buffers. Traps take `&mut Kernel`, which is the
//! whole of the kernel's mutual exclusion: one trap runs to completion before
//! the next begins.

use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::arch::{HalError, Machine};
use crate::config::{KERNEL_STACK_BASE_PAGE, KERNEL_STACK_PAGES, NUM_TERMINALS};
use crate::device::tty::{Terminal, TtyState};
use crate::ipc::IpcRegistry;
use crate::kern::copyio::{self, CopyError};
use crate::kern::loader::ProgramLoader;
use crate::kern::sched_prim::{SchedStats, Scheduler};
use crate::kern::syscall_sw::{SyscallError, SyscallStats};
use crate::kern::task::{Pcb, ProcTable};
use crate::mach_vm::{FrameAllocator, PageTable, VmProt};
use crate::types::{IpcId, Pid};

/// Conditions under which the kernel stops servicing traps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFault {
    /// The machine could not save or restore a kernel context
    ContextSwitch(HalError),
    /// A process the scheduler selected has no record
    MissingProcess(Pid),
    /// The kernel already halted
    Halted,
}

impl fmt::Display for KernelFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelFault::ContextSwitch(err) => write!(f, "context switch failed: {}", err),
            KernelFault::MissingProcess(pid) => write!(f, "no record for pid {}", pid),
            KernelFault::Halted => write!(f, "kernel halted"),
        }
    }
}

/// Reasons the kernel cannot come up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootError {
    /// Fewer physical frames than the kernel region needs
    MemoryTooSmall { frames: usize },
    /// Kernel text and data bounds are inconsistent
    KernelLayout,
    OutOfMemory,
    Context(HalError),
    /// A boot program could not be loaded
    Load(String),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::MemoryTooSmall { frames } => write!(f, "only {} physical frames", frames),
            BootError::KernelLayout => write!(f, "bad kernel text/data bounds"),
            BootError::OutOfMemory => write!(f, "out of frames during boot"),
            BootError::Context(err) => write!(f, "{}", err),
            BootError::Load(path) => write!(f, "cannot load {}", path),
        }
    }
}

pub struct Kernel<M: Machine, L: ProgramLoader, T: Terminal> {
    pub(crate) machine: M,
    pub(crate) loader: L,
    pub(crate) terminal: T,
    pub(crate) frames: FrameAllocator,
    /// Region 0; the kernel stack window always mirrors the current process
    pub(crate) kernel_table: PageTable,
    pub(crate) procs: ProcTable,
    pub(crate) sched: Scheduler,
    pub(crate) ipc: IpcRegistry,
    pub(crate) ttys: [TtyState; NUM_TERMINALS],
    pub(crate) init: Pid,
    pub(crate) halted: bool,
    pub(crate) sys_stats: SyscallStats,
}

impl<M: Machine, L: ProgramLoader, T: Terminal> Kernel<M, L, T> {
    // ========================================================================
    // Observers
    // ========================================================================

    pub fn current_pid(&self) -> Pid {
        self.sched.current
    }

    pub fn idle_pid(&self) -> Pid {
        self.sched.idle
    }

    pub fn init_pid(&self) -> Pid {
        self.init
    }

    pub fn process(&self, pid: Pid) -> Option<&Pcb> {
        self.procs.get(pid)
    }

    pub fn process_count(&self) -> usize {
        self.procs.len()
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    pub fn kernel_table(&self) -> &PageTable {
        &self.kernel_table
    }

    pub fn ipc(&self) -> &IpcRegistry {
        &self.ipc
    }

    pub fn ipc_exists(&self, id: IpcId) -> bool {
        self.ipc.exists(id)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn sched_stats(&self) -> SchedStats {
        self.sched.stats
    }

    pub fn syscall_stats(&self) -> SyscallStats {
        self.sys_stats
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    pub fn terminal(&self) -> &T {
        &self.terminal
    }

    pub fn terminal_mut(&mut self) -> &mut T {
        &mut self.terminal
    }

    pub fn loader_mut(&mut self) -> &mut L {
        &mut self.loader
    }

    /// Read the current process's memory, subject to its read permission
    pub fn read_user(&self, va: usize, len: usize) -> Result<Vec<u8>, CopyError> {
        let table = &self
            .procs
            .get(self.sched.current)
            .ok_or(CopyError::BadAddress)?
            .user_table;
        let mut buf = vec![0u8; len];
        copyio::copyin(self.machine.memory(), table, va, &mut buf)?;
        Ok(buf)
    }

    /// Write the current process's memory, subject to its write permission
    pub fn write_user(&mut self, va: usize, data: &[u8]) -> Result<(), CopyError> {
        self.copyout_current(data, va)
    }

    /// Check that every used frame is mapped by exactly one page table entry
    ///
    /// The kernel stack window of region 0 aliases the current process's
    /// stack and is not counted.
    pub fn frames_consistent(&self) -> bool {
        let mut seen = BTreeSet::new();
        let mut unique = true;
        let mut claim = |pfn: usize| unique &= seen.insert(pfn);
        for (slot, pte) in self.kernel_table.valid_entries() {
            if !(KERNEL_STACK_BASE_PAGE..KERNEL_STACK_BASE_PAGE + KERNEL_STACK_PAGES).contains(&slot) {
                claim(pte.pfn);
            }
        }
        for pid in self.procs.pids() {
            if let Some(pcb) = self.procs.get(pid) {
                for (_, pte) in pcb.user_table.valid_entries().chain(pcb.kstack.valid_entries()) {
                    claim(pte.pfn);
                }
            }
        }
        unique
            && seen.len() == self.frames.used_frames()
            && seen.iter().all(|pfn| self.frames.is_used(*pfn))
            && self.frames.used_frames() == self.frames.count_used()
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    pub(crate) fn current_pcb_mut(&mut self) -> Result<&mut Pcb, SyscallError> {
        let pid = self.sched.current;
        self.procs
            .get_mut(pid)
            .ok_or(SyscallError::Fault(KernelFault::MissingProcess(pid)))
    }

    pub(crate) fn validate_current(&self, va: usize, len: isize, need: VmProt) -> Result<(), CopyError> {
        let table = &self
            .procs
            .get(self.sched.current)
            .ok_or(CopyError::BadAddress)?
            .user_table;
        copyio::validate(table, va, len, need)
    }

    pub(crate) fn copyin_current(&self, src: usize, dst: &mut [u8]) -> Result<(), CopyError> {
        let table = &self
            .procs
            .get(self.sched.current)
            .ok_or(CopyError::BadAddress)?
            .user_table;
        copyio::copyin(self.machine.memory(), table, src, dst)
    }

    pub(crate) fn copyout_current(&mut self, src: &[u8], dst: usize) -> Result<(), CopyError> {
        let table = &self
            .procs
            .get(self.sched.current)
            .ok_or(CopyError::BadAddress)?
            .user_table;
        copyio::copyout(self.machine.memory_mut(), table, src, dst)
    }

    /// Stop servicing traps for good
    pub(crate) fn halt(&mut self, why: &str) {
        ktrace!(0, "kernel: halting: {}", why);
        self.halted = true;
        self.machine.halt();
    }
}
