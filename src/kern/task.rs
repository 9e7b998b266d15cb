//! Process control blocks and the process table
//!
//! PCBs live in one id-keyed table. Parent and child links are ids, so a
//! stale reference to a freed process is just a failed lookup.

use alloc::collections::BTreeMap;

use crate::arch::{KernelContext, UserContext};
use crate::config::{KERNEL_STACK_PAGES, USER_PAGES};
use crate::kern::continuation::Continuation;
use crate::kern::queue::BlockQueue;
use crate::mach_vm::{FrameAllocator, PageTable, VmError, VmProt};
use crate::types::Pid;

/// Lifecycle state
///
/// Only a parent blocked in `Wait` for a child is marked here. A process
/// parked on the delay list or on a device or IPC wait list stays `Ready`;
/// queue membership alone says it cannot run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    New,
    Ready,
    Wait,
}

#[derive(Debug, Clone)]
pub struct Pcb {
    pub pid: Pid,
    pub exit_status: i32,
    pub parent: Option<Pid>,
    /// Live children, oldest first
    pub children: BlockQueue<Pid>,
    /// Exited children not yet reaped, oldest first
    pub dead_children: BlockQueue<Pid>,
    pub data_end: usize,
    pub brk: usize,
    pub stack_low: usize,
    /// Clock ticks left while on the delay list
    pub delay_ticks: usize,
    pub state: ProcState,
    /// Set once the process has exited and only its record remains
    pub zombie: bool,
    pub user_ctx: UserContext,
    pub kernel_ctx: KernelContext,
    pub user_table: PageTable,
    pub kstack: PageTable,
    /// Rest of a blocked syscall, run when the process is next dispatched
    pub pending: Option<Continuation>,
}

impl Pcb {
    fn new(pid: Pid, uctx: &UserContext) -> Self {
        Self {
            pid,
            exit_status: 0,
            parent: None,
            children: BlockQueue::new(),
            dead_children: BlockQueue::new(),
            data_end: 0,
            brk: 0,
            stack_low: 0,
            delay_ticks: 0,
            state: ProcState::New,
            zombie: false,
            user_ctx: uctx.clone(),
            kernel_ctx: KernelContext::default(),
            user_table: PageTable::new(USER_PAGES),
            kstack: PageTable::new(KERNEL_STACK_PAGES),
            pending: None,
        }
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty() || !self.dead_children.is_empty()
    }
}

pub struct ProcTable {
    procs: BTreeMap<Pid, Pcb>,
    next_pid: u32,
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcTable {
    pub fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
            next_pid: 1,
        }
    }

    /// Create a process with its own kernel stack
    ///
    /// If the stack cannot be allocated nothing is recorded and the pid is
    /// not consumed.
    pub fn create(&mut self, frames: &mut FrameAllocator, uctx: &UserContext) -> Result<Pid, VmError> {
        let pid = Pid(self.next_pid);
        let mut pcb = Pcb::new(pid, uctx);
        frames.allocate(&mut pcb.kstack, 0, KERNEL_STACK_PAGES, VmProt::RW)?;
        self.next_pid += 1;
        self.procs.insert(pid, pcb);
        ktrace!(2, "task: created pid {}", pid);
        Ok(pid)
    }

    /// Create a process that takes over an existing kernel stack mapping
    pub fn adopt(&mut self, uctx: &UserContext, kstack: PageTable) -> Pid {
        let pid = Pid(self.next_pid);
        let mut pcb = Pcb::new(pid, uctx);
        pcb.kstack = kstack;
        self.next_pid += 1;
        self.procs.insert(pid, pcb);
        pid
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.procs.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.procs.get_mut(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.procs.contains_key(&pid)
    }

    /// Drop the record; frames must already be released
    pub fn remove(&mut self, pid: Pid) -> Option<Pcb> {
        self.procs.remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.procs.keys().copied()
    }

    /// Pid the next successful create will use
    pub fn next_pid(&self) -> Pid {
        Pid(self.next_pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_allocates_kstack() {
        let mut frames = FrameAllocator::new(16);
        let mut table = ProcTable::new();
        let pid = table.create(&mut frames, &UserContext::default()).unwrap();
        assert_eq!(pid, Pid(1));
        let pcb = table.get(pid).unwrap();
        assert_eq!(pcb.state, ProcState::New);
        assert_eq!(pcb.kstack.valid_count(), KERNEL_STACK_PAGES);
        assert_eq!(frames.free_frames(), 16 - KERNEL_STACK_PAGES);
    }

    #[test]
    fn test_create_failure_records_nothing() {
        let mut frames = FrameAllocator::new(1);
        let mut table = ProcTable::new();
        assert_eq!(
            table.create(&mut frames, &UserContext::default()),
            Err(VmError::OutOfMemory)
        );
        assert!(table.is_empty());
        assert_eq!(table.next_pid(), Pid(1));
        assert_eq!(frames.free_frames(), 1);
    }

    #[test]
    fn test_monotonic_pids() {
        let mut frames = FrameAllocator::new(16);
        let mut table = ProcTable::new();
        let a = table.create(&mut frames, &UserContext::default()).unwrap();
        let b = table.adopt(&UserContext::default(), PageTable::new(KERNEL_STACK_PAGES));
        table.remove(a);
        let c = table.create(&mut frames, &UserContext::default()).unwrap();
        assert!(a < b && b < c);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_has_children_counts_zombies() {
        let mut pcb = Pcb::new(Pid(2), &UserContext::default());
        assert!(!pcb.has_children());
        pcb.dead_children.enqueue(Pid(3));
        assert!(pcb.has_children());
    }
}
