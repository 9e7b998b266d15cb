//! Scheduling primitives
//!
//! Based on the classic single-CPU round robin: one FIFO ready queue, a
//! delay list driven by the clock, per-terminal wait lists, and an idle
//! process that runs when nothing else can. Every blocking path funnels
//! through [`Kernel::suspend_and_switch`].

use alloc::vec::Vec;

use crate::arch::{HalError, Machine, Register, TlbFlush, UserContext};
use crate::config::{KERNEL_STACK_BASE, KERNEL_STACK_BASE_PAGE, KERNEL_STACK_PAGES, NUM_TERMINALS, PAGE_SIZE};
use crate::device::tty::Terminal;
use crate::kern::continuation::{Continuation, Step};
use crate::kern::loader::ProgramLoader;
use crate::kern::queue::BlockQueue;
use crate::kern::syscall_sw::SyscallError;
use crate::kernel::{Kernel, KernelFault};
use crate::types::Pid;

/// Scheduler list a process can be parked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitList {
    Ready,
    /// Delay list, decremented every clock tick
    Clock,
    /// Waiting for a line on this terminal
    TtyRead(usize),
    /// Waiting for this terminal's transmitter
    TtyWrite(usize),
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Kernel context transfers performed
    pub context_switches: u64,
    /// Clock interrupts serviced
    pub ticks: u64,
    /// Times the idle process was picked for lack of anything else
    pub idle_dispatches: u64,
}

pub struct Scheduler {
    pub ready: BlockQueue<Pid>,
    pub clock: BlockQueue<Pid>,
    pub tty_read: [BlockQueue<Pid>; NUM_TERMINALS],
    pub tty_write: [BlockQueue<Pid>; NUM_TERMINALS],
    /// Process whose context is loaded
    pub current: Pid,
    pub idle: Pid,
    pub stats: SchedStats,
}

impl Scheduler {
    pub fn new(idle: Pid, current: Pid) -> Self {
        Self {
            ready: BlockQueue::new(),
            clock: BlockQueue::new(),
            tty_read: core::array::from_fn(|_| BlockQueue::new()),
            tty_write: core::array::from_fn(|_| BlockQueue::new()),
            current,
            idle,
            stats: SchedStats::default(),
        }
    }

    fn list_mut(&mut self, list: WaitList) -> Option<&mut BlockQueue<Pid>> {
        match list {
            WaitList::Ready => Some(&mut self.ready),
            WaitList::Clock => Some(&mut self.clock),
            WaitList::TtyRead(tty) => self.tty_read.get_mut(tty),
            WaitList::TtyWrite(tty) => self.tty_write.get_mut(tty),
        }
    }

    /// Put `pid` on `list`; the idle process is never queued
    pub fn park(&mut self, list: WaitList, pid: Pid) {
        if pid == self.idle {
            return;
        }
        match self.list_mut(list) {
            Some(queue) => queue.enqueue(pid),
            None => ktrace!(0, "sched: no list {:?} for pid {}", list, pid),
        }
    }

    pub fn make_ready(&mut self, pid: Pid) {
        self.park(WaitList::Ready, pid);
    }

    /// Move everything waiting on `list` to the ready queue, in order
    pub fn wake_all(&mut self, list: WaitList) {
        let woken = match self.list_mut(list) {
            Some(queue) => queue.take_all(),
            None => return,
        };
        for pid in woken {
            self.make_ready(pid);
        }
    }

    /// Next process to run: head of the ready queue, else idle
    pub fn pick_next(&mut self) -> Pid {
        match self.ready.dequeue() {
            Some(pid) => pid,
            None => {
                self.stats.idle_dispatches += 1;
                self.idle
            }
        }
    }

    /// Whether `pid` sits on any scheduler list
    pub fn is_queued(&self, pid: Pid) -> bool {
        self.ready.contains(&pid)
            || self.clock.contains(&pid)
            || self.tty_read.iter().any(|q| q.contains(&pid))
            || self.tty_write.iter().any(|q| q.contains(&pid))
    }
}

impl<M: Machine, L: ProgramLoader, T: Terminal> Kernel<M, L, T> {
    /// Suspend the current process and run the next one
    ///
    /// The caller is parked on `dest` unless it is idle; `None` leaves it off
    /// every list, to be woken by an IPC object, a child's exit, or never.
    /// On return `uctx` holds the context of whichever process now runs.
    /// A dispatched process with a pending continuation runs it first; if
    /// that blocks again the hand-off repeats.
    pub(crate) fn suspend_and_switch(
        &mut self,
        uctx: &mut UserContext,
        dest: Option<WaitList>,
    ) -> Result<(), KernelFault> {
        let mut prev = self.sched.current;
        if let Some(list) = dest {
            self.sched.park(list, prev);
        }
        loop {
            let next = self.sched.pick_next();
            if next != prev {
                self.switch_to(prev, next, uctx)?;
            }
            let cont = match self.procs.get_mut(next).and_then(|pcb| pcb.pending.take()) {
                Some(cont) => cont,
                None => return Ok(()),
            };
            match self.resume(cont) {
                Err(SyscallError::Fault(fault)) => return Err(fault),
                result => match Step::from_result(result) {
                    Step::Return(value) => {
                        uctx.set_retval(value);
                        return Ok(());
                    }
                    Step::Resume => return Ok(()),
                    Step::Block { list, cont } => {
                        if let Some(pcb) = self.procs.get_mut(next) {
                            pcb.pending = Some(cont);
                        }
                        if let Some(list) = list {
                            self.sched.park(list, next);
                        }
                    }
                    Step::Exit(status) => {
                        self.terminate(next, status);
                        if self.halted {
                            return Ok(());
                        }
                    }
                },
            }
            prev = next;
        }
    }

    fn switch_to(&mut self, prev: Pid, next: Pid, uctx: &mut UserContext) -> Result<(), KernelFault> {
        if let Some(pcb) = self.procs.get_mut(prev) {
            pcb.user_ctx = uctx.clone();
        }
        self.context_transfer(prev, next)?;
        self.sched.current = next;
        let pcb = self.procs.get(next).ok_or(KernelFault::MissingProcess(next))?;
        *uctx = pcb.user_ctx.clone();
        ktrace!(2, "sched: switch {} -> {}", prev, next);
        Ok(())
    }

    /// Install `next`'s kernel stack and address space and move onto its
    /// kernel register state
    fn context_transfer(&mut self, prev: Pid, next: Pid) -> Result<(), KernelFault> {
        let saved = match self.procs.get_mut(prev) {
            Some(pcb) if !pcb.zombie => self.machine.save_context(&mut pcb.kernel_ctx),
            _ => Ok(()),
        };
        if let Err(err) = saved {
            return Err(self.transfer_failed(err));
        }

        let (kstack, kctx) = match self.procs.get(next) {
            Some(pcb) => (pcb.kstack.clone(), pcb.kernel_ctx.clone()),
            None => return Err(KernelFault::MissingProcess(next)),
        };
        for i in 0..KERNEL_STACK_PAGES {
            if let Some(pte) = kstack.get(i) {
                self.kernel_table.set(KERNEL_STACK_BASE_PAGE + i, *pte);
            }
        }
        self.machine.write_register(Register::Ptbr1, next.as_raw());
        self.machine.flush_tlb(TlbFlush::Region1);
        for i in 0..KERNEL_STACK_PAGES {
            self.machine
                .flush_tlb(TlbFlush::Page(KERNEL_STACK_BASE + i * PAGE_SIZE));
        }
        if let Err(err) = self.machine.restore_context(&kctx) {
            return Err(self.transfer_failed(err));
        }
        self.sched.stats.context_switches += 1;
        Ok(())
    }

    pub(crate) fn transfer_failed(&mut self, err: HalError) -> KernelFault {
        self.halt("context transfer failed");
        ktrace!(0, "sched: {}", err);
        KernelFault::ContextSwitch(err)
    }

    /// Clock interrupt: age the delay list, then round-robin
    pub(crate) fn clock_tick(&mut self, uctx: &mut UserContext) -> Result<(), KernelFault> {
        self.sched.stats.ticks += 1;
        let procs = &mut self.procs;
        let mut expired = Vec::new();
        self.sched.clock.retain_mut(|pid| match procs.get_mut(*pid) {
            Some(pcb) => {
                pcb.delay_ticks = pcb.delay_ticks.saturating_sub(1);
                if pcb.delay_ticks == 0 {
                    expired.push(*pid);
                    false
                } else {
                    true
                }
            }
            None => false,
        });
        for pid in expired {
            self.sched.make_ready(pid);
        }
        self.suspend_and_switch(uctx, Some(WaitList::Ready))
    }

    /// Delay syscall
    pub(crate) fn sys_delay(&mut self, ticks: isize) -> Result<Step, SyscallError> {
        if ticks < 0 {
            return Err(SyscallError::BadArgument);
        }
        if ticks == 0 {
            return Ok(Step::Return(0));
        }
        let pcb = self.current_pcb_mut()?;
        pcb.delay_ticks = ticks as usize;
        Ok(Step::park_on(WaitList::Clock, Continuation::Delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_never_queued() {
        let idle = Pid(1);
        let mut sched = Scheduler::new(idle, Pid(2));
        sched.make_ready(idle);
        sched.park(WaitList::Clock, idle);
        assert!(!sched.is_queued(idle));
        assert_eq!(sched.pick_next(), idle);
        assert_eq!(sched.stats.idle_dispatches, 1);
    }

    #[test]
    fn test_round_robin_order() {
        let mut sched = Scheduler::new(Pid(1), Pid(2));
        sched.make_ready(Pid(3));
        sched.make_ready(Pid(4));
        sched.make_ready(Pid(2));
        assert_eq!(sched.pick_next(), Pid(3));
        assert_eq!(sched.pick_next(), Pid(4));
        assert_eq!(sched.pick_next(), Pid(2));
        assert_eq!(sched.pick_next(), Pid(1));
    }

    #[test]
    fn test_wake_terminal_list() {
        let mut sched = Scheduler::new(Pid(1), Pid(2));
        sched.park(WaitList::TtyRead(2), Pid(5));
        sched.park(WaitList::TtyRead(2), Pid(6));
        sched.park(WaitList::TtyRead(3), Pid(7));
        sched.wake_all(WaitList::TtyRead(2));
        assert_eq!(sched.pick_next(), Pid(5));
        assert_eq!(sched.pick_next(), Pid(6));
        assert!(sched.is_queued(Pid(7)));
        // out of range terminals are ignored
        sched.park(WaitList::TtyWrite(NUM_TERMINALS), Pid(8));
        assert!(!sched.is_queued(Pid(8)));
    }
}
