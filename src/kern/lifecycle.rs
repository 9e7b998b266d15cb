//! Process lifecycle: fork, exec, exit, wait, brk and stack growth
//!
//! Frame demand is checked before anything is allocated, so a failed fork
//! or growth leaves the frame bitmap and every page table as they were.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::{Machine, TlbFlush, UserContext};
use crate::config::{
    page_down, user_page, user_va, KERNEL_STACK_BASE, KERNEL_STACK_PAGES, KILL, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE,
    SCRATCH_PAGE, SCRATCH_VA, USER_PAGES, VMEM_0_BASE, VMEM_0_LIMIT, VMEM_1_BASE, WORD_SIZE,
};
use crate::device::tty::Terminal;
use crate::kern::continuation::{Continuation, Step};
use crate::kern::copyio;
use crate::kern::loader::{Layout, LoadStatus, LoadTarget, ProgramLoader};
use crate::kern::syscall_sw::SyscallError;
use crate::kern::task::ProcState;
use crate::kernel::{Kernel, KernelFault};
use crate::mach_vm::{Pte, VmError, VmProt};
use crate::trap::FaultCause;
use crate::types::Pid;

impl<M: Machine, L: ProgramLoader, T: Terminal> Kernel<M, L, T> {
    // ========================================================================
    // Physical copies
    // ========================================================================

    /// Physical address behind a kernel-visible virtual address
    ///
    /// Region 0 goes through the kernel table; region 1 through the current
    /// process's user table.
    pub(crate) fn kernel_phys(&self, va: usize) -> Option<usize> {
        if va < VMEM_0_LIMIT {
            self.kernel_table.translate(VMEM_0_BASE, va, VmProt::empty())
        } else {
            self.procs
                .get(self.sched.current)?
                .user_table
                .translate(VMEM_1_BASE, va, VmProt::empty())
        }
    }

    /// Copy the page at `src_va` into frame `dst_pfn` through the scratch page
    pub(crate) fn copy_through_scratch(&mut self, dst_pfn: usize, src_va: usize) -> Result<(), VmError> {
        let src = self.kernel_phys(page_down(src_va)).ok_or(VmError::NotMapped)?;
        let saved = self.kernel_table.get(SCRATCH_PAGE).copied().unwrap_or(Pte::INVALID);
        self.kernel_table.set(SCRATCH_PAGE, Pte::new(dst_pfn, VmProt::RW));
        self.machine.flush_tlb(TlbFlush::Page(SCRATCH_VA));

        let copied = match self.kernel_table.translate(VMEM_0_BASE, SCRATCH_VA, VmProt::WRITE) {
            Some(dst) => {
                let memory = self.machine.memory_mut();
                if src + PAGE_SIZE <= memory.len() && dst + PAGE_SIZE <= memory.len() {
                    memory.copy_within(src..src + PAGE_SIZE, dst);
                    Ok(())
                } else {
                    Err(VmError::BadFrame)
                }
            }
            None => Err(VmError::NotMapped),
        };

        self.kernel_table.set(SCRATCH_PAGE, saved);
        self.machine.flush_tlb(TlbFlush::Page(SCRATCH_VA));
        copied
    }

    // ========================================================================
    // Fork
    // ========================================================================

    /// Duplicate the current process; the child resumes with 0
    pub(crate) fn fork(&mut self, uctx: &UserContext) -> Result<Pid, SyscallError> {
        let parent = self.sched.current;
        let pcb = self
            .procs
            .get(parent)
            .ok_or(SyscallError::Fault(KernelFault::MissingProcess(parent)))?;
        let need = pcb.user_table.valid_count() + KERNEL_STACK_PAGES;
        if !self.frames.check_capacity(need) {
            ktrace!(1, "fork: pid {} needs {} frames, {} free", parent, need, self.frames.free_frames());
            return Err(VmError::OutOfMemory.into());
        }
        let layout = (pcb.data_end, pcb.brk, pcb.stack_low);

        let mut child_ctx = uctx.clone();
        child_ctx.set_retval(0);
        let child = self.procs.create(&mut self.frames, &child_ctx)?;
        if let Some(pcb) = self.procs.get_mut(child) {
            (pcb.data_end, pcb.brk, pcb.stack_low) = layout;
        }

        if let Err(err) = self.populate_child(parent, child) {
            self.discard(child);
            return Err(err);
        }

        if let Some(pcb) = self.procs.get_mut(child) {
            pcb.parent = Some(parent);
            pcb.state = ProcState::Ready;
        }
        if let Some(pcb) = self.procs.get_mut(parent) {
            pcb.children.enqueue(child);
        }
        self.sched.make_ready(child);
        ktrace!(1, "fork: pid {} -> child {}", parent, child);
        Ok(child)
    }

    fn populate_child(&mut self, parent: Pid, child: Pid) -> Result<(), SyscallError> {
        let pages: Vec<(usize, VmProt)> = self
            .procs
            .get(parent)
            .map(|pcb| pcb.user_table.valid_entries().map(|(slot, pte)| (slot, pte.prot)).collect())
            .unwrap_or_default();

        for (slot, prot) in pages {
            let pcb = self
                .procs
                .get_mut(child)
                .ok_or(SyscallError::Fault(KernelFault::MissingProcess(child)))?;
            self.frames.allocate(&mut pcb.user_table, slot, 1, prot)?;
            let pfn = pcb.user_table.get(slot).map(|pte| pte.pfn).ok_or(VmError::NotMapped)?;
            self.copy_through_scratch(pfn, user_va(slot))?;
        }

        for i in 0..KERNEL_STACK_PAGES {
            let pfn = self
                .procs
                .get(child)
                .and_then(|pcb| pcb.kstack.get(i))
                .map(|pte| pte.pfn)
                .ok_or(VmError::NotMapped)?;
            self.copy_through_scratch(pfn, KERNEL_STACK_BASE + i * PAGE_SIZE)?;
        }

        let saved = match self.procs.get_mut(child) {
            Some(pcb) => self.machine.save_context(&mut pcb.kernel_ctx),
            None => return Err(SyscallError::Fault(KernelFault::MissingProcess(child))),
        };
        saved.map_err(|err| SyscallError::Fault(self.transfer_failed(err)))
    }

    /// Free a child that never became runnable
    fn discard(&mut self, pid: Pid) {
        if let Some(mut pcb) = self.procs.remove(pid) {
            self.frames.deallocate(&mut pcb.user_table, 0, USER_PAGES);
            self.frames.deallocate(&mut pcb.kstack, 0, KERNEL_STACK_PAGES);
        }
    }

    // ========================================================================
    // Exec
    // ========================================================================

    pub(crate) fn exec(&mut self, uctx: &mut UserContext, path_ptr: usize, argv_ptr: usize) -> Result<Step, SyscallError> {
        let pid = self.sched.current;
        let (path, args) = {
            let table = &self
                .procs
                .get(pid)
                .ok_or(SyscallError::Fault(KernelFault::MissingProcess(pid)))?
                .user_table;
            let memory = self.machine.memory();
            let path = copyio::copyinstr(memory, table, path_ptr)?;
            let args = copyio::validate_vector(memory, table, argv_ptr)?
                .into_iter()
                .map(|ptr| copyio::copyinstr(memory, table, ptr))
                .collect::<Result<Vec<String>, _>>()?;
            (path, args)
        };

        match self.load_program(pid, &path, &args)? {
            LoadStatus::Success => {
                let pcb = self
                    .procs
                    .get(pid)
                    .ok_or(SyscallError::Fault(KernelFault::MissingProcess(pid)))?;
                *uctx = pcb.user_ctx.clone();
                self.machine.flush_tlb(TlbFlush::Region1);
                ktrace!(1, "exec: pid {} now runs {}", pid, path);
                Ok(Step::Resume)
            }
            LoadStatus::Error => Err(SyscallError::LoadFailed),
            LoadStatus::MustTerminate => {
                ktrace!(0, "exec: pid {} lost its image loading {}", pid, path);
                Ok(Step::Exit(KILL))
            }
        }
    }

    /// Run the loader against `pid`'s address space
    ///
    /// On success the new layout and initial user context are recorded in
    /// the PCB.
    pub(crate) fn load_program(&mut self, pid: Pid, path: &str, args: &[String]) -> Result<LoadStatus, SyscallError> {
        let pcb = self
            .procs
            .get_mut(pid)
            .ok_or(SyscallError::Fault(KernelFault::MissingProcess(pid)))?;
        let layout = Layout {
            data_end: pcb.data_end,
            brk: pcb.brk,
            stack_low: pcb.stack_low,
        };
        let mut target = LoadTarget::new(
            &mut self.frames,
            self.machine.memory_mut(),
            &mut pcb.user_table,
            layout,
            UserContext::default(),
        );
        let status = self.loader.load(path, args, &mut target);
        let (layout, ctx) = target.finish();
        if status == LoadStatus::Success {
            pcb.data_end = layout.data_end;
            pcb.brk = layout.brk;
            pcb.stack_low = layout.stack_low;
            pcb.user_ctx = ctx;
        }
        Ok(status)
    }

    // ========================================================================
    // Exit and wait
    // ========================================================================

    /// Finalize `pid` with `status`
    ///
    /// The caller switches away afterwards; the process is never picked
    /// again.
    pub(crate) fn terminate(&mut self, pid: Pid, status: i32) {
        if pid == self.sched.idle {
            self.halt("idle process terminated");
            return;
        }
        let Some(pcb) = self.procs.get_mut(pid) else {
            return;
        };
        self.frames.deallocate(&mut pcb.user_table, 0, USER_PAGES);
        self.frames.deallocate(&mut pcb.kstack, 0, KERNEL_STACK_PAGES);
        pcb.zombie = true;
        pcb.exit_status = status;
        pcb.pending = None;
        let parent = pcb.parent;
        let orphans = pcb.children.take_all();
        let zombies = pcb.dead_children.take_all();

        for child in orphans {
            if let Some(child) = self.procs.get_mut(child) {
                child.parent = None;
            }
        }
        for zombie in zombies {
            self.procs.remove(zombie);
        }
        self.ipc.forget(pid);

        match parent.and_then(|ppid| self.procs.get_mut(ppid)) {
            Some(ppcb) => {
                ppcb.children.remove(&pid);
                ppcb.dead_children.enqueue(pid);
                if ppcb.state == ProcState::Wait {
                    ppcb.state = ProcState::Ready;
                    let ppid = ppcb.pid;
                    self.sched.make_ready(ppid);
                }
            }
            None => {
                self.procs.remove(pid);
            }
        }
        ktrace!(1, "exit: pid {} status {}", pid, status);

        if pid == self.init {
            self.halt("init exited");
        }
    }

    pub(crate) fn sys_wait(&mut self, status_ptr: usize) -> Result<Step, SyscallError> {
        self.validate_current(status_ptr, WORD_SIZE as isize, VmProt::RW)?;
        self.reap_child(status_ptr)
    }

    /// Collect the oldest exited child, or wait for one
    pub(crate) fn reap_child(&mut self, status_ptr: usize) -> Result<Step, SyscallError> {
        let pcb = self.current_pcb_mut()?;
        pcb.state = ProcState::Ready;
        let Some(child) = pcb.dead_children.dequeue() else {
            if !pcb.has_children() {
                return Err(SyscallError::NoChildren);
            }
            pcb.state = ProcState::Wait;
            return Ok(Step::park(Continuation::Wait { status_ptr }));
        };
        let status = self.procs.remove(child).map_or(KILL, |zombie| zombie.exit_status);
        self.copyout_current(&status.to_le_bytes(), status_ptr)?;
        ktrace!(2, "wait: pid {} reaped {} status {}", self.sched.current, child, status);
        Ok(Step::Return(child.as_raw() as isize))
    }

    // ========================================================================
    // Memory growth
    // ========================================================================

    pub(crate) fn sys_brk(&mut self, addr: usize) -> Result<Step, SyscallError> {
        let target = addr.checked_add(PAGE_MASK).map(page_down).ok_or(SyscallError::BadArgument)?;
        let pid = self.sched.current;
        let pcb = self
            .procs
            .get_mut(pid)
            .ok_or(SyscallError::Fault(KernelFault::MissingProcess(pid)))?;
        if target <= pcb.data_end {
            ktrace!(1, "brk: pid {} {:#x} is below the data end", pid, target);
            return Err(SyscallError::BadArgument);
        }
        if target.saturating_add(PAGE_SIZE) > pcb.stack_low {
            ktrace!(1, "brk: pid {} {:#x} reaches the stack guard", pid, target);
            return Err(SyscallError::BadArgument);
        }

        if target >= pcb.brk {
            let count = (target - pcb.brk) >> PAGE_SHIFT;
            self.frames
                .allocate(&mut pcb.user_table, user_page(pcb.brk), count, VmProt::RW)?;
        } else {
            let count = (pcb.brk - target) >> PAGE_SHIFT;
            self.frames.deallocate(&mut pcb.user_table, user_page(target), count);
            self.machine.flush_tlb(TlbFlush::Region1);
        }
        pcb.brk = target;
        Ok(Step::Return(0))
    }

    /// Memory trap: grow the stack or kill the process
    pub(crate) fn memory_fault(&mut self, uctx: &mut UserContext, addr: usize, cause: FaultCause) -> Result<(), KernelFault> {
        let pid = self.sched.current;
        let page = page_down(addr);
        if cause == FaultCause::MapErr {
            if let Some(pcb) = self.procs.get_mut(pid) {
                if pcb.brk < page && page < pcb.stack_low {
                    let count = (pcb.stack_low - page) >> PAGE_SHIFT;
                    match self.frames.allocate(&mut pcb.user_table, user_page(page), count, VmProt::RW) {
                        Ok(()) => {
                            ktrace!(2, "fault: pid {} stack grows to {:#x}", pid, page);
                            pcb.stack_low = page;
                            return Ok(());
                        }
                        Err(err) => {
                            return self.kill_current(uctx, if err == VmError::OutOfMemory {
                                "no memory for stack growth"
                            } else {
                                "stack growth failed"
                            });
                        }
                    }
                }
            }
        }
        ktrace!(0, "fault: pid {} bad access at {:#x} ({:?})", pid, addr, cause);
        self.kill_current(uctx, "invalid memory access")
    }
}
