//! Kernel Startup - Bootstrap sequence
//!
//! ## Startup Sequence
//!
//! 1. Console trace level
//! 2. Region 0: identity-map kernel text (R|X), kernel data (R|W) and the
//!    boot kernel stack, reserving their frames
//! 3. Page-table registers, then enable translation
//! 4. Idle process: own kernel stack, idle program, a copy of the boot
//!    kernel stack and a saved kernel context
//! 5. Init process: takes over the boot kernel stack, runs the init program
//!
//! Boot returns the init process's user context; the caller "returns to
//! user mode" by feeding it back through [`Kernel::trap`].

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::{Machine, Register, UserContext};
use crate::config::{
    page_down, page_up, KernelConfig, KERNEL_PAGES, KERNEL_STACK_BASE, KERNEL_STACK_BASE_PAGE, KERNEL_STACK_PAGES,
    PAGE_SHIFT, PAGE_SIZE, SCRATCH_VA, USER_PAGES,
};
use crate::console;
use crate::device::tty::Terminal;
use crate::ipc::IpcRegistry;
use crate::kern::loader::{LoadStatus, ProgramLoader};
use crate::kern::sched_prim::Scheduler;
use crate::kern::syscall_sw::SyscallStats;
use crate::kern::task::{ProcState, ProcTable};
use crate::kernel::{BootError, Kernel};
use crate::mach_vm::{FrameAllocator, PageTable, Pte, VmProt};
use crate::types::Pid;

impl<M: Machine, L: ProgramLoader, T: Terminal> Kernel<M, L, T> {
    /// Bring the kernel up and return the context init starts in
    pub fn boot(config: &KernelConfig, machine: M, loader: L, terminal: T) -> Result<(Self, UserContext), BootError> {
        console::set_trace_level(config.trace_level);
        let total = config.frames();
        if total < KERNEL_PAGES || machine.memory().len() < config.pmem_size {
            return Err(BootError::MemoryTooSmall { frames: total });
        }
        let text_end = page_down(config.kernel_data_start);
        let data_end = page_up(config.kernel_data_end);
        if text_end == 0 || text_end > data_end || data_end > SCRATCH_VA {
            return Err(BootError::KernelLayout);
        }

        let mut frames = FrameAllocator::new(total);
        let mut kernel_table = PageTable::new(KERNEL_PAGES);
        let text = 0..text_end >> PAGE_SHIFT;
        let data = text.end..data_end >> PAGE_SHIFT;
        let kstack = KERNEL_STACK_BASE_PAGE..KERNEL_STACK_BASE_PAGE + KERNEL_STACK_PAGES;
        for (pages, prot) in [(text, VmProt::RX), (data, VmProt::RW), (kstack, VmProt::RW)] {
            for page in pages {
                frames.reserve(page).map_err(|_| BootError::OutOfMemory)?;
                kernel_table.set(page, Pte::new(page, prot));
            }
        }
        ktrace!(
            1,
            "boot: {} frames, kernel text {:#x} data {:#x}..{:#x}",
            total,
            text_end,
            text_end,
            data_end
        );

        let mut kernel = Self {
            machine,
            loader,
            terminal,
            frames,
            kernel_table,
            procs: ProcTable::new(),
            sched: Scheduler::new(Pid::default(), Pid::default()),
            ipc: IpcRegistry::new(),
            ttys: Default::default(),
            init: Pid::default(),
            halted: false,
            sys_stats: SyscallStats::default(),
        };
        kernel.machine.write_register(Register::Ptbr0, 0);
        kernel.machine.write_register(Register::Ptlr0, KERNEL_PAGES);
        kernel.machine.write_register(Register::Ptlr1, USER_PAGES);
        kernel.machine.write_register(Register::VmEnable, 1);

        let idle = kernel.start_idle(config)?;
        let init = kernel.start_init(config)?;
        kernel.sched.current = init;
        kernel.init = init;
        kernel.machine.write_register(Register::Ptbr1, init.as_raw());

        let uctx = kernel
            .procs
            .get(init)
            .map(|pcb| pcb.user_ctx.clone())
            .ok_or_else(|| BootError::Load(config.init_program.clone()))?;
        ktrace!(1, "boot: idle {} init {}, {} frames free", idle, init, kernel.frames.free_frames());
        Ok((kernel, uctx))
    }

    fn boot_load(&mut self, pid: Pid, path: &str, args: &[String]) -> Result<(), BootError> {
        match self.load_program(pid, path, args) {
            Ok(LoadStatus::Success) => {
                if let Some(pcb) = self.procs.get_mut(pid) {
                    pcb.state = ProcState::Ready;
                }
                Ok(())
            }
            _ => Err(BootError::Load(String::from(path))),
        }
    }

    fn start_idle(&mut self, config: &KernelConfig) -> Result<Pid, BootError> {
        let idle = self
            .procs
            .create(&mut self.frames, &UserContext::default())
            .map_err(|_| BootError::OutOfMemory)?;
        self.sched.idle = idle;
        self.sched.current = idle;
        let args: Vec<String> = alloc::vec![config.idle_program.clone()];
        self.boot_load(idle, &config.idle_program, &args)?;

        for i in 0..KERNEL_STACK_PAGES {
            let pfn = self
                .procs
                .get(idle)
                .and_then(|pcb| pcb.kstack.get(i))
                .map(|pte| pte.pfn)
                .ok_or(BootError::OutOfMemory)?;
            self.copy_through_scratch(pfn, KERNEL_STACK_BASE + i * PAGE_SIZE)
                .map_err(|_| BootError::OutOfMemory)?;
        }
        let saved = match self.procs.get_mut(idle) {
            Some(pcb) => self.machine.save_context(&mut pcb.kernel_ctx),
            None => return Err(BootError::OutOfMemory),
        };
        saved.map_err(BootError::Context)?;
        ktrace!(2, "boot: idle is pid {}", idle);
        Ok(idle)
    }

    fn start_init(&mut self, config: &KernelConfig) -> Result<Pid, BootError> {
        let mut kstack = PageTable::new(KERNEL_STACK_PAGES);
        for i in 0..KERNEL_STACK_PAGES {
            if let Some(pte) = self.kernel_table.get(KERNEL_STACK_BASE_PAGE + i) {
                kstack.set(i, *pte);
            }
        }
        let init = self.procs.adopt(&UserContext::default(), kstack);
        self.sched.current = init;
        self.boot_load(init, &config.init_program, &config.init_args)?;
        ktrace!(2, "boot: init is pid {} running {}", init, config.init_program);
        Ok(init)
    }
}
