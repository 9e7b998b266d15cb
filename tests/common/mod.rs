//! Shared harness for kernel integration tests
//!
//! Boots a kernel on the simulated machine and drives it the way hardware
//! would: by filling in a user context and trapping.

#![allow(dead_code)]

use kestrel::arch::{TRAP_CLOCK, TRAP_KERNEL};
use kestrel::config::PAGE_SIZE;
use kestrel::{
    ImageLoader, Kernel, KernelConfig, KernelFault, ProgramImage, ProgramLoader, SimMachine, SimTerminal, SyscallOp,
    UserContext,
};

/// Start of init's zero-filled data page
pub const DATA: usize = 0x10_2000;

pub fn images() -> ImageLoader {
    ImageLoader::new()
        .with_image("program/idle", ProgramImage::new(&[0u8; 16]))
        .with_image("program/init", ProgramImage::new(&[0u8; 16]).with_bss(PAGE_SIZE))
        .with_image(
            "prog",
            ProgramImage::new(&[0xaa; 16]).with_data(b"prog-data").with_bss(100),
        )
}

pub fn config() -> KernelConfig {
    KernelConfig::default().with_trace_level(0)
}

pub struct Sim<L: ProgramLoader = ImageLoader> {
    pub kernel: Kernel<SimMachine, L, SimTerminal>,
    /// Context of whichever process the kernel last returned to
    pub ctx: UserContext,
}

impl Sim {
    pub fn boot() -> Self {
        Self::boot_with(images())
    }
}

impl<L: ProgramLoader> Sim<L> {
    pub fn boot_with(loader: L) -> Self {
        let config = config();
        let machine = SimMachine::new(config.pmem_size);
        let (kernel, ctx) = Kernel::boot(&config, machine, loader, SimTerminal::new()).expect("boot failed");
        Self { kernel, ctx }
    }

    pub fn trap(&mut self, vector: usize, code: usize, addr: usize) -> Result<(), KernelFault> {
        self.ctx.vector = vector;
        self.ctx.code = code;
        self.ctx.addr = addr;
        self.kernel.trap(&mut self.ctx)
    }

    /// Issue a syscall from the current process and return what lands in
    /// the return register of whichever process runs next
    pub fn syscall(&mut self, op: SyscallOp, args: &[usize]) -> Result<isize, KernelFault> {
        for (reg, arg) in self.ctx.regs.iter_mut().zip(args) {
            *reg = *arg;
        }
        self.trap(TRAP_KERNEL, op.code(), 0)?;
        Ok(self.ctx.retval())
    }

    pub fn call(&mut self, op: SyscallOp, args: &[usize]) -> isize {
        self.syscall(op, args).expect("kernel fault")
    }

    pub fn tick(&mut self) {
        self.trap(TRAP_CLOCK, 0, 0).expect("kernel fault");
    }

    pub fn pid(&self) -> u32 {
        self.kernel.current_pid().0
    }

    pub fn write(&mut self, va: usize, bytes: &[u8]) {
        self.kernel.write_user(va, bytes).expect("user write");
    }

    pub fn read(&self, va: usize, len: usize) -> Vec<u8> {
        self.kernel.read_user(va, len).expect("user read")
    }

    /// Signed 32-bit word in the current process
    pub fn word(&self, va: usize) -> i32 {
        let bytes = self.read(va, 4);
        i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn write_word(&mut self, va: usize, value: u32) {
        self.write(va, &value.to_le_bytes());
    }

    /// Fork from the current process and run the parent until it blocks in
    /// a delay, leaving the child current
    pub fn fork_and_yield(&mut self) -> u32 {
        let child = self.call(SyscallOp::Fork, &[]);
        assert!(child > 0);
        assert_eq!(self.call(SyscallOp::Delay, &[1]), 0);
        assert_eq!(self.pid(), child as u32);
        child as u32
    }

    pub fn assert_consistent(&self) {
        assert!(self.kernel.frames_consistent(), "frame bookkeeping diverged");
    }
}
