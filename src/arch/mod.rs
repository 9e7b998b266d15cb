//! Machine interface
//!
//! The kernel never touches hardware directly. Everything it needs from the
//! processor is behind [`Machine`]: control register writes, translation
//! cache flushes, access to physical memory, and the raw kernel register
//! save/restore that backs a context switch.
//!
//! Trap state arrives as a [`UserContext`]; the kernel edits it in place and
//! the machine resumes whichever process the context describes on return.

pub mod sim;

use core::fmt;

pub use sim::SimMachine;

// ============================================================================
// Trap vectors
// ============================================================================

pub const TRAP_KERNEL: usize = 0;
pub const TRAP_CLOCK: usize = 1;
pub const TRAP_ILLEGAL: usize = 2;
pub const TRAP_MEMORY: usize = 3;
pub const TRAP_MATH: usize = 4;
pub const TRAP_TTY_RECEIVE: usize = 5;
pub const TRAP_TTY_TRANSMIT: usize = 6;

/// Memory trap code: no valid mapping for the address
pub const SEGV_MAPERR: usize = 1;
/// Memory trap code: mapping present but protection denies the access
pub const SEGV_ACCERR: usize = 2;

/// General purpose registers saved across a trap
pub const NUM_REGS: usize = 8;

/// Words of raw kernel register state saved by a context transfer
pub const KERNEL_CONTEXT_WORDS: usize = 16;

// ============================================================================
// Contexts
// ============================================================================

/// User-mode state captured at trap time
///
/// `vector` selects the trap class and `code` qualifies it: the syscall
/// number for kernel traps, the terminal id for terminal interrupts, the
/// fault cause for memory traps. `addr` is the faulting address.
/// Syscall operands are passed in `regs[0..3]`; the result goes back in
/// `regs[0]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserContext {
    pub vector: usize,
    pub code: usize,
    pub addr: usize,
    pub pc: usize,
    pub sp: usize,
    pub regs: [usize; NUM_REGS],
}

impl UserContext {
    /// Syscall return value as the process will see it
    pub fn retval(&self) -> isize {
        self.regs[0] as isize
    }

    pub fn set_retval(&mut self, value: isize) {
        self.regs[0] = value as usize;
    }
}

/// Raw kernel register state of a suspended process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelContext {
    pub regs: [usize; KERNEL_CONTEXT_WORDS],
}

// ============================================================================
// Control registers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    /// Region 0 page table base
    Ptbr0,
    /// Region 0 page table length
    Ptlr0,
    /// Region 1 page table base
    Ptbr1,
    /// Region 1 page table length
    Ptlr1,
    /// Non-zero turns on address translation
    VmEnable,
}

impl Register {
    pub const COUNT: usize = 5;

    pub fn index(self) -> usize {
        match self {
            Register::Ptbr0 => 0,
            Register::Ptlr0 => 1,
            Register::Ptbr1 => 2,
            Register::Ptlr1 => 3,
            Register::VmEnable => 4,
        }
    }
}

/// Translation cache flush request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbFlush {
    Region1,
    /// Single page containing this virtual address
    Page(usize),
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum HalError {
    /// Saving the outgoing kernel context failed
    ContextSave = -1,
    /// Restoring the incoming kernel context failed
    ContextRestore = -2,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::ContextSave => write!(f, "kernel context save failed"),
            HalError::ContextRestore => write!(f, "kernel context restore failed"),
        }
    }
}

// ============================================================================
// Machine trait
// ============================================================================

/// Hardware capability used by the kernel
pub trait Machine {
    fn write_register(&mut self, reg: Register, value: usize);

    fn flush_tlb(&mut self, what: TlbFlush);

    /// Physical memory
    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];

    /// Capture the current kernel register state
    fn save_context(&mut self, into: &mut KernelContext) -> Result<(), HalError>;

    /// Resume execution on a previously captured kernel register state
    fn restore_context(&mut self, from: &KernelContext) -> Result<(), HalError>;

    /// Stop the processor for good
    fn halt(&mut self);
}
