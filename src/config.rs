//! Machine layout constants and boot configuration
//!
//! The virtual address space is split in two regions. Region 0 holds the
//! kernel image, a scratch page used for cross-address-space copies, and the
//! per-process kernel stack window at its very top. Region 1 holds the
//! running process's user image: text and data from the bottom, a heap that
//! grows up to `brk`, and a stack that grows down from the region limit.

use alloc::string::String;
use alloc::vec::Vec;

// ============================================================================
// Page geometry
// ============================================================================

pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

// ============================================================================
// Virtual regions
// ============================================================================

pub const VMEM_0_BASE: usize = 0;
pub const VMEM_0_LIMIT: usize = 0x10_0000;
pub const VMEM_1_BASE: usize = VMEM_0_LIMIT;
pub const VMEM_1_LIMIT: usize = 0x20_0000;

/// Entries in the kernel (region 0) page table
pub const KERNEL_PAGES: usize = (VMEM_0_LIMIT - VMEM_0_BASE) >> PAGE_SHIFT;
/// Entries in each user (region 1) page table
pub const USER_PAGES: usize = (VMEM_1_LIMIT - VMEM_1_BASE) >> PAGE_SHIFT;

pub const KERNEL_STACK_LIMIT: usize = VMEM_0_LIMIT;
pub const KERNEL_STACK_PAGES: usize = 2;
pub const KERNEL_STACK_BASE: usize = KERNEL_STACK_LIMIT - KERNEL_STACK_PAGES * PAGE_SIZE;
pub const KERNEL_STACK_BASE_PAGE: usize = KERNEL_STACK_BASE >> PAGE_SHIFT;

/// Region 0 page remapped on demand to reach frames of another address space
pub const SCRATCH_PAGE: usize = KERNEL_STACK_BASE_PAGE - 1;
pub const SCRATCH_VA: usize = SCRATCH_PAGE << PAGE_SHIFT;

// ============================================================================
// Devices and IPC
// ============================================================================

pub const NUM_TERMINALS: usize = 4;
pub const TERMINAL_MAX_LINE: usize = 1024;
pub const PIPE_LEN: usize = 1024;

/// Size of a user-visible machine word (pointers in argument vectors, status words)
pub const WORD_SIZE: usize = 4;

// ============================================================================
// Return conventions
// ============================================================================

/// Generic syscall failure value
pub const ERROR: isize = -1;
/// Exit status recorded for a process killed by the kernel
pub const KILL: i32 = -2;

#[inline]
pub const fn page_up(addr: usize) -> usize {
    (addr + PAGE_MASK) & !PAGE_MASK
}

#[inline]
pub const fn page_down(addr: usize) -> usize {
    addr & !PAGE_MASK
}

/// Index of a region 1 address in a user page table
#[inline]
pub const fn user_page(va: usize) -> usize {
    (va - VMEM_1_BASE) >> PAGE_SHIFT
}

/// First address of a user page table slot
#[inline]
pub const fn user_va(page: usize) -> usize {
    VMEM_1_BASE + (page << PAGE_SHIFT)
}

#[inline]
pub const fn is_user_range(va: usize, len: usize) -> bool {
    va >= VMEM_1_BASE && va <= VMEM_1_LIMIT && len <= VMEM_1_LIMIT - va
}

// ============================================================================
// Boot configuration
// ============================================================================

/// Parameters fixed at boot time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Bytes of physical memory handed to the frame allocator
    pub pmem_size: usize,
    /// First byte of kernel data; everything below is kernel text
    pub kernel_data_start: usize,
    /// End of the kernel heap at boot
    pub kernel_data_end: usize,
    /// Program run when nothing else is runnable
    pub idle_program: String,
    /// First user program
    pub init_program: String,
    /// Arguments passed to the first user program (argv[0] included)
    pub init_args: Vec<String>,
    /// Console trace threshold, 0 (errors only) to 3 (everything)
    pub trace_level: u8,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            pmem_size: 2 * 1024 * 1024,
            kernel_data_start: 0x8000,
            kernel_data_end: 0x1_0000,
            idle_program: String::from("program/idle"),
            init_program: String::from("program/init"),
            init_args: alloc::vec![String::from("init")],
            trace_level: 1,
        }
    }
}

impl KernelConfig {
    pub fn with_pmem_size(mut self, bytes: usize) -> Self {
        self.pmem_size = bytes;
        self
    }

    pub fn with_idle(mut self, path: &str) -> Self {
        self.idle_program = String::from(path);
        self
    }

    /// Set the init program; `args` becomes its argument vector
    pub fn with_init(mut self, path: &str, args: &[&str]) -> Self {
        self.init_program = String::from(path);
        self.init_args = args.iter().map(|a| String::from(*a)).collect();
        self
    }

    pub fn with_trace_level(mut self, level: u8) -> Self {
        self.trace_level = level;
        self
    }

    /// Number of physical frames managed
    pub fn frames(&self) -> usize {
        self.pmem_size >> PAGE_SHIFT
    }
}
