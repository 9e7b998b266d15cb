//! Kestrel - a paged multiprogramming kernel core
//!
//! One CPU, one pool of physical frames, many user processes each with a
//! private paged address space. Processes talk to the kernel through a
//! synchronous syscall interface covering process control, heap growth,
//! delays, terminals, pipes, locks and condition variables.
//!
//! The hardware is reached only through [`arch::Machine`], programs are
//! loaded through [`kern::loader::ProgramLoader`] and terminals through
//! [`device::Terminal`], so the whole kernel runs on a host against the
//! simulated implementations for testing.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel-appropriate clippy configuration
// Hardware register code often uses explicit bit shifts for documentation
#![allow(clippy::identity_op)]
// Large enum variants are expected for IPC object bodies
#![allow(clippy::large_enum_variant)]

extern crate alloc;

// Logging macros are used by every module below
#[macro_use]
pub mod console;

pub mod arch;
pub mod config;
pub mod device;
pub mod ipc;
pub mod kern;
pub mod kernel;
pub mod mach_vm;
pub mod trap;
pub mod types;

pub use arch::{Machine, SimMachine, UserContext};
pub use config::KernelConfig;
pub use device::{SimTerminal, Terminal};
pub use kern::loader::{ImageLoader, ProgramImage, ProgramLoader};
pub use kern::syscall_sw::SyscallOp;
pub use kernel::{BootError, Kernel, KernelFault};
pub use types::{IpcId, Pid};

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "Kestrel";
