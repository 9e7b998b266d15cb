//! Kern subsystem - Core kernel primitives
//!
//! Process table, scheduling, blocking continuations, the syscall switch
//! and the user-memory copy routines.

pub mod continuation;
pub mod copyio;
pub mod ipc_sys;
pub mod lifecycle;
pub mod loader;
pub mod queue;
pub mod sched_prim;
pub mod startup;
pub mod syscall_sw;
pub mod task;

pub use continuation::{Continuation, Step};
pub use copyio::{copyin, copyinstr, copyout, CopyError, CopyResult};
pub use loader::{ImageLoader, LoadStatus, LoadTarget, Layout, ProgramImage, ProgramLoader};
pub use queue::BlockQueue;
pub use sched_prim::{SchedStats, Scheduler, WaitList};
pub use syscall_sw::{SyscallError, SyscallOp, SyscallStats};
pub use task::{Pcb, ProcState, ProcTable};
