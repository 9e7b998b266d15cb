//! Continuation-based blocking
//!
//! A syscall that cannot finish records what is left to do as a
//! [`Continuation`] in the caller's PCB and hands the processor to the
//! scheduler. When the process is next dispatched the continuation runs
//! before control returns to user mode, and either finishes the call or
//! blocks again. No kernel stack is kept alive across the wait, so the whole
//! kernel stays a single run-to-completion loop.

use crate::arch::Machine;
use crate::config::ERROR;
use crate::device::tty::Terminal;
use crate::ipc::IpcError;
use crate::kern::loader::ProgramLoader;
use crate::kern::sched_prim::WaitList;
use crate::kern::syscall_sw::SyscallError;
use crate::kernel::Kernel;
use crate::types::IpcId;

// ============================================================================
// Continuation Type
// ============================================================================

/// Remainder of a blocked syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Delay elapsed; return 0
    Delay,
    /// Reap a child once one has exited
    Wait { status_ptr: usize },
    /// Consume from the terminal's oldest received line
    TtyRead { tty: usize, buf: usize, len: usize },
    /// Send the rest of the buffer once the terminal is ready again
    TtyWrite { tty: usize, buf: usize, len: usize, sent: usize },
    PipeRead { pipe: IpcId, buf: usize, len: usize, done: usize },
    PipeWrite { pipe: IpcId, buf: usize, len: usize, done: usize },
    LockAcquire { lock: IpcId },
    /// Signalled; re-acquire `lock`
    CvarWait { cvar: IpcId, lock: IpcId },
    /// The object the call was queued on was reclaimed
    Reclaimed,
}

// ============================================================================
// Step
// ============================================================================

/// What the dispatcher does after a syscall handler or continuation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Place the value in the return register and resume the process
    Return(isize),
    /// Resume the process with its context as is
    Resume,
    /// Park the process on `list` (or nowhere) and run `cont` when it is
    /// dispatched again
    Block {
        list: Option<WaitList>,
        cont: Continuation,
    },
    /// Terminate the process with this status
    Exit(i32),
}

impl Step {
    /// Park outside every scheduler list; something else will wake the process
    pub fn park(cont: Continuation) -> Self {
        Step::Block { list: None, cont }
    }

    pub fn park_on(list: WaitList, cont: Continuation) -> Self {
        Step::Block {
            list: Some(list),
            cont,
        }
    }

    /// Collapse a handler result; every failure becomes `ERROR` for the caller
    pub(crate) fn from_result(result: Result<Step, SyscallError>) -> Self {
        match result {
            Ok(step) => step,
            Err(err) => {
                ktrace!(1, "syscall: failed: {}", err);
                Step::Return(ERROR)
            }
        }
    }
}

impl<M: Machine, L: ProgramLoader, T: Terminal> Kernel<M, L, T> {
    /// Run the continuation of the process that was just dispatched
    pub(crate) fn resume(&mut self, cont: Continuation) -> Result<Step, SyscallError> {
        ktrace!(3, "cont: pid {} resumes {:?}", self.sched.current, cont);
        match cont {
            Continuation::Delay => Ok(Step::Return(0)),
            Continuation::Wait { status_ptr } => self.reap_child(status_ptr),
            Continuation::TtyRead { tty, buf, len } => self.tty_read_step(tty, buf, len),
            Continuation::TtyWrite {
                tty,
                buf,
                len,
                sent,
            } => self.tty_write_step(tty, buf, len, sent),
            Continuation::PipeRead {
                pipe,
                buf,
                len,
                done,
            } => self.pipe_read_step(pipe, buf, len, done),
            Continuation::PipeWrite {
                pipe,
                buf,
                len,
                done,
            } => self.pipe_write_step(pipe, buf, len, done),
            Continuation::LockAcquire { lock } => self.lock_acquire_step(lock),
            Continuation::CvarWait { lock, .. } => self.lock_acquire_step(lock),
            Continuation::Reclaimed => Err(SyscallError::Ipc(IpcError::NotFound)),
        }
    }
}
