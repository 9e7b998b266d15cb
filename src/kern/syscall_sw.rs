//! System call switch
//!
//! The syscall number arrives in `UserContext::code` and up to three
//! operands in `regs[0..3]`. Handlers return a [`Step`]; any failure is
//! reported to the caller as `ERROR` (-1) in `regs[0]`.
//!
//! ## Numbering
//!
//! - 0x01-0x07: process control, memory, delay
//! - 0x21-0x22: terminal I/O
//! - 0x30-0x32: pipes
//! - 0x40-0x42: locks
//! - 0x50-0x53: condition variables
//! - 0x60: reclaim any IPC object

use core::fmt;

use crate::arch::{Machine, UserContext};
use crate::config::{ERROR, KILL};
use crate::device::tty::Terminal;
use crate::ipc::{IpcError, IpcKind};
use crate::kern::continuation::Step;
use crate::kern::copyio::CopyError;
use crate::kern::loader::ProgramLoader;
use crate::kernel::{Kernel, KernelFault};
use crate::mach_vm::VmError;
use crate::types::IpcId;

// ============================================================================
// Syscall Numbers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum SyscallOp {
    Fork = 0x01,
    Exec = 0x02,
    Exit = 0x03,
    Wait = 0x04,
    GetPid = 0x05,
    Brk = 0x06,
    Delay = 0x07,
    TtyRead = 0x21,
    TtyWrite = 0x22,
    PipeInit = 0x30,
    PipeRead = 0x31,
    PipeWrite = 0x32,
    LockInit = 0x40,
    LockAcquire = 0x41,
    LockRelease = 0x42,
    CvarInit = 0x50,
    CvarSignal = 0x51,
    CvarBroadcast = 0x52,
    CvarWait = 0x53,
    Reclaim = 0x60,
}

impl SyscallOp {
    pub const ALL: [SyscallOp; 20] = [
        SyscallOp::Fork,
        SyscallOp::Exec,
        SyscallOp::Exit,
        SyscallOp::Wait,
        SyscallOp::GetPid,
        SyscallOp::Brk,
        SyscallOp::Delay,
        SyscallOp::TtyRead,
        SyscallOp::TtyWrite,
        SyscallOp::PipeInit,
        SyscallOp::PipeRead,
        SyscallOp::PipeWrite,
        SyscallOp::LockInit,
        SyscallOp::LockAcquire,
        SyscallOp::LockRelease,
        SyscallOp::CvarInit,
        SyscallOp::CvarSignal,
        SyscallOp::CvarBroadcast,
        SyscallOp::CvarWait,
        SyscallOp::Reclaim,
    ];

    pub fn from_code(code: usize) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| *op as usize == code)
    }

    pub fn code(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            SyscallOp::Fork => "fork",
            SyscallOp::Exec => "exec",
            SyscallOp::Exit => "exit",
            SyscallOp::Wait => "wait",
            SyscallOp::GetPid => "getpid",
            SyscallOp::Brk => "brk",
            SyscallOp::Delay => "delay",
            SyscallOp::TtyRead => "tty_read",
            SyscallOp::TtyWrite => "tty_write",
            SyscallOp::PipeInit => "pipe_init",
            SyscallOp::PipeRead => "pipe_read",
            SyscallOp::PipeWrite => "pipe_write",
            SyscallOp::LockInit => "lock_init",
            SyscallOp::LockAcquire => "lock_acquire",
            SyscallOp::LockRelease => "lock_release",
            SyscallOp::CvarInit => "cvar_init",
            SyscallOp::CvarSignal => "cvar_signal",
            SyscallOp::CvarBroadcast => "cvar_broadcast",
            SyscallOp::CvarWait => "cvar_wait",
            SyscallOp::Reclaim => "reclaim",
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Why a syscall failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Operand out of range
    BadArgument,
    /// Terminal id out of range
    BadTerminal,
    /// A user pointer failed validation or copy
    Copy(CopyError),
    Vm(VmError),
    Ipc(IpcError),
    /// Wait with no live or exited children
    NoChildren,
    /// Program loader rejected the image
    LoadFailed,
    /// The idle process tried to block
    IdleBlocked,
    /// Not a syscall failure: the kernel itself cannot continue
    Fault(KernelFault),
}

impl From<CopyError> for SyscallError {
    fn from(err: CopyError) -> Self {
        SyscallError::Copy(err)
    }
}

impl From<VmError> for SyscallError {
    fn from(err: VmError) -> Self {
        SyscallError::Vm(err)
    }
}

impl From<IpcError> for SyscallError {
    fn from(err: IpcError) -> Self {
        SyscallError::Ipc(err)
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyscallError::BadArgument => write!(f, "bad argument"),
            SyscallError::BadTerminal => write!(f, "no such terminal"),
            SyscallError::Copy(err) => write!(f, "{}", err),
            SyscallError::Vm(err) => write!(f, "{}", err),
            SyscallError::Ipc(err) => write!(f, "{}", err),
            SyscallError::NoChildren => write!(f, "no children"),
            SyscallError::LoadFailed => write!(f, "program load failed"),
            SyscallError::IdleBlocked => write!(f, "idle process may not block"),
            SyscallError::Fault(fault) => write!(f, "{}", fault),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallStats {
    pub calls: u64,
    pub failures: u64,
    pub unknown: u64,
}

pub(crate) fn ipc_id(raw: usize) -> Result<IpcId, SyscallError> {
    IpcId::from_raw(raw).ok_or(SyscallError::Ipc(IpcError::NotFound))
}

// ============================================================================
// Dispatch
// ============================================================================

impl<M: Machine, L: ProgramLoader, T: Terminal> Kernel<M, L, T> {
    pub(crate) fn syscall(&mut self, uctx: &mut UserContext) -> Result<(), KernelFault> {
        let op = match SyscallOp::from_code(uctx.code) {
            Some(op) => op,
            None => {
                self.sys_stats.unknown += 1;
                ktrace!(
                    0,
                    "syscall: unknown code {:#x} from pid {}",
                    uctx.code,
                    self.sched.current
                );
                return Ok(());
            }
        };
        self.sys_stats.calls += 1;
        let [a0, a1, a2] = [uctx.regs[0], uctx.regs[1], uctx.regs[2]];
        ktrace!(
            2,
            "syscall: pid {} {}({:#x}, {:#x}, {:#x})",
            self.sched.current,
            op.name(),
            a0,
            a1,
            a2
        );

        let result = match op {
            SyscallOp::Fork => self
                .fork(uctx)
                .map(|child| Step::Return(child.as_raw() as isize)),
            SyscallOp::Exec => self.exec(uctx, a0, a1),
            SyscallOp::Exit => Ok(Step::Exit(a0 as i32)),
            SyscallOp::Wait => self.sys_wait(a0),
            SyscallOp::GetPid => Ok(Step::Return(self.sched.current.as_raw() as isize)),
            SyscallOp::Brk => self.sys_brk(a0),
            SyscallOp::Delay => self.sys_delay(a0 as isize),
            SyscallOp::TtyRead => self.sys_tty_read(a0, a1, a2 as isize),
            SyscallOp::TtyWrite => self.sys_tty_write(a0, a1, a2 as isize),
            SyscallOp::PipeInit => self.sys_ipc_init(IpcKind::Pipe, a0),
            SyscallOp::PipeRead => self.sys_pipe_read(a0, a1, a2 as isize),
            SyscallOp::PipeWrite => self.sys_pipe_write(a0, a1, a2 as isize),
            SyscallOp::LockInit => self.sys_ipc_init(IpcKind::Lock, a0),
            SyscallOp::LockAcquire => ipc_id(a0).and_then(|id| self.lock_acquire_step(id)),
            SyscallOp::LockRelease => self.sys_lock_release(a0),
            SyscallOp::CvarInit => self.sys_ipc_init(IpcKind::Cvar, a0),
            SyscallOp::CvarSignal => self.sys_cvar_signal(a0, false),
            SyscallOp::CvarBroadcast => self.sys_cvar_signal(a0, true),
            SyscallOp::CvarWait => self.sys_cvar_wait(a0, a1),
            SyscallOp::Reclaim => self.sys_reclaim(a0),
        };

        let step = match result {
            Err(SyscallError::Fault(fault)) => return Err(fault),
            Err(err) => {
                self.sys_stats.failures += 1;
                ktrace!(1, "syscall: pid {} {} failed: {}", self.sched.current, op.name(), err);
                Step::Return(ERROR)
            }
            Ok(step) => step,
        };
        self.finish(uctx, step)
    }

    /// Apply a step to the process that issued the trap
    pub(crate) fn finish(&mut self, uctx: &mut UserContext, step: Step) -> Result<(), KernelFault> {
        match step {
            Step::Return(value) => {
                uctx.set_retval(value);
                Ok(())
            }
            Step::Resume => Ok(()),
            Step::Block { list, cont } => {
                let pid = self.sched.current;
                if pid == self.sched.idle {
                    ktrace!(0, "syscall: {}", SyscallError::IdleBlocked);
                    self.ipc.forget(pid);
                    uctx.set_retval(ERROR);
                    return Ok(());
                }
                if let Some(pcb) = self.procs.get_mut(pid) {
                    pcb.pending = Some(cont);
                }
                self.suspend_and_switch(uctx, list)
            }
            Step::Exit(status) => {
                let pid = self.sched.current;
                self.terminate(pid, status);
                if self.halted {
                    return Ok(());
                }
                self.suspend_and_switch(uctx, None)
            }
        }
    }

    /// Terminate the current process as if it called exit(KILL)
    pub(crate) fn kill_current(&mut self, uctx: &mut UserContext, why: &str) -> Result<(), KernelFault> {
        ktrace!(1, "trap: killing pid {}: {}", self.sched.current, why);
        self.finish(uctx, Step::Exit(KILL))
    }
}
