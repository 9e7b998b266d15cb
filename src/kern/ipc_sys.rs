//! IPC system calls
//!
//! Thin wrappers that validate user buffers, move bytes through a bounded
//! kernel chunk and turn "queued" results from the primitives into parked
//! continuations.

use crate::arch::Machine;
use crate::config::{PIPE_LEN, WORD_SIZE};
use crate::device::tty::Terminal;
use crate::ipc::{IpcError, IpcKind};
use crate::kern::continuation::{Continuation, Step};
use crate::kern::copyio;
use crate::kern::loader::ProgramLoader;
use crate::kern::syscall_sw::{ipc_id, SyscallError};
use crate::kernel::Kernel;
use crate::mach_vm::VmProt;
use crate::types::IpcId;

impl<M: Machine, L: ProgramLoader, T: Terminal> Kernel<M, L, T> {
    /// PipeInit, LockInit and CvarInit
    pub(crate) fn sys_ipc_init(&mut self, kind: IpcKind, id_ptr: usize) -> Result<Step, SyscallError> {
        self.validate_current(id_ptr, WORD_SIZE as isize, VmProt::WRITE)?;
        let id = self.ipc.create(kind);
        let table = &self
            .procs
            .get(self.sched.current)
            .ok_or(copyio::CopyError::BadAddress)?
            .user_table;
        copyio::suword32(self.machine.memory_mut(), table, id_ptr, id.0)?;
        Ok(Step::Return(0))
    }

    fn check_len(len: isize) -> Result<usize, SyscallError> {
        usize::try_from(len).map_err(|_| SyscallError::BadArgument)
    }

    pub(crate) fn sys_pipe_read(&mut self, id: usize, buf: usize, len: isize) -> Result<Step, SyscallError> {
        let pipe = ipc_id(id)?;
        self.validate_current(buf, len, VmProt::RW)?;
        let len = Self::check_len(len)?;
        self.ipc.pipe_mut(pipe)?;
        self.pipe_read_step(pipe, buf, len, 0)
    }

    pub(crate) fn sys_pipe_write(&mut self, id: usize, buf: usize, len: isize) -> Result<Step, SyscallError> {
        let pipe = ipc_id(id)?;
        self.validate_current(buf, len, VmProt::READ)?;
        let len = Self::check_len(len)?;
        self.ipc.pipe_mut(pipe)?;
        self.pipe_write_step(pipe, buf, len, 0)
    }

    /// Read until `len` bytes have arrived, parking on each shortfall
    pub(crate) fn pipe_read_step(
        &mut self,
        pipe: IpcId,
        buf: usize,
        len: usize,
        mut done: usize,
    ) -> Result<Step, SyscallError> {
        let caller = self.sched.current;
        let mut chunk = [0u8; PIPE_LEN];
        while done < len {
            let want = (len - done).min(PIPE_LEN);
            let n = self
                .ipc
                .pipe_mut(pipe)?
                .read(caller, &mut chunk[..want], &mut self.sched.ready);
            if n > 0 {
                self.copyout_current(&chunk[..n], buf + done)?;
            }
            done += n;
            if n < want {
                return Ok(Step::park(Continuation::PipeRead { pipe, buf, len, done }));
            }
        }
        Ok(Step::Return(len as isize))
    }

    pub(crate) fn pipe_write_step(
        &mut self,
        pipe: IpcId,
        buf: usize,
        len: usize,
        mut done: usize,
    ) -> Result<Step, SyscallError> {
        let caller = self.sched.current;
        let mut chunk = [0u8; PIPE_LEN];
        while done < len {
            let want = (len - done).min(PIPE_LEN);
            self.copyin_current(buf + done, &mut chunk[..want])?;
            let n = self
                .ipc
                .pipe_mut(pipe)?
                .write(caller, &chunk[..want], &mut self.sched.ready);
            done += n;
            if n < want {
                return Ok(Step::park(Continuation::PipeWrite { pipe, buf, len, done }));
            }
        }
        Ok(Step::Return(len as isize))
    }

    pub(crate) fn lock_acquire_step(&mut self, lock: IpcId) -> Result<Step, SyscallError> {
        match self.ipc.lock_acquire(lock, self.sched.current) {
            Ok(()) => Ok(Step::Return(0)),
            Err(IpcError::WouldBlock) => Ok(Step::park(Continuation::LockAcquire { lock })),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn sys_lock_release(&mut self, id: usize) -> Result<Step, SyscallError> {
        let lock = ipc_id(id)?;
        self.ipc
            .lock_release(lock, self.sched.current, &mut self.sched.ready)?;
        Ok(Step::Return(0))
    }

    /// CvarSignal, or CvarBroadcast when `all` is set
    pub(crate) fn sys_cvar_signal(&mut self, id: usize, all: bool) -> Result<Step, SyscallError> {
        let cvar = ipc_id(id)?;
        if all {
            self.ipc.cvar_broadcast(cvar, &mut self.sched.ready)?;
        } else {
            self.ipc.cvar_signal(cvar, &mut self.sched.ready)?;
        }
        Ok(Step::Return(0))
    }

    pub(crate) fn sys_cvar_wait(&mut self, cvar_id: usize, lock_id: usize) -> Result<Step, SyscallError> {
        let cvar = ipc_id(cvar_id)?;
        let lock = ipc_id(lock_id)?;
        self.ipc
            .cvar_wait(cvar, lock, self.sched.current, &mut self.sched.ready)?;
        Ok(Step::park(Continuation::CvarWait { cvar, lock }))
    }

    pub(crate) fn sys_reclaim(&mut self, id: usize) -> Result<Step, SyscallError> {
        let id = ipc_id(id)?;
        for pid in self.ipc.reclaim(id, &mut self.sched.ready)? {
            if let Some(pcb) = self.procs.get_mut(pid) {
                pcb.pending = Some(Continuation::Reclaimed);
            }
        }
        Ok(Step::Return(0))
    }
}
