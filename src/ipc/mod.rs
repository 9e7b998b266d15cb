//! Blocking inter-process communication
//!
//! Pipes, locks and condition variables share one id space and live in a
//! single registry. Every primitive is non-blocking at this layer: when it
//! cannot finish it queues the caller on the object's own wait list and says
//! so, and the syscall layer parks the process. Waking moves pids onto the
//! scheduler's ready queue, which is passed in by the caller.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

pub mod cvar;
pub mod lock;
pub mod pipe;

pub use cvar::Cvar;
pub use lock::Lock;
pub use pipe::Pipe;

use crate::kern::queue::BlockQueue;
use crate::types::{IpcId, Pid};

/// IPC error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum IpcError {
    /// No object of the requested kind has this id
    NotFound = -1,
    /// Lock released by a process that does not hold it
    NotOwner = -2,
    /// Caller has been queued and must be parked
    WouldBlock = -3,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::NotFound => write!(f, "no such IPC object"),
            IpcError::NotOwner => write!(f, "lock not held by caller"),
            IpcError::WouldBlock => write!(f, "operation would block"),
        }
    }
}

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcKind {
    Pipe,
    Lock,
    Cvar,
}

#[derive(Debug, Clone)]
pub enum IpcObject {
    Pipe(Pipe),
    Lock(Lock),
    Cvar(Cvar),
}

impl IpcObject {
    fn new(kind: IpcKind) -> Self {
        match kind {
            IpcKind::Pipe => IpcObject::Pipe(Pipe::new()),
            IpcKind::Lock => IpcObject::Lock(Lock::new()),
            IpcKind::Cvar => IpcObject::Cvar(Cvar::new()),
        }
    }

    pub fn kind(&self) -> IpcKind {
        match self {
            IpcObject::Pipe(_) => IpcKind::Pipe,
            IpcObject::Lock(_) => IpcKind::Lock,
            IpcObject::Cvar(_) => IpcKind::Cvar,
        }
    }

    fn wait_queues(&mut self) -> [Option<&mut BlockQueue<Pid>>; 2] {
        match self {
            IpcObject::Pipe(p) => [Some(&mut p.readers), Some(&mut p.writers)],
            IpcObject::Lock(l) => [Some(&mut l.waiters), None],
            IpcObject::Cvar(c) => [Some(&mut c.waiters), None],
        }
    }
}

/// Move every pid on `from` to `ready`, oldest first
pub(crate) fn wake_all(from: &mut BlockQueue<Pid>, ready: &mut BlockQueue<Pid>) -> usize {
    let woken = from.take_all();
    let n = woken.len();
    for pid in woken {
        ready.enqueue(pid);
    }
    n
}

/// All live IPC objects, in creation order
#[derive(Debug, Default)]
pub struct IpcRegistry {
    objects: BTreeMap<IpcId, IpcObject>,
    next_id: u32,
}

impl IpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, kind: IpcKind) -> IpcId {
        let id = IpcId(self.next_id);
        self.next_id += 1;
        self.objects.insert(id, IpcObject::new(kind));
        ktrace!(2, "ipc: created {:?} {}", kind, id);
        id
    }

    pub fn kind(&self, id: IpcId) -> Option<IpcKind> {
        self.objects.get(&id).map(IpcObject::kind)
    }

    pub fn exists(&self, id: IpcId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn pipe_mut(&mut self, id: IpcId) -> IpcResult<&mut Pipe> {
        match self.objects.get_mut(&id) {
            Some(IpcObject::Pipe(pipe)) => Ok(pipe),
            _ => Err(IpcError::NotFound),
        }
    }

    pub fn lock_mut(&mut self, id: IpcId) -> IpcResult<&mut Lock> {
        match self.objects.get_mut(&id) {
            Some(IpcObject::Lock(lock)) => Ok(lock),
            _ => Err(IpcError::NotFound),
        }
    }

    pub fn cvar_mut(&mut self, id: IpcId) -> IpcResult<&mut Cvar> {
        match self.objects.get_mut(&id) {
            Some(IpcObject::Cvar(cvar)) => Ok(cvar),
            _ => Err(IpcError::NotFound),
        }
    }

    pub fn lock_acquire(&mut self, id: IpcId, caller: Pid) -> IpcResult<()> {
        self.lock_mut(id)?.acquire(caller)
    }

    pub fn lock_release(&mut self, id: IpcId, caller: Pid, ready: &mut BlockQueue<Pid>) -> IpcResult<()> {
        self.lock_mut(id)?.release(caller, ready)
    }

    /// Release `lock` and queue `caller` on `cvar`
    ///
    /// Nothing changes unless both objects exist and the release succeeds.
    pub fn cvar_wait(
        &mut self,
        cvar: IpcId,
        lock: IpcId,
        caller: Pid,
        ready: &mut BlockQueue<Pid>,
    ) -> IpcResult<()> {
        self.cvar_mut(cvar)?;
        self.lock_release(lock, caller, ready)?;
        self.cvar_mut(cvar)?.wait(caller);
        Ok(())
    }

    pub fn cvar_signal(&mut self, id: IpcId, ready: &mut BlockQueue<Pid>) -> IpcResult<()> {
        self.cvar_mut(id)?.signal(ready);
        Ok(())
    }

    pub fn cvar_broadcast(&mut self, id: IpcId, ready: &mut BlockQueue<Pid>) -> IpcResult<()> {
        self.cvar_mut(id)?.broadcast(ready);
        Ok(())
    }

    /// Destroy an object, waking everything queued on it
    ///
    /// Returns the woken pids in wake order. Their blocked calls must fail
    /// rather than retry, since the object they waited on is gone.
    pub fn reclaim(&mut self, id: IpcId, ready: &mut BlockQueue<Pid>) -> IpcResult<Vec<Pid>> {
        let mut object = self.objects.remove(&id).ok_or(IpcError::NotFound)?;
        let mut woken = Vec::new();
        for queue in object.wait_queues().into_iter().flatten() {
            for pid in queue.take_all() {
                ready.enqueue(pid);
                woken.push(pid);
            }
        }
        ktrace!(2, "ipc: reclaimed {:?} {}, woke {}", object.kind(), id, woken.len());
        Ok(woken)
    }

    /// Drop `pid` from every wait list
    pub fn forget(&mut self, pid: Pid) {
        for object in self.objects.values_mut() {
            for queue in object.wait_queues().into_iter().flatten() {
                queue.remove(&pid);
            }
        }
    }
}
