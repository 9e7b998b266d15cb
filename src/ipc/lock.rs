//! Sleeping mutual-exclusion lock
//!
//! Release wakes every waiter; they all retry and the first to run wins.

use super::IpcError;
use crate::kern::queue::BlockQueue;
use crate::types::Pid;

#[derive(Debug, Clone, Default)]
pub struct Lock {
    held: bool,
    owner: Option<Pid>,
    pub waiters: BlockQueue<Pid>,
}

impl Lock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn owner(&self) -> Option<Pid> {
        if self.held {
            self.owner
        } else {
            None
        }
    }

    /// Take the lock, or queue `caller` and report `WouldBlock`
    pub fn acquire(&mut self, caller: Pid) -> Result<(), IpcError> {
        if self.held {
            self.waiters.enqueue(caller);
            return Err(IpcError::WouldBlock);
        }
        self.held = true;
        self.owner = Some(caller);
        Ok(())
    }

    pub fn release(&mut self, caller: Pid, ready: &mut BlockQueue<Pid>) -> Result<(), IpcError> {
        if self.owner() != Some(caller) {
            return Err(IpcError::NotOwner);
        }
        self.held = false;
        self.owner = None;
        super::wake_all(&mut self.waiters, ready);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let mut lock = Lock::new();
        let mut ready = BlockQueue::new();
        assert_eq!(lock.acquire(Pid(2)), Ok(()));
        assert_eq!(lock.owner(), Some(Pid(2)));
        assert_eq!(lock.acquire(Pid(3)), Err(IpcError::WouldBlock));
        assert_eq!(lock.acquire(Pid(4)), Err(IpcError::WouldBlock));
        assert_eq!(lock.release(Pid(2), &mut ready), Ok(()));
        assert!(!lock.is_held());
        assert_eq!(ready.len(), 2);
        assert!(lock.waiters.is_empty());
    }

    #[test]
    fn test_release_requires_owner() {
        let mut lock = Lock::new();
        let mut ready = BlockQueue::new();
        assert_eq!(lock.release(Pid(2), &mut ready), Err(IpcError::NotOwner));
        lock.acquire(Pid(2)).unwrap();
        assert_eq!(lock.release(Pid(3), &mut ready), Err(IpcError::NotOwner));
        assert!(lock.is_held());
    }
}
