//! Condition variables
//!
//! The lock is supplied by each waiter, not owned by the condition.

use crate::kern::queue::BlockQueue;
use crate::types::Pid;

#[derive(Debug, Clone, Default)]
pub struct Cvar {
    pub waiters: BlockQueue<Pid>,
}

impl Cvar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(&mut self, caller: Pid) {
        self.waiters.enqueue(caller);
    }

    /// Wake the oldest waiter, if any
    pub fn signal(&mut self, ready: &mut BlockQueue<Pid>) -> Option<Pid> {
        let pid = self.waiters.dequeue()?;
        ready.enqueue(pid);
        Some(pid)
    }

    pub fn broadcast(&mut self, ready: &mut BlockQueue<Pid>) -> usize {
        super::wake_all(&mut self.waiters, ready)
    }
}
