//! Blocking queue - insertion-ordered FIFO of handles
//!
//! Every "waiting" structure in the kernel is one of these: the ready queue,
//! the delay list, terminal wait lists, IPC wait lists and the child lists
//! of a process. Entries are plain ids; the objects themselves live in the
//! process and IPC tables, so a queue never owns what it names.

use alloc::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockQueue<T> {
    items: VecDeque<T>,
}

impl<T> Default for BlockQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockQueue<T> {
    pub const fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Add at the tail
    pub fn enqueue(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Remove from the head
    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter()
    }

    /// Keep only the entries for which `keep` returns true, preserving order
    pub fn retain_mut<F: FnMut(&mut T) -> bool>(&mut self, keep: F) {
        self.items.retain_mut(keep);
    }

    /// Empty the queue, returning its entries in order
    pub fn take_all(&mut self) -> VecDeque<T> {
        core::mem::take(&mut self.items)
    }
}

impl<T: PartialEq> BlockQueue<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    /// Remove the first occurrence of `item`
    pub fn remove(&mut self, item: &T) -> bool {
        match self.items.iter().position(|x| x == item) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }
}
