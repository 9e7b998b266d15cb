//! Bounded byte pipe
//!
//! A fixed ring of [`PIPE_LEN`] bytes. One byte of capacity is always left
//! unused so that `read_pos == write_pos` means empty and never full.

use crate::config::PIPE_LEN;
use crate::kern::queue::BlockQueue;
use crate::types::Pid;

#[derive(Debug, Clone)]
pub struct Pipe {
    buf: [u8; PIPE_LEN],
    read_pos: usize,
    write_pos: usize,
    /// Blocked in read with nothing left to take
    pub readers: BlockQueue<Pid>,
    /// Blocked in write with no room left
    pub writers: BlockQueue<Pid>,
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe {
    pub const CAPACITY: usize = PIPE_LEN - 1;

    pub fn new() -> Self {
        Self {
            buf: [0; PIPE_LEN],
            read_pos: 0,
            write_pos: 0,
            readers: BlockQueue::new(),
            writers: BlockQueue::new(),
        }
    }

    /// Bytes resident
    pub fn len(&self) -> usize {
        (self.write_pos + PIPE_LEN - self.read_pos) % PIPE_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    pub fn is_full(&self) -> bool {
        self.len() == Self::CAPACITY
    }

    pub fn space(&self) -> usize {
        Self::CAPACITY - self.len()
    }

    /// Take up to `dst.len()` bytes
    ///
    /// Anything short of a full read parks `caller` on the reader list. Every
    /// read moves all blocked writers to `ready`.
    pub fn read(&mut self, caller: Pid, dst: &mut [u8], ready: &mut BlockQueue<Pid>) -> usize {
        let n = dst.len().min(self.len());
        let first = n.min(PIPE_LEN - self.read_pos);
        dst[..first].copy_from_slice(&self.buf[self.read_pos..self.read_pos + first]);
        dst[first..n].copy_from_slice(&self.buf[..n - first]);
        self.read_pos = (self.read_pos + n) % PIPE_LEN;

        super::wake_all(&mut self.writers, ready);
        if n < dst.len() {
            self.readers.enqueue(caller);
        }
        n
    }

    /// Store up to `src.len()` bytes; the mirror of [`Pipe::read`]
    pub fn write(&mut self, caller: Pid, src: &[u8], ready: &mut BlockQueue<Pid>) -> usize {
        let n = src.len().min(self.space());
        let first = n.min(PIPE_LEN - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&src[..first]);
        self.buf[..n - first].copy_from_slice(&src[first..n]);
        self.write_pos = (self.write_pos + n) % PIPE_LEN;

        super::wake_all(&mut self.readers, ready);
        if n < src.len() {
            self.writers.enqueue(caller);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_across_wrap() {
        let mut pipe = Pipe::new();
        let mut ready = BlockQueue::new();
        let mut scratch = [0u8; 1000];
        // move both cursors near the end of the ring
        assert_eq!(pipe.write(Pid(1), &[7u8; 1000], &mut ready), 1000);
        assert_eq!(pipe.read(Pid(2), &mut scratch, &mut ready), 1000);
        assert!(pipe.is_empty());

        let data: alloc::vec::Vec<u8> = (0..200u8).collect();
        assert_eq!(pipe.write(Pid(1), &data, &mut ready), 200);
        let mut out = [0u8; 200];
        assert_eq!(pipe.read(Pid(2), &mut out, &mut ready), 200);
        assert_eq!(&out[..], &data[..]);
        assert!(pipe.readers.is_empty());
        assert!(pipe.writers.is_empty());
    }

    #[test]
    fn test_capacity_leaves_one_byte() {
        let mut pipe = Pipe::new();
        let mut ready = BlockQueue::new();
        assert_eq!(pipe.write(Pid(3), &[1u8; PIPE_LEN], &mut ready), PIPE_LEN - 1);
        assert!(pipe.is_full());
        assert!(!pipe.is_empty());
        assert!(pipe.writers.contains(&Pid(3)));
        assert_eq!(pipe.write(Pid(4), &[1u8], &mut ready), 0);
        assert_eq!(pipe.writers.len(), 2);
    }

    #[test]
    fn test_read_wakes_every_writer() {
        let mut pipe = Pipe::new();
        let mut ready = BlockQueue::new();
        pipe.write(Pid(3), &[9u8; PIPE_LEN + 5], &mut ready);
        pipe.write(Pid(4), &[9u8; 5], &mut ready);
        let mut out = [0u8; 10];
        assert_eq!(pipe.read(Pid(5), &mut out, &mut ready), 10);
        assert!(pipe.writers.is_empty());
        assert_eq!(ready.dequeue(), Some(Pid(3)));
        assert_eq!(ready.dequeue(), Some(Pid(4)));
    }

    #[test]
    fn test_short_read_parks_reader() {
        let mut pipe = Pipe::new();
        let mut ready = BlockQueue::new();
        let mut out = [0u8; 4];
        assert_eq!(pipe.read(Pid(2), &mut out, &mut ready), 0);
        assert!(pipe.readers.contains(&Pid(2)));
        assert_eq!(pipe.write(Pid(1), b"ab", &mut ready), 2);
        assert_eq!(ready.dequeue(), Some(Pid(2)));
        assert_eq!(pipe.read(Pid(2), &mut out, &mut ready), 2);
        assert_eq!(&out[..2], b"ab");
    }
}
