//! Terminal driver
//!
//! Receive interrupts deliver at most one line each; the line is kept as a
//! block and handed out to readers from the front. Transmit accepts one
//! line-sized chunk at a time and signals completion with an interrupt.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::arch::Machine;
use crate::config::{NUM_TERMINALS, TERMINAL_MAX_LINE};
use crate::kern::continuation::{Continuation, Step};
use crate::kern::loader::ProgramLoader;
use crate::kern::sched_prim::WaitList;
use crate::kern::syscall_sw::SyscallError;
use crate::kernel::Kernel;
use crate::mach_vm::VmProt;

/// Terminal hardware
pub trait Terminal {
    /// Fetch the line that raised the receive interrupt into `buf`
    fn receive(&mut self, tty: usize, buf: &mut [u8]) -> usize;

    /// Start sending `data`; completion arrives as a transmit interrupt
    fn transmit(&mut self, tty: usize, data: &[u8]);
}

/// One received line
#[derive(Debug, Clone, Default)]
struct RxBlock {
    data: heapless::Vec<u8, TERMINAL_MAX_LINE>,
    pos: usize,
}

impl RxBlock {
    fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }
}

/// Kernel side of one terminal
#[derive(Debug, Clone)]
pub struct TtyState {
    rx: VecDeque<RxBlock>,
    /// Chunk currently owned by the transmitter
    tx_buf: heapless::Vec<u8, TERMINAL_MAX_LINE>,
    tx_ready: bool,
}

impl Default for TtyState {
    fn default() -> Self {
        Self {
            rx: VecDeque::new(),
            tx_buf: heapless::Vec::new(),
            tx_ready: true,
        }
    }
}

impl TtyState {
    /// Queue a received line; anything past the line limit is dropped
    pub fn push_line(&mut self, line: &[u8]) {
        let keep = line.len().min(TERMINAL_MAX_LINE);
        let mut block = RxBlock::default();
        // cannot fail: `keep` is within capacity
        let _ = block.data.extend_from_slice(&line[..keep]);
        self.rx.push_back(block);
    }

    pub fn has_input(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Blocks received and not yet fully read
    pub fn pending_lines(&self) -> usize {
        self.rx.len()
    }

    /// Copy from the front block; the block is dropped once consumed
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let Some(block) = self.rx.front_mut() else {
            return 0;
        };
        let n = dst.len().min(block.remaining().len());
        dst[..n].copy_from_slice(&block.remaining()[..n]);
        block.pos += n;
        if block.remaining().is_empty() {
            self.rx.pop_front();
        }
        n
    }

    pub fn is_tx_ready(&self) -> bool {
        self.tx_ready
    }

    /// Chunk most recently handed to the transmitter
    pub fn last_chunk(&self) -> &[u8] {
        &self.tx_buf
    }
}

// ============================================================================
// Simulated terminals
// ============================================================================

/// Host-side terminals: input is queued by the test, output is recorded
#[derive(Debug, Default)]
pub struct SimTerminal {
    input: [VecDeque<Vec<u8>>; NUM_TERMINALS],
    output: [Vec<u8>; NUM_TERMINALS],
    transmissions: [usize; NUM_TERMINALS],
}

impl SimTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a line to be returned by the next receive on `tty`
    pub fn push_input(&mut self, tty: usize, line: &[u8]) {
        if let Some(queue) = self.input.get_mut(tty) {
            queue.push_back(line.to_vec());
        }
    }

    pub fn output(&self, tty: usize) -> &[u8] {
        self.output.get(tty).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of chunks sent on `tty`
    pub fn transmissions(&self, tty: usize) -> usize {
        self.transmissions.get(tty).copied().unwrap_or(0)
    }
}

impl Terminal for SimTerminal {
    fn receive(&mut self, tty: usize, buf: &mut [u8]) -> usize {
        let Some(line) = self.input.get_mut(tty).and_then(VecDeque::pop_front) else {
            return 0;
        };
        let n = line.len().min(buf.len());
        buf[..n].copy_from_slice(&line[..n]);
        n
    }

    fn transmit(&mut self, tty: usize, data: &[u8]) {
        if let (Some(out), Some(count)) = (self.output.get_mut(tty), self.transmissions.get_mut(tty)) {
            out.extend_from_slice(data);
            *count += 1;
        }
    }
}

// ============================================================================
// Kernel entry points
// ============================================================================

fn check_tty(tty: usize) -> Result<usize, SyscallError> {
    if tty < NUM_TERMINALS {
        Ok(tty)
    } else {
        Err(SyscallError::BadTerminal)
    }
}

impl<M: Machine, L: ProgramLoader, T: Terminal> Kernel<M, L, T> {
    pub(crate) fn sys_tty_read(&mut self, tty: usize, buf: usize, len: isize) -> Result<Step, SyscallError> {
        let tty = check_tty(tty)?;
        self.validate_current(buf, len, VmProt::WRITE)?;
        let len = usize::try_from(len).map_err(|_| SyscallError::BadArgument)?;
        self.tty_read_step(tty, buf, len)
    }

    /// Serve one read from the oldest received block, or wait for one
    pub(crate) fn tty_read_step(&mut self, tty: usize, buf: usize, len: usize) -> Result<Step, SyscallError> {
        let state = self.ttys.get_mut(tty).ok_or(SyscallError::BadTerminal)?;
        if !state.has_input() {
            return Ok(Step::park_on(
                WaitList::TtyRead(tty),
                Continuation::TtyRead { tty, buf, len },
            ));
        }
        let mut chunk = [0u8; TERMINAL_MAX_LINE];
        let n = state.read_into(&mut chunk[..len.min(TERMINAL_MAX_LINE)]);
        if n > 0 {
            self.copyout_current(&chunk[..n], buf)?;
        }
        Ok(Step::Return(n as isize))
    }

    pub(crate) fn sys_tty_write(&mut self, tty: usize, buf: usize, len: isize) -> Result<Step, SyscallError> {
        let tty = check_tty(tty)?;
        self.validate_current(buf, len, VmProt::READ)?;
        let len = usize::try_from(len).map_err(|_| SyscallError::BadArgument)?;
        self.tty_write_step(tty, buf, len, 0)
    }

    /// Send the next chunk once the transmitter is free
    ///
    /// Resumes after every completion interrupt; `sent` counts bytes handed
    /// to the device so far.
    pub(crate) fn tty_write_step(
        &mut self,
        tty: usize,
        buf: usize,
        len: usize,
        sent: usize,
    ) -> Result<Step, SyscallError> {
        if sent >= len {
            return Ok(Step::Return(len as isize));
        }
        let waiting = Step::park_on(
            WaitList::TtyWrite(tty),
            Continuation::TtyWrite { tty, buf, len, sent },
        );
        if !self.ttys.get(tty).ok_or(SyscallError::BadTerminal)?.tx_ready {
            return Ok(waiting);
        }

        let n = (len - sent).min(TERMINAL_MAX_LINE);
        let mut chunk = [0u8; TERMINAL_MAX_LINE];
        self.copyin_current(buf + sent, &mut chunk[..n])?;
        let state = &mut self.ttys[tty];
        state.tx_buf.clear();
        state
            .tx_buf
            .extend_from_slice(&chunk[..n])
            .map_err(|_| SyscallError::BadArgument)?;
        state.tx_ready = false;
        self.terminal.transmit(tty, &state.tx_buf);
        ktrace!(3, "tty{}: sent {} bytes for pid {}", tty, n, self.sched.current);

        Ok(Step::park_on(
            WaitList::TtyWrite(tty),
            Continuation::TtyWrite {
                tty,
                buf,
                len,
                sent: sent + n,
            },
        ))
    }

    /// Receive interrupt
    pub(crate) fn tty_receive(&mut self, tty: usize) {
        let Some(state) = self.ttys.get_mut(tty) else {
            ktrace!(0, "tty: receive interrupt for unknown terminal {}", tty);
            return;
        };
        let mut line = [0u8; TERMINAL_MAX_LINE];
        let n = self.terminal.receive(tty, &mut line);
        state.push_line(&line[..n]);
        ktrace!(3, "tty{}: received {} bytes", tty, n);
        self.sched.wake_all(WaitList::TtyRead(tty));
    }

    /// Transmit-complete interrupt
    pub(crate) fn tty_transmit_done(&mut self, tty: usize) {
        let Some(state) = self.ttys.get_mut(tty) else {
            ktrace!(0, "tty: transmit interrupt for unknown terminal {}", tty);
            return;
        };
        state.tx_ready = true;
        self.sched.wake_all(WaitList::TtyWrite(tty));
    }

    pub fn tty_state(&self, tty: usize) -> Option<&TtyState> {
        self.ttys.get(tty)
    }
}
