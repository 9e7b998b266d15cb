//! Trap interface
//!
//! Every entry into the kernel comes through [`Kernel::trap`] with the
//! interrupted process's [`UserContext`]. The vector is decoded into a
//! [`Trap`] and dispatched through one match; on return the context holds
//! whichever process should run next.

use crate::arch::{
    Machine, UserContext, SEGV_ACCERR, SEGV_MAPERR, TRAP_CLOCK, TRAP_ILLEGAL, TRAP_KERNEL, TRAP_MATH, TRAP_MEMORY,
    TRAP_TTY_RECEIVE, TRAP_TTY_TRANSMIT,
};
use crate::device::tty::Terminal;
use crate::kern::loader::ProgramLoader;
use crate::kernel::{Kernel, KernelFault};

/// Why a memory trap was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCause {
    /// No valid mapping for the address
    MapErr,
    /// Mapping exists but forbids the access
    AccErr,
    Other(usize),
}

impl FaultCause {
    pub fn from_code(code: usize) -> Self {
        match code {
            SEGV_MAPERR => FaultCause::MapErr,
            SEGV_ACCERR => FaultCause::AccErr,
            other => FaultCause::Other(other),
        }
    }
}

/// Decoded trap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// System call; the number is in the context's `code`
    Kernel,
    Clock,
    Illegal,
    Memory { addr: usize, cause: FaultCause },
    Math,
    TtyReceive(usize),
    TtyTransmit(usize),
    Unknown(usize),
}

impl Trap {
    pub fn decode(uctx: &UserContext) -> Self {
        match uctx.vector {
            TRAP_KERNEL => Trap::Kernel,
            TRAP_CLOCK => Trap::Clock,
            TRAP_ILLEGAL => Trap::Illegal,
            TRAP_MEMORY => Trap::Memory {
                addr: uctx.addr,
                cause: FaultCause::from_code(uctx.code),
            },
            TRAP_MATH => Trap::Math,
            TRAP_TTY_RECEIVE => Trap::TtyReceive(uctx.code),
            TRAP_TTY_TRANSMIT => Trap::TtyTransmit(uctx.code),
            other => Trap::Unknown(other),
        }
    }
}

impl<M: Machine, L: ProgramLoader, T: Terminal> Kernel<M, L, T> {
    /// Service one trap to completion
    ///
    /// Returns an error only when the kernel can no longer run anything:
    /// a failed context transfer, or any trap after the machine halted.
    pub fn trap(&mut self, uctx: &mut UserContext) -> Result<(), KernelFault> {
        if self.halted {
            return Err(KernelFault::Halted);
        }
        let trap = Trap::decode(uctx);
        ktrace!(3, "trap: {:?} from pid {}", trap, self.sched.current);

        match trap {
            Trap::Kernel => self.syscall(uctx),
            Trap::Clock => self.clock_tick(uctx),
            Trap::Illegal => self.kill_current(uctx, "illegal instruction"),
            Trap::Memory { addr, cause } => self.memory_fault(uctx, addr, cause),
            Trap::Math => self.kill_current(uctx, "arithmetic fault"),
            Trap::TtyReceive(tty) => {
                self.tty_receive(tty);
                Ok(())
            }
            Trap::TtyTransmit(tty) => {
                self.tty_transmit_done(tty);
                Ok(())
            }
            Trap::Unknown(vector) => {
                ktrace!(0, "trap: unexpected vector {} from pid {}", vector, self.sched.current);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        let mut uctx = UserContext {
            vector: TRAP_MEMORY,
            code: SEGV_MAPERR,
            addr: 0x1f_0000,
            ..UserContext::default()
        };
        assert_eq!(
            Trap::decode(&uctx),
            Trap::Memory {
                addr: 0x1f_0000,
                cause: FaultCause::MapErr
            }
        );
        uctx.vector = TRAP_TTY_RECEIVE;
        uctx.code = 3;
        assert_eq!(Trap::decode(&uctx), Trap::TtyReceive(3));
        uctx.vector = 42;
        assert_eq!(Trap::decode(&uctx), Trap::Unknown(42));
        assert_eq!(FaultCause::from_code(9), FaultCause::Other(9));
    }
}
