//! Device subsystem
//!
//! The only devices the kernel drives are the terminals. The hardware side
//! is the [`Terminal`] trait; the kernel keeps the buffering and the wait
//! lists itself.

pub mod tty;

pub use tty::{SimTerminal, Terminal, TtyState};
