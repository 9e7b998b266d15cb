//! Console output for the kernel
//!
//! All kernel tracing goes through one global console. Completed lines are
//! kept in a small ring so the host (or a test) can inspect recent output,
//! and are forwarded to an optional sink installed by the embedding program.
//!
//! Trace levels follow the usual kernel convention:
//! 0 = errors, 1 = process lifecycle, 2 = scheduling and IPC, 3 = memory detail.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};

use heapless::{Deque, String};
use spin::Mutex;

/// Longest line kept in the history ring; longer lines are split
pub const LINE_CAPACITY: usize = 160;
/// Number of lines kept in the history ring
pub const HISTORY_LINES: usize = 64;

/// Receives every completed console line
pub type Sink = fn(&str);

/// Console writer
pub struct Console {
    line: String<LINE_CAPACITY>,
    history: Deque<String<LINE_CAPACITY>, HISTORY_LINES>,
    sink: Option<Sink>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            line: String::new(),
            history: Deque::new(),
            sink: None,
        }
    }

    fn push_char(&mut self, c: char) {
        if c == '\n' {
            self.flush_line();
            return;
        }
        if self.line.push(c).is_err() {
            self.flush_line();
            let _ = self.line.push(c);
        }
    }

    fn flush_line(&mut self) {
        let line = core::mem::replace(&mut self.line, String::new());
        if let Some(sink) = self.sink {
            sink(line.as_str());
        }
        if self.history.is_full() {
            self.history.pop_front();
        }
        let _ = self.history.push_back(line);
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        for c in s.chars() {
            self.push_char(c);
        }
    }

    /// Whether any retained line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.history.iter().any(|line| line.contains(needle))
    }

    /// Drop the retained history and any partial line
    pub fn clear(&mut self) {
        self.line.clear();
        self.history.clear();
    }

    pub fn set_sink(&mut self, sink: Option<Sink>) {
        self.sink = sink;
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

static TRACE_LEVEL: AtomicU8 = AtomicU8::new(1);

/// Install the host sink that receives each completed line
pub fn set_sink(sink: Option<Sink>) {
    CONSOLE.lock().set_sink(sink);
}

pub fn set_trace_level(level: u8) {
    TRACE_LEVEL.store(level, Ordering::Relaxed);
}

pub fn trace_level() -> u8 {
    TRACE_LEVEL.load(Ordering::Relaxed)
}

/// Whether messages at `level` are currently printed
#[inline]
pub fn enabled(level: u8) -> bool {
    level <= trace_level()
}

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Print macro for kernel use
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*))
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

/// Print a line if the trace threshold admits `level`
#[macro_export]
macro_rules! ktrace {
    ($level:expr, $($arg:tt)*) => {
        if $crate::console::enabled($level) {
            $crate::kprintln!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_lines() {
        let mut console = Console::new();
        console.write_str("first\nsecond");
        assert!(console.contains("first"));
        assert!(!console.contains("second"));
        console.write_str("\n");
        assert!(console.contains("second"));
    }

    #[test]
    fn test_console_history_ring() {
        let mut console = Console::new();
        for i in 0..HISTORY_LINES + 4 {
            let _ = write!(console, "line {}\n", i);
        }
        assert!(!console.contains("line 0"));
        assert!(console.contains("line 4"));
        assert!(console.contains("line 67"));
        console.clear();
        assert!(!console.contains("line"));
    }

    #[test]
    fn test_long_line_splits() {
        let mut console = Console::new();
        for _ in 0..LINE_CAPACITY + 10 {
            console.write_str("x");
        }
        console.write_str("\n");
        assert!(console.contains("xxxxxxxxxx"));
    }
}
