//! Serial logging backend.
//!
//! Kernel diagnostics go out over COM1, driven as a bare 16550: programmed
//! once at boot for 115200 8N1 with FIFOs on, then polled on the line-status
//! register before every byte. The `log` facade fans out here; each record
//! is stamped with the uptime tick counter and its target module, and
//! newlines are expanded to CRLF so raw terminal captures line up.

use core::fmt::{self, Write};

use spinning_top::Spinlock;
use x86_64::instructions::port::Port;

const COM1: u16 = 0x3f8;

/// Transmitter-holding-register-empty bit of the line status register.
const LSR_THR_EMPTY: u8 = 1 << 5;

static SERIAL: Spinlock<SerialPort> = Spinlock::new(SerialPort::new(COM1));

static LOGGER: Logger = Logger;

/// A polled 16550 UART.
struct SerialPort {
    base: u16,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        Self { base }
    }

    /// Program 115200 baud, 8 data bits, no parity, one stop bit, FIFOs on.
    fn configure(&mut self) {
        unsafe {
            // Interrupts off; this port is polled only.
            Port::<u8>::new(self.base + 1).write(0x00);
            // DLAB on, divisor 1, DLAB off with 8N1.
            Port::<u8>::new(self.base + 3).write(0x80);
            Port::<u8>::new(self.base).write(0x01);
            Port::<u8>::new(self.base + 1).write(0x00);
            Port::<u8>::new(self.base + 3).write(0x03);
            // FIFOs enabled and cleared, 14-byte trigger.
            Port::<u8>::new(self.base + 2).write(0xc7);
        }
    }

    fn send(&mut self, byte: u8) {
        let mut line_status = Port::<u8>::new(self.base + 5);
        let mut data = Port::<u8>::new(self.base);
        unsafe {
            while line_status.read() & LSR_THR_EMPTY == 0 {
                core::hint::spin_loop();
            }
            data.write(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
        Ok(())
    }
}

pub fn _print(args: fmt::Arguments) {
    let _ = SERIAL.lock().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::logging::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}

struct Logger;

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Debug
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let uptime = crate::time::ticks();
        println!(
            "[{:>5}.{:03}] {:5} {}: {}",
            uptime / crate::time::TIMER_HZ,
            uptime % crate::time::TIMER_HZ,
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        // The UART is polled to completion on every byte.
    }
}

/// Configure COM1 and install the `log` facade. Must run before anything
/// logs.
pub fn init() {
    SERIAL.lock().configure();
    log::set_logger(&LOGGER).expect("logger installed twice");
    log::set_max_level(log::LevelFilter::Debug);
}
