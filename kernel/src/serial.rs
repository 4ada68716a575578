//! Serial port output
//!
//! Early-boot and panic output goes straight to COM1; once the kernel is
//! up the same port backs the `log` facade. On the host target the port is
//! replaced by standard output so unit tests can print.

use core::fmt;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use lazy_static::lazy_static;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use spin::Mutex;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use uart_16550::SerialPort;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
lazy_static! {
    static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base and is not claimed by
        // any other driver in this kernel.
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use fmt::Write;
        let _ = SERIAL1.lock().write_fmt(args);
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        use std::io::Write;
        let _ = std::io::stdout().write_fmt(args);
    }
}

/// `log` facade backend writing to the serial port.
struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Debug
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            crate::println!("[{:5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Route the `log` macros to the serial port. Called once during boot;
/// a second call is a no-op (the facade rejects re-registration).
pub fn init_logging() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Debug);
    }
}
