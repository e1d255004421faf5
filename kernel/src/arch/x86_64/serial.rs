//! COM1 serial port, the default kernel log sink

use core::fmt::{self, Write};

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base; no other code drives it.
        let mut port = unsafe { SerialPort::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

/// Write raw bytes to COM1.
pub fn write_bytes(bytes: &[u8]) {
    #[cfg(target_os = "none")]
    {
        let mut port = SERIAL1.lock();
        for &byte in bytes {
            port.send(byte);
        }
    }
    #[cfg(not(target_os = "none"))]
    let _ = bytes;
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(target_os = "none")]
    {
        // Serial output cannot fail once the port is initialized.
        let _ = SERIAL1.lock().write_fmt(args);
    }
    #[cfg(not(target_os = "none"))]
    let _ = args;
}
