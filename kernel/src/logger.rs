//! Kernel logger and console sink
//!
//! All kernel output funnels through a byte sink the display layer can
//! replace at boot (the core treats the framebuffer console as a write-only
//! collaborator). The `log` facade is wired to the same sink with a level
//! prefix; `loglevel=` on the boot command line selects the filter.

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// A write-only byte sink for kernel console output.
///
/// The default sink forwards to the serial port. The display subsystem (out
/// of scope here) installs a framebuffer-backed sink during bring-up; the
/// crash handler keeps using whatever sink is installed.
pub trait ConsoleSink: Send {
    fn write_bytes(&mut self, bytes: &[u8]);
}

struct SerialSink;

impl ConsoleSink for SerialSink {
    fn write_bytes(&mut self, bytes: &[u8]) {
        #[cfg(target_arch = "x86_64")]
        crate::arch::x86_64::serial::write_bytes(bytes);
        #[cfg(not(target_arch = "x86_64"))]
        let _ = bytes;
    }
}

static SINK: Mutex<Option<&'static mut dyn ConsoleSink>> = Mutex::new(None);

/// Replace the console sink. The previous sink is returned so the caller
/// can tear it down.
pub fn set_sink(sink: &'static mut dyn ConsoleSink) -> Option<&'static mut dyn ConsoleSink> {
    SINK.lock().replace(sink)
}

/// Write raw bytes to the active console sink.
pub fn write_bytes(bytes: &[u8]) {
    let mut sink = SINK.lock();
    match sink.as_mut() {
        Some(s) => s.write_bytes(bytes),
        None => SerialSink.write_bytes(bytes),
    }
}

struct SinkWriter;

impl fmt::Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_bytes(s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // Formatting failures cannot happen for a sink that accepts all bytes.
    let _ = SinkWriter.write_fmt(args);
}

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let _ = SinkWriter.write_fmt(format_args!(
            "[{} {}] {}\n",
            tag,
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Called once during bootstrap, before any
/// subsystem logs.
pub fn init(cmdline: &str) {
    let filter = parse_loglevel(cmdline).unwrap_or(LevelFilter::Info);
    // set_logger fails only if a logger is already installed; bootstrap
    // calls this exactly once, and the duplicate-call case is harmless.
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(filter);
    }
}

/// Parse `loglevel=<error|warn|info|debug|trace>` from the boot command line.
fn parse_loglevel(cmdline: &str) -> Option<LevelFilter> {
    for token in cmdline.split_whitespace() {
        if let Some(value) = token.strip_prefix("loglevel=") {
            return match value {
                "error" => Some(LevelFilter::Error),
                "warn" => Some(LevelFilter::Warn),
                "info" => Some(LevelFilter::Info),
                "debug" => Some(LevelFilter::Debug),
                "trace" => Some(LevelFilter::Trace),
                "off" => Some(LevelFilter::Off),
                _ => None,
            };
        }
    }
    None
}
