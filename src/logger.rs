//! Colored console logger installed as the process-wide `log` backend.
//!
//! A direct generalization of the small ANSI-colored `log::Log`
//! implementation the teacher web framework ships, unchanged in spirit:
//! still one line per record, still colored by level, still writing
//! straight to stdout rather than buffering.

use log::{Level, Metadata, Record};

const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const GREEN: &str = "\x1b[32m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

/// Process-wide logger installed once from `main`.
pub struct Logger;

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            match record.level() {
                Level::Error => {
                    println!("{}[ERROR] - {}{}", RED, record.args(), RESET);
                }
                Level::Trace => {
                    println!("{}[TRACE] - {}{}", DIM, record.args(), RESET);
                }
                Level::Warn => {
                    println!("{}[WARN ]{} - {}", YELLOW, RESET, record.args());
                }
                Level::Info => {
                    println!("{}[INFO ]{} - {}", BLUE, RESET, record.args());
                }
                Level::Debug => {
                    println!("{}[DEBUG]{} - {}", GREEN, RESET, record.args());
                }
            }
        }
    }

    fn flush(&self) {}
}

/// Installs [`Logger`] as the global `log` backend at the given level.
///
/// Safe to call once per process; later calls are ignored (matching
/// `log::set_logger`'s own semantics).
pub fn init(level: log::LevelFilter) {
    static LOGGER: Logger = Logger;
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
