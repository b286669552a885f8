//! Logging infrastructure
//!
//! The engine logs through the `log` crate. The embedding firmware or OS
//! supplies a [`LogSink`] (serial port, memory console, ...) and a
//! millisecond clock; records are formatted as
//! `[<timestamp>] [<LEVEL>] <message>`, with ANSI colors for sinks that
//! render them.

use core::fmt::{self, Write};
use log::{Level, LevelFilter, Metadata, Record};
use spin::Once;

/// Destination for formatted log lines
pub trait LogSink: Sync {
    fn write_str(&self, s: &str);

    /// Whether the sink renders ANSI color escapes
    fn ansi(&self) -> bool {
        false
    }
}

struct Backend {
    sink: &'static dyn LogSink,
    clock: fn() -> u64,
}

static BACKEND: Once<Backend> = Once::new();

/// Adapter so `write!` can target a sink
struct SinkWriter<'a>(&'a dyn LogSink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

fn level_str(level: Level, ansi: bool) -> &'static str {
    if ansi {
        match level {
            Level::Error => "\x1b[31mERROR\x1b[0m",
            Level::Warn => "\x1b[33mWARN\x1b[0m ",
            Level::Info => "\x1b[32mINFO\x1b[0m ",
            Level::Debug => "\x1b[34mDEBUG\x1b[0m",
            Level::Trace => "\x1b[35mTRACE\x1b[0m",
        }
    } else {
        match level {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }
}

/// Format one record onto `sink`
pub fn write_record(sink: &dyn LogSink, ts: u64, record: &Record) {
    let mut w = SinkWriter(sink);
    let _ = writeln!(
        w,
        "[{:>10}] [{}] {}",
        ts,
        level_str(record.level(), sink.ansi()),
        record.args()
    );
}

struct EngineLogger;

impl log::Log for EngineLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(backend) = BACKEND.get() {
            write_record(backend.sink, (backend.clock)(), record);
        }
    }

    fn flush(&self) {}
}

static LOGGER: EngineLogger = EngineLogger;

/// Install the logger.
///
/// Only the first call takes effect; later calls (or another logger
/// already being installed) are ignored.
pub fn init(sink: &'static dyn LogSink, clock: fn() -> u64) {
    BACKEND.call_once(|| Backend { sink, clock });
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
