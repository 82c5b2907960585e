//! Default logging sink.
//!
//! Emission goes through the `log` facade, so any sink can be installed
//! with `log::set_logger`. [`init`] installs a plain stderr writer with the
//! level taken from the `IOQ_LOG` environment variable (`off`, `error`,
//! `warn`, `info`, `debug`, `trace`; default `info`). Unrecoverable
//! conditions go through [`fatal`], which logs and aborts the process.

use std::fmt;
use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "[{}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn level_from_env() -> LevelFilter {
    match std::env::var("IOQ_LOG").as_deref() {
        Ok("off") | Ok("0") => LevelFilter::Off,
        Ok("error") | Ok("1") => LevelFilter::Error,
        Ok("warn") | Ok("2") => LevelFilter::Warn,
        Ok("debug") | Ok("4") => LevelFilter::Debug,
        Ok("trace") | Ok("5") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Install the stderr sink. Idempotent; does nothing if a logger is
/// already set.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level_from_env());
    }
}

/// Log an unrecoverable error and abort. Installs the default sink first
/// so the message is visible even if nothing was configured.
pub fn fatal(msg: impl fmt::Display) -> ! {
    init();
    log::error!("fatal: {msg}");
    std::process::abort();
}
