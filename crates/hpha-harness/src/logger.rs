//! Minimal stderr sink for the `log` facade.

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};

/// Environment variable overriding the level chosen on the command line.
pub const ENV_LOG: &str = "HPHA_LOG";

pub struct StderrLogger {
    level: LevelFilter,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("<unnamed>");
        let mut err = std::io::stderr().lock();
        let _ = writeln!(
            err,
            "{:<5} [{name}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Level for `verbose` repetitions of `-v`: warn, info, debug, trace.
#[must_use]
pub fn level_for(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Parse a level name (`off`, `error`, ..., `trace`).
#[must_use]
pub fn parse_level(raw: &str) -> Option<LevelFilter> {
    raw.trim().parse().ok()
}

/// Install the logger; `HPHA_LOG` wins over `level` when it parses.
pub fn init(level: LevelFilter) -> Result<LevelFilter, log::SetLoggerError> {
    let level = std::env::var(ENV_LOG)
        .ok()
        .and_then(|raw| parse_level(&raw))
        .unwrap_or(level);
    log::set_max_level(level);
    log::set_boxed_logger(Box::new(StderrLogger { level }))?;
    Ok(level)
}
