use crate::Category;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::Write;

pub struct StderrLogger {
    max_level: LevelFilter,
    enabled: u32,
}

impl StderrLogger {
    #[must_use]
    pub fn new(max_level: LevelFilter, categories: &[Category]) -> Self {
        Self {
            max_level,
            enabled: categories.iter().fold(0, |acc, c| acc | c.bit()),
        }
    }

    /// Call this once during start-up.
    #[allow(clippy::missing_errors_doc)]
    pub fn init(self) -> Result<(), SetLoggerError> {
        let max = self.max_level;
        // log::set_logger expects a &'static Log; the logger lives for the
        // rest of the process anyway.
        let logger: &'static Self = Box::leak(Box::new(self));
        log::set_logger(logger)?;
        log::set_max_level(max);
        Ok(())
    }

    fn category_enabled(&self, target: &str) -> bool {
        Category::by_name(target).is_some_and(|c| self.enabled & c.bit() != 0)
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.level() > self.max_level {
            return false;
        }
        metadata.level() <= Level::Warn || self.category_enabled(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Format: "[LEVEL] target: message\n"
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
