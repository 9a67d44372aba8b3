//! # Diagnostic logging
//!
//! A `log::Log` sink writing `"[LEVEL] target: message"` lines to stderr.
//! Targets double as diagnostic categories: warnings and errors always pass,
//! everything more verbose only for categories that were switched on.

mod category;
mod logger;

pub use category::Category;
pub use logger::StderrLogger;
