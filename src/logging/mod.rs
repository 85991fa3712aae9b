//! Logging for the dataset builder
//!
//! - Bracketed event format carrying the worker thread name
//! - Stdout plus an optional timestamped log file

mod formatter;
mod setup;

pub use setup::setup_logging;
