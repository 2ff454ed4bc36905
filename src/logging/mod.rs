mod logger;
mod secret_scrubbing;

pub use logger::LoggerGuard;
pub use secret_scrubbing::SecretScrubbingLayer;

use anyhow::Result;

use crate::config::LoggingConfig;

/// Initialize the process-wide tracing subscriber from project settings.
///
/// Returns a guard that must be kept alive for the lifetime of the
/// process; dropping it flushes the non-blocking file writer.
pub fn init(config: &LoggingConfig) -> Result<LoggerGuard> {
    logger::LoggerGuard::init(config)
}
