//! External log sink that tracked log lines are mirrored to

use crate::types::LogLevel;

/// Receives a copy of every tracked log line when mirroring is enabled.
///
/// Errors returned here are discarded by the tracker; a failing sink never
/// fails the tracked work.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str) -> anyhow::Result<()>;
}

/// Default sink: forwards to `tracing` under the `flowtrail::mirror` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) -> anyhow::Result<()> {
        match level {
            LogLevel::Debug => tracing::debug!(target: "flowtrail::mirror", "{}", message),
            LogLevel::Info => tracing::info!(target: "flowtrail::mirror", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "flowtrail::mirror", "{}", message),
            LogLevel::Error => tracing::error!(target: "flowtrail::mirror", "{}", message),
        }
        Ok(())
    }
}
