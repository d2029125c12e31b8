//! Logging setup
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to this
//! crate's targets only.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Log level configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Filter directive for `level`; `verbose` forces debug
fn directive(level: &str, verbose: bool) -> String {
    let level = if verbose {
        LogLevel::Debug
    } else {
        LogLevel::parse(level).unwrap_or(LogLevel::Info)
    };
    let level = level.to_tracing_level().as_str().to_lowercase();
    format!("shardrun={level},audit={level}")
}

/// Initialize the global subscriber once per process
pub fn init_logger(level: &str, verbose: bool) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() && !verbose => EnvFilter::new(directives),
        _ => EnvFilter::new(directive(level, verbose)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("unknown"), None);
    }

    #[test]
    fn test_directive() {
        assert_eq!(directive("warn", false), "shardrun=warn,audit=warn");
        assert_eq!(directive("warn", true), "shardrun=debug,audit=debug");
        assert_eq!(directive("loud", false), "shardrun=info,audit=info");
    }
}
