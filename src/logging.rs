//! Process-wide logging setup.
//!
//! Installs a console layer and, unless disabled with `$NONE`, a file layer,
//! each with its own verbosity from the role configuration. Initialization
//! is idempotent: the first caller wins and later calls are no-ops, so
//! embedded and test usage can call it freely.

use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::Config;

/// Log level names accepted in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Fatal,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} is not a log level")]
pub struct VerbosityParseError(String);

impl FromStr for Verbosity {
    type Err = VerbosityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            "FATAL" => Ok(Self::Fatal),
            other => Err(VerbosityParseError(other.to_owned())),
        }
    }
}

impl Verbosity {
    /// The tracing filter this verbosity maps onto. CRITICAL and FATAL have
    /// no tracing counterpart and collapse to ERROR.
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warn => LevelFilter::WARN,
            Self::Error | Self::Critical | Self::Fatal => LevelFilter::ERROR,
        }
    }
}

/// Installs the global subscriber from the role's logging keys.
///
/// Returns an error only when the log file cannot be opened; an already
/// initialized subscriber is left in place silently.
pub fn init(config: &Config) -> std::io::Result<()> {
    let screen = config
        .screen_verbosity()
        .map(Verbosity::level_filter)
        .unwrap_or(LevelFilter::INFO);
    let file = config
        .file_verbosity()
        .map(Verbosity::level_filter)
        .unwrap_or(LevelFilter::INFO);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(screen);

    match config.log_file() {
        Some(path) => {
            let sink = OpenOptions::new().create(true).append(true).open(&path)?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(sink))
                .with_filter(file);
            let _ = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::registry().with(console_layer).try_init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse() {
        assert_eq!("DEBUG".parse(), Ok(Verbosity::Debug));
        assert_eq!("FATAL".parse(), Ok(Verbosity::Fatal));
        assert!("verbose".parse::<Verbosity>().is_err());
    }

    #[test]
    fn critical_and_fatal_collapse_to_error() {
        assert_eq!(Verbosity::Critical.level_filter(), LevelFilter::ERROR);
        assert_eq!(Verbosity::Fatal.level_filter(), LevelFilter::ERROR);
        assert_eq!(Verbosity::Warn.level_filter(), LevelFilter::WARN);
    }
}
