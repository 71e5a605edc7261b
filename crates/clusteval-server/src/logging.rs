//! Process-wide logging with a level that can be changed at runtime.

use std::str::FromStr;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum LogLevelError {
    #[error("unknown log level `{0}`")]
    Unknown(String),

    #[error("logging is not initialised: {0}")]
    Unavailable(String),
}

/// Accepts the tracing level names plus `all` (trace) and `off`,
/// case-insensitively.
pub fn parse_level(level: &str) -> Result<LevelFilter, LogLevelError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "all" => Ok(LevelFilter::TRACE),
        "warning" => Ok(LevelFilter::WARN),
        other => {
            LevelFilter::from_str(other).map_err(|_| LogLevelError::Unknown(level.to_string()))
        }
    }
}

/// Handle on the installed filter, used by `setLogLevel`.
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    level: Mutex<String>,
}

impl LogControl {
    /// Builds the subscriber without installing it. `RUST_LOG` wins over
    /// `default_level` for the initial filter.
    pub fn build(
        default_level: &str,
    ) -> Result<(Self, impl Subscriber + Send + Sync + 'static), LogLevelError> {
        let default = parse_level(default_level)?;
        let (filter, level) = match EnvFilter::try_from_default_env() {
            Ok(filter) => {
                let level = filter.to_string();
                (filter, level)
            }
            Err(_) => (filter_for(default), level_name(default)),
        };
        let (filter, handle) = reload::Layer::new(filter);
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_thread_names(true));
        Ok((
            Self {
                handle,
                level: Mutex::new(level),
            },
            subscriber,
        ))
    }

    /// Installs the global subscriber.
    pub fn init(default_level: &str) -> anyhow::Result<Self> {
        let (control, subscriber) = Self::build(default_level)?;
        subscriber.try_init()?;
        Ok(control)
    }

    pub fn level(&self) -> String {
        self.level.lock().clone()
    }

    pub fn set_level(&self, level: &str) -> Result<(), LogLevelError> {
        let parsed = parse_level(level)?;
        self.handle
            .reload(filter_for(parsed))
            .map_err(|err| LogLevelError::Unavailable(err.to_string()))?;
        let name = level_name(parsed);
        tracing::info!(level = %name, "log level changed");
        *self.level.lock() = name;
        Ok(())
    }
}

fn level_name(level: LevelFilter) -> String {
    level
        .into_level()
        .map_or_else(|| "off".to_string(), |level| level.as_str().to_ascii_lowercase())
}

fn filter_for(level: LevelFilter) -> EnvFilter {
    EnvFilter::default().add_directive(level.into())
}
