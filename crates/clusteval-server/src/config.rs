//! `repository.config` handling.
//!
//! The file is INI. Every section is optional and unknown keys are ignored,
//! so an empty or missing file yields [`ServerConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use clusteval_plugin_scanner::SleepTimes;
use clusteval_scheduler::SchedulerConfig;
use ini::{Ini, Properties};
use thiserror::Error;
use tracing::warn;

pub const CONFIG_FILE_NAME: &str = "repository.config";
pub const DEFAULT_BIND: &str = "127.0.0.1:1099";
pub const DEFAULT_ENGINE_COMMAND: &str = "R";
pub const DEFAULT_ENGINE_ARGS: &[&str] = &["--vanilla", "--slave"];

/// Suffix of every `[threading]` key that sets a loop interval.
const SLEEP_TIME_SUFFIX: &str = "SleepTime";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] ini::ParseError),

    #[error("invalid configuration: [{section}] {key} = '{value}': {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("missing `{key}` in [{section}]")]
    Missing { section: String, key: String },

    #[error("both [mysql] and [postgresql] are configured")]
    ConflictingDatabases,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    MySql,
    PostgreSql,
}

impl DatabaseBackend {
    fn section(self) -> &'static str {
        match self {
            DatabaseBackend::MySql => "mysql",
            DatabaseBackend::PostgreSql => "postgresql",
        }
    }
}

/// Connection settings of the optional result database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub host: String,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub command: String,
    pub args: Vec<String>,
    pub enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_ENGINE_COMMAND.to_string(),
            args: DEFAULT_ENGINE_ARGS.iter().map(|arg| arg.to_string()).collect(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenConfig {
    pub bind: String,
    /// Client id allowed to shut the server down regardless of ownership.
    pub admin_client_id: Option<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            admin_client_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerConfig {
    /// `None` when no database section is present.
    pub database: Option<DatabaseConfig>,
    pub sleep_times: SleepTimes,
    pub scheduler: SchedulerConfig,
    pub engine: EngineConfig,
    pub server: ListenConfig,
}

impl ServerConfig {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        parse_ini(&ini)
    }

    pub fn from_ini_str(contents: &str) -> Result<Self, ConfigError> {
        parse_ini(&Ini::load_from_str(contents)?)
    }

    /// Whether results should also go to a database.
    pub fn database_enabled(&self) -> bool {
        self.database.as_ref().is_some_and(|db| db.enabled)
    }
}

fn parse_ini(ini: &Ini) -> Result<ServerConfig, ConfigError> {
    let mut config = ServerConfig::default();

    let mysql = parse_database(ini, DatabaseBackend::MySql)?;
    let postgresql = parse_database(ini, DatabaseBackend::PostgreSql)?;
    config.database = match (mysql, postgresql) {
        (Some(_), Some(_)) => return Err(ConfigError::ConflictingDatabases),
        (db, None) | (None, db) => db,
    };
    if let Some(db) = config.database.as_ref().filter(|db| db.enabled) {
        warn!(
            backend = db.backend.section(),
            host = %db.host,
            "no database driver is linked, results stay file-based"
        );
    }

    // [threading] section
    if let Some(section) = ini.section(Some("threading")) {
        for (key, value) in section.iter() {
            let Some(name) = key.strip_suffix(SLEEP_TIME_SUFFIX) else {
                continue;
            };
            let millis = parse_number::<u64>("threading", key, value, "milliseconds")?;
            config
                .sleep_times
                .set(name, Duration::from_millis(millis));
        }
    }

    // [scheduler] section
    if let Some(section) = ini.section(Some("scheduler")) {
        if let Some(v) = section.get("workers") {
            let workers = parse_number::<usize>("scheduler", "workers", v, "thread count")?;
            if workers == 0 {
                return Err(invalid("scheduler", "workers", v, "must be at least 1"));
            }
            config.scheduler.workers = workers;
        }
        if let Some(v) = section.get("maxRetries") {
            config.scheduler.max_retries =
                parse_number("scheduler", "maxRetries", v, "retry count")?;
        }
        if let Some(v) = section.get("shutdownGraceMs") {
            let millis = parse_number::<u64>("scheduler", "shutdownGraceMs", v, "milliseconds")?;
            config.scheduler.shutdown_grace = Duration::from_millis(millis);
        }
    }

    // [engine] section
    if let Some(section) = ini.section(Some("engine")) {
        if let Some(v) = section.get("command") {
            let v = v.trim();
            if !v.is_empty() {
                config.engine.command = v.to_string();
            }
        }
        if let Some(v) = section.get("args") {
            config.engine.args = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = section.get("enabled") {
            config.engine.enabled = parse_bool("engine", "enabled", v)?;
        }
    }

    // [server] section
    if let Some(section) = ini.section(Some("server")) {
        if let Some(v) = section.get("bind") {
            let v = v.trim();
            if !v.contains(':') {
                return Err(invalid("server", "bind", v, "expected host:port"));
            }
            config.server.bind = v.to_string();
        }
        if let Some(v) = section.get("adminClientId") {
            let v = v.trim();
            if !v.is_empty() {
                config.server.admin_client_id = Some(v.to_string());
            }
        }
    }

    Ok(config)
}

fn parse_database(
    ini: &Ini,
    backend: DatabaseBackend,
) -> Result<Option<DatabaseConfig>, ConfigError> {
    let name = backend.section();
    let Some(section) = ini.section(Some(name)) else {
        return Ok(None);
    };
    let enabled = match section.get("enabled") {
        Some(v) => parse_bool(name, "enabled", v)?,
        None => true,
    };
    let required = |key: &str| -> Result<String, ConfigError> {
        match section.get(key).map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => Ok(v.to_string()),
            // A disabled section may be a placeholder.
            None if !enabled => Ok(String::new()),
            None => Err(ConfigError::Missing {
                section: name.to_string(),
                key: key.to_string(),
            }),
        }
    };
    Ok(Some(DatabaseConfig {
        backend,
        host: required("host")?,
        database: required("database")?,
        user: required("user")?,
        password: optional(section, "password"),
        enabled,
    }))
}

fn optional(section: &Properties, key: &str) -> Option<String> {
    section
        .get(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_number<T: std::str::FromStr>(
    section: &str,
    key: &str,
    value: &str,
    what: &str,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| {
            let reason = format!("must be a non-negative integer ({what})");
            invalid(section, key, value, &reason)
        })
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(section, key, value, "must be true or false")),
    }
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
