//! Endpoint configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `BROKER_`-prefixed environment variables. Programmatic assignments happen
//! last on the returned struct and therefore override everything.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Log verbosity for the console and file sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Everything, including per-frame traces.
    Trace,
    /// Developer diagnostics.
    Debug,
    /// Lifecycle events.
    Info,
    /// Recoverable anomalies.
    Warning,
    /// Failures.
    Error,
    /// No output.
    Quiet,
}

impl FromStr for Verbosity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "quiet" => Ok(Self::Quiet),
            other => Err(Error::config(format!("unknown verbosity {other:?}"))),
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Quiet => "quiet",
        };
        f.write_str(name)
    }
}

/// Environment variable prefix mirroring the configuration keys.
pub const ENV_PREFIX: &str = "BROKER_";

/// Configuration files probed by [`Config::load`], in order.
const CONFIG_FILE_NAMES: &[&str] = &["weft.toml", "broker.toml"];

/// Endpoint configuration. All keys are optional and fall back to the
/// defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Use plaintext transport instead of TLS.
    pub disable_ssl: bool,

    /// Act as a leaf: deliver locally and publish own items, but never relay
    /// items between peers.
    pub disable_forwarding: bool,

    /// Period of the local logical-clock tick, in milliseconds.
    pub tick_interval: u64,

    /// Ticks between outbound heartbeats.
    pub heartbeat_interval: u32,

    /// Ticks a sequence gap may persist before a NACK goes out.
    pub nack_timeout: u32,

    /// Missed heartbeat intervals before a peer is declared dead.
    pub connection_timeout: u32,

    /// If set, record published messages under this directory.
    pub recording_directory: Option<PathBuf>,

    /// Maximum records per recording file before rotation.
    pub output_generator_file_cap: u64,

    /// Verbosity of the console log sink.
    pub console_verbosity: Verbosity,

    /// Verbosity of the file log sink.
    pub file_verbosity: Verbosity,

    /// Initial TTL stamped on locally published items.
    pub initial_ttl: u16,

    /// Credit window granted to each peer, in items.
    pub initial_credit_window: u32,

    /// Events the dispatcher handles per lane before moving on.
    pub batch_size: usize,

    /// Capacity of subscriber and publisher queues.
    pub queue_capacity: usize,

    /// Soft capacity of the item pool.
    pub pool_capacity: usize,

    /// Hard ceiling of the item pool; `acquire` fails beyond it.
    pub pool_ceiling: usize,

    /// Milliseconds between blacklist aging sweeps.
    pub blacklist_aging_interval: u64,

    /// Milliseconds a withdrawn path stays blacklisted.
    pub blacklist_max_age: u64,

    /// Consecutive connect failures before the connector gives up and
    /// reports the peer unavailable.
    pub connect_retry_limit: u32,

    /// Milliseconds a graceful shutdown waits for peers to drain.
    pub shutdown_deadline: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            disable_ssl: false,
            disable_forwarding: false,
            tick_interval: 50,
            heartbeat_interval: 20,
            nack_timeout: 5,
            connection_timeout: 5,
            recording_directory: None,
            output_generator_file_cap: u64::MAX,
            console_verbosity: Verbosity::Info,
            file_verbosity: Verbosity::Quiet,
            initial_ttl: 20,
            initial_credit_window: 32,
            batch_size: 32,
            queue_capacity: 64,
            pool_capacity: 512,
            pool_ceiling: 4096,
            blacklist_aging_interval: 1_000,
            blacklist_max_age: 300_000,
            connect_retry_limit: 8,
            shutdown_deadline: 3_000,
        }
    }
}

impl Config {
    /// Load the configuration: defaults, then the first config file found in
    /// the working directory, then environment overrides.
    ///
    /// # Errors
    /// Returns [`Error::Config`] on unreadable files or unparseable values.
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_file() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn find_file() -> Option<PathBuf> {
        CONFIG_FILE_NAMES.iter().map(PathBuf::from).find(|p| p.is_file())
    }

    /// Parse a TOML configuration file. Missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| Error::config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Apply `BROKER_`-prefixed environment overrides.
    ///
    /// # Errors
    /// Returns [`Error::Config`] on unparseable values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| env::var(key).ok())
    }

    fn apply_env_from<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
        where
            T::Err: fmt::Display,
        {
            value
                .parse()
                .map_err(|e| Error::config(format!("invalid value {value:?} for {key}: {e}")))
        }

        fn parse_bool(key: &str, value: &str) -> Result<bool> {
            match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                other => Err(Error::config(format!("invalid boolean {other:?} for {key}"))),
            }
        }

        macro_rules! override_from_env {
            ($field:ident, $convert:expr) => {
                let key = concat!("BROKER_", stringify!($field)).to_ascii_uppercase();
                if let Some(value) = get(&key) {
                    self.$field = $convert(&key, &value)?;
                }
            };
        }

        override_from_env!(disable_ssl, parse_bool);
        override_from_env!(disable_forwarding, parse_bool);
        override_from_env!(tick_interval, parse::<u64>);
        override_from_env!(heartbeat_interval, parse::<u32>);
        override_from_env!(nack_timeout, parse::<u32>);
        override_from_env!(connection_timeout, parse::<u32>);
        override_from_env!(output_generator_file_cap, parse::<u64>);
        override_from_env!(initial_ttl, parse::<u16>);
        override_from_env!(initial_credit_window, parse::<u32>);
        override_from_env!(batch_size, parse::<usize>);
        override_from_env!(queue_capacity, parse::<usize>);
        override_from_env!(pool_capacity, parse::<usize>);
        override_from_env!(pool_ceiling, parse::<usize>);
        override_from_env!(blacklist_aging_interval, parse::<u64>);
        override_from_env!(blacklist_max_age, parse::<u64>);
        override_from_env!(connect_retry_limit, parse::<u32>);
        override_from_env!(shutdown_deadline, parse::<u64>);
        override_from_env!(console_verbosity, |_k, v: &str| v.parse::<Verbosity>());
        override_from_env!(file_verbosity, |_k, v: &str| v.parse::<Verbosity>());

        if let Some(value) = get("BROKER_RECORDING_DIRECTORY") {
            self.recording_directory =
                if value.is_empty() { None } else { Some(PathBuf::from(value)) };
        }
        Ok(())
    }

    /// Render every recognized option with its effective value.
    ///
    /// Each field reports itself; in particular `disable_forwarding` carries
    /// its own value, independent of `disable_ssl`.
    pub fn dump_content(&self) -> toml::value::Table {
        let mut table = toml::value::Table::new();
        let mut put = |key: &str, value: toml::Value| {
            table.insert(key.to_string(), value);
        };
        put("disable_ssl", self.disable_ssl.into());
        put("disable_forwarding", self.disable_forwarding.into());
        put("tick_interval", (self.tick_interval as i64).into());
        put("heartbeat_interval", i64::from(self.heartbeat_interval).into());
        put("nack_timeout", i64::from(self.nack_timeout).into());
        put("connection_timeout", i64::from(self.connection_timeout).into());
        put(
            "recording_directory",
            self.recording_directory
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
                .into(),
        );
        put(
            "output_generator_file_cap",
            i64::try_from(self.output_generator_file_cap).unwrap_or(i64::MAX).into(),
        );
        put("console_verbosity", self.console_verbosity.to_string().into());
        put("file_verbosity", self.file_verbosity.to_string().into());
        put("initial_ttl", i64::from(self.initial_ttl).into());
        put("initial_credit_window", i64::from(self.initial_credit_window).into());
        put("batch_size", (self.batch_size as i64).into());
        put("queue_capacity", (self.queue_capacity as i64).into());
        put("pool_capacity", (self.pool_capacity as i64).into());
        put("pool_ceiling", (self.pool_ceiling as i64).into());
        put("blacklist_aging_interval", (self.blacklist_aging_interval as i64).into());
        put("blacklist_max_age", (self.blacklist_max_age as i64).into());
        put("connect_retry_limit", i64::from(self.connect_retry_limit).into());
        put("shutdown_deadline", (self.shutdown_deadline as i64).into());
        table
    }

    /// The logical-clock tick period.
    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_interval)
    }

    /// Time between outbound heartbeats.
    pub const fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.tick_interval * self.heartbeat_interval as u64)
    }

    /// Silence after which a peer is declared dead.
    pub const fn dead_after(&self) -> Duration {
        Duration::from_millis(
            self.tick_interval * self.heartbeat_interval as u64 * self.connection_timeout as u64,
        )
    }

    /// How long a sequence gap may persist before a NACK goes out.
    pub const fn nack_delay(&self) -> Duration {
        Duration::from_millis(self.tick_interval * self.nack_timeout as u64)
    }

    /// Period between blacklist aging sweeps.
    pub const fn blacklist_sweep(&self) -> Duration {
        Duration::from_millis(self.blacklist_aging_interval)
    }

    /// Age at which a blacklist entry expires.
    pub const fn blacklist_age(&self) -> Duration {
        Duration::from_millis(self.blacklist_max_age)
    }

    /// Grace period for a graceful shutdown.
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(!config.disable_ssl);
        assert!(!config.disable_forwarding);
        assert_eq!(config.initial_ttl, 20);
        assert!(config.pool_ceiling >= config.pool_capacity);
        assert_eq!(config.console_verbosity, Verbosity::Info);
        assert_eq!(config.file_verbosity, Verbosity::Quiet);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config { tick_interval: 10, ..Config::default() };
        let env: HashMap<&str, &str> = [
            ("BROKER_TICK_INTERVAL", "250"),
            ("BROKER_DISABLE_FORWARDING", "true"),
            ("BROKER_CONSOLE_VERBOSITY", "error"),
            ("BROKER_RECORDING_DIRECTORY", "/tmp/records"),
        ]
        .into_iter()
        .collect();
        config.apply_env_from(|key| env.get(key).map(ToString::to_string)).unwrap();

        assert_eq!(config.tick_interval, 250);
        assert!(config.disable_forwarding);
        assert_eq!(config.console_verbosity, Verbosity::Error);
        assert_eq!(config.recording_directory, Some(PathBuf::from("/tmp/records")));
        // Untouched keys keep their previous value.
        assert_eq!(config.connect_retry_limit, Config::default().connect_retry_limit);
    }

    #[test]
    fn env_rejects_garbage() {
        let mut config = Config::default();
        let result = config.apply_env_from(|key| {
            (key == "BROKER_NACK_TIMEOUT").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn file_overlays_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "tick_interval = 123\ndisable_ssl = true\nfile_verbosity = \"debug\""
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.tick_interval, 123);
        assert!(config.disable_ssl);
        assert_eq!(config.file_verbosity, Verbosity::Debug);
        assert_eq!(config.batch_size, Config::default().batch_size);
    }

    #[test]
    fn dump_reports_forwarding_independently() {
        let config =
            Config { disable_ssl: false, disable_forwarding: true, ..Config::default() };
        let dump = config.dump_content();
        assert_eq!(dump["disable_ssl"], toml::Value::Boolean(false));
        assert_eq!(dump["disable_forwarding"], toml::Value::Boolean(true));

        let flipped =
            Config { disable_ssl: true, disable_forwarding: false, ..Config::default() };
        let dump = flipped.dump_content();
        assert_eq!(dump["disable_ssl"], toml::Value::Boolean(true));
        assert_eq!(dump["disable_forwarding"], toml::Value::Boolean(false));
    }

    #[test]
    fn derived_durations() {
        let config = Config {
            tick_interval: 100,
            heartbeat_interval: 10,
            connection_timeout: 3,
            nack_timeout: 5,
            ..Config::default()
        };
        assert_eq!(config.tick(), Duration::from_millis(100));
        assert_eq!(config.heartbeat_period(), Duration::from_secs(1));
        assert_eq!(config.dead_after(), Duration::from_secs(3));
        assert_eq!(config.nack_delay(), Duration::from_millis(500));
    }

    #[test]
    fn verbosity_parsing() {
        assert_eq!("WARNING".parse::<Verbosity>().unwrap(), Verbosity::Warning);
        assert!("loud".parse::<Verbosity>().is_err());
    }
}
