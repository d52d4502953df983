//! Configuration management for the annotation store
//!
//! Settings come from defaults, an optional TOML file and `AS_*` environment
//! variables, in that order of precedence (later wins).

use crate::types::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// On-disk serialization format of annotation graphs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodecKind {
    /// bincode, compact and fast
    Bincode,
    /// JSON, human readable
    Json,
    /// MessagePack
    MessagePack,
}

/// How writes detect that the file changed since the graph was loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyCheck {
    /// Compare modification time and size only
    Timestamp,
    /// Additionally compare a blake3 digest of the file content
    TimestampAndDigest,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding one sub-directory per project
    pub data_dir: PathBuf,

    /// Serialization format for new and existing graph files
    pub codec: CodecKind,

    /// Optimistic concurrency check strength
    pub concurrency_check: ConcurrencyCheck,

    /// Restore or discard leftover backup files when the service starts
    pub recover_on_start: bool,

    /// History backups
    pub backup: BackupConfig,
}

/// History backup retention. An interval of zero disables history backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Minimum time between two history copies of the same file
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub interval: Duration,

    /// Keep at most this many history copies per file (0 = unlimited)
    pub keep_number: usize,

    /// Remove history copies older than this (0 = keep forever)
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub keep_age: Duration,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Register and update Prometheus metrics
    pub enable_prometheus: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            codec: CodecKind::Bincode,
            concurrency_check: ConcurrencyCheck::TimestampAndDigest,
            recover_on_start: true,
            backup: BackupConfig::default(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            keep_number: 10,
            keep_age: Duration::ZERO,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable_prometheus: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl BackupConfig {
    /// True if pre-write copies are kept as history
    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

impl StorageConfig {
    /// Storage settings rooted at `data_dir`, everything else default
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

impl Config {
    /// Load configuration from `annotation-store.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(file_config) = Self::from_file("annotation-store.toml") {
            config = file_config;
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        if let Ok(data_dir) = env::var("AS_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(codec) = env::var("AS_CODEC") {
            self.storage.codec = parse_codec(&codec)?;
        }

        if let Ok(check) = env::var("AS_CONCURRENCY_CHECK") {
            self.storage.concurrency_check = match check.as_str() {
                "timestamp" => ConcurrencyCheck::Timestamp,
                "timestamp-and-digest" => ConcurrencyCheck::TimestampAndDigest,
                other => return Err(Error::config(format!("Invalid concurrency check: {}", other))),
            };
        }

        if let Ok(interval) = env::var("AS_BACKUP_INTERVAL") {
            self.storage.backup.interval = parse_duration(&interval)
                .map_err(|e| Error::config(format!("Invalid backup interval: {}", e)))?;
        }

        if let Ok(keep) = env::var("AS_BACKUP_KEEP_NUMBER") {
            self.storage.backup.keep_number = keep.parse()
                .map_err(|e| Error::config(format!("Invalid backup keep number: {}", e)))?;
        }

        if let Ok(level) = env::var("AS_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("AS_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(Error::config("Data directory must not be empty"));
        }

        if self.storage.backup.enabled()
            && self.storage.backup.keep_number == 0
            && self.storage.backup.keep_age.is_zero()
        {
            tracing::warn!("History backups are enabled without any retention limit");
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config("Invalid log level")),
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            _ => return Err(Error::config("Invalid log format")),
        }

        Ok(())
    }
}

/// Parse a codec name as used in config files and on the command line
pub fn parse_codec(name: &str) -> Result<CodecKind> {
    match name {
        "bincode" => Ok(CodecKind::Bincode),
        "json" => Ok(CodecKind::Json),
        "message-pack" | "msgpack" => Ok(CodecKind::MessagePack),
        other => Err(Error::config(format!(
            "Invalid codec: {}. Valid options: bincode, json, message-pack", other
        ))),
    }
}

use serde::de::{self, Deserializer, Visitor};
use serde::Serializer;
use std::fmt;

// Custom deserializer for Duration from string
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration string like '30s' or '5m'")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            parse_duration(value).map_err(E::custom)
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if duration.subsec_nanos() == 0 {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    } else {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }
}

/// Simple duration parser for common formats (`250ms`, `30s`, `5m`, `2h`, `7d`, bare seconds)
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let ms: u64 = ms.parse().map_err(|_| "Invalid milliseconds")?;
        Ok(Duration::from_millis(ms))
    } else if let Some(secs) = s.strip_suffix('s') {
        let secs: u64 = secs.parse().map_err(|_| "Invalid seconds")?;
        Ok(Duration::from_secs(secs))
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins: u64 = mins.parse().map_err(|_| "Invalid minutes")?;
        Ok(Duration::from_secs(mins * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours: u64 = hours.parse().map_err(|_| "Invalid hours")?;
        Ok(Duration::from_secs(hours * 3600))
    } else if let Some(days) = s.strip_suffix('d') {
        let days: u64 = days.parse().map_err(|_| "Invalid days")?;
        Ok(Duration::from_secs(days * 86_400))
    } else {
        let secs: u64 = s.parse().map_err(|_| "Invalid duration format")?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.storage.codec, CodecKind::Bincode);
        assert_eq!(config.storage.concurrency_check, ConcurrencyCheck::TimestampAndDigest);
        assert!(!config.storage.backup.enabled());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [storage]
            data_dir = "/var/lib/annotations"
            codec = "json"

            [storage.backup]
            interval = "5m"
            keep_age = "7d"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/annotations"));
        assert_eq!(config.storage.codec, CodecKind::Json);
        assert_eq!(config.storage.backup.interval, Duration::from_secs(300));
        assert_eq!(config.storage.backup.keep_age, Duration::from_secs(7 * 86_400));
        assert_eq!(config.storage.backup.keep_number, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn config_survives_toml_round_trip() {
        let mut config = Config::default();
        config.storage.backup.interval = Duration::from_millis(1500);
        let text = toml::to_string(&config).unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.storage.backup, config.storage.backup);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
        assert!(Config::from_toml("[storage]\ncodec = \"xml\"").is_err());
        assert!(parse_codec("yaml").is_err());
    }

    #[test]
    fn duration_formats() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("soon").is_err());
    }
}
