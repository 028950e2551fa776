//! Worker configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML file
//! (`BAZAAR_CONFIG` or `./bazaar.toml`), then `BAZAAR_*` environment
//! variables. A `.env` file is read into the environment before any of that.
//! Durations are human strings such as `"24h"` or `"7days"`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::external::SquareConfig;
use crate::external::square::DEFAULT_SQUARE_BASE_URL;
use crate::lock::DEFAULT_LOCK_TTL;

pub const CONFIG_PATH_ENV: &str = "BAZAAR_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "bazaar.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to load .env file: {0}")]
    DotEnv(#[from] dotenvy::Error),

    #[error("invalid value for {key}: {message}")]
    InvalidEnv { key: &'static str, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub lock_key: String,
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 60 * 60),
            lock_key: "bazaar:cron:lock".to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub retention_days: u32,
    pub min_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            min_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub retention_days: u32,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub pending_retention_days: u32,
    /// Object-storage bucket holding license documents.
    pub bucket: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            pending_retention_days: 7,
            bucket: "bazaar-media".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    pub expiry_warning_days: u32,
    pub expiration_window_days: u32,
    pub deletion_age_days: u32,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            expiry_warning_days: 14,
            expiration_window_days: 30,
            deletion_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrdersConfig {
    pub pending_nudge_days: u32,
    pub expiration_days: u32,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            pending_nudge_days: 5,
            expiration_days: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionsConfig {
    pub reconcile_limit: u32,
    #[serde(with = "humantime_serde")]
    pub reconcile_lookback: Duration,
    pub default_price_id: String,
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            reconcile_limit: 250,
            reconcile_lookback: Duration::from_secs(7 * 24 * 60 * 60),
            default_price_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SquareSettings {
    pub base_url: String,
    pub access_token: Option<String>,
    pub location_id: Option<String>,
}

impl Default for SquareSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SQUARE_BASE_URL.to_string(),
            access_token: None,
            location_id: None,
        }
    }
}

/// Everything the worker needs to wire the core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub cron: CronConfig,
    pub outbox: OutboxConfig,
    pub notifications: NotificationsConfig,
    pub media: MediaConfig,
    pub license: LicenseConfig,
    pub orders: OrdersConfig,
    pub subscriptions: SubscriptionsConfig,
    pub square: SquareSettings,
}

impl CoreConfig {
    pub fn from_toml_str(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `BAZAAR_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("BAZAAR_DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(url) = non_empty("BAZAAR_REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Some(token) = non_empty("BAZAAR_SQUARE_ACCESS_TOKEN") {
            self.square.access_token = Some(token);
        }
        if let Some(location) = non_empty("BAZAAR_SQUARE_LOCATION_ID") {
            self.square.location_id = Some(location);
        }
        if let Some(price) = non_empty("BAZAAR_DEFAULT_PRICE_ID") {
            self.subscriptions.default_price_id = price;
        }
        if let Some(bucket) = non_empty("BAZAAR_MEDIA_BUCKET") {
            self.media.bucket = bucket;
        }
        if let Some(raw) = non_empty("BAZAAR_CRON_INTERVAL") {
            self.cron.interval =
                humantime::parse_duration(&raw).map_err(|err| ConfigError::InvalidEnv {
                    key: "BAZAAR_CRON_INTERVAL",
                    message: err.to_string(),
                })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriptions.default_price_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "subscriptions.default_price_id is required".to_string(),
            ));
        }
        for (key, value) in [
            ("cron.interval", self.cron.interval),
            ("cron.lock_ttl", self.cron.lock_ttl),
            ("subscriptions.reconcile_lookback", self.subscriptions.reconcile_lookback),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
            }
        }
        if self.cron.lock_key.trim().is_empty() {
            return Err(ConfigError::Invalid("cron.lock_key must not be empty".to_string()));
        }
        for (key, value) in [
            ("outbox.retention_days", self.outbox.retention_days),
            ("outbox.min_attempts", self.outbox.min_attempts),
            ("notifications.retention_days", self.notifications.retention_days),
            ("media.pending_retention_days", self.media.pending_retention_days),
            ("license.expiry_warning_days", self.license.expiry_warning_days),
            ("license.expiration_window_days", self.license.expiration_window_days),
            ("license.deletion_age_days", self.license.deletion_age_days),
            ("orders.pending_nudge_days", self.orders.pending_nudge_days),
            ("orders.expiration_days", self.orders.expiration_days),
            ("subscriptions.reconcile_limit", self.subscriptions.reconcile_limit),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Square client settings, present only when an access token is set.
    pub fn square_config(&self) -> Option<SquareConfig> {
        let token = self
            .square
            .access_token
            .as_ref()
            .filter(|t| !t.trim().is_empty())?;
        Some(SquareConfig {
            base_url: self.square.base_url.clone(),
            access_token: token.clone(),
            location_id: self.square.location_id.clone(),
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Load and validate from the process environment.
    pub fn load(&self) -> Result<CoreConfig, ConfigError> {
        let dotenv = match &self.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| ()),
            None => dotenvy::dotenv().map(|_| ()),
        };
        match dotenv {
            Ok(()) => debug!("loaded .env file"),
            Err(dotenvy::Error::Io(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let mut config = self.load_file(|key| std::env::var(key).ok())?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read the TOML layer. An explicitly named file must exist; the
    /// default location is optional.
    fn load_file<F>(&self, lookup: F) -> Result<CoreConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (path, explicit) = match (&self.config_path, lookup(CONFIG_PATH_ENV)) {
            (Some(path), _) => (path.clone(), true),
            (None, Some(from_env)) => (PathBuf::from(from_env), true),
            (None, None) => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !path.exists() && !explicit {
            return Ok(CoreConfig::default());
        }

        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "loaded config file");
        CoreConfig::from_toml_str(&raw, &path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.cron.interval, Duration::from_secs(86_400));
        assert_eq!(config.cron.lock_ttl, Duration::from_secs(25 * 3_600));
        assert_eq!(config.outbox.retention_days, 30);
        assert_eq!(config.outbox.min_attempts, 5);
        assert_eq!(config.notifications.retention_days, 30);
        assert_eq!(config.media.pending_retention_days, 7);
        assert_eq!(config.license.expiry_warning_days, 14);
        assert_eq!(config.license.expiration_window_days, 30);
        assert_eq!(config.license.deletion_age_days, 30);
        assert_eq!(config.orders.pending_nudge_days, 5);
        assert_eq!(config.orders.expiration_days, 10);
        assert_eq!(config.subscriptions.reconcile_limit, 250);
        assert_eq!(config.subscriptions.reconcile_lookback, Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn toml_overrides_defaults_and_parses_durations() {
        let config = CoreConfig::from_toml_str(
            r#"
            database_url = "postgres://localhost/bazaar"

            [cron]
            interval = "6h"

            [outbox]
            min_attempts = 3

            [subscriptions]
            reconcile_lookback = "2days"
            default_price_id = "plan_basic"
            "#,
            Path::new("bazaar.toml"),
        )
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/bazaar"));
        assert_eq!(config.cron.interval, Duration::from_secs(6 * 3_600));
        assert_eq!(config.cron.lock_ttl, DEFAULT_LOCK_TTL);
        assert_eq!(config.outbox.min_attempts, 3);
        assert_eq!(config.outbox.retention_days, 30);
        assert_eq!(config.subscriptions.reconcile_lookback, Duration::from_secs(2 * 86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn durations_serialize_as_human_strings() {
        let raw = toml::to_string(&CronConfig::default()).unwrap();
        assert!(raw.contains(r#"interval = "1day""#), "{raw}");
        assert!(raw.contains(r#"lock_ttl = "1day 1h""#), "{raw}");

        let back: CronConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back, CronConfig::default());
    }

    #[test]
    fn malformed_duration_is_a_parse_error() {
        let err = CoreConfig::from_toml_str("[cron]\ninterval = \"soon\"", Path::new("x.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut config = CoreConfig::default();
        config.subscriptions.default_price_id = "from_file".to_string();

        config
            .apply_env(env(&[
                ("BAZAAR_DEFAULT_PRICE_ID", "from_env"),
                ("BAZAAR_CRON_INTERVAL", "30m"),
                ("BAZAAR_SQUARE_ACCESS_TOKEN", "sq_token"),
                ("BAZAAR_REDIS_URL", ""),
            ]))
            .unwrap();

        assert_eq!(config.subscriptions.default_price_id, "from_env");
        assert_eq!(config.cron.interval, Duration::from_secs(1_800));
        assert_eq!(config.redis_url, None);
        let square = config.square_config().unwrap();
        assert_eq!(square.access_token, "sq_token");
        assert_eq!(square.base_url, DEFAULT_SQUARE_BASE_URL);
    }

    #[test]
    fn bad_interval_env_is_rejected() {
        let mut config = CoreConfig::default();
        let err = config
            .apply_env(env(&[("BAZAAR_CRON_INTERVAL", "whenever")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key: "BAZAAR_CRON_INTERVAL", .. }));
    }

    #[test]
    fn validate_requires_price_and_positive_values() {
        let mut config = CoreConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.subscriptions.default_price_id = "plan_basic".to_string();
        assert!(config.validate().is_ok());

        config.cron.interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.cron.interval = Duration::from_secs(60);

        config.subscriptions.reconcile_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn no_square_config_without_token() {
        assert!(CoreConfig::default().square_config().is_none());
    }

    #[test]
    fn missing_default_file_yields_defaults_but_explicit_path_must_exist() {
        let loader = ConfigLoader::new();
        let config = loader.load_file(env(&[])).unwrap();
        assert_eq!(config, CoreConfig::default());

        let err = ConfigLoader::new()
            .with_config_path("/nonexistent/bazaar.toml")
            .load_file(env(&[]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
