use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::error::{Result, VaultError};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_MAX_STORAGE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_SEGMENT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SYNC_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_LEDGER_SYNC_PERIOD: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_FILES_SYNC_PERIOD: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_CLEANUP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_IO_THROTTLE: usize = 10;
pub const DEFAULT_LEDGER_SYNC_ATTEMPTS: usize = 10;

/// Vault-wide tunables
///
/// Carried by the ledger `Config` change, so every instance of a vault runs
/// with the settings its admin chose. Zero values mean "use the default".
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long files are kept before the retention sweep removes them
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retention: Duration,
    /// Max bytes stored by the vault, 0 for unlimited
    pub max_storage: u64,
    /// Width of a time bucket; anything up to a minute falls back to the default
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub segment_interval: Duration,
    /// Min time between two automatic file syncs
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub sync_cooldown: Duration,
    /// Upper bound of `wait_files`
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub wait_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ledger_sync_period: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub files_sync_period: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cleanup_period: Duration,
    /// Max concurrent transfers against the store
    pub io_throttle: usize,
    /// Import/export rounds before giving up on a contended ledger
    pub ledger_sync_attempts: usize,
    /// Optional change notifier, `ws://` or `wss://`
    pub sync_relay: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            max_storage: DEFAULT_MAX_STORAGE,
            segment_interval: DEFAULT_SEGMENT_INTERVAL,
            sync_cooldown: DEFAULT_SYNC_COOLDOWN,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            ledger_sync_period: DEFAULT_LEDGER_SYNC_PERIOD,
            files_sync_period: DEFAULT_FILES_SYNC_PERIOD,
            cleanup_period: DEFAULT_CLEANUP_PERIOD,
            io_throttle: DEFAULT_IO_THROTTLE,
            ledger_sync_attempts: DEFAULT_LEDGER_SYNC_ATTEMPTS,
            sync_relay: None,
        }
    }
}

impl Config {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| VaultError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config.normalized())
    }

    /// Replace zero and out of range values with defaults.
    pub fn normalized(mut self) -> Self {
        fn or_default(value: Duration, default: Duration) -> Duration {
            if value.is_zero() {
                default
            } else {
                value
            }
        }

        self.retention = or_default(self.retention, DEFAULT_RETENTION);
        if self.segment_interval <= Duration::from_secs(60) {
            self.segment_interval = DEFAULT_SEGMENT_INTERVAL;
        }
        self.sync_cooldown = or_default(self.sync_cooldown, DEFAULT_SYNC_COOLDOWN);
        self.wait_timeout = or_default(self.wait_timeout, DEFAULT_WAIT_TIMEOUT);
        self.ledger_sync_period = or_default(self.ledger_sync_period, DEFAULT_LEDGER_SYNC_PERIOD);
        self.files_sync_period = or_default(self.files_sync_period, DEFAULT_FILES_SYNC_PERIOD);
        self.cleanup_period = or_default(self.cleanup_period, DEFAULT_CLEANUP_PERIOD);
        if self.io_throttle == 0 {
            self.io_throttle = DEFAULT_IO_THROTTLE;
        }
        if self.ledger_sync_attempts == 0 {
            self.ledger_sync_attempts = DEFAULT_LEDGER_SYNC_ATTEMPTS;
        }
        self
    }

    /// Reject settings no instance could run with.
    pub fn validate(&self) -> Result<()> {
        if let Some(relay) = &self.sync_relay {
            let url = url::Url::parse(relay)
                .map_err(|e| VaultError::Config(format!("invalid sync relay {}: {}", relay, e)))?;
            if url.scheme() != "ws" && url.scheme() != "wss" {
                return Err(VaultError::Config(format!(
                    "sync relay must be ws:// or wss://, got {}",
                    relay
                )));
            }
        }
        Ok(())
    }

    /// Period of the housekeeping ticker: the shortest of all cadences
    pub fn housekeeping_period(&self) -> Duration {
        self.ledger_sync_period
            .min(self.files_sync_period)
            .min(self.cleanup_period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.housekeeping_period(), DEFAULT_FILES_SYNC_PERIOD);
    }

    #[test]
    fn test_toml_overrides_and_normalization() {
        let config = Config::from_toml_str(
            r#"
            max_storage = 1024
            segment_interval = 1000
            io_throttle = 0
            files_sync_period = 30000
            sync_relay = "wss://relay.example.com/sync"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_storage, 1024);
        assert_eq!(config.segment_interval, DEFAULT_SEGMENT_INTERVAL);
        assert_eq!(config.io_throttle, DEFAULT_IO_THROTTLE);
        assert_eq!(config.housekeeping_period(), Duration::from_secs(30));
    }

    #[test]
    fn test_relay_scheme_is_checked() {
        let err = Config::from_toml_str(r#"sync_relay = "http://relay""#).unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }

    #[test]
    fn test_bincode_roundtrip() {
        let config = Config {
            max_storage: 42,
            sync_relay: Some("ws://localhost:8080".into()),
            ..Default::default()
        };
        let bytes = bincode::serialize(&config).unwrap();
        let decoded: Config = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, config);
    }
}
