//! Configuration types

use crate::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Bounded exponential backoff for transient remote failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = f64::from(self.backoff_multiplier.max(1.0)).powi(attempt as i32);
        let nanos = self.initial_backoff.as_nanos() as f64 * factor;
        Duration::from_nanos(nanos.min(u64::MAX as f64) as u64).min(self.max_backoff)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Largest LMDB map the engine will ask for (1 TiB).
pub const MAX_LMDB_MAP_SIZE_MB: usize = 1 << 20;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Identity used for the same-creator permission rule.
    pub current_user: UserId,
    pub retry: RetryConfig,
    /// How many token-expired restarts a single fetch cycle may perform.
    pub max_token_resets: u32,
    /// Directory holding the LMDB state environment. `None` keeps state in
    /// memory only.
    pub state_dir: Option<PathBuf>,
    pub lmdb_map_size_mb: usize,
    /// Buffer of each cache's event broadcast channel.
    pub event_channel_capacity: usize,
}

impl SyncConfig {
    pub fn new(current_user: UserId) -> Self {
        Self {
            current_user,
            retry: RetryConfig::default(),
            max_token_resets: 3,
            state_dir: None,
            lmdb_map_size_mb: 64,
            event_channel_capacity: 256,
        }
    }

    /// Load from `CIRRUS_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::new(UserId::new(DEFAULT_OWNER_NAME));
        let current_user = lookup("CIRRUS_CURRENT_USER")
            .filter(|s| !s.trim().is_empty())
            .map(UserId::new)
            .unwrap_or(defaults.current_user);

        let max_retries = lookup("CIRRUS_MAX_RETRIES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.retry.max_retries);

        let initial_backoff = lookup("CIRRUS_INITIAL_BACKOFF_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.initial_backoff);

        let max_backoff = lookup("CIRRUS_MAX_BACKOFF_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.max_backoff);

        let backoff_multiplier = lookup("CIRRUS_BACKOFF_MULTIPLIER")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.retry.backoff_multiplier);

        let max_token_resets = lookup("CIRRUS_MAX_TOKEN_RESETS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_token_resets);

        let state_dir = lookup("CIRRUS_STATE_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let lmdb_map_size_mb = lookup("CIRRUS_LMDB_MAP_SIZE_MB")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.lmdb_map_size_mb);

        let event_channel_capacity = lookup("CIRRUS_EVENT_CHANNEL_CAPACITY")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.event_channel_capacity);

        Self {
            current_user,
            retry: RetryConfig {
                max_retries,
                initial_backoff,
                max_backoff,
                backoff_multiplier,
            },
            max_token_resets,
            state_dir,
            lmdb_map_size_mb,
            event_channel_capacity,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_token_resets(mut self, resets: u32) -> Self {
        self.max_token_resets = resets;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_lmdb_map_size_mb(mut self, size_mb: usize) -> Self {
        self.lmdb_map_size_mb = size_mb;
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - current_user is not blank
    /// - max_token_resets >= 1
    /// - initial_backoff <= max_backoff and backoff_multiplier >= 1.0
    /// - lmdb_map_size_mb is in 1..=MAX_LMDB_MAP_SIZE_MB
    /// - event_channel_capacity is positive
    pub fn validate(&self) -> CirrusResult<()> {
        if self.current_user.as_str().trim().is_empty() {
            return Err(CirrusError::Config(ConfigError::MissingRequired {
                field: "current_user".to_string(),
            }));
        }

        if self.max_token_resets == 0 {
            return Err(CirrusError::Config(ConfigError::InvalidValue {
                field: "max_token_resets".to_string(),
                value: self.max_token_resets.to_string(),
                reason: "max_token_resets must be at least 1".to_string(),
            }));
        }

        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(CirrusError::Config(ConfigError::InvalidValue {
                field: "retry.initial_backoff".to_string(),
                value: format!("{:?}", self.retry.initial_backoff),
                reason: "initial_backoff must not exceed max_backoff".to_string(),
            }));
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err(CirrusError::Config(ConfigError::InvalidValue {
                field: "retry.backoff_multiplier".to_string(),
                value: self.retry.backoff_multiplier.to_string(),
                reason: "backoff_multiplier must be at least 1.0".to_string(),
            }));
        }

        if self.lmdb_map_size_mb == 0 || self.lmdb_map_size_mb > MAX_LMDB_MAP_SIZE_MB {
            return Err(CirrusError::Config(ConfigError::InvalidValue {
                field: "lmdb_map_size_mb".to_string(),
                value: self.lmdb_map_size_mb.to_string(),
                reason: format!("lmdb_map_size_mb must be between 1 and {}", MAX_LMDB_MAP_SIZE_MB),
            }));
        }

        if self.event_channel_capacity == 0 {
            return Err(CirrusError::Config(ConfigError::InvalidValue {
                field: "event_channel_capacity".to_string(),
                value: self.event_channel_capacity.to_string(),
                reason: "event_channel_capacity must be positive".to_string(),
            }));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = SyncConfig::new(UserId::new("me"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_reads_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CIRRUS_CURRENT_USER", "alice"),
            ("CIRRUS_MAX_TOKEN_RESETS", "5"),
            ("CIRRUS_INITIAL_BACKOFF_MS", "20"),
            ("CIRRUS_STATE_DIR", "/tmp/cirrus"),
            ("CIRRUS_EVENT_CHANNEL_CAPACITY", "not-a-number"),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.current_user, UserId::new("alice"));
        assert_eq!(config.max_token_resets, 5);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(20));
        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/cirrus")));
        // Unparseable values fall back to the default.
        assert_eq!(config.event_channel_capacity, 256);
    }

    #[test]
    fn test_zero_token_resets_rejected() {
        let config = SyncConfig::new(UserId::new("me")).with_max_token_resets(0);
        let err = config.validate().expect_err("zero resets must be rejected");
        assert!(matches!(
            err,
            CirrusError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "max_token_resets"
        ));
    }

    #[test]
    fn test_blank_user_rejected() {
        let config = SyncConfig::new(UserId::new("  "));
        assert!(matches!(
            config.validate(),
            Err(CirrusError::Config(ConfigError::MissingRequired { .. }))
        ));
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.backoff_for(0), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(1), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(5), Duration::from_millis(250));
    }

    #[test]
    fn test_oversized_lmdb_map_rejected() {
        let huge = (usize::MAX / 1024).to_string();
        let config = SyncConfig::from_lookup(|key| match key {
            "CIRRUS_CURRENT_USER" => Some("me".to_string()),
            "CIRRUS_LMDB_MAP_SIZE_MB" => Some(huge.clone()),
            _ => None,
        });
        let err = config.validate().expect_err("oversized map must be rejected");
        assert!(matches!(
            err,
            CirrusError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "lmdb_map_size_mb"
        ));
        assert!(SyncConfig::new(UserId::new("me"))
            .with_lmdb_map_size_mb(MAX_LMDB_MAP_SIZE_MB)
            .validate()
            .is_ok());
    }
}
