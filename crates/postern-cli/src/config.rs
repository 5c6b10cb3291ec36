//! Configuration file for the Postern CLI.

use postern_core::config::{
    InboundConfig, LimitsConfig, LockConfig, SessionConfig, TransportConfig,
};
use postern_core::{CoreConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Postern configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Session configuration
    pub session: SessionSection,
    /// Retry configuration
    pub retry: RetrySection,
    /// Size limits
    pub limits: LimitsSection,
    /// Lock timeouts
    pub locks: LocksSection,
    /// Inbound capacities
    pub inbound: InboundSection,
    /// Transport configuration
    pub transport: TransportSection,
    /// Logging configuration
    pub logging: LoggingSection,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Session lifetime in seconds
    pub ttl_secs: u64,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Failed flushes before giving up
    pub max_attempts: u32,
    /// First retry delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Retry delay cap in milliseconds
    pub max_backoff_ms: u64,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Randomize delays
    pub jitter: bool,
}

/// Size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    /// Largest serialized envelope sent unsplit
    pub max_message_size: usize,
    /// Largest batch per ciphertext
    pub max_batch_size: usize,
    /// Raw bytes per part
    pub part_size: usize,
}

/// Lock timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksSection {
    /// Lock acquisition timeout in milliseconds
    pub acquire_timeout_ms: u64,
    /// Maximum lock occupation in milliseconds
    pub occupation_timeout_ms: u64,
}

/// Inbound capacities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundSection {
    /// Remembered envelope ids
    pub dedup_capacity: usize,
    /// Unknown senders held at once
    pub dead_letter_keys: usize,
    /// Batches held per unknown sender
    pub dead_letter_per_key: usize,
    /// Part groups buffered at once
    pub reassembly_groups: usize,
    /// Remembered session reset ids
    pub processed_resets: usize,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// Relay send timeout in milliseconds
    pub send_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level
    pub level: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_secs: SessionConfig::default().ttl.as_secs(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            max_attempts: retry.max_attempts,
            initial_backoff_ms: millis(retry.initial_backoff),
            max_backoff_ms: millis(retry.max_backoff),
            multiplier: retry.multiplier,
            jitter: retry.jitter,
        }
    }
}

impl Default for LimitsSection {
    fn default() -> Self {
        let limits = LimitsConfig::default();
        Self {
            max_message_size: limits.max_message_size,
            max_batch_size: limits.max_batch_size,
            part_size: limits.part_size,
        }
    }
}

impl Default for LocksSection {
    fn default() -> Self {
        let locks = LockConfig::default();
        Self {
            acquire_timeout_ms: millis(locks.acquire_timeout),
            occupation_timeout_ms: millis(locks.occupation_timeout),
        }
    }
}

impl Default for InboundSection {
    fn default() -> Self {
        let inbound = InboundConfig::default();
        Self {
            dedup_capacity: inbound.dedup_capacity,
            dead_letter_keys: inbound.dead_letter_keys,
            dead_letter_per_key: inbound.dead_letter_per_key,
            reassembly_groups: inbound.reassembly_groups,
            processed_resets: inbound.processed_resets,
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            send_timeout_ms: millis(TransportConfig::default().send_timeout),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("postern/config.toml")
    }

    /// Load `path`, falling back to defaults when it does not exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Render as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Convert into the core configuration
    #[must_use]
    pub fn to_core_config(&self) -> CoreConfig {
        CoreConfig {
            session: SessionConfig {
                ttl: Duration::from_secs(self.session.ttl_secs),
            },
            retry: RetryConfig {
                max_attempts: self.retry.max_attempts,
                initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
                multiplier: self.retry.multiplier,
                jitter: self.retry.jitter,
            },
            limits: LimitsConfig {
                max_message_size: self.limits.max_message_size,
                max_batch_size: self.limits.max_batch_size,
                part_size: self.limits.part_size,
            },
            locks: LockConfig {
                acquire_timeout: Duration::from_millis(self.locks.acquire_timeout_ms),
                occupation_timeout: Duration::from_millis(self.locks.occupation_timeout_ms),
            },
            inbound: InboundConfig {
                dedup_capacity: self.inbound.dedup_capacity,
                dead_letter_keys: self.inbound.dead_letter_keys,
                dead_letter_per_key: self.inbound.dead_letter_per_key,
                reassembly_groups: self.inbound.reassembly_groups,
                processed_resets: self.inbound.processed_resets,
            },
            transport: TransportConfig {
                send_timeout: Duration::from_millis(self.transport.send_timeout_ms),
            },
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if !self.retry.multiplier.is_finite() {
            anyhow::bail!("retry.multiplier must be finite");
        }

        self.to_core_config().validate()?;
        Ok(())
    }
}
