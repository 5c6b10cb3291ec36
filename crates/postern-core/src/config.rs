//! Core configuration

use crate::error::{CoreError, Result};
use crate::retry::RetryConfig;
use std::time::Duration;

/// Fixed overhead budget for the JSON wrapping of a `part` envelope
const PART_ENVELOPE_OVERHEAD: usize = 1024;

/// Core configuration
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Session lifetime configuration
    pub session: SessionConfig,

    /// Outbound retry policy
    pub retry: RetryConfig,

    /// Message and batch size limits
    pub limits: LimitsConfig,

    /// Per-peer lock timeouts
    pub locks: LockConfig,

    /// Inbound middleware capacities
    pub inbound: InboundConfig,

    /// Transport call limits
    pub transport: TransportConfig,
}

impl CoreConfig {
    /// Check every sub-configuration for consistency
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if self.session.ttl.is_zero() {
            return Err(invalid("session.ttl must be non-zero"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(invalid("retry.initial_backoff exceeds retry.max_backoff"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be at least 1.0"));
        }

        let limits = &self.limits;
        if limits.max_message_size == 0 || limits.part_size == 0 {
            return Err(invalid("limits must be non-zero"));
        }
        if limits.max_batch_size < limits.max_message_size {
            return Err(invalid("limits.max_batch_size is smaller than max_message_size"));
        }
        if limits.encoded_part_size() > limits.max_message_size {
            return Err(invalid(
                "limits.part_size does not fit max_message_size once encoded",
            ));
        }

        if self.locks.acquire_timeout.is_zero() || self.locks.occupation_timeout.is_zero() {
            return Err(invalid("lock timeouts must be non-zero"));
        }

        let inbound = &self.inbound;
        if inbound.dedup_capacity == 0
            || inbound.dead_letter_keys == 0
            || inbound.dead_letter_per_key == 0
            || inbound.reassembly_groups == 0
            || inbound.processed_resets == 0
        {
            return Err(invalid("inbound capacities must be non-zero"));
        }

        if self.transport.send_timeout.is_zero() {
            return Err(invalid("transport.send_timeout must be non-zero"));
        }

        Ok(())
    }
}

fn invalid(reason: &'static str) -> CoreError {
    CoreError::InvalidConfig(reason.into())
}

/// Session lifetime configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sessions older than this are evicted on lookup
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 60 * 60), // 7 days
        }
    }
}

/// Message and batch size limits
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Serialized envelopes larger than this are split
    pub max_message_size: usize,

    /// Cap on the cumulative size of envelopes sent in one ciphertext
    pub max_batch_size: usize,

    /// Raw bytes of the original carried by each part
    pub part_size: usize,
}

impl LimitsConfig {
    /// Worst-case serialized size of one part envelope
    #[must_use]
    pub fn encoded_part_size(&self) -> usize {
        self.part_size.div_ceil(3) * 4 + PART_ENVELOPE_OVERHEAD
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024,  // 64 KiB
            max_batch_size: 256 * 1024,   // 4 messages
            part_size: 32 * 1024,         // 32 KiB before base64
        }
    }
}

/// Per-peer lock timeouts
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Longest wait to acquire a lock
    pub acquire_timeout: Duration,

    /// Longest a holder may keep a lock before it is released
    pub occupation_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            occupation_timeout: Duration::from_secs(60),
        }
    }
}

/// Inbound middleware capacities
#[derive(Debug, Clone)]
pub struct InboundConfig {
    /// Envelope ids remembered for deduplication
    pub dedup_capacity: usize,

    /// Distinct keys held by each dead-letter queue
    pub dead_letter_keys: usize,

    /// Entries held per dead-letter key
    pub dead_letter_per_key: usize,

    /// Part groups buffered for reassembly
    pub reassembly_groups: usize,

    /// Session reset ids remembered for idempotence
    pub processed_resets: usize,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 10_000,
            dead_letter_keys: 1024,
            dead_letter_per_key: 256,
            reassembly_groups: 256,
            processed_resets: 1024,
        }
    }
}

/// Transport call limits
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Deadline for a single `send_data` call
    pub send_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        CoreConfig::default().validate().unwrap();
    }

    #[test]
    fn test_part_must_fit_message() {
        let mut config = CoreConfig::default();
        config.limits.part_size = config.limits.max_message_size;
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_batch_smaller_than_message_rejected() {
        let mut config = CoreConfig::default();
        config.limits.max_batch_size = config.limits.max_message_size - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_rules() {
        let mut config = CoreConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.retry.initial_backoff = Duration::from_secs(120);
        config.retry.max_backoff = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_capacities_rejected() {
        let mut config = CoreConfig::default();
        config.inbound.dedup_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.session.ttl = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_encoded_part_size() {
        let limits = LimitsConfig {
            max_message_size: 4096,
            max_batch_size: 8192,
            part_size: 300,
        };
        assert_eq!(limits.encoded_part_size(), 400 + 1024);
    }
}
