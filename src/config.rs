//! Tunable parameters for one endpoint.
//!
//! [`TransportConfig`] holds the retry/backoff policy shared by `connect`,
//! stop-and-wait send and stop-and-wait receive.  [`ImpairmentConfig`] holds
//! the fault-injection probabilities consulted by
//! [`crate::simulator::Simulator`].  Both are plain data; the demo binary
//! fills them from CLI flags.

use std::time::Duration;

use thiserror::Error;

/// Retry and timeout policy.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Per-attempt receive timeout before any back-off.
    pub base_timeout: Duration,
    /// Ceiling on the back-off, as a multiple of `base_timeout`.
    pub max_backoff_factor: u32,
    /// Attempts allowed for `connect`, stop-and-wait send and receive.
    pub max_retries: u32,
    /// Initial sequence numbers are drawn uniformly from `0..=isn_max`.
    pub isn_max: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_secs(2),
            max_backoff_factor: 8,
            max_retries: 5,
            isn_max: 1000,
        }
    }
}

impl TransportConfig {
    /// Same defaults with a different base timeout.
    pub fn with_base_timeout(base_timeout: Duration) -> Self {
        Self {
            base_timeout,
            ..Self::default()
        }
    }

    /// Largest timeout the back-off may reach.
    pub fn max_timeout(&self) -> Duration {
        self.base_timeout * self.max_backoff_factor
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_timeout.is_zero() {
            return Err(ConfigError::Invalid("base_timeout must be non-zero".into()));
        }
        if self.max_backoff_factor == 0 {
            return Err(ConfigError::Invalid("max_backoff_factor must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        Ok(())
    }
}

/// Fault-injection probabilities, each in `[0.0, 1.0]`.
///
/// Both are evaluated independently for every outgoing and every incoming
/// datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImpairmentConfig {
    /// Probability that a datagram is silently dropped.
    pub loss_probability: f64,
    /// Probability that a datagram's trailing byte is flipped.
    pub corruption_probability: f64,
}

impl ImpairmentConfig {
    pub fn new(loss_probability: f64, corruption_probability: f64) -> Self {
        Self {
            loss_probability,
            corruption_probability,
        }
    }

    /// `true` when neither fault can ever fire.
    pub fn is_transparent(&self) -> bool {
        self.loss_probability <= 0.0 && self.corruption_probability <= 0.0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, p) in [
            ("loss_probability", self.loss_probability),
            ("corruption_probability", self.corruption_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::Invalid(format!("{name} must lie in [0, 1], got {p}")));
            }
        }
        Ok(())
    }
}

/// Configuration problems, surfaced as CONFIG_ERROR.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An active operation needs a peer address and none was configured.
    #[error("remote address not set")]
    NoRemote,
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
