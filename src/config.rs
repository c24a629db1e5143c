//! # Configuration Management
//!
//! Connection parameters: socket timeouts, session-key aging, queue
//! capacities, and the asymmetric key size.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//!
//! Debug builds default to a short key age and long socket timeouts so the
//! rekey machinery is exercised constantly under a debugger; release builds
//! use production values.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};

/// Maximum sequential decode failures before the connection is torn down.
pub const MAX_READ_ERRORS: u32 = 5;

/// Capacity of each delivery queue (manual-read FIFO and pending events).
pub const DELIVERY_QUEUE_CAPACITY: usize = 20;

fn default_read_timeout() -> Duration {
    if cfg!(debug_assertions) {
        Duration::from_secs(10)
    } else {
        Duration::from_millis(500)
    }
}

fn default_max_key_age() -> Duration {
    if cfg!(debug_assertions) {
        Duration::from_secs(5)
    } else {
        Duration::from_secs(3600)
    }
}

// Must stay under the debug max_key_age so the default config validates in
// both profiles.
fn default_max_age_skew() -> Duration {
    if cfg!(debug_assertions) {
        Duration::from_secs(1)
    } else {
        Duration::from_secs(60)
    }
}

/// Tunable parameters of one connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Bound for each blocking socket read.
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,

    /// Bound for each blocking socket write.
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// Overall bound for one handshake protocol run.
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Session-key age at which a renegotiation is requested.
    #[serde(with = "duration_serde")]
    pub max_key_age: Duration,

    /// Grace period for the peer to complete a requested renegotiation.
    #[serde(with = "duration_serde")]
    pub max_age_skew: Duration,

    /// Delivery queue capacity (manual-read FIFO and pending events).
    pub queue_capacity: usize,

    /// Modulus size for the ephemeral handshake keypairs.
    pub rsa_bits: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            write_timeout: default_read_timeout(),
            handshake_timeout: Duration::from_secs(30),
            max_key_age: default_max_key_age(),
            max_age_skew: default_max_age_skew(),
            queue_capacity: DELIVERY_QUEUE_CAPACITY,
            rsa_bits: crate::crypto::asymmetric::DEFAULT_KEY_BITS,
        }
    }
}

impl ConnectionConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ChannelError::Config(format!("Failed to open config file: {e}")))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ChannelError::Config(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ChannelError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Apply overrides to the default configuration.
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Validate the configuration for common misconfigurations.
    ///
    /// Returns a list of findings. Empty list means the configuration is
    /// sound.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.read_timeout.as_millis() < 10 {
            errors.push("Read timeout too short (minimum: 10ms)".to_string());
        }
        if self.write_timeout.as_millis() < 10 {
            errors.push("Write timeout too short (minimum: 10ms)".to_string());
        }
        if self.handshake_timeout < self.read_timeout {
            errors.push("Handshake timeout must not be shorter than the read timeout".to_string());
        }
        if self.max_key_age < Duration::from_millis(100) {
            errors.push("Max key age too short (minimum: 100ms)".to_string());
        }
        if self.max_age_skew >= self.max_key_age {
            errors.push("Max age skew must be smaller than max key age".to_string());
        }
        if self.queue_capacity == 0 {
            errors.push("Queue capacity must be greater than 0".to_string());
        }
        if self.rsa_bits < 2048 {
            errors.push(format!(
                "RSA modulus of {} bits is below the recommended 2048",
                self.rsa_bits
            ));
        }

        errors
    }

    /// Validate and return Result - convenience method.
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ChannelError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
