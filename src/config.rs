//! Key manager configuration.
//!
//! Exactly two options are recognised: how often the active KEK should be
//! rotated and how long a KEK may issue new wraps. Durations are written as
//! whole seconds:
//!
//! ```json
//! { "rotation_interval": 2592000, "key_ttl": 7776000 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EnvelopeError, Result};

const DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    /// Age after which the active KEK is due for rotation.
    #[serde(with = "duration_secs")]
    pub rotation_interval: Duration,
    /// Age after which a KEK may no longer wrap new DEKs.
    #[serde(with = "duration_secs")]
    pub key_ttl: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            rotation_interval: Duration::from_secs(30 * DAY),
            key_ttl: Duration::from_secs(90 * DAY),
        }
    }
}

impl ManagerConfig {
    pub fn new(rotation_interval: Duration, key_ttl: Duration) -> Self {
        Self {
            rotation_interval,
            key_ttl,
        }
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EnvelopeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EnvelopeError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Reject zero durations and durations too large for timestamp
    /// arithmetic.
    pub fn validate(&self) -> Result<()> {
        self.ttl()?;
        self.rotation()?;
        Ok(())
    }

    pub(crate) fn ttl(&self) -> Result<chrono::Duration> {
        to_chrono("key_ttl", self.key_ttl)
    }

    pub(crate) fn rotation(&self) -> Result<chrono::Duration> {
        to_chrono("rotation_interval", self.rotation_interval)
    }
}

fn to_chrono(name: &str, value: Duration) -> Result<chrono::Duration> {
    if value.is_zero() {
        return Err(EnvelopeError::InvalidConfig(format!("{name} must be non-zero")));
    }
    chrono::Duration::from_std(value)
        .map_err(|_| EnvelopeError::InvalidConfig(format!("{name} is out of range")))
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
