//! Store configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KyroError, ValidationError};
use crate::stream::{TimelineId, ROOT_TIMELINE};

/// Configuration for a [`crate::TimelineStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name of the root timeline.
    pub root_timeline: String,
    /// Bound of the single-writer queue.
    pub queue_capacity: usize,
    /// Graph read/update admission bound.
    pub read_timeout_ms: u64,
    /// Graph population bound.
    pub populate_timeout_ms: u64,
    /// Wait for pending writes before push/pull.
    pub drain_timeout_ms: u64,
    /// Upper bound on a graph pause.
    pub max_pause_ms: u64,
    /// Per-subscriber signal buffer.
    pub signal_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_timeline: ROOT_TIMELINE.to_string(),
            queue_capacity: 1024,
            read_timeout_ms: 5_000,
            populate_timeout_ms: 60_000,
            drain_timeout_ms: 10_000,
            max_pause_ms: 30_000,
            signal_capacity: 1024,
        }
    }
}

impl StoreConfig {
    const MIN_TIMEOUT_MS: u64 = 1;

    /// Parses a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for malformed JSON or invalid values.
    pub fn from_json(json: &str) -> Result<Self, KyroError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()
    }

    /// Checks bounds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the offending field.
    pub fn validate(self) -> Result<Self, KyroError> {
        let invalid =
            |reason: String| -> KyroError { ValidationError::InvalidConfig { reason }.into() };

        TimelineId::new(self.root_timeline.clone())
            .map_err(|e| invalid(format!("root_timeline: {e}")))?;

        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be at least 1".to_string()));
        }
        if self.signal_capacity == 0 {
            return Err(invalid("signal_capacity must be at least 1".to_string()));
        }
        for (name, value) in [
            ("read_timeout_ms", self.read_timeout_ms),
            ("populate_timeout_ms", self.populate_timeout_ms),
            ("drain_timeout_ms", self.drain_timeout_ms),
            ("max_pause_ms", self.max_pause_ms),
        ] {
            if value < Self::MIN_TIMEOUT_MS {
                return Err(invalid(format!(
                    "{name} must be at least {} ms (got {value})",
                    Self::MIN_TIMEOUT_MS
                )));
            }
        }
        Ok(self)
    }

    /// The root timeline id.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the name is invalid.
    pub fn root(&self) -> Result<TimelineId, KyroError> {
        Ok(TimelineId::new(self.root_timeline.clone())?)
    }

    /// Graph admission bound.
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Graph population bound.
    #[must_use]
    pub const fn populate_timeout(&self) -> Duration {
        Duration::from_millis(self.populate_timeout_ms)
    }

    /// Write drain bound.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Pause cap.
    #[must_use]
    pub const fn max_pause(&self) -> Duration {
        Duration::from_millis(self.max_pause_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default().validate().unwrap();
        assert_eq!(config.root_timeline, "master");
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.read_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config =
            StoreConfig::from_json(r#"{ "root_timeline": "main", "max_pause_ms": 50 }"#).unwrap();
        assert_eq!(config.root_timeline, "main");
        assert_eq!(config.max_pause(), Duration::from_millis(50));
        assert_eq!(config.drain_timeout_ms, 10_000);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = StoreConfig {
            queue_capacity: 0,
            ..StoreConfig::default()
        }
        .validate()
        .unwrap_err();
        assert!(format!("{err}").contains("queue_capacity"));

        let err = StoreConfig {
            root_timeline: "a:b".to_string(),
            ..StoreConfig::default()
        }
        .validate()
        .unwrap_err();
        assert!(err.is_validation());

        assert!(StoreConfig::from_json("{ not json").unwrap_err().is_validation());
        assert!(StoreConfig::from_json(r#"{ "read_timeout_ms": 0 }"#).is_err());
    }
}
