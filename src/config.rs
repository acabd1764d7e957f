//! Device configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::instance::Stealing;
use crate::{Error, Result};

/// Tunables for a `Device`. Intervals are in seconds.
///
/// Every field has a default, so a JSON document only needs the keys it
/// overrides:
///
/// ```
/// let cfg = mapper::DeviceConfig::from_json(r#"{ "expire_after": 30.0 }"#).unwrap();
/// assert_eq!(cfg.sync_interval, 2.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Period of the liveness re-announce.
    pub sync_interval: f64,
    /// Remote devices silent for longer than this are expired.
    pub expire_after: f64,
    /// Staged maps with missing acknowledgements are re-proposed at this period.
    pub retry_interval: f64,
    /// Upper bound on a signal's instance pool.
    pub max_instances: usize,
    pub default_stealing: Stealing,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sync_interval: 2.0,
            expire_after: 10.0,
            retry_interval: 1.0,
            max_instances: 128,
            default_stealing: Stealing::None,
        }
    }
}

impl DeviceConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: DeviceConfig = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("sync_interval", self.sync_interval),
            ("expire_after", self.expire_after),
            ("retry_interval", self.retry_interval),
        ] {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(Error::Config(format!("{name} must be a positive number of seconds, got {secs}")));
            }
        }
        if self.expire_after <= self.sync_interval {
            return Err(Error::Config(format!(
                "expire_after ({}) must exceed sync_interval ({})",
                self.expire_after, self.sync_interval
            )));
        }
        if self.max_instances == 0 {
            return Err(Error::Config("max_instances must be at least 1".into()));
        }
        Ok(())
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs_f64(self.sync_interval)
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_secs_f64(self.retry_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(DeviceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let cfg = DeviceConfig::from_json(r#"{ "max_instances": 16, "default_stealing": "Oldest" }"#).unwrap();
        assert_eq!(cfg.max_instances, 16);
        assert_eq!(cfg.default_stealing, Stealing::Oldest);
        assert_eq!(cfg.retry_interval, 1.0);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(DeviceConfig::from_json(r#"{ "retry_interval": -1 }"#), Err(Error::Config(_))));
        assert!(matches!(DeviceConfig::from_json(r#"{ "expire_after": 1.0 }"#), Err(Error::Config(_))));
        assert!(matches!(DeviceConfig::from_json("not json"), Err(Error::Codec(_))));
    }
}
