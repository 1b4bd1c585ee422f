//! Scheduler configuration.
//!
//! Loaded from TOML with serde defaults so a partial file (or none at all)
//! yields a working configuration. All intervals are tuning constants, not
//! correctness requirements.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    /// Idle sleep bound for the software compute scheduler thread when no
    /// command list changed, in milliseconds.
    pub poll_interval_ms: u64,
    /// Internal sub-timeout used when an unbounded wait is driven through
    /// the shared blocking primitive, in milliseconds.
    pub wait_slice_ms: u64,
    /// Best-effort grace period for `stop()` to let outstanding commands
    /// drain before per-device state is dropped, in milliseconds.
    pub shutdown_grace_ms: u64,
    /// Submission slots per execution core in the software scheduler.
    /// Capped at 64 (one occupancy bitmask word).
    pub core_slots: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            wait_slice_ms: 100,
            shutdown_grace_ms: 2000,
            core_slots: 16,
        }
    }
}

impl SchedConfig {
    pub fn from_str(text: &str) -> Result<Self> {
        let cfg: SchedConfig =
            toml::from_str(text).map_err(|e| SchedError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SchedError::Config(e.to_string()))?;
        Self::from_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.core_slots == 0 || self.core_slots > 64 {
            return Err(SchedError::Config(format!(
                "core_slots must be in 1..=64, got {}",
                self.core_slots
            )));
        }
        if self.wait_slice_ms == 0 {
            return Err(SchedError::Config("wait_slice_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = SchedConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.wait_slice(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg = SchedConfig::from_str("poll_interval_ms = 1\n").unwrap();
        assert_eq!(cfg.poll_interval_ms, 1);
        assert_eq!(cfg.core_slots, SchedConfig::default().core_slots);
    }

    #[test]
    fn test_rejects_bad_slot_count() {
        let err = SchedConfig::from_str("core_slots = 0\n").unwrap_err();
        assert!(matches!(err, SchedError::Config(_)));
        let err = SchedConfig::from_str("core_slots = 65\n").unwrap_err();
        assert!(matches!(err, SchedError::Config(_)));
    }
}
