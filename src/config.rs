/// Operator-supplied configuration for the mesh-node core.
///
/// Deserialized from the same KV shape the out-of-scope persistent config
/// store supplies to the firmware; validated before being applied so a bad
/// value never reaches a running detector mid-flight.
use serde::{Deserialize, Serialize};

use crate::channel::RfProfile;
use crate::error::{CoreError, CoreResult};
use crate::wids::{BaselineConfig, BASELINE_CACHE_RAM_MAX, BASELINE_CACHE_RAM_MIN};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub node_id: String,
    pub rf_profile: RfProfileChoice,
    pub baseline_rssi_threshold: i8,
    pub baseline_learn_duration_ms: u64,
    pub baseline_cache_ram_cap: usize,
    pub deauth_window_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum RfProfileChoice {
    Relaxed,
    Balanced,
    Aggressive,
}

impl From<RfProfileChoice> for RfProfile {
    fn from(choice: RfProfileChoice) -> Self {
        match choice {
            RfProfileChoice::Relaxed => RfProfile::Relaxed,
            RfProfileChoice::Balanced => RfProfile::Balanced,
            RfProfileChoice::Aggressive => RfProfile::Aggressive,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            node_id: "AH01".to_string(),
            rf_profile: RfProfileChoice::Balanced,
            baseline_rssi_threshold: crate::wids::BASELINE_RSSI_THRESHOLD_DEFAULT,
            baseline_learn_duration_ms: crate::wids::BASELINE_LEARN_DEFAULT_MS,
            baseline_cache_ram_cap: crate::wids::BASELINE_CACHE_RAM_DEFAULT,
            deauth_window_ms: crate::wids::DEAUTH_WINDOW_MS,
        }
    }
}

impl CoreConfig {
    /// Reject configuration the core cannot run with. State is left
    /// unchanged on rejection, never partially applied.
    pub fn validate(&self) -> CoreResult<()> {
        if self.node_id.is_empty() || self.node_id.len() > 8 {
            return Err(CoreError::ConfigInvalid("node_id must be 1-8 characters"));
        }
        if !self.node_id.starts_with("AH") {
            return Err(CoreError::ConfigInvalid("node_id must start with \"AH\""));
        }
        if self.baseline_rssi_threshold > 0 || self.baseline_rssi_threshold < -100 {
            return Err(CoreError::ConfigInvalid("baseline_rssi_threshold out of range"));
        }
        if self.baseline_learn_duration_ms == 0 {
            return Err(CoreError::ConfigInvalid("baseline_learn_duration_ms must be nonzero"));
        }
        if self.deauth_window_ms == 0 {
            return Err(CoreError::ConfigInvalid("deauth_window_ms must be nonzero"));
        }
        Ok(())
    }

    pub fn baseline_config(&self) -> BaselineConfig {
        BaselineConfig {
            learn_duration_ms: self.baseline_learn_duration_ms,
            rssi_threshold: self.baseline_rssi_threshold,
            cache_ram_cap: self
                .baseline_cache_ram_cap
                .clamp(BASELINE_CACHE_RAM_MIN, BASELINE_CACHE_RAM_MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_node_id_without_ah_prefix() {
        let mut cfg = CoreConfig::default();
        cfg.node_id = "XX01".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_rssi_threshold() {
        let mut cfg = CoreConfig::default();
        cfg.baseline_rssi_threshold = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_deauth_window() {
        let mut cfg = CoreConfig::default();
        cfg.deauth_window_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn baseline_config_clamps_cache_cap() {
        let mut cfg = CoreConfig::default();
        cfg.baseline_cache_ram_cap = 999_999;
        assert_eq!(cfg.baseline_config().cache_ram_cap, BASELINE_CACHE_RAM_MAX);
    }
}
