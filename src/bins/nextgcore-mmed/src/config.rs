//! MME Configuration
//!
//! YAML configuration (`mme:` and `logger:` sections). Every key has a
//! default, so an empty or partial file yields a usable configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{EpsTai, PlmnId, OGS_MAX_NUM_OF_PACKET_FILTER, OGS_MAX_NUM_OF_SESS, OGS_MAX_NUM_OF_TAI};
use crate::s1ap_build::TimeToWait;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Default maximum number of eNBs
pub const DEFAULT_MAX_ENB: usize = 64;
/// Default maximum number of UEs (session pool arena size)
pub const DEFAULT_MAX_UE: usize = 1024;
/// Default S1 holding timer (release complete wait)
pub const DEFAULT_S1_HOLDING_MS: u64 = 30_000;
/// Default handover completion timer
pub const DEFAULT_S1_RELOC_OVERALL_MS: u64 = 10_000;

/// PLMN as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlmnIdConf {
    pub mcc: String,
    pub mnc: String,
}

impl PlmnIdConf {
    pub fn to_plmn_id(&self) -> PlmnId {
        PlmnId::new(&self.mcc, &self.mnc)
    }
}

/// One served TAI list entry: a PLMN and its TACs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServedTaiConf {
    pub plmn_id: PlmnIdConf,
    #[serde(default)]
    pub tac: Vec<u16>,
}

/// Timer values in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimerConf {
    /// Release complete wait
    pub s1_holding: u64,
    /// Handover completion wait on the target side
    pub s1_reloc_overall: u64,
}

impl Default for TimerConf {
    fn default() -> Self {
        Self {
            s1_holding: DEFAULT_S1_HOLDING_MS,
            s1_reloc_overall: DEFAULT_S1_RELOC_OVERALL_MS,
        }
    }
}

/// `mme:` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MmeConfig {
    /// MME name sent in S1 setup response
    pub mme_name: Option<String>,
    /// Relative MME capacity
    pub relative_capacity: u8,
    /// Ceiling of Ready eNB associations
    pub max_enb: usize,
    /// Time to wait (seconds) suggested on S1 setup failure
    pub time_to_wait: u8,
    /// Session pool arena capacity
    pub max_ue: usize,
    /// PDN connections per subscriber
    pub max_pdn_per_ue: usize,
    /// Packet filters per TFT
    pub max_packet_filters: usize,
    /// Served TAI lists; empty accepts every eNB
    pub served_tai: Vec<ServedTaiConf>,
    /// Timers
    pub timer: TimerConf,
    /// Depth of the MME task queue
    pub event_queue_size: usize,
}

impl Default for MmeConfig {
    fn default() -> Self {
        Self {
            mme_name: None,
            relative_capacity: 255,
            max_enb: DEFAULT_MAX_ENB,
            time_to_wait: 20,
            max_ue: DEFAULT_MAX_UE,
            max_pdn_per_ue: OGS_MAX_NUM_OF_SESS,
            max_packet_filters: OGS_MAX_NUM_OF_PACKET_FILTER,
            served_tai: Vec::new(),
            timer: TimerConf::default(),
            event_queue_size: 1024,
        }
    }
}

impl MmeConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_enb == 0 {
            return Err(ConfigError::Validation("max_enb must be at least 1".into()));
        }
        if self.max_ue == 0 {
            return Err(ConfigError::Validation("max_ue must be at least 1".into()));
        }
        if self.max_pdn_per_ue == 0 {
            return Err(ConfigError::Validation("max_pdn_per_ue must be at least 1".into()));
        }
        if self.max_packet_filters == 0 || self.max_packet_filters > OGS_MAX_NUM_OF_PACKET_FILTER {
            return Err(ConfigError::Validation(format!(
                "max_packet_filters must be within 1..={}",
                OGS_MAX_NUM_OF_PACKET_FILTER
            )));
        }
        if self.served_tai.len() > OGS_MAX_NUM_OF_TAI {
            return Err(ConfigError::Validation(format!(
                "too many served TAI lists ({} > {})",
                self.served_tai.len(),
                OGS_MAX_NUM_OF_TAI
            )));
        }
        if self.event_queue_size == 0 {
            return Err(ConfigError::Validation("event_queue_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Time to wait as the S1AP enumeration (rounded up)
    pub fn time_to_wait(&self) -> TimeToWait {
        TimeToWait::from_secs(self.time_to_wait)
    }

    pub fn s1_holding(&self) -> Duration {
        Duration::from_millis(self.timer.s1_holding)
    }

    pub fn s1_reloc_overall(&self) -> Duration {
        Duration::from_millis(self.timer.s1_reloc_overall)
    }

    /// All configured served TAIs, flattened
    pub fn served_tais(&self) -> Vec<EpsTai> {
        self.served_tai
            .iter()
            .flat_map(|entry| {
                let plmn_id = entry.plmn_id.to_plmn_id();
                entry.tac.iter().map(move |tac| EpsTai::new(plmn_id, *tac))
            })
            .collect()
    }

    /// Whether `tai` is served. An empty served list serves everything.
    pub fn is_served_tai(&self, tai: &EpsTai) -> bool {
        self.served_tai.is_empty() || self.served_tais().contains(tai)
    }
}

/// `logger:` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConfigFile {
    pub mme: MmeConfig,
    pub logger: LoggerConfig,
}

impl ConfigFile {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: ConfigFile = serde_yaml::from_str(yaml)?;
        config.mme.validate()?;
        Ok(config)
    }

    /// Read a YAML file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_yaml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Config file '{}' not found. Using defaults.", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MmeConfig::default();
        assert_eq!(config.max_enb, 64);
        assert_eq!(config.time_to_wait(), TimeToWait::V20s);
        assert_eq!(config.s1_holding(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
mme:
  max_enb: 2
  time_to_wait: 10
  served_tai:
    - plmn_id:
        mcc: "001"
        mnc: "01"
      tac: [1, 2]
  timer:
    s1_holding: 500
logger:
  level: debug
"#;
        let config = ConfigFile::from_yaml_str(yaml).unwrap();
        assert_eq!(config.mme.max_enb, 2);
        assert_eq!(config.mme.time_to_wait(), TimeToWait::V10s);
        assert_eq!(config.mme.timer.s1_holding, 500);
        assert_eq!(config.mme.timer.s1_reloc_overall, DEFAULT_S1_RELOC_OVERALL_MS);
        assert_eq!(config.logger.level, "debug");

        let tai = EpsTai::new(PlmnId::new("001", "01"), 2);
        assert!(config.mme.is_served_tai(&tai));
        assert!(!config.mme.is_served_tai(&EpsTai::new(PlmnId::new("001", "01"), 3)));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ConfigFile::from_yaml_str("{}").unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_validation_rejects_zero_ceiling() {
        let err = ConfigFile::from_yaml_str("mme:\n  max_enb: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_validation_rejects_too_many_filters() {
        let err = ConfigFile::from_yaml_str("mme:\n  max_packet_filters: 17\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ConfigFile::load("/nonexistent/nextgcore/mme.yaml").unwrap();
        assert_eq!(config.mme.max_ue, DEFAULT_MAX_UE);
    }
}
