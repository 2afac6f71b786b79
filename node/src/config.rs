//! Node configuration with TOML file support.

use std::path::Path;
use std::time::Duration;

use quorum_consensus::ConsensusConfig;
use quorum_types::{NodeId, Roster};
use serde::{Deserialize, Serialize};

use crate::logging::LogFormat;
use crate::NodeError;

/// Configuration of one quorum node.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's id; must be listed in the roster.
    pub local_id: NodeId,

    /// Lifetime of cached item content.
    #[serde(default = "default_cache_age")]
    pub item_cache_max_age_secs: u64,

    /// Lifetime of finished parcel results.
    #[serde(default = "default_cache_age")]
    pub parcel_cache_max_age_secs: u64,

    /// Lifetime of cached item environments.
    #[serde(default = "default_cache_age")]
    pub env_cache_max_age_secs: u64,

    /// How long a name/origin/address reservation holds.
    #[serde(default = "default_name_cache_age")]
    pub name_cache_max_age_secs: u64,

    /// Period of the shared sweep over caches and expired records.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Tables last: TOML cannot put plain values after them.
    /// Every node taking part in elections, `[[roster]]` tables in TOML.
    #[serde(default)]
    pub roster: Roster,

    /// Election thresholds and timings.
    #[serde(default)]
    pub consensus: ConsensusConfig,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_cache_age() -> u64 {
    600
}

fn default_name_cache_age() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    5_000
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NodeConfig {
    /// A config for node `local` of `roster`, with thresholds derived from
    /// the roster size.
    pub fn for_roster(local: NodeId, roster: Roster) -> Self {
        let consensus = ConsensusConfig::for_roster_size(roster.len());
        Self {
            local_id: local,
            roster,
            consensus,
            item_cache_max_age_secs: default_cache_age(),
            parcel_cache_max_age_secs: default_cache_age(),
            env_cache_max_age_secs: default_cache_age(),
            name_cache_max_age_secs: default_name_cache_age(),
            sweep_interval_ms: default_sweep_interval(),
            log_format: default_log_format(),
            log_level: default_log_level(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        let config: Self = toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, NodeError> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if !self.roster.contains(self.local_id) {
            return Err(NodeError::Config(format!(
                "local node {} is not in the roster",
                self.local_id
            )));
        }
        self.consensus.validate()?;
        let n = self.roster.len();
        if self.consensus.positive_consensus > n || self.consensus.negative_consensus > n {
            return Err(NodeError::Config(format!(
                "thresholds {}/{} cannot be met by a roster of {n}",
                self.consensus.positive_consensus, self.consensus.negative_consensus
            )));
        }
        if self.sweep_interval_ms == 0 {
            return Err(NodeError::Config("sweep_interval_ms must be positive".into()));
        }
        self.log_format()?;
        Ok(())
    }

    pub fn log_format(&self) -> Result<LogFormat, NodeError> {
        self.log_format.parse()
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
