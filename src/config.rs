//! Engine configuration
//!
//! Handles loading and saving configuration shared by every wallet the
//! engine manages: server list, gap limit, dust threshold, batching and
//! validation tolerances.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Network type for Bitcoin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Regtest,
    Signet,
    Testnet,
    Mainnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Regtest => "regtest",
            Network::Signet => "signet",
            Network::Testnet => "testnet",
            Network::Mainnet => "mainnet",
        }
    }

    pub fn to_bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Regtest => bitcoin::Network::Regtest,
            Network::Signet => bitcoin::Network::Signet,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Mainnet => bitcoin::Network::Bitcoin,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "regtest" => Ok(Network::Regtest),
            "signet" => Ok(Network::Signet),
            "testnet" => Ok(Network::Testnet),
            "mainnet" | "bitcoin" => Ok(Network::Mainnet),
            _ => Err(anyhow::anyhow!("Invalid network: {}", s)),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bitcoin network to use
    pub network: Network,

    /// Electrum servers, in preference order. Format: "host:port" or a URL
    /// accepted by electrum-client (e.g. "ssl://host:port").
    pub servers: Vec<String>,

    /// Directory where the engine's sqlite store lives
    pub data_dir: PathBuf,

    /// Consecutive unused derived addresses required before discovery stops
    /// extending the frontier
    #[serde(default = "default_gap_limit")]
    pub gap_limit: u32,

    /// Hard cap on discovery rounds per (script type, chain) combination
    #[serde(default = "default_discovery_rounds")]
    pub max_discovery_rounds: u32,

    /// Minimum output value considered economical, in satoshis
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold_sat: u64,

    /// Reject a selection whose dust-folded fee exceeds this multiple of the
    /// estimate. A guard against selection bugs, not a principled bound.
    #[serde(default = "default_dust_fold_fee_cap")]
    pub dust_fold_fee_cap: f64,

    /// Maximum scripthashes per remote batch request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Blocks of tip-height regression tolerated as an ordinary reorg
    #[serde(default = "default_reorg_tolerance")]
    pub reorg_tolerance_blocks: u32,

    /// Fraction of failed transaction-detail decodes above which a sync is
    /// rejected as likely protocol corruption
    #[serde(default = "default_max_parse_failure_ratio")]
    pub max_parse_failure_ratio: f64,

    /// Seconds after a successful sync before the wallet counts as stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Days to keep user metadata on a spent UTXO before pruning
    #[serde(default = "default_metadata_grace_days")]
    pub spent_metadata_grace_days: u32,

    /// Inputs signed between cooperative yields in chunked signing
    #[serde(default = "default_signing_chunk_size")]
    pub signing_chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: Network::Signet,
            servers: Vec::new(),
            data_dir: default_data_dir(),
            gap_limit: default_gap_limit(),
            max_discovery_rounds: default_discovery_rounds(),
            dust_threshold_sat: default_dust_threshold(),
            dust_fold_fee_cap: default_dust_fold_fee_cap(),
            batch_size: default_batch_size(),
            reorg_tolerance_blocks: default_reorg_tolerance(),
            max_parse_failure_ratio: default_max_parse_failure_ratio(),
            stale_after_secs: default_stale_after_secs(),
            spent_metadata_grace_days: default_metadata_grace_days(),
            signing_chunk_size: default_signing_chunk_size(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file, or create default if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = config_file_path()?;

        if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

            let config: EngineConfig = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

            tracing::info!("Loaded config from: {}", config_path.display());
            Ok(config)
        } else {
            tracing::info!("No config file found, creating default at: {}", config_path.display());
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_file_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        tracing::info!("Saved config to: {}", config_path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for server in &self.servers {
            if !server.contains(':') {
                return Err(anyhow::anyhow!(
                    "Server must be in format 'host:port', got: {}",
                    server
                ));
            }
        }

        if self.gap_limit == 0 {
            return Err(anyhow::anyhow!("gap_limit must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("batch_size must be at least 1"));
        }
        if self.dust_fold_fee_cap < 1.0 {
            return Err(anyhow::anyhow!(
                "dust_fold_fee_cap below 1.0 would reject every dust fold"
            ));
        }
        if !(0.0..=1.0).contains(&self.max_parse_failure_ratio) {
            return Err(anyhow::anyhow!("max_parse_failure_ratio must be within 0..=1"));
        }

        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Cannot create data directory: {}", self.data_dir.display()))?;
        }

        Ok(())
    }
}

fn default_gap_limit() -> u32 {
    20
}

fn default_discovery_rounds() -> u32 {
    10
}

fn default_dust_threshold() -> u64 {
    546
}

fn default_dust_fold_fee_cap() -> f64 {
    5.0
}

fn default_batch_size() -> usize {
    25
}

fn default_reorg_tolerance() -> u32 {
    6
}

fn default_max_parse_failure_ratio() -> f64 {
    0.10
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_metadata_grace_days() -> u32 {
    90
}

fn default_signing_chunk_size() -> usize {
    8
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "walletcore")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".walletcore")
        })
}

fn config_file_path() -> Result<PathBuf> {
    let config_dir = directories::ProjectDirs::from("", "", "walletcore")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("walletcore")
        });

    Ok(config_dir.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_conversion() {
        assert_eq!(Network::Regtest.as_str(), "regtest");
        assert_eq!(Network::Mainnet.to_bitcoin_network(), bitcoin::Network::Bitcoin);
    }

    #[test]
    fn test_network_from_str() {
        assert_eq!("regtest".parse::<Network>().unwrap(), Network::Regtest);
        assert_eq!("SIGNET".parse::<Network>().unwrap(), Network::Signet);
        assert_eq!("bitcoin".parse::<Network>().unwrap(), Network::Mainnet);
        assert!("lightning".parse::<Network>().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = EngineConfig::default();
        config.network = Network::Regtest;
        config.servers = vec!["localhost:50001".to_string()];

        let toml = toml::to_string(&config).unwrap();
        assert!(toml.contains("network = \"regtest\""));

        let deserialized: EngineConfig = toml::from_str(&toml).unwrap();
        assert_eq!(deserialized.network, Network::Regtest);
        assert_eq!(deserialized.gap_limit, 20);
        assert_eq!(deserialized.reorg_tolerance_blocks, 6);
    }

    #[test]
    fn test_defaults_apply_to_sparse_toml() {
        let sparse = r#"
network = "regtest"
servers = ["localhost:50001"]
data_dir = "/tmp/walletcore-test"
"#;
        let config: EngineConfig = toml::from_str(sparse).unwrap();
        assert_eq!(config.dust_threshold_sat, 546);
        assert_eq!(config.max_parse_failure_ratio, 0.10);
        assert_eq!(config.spent_metadata_grace_days, 90);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.data_dir = std::env::temp_dir().join("walletcore-config-test");

        config.servers = vec!["noport".to_string()];
        assert!(config.validate().is_err());

        config.servers = vec!["localhost:50001".to_string()];
        config.gap_limit = 0;
        assert!(config.validate().is_err());

        config.gap_limit = 20;
        config.max_parse_failure_ratio = 1.5;
        assert!(config.validate().is_err());
    }
}
