//! `load_balance` outbound group configuration.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Candidate selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Random,
    ConsistentHash,
}

/// Behavior when both tiers have no healthy candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyPoolAction {
    #[default]
    Error,
    FallbackAll,
}

/// Behavior when the composed hash key is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnEmptyKey {
    #[default]
    Random,
    HashEmpty,
}

/// Per-tier candidate count after latency sorting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TopN {
    pub primary: usize,
    /// 0 means "all configured backups".
    #[serde(default)]
    pub backup: usize,
}

/// Consistent-hash key extraction and ring sizing.
///
/// `key_parts` entries name connection metadata fields (`src_ip`,
/// `dst_ip`, `src_port`, `dst_port`, `network`, `domain`, `inbound_tag`,
/// `matched_ruleset`, `etld_plus_one`, `matched_ruleset_or_etld`, `salt`);
/// unrecognized names contribute the `-` placeholder.
///
/// `key_salt` supports two deployment dialects: when `"salt"` is absent
/// from `key_parts`, a non-empty salt is prepended to the composed key with
/// no separator; when `"salt"` is listed, the salt is joined as an ordinary
/// `|`-separated part instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashConfig {
    #[serde(default)]
    pub key_parts: Vec<String>,
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
    #[serde(default)]
    pub on_empty_key: OnEmptyKey,
    #[serde(default)]
    pub key_salt: String,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            key_parts: Vec::new(),
            virtual_nodes: default_virtual_nodes(),
            on_empty_key: OnEmptyKey::default(),
            key_salt: String::new(),
        }
    }
}

/// Tier flap damping: consecutive failures before the backup tier
/// activates, and how long it is held before primary recovery is honored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HysteresisConfig {
    #[serde(default = "default_primary_failures")]
    pub primary_failures: u32,
    #[serde(default = "default_backup_hold_time", with = "crate::de::duration")]
    pub backup_hold_time: Duration,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            primary_failures: default_primary_failures(),
            backup_hold_time: default_backup_hold_time(),
        }
    }
}

/// The `load_balance` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalanceConfig {
    pub primary_outbounds: Vec<String>,
    #[serde(default)]
    pub backup_outbounds: Vec<String>,

    /// Canary URL probed through each member outbound.
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_interval", with = "crate::de::duration")]
    pub interval: Duration,
    #[serde(default = "default_timeout", with = "crate::de::duration")]
    pub timeout: Duration,
    /// Probe ticker suspends after this long without a dispatch; zero
    /// disables idle suspension.
    #[serde(default = "default_idle_timeout", with = "crate::de::duration")]
    pub idle_timeout: Duration,

    pub top_n: TopN,
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<HashConfig>,
    #[serde(default)]
    pub hysteresis: HysteresisConfig,
    #[serde(default)]
    pub empty_pool_action: EmptyPoolAction,
    #[serde(default)]
    pub interrupt_exist_connections: bool,
}

impl LoadBalanceConfig {
    /// Check the structural rules that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.primary_outbounds.is_empty() {
            return Err(ConfigError::MissingPrimaryOutbounds);
        }
        if self.top_n.primary == 0 {
            return Err(ConfigError::InvalidTopN);
        }
        match (self.strategy, &self.hash) {
            (Strategy::ConsistentHash, None) => return Err(ConfigError::MissingHashConfig),
            (_, Some(hash)) if hash.virtual_nodes == 0 => {
                return Err(ConfigError::InvalidVirtualNodes)
            }
            _ => {}
        }
        if self.hysteresis.primary_failures == 0 {
            return Err(ConfigError::InvalidPrimaryFailures);
        }

        let mut seen = HashSet::new();
        for tag in self
            .primary_outbounds
            .iter()
            .chain(self.backup_outbounds.iter())
        {
            if !seen.insert(tag.as_str()) {
                return Err(ConfigError::DuplicateTag(tag.clone()));
            }
        }
        Ok(())
    }

    /// Effective backup top-N: an explicit value, or all configured backups.
    pub fn effective_top_n_backup(&self) -> usize {
        if self.top_n.backup == 0 {
            self.backup_outbounds.len()
        } else {
            self.top_n.backup
        }
    }
}

fn default_url() -> String {
    "https://www.gstatic.com/generate_204".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(180)
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_virtual_nodes() -> usize {
    100
}

fn default_primary_failures() -> u32 {
    3
}

fn default_backup_hold_time() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(strategy: Strategy) -> LoadBalanceConfig {
        LoadBalanceConfig {
            primary_outbounds: vec!["a".into(), "b".into()],
            backup_outbounds: Vec::new(),
            url: default_url(),
            interval: default_interval(),
            timeout: default_timeout(),
            idle_timeout: default_idle_timeout(),
            top_n: TopN {
                primary: 2,
                backup: 0,
            },
            strategy,
            hash: None,
            hysteresis: HysteresisConfig::default(),
            empty_pool_action: EmptyPoolAction::default(),
            interrupt_exist_connections: false,
        }
    }

    #[test]
    fn defaults_from_minimal_document() {
        let cfg: LoadBalanceConfig = serde_json::from_str(
            r#"{
                "primary_outbounds": ["p1", "p2"],
                "top_n": {"primary": 1},
                "strategy": "random"
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.url, "https://www.gstatic.com/generate_204");
        assert_eq!(cfg.interval, Duration::from_secs(180));
        assert_eq!(cfg.timeout, Duration::from_secs(5));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(1800));
        assert_eq!(cfg.hysteresis.primary_failures, 3);
        assert_eq!(cfg.hysteresis.backup_hold_time, Duration::from_secs(30));
        assert_eq!(cfg.empty_pool_action, EmptyPoolAction::Error);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn duration_accepts_text_and_seconds() {
        let cfg: LoadBalanceConfig = serde_json::from_str(
            r#"{
                "primary_outbounds": ["p1"],
                "top_n": {"primary": 1},
                "strategy": "random",
                "interval": "1m",
                "timeout": 10,
                "hysteresis": {"backup_hold_time": "45s"}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.interval, Duration::from_secs(60));
        assert_eq!(cfg.timeout, Duration::from_secs(10));
        assert_eq!(cfg.hysteresis.backup_hold_time, Duration::from_secs(45));
    }

    #[test]
    fn rejects_empty_primary() {
        let mut cfg = minimal(Strategy::Random);
        cfg.primary_outbounds.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::MissingPrimaryOutbounds));
    }

    #[test]
    fn rejects_zero_top_n_primary() {
        let mut cfg = minimal(Strategy::Random);
        cfg.top_n.primary = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidTopN));
    }

    #[test]
    fn consistent_hash_requires_hash_block() {
        let cfg = minimal(Strategy::ConsistentHash);
        assert_eq!(cfg.validate(), Err(ConfigError::MissingHashConfig));

        let mut cfg = minimal(Strategy::ConsistentHash);
        cfg.hash = Some(HashConfig::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_virtual_nodes() {
        let mut cfg = minimal(Strategy::ConsistentHash);
        cfg.hash = Some(HashConfig {
            virtual_nodes: 0,
            ..HashConfig::default()
        });
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidVirtualNodes));
    }

    #[test]
    fn rejects_duplicate_tags_across_tiers() {
        let mut cfg = minimal(Strategy::Random);
        cfg.backup_outbounds = vec!["b".into()];
        assert_eq!(cfg.validate(), Err(ConfigError::DuplicateTag("b".into())));
    }

    #[test]
    fn backup_top_n_defaults_to_all() {
        let mut cfg = minimal(Strategy::Random);
        cfg.backup_outbounds = vec!["x".into(), "y".into(), "z".into()];
        assert_eq!(cfg.effective_top_n_backup(), 3);
        cfg.top_n.backup = 2;
        assert_eq!(cfg.effective_top_n_backup(), 2);
    }

    #[test]
    fn full_document_with_hash_block() {
        let cfg: LoadBalanceConfig = serde_json::from_str(
            r#"{
                "primary_outbounds": ["hk-1", "hk-2", "jp-1"],
                "backup_outbounds": ["us-1"],
                "url": "http://cp.cloudflare.com/generate_204",
                "interval": "2m",
                "idle_timeout": 0,
                "top_n": {"primary": 2, "backup": 1},
                "strategy": "consistent_hash",
                "hash": {
                    "key_parts": ["src_ip", "matched_ruleset_or_etld"],
                    "virtual_nodes": 200,
                    "on_empty_key": "hash_empty",
                    "key_salt": "prod"
                },
                "hysteresis": {"primary_failures": 5},
                "empty_pool_action": "fallback_all",
                "interrupt_exist_connections": true
            }"#,
        )
        .unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.idle_timeout, Duration::ZERO);
        assert_eq!(cfg.effective_top_n_backup(), 1);
        let hash = cfg.hash.as_ref().unwrap();
        assert_eq!(hash.virtual_nodes, 200);
        assert_eq!(hash.on_empty_key, OnEmptyKey::HashEmpty);
        assert_eq!(hash.key_salt, "prod");
        assert_eq!(cfg.hysteresis.primary_failures, 5);
        assert_eq!(
            cfg.hysteresis.backup_hold_time,
            Duration::from_secs(30),
            "partial hysteresis block keeps the other default"
        );
        assert_eq!(cfg.empty_pool_action, EmptyPoolAction::FallbackAll);

        // Survives a serialize/deserialize cycle intact.
        let text = serde_json::to_string(&cfg).unwrap();
        let again: LoadBalanceConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(again.interval, cfg.interval);
        assert_eq!(again.strategy, cfg.strategy);
        assert_eq!(again.hash.unwrap().key_parts, hash.key_parts);
    }

    #[test]
    fn strategy_names_round_trip() {
        assert_eq!(
            serde_json::to_string(&Strategy::ConsistentHash).unwrap(),
            "\"consistent_hash\""
        );
        assert_eq!(
            serde_json::from_str::<Strategy>("\"random\"").unwrap(),
            Strategy::Random
        );
        assert!(serde_json::from_str::<Strategy>("\"round_robin\"").is_err());
    }
}
