//! Engine configuration (§6.3), layered the way the teacher loads
//! `delta.toml`: hard-coded defaults, overridable by a TOML file, which in
//! turn can have the embedder override individual fields in code before
//! `Service::initialize`.

use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;

/// All tunables the protocol exposes, with the defaults from §6.3.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub gossip_interval: Duration,
    pub fanout: usize,
    pub gossip_timeout: Duration,
    pub max_events_per_message: usize,
    pub enable_anti_entropy: bool,
    pub anti_entropy_interval: Duration,
    pub peer_discovery_interval: Duration,
    pub max_concurrent_peers: usize,
    pub max_connection_attempts: u32,
    pub auto_save_event_count: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(2),
            fanout: 3,
            gossip_timeout: Duration::from_secs(8),
            max_events_per_message: 50,
            enable_anti_entropy: true,
            anti_entropy_interval: Duration::from_secs(120),
            peer_discovery_interval: Duration::from_secs(1),
            max_concurrent_peers: 8,
            max_connection_attempts: 3,
            auto_save_event_count: 100,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.fanout == 0 {
            return Err(EngineError::ConfigInvalid("fanout must be at least 1".into()));
        }
        if self.max_events_per_message == 0 {
            return Err(EngineError::ConfigInvalid(
                "max_events_per_message must be at least 1".into(),
            ));
        }
        if self.max_concurrent_peers == 0 {
            return Err(EngineError::ConfigInvalid(
                "max_concurrent_peers must be at least 1".into(),
            ));
        }
        if self.gossip_timeout.is_zero() {
            return Err(EngineError::ConfigInvalid("gossip_timeout must be positive".into()));
        }
        Ok(())
    }

    /// Layer a TOML document's fields on top of the defaults. Unknown keys
    /// are ignored; missing keys keep their default.
    pub fn load_toml(contents: &str) -> Result<Self, EngineError> {
        let raw: RawConfig =
            toml::from_str(contents).map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        let config = raw.into_config();
        config.validate()?;
        Ok(config)
    }
}

/// Mirrors [`EngineConfig`] but with every field optional, for partial
/// TOML overrides. Durations are expressed in whole seconds on the wire.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    gossip_interval_secs: Option<u64>,
    fanout: Option<usize>,
    gossip_timeout_secs: Option<u64>,
    max_events_per_message: Option<usize>,
    enable_anti_entropy: Option<bool>,
    anti_entropy_interval_secs: Option<u64>,
    peer_discovery_interval_secs: Option<u64>,
    max_concurrent_peers: Option<usize>,
    max_connection_attempts: Option<u32>,
    auto_save_event_count: Option<u64>,
}

impl RawConfig {
    fn into_config(self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            gossip_interval: self
                .gossip_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.gossip_interval),
            fanout: self.fanout.unwrap_or(defaults.fanout),
            gossip_timeout: self
                .gossip_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.gossip_timeout),
            max_events_per_message: self.max_events_per_message.unwrap_or(defaults.max_events_per_message),
            enable_anti_entropy: self.enable_anti_entropy.unwrap_or(defaults.enable_anti_entropy),
            anti_entropy_interval: self
                .anti_entropy_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.anti_entropy_interval),
            peer_discovery_interval: self
                .peer_discovery_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.peer_discovery_interval),
            max_concurrent_peers: self.max_concurrent_peers.unwrap_or(defaults.max_concurrent_peers),
            max_connection_attempts: self
                .max_connection_attempts
                .unwrap_or(defaults.max_connection_attempts),
            auto_save_event_count: self.auto_save_event_count.unwrap_or(defaults.auto_save_event_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.gossip_interval, Duration::from_secs(2));
        assert_eq!(config.fanout, 3);
        assert_eq!(config.gossip_timeout, Duration::from_secs(8));
        assert_eq!(config.max_events_per_message, 50);
        assert!(config.enable_anti_entropy);
        assert_eq!(config.anti_entropy_interval, Duration::from_secs(120));
        assert_eq!(config.peer_discovery_interval, Duration::from_secs(1));
        assert_eq!(config.max_concurrent_peers, 8);
        assert_eq!(config.max_connection_attempts, 3);
        assert_eq!(config.auto_save_event_count, 100);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config = EngineConfig::load_toml("fanout = 5\nmaxConcurrentPeers = 16\n").unwrap();
        assert_eq!(config.fanout, 5);
        assert_eq!(config.max_concurrent_peers, 16);
        assert_eq!(config.gossip_interval, Duration::from_secs(2));
    }

    #[test]
    fn zero_fanout_is_rejected() {
        let config = EngineConfig {
            fanout: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_config_error_not_a_panic() {
        let err = EngineConfig::load_toml("not valid toml :::").unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
    }
}
