//! Controller configuration.

use crate::error::ConfigError;
use crate::policy::DEFAULT_ROUTE_CACHE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the pipeline does with traffic no policy decided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DefaultAction {
    #[default]
    Drop,
    /// Forward out of the given port without installing a rule.
    Forward(u32),
}

/// Numeric bounds applied when validating flow rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleLimits {
    pub min_priority: u16,
    pub max_priority: u16,
    pub max_table_id: u8,
}

impl Default for RuleLimits {
    fn default() -> Self {
        ControllerConfig::default().rule_limits()
    }
}

/// Controller configuration. Every field has a default, so `{}` is a valid
/// document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Upper bound on every transport call.
    pub transport_timeout_ms: u64,
    /// Priority of rules submitted without one.
    pub default_priority: u16,
    pub min_priority: u16,
    pub max_priority: u16,
    pub max_table_id: u8,
    /// Priority of rules installed by the packet-in pipeline.
    pub packet_in_priority: u16,
    /// Idle timeout of pipeline-installed rules; 0 = permanent.
    pub packet_in_idle_timeout_secs: u64,
    pub default_action: DefaultAction,
    /// Combined critical/high/medium usage above which low-tier traffic is
    /// throttled. Unset = low tier always admitted.
    pub low_tier_contention_threshold_mbps: Option<f64>,
    /// Learn sender IP/MAC bindings from ARP traffic.
    pub learn_arp_senders: bool,
    /// Resolved destinations cached per switch; 0 disables the cache.
    pub route_cache_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            transport_timeout_ms: 2000,
            default_priority: 32768,
            min_priority: 0,
            max_priority: u16::MAX,
            max_table_id: 254,
            packet_in_priority: 100,
            packet_in_idle_timeout_secs: 60,
            default_action: DefaultAction::Drop,
            low_tier_contention_threshold_mbps: None,
            learn_arp_senders: true,
            route_cache_capacity: DEFAULT_ROUTE_CACHE_CAPACITY,
        }
    }
}

impl ControllerConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: ControllerConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "transport_timeout_ms must be positive".to_string(),
            ));
        }
        if self.min_priority > self.max_priority {
            return Err(ConfigError::Invalid(format!(
                "min_priority {} exceeds max_priority {}",
                self.min_priority, self.max_priority
            )));
        }
        for (name, value) in [
            ("default_priority", self.default_priority),
            ("packet_in_priority", self.packet_in_priority),
        ] {
            if value < self.min_priority || value > self.max_priority {
                return Err(ConfigError::Invalid(format!(
                    "{} {} outside [{}, {}]",
                    name, value, self.min_priority, self.max_priority
                )));
            }
        }
        if let Some(threshold) = self.low_tier_contention_threshold_mbps {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "low_tier_contention_threshold_mbps {} must be a non-negative number",
                    threshold
                )));
            }
        }
        if let DefaultAction::Forward(0) = self.default_action {
            return Err(ConfigError::Invalid(
                "default forward port must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    pub fn packet_in_idle_timeout(&self) -> Option<Duration> {
        match self.packet_in_idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn rule_limits(&self) -> RuleLimits {
        RuleLimits {
            min_priority: self.min_priority,
            max_priority: self.max_priority,
            max_table_id: self.max_table_id,
        }
    }
}
