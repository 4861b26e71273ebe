//! # Gateway Configuration
//!
//! The structured document the gateway is driven by: routing preferences,
//! load-balancer strategy, and the provider pool with per-provider
//! capabilities, rate caps, costs, and health-check tuning.
//!
//! Loading is transactional. [`GatewayConfig::validate`] walks the entire
//! document and aggregates every violation into one
//! [`ConfigError::Invalid`]; the manager only applies a document that
//! validated in full, so a bad reload never leaves the registry half
//! updated.
//!
//! ## File format
//!
//! ```toml
//! default_provider = "cerebras"
//! thinking_provider = "zai"
//! routing_priority = "BALANCED"
//! load_balancer = "ROUND_ROBIN"
//!
//! [providers.cerebras]
//! name = "cerebras"
//! base_url = "https://api.cerebras.ai/v1"
//! api_key = "csk-..."
//! models = ["llama3.1-70b"]
//! supports_streaming = true
//! max_concurrent_requests = 20
//! cost_per_input_token = 0.6
//! cost_per_output_token = 1.2
//! health_check_interval = "60s"
//! max_failures = 5
//! recovery_delay = "5m"
//! priority_score = 120
//! ```

use crate::balancer::Strategy;
use crate::health::CapabilitySet;
use crate::routing::RoutingPriority;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors surfaced by validation and reload.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One or more validation failures, aggregated
    #[error("invalid configuration: {}", .errors.join("; "))]
    Invalid { errors: Vec<String> },

    /// The document could not be parsed at all
    #[error("malformed configuration document: {0}")]
    Malformed(String),
}

fn default_avg_response_time() -> f64 {
    1000.0
}

fn default_success_rate() -> f64 {
    1.0
}

fn default_max_concurrent() -> u32 {
    10
}

fn default_max_rpm() -> u32 {
    60
}

fn default_max_failures() -> u32 {
    5
}

fn default_required_probes() -> u32 {
    3
}

fn default_priority_score() -> i32 {
    100
}

fn default_enabled() -> bool {
    true
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_failure_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_failover_attempts() -> u32 {
    3
}

/// Configuration for one upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Unique provider name; doubles as the routing key
    pub name: String,
    /// API endpoint, scheme included
    pub base_url: String,
    /// Opaque secret passed through to the bridge
    #[serde(default)]
    pub api_key: String,
    /// Models this provider serves
    #[serde(default)]
    pub models: Vec<String>,

    #[serde(default)]
    pub supports_thinking: bool,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_json_mode: bool,
    #[serde(default)]
    pub supports_function_calling: bool,

    /// Seed estimate until real samples arrive
    #[serde(default = "default_avg_response_time")]
    pub avg_response_time_ms: f64,
    /// Seed estimate until real samples arrive
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: u32,
    #[serde(default = "default_max_rpm")]
    pub max_requests_per_minute: u32,
    /// Dollars per million input tokens
    #[serde(default)]
    pub cost_per_input_token: f64,
    /// Dollars per million output tokens
    #[serde(default)]
    pub cost_per_output_token: f64,

    #[serde(
        with = "polyrelay_core::common::duration_serde",
        default = "default_health_check_interval"
    )]
    pub health_check_interval: Duration,
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// How long an open circuit blocks requests before probing
    #[serde(
        rename = "recovery_delay",
        alias = "failure_timeout",
        with = "polyrelay_core::common::duration_serde",
        default = "default_failure_timeout"
    )]
    pub failure_timeout: Duration,
    /// Consecutive successful probes needed to close the circuit
    #[serde(default = "default_required_probes")]
    pub required_probes: u32,

    /// Higher is preferred, all else equal
    #[serde(default = "default_priority_score")]
    pub priority_score: i32,
    /// Administrative on/off switch
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            models: Vec::new(),
            supports_thinking: false,
            supports_vision: false,
            supports_tools: false,
            supports_streaming: false,
            supports_json_mode: false,
            supports_function_calling: false,
            avg_response_time_ms: default_avg_response_time(),
            success_rate: default_success_rate(),
            max_concurrent_requests: default_max_concurrent(),
            max_requests_per_minute: default_max_rpm(),
            cost_per_input_token: 0.0,
            cost_per_output_token: 0.0,
            health_check_interval: default_health_check_interval(),
            max_failures: default_max_failures(),
            failure_timeout: default_failure_timeout(),
            required_probes: default_required_probes(),
            priority_score: default_priority_score(),
            enabled: default_enabled(),
        }
    }
}

impl ProviderSettings {
    /// Capability bitset derived from the `supports_*` flags.
    pub fn capabilities(&self) -> CapabilitySet {
        let mut set = CapabilitySet::NONE;
        if self.supports_thinking {
            set.insert(CapabilitySet::THINKING);
        }
        if self.supports_vision {
            set.insert(CapabilitySet::VISION);
        }
        if self.supports_tools {
            set.insert(CapabilitySet::TOOLS);
        }
        if self.supports_streaming {
            set.insert(CapabilitySet::STREAMING);
        }
        if self.supports_json_mode {
            set.insert(CapabilitySet::JSON_MODE);
        }
        if self.supports_function_calling {
            set.insert(CapabilitySet::FUNCTION_CALLING);
        }
        set
    }

    /// Whether this provider serves `model`. An empty model means "any".
    pub fn serves_model(&self, model: &str) -> bool {
        model.is_empty() || self.models.iter().any(|m| m == model)
    }

    /// Collect every violation in this settings block.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let ctx = if self.name.is_empty() {
            "<unnamed>".to_string()
        } else {
            self.name.clone()
        };

        if self.name.is_empty() {
            errors.push("provider name cannot be empty".to_string());
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            errors.push(format!(
                "provider {ctx}: base_url must start with http:// or https://"
            ));
        }
        if self.max_concurrent_requests == 0 {
            errors.push(format!("provider {ctx}: max_concurrent_requests cannot be 0"));
        }
        if self.max_requests_per_minute == 0 {
            errors.push(format!("provider {ctx}: max_requests_per_minute cannot be 0"));
        }
        if self.cost_per_input_token < 0.0 || self.cost_per_output_token < 0.0 {
            errors.push(format!("provider {ctx}: token costs cannot be negative"));
        }
        if self.avg_response_time_ms < 0.0 {
            errors.push(format!("provider {ctx}: avg_response_time_ms cannot be negative"));
        }
        if !(0.0..=1.0).contains(&self.success_rate) {
            errors.push(format!(
                "provider {ctx}: success_rate must be between 0.0 and 1.0"
            ));
        }
        if self.max_failures == 0 {
            errors.push(format!("provider {ctx}: max_failures cannot be 0"));
        }
        if self.required_probes == 0 {
            errors.push(format!("provider {ctx}: required_probes cannot be 0"));
        }
        if self.health_check_interval.is_zero() {
            errors.push(format!("provider {ctx}: health_check_interval cannot be 0"));
        }
        if self.failure_timeout.is_zero() {
            errors.push(format!("provider {ctx}: recovery_delay cannot be 0"));
        }

        errors
    }
}

/// The full gateway configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_provider: Option<String>,

    #[serde(default = "default_routing_priority")]
    pub routing_priority: RoutingPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<Strategy>,

    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,

    /// Per-request deadline covering all failover attempts
    #[serde(
        with = "polyrelay_core::common::duration_serde",
        default = "default_request_timeout"
    )]
    pub request_timeout: Duration,
    /// Whether a permanent 4xx still fails over to another provider
    #[serde(default)]
    pub failover_on_client_error: bool,
    #[serde(default = "default_max_failover_attempts")]
    pub max_failover_attempts: u32,
}

fn default_routing_priority() -> RoutingPriority {
    RoutingPriority::Balanced
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            thinking_provider: None,
            vision_provider: None,
            tools_provider: None,
            routing_priority: RoutingPriority::Balanced,
            load_balancer: None,
            providers: HashMap::new(),
            request_timeout: default_request_timeout(),
            failover_on_client_error: false,
            max_failover_attempts: default_max_failover_attempts(),
        }
    }
}

impl GatewayConfig {
    /// Load and validate a TOML configuration file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        let config: GatewayConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to the JSON document shape accepted by
    /// [`GatewayConfig::from_json`].
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("configuration is always serializable")
    }

    /// Validate the whole document, aggregating every violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        for (key, settings) in &self.providers {
            if key != &settings.name && !settings.name.is_empty() {
                errors.push(format!(
                    "provider key '{key}' does not match provider name '{}'",
                    settings.name
                ));
            }
            errors.extend(settings.validation_errors());
        }

        for (label, reference) in [
            ("default_provider", &self.default_provider),
            ("thinking_provider", &self.thinking_provider),
            ("vision_provider", &self.vision_provider),
            ("tools_provider", &self.tools_provider),
        ] {
            if let Some(name) = reference {
                if !self.providers.contains_key(name) {
                    errors.push(format!("{label} '{name}' is not a configured provider"));
                }
            }
        }

        if self.max_failover_attempts == 0 {
            errors.push("max_failover_attempts cannot be 0".to_string());
        }
        if self.request_timeout.is_zero() {
            errors.push("request_timeout cannot be 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str) -> ProviderSettings {
        ProviderSettings {
            name: name.to_string(),
            base_url: "https://api.example.com/v1".to_string(),
            models: vec!["model-a".to_string()],
            ..ProviderSettings::default()
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn validation_aggregates_all_errors() {
        let mut config = GatewayConfig::default();
        config.providers.insert(
            "bad".to_string(),
            ProviderSettings {
                name: "bad".to_string(),
                base_url: "not-a-url".to_string(),
                max_concurrent_requests: 0,
                success_rate: 2.0,
                ..ProviderSettings::default()
            },
        );
        config.default_provider = Some("missing".to_string());

        let err = config.validate().unwrap_err();
        match err {
            ConfigError::Invalid { errors } => {
                assert!(errors.len() >= 4, "expected aggregated errors: {errors:?}");
                assert!(errors.iter().any(|e| e.contains("base_url")));
                assert!(errors.iter().any(|e| e.contains("max_concurrent_requests")));
                assert!(errors.iter().any(|e| e.contains("success_rate")));
                assert!(errors.iter().any(|e| e.contains("default_provider")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn key_name_mismatch_is_rejected() {
        let mut config = GatewayConfig::default();
        config
            .providers
            .insert("alias".to_string(), provider("real-name"));

        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_preserves_the_document() {
        let mut config = GatewayConfig::default();
        let mut cerebras = provider("cerebras");
        cerebras.supports_streaming = true;
        cerebras.cost_per_input_token = 0.6;
        config.providers.insert("cerebras".to_string(), cerebras);
        config.default_provider = Some("cerebras".to_string());
        config.load_balancer = Some(Strategy::RoundRobin);
        config.routing_priority = RoutingPriority::Cost;

        let json = config.to_json();
        let back = GatewayConfig::from_json(json.clone()).unwrap();
        assert_eq!(back.to_json(), json);
        assert_eq!(back.routing_priority, RoutingPriority::Cost);
        assert!(back.providers["cerebras"].supports_streaming);
    }

    #[test]
    fn enum_wire_forms_are_screaming_snake_case() {
        let json = serde_json::to_value(RoutingPriority::Balanced).unwrap();
        assert_eq!(json, "BALANCED");
        let json = serde_json::to_value(Strategy::LeastConnections).unwrap();
        assert_eq!(json, "LEAST_CONNECTIONS");
    }

    #[test]
    fn toml_document_parses_with_humane_durations() {
        let doc = r#"
            default_provider = "cerebras"
            routing_priority = "PERFORMANCE"
            load_balancer = "ADAPTIVE"
            request_timeout = "2m"

            [providers.cerebras]
            name = "cerebras"
            base_url = "https://api.cerebras.ai/v1"
            api_key = "csk-test"
            models = ["llama3.1-70b"]
            supports_streaming = true
            health_check_interval = "30s"
            recovery_delay = "5m"
        "#;

        let config: GatewayConfig = toml::from_str(doc).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout, Duration::from_secs(120));

        let cerebras = &config.providers["cerebras"];
        assert_eq!(cerebras.health_check_interval, Duration::from_secs(30));
        assert_eq!(cerebras.failure_timeout, Duration::from_secs(300));
        assert!(cerebras.capabilities().contains(CapabilitySet::STREAMING));
    }

    #[test]
    fn serves_model_handles_wildcard_request() {
        let settings = provider("p");
        assert!(settings.serves_model("model-a"));
        assert!(!settings.serves_model("model-b"));
        // An empty request model defers to routing.
        assert!(settings.serves_model(""));
    }
}
