//! # Polyrelay Gateway
//!
//! The routing and provider-lifecycle core of an Anthropic-compatible LLM
//! gateway. One HTTP layer above it parses wire requests; one bridge layer
//! below it talks to concrete providers. Everything between — request
//! classification, provider selection, health monitoring, circuit breaking,
//! failover, and request metrics — lives here, behind the
//! [`GatewayManager`] façade.
//!
//! ## Overview
//!
//! - **`manager`**: [`GatewayManager`], the single entry point. Registers
//!   providers and their bridges, routes requests, applies configuration
//!   documents, exposes metrics and diagnostics.
//! - **`health`**: per-provider state machines (healthy → degraded →
//!   unhealthy → circuit-open), rolling performance metrics, and the
//!   cooperative background monitor that probes providers and recovers open
//!   circuits.
//! - **`routing`**: request classification (thinking / vision / tools /
//!   streaming / long-context), capability derivation, and strategy-based
//!   candidate scoring.
//! - **`balancer`**: round-robin, weighted, least-connections,
//!   fastest-response, adaptive and random tie-breaking strategies.
//! - **`metrics`**: a bounded ring of per-request records with aggregate
//!   percentile snapshots.
//! - **`config`**: the transactional configuration document.
//!
//! ## Quick start
//!
//! ```rust
//! use polyrelay_gateway::config::ProviderSettings;
//! use polyrelay_gateway::GatewayManager;
//! use polyrelay_core::{MockBridge, Request};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let manager = GatewayManager::new();
//! manager
//!     .add_provider(ProviderSettings {
//!         name: "synthetic".to_string(),
//!         base_url: "https://synthetic.internal/v1".to_string(),
//!         models: vec!["synthetic-gpt-4".to_string()],
//!         ..ProviderSettings::default()
//!     })
//!     .unwrap();
//! manager.add_provider_adapter(Arc::new(MockBridge::new("synthetic")));
//! manager.initialize();
//!
//! let request = Request::new("synthetic-gpt-4", serde_json::json!({
//!     "messages": [{ "role": "user", "content": "hi" }]
//! }));
//! let response = manager.route_request(&request).await;
//! assert!(response.success);
//! # }
//! ```

pub mod balancer;
pub mod config;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod routing;

#[cfg(test)]
mod tests;

pub use balancer::{LoadBalancer, Strategy};
pub use config::{ConfigError, GatewayConfig, ProviderSettings};
pub use health::{CapabilitySet, HealthStatus, ProviderHealth, ProviderHealthMonitor};
pub use manager::GatewayManager;
pub use metrics::{MetricLog, RequestMetric, MAX_METRICS_HISTORY};
pub use routing::{RequestAnalysis, RequestType, RoutingDecision, RoutingLogic, RoutingPriority};
