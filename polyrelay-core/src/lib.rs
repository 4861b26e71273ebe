//! # Polyrelay Core
//!
//! Provider-facing building blocks for the Polyrelay gateway: the bridge
//! abstraction used to talk to upstream LLM providers, the request/response
//! model that flows through the gateway, the provider error taxonomy, and
//! the failover manager that tracks hard-failed providers.
//!
//! ## Overview
//!
//! This crate deliberately knows nothing about HTTP serving, provider wire
//! formats, or routing policy. It provides:
//!
//! - **`Bridge`**: the capability a provider adapter must implement to be
//!   dispatched to (send a request, report local health, report rate-limit
//!   state). Concrete adapters for Cerebras, Z.AI, MiniMax and friends live
//!   outside this workspace; [`bridge::ErrorBridge`] ships here as the
//!   sentinel for misconfigured providers, and [`bridge::MockBridge`] backs
//!   the test suites.
//! - **`Request` / `Response`**: the opaque payload plus the small envelope
//!   the gateway needs (model, method, correlation id, status, timing).
//! - **`ProviderError`**: one error enum for everything an upstream call can
//!   do wrong, with transient/permanent classification driving failover.
//! - **`FailoverManager`**: a fast negative cache of providers that recently
//!   hard-failed, with per-provider cooldown windows.
//!
//! ## Example
//!
//! ```rust
//! use polyrelay_core::{FailoverManager, Request};
//!
//! let failover = FailoverManager::new(&["cerebras".to_string(), "zai".to_string()]);
//! failover.mark_failed("cerebras", 5);
//!
//! assert!(!failover.is_available("cerebras"));
//! assert_eq!(failover.next_provider("cerebras").as_deref(), Some("zai"));
//!
//! let request = Request::new("glm-4.5", serde_json::json!({
//!     "messages": [{ "role": "user", "content": "hello" }]
//! }));
//! assert_eq!(request.method, "POST");
//! ```

pub mod bridge;
pub mod common;
pub mod error;
pub mod failover;
pub mod models;

pub use bridge::{Bridge, ErrorBridge, MockBridge};
pub use error::ProviderError;
pub use failover::{FailoverManager, FailoverStatistics};
pub use models::{RateLimitStatus, Request, Response};
