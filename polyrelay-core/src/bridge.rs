//! # Provider Bridge Abstraction
//!
//! A [`Bridge`] is the capability to execute one upstream call against one
//! provider. The gateway core is polymorphic over bridges: it never sees a
//! URL, an API key, or a wire format, only this trait. Concrete adapters
//! (Cerebras, Z.AI, MiniMax, a synthetic stub, ...) implement it outside
//! this workspace.
//!
//! Two implementations ship here:
//!
//! - [`ErrorBridge`] — the sentinel installed for misconfigured providers.
//!   It reports itself unhealthy and every dispatch yields a 503.
//! - [`MockBridge`] — a scriptable bridge for tests: queue up outcomes and
//!   each `send_request` drains one.
//!
//! ## Implementing a bridge
//!
//! ```rust
//! use polyrelay_core::{Bridge, ProviderError, RateLimitStatus, Request, Response};
//! use async_trait::async_trait;
//!
//! struct SyntheticBridge;
//!
//! #[async_trait]
//! impl Bridge for SyntheticBridge {
//!     fn provider_name(&self) -> &str {
//!         "synthetic"
//!     }
//!
//!     async fn send_request(&self, request: &Request) -> Result<Response, ProviderError> {
//!         Ok(Response::ok(
//!             "synthetic",
//!             200,
//!             serde_json::json!({ "echo": request.data }),
//!             1.0,
//!         ))
//!     }
//!
//!     fn is_healthy(&self) -> bool {
//!         true
//!     }
//!
//!     fn rate_limit_status(&self) -> RateLimitStatus {
//!         RateLimitStatus::default()
//!     }
//! }
//! ```

use crate::error::ProviderError;
use crate::models::{RateLimitStatus, Request, Response};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Capability to dispatch requests to a single upstream provider.
///
/// A returned `Ok(Response)` may still carry `success = false` when the
/// provider answered with a non-2xx status; `Err` is reserved for calls that
/// never produced a well-formed reply (network trouble, timeouts, transport
/// errors).
#[async_trait::async_trait]
pub trait Bridge: Send + Sync {
    /// Name of the provider this bridge dispatches to.
    fn provider_name(&self) -> &str;

    /// Execute one upstream call.
    async fn send_request(&self, request: &Request) -> Result<Response, ProviderError>;

    /// Cheap local health view, without a network round trip.
    fn is_healthy(&self) -> bool;

    /// Current rate-limit window as last reported by the provider.
    fn rate_limit_status(&self) -> RateLimitStatus;
}

/// Sentinel bridge for providers that could not be wired up.
///
/// Keeps the provider addressable (so configuration errors surface as 503s
/// instead of missing-provider panics) while guaranteeing no traffic ever
/// reaches a half-configured upstream.
pub struct ErrorBridge {
    provider_name: String,
    reason: String,
}

impl ErrorBridge {
    pub fn new(provider_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait::async_trait]
impl Bridge for ErrorBridge {
    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn send_request(&self, _request: &Request) -> Result<Response, ProviderError> {
        Ok(Response::error(
            self.provider_name.clone(),
            503,
            format!("provider unavailable: {}", self.reason),
        ))
    }

    fn is_healthy(&self) -> bool {
        false
    }

    fn rate_limit_status(&self) -> RateLimitStatus {
        RateLimitStatus::default()
    }
}

/// Scripted bridge for tests.
///
/// Outcomes pushed with [`MockBridge::push_outcome`] are drained in FIFO
/// order, one per `send_request`; with an empty script every call succeeds
/// with a canned 200. An optional artificial latency makes timing-sensitive
/// paths testable.
pub struct MockBridge {
    provider_name: String,
    script: Mutex<VecDeque<Result<Response, ProviderError>>>,
    healthy: AtomicBool,
    request_count: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl MockBridge {
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            script: Mutex::new(VecDeque::new()),
            healthy: AtomicBool::new(true),
            request_count: AtomicUsize::new(0),
            latency: Mutex::new(None),
        }
    }

    /// Queue the outcome of a future `send_request` call.
    pub fn push_outcome(&self, outcome: Result<Response, ProviderError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Queue `count` failing responses with the given status.
    pub fn push_failures(&self, count: usize, status_code: u16) {
        for _ in 0..count {
            self.push_outcome(Ok(Response::error(
                self.provider_name.clone(),
                status_code,
                format!("scripted failure ({status_code})"),
            )));
        }
    }

    /// Flip the cheap local health view.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Add an artificial delay before every reply.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Number of `send_request` calls observed so far.
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Bridge for MockBridge {
    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn send_request(&self, request: &Request) -> Result<Response, ProviderError> {
        self.request_count.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => Ok(Response::ok(
                self.provider_name.clone(),
                200,
                serde_json::json!({
                    "model": request.model,
                    "content": "mock completion",
                }),
                1.0,
            )),
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn rate_limit_status(&self) -> RateLimitStatus {
        RateLimitStatus {
            requests_used: self.request_count.load(Ordering::SeqCst) as u32,
            requests_limit: 60,
            ..RateLimitStatus::default()
        }
    }
}
