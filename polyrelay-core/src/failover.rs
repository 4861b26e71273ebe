//! # Failover Manager
//!
//! A fast negative cache of providers that recently hard-failed. The
//! routing path consults it before the full health monitor: a provider
//! marked failed is skipped until its cooldown window elapses, after which
//! the next use clears the flag and the provider rejoins the pool.
//!
//! The manager is advisory. It never blocks a probe or overrides the health
//! monitor; it only keeps the hot path from repeatedly dispatching into a
//! provider that just fell over.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default cooldown applied by [`FailoverManager::mark_failed`] callers that
/// have no better idea, in minutes.
pub const DEFAULT_COOLDOWN_MINUTES: u64 = 5;

#[derive(Debug)]
struct FailoverStatus {
    is_failed: bool,
    fail_time: Option<Instant>,
    cooldown: Duration,
    failure_count: u32,
}

impl FailoverStatus {
    fn new() -> Self {
        Self {
            is_failed: false,
            fail_time: None,
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_MINUTES * 60),
            failure_count: 0,
        }
    }

    fn cooldown_expired(&self) -> bool {
        if !self.is_failed {
            return true;
        }
        match self.fail_time {
            Some(fail_time) => fail_time.elapsed() >= self.cooldown,
            None => true,
        }
    }

    fn cooldown_remaining(&self) -> Option<Duration> {
        if !self.is_failed {
            return None;
        }
        let fail_time = self.fail_time?;
        self.cooldown.checked_sub(fail_time.elapsed())
    }
}

/// Per-provider snapshot exposed by [`FailoverManager::statistics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderFailoverStats {
    pub name: String,
    pub is_failed: bool,
    pub failure_count: u32,
    /// Seconds of cooldown left; absent when the provider is not failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_secs: Option<u64>,
}

/// Snapshot of the whole failover table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverStatistics {
    pub providers: Vec<ProviderFailoverStats>,
    pub total_failures: u64,
}

/// Tracks hard-failed providers and their cooldown windows.
///
/// All operations take `&self`; the status map is a [`DashMap`] and the
/// registration order (used for deterministic scans) sits behind its own
/// mutex.
pub struct FailoverManager {
    statuses: DashMap<String, FailoverStatus>,
    order: Mutex<Vec<String>>,
}

impl FailoverManager {
    /// Create a manager pre-registered with the given providers.
    pub fn new(providers: &[String]) -> Self {
        let manager = Self {
            statuses: DashMap::new(),
            order: Mutex::new(Vec::new()),
        };
        for provider in providers {
            manager.register(provider);
        }
        manager
    }

    /// Start tracking a provider. Idempotent.
    pub fn register(&self, provider: &str) {
        if self.statuses.contains_key(provider) {
            return;
        }
        self.statuses
            .insert(provider.to_string(), FailoverStatus::new());
        self.order.lock().unwrap().push(provider.to_string());
    }

    /// Stop tracking a provider.
    pub fn unregister(&self, provider: &str) {
        self.statuses.remove(provider);
        self.order.lock().unwrap().retain(|name| name != provider);
    }

    /// Mark a provider failed for `cooldown_minutes`.
    pub fn mark_failed(&self, provider: &str, cooldown_minutes: u64) {
        self.mark_failed_for(provider, Duration::from_secs(cooldown_minutes * 60));
    }

    /// Mark a provider failed for an exact cooldown window.
    pub fn mark_failed_for(&self, provider: &str, cooldown: Duration) {
        if let Some(mut status) = self.statuses.get_mut(provider) {
            status.is_failed = true;
            status.fail_time = Some(Instant::now());
            status.cooldown = cooldown;
            status.failure_count += 1;
            tracing::warn!(
                provider,
                failure_count = status.failure_count,
                cooldown_secs = cooldown.as_secs(),
                "provider marked failed"
            );
        }
    }

    /// Clear a provider's failed flag after a successful dispatch. The
    /// failure count decays by one, floored at zero.
    pub fn mark_healthy(&self, provider: &str) {
        if let Some(mut status) = self.statuses.get_mut(provider) {
            status.is_failed = false;
            status.failure_count = status.failure_count.saturating_sub(1);
        }
    }

    /// Whether a provider may be dispatched to: not failed, or failed with
    /// an elapsed cooldown.
    pub fn is_available(&self, provider: &str) -> bool {
        match self.statuses.get(provider) {
            Some(status) => !status.is_failed || status.cooldown_expired(),
            None => false,
        }
    }

    /// Pick a provider other than `failed_provider` that is currently
    /// available. Never-failed providers are preferred over ones whose
    /// cooldown just expired; using a recovered provider clears its failed
    /// flag.
    pub fn next_provider(&self, failed_provider: &str) -> Option<String> {
        let order = self.order.lock().unwrap().clone();

        for name in &order {
            if name == failed_provider {
                continue;
            }
            if let Some(status) = self.statuses.get(name) {
                if !status.is_failed {
                    return Some(name.clone());
                }
            }
        }

        for name in &order {
            if name == failed_provider {
                continue;
            }
            if let Some(mut status) = self.statuses.get_mut(name) {
                if status.is_failed && status.cooldown_expired() {
                    status.is_failed = false;
                    tracing::info!(provider = %name, "provider rejoining pool after cooldown");
                    return Some(name.clone());
                }
            }
        }

        None
    }

    /// All providers currently available per [`FailoverManager::is_available`].
    pub fn available_providers(&self) -> Vec<String> {
        self.order
            .lock()
            .unwrap()
            .iter()
            .filter(|name| self.is_available(name))
            .cloned()
            .collect()
    }

    /// Clear all failed flags and failure counts.
    pub fn reset(&self) {
        for mut entry in self.statuses.iter_mut() {
            entry.is_failed = false;
            entry.fail_time = None;
            entry.failure_count = 0;
        }
    }

    /// Serializable snapshot for the ops surface.
    pub fn statistics(&self) -> FailoverStatistics {
        let order = self.order.lock().unwrap().clone();
        let mut providers = Vec::with_capacity(order.len());
        let mut total_failures = 0u64;

        for name in order {
            if let Some(status) = self.statuses.get(&name) {
                total_failures += u64::from(status.failure_count);
                providers.push(ProviderFailoverStats {
                    name,
                    is_failed: status.is_failed,
                    failure_count: status.failure_count,
                    cooldown_remaining_secs: status.cooldown_remaining().map(|d| d.as_secs()),
                });
            }
        }

        FailoverStatistics {
            providers,
            total_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(names: &[&str]) -> FailoverManager {
        FailoverManager::new(&names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn fresh_providers_are_available() {
        let failover = manager(&["cerebras", "zai"]);
        assert!(failover.is_available("cerebras"));
        assert!(failover.is_available("zai"));
        assert!(!failover.is_available("unknown"));
    }

    #[test]
    fn failed_provider_is_skipped_until_cooldown() {
        let failover = manager(&["cerebras", "zai"]);
        failover.mark_failed("cerebras", 5);

        assert!(!failover.is_available("cerebras"));
        assert_eq!(failover.next_provider("cerebras").as_deref(), Some("zai"));
    }

    #[test]
    fn cooldown_expiry_restores_availability() {
        let failover = manager(&["cerebras"]);
        failover.mark_failed_for("cerebras", Duration::from_millis(10));
        assert!(!failover.is_available("cerebras"));

        std::thread::sleep(Duration::from_millis(20));
        assert!(failover.is_available("cerebras"));
    }

    #[test]
    fn next_provider_prefers_never_failed_over_recovered() {
        let failover = manager(&["a", "b", "c"]);
        failover.mark_failed_for("b", Duration::from_millis(0));
        // b's cooldown is already over, but c never failed at all.
        assert_eq!(failover.next_provider("a").as_deref(), Some("c"));
    }

    #[test]
    fn recovered_provider_is_cleared_on_first_use() {
        let failover = manager(&["a", "b"]);
        failover.mark_failed_for("b", Duration::from_millis(0));

        assert_eq!(failover.next_provider("a").as_deref(), Some("b"));
        let stats = failover.statistics();
        let b = stats.providers.iter().find(|p| p.name == "b").unwrap();
        assert!(!b.is_failed);
        assert_eq!(b.failure_count, 1);
    }

    #[test]
    fn no_candidate_when_everything_failed() {
        let failover = manager(&["a", "b"]);
        failover.mark_failed("a", 5);
        failover.mark_failed("b", 5);
        assert_eq!(failover.next_provider("a"), None);
    }

    #[test]
    fn mark_healthy_decays_failure_count() {
        let failover = manager(&["a"]);
        failover.mark_failed("a", 5);
        failover.mark_failed("a", 5);
        failover.mark_healthy("a");

        let stats = failover.statistics();
        assert_eq!(stats.providers[0].failure_count, 1);
        assert!(!stats.providers[0].is_failed);

        failover.mark_healthy("a");
        failover.mark_healthy("a");
        assert_eq!(failover.statistics().providers[0].failure_count, 0);
    }

    #[test]
    fn reset_clears_all_state() {
        let failover = manager(&["a", "b"]);
        failover.mark_failed("a", 5);
        failover.mark_failed("b", 5);
        failover.reset();

        assert!(failover.is_available("a"));
        assert!(failover.is_available("b"));
        assert_eq!(failover.statistics().total_failures, 0);
    }

    #[test]
    fn unregister_removes_from_scans() {
        let failover = manager(&["a", "b"]);
        failover.unregister("b");
        assert_eq!(failover.next_provider("a"), None);
        assert_eq!(failover.available_providers(), vec!["a".to_string()]);
    }
}
