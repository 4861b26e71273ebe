//! # Load Balancing Strategies
//!
//! A [`LoadBalancer`] breaks ties between equally eligible providers. Six
//! strategies coexist behind one `Strategy` enum; exactly one is active at a
//! time and can be swapped at runtime.
//!
//! The balancer keeps its own lightweight per-provider view (running-mean
//! latency, current connections, total requests), fed by the gateway after
//! every dispatch. The round-robin cursor is a lone atomic; everything else
//! sits behind a single mutex, so selection is cheap and never blocks the
//! dispatch path for long.

use crate::routing::RequestType;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

/// Default weight for providers without a latency sample yet.
const DEFAULT_WEIGHT: f64 = 1000.0;

/// Available selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    /// Monotonic counter modulo candidate count
    RoundRobin,
    /// Sample proportional to `1000 / avg_latency`
    Weighted,
    /// Fewest in-flight connections, latency tie-break
    LeastConnections,
    /// Lowest sampled latency; unsampled providers first
    FastestResponse,
    /// Composite of latency and remaining capacity
    Adaptive,
    /// Uniform random
    Random,
}

impl Strategy {
    pub fn name(self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::Weighted => "weighted",
            Strategy::LeastConnections => "least_connections",
            Strategy::FastestResponse => "fastest_response",
            Strategy::Adaptive => "adaptive",
            Strategy::Random => "random",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct BalancerMetrics {
    avg_response_time_ms: f64,
    response_time_sum: f64,
    total_requests: u64,
    current_connections: u32,
}

/// Per-provider snapshot exposed by [`LoadBalancer::statistics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerProviderStats {
    pub name: String,
    pub avg_response_time_ms: f64,
    pub current_connections: u32,
    pub total_requests: u64,
}

/// Snapshot of the balancer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerStatistics {
    pub strategy: Strategy,
    pub providers: Vec<BalancerProviderStats>,
}

/// Strategy-based provider selection with internal performance tracking.
pub struct LoadBalancer {
    strategy: RwLock<Strategy>,
    round_robin_index: AtomicUsize,
    metrics: Mutex<HashMap<String, BalancerMetrics>>,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy: RwLock::new(strategy),
            round_robin_index: AtomicUsize::new(0),
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn strategy(&self) -> Strategy {
        *self.strategy.read().unwrap()
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.write().unwrap() = strategy;
    }

    /// Pick one provider from `candidates`. Returns `None` only for an empty
    /// slice. `request_type` is available for context-aware strategies.
    pub fn select_provider(
        &self,
        candidates: &[String],
        _request_type: RequestType,
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        {
            let mut metrics = self.metrics.lock().unwrap();
            for provider in candidates {
                metrics.entry(provider.clone()).or_default();
            }
        }

        let selected = match self.strategy() {
            Strategy::RoundRobin => self.select_round_robin(candidates),
            Strategy::Weighted => self.select_weighted(candidates),
            Strategy::LeastConnections => self.select_least_connections(candidates),
            Strategy::FastestResponse => self.select_fastest_response(candidates),
            Strategy::Adaptive => self.select_adaptive(candidates),
            Strategy::Random => self.select_random(candidates),
        };

        Some(selected)
    }

    /// Fold a completed request's latency into the provider's running mean.
    pub fn update_response_time(&self, provider: &str, response_time_ms: f64) {
        let mut metrics = self.metrics.lock().unwrap();
        let entry = metrics.entry(provider.to_string()).or_default();
        entry.total_requests += 1;
        entry.response_time_sum += response_time_ms;
        entry.avg_response_time_ms = entry.response_time_sum / entry.total_requests as f64;
    }

    /// Record the provider's current number of in-flight requests.
    pub fn update_connections(&self, provider: &str, connections: u32) {
        let mut metrics = self.metrics.lock().unwrap();
        metrics
            .entry(provider.to_string())
            .or_default()
            .current_connections = connections;
    }

    /// Drop a provider's tracked state.
    pub fn remove_provider(&self, provider: &str) {
        self.metrics.lock().unwrap().remove(provider);
    }

    pub fn statistics(&self) -> BalancerStatistics {
        let metrics = self.metrics.lock().unwrap();
        let mut providers: Vec<BalancerProviderStats> = metrics
            .iter()
            .map(|(name, m)| BalancerProviderStats {
                name: name.clone(),
                avg_response_time_ms: m.avg_response_time_ms,
                current_connections: m.current_connections,
                total_requests: m.total_requests,
            })
            .collect();
        providers.sort_by(|a, b| a.name.cmp(&b.name));

        BalancerStatistics {
            strategy: self.strategy(),
            providers,
        }
    }

    fn select_round_robin(&self, candidates: &[String]) -> String {
        let index = self.round_robin_index.fetch_add(1, Ordering::SeqCst);
        candidates[index % candidates.len()].clone()
    }

    fn select_weighted(&self, candidates: &[String]) -> String {
        let metrics = self.metrics.lock().unwrap();
        let weights: Vec<f64> = candidates
            .iter()
            .map(|provider| {
                let avg = metrics
                    .get(provider)
                    .map(|m| m.avg_response_time_ms)
                    .unwrap_or(0.0);
                if avg > 0.0 {
                    DEFAULT_WEIGHT / avg
                } else {
                    DEFAULT_WEIGHT
                }
            })
            .collect();
        drop(metrics);

        let total: f64 = weights.iter().sum();
        let mut roll = rand::thread_rng().gen_range(0.0..total);
        for (provider, weight) in candidates.iter().zip(&weights) {
            if roll < *weight {
                return provider.clone();
            }
            roll -= weight;
        }
        candidates[candidates.len() - 1].clone()
    }

    fn select_least_connections(&self, candidates: &[String]) -> String {
        let metrics = self.metrics.lock().unwrap();
        candidates
            .iter()
            .min_by(|a, b| {
                let (ac, al) = metrics
                    .get(*a)
                    .map(|m| (m.current_connections, m.avg_response_time_ms))
                    .unwrap_or((0, 0.0));
                let (bc, bl) = metrics
                    .get(*b)
                    .map(|m| (m.current_connections, m.avg_response_time_ms))
                    .unwrap_or((0, 0.0));
                ac.cmp(&bc).then(al.total_cmp(&bl))
            })
            .expect("candidates is non-empty")
            .clone()
    }

    fn select_fastest_response(&self, candidates: &[String]) -> String {
        let metrics = self.metrics.lock().unwrap();

        // A provider with no samples gets the benefit of the doubt.
        if let Some(unsampled) = candidates.iter().find(|provider| {
            metrics
                .get(*provider)
                .map(|m| m.total_requests == 0)
                .unwrap_or(true)
        }) {
            return unsampled.clone();
        }

        candidates
            .iter()
            .min_by(|a, b| {
                let al = metrics.get(*a).map(|m| m.avg_response_time_ms).unwrap_or(f64::MAX);
                let bl = metrics.get(*b).map(|m| m.avg_response_time_ms).unwrap_or(f64::MAX);
                al.total_cmp(&bl)
            })
            .expect("candidates is non-empty")
            .clone()
    }

    fn select_adaptive(&self, candidates: &[String]) -> String {
        let metrics = self.metrics.lock().unwrap();
        let mut scored: Vec<(&String, f64, u64)> = candidates
            .iter()
            .map(|provider| {
                let m = metrics.get(provider).cloned().unwrap_or_default();
                let latency_score = if m.avg_response_time_ms > 0.0 {
                    100.0 / m.avg_response_time_ms
                } else {
                    100.0
                };
                // Capacity term normalized to [0,1] so latency dominates.
                let capacity_score = f64::from(10u32.saturating_sub(m.current_connections)) / 10.0;
                let score = 0.7 * latency_score + 0.3 * capacity_score;
                (provider, score, m.total_requests)
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.2.cmp(&b.2)));
        scored[0].0.clone()
    }

    fn select_random(&self, candidates: &[String]) -> String {
        let index = rand::thread_rng().gen_range(0..candidates.len());
        candidates[index].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn round_robin_distributes_evenly() {
        let balancer = LoadBalancer::new(Strategy::RoundRobin);
        let candidates = names(&["a", "b", "c"]);

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..300 {
            let pick = balancer
                .select_provider(&candidates, RequestType::Standard)
                .unwrap();
            *counts.entry(pick).or_insert(0) += 1;
        }

        assert_eq!(counts["a"], 100);
        assert_eq!(counts["b"], 100);
        assert_eq!(counts["c"], 100);
    }

    #[test]
    fn round_robin_counter_is_stable_across_calls() {
        let balancer = LoadBalancer::new(Strategy::RoundRobin);
        let candidates = names(&["a", "b"]);
        let first = balancer
            .select_provider(&candidates, RequestType::Standard)
            .unwrap();
        let second = balancer
            .select_provider(&candidates, RequestType::Standard)
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn least_connections_prefers_idle_with_latency_tiebreak() {
        let balancer = LoadBalancer::new(Strategy::LeastConnections);
        let candidates = names(&["busy", "idle-slow", "idle-fast"]);
        balancer.update_connections("busy", 8);
        balancer.update_connections("idle-slow", 1);
        balancer.update_connections("idle-fast", 1);
        balancer.update_response_time("idle-slow", 900.0);
        balancer.update_response_time("idle-fast", 100.0);

        let pick = balancer
            .select_provider(&candidates, RequestType::Standard)
            .unwrap();
        assert_eq!(pick, "idle-fast");
    }

    #[test]
    fn fastest_response_prefers_unsampled_then_lowest_latency() {
        let balancer = LoadBalancer::new(Strategy::FastestResponse);
        let candidates = names(&["sampled", "fresh"]);
        balancer.update_response_time("sampled", 50.0);

        let pick = balancer
            .select_provider(&candidates, RequestType::Standard)
            .unwrap();
        assert_eq!(pick, "fresh");

        balancer.update_response_time("fresh", 400.0);
        let pick = balancer
            .select_provider(&candidates, RequestType::Standard)
            .unwrap();
        assert_eq!(pick, "sampled");
    }

    #[test]
    fn adaptive_latency_term_dominates_capacity() {
        let balancer = LoadBalancer::new(Strategy::Adaptive);
        let candidates = names(&["fast", "slow"]);
        balancer.update_response_time("fast", 50.0);
        balancer.update_connections("fast", 9);
        balancer.update_response_time("slow", 400.0);
        balancer.update_connections("slow", 0);

        let pick = balancer
            .select_provider(&candidates, RequestType::Standard)
            .unwrap();
        assert_eq!(pick, "fast");

        // Freeing up the fast provider must not change the outcome.
        balancer.update_connections("fast", 0);
        let pick = balancer
            .select_provider(&candidates, RequestType::Standard)
            .unwrap();
        assert_eq!(pick, "fast");
    }

    #[test]
    fn adaptive_ties_break_toward_fewer_requests() {
        let balancer = LoadBalancer::new(Strategy::Adaptive);
        let candidates = names(&["veteran", "rookie"]);
        // Same latency and connections, different request totals.
        for _ in 0..5 {
            balancer.update_response_time("veteran", 100.0);
        }
        balancer.update_response_time("rookie", 100.0);

        let pick = balancer
            .select_provider(&candidates, RequestType::Standard)
            .unwrap();
        assert_eq!(pick, "rookie");
    }

    #[test]
    fn weighted_always_returns_a_candidate() {
        let balancer = LoadBalancer::new(Strategy::Weighted);
        let candidates = names(&["a", "b"]);
        balancer.update_response_time("a", 100.0);
        balancer.update_response_time("b", 1000.0);

        for _ in 0..50 {
            let pick = balancer
                .select_provider(&candidates, RequestType::Standard)
                .unwrap();
            assert!(candidates.contains(&pick));
        }
    }

    #[test]
    fn random_covers_candidates() {
        let balancer = LoadBalancer::new(Strategy::Random);
        let candidates = names(&["a", "b", "c"]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(
                balancer
                    .select_provider(&candidates, RequestType::Standard)
                    .unwrap(),
            );
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn empty_candidates_yield_none() {
        let balancer = LoadBalancer::new(Strategy::RoundRobin);
        assert!(balancer
            .select_provider(&[], RequestType::Standard)
            .is_none());
    }

    #[test]
    fn running_mean_is_exact() {
        let balancer = LoadBalancer::new(Strategy::FastestResponse);
        balancer.update_response_time("a", 100.0);
        balancer.update_response_time("a", 300.0);

        let stats = balancer.statistics();
        let a = stats.providers.iter().find(|p| p.name == "a").unwrap();
        assert!((a.avg_response_time_ms - 200.0).abs() < 1e-9);
        assert_eq!(a.total_requests, 2);
    }

    #[test]
    fn strategy_can_be_swapped_at_runtime() {
        let balancer = LoadBalancer::new(Strategy::Random);
        balancer.set_strategy(Strategy::RoundRobin);
        assert_eq!(balancer.strategy(), Strategy::RoundRobin);
        assert_eq!(balancer.statistics().strategy, Strategy::RoundRobin);
    }
}
