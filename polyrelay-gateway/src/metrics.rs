//! # Request Metric Log
//!
//! A thread-safe bounded ring of per-request records plus aggregate
//! snapshots (per-provider latency percentiles, success rates, failover
//! count). Recording is best-effort bookkeeping: nothing in here ever
//! affects the response returned to a caller.

use crate::routing::RequestType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Maximum records retained in the ring.
pub const MAX_METRICS_HISTORY: usize = 10_000;

/// One completed (or synthesized-failure) dispatch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetric {
    /// Provider dispatched to; empty when no candidate was available
    pub provider_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub success: bool,
    pub http_status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub request_tokens: u32,
    pub response_tokens: u32,
    pub cost_usd: f64,
    pub request_type: RequestType,
    pub routing_reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Aggregate view over the records currently in the ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Records observed over the log's lifetime, including evicted ones
    pub total_requests: u64,
    /// Records currently held in the ring
    pub recorded_requests: usize,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub failover_count: u64,
    pub total_cost_usd: f64,
    pub providers: HashMap<String, ProviderSummary>,
}

/// Per-provider aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSummary {
    pub requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Default)]
struct MetricLogInner {
    records: VecDeque<RequestMetric>,
    total_recorded: u64,
    failover_count: u64,
}

/// Bounded ring of [`RequestMetric`] records.
pub struct MetricLog {
    inner: Mutex<MetricLogInner>,
    capacity: usize,
}

impl Default for MetricLog {
    fn default() -> Self {
        Self::new(MAX_METRICS_HISTORY)
    }
}

impl MetricLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(MetricLogInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Append one record, evicting the oldest when full.
    pub fn record(&self, metric: RequestMetric) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_recorded += 1;
        inner.records.push_back(metric);
        while inner.records.len() > self.capacity {
            inner.records.pop_front();
        }
    }

    /// Count one failover hop (an attempt routed to an alternative after a
    /// failure).
    pub fn record_failover(&self) {
        self.inner.lock().unwrap().failover_count += 1;
    }

    /// The most recent `count` records, newest first.
    pub fn recent(&self, count: usize) -> Vec<RequestMetric> {
        let inner = self.inner.lock().unwrap();
        inner.records.iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.records.clear();
        inner.failover_count = 0;
        inner.total_recorded = 0;
    }

    /// Aggregate snapshot over the retained records.
    pub fn summary(&self) -> MetricsSummary {
        let inner = self.inner.lock().unwrap();
        let recorded = inner.records.len();

        if recorded == 0 {
            return MetricsSummary {
                total_requests: inner.total_recorded,
                recorded_requests: 0,
                success_rate: 1.0,
                average_latency_ms: 0.0,
                failover_count: inner.failover_count,
                total_cost_usd: 0.0,
                providers: HashMap::new(),
            };
        }

        let successes = inner.records.iter().filter(|r| r.success).count();
        let average_latency_ms =
            inner.records.iter().map(|r| r.duration_ms).sum::<f64>() / recorded as f64;
        let total_cost_usd = inner.records.iter().map(|r| r.cost_usd).sum::<f64>();

        let mut by_provider: HashMap<String, Vec<&RequestMetric>> = HashMap::new();
        for record in &inner.records {
            if record.provider_name.is_empty() {
                continue;
            }
            by_provider
                .entry(record.provider_name.clone())
                .or_default()
                .push(record);
        }

        let providers = by_provider
            .into_iter()
            .map(|(name, records)| {
                let requests = records.len() as u64;
                let successful = records.iter().filter(|r| r.success).count() as u64;
                let average =
                    records.iter().map(|r| r.duration_ms).sum::<f64>() / requests as f64;
                let cost = records.iter().map(|r| r.cost_usd).sum::<f64>();

                let mut latencies: Vec<f64> = records.iter().map(|r| r.duration_ms).collect();
                latencies.sort_by(f64::total_cmp);

                (
                    name,
                    ProviderSummary {
                        requests,
                        successful_requests: successful,
                        failed_requests: requests - successful,
                        average_latency_ms: average,
                        p50_latency_ms: percentile(&latencies, 0.50),
                        p95_latency_ms: percentile(&latencies, 0.95),
                        p99_latency_ms: percentile(&latencies, 0.99),
                        total_cost_usd: cost,
                    },
                )
            })
            .collect();

        MetricsSummary {
            total_requests: inner.total_recorded,
            recorded_requests: recorded,
            success_rate: successes as f64 / recorded as f64,
            average_latency_ms,
            failover_count: inner.failover_count,
            total_cost_usd,
            providers,
        }
    }
}

fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * quantile) as usize).min(sorted.len() - 1);
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(provider: &str, success: bool, duration_ms: f64) -> RequestMetric {
        let now = Utc::now();
        RequestMetric {
            provider_name: provider.to_string(),
            started_at: now,
            completed_at: now,
            duration_ms,
            success,
            http_status_code: if success { 200 } else { 502 },
            error_message: (!success).then(|| "upstream failure".to_string()),
            request_tokens: 100,
            response_tokens: 50,
            cost_usd: 0.001,
            request_type: RequestType::Standard,
            routing_reasoning: "test".to_string(),
            correlation_id: None,
        }
    }

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let log = MetricLog::new(3);
        for i in 0..5 {
            log.record(metric(&format!("p{i}"), true, 10.0));
        }
        assert_eq!(log.len(), 3);

        let recent = log.recent(10);
        let names: Vec<&str> = recent.iter().map(|m| m.provider_name.as_str()).collect();
        assert_eq!(names, vec!["p4", "p3", "p2"]);
        assert_eq!(log.summary().total_requests, 5);
    }

    #[test]
    fn recent_is_reverse_chronological_and_bounded() {
        let log = MetricLog::new(100);
        for i in 0..10 {
            log.record(metric("p", true, i as f64));
        }

        let recent = log.recent(4);
        assert_eq!(recent.len(), 4);
        for window in recent.windows(2) {
            assert!(window[0].completed_at >= window[1].completed_at);
        }
        assert_eq!(recent[0].duration_ms, 9.0);
    }

    #[test]
    fn summary_aggregates_per_provider() {
        let log = MetricLog::default();
        for _ in 0..8 {
            log.record(metric("cerebras", true, 100.0));
        }
        log.record(metric("cerebras", false, 400.0));
        log.record(metric("zai", true, 900.0));
        log.record_failover();

        let summary = log.summary();
        assert_eq!(summary.recorded_requests, 10);
        assert!((summary.success_rate - 0.9).abs() < 1e-9);
        assert_eq!(summary.failover_count, 1);

        let cerebras = &summary.providers["cerebras"];
        assert_eq!(cerebras.requests, 9);
        assert_eq!(cerebras.failed_requests, 1);
        assert_eq!(cerebras.p50_latency_ms, 100.0);
        assert_eq!(cerebras.p99_latency_ms, 400.0);

        let zai = &summary.providers["zai"];
        assert_eq!(zai.requests, 1);
        assert_eq!(zai.average_latency_ms, 900.0);
    }

    #[test]
    fn empty_log_summary_is_benign() {
        let log = MetricLog::default();
        let summary = log.summary();
        assert_eq!(summary.recorded_requests, 0);
        assert_eq!(summary.success_rate, 1.0);
        assert!(summary.providers.is_empty());
    }

    #[test]
    fn clear_resets_everything() {
        let log = MetricLog::default();
        log.record(metric("p", true, 10.0));
        log.record_failover();
        log.clear();

        assert!(log.is_empty());
        let summary = log.summary();
        assert_eq!(summary.total_requests, 0);
        assert_eq!(summary.failover_count, 0);
    }

    #[test]
    fn records_without_provider_are_counted_globally_only() {
        let log = MetricLog::default();
        log.record(metric("", false, 0.0));

        let summary = log.summary();
        assert_eq!(summary.recorded_requests, 1);
        assert!(summary.providers.is_empty());
    }
}
