//! # Provider Health Monitoring
//!
//! Per-provider health state machines, performance metrics, and the
//! background monitor that drives periodic probes and circuit-breaker
//! recovery.
//!
//! ## Overview
//!
//! Every provider known to the gateway owns one [`ProviderHealth`] record:
//! a four-state machine (`Healthy`, `Degraded`, `Unhealthy`, `CircuitOpen`)
//! plus [`PerformanceMetrics`] and the circuit-breaker counters. Records are
//! shared between the request path (which reports dispatch outcomes) and the
//! [`ProviderHealthMonitor`] loop (which runs probes and recovery checks),
//! so scalar fields are atomics and composite transitions are serialized per
//! record.
//!
//! ## State machine
//!
//! - Consecutive failures at or above the provider's threshold open the
//!   circuit; the open timestamp starts the `failure_timeout` clock.
//! - While the circuit is open, [`ProviderHealth::can_accept_requests`]
//!   returns `false` until `failure_timeout` elapses. After that a request
//!   is admitted as a probe; `required_probes` consecutive successes close
//!   the circuit.
//! - Two consecutive failures short of the threshold park the provider in
//!   `Unhealthy`; one success returns it to `Healthy`.
//!
//! ## Monitoring loop
//!
//! One cooperative tokio task serves every provider. Each tick it probes the
//! providers whose check interval has elapsed (single-flight per provider,
//! guarded by `health_check_in_progress`) and re-examines open circuits.
//! State transitions are delivered, in per-provider order, to an optional
//! health-change callback; callback panics are contained and logged.

use crate::config::ProviderSettings;
use polyrelay_core::Response;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Smoothing factor for the response-time EMA.
const RESPONSE_TIME_ALPHA: f64 = 0.1;
/// Smoothing factor for the success-rate EMA.
const SUCCESS_RATE_ALPHA: f64 = 0.05;
/// Additive error-rate step per failure.
const ERROR_RATE_STEP: f64 = 0.1;
/// Error-rate decay per success.
const ERROR_RATE_DECAY: f64 = 0.05;
/// Cost ceiling in dollars per million tokens; total costs at or above this
/// score 0.0.
const COST_CEILING: f64 = 20.0;

/// Default pause between monitor ticks.
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);
/// How long `stop_monitoring` waits for the loop to drain.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Health state of a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HealthStatus {
    /// Fully functional
    Healthy = 0,
    /// Slow but working
    Degraded = 1,
    /// Failing
    Unhealthy = 2,
    /// Temporarily excluded by the circuit breaker
    CircuitOpen = 3,
}

impl HealthStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Degraded,
            2 => HealthStatus::Unhealthy,
            _ => HealthStatus::CircuitOpen,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::CircuitOpen => "circuit_open",
        };
        f.write_str(s)
    }
}

/// Bitset of provider capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    pub const NONE: CapabilitySet = CapabilitySet(0);
    pub const THINKING: CapabilitySet = CapabilitySet(1 << 0);
    pub const VISION: CapabilitySet = CapabilitySet(1 << 1);
    pub const TOOLS: CapabilitySet = CapabilitySet(1 << 2);
    pub const STREAMING: CapabilitySet = CapabilitySet(1 << 3);
    pub const JSON_MODE: CapabilitySet = CapabilitySet(1 << 4);
    pub const FUNCTION_CALLING: CapabilitySet = CapabilitySet(1 << 5);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        CapabilitySet(bits & 0x3f)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `required` is present in `self`.
    pub fn contains(self, required: CapabilitySet) -> bool {
        self.0 & required.0 == required.0
    }

    /// Whether at least one bit of `other` is present in `self`.
    pub fn intersects(self, other: CapabilitySet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, capability: CapabilitySet) {
        self.0 |= capability.0;
    }

    pub fn remove(&mut self, capability: CapabilitySet) {
        self.0 &= !capability.0;
    }

    /// Capability names, in flag order.
    pub fn names(self) -> Vec<&'static str> {
        const TABLE: [(CapabilitySet, &str); 6] = [
            (CapabilitySet::THINKING, "thinking"),
            (CapabilitySet::VISION, "vision"),
            (CapabilitySet::TOOLS, "tools"),
            (CapabilitySet::STREAMING, "streaming"),
            (CapabilitySet::JSON_MODE, "json_mode"),
            (CapabilitySet::FUNCTION_CALLING, "function_calling"),
        ];
        TABLE
            .iter()
            .filter(|(cap, _)| self.contains(*cap))
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn from_name(name: &str) -> Option<CapabilitySet> {
        match name {
            "thinking" => Some(CapabilitySet::THINKING),
            "vision" => Some(CapabilitySet::VISION),
            "tools" => Some(CapabilitySet::TOOLS),
            "streaming" => Some(CapabilitySet::STREAMING),
            "json_mode" => Some(CapabilitySet::JSON_MODE),
            "function_calling" => Some(CapabilitySet::FUNCTION_CALLING),
            _ => None,
        }
    }
}

impl std::ops::BitOr for CapabilitySet {
    type Output = CapabilitySet;

    fn bitor(self, rhs: CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0 | rhs.0)
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let mut set = CapabilitySet::NONE;
        for name in names {
            match CapabilitySet::from_name(&name) {
                Some(cap) => set.insert(cap),
                None => {
                    return Err(serde::de::Error::custom(format!(
                        "unknown capability: {name}"
                    )))
                }
            }
        }
        Ok(set)
    }
}

/// Rolling performance statistics for one provider.
#[derive(Debug, Clone)]
pub struct PerformanceMetrics {
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub requests_per_minute: u32,
    pub max_requests_per_minute: u32,
    pub cost_per_input_token: f64,
    pub cost_per_output_token: f64,
    pub cost_score: f64,
    pub performance_score: f64,
    pub last_request_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
    pub last_error_time: Option<Instant>,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            avg_response_time_ms: 0.0,
            success_rate: 1.0,
            error_rate: 0.0,
            requests_per_minute: 0,
            max_requests_per_minute: 60,
            cost_per_input_token: 0.0,
            cost_per_output_token: 0.0,
            cost_score: 1.0,
            performance_score: 1.0,
            last_request_time: None,
            last_success_time: None,
            last_error_time: None,
        }
    }
}

impl PerformanceMetrics {
    /// Fold one observed latency into the EMA. The first sample initializes
    /// the average.
    pub fn update_response_time(&mut self, response_time_ms: f64) {
        if self.avg_response_time_ms == 0.0 {
            self.avg_response_time_ms = response_time_ms;
        } else {
            self.avg_response_time_ms = RESPONSE_TIME_ALPHA * response_time_ms
                + (1.0 - RESPONSE_TIME_ALPHA) * self.avg_response_time_ms;
        }
        self.last_request_time = Some(Instant::now());
    }

    /// Fold one outcome into the success-rate EMA. Successes also decay the
    /// additive error rate.
    pub fn update_success(&mut self, success: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate =
            SUCCESS_RATE_ALPHA * sample + (1.0 - SUCCESS_RATE_ALPHA) * self.success_rate;
        self.success_rate = self.success_rate.clamp(0.0, 1.0);

        if success {
            self.last_success_time = Some(Instant::now());
            self.error_rate = (self.error_rate - ERROR_RATE_DECAY).max(0.0);
        }
    }

    /// Record an error: bump the error rate and pull the success rate down.
    pub fn update_error(&mut self) {
        self.last_error_time = Some(Instant::now());
        self.error_rate = (self.error_rate + ERROR_RATE_STEP).min(1.0);
        self.success_rate = (self.success_rate - ERROR_RATE_STEP).max(0.0);
    }

    /// Recompute the derived scores from the current raw values.
    ///
    /// `performance_score = 0.6·success_rate + 0.4·max(0, (5000 − latency) / 4000)`
    /// and `cost_score = max(0, 1 − total_cost / 20)` with costs in dollars
    /// per million tokens.
    pub fn recalculate_scores(&mut self) {
        let response_score = ((5000.0 - self.avg_response_time_ms) / 4000.0).clamp(0.0, 1.0);
        self.performance_score = 0.6 * self.success_rate + 0.4 * response_score;

        let total_cost = self.cost_per_input_token + self.cost_per_output_token;
        self.cost_score = (1.0 - total_cost / COST_CEILING).max(0.0);
    }

    /// Serializable view of the rolling statistics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            avg_response_time_ms: self.avg_response_time_ms,
            success_rate: self.success_rate,
            error_rate: self.error_rate,
            requests_per_minute: self.requests_per_minute,
            max_requests_per_minute: self.max_requests_per_minute,
            cost_per_input_token: self.cost_per_input_token,
            cost_per_output_token: self.cost_per_output_token,
            cost_score: self.cost_score,
            performance_score: self.performance_score,
            seconds_since_last_success: self.last_success_time.map(|t| t.elapsed().as_secs()),
            seconds_since_last_error: self.last_error_time.map(|t| t.elapsed().as_secs()),
        }
    }

    /// Rebuild metrics from a serialized snapshot. The monotonic timestamps
    /// cannot be restored and start out unset.
    pub fn from_snapshot(snapshot: &MetricsSnapshot) -> Self {
        Self {
            avg_response_time_ms: snapshot.avg_response_time_ms,
            success_rate: snapshot.success_rate,
            error_rate: snapshot.error_rate,
            requests_per_minute: snapshot.requests_per_minute,
            max_requests_per_minute: snapshot.max_requests_per_minute,
            cost_per_input_token: snapshot.cost_per_input_token,
            cost_per_output_token: snapshot.cost_per_output_token,
            cost_score: snapshot.cost_score,
            performance_score: snapshot.performance_score,
            last_request_time: None,
            last_success_time: None,
            last_error_time: None,
        }
    }
}

/// Serializable form of [`PerformanceMetrics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub requests_per_minute: u32,
    pub max_requests_per_minute: u32,
    pub cost_per_input_token: f64,
    pub cost_per_output_token: f64,
    pub cost_score: f64,
    pub performance_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_since_last_success: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_since_last_error: Option<u64>,
}

/// Serializable form of a whole health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub provider_name: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
    pub successful_probes: u32,
    pub required_probes: u32,
    pub health_check_in_progress: bool,
    pub capabilities: CapabilitySet,
    pub metrics: MetricsSnapshot,
    /// Seconds until a circuit-open provider admits a probe; zero when
    /// requests are already accepted
    pub retry_delay_secs: u64,
}

/// A state transition observed on one record.
pub type HealthTransition = (HealthStatus, HealthStatus);

/// Health record for one provider.
///
/// Scalar fields are atomics; state transitions take the internal transition
/// lock so concurrent failure reports cannot interleave half-applied
/// updates.
pub struct ProviderHealth {
    provider_name: String,
    status: AtomicU8,
    capability_flags: AtomicU32,
    priority_score: AtomicI32,
    metrics: Mutex<PerformanceMetrics>,

    consecutive_failures: AtomicU32,
    max_consecutive_failures: AtomicU32,
    failure_timeout: Mutex<Duration>,
    circuit_open_time: Mutex<Option<Instant>>,

    health_check_interval: Mutex<Duration>,
    last_health_check: Mutex<Instant>,
    health_check_in_progress: AtomicBool,

    successful_probes: AtomicU32,
    required_probes: AtomicU32,

    // Serializes composite state-machine updates.
    transition: Mutex<()>,
}

impl ProviderHealth {
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            status: AtomicU8::new(HealthStatus::Healthy as u8),
            capability_flags: AtomicU32::new(0),
            priority_score: AtomicI32::new(100),
            metrics: Mutex::new(PerformanceMetrics::default()),
            consecutive_failures: AtomicU32::new(0),
            max_consecutive_failures: AtomicU32::new(5),
            failure_timeout: Mutex::new(Duration::from_secs(300)),
            circuit_open_time: Mutex::new(None),
            health_check_interval: Mutex::new(Duration::from_secs(60)),
            last_health_check: Mutex::new(Instant::now()),
            health_check_in_progress: AtomicBool::new(false),
            successful_probes: AtomicU32::new(0),
            required_probes: AtomicU32::new(3),
            transition: Mutex::new(()),
        }
    }

    /// Build a record seeded from provider settings.
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let health = Self::new(settings.name.clone());
        health.configure(settings);
        health
    }

    /// Apply (or re-apply) configuration without resetting runtime state.
    pub fn configure(&self, settings: &ProviderSettings) {
        self.capability_flags
            .store(settings.capabilities().bits(), Ordering::SeqCst);
        self.priority_score
            .store(settings.priority_score, Ordering::SeqCst);
        self.max_consecutive_failures
            .store(settings.max_failures, Ordering::SeqCst);
        self.required_probes
            .store(settings.required_probes, Ordering::SeqCst);
        *self.failure_timeout.lock().unwrap() = settings.failure_timeout;
        *self.health_check_interval.lock().unwrap() = settings.health_check_interval;

        let mut metrics = self.metrics.lock().unwrap();
        metrics.cost_per_input_token = settings.cost_per_input_token;
        metrics.cost_per_output_token = settings.cost_per_output_token;
        metrics.max_requests_per_minute = settings.max_requests_per_minute;
        if metrics.last_request_time.is_none() {
            metrics.avg_response_time_ms = settings.avg_response_time_ms;
            metrics.success_rate = settings.success_rate;
        }
        metrics.recalculate_scores();
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn priority_score(&self) -> i32 {
        self.priority_score.load(Ordering::SeqCst)
    }

    pub fn set_max_consecutive_failures(&self, threshold: u32) {
        self.max_consecutive_failures.store(threshold, Ordering::SeqCst);
    }

    pub fn set_required_probes(&self, probes: u32) {
        self.required_probes.store(probes.max(1), Ordering::SeqCst);
    }

    pub fn set_failure_timeout(&self, timeout: Duration) {
        *self.failure_timeout.lock().unwrap() = timeout;
    }

    pub fn has_capability(&self, capability: CapabilitySet) -> bool {
        self.capabilities().contains(capability)
    }

    pub fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::from_bits(self.capability_flags.load(Ordering::SeqCst))
    }

    pub fn set_capability(&self, capability: CapabilitySet, enabled: bool) {
        let mut set = self.capabilities();
        if enabled {
            set.insert(capability);
        } else {
            set.remove(capability);
        }
        self.capability_flags.store(set.bits(), Ordering::SeqCst);
    }

    /// Report a successful call or probe. Returns the transition when the
    /// state changed.
    pub fn mark_success(&self) -> Option<HealthTransition> {
        let _guard = self.transition.lock().unwrap();
        let old = self.status();

        {
            let mut metrics = self.metrics.lock().unwrap();
            metrics.last_success_time = Some(Instant::now());
            metrics.error_rate = (metrics.error_rate - ERROR_RATE_DECAY).max(0.0);
        }

        match old {
            HealthStatus::CircuitOpen => {
                let probes = self.successful_probes.fetch_add(1, Ordering::SeqCst) + 1;
                if probes >= self.required_probes.load(Ordering::SeqCst) {
                    self.close_circuit_locked();
                    Some((old, HealthStatus::Healthy))
                } else {
                    None
                }
            }
            HealthStatus::Unhealthy | HealthStatus::Degraded => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.status
                    .store(HealthStatus::Healthy as u8, Ordering::SeqCst);
                Some((old, HealthStatus::Healthy))
            }
            HealthStatus::Healthy => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                None
            }
        }
    }

    /// Report a failed call or probe. Returns the transition when the state
    /// changed.
    pub fn mark_failure(&self) -> Option<HealthTransition> {
        let _guard = self.transition.lock().unwrap();
        let old = self.status();
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        self.metrics.lock().unwrap().update_error();

        if old != HealthStatus::CircuitOpen
            && failures >= self.max_consecutive_failures.load(Ordering::SeqCst)
        {
            self.open_circuit_locked();
            return Some((old, HealthStatus::CircuitOpen));
        }

        if old == HealthStatus::CircuitOpen {
            // A failed probe restarts the recovery window.
            self.successful_probes.store(0, Ordering::SeqCst);
            *self.circuit_open_time.lock().unwrap() = Some(Instant::now());
            return None;
        }

        if failures >= 2 && old != HealthStatus::Unhealthy {
            self.status
                .store(HealthStatus::Unhealthy as u8, Ordering::SeqCst);
            return Some((old, HealthStatus::Unhealthy));
        }

        None
    }

    fn open_circuit_locked(&self) {
        self.status
            .store(HealthStatus::CircuitOpen as u8, Ordering::SeqCst);
        *self.circuit_open_time.lock().unwrap() = Some(Instant::now());
        let threshold = self.max_consecutive_failures.load(Ordering::SeqCst);
        self.consecutive_failures.store(threshold, Ordering::SeqCst);
        self.successful_probes.store(0, Ordering::SeqCst);
    }

    fn close_circuit_locked(&self) {
        self.status
            .store(HealthStatus::Healthy as u8, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.successful_probes.store(0, Ordering::SeqCst);
        *self.circuit_open_time.lock().unwrap() = None;
    }

    /// Force the circuit open (ops override).
    pub fn force_open(&self) -> Option<HealthTransition> {
        let _guard = self.transition.lock().unwrap();
        let old = self.status();
        if old == HealthStatus::CircuitOpen {
            return None;
        }
        self.open_circuit_locked();
        Some((old, HealthStatus::CircuitOpen))
    }

    /// Force the record back to healthy (ops override).
    pub fn force_healthy(&self) -> Option<HealthTransition> {
        let _guard = self.transition.lock().unwrap();
        let old = self.status();
        if old == HealthStatus::Healthy {
            return None;
        }
        self.close_circuit_locked();
        Some((old, HealthStatus::Healthy))
    }

    /// Whether the record reads as healthy for candidate listing.
    pub fn is_healthy(&self) -> bool {
        matches!(
            self.status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    /// Whether a request may be dispatched right now. An open circuit admits
    /// requests again once `failure_timeout` has elapsed; the first such
    /// request acts as a recovery probe.
    pub fn can_accept_requests(&self) -> bool {
        if self.status() != HealthStatus::CircuitOpen {
            return true;
        }
        let timeout = *self.failure_timeout.lock().unwrap();
        match *self.circuit_open_time.lock().unwrap() {
            Some(opened) => opened.elapsed() >= timeout,
            None => true,
        }
    }

    /// Time until a circuit-open provider admits its next probe.
    pub fn retry_delay(&self) -> Duration {
        if self.status() != HealthStatus::CircuitOpen {
            return Duration::ZERO;
        }
        let timeout = *self.failure_timeout.lock().unwrap();
        match *self.circuit_open_time.lock().unwrap() {
            Some(opened) => timeout.saturating_sub(opened.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Fold one dispatch outcome into the rolling metrics and drive the
    /// state machine.
    pub fn update_metrics(
        &self,
        response: &Response,
        request_time_ms: f64,
    ) -> Option<HealthTransition> {
        {
            let mut metrics = self.metrics.lock().unwrap();
            metrics.update_response_time(request_time_ms);
            metrics.update_success(response.success);
            metrics.recalculate_scores();
        }

        if response.success {
            self.mark_success()
        } else {
            self.mark_failure()
        }
    }

    /// Copy of the current rolling metrics.
    pub fn metrics(&self) -> PerformanceMetrics {
        self.metrics.lock().unwrap().clone()
    }

    /// Reset metrics and state back to a fresh healthy record.
    pub fn reset(&self) {
        let _guard = self.transition.lock().unwrap();
        let mut metrics = self.metrics.lock().unwrap();
        let cost_in = metrics.cost_per_input_token;
        let cost_out = metrics.cost_per_output_token;
        let max_rpm = metrics.max_requests_per_minute;
        *metrics = PerformanceMetrics {
            cost_per_input_token: cost_in,
            cost_per_output_token: cost_out,
            max_requests_per_minute: max_rpm,
            ..PerformanceMetrics::default()
        };
        metrics.recalculate_scores();
        drop(metrics);
        self.close_circuit_locked();
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            provider_name: self.provider_name.clone(),
            status: self.status(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            max_consecutive_failures: self.max_consecutive_failures.load(Ordering::SeqCst),
            successful_probes: self.successful_probes.load(Ordering::SeqCst),
            required_probes: self.required_probes.load(Ordering::SeqCst),
            health_check_in_progress: self.health_check_in_progress.load(Ordering::SeqCst),
            capabilities: self.capabilities(),
            metrics: self.metrics.lock().unwrap().snapshot(),
            retry_delay_secs: self.retry_delay().as_secs(),
        }
    }
}

/// Callback invoked on every health-state transition.
pub type HealthChangeCallback = Arc<dyn Fn(&str, HealthStatus, HealthStatus) + Send + Sync>;

/// Async probe installed by the gateway manager; returns whether the
/// provider looks reachable.
pub type HealthProbe =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Owns the health records and the background monitoring loop.
pub struct ProviderHealthMonitor {
    providers: RwLock<HashMap<String, Arc<ProviderHealth>>>,
    monitoring_active: AtomicBool,
    tick_interval: Mutex<Duration>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    callback: RwLock<Option<HealthChangeCallback>>,
    probe: RwLock<Option<HealthProbe>>,
}

impl Default for ProviderHealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderHealthMonitor {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            monitoring_active: AtomicBool::new(false),
            tick_interval: Mutex::new(DEFAULT_TICK_INTERVAL),
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
            callback: RwLock::new(None),
            probe: RwLock::new(None),
        }
    }

    /// Shorten (or lengthen) the loop tick. Takes effect at the next start.
    pub fn set_tick_interval(&self, interval: Duration) {
        *self.tick_interval.lock().unwrap() = interval;
    }

    pub fn set_health_change_callback(&self, callback: HealthChangeCallback) {
        *self.callback.write().unwrap() = Some(callback);
    }

    pub fn set_probe(&self, probe: HealthProbe) {
        *self.probe.write().unwrap() = Some(probe);
    }

    /// Register a record for a provider, seeded from its settings.
    pub fn add_provider(&self, settings: &ProviderSettings) {
        let health = Arc::new(ProviderHealth::from_settings(settings));
        self.providers
            .write()
            .unwrap()
            .insert(settings.name.clone(), health);
        tracing::info!(provider = %settings.name, "provider added to health monitoring");
    }

    /// Re-apply settings to an existing record without resetting its state.
    pub fn configure_provider(&self, name: &str, settings: &ProviderSettings) {
        if let Some(health) = self.provider_health(name) {
            health.configure(settings);
        }
    }

    pub fn remove_provider(&self, name: &str) {
        self.providers.write().unwrap().remove(name);
        tracing::info!(provider = name, "provider removed from health monitoring");
    }

    pub fn provider_health(&self, name: &str) -> Option<Arc<ProviderHealth>> {
        self.providers.read().unwrap().get(name).cloned()
    }

    pub fn provider_status(&self, name: &str) -> Option<HealthStatus> {
        self.provider_health(name).map(|h| h.status())
    }

    /// Providers that are healthy and currently accepting requests.
    pub fn healthy_providers(&self) -> Vec<String> {
        self.providers
            .read()
            .unwrap()
            .iter()
            .filter(|(_, health)| health.is_healthy() && health.can_accept_requests())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Providers that advertise `capability` and accept requests.
    pub fn providers_with_capability(&self, capability: CapabilitySet) -> Vec<String> {
        self.providers
            .read()
            .unwrap()
            .iter()
            .filter(|(_, health)| health.has_capability(capability) && health.can_accept_requests())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn unhealthy_providers(&self) -> Vec<String> {
        self.providers
            .read()
            .unwrap()
            .iter()
            .filter(|(_, health)| !health.is_healthy() || !health.can_accept_requests())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Fold a dispatch outcome into the provider's record and emit any
    /// resulting transition.
    pub fn update_provider_metrics(&self, name: &str, response: &Response, request_time_ms: f64) {
        if let Some(health) = self.provider_health(name) {
            if let Some(transition) = health.update_metrics(response, request_time_ms) {
                self.emit(name, transition);
            }
        }
    }

    /// Report a success without metric updates (used by probes).
    pub fn record_success(&self, name: &str) {
        if let Some(health) = self.provider_health(name) {
            if let Some(transition) = health.mark_success() {
                self.emit(name, transition);
            }
        }
    }

    /// Report a failure without metric updates (used by probes).
    pub fn record_failure(&self, name: &str) {
        if let Some(health) = self.provider_health(name) {
            if let Some(transition) = health.mark_failure() {
                self.emit(name, transition);
            }
        }
    }

    /// Ops override: force a record healthy.
    pub fn force_provider_healthy(&self, name: &str) {
        if let Some(health) = self.provider_health(name) {
            if let Some(transition) = health.force_healthy() {
                self.emit(name, transition);
            }
        }
    }

    /// Ops override: open a record's circuit.
    pub fn force_provider_unhealthy(&self, name: &str) {
        if let Some(health) = self.provider_health(name) {
            if let Some(transition) = health.force_open() {
                self.emit(name, transition);
            }
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring_active.load(Ordering::SeqCst)
    }

    /// Spawn the monitoring loop. Idempotent.
    pub fn start_monitoring(self: &Arc<Self>) {
        if self.monitoring_active.swap(true, Ordering::SeqCst) {
            tracing::warn!("health monitoring already active");
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);

        let monitor = Arc::clone(self);
        let tick = *self.tick_interval.lock().unwrap();
        let handle = tokio::spawn(async move {
            monitor.monitoring_loop(tick, stop_rx).await;
        });
        *self.task.lock().unwrap() = Some(handle);

        tracing::info!("started provider health monitoring");
    }

    /// Signal the loop to stop and wait for it within a bounded grace
    /// period.
    pub async fn stop_monitoring(&self) {
        if !self.monitoring_active.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(stop_tx) = self.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(true);
        }

        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                tracing::warn!("health monitoring loop did not stop within grace period");
            }
        }

        tracing::info!("stopped provider health monitoring");
    }

    async fn monitoring_loop(self: Arc<Self>, tick: Duration, mut stop_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.perform_periodic_checks().await;
                    self.check_circuit_breakers();
                }
                _ = stop_rx.changed() => break,
            }
        }
    }

    async fn perform_periodic_checks(&self) {
        let due: Vec<(String, Arc<ProviderHealth>)> = {
            let providers = self.providers.read().unwrap();
            providers
                .iter()
                .filter(|(_, health)| {
                    if health.health_check_in_progress.load(Ordering::SeqCst) {
                        return false;
                    }
                    let interval = *health.health_check_interval.lock().unwrap();
                    health.last_health_check.lock().unwrap().elapsed() >= interval
                })
                .map(|(name, health)| (name.clone(), Arc::clone(health)))
                .collect()
        };

        for (name, health) in due {
            self.perform_health_check(&name, &health).await;
        }
    }

    async fn perform_health_check(&self, name: &str, health: &Arc<ProviderHealth>) {
        // Single-flight per provider.
        if health
            .health_check_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        *health.last_health_check.lock().unwrap() = Instant::now();

        let probe = self.probe.read().unwrap().clone();
        let outcome = match probe {
            Some(probe) => Some(probe(name.to_string()).await),
            None => None,
        };

        match outcome {
            Some(true) => {
                tracing::debug!(provider = name, "health check passed");
                if let Some(transition) = health.mark_success() {
                    self.emit(name, transition);
                }
            }
            Some(false) => {
                tracing::warn!(provider = name, "health check failed");
                if let Some(transition) = health.mark_failure() {
                    self.emit(name, transition);
                }
            }
            None => {}
        }

        health
            .health_check_in_progress
            .store(false, Ordering::SeqCst);
    }

    fn check_circuit_breakers(&self) {
        let providers = self.providers.read().unwrap();
        for (name, health) in providers.iter() {
            if health.status() == HealthStatus::CircuitOpen && health.can_accept_requests() {
                tracing::info!(
                    provider = %name,
                    "circuit timeout elapsed; next request will probe the provider"
                );
            }
        }
    }

    fn emit(&self, name: &str, (old, new): HealthTransition) {
        tracing::info!(provider = name, from = %old, to = %new, "provider health changed");
        let callback = self.callback.read().unwrap().clone();
        if let Some(callback) = callback {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(name, old, new);
            }));
            if result.is_err() {
                tracing::error!(provider = name, "health change callback panicked");
            }
        }
    }

    /// Snapshots of every record, keyed by provider.
    pub fn all_health_snapshots(&self) -> HashMap<String, HealthSnapshot> {
        self.providers
            .read()
            .unwrap()
            .iter()
            .map(|(name, health)| (name.clone(), health.snapshot()))
            .collect()
    }

    /// Shared handles to every record, keyed by provider.
    pub fn all_provider_health(&self) -> HashMap<String, Arc<ProviderHealth>> {
        self.providers.read().unwrap().clone()
    }
}
