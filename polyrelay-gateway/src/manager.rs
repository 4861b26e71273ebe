//! # Gateway Manager
//!
//! The façade the HTTP layer calls. Owns the provider registry (settings,
//! bridges, in-flight counters), the health monitor, the routing logic, the
//! failover manager, and the request-metric log, and stitches them together
//! into `route_request`.
//!
//! ## Request flow
//!
//! `route_request` analyzes the payload, filters the provider pool down to
//! eligible candidates (enabled, model match, circuit state, capabilities,
//! capacity, failover cooldown), asks the routing logic for a decision, and
//! dispatches through the selected provider's bridge. Failed attempts fail
//! over to the next-best alternative, up to a bounded number of attempts and
//! within one per-request deadline. Every attempt lands in the metric log;
//! errors never propagate to the caller as anything but a well-formed
//! [`Response`].
//!
//! ## Locking
//!
//! Registry maps use reader-writer locks and are never held across an
//! `await`; bridges are `Arc`s, so a provider removed mid-flight stays alive
//! until its last dispatch completes. The dispatch path updates state in a
//! fixed order (health record, then load balancer, then metric ring).

use crate::balancer::{BalancerStatistics, LoadBalancer};
use crate::config::{ConfigError, GatewayConfig, ProviderSettings};
use crate::health::{
    CapabilitySet, HealthChangeCallback, HealthSnapshot, HealthStatus, ProviderHealthMonitor,
};
use crate::metrics::{MetricLog, MetricsSummary, RequestMetric};
use crate::routing::{
    CustomSelector, RequestAnalysis, RequestType, RoutingDecision, RoutingLogic, RoutingMetrics,
    RoutingPriority,
};
use chrono::Utc;
use dashmap::DashMap;
use polyrelay_core::error::status_is_transient;
use polyrelay_core::failover::DEFAULT_COOLDOWN_MINUTES;
use polyrelay_core::{Bridge, ErrorBridge, FailoverManager, Request, Response};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Observer invoked after each metric record is appended.
pub type RouteCallback = Arc<dyn Fn(&RequestMetric) + Send + Sync>;
/// Observer invoked when a provider is added (`true`) or removed (`false`).
pub type ProviderChangeCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Candidate pool after each filter stage, for diagnostics and reasons.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FilterTrace {
    pub all: Vec<String>,
    pub enabled: Vec<String>,
    pub model: Vec<String>,
    pub health: Vec<String>,
    pub capability: Vec<String>,
    pub capacity: Vec<String>,
}

impl FilterTrace {
    fn eligible(&self) -> &[String] {
        &self.capacity
    }
}

/// The gateway core façade: provider lifecycle, routing, dispatch, failover
/// and metrics behind one object.
pub struct GatewayManager {
    settings: RwLock<HashMap<String, ProviderSettings>>,
    bridges: Arc<RwLock<HashMap<String, Arc<dyn Bridge>>>>,
    inflight: DashMap<String, Arc<AtomicU32>>,

    health_monitor: Arc<ProviderHealthMonitor>,
    routing: Arc<RoutingLogic>,
    failover: Arc<FailoverManager>,
    metric_log: MetricLog,

    default_provider: RwLock<Option<String>>,
    thinking_provider: RwLock<Option<String>>,
    vision_provider: RwLock<Option<String>>,
    tools_provider: RwLock<Option<String>>,

    initialized: AtomicBool,
    metrics_enabled: AtomicBool,
    request_timeout: RwLock<Duration>,
    max_failover_attempts: AtomicU32,
    failover_on_client_error: AtomicBool,

    route_callback: RwLock<Option<RouteCallback>>,
    provider_change_callback: RwLock<Option<ProviderChangeCallback>>,
}

impl Default for GatewayManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayManager {
    pub fn new() -> Self {
        let health_monitor = Arc::new(ProviderHealthMonitor::new());
        let routing = Arc::new(RoutingLogic::new(Arc::clone(&health_monitor)));

        Self {
            settings: RwLock::new(HashMap::new()),
            bridges: Arc::new(RwLock::new(HashMap::new())),
            inflight: DashMap::new(),
            health_monitor,
            routing,
            failover: Arc::new(FailoverManager::new(&[])),
            metric_log: MetricLog::default(),
            default_provider: RwLock::new(None),
            thinking_provider: RwLock::new(None),
            vision_provider: RwLock::new(None),
            tools_provider: RwLock::new(None),
            initialized: AtomicBool::new(false),
            metrics_enabled: AtomicBool::new(true),
            request_timeout: RwLock::new(Duration::from_secs(300)),
            max_failover_attempts: AtomicU32::new(3),
            failover_on_client_error: AtomicBool::new(false),
            route_callback: RwLock::new(None),
            provider_change_callback: RwLock::new(None),
        }
    }

    /// Wire the health probe to the bridges and start background
    /// monitoring. Idempotent.
    pub fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }

        let bridges = Arc::clone(&self.bridges);
        self.health_monitor.set_probe(Arc::new(move |name: String| {
            let bridge = bridges.read().unwrap().get(&name).cloned();
            Box::pin(async move {
                match bridge {
                    Some(bridge) => bridge.is_healthy(),
                    None => false,
                }
            })
        }));
        self.health_monitor.start_monitoring();
        tracing::info!("gateway manager initialized");
    }

    /// Stop background monitoring. Idempotent.
    pub async fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        self.health_monitor.stop_monitoring().await;
        tracing::info!("gateway manager shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    // ---- Provider lifecycle -------------------------------------------------

    /// Register a provider. Creates its health record, failover entry and
    /// in-flight counter atomically with respect to routing; an
    /// [`ErrorBridge`] placeholder serves dispatches until a real adapter is
    /// wired in.
    pub fn add_provider(&self, settings: ProviderSettings) -> Result<(), ConfigError> {
        let mut errors = settings.validation_errors();
        if self.provider_exists(&settings.name) {
            errors.push(format!("provider '{}' already exists", settings.name));
        }
        if !errors.is_empty() {
            return Err(ConfigError::Invalid { errors });
        }

        let name = settings.name.clone();
        self.health_monitor.add_provider(&settings);
        self.failover.register(&name);
        self.inflight
            .insert(name.clone(), Arc::new(AtomicU32::new(0)));
        {
            let mut bridges = self.bridges.write().unwrap();
            bridges.entry(name.clone()).or_insert_with(|| {
                Arc::new(ErrorBridge::new(name.clone(), "no adapter installed"))
            });
        }
        self.settings.write().unwrap().insert(name.clone(), settings);

        self.notify_provider_change(&name, true);
        tracing::info!(provider = %name, "provider added");
        Ok(())
    }

    /// Remove a provider and all of its associated state. In-flight
    /// dispatches keep their bridge alive and complete normally.
    pub fn remove_provider(&self, name: &str) -> bool {
        let removed = self.settings.write().unwrap().remove(name).is_some();
        if !removed {
            return false;
        }

        self.bridges.write().unwrap().remove(name);
        self.health_monitor.remove_provider(name);
        self.failover.unregister(name);
        self.inflight.remove(name);
        if let Some(balancer) = self.routing.load_balancer() {
            balancer.remove_provider(name);
        }
        for specialized in [
            &self.default_provider,
            &self.thinking_provider,
            &self.vision_provider,
            &self.tools_provider,
        ] {
            let mut slot = specialized.write().unwrap();
            if slot.as_deref() == Some(name) {
                *slot = None;
            }
        }

        self.notify_provider_change(name, false);
        tracing::info!(provider = name, "provider removed");
        true
    }

    /// Replace a provider's settings, keeping its runtime health state.
    pub fn update_provider_config(
        &self,
        name: &str,
        settings: ProviderSettings,
    ) -> Result<(), ConfigError> {
        let mut errors = settings.validation_errors();
        if settings.name != name {
            errors.push(format!(
                "settings name '{}' does not match provider '{name}'",
                settings.name
            ));
        }
        if !self.provider_exists(name) {
            errors.push(format!("provider '{name}' does not exist"));
        }
        if !errors.is_empty() {
            return Err(ConfigError::Invalid { errors });
        }

        self.health_monitor.configure_provider(name, &settings);
        self.settings
            .write()
            .unwrap()
            .insert(name.to_string(), settings);
        Ok(())
    }

    pub fn provider_exists(&self, name: &str) -> bool {
        self.settings.read().unwrap().contains_key(name)
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.settings.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Wire a dispatch adapter for its provider, replacing any placeholder.
    pub fn add_provider_adapter(&self, bridge: Arc<dyn Bridge>) {
        let name = bridge.provider_name().to_string();
        self.bridges.write().unwrap().insert(name.clone(), bridge);
        tracing::info!(provider = %name, "provider adapter installed");
    }

    /// Unwire a provider's adapter; subsequent dispatches hit an
    /// [`ErrorBridge`] placeholder.
    pub fn remove_provider_adapter(&self, name: &str) {
        let mut bridges = self.bridges.write().unwrap();
        if bridges.remove(name).is_some() && self.settings.read().unwrap().contains_key(name) {
            bridges.insert(
                name.to_string(),
                Arc::new(ErrorBridge::new(name, "adapter removed")),
            );
        }
    }

    // ---- Routing preferences ------------------------------------------------

    pub fn set_default_provider(&self, name: &str) -> Result<(), ConfigError> {
        self.set_specialized(&self.default_provider, name)
    }

    pub fn set_thinking_provider(&self, name: &str) -> Result<(), ConfigError> {
        self.set_specialized(&self.thinking_provider, name)
    }

    pub fn set_vision_provider(&self, name: &str) -> Result<(), ConfigError> {
        self.set_specialized(&self.vision_provider, name)
    }

    pub fn set_tools_provider(&self, name: &str) -> Result<(), ConfigError> {
        self.set_specialized(&self.tools_provider, name)
    }

    fn set_specialized(
        &self,
        slot: &RwLock<Option<String>>,
        name: &str,
    ) -> Result<(), ConfigError> {
        if !self.provider_exists(name) {
            return Err(ConfigError::Invalid {
                errors: vec![format!("provider '{name}' does not exist")],
            });
        }
        *slot.write().unwrap() = Some(name.to_string());
        Ok(())
    }

    pub fn set_routing_priority(&self, priority: RoutingPriority) {
        self.routing.set_default_priority(priority);
    }

    pub fn routing_priority(&self) -> RoutingPriority {
        self.routing.default_priority()
    }

    pub fn set_custom_selector(&self, selector: CustomSelector) {
        self.routing.set_custom_selector(selector);
    }

    pub fn enable_load_balancer(&self, balancer: LoadBalancer) {
        self.routing.set_load_balancer(Some(Arc::new(balancer)));
    }

    pub fn disable_load_balancer(&self) {
        self.routing.set_load_balancer(None);
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        *self.request_timeout.write().unwrap() = timeout;
    }

    /// Tune the circuit breaker across all providers. Disabling raises the
    /// threshold beyond reach.
    pub fn enable_circuit_breaker(&self, enabled: bool, max_failures: u32) {
        let threshold = if enabled { max_failures.max(1) } else { u32::MAX };
        for health in self.health_monitor.all_provider_health().values() {
            health.set_max_consecutive_failures(threshold);
        }
    }

    /// Tune automatic recovery across all providers. Disabling requires a
    /// manual healthy override to close a circuit.
    pub fn enable_auto_recovery(&self, enabled: bool, probe_count: u32) {
        let probes = if enabled { probe_count.max(1) } else { u32::MAX };
        for health in self.health_monitor.all_provider_health().values() {
            health.set_required_probes(probes);
        }
    }

    // ---- Observers ----------------------------------------------------------

    pub fn set_route_callback(&self, callback: RouteCallback) {
        *self.route_callback.write().unwrap() = Some(callback);
    }

    pub fn set_provider_change_callback(&self, callback: ProviderChangeCallback) {
        *self.provider_change_callback.write().unwrap() = Some(callback);
    }

    pub fn set_health_change_callback(&self, callback: HealthChangeCallback) {
        self.health_monitor.set_health_change_callback(callback);
    }

    fn notify_provider_change(&self, name: &str, added: bool) {
        let callback = self.provider_change_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(name, added);
            }));
            if result.is_err() {
                tracing::error!(provider = name, "provider change callback panicked");
            }
        }
    }

    // ---- Health passthrough -------------------------------------------------

    pub fn health_monitor(&self) -> &Arc<ProviderHealthMonitor> {
        &self.health_monitor
    }

    pub fn healthy_providers(&self) -> Vec<String> {
        self.health_monitor.healthy_providers()
    }

    pub fn unhealthy_providers(&self) -> Vec<String> {
        self.health_monitor.unhealthy_providers()
    }

    pub fn provider_status(&self, name: &str) -> Option<HealthStatus> {
        self.health_monitor.provider_status(name)
    }

    pub fn provider_capabilities(&self, name: &str) -> Option<CapabilitySet> {
        self.health_monitor
            .provider_health(name)
            .map(|h| h.capabilities())
    }

    pub fn providers_with_capability(&self, capability: CapabilitySet) -> Vec<String> {
        self.health_monitor.providers_with_capability(capability)
    }

    pub fn health_snapshots(&self) -> HashMap<String, HealthSnapshot> {
        self.health_monitor.all_health_snapshots()
    }

    /// Ops override: force a provider healthy and clear its failover state.
    pub fn manually_mark_provider_healthy(&self, name: &str) {
        self.health_monitor.force_provider_healthy(name);
        self.failover.mark_healthy(name);
    }

    /// Ops override: open a provider's circuit.
    pub fn manually_mark_provider_unhealthy(&self, name: &str) {
        self.health_monitor.force_provider_unhealthy(name);
    }

    /// Cheap connectivity check through the provider's bridge, with no
    /// routing side effects.
    pub fn test_provider_connectivity(&self, name: &str) -> bool {
        self.bridges
            .read()
            .unwrap()
            .get(name)
            .map(|bridge| bridge.is_healthy())
            .unwrap_or(false)
    }

    // ---- Metrics ------------------------------------------------------------

    pub fn get_metrics(&self) -> MetricsSummary {
        self.metric_log.summary()
    }

    pub fn get_recent_metrics(&self, count: usize) -> Vec<RequestMetric> {
        self.metric_log.recent(count)
    }

    pub fn clear_metrics(&self) {
        self.metric_log.clear();
    }

    pub fn enable_metrics_collection(&self, enabled: bool) {
        self.metrics_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn routing_metrics(&self) -> RoutingMetrics {
        self.routing.metrics_snapshot()
    }

    pub fn failover_statistics(&self) -> polyrelay_core::FailoverStatistics {
        self.failover.statistics()
    }

    pub fn balancer_statistics(&self) -> Option<BalancerStatistics> {
        self.routing.load_balancer().map(|b| b.statistics())
    }

    // ---- Configuration round trip -------------------------------------------

    /// Emit the current state as a configuration document that
    /// [`GatewayManager::load_configuration`] accepts unchanged.
    pub fn get_configuration(&self) -> GatewayConfig {
        GatewayConfig {
            default_provider: self.default_provider.read().unwrap().clone(),
            thinking_provider: self.thinking_provider.read().unwrap().clone(),
            vision_provider: self.vision_provider.read().unwrap().clone(),
            tools_provider: self.tools_provider.read().unwrap().clone(),
            routing_priority: self.routing.default_priority(),
            load_balancer: self.routing.load_balancer().map(|b| b.strategy()),
            providers: self.settings.read().unwrap().clone(),
            request_timeout: *self.request_timeout.read().unwrap(),
            failover_on_client_error: self.failover_on_client_error.load(Ordering::SeqCst),
            max_failover_attempts: self.max_failover_attempts.load(Ordering::SeqCst),
        }
    }

    /// Apply a configuration document transactionally: the whole document is
    /// validated before any state changes.
    pub fn load_configuration(&self, config: GatewayConfig) -> Result<(), ConfigError> {
        config.validate()?;

        let existing = self.provider_names();
        for name in existing {
            if !config.providers.contains_key(&name) {
                self.remove_provider(&name);
            }
        }
        for (name, settings) in config.providers {
            if self.provider_exists(&name) {
                self.update_provider_config(&name, settings)?;
            } else {
                self.add_provider(settings)?;
            }
        }

        *self.default_provider.write().unwrap() = config.default_provider;
        *self.thinking_provider.write().unwrap() = config.thinking_provider;
        *self.vision_provider.write().unwrap() = config.vision_provider;
        *self.tools_provider.write().unwrap() = config.tools_provider;
        self.routing.set_default_priority(config.routing_priority);
        match config.load_balancer {
            Some(strategy) => match self.routing.load_balancer() {
                Some(balancer) => balancer.set_strategy(strategy),
                None => self.enable_load_balancer(LoadBalancer::new(strategy)),
            },
            None => self.disable_load_balancer(),
        }
        *self.request_timeout.write().unwrap() = config.request_timeout;
        self.failover_on_client_error
            .store(config.failover_on_client_error, Ordering::SeqCst);
        self.max_failover_attempts
            .store(config.max_failover_attempts.max(1), Ordering::SeqCst);

        tracing::info!("configuration applied");
        Ok(())
    }

    // ---- Request analysis and candidate filtering ---------------------------

    /// Classify a request without routing it.
    pub fn analyze_request(&self, request: &Request) -> RequestAnalysis {
        self.routing.analyze_request(request)
    }

    fn filter_candidates(
        &self,
        request: &Request,
        analysis: &RequestAnalysis,
        exclude: &HashSet<String>,
    ) -> FilterTrace {
        let settings = self.settings.read().unwrap();
        let mut all: Vec<String> = settings.keys().cloned().collect();
        all.sort();

        let enabled: Vec<String> = all
            .iter()
            .filter(|name| settings.get(*name).map(|s| s.enabled).unwrap_or(false))
            .filter(|name| !exclude.contains(*name))
            .cloned()
            .collect();

        let model: Vec<String> = enabled
            .iter()
            .filter(|name| {
                settings
                    .get(*name)
                    .map(|s| s.serves_model(&request.model))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        drop(settings);

        let health: Vec<String> = model
            .iter()
            .filter(|name| {
                self.health_monitor
                    .provider_health(name)
                    .map(|h| h.can_accept_requests())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let capability: Vec<String> = health
            .iter()
            .filter(|name| {
                self.health_monitor
                    .provider_health(name)
                    .map(|h| analysis.capabilities_satisfied_by(h.capabilities()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let settings = self.settings.read().unwrap();
        let capacity: Vec<String> = capability
            .iter()
            .filter(|name| {
                let limit = settings
                    .get(*name)
                    .map(|s| s.max_concurrent_requests)
                    .unwrap_or(u32::MAX);
                self.current_inflight(name) < limit
            })
            .cloned()
            .collect();

        FilterTrace {
            all,
            enabled,
            model,
            health,
            capability,
            capacity,
        }
    }

    fn no_candidate_reason(&self, request: &Request, trace: &FilterTrace) -> String {
        if trace.all.is_empty() {
            return "no providers configured".to_string();
        }
        if trace.enabled.is_empty() {
            return "all providers are disabled".to_string();
        }
        if trace.model.is_empty() {
            return format!("no enabled provider serves model '{}'", request.model);
        }
        if trace.capability.is_empty() && !trace.health.is_empty() {
            return "no provider offers the required capabilities".to_string();
        }
        if trace.health.is_empty() {
            let retry = self
                .health_monitor
                .all_provider_health()
                .values()
                .map(|h| h.retry_delay())
                .filter(|d| !d.is_zero())
                .min();
            return match retry {
                Some(delay) => format!(
                    "all providers unavailable; earliest retry in {}s",
                    delay.as_secs().max(1)
                ),
                None => "all providers unavailable".to_string(),
            };
        }
        if trace.capacity.is_empty() {
            return "all capable providers are at their concurrency limit".to_string();
        }
        "no eligible providers".to_string()
    }

    fn specialized_provider_for(&self, request_type: RequestType) -> Option<String> {
        let slot = match request_type {
            RequestType::Thinking => &self.thinking_provider,
            RequestType::Vision | RequestType::Multimodal => &self.vision_provider,
            RequestType::Tools => &self.tools_provider,
            RequestType::Standard | RequestType::Streaming | RequestType::LongContext => {
                &self.default_provider
            }
        };
        slot.read().unwrap().clone()
    }

    // ---- Dispatch -----------------------------------------------------------

    /// Route a request to the best eligible provider, failing over across
    /// alternatives on transient failures. Never returns an error; every
    /// outcome is a well-formed [`Response`].
    pub async fn route_request(&self, request: &Request) -> Response {
        if !self.is_initialized() {
            return Response::error("", 503, "gateway not initialized");
        }

        let analysis = self.routing.analyze_request(request);
        let priority = self.routing.default_priority();
        let deadline = Instant::now() + *self.request_timeout.read().unwrap();
        let mut tried: HashSet<String> = HashSet::new();

        let trace = self.filter_candidates(request, &analysis, &tried);
        if trace.eligible().is_empty() {
            let reason = self.no_candidate_reason(request, &trace);
            let response = Response::error("", 503, reason.clone());
            self.append_metric(request, &analysis, &response, Utc::now(), 0.0, &reason);
            return response;
        }

        let decision = self.decide(request, priority, &analysis, trace.eligible());
        let mut current = decision.selected_provider.clone();
        let mut alternatives = decision.alternative_providers.clone();
        let max_attempts = self.max_failover_attempts.load(Ordering::SeqCst).max(1);
        let mut failures: Vec<String> = Vec::new();

        loop {
            tried.insert(current.clone());
            let response = self
                .dispatch(&current, request, &analysis, &decision.reasoning, deadline)
                .await;

            if response.success {
                self.failover.mark_healthy(&current);
                return response;
            }

            failures.push(format!(
                "{current}: {} (status {})",
                response
                    .error_message
                    .as_deref()
                    .unwrap_or("upstream failure"),
                response.status_code
            ));
            self.failover
                .mark_failed_for(&current, self.failover_cooldown(&current));

            let transient = status_is_transient(response.status_code);
            if !transient && !self.failover_on_client_error.load(Ordering::SeqCst) {
                return response;
            }

            if tried.len() as u32 >= max_attempts || Instant::now() >= deadline {
                return finalize_failure(response, &failures);
            }

            // The failover cache is the fast advisory check here: skip
            // alternatives that hard-failed recently (possibly for another
            // request) before consulting anything heavier.
            alternatives
                .retain(|name| !tried.contains(name) && self.failover.is_available(name));
            let next = match alternatives.first().cloned() {
                Some(next) => {
                    alternatives.remove(0);
                    Some(next)
                }
                None => {
                    let fresh = self.filter_candidates(request, &analysis, &tried);
                    fresh
                        .eligible()
                        .iter()
                        .find(|name| self.failover.is_available(name))
                        .cloned()
                }
            };

            match next {
                Some(next) => {
                    tracing::warn!(
                        failed = %current,
                        next = %next,
                        attempt = tried.len(),
                        "failing over to alternative provider"
                    );
                    self.metric_log.record_failover();
                    current = next;
                }
                None => return finalize_failure(response, &failures),
            }
        }
    }

    /// Bypass routing and dispatch straight to a named provider, honoring
    /// only enablement and circuit state.
    pub async fn route_request_to_provider(&self, request: &Request, name: &str) -> Response {
        let enabled = {
            let settings = self.settings.read().unwrap();
            match settings.get(name) {
                Some(s) => s.enabled,
                None => {
                    return Response::error(name, 503, format!("provider '{name}' is not configured"))
                }
            }
        };
        if !enabled {
            return Response::error(name, 503, format!("provider '{name}' is disabled"));
        }
        if let Some(health) = self.health_monitor.provider_health(name) {
            if !health.can_accept_requests() {
                return Response::error(
                    name,
                    503,
                    format!(
                        "provider '{name}' circuit is open; retry in {}s",
                        health.retry_delay().as_secs().max(1)
                    ),
                );
            }
        }

        let analysis = self.routing.analyze_request(request);
        let deadline = Instant::now() + *self.request_timeout.read().unwrap();
        let response = self
            .dispatch(name, request, &analysis, "explicit provider override", deadline)
            .await;

        if response.success {
            self.failover.mark_healthy(name);
        } else {
            self.failover
                .mark_failed_for(name, self.failover_cooldown(name));
        }
        response
    }

    /// Cooldown applied when a dispatch fails: the provider's
    /// `failure_timeout`, so the failover cache and the circuit breaker
    /// agree on when the provider may be probed again.
    fn failover_cooldown(&self, name: &str) -> Duration {
        self.settings
            .read()
            .unwrap()
            .get(name)
            .map(|s| s.failure_timeout)
            .unwrap_or(Duration::from_secs(DEFAULT_COOLDOWN_MINUTES * 60))
    }

    fn decide(
        &self,
        request: &Request,
        priority: RoutingPriority,
        analysis: &RequestAnalysis,
        candidates: &[String],
    ) -> RoutingDecision {
        if request.model.is_empty() {
            if let Some(special) = self.specialized_provider_for(analysis.request_type) {
                let healthy = self
                    .health_monitor
                    .provider_health(&special)
                    .map(|h| h.is_healthy())
                    .unwrap_or(false);
                if healthy && candidates.contains(&special) {
                    let alternatives: Vec<String> = self
                        .routing
                        .score_candidates(candidates, priority)
                        .into_iter()
                        .map(|c| c.provider)
                        .filter(|p| p != &special)
                        .collect();
                    return RoutingDecision {
                        selected_provider: special.clone(),
                        alternative_providers: alternatives,
                        priority_used: priority,
                        selection_score: 1.0,
                        reasoning: format!(
                            "configured {} provider '{special}'",
                            analysis.request_type
                        ),
                    };
                }
            }
        }

        self.routing.route(request, priority, analysis, candidates)
    }

    /// One upstream attempt: bridge call under the remaining deadline, then
    /// state updates in lock order (health record, load balancer, metric
    /// ring).
    async fn dispatch(
        &self,
        provider: &str,
        request: &Request,
        analysis: &RequestAnalysis,
        reasoning: &str,
        deadline: Instant,
    ) -> Response {
        let started_at = Utc::now();
        let start = Instant::now();
        let bridge = self.bridges.read().unwrap().get(provider).cloned();

        let response = match bridge {
            None => Response::error(provider, 503, "no adapter installed for provider"),
            Some(bridge) => {
                let counter = self.inflight_counter(provider);
                counter.fetch_add(1, Ordering::SeqCst);

                let remaining = deadline.saturating_duration_since(Instant::now());
                let response = if remaining.is_zero() {
                    Response::error(provider, 499, "cancelled")
                } else {
                    match tokio::time::timeout(remaining, bridge.send_request(request)).await {
                        Ok(Ok(response)) => response,
                        Ok(Err(err)) => {
                            Response::error(provider, err.status_code(), err.to_string())
                        }
                        Err(_) => Response::error(
                            provider,
                            502,
                            format!("no response within {}s", remaining.as_secs().max(1)),
                        ),
                    }
                };

                counter.fetch_sub(1, Ordering::SeqCst);
                response
            }
        };

        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        let response = response.with_response_time(duration_ms);

        self.health_monitor
            .update_provider_metrics(provider, &response, duration_ms);
        if let Some(balancer) = self.routing.load_balancer() {
            balancer.update_response_time(provider, duration_ms);
            balancer.update_connections(provider, self.current_inflight(provider));
        }
        self.append_metric(request, analysis, &response, started_at, duration_ms, reasoning);

        response
    }

    fn inflight_counter(&self, provider: &str) -> Arc<AtomicU32> {
        self.inflight
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone()
    }

    fn current_inflight(&self, provider: &str) -> u32 {
        self.inflight
            .get(provider)
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn append_metric(
        &self,
        request: &Request,
        analysis: &RequestAnalysis,
        response: &Response,
        started_at: chrono::DateTime<Utc>,
        duration_ms: f64,
        reasoning: &str,
    ) {
        if !self.metrics_enabled.load(Ordering::SeqCst) {
            return;
        }

        let response_tokens = response
            .data
            .get("usage")
            .and_then(|u| u.get("output_tokens"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;

        let cost_usd = {
            let settings = self.settings.read().unwrap();
            settings
                .get(&response.provider_name)
                .map(|s| {
                    (f64::from(analysis.estimated_tokens) * s.cost_per_input_token
                        + f64::from(response_tokens) * s.cost_per_output_token)
                        / 1_000_000.0
                })
                .unwrap_or(0.0)
        };

        let metric = RequestMetric {
            provider_name: response.provider_name.clone(),
            started_at,
            completed_at: Utc::now(),
            duration_ms,
            success: response.success,
            http_status_code: response.status_code,
            error_message: response.error_message.clone(),
            request_tokens: analysis.estimated_tokens,
            response_tokens,
            cost_usd,
            request_type: analysis.request_type,
            routing_reasoning: reasoning.to_string(),
            correlation_id: request.correlation_id.clone(),
        };

        self.metric_log.record(metric.clone());

        let callback = self.route_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&metric);
            }));
            if result.is_err() {
                tracing::error!("route callback panicked");
            }
        }
    }

    // ---- Diagnostics --------------------------------------------------------

    /// Explain what routing would do for a request, without dispatching.
    pub fn debug_routing_decision(&self, request: &Request) -> serde_json::Value {
        let analysis = self.routing.analyze_request(request);
        let priority = self.routing.default_priority();
        let trace = self.filter_candidates(request, &analysis, &HashSet::new());
        let scores = self.routing.score_candidates(trace.eligible(), priority);
        let would_select = scores.first().map(|c| c.provider.clone());

        serde_json::json!({
            "analysis": analysis,
            "priority": priority,
            "filters": trace,
            "scores": scores,
            "would_select": would_select,
        })
    }
}

fn finalize_failure(mut response: Response, failures: &[String]) -> Response {
    if failures.len() > 1 {
        response.error_message = Some(format!(
            "all {} attempts failed: {}",
            failures.len(),
            failures.join("; ")
        ));
    }
    response
}
