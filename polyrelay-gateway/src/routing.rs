//! # Request Classification and Routing
//!
//! Turns an opaque chat-completions payload into a [`RequestAnalysis`]
//! (request type, required capabilities, token estimate) and picks one
//! provider out of the eligible candidates according to the active
//! [`RoutingPriority`].
//!
//! ## Classification
//!
//! The first matching rule wins, in this order: tool usage, streaming,
//! vision/multimodal content, thinking prompts, long context, standard.
//! The thinking and vision keyword sets are configuration, not code; the
//! defaults mirror the usual heuristics (`"step by step"`, `"diagram"`,
//! ...). Matching is case-insensitive substring matching over the
//! concatenated message text.
//!
//! ## Selection
//!
//! Candidates are scored per strategy (cost, performance, reliability,
//! balanced, or a caller-supplied custom selector); the configured
//! [`LoadBalancer`] breaks ties within the winning score class. The losers
//! are returned, best first, as failover alternatives.

use crate::balancer::LoadBalancer;
use crate::health::{CapabilitySet, ProviderHealth, ProviderHealthMonitor};
use polyrelay_core::Request;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Two scores closer than this are the same score class; the load balancer
/// arbitrates inside the class.
const SCORE_EPSILON: f64 = 1e-9;

/// Default long-context threshold, in estimated tokens.
pub const DEFAULT_LONG_CONTEXT_THRESHOLD: u32 = 32_768;

const DEFAULT_THINKING_KEYWORDS: [&str; 10] = [
    "think",
    "reason",
    "analyze",
    "step by step",
    "break down",
    "explain",
    "consider",
    "evaluate",
    "compare",
    "conclude",
];

const DEFAULT_VISION_KEYWORDS: [&str; 11] = [
    "image",
    "photo",
    "picture",
    "visual",
    "diagram",
    "chart",
    "screenshot",
    "graph",
    "figure",
    "drawing",
    "illustration",
];

/// What kind of request this is, for routing purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Standard,
    Thinking,
    Vision,
    Multimodal,
    Tools,
    Streaming,
    LongContext,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestType::Standard => "standard",
            RequestType::Thinking => "thinking",
            RequestType::Vision => "vision",
            RequestType::Multimodal => "multimodal",
            RequestType::Tools => "tools",
            RequestType::Streaming => "streaming",
            RequestType::LongContext => "long_context",
        };
        f.write_str(s)
    }
}

/// Strategy used to rank eligible providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingPriority {
    /// Cheapest total token cost wins
    Cost,
    /// Best performance score wins
    Performance,
    /// Best success rate wins
    Reliability,
    /// Weighted blend of performance, reliability, cost and priority
    Balanced,
    /// Delegate to the injected custom selector
    Custom,
}

impl fmt::Display for RoutingPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoutingPriority::Cost => "cost",
            RoutingPriority::Performance => "performance",
            RoutingPriority::Reliability => "reliability",
            RoutingPriority::Balanced => "balanced",
            RoutingPriority::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Everything routing derives from one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestAnalysis {
    pub request_type: RequestType,
    /// For tool requests this holds TOOLS and FUNCTION_CALLING as
    /// alternatives; use [`RequestAnalysis::capabilities_satisfied_by`]
    /// instead of a raw subset check.
    pub required_capabilities: CapabilitySet,
    pub estimated_tokens: u32,
    pub requires_streaming: bool,
    pub requires_tools: bool,
    pub requires_json_mode: bool,
    /// 0.0 = cost insensitive, 1.0 = strongly cost sensitive
    pub cost_sensitivity: f64,
    /// 0.0 = latency insensitive, 1.0 = strongly latency sensitive
    pub latency_sensitivity: f64,
}

impl RequestAnalysis {
    /// Whether a provider advertising `capabilities` can serve this request.
    ///
    /// Tool requests accept native tool support *or* function calling;
    /// every other request type requires all of its bits.
    pub fn capabilities_satisfied_by(&self, capabilities: CapabilitySet) -> bool {
        if self.request_type == RequestType::Tools {
            capabilities.intersects(self.required_capabilities)
        } else {
            capabilities.contains(self.required_capabilities)
        }
    }
}

/// The outcome of provider selection for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Chosen provider; empty when no candidate survived filtering
    pub selected_provider: String,
    /// Remaining candidates in score order, for failover
    pub alternative_providers: Vec<String>,
    pub priority_used: RoutingPriority,
    pub selection_score: f64,
    /// Human-readable explanation of the choice
    pub reasoning: String,
}

impl RoutingDecision {
    /// Well-formed failure decision for an empty candidate set.
    pub fn no_candidates(priority: RoutingPriority, reason: impl Into<String>) -> Self {
        Self {
            selected_provider: String::new(),
            alternative_providers: Vec::new(),
            priority_used: priority,
            selection_score: 0.0,
            reasoning: reason.into(),
        }
    }
}

/// One candidate's score under the active priority, for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateScore {
    pub provider: String,
    pub score: f64,
    pub tie_break: f64,
}

/// Counters kept by the routing logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMetrics {
    pub total_routings: u64,
    pub selections_per_provider: HashMap<String, u64>,
    pub requests_per_type: HashMap<String, u64>,
    pub priority_usage: HashMap<String, u64>,
}

/// Caller-supplied selector for [`RoutingPriority::Custom`].
pub type CustomSelector = Arc<
    dyn Fn(&[String], &RequestAnalysis, &HashMap<String, Arc<ProviderHealth>>) -> Option<String>
        + Send
        + Sync,
>;

/// Classification plus strategy-based provider selection.
pub struct RoutingLogic {
    health_monitor: Arc<ProviderHealthMonitor>,
    default_priority: RwLock<RoutingPriority>,
    load_balancer: RwLock<Option<Arc<LoadBalancer>>>,
    custom_selector: RwLock<Option<CustomSelector>>,

    thinking_keywords: RwLock<Vec<String>>,
    vision_keywords: RwLock<Vec<String>>,
    long_context_threshold: AtomicU32,

    selection_counts: Mutex<HashMap<String, u64>>,
    request_type_counts: Mutex<HashMap<RequestType, u64>>,
    priority_counts: Mutex<HashMap<RoutingPriority, u64>>,
    total_routings: AtomicU64,
}

impl RoutingLogic {
    pub fn new(health_monitor: Arc<ProviderHealthMonitor>) -> Self {
        Self {
            health_monitor,
            default_priority: RwLock::new(RoutingPriority::Balanced),
            load_balancer: RwLock::new(None),
            custom_selector: RwLock::new(None),
            thinking_keywords: RwLock::new(
                DEFAULT_THINKING_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            ),
            vision_keywords: RwLock::new(
                DEFAULT_VISION_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            ),
            long_context_threshold: AtomicU32::new(DEFAULT_LONG_CONTEXT_THRESHOLD),
            selection_counts: Mutex::new(HashMap::new()),
            request_type_counts: Mutex::new(HashMap::new()),
            priority_counts: Mutex::new(HashMap::new()),
            total_routings: AtomicU64::new(0),
        }
    }

    pub fn default_priority(&self) -> RoutingPriority {
        *self.default_priority.read().unwrap()
    }

    pub fn set_default_priority(&self, priority: RoutingPriority) {
        *self.default_priority.write().unwrap() = priority;
    }

    pub fn load_balancer(&self) -> Option<Arc<LoadBalancer>> {
        self.load_balancer.read().unwrap().clone()
    }

    pub fn set_load_balancer(&self, balancer: Option<Arc<LoadBalancer>>) {
        *self.load_balancer.write().unwrap() = balancer;
    }

    pub fn set_custom_selector(&self, selector: CustomSelector) {
        *self.custom_selector.write().unwrap() = Some(selector);
    }

    pub fn set_thinking_keywords(&self, keywords: Vec<String>) {
        *self.thinking_keywords.write().unwrap() =
            keywords.into_iter().map(|k| k.to_lowercase()).collect();
    }

    pub fn set_vision_keywords(&self, keywords: Vec<String>) {
        *self.vision_keywords.write().unwrap() =
            keywords.into_iter().map(|k| k.to_lowercase()).collect();
    }

    pub fn set_long_context_threshold(&self, tokens: u32) {
        self.long_context_threshold.store(tokens, Ordering::SeqCst);
    }

    /// Classify a request. Pure with respect to gateway state: only the
    /// keyword configuration is consulted.
    pub fn analyze_request(&self, request: &Request) -> RequestAnalysis {
        let messages = request.messages().cloned().unwrap_or_default();

        let mut text = String::new();
        let mut has_image_part = false;
        let mut has_text_part = false;

        for message in &messages {
            match message.get("content") {
                Some(serde_json::Value::String(content)) => {
                    has_text_part = true;
                    text.push_str(content);
                    text.push(' ');
                }
                Some(serde_json::Value::Array(parts)) => {
                    for part in parts {
                        match part.get("type").and_then(serde_json::Value::as_str) {
                            Some("image") | Some("image_url") => has_image_part = true,
                            Some("text") => {
                                has_text_part = true;
                                if let Some(t) = part.get("text").and_then(serde_json::Value::as_str)
                                {
                                    text.push_str(t);
                                    text.push(' ');
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        let text = text.to_lowercase();

        let requires_tools = self.detect_tools(request, &messages);
        let requires_streaming = request.wants_streaming();
        let requires_json_mode = request
            .data
            .get("response_format")
            .and_then(|f| f.get("type"))
            .and_then(serde_json::Value::as_str)
            == Some("json_object");

        let estimated_tokens = estimate_tokens(&text, messages.len());
        let vision_keyword_hit = self.matches_keywords(&text, &self.vision_keywords);
        let thinking_keyword_hit = self.matches_keywords(&text, &self.thinking_keywords);
        let long_context =
            estimated_tokens > self.long_context_threshold.load(Ordering::SeqCst);

        // First matching rule wins.
        let request_type = if requires_tools {
            RequestType::Tools
        } else if requires_streaming {
            RequestType::Streaming
        } else if (has_image_part || vision_keyword_hit) && has_text_part {
            RequestType::Multimodal
        } else if has_image_part {
            RequestType::Vision
        } else if thinking_keyword_hit {
            RequestType::Thinking
        } else if long_context {
            RequestType::LongContext
        } else {
            RequestType::Standard
        };

        // Tool requests are served by either native tool support or
        // function calling; every other type needs its exact bit.
        let required_capabilities = match request_type {
            RequestType::Thinking => CapabilitySet::THINKING,
            RequestType::Vision | RequestType::Multimodal => CapabilitySet::VISION,
            RequestType::Tools => CapabilitySet::TOOLS | CapabilitySet::FUNCTION_CALLING,
            RequestType::Streaming => CapabilitySet::STREAMING,
            RequestType::LongContext | RequestType::Standard => CapabilitySet::NONE,
        };

        let latency_sensitivity = if requires_streaming { 0.8 } else { 0.5 };
        let cost_sensitivity = if request_type == RequestType::LongContext {
            0.7
        } else {
            0.5
        };

        RequestAnalysis {
            request_type,
            required_capabilities,
            estimated_tokens,
            requires_streaming,
            requires_tools,
            requires_json_mode,
            cost_sensitivity,
            latency_sensitivity,
        }
    }

    fn detect_tools(&self, request: &Request, messages: &[serde_json::Value]) -> bool {
        if let Some(tools) = request.data.get("tools").and_then(serde_json::Value::as_array) {
            if !tools.is_empty() {
                return true;
            }
        }

        messages.iter().any(|message| {
            if message.get("role").and_then(serde_json::Value::as_str) == Some("tool") {
                return true;
            }
            if message.get("tool_calls").is_some() {
                return true;
            }
            if let Some(parts) = message.get("content").and_then(serde_json::Value::as_array) {
                return parts.iter().any(|part| {
                    matches!(
                        part.get("type").and_then(serde_json::Value::as_str),
                        Some("tool_use") | Some("tool_result")
                    )
                });
            }
            false
        })
    }

    fn matches_keywords(&self, text: &str, keywords: &RwLock<Vec<String>>) -> bool {
        if text.is_empty() {
            return false;
        }
        keywords
            .read()
            .unwrap()
            .iter()
            .any(|keyword| text.contains(keyword.as_str()))
    }

    /// Score candidates under `priority`, best first.
    pub fn score_candidates(
        &self,
        candidates: &[String],
        priority: RoutingPriority,
    ) -> Vec<CandidateScore> {
        let health_map = self.health_monitor.all_provider_health();
        self.score_candidates_with(candidates, priority, &health_map)
    }

    fn score_candidates_with(
        &self,
        candidates: &[String],
        priority: RoutingPriority,
        health_map: &HashMap<String, Arc<ProviderHealth>>,
    ) -> Vec<CandidateScore> {
        let mut scored: Vec<CandidateScore> = candidates
            .iter()
            .map(|name| {
                let (score, tie_break) = match health_map.get(name) {
                    Some(health) => score_provider(health, priority),
                    None => (0.0, 0.0),
                };
                CandidateScore {
                    provider: name.clone(),
                    score,
                    tie_break,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.tie_break.total_cmp(&a.tie_break))
                .then(a.provider.cmp(&b.provider))
        });
        scored
    }

    /// Pick a provider for the request out of the pre-filtered candidates.
    pub fn route(
        &self,
        _request: &Request,
        priority: RoutingPriority,
        analysis: &RequestAnalysis,
        candidates: &[String],
    ) -> RoutingDecision {
        self.total_routings.fetch_add(1, Ordering::SeqCst);
        *self
            .request_type_counts
            .lock()
            .unwrap()
            .entry(analysis.request_type)
            .or_insert(0) += 1;
        *self
            .priority_counts
            .lock()
            .unwrap()
            .entry(priority)
            .or_insert(0) += 1;

        if candidates.is_empty() {
            return RoutingDecision::no_candidates(
                priority,
                format!(
                    "no eligible providers for {} request",
                    analysis.request_type
                ),
            );
        }

        let health_map = self.health_monitor.all_provider_health();
        self.select(priority, analysis, candidates, &health_map)
    }

    fn select(
        &self,
        priority: RoutingPriority,
        analysis: &RequestAnalysis,
        candidates: &[String],
        health_map: &HashMap<String, Arc<ProviderHealth>>,
    ) -> RoutingDecision {
        if priority == RoutingPriority::Custom {
            let selector = self.custom_selector.read().unwrap().clone();
            if let Some(selector) = selector {
                if let Some(selected) = selector(candidates, analysis, health_map) {
                    if candidates.contains(&selected) {
                        let alternatives: Vec<String> = self
                            .score_candidates_with(candidates, RoutingPriority::Balanced, health_map)
                            .into_iter()
                            .map(|c| c.provider)
                            .filter(|p| p != &selected)
                            .collect();
                        return self.finish_decision(RoutingDecision {
                            selected_provider: selected,
                            alternative_providers: alternatives,
                            priority_used: RoutingPriority::Custom,
                            selection_score: 1.0,
                            reasoning: "custom selector".to_string(),
                        });
                    }
                    tracing::warn!(
                        provider = %selected,
                        "custom selector returned a non-candidate; falling back to balanced"
                    );
                }
            } else {
                tracing::warn!("custom priority requested without a selector; using balanced");
            }
            return self.select(RoutingPriority::Balanced, analysis, candidates, health_map);
        }

        let scored = self.score_candidates_with(candidates, priority, health_map);
        let best_score = scored[0].score;
        let tied: Vec<String> = scored
            .iter()
            .take_while(|c| (best_score - c.score).abs() <= SCORE_EPSILON)
            .map(|c| c.provider.clone())
            .collect();

        let (selected, via_balancer) = if tied.len() > 1 {
            let balancer = self.load_balancer();
            match balancer {
                Some(balancer) => (
                    balancer
                        .select_provider(&tied, analysis.request_type)
                        .unwrap_or_else(|| tied[0].clone()),
                    true,
                ),
                None => (tied[0].clone(), false),
            }
        } else {
            (scored[0].provider.clone(), false)
        };

        let alternatives: Vec<String> = scored
            .iter()
            .map(|c| c.provider.clone())
            .filter(|p| p != &selected)
            .collect();

        let reasoning = if via_balancer {
            format!(
                "{priority} strategy tied {} providers at {best_score:.3}; load balancer chose '{selected}'",
                tied.len()
            )
        } else {
            format!(
                "{priority} strategy selected '{selected}' (score {best_score:.3}) from {} candidates",
                candidates.len()
            )
        };

        self.finish_decision(RoutingDecision {
            selected_provider: selected,
            alternative_providers: alternatives,
            priority_used: priority,
            selection_score: best_score,
            reasoning,
        })
    }

    fn finish_decision(&self, decision: RoutingDecision) -> RoutingDecision {
        *self
            .selection_counts
            .lock()
            .unwrap()
            .entry(decision.selected_provider.clone())
            .or_insert(0) += 1;
        tracing::debug!(
            provider = %decision.selected_provider,
            score = decision.selection_score,
            reasoning = %decision.reasoning,
            "routing decision"
        );
        decision
    }

    pub fn metrics_snapshot(&self) -> RoutingMetrics {
        RoutingMetrics {
            total_routings: self.total_routings.load(Ordering::SeqCst),
            selections_per_provider: self.selection_counts.lock().unwrap().clone(),
            requests_per_type: self
                .request_type_counts
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            priority_usage: self
                .priority_counts
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }
}

/// Primary score and tie-break for one provider under a strategy. Higher is
/// better for both.
fn score_provider(health: &ProviderHealth, priority: RoutingPriority) -> (f64, f64) {
    let metrics = health.metrics();
    match priority {
        RoutingPriority::Cost => {
            let total_cost = metrics.cost_per_input_token + metrics.cost_per_output_token;
            (-total_cost, metrics.success_rate)
        }
        RoutingPriority::Performance => {
            (metrics.performance_score, -metrics.avg_response_time_ms)
        }
        RoutingPriority::Reliability => (
            metrics.success_rate,
            -f64::from(health.consecutive_failures()),
        ),
        RoutingPriority::Balanced | RoutingPriority::Custom => {
            let score = 0.4 * metrics.performance_score
                + 0.3 * metrics.success_rate
                + 0.2 * metrics.cost_score
                + 0.1 * (f64::from(health.priority_score()) / 100.0);
            (score, f64::from(health.priority_score()))
        }
    }
}

/// Deterministic token estimate: roughly four characters per token plus a
/// fixed per-message overhead.
fn estimate_tokens(text: &str, message_count: usize) -> u32 {
    let chars = text.chars().count() as u32;
    let overhead = message_count as u32 * 8;
    (chars.div_ceil(4) + overhead).max(1)
}
