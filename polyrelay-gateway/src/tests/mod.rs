//! End-to-end scenarios against the full manager stack, driven through
//! scripted mock bridges.

use crate::balancer::{LoadBalancer, Strategy};
use crate::config::ProviderSettings;
use crate::health::HealthStatus;
use crate::manager::GatewayManager;
use polyrelay_core::{Bridge, MockBridge, ProviderError, Request};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Route `RUST_LOG`-filtered tracing output through the test harness.
/// Subsequent calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn settings(name: &str, models: &[&str]) -> ProviderSettings {
    ProviderSettings {
        name: name.to_string(),
        base_url: "https://api.example.com/v1".to_string(),
        api_key: "test-key".to_string(),
        models: models.iter().map(|m| m.to_string()).collect(),
        ..ProviderSettings::default()
    }
}

fn wire(manager: &GatewayManager, config: ProviderSettings) -> Arc<MockBridge> {
    init_tracing();
    let bridge = Arc::new(MockBridge::new(config.name.clone()));
    manager.add_provider(config).unwrap();
    manager.add_provider_adapter(Arc::clone(&bridge) as Arc<dyn Bridge>);
    bridge
}

fn chat(model: &str, content: &str) -> Request {
    Request::new(
        model,
        serde_json::json!({
            "messages": [{ "role": "user", "content": content }]
        }),
    )
}

#[tokio::test]
async fn vanilla_route_hits_the_only_healthy_provider() {
    let manager = GatewayManager::new();
    let bridge = wire(&manager, settings("syn", &["synthetic-gpt-4"]));
    manager.initialize();

    let response = manager
        .route_request(&chat("synthetic-gpt-4", "hi"))
        .await;

    assert!(response.success);
    assert_eq!(response.provider_name, "syn");
    assert_eq!(response.status_code, 200);
    assert_eq!(bridge.request_count(), 1);

    let recent = manager.get_recent_metrics(10);
    assert_eq!(recent.len(), 1);
    assert!(recent[0].success);
    assert_eq!(recent[0].provider_name, "syn");
    manager.shutdown().await;
}

#[tokio::test]
async fn capability_filter_routes_vision_to_the_capable_provider() {
    let manager = GatewayManager::new();

    // A is faster on paper but cannot do vision.
    let mut a = settings("a", &["m"]);
    a.avg_response_time_ms = 50.0;
    let a_bridge = wire(&manager, a);

    let mut b = settings("b", &["m"]);
    b.supports_vision = true;
    b.avg_response_time_ms = 2000.0;
    let b_bridge = wire(&manager, b);
    manager.initialize();

    let request = Request::new(
        "m",
        serde_json::json!({
            "messages": [{ "role": "user", "content": [
                { "type": "text", "text": "what is shown here" },
                { "type": "image", "source": { "data": "..." } }
            ]}]
        }),
    );
    let response = manager.route_request(&request).await;

    assert!(response.success);
    assert_eq!(response.provider_name, "b");
    assert_eq!(a_bridge.request_count(), 0);
    assert_eq!(b_bridge.request_count(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn function_calling_only_provider_serves_tool_requests() {
    let manager = GatewayManager::new();

    // No tool support at all on the first provider; the second one only
    // advertises function calling, never native tools.
    let plain_bridge = wire(&manager, settings("plain", &["m"]));

    let mut fc = settings("fc", &["m"]);
    fc.supports_function_calling = true;
    let fc_bridge = wire(&manager, fc);
    manager.initialize();

    let request = Request::new(
        "m",
        serde_json::json!({
            "tools": [{ "name": "search" }],
            "messages": [{ "role": "user", "content": "look this up" }]
        }),
    );
    let response = manager.route_request(&request).await;

    assert!(response.success);
    assert_eq!(response.provider_name, "fc");
    assert_eq!(plain_bridge.request_count(), 0);
    assert_eq!(fc_bridge.request_count(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn circuit_breaker_trips_blocks_and_recovers_via_probes() {
    let manager = GatewayManager::new();
    let mut c = settings("c", &["m"]);
    c.max_failures = 3;
    c.failure_timeout = Duration::from_millis(100);
    c.required_probes = 2;
    let bridge = wire(&manager, c);
    manager.initialize();

    // Three consecutive bridge failures trip the circuit.
    bridge.push_failures(3, 502);
    for _ in 0..3 {
        let response = manager.route_request(&chat("m", "hi")).await;
        assert!(!response.success);
    }
    assert_eq!(manager.provider_status("c"), Some(HealthStatus::CircuitOpen));
    assert_eq!(bridge.request_count(), 3);

    // While the circuit is open the bridge must not be called.
    let response = manager.route_request(&chat("m", "hi")).await;
    assert!(!response.success);
    assert_eq!(response.status_code, 503);
    assert_eq!(bridge.request_count(), 3);

    // After the failure timeout, requests are admitted as probes; the
    // circuit closes after the required number of successes.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let probe1 = manager.route_request(&chat("m", "hi")).await;
    assert!(probe1.success);
    assert_eq!(manager.provider_status("c"), Some(HealthStatus::CircuitOpen));

    let probe2 = manager.route_request(&chat("m", "hi")).await;
    assert!(probe2.success);
    assert_eq!(manager.provider_status("c"), Some(HealthStatus::Healthy));
    assert_eq!(bridge.request_count(), 5);
    manager.shutdown().await;
}

#[tokio::test]
async fn failover_retries_on_the_next_best_provider() {
    let manager = GatewayManager::new();

    // P1 is preferred by score; its first call fails once with 502.
    let mut p1 = settings("p1", &["m"]);
    p1.priority_score = 150;
    let p1_bridge = wire(&manager, p1);
    p1_bridge.push_failures(1, 502);

    let mut p2 = settings("p2", &["m"]);
    p2.priority_score = 50;
    let p2_bridge = wire(&manager, p2);
    manager.initialize();

    let response = manager.route_request(&chat("m", "hi")).await;

    assert!(response.success);
    assert_eq!(response.provider_name, "p2");
    assert_eq!(p1_bridge.request_count(), 1);
    assert_eq!(p2_bridge.request_count(), 1);

    // The ring holds one failed record for p1 and one success for p2.
    let recent = manager.get_recent_metrics(10);
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].provider_name, "p2");
    assert!(recent[0].success);
    assert_eq!(recent[1].provider_name, "p1");
    assert!(!recent[1].success);
    assert_eq!(recent[1].http_status_code, 502);

    assert_eq!(manager.get_metrics().failover_count, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn round_robin_distributes_exactly_across_equivalent_providers() {
    let manager = GatewayManager::new();
    let bridges: Vec<Arc<MockBridge>> = ["a", "b", "c"]
        .iter()
        .map(|name| wire(&manager, settings(name, &["m"])))
        .collect();
    manager.enable_load_balancer(LoadBalancer::new(Strategy::RoundRobin));
    manager.initialize();

    for _ in 0..300 {
        let response = manager.route_request(&chat("m", "hi")).await;
        assert!(response.success);
    }

    for bridge in &bridges {
        assert_eq!(bridge.request_count(), 100);
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn permanent_client_error_does_not_fail_over() {
    let manager = GatewayManager::new();
    let a_bridge = wire(&manager, settings("a", &["m"]));
    let b_bridge = wire(&manager, settings("b", &["m"]));
    manager.initialize();

    // Whichever provider is tried first answers 400; the other must not be
    // consulted.
    a_bridge.push_failures(1, 400);
    b_bridge.push_failures(1, 400);

    let response = manager.route_request(&chat("m", "hi")).await;
    assert!(!response.success);
    assert_eq!(response.status_code, 400);
    assert_eq!(a_bridge.request_count() + b_bridge.request_count(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn empty_pool_returns_503() {
    let manager = GatewayManager::new();
    manager.initialize();

    let response = manager.route_request(&chat("m", "hi")).await;
    assert!(!response.success);
    assert_eq!(response.status_code, 503);
    assert!(response.provider_name.is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn single_unhealthy_provider_fails_with_last_upstream_status() {
    let manager = GatewayManager::new();
    let bridge = wire(&manager, settings("only", &["m"]));
    bridge.push_failures(10, 502);
    manager.initialize();

    let response = manager.route_request(&chat("m", "hi")).await;
    assert!(!response.success);
    assert_eq!(response.status_code, 502);
    // One upstream attempt per provider per failover step.
    assert_eq!(bridge.request_count(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn capability_mismatch_reports_503_with_reason() {
    let manager = GatewayManager::new();
    let _bridge = wire(&manager, settings("plain", &["m"]));
    manager.initialize();

    let request = Request::new(
        "m",
        serde_json::json!({
            "messages": [{ "role": "user", "content": [
                { "type": "image", "source": { "data": "..." } }
            ]}]
        }),
    );
    let response = manager.route_request(&request).await;

    assert!(!response.success);
    assert_eq!(response.status_code, 503);
    assert!(response
        .error_message
        .unwrap()
        .contains("required capabilities"));
    manager.shutdown().await;
}

#[tokio::test]
async fn bridge_timeout_maps_to_502() {
    let manager = GatewayManager::new();
    let bridge = wire(&manager, settings("slow", &["m"]));
    bridge.set_latency(Duration::from_millis(200));
    manager.set_request_timeout(Duration::from_millis(30));
    manager.initialize();

    let response = manager.route_request(&chat("m", "hi")).await;
    assert!(!response.success);
    assert_eq!(response.status_code, 502);
    manager.shutdown().await;
}

#[tokio::test]
async fn scripted_bridge_error_surfaces_with_its_status() {
    let manager = GatewayManager::new();
    let bridge = wire(&manager, settings("flaky", &["m"]));
    bridge.push_outcome(Err(ProviderError::RateLimit));
    manager.initialize();

    // Rate limit is transient; with no alternative the last status wins.
    let response = manager.route_request(&chat("m", "hi")).await;
    assert!(!response.success);
    assert_eq!(response.status_code, 429);
    manager.shutdown().await;
}

#[tokio::test]
async fn specialized_provider_preseeds_blank_model_requests() {
    let manager = GatewayManager::new();
    let mut thinker = settings("thinker", &["m"]);
    thinker.supports_thinking = true;
    thinker.priority_score = 10;
    let thinker_bridge = wire(&manager, thinker);

    let mut generalist = settings("generalist", &["m"]);
    generalist.supports_thinking = true;
    generalist.priority_score = 200;
    let _generalist_bridge = wire(&manager, generalist);

    manager.set_thinking_provider("thinker").unwrap();
    manager.initialize();

    // Blank model: the configured thinking provider wins despite the score.
    let response = manager
        .route_request(&chat("", "analyze this step by step"))
        .await;
    assert!(response.success);
    assert_eq!(response.provider_name, "thinker");
    assert_eq!(thinker_bridge.request_count(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn metrics_collection_can_be_disabled() {
    let manager = GatewayManager::new();
    let _bridge = wire(&manager, settings("a", &["m"]));
    manager.enable_metrics_collection(false);
    manager.initialize();

    let response = manager.route_request(&chat("m", "hi")).await;
    assert!(response.success);
    assert!(manager.get_recent_metrics(10).is_empty());

    manager.enable_metrics_collection(true);
    manager.route_request(&chat("m", "hi")).await;
    assert_eq!(manager.get_recent_metrics(10).len(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn route_callback_observes_each_attempt() {
    let manager = GatewayManager::new();
    let p1_bridge = wire(&manager, settings("p1", &["m"]));
    p1_bridge.push_failures(1, 502);
    let _p2_bridge = wire(&manager, settings("p2", &["m"]));
    manager.initialize();

    let observed: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    manager.set_route_callback(Arc::new(move |metric| {
        sink.lock()
            .unwrap()
            .push((metric.provider_name.clone(), metric.success));
    }));

    let response = manager.route_request(&chat("m", "hi")).await;
    assert!(response.success);

    let observed = observed.lock().unwrap().clone();
    assert_eq!(observed.len(), 2);
    assert!(!observed[0].1);
    assert!(observed[1].1);
    manager.shutdown().await;
}

#[tokio::test]
async fn provider_change_callback_sees_adds_and_removes() {
    let manager = GatewayManager::new();
    let events: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    manager.set_provider_change_callback(Arc::new(move |name, added| {
        sink.lock().unwrap().push((name.to_string(), added));
    }));

    manager.add_provider(settings("a", &["m"])).unwrap();
    manager.remove_provider("a");

    let events = events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![("a".to_string(), true), ("a".to_string(), false)]
    );
}

#[tokio::test]
async fn concurrent_routing_and_removal_stays_consistent() {
    let manager = Arc::new(GatewayManager::new());
    let _a = wire(&manager, settings("a", &["m"]));
    let _b = wire(&manager, settings("b", &["m"]));
    manager.initialize();

    let router = Arc::clone(&manager);
    let route_task = tokio::spawn(async move {
        let mut outcomes = Vec::new();
        for _ in 0..50 {
            let response = router.route_request(&chat("m", "hi")).await;
            // Every response is well-formed: either served or a clean 503.
            assert!(response.success || response.status_code == 503);
            outcomes.push(response.success);
            tokio::task::yield_now().await;
        }
        outcomes
    });

    let remover = Arc::clone(&manager);
    let remove_task = tokio::spawn(async move {
        tokio::task::yield_now().await;
        remover.remove_provider("a");
        tokio::task::yield_now().await;
        remover.remove_provider("b");
    });

    let (outcomes, _) = tokio::join!(route_task, remove_task);
    let outcomes = outcomes.unwrap();
    assert_eq!(outcomes.len(), 50);

    // Metrics were recorded against providers that existed at dispatch time.
    for metric in manager.get_recent_metrics(100) {
        assert!(metric.provider_name.is_empty() || ["a", "b"].contains(&metric.provider_name.as_str()));
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn concurrent_requests_are_all_served() {
    let manager = Arc::new(GatewayManager::new());
    let _a = wire(&manager, settings("a", &["m"]));
    let _b = wire(&manager, settings("b", &["m"]));
    manager.initialize();

    let served = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let served = Arc::clone(&served);
            tokio::spawn(async move {
                let response = manager.route_request(&chat("m", "hi")).await;
                if response.success {
                    served.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    futures::future::join_all(tasks).await;

    assert_eq!(served.load(Ordering::SeqCst), 32);
    assert_eq!(manager.get_recent_metrics(100).len(), 32);
    manager.shutdown().await;
}

#[tokio::test]
async fn capacity_filter_excludes_saturated_providers() {
    let manager = GatewayManager::new();
    let mut tight = settings("tight", &["m"]);
    tight.max_concurrent_requests = 1;
    let tight_bridge = wire(&manager, tight);
    tight_bridge.set_latency(Duration::from_millis(100));

    let roomy_bridge = wire(&manager, settings("roomy", &["m"]));
    manager.initialize();

    // Occupy tight's single slot, then route again while it is busy.
    let manager = Arc::new(manager);
    let occupant = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .route_request_to_provider(&chat("m", "hold the slot"), "tight")
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let response = manager.route_request(&chat("m", "hi")).await;
    assert!(response.success);
    assert_eq!(response.provider_name, "roomy");
    assert_eq!(roomy_bridge.request_count(), 1);

    assert!(occupant.await.unwrap().success);
    manager.shutdown().await;
}
