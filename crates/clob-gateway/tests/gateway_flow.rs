//! End-to-end gateway flow tests.
//!
//! Drives the full resilience path with a scripted venue: sequence
//! uniqueness under concurrent order submission, quota isolation between
//! endpoint classes, breaker recovery through a half-open trial, and batch
//! fan-out under cancellation.

use std::sync::Arc;
use std::time::Duration;

use clob_core::{DefaultClassifier, EndpointClass, GateError};
use clob_gateway::{CallSpec, GatewayConfig, MockVenue, VenueGateway};
use clob_resilience::{BreakerState, QuotaConfig};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn fast_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.jitter = 0.0;
    config
}

fn build_gateway(venue: Arc<MockVenue>, config: GatewayConfig) -> Arc<VenueGateway<clob_core::SystemClock>> {
    Arc::new(VenueGateway::with_system_clock(config, venue, Arc::new(DefaultClassifier)).unwrap())
}

#[tokio::test]
async fn concurrent_orders_get_unique_increasing_sequence_numbers() {
    let venue = Arc::new(MockVenue::new());
    let gateway = build_gateway(Arc::clone(&venue), GatewayConfig::default());

    let mut handles = Vec::new();
    for i in 0..32 {
        let gateway = Arc::clone(&gateway);
        handles.push(tokio::spawn(async move {
            let spec = CallSpec::mutate("order-submit", "0xmaker", json!({ "order": i }));
            gateway.call(spec).await
        }));
    }

    let mut nonces = Vec::new();
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        nonces.push(response["nonce"].as_u64().unwrap());
    }

    nonces.sort_unstable();
    let before = nonces.len();
    nonces.dedup();
    assert_eq!(nonces.len(), before, "no duplicate nonces under concurrency");
}

#[tokio::test]
async fn quota_exhaustion_on_one_class_leaves_others_untouched() {
    let venue = Arc::new(MockVenue::new());
    let mut config = fast_config();
    config.retry.max_attempts = 1;
    config.quotas.insert(
        "order-submit".to_string(),
        QuotaConfig {
            capacity: 2,
            window_ms: 60_000,
            safety_margin: 1.0,
            per_identity: false,
        },
    );
    let gateway = build_gateway(Arc::clone(&venue), config);

    let order = CallSpec::mutate("order-submit", "0xmaker", json!({}))
        .with_admission_timeout(Duration::from_millis(5));
    gateway.call(order.clone()).await.unwrap();
    gateway.call(order.clone()).await.unwrap();
    assert!(gateway.call(order).await.is_err());

    // Unconfigured market-data class is not contaminated.
    for _ in 0..20 {
        gateway
            .call(CallSpec::read("market-data", json!({"b": 1})))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn breaker_recovers_through_half_open_trial() {
    let venue = Arc::new(MockVenue::new());
    let mut config = fast_config();
    config.breaker.failure_threshold = 2;
    config.breaker.recovery_timeout_ms = 50;
    config.retry.max_attempts = 1;
    let gateway = build_gateway(Arc::clone(&venue), config);
    let class = EndpointClass::new("market-data");

    // Two fatal-for-retry but breaker-tripping transport failures.
    venue.push_errors(GateError::transport("down"), 2);
    for _ in 0..2 {
        let _ = gateway
            .call(CallSpec::read("market-data", json!({})))
            .await;
    }
    assert_eq!(gateway.breaker_state(&class), Some(BreakerState::Open));

    // Before the recovery timeout: fail fast, venue untouched.
    let calls_before = venue.calls();
    assert!(matches!(
        gateway
            .call(CallSpec::read("market-data", json!({})))
            .await
            .unwrap_err(),
        GateError::CircuitOpen { .. }
    ));
    assert_eq!(venue.calls(), calls_before);

    // After the timeout the single trial succeeds and closes the circuit.
    tokio::time::sleep(Duration::from_millis(60)).await;
    gateway
        .call(CallSpec::read("market-data", json!({})))
        .await
        .unwrap();
    assert_eq!(gateway.breaker_state(&class), Some(BreakerState::Closed));
}

#[tokio::test]
async fn batch_fans_out_with_isolation_and_cancellation() {
    let venue = Arc::new(MockVenue::new());
    venue.set_delay(Duration::from_millis(10));
    let mut config = fast_config();
    config.retry.max_attempts = 1;
    config.batch.max_concurrency = 4;
    let gateway = build_gateway(Arc::clone(&venue), config);

    let specs: Vec<CallSpec> = (0..12)
        .map(|i| {
            let mut spec = CallSpec::read("positions", json!({ "wallet": format!("0x{i}") }));
            spec.dedupe = false;
            spec
        })
        .collect();

    let outcomes = gateway.call_batch(specs, CancellationToken::new()).await;
    assert_eq!(outcomes.len(), 12);
    assert!(outcomes.iter().all(|o| o.result.is_ok()));

    // Cancelled mid-flight: started items finish, the rest report Cancelled.
    let cancel = CancellationToken::new();
    let specs: Vec<CallSpec> = (0..12)
        .map(|i| {
            let mut spec = CallSpec::read("positions", json!({ "wallet": format!("0x{i}") }));
            spec.dedupe = false;
            spec
        })
        .collect();
    let batch = {
        let gateway = Arc::clone(&gateway);
        let cancel = cancel.clone();
        tokio::spawn(async move { gateway.call_batch(specs, cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    cancel.cancel();
    let outcomes = batch.await.unwrap();

    let cancelled = outcomes
        .iter()
        .filter(|o| matches!(o.result, Err(GateError::Cancelled)))
        .count();
    let completed = outcomes.iter().filter(|o| o.result.is_ok()).count();
    assert_eq!(cancelled + completed, 12);
    assert!(completed >= 4, "in-flight items completed naturally");
    assert!(cancelled > 0, "pending items cancelled promptly");
}

#[tokio::test]
async fn metadata_reads_memoize_and_collapse() {
    let venue = Arc::new(MockVenue::new());
    venue.set_delay(Duration::from_millis(30));
    let gateway = build_gateway(Arc::clone(&venue), GatewayConfig::default());

    // Concurrent identical reads collapse into one venue call.
    let mut handles = Vec::new();
    for _ in 0..6 {
        let gateway = Arc::clone(&gateway);
        handles.push(tokio::spawn(async move {
            gateway
                .call_cached("tick:42", CallSpec::read("market-data", json!({"token": "42"})))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(venue.calls(), 1);

    // Later read is served from the cache without touching the venue.
    gateway
        .call_cached("tick:42", CallSpec::read("market-data", json!({"token": "42"})))
        .await
        .unwrap();
    assert_eq!(venue.calls(), 1);
}
