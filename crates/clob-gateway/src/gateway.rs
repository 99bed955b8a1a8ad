//! Venue gateway: the resilience path around every remote call.
//!
//! Control flow per call: circuit breaker check → retry executor drives
//! attempts → admission acquire per attempt → optional single-flight
//! deduplication (reads) → sequence number injection (identity-mutating
//! calls) → remote execution → outcome classification feeding the breaker.
//! Batch callers push the same path through the bounded worker pool, one
//! task per item.

use std::sync::Arc;
use std::time::Duration;

use clob_batch::{BatchOutcome, BatchPool};
use clob_core::{
    Clock, CoreResult, EndpointClass, ErrorClassifier, Fingerprint, Identity, SystemClock,
};
use clob_resilience::{
    AdmissionController, BreakerConfig, BreakerState, CircuitBreaker, RequestDeduplicator,
    RetryExecutor, SequenceAllocator, TtlCache,
};
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::remote::DynRemoteCall;

/// Entries examined per maintenance sweep of the cache.
const MAINTENANCE_SWEEP: usize = 100;

/// One logical call through the gateway.
#[derive(Debug, Clone)]
pub struct CallSpec {
    /// Endpoint class for admission and breaker scoping.
    pub endpoint_class: EndpointClass,
    /// Identity the call acts for, if any.
    pub identity: Option<Identity>,
    /// Opaque request payload handed to the call executor.
    pub payload: Value,
    /// Identity-mutating calls get a fresh sequence number per attempt.
    pub mutating: bool,
    /// Collapse onto an identical in-flight request (reads only).
    pub dedupe: bool,
    /// Bound on waiting for admission; `None` waits as long as needed.
    pub admission_timeout_ms: Option<u64>,
}

impl CallSpec {
    /// A read call: deduplicated, no sequence number.
    #[must_use]
    pub fn read(endpoint_class: impl Into<EndpointClass>, payload: Value) -> Self {
        Self {
            endpoint_class: endpoint_class.into(),
            identity: None,
            payload,
            mutating: false,
            dedupe: true,
            admission_timeout_ms: None,
        }
    }

    /// An identity-mutating call: sequence-numbered, never deduplicated.
    #[must_use]
    pub fn mutate(
        endpoint_class: impl Into<EndpointClass>,
        identity: impl Into<Identity>,
        payload: Value,
    ) -> Self {
        Self {
            endpoint_class: endpoint_class.into(),
            identity: Some(identity.into()),
            payload,
            mutating: true,
            dedupe: false,
            admission_timeout_ms: None,
        }
    }

    /// Attribute the call to an identity.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<Identity>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Bound the admission wait.
    #[must_use]
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Composition root owning every resilience component.
///
/// Constructed explicitly and passed by handle to call sites; never ambient
/// global state, so tests build isolated instances.
pub struct VenueGateway<C: Clock + Clone> {
    executor: DynRemoteCall,
    classifier: Arc<dyn ErrorClassifier>,
    allocator: SequenceAllocator<C>,
    admission: AdmissionController<C>,
    breakers: DashMap<EndpointClass, Arc<CircuitBreaker<C>>>,
    breaker_config: BreakerConfig,
    retry: RetryExecutor,
    dedup: RequestDeduplicator<Value>,
    cache: TtlCache<String, Value, C>,
    pool: BatchPool,
    clock: C,
}

impl<C: Clock + Clone + 'static> VenueGateway<C> {
    /// Build a gateway from validated configuration.
    pub fn new(
        config: GatewayConfig,
        executor: DynRemoteCall,
        classifier: Arc<dyn ErrorClassifier>,
        clock: C,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let quotas = config
            .quotas
            .into_iter()
            .map(|(class, quota)| (EndpointClass::new(class), quota))
            .collect();

        Ok(Self {
            executor,
            classifier,
            allocator: SequenceAllocator::new(clock.clone()),
            admission: AdmissionController::new(quotas, clock.clone())?,
            breakers: DashMap::new(),
            breaker_config: config.breaker,
            retry: RetryExecutor::new(config.retry)?,
            dedup: RequestDeduplicator::new(),
            cache: TtlCache::new(config.cache, clock.clone())?,
            pool: BatchPool::new(config.batch)?,
            clock,
        })
    }

    /// Execute one call through the full resilience path.
    pub async fn call(&self, spec: CallSpec) -> CoreResult<Value> {
        let breaker = self.breaker(&spec.endpoint_class)?;
        let spec_ref = &spec;

        let result = self
            .retry
            .run(breaker.as_ref(), self.classifier.as_ref(), move |attempt| {
                async move { self.attempt(spec_ref, attempt).await }
            })
            .await;

        if let Err(error) = &result {
            warn!(
                endpoint_class = %spec.endpoint_class,
                identity = ?spec.identity,
                %error,
                "gateway call failed"
            );
        }
        result
    }

    /// Execute many calls with bounded concurrency and per-item isolation.
    ///
    /// Every item runs the same guarded path as [`call`](Self::call); a
    /// batch is not a bypass of admission or breaker checks.
    pub async fn call_batch(
        &self,
        specs: Vec<CallSpec>,
        cancel: CancellationToken,
    ) -> Vec<BatchOutcome<CallSpec, Value>> {
        self.pool.run(specs, cancel, |spec| self.call(spec)).await
    }

    /// Read-through helper over the metadata cache: serve `cache_key` if
    /// live, otherwise execute `spec` and memoize the response with the
    /// default TTL.
    pub async fn call_cached(&self, cache_key: &str, spec: CallSpec) -> CoreResult<Value> {
        if let Some(value) = self.cache.get(&cache_key.to_string()) {
            return Ok(value);
        }
        let value = self.call(spec).await?;
        self.cache.put(cache_key.to_string(), value.clone());
        Ok(value)
    }

    /// The shared metadata cache.
    #[must_use]
    pub fn metadata_cache(&self) -> &TtlCache<String, Value, C> {
        &self.cache
    }

    /// The sequence allocator (e.g. for venue-reported seeding).
    #[must_use]
    pub fn sequence_allocator(&self) -> &SequenceAllocator<C> {
        &self.allocator
    }

    /// The admission controller.
    #[must_use]
    pub fn admission(&self) -> &AdmissionController<C> {
        &self.admission
    }

    /// State of the breaker for an endpoint class, if one exists yet.
    #[must_use]
    pub fn breaker_state(&self, endpoint_class: &EndpointClass) -> Option<BreakerState> {
        self.breakers
            .get(endpoint_class)
            .map(|breaker| breaker.state())
    }

    /// Manually open the breaker for an endpoint class.
    pub fn force_open(&self, endpoint_class: &EndpointClass) -> CoreResult<()> {
        self.breaker(endpoint_class)?.force_open();
        Ok(())
    }

    /// Manually close the breaker for an endpoint class.
    pub fn force_close(&self, endpoint_class: &EndpointClass) -> CoreResult<()> {
        self.breaker(endpoint_class)?.force_close();
        Ok(())
    }

    /// Reset the breaker for an endpoint class to its initial state.
    pub fn reset_breaker(&self, endpoint_class: &EndpointClass) -> CoreResult<()> {
        self.breaker(endpoint_class)?.reset();
        Ok(())
    }

    /// Spawn the supervised maintenance task: periodically evicts idle
    /// sequence identities and admission buckets and sweeps expired cache
    /// entries, until `cancel` fires.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        idle_after: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("maintenance task stopped");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {
                        let identities = gateway.allocator.evict_idle(idle_after);
                        let buckets = gateway.admission.evict_idle(idle_after);
                        let expired = gateway.cache.evict_expired(MAINTENANCE_SWEEP);
                        debug!(identities, buckets, expired, "maintenance sweep");
                    }
                }
            }
        })
    }

    /// One admitted attempt: admission, optional dedup, then execution.
    async fn attempt(&self, spec: &CallSpec, attempt: u32) -> CoreResult<Value> {
        debug!(
            endpoint_class = %spec.endpoint_class,
            attempt,
            "dispatching attempt"
        );

        self.admission
            .acquire(
                &spec.endpoint_class,
                spec.identity.as_ref(),
                spec.admission_timeout_ms.map(Duration::from_millis),
            )
            .await?;

        if spec.dedupe && !spec.mutating {
            let fingerprint = Fingerprint::from_parts(
                &spec.endpoint_class,
                spec.identity.as_ref(),
                &spec.payload,
            );
            self.dedup
                .dedupe(fingerprint, move || self.execute_once(spec))
                .await
        } else {
            self.execute_once(spec).await
        }
    }

    /// Hand the payload to the call executor, stamping a fresh sequence
    /// number onto identity-mutating calls. A retried attempt allocates a
    /// new number; reusing one would be rejected by the venue as a replay.
    async fn execute_once(&self, spec: &CallSpec) -> CoreResult<Value> {
        let mut payload = spec.payload.clone();
        if spec.mutating {
            if let Some(identity) = &spec.identity {
                let sequence = self.allocator.next(identity);
                if let Value::Object(map) = &mut payload {
                    map.insert("nonce".to_string(), Value::from(sequence));
                }
            }
        }
        self.executor
            .execute(&spec.endpoint_class, spec.identity.as_ref(), payload)
            .await
    }

    /// Get or lazily create the breaker for an endpoint class.
    fn breaker(&self, endpoint_class: &EndpointClass) -> CoreResult<Arc<CircuitBreaker<C>>> {
        if let Some(breaker) = self.breakers.get(endpoint_class) {
            return Ok(Arc::clone(&breaker));
        }

        let created = CircuitBreaker::new(
            endpoint_class.as_str(),
            self.breaker_config.clone(),
            self.clock.clone(),
        )?;
        Ok(Arc::clone(
            self.breakers
                .entry(endpoint_class.clone())
                .or_insert_with(|| Arc::new(created))
                .value(),
        ))
    }
}

impl VenueGateway<SystemClock> {
    /// Build a gateway on the system clock.
    pub fn with_system_clock(
        config: GatewayConfig,
        executor: DynRemoteCall,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> GatewayResult<Self> {
        Self::new(config, executor, classifier, SystemClock)
    }
}

#[cfg(test)]
mod tests {
    use clob_core::{DefaultClassifier, GateError};
    use clob_resilience::QuotaConfig;
    use serde_json::json;

    use super::*;
    use crate::remote::MockVenue;

    fn gateway_with(
        venue: Arc<MockVenue>,
        config: GatewayConfig,
    ) -> VenueGateway<SystemClock> {
        VenueGateway::with_system_clock(config, venue, Arc::new(DefaultClassifier)).unwrap()
    }

    fn fast_retry_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        config.retry.jitter = 0.0;
        config
    }

    #[tokio::test]
    async fn test_mutating_call_stamps_sequence_number() {
        let venue = Arc::new(MockVenue::new());
        let gateway = gateway_with(Arc::clone(&venue), GatewayConfig::default());

        let spec = CallSpec::mutate("order-submit", "0xabc", json!({"side": "buy"}));
        let first = gateway.call(spec.clone()).await.unwrap();
        let second = gateway.call(spec).await.unwrap();

        let n1 = first["nonce"].as_u64().unwrap();
        let n2 = second["nonce"].as_u64().unwrap();
        assert!(n2 > n1, "sequence numbers strictly increase");
        assert_eq!(first["side"], "buy");
    }

    #[tokio::test]
    async fn test_read_call_passes_payload_through() {
        let venue = Arc::new(MockVenue::new());
        let gateway = gateway_with(Arc::clone(&venue), GatewayConfig::default());

        let result = gateway
            .call(CallSpec::read("market-data", json!({"token": "42"})))
            .await
            .unwrap();
        assert_eq!(result, json!({"token": "42"}));
        assert!(result.get("nonce").is_none());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let venue = Arc::new(MockVenue::new());
        venue.push_errors(GateError::transport("connection reset"), 2);
        venue.push_response(Ok(json!({"ok": true})));

        let gateway = gateway_with(Arc::clone(&venue), fast_retry_config());
        let result = gateway
            .call(CallSpec::read("market-data", json!({})))
            .await
            .unwrap();

        assert_eq!(result, json!({"ok": true}));
        assert_eq!(venue.calls(), 3);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let venue = Arc::new(MockVenue::new());
        venue.push_errors(GateError::transport("down"), 100);

        let mut config = fast_retry_config();
        config.breaker.failure_threshold = 3;
        let gateway = gateway_with(Arc::clone(&venue), config);

        let spec = CallSpec::read("market-data", json!({}));
        let err = gateway.call(spec.clone()).await.unwrap_err();
        // Third failure opened the circuit mid-retry.
        assert!(matches!(err, GateError::CircuitOpen { .. }));
        assert_eq!(
            gateway.breaker_state(&EndpointClass::new("market-data")),
            Some(BreakerState::Open)
        );

        // Subsequent calls fail fast without touching the venue.
        let calls_before = venue.calls();
        let err = gateway.call(spec).await.unwrap_err();
        assert!(matches!(err, GateError::CircuitOpen { .. }));
        assert_eq!(venue.calls(), calls_before);
    }

    #[tokio::test]
    async fn test_manual_breaker_overrides() {
        let venue = Arc::new(MockVenue::new());
        let gateway = gateway_with(Arc::clone(&venue), GatewayConfig::default());
        let class = EndpointClass::new("market-data");

        gateway.force_open(&class).unwrap();
        let err = gateway
            .call(CallSpec::read("market-data", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::CircuitOpen { .. }));
        assert_eq!(venue.calls(), 0);

        gateway.force_close(&class).unwrap();
        gateway
            .call(CallSpec::read("market-data", json!({})))
            .await
            .unwrap();
        assert_eq!(venue.calls(), 1);
    }

    #[tokio::test]
    async fn test_admission_rejection_with_timeout() {
        let venue = Arc::new(MockVenue::new());
        let mut config = fast_retry_config();
        config.retry.max_attempts = 1;
        config.quotas.insert(
            "order-submit".to_string(),
            QuotaConfig {
                capacity: 1,
                window_ms: 60_000,
                safety_margin: 1.0,
                per_identity: false,
            },
        );
        let gateway = gateway_with(Arc::clone(&venue), config);

        let spec = CallSpec::mutate("order-submit", "0xabc", json!({}))
            .with_admission_timeout(Duration::from_millis(10));

        gateway.call(spec.clone()).await.unwrap();
        let err = gateway.call(spec).await.unwrap_err();
        match err {
            GateError::RetryBudgetExhausted { last, .. } => {
                assert!(matches!(*last, GateError::RateLimitExceeded { .. }));
            }
            GateError::RateLimitExceeded { .. } => {}
            other => panic!("expected rate limit rejection, got {other:?}"),
        }
        assert_eq!(venue.calls(), 1, "rejected call never reached the venue");
    }

    #[tokio::test]
    async fn test_concurrent_reads_deduplicate() {
        let venue = Arc::new(MockVenue::new());
        venue.set_delay(Duration::from_millis(50));
        let gateway = Arc::new(gateway_with(Arc::clone(&venue), GatewayConfig::default()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gateway = Arc::clone(&gateway);
            handles.push(tokio::spawn(async move {
                gateway
                    .call(CallSpec::read("market-data", json!({"token": "42"})))
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!({"token": "42"}));
        }
        assert_eq!(venue.calls(), 1, "identical concurrent reads collapsed");
    }

    #[tokio::test]
    async fn test_call_cached_memoizes() {
        let venue = Arc::new(MockVenue::new());
        let gateway = gateway_with(Arc::clone(&venue), GatewayConfig::default());

        let spec = CallSpec::read("market-data", json!({"token": "42"}));
        gateway.call_cached("tick:42", spec.clone()).await.unwrap();
        gateway.call_cached("tick:42", spec).await.unwrap();
        assert_eq!(venue.calls(), 1, "second lookup served from cache");
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let venue = Arc::new(MockVenue::new());
        let mut config = fast_retry_config();
        config.retry.max_attempts = 1;
        let gateway = gateway_with(Arc::clone(&venue), config);

        // Second call fails fatally; the rest echo.
        venue.push_response(Ok(json!({"ok": 0})));
        venue.push_response(Err(GateError::Upstream {
            status: Some(400),
            message: "bad wallet".to_string(),
        }));

        let specs: Vec<CallSpec> = (0..5)
            .map(|i| {
                let mut spec =
                    CallSpec::read("market-data", json!({"wallet": i.to_string() }));
                // Distinct payloads, no dedup interference.
                spec.dedupe = false;
                spec
            })
            .collect();

        let outcomes = gateway
            .call_batch(specs, CancellationToken::new())
            .await;

        assert_eq!(outcomes.len(), 5);
        let failed: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].item.payload["wallet"], "1");
    }

    #[tokio::test]
    async fn test_maintenance_task_stops_on_cancel() {
        let venue = Arc::new(MockVenue::new());
        let gateway = Arc::new(gateway_with(venue, GatewayConfig::default()));

        let cancel = CancellationToken::new();
        let handle = gateway.spawn_maintenance(
            Duration::from_millis(5),
            Duration::from_secs(3600),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
