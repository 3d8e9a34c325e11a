//! Dispatch worker tests
//!
//! Drive the per-message pipeline against fakes of the bus, cache, and
//! provider seams:
//! - happy path: one provider call, delivered record, status event, commit
//! - idempotency decisions: duplicate delivery, in-flight, retry
//! - failure path: delayed re-enqueue with backoff, exhaustion at max
//! - rate limiting defers without touching the provider
//! - infrastructure failure after success leaves the offset uncommitted

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use hd_bus::{BusConsumer, BusError, BusPublisher, IncomingMessage};
use hd_cache::{
    AcquireOutcome, CacheError, ConsumeOutcome, IdempotencyStatus, IdempotencyStore, RateLimiter,
};
use hd_common::topics::{DELAYED_TOPIC, STATUS_TOPIC};
use hd_common::{ChannelMessage, DelayedMessage, StatusMessage, TerminalStatus};
use hd_dispatch::{DispatchWorker, DispatchWorkerConfig, Provider, SendError};

#[derive(Default)]
struct FakeConsumer {
    committed: Mutex<Vec<i64>>,
}

#[async_trait]
impl BusConsumer for FakeConsumer {
    async fn next(&self) -> hd_bus::Result<IncomingMessage> {
        Err(BusError::Stopped)
    }

    async fn commit(&self, message: &IncomingMessage) -> hd_bus::Result<()> {
        self.committed.lock().push(message.offset);
        Ok(())
    }
}

/// Mirrors the cache-side acquire script's decision table.
#[derive(Default)]
struct FakeIdempotency {
    records: Mutex<HashMap<String, IdempotencyStatus>>,
}

impl FakeIdempotency {
    fn with_record(id: &str, status: IdempotencyStatus) -> Self {
        let fake = Self::default();
        fake.records.lock().insert(id.to_string(), status);
        fake
    }

    fn status_of(&self, id: &str) -> Option<IdempotencyStatus> {
        self.records.lock().get(id).copied()
    }
}

#[async_trait]
impl IdempotencyStore for FakeIdempotency {
    async fn acquire_processing(
        &self,
        notification_id: &str,
        _processing_ttl: Duration,
    ) -> Result<AcquireOutcome, CacheError> {
        let mut records = self.records.lock();
        let outcome = match records.get(notification_id) {
            None => AcquireOutcome::FirstAttempt,
            Some(IdempotencyStatus::Processing) => return Ok(AcquireOutcome::InFlight),
            Some(IdempotencyStatus::Delivered) => return Ok(AcquireOutcome::AlreadyDelivered),
            Some(IdempotencyStatus::Failed) => AcquireOutcome::Retry,
        };
        records.insert(notification_id.to_string(), IdempotencyStatus::Processing);
        Ok(outcome)
    }

    async fn mark_delivered(&self, notification_id: &str, _ttl: Duration) -> Result<(), CacheError> {
        self.records
            .lock()
            .insert(notification_id.to_string(), IdempotencyStatus::Delivered);
        Ok(())
    }

    async fn mark_failed(&self, notification_id: &str, _ttl: Duration) -> Result<(), CacheError> {
        self.records
            .lock()
            .insert(notification_id.to_string(), IdempotencyStatus::Failed);
        Ok(())
    }

    async fn get(&self, notification_id: &str) -> Result<Option<IdempotencyStatus>, CacheError> {
        Ok(self.records.lock().get(notification_id).copied())
    }
}

struct FakeRateLimiter {
    exhausted: bool,
}

#[async_trait]
impl RateLimiter for FakeRateLimiter {
    async fn try_consume(
        &self,
        _channel: &str,
        _capacity: u32,
        _refill_per_sec: f64,
        _now_ms: i64,
    ) -> Result<ConsumeOutcome, CacheError> {
        Ok(if self.exhausted {
            ConsumeOutcome::Exhausted
        } else {
            ConsumeOutcome::Allowed
        })
    }
}

struct ScriptedProvider {
    outcomes: Mutex<VecDeque<Result<(), SendError>>>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    fn succeeding() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    fn failing(reason: &str) -> Self {
        let provider = Self::succeeding();
        provider
            .outcomes
            .lock()
            .push_back(Err(SendError::Retryable(reason.to_string())));
        provider
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(
        &self,
        _recipient: &HashMap<String, serde_json::Value>,
        _content: &HashMap<String, serde_json::Value>,
        _variables: &HashMap<String, String>,
    ) -> Result<(), SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcomes.lock().pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Default)]
struct RecordingBus {
    published: Mutex<Vec<(String, String, Vec<u8>)>>,
    failing_topics: Mutex<HashSet<String>>,
}

impl RecordingBus {
    fn fail_topic(&self, topic: &str) {
        self.failing_topics.lock().insert(topic.to_string());
    }

    fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, _, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl BusPublisher for RecordingBus {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> hd_bus::Result<()> {
        if self.failing_topics.lock().contains(topic) {
            return Err(BusError::Publish(format!("broker unavailable for {topic}")));
        }
        self.published
            .lock()
            .push((topic.to_string(), key.to_string(), payload.to_vec()));
        Ok(())
    }
}

fn config() -> DispatchWorkerConfig {
    DispatchWorkerConfig {
        channel: "email".to_string(),
        max_retry_count: 5,
        processing_ttl: Duration::from_secs(60),
        idempotency_ttl: Duration::from_secs(86_400),
        backoff_base_ms: 5_000,
        backoff_cap_ms: 60_000,
        provider_timeout: Duration::from_secs(5),
        rate_limit_tokens: 100,
        rate_limit_refill_rate: 10.0,
    }
}

fn channel_message(notification_id: &str, retry_count: u32) -> ChannelMessage {
    ChannelMessage {
        notification_id: notification_id.to_string(),
        request_id: "9b2e8b74-3c89-4d5e-9f2a-27a5c1a2b3c4".to_string(),
        client_id: "7f1d6a20-1111-4222-8333-444455556666".to_string(),
        channel: "email".to_string(),
        recipient: HashMap::from([
            ("user_id".to_string(), serde_json::json!("u1")),
            ("email".to_string(), serde_json::json!("a@example.com")),
        ]),
        content: HashMap::from([(
            "email".to_string(),
            serde_json::json!({ "subject": "S", "message": "M" }),
        )]),
        variables: HashMap::new(),
        webhook_url: Some("https://client.example.com/hook".to_string()),
        retry_count,
        created_at: Utc::now(),
        provider: None,
    }
}

fn incoming(message: &ChannelMessage, offset: i64) -> IncomingMessage {
    IncomingMessage {
        topic: "email_notification".to_string(),
        partition: 0,
        offset,
        key: Some(message.notification_id.clone()),
        payload: serde_json::to_vec(message).unwrap(),
    }
}

struct Harness {
    worker: DispatchWorker,
    consumer: Arc<FakeConsumer>,
    bus: Arc<RecordingBus>,
    idempotency: Arc<FakeIdempotency>,
    provider: Arc<ScriptedProvider>,
}

fn harness(
    idempotency: FakeIdempotency,
    provider: ScriptedProvider,
    rate_limited: bool,
) -> Harness {
    let consumer = Arc::new(FakeConsumer::default());
    let bus = Arc::new(RecordingBus::default());
    let idempotency = Arc::new(idempotency);
    let provider = Arc::new(provider);

    let worker = DispatchWorker::new(
        config(),
        consumer.clone(),
        bus.clone(),
        idempotency.clone(),
        Arc::new(FakeRateLimiter {
            exhausted: rate_limited,
        }),
        provider.clone(),
    );

    Harness {
        worker,
        consumer,
        bus,
        idempotency,
        provider,
    }
}

#[tokio::test]
async fn happy_path_delivers_once_and_commits() {
    let h = harness(FakeIdempotency::default(), ScriptedProvider::succeeding(), false);
    let message = channel_message("n1", 0);

    h.worker.handle_message(&incoming(&message, 7)).await.unwrap();

    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.idempotency.status_of("n1"), Some(IdempotencyStatus::Delivered));
    assert_eq!(*h.consumer.committed.lock(), vec![7]);

    let statuses = h.bus.published_on(STATUS_TOPIC);
    assert_eq!(statuses.len(), 1);
    let status: StatusMessage = serde_json::from_slice(&statuses[0]).unwrap();
    assert_eq!(status.status, TerminalStatus::Delivered);
    assert_eq!(status.notification_id, "n1");
}

#[tokio::test]
async fn duplicate_delivery_skips_provider() {
    let h = harness(
        FakeIdempotency::with_record("n1", IdempotencyStatus::Delivered),
        ScriptedProvider::succeeding(),
        false,
    );
    let message = channel_message("n1", 0);

    h.worker.handle_message(&incoming(&message, 3)).await.unwrap();

    assert_eq!(h.provider.calls(), 0);
    assert_eq!(*h.consumer.committed.lock(), vec![3]);
    assert!(h.bus.published_on(STATUS_TOPIC).is_empty());
}

#[tokio::test]
async fn in_flight_message_is_skipped() {
    let h = harness(
        FakeIdempotency::with_record("n1", IdempotencyStatus::Processing),
        ScriptedProvider::succeeding(),
        false,
    );
    let message = channel_message("n1", 4);

    h.worker.handle_message(&incoming(&message, 4)).await.unwrap();

    assert_eq!(h.provider.calls(), 0);
    assert_eq!(*h.consumer.committed.lock(), vec![4]);
}

#[tokio::test]
async fn failed_record_allows_retry() {
    let h = harness(
        FakeIdempotency::with_record("n1", IdempotencyStatus::Failed),
        ScriptedProvider::succeeding(),
        false,
    );
    let message = channel_message("n1", 1);

    h.worker.handle_message(&incoming(&message, 5)).await.unwrap();

    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.idempotency.status_of("n1"), Some(IdempotencyStatus::Delivered));
}

#[tokio::test]
async fn transient_failure_schedules_backoff_retry() {
    let h = harness(
        FakeIdempotency::default(),
        ScriptedProvider::failing("smtp 500"),
        false,
    );
    let message = channel_message("n1", 0);
    let before_ms = Utc::now().timestamp_millis();

    h.worker.handle_message(&incoming(&message, 9)).await.unwrap();

    assert_eq!(h.idempotency.status_of("n1"), Some(IdempotencyStatus::Failed));
    assert_eq!(*h.consumer.committed.lock(), vec![9]);

    let delayed_payloads = h.bus.published_on(DELAYED_TOPIC);
    assert_eq!(delayed_payloads.len(), 1);
    let delayed: DelayedMessage = serde_json::from_slice(&delayed_payloads[0]).unwrap();
    assert_eq!(delayed.message.retry_count, 1);
    assert_eq!(delayed.target_topic, "email_notification");
    assert_eq!(delayed.poller_retries, 0);

    // First retry is due roughly base_ms out.
    let delta = delayed.scheduled_at - before_ms;
    assert!((5_000..7_000).contains(&delta), "unexpected delay {delta}");

    assert!(h.bus.published_on(STATUS_TOPIC).is_empty());
}

#[tokio::test]
async fn second_failure_doubles_the_delay() {
    let h = harness(
        FakeIdempotency::with_record("n1", IdempotencyStatus::Failed),
        ScriptedProvider::failing("smtp 500"),
        false,
    );
    let message = channel_message("n1", 1);
    let before_ms = Utc::now().timestamp_millis();

    h.worker.handle_message(&incoming(&message, 1)).await.unwrap();

    let delayed: DelayedMessage =
        serde_json::from_slice(&h.bus.published_on(DELAYED_TOPIC)[0]).unwrap();
    assert_eq!(delayed.message.retry_count, 2);
    let delta = delayed.scheduled_at - before_ms;
    assert!((10_000..12_000).contains(&delta), "unexpected delay {delta}");
}

#[tokio::test]
async fn exhausted_retries_publish_permanent_failure() {
    let h = harness(
        FakeIdempotency::default(),
        ScriptedProvider::failing("smtp 500"),
        false,
    );
    // retry_count == max: the next failure is permanent.
    let message = channel_message("n1", 5);

    h.worker.handle_message(&incoming(&message, 2)).await.unwrap();

    assert!(h.bus.published_on(DELAYED_TOPIC).is_empty());
    let statuses = h.bus.published_on(STATUS_TOPIC);
    assert_eq!(statuses.len(), 1);
    let status: StatusMessage = serde_json::from_slice(&statuses[0]).unwrap();
    assert_eq!(status.status, TerminalStatus::Failed);
    assert_eq!(status.message.as_deref(), Some("smtp 500"));
    assert_eq!(*h.consumer.committed.lock(), vec![2]);
}

#[tokio::test]
async fn one_retry_left_still_goes_delayed() {
    let h = harness(
        FakeIdempotency::default(),
        ScriptedProvider::failing("smtp 500"),
        false,
    );
    // retry_count == max - 1: one more delayed enqueue is allowed.
    let message = channel_message("n1", 4);

    h.worker.handle_message(&incoming(&message, 2)).await.unwrap();

    assert_eq!(h.bus.published_on(DELAYED_TOPIC).len(), 1);
    assert!(h.bus.published_on(STATUS_TOPIC).is_empty());
}

#[tokio::test]
async fn rate_limited_message_defers_without_provider_call() {
    let h = harness(FakeIdempotency::default(), ScriptedProvider::succeeding(), true);
    let message = channel_message("n1", 0);

    h.worker.handle_message(&incoming(&message, 6)).await.unwrap();

    assert_eq!(h.provider.calls(), 0);
    let delayed: DelayedMessage =
        serde_json::from_slice(&h.bus.published_on(DELAYED_TOPIC)[0]).unwrap();
    assert_eq!(delayed.message.retry_count, 1);
    assert_eq!(*h.consumer.committed.lock(), vec![6]);
}

#[tokio::test]
async fn poison_pill_is_committed_and_dropped() {
    let h = harness(FakeIdempotency::default(), ScriptedProvider::succeeding(), false);
    let incoming = IncomingMessage {
        topic: "email_notification".to_string(),
        partition: 0,
        offset: 11,
        key: None,
        payload: b"{not json".to_vec(),
    };

    h.worker.handle_message(&incoming).await.unwrap();

    assert_eq!(h.provider.calls(), 0);
    assert_eq!(*h.consumer.committed.lock(), vec![11]);
}

#[tokio::test]
async fn status_publish_failure_leaves_offset_uncommitted() {
    let h = harness(FakeIdempotency::default(), ScriptedProvider::succeeding(), false);
    h.bus.fail_topic(STATUS_TOPIC);
    let message = channel_message("n1", 0);

    let result = h.worker.handle_message(&incoming(&message, 8)).await;

    assert!(result.is_err());
    assert!(h.consumer.committed.lock().is_empty());
    // The side effect is recorded: redelivery will skip the provider and the
    // recovery cron can heal the missing status transition.
    assert_eq!(h.idempotency.status_of("n1"), Some(IdempotencyStatus::Delivered));
    assert_eq!(h.provider.calls(), 1);
}
