//! Delayed pipeline tests
//!
//! Exercise the claim/confirm invariant against an in-memory ordered set:
//! - events are only claimable once due and never while locked
//! - members leave the set strictly after a successful publish
//! - publish failures release the claim and bump poller_retries
//! - exceeding the retry limit dead-letters onto the status topic

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use hd_bus::{BusConsumer, BusError, BusPublisher, IncomingMessage};
use hd_cache::{CacheError, DelayedStore};
use hd_common::topics::STATUS_TOPIC;
use hd_common::{ChannelMessage, DelayedMessage, StatusMessage, TerminalStatus};
use hd_delayed::{DelayedPoller, DelayedPollerConfig, DelayedStager};

#[derive(Default)]
struct InMemoryDelayedStore {
    members: Mutex<BTreeMap<String, i64>>,
    locks: Mutex<HashSet<String>>,
}

impl InMemoryDelayedStore {
    fn contains(&self, member: &str) -> bool {
        self.members.lock().contains_key(member)
    }

    fn len(&self) -> usize {
        self.members.lock().len()
    }
}

#[async_trait]
impl DelayedStore for InMemoryDelayedStore {
    async fn stage(&self, member: &str, score_ms: i64) -> Result<(), CacheError> {
        self.members.lock().insert(member.to_string(), score_ms);
        Ok(())
    }

    async fn claim_due(
        &self,
        now_ms: i64,
        limit: u32,
        _lock_ttl_ms: u64,
    ) -> Result<Vec<String>, CacheError> {
        let members = self.members.lock();
        let mut locks = self.locks.lock();

        let mut claimed = Vec::new();
        for (member, score) in members.iter() {
            if claimed.len() >= limit as usize {
                break;
            }
            if *score <= now_ms && !locks.contains(member) {
                locks.insert(member.clone());
                claimed.push(member.clone());
            }
        }
        Ok(claimed)
    }

    async fn confirm(&self, members: &[String]) -> Result<(), CacheError> {
        let mut set = self.members.lock();
        let mut locks = self.locks.lock();
        for member in members {
            set.remove(member);
            locks.remove(member);
        }
        Ok(())
    }

    async fn release(&self, member: &str) -> Result<(), CacheError> {
        self.locks.lock().remove(member);
        Ok(())
    }

    async fn replace(
        &self,
        old_member: &str,
        new_member: &str,
        score_ms: i64,
    ) -> Result<(), CacheError> {
        let mut members = self.members.lock();
        members.remove(old_member);
        members.insert(new_member.to_string(), score_ms);
        self.locks.lock().remove(old_member);
        Ok(())
    }

    async fn discard(&self, member: &str) -> Result<(), CacheError> {
        self.members.lock().remove(member);
        self.locks.lock().remove(member);
        Ok(())
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

    fn clear_failures(&self) {
        self.failing_topics.lock().clear();
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

fn delayed_event(notification_id: &str, scheduled_at: i64, poller_retries: u32) -> DelayedMessage {
    DelayedMessage {
        message: ChannelMessage {
            notification_id: notification_id.to_string(),
            request_id: "9b2e8b74-3c89-4d5e-9f2a-27a5c1a2b3c4".to_string(),
            client_id: "7f1d6a20-1111-4222-8333-444455556666".to_string(),
            channel: "email".to_string(),
            recipient: HashMap::from([("user_id".to_string(), serde_json::json!("u1"))]),
            content: HashMap::new(),
            variables: HashMap::new(),
            webhook_url: None,
            retry_count: 1,
            created_at: Utc::now(),
            provider: None,
        },
        target_topic: "email_notification".to_string(),
        scheduled_at,
        poller_retries,
    }
}

fn poller_config() -> DelayedPollerConfig {
    DelayedPollerConfig {
        poll_interval: Duration::from_millis(100),
        batch_size: 10,
        claim_ttl: Duration::from_secs(30),
        max_poller_retries: 3,
    }
}

#[tokio::test]
async fn stager_stages_event_with_due_time_score() {
    let store = Arc::new(InMemoryDelayedStore::default());
    let consumer = Arc::new(FakeConsumer::default());
    let stager = DelayedStager::new(consumer.clone(), store.clone());

    let event = delayed_event("n1", 1_700_000_000_000, 0);
    let payload = serde_json::to_vec(&event).unwrap();
    let incoming = IncomingMessage {
        topic: "delayed_notification".to_string(),
        partition: 0,
        offset: 5,
        key: Some("n1".to_string()),
        payload: payload.clone(),
    };

    stager.handle_message(&incoming).await.unwrap();

    let member = String::from_utf8(payload).unwrap();
    assert_eq!(*store.members.lock().get(&member).unwrap(), 1_700_000_000_000);
    assert_eq!(*consumer.committed.lock(), vec![5]);

    // Redelivery overwrites the identical member: no duplicate entries.
    stager.handle_message(&incoming).await.unwrap();
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn stager_drops_malformed_events() {
    let store = Arc::new(InMemoryDelayedStore::default());
    let consumer = Arc::new(FakeConsumer::default());
    let stager = DelayedStager::new(consumer.clone(), store.clone());

    let incoming = IncomingMessage {
        topic: "delayed_notification".to_string(),
        partition: 0,
        offset: 6,
        key: None,
        payload: b"{garbage".to_vec(),
    };

    stager.handle_message(&incoming).await.unwrap();
    assert_eq!(store.len(), 0);
    assert_eq!(*consumer.committed.lock(), vec![6]);
}

#[tokio::test]
async fn due_event_is_published_and_confirmed() {
    let store = Arc::new(InMemoryDelayedStore::default());
    let bus = Arc::new(RecordingBus::default());
    let poller = DelayedPoller::new(store.clone(), bus.clone(), poller_config());

    let now = Utc::now().timestamp_millis();
    let event = delayed_event("n1", now - 1_000, 0);
    let member = serde_json::to_string(&event).unwrap();
    store.stage(&member, event.scheduled_at).await.unwrap();

    let published = poller.poll_once(now).await.unwrap();
    assert_eq!(published, 1);

    // Published to the target channel topic as a plain channel message.
    let payloads = bus.published_on("email_notification");
    assert_eq!(payloads.len(), 1);
    let message: ChannelMessage = serde_json::from_slice(&payloads[0]).unwrap();
    assert_eq!(message.notification_id, "n1");
    assert_eq!(message.retry_count, 1);

    // Confirmed: gone from the set.
    assert!(!store.contains(&member));
}

#[tokio::test]
async fn future_event_is_not_claimed() {
    let store = Arc::new(InMemoryDelayedStore::default());
    let bus = Arc::new(RecordingBus::default());
    let poller = DelayedPoller::new(store.clone(), bus.clone(), poller_config());

    let now = Utc::now().timestamp_millis();
    let event = delayed_event("n1", now + 60_000, 0);
    let member = serde_json::to_string(&event).unwrap();
    store.stage(&member, event.scheduled_at).await.unwrap();

    let published = poller.poll_once(now).await.unwrap();
    assert_eq!(published, 0);
    assert!(store.contains(&member));
}

#[tokio::test]
async fn claimed_member_is_not_reclaimable_until_released() {
    let store = Arc::new(InMemoryDelayedStore::default());
    let now = Utc::now().timestamp_millis();
    store.stage("member-a", now - 1).await.unwrap();

    let first = store.claim_due(now, 10, 30_000).await.unwrap();
    assert_eq!(first, vec!["member-a".to_string()]);

    // Still locked: a second poller instance gets nothing.
    let second = store.claim_due(now, 10, 30_000).await.unwrap();
    assert!(second.is_empty());

    store.release("member-a").await.unwrap();
    let third = store.claim_due(now, 10, 30_000).await.unwrap();
    assert_eq!(third, vec!["member-a".to_string()]);
}

#[tokio::test]
async fn publish_failure_keeps_member_and_bumps_poller_retries() {
    let store = Arc::new(InMemoryDelayedStore::default());
    let bus = Arc::new(RecordingBus::default());
    bus.fail_topic("email_notification");
    let poller = DelayedPoller::new(store.clone(), bus.clone(), poller_config());

    let now = Utc::now().timestamp_millis();
    let event = delayed_event("n1", now - 1_000, 0);
    let member = serde_json::to_string(&event).unwrap();
    store.stage(&member, event.scheduled_at).await.unwrap();

    let published = poller.poll_once(now).await.unwrap();
    assert_eq!(published, 0);

    // The event is still in the set, rewritten with poller_retries = 1 and
    // immediately re-claimable.
    assert_eq!(store.len(), 1);
    assert!(store.locks.lock().is_empty());
    let rewritten = store.members.lock().keys().next().unwrap().clone();
    let updated: DelayedMessage = serde_json::from_str(&rewritten).unwrap();
    assert_eq!(updated.poller_retries, 1);

    // Broker comes back: the event drains on the next tick.
    bus.clear_failures();
    let published = poller.poll_once(now).await.unwrap();
    assert_eq!(published, 1);
    assert_eq!(store.len(), 0);
}

#[tokio::test]
async fn exceeding_poller_retries_dead_letters_to_status_topic() {
    let store = Arc::new(InMemoryDelayedStore::default());
    let bus = Arc::new(RecordingBus::default());
    bus.fail_topic("email_notification");
    let poller = DelayedPoller::new(store.clone(), bus.clone(), poller_config());

    let now = Utc::now().timestamp_millis();
    // Already at the retry limit: the next failure escalates.
    let event = delayed_event("n1", now - 1_000, 3);
    let member = serde_json::to_string(&event).unwrap();
    store.stage(&member, event.scheduled_at).await.unwrap();

    poller.poll_once(now).await.unwrap();

    let statuses = bus.published_on(STATUS_TOPIC);
    assert_eq!(statuses.len(), 1);
    let status: StatusMessage = serde_json::from_slice(&statuses[0]).unwrap();
    assert_eq!(status.status, TerminalStatus::Failed);
    assert_eq!(
        status.message.as_deref(),
        Some("dead-letter from delayed pipeline")
    );

    // Dropped from the set after escalation.
    assert_eq!(store.len(), 0);
}
