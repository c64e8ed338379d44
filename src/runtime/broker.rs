// In-Memory Broker
//
// Topics are append-only vectors of serialized records. Subscribers get
// every existing record of their topics replayed from offset 0, then each
// new record as it is produced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Offset, Timestamp};

/// A serialized record stored in a topic
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerRecord {
    pub topic: String,
    pub offset: Offset,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Timestamp,
}

pub type SubscriptionId = u64;

#[derive(Default)]
struct TopicLog {
    records: Vec<BrokerRecord>,
    subscribers: Vec<(SubscriptionId, Sender<BrokerRecord>)>,
}

#[derive(Default)]
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, TopicLog>>,
    appended: Condvar,
    next_subscription: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and fan it out to subscribers. Returns its offset.
    pub fn produce(&self, topic: &str, key: Option<Vec<u8>>, value: Option<Vec<u8>>, timestamp: Timestamp) -> Offset {
        let mut topics = self.topics.lock();
        let log = topics.entry(topic.to_string()).or_default();
        let record = BrokerRecord {
            topic: topic.to_string(),
            offset: log.records.len() as Offset,
            key,
            value,
            timestamp,
        };
        trace!(
            "produce {}@{} key={}",
            topic,
            record.offset,
            record.key.as_deref().map(hex::encode).unwrap_or_default()
        );
        log.subscribers.retain(|(_, tx)| tx.send(record.clone()).is_ok());
        let offset = record.offset;
        log.records.push(record);
        self.appended.notify_all();
        offset
    }

    /// Subscribe to topics, replaying their history into `sender` first
    pub fn subscribe(&self, topics: &[String], sender: Sender<BrokerRecord>) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let mut all = self.topics.lock();
        for topic in topics {
            let log = all.entry(topic.clone()).or_default();
            for record in &log.records {
                // receiver gone: nothing left to replay into
                if sender.send(record.clone()).is_err() {
                    break;
                }
            }
            log.subscribers.push((id, sender.clone()));
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut topics = self.topics.lock();
        for log in topics.values_mut() {
            log.subscribers.retain(|(sub, _)| *sub != id);
        }
    }

    pub fn records(&self, topic: &str) -> Vec<BrokerRecord> {
        self.topics
            .lock()
            .get(topic)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Wait until `topic` holds at least `count` records or `timeout` passes
    pub fn await_records(&self, topic: &str, count: usize, timeout: Duration) -> Vec<BrokerRecord> {
        let deadline = Instant::now() + timeout;
        let mut topics = self.topics.lock();
        loop {
            let len = topics.get(topic).map(|l| l.records.len()).unwrap_or(0);
            if len >= count {
                break;
            }
            if self.appended.wait_until(&mut topics, deadline).timed_out() {
                break;
            }
        }
        topics.get(topic).map(|l| l.records.clone()).unwrap_or_default()
    }
}
