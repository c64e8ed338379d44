// Metric Collectors
//
// Per-topic record counts gathered from every running query through the
// runtime's record-collector hook.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::runtime::RecordCollector;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TopicCounts {
    pub consumed: u64,
    pub produced: u64,
}

#[derive(Debug, Default)]
pub struct MetricCollectors {
    topics: Mutex<BTreeMap<String, TopicCounts>>,
}

impl MetricCollectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(&self, topic: &str) -> TopicCounts {
        self.topics.lock().get(topic).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, TopicCounts> {
        self.topics.lock().clone()
    }

    pub fn total_consumed(&self) -> u64 {
        self.topics.lock().values().map(|c| c.consumed).sum()
    }

    pub fn total_produced(&self) -> u64 {
        self.topics.lock().values().map(|c| c.produced).sum()
    }
}

impl RecordCollector for MetricCollectors {
    fn record_consumed(&self, topic: &str) {
        self.topics.lock().entry(topic.to_string()).or_default().consumed += 1;
    }

    fn record_produced(&self, topic: &str) {
        self.topics.lock().entry(topic.to_string()).or_default().produced += 1;
    }
}
