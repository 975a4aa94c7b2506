//! Execution log: a bounded record of recent strategy runs

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::strategy::Emission;

/// One strategy run, successful or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub topic_name: String,
    pub strategy_id: String,
    pub trigger_topic: String,
    pub input_values: Map<String, Value>,
    pub emissions: Vec<Emission>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(
        topic_name: impl Into<String>,
        strategy_id: impl Into<String>,
        trigger_topic: impl Into<String>,
        input_values: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic_name: topic_name.into(),
            strategy_id: strategy_id.into(),
            trigger_topic: trigger_topic.into(),
            input_values,
            emissions: Vec::new(),
            error: None,
            duration_ms: 0,
            executed_at: Utc::now(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Circular buffer of the most recent executions
pub struct ExecutionRecorder {
    records: RwLock<VecDeque<ExecutionRecord>>,
    capacity: usize,
}

impl ExecutionRecorder {
    /// Create new recorder with given capacity (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Record a run, evicting the oldest when full
    pub fn record(&self, record: ExecutionRecord) {
        let mut records = self.records.write();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// All records, oldest first
    pub fn get_records(&self) -> Vec<ExecutionRecord> {
        self.records.read().iter().cloned().collect()
    }

    /// Records for one topic, oldest first
    pub fn records_for_topic(&self, topic_name: &str) -> Vec<ExecutionRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.topic_name == topic_name)
            .cloned()
            .collect()
    }

    /// Records in a time range (inclusive)
    pub fn get_records_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<ExecutionRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.executed_at >= start && r.executed_at <= end)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
