//! State store contract and an in-memory implementation

use crate::error::StoreError;
use crate::replay::ExecutionRecord;
use crate::strategy::Strategy;
use crate::topic::TopicConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

/// Durable home of topic configurations, values and strategies
///
/// The registry must be fully reconstructible from what is saved here.
pub trait StateStore: Send + Sync {
    fn save_topic_config(&self, config: &TopicConfig) -> Result<(), StoreError>;

    fn delete_topic_config(&self, name: &str) -> Result<(), StoreError>;

    fn load_all_topic_configs(&self) -> Result<Vec<TopicConfig>, StoreError>;

    fn save_topic_value(&self, name: &str, value: &Value) -> Result<(), StoreError>;

    fn load_topic_value(&self, name: &str) -> Result<Option<Value>, StoreError>;

    fn save_strategy(&self, strategy: &Strategy) -> Result<(), StoreError>;

    fn delete_strategy(&self, strategy_id: &str) -> Result<(), StoreError>;

    fn load_all_strategies(&self) -> Result<Vec<Strategy>, StoreError>;

    /// Execution history is best effort; stores may discard it
    fn save_execution_log(&self, _record: &ExecutionRecord) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Process-local store, used for tests and single-run deployments
#[derive(Default)]
pub struct MemoryStore {
    configs: DashMap<String, TopicConfig>,
    values: DashMap<String, Value>,
    strategies: DashMap<String, Strategy>,
    executions: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_logs(&self) -> Vec<ExecutionRecord> {
        self.executions.lock().clone()
    }
}

impl StateStore for MemoryStore {
    fn save_topic_config(&self, config: &TopicConfig) -> Result<(), StoreError> {
        self.configs.insert(config.name.clone(), config.clone());
        Ok(())
    }

    fn delete_topic_config(&self, name: &str) -> Result<(), StoreError> {
        self.configs.remove(name);
        self.values.remove(name);
        Ok(())
    }

    fn load_all_topic_configs(&self) -> Result<Vec<TopicConfig>, StoreError> {
        let mut configs: Vec<TopicConfig> = self.configs.iter().map(|entry| entry.value().clone()).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    fn save_topic_value(&self, name: &str, value: &Value) -> Result<(), StoreError> {
        self.values.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn load_topic_value(&self, name: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.get(name).map(|entry| entry.value().clone()))
    }

    fn save_strategy(&self, strategy: &Strategy) -> Result<(), StoreError> {
        self.strategies.insert(strategy.id.clone(), strategy.clone());
        Ok(())
    }

    fn delete_strategy(&self, strategy_id: &str) -> Result<(), StoreError> {
        self.strategies.remove(strategy_id);
        Ok(())
    }

    fn load_all_strategies(&self) -> Result<Vec<Strategy>, StoreError> {
        let mut strategies: Vec<Strategy> = self.strategies.iter().map(|entry| entry.value().clone()).collect();
        strategies.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(strategies)
    }

    fn save_execution_log(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.executions.lock().push(record.clone());
        Ok(())
    }
}
