//! Topic registry and update propagation
//!
//! All topics live in one map behind a reader/writer lock. Value changes go
//! through [`TopicRegistry::update_value`], which applies the new value, then
//! releases the lock before re-executing dependent strategies on the calling
//! thread. Strategy emissions re-enter `update_value` recursively, so a chain
//! of derived topics settles depth first before the outer call returns.

use crate::bus::UpdateBus;
use crate::error::{EngineError, Result};
use crate::events::{Delivery, TopicEvent};
use crate::periodic::Ticker;
use crate::publisher::Publisher;
use crate::replay::{ExecutionRecord, ExecutionRecorder};
use crate::store::{MemoryStore, StateStore};
use crate::strategy::{ExecutionRequest, StrategyEngine};
use crate::topic::{DerivedConfig, PeriodicConfig, Topic, TopicKind, TopicVariant};
use crate::wildcard::{is_wildcard, topic_matches, validate_pattern, validate_topic_name};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Default bound on nested updates caused by one external trigger
pub const DEFAULT_MAX_DEPTH: usize = 32;

const DEFAULT_RECORDER_CAPACITY: usize = 1000;

/// What `update_value` did with a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Stored, broadcast and propagated
    Applied,
    /// Equal to the current value of a `suppress_unchanged` topic; nothing happened
    Suppressed,
    /// Inbound delivery for a topic the engine owns (our own publication echoed back)
    Ignored,
}

pub struct TopicRegistry {
    topics: RwLock<BTreeMap<String, Topic>>,
    strategies: Arc<StrategyEngine>,
    store: Arc<dyn StateStore>,
    publisher: Option<Arc<dyn Publisher>>,
    bus: UpdateBus,
    recorder: ExecutionRecorder,
    tickers: Mutex<HashMap<String, Ticker>>,
    max_depth: usize,
    self_ref: Weak<TopicRegistry>,
}

/// Builder for [`TopicRegistry`]
pub struct TopicRegistryBuilder {
    strategies: Arc<StrategyEngine>,
    store: Option<Arc<dyn StateStore>>,
    publisher: Option<Arc<dyn Publisher>>,
    max_depth: usize,
    recorder_capacity: usize,
}

impl TopicRegistryBuilder {
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    pub fn recorder_capacity(mut self, capacity: usize) -> Self {
        self.recorder_capacity = capacity;
        self
    }

    pub fn build(self) -> Arc<TopicRegistry> {
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        Arc::new_cyclic(|self_ref| TopicRegistry {
            topics: RwLock::new(BTreeMap::new()),
            strategies: self.strategies,
            store,
            publisher: self.publisher,
            bus: UpdateBus::new(),
            recorder: ExecutionRecorder::new(self.recorder_capacity),
            tickers: Mutex::new(HashMap::new()),
            max_depth: self.max_depth,
            self_ref: self_ref.clone(),
        })
    }
}

impl TopicRegistry {
    pub fn builder(strategies: Arc<StrategyEngine>) -> TopicRegistryBuilder {
        TopicRegistryBuilder {
            strategies,
            store: None,
            publisher: None,
            max_depth: DEFAULT_MAX_DEPTH,
            recorder_capacity: DEFAULT_RECORDER_CAPACITY,
        }
    }

    pub fn bus(&self) -> &UpdateBus {
        &self.bus
    }

    pub fn recorder(&self) -> &ExecutionRecorder {
        &self.recorder
    }

    pub fn strategies(&self) -> &Arc<StrategyEngine> {
        &self.strategies
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get(&self, name: &str) -> Option<Topic> {
        self.topics.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.topics.read().contains_key(name)
    }

    pub fn variant_of(&self, name: &str) -> Option<TopicVariant> {
        self.topics.read().get(name).map(Topic::variant)
    }

    /// Every topic, sorted by name
    pub fn list(&self) -> Vec<Topic> {
        self.topics.read().values().cloned().collect()
    }

    pub fn list_by_variant(&self, variant: TopicVariant) -> Vec<Topic> {
        self.topics
            .read()
            .values()
            .filter(|topic| topic.variant() == variant)
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> HashMap<TopicVariant, usize> {
        let mut counts = HashMap::from([
            (TopicVariant::Source, 0),
            (TopicVariant::Derived, 0),
            (TopicVariant::Periodic, 0),
        ]);
        for topic in self.topics.read().values() {
            *counts.entry(topic.variant()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.topics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.read().is_empty()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a Source topic; re-registering an existing Source is a no-op
    pub fn register_source(&self, name: &str) -> Result<Topic> {
        validate_topic_name(name).map_err(EngineError::Validation)?;

        let topic = {
            let mut topics = self.topics.write();
            if let Some(existing) = topics.get(name) {
                if existing.variant() == TopicVariant::Source {
                    return Ok(existing.clone());
                }
                return Err(EngineError::AlreadyExists(name.to_string()));
            }
            let topic = Topic::source(name);
            topics.insert(name.to_string(), topic.clone());
            topic
        };

        self.persist_config(&topic);
        info!("Registered source topic: {}", name);
        Ok(topic)
    }

    /// Register a strategy-driven Derived topic
    pub fn register_derived(&self, name: &str, config: DerivedConfig) -> Result<Topic> {
        let config = self.prepare_derived(name, config)?;

        let topic = {
            let mut topics = self.topics.write();
            if topics.contains_key(name) {
                return Err(EngineError::AlreadyExists(name.to_string()));
            }
            let topic = Topic::new(name, TopicKind::Derived(config));
            topics.insert(name.to_string(), topic.clone());
            topic
        };

        self.persist_config(&topic);
        if let Some(config) = topic.derived() {
            info!(
                "Registered derived topic: {} (strategy {}, inputs {:?})",
                name, config.strategy_id, config.inputs
            );
        }
        Ok(topic)
    }

    /// Replace the configuration of a strategy-driven topic, keeping its value
    pub fn update_derived(&self, name: &str, config: DerivedConfig) -> Result<Topic> {
        let config = self.prepare_derived(name, config)?;

        let topic = {
            let mut topics = self.topics.write();
            let topic = topics
                .get_mut(name)
                .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
            match topic.derived() {
                Some(existing) if !existing.is_child() => {}
                Some(_) => {
                    return Err(EngineError::Validation(format!(
                        "child topic {} cannot be reconfigured",
                        name
                    )))
                }
                None => {
                    return Err(EngineError::Validation(format!(
                        "topic {} is a {} topic, not derived",
                        name,
                        topic.variant()
                    )))
                }
            }
            topic.kind = TopicKind::Derived(config);
            topic.clone()
        };

        self.persist_config(&topic);
        info!("Updated derived topic: {}", name);
        Ok(topic)
    }

    /// Register a Periodic topic and start its timer when it has an interval
    pub fn register_periodic(&self, name: &str, config: PeriodicConfig) -> Result<Topic> {
        validate_topic_name(name).map_err(EngineError::Validation)?;
        if let Some(interval) = &config.interval {
            Ticker::parse_interval(interval)?;
        }

        let topic = {
            let mut topics = self.topics.write();
            if topics.contains_key(name) {
                return Err(EngineError::AlreadyExists(name.to_string()));
            }
            let topic = Topic::new(name, TopicKind::Periodic(config));
            topics.insert(name.to_string(), topic.clone());
            topic
        };

        self.persist_config(&topic);
        info!("Registered periodic topic: {}", name);

        if let Err(err) = self.start_periodic(name) {
            warn!("Periodic topic {} registered but not started: {}", name, err);
        }
        Ok(topic)
    }

    /// Remove a topic of any variant, stopping its timer
    pub fn remove(&self, name: &str) -> Result<Topic> {
        let topic = self
            .topics
            .write()
            .remove(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;

        self.stop_periodic(name);
        self.bus.close(name);
        if let Err(err) = self.store.delete_topic_config(name) {
            warn!("Failed to delete stored config for topic {}: {}", name, err);
        }
        info!("Removed {} topic: {}", topic.variant(), name);
        Ok(topic)
    }

    fn prepare_derived(&self, name: &str, mut config: DerivedConfig) -> Result<DerivedConfig> {
        validate_topic_name(name).map_err(EngineError::Validation)?;
        if config.strategy_id.trim().is_empty() {
            return Err(EngineError::Validation("strategy ID is required".to_string()));
        }
        if config.inputs.is_empty() {
            return Err(EngineError::Validation(format!(
                "derived topic {} needs at least one input",
                name
            )));
        }
        for input in &config.inputs {
            validate_pattern(input).map_err(EngineError::Validation)?;
        }

        match self.strategies.get_strategy(&config.strategy_id) {
            Ok(strategy) => {
                if strategy.max_inputs > 0 && config.inputs.len() > strategy.max_inputs {
                    return Err(EngineError::TooManyInputs {
                        strategy_id: strategy.id.clone(),
                        max: strategy.max_inputs,
                        given: config.inputs.len(),
                    });
                }
                // positional defaults for inputs left unaliased
                for (input, alias) in config.inputs.iter().zip(&strategy.default_input_aliases) {
                    if !alias.is_empty() && !config.input_aliases.contains_key(input) {
                        config.input_aliases.insert(input.clone(), alias.clone());
                    }
                }
            }
            Err(_) => warn!(
                "Derived topic {} references unregistered strategy {}",
                name, config.strategy_id
            ),
        }

        Ok(config)
    }

    fn persist_config(&self, topic: &Topic) {
        if let Err(err) = self.store.save_topic_config(&topic.config()) {
            warn!("Failed to save config for topic {}: {}", topic.name, err);
        }
    }

    // ========================================================================
    // Periodic timers
    // ========================================================================

    /// Start the timer of a Periodic topic; a running timer is left alone
    pub fn start_periodic(&self, name: &str) -> Result<()> {
        let config = self
            .get(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?
            .periodic()
            .cloned()
            .ok_or_else(|| EngineError::Validation(format!("topic {} is not periodic", name)))?;

        let interval = match (&config.interval, &config.cron) {
            (Some(interval), _) => Ticker::parse_interval(interval)?,
            (None, Some(_)) => {
                return Err(EngineError::Validation(format!(
                    "cron scheduling not supported for topic {}",
                    name
                )))
            }
            (None, None) => return Ok(()),
        };

        let mut tickers = self.tickers.lock();
        if tickers.contains_key(name) {
            return Ok(());
        }
        let ticker = Ticker::start(name, interval, self.self_ref.clone())
            .map_err(|err| EngineError::Validation(format!("failed to start timer for {}: {}", name, err)))?;
        tickers.insert(name.to_string(), ticker);
        debug!("Started timer for periodic topic {} every {:?}", name, interval);
        Ok(())
    }

    /// Stop a running timer; returns whether one was running
    pub fn stop_periodic(&self, name: &str) -> bool {
        let stopped = self.tickers.lock().remove(name).is_some();
        if stopped {
            debug!("Stopped timer for periodic topic {}", name);
        }
        stopped
    }

    pub fn stop_all_periodic(&self) {
        let stopped: Vec<String> = self.tickers.lock().drain().map(|(name, _)| name).collect();
        if !stopped.is_empty() {
            info!("Stopped {} periodic timers", stopped.len());
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tickers.lock().contains_key(name)
    }

    // ========================================================================
    // Updates and propagation
    // ========================================================================

    /// Replace a topic's value and propagate to its dependents
    pub fn update_value(&self, name: &str, value: Value) -> Result<UpdateOutcome> {
        self.apply_update(name, value, name, 0)
    }

    /// Apply an inbound transport delivery
    ///
    /// Unseen names become Source topics. Deliveries for topics the engine
    /// produces itself are echoes of its own publications and are ignored.
    pub fn handle_delivery(&self, delivery: &Delivery) -> Result<UpdateOutcome> {
        match self.variant_of(&delivery.topic) {
            Some(TopicVariant::Source) => {}
            Some(variant) => {
                debug!(
                    "Ignoring delivery for {} topic {}",
                    variant, delivery.topic
                );
                return Ok(UpdateOutcome::Ignored);
            }
            None => {
                self.register_source(&delivery.topic)?;
            }
        }

        self.update_value(&delivery.topic, delivery.decode())
    }

    fn apply_update(&self, name: &str, value: Value, origin: &str, depth: usize) -> Result<UpdateOutcome> {
        if depth > self.max_depth {
            return Err(EngineError::DepthExceeded {
                topic: name.to_string(),
                depth,
            });
        }

        let now = Utc::now();
        let (previous, variant, publish_externally) = {
            let mut topics = self.topics.write();
            let topic = topics
                .get_mut(name)
                .ok_or_else(|| EngineError::NotFound(name.to_string()))?;

            let (suppress, publish) = topic
                .derived()
                .map(|config| (config.suppress_unchanged, config.publish_externally))
                .unwrap_or((false, false));
            let has_value = topic.last_updated_at.is_some() || !topic.value.is_null();
            if suppress && has_value && topic.value == value {
                trace!("Suppressed unchanged value for {}", name);
                return Ok(UpdateOutcome::Suppressed);
            }

            let previous = std::mem::replace(&mut topic.value, value.clone());
            topic.last_updated_at = Some(now);
            (previous, topic.variant(), publish)
        };

        if should_log_update(name, variant) {
            info!("Topic update: {} = {}", name, value);
        } else {
            trace!("Topic update: {} = {}", name, value);
        }

        if let Err(err) = self.store.save_topic_value(name, &value) {
            warn!("Failed to save value of topic {}: {}", name, err);
        }

        if publish_externally {
            self.publish_external(name, &value);
        }

        self.bus
            .publish(TopicEvent::new(name, value.clone(), previous, now, origin));

        self.propagate(name, &value, origin, depth);
        Ok(UpdateOutcome::Applied)
    }

    fn publish_external(&self, name: &str, value: &Value) {
        let Some(publisher) = &self.publisher else {
            debug!("No publisher configured, {} not published", name);
            return;
        };
        match serde_json::to_vec(value) {
            Ok(payload) => match publisher.publish(name, &payload) {
                Ok(()) => debug!("Published topic {} ({} bytes)", name, payload.len()),
                Err(err) => warn!("Failed to publish topic {}: {}", name, err),
            },
            Err(err) => warn!("Failed to serialize value of topic {}: {}", name, err),
        }
    }

    /// Names of strategy-driven topics reading `name`, exactly or by wildcard
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.topics
            .read()
            .values()
            .filter(|topic| {
                topic
                    .derived()
                    .map(|config| {
                        !config.is_child()
                            && config.inputs.iter().any(|input| topic_matches(input, name))
                    })
                    .unwrap_or(false)
            })
            .map(|topic| topic.name.clone())
            .collect()
    }

    fn propagate(&self, name: &str, value: &Value, origin: &str, depth: usize) {
        for dependent in self.dependents_of(name) {
            if let Err(err) = self.run_dependent(&dependent, name, value, origin, depth) {
                warn!(
                    "Error processing inputs for topic {} (triggered by {}): {}",
                    dependent, name, err
                );
            }
        }
    }

    fn run_dependent(
        &self,
        dependent: &str,
        trigger: &str,
        trigger_value: &Value,
        origin: &str,
        depth: usize,
    ) -> Result<()> {
        let (config, last_output, inputs) = {
            let topics = self.topics.read();
            let Some(topic) = topics.get(dependent) else {
                return Ok(());
            };
            let Some(config) = topic.derived().cloned() else {
                return Ok(());
            };
            let inputs = snapshot_inputs(&topics, &config, trigger, trigger_value);
            (config, topic.value.clone(), inputs)
        };

        let request = ExecutionRequest {
            strategy_id: config.strategy_id.clone(),
            topic_name: dependent.to_string(),
            inputs: inputs.clone(),
            input_aliases: config.input_aliases.clone(),
            triggering_topic: trigger.to_string(),
            triggering_value: trigger_value.clone(),
            last_output,
            parameters: config.parameters.clone(),
        };

        let mut record = ExecutionRecord::new(dependent, &config.strategy_id, trigger, inputs);
        let result = self.strategies.execute(&request);
        match &result {
            Ok(outcome) => {
                record.emissions = outcome.emissions.clone();
                record.duration_ms = whole_millis(outcome.duration);
            }
            Err(err) => record.error = Some(err.to_string()),
        }
        if let Err(err) = self.store.save_execution_log(&record) {
            debug!("Failed to save execution log for {}: {}", dependent, err);
        }
        self.recorder.record(record);

        let outcome = result?;
        for emission in outcome.emissions {
            let target = emission.resolve(dependent);
            if let Err(err) = self.emit_to(&target, dependent, &config, emission.value, origin, depth + 1) {
                warn!("Emission from {} to {} failed: {}", dependent, target, err);
            }
        }
        Ok(())
    }

    fn emit_to(
        &self,
        target: &str,
        parent: &str,
        parent_config: &DerivedConfig,
        value: Value,
        origin: &str,
        depth: usize,
    ) -> Result<UpdateOutcome> {
        if target != parent {
            self.ensure_child(target, parent_config.publish_externally)?;
        }
        self.apply_update(target, value, origin, depth)
    }

    /// Make sure `name` exists as a Derived topic, creating a child if absent
    fn ensure_child(&self, name: &str, publish_externally: bool) -> Result<()> {
        let created = {
            let mut topics = self.topics.write();
            match topics.get(name) {
                Some(existing) if existing.variant() == TopicVariant::Derived => None,
                Some(existing) => {
                    return Err(EngineError::VariantConflict {
                        name: name.to_string(),
                        existing: existing.variant(),
                    })
                }
                None => {
                    validate_topic_name(name).map_err(EngineError::Validation)?;
                    let topic = Topic::new(
                        name,
                        TopicKind::Derived(DerivedConfig::child(publish_externally)),
                    );
                    topics.insert(name.to_string(), topic.clone());
                    Some(topic)
                }
            }
        };

        if let Some(topic) = created {
            self.persist_config(&topic);
            info!("Created child topic: {}", name);
        }
        Ok(())
    }

    // ========================================================================
    // Rehydration
    // ========================================================================

    /// Rebuild topics and their last values from the store
    ///
    /// Restored values are not propagated. Returns the number of topics added.
    pub fn rehydrate(&self) -> Result<usize> {
        let configs = self.store.load_all_topic_configs()?;
        let mut restored = Vec::new();

        for config in configs {
            let name = config.name.clone();
            let value = self.store.load_topic_value(&name)?;

            let mut topics = self.topics.write();
            if topics.contains_key(&name) {
                continue;
            }
            let mut topic = Topic::from_config(config);
            if let Some(value) = value {
                topic.value = value;
            }
            let scheduled = topic.periodic().map(PeriodicConfig::is_scheduled).unwrap_or(false);
            topics.insert(name.clone(), topic);
            restored.push((name, scheduled));
        }

        for (name, scheduled) in &restored {
            if *scheduled {
                if let Err(err) = self.start_periodic(name) {
                    warn!("Rehydrated periodic topic {} not started: {}", name, err);
                }
            }
        }

        info!("Rehydrated {} topics from the state store", restored.len());
        Ok(restored.len())
    }
}

impl Drop for TopicRegistry {
    fn drop(&mut self) {
        self.tickers.get_mut().clear();
    }
}

/// Input values a dependent sees for one trigger
///
/// An input matching the trigger (verbatim or by wildcard) takes the trigger's
/// new value under the trigger's name. Other inputs are read by exact name;
/// missing topics read as null. Configured aliases replace the key.
fn snapshot_inputs(
    topics: &BTreeMap<String, Topic>,
    config: &DerivedConfig,
    trigger: &str,
    trigger_value: &Value,
) -> Map<String, Value> {
    let mut inputs = Map::new();
    for pattern in &config.inputs {
        let (resolved, value) = if topic_matches(pattern, trigger) {
            (trigger, trigger_value.clone())
        } else {
            let value = if is_wildcard(pattern) {
                Value::Null
            } else {
                topics
                    .get(pattern)
                    .map(|topic| topic.value.clone())
                    .unwrap_or(Value::Null)
            };
            (pattern.as_str(), value)
        };

        let key = config
            .input_aliases
            .get(pattern)
            .cloned()
            .unwrap_or_else(|| resolved.to_string());
        inputs.insert(key, value);
    }
    inputs
}

fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Noisy system topics log at trace level
fn should_log_update(name: &str, variant: TopicVariant) -> bool {
    if variant != TopicVariant::Periodic {
        return true;
    }
    !(name.starts_with("system/ticker/")
        || name.starts_with("system/scheduler/")
        || name == "system/events/heartbeat")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::ChannelPublisher;
    use crate::strategy::{ExecutionLimits, Strategy};
    use crate::testing::{FailingStore, FnExecutor};
    use serde_json::json;

    fn strategies() -> Arc<StrategyEngine> {
        let engine = StrategyEngine::without_executors(ExecutionLimits {
            timeout: Duration::from_millis(500),
            ..Default::default()
        });
        engine.register_executor("mock", Arc::new(FnExecutor::standard()));
        for (id, code) in [
            ("double", "double"),
            ("add-10", "add-10"),
            ("sum", "sum"),
            ("split", "split"),
            ("echo-inputs", "echo-inputs"),
            ("echo-trigger", "echo-trigger"),
            ("echo-last", "echo-last"),
            ("silent", "silent"),
            ("fail", "fail"),
            ("to-source", "emit-to sensors/outside"),
        ] {
            engine
                .add_strategy(Strategy::new(id, id, code).with_language("mock"))
                .unwrap();
        }
        engine
            .add_strategy(
                Strategy::new("pair", "Pair", "sum")
                    .with_language("mock")
                    .with_max_inputs(2)
                    .with_default_input_aliases(vec!["left".to_string(), "right".to_string()]),
            )
            .unwrap();
        Arc::new(engine)
    }

    fn registry() -> Arc<TopicRegistry> {
        TopicRegistry::builder(strategies()).build()
    }

    fn inputs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_source_is_idempotent() {
        let registry = registry();
        registry.register_source("sensors/kitchen/temp").unwrap();
        registry.update_value("sensors/kitchen/temp", json!(21)).unwrap();
        let again = registry.register_source("sensors/kitchen/temp").unwrap();

        assert_eq!(again.value, json!(21));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_names_unique_across_variants() {
        let registry = registry();
        registry.register_source("a").unwrap();

        assert!(matches!(
            registry.register_derived("a", DerivedConfig::new("double", inputs(&["b"]))),
            Err(EngineError::AlreadyExists(_))
        ));
        assert!(matches!(
            registry.register_periodic("a", PeriodicConfig::on_demand("x")),
            Err(EngineError::AlreadyExists(_))
        ));

        registry
            .register_derived("b", DerivedConfig::new("double", inputs(&["a"])))
            .unwrap();
        assert!(matches!(
            registry.register_source("b"),
            Err(EngineError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_register_derived_validation() {
        let registry = registry();
        assert!(matches!(
            registry.register_derived("x", DerivedConfig::new("", inputs(&["a"]))),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            registry.register_derived("x", DerivedConfig::new("double", Vec::new())),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            registry.register_derived("x/+", DerivedConfig::new("double", inputs(&["a"]))),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            registry.register_derived("x", DerivedConfig::new("double", inputs(&["a/#/b"]))),
            Err(EngineError::Validation(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_max_inputs() {
        let registry = registry();
        assert!(matches!(
            registry.register_derived("p", DerivedConfig::new("pair", inputs(&["a", "b", "c"]))),
            Err(EngineError::TooManyInputs {
                max: 2,
                given: 3,
                ..
            })
        ));
        assert!(!registry.contains("p"));

        registry
            .register_derived("p", DerivedConfig::new("pair", inputs(&["a", "b"])))
            .unwrap();
        registry
            .register_derived("s", DerivedConfig::new("sum", inputs(&["a", "b", "c", "d", "e"])))
            .unwrap();
    }

    #[test]
    fn test_default_input_aliases_fill_gaps() {
        let registry = registry();
        let topic = registry
            .register_derived(
                "p",
                DerivedConfig::new("pair", inputs(&["a", "b"])).with_alias("b", "custom"),
            )
            .unwrap();

        let aliases = &topic.derived().unwrap().input_aliases;
        assert_eq!(aliases.get("a").map(String::as_str), Some("left"));
        assert_eq!(aliases.get("b").map(String::as_str), Some("custom"));
    }

    #[test]
    fn test_chain_propagates_in_order() {
        let registry = registry();
        registry.register_source("A").unwrap();
        registry
            .register_derived("B", DerivedConfig::new("double", inputs(&["A"])))
            .unwrap();
        registry
            .register_derived("C", DerivedConfig::new("add-10", inputs(&["B"])))
            .unwrap();
        let mut all = registry.bus().subscribe_all();

        registry.update_value("A", json!(5)).unwrap();

        assert_eq!(registry.get("B").unwrap().value, json!(10.0));
        assert_eq!(registry.get("C").unwrap().value, json!(20.0));

        let order: Vec<String> = all.drain().into_iter().map(|e| e.topic).collect();
        assert_eq!(order, inputs(&["A", "B", "C"]));
    }

    #[test]
    fn test_events_carry_previous_value_and_origin() {
        let registry = registry();
        registry.register_source("A").unwrap();
        registry
            .register_derived("B", DerivedConfig::new("double", inputs(&["A"])))
            .unwrap();
        registry.update_value("A", json!(1)).unwrap();

        let mut b = registry.bus().subscribe("B");
        registry.update_value("A", json!(2)).unwrap();

        let event = b.try_recv().unwrap();
        assert_eq!(event.value, json!(4.0));
        assert_eq!(event.previous_value, json!(2.0));
        assert_eq!(event.trigger_topic, "A");
    }

    #[test]
    fn test_child_topic_created_and_updated_in_place() {
        let registry = registry();
        registry.register_source("telemetry").unwrap();
        registry
            .register_derived(
                "car",
                DerivedConfig::new("split", inputs(&["telemetry"])).publish_externally(true),
            )
            .unwrap();

        registry
            .update_value("telemetry", json!({"battery": 75}))
            .unwrap();

        let child = registry.get("car/battery").unwrap();
        assert_eq!(child.value, json!(75));
        let config = child.derived().unwrap();
        assert!(config.strategy_id.is_empty());
        assert!(config.inputs.is_empty());
        assert!(config.publish_externally);
        let created_at = child.created_at;

        registry
            .update_value("telemetry", json!({"battery": 74}))
            .unwrap();
        let child = registry.get("car/battery").unwrap();
        assert_eq!(child.value, json!(74));
        assert_eq!(child.created_at, created_at);
        assert_eq!(registry.list_by_variant(TopicVariant::Derived).len(), 2);
    }

    #[test]
    fn test_emission_to_source_topic_conflicts() {
        let registry = registry();
        registry.register_source("sensors/outside").unwrap();
        registry.register_source("trigger").unwrap();
        registry
            .register_derived("relay", DerivedConfig::new("to-source", inputs(&["trigger"])))
            .unwrap();

        registry.update_value("trigger", json!(3)).unwrap();

        assert_eq!(registry.get("sensors/outside").unwrap().value, Value::Null);
        assert_eq!(registry.variant_of("sensors/outside"), Some(TopicVariant::Source));
    }

    #[test]
    fn test_suppress_unchanged() {
        let registry = registry();
        registry.register_source("A").unwrap();
        registry
            .register_derived(
                "B",
                DerivedConfig::new("echo-trigger", inputs(&["A"])).suppress_unchanged(true),
            )
            .unwrap();
        registry
            .register_derived("C", DerivedConfig::new("echo-trigger", inputs(&["B"])))
            .unwrap();

        registry.update_value("A", json!(1)).unwrap();
        let first = registry.get("B").unwrap().last_updated_at;
        let c_runs = registry.recorder().records_for_topic("C").len();

        assert_eq!(
            registry.update_value("B", json!(1)).unwrap(),
            UpdateOutcome::Suppressed
        );
        assert_eq!(registry.get("B").unwrap().last_updated_at, first);
        assert_eq!(registry.recorder().records_for_topic("C").len(), c_runs);
    }

    #[test]
    fn test_wildcard_dependents_and_aliases() {
        let registry = registry();
        registry.register_source("sensors/kitchen/temp").unwrap();
        registry.register_source("sensors/hall/temp").unwrap();
        registry
            .register_derived(
                "report",
                DerivedConfig::new("echo-inputs", inputs(&["sensors/+/temp", "setpoint"]))
                    .with_alias("setpoint", "target"),
            )
            .unwrap();

        registry.update_value("sensors/kitchen/temp", json!(21)).unwrap();
        assert_eq!(
            registry.get("report").unwrap().value,
            json!({"sensors/kitchen/temp": 21, "target": null})
        );

        registry.update_value("sensors/hall/temp", json!(18)).unwrap();
        assert_eq!(
            registry.get("report").unwrap().value,
            json!({"sensors/hall/temp": 18, "target": null})
        );
    }

    #[test]
    fn test_failing_dependent_does_not_stop_siblings() {
        let registry = registry();
        registry.register_source("A").unwrap();
        registry
            .register_derived("broken", DerivedConfig::new("fail", inputs(&["A"])))
            .unwrap();
        registry
            .register_derived("healthy", DerivedConfig::new("double", inputs(&["A"])))
            .unwrap();

        assert_eq!(
            registry.update_value("A", json!(2)).unwrap(),
            UpdateOutcome::Applied
        );
        assert_eq!(registry.get("healthy").unwrap().value, json!(4.0));
        assert_eq!(registry.get("broken").unwrap().value, Value::Null);

        let failures: Vec<ExecutionRecord> = registry
            .recorder()
            .records_for_topic("broken")
            .into_iter()
            .filter(|r| !r.succeeded())
            .collect();
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_no_emission_leaves_value() {
        let registry = registry();
        registry.register_source("A").unwrap();
        registry
            .register_derived("quiet", DerivedConfig::new("silent", inputs(&["A"])))
            .unwrap();

        registry.update_value("A", json!(1)).unwrap();
        let quiet = registry.get("quiet").unwrap();
        assert_eq!(quiet.value, Value::Null);
        assert!(quiet.last_updated_at.is_none());
    }

    #[test]
    fn test_last_output_is_own_previous_value() {
        let registry = registry();
        registry.register_source("A").unwrap();
        registry
            .register_derived("memory", DerivedConfig::new("echo-last", inputs(&["A"])))
            .unwrap();

        registry.update_value("A", json!(1)).unwrap();
        assert_eq!(registry.get("memory").unwrap().value, json!({}));
    }

    #[test]
    fn test_cycle_is_bounded() {
        let registry = TopicRegistry::builder(strategies()).max_depth(8).build();
        registry.register_source("seed").unwrap();
        registry
            .register_derived("ping", DerivedConfig::new("add-10", inputs(&["seed", "pong"])))
            .unwrap();
        registry
            .register_derived("pong", DerivedConfig::new("add-10", inputs(&["ping"])))
            .unwrap();

        assert_eq!(
            registry.update_value("seed", json!(0)).unwrap(),
            UpdateOutcome::Applied
        );
        assert!(registry.get("ping").unwrap().value.as_f64().unwrap() > 0.0);
        assert!(registry.recorder().len() <= 16);
    }

    #[test]
    fn test_store_failures_are_not_fatal() {
        let registry = TopicRegistry::builder(strategies())
            .store(Arc::new(FailingStore))
            .build();
        registry.register_source("A").unwrap();
        registry
            .register_derived("B", DerivedConfig::new("double", inputs(&["A"])))
            .unwrap();

        registry.update_value("A", json!(3)).unwrap();
        assert_eq!(registry.get("B").unwrap().value, json!(6.0));
        assert!(registry.rehydrate().is_err());
    }

    #[test]
    fn test_publish_externally() {
        let publisher = Arc::new(ChannelPublisher::new());
        let mut outbound = publisher.subscribe();
        let registry = TopicRegistry::builder(strategies())
            .publisher(publisher)
            .build();
        registry.register_source("A").unwrap();
        registry
            .register_derived(
                "B",
                DerivedConfig::new("double", inputs(&["A"])).publish_externally(true),
            )
            .unwrap();
        registry
            .register_derived("C", DerivedConfig::new("double", inputs(&["A"])))
            .unwrap();

        registry.update_value("A", json!(2)).unwrap();

        let message = outbound.try_recv().unwrap();
        assert_eq!(message.topic, "B");
        assert_eq!(message.payload, b"4.0".to_vec());
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn test_handle_delivery() {
        let registry = registry();
        registry.register_source("trigger").unwrap();
        registry
            .register_derived("doubled", DerivedConfig::new("double", inputs(&["trigger"])))
            .unwrap();

        let outcome = registry
            .handle_delivery(&Delivery::new("door/front", "open"))
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied);
        assert_eq!(registry.get("door/front").unwrap().value, json!("open"));

        registry.update_value("trigger", json!(1)).unwrap();
        let echo = registry
            .handle_delivery(&Delivery::new("doubled", "99"))
            .unwrap();
        assert_eq!(echo, UpdateOutcome::Ignored);
        assert_eq!(registry.get("doubled").unwrap().value, json!(2.0));
    }

    #[test]
    fn test_update_derived_and_remove() {
        let registry = registry();
        registry.register_source("A").unwrap();
        registry
            .register_derived("B", DerivedConfig::new("double", inputs(&["A"])))
            .unwrap();
        registry.update_value("A", json!(2)).unwrap();

        let updated = registry
            .update_derived("B", DerivedConfig::new("add-10", inputs(&["A"])))
            .unwrap();
        assert_eq!(updated.value, json!(4.0));

        registry.update_value("A", json!(2)).unwrap();
        assert_eq!(registry.get("B").unwrap().value, json!(12.0));

        assert!(matches!(
            registry.update_derived("A", DerivedConfig::new("double", inputs(&["B"]))),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            registry.update_derived("missing", DerivedConfig::new("double", inputs(&["A"]))),
            Err(EngineError::NotFound(_))
        ));

        registry.remove("B").unwrap();
        assert!(registry.get("B").is_none());
        assert!(matches!(registry.remove("B"), Err(EngineError::NotFound(_))));
        assert!(registry.dependents_of("A").is_empty());
    }

    #[test]
    fn test_counts_and_listing() {
        let registry = registry();
        registry.register_source("b").unwrap();
        registry.register_source("a").unwrap();
        registry
            .register_derived("c", DerivedConfig::new("double", inputs(&["a"])))
            .unwrap();
        registry
            .register_periodic("system/events/startup", PeriodicConfig::on_demand("startup"))
            .unwrap();

        let counts = registry.counts();
        assert_eq!(counts[&TopicVariant::Source], 2);
        assert_eq!(counts[&TopicVariant::Derived], 1);
        assert_eq!(counts[&TopicVariant::Periodic], 1);

        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, inputs(&["a", "b", "c", "system/events/startup"]));
    }

    #[test]
    fn test_concurrent_producers_do_not_deadlock() {
        let registry = registry();
        for source in ["s0", "s1", "s2", "telemetry"] {
            registry.register_source(source).unwrap();
        }
        registry
            .register_derived("total", DerivedConfig::new("sum", inputs(&["s0", "s1", "s2"])))
            .unwrap();
        registry
            .register_derived("car", DerivedConfig::new("split", inputs(&["telemetry"])))
            .unwrap();
        registry
            .register_derived("doubled", DerivedConfig::new("double", inputs(&["total"])))
            .unwrap();

        let (done_tx, done_rx) = crossbeam::channel::unbounded();
        let mut handles = Vec::new();
        for worker in 0..4u64 {
            let registry = registry.clone();
            let done = done_tx.clone();
            handles.push(std::thread::spawn(move || {
                for round in 0..50u64 {
                    let source = format!("s{}", (worker + round) % 3);
                    registry.update_value(&source, json!(round)).unwrap();
                    registry
                        .update_value("telemetry", json!({ "a": worker, "b": round }))
                        .unwrap();
                }
                let _ = done.send(());
            }));
        }
        {
            let registry = registry.clone();
            let done = done_tx.clone();
            handles.push(std::thread::spawn(move || {
                for round in 0..50 {
                    let name = format!("churn/{}", round % 5);
                    registry
                        .register_derived(&name, DerivedConfig::new("echo-trigger", inputs(&["s0"])))
                        .unwrap();
                    registry.remove(&name).unwrap();
                }
                let _ = done.send(());
            }));
        }
        drop(done_tx);

        for _ in 0..handles.len() {
            done_rx
                .recv_timeout(Duration::from_secs(30))
                .expect("producers did not finish in time");
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(registry.list().iter().all(|topic| !topic.name.starts_with("churn/")));
        assert_eq!(registry.list_by_variant(TopicVariant::Derived).len(), 5);

        registry.update_value("s0", json!(1)).unwrap();
        registry.update_value("s1", json!(2)).unwrap();
        registry.update_value("s2", json!(3)).unwrap();
        registry
            .update_value("telemetry", json!({ "a": 7, "b": 8 }))
            .unwrap();

        assert_eq!(registry.get("total").unwrap().value, json!(6.0));
        assert_eq!(registry.get("doubled").unwrap().value, json!(12.0));
        assert_eq!(registry.get("car/a").unwrap().value, json!(7));
        assert_eq!(registry.get("car/b").unwrap().value, json!(8));
    }

    #[test]
    fn test_rehydrated_value_suppresses_equal_update() {
        let store = Arc::new(MemoryStore::new());
        let first = TopicRegistry::builder(strategies()).store(store.clone()).build();
        first.register_source("A").unwrap();
        first
            .register_derived(
                "B",
                DerivedConfig::new("echo-trigger", inputs(&["A"])).suppress_unchanged(true),
            )
            .unwrap();
        first.update_value("A", json!(5)).unwrap();

        let second = TopicRegistry::builder(strategies()).store(store).build();
        second.rehydrate().unwrap();
        assert_eq!(
            second.update_value("B", json!(5)).unwrap(),
            UpdateOutcome::Suppressed
        );
        assert!(second.get("B").unwrap().last_updated_at.is_none());
        assert_eq!(
            second.update_value("B", json!(6)).unwrap(),
            UpdateOutcome::Applied
        );
    }

    #[test]
    fn test_execution_duration_is_recorded() {
        let registry = registry();
        registry.register_source("A").unwrap();
        registry
            .register_derived("B", DerivedConfig::new("double", inputs(&["A"])))
            .unwrap();
        registry.update_value("A", json!(1)).unwrap();

        let records = registry.recorder().records_for_topic("B");
        assert_eq!(records.len(), 1);
        assert!(records[0].duration_ms < 500);
        assert!(records[0].succeeded());
    }

    #[test]
    fn test_whole_millis_saturates() {
        assert_eq!(whole_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(whole_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_rehydrate_restores_without_propagation() {
        let store = Arc::new(MemoryStore::new());
        let first = TopicRegistry::builder(strategies()).store(store.clone()).build();
        first.register_source("A").unwrap();
        first
            .register_derived("B", DerivedConfig::new("double", inputs(&["A"])))
            .unwrap();
        first.update_value("A", json!(4)).unwrap();

        let second = TopicRegistry::builder(strategies()).store(store).build();
        assert_eq!(second.rehydrate().unwrap(), 2);

        let b = second.get("B").unwrap();
        assert_eq!(b.value, json!(8.0));
        assert!(b.last_updated_at.is_none());
        assert!(second.recorder().is_empty());
        assert_eq!(second.rehydrate().unwrap(), 0);
    }
}
