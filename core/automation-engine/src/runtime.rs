//! Runtime facade wiring configuration, store, strategies and registry

use crate::config::EngineConfig;
use crate::error::{EngineError, Result, StrategyError};
use crate::events::Delivery;
use crate::publisher::Publisher;
use crate::registry::{TopicRegistry, UpdateOutcome};
use crate::store::StateStore;
use crate::strategy::{ExecutionOutcome, ExecutionRequest, Strategy, StrategyEngine};
use crate::topic::{DerivedConfig, Topic, TopicVariant};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// A running automation engine
///
/// Administrative operations persist through the state store and either
/// succeed completely or leave the engine unchanged.
pub struct AutomationEngine {
    config: EngineConfig,
    store: Arc<dyn StateStore>,
    strategies: Arc<StrategyEngine>,
    registry: Arc<TopicRegistry>,
}

impl AutomationEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        publisher: Option<Arc<dyn Publisher>>,
    ) -> Result<Self> {
        config.validate()?;
        let strategies = Arc::new(StrategyEngine::with_limits(config.execution_limits()?));
        Ok(Self::with_strategy_engine(config, store, publisher, strategies))
    }

    /// Build around an existing strategy engine (custom executors)
    pub fn with_strategy_engine(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        publisher: Option<Arc<dyn Publisher>>,
        strategies: Arc<StrategyEngine>,
    ) -> Self {
        let mut builder = TopicRegistry::builder(strategies.clone())
            .store(store.clone())
            .max_depth(config.propagation.max_depth)
            .recorder_capacity(config.recorder.capacity);
        if let Some(publisher) = publisher {
            builder = builder.publisher(publisher);
        }

        Self {
            config,
            store,
            strategies,
            registry: builder.build(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    pub fn strategies(&self) -> &Arc<StrategyEngine> {
        &self.strategies
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Load persisted state, install system topics and announce startup
    pub fn start(&self) -> Result<()> {
        let mut loaded = 0;
        for strategy in self.store.load_all_strategies()? {
            let id = strategy.id.clone();
            match self.strategies.add_strategy(strategy) {
                Ok(_) => loaded += 1,
                Err(err) => warn!("Skipping stored strategy {}: {}", id, err),
            }
        }

        let topics = self.registry.rehydrate()?;
        self.registry
            .install_system_topics(&self.config.system_topics)?;

        info!(
            "Automation engine started with {} strategies and {} stored topics",
            loaded, topics
        );

        if self.config.system_topics.event_topics {
            self.registry.emit_system_event(
                "startup",
                json!({ "strategies": loaded, "topics": self.registry.len() }),
            )?;
        }
        Ok(())
    }

    /// Announce shutdown and stop every timer
    pub fn shutdown(&self) {
        if self.config.system_topics.event_topics {
            if let Err(err) = self.registry.emit_system_event("shutdown", json!({})) {
                warn!("Failed to emit shutdown event: {}", err);
            }
        }
        self.registry.stop_all_periodic();
        info!("Automation engine stopped");
    }

    pub fn handle_delivery(&self, delivery: &Delivery) -> Result<UpdateOutcome> {
        self.registry.handle_delivery(delivery)
    }

    // ========================================================================
    // Derived topic administration
    // ========================================================================

    pub fn create_derived(&self, name: &str, config: DerivedConfig) -> Result<Topic> {
        self.registry.register_derived(name, config)
    }

    pub fn update_derived(&self, name: &str, config: DerivedConfig) -> Result<Topic> {
        self.registry.update_derived(name, config)
    }

    pub fn delete_derived(&self, name: &str) -> Result<Topic> {
        match self.registry.variant_of(name) {
            Some(TopicVariant::Derived) => self.registry.remove(name),
            Some(variant) => Err(EngineError::Validation(format!(
                "topic {} is a {} topic, not derived",
                name, variant
            ))),
            None => Err(EngineError::NotFound(name.to_string())),
        }
    }

    // ========================================================================
    // Strategy administration
    // ========================================================================

    pub fn create_strategy(&self, strategy: Strategy) -> Result<Arc<Strategy>> {
        let added = self.strategies.create_strategy(strategy).map_err(|err| match err {
            StrategyError::AlreadyExists(id) => EngineError::AlreadyExists(id),
            other => other.into(),
        })?;
        if let Err(err) = self.store.save_strategy(&added) {
            let _ = self.strategies.remove_strategy(&added.id);
            return Err(err.into());
        }
        Ok(added)
    }

    pub fn update_strategy(&self, strategy: Strategy) -> Result<Arc<Strategy>> {
        let previous = self.strategies.get_strategy(&strategy.id)?;

        let updated = self.strategies.update_strategy(strategy)?;
        if let Err(err) = self.store.save_strategy(&updated) {
            if let Err(restore) = self.strategies.add_strategy(previous.as_ref().clone()) {
                warn!("Failed to restore strategy {}: {}", previous.id, restore);
            }
            return Err(err.into());
        }
        Ok(updated)
    }

    /// Delete a strategy no topic uses any more
    pub fn delete_strategy(&self, strategy_id: &str) -> Result<()> {
        self.strategies.get_strategy(strategy_id)?;

        let users: Vec<String> = self
            .registry
            .list_by_variant(TopicVariant::Derived)
            .into_iter()
            .filter(|topic| {
                topic
                    .derived()
                    .map(|config| config.strategy_id == strategy_id)
                    .unwrap_or(false)
            })
            .map(|topic| topic.name)
            .collect();
        if !users.is_empty() {
            return Err(EngineError::Validation(format!(
                "strategy {} is used by topics {:?}",
                strategy_id, users
            )));
        }

        self.store.delete_strategy(strategy_id)?;
        self.strategies.remove_strategy(strategy_id)?;
        Ok(())
    }

    /// Run a strategy against caller-supplied inputs without touching any topic
    pub fn test_strategy(&self, strategy: &Strategy, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        Ok(self.strategies.test_strategy(strategy, request)?)
    }
}
