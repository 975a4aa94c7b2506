//! Strategy catalog and bounded execution

use super::{
    Emission, ExecutionContext, ExecutionLimits, ExecutionOutcome, ExecutionRequest,
    JavaScriptExecutor, LanguageExecutor, ScriptOutput, Strategy, DEFAULT_LANGUAGE,
};
use crate::error::StrategyError;
use chrono::Utc;
use crossbeam::channel::{bounded, RecvTimeoutError};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Holds registered strategies and the executors able to run them
pub struct StrategyEngine {
    strategies: RwLock<HashMap<String, Arc<Strategy>>>,
    executors: RwLock<HashMap<String, Arc<dyn LanguageExecutor>>>,
    limits: ExecutionLimits,
    workers: Arc<AtomicUsize>,
}

/// Decrements the live worker count when a worker thread finishes or unwinds
struct WorkerGuard(Arc<AtomicUsize>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StrategyEngine {
    /// Engine with the JavaScript executor and default limits
    pub fn new() -> Self {
        Self::with_limits(ExecutionLimits::default())
    }

    /// Engine with the JavaScript executor and the given limits
    pub fn with_limits(limits: ExecutionLimits) -> Self {
        let engine = Self::without_executors(limits.clone());
        engine.register_executor(
            DEFAULT_LANGUAGE,
            Arc::new(JavaScriptExecutor::from_limits(&limits)),
        );
        engine
    }

    /// Engine with no language bound; executors are registered explicitly
    pub fn without_executors(limits: ExecutionLimits) -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
            executors: RwLock::new(HashMap::new()),
            limits,
            workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Worker threads still running, including ones abandoned after a timeout
    pub fn active_workers(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    pub fn register_executor(&self, language: &str, executor: Arc<dyn LanguageExecutor>) {
        self.executors.write().insert(language.to_string(), executor);
        info!("Registered strategy executor for language: {}", language);
    }

    pub fn supported_languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.executors.read().keys().cloned().collect();
        languages.sort();
        languages
    }

    /// Add or replace a strategy after validating it
    pub fn add_strategy(&self, strategy: Strategy) -> Result<Arc<Strategy>, StrategyError> {
        let mut strategy = self.validate_strategy(strategy)?;
        strategy.updated_at = Utc::now();

        let strategy = Arc::new(strategy);
        self.strategies
            .write()
            .insert(strategy.id.clone(), strategy.clone());
        info!("Added strategy: {} ({})", strategy.name, strategy.id);

        Ok(strategy)
    }

    /// Add a strategy whose id is not yet taken
    pub fn create_strategy(&self, strategy: Strategy) -> Result<Arc<Strategy>, StrategyError> {
        if self.contains(&strategy.id) {
            return Err(StrategyError::AlreadyExists(strategy.id));
        }
        let mut strategy = self.validate_strategy(strategy)?;
        strategy.updated_at = Utc::now();

        let strategy = Arc::new(strategy);
        match self.strategies.write().entry(strategy.id.clone()) {
            Entry::Occupied(_) => return Err(StrategyError::AlreadyExists(strategy.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(strategy.clone());
            }
        }
        info!("Created strategy: {} ({})", strategy.name, strategy.id);

        Ok(strategy)
    }

    /// Replace an existing strategy, keeping its creation time
    pub fn update_strategy(&self, strategy: Strategy) -> Result<Arc<Strategy>, StrategyError> {
        let created_at = self
            .strategies
            .read()
            .get(&strategy.id)
            .map(|existing| existing.created_at)
            .ok_or_else(|| StrategyError::NotFound(strategy.id.clone()))?;

        let mut strategy = self.validate_strategy(strategy)?;
        strategy.created_at = created_at;
        strategy.updated_at = Utc::now();

        let strategy = Arc::new(strategy);
        self.strategies
            .write()
            .insert(strategy.id.clone(), strategy.clone());
        info!("Updated strategy: {} ({})", strategy.name, strategy.id);

        Ok(strategy)
    }

    pub fn remove_strategy(&self, strategy_id: &str) -> Result<(), StrategyError> {
        self.strategies
            .write()
            .remove(strategy_id)
            .ok_or_else(|| StrategyError::NotFound(strategy_id.to_string()))?;
        info!("Removed strategy: {}", strategy_id);
        Ok(())
    }

    pub fn get_strategy(&self, strategy_id: &str) -> Result<Arc<Strategy>, StrategyError> {
        self.strategies
            .read()
            .get(strategy_id)
            .cloned()
            .ok_or_else(|| StrategyError::NotFound(strategy_id.to_string()))
    }

    pub fn contains(&self, strategy_id: &str) -> bool {
        self.strategies.read().contains_key(strategy_id)
    }

    /// Snapshot of the catalog, sorted by id
    pub fn list_strategies(&self) -> Vec<Arc<Strategy>> {
        let mut strategies: Vec<Arc<Strategy>> = self.strategies.read().values().cloned().collect();
        strategies.sort_by(|a, b| a.id.cmp(&b.id));
        strategies
    }

    pub fn strategy_count(&self) -> usize {
        self.strategies.read().len()
    }

    /// Validate without registering
    pub fn validate_strategy(&self, mut strategy: Strategy) -> Result<Strategy, StrategyError> {
        if strategy.id.trim().is_empty() {
            return Err(StrategyError::Invalid("strategy ID is required".to_string()));
        }
        if strategy.name.trim().is_empty() {
            return Err(StrategyError::Invalid("strategy name is required".to_string()));
        }
        if strategy.code.trim().is_empty() {
            return Err(StrategyError::Invalid("strategy code is required".to_string()));
        }
        if strategy.language.is_empty() {
            strategy.language = DEFAULT_LANGUAGE.to_string();
        }

        let executor = self.executor_for(&strategy.language)?;
        let code = strategy.code.clone();
        let label = format!("validate-{}", strategy.id);
        self.run_bounded(&label, move || executor.validate(&code))
            .map_err(|err| match err {
                StrategyError::Runtime(message) | StrategyError::Invalid(message) => {
                    StrategyError::Invalid(format!("code validation failed: {}", message))
                }
                other => other,
            })?;

        Ok(strategy)
    }

    /// Run a registered strategy and reconcile its emissions
    pub fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, StrategyError> {
        let strategy = self.get_strategy(&request.strategy_id)?;
        let executor = self.executor_for(&strategy.language)?;
        self.run(strategy, executor, request)
    }

    /// Run an unregistered strategy against caller-supplied inputs
    ///
    /// Nothing in the catalog or the topic registry is touched.
    pub fn test_strategy(
        &self,
        strategy: &Strategy,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, StrategyError> {
        let language = if strategy.language.is_empty() {
            DEFAULT_LANGUAGE
        } else {
            strategy.language.as_str()
        };
        let executor = self.executor_for(language)?;
        self.run(Arc::new(strategy.clone()), executor, request)
    }

    fn executor_for(&self, language: &str) -> Result<Arc<dyn LanguageExecutor>, StrategyError> {
        self.executors
            .read()
            .get(language)
            .cloned()
            .ok_or_else(|| StrategyError::NoExecutorForLanguage(language.to_string()))
    }

    fn run(
        &self,
        strategy: Arc<Strategy>,
        executor: Arc<dyn LanguageExecutor>,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, StrategyError> {
        let last_outputs = if request.last_output.is_null() {
            Value::Object(Map::new())
        } else {
            request.last_output.clone()
        };

        let context = ExecutionContext {
            inputs: request.inputs.clone(),
            input_names: request.input_aliases.clone(),
            triggering_topic: request.triggering_topic.clone(),
            triggering_value: request.triggering_value.clone(),
            last_outputs,
            parameters: merge_parameters(&strategy.parameters, &request.parameters),
            topic_name: request.topic_name.clone(),
        };

        debug!(
            "Executing strategy {} ({}) for {} triggered by {}",
            strategy.name, strategy.id, request.topic_name, request.triggering_topic
        );

        let started = Instant::now();
        let worker_strategy = strategy.clone();
        let output: ScriptOutput = self
            .run_bounded(&strategy.id, move || executor.execute(&worker_strategy, &context))
            .map_err(|err| {
                warn!("Strategy {} execution failed: {}", strategy.id, err);
                err
            })?;
        let duration = started.elapsed();

        for message in &output.logs {
            debug!("Strategy log [{}]: {}", strategy.id, message);
        }

        let emissions = reconcile_emissions(output.emitted, output.result);
        debug!(
            "Strategy {} executed in {:?} with {} emissions",
            strategy.id,
            duration,
            emissions.len()
        );

        Ok(ExecutionOutcome {
            emissions,
            logs: output.logs,
            duration,
        })
    }

    /// Run `job` on a worker thread, abandoning it once the timeout passes
    ///
    /// An abandoned worker keeps running until its interpreter limits stop it.
    fn run_bounded<T, F>(&self, label: &str, job: F) -> Result<T, StrategyError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StrategyError> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.workers.fetch_add(1, Ordering::SeqCst);
        let guard = WorkerGuard(self.workers.clone());
        let spawned = thread::Builder::new()
            .name(format!("strategy-{}", label))
            .spawn(move || {
                let _guard = guard;
                let _ = tx.send(job());
            });
        if let Err(err) = spawned {
            // the closure, and the guard inside it, were dropped with the error
            return Err(StrategyError::Runtime(format!("failed to spawn strategy worker: {}", err)));
        }

        match rx.recv_timeout(self.limits.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Strategy worker {} exceeded {:?}; {} workers still running",
                    label,
                    self.limits.timeout,
                    self.active_workers()
                );
                Err(StrategyError::ExecutionTimeout(self.limits.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(StrategyError::Runtime("strategy worker panicked".to_string()))
            }
        }
    }
}

impl Default for StrategyEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Strategy defaults overlaid field by field with topic parameters
pub fn merge_parameters(defaults: &Map<String, Value>, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Last-value-wins reconciliation of a script's output
///
/// Later emits to a destination replace earlier ones. A non-null return value
/// replaces the main-topic emission; sub-topic emissions are untouched by it.
/// Destinations keep the order of their first emission.
pub fn reconcile_emissions(emitted: Vec<Emission>, result: Value) -> Vec<Emission> {
    let mut reconciled: Vec<Emission> = Vec::with_capacity(emitted.len() + 1);

    for emission in emitted {
        match reconciled
            .iter_mut()
            .find(|existing| existing.destination == emission.destination)
        {
            Some(existing) => existing.value = emission.value,
            None => reconciled.push(emission),
        }
    }

    if !result.is_null() {
        match reconciled.iter_mut().find(|existing| existing.is_main()) {
            Some(main) => main.value = result,
            None => reconciled.push(Emission::main(result)),
        }
    }

    reconciled
}
