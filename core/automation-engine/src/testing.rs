//! Test doubles shared by unit tests

use crate::error::{StoreError, StrategyError};
use crate::store::StateStore;
use crate::strategy::{Emission, ExecutionContext, LanguageExecutor, ScriptOutput, Strategy};
use crate::topic::TopicConfig;
use serde_json::{json, Value};
use std::thread;
use std::time::Duration;

type Handler = dyn Fn(&Strategy, &ExecutionContext) -> Result<ScriptOutput, StrategyError> + Send + Sync;

/// Executor whose behaviour is a Rust closure instead of a script
pub struct FnExecutor {
    handler: Box<Handler>,
    known: Vec<&'static str>,
}

impl FnExecutor {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Strategy, &ExecutionContext) -> Result<ScriptOutput, StrategyError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            known: Vec::new(),
        }
    }

    /// Strategy code names a canned behaviour (`double`, `add-10`, `split`, ...)
    pub fn standard() -> Self {
        let mut executor = Self::new(standard_behaviour);
        executor.known = vec![
            "double",
            "add-10",
            "sum",
            "split",
            "echo-inputs",
            "echo-parameters",
            "echo-last",
            "echo-trigger",
            "emit-to",
            "silent",
            "fail",
            "sleep",
            "panic",
        ];
        executor
    }
}

impl LanguageExecutor for FnExecutor {
    fn validate(&self, code: &str) -> Result<(), StrategyError> {
        let behaviour = code.split_whitespace().next().unwrap_or("");
        if self.known.is_empty() || self.known.contains(&behaviour) {
            Ok(())
        } else {
            Err(StrategyError::Invalid(format!("unknown behaviour {}", behaviour)))
        }
    }

    fn execute(
        &self,
        strategy: &Strategy,
        context: &ExecutionContext,
    ) -> Result<ScriptOutput, StrategyError> {
        (self.handler)(strategy, context)
    }
}

fn returning(result: Value) -> ScriptOutput {
    ScriptOutput {
        result,
        ..Default::default()
    }
}

fn standard_behaviour(strategy: &Strategy, context: &ExecutionContext) -> Result<ScriptOutput, StrategyError> {
    let mut words = strategy.code.split_whitespace();
    let behaviour = words.next().unwrap_or("");
    let number = context.triggering_value.as_f64().unwrap_or(0.0);

    match behaviour {
        "double" => Ok(returning(json!(number * 2.0))),
        "add-10" => Ok(returning(json!(number + 10.0))),
        "sum" => Ok(returning(json!(context
            .inputs
            .values()
            .filter_map(Value::as_f64)
            .sum::<f64>()))),
        "split" => {
            let emitted = context
                .triggering_value
                .as_object()
                .map(|fields| {
                    fields
                        .iter()
                        .map(|(key, value)| Emission::to(format!("/{}", key), value.clone()))
                        .collect()
                })
                .unwrap_or_default();
            Ok(ScriptOutput {
                emitted,
                ..Default::default()
            })
        }
        "echo-inputs" => Ok(returning(Value::Object(context.inputs.clone()))),
        "echo-parameters" => Ok(returning(Value::Object(context.parameters.clone()))),
        "echo-last" => Ok(returning(context.last_outputs.clone())),
        "echo-trigger" => Ok(returning(context.triggering_value.clone())),
        "emit-to" => {
            let destination = words.next().unwrap_or("");
            Ok(ScriptOutput {
                emitted: vec![Emission::to(destination, context.triggering_value.clone())],
                ..Default::default()
            })
        }
        "silent" => Ok(ScriptOutput::default()),
        "fail" => Err(StrategyError::Runtime("strategy failed on purpose".to_string())),
        "sleep" => {
            thread::sleep(Duration::from_secs(2));
            Ok(ScriptOutput::default())
        }
        "panic" => panic!("strategy panicked on purpose"),
        other => Err(StrategyError::Runtime(format!("unknown behaviour {}", other))),
    }
}

/// Store whose every operation fails
pub struct FailingStore;

fn unavailable<T>() -> Result<T, StoreError> {
    Err(StoreError::Backend("store unavailable".to_string()))
}

impl StateStore for FailingStore {
    fn save_topic_config(&self, _config: &TopicConfig) -> Result<(), StoreError> {
        unavailable()
    }

    fn delete_topic_config(&self, _name: &str) -> Result<(), StoreError> {
        unavailable()
    }

    fn load_all_topic_configs(&self) -> Result<Vec<TopicConfig>, StoreError> {
        unavailable()
    }

    fn save_topic_value(&self, _name: &str, _value: &Value) -> Result<(), StoreError> {
        unavailable()
    }

    fn load_topic_value(&self, _name: &str) -> Result<Option<Value>, StoreError> {
        unavailable()
    }

    fn save_strategy(&self, _strategy: &Strategy) -> Result<(), StoreError> {
        unavailable()
    }

    fn delete_strategy(&self, _strategy_id: &str) -> Result<(), StoreError> {
        unavailable()
    }

    fn load_all_strategies(&self) -> Result<Vec<Strategy>, StoreError> {
        unavailable()
    }
}
