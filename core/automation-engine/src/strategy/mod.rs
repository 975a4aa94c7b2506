//! Strategies: named, versioned transformation logic run against topic inputs
//!
//! The [`StrategyEngine`] owns the strategy catalog and the per-language
//! [`LanguageExecutor`]s. Executors only turn a script plus an
//! [`ExecutionContext`] into a raw [`ScriptOutput`]; the engine bounds the run
//! in wall-clock time and reconciles the output into [`Emission`]s.

mod engine;
mod javascript;

pub use engine::{merge_parameters, reconcile_emissions, StrategyEngine};
pub use javascript::JavaScriptExecutor;

use crate::error::StrategyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Language assumed when a strategy does not declare one
pub const DEFAULT_LANGUAGE: &str = "javascript";

/// Default wall-clock bound for one strategy run
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Iterations one interpreter loop may run before the script is stopped
///
/// A timed-out worker is not interrupted from outside, so this bound is what
/// ends a runaway loop.
pub const DEFAULT_LOOP_ITERATION_LIMIT: u64 = 10_000_000;

/// Deepest call stack a script may build
pub const DEFAULT_RECURSION_LIMIT: usize = 512;

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

/// Stored strategy definition (wire format)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Source text; must define `process(context)`
    pub code: String,

    #[serde(default = "default_language")]
    pub language: String,

    /// Defaults, overlaid by topic parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,

    /// 0 = unlimited
    #[serde(default)]
    pub max_inputs: usize,

    #[serde(default)]
    pub default_input_aliases: Vec<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Strategy {
    pub fn new(id: impl Into<String>, name: impl Into<String>, code: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            code: code.into(),
            language: default_language(),
            parameters: Map::new(),
            max_inputs: 0,
            default_input_aliases: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_max_inputs(mut self, max_inputs: usize) -> Self {
        self.max_inputs = max_inputs;
        self
    }

    pub fn with_default_input_aliases(mut self, aliases: Vec<String>) -> Self {
        self.default_input_aliases = aliases;
        self
    }
}

/// Everything a script can see through its `context` argument
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// Input values keyed by alias, or by topic name when unaliased
    pub inputs: Map<String, Value>,

    pub input_names: HashMap<String, String>,

    pub triggering_topic: String,

    pub triggering_value: Value,

    /// The dependent's own last value; `{}` when it has none yet
    pub last_outputs: Value,

    /// Strategy defaults merged with topic parameters
    pub parameters: Map<String, Value>,

    pub topic_name: String,
}

/// A request to run one strategy on behalf of one topic
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionRequest {
    pub strategy_id: String,
    pub topic_name: String,
    pub inputs: Map<String, Value>,
    pub input_aliases: HashMap<String, String>,
    pub triggering_topic: String,
    pub triggering_value: Value,
    pub last_output: Value,
    pub parameters: Map<String, Value>,
}

/// A (destination, value) pair produced by a strategy
///
/// An empty destination addresses the strategy's own (main) topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emission {
    #[serde(default)]
    pub destination: String,

    #[serde(default)]
    pub value: Value,
}

impl Emission {
    pub fn main(value: Value) -> Self {
        Self {
            destination: String::new(),
            value,
        }
    }

    pub fn to(destination: impl Into<String>, value: Value) -> Self {
        Self {
            destination: destination.into(),
            value,
        }
    }

    pub fn is_main(&self) -> bool {
        self.destination.is_empty()
    }

    /// Full topic name for this emission relative to `parent`
    ///
    /// Paths starting with `/` are appended to the parent name; anything else
    /// is an absolute topic name.
    pub fn resolve(&self, parent: &str) -> String {
        if self.is_main() {
            parent.to_string()
        } else if self.destination.starts_with('/') {
            format!("{}{}", parent, self.destination)
        } else {
            self.destination.clone()
        }
    }
}

/// Raw result of running a script, before reconciliation
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScriptOutput {
    /// Return value of the entry point (`Null` when absent)
    #[serde(default)]
    pub result: Value,

    /// Every `emit` call, in call order
    #[serde(default)]
    pub emitted: Vec<Emission>,

    #[serde(default)]
    pub logs: Vec<String>,
}

/// Reconciled result of one strategy run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub emissions: Vec<Emission>,
    pub logs: Vec<String>,
    pub duration: Duration,
}

/// Runtime bound to one scripting language
pub trait LanguageExecutor: Send + Sync {
    /// Check that `code` compiles and defines the entry point
    fn validate(&self, code: &str) -> Result<(), StrategyError>;

    /// Run the strategy's entry point against `context`
    fn execute(
        &self,
        strategy: &Strategy,
        context: &ExecutionContext,
    ) -> Result<ScriptOutput, StrategyError>;
}

/// Resource bounds applied to every strategy run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub loop_iteration_limit: Option<u64>,
    pub recursion_limit: Option<usize>,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EXECUTION_TIMEOUT,
            loop_iteration_limit: Some(DEFAULT_LOOP_ITERATION_LIMIT),
            recursion_limit: Some(DEFAULT_RECURSION_LIMIT),
        }
    }
}
