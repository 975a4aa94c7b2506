//! Topic definitions: the unit of state in the automation graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Topic variant discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicVariant {
    /// Value originates from an external event feed
    Source,
    /// Value computed by a strategy (or set by a parent's emissions)
    Derived,
    /// Value produced autonomously on a timer
    Periodic,
}

impl TopicVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicVariant::Source => "source",
            TopicVariant::Derived => "derived",
            TopicVariant::Periodic => "periodic",
        }
    }
}

impl fmt::Display for TopicVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of a derived topic
///
/// An empty `strategy_id` marks a child topic: no inputs, no strategy, value
/// set only by its parent's emissions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedConfig {
    /// Ordered input patterns (exact names or wildcard patterns)
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Input pattern -> key the strategy sees
    #[serde(default)]
    pub input_aliases: HashMap<String, String>,

    #[serde(default)]
    pub strategy_id: String,

    /// Overlaid on the strategy's default parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,

    #[serde(default)]
    pub publish_externally: bool,

    /// Skip re-emission when the new value deep-equals the current one
    #[serde(default)]
    pub suppress_unchanged: bool,
}

impl DerivedConfig {
    /// Strategy-driven topic reading `inputs`
    pub fn new(strategy_id: impl Into<String>, inputs: Vec<String>) -> Self {
        Self {
            inputs,
            strategy_id: strategy_id.into(),
            ..Default::default()
        }
    }

    /// Child topic created from a parent's sub-path emission
    pub fn child(publish_externally: bool) -> Self {
        Self {
            publish_externally,
            ..Default::default()
        }
    }

    pub fn with_alias(mut self, pattern: impl Into<String>, alias: impl Into<String>) -> Self {
        self.input_aliases.insert(pattern.into(), alias.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn publish_externally(mut self, publish: bool) -> Self {
        self.publish_externally = publish;
        self
    }

    pub fn suppress_unchanged(mut self, suppress: bool) -> Self {
        self.suppress_unchanged = suppress;
        self
    }

    pub fn is_child(&self) -> bool {
        self.strategy_id.is_empty()
    }
}

/// Configuration of a periodic topic
///
/// `interval` uses duration strings such as `5s` or `1m30s`. A topic with
/// neither descriptor only emits on demand (system event topics).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodicConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PeriodicConfig {
    pub fn interval(interval: impl Into<String>) -> Self {
        Self {
            interval: Some(interval.into()),
            ..Default::default()
        }
    }

    pub fn on_demand(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether the topic owns a timer
    pub fn is_scheduled(&self) -> bool {
        self.interval.is_some() || self.cron.is_some()
    }
}

/// Variant-specific topic metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopicKind {
    Source,
    Derived(DerivedConfig),
    Periodic(PeriodicConfig),
}

impl TopicKind {
    pub fn variant(&self) -> TopicVariant {
        match self {
            TopicKind::Source => TopicVariant::Source,
            TopicKind::Derived(_) => TopicVariant::Derived,
            TopicKind::Periodic(_) => TopicVariant::Periodic,
        }
    }
}

/// Persisted topic configuration (everything except the live value)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TopicKind,
}

/// A named unit of current state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,

    #[serde(flatten)]
    pub kind: TopicKind,

    /// Last emitted value (`Null` until the first update)
    pub value: Value,

    /// `None` until the first value arrives
    pub last_updated_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Topic {
    pub fn new(name: impl Into<String>, kind: TopicKind) -> Self {
        Self {
            name: name.into(),
            kind,
            value: Value::Null,
            last_updated_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn source(name: impl Into<String>) -> Self {
        Self::new(name, TopicKind::Source)
    }

    pub fn from_config(config: TopicConfig) -> Self {
        Self {
            name: config.name,
            kind: config.kind,
            value: Value::Null,
            last_updated_at: None,
            created_at: config.created_at,
        }
    }

    pub fn variant(&self) -> TopicVariant {
        self.kind.variant()
    }

    pub fn derived(&self) -> Option<&DerivedConfig> {
        match &self.kind {
            TopicKind::Derived(config) => Some(config),
            _ => None,
        }
    }

    pub fn periodic(&self) -> Option<&PeriodicConfig> {
        match &self.kind {
            TopicKind::Periodic(config) => Some(config),
            _ => None,
        }
    }

    /// Child topic: derived without a strategy
    pub fn is_child(&self) -> bool {
        self.derived().map(DerivedConfig::is_child).unwrap_or(false)
    }

    pub fn config(&self) -> TopicConfig {
        TopicConfig {
            name: self.name.clone(),
            created_at: self.created_at,
            kind: self.kind.clone(),
        }
    }
}
