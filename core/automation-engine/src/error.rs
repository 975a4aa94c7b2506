//! Error taxonomy for the registry, strategy runtime and state store

use crate::topic::TopicVariant;
use std::time::Duration;
use thiserror::Error;

/// Registry-level failures returned synchronously to callers
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed create/update request, rejected before any mutation
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("topic {0} not found")]
    NotFound(String),

    #[error("topic {0} already exists")]
    AlreadyExists(String),

    #[error("strategy {strategy_id} allows maximum {max} inputs, but {given} inputs provided")]
    TooManyInputs {
        strategy_id: String,
        max: usize,
        given: usize,
    },

    /// An emission addressed a topic owned by another variant
    #[error("topic {name} already exists as a {existing} topic")]
    VariantConflict { name: String, existing: TopicVariant },

    /// Propagation went deeper than the configured limit (dependency cycle)
    #[error("propagation depth {depth} exceeded while updating {topic}")]
    DepthExceeded { topic: String, depth: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of a single strategy invocation
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StrategyError {
    #[error("strategy {0} not found")]
    NotFound(String),

    #[error("strategy {0} already exists")]
    AlreadyExists(String),

    #[error("no executor found for language {0}")]
    NoExecutorForLanguage(String),

    #[error("execution timeout after {0:?}")]
    ExecutionTimeout(Duration),

    /// Script threw, failed to parse, or hit a runtime limit
    #[error("strategy runtime error: {0}")]
    Runtime(String),

    /// Strategy definition rejected by the catalog
    #[error("strategy validation failed: {0}")]
    Invalid(String),
}

/// Persistence failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store backend error: {0}")]
    Backend(String),

    #[error("state store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
