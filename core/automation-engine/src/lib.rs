//! # Automation Engine
//!
//! Topic graph and strategy execution engine for event-driven automation.
//!
//! ## Features
//!
//! - **Topic graph**: Source, Derived and Periodic topics with one current value each
//! - **Propagation**: Dependents re-run synchronously, depth first, on every update
//! - **Wildcards**: `+` and `#` input patterns
//! - **Strategies**: Sandboxed JavaScript with last-value-wins emission reconciliation
//! - **Child topics**: Created on demand from sub-path emissions
//! - **Observability**: Update bus, execution log and structured logging
//!
//! ## Example
//!
//! ```rust,no_run
//! use automation_engine::{AutomationEngine, DerivedConfig, Delivery, EngineConfig, MemoryStore, Strategy};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), automation_engine::EngineError> {
//!     let engine = AutomationEngine::new(EngineConfig::default(), Arc::new(MemoryStore::new()), None)?;
//!     engine.start()?;
//!
//!     engine.create_strategy(Strategy::new(
//!         "double",
//!         "Double",
//!         "function process(context) { return context.triggeringValue * 2; }",
//!     ))?;
//!     engine.create_derived("doubled", DerivedConfig::new("double", vec!["sensor".to_string()]))?;
//!
//!     engine.handle_delivery(&Delivery::new("sensor", "21"))?;
//!     assert_eq!(engine.registry().get("doubled").unwrap().value, serde_json::json!(42));
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod logging;
pub mod periodic;
pub mod publisher;
pub mod registry;
pub mod replay;
pub mod runtime;
pub mod store;
pub mod strategy;
pub mod subscriber;
pub mod topic;
pub mod wildcard;

#[cfg(test)]
mod testing;

// Re-exports
pub use bus::{UpdateBus, UpdateStats};
pub use config::EngineConfig;
pub use error::{EngineError, StoreError, StrategyError};
pub use events::{Delivery, OutboundMessage, TopicEvent};
pub use ingest::run_ingest;
pub use logging::init_logging;
pub use publisher::{ChannelPublisher, Publisher};
pub use registry::{TopicRegistry, TopicRegistryBuilder, UpdateOutcome};
pub use replay::{ExecutionRecord, ExecutionRecorder};
pub use runtime::AutomationEngine;
pub use store::{MemoryStore, StateStore};
pub use strategy::{
    Emission, ExecutionContext, ExecutionLimits, ExecutionOutcome, ExecutionRequest, JavaScriptExecutor,
    LanguageExecutor, ScriptOutput, Strategy, StrategyEngine,
};
pub use subscriber::Subscriber;
pub use topic::{DerivedConfig, PeriodicConfig, Topic, TopicConfig, TopicKind, TopicVariant};
pub use wildcard::topic_matches;
