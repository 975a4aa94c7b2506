//! Engine configuration loaded from TOML

use crate::error::{EngineError, Result};
use crate::strategy::{ExecutionLimits, DEFAULT_LOOP_ITERATION_LIMIT, DEFAULT_RECURSION_LIMIT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub logging: LoggingConfig,
    pub strategy: StrategyConfig,
    pub propagation: PropagationConfig,
    pub system_topics: SystemTopicsConfig,
    pub recorder: RecorderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Wall-clock bound per execution, e.g. `30s`
    pub timeout: String,
    pub loop_iteration_limit: Option<u64>,
    pub recursion_limit: Option<usize>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            timeout: "30s".to_string(),
            loop_iteration_limit: Some(DEFAULT_LOOP_ITERATION_LIMIT),
            recursion_limit: Some(DEFAULT_RECURSION_LIMIT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Longest chain of updates one external trigger may cause
    pub max_depth: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self { max_depth: 32 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemTopicsConfig {
    /// One `system/ticker/<interval>` topic per entry
    pub ticker_intervals: Vec<String>,
    /// Install the `system/events/*` topics
    pub event_topics: bool,
}

impl Default for SystemTopicsConfig {
    fn default() -> Self {
        Self {
            ticker_intervals: ["1s", "5s", "30s", "1m", "5m"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            event_topics: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Execution records kept in memory
    pub capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

impl EngineConfig {
    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Config(format!("failed to read config file {}: {}", path.display(), err))
        })?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|err| EngineError::Config(format!("failed to parse config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(EngineError::Config(format!(
                "invalid logging level: {}",
                self.logging.level
            )));
        }
        self.strategy_timeout()?;
        if self.propagation.max_depth == 0 {
            return Err(EngineError::Config("propagation.max_depth must be at least 1".to_string()));
        }
        if self.recorder.capacity == 0 {
            return Err(EngineError::Config("recorder.capacity must be at least 1".to_string()));
        }
        for interval in &self.system_topics.ticker_intervals {
            let duration = parse_duration(interval)
                .map_err(|err| EngineError::Config(format!("invalid ticker interval: {}", err)))?;
            if duration.is_zero() {
                return Err(EngineError::Config(format!("ticker interval {} must be positive", interval)));
            }
        }
        Ok(())
    }

    pub fn strategy_timeout(&self) -> Result<Duration> {
        let timeout = parse_duration(&self.strategy.timeout)
            .map_err(|err| EngineError::Config(format!("invalid strategy timeout: {}", err)))?;
        if timeout.is_zero() {
            return Err(EngineError::Config("strategy timeout must be positive".to_string()));
        }
        Ok(timeout)
    }

    pub fn execution_limits(&self) -> Result<ExecutionLimits> {
        Ok(ExecutionLimits {
            timeout: self.strategy_timeout()?,
            loop_iteration_limit: self.strategy.loop_iteration_limit,
            recursion_limit: self.strategy.recursion_limit,
        })
    }
}

/// Parse a duration such as `500ms`, `5s` or `1h30m`
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("expected a number in duration {}", text));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("number out of range in duration {}", text))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ns" => Duration::from_nanos(amount),
            "us" => Duration::from_micros(amount),
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            "h" => Duration::from_secs(amount.saturating_mul(3600)),
            "" => return Err(format!("missing unit in duration {}", text)),
            other => return Err(format!("unknown unit {} in duration {}", other, text)),
        };
        total = total.saturating_add(part);
    }

    Ok(total)
}
