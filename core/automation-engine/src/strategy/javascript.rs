//! JavaScript strategy executor backed by an embedded interpreter
//!
//! Every run gets a fresh interpreter. Script globals (`log`, `emit`,
//! `getTime`, `getISO`, `parseJSON`, `stringify`) are installed by a prelude
//! and mirrored on the `context` object. Emissions and log lines are collected
//! inside the interpreter and handed back as one JSON document.

use super::{ExecutionContext, ExecutionLimits, LanguageExecutor, ScriptOutput, Strategy};
use crate::error::StrategyError;
use boa_engine::{Context, Source};
use tracing::trace;

const PRELUDE: &str = r#"
var __emitted = [];
var __logs = [];
function __snapshot(value) {
    if (value === undefined) { return null; }
    var encoded = JSON.stringify(value);
    return encoded === undefined ? null : JSON.parse(encoded);
}
function log() {
    var parts = [];
    for (var i = 0; i < arguments.length; i++) {
        var arg = arguments[i];
        parts.push(typeof arg === "string" ? arg : JSON.stringify(arg));
    }
    __logs.push(parts.join(" "));
}
function emit() {
    if (arguments.length === 1) {
        __emitted.push({ destination: "", value: __snapshot(arguments[0]) });
    } else if (arguments.length === 2 && typeof arguments[0] === "string") {
        __emitted.push({ destination: arguments[0], value: __snapshot(arguments[1]) });
    }
}
function getTime() { return Math.floor(Date.now() / 1000); }
function getISO() { return new Date().toISOString().replace(/\.\d{3}Z$/, "Z"); }
function parseJSON(text) {
    try { return JSON.parse(text); } catch (e) { return null; }
}
function stringify(value) {
    try {
        var encoded = JSON.stringify(value);
        return encoded === undefined ? "" : encoded;
    } catch (e) { return ""; }
}
"#;

const MISSING_ENTRY_POINT: &str = "process function not found in strategy code";

/// Runs `process(context)` from JavaScript strategy code
#[derive(Debug, Clone)]
pub struct JavaScriptExecutor {
    loop_iteration_limit: Option<u64>,
    recursion_limit: Option<usize>,
}

impl JavaScriptExecutor {
    /// Executor with the default interpreter limits
    pub fn new() -> Self {
        Self::from_limits(&ExecutionLimits::default())
    }

    pub fn from_limits(limits: &ExecutionLimits) -> Self {
        Self {
            loop_iteration_limit: limits.loop_iteration_limit,
            recursion_limit: limits.recursion_limit,
        }
    }

    fn new_context(&self) -> Context {
        let mut context = Context::default();
        if let Some(limit) = self.loop_iteration_limit {
            context.runtime_limits_mut().set_loop_iteration_limit(limit);
        }
        if let Some(limit) = self.recursion_limit {
            context.runtime_limits_mut().set_recursion_limit(limit);
        }
        context
    }

    fn eval_to_string(context: &mut Context, script: &str) -> Result<String, StrategyError> {
        let value = context
            .eval(Source::from_bytes(script.as_bytes()))
            .map_err(|err| StrategyError::Runtime(err.to_string()))?;

        value
            .as_string()
            .map(|text| text.to_std_string_escaped())
            .ok_or_else(|| StrategyError::Runtime("script driver returned a non-string value".to_string()))
    }
}

/// Script that binds the context, calls the entry point and serializes the run
fn driver_script(context_json: &str) -> Result<String, StrategyError> {
    // Embed the context as a JS string literal and parse it inside the interpreter
    let literal = serde_json::to_string(context_json)
        .map_err(|err| StrategyError::Runtime(format!("failed to encode context: {}", err)))?;

    Ok(format!(
        r#"(function () {{
    var context = JSON.parse({literal});
    context.log = log;
    context.emit = emit;
    context.getTime = getTime;
    context.getISO = getISO;
    context.parseJSON = parseJSON;
    context.stringify = stringify;
    if (typeof process !== "function") {{
        throw new Error("{missing}");
    }}
    var result = process(context);
    return JSON.stringify({{ result: __snapshot(result), emitted: __emitted, logs: __logs }});
}})()"#,
        literal = literal,
        missing = MISSING_ENTRY_POINT,
    ))
}

impl Default for JavaScriptExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageExecutor for JavaScriptExecutor {
    fn validate(&self, code: &str) -> Result<(), StrategyError> {
        let mut context = self.new_context();
        context
            .eval(Source::from_bytes(PRELUDE.as_bytes()))
            .map_err(|err| StrategyError::Invalid(err.to_string()))?;
        context
            .eval(Source::from_bytes(code.as_bytes()))
            .map_err(|err| StrategyError::Invalid(err.to_string()))?;

        let has_entry_point = context
            .eval(Source::from_bytes(b"typeof process === \"function\"".as_slice()))
            .map_err(|err| StrategyError::Invalid(err.to_string()))?
            .as_boolean()
            .unwrap_or(false);

        if !has_entry_point {
            return Err(StrategyError::Invalid(MISSING_ENTRY_POINT.to_string()));
        }
        Ok(())
    }

    fn execute(
        &self,
        strategy: &Strategy,
        context: &ExecutionContext,
    ) -> Result<ScriptOutput, StrategyError> {
        let context_json = serde_json::to_string(context)
            .map_err(|err| StrategyError::Runtime(format!("failed to encode context: {}", err)))?;
        let driver = driver_script(&context_json)?;

        let mut interpreter = self.new_context();
        interpreter
            .eval(Source::from_bytes(PRELUDE.as_bytes()))
            .map_err(|err| StrategyError::Runtime(err.to_string()))?;
        interpreter
            .eval(Source::from_bytes(strategy.code.as_bytes()))
            .map_err(|err| StrategyError::Runtime(err.to_string()))?;

        let raw = Self::eval_to_string(&mut interpreter, &driver)?;
        trace!("Strategy {} raw output: {}", strategy.id, raw);

        serde_json::from_str(&raw)
            .map_err(|err| StrategyError::Runtime(format!("malformed strategy output: {}", err)))
    }
}
