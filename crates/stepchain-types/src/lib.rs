//! Shared types, errors, context, and outcomes for the stepchain interpreter.
//!
//! This crate provides the foundational types used across all other stepchain crates:
//! - `ChainError` — unified error taxonomy
//! - `Context` — mutable dotted-path mapping shared by the steps of one chain
//! - `Results` — append-only record of executed step outputs
//! - `TypedValue` — backend-facing representation of a coerced input
//! - `UnitOutcome` / `ChainOutput` — what a unit of work and a whole chain produce

pub mod path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Process exit code for specification and validation failures.
pub const EXIT_SPECIFICATION: i32 = 10;
/// Process exit code for template evaluation failures.
pub const EXIT_EVALUATION: i32 = 11;
/// Process exit code for input resolution failures.
pub const EXIT_RESOLUTION: i32 = 12;
/// Generic subprocess-failure code, used when the backend itself errors.
pub const EXIT_SUBPROCESS_FAILED: i32 = 13;
/// Process exit code for a cancelled chain.
pub const EXIT_CANCELLED: i32 = 130;

/// Unified error type for all stepchain subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    // === Specification Errors ===
    #[error("Invalid chain specification: {0}")]
    Specification(String),

    #[error("Chain validation failed: {0}")]
    Validation(String),

    #[error("Expression syntax error at col {col} in '{expression}': {message}")]
    ExpressionSyntax {
        expression: String,
        col: usize,
        message: String,
    },

    // === Execution Errors ===
    #[error("Failed to evaluate '{expression}': {message}")]
    Evaluation { expression: String, message: String },

    #[error("Cannot resolve input '{input}': {message}")]
    Resolution { input: String, message: String },

    #[error("Unknown {kind} unit '{identifier}'")]
    UnknownUnit { kind: String, identifier: String },

    #[error("Backend error for unit '{unit}': {message}")]
    Backend { unit: String, message: String },

    #[error("Results entry '{key}' already exists")]
    ResultConflict { key: String },

    #[error("Cannot write '{path}': '{segment}' is not a mapping")]
    PathConflict { path: String, segment: String },

    #[error("Invalid dotted path '{path}'")]
    InvalidPath { path: String },

    #[error("Transition limit of {limit} reached")]
    TransitionLimit { limit: usize },

    #[error("Chain was cancelled")]
    Cancelled,

    #[error("Step {index}: {source}")]
    AtStep {
        index: usize,
        #[source]
        source: Box<ChainError>,
    },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("{0}")]
    Other(String),
}

impl ChainError {
    /// Attach a step index to an error. Already-wrapped errors are left alone
    /// so the innermost step wins.
    pub fn at_step(self, index: usize) -> Self {
        match self {
            ChainError::AtStep { .. } => self,
            other => ChainError::AtStep {
                index,
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any [`ChainError::AtStep`] wrappers removed.
    pub fn root(&self) -> &ChainError {
        match self {
            ChainError::AtStep { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns `true` if the error was detected before any step executed.
    pub fn is_specification(&self) -> bool {
        matches!(
            self.root(),
            ChainError::Specification(_)
                | ChainError::Validation(_)
                | ChainError::ExpressionSyntax { .. }
        )
    }

    /// Returns `true` for aborts (cancellation, runaway loops) as opposed to
    /// errors raised by the chain's own data.
    pub fn is_abort(&self) -> bool {
        matches!(
            self.root(),
            ChainError::Cancelled | ChainError::TransitionLimit { .. }
        )
    }

    /// Maps the error to a process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            ChainError::Specification(_)
            | ChainError::Validation(_)
            | ChainError::ExpressionSyntax { .. }
            | ChainError::Yaml(_) => EXIT_SPECIFICATION,
            ChainError::Evaluation { .. } => EXIT_EVALUATION,
            ChainError::Resolution { .. }
            | ChainError::PathConflict { .. }
            | ChainError::InvalidPath { .. } => EXIT_RESOLUTION,
            ChainError::UnknownUnit { .. } | ChainError::Backend { .. } => EXIT_SUBPROCESS_FAILED,
            ChainError::Cancelled => EXIT_CANCELLED,
            _ => 1,
        }
    }
}

/// A convenience alias for `Result<T, ChainError>`.
pub type Result<T> = std::result::Result<T, ChainError>;

// ---------------------------------------------------------------------------
// Context — dotted-path mapping shared across the steps of one chain
// ---------------------------------------------------------------------------

/// Mutable key-path-addressable state for one chain execution.
///
/// A chain owns its context exclusively for its whole lifetime, so there is no
/// interior locking; the executor hands out `&` / `&mut` borrows as needed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: Map<String, Value>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing mapping.
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Read the value at a dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path::get(&self.values, path)
    }

    /// Returns `true` if a value exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Bind `value` at a dotted path, creating intermediate mappings.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        path::set(&mut self.values, path, value)
    }

    /// Borrow the underlying mapping.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Deep copy of the current values.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.clone()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }
}

// ---------------------------------------------------------------------------
// Results — append-only record of executed step outputs
// ---------------------------------------------------------------------------

/// Step outputs keyed by execution ordinal (stringified), in insertion order.
///
/// Entries are never overwritten: recording under an existing key fails with
/// [`ChainError::ResultConflict`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Results {
    entries: Map<String, Value>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry.
    pub fn record(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(ChainError::ResultConflict { key });
        }
        self.entries.insert(key, value);
        Ok(())
    }

    /// Record a unit's flattened outputs under its execution ordinal.
    pub fn record_outputs(&mut self, ordinal: usize, outputs: Map<String, Value>) -> Result<()> {
        self.record(ordinal.to_string(), Value::Object(outputs))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.entries
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.entries
    }
}

// ---------------------------------------------------------------------------
// TypedValue — backend-facing representation of a coerced input
// ---------------------------------------------------------------------------

/// Key marking a JSON object as a typed backend value.
pub const TYPE_TAG: &str = "@type";

/// A value converted into one of the backend's typed representations.
///
/// On the wire it is the object `{"@type": <type_id>, "value": <payload>}`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub type_id: String,
    pub value: Value,
}

impl TypedValue {
    pub fn new(type_id: impl Into<String>, value: Value) -> Self {
        Self {
            type_id: type_id.into(),
            value,
        }
    }

    /// Parse a tagged JSON object. Returns `None` for untyped values.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let type_id = obj.get(TYPE_TAG)?.as_str()?;
        Some(Self {
            type_id: type_id.to_string(),
            value: obj.get("value").cloned().unwrap_or(Value::Null),
        })
    }

    /// The type id of a tagged value, if any.
    pub fn type_of(value: &Value) -> Option<&str> {
        value.as_object()?.get(TYPE_TAG)?.as_str()
    }

    pub fn into_value(self) -> Value {
        let mut obj = Map::new();
        obj.insert(TYPE_TAG.into(), Value::String(self.type_id));
        obj.insert("value".into(), self.value);
        Value::Object(obj)
    }
}

// ---------------------------------------------------------------------------
// UnitOutcome — terminal state of one unit of work
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub success: bool,
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// Backend identifier of the finished unit, usable by later `node` steps.
    #[serde(default)]
    pub node: Option<i64>,
}

impl UnitOutcome {
    /// Create a successful outcome with the given outputs.
    pub fn success(outputs: Map<String, Value>) -> Self {
        Self {
            success: true,
            code: 0,
            message: None,
            outputs,
            node: None,
        }
    }

    /// Create a failed outcome with the given status code and message.
    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            message: Some(message.into()),
            outputs: Map::new(),
            node: None,
        }
    }

    pub fn with_node(mut self, node: i64) -> Self {
        self.node = Some(node);
        self
    }
}

// ---------------------------------------------------------------------------
// ChainOutput — what a finished chain hands back
// ---------------------------------------------------------------------------

/// Controlled terminal status, taken from a step's `error` override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainExit {
    pub code: i32,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainOutput {
    pub run_id: uuid::Uuid,
    pub results: Results,
    pub context: Map<String, Value>,
    /// Set when a failing step's `error` override terminated the chain.
    pub exit: Option<ChainExit>,
    pub units_submitted: usize,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

impl ChainOutput {
    /// Returns `true` if the chain ran to completion without a controlled abort.
    pub fn is_finished(&self) -> bool {
        self.exit.is_none()
    }

    /// Process exit code: `0` when finished, the override code otherwise.
    pub fn exit_code(&self) -> i32 {
        self.exit.as_ref().map(|e| e.code).unwrap_or(0)
    }

    /// Serialize this output to JSON and write it to `path`.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
