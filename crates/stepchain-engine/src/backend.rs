//! Execution backend trait and unit handles.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use stepchain_types::{Result, UnitOutcome};

use crate::spec::UnitKind;

// ---------------------------------------------------------------------------
// UnitHandle — a resolved unit type
// ---------------------------------------------------------------------------

/// Declared input port of a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Accepted type ids, tried in order. Empty means untyped.
    #[serde(default)]
    pub types: Vec<String>,
    /// A namespace port: accepts a mapping of arbitrary entries, or dotted
    /// keys below its name.
    #[serde(default)]
    pub dynamic: bool,
}

impl PortSpec {
    pub fn typed<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            dynamic: false,
        }
    }

    pub fn namespace<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dynamic: true,
            ..Self::typed(types)
        }
    }
}

/// How the gate hands a unit to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitMode {
    /// Run in-process and wait for the result.
    Inline,
    /// Submit for asynchronous execution and wait for termination.
    Async,
}

impl SubmitMode {
    pub fn for_kind(kind: UnitKind) -> Self {
        match kind {
            UnitKind::Calculation => SubmitMode::Inline,
            UnitKind::CalcJob | UnitKind::Workflow => SubmitMode::Async,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitHandle {
    pub kind: UnitKind,
    pub identifier: String,
    pub ports: IndexMap<String, PortSpec>,
    pub mode: SubmitMode,
    /// Whether keys matching no port are passed through untyped.
    pub accepts_extra: bool,
}

impl UnitHandle {
    pub fn new(kind: UnitKind, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            ports: IndexMap::new(),
            mode: SubmitMode::for_kind(kind),
            accepts_extra: false,
        }
    }

    pub fn with_port(mut self, name: impl Into<String>, port: PortSpec) -> Self {
        self.ports.insert(name.into(), port);
        self
    }

    pub fn accepting_extra(mut self) -> Self {
        self.accepts_extra = true;
        self
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.kind, self.identifier)
    }
}

// ---------------------------------------------------------------------------
// ExecutionBackend trait
// ---------------------------------------------------------------------------

/// The external system that knows how to run units.
///
/// Every method resolves only once the work has reached a terminal state.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Look up a unit type. Unknown identifiers are `ChainError::UnknownUnit`.
    async fn resolve(&self, kind: UnitKind, identifier: &str) -> Result<UnitHandle>;

    /// Run a unit in-process.
    async fn run_inline(&self, unit: &UnitHandle, inputs: Map<String, Value>) -> Result<UnitOutcome>;

    /// Submit a unit for asynchronous execution and wait for it to terminate.
    async fn submit(&self, unit: &UnitHandle, inputs: Map<String, Value>) -> Result<UnitOutcome>;

    /// Load a previously finished unit by node identifier.
    async fn load(&self, node: i64) -> Result<UnitOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_follows_unit_kind() {
        assert_eq!(UnitHandle::new(UnitKind::Calculation, "add").mode, SubmitMode::Inline);
        assert_eq!(UnitHandle::new(UnitKind::CalcJob, "pw").mode, SubmitMode::Async);
        assert_eq!(UnitHandle::new(UnitKind::Workflow, "relax").mode, SubmitMode::Async);
    }

    #[test]
    fn port_spec_from_yaml() {
        let port: PortSpec = serde_yaml::from_str("types: [int, float]\ndynamic: true").unwrap();
        assert_eq!(port, PortSpec::namespace(["int", "float"]));
        let bare: PortSpec = serde_yaml::from_str("{}").unwrap();
        assert!(bare.types.is_empty() && !bare.dynamic);
    }
}
