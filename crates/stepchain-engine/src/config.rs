//! Runtime configuration: executor limits and the process backend's unit
//! table, loaded from one YAML or JSON file.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use stepchain_types::{ChainError, Result};

use crate::backend::PortSpec;
use crate::loader::Format;
use crate::spec::UnitKind;

/// Limits and plumbing for one chain run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChainConfig {
    /// Upper bound on state-machine transitions before the run is aborted.
    /// Unbounded when unset.
    pub max_transitions: Option<usize>,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_transitions: None,
            event_capacity: 256,
        }
    }
}

/// One unit the process backend can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitConfig {
    /// Shell command; receives the request as JSON on stdin.
    pub command: String,
    /// Restrict the unit to one invocation kind.
    #[serde(default)]
    pub kind: Option<UnitKind>,
    #[serde(default)]
    pub ports: IndexMap<String, PortSpec>,
    #[serde(default)]
    pub accepts_extra: bool,
    /// Seconds before the command is killed. `None` waits indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessBackendConfig {
    /// Units keyed by identifier.
    pub units: IndexMap<String, UnitConfig>,
    /// Directory for finished-unit records. Kept in memory when unset.
    pub store_path: Option<PathBuf>,
    /// Working directory for unit commands.
    pub workdir: Option<PathBuf>,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StepchainConfig {
    pub chain: ChainConfig,
    pub backend: ProcessBackendConfig,
}

impl StepchainConfig {
    pub fn parse(text: &str, format: Format) -> Result<Self> {
        let value = format.parse(text)?;
        serde_json::from_value(value)
            .map_err(|e| ChainError::Specification(format!("invalid configuration: {e}")))
    }

    /// Read a configuration file; relative `store_path`/`workdir` are taken
    /// relative to the file.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        let mut config = Self::parse(&text, Format::from_path(&path.to_string_lossy()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for dir in [&mut config.backend.store_path, &mut config.backend.workdir]
            .into_iter()
            .flatten()
        {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        tracing::debug!(path = %path.display(), units = config.backend.units.len(), "Configuration loaded");
        Ok(config)
    }
}
