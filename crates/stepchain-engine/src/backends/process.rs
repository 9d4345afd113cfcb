use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;

use stepchain_types::{ChainError, Result, UnitOutcome};

use crate::backend::{ExecutionBackend, UnitHandle};
use crate::backends::store::NodeStore;
use crate::config::{ProcessBackendConfig, UnitConfig};
use crate::spec::UnitKind;

/// Longest stderr excerpt carried into a failure message.
const MESSAGE_LIMIT: usize = 2048;

// ---------------------------------------------------------------------------
// ProcessBackend — runs each unit as a shell command
// ---------------------------------------------------------------------------

/// Runs configured units with `sh -c`.
///
/// The command receives `{"unit", "kind", "inputs"}` as JSON on stdin and
/// answers on stdout with either a full outcome object
/// (`{"success", "code", "message", "outputs"}`) or a bare outputs mapping.
/// A non-zero exit status marks the unit failed, with the status as its code.
pub struct ProcessBackend {
    config: ProcessBackendConfig,
    store: NodeStore,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig) -> Self {
        let store = match &config.store_path {
            Some(dir) => NodeStore::at(dir),
            None => NodeStore::in_memory(),
        };
        Self { config, store }
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    fn unit_config(&self, identifier: &str) -> Result<&UnitConfig> {
        self.config
            .units
            .get(identifier)
            .ok_or_else(|| ChainError::Backend {
                unit: identifier.to_string(),
                message: "unit vanished from configuration".into(),
            })
    }

    async fn execute(&self, unit: &UnitHandle, inputs: Map<String, Value>) -> Result<UnitOutcome> {
        let config = self.unit_config(&unit.identifier)?;
        let backend_error = |message: String| ChainError::Backend {
            unit: unit.label(),
            message,
        };

        tracing::info!(unit = %unit.label(), command = %config.command, "Executing unit command");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&config.command);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        if let Some(dir) = &self.config.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| backend_error(format!("failed to spawn command: {e}")))?;

        let request = json!({
            "unit": unit.identifier,
            "kind": unit.kind,
            "inputs": inputs,
        });
        let payload = serde_json::to_vec(&request)?;
        let stdin = child.stdin.take();
        let label = unit.label();

        // stdin is fed while stdout/stderr drain, so a command that answers
        // before it has read everything cannot stall on a full pipe.
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that never reads stdin closes the pipe early.
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(unit = %label, error = %e, "stdin closed early");
                }
            }
        };
        let run = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = match config.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), run)
                .await
                .map_err(|_| backend_error(format!("timed out after {secs}s")))?,
            None => run.await,
        }
        .map_err(|e| backend_error(format!("command execution failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        tracing::info!(
            unit = %unit.label(),
            exit_code = exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Unit command completed"
        );

        let mut outcome = parse_reply(&stdout).map_err(backend_error)?;
        if !output.status.success() {
            outcome.success = false;
            outcome.code = exit_code;
            if outcome.message.is_none() {
                outcome.message = Some(excerpt(&stderr, exit_code));
            }
        }
        self.store.save(outcome).await
    }
}

/// Interpret a command's stdout.
fn parse_reply(stdout: &str) -> std::result::Result<UnitOutcome, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(UnitOutcome::success(Map::new()));
    }
    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| format!("stdout is not JSON: {e}"))?;
    match value {
        Value::Object(map) if map.get("success").is_some_and(Value::is_boolean) => {
            serde_json::from_value(Value::Object(map)).map_err(|e| format!("malformed outcome: {e}"))
        }
        Value::Object(map) => Ok(UnitOutcome::success(map)),
        other => Err(format!("expected a JSON object on stdout, got {other}")),
    }
}

fn excerpt(stderr: &str, exit_code: i32) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return format!("command exited with code {exit_code}");
    }
    if stderr.len() <= MESSAGE_LIMIT {
        return stderr.to_string();
    }
    // Keep the tail; that is where errors usually are.
    let start = stderr
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| stderr.len() - i <= MESSAGE_LIMIT)
        .unwrap_or(0);
    format!("...(truncated){}", &stderr[start..])
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    async fn resolve(&self, kind: UnitKind, identifier: &str) -> Result<UnitHandle> {
        let unknown = || ChainError::UnknownUnit {
            kind: kind.to_string(),
            identifier: identifier.to_string(),
        };
        let config = self.config.units.get(identifier).ok_or_else(unknown)?;
        if config.kind.is_some_and(|k| k != kind) {
            return Err(unknown());
        }

        let mut handle = UnitHandle::new(kind, identifier);
        handle.ports = config.ports.clone();
        handle.accepts_extra = config.accepts_extra;
        Ok(handle)
    }

    async fn run_inline(&self, unit: &UnitHandle, inputs: Map<String, Value>) -> Result<UnitOutcome> {
        tracing::debug!(unit = %unit.label(), "Running inline");
        self.execute(unit, inputs).await
    }

    async fn submit(&self, unit: &UnitHandle, inputs: Map<String, Value>) -> Result<UnitOutcome> {
        tracing::debug!(unit = %unit.label(), "Submitted; waiting for termination");
        self.execute(unit, inputs).await
    }

    async fn load(&self, node: i64) -> Result<UnitOutcome> {
        self.store.load(node).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepchainConfig;
    use crate::loader::Format;

    fn backend(units: &str) -> ProcessBackend {
        let yaml = format!("backend:\n{}", indent(units));
        ProcessBackend::new(StepchainConfig::parse(&yaml, Format::Yaml).unwrap().backend)
    }

    fn indent(text: &str) -> String {
        text.lines().map(|line| format!("  {line}\n")).collect()
    }

    #[test]
    fn helper_nests_units_under_backend() {
        let backend = backend("units:\n  echo:\n    command: 'cat'\n");
        assert!(backend.config.units.contains_key("echo"));
    }

    #[test]
    fn reply_forms() {
        assert!(parse_reply("").unwrap().outputs.is_empty());
        let bare = parse_reply(r#"{"sum": 3}"#).unwrap();
        assert!(bare.success);
        assert_eq!(bare.outputs["sum"], 3);

        let full = parse_reply(r#"{"success": false, "code": 410, "message": "bad"}"#).unwrap();
        assert!(!full.success);
        assert_eq!(full.code, 410);
        assert_eq!(full.message.as_deref(), Some("bad"));

        assert!(parse_reply("[1]").is_err());
        assert!(parse_reply("not json").is_err());
    }

    #[test]
    fn long_stderr_keeps_the_tail() {
        let long = format!("{}END", "x".repeat(5000));
        let msg = excerpt(&long, 1);
        assert!(msg.starts_with("...(truncated)"));
        assert!(msg.ends_with("END"));
        assert_eq!(excerpt("  ", 4), "command exited with code 4");
    }

    #[tokio::test]
    async fn resolve_checks_identifier_and_kind() {
        let backend = backend(
            "units:\n  add:\n    command: 'true'\n    kind: calculation\n    ports:\n      x: {types: [int]}\n",
        );
        let handle = backend.resolve(UnitKind::Calculation, "add").await.unwrap();
        assert_eq!(handle.ports["x"].types, vec!["int"]);

        for (kind, id) in [(UnitKind::CalcJob, "add"), (UnitKind::Calculation, "nope")] {
            let err = backend.resolve(kind, id).await.unwrap_err();
            assert!(matches!(err, ChainError::UnknownUnit { .. }));
        }
    }

    #[tokio::test]
    async fn command_reads_request_and_reports_outputs() {
        let backend = backend(
            "units:\n  echo:\n    command: 'cat'\n    accepts_extra: true\n",
        );
        let handle = backend.resolve(UnitKind::CalcJob, "echo").await.unwrap();
        let mut inputs = Map::new();
        inputs.insert("n".into(), json!(5));

        let outcome = backend.submit(&handle, inputs).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.outputs["unit"], "echo");
        assert_eq!(outcome.outputs["kind"], "calcjob");
        assert_eq!(outcome.outputs["inputs"]["n"], 5);
        assert_eq!(outcome.node, Some(1));

        let again = backend.load(1).await.unwrap();
        assert_eq!(again.outputs, outcome.outputs);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failed_outcome() {
        let backend = backend(
            "units:\n  boom:\n    command: 'echo broken >&2; exit 3'\n",
        );
        let handle = backend.resolve(UnitKind::Workflow, "boom").await.unwrap();
        let outcome = backend.submit(&handle, Map::new()).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.code, 3);
        assert_eq!(outcome.message.as_deref(), Some("broken"));
    }

    #[tokio::test]
    async fn timeout_is_a_backend_error() {
        let backend = backend(
            "units:\n  slow:\n    command: 'sleep 5'\n    timeout_secs: 0\n",
        );
        let handle = backend.resolve(UnitKind::CalcJob, "slow").await.unwrap();
        let err = backend.submit(&handle, Map::new()).await.unwrap_err();
        assert!(matches!(err, ChainError::Backend { .. }));
    }

    #[tokio::test]
    async fn input_larger_than_the_pipe_buffer_does_not_stall() {
        let backend = backend(
            "units:\n  echo:\n    command: 'cat'\n    accepts_extra: true\n    timeout_secs: 30\n",
        );
        let handle = backend.resolve(UnitKind::CalcJob, "echo").await.unwrap();
        let big = "x".repeat(512 * 1024);
        let mut inputs = Map::new();
        inputs.insert("blob".into(), json!(big));

        let outcome = tokio::time::timeout(Duration::from_secs(20), backend.submit(&handle, inputs))
            .await
            .expect("submit stalled")
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.outputs["inputs"]["blob"].as_str().map(str::len), Some(512 * 1024));
    }
}
