//! Chain specification model, built from a `$ref`-resolved JSON/YAML document.
//!
//! Shape violations (wrong field types, unknown fields, conflicting step
//! kinds) are reported here as [`ChainError::Specification`] with the dotted
//! location of the offending field. Semantic checks live in
//! [`crate::validation`].

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepchain_template::Expression;
use stepchain_types::{path, ChainError, Result};

#[derive(Debug, Clone)]
pub struct ChainSpec {
    /// Expressions evaluated once, with writes enabled, before the first step.
    pub setup: Vec<Expression>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone)]
pub struct Step {
    /// Optional `if` guard; the step is skipped when it evaluates false.
    pub condition: Option<Expression>,
    pub kind: StepKind,
}

#[derive(Debug, Clone)]
pub enum StepKind {
    Loop {
        condition: Expression,
        steps: Vec<Step>,
    },
    Reference {
        node: i64,
        postprocess: Vec<PostprocessAction>,
    },
    Unit(UnitStep),
}

/// How a unit of work is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// Asynchronous calculation.
    CalcJob,
    /// Asynchronous composite workflow.
    Workflow,
    /// Synchronous pure function, run inline.
    Calculation,
}

impl UnitKind {
    pub const ALL: [UnitKind; 3] = [UnitKind::CalcJob, UnitKind::Workflow, UnitKind::Calculation];

    pub fn as_str(self) -> &'static str {
        match self {
            UnitKind::CalcJob => "calcjob",
            UnitKind::Workflow => "workflow",
            UnitKind::Calculation => "calculation",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct UnitStep {
    pub kind: UnitKind,
    pub identifier: String,
    /// Inputs in declaration order.
    pub inputs: IndexMap<String, InputDescriptor>,
    /// Forwarded verbatim under the `metadata` input key.
    pub metadata: Option<Map<String, Value>>,
    pub postprocess: Vec<PostprocessAction>,
    pub error: Option<ErrorOverride>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputDescriptor {
    pub source: InputSource,
    /// Explicit expected types, tried in order. Overrides the port type.
    pub type_hint: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    /// A bare value, or a mapping that carries no source key.
    Literal(Value),
    Value(Value),
    FromContext(String),
    Link(LinkTarget),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkTarget {
    /// Dotted path into the outputs of the most recently finished unit.
    Current(String),
    /// Dotted path into a recorded results entry.
    Step { step: usize, output: String },
}

#[derive(Debug, Clone)]
pub enum PostprocessAction {
    Expression(Expression),
    ToContext { name: String, source: ContextSource },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContextSource {
    Value(Value),
    Output(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorOverride {
    pub code: i32,
    pub message: Option<String>,
}

// --- Field tables ---

const DOCUMENT_FIELDS: &[&str] = &["steps", "setup"];
const LOOP_FIELDS: &[&str] = &["if", "while", "steps"];
const REFERENCE_FIELDS: &[&str] = &["if", "node", "postprocess"];
const UNIT_FIELDS: &[&str] = &[
    "if",
    "calcjob",
    "calculation",
    "workflow",
    "inputs",
    "postprocess",
    "metadata",
    "error",
];
const SOURCE_FIELDS: &[&str] = &["value", "from_context", "link"];

// --- Parse helpers ---

fn spec_error(at: &str, message: impl fmt::Display) -> ChainError {
    ChainError::Specification(format!("{at}: {message}"))
}

fn as_object<'a>(value: &'a Value, at: &str, what: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| spec_error(at, format!("{what} must be a mapping")))
}

fn as_str<'a>(value: &'a Value, at: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| spec_error(at, "expected a string"))
}

fn reject_unknown(obj: &Map<String, Value>, allowed: &[&str], at: &str, what: &str) -> Result<()> {
    match obj.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(spec_error(at, format!("unknown field '{key}' on {what}"))),
        None => Ok(()),
    }
}

fn parse_dotted(value: &Value, at: &str) -> Result<String> {
    let p = as_str(value, at)?;
    if !path::is_valid(p) {
        return Err(spec_error(at, format!("invalid dotted path '{p}'")));
    }
    Ok(p.to_string())
}

/// Parse a guard or setup expression. YAML booleans are accepted as literals.
fn parse_expression(value: &Value, at: &str) -> Result<Expression> {
    let source = match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        _ => return Err(spec_error(at, "expected an expression string")),
    };
    Expression::parse(&source).map_err(|e| spec_error(at, e))
}

// --- Conversions ---

impl ChainSpec {
    /// Build a chain from a parsed document.
    pub fn from_value(doc: &Value) -> Result<Self> {
        let obj = as_object(doc, "document", "the chain document")?;
        reject_unknown(obj, DOCUMENT_FIELDS, "document", "the chain document")?;

        let steps = match obj.get("steps") {
            Some(Value::Array(items)) => parse_steps(items, "steps")?,
            Some(_) => return Err(spec_error("steps", "expected a list of steps")),
            None => return Err(spec_error("document", "missing required field 'steps'")),
        };
        if steps.is_empty() {
            return Err(spec_error("steps", "at least one step is required"));
        }

        let setup = match obj.get("setup") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| parse_expression(item, &format!("setup[{i}]")))
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(spec_error("setup", "expected a list of expressions")),
        };

        Ok(Self { setup, steps })
    }

    /// Total number of declared steps, including loop bodies.
    pub fn step_count(&self) -> usize {
        fn count(steps: &[Step]) -> usize {
            steps
                .iter()
                .map(|s| match &s.kind {
                    StepKind::Loop { steps, .. } => 1 + count(steps),
                    _ => 1,
                })
                .sum()
        }
        count(&self.steps)
    }

    /// Deepest loop nesting level (0 for a flat chain).
    pub fn max_loop_depth(&self) -> usize {
        fn depth(steps: &[Step]) -> usize {
            steps
                .iter()
                .map(|s| match &s.kind {
                    StepKind::Loop { steps, .. } => 1 + depth(steps),
                    _ => 0,
                })
                .max()
                .unwrap_or(0)
        }
        depth(&self.steps)
    }

    /// Every unit step, in declaration order, including loop bodies.
    pub fn units(&self) -> Vec<&UnitStep> {
        fn collect<'a>(steps: &'a [Step], out: &mut Vec<&'a UnitStep>) {
            for step in steps {
                match &step.kind {
                    StepKind::Loop { steps, .. } => collect(steps, out),
                    StepKind::Unit(unit) => out.push(unit),
                    StepKind::Reference { .. } => {}
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.steps, &mut out);
        out
    }
}

fn parse_steps(items: &[Value], at: &str) -> Result<Vec<Step>> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| parse_step(item, &format!("{at}[{i}]")))
        .collect()
}

fn parse_step(value: &Value, at: &str) -> Result<Step> {
    let obj = as_object(value, at, "a step")?;

    let condition = obj
        .get("if")
        .map(|v| parse_expression(v, &format!("{at}.if")))
        .transpose()?;

    let unit_kinds: Vec<UnitKind> = UnitKind::ALL
        .into_iter()
        .filter(|k| obj.contains_key(k.as_str()))
        .collect();
    let is_loop = obj.contains_key("while");
    let is_reference = obj.contains_key("node");
    let declared = unit_kinds.len() + usize::from(is_loop) + usize::from(is_reference);

    if declared == 0 {
        if obj.contains_key("steps") {
            return Err(spec_error(at, "'steps' is only allowed together with 'while'"));
        }
        if condition.is_some() {
            return Err(spec_error(at, "step has an 'if' but nothing to run"));
        }
        return Err(spec_error(
            at,
            "step must declare one of while, node, calcjob, calculation or workflow",
        ));
    }
    if declared > 1 {
        return Err(spec_error(
            at,
            "while, node, calcjob, calculation and workflow are mutually exclusive",
        ));
    }

    let kind = if is_loop {
        reject_unknown(obj, LOOP_FIELDS, at, "a while step")?;
        let condition = parse_expression(&obj["while"], &format!("{at}.while"))?;
        let steps = match obj.get("steps") {
            Some(Value::Array(items)) => parse_steps(items, &format!("{at}.steps"))?,
            Some(_) => return Err(spec_error(&format!("{at}.steps"), "expected a list of steps")),
            None => return Err(spec_error(at, "a while step needs 'steps'")),
        };
        StepKind::Loop { condition, steps }
    } else if is_reference {
        reject_unknown(obj, REFERENCE_FIELDS, at, "a node step")?;
        let node = obj["node"]
            .as_i64()
            .ok_or_else(|| spec_error(&format!("{at}.node"), "expected an integer node id"))?;
        let postprocess = parse_postprocess(obj.get("postprocess"), at)?;
        StepKind::Reference { node, postprocess }
    } else {
        reject_unknown(obj, UNIT_FIELDS, at, "a unit step")?;
        StepKind::Unit(parse_unit(obj, unit_kinds[0], at)?)
    };

    Ok(Step { condition, kind })
}

fn parse_unit(obj: &Map<String, Value>, kind: UnitKind, at: &str) -> Result<UnitStep> {
    let identifier = as_str(&obj[kind.as_str()], &format!("{at}.{kind}"))?.trim().to_string();
    if identifier.is_empty() {
        return Err(spec_error(&format!("{at}.{kind}"), "unit identifier must not be empty"));
    }

    let mut inputs = IndexMap::new();
    if let Some(raw) = obj.get("inputs") {
        let raw = as_object(raw, &format!("{at}.inputs"), "inputs")?;
        for (key, value) in raw {
            let input_at = format!("{at}.inputs.{key}");
            if !path::is_valid(key) {
                return Err(spec_error(&input_at, "input names must be non-empty dotted paths"));
            }
            inputs.insert(key.clone(), parse_input(value, &input_at)?);
        }
    }

    let metadata = match obj.get("metadata") {
        None | Some(Value::Null) => None,
        Some(v) => Some(as_object(v, &format!("{at}.metadata"), "metadata")?.clone()),
    };

    let error = obj
        .get("error")
        .map(|v| parse_error_override(v, &format!("{at}.error")))
        .transpose()?;

    Ok(UnitStep {
        kind,
        identifier,
        inputs,
        metadata,
        postprocess: parse_postprocess(obj.get("postprocess"), at)?,
        error,
    })
}

fn parse_input(value: &Value, at: &str) -> Result<InputDescriptor> {
    let Value::Object(obj) = value else {
        return Ok(InputDescriptor {
            source: InputSource::Literal(value.clone()),
            type_hint: None,
        });
    };

    let sources: Vec<&str> = SOURCE_FIELDS
        .iter()
        .copied()
        .filter(|k| obj.contains_key(*k))
        .collect();
    let type_hint = obj
        .get("type")
        .map(|v| parse_type_hint(v, &format!("{at}.type")))
        .transpose()?;

    let source = match sources.as_slice() {
        [] if type_hint.is_none() => InputSource::Literal(value.clone()),
        [] => {
            return Err(spec_error(
                at,
                "'type' needs one of value, from_context or link",
            ))
        }
        [source] => {
            if let Some(extra) = obj.keys().find(|k| k.as_str() != *source && k.as_str() != "type") {
                return Err(spec_error(at, format!("unexpected field '{extra}' next to '{source}'")));
            }
            match *source {
                "value" => InputSource::Value(obj["value"].clone()),
                "from_context" => {
                    InputSource::FromContext(parse_dotted(&obj["from_context"], &format!("{at}.from_context"))?)
                }
                _ => InputSource::Link(parse_link(&obj["link"], &format!("{at}.link"))?),
            }
        }
        _ => {
            return Err(spec_error(
                at,
                "only one of value, from_context or link may be given",
            ))
        }
    };

    Ok(InputDescriptor { source, type_hint })
}

fn parse_type_hint(value: &Value, at: &str) -> Result<Vec<String>> {
    let types = match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .map(|item| as_str(item, at).map(str::to_string))
            .collect::<Result<Vec<_>>>()?,
        _ => return Err(spec_error(at, "expected a type name or a list of type names")),
    };
    if types.is_empty() || types.iter().any(|t| t.trim().is_empty()) {
        return Err(spec_error(at, "type names must not be empty"));
    }
    Ok(types)
}

fn parse_link(value: &Value, at: &str) -> Result<LinkTarget> {
    match value {
        Value::String(_) => Ok(LinkTarget::Current(parse_dotted(value, at)?)),
        Value::Object(obj) => {
            reject_unknown(obj, &["step", "output"], at, "a link")?;
            let step = match obj.get("step") {
                Some(Value::Number(n)) => n.as_u64().map(|n| n as usize),
                Some(Value::String(s)) => s.parse::<usize>().ok(),
                _ => None,
            }
            .ok_or_else(|| spec_error(&format!("{at}.step"), "expected a step ordinal"))?;
            let output = obj
                .get("output")
                .ok_or_else(|| spec_error(at, "a step link needs 'output'"))?;
            Ok(LinkTarget::Step {
                step,
                output: parse_dotted(output, &format!("{at}.output"))?,
            })
        }
        _ => Err(spec_error(at, "expected a dotted path or {step, output}")),
    }
}

fn parse_postprocess(value: Option<&Value>, at: &str) -> Result<Vec<PostprocessAction>> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(spec_error(&format!("{at}.postprocess"), "expected a list")),
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| parse_action(item, &format!("{at}.postprocess[{i}]")))
        .collect()
}

fn parse_action(value: &Value, at: &str) -> Result<PostprocessAction> {
    match value {
        Value::String(_) => parse_expression(value, at).map(PostprocessAction::Expression),
        Value::Object(obj) => {
            reject_unknown(obj, &["to_context"], at, "a postprocess action")?;
            let inner_at = format!("{at}.to_context");
            let inner = obj
                .get("to_context")
                .ok_or_else(|| spec_error(at, "expected an expression or 'to_context'"))?;
            let inner = as_object(inner, &inner_at, "to_context")?;
            reject_unknown(inner, &["name", "value", "output"], &inner_at, "to_context")?;

            let name = inner
                .get("name")
                .ok_or_else(|| spec_error(&inner_at, "missing 'name'"))?;
            let name = parse_dotted(name, &format!("{inner_at}.name"))?;
            let source = match (inner.get("value"), inner.get("output")) {
                (Some(v), None) => ContextSource::Value(v.clone()),
                (None, Some(o)) => ContextSource::Output(parse_dotted(o, &format!("{inner_at}.output"))?),
                _ => return Err(spec_error(&inner_at, "exactly one of 'value' or 'output' is required")),
            };
            Ok(PostprocessAction::ToContext { name, source })
        }
        _ => Err(spec_error(at, "expected an expression or 'to_context'")),
    }
}

fn parse_error_override(value: &Value, at: &str) -> Result<ErrorOverride> {
    let obj = as_object(value, at, "error")?;
    reject_unknown(obj, &["code", "message"], at, "error")?;
    let code = obj
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok())
        .ok_or_else(|| spec_error(&format!("{at}.code"), "expected an integer exit code"))?;
    let message = match obj.get("message") {
        None | Some(Value::Null) => None,
        Some(v) => Some(as_str(v, &format!("{at}.message"))?.to_string()),
    };
    Ok(ErrorOverride { code, message })
}

impl Step {
    /// Short human-readable label used in logs and events.
    pub fn describe(&self) -> String {
        match &self.kind {
            StepKind::Loop { condition, .. } => format!("while {}", condition.source()),
            StepKind::Reference { node, .. } => format!("node {node}"),
            StepKind::Unit(unit) => format!("{} {}", unit.kind, unit.identifier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(doc: Value) -> Result<ChainSpec> {
        ChainSpec::from_value(&doc)
    }

    fn spec_message(doc: Value) -> String {
        match parse(doc) {
            Err(ChainError::Specification(msg)) => msg,
            other => panic!("expected specification error, got {other:?}"),
        }
    }

    #[test]
    fn parses_unit_step_with_inputs() {
        let spec = parse(json!({
            "steps": [{
                "calcjob": "quantumespresso.pw",
                "inputs": {
                    "code": {"value": "pw@localhost", "type": "code"},
                    "structure": {"from_context": "structure"},
                    "parameters": {"CONTROL": {"calculation": "scf"}},
                    "kpoints.mesh": [2, 2, 2],
                    "parent_folder": {"link": "remote_folder"},
                    "charge": {"link": {"step": 0, "output": "output_parameters.charge"}},
                },
                "metadata": {"options": {"resources": {"num_machines": 1}}},
                "error": {"code": 3, "message": "scf failed"},
            }]
        }))
        .unwrap();

        assert_eq!(spec.steps.len(), 1);
        let StepKind::Unit(unit) = &spec.steps[0].kind else {
            panic!("expected a unit step");
        };
        assert_eq!(unit.kind, UnitKind::CalcJob);
        assert_eq!(unit.identifier, "quantumespresso.pw");
        let keys: Vec<_> = unit.inputs.keys().cloned().collect();
        assert_eq!(
            keys,
            vec!["code", "structure", "parameters", "kpoints.mesh", "parent_folder", "charge"]
        );
        assert_eq!(unit.inputs["code"].type_hint, Some(vec!["code".to_string()]));
        assert_eq!(
            unit.inputs["structure"].source,
            InputSource::FromContext("structure".into())
        );
        assert_eq!(
            unit.inputs["parameters"].source,
            InputSource::Literal(json!({"CONTROL": {"calculation": "scf"}}))
        );
        assert_eq!(
            unit.inputs["parent_folder"].source,
            InputSource::Link(LinkTarget::Current("remote_folder".into()))
        );
        assert_eq!(
            unit.inputs["charge"].source,
            InputSource::Link(LinkTarget::Step {
                step: 0,
                output: "output_parameters.charge".into()
            })
        );
        assert!(unit.metadata.is_some());
        assert_eq!(
            unit.error,
            Some(ErrorOverride {
                code: 3,
                message: Some("scf failed".into())
            })
        );
    }

    #[test]
    fn parses_loops_conditions_and_references() {
        let spec = parse(json!({
            "setup": ["0 | to_ctx('i')"],
            "steps": [
                {"if": "{{ ctx.run_relax }}", "workflow": "relax"},
                {"while": "ctx.i < 3", "steps": [
                    {"calculation": "add", "postprocess": ["(ctx.i + 1) | to_ctx('i')"]},
                ]},
                {"node": 42, "postprocess": [{"to_context": {"name": "ref.energy", "output": "energy"}}]},
            ]
        }))
        .unwrap();

        assert_eq!(spec.setup.len(), 1);
        assert!(spec.steps[0].condition.is_some());
        assert!(matches!(spec.steps[1].kind, StepKind::Loop { ref steps, .. } if steps.len() == 1));
        match &spec.steps[2].kind {
            StepKind::Reference { node, postprocess } => {
                assert_eq!(*node, 42);
                assert!(matches!(
                    &postprocess[0],
                    PostprocessAction::ToContext { name, source: ContextSource::Output(o) }
                        if name == "ref.energy" && o == "energy"
                ));
            }
            other => panic!("expected reference, got {other:?}"),
        }
        assert_eq!(spec.step_count(), 4);
        assert_eq!(spec.max_loop_depth(), 1);
        assert_eq!(spec.units().len(), 2);
    }

    #[test]
    fn if_without_kind_is_rejected() {
        let msg = spec_message(json!({"steps": [{"if": "true"}]}));
        assert!(msg.contains("nothing to run"), "{msg}");
    }

    #[test]
    fn conflicting_kinds_are_rejected() {
        let msg = spec_message(json!({"steps": [{"calcjob": "a", "node": 1}]}));
        assert!(msg.contains("mutually exclusive"), "{msg}");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let msg = spec_message(json!({"steps": [{"calcjob": "a", "preprocess": "x"}]}));
        assert!(msg.contains("unknown field 'preprocess'"), "{msg}");
        let msg = spec_message(json!({"steps": [{"calcjob": "a"}], "extra": 1}));
        assert!(msg.contains("unknown field 'extra'"), "{msg}");
    }

    #[test]
    fn steps_outside_while_are_rejected() {
        let msg = spec_message(json!({"steps": [{"steps": []}]}));
        assert!(msg.contains("only allowed together with 'while'"), "{msg}");
        let msg = spec_message(json!({"steps": [{"calcjob": "a", "steps": []}]}));
        assert!(msg.contains("unknown field 'steps'"), "{msg}");
    }

    #[test]
    fn empty_step_list_is_rejected() {
        let msg = spec_message(json!({"steps": []}));
        assert!(msg.contains("at least one step"), "{msg}");
    }

    #[test]
    fn malformed_descriptors_are_rejected() {
        let msg = spec_message(json!({"steps": [{"calcjob": "a", "inputs": {
            "x": {"value": 1, "from_context": "y"}
        }}]}));
        assert!(msg.contains("only one of"), "{msg}");

        let msg = spec_message(json!({"steps": [{"calcjob": "a", "inputs": {
            "x": {"type": "int"}
        }}]}));
        assert!(msg.contains("'type' needs one of"), "{msg}");

        let msg = spec_message(json!({"steps": [{"calcjob": "a", "inputs": {
            "x": {"from_context": "a..b"}
        }}]}));
        assert!(msg.contains("invalid dotted path"), "{msg}");
    }

    #[test]
    fn type_hint_may_list_alternatives() {
        let spec = parse(json!({"steps": [{"calcjob": "a", "inputs": {
            "x": {"value": 1, "type": ["int", "float"]}
        }}]}))
        .unwrap();
        let StepKind::Unit(unit) = &spec.steps[0].kind else {
            panic!("expected a unit step");
        };
        assert_eq!(
            unit.inputs["x"].type_hint,
            Some(vec!["int".to_string(), "float".to_string()])
        );
    }

    #[test]
    fn expression_syntax_errors_carry_location() {
        let msg = spec_message(json!({"steps": [{"if": "ctx.a +", "calcjob": "a"}]}));
        assert!(msg.starts_with("steps[0].if:"), "{msg}");
    }

    #[test]
    fn error_override_requires_integer_code() {
        let msg = spec_message(json!({"steps": [{"calcjob": "a", "error": {"message": "x"}}]}));
        assert!(msg.contains("integer exit code"), "{msg}");
    }

    #[test]
    fn describe_labels_steps() {
        let spec = parse(json!({"steps": [
            {"calculation": "add"},
            {"node": 7},
            {"while": "false", "steps": []},
        ]}))
        .unwrap();
        assert_eq!(spec.steps[0].describe(), "calculation add");
        assert_eq!(spec.steps[1].describe(), "node 7");
        assert_eq!(spec.steps[2].describe(), "while false");
    }
}
