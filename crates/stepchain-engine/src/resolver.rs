//! Input resolution: turns a unit step's input descriptors into the concrete,
//! typed input mapping handed to the backend.

use serde_json::{Map, Value};
use stepchain_template::{render_value, Scope};
use stepchain_types::{path, ChainError, Context, Result, Results};

use crate::backend::UnitHandle;
use crate::spec::{InputDescriptor, InputSource, LinkTarget, UnitStep};
use crate::types::TypeRegistry;

/// Chain state visible while resolving inputs.
#[derive(Debug, Clone, Copy)]
pub struct ResolveScope<'a> {
    pub ctx: &'a Context,
    pub results: &'a Results,
    /// Outputs of the most recently finished unit, if any.
    pub current: Option<&'a Map<String, Value>>,
}

impl<'a> ResolveScope<'a> {
    pub fn new(ctx: &'a Context, results: &'a Results) -> Self {
        Self {
            ctx,
            results,
            current: None,
        }
    }

    pub fn with_current(mut self, outputs: Option<&'a Map<String, Value>>) -> Self {
        self.current = outputs;
        self
    }

    fn template_scope(&self) -> Scope<'a> {
        let scope = Scope::new(self.ctx, self.results);
        match self.current {
            Some(outputs) => scope.with_outputs(outputs),
            None => scope,
        }
    }
}

/// What a key is expected to become.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Expect<'a> {
    Untyped,
    Typed { types: &'a [String], namespace: bool },
}

/// Resolve every input of `unit` against `handle`'s ports.
///
/// Keys are applied in declaration order; dotted keys build nested mappings.
/// `metadata` is forwarded verbatim.
pub fn resolve_inputs(
    unit: &UnitStep,
    handle: &UnitHandle,
    types: &TypeRegistry,
    scope: ResolveScope<'_>,
) -> Result<Map<String, Value>> {
    let mut inputs = Map::new();

    for (key, descriptor) in &unit.inputs {
        let expect = expectation(key, descriptor, handle)?;
        let raw = raw_value(key, descriptor, &scope)?;
        let value = coerce(key, raw, expect, types)?;
        tracing::trace!(unit = %handle.identifier, input = %key, "resolved input");

        path::set(&mut inputs, key, value).map_err(|e| ChainError::Resolution {
            input: key.clone(),
            message: e.to_string(),
        })?;
    }

    if let Some(metadata) = &unit.metadata {
        inputs.insert("metadata".into(), Value::Object(metadata.clone()));
    }
    Ok(inputs)
}

fn expectation<'a>(key: &str, descriptor: &'a InputDescriptor, handle: &'a UnitHandle) -> Result<Expect<'a>> {
    let (port_types, namespace): (&[String], bool) = match handle.ports.get(key) {
        Some(port) => (port.types.as_slice(), port.dynamic),
        None => {
            let first = path::segments(key).next().unwrap_or(key);
            match handle.ports.get(first) {
                // An entry below a namespace port takes the namespace's type.
                Some(port) if port.dynamic && first != key => (port.types.as_slice(), false),
                _ if handle.accepts_extra => (&[][..], false),
                _ => {
                    return Err(ChainError::Resolution {
                        input: key.to_string(),
                        message: format!("{} has no input port '{key}'", handle.label()),
                    })
                }
            }
        }
    };

    let types = descriptor.type_hint.as_deref().unwrap_or(port_types);
    if types.is_empty() {
        Ok(Expect::Untyped)
    } else {
        Ok(Expect::Typed { types, namespace })
    }
}

fn raw_value(key: &str, descriptor: &InputDescriptor, scope: &ResolveScope<'_>) -> Result<Value> {
    let missing = |message: String| ChainError::Resolution {
        input: key.to_string(),
        message,
    };

    let fetched = match &descriptor.source {
        InputSource::Literal(v) | InputSource::Value(v) => v,
        InputSource::FromContext(at) => scope
            .ctx
            .get(at)
            .ok_or_else(|| missing(format!("context has no value at '{at}'")))?,
        InputSource::Link(LinkTarget::Current(output)) => {
            let outputs = scope
                .current
                .ok_or_else(|| missing("no unit has finished yet".to_string()))?;
            path::get(outputs, output)
                .ok_or_else(|| missing(format!("current unit has no output '{output}'")))?
        }
        InputSource::Link(LinkTarget::Step { step, output }) => {
            let entry = scope
                .results
                .get(&step.to_string())
                .ok_or_else(|| missing(format!("no results recorded for unit {step}")))?;
            path::get_in(entry, output)
                .ok_or_else(|| missing(format!("unit {step} has no output '{output}'")))?
        }
    };

    render_value(fetched, &scope.template_scope())
}

fn coerce(key: &str, raw: Value, expect: Expect<'_>, types: &TypeRegistry) -> Result<Value> {
    let fail = |message: String| ChainError::Resolution {
        input: key.to_string(),
        message,
    };

    match expect {
        Expect::Untyped => Ok(raw),
        Expect::Typed { types: wanted, namespace: false } => {
            types.coerce(&raw, wanted).map_err(|e| fail(e.to_string()))
        }
        Expect::Typed { types: wanted, namespace: true } => {
            let Value::Object(entries) = raw else {
                return Err(fail("a namespace input needs a mapping".to_string()));
            };
            let mut out = Map::new();
            for (name, entry) in entries {
                let typed = types
                    .coerce(&entry, wanted)
                    .map_err(|e| fail(format!("entry '{name}': {e}")))?;
                out.insert(name, typed);
            }
            Ok(Value::Object(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PortSpec;
    use crate::spec::{ChainSpec, StepKind, UnitKind};
    use serde_json::json;

    fn unit(step: Value) -> UnitStep {
        let spec = ChainSpec::from_value(&json!({"steps": [step]})).unwrap();
        match spec.steps.into_iter().next().map(|s| s.kind) {
            Some(StepKind::Unit(unit)) => unit,
            _ => unreachable!(),
        }
    }

    fn pw() -> UnitHandle {
        UnitHandle::new(UnitKind::CalcJob, "pw")
            .with_port("code", PortSpec::typed(["code"]))
            .with_port("kpoints", PortSpec::typed(["kpoints"]))
            .with_port("parameters", PortSpec::typed(["dict"]))
            .with_port("pseudos", PortSpec::namespace(["pseudo"]))
            .with_port("x", PortSpec::typed(["int"]))
            .with_port("label", PortSpec::default())
    }

    fn resolve(step: Value, ctx: &Context, results: &Results) -> Result<Map<String, Value>> {
        resolve_inputs(
            &unit(step),
            &pw(),
            &TypeRegistry::with_builtins(),
            ResolveScope::new(ctx, results),
        )
    }

    #[test]
    fn literals_are_typed_by_port() {
        let out = resolve(
            json!({"calcjob": "pw", "inputs": {"x": 5, "kpoints": [2, 2, 2]}}),
            &Context::new(),
            &Results::new(),
        )
        .unwrap();
        assert_eq!(out["x"], json!({"@type": "int", "value": 5}));
        assert_eq!(out["kpoints"]["@type"], "kpoints");
    }

    #[test]
    fn templates_render_native_values_before_coercion() {
        let ctx = Context::from_map(json!({"n": 4}).as_object().unwrap().clone());
        let out = resolve(
            json!({"calcjob": "pw", "inputs": {"x": "{{ ctx.n * 2 }}", "label": "run-{{ ctx.n }}"}}),
            &ctx,
            &Results::new(),
        )
        .unwrap();
        assert_eq!(out["x"], json!({"@type": "int", "value": 8}));
        assert_eq!(out["label"], json!("run-4"));
    }

    #[test]
    fn type_hint_overrides_port_type() {
        let out = resolve(
            json!({"calcjob": "pw", "inputs": {"x": {"value": "7", "type": "str"}}}),
            &Context::new(),
            &Results::new(),
        )
        .unwrap();
        assert_eq!(out["x"], json!({"@type": "str", "value": "7"}));
    }

    #[test]
    fn namespace_port_types_each_entry() {
        let out = resolve(
            json!({"calcjob": "pw", "inputs": {
                "pseudos": {"value": {
                    "Si": {"group": "SSSP", "element": "Si"},
                    "O": {"group": "SSSP", "element": "O"},
                }},
            }}),
            &Context::new(),
            &Results::new(),
        )
        .unwrap();
        assert_eq!(out["pseudos"]["Si"]["@type"], "pseudo");
        assert_eq!(out["pseudos"]["O"]["value"]["element"], "O");
    }

    #[test]
    fn dotted_key_below_namespace_builds_nested_mapping() {
        let out = resolve(
            json!({"calcjob": "pw", "inputs": {
                "pseudos.Si": {"value": {"group": "SSSP", "element": "Si"}},
            }}),
            &Context::new(),
            &Results::new(),
        )
        .unwrap();
        assert_eq!(
            out["pseudos"]["Si"],
            json!({"@type": "pseudo", "value": {"group": "SSSP", "element": "Si"}})
        );
    }

    #[test]
    fn unknown_key_is_resolution_error() {
        let err = resolve(
            json!({"calcjob": "pw", "inputs": {"bogus": 1}}),
            &Context::new(),
            &Results::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ChainError::Resolution { input, .. } if input == "bogus"));
    }

    #[test]
    fn extra_keys_pass_through_when_accepted() {
        let handle = UnitHandle::new(UnitKind::Workflow, "free").accepting_extra();
        let out = resolve_inputs(
            &unit(json!({"workflow": "free", "inputs": {"a.b": 1}})),
            &handle,
            &TypeRegistry::with_builtins(),
            ResolveScope::new(&Context::new(), &Results::new()),
        )
        .unwrap();
        assert_eq!(Value::Object(out), json!({"a": {"b": 1}}));
    }

    #[test]
    fn from_context_reads_and_misses() {
        let ctx = Context::from_map(json!({"params": {"ecut": 30}}).as_object().unwrap().clone());
        let out = resolve(
            json!({"calcjob": "pw", "inputs": {"parameters": {"from_context": "params"}}}),
            &ctx,
            &Results::new(),
        )
        .unwrap();
        assert_eq!(out["parameters"], json!({"@type": "dict", "value": {"ecut": 30}}));

        let err = resolve(
            json!({"calcjob": "pw", "inputs": {"parameters": {"from_context": "nope"}}}),
            &ctx,
            &Results::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ChainError::Resolution { .. }));
    }

    #[test]
    fn links_follow_current_and_recorded_outputs() {
        let mut results = Results::new();
        results
            .record_outputs(0, json!({"out": {"n": 3}}).as_object().unwrap().clone())
            .unwrap();
        let current = json!({"sum": 11}).as_object().unwrap().clone();
        let ctx = Context::new();

        let out = resolve_inputs(
            &unit(json!({"calcjob": "pw", "inputs": {
                "x": {"link": "sum"},
                "label": {"link": {"step": 0, "output": "out.n"}},
            }})),
            &pw(),
            &TypeRegistry::with_builtins(),
            ResolveScope::new(&ctx, &results).with_current(Some(&current)),
        )
        .unwrap();
        assert_eq!(out["x"], json!({"@type": "int", "value": 11}));
        assert_eq!(out["label"], json!(3));
    }

    #[test]
    fn link_without_finished_unit_fails() {
        let err = resolve(
            json!({"calcjob": "pw", "inputs": {"x": {"link": "sum"}}}),
            &Context::new(),
            &Results::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no unit has finished yet"));
    }

    #[test]
    fn coercion_failure_names_the_input() {
        let err = resolve(
            json!({"calcjob": "pw", "inputs": {"x": "abc"}}),
            &Context::new(),
            &Results::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ChainError::Resolution { input, .. } if input == "x"));
    }

    #[test]
    fn metadata_is_forwarded_verbatim() {
        let out = resolve(
            json!({"calcjob": "pw", "inputs": {}, "metadata": {"options": {"withmpi": true}}}),
            &Context::new(),
            &Results::new(),
        )
        .unwrap();
        assert_eq!(out["metadata"], json!({"options": {"withmpi": true}}));
    }
}
