//! Chain validation: lint rules and diagnostics.
//!
//! Shape errors are caught while building the [`ChainSpec`]; the rules here
//! check what a well-formed chain can still get wrong. Call [`validate`] for
//! advisory diagnostics or [`validate_or_raise`] to fail on the first
//! `Error`-severity issue.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use stepchain_template::check_value;
use stepchain_types::{ChainError, Result};

use crate::spec::{ChainSpec, InputSource, PostprocessAction, Step, StepKind, UnitStep};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    /// Location of the offending step, e.g. `steps[1].steps[0]`.
    pub path: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, spec: &ChainSpec) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Visit every step depth-first with its location.
fn walk<'a>(steps: &'a [Step], prefix: &str, visit: &mut dyn FnMut(&'a Step, &str)) {
    for (i, step) in steps.iter().enumerate() {
        let at = format!("{prefix}[{i}]");
        visit(step, &at);
        if let StepKind::Loop { steps, .. } = &step.kind {
            walk(steps, &format!("{at}.steps"), visit);
        }
    }
}

fn for_each_unit<'a>(spec: &'a ChainSpec, visit: &mut dyn FnMut(&'a UnitStep, &str)) {
    walk(&spec.steps, "steps", &mut |step: &'a Step, at: &str| {
        if let StepKind::Unit(unit) = &step.kind {
            visit(unit, at);
        }
    });
}

fn diagnostic(rule: &dyn LintRule, severity: Severity, at: &str, message: String) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity,
        message,
        path: Some(at.to_string()),
        fix: None,
    }
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*([.:/@-][A-Za-z0-9_]+)*$")
            .expect("identifier pattern is a valid regex")
    })
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct GuardReadOnlyRule;
impl LintRule for GuardReadOnlyRule {
    fn name(&self) -> &str { "guard_read_only" }
    fn apply(&self, spec: &ChainSpec) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        walk(&spec.steps, "steps", &mut |step: &Step, at: &str| {
            let guards = step
                .condition
                .iter()
                .map(|c| ("if", c))
                .chain(match &step.kind {
                    StepKind::Loop { condition, .. } => Some(("while", condition)),
                    _ => None,
                });
            for (field, guard) in guards {
                if guard.has_writes() {
                    out.push(Diagnostic {
                        fix: Some("Move to_ctx/to_results into setup or postprocess".into()),
                        ..diagnostic(
                            self,
                            Severity::Error,
                            at,
                            format!("'{field}' guard '{}' uses a write filter", guard.source()),
                        )
                    });
                }
            }
        });
        out
    }
}

struct InputTemplatesRule;
impl LintRule for InputTemplatesRule {
    fn name(&self) -> &str { "input_templates" }
    fn apply(&self, spec: &ChainSpec) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for_each_unit(spec, &mut |unit: &UnitStep, at: &str| {
            for (key, descriptor) in &unit.inputs {
                let value = match &descriptor.source {
                    InputSource::Literal(v) | InputSource::Value(v) => v,
                    _ => continue,
                };
                if let Err(e) = check_value(value) {
                    out.push(diagnostic(
                        self,
                        Severity::Error,
                        at,
                        format!("input '{key}': {e}"),
                    ));
                    continue;
                }
                if has_write_template(value) {
                    out.push(diagnostic(
                        self,
                        Severity::Error,
                        at,
                        format!("input '{key}' uses a write filter"),
                    ));
                }
            }
        });
        out
    }
}

fn has_write_template(value: &Value) -> bool {
    match value {
        Value::String(s) if stepchain_template::contains_template(s) => {
            stepchain_template::Template::parse(s).is_ok_and(|t| t.has_writes())
        }
        Value::Array(items) => items.iter().any(has_write_template),
        Value::Object(map) => map.values().any(has_write_template),
        _ => false,
    }
}

struct UnitIdentifierRule;
impl LintRule for UnitIdentifierRule {
    fn name(&self) -> &str { "unit_identifier" }
    fn apply(&self, spec: &ChainSpec) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for_each_unit(spec, &mut |unit: &UnitStep, at: &str| {
            if !identifier_pattern().is_match(&unit.identifier) {
                out.push(diagnostic(
                    self,
                    Severity::Warning,
                    at,
                    format!("unusual {} identifier '{}'", unit.kind, unit.identifier),
                ));
            }
        });
        out
    }
}

struct ErrorCodeRule;
impl LintRule for ErrorCodeRule {
    fn name(&self) -> &str { "error_code_nonzero" }
    fn apply(&self, spec: &ChainSpec) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for_each_unit(spec, &mut |unit: &UnitStep, at: &str| {
            if let Some(error) = &unit.error {
                if error.code == 0 {
                    out.push(Diagnostic {
                        fix: Some("Use a non-zero exit code".into()),
                        ..diagnostic(
                            self,
                            Severity::Error,
                            at,
                            "error override code 0 would report a failure as success".into(),
                        )
                    });
                }
            }
        });
        out
    }
}

struct MetadataClashRule;
impl LintRule for MetadataClashRule {
    fn name(&self) -> &str { "metadata_clash" }
    fn apply(&self, spec: &ChainSpec) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for_each_unit(spec, &mut |unit: &UnitStep, at: &str| {
            if unit.metadata.is_none() {
                return;
            }
            if let Some(key) = unit
                .inputs
                .keys()
                .find(|k| *k == "metadata" || k.starts_with("metadata."))
            {
                out.push(diagnostic(
                    self,
                    Severity::Error,
                    at,
                    format!("input '{key}' collides with the step's metadata"),
                ));
            }
        });
        out
    }
}

struct LoopBodyRule;
impl LintRule for LoopBodyRule {
    fn name(&self) -> &str { "loop_body_not_empty" }
    fn apply(&self, spec: &ChainSpec) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        walk(&spec.steps, "steps", &mut |step: &Step, at: &str| {
            if let StepKind::Loop { steps, condition } = &step.kind {
                if steps.is_empty() {
                    out.push(diagnostic(
                        self,
                        Severity::Warning,
                        at,
                        format!(
                            "loop '{}' has no steps and spins until its guard turns false",
                            condition.source()
                        ),
                    ));
                }
            }
        });
        out
    }
}

struct ReferenceNodeRule;
impl LintRule for ReferenceNodeRule {
    fn name(&self) -> &str { "reference_node" }
    fn apply(&self, spec: &ChainSpec) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        walk(&spec.steps, "steps", &mut |step: &Step, at: &str| {
            if let StepKind::Reference { node, .. } = &step.kind {
                if *node < 0 {
                    out.push(diagnostic(
                        self,
                        Severity::Error,
                        at,
                        format!("node id {node} is negative"),
                    ));
                }
            }
        });
        out
    }
}

struct PostprocessEffectRule;
impl LintRule for PostprocessEffectRule {
    fn name(&self) -> &str { "postprocess_has_effect" }
    fn apply(&self, spec: &ChainSpec) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        walk(&spec.steps, "steps", &mut |step: &Step, at: &str| {
            let actions = match &step.kind {
                StepKind::Unit(unit) => &unit.postprocess,
                StepKind::Reference { postprocess, .. } => postprocess,
                StepKind::Loop { .. } => return,
            };
            for action in actions {
                if let PostprocessAction::Expression(expr) = action {
                    if !expr.has_writes() {
                        out.push(diagnostic(
                            self,
                            Severity::Warning,
                            at,
                            format!(
                                "postprocess '{}' writes nothing; its value is discarded",
                                expr.source()
                            ),
                        ));
                    }
                }
            }
        });
        out
    }
}

struct SetupEffectRule;
impl LintRule for SetupEffectRule {
    fn name(&self) -> &str { "setup_has_effect" }
    fn apply(&self, spec: &ChainSpec) -> Vec<Diagnostic> {
        spec.setup
            .iter()
            .enumerate()
            .filter(|(_, expr)| !expr.has_writes())
            .map(|(i, expr)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Info,
                message: format!("setup expression '{}' writes nothing", expr.source()),
                path: Some(format!("setup[{i}]")),
                fix: None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return every diagnostic found.
pub fn validate(spec: &ChainSpec) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(GuardReadOnlyRule),
        Box::new(InputTemplatesRule),
        Box::new(UnitIdentifierRule),
        Box::new(ErrorCodeRule),
        Box::new(MetadataClashRule),
        Box::new(LoopBodyRule),
        Box::new(ReferenceNodeRule),
        Box::new(PostprocessEffectRule),
        Box::new(SetupEffectRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(spec));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(spec: &ChainSpec) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(spec);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors
            .iter()
            .map(|d| match &d.path {
                Some(path) => format!("{path}: {}", d.message),
                None => d.message.clone(),
            })
            .collect();
        return Err(ChainError::Validation(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
