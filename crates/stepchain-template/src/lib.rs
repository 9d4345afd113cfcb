//! Expression and template language for step chains.
//!
//! Two entry points share one grammar:
//!
//! - [`Expression`]: a single expression, optionally wrapped in `{{ }}`, used
//!   for `if`/`while` conditions, setup expressions, and postprocess actions.
//! - [`Template`]: a string with embedded `{{ expression }}` segments, used for
//!   string-valued step inputs. A template that is exactly one segment yields
//!   the native value of the expression; anything else renders to a string.
//!
//! # Example
//! ```
//! use serde_json::json;
//! use stepchain_template::{Expression, Scope};
//! use stepchain_types::{Context, Results};
//!
//! let mut ctx = Context::new();
//! ctx.set("iteration", json!(2)).unwrap();
//! let results = Results::new();
//!
//! let cond = Expression::parse("{{ ctx.iteration < 3 }}").unwrap();
//! assert!(cond.evaluate_bool(&Scope::new(&ctx, &results)).unwrap());
//! ```

pub mod ast;
pub mod eval;
mod parser;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use stepchain_types::Result;

pub use ast::{BinaryOp, Expr, Segment, UnaryOp};
pub use eval::{apply_effects, to_text, truthy, Effect, Scope};
pub use parser::{parse_expression, parse_template};

use eval::Evaluator;

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

/// A parsed expression that remembers its source text.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let ast = parser::parse_expression(source)?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Returns `true` if the expression uses `to_ctx` or `to_results`.
    pub fn has_writes(&self) -> bool {
        has_writes(&self.ast)
    }

    /// Evaluate without write access. Write filters fail.
    pub fn evaluate(&self, scope: &Scope<'_>) -> Result<Value> {
        Evaluator::read_only(*scope)
            .eval(&self.ast)
            .map_err(|e| e.into_chain_error(&self.source))
    }

    pub fn evaluate_bool(&self, scope: &Scope<'_>) -> Result<bool> {
        self.evaluate(scope).map(|v| truthy(&v))
    }

    /// Evaluate, appending the writes requested by write filters to `effects`.
    pub fn evaluate_with_effects(&self, scope: &Scope<'_>, effects: &mut Vec<Effect>) -> Result<Value> {
        Evaluator::with_effects(*scope, effects)
            .eval(&self.ast)
            .map_err(|e| e.into_chain_error(&self.source))
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Expression::parse(&source).map_err(serde::de::Error::custom)
    }
}

fn has_writes(expr: &Expr) -> bool {
    match expr {
        Expr::Literal(_) | Expr::Name(_) => false,
        Expr::List(items) => items.iter().any(has_writes),
        Expr::Map(entries) => entries.iter().any(|(_, v)| has_writes(v)),
        Expr::Attr(base, _) => has_writes(base),
        Expr::Index(base, index) => has_writes(base) || has_writes(index),
        Expr::Unary(_, inner) => has_writes(inner),
        Expr::Binary(_, lhs, rhs) => has_writes(lhs) || has_writes(rhs),
        Expr::Filter { input, name, args } => {
            name == "to_ctx" || name == "to_results" || has_writes(input) || args.iter().any(has_writes)
        }
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// A string with embedded `{{ expression }}` segments.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let segments = parser::parse_template(source)?;
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns `true` if the template has no expression segments.
    pub fn is_static(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Text(_)))
    }

    pub fn has_writes(&self) -> bool {
        self.segments.iter().any(|s| match s {
            Segment::Expr(e) => has_writes(e),
            Segment::Text(_) => false,
        })
    }

    /// Render against `scope`. A single expression segment keeps its native
    /// type; mixed content is rendered to a string.
    pub fn render(&self, scope: &Scope<'_>) -> Result<Value> {
        let mut evaluator = Evaluator::read_only(*scope);
        match self.segments.as_slice() {
            [Segment::Expr(expr)] => evaluator
                .eval(expr)
                .map_err(|e| e.into_chain_error(&self.source)),
            segments => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Expr(expr) => {
                            let value = evaluator
                                .eval(expr)
                                .map_err(|e| e.into_chain_error(&self.source))?;
                            out.push_str(&to_text(&value));
                        }
                    }
                }
                Ok(Value::String(out))
            }
        }
    }
}

/// Returns `true` if `s` contains a `{{` segment opener.
pub fn contains_template(s: &str) -> bool {
    s.contains("{{")
}

/// Render every templated string inside `value`, recursing into lists and
/// mappings. Non-string scalars and plain strings pass through unchanged.
pub fn render_value(value: &Value, scope: &Scope<'_>) -> Result<Value> {
    match value {
        Value::String(s) if contains_template(s) => Template::parse(s)?.render(scope),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, scope))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                out.insert(key.clone(), render_value(item, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Check every templated string inside `value` for syntax errors.
pub fn check_value(value: &Value) -> Result<()> {
    match value {
        Value::String(s) if contains_template(s) => Template::parse(s).map(|_| ()),
        Value::Array(items) => items.iter().try_for_each(check_value),
        Value::Object(map) => map.values().try_for_each(check_value),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepchain_types::{ChainError, Context, Results};

    fn fixtures() -> (Context, Results) {
        let ctx = Context::from_map(match json!({
            "structure": {"@type": "structure", "value": {"cell": [[1, 0, 0]]}},
            "pw": {"version": "7.2", "host": "localhost"},
            "kpoints": 4,
        }) {
            Value::Object(m) => m,
            _ => unreachable!(),
        });
        let mut results = Results::new();
        results.record("0", json!({"energy": -3.0})).unwrap();
        (ctx, results)
    }

    #[test]
    fn expression_accepts_optional_delimiters() {
        let (ctx, results) = fixtures();
        let scope = Scope::new(&ctx, &results);
        let wrapped = Expression::parse("{{ ctx.kpoints > 2 }}").unwrap();
        let bare = Expression::parse("ctx.kpoints > 2").unwrap();
        assert!(wrapped.evaluate_bool(&scope).unwrap());
        assert!(bare.evaluate_bool(&scope).unwrap());
    }

    #[test]
    fn expression_keeps_source() {
        let expr = Expression::parse("ctx.a or ctx.b").unwrap();
        assert_eq!(expr.source(), "ctx.a or ctx.b");
        assert_eq!(expr.to_string(), "ctx.a or ctx.b");
    }

    #[test]
    fn evaluation_error_names_the_expression() {
        let (ctx, results) = fixtures();
        let expr = Expression::parse("ctx.missing.path").unwrap();
        match expr.evaluate(&Scope::new(&ctx, &results)) {
            Err(ChainError::Evaluation { expression, .. }) => {
                assert_eq!(expression, "ctx.missing.path");
            }
            other => panic!("expected evaluation error, got {other:?}"),
        }
    }

    #[test]
    fn has_writes_detects_write_filters() {
        assert!(Expression::parse("1 | to_ctx('a')").unwrap().has_writes());
        assert!(Expression::parse("[ctx.a | to_results('k')]").unwrap().has_writes());
        assert!(!Expression::parse("ctx.a | default(1)").unwrap().has_writes());
    }

    #[test]
    fn evaluate_with_effects_collects_writes() {
        let (ctx, results) = fixtures();
        let expr = Expression::parse("results.0.energy | to_ctx('last_energy')").unwrap();
        let mut effects = Vec::new();
        let value = expr
            .evaluate_with_effects(&Scope::new(&ctx, &results), &mut effects)
            .unwrap();
        assert_eq!(value, json!(-3.0));
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn single_segment_template_is_native() {
        let (ctx, results) = fixtures();
        let scope = Scope::new(&ctx, &results);
        let template = Template::parse("{{ ctx.structure }}").unwrap();
        assert_eq!(
            template.render(&scope).unwrap(),
            json!({"@type": "structure", "value": {"cell": [[1, 0, 0]]}})
        );
        assert_eq!(
            Template::parse("{{ ctx.kpoints }}").unwrap().render(&scope).unwrap(),
            json!(4)
        );
    }

    #[test]
    fn mixed_template_renders_string() {
        let (ctx, results) = fixtures();
        let scope = Scope::new(&ctx, &results);
        let template = Template::parse("pw-{{ ctx.pw.version }}@{{ ctx.pw.host }}").unwrap();
        assert_eq!(template.render(&scope).unwrap(), json!("pw-7.2@localhost"));
    }

    #[test]
    fn static_template_passes_through() {
        let (ctx, results) = fixtures();
        let template = Template::parse("scf").unwrap();
        assert!(template.is_static());
        assert_eq!(
            template.render(&Scope::new(&ctx, &results)).unwrap(),
            json!("scf")
        );
    }

    #[test]
    fn render_value_recurses() {
        let (ctx, results) = fixtures();
        let scope = Scope::new(&ctx, &results);
        let value = json!({
            "CONTROL": {"calculation": "scf", "prefix": "run-{{ ctx.kpoints }}"},
            "mesh": ["{{ ctx.kpoints }}", 1, true],
        });
        assert_eq!(
            render_value(&value, &scope).unwrap(),
            json!({
                "CONTROL": {"calculation": "scf", "prefix": "run-4"},
                "mesh": [4, 1, true],
            })
        );
    }

    #[test]
    fn check_value_reports_bad_templates() {
        assert!(check_value(&json!({"a": ["{{ ctx.x }}"]})).is_ok());
        assert!(matches!(
            check_value(&json!({"a": ["{{ ctx.x + }}"]})),
            Err(ChainError::ExpressionSyntax { .. })
        ));
    }

    #[test]
    fn expression_deserializes_from_string() {
        let expr: Expression = serde_json::from_value(json!("{{ ctx.a }}")).unwrap();
        assert_eq!(expr.source(), "{{ ctx.a }}");
        let bad: std::result::Result<Expression, _> = serde_json::from_value(json!("ctx.a +"));
        assert!(bad.is_err());
    }
}
