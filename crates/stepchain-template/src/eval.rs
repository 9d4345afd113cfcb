//! Expression evaluation against the chain scope.
//!
//! Lookups borrow from the scope and only clone the final value. Write
//! filters (`to_ctx`, `to_results`) never touch the scope directly: they
//! buffer an [`Effect`] that the caller applies once the expression is done.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};
use stepchain_types::{path, ChainError, Context, Result, Results};

use crate::ast::{BinaryOp, Expr, UnaryOp};

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The names an expression can read: `ctx`, `results`, and (after a unit
/// finishes) `outputs`.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    ctx: &'a Map<String, Value>,
    results: &'a Map<String, Value>,
    outputs: Option<&'a Map<String, Value>>,
}

impl<'a> Scope<'a> {
    pub fn new(ctx: &'a Context, results: &'a Results) -> Self {
        Self {
            ctx: ctx.as_map(),
            results: results.as_map(),
            outputs: None,
        }
    }

    pub fn from_maps(ctx: &'a Map<String, Value>, results: &'a Map<String, Value>) -> Self {
        Self {
            ctx,
            results,
            outputs: None,
        }
    }

    /// Bind `outputs` to the outputs of the unit that just finished.
    pub fn with_outputs(mut self, outputs: &'a Map<String, Value>) -> Self {
        self.outputs = Some(outputs);
        self
    }
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// A buffered write produced by a write filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SetContext { path: String, value: Value },
    SetResult { key: String, value: Value },
}

impl Effect {
    pub fn apply(self, ctx: &mut Context, results: &mut Results) -> Result<()> {
        match self {
            Effect::SetContext { path, value } => {
                tracing::trace!(path = %path, "context write");
                ctx.set(&path, value)
            }
            Effect::SetResult { key, value } => {
                tracing::trace!(key = %key, "result write");
                results.record(key, value)
            }
        }
    }
}

/// Apply effects in the order they were produced.
pub fn apply_effects(effects: Vec<Effect>, ctx: &mut Context, results: &mut Results) -> Result<()> {
    for effect in effects {
        effect.apply(ctx, results)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum EvalError {
    /// A path did not resolve. `default` recovers from this.
    Missing(String),
    Failed(String),
}

impl EvalError {
    pub(crate) fn into_chain_error(self, expression: &str) -> ChainError {
        let message = match self {
            EvalError::Missing(m) | EvalError::Failed(m) => m,
        };
        ChainError::Evaluation {
            expression: expression.to_string(),
            message,
        }
    }
}

type EvalResult<T> = std::result::Result<T, EvalError>;

fn failed(message: impl Into<String>) -> EvalError {
    EvalError::Failed(message.into())
}

fn missing(expr: &Expr) -> EvalError {
    EvalError::Missing(format!("no value at '{expr}'"))
}

enum Base<'a> {
    Map(&'a Map<String, Value>),
    Value(&'a Value),
}

pub(crate) struct Evaluator<'a, 'w> {
    scope: Scope<'a>,
    effects: Option<&'w mut Vec<Effect>>,
}

impl<'a, 'w> Evaluator<'a, 'w> {
    pub(crate) fn read_only(scope: Scope<'a>) -> Self {
        Self {
            scope,
            effects: None,
        }
    }

    pub(crate) fn with_effects(scope: Scope<'a>, effects: &'w mut Vec<Effect>) -> Self {
        Self {
            scope,
            effects: Some(effects),
        }
    }

    pub(crate) fn eval(&mut self, expr: &Expr) -> EvalResult<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<EvalResult<Vec<_>>>()
                .map(Value::Array),
            Expr::Map(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    let value = self.eval(value)?;
                    map.insert(key.clone(), value);
                }
                Ok(Value::Object(map))
            }
            Expr::Name(_) | Expr::Attr(..) | Expr::Index(..) => self.lookup(expr),
            Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::Unary(UnaryOp::Neg, inner) => {
                let value = self.eval(inner)?;
                match as_num(&value) {
                    Some(Num::Int(i)) => i
                        .checked_neg()
                        .map(Value::from)
                        .ok_or_else(|| failed("integer overflow")),
                    Some(Num::Float(f)) => float(-f),
                    None => Err(failed(format!("cannot negate {}", type_name(&value)))),
                }
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                let left = self.eval(lhs)?;
                if truthy(&left) {
                    Ok(left)
                } else {
                    self.eval(rhs)
                }
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                let left = self.eval(lhs)?;
                if truthy(&left) {
                    self.eval(rhs)
                } else {
                    Ok(left)
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let left = self.eval(lhs)?;
                let right = self.eval(rhs)?;
                binary(*op, left, right)
            }
            Expr::Filter { input, name, args } => self.filter(input, name, args),
        }
    }

    fn root(&self, name: &str) -> EvalResult<&'a Map<String, Value>> {
        match name {
            "ctx" => Ok(self.scope.ctx),
            "results" => Ok(self.scope.results),
            "outputs" => self
                .scope
                .outputs
                .ok_or_else(|| failed("'outputs' is only bound after a unit finishes")),
            other => Err(failed(format!("undefined name '{other}'"))),
        }
    }

    /// Resolve a path expression to a borrowed location in the scope.
    /// Returns `None` when the base is a computed value.
    fn resolve(&mut self, expr: &Expr) -> EvalResult<Option<Base<'a>>> {
        match expr {
            Expr::Name(name) => self.root(name).map(|m| Some(Base::Map(m))),
            Expr::Attr(base, key) => {
                let Some(parent) = self.resolve(base)? else {
                    return Ok(None);
                };
                member(parent, &Value::String(key.clone()))
                    .map(|v| Some(Base::Value(v)))
                    .ok_or_else(|| missing(expr))
            }
            Expr::Index(base, index) => {
                let Some(parent) = self.resolve(base)? else {
                    return Ok(None);
                };
                let key = self.eval(index)?;
                member(parent, &key)
                    .map(|v| Some(Base::Value(v)))
                    .ok_or_else(|| missing(expr))
            }
            _ => Ok(None),
        }
    }

    fn lookup(&mut self, expr: &Expr) -> EvalResult<Value> {
        if let Some(found) = self.resolve(expr)? {
            return Ok(match found {
                Base::Map(m) => Value::Object(m.clone()),
                Base::Value(v) => v.clone(),
            });
        }
        match expr {
            Expr::Attr(base, key) => {
                let value = self.eval(base)?;
                member(Base::Value(&value), &Value::String(key.clone()))
                    .cloned()
                    .ok_or_else(|| missing(expr))
            }
            Expr::Index(base, index) => {
                let value = self.eval(base)?;
                let key = self.eval(index)?;
                member(Base::Value(&value), &key)
                    .cloned()
                    .ok_or_else(|| missing(expr))
            }
            other => Err(failed(format!("'{other}' is not a path"))),
        }
    }

    fn push(&mut self, effect: Effect) -> EvalResult<()> {
        match self.effects.as_deref_mut() {
            Some(effects) => {
                effects.push(effect);
                Ok(())
            }
            None => Err(failed(
                "write filters are only allowed in setup and postprocess expressions",
            )),
        }
    }

    fn filter(&mut self, input: &Expr, name: &str, args: &[Expr]) -> EvalResult<Value> {
        if name == "default" {
            return match self.eval(input) {
                Ok(Value::Null) | Err(EvalError::Missing(_)) => match args.first() {
                    Some(fallback) => self.eval(fallback),
                    None => Ok(Value::Null),
                },
                other => other,
            };
        }

        let value = self.eval(input)?;
        let args = args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<EvalResult<Vec<_>>>()?;

        match name {
            "length" => match &value {
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Array(items) => Ok(Value::from(items.len())),
                Value::Object(map) => Ok(Value::from(map.len())),
                other => Err(failed(format!("{} has no length", type_name(other)))),
            },
            "int" => to_int(&value),
            "float" => to_float(&value),
            "string" => Ok(Value::String(to_text(&value))),
            "bool" => Ok(Value::Bool(truthy(&value))),
            "keys" => match &value {
                Value::Object(map) => Ok(Value::Array(
                    map.keys().map(|k| Value::String(k.clone())).collect(),
                )),
                other => Err(failed(format!("{} has no keys", type_name(other)))),
            },
            "abs" => match as_num(&value) {
                Some(Num::Int(i)) => i
                    .checked_abs()
                    .map(Value::from)
                    .ok_or_else(|| failed("integer overflow")),
                Some(Num::Float(f)) => float(f.abs()),
                None => Err(failed(format!("abs of {}", type_name(&value)))),
            },
            "round" => {
                let digits = match args.first() {
                    Some(arg) => match as_num(arg) {
                        Some(Num::Int(d)) => d,
                        _ => return Err(failed("round expects an integer argument")),
                    },
                    None => 0,
                };
                match as_num(&value) {
                    Some(Num::Int(i)) => Ok(Value::from(i)),
                    Some(Num::Float(f)) => {
                        let factor = 10f64.powi(digits.clamp(-300, 300) as i32);
                        float((f * factor).round() / factor)
                    }
                    None => Err(failed(format!("cannot round {}", type_name(&value)))),
                }
            }
            "to_ctx" => {
                let target = string_arg(name, &args)?;
                if !path::is_valid(&target) {
                    return Err(failed(format!("invalid context path '{target}'")));
                }
                self.push(Effect::SetContext {
                    path: target,
                    value: value.clone(),
                })?;
                Ok(value)
            }
            "to_results" => {
                let key = string_arg(name, &args)?;
                if key.is_empty() {
                    return Err(failed("result key must not be empty"));
                }
                // All-digit keys are the ordinals units are recorded under.
                if key.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(failed(format!("result key '{key}' is reserved for unit ordinals")));
                }
                self.push(Effect::SetResult {
                    key,
                    value: value.clone(),
                })?;
                Ok(value)
            }
            other => Err(failed(format!("unknown filter '{other}'"))),
        }
    }
}

fn string_arg(filter: &str, args: &[Value]) -> EvalResult<String> {
    match args {
        [Value::String(s)] => Ok(s.clone()),
        _ => Err(failed(format!("{filter} expects a single string argument"))),
    }
}

fn map_member<'a>(map: &'a Map<String, Value>, key: &Value) -> Option<&'a Value> {
    match key {
        Value::String(s) => map.get(s),
        Value::Number(n) => map.get(&n.to_string()),
        _ => None,
    }
}

fn member<'a>(base: Base<'a>, key: &Value) -> Option<&'a Value> {
    match base {
        Base::Map(map) => map_member(map, key),
        Base::Value(Value::Object(map)) => map_member(map, key),
        Base::Value(Value::Array(items)) => {
            let index = match key {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            }?;
            let len = items.len() as i64;
            let index = if index < 0 { index + len } else { index };
            if index < 0 {
                None
            } else {
                items.get(index as usize)
            }
        }
        Base::Value(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Value semantics
// ---------------------------------------------------------------------------

/// Python-like truthiness: null, false, zero, and empty containers are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Text form used when splicing a value into a template string.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn as_num(value: &Value) -> Option<Num> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(Num::Int)
            .or_else(|| n.as_f64().map(Num::Float)),
        _ => None,
    }
}

fn float(f: f64) -> EvalResult<Value> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| failed("result is not a finite number"))
}

fn to_int(value: &Value) -> EvalResult<Value> {
    match value {
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        Value::Number(_) => match as_num(value) {
            Some(Num::Int(i)) => Ok(Value::from(i)),
            Some(Num::Float(f)) => Ok(Value::from(f.trunc() as i64)),
            None => Err(failed("not a number")),
        },
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Value::from(i));
            }
            s.parse::<f64>()
                .map(|f| Value::from(f.trunc() as i64))
                .map_err(|_| failed(format!("cannot convert '{s}' to int")))
        }
        other => Err(failed(format!("cannot convert {} to int", type_name(other)))),
    }
}

fn to_float(value: &Value) -> EvalResult<Value> {
    match value {
        Value::Bool(b) => float(if *b { 1.0 } else { 0.0 }),
        Value::Number(_) => match as_num(value) {
            Some(n) => float(n.as_f64()),
            None => Err(failed("not a number")),
        },
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| failed(format!("cannot convert '{s}' to float")))
            .and_then(float),
        other => Err(failed(format!("cannot convert {} to float", type_name(other)))),
    }
}

/// Equality that treats `1` and `1.0` as equal.
fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (as_num(lhs), as_num(rhs)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
        (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => match (as_num(lhs), as_num(rhs)) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => Some(a.cmp(&b)),
            (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()),
            _ => None,
        },
    }
}

fn contains(haystack: &Value, needle: &Value) -> EvalResult<bool> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| loose_eq(item, needle))),
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            _ => Ok(false),
        },
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            other => Err(failed(format!(
                "'in <string>' requires a string, got {}",
                type_name(other)
            ))),
        },
        other => Err(failed(format!("'in' is not supported on {}", type_name(other)))),
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> EvalResult<Value> {
    match op {
        BinaryOp::Or => Ok(if truthy(&lhs) { lhs } else { rhs }),
        BinaryOp::And => Ok(if truthy(&lhs) { rhs } else { lhs }),
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(&lhs, &rhs))),
        BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(&lhs, &rhs))),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ord = compare(&lhs, &rhs).ok_or_else(|| {
                failed(format!(
                    "cannot compare {} with {}",
                    type_name(&lhs),
                    type_name(&rhs)
                ))
            })?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::LtEq => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinaryOp::In => contains(&rhs, &lhs).map(Value::Bool),
        BinaryOp::NotIn => contains(&rhs, &lhs).map(|found| Value::Bool(!found)),
        BinaryOp::Concat => Ok(Value::String(format!("{}{}", to_text(&lhs), to_text(&rhs)))),
        BinaryOp::Add => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
            (Value::Array(mut a), Value::Array(b)) => {
                a.extend(b);
                Ok(Value::Array(a))
            }
            (a, b) => arithmetic(op, &a, &b),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod => {
            arithmetic(op, &lhs, &rhs)
        }
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    let (a, b) = match (as_num(lhs), as_num(rhs)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(failed(format!(
                "unsupported operands for {}: {} and {}",
                op.symbol(),
                type_name(lhs),
                type_name(rhs)
            )))
        }
    };
    match (op, a, b) {
        (BinaryOp::Div, _, _) => {
            let divisor = b.as_f64();
            if divisor == 0.0 {
                return Err(failed("division by zero"));
            }
            float(a.as_f64() / divisor)
        }
        (_, Num::Int(x), Num::Int(y)) => int_arithmetic(op, x, y),
        _ => float_arithmetic(op, a.as_f64(), b.as_f64()),
    }
}

fn int_arithmetic(op: BinaryOp, x: i64, y: i64) -> EvalResult<Value> {
    let overflow = || failed("integer overflow");
    let result = match op {
        BinaryOp::Add => x.checked_add(y).ok_or_else(overflow)?,
        BinaryOp::Sub => x.checked_sub(y).ok_or_else(overflow)?,
        BinaryOp::Mul => x.checked_mul(y).ok_or_else(overflow)?,
        BinaryOp::FloorDiv | BinaryOp::Mod if y == 0 => {
            return Err(failed("division by zero"));
        }
        BinaryOp::FloorDiv => {
            let q = x.checked_div(y).ok_or_else(overflow)?;
            if (x % y != 0) && ((x < 0) != (y < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinaryOp::Mod => {
            let r = x.checked_rem(y).ok_or_else(overflow)?;
            if r != 0 && ((r < 0) != (y < 0)) {
                r + y
            } else {
                r
            }
        }
        other => return Err(failed(format!("'{}' is not arithmetic", other.symbol()))),
    };
    Ok(Value::from(result))
}

fn float_arithmetic(op: BinaryOp, x: f64, y: f64) -> EvalResult<Value> {
    match op {
        BinaryOp::Add => float(x + y),
        BinaryOp::Sub => float(x - y),
        BinaryOp::Mul => float(x * y),
        BinaryOp::FloorDiv | BinaryOp::Mod if y == 0.0 => Err(failed("division by zero")),
        BinaryOp::FloorDiv => float((x / y).floor()),
        BinaryOp::Mod => float(x - y * (x / y).floor()),
        other => Err(failed(format!("'{}' is not arithmetic", other.symbol()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expression;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn eval_in(source: &str, ctx: &Map<String, Value>, results: &Map<String, Value>) -> EvalResult<Value> {
        let expr = parse_expression(source).unwrap();
        Evaluator::read_only(Scope::from_maps(ctx, results)).eval(&expr)
    }

    fn eval(source: &str) -> Value {
        let ctx = map(json!({
            "n": 3,
            "x": 2.5,
            "name": "BaTiO3",
            "flags": {"converged": false},
            "items": [10, 20, 30],
        }));
        let results = map(json!({"0": {"energy": -1.5}}));
        eval_in(source, &ctx, &results).unwrap()
    }

    #[test]
    fn reads_context_paths() {
        assert_eq!(eval("ctx.n"), json!(3));
        assert_eq!(eval("ctx.flags.converged"), json!(false));
        assert_eq!(eval("ctx.items.1"), json!(20));
        assert_eq!(eval("ctx.items[-1]"), json!(30));
        assert_eq!(eval("ctx['name']"), json!("BaTiO3"));
    }

    #[test]
    fn reads_results_by_ordinal() {
        assert_eq!(eval("results.0.energy"), json!(-1.5));
        assert_eq!(eval("results[0].energy"), json!(-1.5));
    }

    #[test]
    fn missing_path_is_an_error() {
        let ctx = Map::new();
        let results = Map::new();
        assert!(matches!(
            eval_in("ctx.nope", &ctx, &results),
            Err(EvalError::Missing(_))
        ));
    }

    #[test]
    fn default_recovers_missing_paths() {
        assert_eq!(eval("ctx.nope | default(7)"), json!(7));
        assert_eq!(eval("ctx.n | default(7)"), json!(3));
    }

    #[test]
    fn outputs_unbound_outside_postprocess() {
        let ctx = Map::new();
        let results = Map::new();
        assert!(matches!(
            eval_in("outputs.x", &ctx, &results),
            Err(EvalError::Failed(_))
        ));
    }

    #[test]
    fn integer_and_float_arithmetic() {
        assert_eq!(eval("ctx.n + 1"), json!(4));
        assert_eq!(eval("ctx.n * ctx.x"), json!(7.5));
        assert_eq!(eval("7 / 2"), json!(3.5));
        assert_eq!(eval("7 // 2"), json!(3));
        assert_eq!(eval("-7 // 2"), json!(-4));
        assert_eq!(eval("-7 % 3"), json!(2));
        assert_eq!(eval("7.5 % 2"), json!(1.5));
        assert_eq!(eval("-ctx.n"), json!(-3));
    }

    #[test]
    fn division_by_zero_fails() {
        let ctx = Map::new();
        let results = Map::new();
        assert!(eval_in("1 / 0", &ctx, &results).is_err());
        assert!(eval_in("1 // 0", &ctx, &results).is_err());
        assert!(eval_in("1 % 0", &ctx, &results).is_err());
    }

    #[test]
    fn comparison_and_membership() {
        assert_eq!(eval("ctx.n < 5"), json!(true));
        assert_eq!(eval("ctx.n == 3.0"), json!(true));
        assert_eq!(eval("'Ti' in ctx.name"), json!(true));
        assert_eq!(eval("20 in ctx.items"), json!(true));
        assert_eq!(eval("'converged' not in ctx.flags"), json!(false));
    }

    #[test]
    fn boolean_operators_short_circuit() {
        // The right side would fail if evaluated.
        assert_eq!(eval("true or ctx.nope"), json!(true));
        assert_eq!(eval("false and ctx.nope"), json!(false));
        assert_eq!(eval("ctx.n and ctx.name"), json!("BaTiO3"));
        assert_eq!(eval("not ctx.flags.converged"), json!(true));
    }

    #[test]
    fn concatenation_and_addition() {
        assert_eq!(eval("ctx.name ~ '-' ~ ctx.n"), json!("BaTiO3-3"));
        assert_eq!(eval("'a' + 'b'"), json!("ab"));
        assert_eq!(eval("[1] + [2]"), json!([1, 2]));
    }

    #[test]
    fn read_filters() {
        assert_eq!(eval("ctx.items | length"), json!(3));
        assert_eq!(eval("ctx.x | int"), json!(2));
        assert_eq!(eval("'4' | int + 1"), json!(5));
        assert_eq!(eval("ctx.n | float"), json!(3.0));
        assert_eq!(eval("ctx.n | string"), json!("3"));
        assert_eq!(eval("ctx.items | bool"), json!(true));
        assert_eq!(eval("ctx.flags | keys"), json!(["converged"]));
        assert_eq!(eval("-2 | abs"), json!(-2));
        assert_eq!(eval("(-2) | abs"), json!(2));
        assert_eq!(eval("3.14159 | round(2)"), json!(3.14));
    }

    #[test]
    fn literals_evaluate_to_values() {
        assert_eq!(
            eval("{'a': ctx.n, 'b': [none, true]}"),
            json!({"a": 3, "b": [null, true]})
        );
    }

    #[test]
    fn write_filters_buffer_effects() {
        let ctx = map(json!({"n": 1}));
        let results = Map::new();
        let expr = parse_expression("(ctx.n + 1) | to_ctx('n') | to_results('count')").unwrap();
        let mut effects = Vec::new();
        let value = Evaluator::with_effects(Scope::from_maps(&ctx, &results), &mut effects)
            .eval(&expr)
            .unwrap();
        assert_eq!(value, json!(2));
        assert_eq!(
            effects,
            vec![
                Effect::SetContext {
                    path: "n".into(),
                    value: json!(2)
                },
                Effect::SetResult {
                    key: "count".into(),
                    value: json!(2)
                },
            ]
        );
        // The scope itself is untouched until effects are applied.
        assert_eq!(ctx.get("n"), Some(&json!(1)));
    }

    #[test]
    fn numeric_result_keys_are_reserved() {
        let ctx = Map::new();
        let results = Map::new();
        let expr = parse_expression("5 | to_results('1')").unwrap();
        let mut effects = Vec::new();
        let err = Evaluator::with_effects(Scope::from_maps(&ctx, &results), &mut effects)
            .eval(&expr)
            .unwrap_err();
        assert!(matches!(err, EvalError::Failed(ref msg) if msg.contains("reserved")));
        assert!(effects.is_empty());

        let expr = parse_expression("5 | to_results('step1')").unwrap();
        Evaluator::with_effects(Scope::from_maps(&ctx, &results), &mut effects)
            .eval(&expr)
            .unwrap();
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn write_filters_rejected_when_read_only() {
        let ctx = Map::new();
        let results = Map::new();
        assert!(matches!(
            eval_in("1 | to_ctx('a')", &ctx, &results),
            Err(EvalError::Failed(_))
        ));
    }

    #[test]
    fn apply_effects_in_order() {
        let mut ctx = Context::new();
        let mut results = Results::new();
        apply_effects(
            vec![
                Effect::SetContext {
                    path: "a.b".into(),
                    value: json!(1),
                },
                Effect::SetContext {
                    path: "a.b".into(),
                    value: json!(2),
                },
                Effect::SetResult {
                    key: "k".into(),
                    value: json!("v"),
                },
            ],
            &mut ctx,
            &mut results,
        )
        .unwrap();
        assert_eq!(ctx.get("a.b"), Some(&json!(2)));
        assert_eq!(results.get("k"), Some(&json!("v")));
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!(0.0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(!truthy(&json!({})));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([0])));
    }
}
