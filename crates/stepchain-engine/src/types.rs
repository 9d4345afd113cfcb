//! Named type resolvers used to coerce raw input values into typed values.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use stepchain_types::TypedValue;

/// A raw value could not be converted into the requested type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct CoercionError(pub String);

impl CoercionError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

type Coerced = std::result::Result<Value, CoercionError>;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Converts a raw JSON value into the payload of one named type.
pub trait TypeResolver: Send + Sync {
    fn type_id(&self) -> &str;

    /// Returns the typed payload, or why `raw` does not fit.
    fn resolve(&self, raw: &Value) -> Coerced;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct TypeRegistry {
    resolvers: HashMap<String, Arc<dyn TypeResolver>>,
    aliases: HashMap<String, String>,
}

impl TypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            resolvers: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// The built-in scientific and scalar types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(StructureType);
        registry.register(CodeType);
        registry.register(PseudoType);
        registry.register(KpointsType);
        registry.register(DictType);
        registry.register(ListType);
        registry.register(IntType);
        registry.register(FloatType);
        registry.register(StrType);
        registry.register(BoolType);

        for (alias, target) in [
            ("core.structure", "structure"),
            ("core.code", "code"),
            ("core.array.kpoints", "kpoints"),
            ("core.dict", "dict"),
            ("core.list", "list"),
            ("core.int", "int"),
            ("core.float", "float"),
            ("core.str", "str"),
            ("core.bool", "bool"),
            ("upf", "pseudo"),
            ("pseudo.upf", "pseudo"),
        ] {
            registry.alias(alias, target);
        }
        registry
    }

    pub fn register(&mut self, resolver: impl TypeResolver + 'static) {
        self.resolvers
            .insert(resolver.type_id().to_string(), Arc::new(resolver));
    }

    pub fn alias(&mut self, alias: impl Into<String>, target: impl Into<String>) {
        self.aliases.insert(alias.into(), target.into());
    }

    /// Map an alias onto the id it stands for; unknown ids come back as-is.
    pub fn canonical<'a>(&'a self, type_id: &'a str) -> &'a str {
        self.aliases
            .get(type_id)
            .map(String::as_str)
            .unwrap_or(type_id)
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.resolvers.contains_key(self.canonical(type_id))
    }

    pub fn get(&self, type_id: &str) -> Option<&dyn TypeResolver> {
        self.resolvers.get(self.canonical(type_id)).map(|r| r.as_ref())
    }

    /// Type ids known to this registry, aliases excluded.
    pub fn type_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.resolvers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Whether `value` is already a typed value of one of `expected`.
    pub fn satisfies(&self, value: &Value, expected: &[String]) -> bool {
        TypedValue::type_of(value).is_some_and(|have| {
            let have = self.canonical(have);
            expected.iter().any(|want| self.canonical(want) == have)
        })
    }

    /// Convert `raw` into the first of `expected` that accepts it.
    ///
    /// Values already typed as one of `expected` pass through untouched.
    /// A value typed as something else is converted from its payload.
    pub fn coerce(&self, raw: &Value, expected: &[String]) -> Coerced {
        if self.satisfies(raw, expected) {
            return Ok(raw.clone());
        }

        let payload = match TypedValue::from_value(raw) {
            Some(typed) => typed.value,
            None => raw.clone(),
        };

        let mut reasons = Vec::new();
        for want in expected {
            let canonical = self.canonical(want);
            let Some(resolver) = self.resolvers.get(canonical) else {
                reasons.push(format!("no resolver registered for type '{want}'"));
                continue;
            };
            match resolver.resolve(&payload) {
                Ok(value) => return Ok(TypedValue::new(canonical, value).into_value()),
                Err(e) => reasons.push(format!("{canonical}: {e}")),
            }
        }
        Err(CoercionError(reasons.join("; ")))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.type_ids())
            .field("aliases", &self.aliases.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

fn vector3(value: &Value, what: &str) -> std::result::Result<[f64; 3], CoercionError> {
    let items = value
        .as_array()
        .filter(|a| a.len() == 3)
        .ok_or_else(|| CoercionError::new(format!("{what} must be a list of 3 numbers")))?;
    let mut out = [0.0; 3];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item
            .as_f64()
            .ok_or_else(|| CoercionError::new(format!("{what} must be a list of 3 numbers")))?;
    }
    Ok(out)
}

fn object<'a>(value: &'a Value, what: &str) -> std::result::Result<&'a Map<String, Value>, CoercionError> {
    value
        .as_object()
        .ok_or_else(|| CoercionError::new(format!("expected {what}, got {}", describe(value))))
}

// ---------------------------------------------------------------------------
// Built-in resolvers
// ---------------------------------------------------------------------------

/// A periodic atomic structure: `cell` (3x3 lattice vectors) and a non-empty
/// `atoms` list of `{symbols, position}`.
pub struct StructureType;

impl TypeResolver for StructureType {
    fn type_id(&self) -> &str {
        "structure"
    }

    fn resolve(&self, raw: &Value) -> Coerced {
        let map = object(raw, "a structure mapping")?;
        let cell = map
            .get("cell")
            .and_then(Value::as_array)
            .filter(|rows| rows.len() == 3)
            .ok_or_else(|| CoercionError::new("structure needs a 'cell' of 3 lattice vectors"))?;
        let cell = cell
            .iter()
            .map(|row| vector3(row, "each cell vector").map(|v| json!(v)))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let atoms = map
            .get("atoms")
            .and_then(Value::as_array)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| CoercionError::new("structure needs a non-empty 'atoms' list"))?;
        let mut sites = Vec::with_capacity(atoms.len());
        for (i, atom) in atoms.iter().enumerate() {
            let atom = object(atom, "an atom mapping")?;
            let symbol = atom
                .get("symbols")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| CoercionError::new(format!("atom {i} has no 'symbols'")))?;
            let position = atom
                .get("position")
                .ok_or_else(|| CoercionError::new(format!("atom {i} has no 'position'")))
                .and_then(|p| vector3(p, "atom position"))?;
            sites.push(json!({"symbols": symbol, "position": position}));
        }

        let mut out = Map::new();
        out.insert("cell".into(), Value::Array(cell));
        out.insert("atoms".into(), Value::Array(sites));
        if let Some(pbc) = map.get("pbc") {
            out.insert("pbc".into(), pbc.clone());
        }
        Ok(Value::Object(out))
    }
}

/// A code reference: a `label@computer` string or a numeric node id.
pub struct CodeType;

impl TypeResolver for CodeType {
    fn type_id(&self) -> &str {
        "code"
    }

    fn resolve(&self, raw: &Value) -> Coerced {
        match raw {
            Value::String(s) if !s.trim().is_empty() => Ok(Value::String(s.trim().to_string())),
            Value::Number(n) if n.is_i64() => Ok(raw.clone()),
            other => Err(CoercionError::new(format!(
                "expected a code label or node id, got {}",
                describe(other)
            ))),
        }
    }
}

/// A pseudopotential selection: `{group, element}`.
pub struct PseudoType;

impl TypeResolver for PseudoType {
    fn type_id(&self) -> &str {
        "pseudo"
    }

    fn resolve(&self, raw: &Value) -> Coerced {
        let map = object(raw, "a pseudopotential mapping")?;
        let field = |name: &str| {
            map.get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| CoercionError::new(format!("pseudopotential needs '{name}'")))
        };
        Ok(json!({"group": field("group")?, "element": field("element")?}))
    }
}

/// K-points: a 3-integer mesh (optionally with offset) or an explicit list of
/// 3-vectors.
pub struct KpointsType;

impl TypeResolver for KpointsType {
    fn type_id(&self) -> &str {
        "kpoints"
    }

    fn resolve(&self, raw: &Value) -> Coerced {
        let (mesh, offset) = match raw {
            Value::Array(items) if items.first().is_some_and(Value::is_array) => {
                let points = items
                    .iter()
                    .map(|p| vector3(p, "each k-point").map(|v| json!(v)))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                return Ok(json!({"kpoints": points}));
            }
            Value::Array(_) => (raw, None),
            Value::Object(map) => (
                map.get("mesh")
                    .ok_or_else(|| CoercionError::new("k-point mapping needs 'mesh'"))?,
                map.get("offset"),
            ),
            other => {
                return Err(CoercionError::new(format!(
                    "expected a k-point mesh, got {}",
                    describe(other)
                )))
            }
        };

        let mesh: Vec<u64> = mesh
            .as_array()
            .filter(|m| m.len() == 3)
            .and_then(|m| m.iter().map(Value::as_u64).collect::<Option<Vec<_>>>())
            .filter(|m| m.iter().all(|&n| n > 0))
            .ok_or_else(|| CoercionError::new("k-point mesh must be 3 positive integers"))?;
        let offset = match offset {
            Some(o) => vector3(o, "k-point offset")?,
            None => [0.0; 3],
        };
        Ok(json!({"mesh": mesh, "offset": offset}))
    }
}

pub struct DictType;

impl TypeResolver for DictType {
    fn type_id(&self) -> &str {
        "dict"
    }

    fn resolve(&self, raw: &Value) -> Coerced {
        object(raw, "a mapping").map(|m| Value::Object(m.clone()))
    }
}

pub struct ListType;

impl TypeResolver for ListType {
    fn type_id(&self) -> &str {
        "list"
    }

    fn resolve(&self, raw: &Value) -> Coerced {
        match raw {
            Value::Array(_) => Ok(raw.clone()),
            other => Err(CoercionError::new(format!("expected a list, got {}", describe(other)))),
        }
    }
}

pub struct IntType;

impl TypeResolver for IntType {
    fn type_id(&self) -> &str {
        "int"
    }

    fn resolve(&self, raw: &Value) -> Coerced {
        match raw {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(raw.clone()),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(json!(f as i64)),
                _ => Err(CoercionError::new(format!("{n} is not a whole number"))),
            },
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| CoercionError::new(format!("'{s}' is not an integer"))),
            other => Err(CoercionError::new(format!(
                "expected an integer, got {}",
                describe(other)
            ))),
        }
    }
}

pub struct FloatType;

impl TypeResolver for FloatType {
    fn type_id(&self) -> &str {
        "float"
    }

    fn resolve(&self, raw: &Value) -> Coerced {
        let parsed = match raw {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        parsed
            .filter(|f| f.is_finite())
            .map(Value::from)
            .ok_or_else(|| CoercionError::new(format!("expected a float, got {}", describe(raw))))
    }
}

pub struct StrType;

impl TypeResolver for StrType {
    fn type_id(&self) -> &str {
        "str"
    }

    fn resolve(&self, raw: &Value) -> Coerced {
        match raw {
            Value::String(_) => Ok(raw.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(CoercionError::new(format!("expected a string, got {}", describe(other)))),
        }
    }
}

pub struct BoolType;

impl TypeResolver for BoolType {
    fn type_id(&self) -> &str {
        "bool"
    }

    fn resolve(&self, raw: &Value) -> Coerced {
        let parsed = match raw {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        };
        parsed
            .map(Value::Bool)
            .ok_or_else(|| CoercionError::new(format!("expected a boolean, got {raw}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn aliases_resolve_to_builtins() {
        let registry = TypeRegistry::with_builtins();
        assert_eq!(registry.canonical("core.int"), "int");
        assert_eq!(registry.canonical("upf"), "pseudo");
        assert_eq!(registry.canonical("mystery"), "mystery");
        assert!(registry.contains("core.array.kpoints"));
        assert!(!registry.contains("mystery"));
    }

    #[test]
    fn coerce_wraps_payload_with_type_tag() {
        let registry = TypeRegistry::with_builtins();
        let out = registry.coerce(&json!("42"), &types(&["core.int"])).unwrap();
        assert_eq!(out, json!({"@type": "int", "value": 42}));
    }

    #[test]
    fn already_typed_values_pass_through() {
        let registry = TypeRegistry::with_builtins();
        let typed = json!({"@type": "int", "value": 7});
        assert_eq!(registry.coerce(&typed, &types(&["core.int"])).unwrap(), typed);
    }

    #[test]
    fn typed_values_convert_from_payload() {
        let registry = TypeRegistry::with_builtins();
        let typed = json!({"@type": "int", "value": 7});
        let out = registry.coerce(&typed, &types(&["float"])).unwrap();
        assert_eq!(out, json!({"@type": "float", "value": 7.0}));
    }

    #[test]
    fn first_accepting_type_wins() {
        let registry = TypeRegistry::with_builtins();
        let out = registry
            .coerce(&json!("abc"), &types(&["int", "str"]))
            .unwrap();
        assert_eq!(out, json!({"@type": "str", "value": "abc"}));
    }

    #[test]
    fn failures_list_every_reason() {
        let registry = TypeRegistry::with_builtins();
        let err = registry
            .coerce(&json!("abc"), &types(&["int", "unknown"]))
            .unwrap_err();
        assert!(err.0.contains("int: 'abc' is not an integer"));
        assert!(err.0.contains("no resolver registered for type 'unknown'"));
    }

    #[test]
    fn structure_requires_cell_and_atoms() {
        let ok = StructureType
            .resolve(&json!({
                "cell": [[5.4, 0, 0], [0, 5.4, 0], [0, 0, 5.4]],
                "atoms": [{"symbols": "Si", "position": [0, 0, 0]}],
            }))
            .unwrap();
        assert_eq!(ok["atoms"][0]["symbols"], "Si");
        assert_eq!(ok["cell"][1][1], 5.4);

        let err = StructureType
            .resolve(&json!({"cell": [[1, 0, 0]], "atoms": []}))
            .unwrap_err();
        assert!(err.0.contains("3 lattice vectors"));
    }

    #[test]
    fn kpoints_accept_mesh_and_explicit_list() {
        assert_eq!(
            KpointsType.resolve(&json!([4, 4, 4])).unwrap(),
            json!({"mesh": [4, 4, 4], "offset": [0.0, 0.0, 0.0]})
        );
        assert_eq!(
            KpointsType
                .resolve(&json!({"mesh": [2, 2, 1], "offset": [0.5, 0.5, 0]}))
                .unwrap(),
            json!({"mesh": [2, 2, 1], "offset": [0.5, 0.5, 0.0]})
        );
        assert_eq!(
            KpointsType.resolve(&json!([[0, 0, 0], [0.5, 0, 0]])).unwrap(),
            json!({"kpoints": [[0.0, 0.0, 0.0], [0.5, 0.0, 0.0]]})
        );
        assert!(KpointsType.resolve(&json!([4, 0, 4])).is_err());
    }

    #[test]
    fn scalar_conversions() {
        assert_eq!(IntType.resolve(&json!(3.0)).unwrap(), json!(3));
        assert!(IntType.resolve(&json!(3.5)).is_err());
        assert!(IntType.resolve(&json!(true)).is_err());
        assert_eq!(FloatType.resolve(&json!("1e-3")).unwrap(), json!(0.001));
        assert_eq!(BoolType.resolve(&json!("Yes")).unwrap(), json!(true));
        assert_eq!(StrType.resolve(&json!(12)).unwrap(), json!("12"));
        assert_eq!(
            PseudoType
                .resolve(&json!({"group": "SSSP", "element": "Si"}))
                .unwrap(),
            json!({"group": "SSSP", "element": "Si"})
        );
        assert_eq!(CodeType.resolve(&json!(" pw@localhost ")).unwrap(), json!("pw@localhost"));
    }
}
