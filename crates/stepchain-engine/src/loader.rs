//! Specification loading and `$ref` resolution.
//!
//! A [`DocumentLoader`] is created per load and passed in by the caller. It
//! fetches every document a chain refers to (local files relative to the
//! referring document, `#/...` fragments of the same document, and
//! `http(s)://` URLs) and caches them for the lifetime of that one loader.
//!
//! Resolution runs in two phases: an async fetch phase that pulls in every
//! referenced document, then a synchronous expansion that replaces each
//! `{"$ref": ...}` object with the referenced fragment.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use serde_json::Value;
use stepchain_types::{ChainError, Result};

use crate::spec::ChainSpec;
use crate::validation::{validate_or_raise, Diagnostic};

/// Maximum `$ref` nesting before a reference is reported as a cycle.
pub const MAX_REF_DEPTH: usize = 32;

const REF_KEY: &str = "$ref";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    /// Pick a format by file extension. Anything that is not `.yaml`/`.yml` is JSON.
    pub fn from_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".yaml") || lower.ends_with(".yml") {
            Format::Yaml
        } else {
            Format::Json
        }
    }

    pub fn parse(self, text: &str) -> Result<Value> {
        match self {
            Format::Json => Ok(serde_json::from_str(text)?),
            Format::Yaml => Ok(serde_yaml::from_str(text)?),
        }
    }
}

/// Where a document came from. Relative refs resolve against it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    File(PathBuf),
    Url(String),
    /// A document handed in as text; relative refs resolve against `base_dir`.
    Inline { base_dir: PathBuf },
}

impl Source {
    fn key(&self) -> String {
        match self {
            Source::File(p) => p.to_string_lossy().into_owned(),
            Source::Url(u) => u.clone(),
            Source::Inline { .. } => "<inline>".to_string(),
        }
    }

    /// Resolve the document part of a reference (everything before `#`).
    fn join(&self, reference: &str) -> Result<Source> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Ok(Source::Url(reference.to_string()));
        }
        match self {
            Source::Url(base) => {
                let base = reqwest::Url::parse(base).map_err(|e| ChainError::Http(e.to_string()))?;
                let joined = base
                    .join(reference)
                    .map_err(|e| ChainError::Http(format!("cannot resolve '{reference}': {e}")))?;
                Ok(Source::Url(joined.to_string()))
            }
            Source::File(path) => {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                Ok(Source::File(normalize(&dir.join(reference))))
            }
            Source::Inline { base_dir } => Ok(Source::File(normalize(&base_dir.join(reference)))),
        }
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Split `doc.yaml#/a/b` into `("doc.yaml", "/a/b")`.
fn split_ref(reference: &str) -> (&str, &str) {
    match reference.split_once('#') {
        Some((doc, fragment)) => (doc, fragment),
        None => (reference, ""),
    }
}

fn ref_target(value: &Value) -> Option<&str> {
    value.as_object()?.get(REF_KEY)?.as_str()
}

// ---------------------------------------------------------------------------
// DocumentLoader
// ---------------------------------------------------------------------------

/// Per-load document fetcher and cache.
pub struct DocumentLoader {
    client: Option<reqwest::Client>,
    documents: HashMap<String, Value>,
}

impl DocumentLoader {
    /// A loader that can fetch local files and `http(s)` URLs.
    pub fn new() -> Self {
        Self {
            client: Some(reqwest::Client::new()),
            documents: HashMap::new(),
        }
    }

    /// A loader restricted to local files.
    pub fn offline() -> Self {
        Self {
            client: None,
            documents: HashMap::new(),
        }
    }

    /// Number of distinct documents fetched so far.
    pub fn cached(&self) -> usize {
        self.documents.len()
    }

    /// Load a document from disk and resolve all of its references.
    pub async fn load_file(&mut self, path: &Path) -> Result<Value> {
        let source = Source::File(normalize(path));
        let root = self.fetch(&source).await?;
        self.resolve(root, source).await
    }

    /// Parse `text` and resolve its references. Relative file refs resolve
    /// against `base_dir`.
    pub async fn load_str(&mut self, text: &str, format: Format, base_dir: &Path) -> Result<Value> {
        let root = format.parse(text)?;
        let source = Source::Inline {
            base_dir: base_dir.to_path_buf(),
        };
        self.documents.insert(source.key(), root.clone());
        self.resolve(root, source).await
    }

    async fn fetch(&mut self, source: &Source) -> Result<Value> {
        let key = source.key();
        if let Some(doc) = self.documents.get(&key) {
            return Ok(doc.clone());
        }
        let doc = match source {
            Source::File(path) => {
                let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                    ChainError::Specification(format!("cannot read '{}': {e}", path.display()))
                })?;
                Format::from_path(&key).parse(&text)?
            }
            Source::Url(url) => {
                let client = self.client.as_ref().ok_or_else(|| {
                    ChainError::Specification(format!("remote reference '{url}' needs a network-enabled loader"))
                })?;
                tracing::debug!(url = %url, "Fetching remote document");
                let response = client
                    .get(url.as_str())
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| ChainError::Http(e.to_string()))?;
                let text = response
                    .text()
                    .await
                    .map_err(|e| ChainError::Http(e.to_string()))?;
                let path = reqwest::Url::parse(url)
                    .map(|u| u.path().to_string())
                    .unwrap_or_default();
                Format::from_path(&path).parse(&text)?
            }
            Source::Inline { .. } => {
                return Err(ChainError::Specification(
                    "inline document is not cached".into(),
                ))
            }
        };
        tracing::debug!(document = %key, "Loaded document");
        self.documents.insert(key, doc.clone());
        Ok(doc)
    }

    /// Fetch every document reachable through `$ref`s, then expand them.
    async fn resolve(&mut self, root: Value, source: Source) -> Result<Value> {
        let mut queue = VecDeque::from([source.clone()]);
        let mut seen = HashSet::from([source.key()]);
        while let Some(current) = queue.pop_front() {
            let doc = match self.documents.get(&current.key()) {
                Some(doc) => doc.clone(),
                None => self.fetch(&current).await?,
            };
            let mut refs = Vec::new();
            collect_refs(&doc, &mut refs);
            for reference in refs {
                let (doc_part, _) = split_ref(&reference);
                if doc_part.is_empty() {
                    continue;
                }
                let target = current.join(doc_part)?;
                if seen.insert(target.key()) {
                    self.fetch(&target).await?;
                    queue.push_back(target);
                }
            }
        }
        self.expand(&root, &source, 0)
    }

    fn expand(&self, value: &Value, source: &Source, depth: usize) -> Result<Value> {
        if let Some(reference) = ref_target(value) {
            if depth >= MAX_REF_DEPTH {
                return Err(ChainError::Specification(format!(
                    "reference cycle or nesting deeper than {MAX_REF_DEPTH} at '{reference}'"
                )));
            }
            let (doc_part, fragment) = split_ref(reference);
            let target = if doc_part.is_empty() {
                source.clone()
            } else {
                source.join(doc_part)?
            };
            let document = self.documents.get(&target.key()).ok_or_else(|| {
                ChainError::Specification(format!("unresolved reference '{reference}'"))
            })?;
            let fragment_value = if fragment.is_empty() || fragment == "/" {
                document
            } else {
                document.pointer(fragment).ok_or_else(|| {
                    ChainError::Specification(format!(
                        "reference '{reference}' points to nothing in '{}'",
                        target.key()
                    ))
                })?
            };
            return self.expand(fragment_value, &target, depth + 1);
        }

        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| self.expand(item, source, depth))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.expand(item, source, depth)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_refs(value: &Value, out: &mut Vec<String>) {
    if let Some(reference) = ref_target(value) {
        out.push(reference.to_string());
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_refs(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_refs(item, out)),
        _ => {}
    }
}

/// Load, resolve, parse and validate a chain file.
pub async fn load_chain(loader: &mut DocumentLoader, path: &Path) -> Result<(ChainSpec, Vec<Diagnostic>)> {
    let doc = loader.load_file(path).await?;
    let spec = ChainSpec::from_value(&doc)?;
    let diagnostics = validate_or_raise(&spec)?;
    tracing::info!(
        path = %path.display(),
        steps = spec.step_count(),
        documents = loader.cached(),
        "Chain loaded"
    );
    Ok((spec, diagnostics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(Format::from_path("chain.yaml"), Format::Yaml);
        assert_eq!(Format::from_path("chain.YML"), Format::Yaml);
        assert_eq!(Format::from_path("chain.json"), Format::Json);
        assert_eq!(Format::from_path("chain"), Format::Json);
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(normalize(Path::new("a/./b/../c.yaml")), PathBuf::from("a/c.yaml"));
    }

    #[tokio::test]
    async fn resolves_same_document_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = DocumentLoader::offline();
        let doc = loader
            .load_str(
                r##"{"defs": {"pw": {"calcjob": "pw"}}, "steps": [{"$ref": "#/defs/pw"}]}"##,
                Format::Json,
                dir.path(),
            )
            .await
            .unwrap();
        assert_eq!(doc["steps"], json!([{"calcjob": "pw"}]));
    }

    #[tokio::test]
    async fn resolves_refs_across_files() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "common.yaml",
            "structure:\n  cell: [[1, 0, 0], [0, 1, 0], [0, 0, 1]]\n  atoms:\n    - {symbols: Si, position: [0, 0, 0]}\n",
        );
        let main = write(
            dir.path(),
            "chain.json",
            r#"{"steps": [{"calcjob": "pw", "inputs": {"structure": {"value": {"$ref": "common.yaml#/structure"}}}}]}"#,
        );

        let mut loader = DocumentLoader::offline();
        let doc = loader.load_file(&main).await.unwrap();
        assert_eq!(
            doc["steps"][0]["inputs"]["structure"]["value"]["atoms"][0]["symbols"],
            json!("Si")
        );
        assert_eq!(loader.cached(), 2);
    }

    #[tokio::test]
    async fn nested_refs_resolve_relative_to_their_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        write(&dir.path().join("lib"), "leaf.json", r#"{"value": 42}"#);
        write(&dir.path().join("lib"), "mid.json", r#"{"inner": {"$ref": "leaf.json#/value"}}"#);
        let main = write(dir.path(), "main.json", r#"{"x": {"$ref": "lib/mid.json"}}"#);

        let mut loader = DocumentLoader::offline();
        let doc = loader.load_file(&main).await.unwrap();
        assert_eq!(doc, json!({"x": {"inner": 42}}));
    }

    #[tokio::test]
    async fn reference_cycle_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = DocumentLoader::offline();
        let err = loader
            .load_str(r##"{"a": {"$ref": "#/b"}, "b": {"$ref": "#/a"}}"##, Format::Json, dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[tokio::test]
    async fn missing_fragment_is_a_specification_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = DocumentLoader::offline();
        let err = loader
            .load_str(r##"{"a": {"$ref": "#/nope"}}"##, Format::Json, dir.path())
            .await
            .unwrap_err();
        assert!(err.is_specification());
    }

    #[tokio::test]
    async fn offline_loader_refuses_urls() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = DocumentLoader::offline();
        let err = loader
            .load_str(
                r#"{"a": {"$ref": "https://example.invalid/schema.json"}}"#,
                Format::Json,
                dir.path(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("network-enabled"), "{err}");
    }

    #[tokio::test]
    async fn load_chain_parses_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "chain.yaml",
            "steps:\n  - calculation: add\n    inputs:\n      x: 1\n",
        );
        let mut loader = DocumentLoader::offline();
        let (spec, _) = load_chain(&mut loader, &path).await.unwrap();
        assert_eq!(spec.steps.len(), 1);
    }
}
