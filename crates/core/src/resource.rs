//! Resource files: locale/namespace-scoped nested string tables.
//!
//! A resource file is read and written as a whole snapshot. In memory it is
//! held as a [`ResourceTree`], an arena of nodes where every branch owns an
//! ordered list of string-keyed children. Lookups walk the tree explicitly
//! and report [`Lookup::NotFound`] instead of probing nullable values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::StoreError;

/// Index of a node inside a [`ResourceTree`] arena.
pub type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Clone, PartialEq)]
enum Node {
    /// Nested mapping, children in insertion order.
    Branch(Vec<(String, NodeId)>),
    /// Scalar value. Strings stay strings; anything else is kept verbatim
    /// and compared through its JSON serialization.
    Leaf(Value),
}

/// Result of resolving a dotted key path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// The path ends on a leaf; carries its text form.
    Found(std::borrow::Cow<'a, str>),
    /// The path ends on a nested mapping.
    NotALeaf,
    /// Some segment of the path does not exist.
    NotFound,
}

impl Lookup<'_> {
    /// The leaf text, if the lookup hit a leaf.
    pub fn value(&self) -> Option<&str> {
        match self {
            Lookup::Found(v) => Some(v.as_ref()),
            _ => None,
        }
    }
}

/// Owned tree of a resource file's contents.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceTree {
    nodes: Vec<Node>,
}

impl Default for ResourceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTree {
    /// An empty table (`{}`).
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::Branch(Vec::new())],
        }
    }

    /// Parse a whole-file snapshot. The root must be a JSON object.
    pub fn parse(bytes: &[u8], label: &str) -> Result<Self, StoreError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| StoreError::InvalidResource {
                path: label.to_string(),
                detail: e.to_string(),
            })?;
        Self::from_value(&value).ok_or_else(|| StoreError::InvalidResource {
            path: label.to_string(),
            detail: "root must be a JSON object".into(),
        })
    }

    /// Build a tree from a JSON value. Returns `None` unless `value` is an object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let mut tree = Self::new();
        tree.fill(ROOT, map);
        Some(tree)
    }

    fn fill(&mut self, parent: NodeId, map: &Map<String, Value>) {
        for (key, value) in map {
            let child = match value {
                Value::Object(inner) => {
                    let id = self.push(Node::Branch(Vec::new()));
                    self.fill(id, inner);
                    id
                }
                other => self.push(Node::Leaf(other.clone())),
            };
            if let Node::Branch(children) = &mut self.nodes[parent] {
                children.push((key.clone(), child));
            }
        }
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn child(&self, parent: NodeId, key: &str) -> Option<NodeId> {
        match &self.nodes[parent] {
            Node::Branch(children) => children
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, id)| *id),
            Node::Leaf(_) => None,
        }
    }

    /// Resolve a dotted key path such as `auth.login.title`.
    pub fn get(&self, path: &str) -> Lookup<'_> {
        let mut current = ROOT;
        for segment in path.split('.') {
            match self.child(current, segment) {
                Some(next) => current = next,
                None => return Lookup::NotFound,
            }
        }
        match &self.nodes[current] {
            Node::Leaf(value) => Lookup::Found(leaf_text(value)),
            Node::Branch(_) => Lookup::NotALeaf,
        }
    }

    /// Set a string value at a dotted key path, creating intermediate
    /// mappings. A leaf standing where a mapping is needed is replaced.
    pub fn set(&mut self, path: &str, value: impl Into<String>) {
        self.set_value(path, Value::String(value.into()));
    }

    /// Like [`ResourceTree::set`], keeping the leaf's JSON type.
    pub fn set_value(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = ROOT;
        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            match self.child(current, segment) {
                Some(existing) if last => {
                    self.nodes[existing] = Node::Leaf(value);
                    return;
                }
                Some(existing) => {
                    if matches!(self.nodes[existing], Node::Leaf(_)) {
                        self.nodes[existing] = Node::Branch(Vec::new());
                    }
                    current = existing;
                }
                None => {
                    let node = if last {
                        Node::Leaf(Value::String(String::new()))
                    } else {
                        Node::Branch(Vec::new())
                    };
                    let id = self.push(node);
                    if let Node::Branch(children) = &mut self.nodes[current] {
                        children.push((segment.to_string(), id));
                    }
                    if last {
                        self.nodes[id] = Node::Leaf(value);
                        return;
                    }
                    current = id;
                }
            }
        }
    }

    /// Every leaf's text keyed by its dotted path.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        self.leaves()
            .iter()
            .map(|(key, value)| (key.clone(), value_text(value)))
            .collect()
    }

    /// Every leaf keyed by its dotted path, with its JSON type intact.
    ///
    /// Diffs and conflict checks compare these, so `1` and `"1"` differ.
    pub fn leaves(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        self.flatten_into(ROOT, "", &mut out);
        out
    }

    fn flatten_into(&self, node: NodeId, prefix: &str, out: &mut BTreeMap<String, Value>) {
        match &self.nodes[node] {
            Node::Leaf(value) => {
                out.insert(prefix.to_string(), value.clone());
            }
            Node::Branch(children) => {
                for (key, child) in children {
                    let full = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    self.flatten_into(*child, &full, out);
                }
            }
        }
    }

    /// Number of leaves reachable from the root.
    pub fn key_count(&self) -> usize {
        self.count_leaves(ROOT)
    }

    fn count_leaves(&self, node: NodeId) -> usize {
        match &self.nodes[node] {
            Node::Leaf(_) => 1,
            Node::Branch(children) => children.iter().map(|(_, c)| self.count_leaves(*c)).sum(),
        }
    }

    /// Convert back to a JSON object.
    pub fn to_value(&self) -> Value {
        self.node_value(ROOT)
    }

    fn node_value(&self, node: NodeId) -> Value {
        match &self.nodes[node] {
            Node::Leaf(value) => value.clone(),
            Node::Branch(children) => {
                let mut map = Map::new();
                for (key, child) in children {
                    map.insert(key.clone(), self.node_value(*child));
                }
                Value::Object(map)
            }
        }
    }

    /// Pretty-printed JSON with a trailing newline, as written to disk.
    pub fn to_pretty_bytes(&self) -> Vec<u8> {
        // Serializing a `Value` cannot fail.
        let mut bytes = serde_json::to_vec_pretty(&self.to_value()).unwrap_or_default();
        bytes.push(b'\n');
        bytes
    }
}

/// Text form of a leaf: strings as-is, anything else as JSON.
pub fn value_text(value: &Value) -> String {
    leaf_text(value).into_owned()
}

fn leaf_text(value: &Value) -> std::borrow::Cow<'_, str> {
    match value {
        Value::String(s) => std::borrow::Cow::Borrowed(s.as_str()),
        other => std::borrow::Cow::Owned(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// File identity
// ---------------------------------------------------------------------------

/// Identity of a resource file: `(locale, namespace, path)`.
///
/// Files live at `<root>/<locale>/<namespace>.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFile {
    pub locale: String,
    pub namespace: String,
    pub path: PathBuf,
}

impl ResourceFile {
    /// Derive locale and namespace from a `<locale>/<namespace>.json` path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let unscoped = || StoreError::UnscopedPath(path.display().to_string());

        let namespace = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(unscoped)?;
        let locale = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(unscoped)?;

        Ok(Self {
            locale: locale.to_string(),
            namespace: namespace.to_string(),
            path: path.to_path_buf(),
        })
    }

    /// Build the identity for `locale`/`namespace` under a locales root.
    pub fn under(root: &Path, locale: &str, namespace: &str) -> Self {
        Self {
            locale: locale.to_string(),
            namespace: namespace.to_string(),
            path: root.join(locale).join(format!("{namespace}.json")),
        }
    }

    /// Path relative to the locales root (`<locale>/<namespace>.json`).
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.locale).join(format!("{}.json", self.namespace))
    }

    /// Read the raw snapshot bytes.
    pub fn read_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(std::fs::read(&self.path)?)
    }

    /// Read and parse the whole file.
    pub fn read_tree(&self) -> Result<ResourceTree, StoreError> {
        let bytes = self.read_bytes()?;
        ResourceTree::parse(&bytes, &self.path.display().to_string())
    }

    /// Write the whole file, creating parent directories.
    pub fn write_tree(&self, tree: &ResourceTree) -> Result<(), StoreError> {
        self.write_bytes(&tree.to_pretty_bytes())
    }

    /// Write raw snapshot bytes, creating parent directories.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "wrote resource file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ResourceTree {
        ResourceTree::from_value(&json!({
            "greeting": "hi",
            "auth": { "login": { "title": "Sign in", "button": "Go" } },
            "count": 3
        }))
        .unwrap()
    }

    #[test]
    fn test_get_explicit_results() {
        let tree = sample();
        assert_eq!(tree.get("greeting").value(), Some("hi"));
        assert_eq!(tree.get("auth.login.title").value(), Some("Sign in"));
        assert_eq!(tree.get("auth.login"), Lookup::NotALeaf);
        assert_eq!(tree.get("auth.logout"), Lookup::NotFound);
        assert_eq!(tree.get("greeting.deeper"), Lookup::NotFound);
        assert_eq!(tree.get("count").value(), Some("3"));
    }

    #[test]
    fn test_flatten_dotted_keys() {
        let flat = sample().flatten();
        let keys: Vec<&str> = flat.keys().map(|k| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["auth.login.button", "auth.login.title", "count", "greeting"]
        );
    }

    #[test]
    fn test_set_creates_and_replaces() {
        let mut tree = sample();
        tree.set("auth.logout.title", "Sign out");
        tree.set("greeting", "hello");
        tree.set("count.inner", "x");

        assert_eq!(tree.get("auth.logout.title").value(), Some("Sign out"));
        assert_eq!(tree.get("greeting").value(), Some("hello"));
        assert_eq!(tree.get("count.inner").value(), Some("x"));
        assert_eq!(tree.get("count"), Lookup::NotALeaf);
    }

    #[test]
    fn test_key_count_ignores_replaced_subtrees() {
        let mut tree = sample();
        assert_eq!(tree.key_count(), 4);
        tree.set("auth", "plain");
        assert_eq!(tree.key_count(), 3);
        assert_eq!(tree.key_count(), tree.flatten().len());
    }

    #[test]
    fn test_leaves_keep_json_type() {
        let number = ResourceTree::parse(br#"{"n":1,"flag":true}"#, "a.json").unwrap();
        let text = ResourceTree::parse(br#"{"n":"1","flag":"true"}"#, "b.json").unwrap();
        assert_eq!(number.flatten(), text.flatten());
        assert_ne!(number.leaves()["n"], text.leaves()["n"]);
        assert_ne!(number.leaves()["flag"], text.leaves()["flag"]);

        let mut tree = ResourceTree::new();
        tree.set_value("limits.max", json!(5));
        assert_eq!(tree.to_value()["limits"]["max"], json!(5));
    }

    #[test]
    fn test_to_value_preserves_non_string_scalars() {
        let tree = sample();
        let value = tree.to_value();
        assert_eq!(value["count"], json!(3));
        assert_eq!(value["auth"]["login"]["button"], json!("Go"));
    }

    #[test]
    fn test_parse_rejects_non_object_root() {
        let err = ResourceTree::parse(b"[1,2]", "x.json").unwrap_err();
        assert!(matches!(err, StoreError::InvalidResource { .. }));
        let err = ResourceTree::parse(b"{not json", "x.json").unwrap_err();
        assert!(matches!(err, StoreError::InvalidResource { .. }));
    }

    #[test]
    fn test_resource_file_identity() {
        let file = ResourceFile::from_path("/srv/locales/en-US/common.json").unwrap();
        assert_eq!(file.locale, "en-US");
        assert_eq!(file.namespace, "common");
        assert_eq!(file.relative_path(), PathBuf::from("en-US/common.json"));

        assert!(ResourceFile::from_path("common.json").is_err());
    }

    #[test]
    fn test_write_then_read_tree() {
        let dir = tempfile::tempdir().unwrap();
        let file = ResourceFile::under(dir.path(), "de-DE", "auth");
        file.write_tree(&sample()).unwrap();
        let back = file.read_tree().unwrap();
        assert_eq!(back.flatten(), sample().flatten());
    }
}
