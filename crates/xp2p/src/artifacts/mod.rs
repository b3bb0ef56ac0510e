//! Projection of role state into the transport engine's JSON documents.
//!
//! Each sync reads the current document, drops the entries owned by the
//! previous or next state, appends the rebuilt ones and keeps everything
//! else in place. Entries an operator added by hand survive every rewrite.

pub mod client;
pub mod server;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{json, Map, Value};

use crate::runtime;

pub const INBOUNDS_FILE: &str = "inbounds.json";
pub const OUTBOUNDS_FILE: &str = "outbounds.json";
pub const ROUTING_FILE: &str = "routing.json";
pub const LOGS_FILE: &str = "logs.json";

pub type Document = Map<String, Value>;

/// The files of one role's config directory.
#[derive(Debug, Clone)]
pub struct ConfigFiles {
    dir: PathBuf,
}

impl ConfigFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn inbounds(&self) -> PathBuf {
        self.dir.join(INBOUNDS_FILE)
    }

    pub fn outbounds(&self) -> PathBuf {
        self.dir.join(OUTBOUNDS_FILE)
    }

    pub fn routing(&self) -> PathBuf {
        self.dir.join(ROUTING_FILE)
    }

    pub fn logs(&self) -> PathBuf {
        self.dir.join(LOGS_FILE)
    }

    pub fn core(&self) -> [PathBuf; 4] {
        [self.inbounds(), self.outbounds(), self.routing(), self.logs()]
    }

    /// Core documents that do not exist yet.
    pub fn missing(&self) -> Vec<PathBuf> {
        self.core().into_iter().filter(|p| !p.is_file()).collect()
    }

    /// logs.json is only written when absent so operator tweaks stick.
    pub fn ensure_logs(&self) -> anyhow::Result<()> {
        let path = self.logs();
        if path.is_file() {
            return Ok(());
        }
        runtime::write_json_atomic(&path, &json!({ "log": { "loglevel": "warning" } }))
    }

    /// Deletes the whole config directory.
    pub fn purge(&self) -> anyhow::Result<bool> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", self.dir.display())),
        }
    }
}

pub fn load_document(path: &Path) -> anyhow::Result<Document> {
    match runtime::read_json::<Value>(path)? {
        None => Ok(Document::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => anyhow::bail!("invalid JSON in {}: expected an object", path.display()),
    }
}

pub fn write_document(path: &Path, doc: &Document) -> anyhow::Result<()> {
    runtime::write_json_atomic(path, doc)
}

/// Returns the object at `key`, replacing any non-object value.
pub(crate) fn object_mut<'a>(root: &'a mut Document, key: &str) -> &'a mut Document {
    let slot = root
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("slot was just made an object"),
    }
}

pub(crate) fn take_array(root: &mut Document, key: &str) -> Vec<Value> {
    match root.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

/// String or array-of-strings field as a list.
pub(crate) fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).map(str::trim).unwrap_or("")
}

/// Lowercased tag set for membership tests.
#[derive(Debug, Default, Clone)]
pub(crate) struct TagSet(BTreeSet<String>);

impl TagSet {
    pub fn insert(&mut self, tag: &str) {
        let key = tag.trim().to_lowercase();
        if !key.is_empty() {
            self.0.insert(key);
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(&tag.trim().to_lowercase())
    }
}

impl<'a> FromIterator<&'a str> for TagSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut set = Self::default();
        for tag in iter {
            set.insert(tag);
        }
        set
    }
}

/// Replaces the entries of `root[key]` selected by `owned` with `rebuilt`.
/// `rebuilt` goes first unless `append` is set.
pub(crate) fn splice_list(
    root: &mut Document,
    key: &str,
    owned: impl Fn(&Value) -> bool,
    rebuilt: Vec<Value>,
    append: bool,
) {
    let kept: Vec<Value> = take_array(root, key)
        .into_iter()
        .filter(|entry| !owned(entry))
        .collect();
    let merged = if append {
        kept.into_iter().chain(rebuilt).collect()
    } else {
        rebuilt.into_iter().chain(kept).collect()
    };
    root.insert(key.to_string(), Value::Array(merged));
}

/// `(tag, domain)` of every entry in `reverse.portals` or `reverse.bridges`.
pub(crate) fn reverse_entries(doc: &Document, kind: &str) -> Vec<(String, String)> {
    doc.get("reverse")
        .and_then(|r| r.get(kind))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|e| (str_field(e, "tag").to_string(), str_field(e, "domain").to_string()))
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn routing_rules(doc: &Document) -> Vec<Value> {
    doc.get("routing")
        .and_then(|r| r.get("rules"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splice_keeps_foreign_entries() {
        let mut doc = Document::new();
        doc.insert(
            "rules".to_string(),
            json!([{"outboundTag": "mine"}, {"outboundTag": "theirs"}]),
        );
        splice_list(
            &mut doc,
            "rules",
            |v| str_field(v, "outboundTag") == "mine",
            vec![json!({"outboundTag": "mine", "ip": ["10.0.0.0/8"]})],
            false,
        );
        let rules = doc["rules"].as_array().expect("array");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0]["ip"][0], "10.0.0.0/8");
        assert_eq!(rules[1]["outboundTag"], "theirs");
    }

    #[test]
    fn object_mut_replaces_scalars() {
        let mut doc = Document::new();
        doc.insert("routing".to_string(), json!("broken"));
        object_mut(&mut doc, "routing").insert("domainStrategy".to_string(), json!("AsIs"));
        assert_eq!(doc["routing"]["domainStrategy"], "AsIs");
    }

    #[test]
    fn load_document_rejects_non_objects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("routing.json");
        assert!(load_document(&path).expect("missing").is_empty());
        std::fs::write(&path, "[1,2]").expect("write");
        let err = load_document(&path).expect_err("array");
        assert!(err.to_string().contains("routing.json"));
    }

    #[test]
    fn missing_lists_absent_core_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = ConfigFiles::new(dir.path().join("config-client"));
        assert_eq!(files.missing().len(), 4);
        files.ensure_logs().expect("logs");
        assert_eq!(files.missing().len(), 3);
        assert!(files.purge().expect("purge"));
        assert!(!files.purge().expect("second purge"));
    }

    #[test]
    fn string_list_accepts_scalar_and_array() {
        assert_eq!(string_list(Some(&json!("a"))), vec!["a"]);
        assert_eq!(string_list(Some(&json!(["a", 1, "b"]))), vec!["a", "b"]);
        assert!(string_list(None).is_empty());
    }
}
