//! Document model and the JSON transformations applied between fetch and emit.
//!
//! Documents stay as [`serde_json::Value`] end to end. With `preserve_order`
//! enabled the server's key order survives, and the serializer leaves
//! non-ASCII text and `/` unescaped, so bodies pass through byte for byte
//! apart from the fields stripped here.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key the server uses to encode an empty object key.
pub const EMPTY_KEY_SENTINEL: &str = "_empty_";

pub const ID_FIELD: &str = "_id";
pub const REV_FIELD: &str = "_rev";
pub const REVISIONS_FIELD: &str = "_revisions";
pub const REVS_INFO_FIELD: &str = "_revs_info";
pub const ATTACHMENTS_FIELD: &str = "_attachments";

/// Availability of one revision in a document's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionStatus {
    Available,
    Missing,
    Deleted,
    #[serde(other)]
    Unknown,
}

/// One `_revs_info` entry as returned by the server (newest first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionInfo {
    pub rev: String,
    pub status: RevisionStatus,
}

/// Aggregate dump file: `{"new_edits":false,"docs":[...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DumpEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_edits: Option<bool>,
    pub docs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AllDocs {
    rows: Option<Vec<AllDocsRow>>,
}

/// Document ids from an `_all_docs` body, in listing order.
///
/// Returns `None` when the body has no `rows` array.
pub fn parse_all_docs(body: &[u8]) -> Option<Vec<String>> {
    let listing: AllDocs = serde_json::from_slice(body).ok()?;
    listing
        .rows
        .map(|rows| rows.into_iter().map(|row| row.id).collect())
}

/// `_revs_info` of a document fetched with `revs_info=true`; empty if absent.
pub fn revisions_info(doc: &Value) -> Vec<RevisionInfo> {
    doc.get(REVS_INFO_FIELD)
        .cloned()
        .and_then(|info| serde_json::from_value(info).ok())
        .unwrap_or_default()
}

pub fn document_id(doc: &Value) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

pub fn document_rev(doc: &Value) -> Option<&str> {
    doc.get(REV_FIELD)
        .and_then(Value::as_str)
        .filter(|rev| !rev.is_empty())
}

/// Generation number `N` of a `N-hash` revision token; 0 when unparseable.
pub fn rev_generation(rev: &str) -> u64 {
    rev.split_once('-')
        .and_then(|(generation, _)| generation.parse().ok())
        .unwrap_or(0)
}

/// Rewrites every `_empty_` key, at any depth, to the empty-string key.
///
/// Keys keep their position. Applying it twice is the same as applying it once.
pub fn normalize_empty_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                normalize_empty_keys(child);
            }
            if map.contains_key(EMPTY_KEY_SENTINEL) {
                let entries = std::mem::take(map);
                *map = entries
                    .into_iter()
                    .map(|(key, child)| {
                        if key == EMPTY_KEY_SENTINEL {
                            (String::new(), child)
                        } else {
                            (key, child)
                        }
                    })
                    .collect();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(normalize_empty_keys),
        _ => {}
    }
}

fn remove_field(doc: &mut Value, field: &str) -> Option<Value> {
    doc.as_object_mut().and_then(|map| map.shift_remove(field))
}

pub fn strip_revs_info(doc: &mut Value) {
    remove_field(doc, REVS_INFO_FIELD);
}

/// Drops `_rev`, `_revisions` and `_revs_info`.
pub fn strip_history(doc: &mut Value) {
    remove_field(doc, REV_FIELD);
    remove_field(doc, REVISIONS_FIELD);
    remove_field(doc, REVS_INFO_FIELD);
}

pub fn strip_revisions(doc: &mut Value) {
    remove_field(doc, REVISIONS_FIELD);
}

pub fn strip_attachments(doc: &mut Value) {
    remove_field(doc, ATTACHMENTS_FIELD);
}

pub fn has_attachments(doc: &Value) -> bool {
    doc.get(ATTACHMENTS_FIELD)
        .and_then(Value::as_object)
        .is_some_and(|attachments| !attachments.is_empty())
}

pub fn attachment_names(doc: &Value) -> Vec<String> {
    doc.get(ATTACHMENTS_FIELD)
        .and_then(Value::as_object)
        .map(|attachments| attachments.keys().cloned().collect())
        .unwrap_or_default()
}

/// Replaces inline attachment payloads with `{"stub":true,"length":N}`.
///
/// The length is the decoded payload size; an entry whose data does not
/// decode keeps the `length` it already carried.
pub fn stub_attachments(doc: &mut Value) {
    let Some(attachments) = doc
        .get_mut(ATTACHMENTS_FIELD)
        .and_then(Value::as_object_mut)
    else {
        return;
    };

    for entry in attachments.values_mut() {
        let Some(entry) = entry.as_object_mut() else {
            continue;
        };
        let decoded_len = entry
            .shift_remove("data")
            .and_then(|data| data.as_str().map(decoded_length));
        let length = decoded_len
            .flatten()
            .map(Value::from)
            .or_else(|| entry.get("length").cloned())
            .unwrap_or(Value::from(0));
        entry.insert("length".to_string(), length);
        entry.insert("stub".to_string(), Value::Bool(true));
    }
}

fn decoded_length(data: &str) -> Option<usize> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .ok()
        .map(|bytes| bytes.len())
}

/// Compact serialization with unicode and slashes left unescaped.
pub fn to_compact(doc: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(doc)
}

/// Two-space indented serialization for human-readable dumps.
pub fn to_pretty(doc: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(doc)
}
