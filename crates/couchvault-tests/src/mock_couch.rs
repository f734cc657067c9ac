//! In-process stand-in for the database HTTP API, served over real TCP.
//!
//! Covers the requests couchvault makes: database listing, probe, create and
//! delete, `_all_docs`, document fetches with `revs`/`revs_info`/`rev`/
//! `attachments`, attachment downloads and document PUTs with revision checks.
//! Revision chains can carry `deleted` and `missing` entries, and a database
//! listing can be made to fail with a 500.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use couchvault::VaultConfig;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Status of one stored revision, as reported in `_revs_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevStatus {
    Available,
    Deleted,
    Missing,
}

impl RevStatus {
    fn as_str(self) -> &'static str {
        match self {
            RevStatus::Available => "available",
            RevStatus::Deleted => "deleted",
            RevStatus::Missing => "missing",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRevision {
    rev: String,
    status: RevStatus,
    /// `_id`, `_rev`, then the document fields.
    body: Value,
}

#[derive(Debug, Default)]
struct StoredDatabase {
    /// Revisions per document, oldest first.
    docs: BTreeMap<String, Vec<StoredRevision>>,
}

impl StoredDatabase {
    fn winner(&self, id: &str) -> Option<&StoredRevision> {
        self.docs
            .get(id)
            .and_then(|revisions| revisions.last())
            .filter(|revision| revision.status == RevStatus::Available)
    }

    fn live_ids(&self) -> Vec<&String> {
        self.docs
            .keys()
            .filter(|id| self.winner(id).is_some())
            .collect()
    }
}

#[derive(Debug, Default)]
struct ServerState {
    databases: BTreeMap<String, StoredDatabase>,
    failing_listings: HashSet<String>,
    /// `(db, id, rev)` of every `?rev=` fetch, in arrival order.
    revision_fetches: Vec<(String, String, String)>,
    counter: u64,
}

impl ServerState {
    fn append(&mut self, db: &str, id: &str, fields: Map<String, Value>, status: RevStatus) -> String {
        self.counter += 1;
        let counter = self.counter;
        let revisions = self
            .databases
            .entry(db.to_string())
            .or_default()
            .docs
            .entry(id.to_string())
            .or_default();
        let rev = format!("{}-{:08x}", revisions.len() + 1, counter);

        let mut body = Map::new();
        body.insert("_id".to_string(), Value::String(id.to_string()));
        body.insert("_rev".to_string(), Value::String(rev.clone()));
        for (key, value) in fields {
            if !matches!(key.as_str(), "_id" | "_rev" | "_revisions" | "_revs_info") {
                body.insert(key, value);
            }
        }
        revisions.push(StoredRevision {
            rev: rev.clone(),
            status,
            body: Value::Object(body),
        });
        rev
    }
}

type Shared = Arc<Mutex<ServerState>>;

/// A running mock server. Dropping it stops the server task.
pub struct MockCouch {
    addr: SocketAddr,
    state: Shared,
    handle: JoinHandle<()>,
}

impl MockCouch {
    pub async fn start() -> Self {
        let state = Shared::default();
        let router = router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock server");
        let addr = listener.local_addr().expect("mock server has no address");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router.into_make_service()).await;
        });
        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client settings pointing at this server.
    pub fn config(&self) -> VaultConfig {
        VaultConfig {
            host: self.addr.ip().to_string(),
            port: u32::from(self.addr.port()),
            timeout_secs: 5,
            ..VaultConfig::default()
        }
    }

    pub fn create_database(&self, db: &str) {
        self.state
            .lock()
            .unwrap()
            .databases
            .entry(db.to_string())
            .or_default();
    }

    /// Stores `doc` as a new available revision; returns its revision token.
    pub fn put_document(&self, db: &str, doc: Value) -> String {
        let id = doc["_id"].as_str().expect("seed document needs an _id").to_string();
        self.push_revision(db, &id, doc, RevStatus::Available)
    }

    /// Appends a revision with the given status to the chain of `id`.
    pub fn push_revision(&self, db: &str, id: &str, doc: Value, status: RevStatus) -> String {
        let fields = match doc {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        self.state.lock().unwrap().append(db, id, fields, status)
    }

    /// Makes `GET /{db}/_all_docs` answer 500.
    pub fn fail_listing(&self, db: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_listings
            .insert(db.to_string());
    }

    /// Revisions of `id` requested explicitly with `?rev=`.
    pub fn fetched_revisions(&self, db: &str, id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .revision_fetches
            .iter()
            .filter(|(d, i, _)| d == db && i == id)
            .map(|(_, _, rev)| rev.clone())
            .collect()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.state.lock().unwrap().databases.keys().cloned().collect()
    }

    pub fn document_ids(&self, db: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .databases
            .get(db)
            .map(|database| database.live_ids().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Current body of `id` without `_rev`, attachments included.
    pub fn document(&self, db: &str, id: &str) -> Option<Value> {
        let state = self.state.lock().unwrap();
        let mut body = state.databases.get(db)?.winner(id)?.body.clone();
        body.as_object_mut()?.shift_remove("_rev");
        Some(body)
    }

    pub fn revision_count(&self, db: &str, id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .databases
            .get(db)
            .and_then(|database| database.docs.get(id))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Drop for MockCouch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn router(state: Shared) -> Router {
    // `_all_dbs` and `_all_docs` share their position with path parameters,
    // so the parameter handlers dispatch them.
    Router::new()
        .route(
            "/:db",
            get(database_get).put(database_put).delete(database_delete),
        )
        .route("/:db/:id", get(document_get).put(document_put))
        .route("/:db/:id/:name", get(attachment_get))
        .with_state(state)
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn not_found(reason: &str) -> Response {
    reply(
        StatusCode::NOT_FOUND,
        json!({"error": "not_found", "reason": reason}),
    )
}

async fn database_get(State(state): State<Shared>, Path(db): Path<String>) -> Response {
    let state = state.lock().unwrap();
    if db == "_all_dbs" {
        let names: Vec<&String> = state.databases.keys().collect();
        return reply(StatusCode::OK, json!(names));
    }
    match state.databases.get(&db) {
        Some(database) => reply(
            StatusCode::OK,
            json!({"db_name": db, "doc_count": database.live_ids().len()}),
        ),
        None => not_found("Database does not exist."),
    }
}

async fn database_put(State(state): State<Shared>, Path(db): Path<String>) -> Response {
    let mut state = state.lock().unwrap();
    if state.databases.contains_key(&db) {
        return reply(
            StatusCode::PRECONDITION_FAILED,
            json!({"error": "file_exists", "reason": "The database could not be created, the file already exists."}),
        );
    }
    state.databases.insert(db, StoredDatabase::default());
    reply(StatusCode::CREATED, json!({"ok": true}))
}

async fn database_delete(State(state): State<Shared>, Path(db): Path<String>) -> Response {
    let mut state = state.lock().unwrap();
    match state.databases.remove(&db) {
        Some(_) => reply(StatusCode::OK, json!({"ok": true})),
        None => not_found("Database does not exist."),
    }
}

fn flag(params: &HashMap<String, String>, name: &str) -> bool {
    params.get(name).is_some_and(|value| value == "true")
}

fn decoded(data: &Value) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data.as_str()?)
        .ok()
}

/// Renders revision `index` of a chain the way the server would return it.
fn render(revisions: &[StoredRevision], index: usize, params: &HashMap<String, String>) -> Value {
    let mut doc = revisions[index].body.clone();
    let Some(fields) = doc.as_object_mut() else {
        return doc;
    };

    if !flag(params, "attachments") {
        if let Some(attachments) = fields.get_mut("_attachments").and_then(Value::as_object_mut) {
            for entry in attachments.values_mut() {
                let Some(entry) = entry.as_object_mut() else {
                    continue;
                };
                if let Some(data) = entry.shift_remove("data") {
                    let length = decoded(&data).map(|bytes| bytes.len()).unwrap_or(0);
                    entry.insert("length".to_string(), json!(length));
                }
                entry.insert("stub".to_string(), Value::Bool(true));
            }
        }
    }

    let chain = &revisions[..=index];
    if flag(params, "revs") {
        let ids: Vec<&str> = chain
            .iter()
            .rev()
            .map(|revision| revision.rev.split_once('-').map_or("", |(_, hash)| hash))
            .collect();
        fields.insert(
            "_revisions".to_string(),
            json!({"start": chain.len(), "ids": ids}),
        );
    }
    if flag(params, "revs_info") {
        let info: Vec<Value> = chain
            .iter()
            .rev()
            .map(|revision| json!({"rev": revision.rev, "status": revision.status.as_str()}))
            .collect();
        fields.insert("_revs_info".to_string(), Value::Array(info));
    }
    doc
}

async fn document_get(
    State(state): State<Shared>,
    Path((db, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(rev) = params.get("rev") {
        state
            .revision_fetches
            .push((db.clone(), id.clone(), rev.clone()));
    }
    let Some(database) = state.databases.get(&db) else {
        return not_found("Database does not exist.");
    };

    if id == "_all_docs" {
        if state.failing_listings.contains(&db) {
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "internal_server_error", "reason": "injected failure"}),
            );
        }
        let rows: Vec<Value> = database
            .live_ids()
            .into_iter()
            .filter_map(|id| {
                let rev = &database.winner(id)?.rev;
                Some(json!({"id": id, "key": id, "value": {"rev": rev}}))
            })
            .collect();
        return reply(
            StatusCode::OK,
            json!({"total_rows": rows.len(), "offset": 0, "rows": rows}),
        );
    }

    let Some(revisions) = database.docs.get(&id) else {
        return not_found("missing");
    };
    let index = match params.get("rev") {
        Some(rev) => revisions
            .iter()
            .position(|revision| &revision.rev == rev && revision.status == RevStatus::Available),
        None => database.winner(&id).map(|_| revisions.len() - 1),
    };
    match index {
        Some(index) => reply(StatusCode::OK, render(revisions, index, &params)),
        None => not_found("missing"),
    }
}

async fn document_put(
    State(state): State<Shared>,
    Path((db, id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let Ok(Value::Object(mut fields)) = serde_json::from_slice::<Value>(&body) else {
        return reply(
            StatusCode::BAD_REQUEST,
            json!({"error": "bad_request", "reason": "Request body must be a JSON object"}),
        );
    };

    let mut state = state.lock().unwrap();
    let Some(database) = state.databases.get(&db) else {
        return not_found("Database does not exist.");
    };

    if let Some(key) = fields
        .keys()
        .find(|key| key.starts_with('_') && !matches!(key.as_str(), "_id" | "_rev" | "_attachments" | "_deleted"))
    {
        return reply(
            StatusCode::BAD_REQUEST,
            json!({"error": "doc_validation", "reason": format!("Bad special document member: {}", key)}),
        );
    }

    let given = fields
        .shift_remove("_rev")
        .and_then(|rev| rev.as_str().map(str::to_string));
    let current = database.winner(&id).map(|revision| revision.rev.clone());
    if given != current {
        return reply(
            StatusCode::CONFLICT,
            json!({"error": "conflict", "reason": "Document update conflict."}),
        );
    }

    let rev = state.append(&db, &id, fields, RevStatus::Available);
    reply(StatusCode::CREATED, json!({"ok": true, "id": id, "rev": rev}))
}

async fn attachment_get(
    State(state): State<Shared>,
    Path((db, id, name)): Path<(String, String, String)>,
) -> Response {
    let state = state.lock().unwrap();
    let attachment = state
        .databases
        .get(&db)
        .and_then(|database| database.winner(&id))
        .and_then(|revision| revision.body.get("_attachments"))
        .and_then(|attachments| attachments.get(&name));
    let Some(attachment) = attachment else {
        return not_found("Document is missing attachment");
    };
    let Some(bytes) = attachment.get("data").and_then(decoded) else {
        return not_found("Document is missing attachment");
    };
    let content_type = attachment
        .get("content_type")
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream")
        .to_string();
    (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], bytes).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_render_history_metadata() {
        let server = MockCouch::start().await;
        server.put_document("db", json!({"_id": "a", "n": 1}));
        server.push_revision("db", "a", json!({"n": 2}), RevStatus::Deleted);
        server.push_revision("db", "a", json!({"n": 3}), RevStatus::Available);

        let state = server.state.lock().unwrap();
        let revisions = &state.databases["db"].docs["a"];
        let params: HashMap<String, String> = [("revs", "true"), ("revs_info", "true")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let doc = render(revisions, 2, &params);

        assert_eq!(doc["_rev"], json!(revisions[2].rev));
        assert_eq!(doc["_revisions"]["start"], json!(3));
        let statuses: Vec<&str> = doc["_revs_info"]
            .as_array()
            .unwrap()
            .iter()
            .map(|info| info["status"].as_str().unwrap())
            .collect();
        assert_eq!(statuses, vec!["available", "deleted", "available"]);
    }

    #[tokio::test]
    async fn test_seed_helpers() {
        let server = MockCouch::start().await;
        server.create_database("empty");
        server.put_document("db", json!({"_id": "a", "x": 1}));

        assert_eq!(server.database_names(), vec!["db", "empty"]);
        assert_eq!(server.document_ids("db"), vec!["a"]);
        assert_eq!(server.document("db", "a"), Some(json!({"_id": "a", "x": 1})));
        assert_eq!(server.revision_count("db", "a"), 1);
        assert_eq!(server.config().port, u32::from(server.addr().port()));
    }
}
