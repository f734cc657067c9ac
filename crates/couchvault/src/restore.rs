//! Restore engine: replays a dump into a target database as per-document upserts.
//!
//! Strict at database granularity (probe, drop, create and the non-empty
//! guard abort the run) and best-effort at document granularity (a rejected
//! PUT is recorded and the loop moves on).

use crate::client::{Couch, DocumentQuery};
use crate::error::ClientError;
use crate::json::{self, DumpEnvelope};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("dump source {path} is not usable: {msg}")]
    Source { path: PathBuf, msg: String },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported response when checking db '{database}' status (http status code = {status})")]
    Probe { database: String, status: u16 },
    #[error("unsupported response when deleting db '{database}' (http status code = {status})")]
    Delete { database: String, status: u16 },
    #[error("unsupported response when creating db '{database}' (http status code = {status})")]
    Create { database: String, status: u16 },
    #[error("db '{database}' has {doc_count} documents; refusing to restore without force")]
    NotEmpty { database: String, doc_count: u64 },
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Where the documents to restore come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    /// One envelope file exposing `docs`.
    Aggregate(PathBuf),
    /// A directory of per-document `.json` files.
    Directory(PathBuf),
}

impl RestoreSource {
    pub fn path(&self) -> &Path {
        match self {
            RestoreSource::Aggregate(path) | RestoreSource::Directory(path) => path,
        }
    }

    /// Checks the source exists with the right type, without reading it.
    pub fn validate(&self) -> Result<(), RestoreError> {
        let (ok, expected) = match self {
            RestoreSource::Aggregate(path) => (path.is_file(), "a readable file"),
            RestoreSource::Directory(path) => (path.is_dir(), "a directory"),
        };
        if ok {
            Ok(())
        } else {
            Err(RestoreError::Source {
                path: self.path().to_path_buf(),
                msg: format!("expected {}", expected),
            })
        }
    }

    pub async fn load(&self) -> Result<DumpEnvelope, RestoreError> {
        match self {
            RestoreSource::Aggregate(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| source_error(path, e))?;
                serde_json::from_slice(&bytes).map_err(|source| RestoreError::Parse {
                    path: path.clone(),
                    source,
                })
            }
            RestoreSource::Directory(dir) => load_directory(dir).await,
        }
    }
}

fn source_error(path: &Path, err: std::io::Error) -> RestoreError {
    RestoreError::Source {
        path: path.to_path_buf(),
        msg: err.to_string(),
    }
}

async fn load_directory(dir: &Path) -> Result<DumpEnvelope, RestoreError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| source_error(dir, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| source_error(dir, e))?
    {
        let path = entry.path();
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if is_file && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();

    let mut docs = Vec::with_capacity(files.len());
    for path in files {
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| source_error(&path, e))?;
        let doc: Value = serde_json::from_slice(&bytes)
            .map_err(|source| RestoreError::Parse { path, source })?;
        docs.push(doc);
    }

    // Revisions of one document replay oldest first.
    docs.sort_by(|a, b| {
        let key = |doc: &Value| {
            (
                json::document_id(doc).unwrap_or_default().to_string(),
                json::document_rev(doc).map(json::rev_generation).unwrap_or(0),
            )
        };
        key(a).cmp(&key(b))
    });

    Ok(DumpEnvelope {
        new_edits: Some(false),
        docs,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Delete and recreate the database if it exists.
    pub drop: bool,
    /// Restore into a database that already holds documents.
    pub force: bool,
    pub inline_attachments: bool,
}

/// Outcome of the PUT of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentOutcome {
    Restored { id: String },
    Failed { id: String, reason: String },
    /// The server answered with neither `ok` nor `error`.
    Indeterminate { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFailure {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub database: String,
    pub created: bool,
    pub documents: usize,
    pub restored: usize,
    pub indeterminate: usize,
    pub failures: Vec<DocumentFailure>,
}

impl RestoreReport {
    fn record(&mut self, outcome: DocumentOutcome) {
        match outcome {
            DocumentOutcome::Restored { .. } => self.restored += 1,
            DocumentOutcome::Indeterminate { .. } => self.indeterminate += 1,
            DocumentOutcome::Failed { id, reason } => {
                self.failures.push(DocumentFailure { id, reason })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct DatabaseInfo {
    #[serde(default)]
    doc_count: u64,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    ok: Option<Value>,
    error: Option<Value>,
    reason: Option<Value>,
    id: Option<String>,
}

fn value_text(value: &Value) -> String {
    value
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// Maps a PUT response body to an outcome for document `id`.
pub fn classify_put_response(id: &str, body: &[u8]) -> DocumentOutcome {
    let Ok(response) = serde_json::from_slice::<PutResponse>(body) else {
        return DocumentOutcome::Indeterminate { id: id.to_string() };
    };

    if let Some(error) = &response.error {
        DocumentOutcome::Failed {
            id: response.id.unwrap_or_else(|| id.to_string()),
            reason: response.reason.as_ref().map(value_text).unwrap_or_else(|| value_text(error)),
        }
    } else if response.ok.is_some() {
        DocumentOutcome::Restored {
            id: response.id.unwrap_or_else(|| id.to_string()),
        }
    } else {
        DocumentOutcome::Indeterminate { id: id.to_string() }
    }
}

/// One restore run into one database.
pub struct Restorer {
    couch: Couch,
    database: String,
    source: RestoreSource,
    options: RestoreOptions,
}

impl Restorer {
    pub fn new(couch: Couch, database: &str, source: RestoreSource, options: RestoreOptions) -> Self {
        Self {
            couch,
            database: database.to_string(),
            source,
            options,
        }
    }

    pub async fn run(&self) -> Result<RestoreReport, RestoreError> {
        self.source.validate()?;
        // Parse before touching the target so a broken dump never costs a drop.
        let envelope = self.source.load().await?;

        let mut report = RestoreReport {
            database: self.database.clone(),
            documents: envelope.docs.len(),
            ..RestoreReport::default()
        };
        report.created = self.prepare_database().await?;

        tracing::info!(
            "Restoring {} documents into db '{}'",
            envelope.docs.len(),
            self.database
        );
        for doc in envelope.docs {
            let outcome = self.restore_document(doc).await;
            match &outcome {
                DocumentOutcome::Restored { id } => tracing::info!("SUCCESS: [{}] restored", id),
                DocumentOutcome::Failed { id, reason } => {
                    tracing::warn!("ERROR: [{}] = {}", id, reason)
                }
                DocumentOutcome::Indeterminate { id } => {
                    tracing::debug!("[{}] restore result unknown", id)
                }
            }
            report.record(outcome);
        }

        tracing::info!(
            database = %self.database,
            restored = report.restored,
            failed = report.failures.len(),
            indeterminate = report.indeterminate,
            "Restore finished"
        );
        Ok(report)
    }

    /// Probes, optionally drops, guards and creates the target. Returns whether it was created.
    async fn prepare_database(&self) -> Result<bool, RestoreError> {
        let db = self.database.as_str();
        tracing::info!("Checking db '{}'", db);

        let probe = self.couch.database_info(db).await?;
        let (mut exists, mut doc_count) = match probe.status {
            200 => {
                let info: DatabaseInfo = probe.json()?;
                tracing::info!("db '{}' has {} documents", db, info.doc_count);
                (true, info.doc_count)
            }
            404 => (false, 0),
            status => {
                return Err(RestoreError::Probe {
                    database: db.to_string(),
                    status,
                })
            }
        };

        if self.options.drop && exists {
            tracing::info!("Deleting db '{}'", db);
            let response = self.couch.delete_database(db).await?;
            if !matches!(response.status, 200 | 202) {
                return Err(RestoreError::Delete {
                    database: db.to_string(),
                    status: response.status,
                });
            }
            exists = false;
            doc_count = 0;
        }

        if doc_count > 0 && !self.options.force {
            return Err(RestoreError::NotEmpty {
                database: db.to_string(),
                doc_count,
            });
        }

        if !exists {
            tracing::info!("Creating db '{}'", db);
            let response = self.couch.create_database(db).await?;
            if !matches!(response.status, 201 | 202) {
                return Err(RestoreError::Create {
                    database: db.to_string(),
                    status: response.status,
                });
            }
        }
        Ok(!exists)
    }

    async fn restore_document(&self, mut doc: Value) -> DocumentOutcome {
        let Some(id) = json::document_id(&doc).map(str::to_string) else {
            return DocumentOutcome::Failed {
                id: "?".to_string(),
                reason: "document has no _id".to_string(),
            };
        };

        let current_rev = match self
            .couch
            .fetch_document(&self.database, &id, DocumentQuery::default())
            .await
        {
            Ok(response) if response.is_ok() => response
                .json::<Value>()
                .ok()
                .and_then(|current| json::document_rev(&current).map(str::to_string)),
            Ok(_) => None,
            Err(e) => {
                return DocumentOutcome::Failed {
                    id,
                    reason: e.to_string(),
                }
            }
        };

        let Some(fields) = doc.as_object_mut() else {
            return DocumentOutcome::Failed {
                id,
                reason: "document is not a JSON object".to_string(),
            };
        };
        match &current_rev {
            Some(rev) => {
                fields.insert(json::REV_FIELD.to_string(), Value::String(rev.clone()));
            }
            None => {
                fields.shift_remove(json::REV_FIELD);
            }
        }

        json::strip_revisions(&mut doc);

        if !self.options.inline_attachments && json::has_attachments(&doc) {
            json::strip_attachments(&mut doc);
            if let Some(fields) = doc.as_object_mut() {
                fields.shift_remove("unnamed");
            }
        }
        json::normalize_empty_keys(&mut doc);

        tracing::debug!(
            "Restoring '{}|rev:{}' into db '{}'",
            id,
            current_rev.as_deref().unwrap_or("new"),
            self.database
        );

        let body = match serde_json::to_vec(&doc) {
            Ok(body) => body,
            Err(e) => {
                return DocumentOutcome::Failed {
                    id,
                    reason: e.to_string(),
                }
            }
        };
        match self.couch.put_document(&self.database, &id, body).await {
            Ok(response) => classify_put_response(&id, &response.body),
            Err(e) => DocumentOutcome::Failed {
                id,
                reason: e.to_string(),
            },
        }
    }
}

/// Restores `source` into `database`. See [`Restorer`].
pub async fn restore(
    couch: &Couch,
    database: &str,
    source: &RestoreSource,
    options: &RestoreOptions,
) -> Result<RestoreReport, RestoreError> {
    Restorer::new(couch.clone(), database, source.clone(), options.clone())
        .run()
        .await
}
