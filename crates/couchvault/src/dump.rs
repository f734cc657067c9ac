//! Dump engine: walks one database and serializes its documents.
//!
//! Output is either one aggregate envelope file (`{"new_edits":false,"docs":[...]}`)
//! or one file per document (per revision when history is included). Every
//! document is fetched, transformed, written and dropped before the next one
//! is requested, so memory use does not grow with the database.
//!
//! Failure handling is deliberately uneven:
//! - a non-200 on the listing, a document or a revision aborts the whole dump,
//! - a filter returning `false` skips one revision (or one document),
//! - a failed binary attachment download is recorded and the dump continues.

use crate::client::{Couch, DocumentQuery};
use crate::error::{ClientError, ConfigError};
use crate::filter::{DocumentFilter, FilterError};
use crate::json::{self, RevisionStatus};
use crate::paths;
use chrono::Utc;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

const ENVELOPE_OPEN_HISTORY: &str = "{\"new_edits\":false,\"docs\":[";
const ENVELOPE_OPEN: &str = "{\"docs\":[";
const ENVELOPE_SEPARATOR: &str = ",\n";
const ENVELOPE_CLOSE: &str = "\n]}\n";

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("unsupported response when fetching all documents info from db '{database}' (http status code = {status})")]
    Listing { database: String, status: u16 },
    #[error("no documents found in db '{database}'")]
    EmptyDatabase { database: String },
    #[error("unsupported response when fetching document [{id}] from db '{database}' (http status code = {status})")]
    Document {
        database: String,
        id: String,
        status: u16,
    },
    #[error("unsupported response when fetching document [{id}] revision [{rev}] from db '{database}' (http status code = {status})")]
    Revision {
        database: String,
        id: String,
        rev: String,
        status: u16,
    },
    #[error("filter failed on document [{id}]: {source}")]
    Filter {
        id: String,
        #[source]
        source: FilterError,
    },
    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot serialize document [{id}]: {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Clone)]
pub struct DumpOptions {
    pub include_history: bool,
    pub inline_attachments: bool,
    /// Download attachments as separate files and keep stubs in the dump.
    pub binary_attachments: bool,
    pub per_document_files: bool,
    pub pretty_print: bool,
    /// Suffix the per-database directory with the dump start time.
    pub timestamp_dir: bool,
    pub output_dir: PathBuf,
    pub filter: Option<Arc<dyn DocumentFilter>>,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            include_history: true,
            inline_attachments: false,
            binary_attachments: false,
            per_document_files: false,
            pretty_print: false,
            timestamp_dir: false,
            output_dir: PathBuf::from("."),
            filter: None,
        }
    }
}

impl fmt::Debug for DumpOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumpOptions")
            .field("include_history", &self.include_history)
            .field("inline_attachments", &self.inline_attachments)
            .field("binary_attachments", &self.binary_attachments)
            .field("per_document_files", &self.per_document_files)
            .field("pretty_print", &self.pretty_print)
            .field("timestamp_dir", &self.timestamp_dir)
            .field("output_dir", &self.output_dir)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl DumpOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.binary_attachments && self.include_history {
            return Err(ConfigError::BinaryAttachmentsWithHistory);
        }
        Ok(())
    }

    fn keeps_attachments(&self) -> bool {
        self.inline_attachments || self.binary_attachments
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentFailure {
    pub id: String,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpReport {
    pub database: String,
    /// Aggregate file or per-document directory.
    pub output: PathBuf,
    pub documents: usize,
    pub entries_written: usize,
    pub skipped_by_filter: usize,
    /// `missing`/`deleted` revisions that could not be materialized.
    pub unavailable_revisions: usize,
    pub attachments_written: usize,
    pub attachment_failures: Vec<AttachmentFailure>,
}

/// Destination of serialized documents for one dump run.
enum Sink {
    Aggregate {
        path: PathBuf,
        writer: BufWriter<File>,
        first: bool,
    },
    Directory {
        dir: PathBuf,
        created: bool,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DumpError + '_ {
    move |source| DumpError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl Sink {
    async fn aggregate(path: PathBuf, include_history: bool) -> Result<Self, DumpError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error(parent))?;
        }
        let file = File::create(&path).await.map_err(io_error(&path))?;
        let mut writer = BufWriter::new(file);
        let open = if include_history {
            ENVELOPE_OPEN_HISTORY
        } else {
            ENVELOPE_OPEN
        };
        writer
            .write_all(format!("{}\n", open).as_bytes())
            .await
            .map_err(io_error(&path))?;

        Ok(Sink::Aggregate {
            path,
            writer,
            first: true,
        })
    }

    fn directory(dir: PathBuf) -> Self {
        Sink::Directory {
            dir,
            created: false,
        }
    }

    async fn emit(&mut self, id: &str, rev: Option<&str>, body: &str) -> Result<(), DumpError> {
        match self {
            Sink::Aggregate {
                path,
                writer,
                first,
            } => {
                if !*first {
                    writer
                        .write_all(ENVELOPE_SEPARATOR.as_bytes())
                        .await
                        .map_err(io_error(path))?;
                }
                writer
                    .write_all(body.as_bytes())
                    .await
                    .map_err(io_error(path))?;
                *first = false;
            }
            Sink::Directory { dir, created } => {
                if !*created {
                    tokio::fs::create_dir_all(&dir)
                        .await
                        .map_err(io_error(dir))?;
                    *created = true;
                }
                let path = dir.join(paths::document_file_name(id, rev));
                tokio::fs::write(&path, body.as_bytes())
                    .await
                    .map_err(io_error(&path))?;
            }
        }
        Ok(())
    }

    /// Flushes whatever was emitted so far; the envelope stays unclosed.
    async fn abandon(&mut self) {
        if let Sink::Aggregate { path, writer, .. } = self {
            if let Err(e) = writer.flush().await {
                tracing::warn!("Could not flush partial dump {}: {}", path.display(), e);
            }
        }
    }

    async fn finish(self) -> Result<PathBuf, DumpError> {
        match self {
            Sink::Aggregate {
                path, mut writer, ..
            } => {
                writer
                    .write_all(ENVELOPE_CLOSE.as_bytes())
                    .await
                    .map_err(io_error(&path))?;
                writer.flush().await.map_err(io_error(&path))?;
                Ok(path)
            }
            Sink::Directory { dir, .. } => Ok(dir),
        }
    }
}

/// One dump run over one database.
pub struct Dumper {
    couch: Couch,
    database: String,
    options: DumpOptions,
    database_dir: PathBuf,
}

impl Dumper {
    pub fn new(couch: Couch, database: &str, options: DumpOptions) -> Self {
        let timestamp = options.timestamp_dir.then(Utc::now);
        let database_dir = options
            .output_dir
            .join(paths::database_dir_name(database, timestamp));
        Self {
            couch,
            database: database.to_string(),
            options,
            database_dir,
        }
    }

    /// Directory receiving per-document files and binary attachments.
    pub fn database_dir(&self) -> &Path {
        &self.database_dir
    }

    pub async fn run(&self) -> Result<DumpReport, DumpError> {
        self.options.validate()?;
        let db = self.database.as_str();

        tracing::info!("Fetching all documents info from db '{}'", db);
        let listing = self.couch.all_docs(db).await?;
        if !listing.is_ok() {
            return Err(DumpError::Listing {
                database: db.to_string(),
                status: listing.status,
            });
        }

        let ids = match json::parse_all_docs(&listing.body) {
            Some(ids) if !ids.is_empty() => ids,
            _ => {
                return Err(DumpError::EmptyDatabase {
                    database: db.to_string(),
                })
            }
        };
        tracing::info!("Found {} documents in db '{}'", ids.len(), db);

        let mut sink = if self.options.per_document_files {
            Sink::directory(self.database_dir.clone())
        } else {
            let path = self
                .options
                .output_dir
                .join(paths::aggregate_file_name(db));
            Sink::aggregate(path, self.options.include_history).await?
        };

        let mut report = DumpReport {
            database: db.to_string(),
            documents: ids.len(),
            ..DumpReport::default()
        };

        for (index, id) in ids.iter().enumerate() {
            let percentage = ((index + 1) as f64 / ids.len() as f64) * 100.0;
            tracing::debug!("Processing database \"{}\": {:.2}% [{}]", db, percentage, id);
            if let Err(e) = self.dump_document(id, &mut sink, &mut report).await {
                sink.abandon().await;
                return Err(e);
            }
        }

        report.output = sink.finish().await?;
        tracing::info!(
            database = %db,
            entries = report.entries_written,
            skipped = report.skipped_by_filter,
            attachments = report.attachments_written,
            "Dump finished"
        );
        Ok(report)
    }

    async fn dump_document(
        &self,
        id: &str,
        sink: &mut Sink,
        report: &mut DumpReport,
    ) -> Result<(), DumpError> {
        let history = self.options.include_history;
        let query = DocumentQuery {
            revisions: history,
            attachments: self.options.inline_attachments
                || (!history && self.options.binary_attachments),
        };

        let response = self.couch.fetch_document(&self.database, id, query).await?;
        if !response.is_ok() {
            return Err(DumpError::Document {
                database: self.database.clone(),
                id: id.to_string(),
                status: response.status,
            });
        }
        let doc: Value = response.json()?;

        let chain = json::revisions_info(&doc);
        if history && chain.len() > 1 {
            self.dump_revisions(id, chain, sink, report).await
        } else {
            self.dump_single(id, doc, sink, report).await
        }
    }

    /// Emits every available revision, oldest first.
    async fn dump_revisions(
        &self,
        id: &str,
        mut chain: Vec<json::RevisionInfo>,
        sink: &mut Sink,
        report: &mut DumpReport,
    ) -> Result<(), DumpError> {
        chain.reverse();
        let reference_rev = chain
            .last()
            .map(|info| info.rev.clone())
            .unwrap_or_default();

        for info in &chain {
            if info.status != RevisionStatus::Available {
                tracing::debug!("[{}] @ {} = {:?}, not dumped", id, info.rev, info.status);
                report.unavailable_revisions += 1;
                continue;
            }

            let response = self
                .couch
                .fetch_revision(
                    &self.database,
                    id,
                    &info.rev,
                    self.options.inline_attachments,
                )
                .await?;
            if !response.is_ok() {
                return Err(DumpError::Revision {
                    database: self.database.clone(),
                    id: id.to_string(),
                    rev: info.rev.clone(),
                    status: response.status,
                });
            }
            let mut body: Value = response.json()?;

            if !self.passes_filter(id, &body, &reference_rev).await? {
                tracing::debug!("[{}] @ {} = skipped", id, info.rev);
                report.skipped_by_filter += 1;
                continue;
            }

            json::strip_revs_info(&mut body);
            if !self.options.keeps_attachments() {
                json::strip_attachments(&mut body);
            }
            json::normalize_empty_keys(&mut body);

            let text = self.serialize(id, &body)?;
            sink.emit(id, Some(&info.rev), &text).await?;
            report.entries_written += 1;
        }
        Ok(())
    }

    async fn dump_single(
        &self,
        id: &str,
        mut doc: Value,
        sink: &mut Sink,
        report: &mut DumpReport,
    ) -> Result<(), DumpError> {
        json::strip_revs_info(&mut doc);
        let reference_rev = json::document_rev(&doc).unwrap_or_default().to_string();

        if !self.passes_filter(id, &doc, &reference_rev).await? {
            tracing::debug!("[{}] = skipped", id);
            report.skipped_by_filter += 1;
            return Ok(());
        }

        if !self.options.include_history {
            json::strip_history(&mut doc);
        }
        if !self.options.keeps_attachments() {
            json::strip_attachments(&mut doc);
        }
        let attachments = if self.options.binary_attachments {
            json::attachment_names(&doc)
        } else {
            Vec::new()
        };

        json::normalize_empty_keys(&mut doc);
        if self.options.binary_attachments && !self.options.inline_attachments {
            json::stub_attachments(&mut doc);
        }

        let text = self.serialize(id, &doc)?;
        sink.emit(id, None, &text).await?;
        report.entries_written += 1;

        for name in &attachments {
            self.download_attachment(id, name, report).await;
        }
        Ok(())
    }

    async fn passes_filter(
        &self,
        id: &str,
        doc: &Value,
        reference_rev: &str,
    ) -> Result<bool, DumpError> {
        match &self.options.filter {
            Some(filter) => filter
                .keep(doc, reference_rev)
                .await
                .map_err(|source| DumpError::Filter {
                    id: id.to_string(),
                    source,
                }),
            None => Ok(true),
        }
    }

    fn serialize(&self, id: &str, doc: &Value) -> Result<String, DumpError> {
        let text = if self.options.pretty_print {
            json::to_pretty(doc)
        } else {
            json::to_compact(doc)
        };
        text.map_err(|source| DumpError::Serialize {
            id: id.to_string(),
            source,
        })
    }

    /// Soft failure: a broken attachment is recorded, the dump goes on.
    async fn download_attachment(&self, id: &str, name: &str, report: &mut DumpReport) {
        match self.fetch_attachment_to_disk(id, name).await {
            Ok(path) => {
                tracing::debug!("[{}] attachment '{}' saved to {}", id, name, path.display());
                report.attachments_written += 1;
            }
            Err(reason) => {
                tracing::warn!("[{}] attachment '{}' not saved: {}", id, name, reason);
                report.attachment_failures.push(AttachmentFailure {
                    id: id.to_string(),
                    name: name.to_string(),
                    reason,
                });
            }
        }
    }

    async fn fetch_attachment_to_disk(&self, id: &str, name: &str) -> Result<PathBuf, String> {
        let response = self
            .couch
            .fetch_attachment(&self.database, id, name)
            .await
            .map_err(|e| e.to_string())?;
        if !response.is_ok() {
            return Err(format!("http status code = {}", response.status));
        }

        let path = paths::attachment_path(&self.database_dir, id, name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("{}: {}", parent.display(), e))?;
        }
        tokio::fs::write(&path, &response.body)
            .await
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        Ok(path)
    }
}

/// Dumps `database` with `options`. See [`Dumper`].
pub async fn dump(
    couch: &Couch,
    database: &str,
    options: &DumpOptions,
) -> Result<DumpReport, DumpError> {
    Dumper::new(couch.clone(), database, options.clone())
        .run()
        .await
}
