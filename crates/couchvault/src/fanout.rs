//! Fan-out: the same dump or restore run independently over every database.
//!
//! Each database is one job with its own destination. Jobs run inline when
//! `jobs <= 1`, otherwise on a semaphore-bounded set of tokio tasks that are
//! all joined before the tree is archived or removed. A failed job is
//! recorded against its database and never stops its siblings.

use crate::archive::{self, ArchiveError};
use crate::client::Couch;
use crate::dump::{DumpOptions, DumpReport, Dumper};
use crate::error::{ClientError, ConfigError};
use crate::paths;
use crate::restore::{RestoreOptions, RestoreReport, RestoreSource, Restorer};
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("unsupported response when listing databases (http status code = {status})")]
    Listing { status: u16 },
    #[error("restore tree {path} is not usable: {msg}")]
    Source { path: PathBuf, msg: String },
    #[error("fan-out I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> FanoutError + '_ {
    move |source| FanoutError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutOptions {
    /// Concurrent database jobs; `0` or `1` runs them one after another.
    pub jobs: usize,
    /// Dump: pack the backup root into `<root>.tar.gz` and remove the tree.
    pub compress: bool,
    /// Restore: remove the restored tree once every job has finished.
    pub remove_after: bool,
}

/// Report of one finished database job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReport {
    Dump(DumpReport),
    Restore(RestoreReport),
}

/// Result of the job for one database.
#[derive(Debug, Clone)]
pub struct FanoutResult {
    /// Database name.
    pub database: String,
    /// Whether the job completed.
    pub success: bool,
    /// Engine report when the job completed.
    pub report: Option<JobReport>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Milliseconds spent on the job.
    pub elapsed_ms: u64,
}

/// Summary of a fan-out across all databases.
#[derive(Debug, Clone, Default)]
pub struct FanoutSummary {
    /// Backup root (dump) or restored tree (restore).
    pub root: PathBuf,
    /// Archive written after a compressed dump.
    pub archive: Option<PathBuf>,
    /// Number of databases attempted.
    pub total_databases: usize,
    /// Number of successful jobs.
    pub successful_databases: usize,
    /// Number of failed jobs.
    pub failed_databases: usize,
    /// Individual results, in enumeration order.
    pub results: Vec<FanoutResult>,
}

impl FanoutSummary {
    fn new(root: PathBuf, results: Vec<FanoutResult>) -> Self {
        let successful_databases = results.iter().filter(|r| r.success).count();
        Self {
            root,
            archive: None,
            total_databases: results.len(),
            successful_databases,
            failed_databases: results.len() - successful_databases,
            results,
        }
    }

    /// Returns true if no job failed. An empty server counts as success.
    pub fn all_succeeded(&self) -> bool {
        self.failed_databases == 0
    }

    /// Returns true if any job failed.
    pub fn any_failed(&self) -> bool {
        self.failed_databases > 0
    }

    /// Returns the failure rate (0.0 to 1.0).
    pub fn failure_rate(&self) -> f64 {
        if self.total_databases == 0 {
            return 0.0;
        }
        self.failed_databases as f64 / self.total_databases as f64
    }

    pub fn successful_names(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.database.as_str())
            .collect()
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.database.as_str())
            .collect()
    }
}

/// Input of a restore fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTree {
    /// A backup root holding one sub-directory per database.
    Directory(PathBuf),
    /// A `.tar.gz` of such a root, extracted next to itself.
    Archive(PathBuf),
}

/// Operation applied to every database.
#[derive(Debug, Clone)]
pub enum FanoutMode {
    Dump(DumpOptions),
    Restore {
        tree: RestoreTree,
        options: RestoreOptions,
    },
}

/// Runs `mode` over every database. See [`dump_all`] and [`restore_all`].
pub async fn fan_out(
    couch: &Couch,
    mode: FanoutMode,
    options: &FanoutOptions,
) -> Result<FanoutSummary, FanoutError> {
    match mode {
        FanoutMode::Dump(dump_options) => dump_all(couch, &dump_options, options).await,
        FanoutMode::Restore {
            tree,
            options: restore_options,
        } => restore_all(couch, &tree, &restore_options, options).await,
    }
}

/// User databases on the server; names starting with `_` are system databases.
pub async fn list_databases(couch: &Couch) -> Result<Vec<String>, FanoutError> {
    let response = couch.all_dbs().await?;
    if !response.is_ok() {
        return Err(FanoutError::Listing {
            status: response.status,
        });
    }
    let names: Vec<String> = response.json()?;
    Ok(names.into_iter().filter(|name| !name.starts_with('_')).collect())
}

/// Dumps every database into a fresh `backup_*` root under `options.output_dir`.
pub async fn dump_all(
    couch: &Couch,
    options: &DumpOptions,
    fanout: &FanoutOptions,
) -> Result<FanoutSummary, FanoutError> {
    options.validate()?;
    let databases = list_databases(couch).await?;

    let root = options
        .output_dir
        .join(paths::backup_root_name(Utc::now()));
    tokio::fs::create_dir_all(&root)
        .await
        .map_err(io_error(&root))?;
    tracing::info!(
        "Dumping {} databases into {}",
        databases.len(),
        root.display()
    );

    let job_options = DumpOptions {
        per_document_files: true,
        output_dir: root.clone(),
        ..options.clone()
    };
    let couch = couch.clone();
    let results = run_jobs(databases, fanout.jobs, move |database| {
        let dumper = Dumper::new(couch.clone(), &database, job_options.clone());
        async move {
            dumper
                .run()
                .await
                .map(JobReport::Dump)
                .map_err(|e| e.to_string())
        }
    })
    .await;

    let mut summary = FanoutSummary::new(root.clone(), results);
    if fanout.compress {
        summary.archive = Some(archive::pack_directory(&root).await?);
        archive::remove_tree(&root).await?;
    }
    Ok(summary)
}

/// Restores every sub-directory of the tree as one database, named by its decoded directory name.
pub async fn restore_all(
    couch: &Couch,
    tree: &RestoreTree,
    options: &RestoreOptions,
    fanout: &FanoutOptions,
) -> Result<FanoutSummary, FanoutError> {
    let root = match tree {
        RestoreTree::Directory(dir) => dir.clone(),
        RestoreTree::Archive(archive_path) => {
            let dest = paths::extraction_dir(archive_path).ok_or_else(|| FanoutError::Source {
                path: archive_path.clone(),
                msg: "expected a .tar.gz or .tgz archive".to_string(),
            })?;
            if dest.is_dir() {
                tracing::info!("Reusing extracted tree {}", dest.display());
            } else {
                if !archive_path.is_file() {
                    return Err(FanoutError::Source {
                        path: archive_path.clone(),
                        msg: "archive not found".to_string(),
                    });
                }
                archive::unpack_archive(archive_path, &dest).await?;
            }
            dest
        }
    };
    if !root.is_dir() {
        return Err(FanoutError::Source {
            path: root,
            msg: "not a directory".to_string(),
        });
    }

    // Database name -> the directory it was listed from.
    let mut directories = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(&root).await.map_err(io_error(&root))?;
    while let Some(entry) = entries.next_entry().await.map_err(io_error(&root))? {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
            directories.insert(paths::decode_segment(name), entry.path());
        }
    }
    let databases: Vec<String> = directories.keys().cloned().collect();
    tracing::info!(
        "Restoring {} databases from {}",
        databases.len(),
        root.display()
    );

    let couch = couch.clone();
    let job_root = root.clone();
    let job_options = options.clone();
    let results = run_jobs(databases, fanout.jobs, move |database| {
        let dir = directories
            .get(&database)
            .cloned()
            .unwrap_or_else(|| job_root.join(paths::encode_segment(&database)));
        let source = RestoreSource::Directory(dir);
        let restorer = Restorer::new(couch.clone(), &database, source, job_options.clone());
        async move {
            restorer
                .run()
                .await
                .map(JobReport::Restore)
                .map_err(|e| e.to_string())
        }
    })
    .await;

    let summary = FanoutSummary::new(root.clone(), results);
    if fanout.remove_after {
        archive::remove_tree(&root).await?;
    }
    Ok(summary)
}

async fn timed<Fut>(database: String, job: Fut) -> FanoutResult
where
    Fut: Future<Output = Result<JobReport, String>>,
{
    let start = Instant::now();
    let outcome = job.await;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    match outcome {
        Ok(report) => FanoutResult {
            database,
            success: true,
            report: Some(report),
            error: None,
            elapsed_ms,
        },
        Err(error) => {
            tracing::error!("db '{}' failed: {}", database, error);
            FanoutResult {
                database,
                success: false,
                report: None,
                error: Some(error),
                elapsed_ms,
            }
        }
    }
}

/// Runs `job` for each database, returning results in input order.
async fn run_jobs<F, Fut>(databases: Vec<String>, jobs: usize, job: F) -> Vec<FanoutResult>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobReport, String>> + Send + 'static,
{
    let mut results = Vec::with_capacity(databases.len());

    if jobs <= 1 {
        for database in databases {
            let work = job(database.clone());
            results.push(timed(database, work).await);
        }
        return results;
    }

    let semaphore = Arc::new(Semaphore::new(jobs));
    let job = Arc::new(job);
    let mut handles = Vec::with_capacity(databases.len());
    for database in databases {
        let semaphore = semaphore.clone();
        let job = job.clone();
        let name = database.clone();
        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            timed(name.clone(), (*job)(name)).await
        });
        handles.push((database, handle));
    }

    for (database, handle) in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => {
                tracing::error!("db '{}' job aborted: {}", database, e);
                results.push(FanoutResult {
                    database,
                    success: false,
                    report: None,
                    error: Some(format!("job aborted: {}", e)),
                    elapsed_ms: 0,
                });
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use reqwest::Method;
    use serde_json::json;

    fn setup() -> (Arc<MockTransport>, Couch) {
        let mock = Arc::new(MockTransport::new());
        let couch = Couch::with_transport(mock.clone());
        (mock, couch)
    }

    fn serve_database(mock: &MockTransport, db: &str) {
        mock.respond(
            Method::GET,
            &format!("/{}/_all_docs", db),
            200,
            json!({"total_rows": 1, "rows": [{"id": "a"}]}),
        );
        mock.respond(
            Method::GET,
            &format!("/{}/a", db),
            200,
            json!({"_id": "a", "_rev": "1-x", "db": db}),
        );
    }

    fn no_history() -> DumpOptions {
        DumpOptions {
            include_history: false,
            ..DumpOptions::default()
        }
    }

    #[tokio::test]
    async fn test_list_databases_skips_system_databases() {
        let (mock, couch) = setup();
        mock.respond(
            Method::GET,
            "/_all_dbs",
            200,
            json!(["_replicator", "_users", "orders", "users"]),
        );
        assert_eq!(list_databases(&couch).await.unwrap(), vec!["orders", "users"]);
    }

    #[tokio::test]
    async fn test_list_databases_failure() {
        let (mock, couch) = setup();
        mock.respond(Method::GET, "/_all_dbs", 401, json!({"error": "unauthorized"}));
        assert!(matches!(
            list_databases(&couch).await,
            Err(FanoutError::Listing { status: 401 })
        ));
    }

    #[tokio::test]
    async fn test_dump_all_isolates_failed_database() {
        for jobs in [1, 4] {
            let (mock, couch) = setup();
            let tmp = tempfile::tempdir().unwrap();
            mock.respond(Method::GET, "/_all_dbs", 200, json!(["db1", "db2", "db3", "db4", "db5"]));
            for db in ["db1", "db2", "db4", "db5"] {
                serve_database(&mock, db);
            }
            mock.respond(Method::GET, "/db3/_all_docs", 500, json!({"error": "internal"}));

            let options = DumpOptions {
                output_dir: tmp.path().to_path_buf(),
                ..no_history()
            };
            let fanout = FanoutOptions {
                jobs,
                ..FanoutOptions::default()
            };
            let summary = dump_all(&couch, &options, &fanout).await.unwrap();

            assert_eq!(summary.total_databases, 5);
            assert_eq!(summary.failed_names(), vec!["db3"]);
            assert_eq!(
                summary.successful_names(),
                vec!["db1", "db2", "db4", "db5"]
            );
            assert!(summary.any_failed());
            assert!((summary.failure_rate() - 0.2).abs() < f64::EPSILON);
            assert!(summary.root.starts_with(tmp.path()));
            for db in ["db1", "db2", "db4", "db5"] {
                let written = std::fs::read_to_string(summary.root.join(db).join("a.json")).unwrap();
                assert_eq!(written, format!("{{\"_id\":\"a\",\"db\":\"{}\"}}", db));
            }
        }
    }

    #[tokio::test]
    async fn test_dump_all_compress_replaces_tree_with_archive() {
        let (mock, couch) = setup();
        let tmp = tempfile::tempdir().unwrap();
        mock.respond(Method::GET, "/_all_dbs", 200, json!(["db1"]));
        serve_database(&mock, "db1");

        let options = DumpOptions {
            output_dir: tmp.path().to_path_buf(),
            ..no_history()
        };
        let fanout = FanoutOptions {
            compress: true,
            ..FanoutOptions::default()
        };
        let summary = dump_all(&couch, &options, &fanout).await.unwrap();

        assert!(summary.all_succeeded());
        let archive_path = summary.archive.clone().unwrap();
        assert!(archive_path.is_file());
        assert!(!summary.root.exists());
        let name = archive_path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("backup_") && name.ends_with("_UTC.tar.gz"));
    }

    #[tokio::test]
    async fn test_restore_all_from_directory() {
        let (mock, couch) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("backup");
        for db in ["alpha", "my%20db"] {
            std::fs::create_dir_all(root.join(db)).unwrap();
            std::fs::write(root.join(db).join("a.json"), r#"{"_id":"a"}"#).unwrap();
        }
        std::fs::write(root.join("stray.txt"), "not a database").unwrap();
        for db in ["alpha", "my%20db"] {
            mock.respond(Method::GET, &format!("/{}", db), 404, json!({"error": "not_found"}));
            mock.respond(Method::PUT, &format!("/{}", db), 201, json!({"ok": true}));
            mock.respond(Method::PUT, &format!("/{}/a", db), 201, json!({"ok": true, "id": "a"}));
        }

        let fanout = FanoutOptions {
            jobs: 2,
            remove_after: true,
            ..FanoutOptions::default()
        };
        let summary = restore_all(
            &couch,
            &RestoreTree::Directory(root.clone()),
            &RestoreOptions::default(),
            &fanout,
        )
        .await
        .unwrap();

        assert!(summary.all_succeeded());
        assert_eq!(summary.successful_names(), vec!["alpha", "my db"]);
        match &summary.results[1].report {
            Some(JobReport::Restore(report)) => assert_eq!(report.restored, 1),
            other => panic!("Expected restore report, got {:?}", other),
        }
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_restore_all_reads_directories_as_listed() {
        let (mock, couch) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("backup");
        // Written by another tool, so not in percent-encoded form.
        std::fs::create_dir_all(root.join("my$db")).unwrap();
        std::fs::write(root.join("my$db").join("a.json"), r#"{"_id":"a"}"#).unwrap();
        mock.respond(Method::GET, "/my%24db", 404, json!({"error": "not_found"}));
        mock.respond(Method::PUT, "/my%24db", 201, json!({"ok": true}));
        mock.respond(Method::PUT, "/my%24db/a", 201, json!({"ok": true, "id": "a"}));

        let summary = restore_all(
            &couch,
            &RestoreTree::Directory(root.clone()),
            &RestoreOptions::default(),
            &FanoutOptions::default(),
        )
        .await
        .unwrap();

        assert!(summary.all_succeeded(), "{:?}", summary.results[0].error);
        assert_eq!(summary.successful_names(), vec!["my$db"]);
        assert_eq!(mock.requests_to(Method::PUT, "/my%24db/a").len(), 1);
        assert!(root.join("my$db").exists());
    }

    #[tokio::test]
    async fn test_restore_all_requires_archive_extension() {
        let (_mock, couch) = setup();
        let err = restore_all(
            &couch,
            &RestoreTree::Archive(PathBuf::from("/tmp/backup.zip")),
            &RestoreOptions::default(),
            &FanoutOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FanoutError::Source { .. }));
    }

    #[tokio::test]
    async fn test_fan_out_dispatches_by_mode() {
        let (mock, couch) = setup();
        let tmp = tempfile::tempdir().unwrap();
        mock.respond(Method::GET, "/_all_dbs", 200, json!([]));

        let summary = fan_out(
            &couch,
            FanoutMode::Dump(DumpOptions {
                output_dir: tmp.path().to_path_buf(),
                ..no_history()
            }),
            &FanoutOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.total_databases, 0);
        assert!(summary.all_succeeded());
        assert_eq!(summary.failure_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_run_jobs_keeps_input_order_and_bounds_concurrency() {
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let databases: Vec<String> = (0..8).map(|i| format!("db{}", i)).collect();

        let (r, p) = (running.clone(), peak.clone());
        let results = run_jobs(databases.clone(), 3, move |database| {
            let (running, peak) = (r.clone(), p.clone());
            async move {
                use std::sync::atomic::Ordering;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                if database == "db5" {
                    Err("boom".to_string())
                } else {
                    Ok(JobReport::Restore(RestoreReport::default()))
                }
            }
        })
        .await;

        let order: Vec<&str> = results.iter().map(|r| r.database.as_str()).collect();
        assert_eq!(order, databases.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
        assert_eq!(results[5].error.as_deref(), Some("boom"));
        assert_eq!(results.iter().filter(|r| r.success).count(), 7);
    }

    #[tokio::test]
    async fn test_run_jobs_records_panicking_job_against_its_database() {
        let databases: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let results = run_jobs(databases, 2, |database| async move {
            if database == "b" {
                panic!("restore of {} blew up", database);
            }
            Ok(JobReport::Restore(RestoreReport::default()))
        })
        .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].success && results[2].success);
        assert_eq!(results[1].database, "b");
        assert!(results[1]
            .error
            .as_deref()
            .unwrap()
            .starts_with("job aborted"));
    }
}
