use crate::client::Couch;
use crate::config::VaultConfig;
use crate::dump::{self, DumpOptions};
use crate::error::ConfigError;
use crate::fanout::{self, FanoutOptions, FanoutSummary, JobReport, RestoreTree};
use crate::filter::{CommandFilter, DocumentFilter};
use crate::restore::{self, RestoreOptions, RestoreSource};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "couchvault", version)]
#[command(about = "Dump and restore databases over their HTTP API", long_about = None)]
pub struct Cli {
    /// Server host, optionally with an http:// or https:// scheme
    #[arg(short = 'H', long, global = true, env = "COUCHVAULT_HOST")]
    pub host: Option<String>,

    #[arg(long, global = true, env = "COUCHVAULT_PORT")]
    pub port: Option<u32>,

    /// Settings file (.toml or .json); flags override its values
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Dump one database, or every database with --all
    Dump(DumpArgs),
    /// Restore one database, or a whole backup tree with --all
    Restore(RestoreArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DumpArgs {
    #[arg(short = 'd', long, conflicts_with = "all")]
    pub database: Option<String>,

    /// Dump every non-system database into a backup_* directory
    #[arg(short = 'g', long)]
    pub all: bool,

    /// Dump only the current revision of each document
    #[arg(short = 'X', long)]
    pub no_history: bool,

    #[arg(short = 'a', long)]
    pub inline_attachments: bool,

    /// Download attachments as files and keep stubs (requires -X)
    #[arg(short = 'A', long)]
    pub binary_attachments: bool,

    /// One file per document instead of one aggregate file
    #[arg(short = 's', long)]
    pub separate_files: bool,

    #[arg(short = 't', long)]
    pub timestamp: bool,

    #[arg(short = 'P', long)]
    pub pretty: bool,

    #[arg(short = 'm', long)]
    pub jobs: Option<usize>,

    /// Pack the backup directory into a .tar.gz (with --all)
    #[arg(short = 'z', long, requires = "all")]
    pub compress: bool,

    /// Filter program deciding per revision whether it is dumped
    #[arg(short = 'y', long, value_name = "PROGRAM")]
    pub filter: Option<String>,

    #[arg(
        long = "filter-arg",
        value_name = "ARG",
        allow_hyphen_values = true,
        requires = "filter"
    )]
    pub filter_args: Vec<String>,

    #[arg(short = 'o', long, default_value = ".")]
    pub output: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    #[arg(short = 'd', long, conflicts_with = "all")]
    pub database: Option<String>,

    /// Aggregate dump file, or the archive with --all --decompress
    #[arg(short = 'f', long, conflicts_with = "dir")]
    pub file: Option<PathBuf>,

    /// Directory of per-document files, or a backup tree with --all
    #[arg(short = 's', long)]
    pub dir: Option<PathBuf>,

    /// Delete and recreate the database first
    #[arg(short = 'D', long)]
    pub drop: bool,

    /// Restore into a database that already holds documents
    #[arg(short = 'F', long)]
    pub force: bool,

    #[arg(short = 'a', long)]
    pub inline_attachments: bool,

    #[arg(short = 'g', long)]
    pub all: bool,

    #[arg(short = 'z', long, requires = "all")]
    pub decompress: bool,

    /// Remove the restored tree afterwards (with --all)
    #[arg(short = 'r', long, requires = "all")]
    pub remove_after: bool,

    #[arg(short = 'm', long)]
    pub jobs: Option<usize>,
}

/// Outcome of a run that got past configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// At least one database could not be dumped or restored.
    DatabaseFailure,
}

/// Process exit status: 0 success, 1 configuration error, 2 database failure.
pub fn exit_code(result: &Result<RunStatus>) -> u8 {
    match result {
        Ok(RunStatus::Success) => 0,
        Ok(RunStatus::DatabaseFailure) => 2,
        Err(e) if e.downcast_ref::<ConfigError>().is_some() => 1,
        Err(_) => 2,
    }
}

impl DumpArgs {
    pub fn dump_options(
        &self,
        filter: Option<Arc<dyn DocumentFilter>>,
    ) -> Result<DumpOptions, ConfigError> {
        if self.database.is_none() && !self.all {
            return Err(ConfigError::MissingDatabase);
        }
        let options = DumpOptions {
            include_history: !self.no_history,
            inline_attachments: self.inline_attachments,
            binary_attachments: self.binary_attachments,
            per_document_files: self.separate_files,
            pretty_print: self.pretty,
            timestamp_dir: self.timestamp,
            output_dir: self.output.clone(),
            filter,
        };
        options.validate()?;
        Ok(options)
    }
}

/// What a restore invocation reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestorePlan {
    Single {
        database: String,
        source: RestoreSource,
    },
    All(RestoreTree),
}

impl RestoreArgs {
    pub fn restore_options(&self) -> RestoreOptions {
        RestoreOptions {
            drop: self.drop,
            force: self.force,
            inline_attachments: self.inline_attachments,
        }
    }

    /// Resolves and checks the source without touching the network.
    pub fn plan(&self) -> Result<RestorePlan, ConfigError> {
        if self.all {
            let tree = match (self.decompress, self.file.as_ref().or(self.dir.as_ref())) {
                (_, None) => return Err(ConfigError::MissingSource),
                (true, Some(archive)) => RestoreTree::Archive(archive.clone()),
                (false, Some(dir)) if dir.is_dir() => RestoreTree::Directory(dir.clone()),
                (false, Some(dir)) => {
                    return Err(ConfigError::Source(format!(
                        "{} is not a directory",
                        dir.display()
                    )))
                }
            };
            return Ok(RestorePlan::All(tree));
        }

        let database = self.database.clone().ok_or(ConfigError::MissingDatabase)?;
        let source = match (&self.file, &self.dir) {
            (Some(file), _) => RestoreSource::Aggregate(file.clone()),
            (None, Some(dir)) => RestoreSource::Directory(dir.clone()),
            (None, None) => return Err(ConfigError::MissingSource),
        };
        source
            .validate()
            .map_err(|e| ConfigError::Source(e.to_string()))?;
        Ok(RestorePlan::Single { database, source })
    }
}

impl Cli {
    /// Settings file, then flags, then validation.
    pub fn resolve_config(&self) -> Result<VaultConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => VaultConfig::from_file(path)?,
            None => VaultConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }

        match &self.command {
            Command::Dump(args) => {
                if let Some(jobs) = args.jobs {
                    config.jobs = jobs;
                }
                if let Some(program) = &args.filter {
                    let mut command = vec![program.clone()];
                    command.extend(args.filter_args.iter().cloned());
                    config.filter = Some(command);
                }
            }
            Command::Restore(args) => {
                if let Some(jobs) = args.jobs {
                    config.jobs = jobs;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub async fn run(self) -> Result<RunStatus> {
        let config = self.resolve_config()?;
        match &self.command {
            Command::Dump(args) => run_dump(&config, args).await,
            Command::Restore(args) => run_restore(&config, args).await,
        }
    }
}

fn load_filter(config: &VaultConfig) -> Result<Option<Arc<dyn DocumentFilter>>, ConfigError> {
    let Some(command) = &config.filter else {
        return Ok(None);
    };
    let filter = CommandFilter::from_command_line(command)
        .map_err(|e| ConfigError::Filter(e.to_string()))?;
    tracing::info!("Using filter {}", filter.program().display());
    Ok(Some(Arc::new(filter)))
}

async fn run_dump(config: &VaultConfig, args: &DumpArgs) -> Result<RunStatus> {
    let options = args.dump_options(load_filter(config)?)?;
    let couch = Couch::new(config)?;

    if args.all {
        let fanout_options = FanoutOptions {
            jobs: config.jobs,
            compress: args.compress,
            remove_after: false,
        };
        return match fanout::dump_all(&couch, &options, &fanout_options).await {
            Ok(summary) => Ok(report_fanout("dump", &summary)),
            Err(e) => {
                tracing::error!("{}", e);
                Ok(RunStatus::DatabaseFailure)
            }
        };
    }

    let database = args.database.as_deref().unwrap_or_default();
    match dump::dump(&couch, database, &options).await {
        Ok(report) => {
            tracing::info!(
                "Dumped {} entries of {} documents from db '{}' into {}",
                report.entries_written,
                report.documents,
                database,
                report.output.display()
            );
            for failure in &report.attachment_failures {
                tracing::warn!(
                    "[{}] attachment '{}' not saved: {}",
                    failure.id,
                    failure.name,
                    failure.reason
                );
            }
            Ok(RunStatus::Success)
        }
        Err(e) => {
            tracing::error!("{}", e);
            Ok(RunStatus::DatabaseFailure)
        }
    }
}

async fn run_restore(config: &VaultConfig, args: &RestoreArgs) -> Result<RunStatus> {
    let plan = args.plan()?;
    let options = args.restore_options();
    let couch = Couch::new(config)?;

    match plan {
        RestorePlan::Single { database, source } => {
            match restore::restore(&couch, &database, &source, &options).await {
                Ok(report) => {
                    tracing::info!(
                        "Restored {} of {} documents into db '{}' ({} failed, {} unconfirmed)",
                        report.restored,
                        report.documents,
                        database,
                        report.failures.len(),
                        report.indeterminate
                    );
                    Ok(RunStatus::Success)
                }
                Err(e) => {
                    tracing::error!("{}", e);
                    Ok(RunStatus::DatabaseFailure)
                }
            }
        }
        RestorePlan::All(tree) => {
            let fanout_options = FanoutOptions {
                jobs: config.jobs,
                compress: false,
                remove_after: args.remove_after,
            };
            match fanout::restore_all(&couch, &tree, &options, &fanout_options).await {
                Ok(summary) => Ok(report_fanout("restore", &summary)),
                Err(e) => {
                    tracing::error!("{}", e);
                    Ok(RunStatus::DatabaseFailure)
                }
            }
        }
    }
}

fn report_fanout(operation: &str, summary: &FanoutSummary) -> RunStatus {
    for result in &summary.results {
        match (&result.report, &result.error) {
            (Some(JobReport::Dump(report)), _) => tracing::info!(
                "db '{}': {} entries dumped in {} ms",
                result.database,
                report.entries_written,
                result.elapsed_ms
            ),
            (Some(JobReport::Restore(report)), _) => tracing::info!(
                "db '{}': {} of {} documents restored in {} ms",
                result.database,
                report.restored,
                report.documents,
                result.elapsed_ms
            ),
            (None, error) => tracing::error!(
                "db '{}': {} failed: {}",
                result.database,
                operation,
                error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    if let Some(archive) = &summary.archive {
        tracing::info!("Archive written to {}", archive.display());
    }
    tracing::info!(
        "{} finished: {} of {} databases succeeded",
        operation,
        summary.successful_databases,
        summary.total_databases
    );

    if summary.any_failed() {
        RunStatus::DatabaseFailure
    } else {
        RunStatus::Success
    }
}
