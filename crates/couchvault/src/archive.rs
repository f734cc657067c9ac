//! Packaging of dump trees as gzip-compressed tar archives.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ARCHIVE_EXTENSION: &str = "tar.gz";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{path} is not a directory")]
    NotADirectory { path: PathBuf },
    #[error("archive I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("archive task failed: {0}")]
    Task(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Path of the archive produced for `dir`: a sibling `<dir>.tar.gz`.
pub fn archive_path(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_os_string();
    name.push(".");
    name.push(ARCHIVE_EXTENSION);
    PathBuf::from(name)
}

fn pack_blocking(dir: &Path) -> Result<PathBuf, ArchiveError> {
    if !dir.is_dir() {
        return Err(ArchiveError::NotADirectory {
            path: dir.to_path_buf(),
        });
    }

    let target = archive_path(dir);
    let file = File::create(&target).map_err(io_error(&target))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder
        .append_dir_all(".", dir)
        .map_err(io_error(dir))?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(io_error(&target))?;
    Ok(target)
}

fn unpack_blocking(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive).map_err(io_error(archive))?;
    std::fs::create_dir_all(dest).map_err(io_error(dest))?;
    tar::Archive::new(GzDecoder::new(file))
        .unpack(dest)
        .map_err(io_error(archive))
}

async fn blocking<T, F>(work: F) -> Result<T, ArchiveError>
where
    F: FnOnce() -> Result<T, ArchiveError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))?
}

/// Packs `dir` into `<dir>.tar.gz`, entries relative to `dir`.
pub async fn pack_directory(dir: &Path) -> Result<PathBuf, ArchiveError> {
    let dir = dir.to_path_buf();
    tracing::info!("Compressing {}", dir.display());
    blocking(move || pack_blocking(&dir)).await
}

/// Extracts `archive` into `dest`, creating it if needed.
pub async fn unpack_archive(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let (archive, dest) = (archive.to_path_buf(), dest.to_path_buf());
    tracing::info!("Extracting {} into {}", archive.display(), dest.display());
    blocking(move || unpack_blocking(&archive, &dest)).await
}

pub async fn remove_tree(dir: &Path) -> Result<(), ArchiveError> {
    tracing::info!("Removing {}", dir.display());
    tokio::fs::remove_dir_all(dir).await.map_err(io_error(dir))
}
