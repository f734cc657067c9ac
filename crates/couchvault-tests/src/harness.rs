//! Test Harness - mock server plus scratch directory per test

use crate::mock_couch::MockCouch;
use couchvault::Couch;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct TestEnv {
    temp_dir: TempDir,
    server: MockCouch,
    test_name: String,
}

impl TestEnv {
    pub async fn start(test_name: &str) -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        Self {
            temp_dir,
            server: MockCouch::start().await,
            test_name: test_name.to_string(),
        }
    }

    pub fn server(&self) -> &MockCouch {
        &self.server
    }

    /// Client over real HTTP to the mock server.
    pub fn couch(&self) -> Couch {
        Couch::new(&self.server.config()).expect("failed to build client")
    }

    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.temp_dir.path().join(relative)
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }
}

pub fn read_json(path: &Path) -> Value {
    let text = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("cannot read {}: {}", path.display(), e));
    serde_json::from_str(&text).unwrap_or_else(|e| panic!("invalid JSON in {}: {}", path.display(), e))
}

/// Sorted names of the regular files directly under `dir`.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap_or_else(|e| panic!("cannot list {}: {}", dir.display(), e))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    names
}

/// The single entry directly under `dir`, e.g. a freshly named backup root.
pub fn only_entry(dir: &Path) -> PathBuf {
    let entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap_or_else(|e| panic!("cannot list {}: {}", dir.display(), e))
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();
    assert_eq!(entries.len(), 1, "expected one entry in {}", dir.display());
    entries.into_iter().next().unwrap()
}
