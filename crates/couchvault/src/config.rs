use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u32 = 5984;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_REDIRECTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub host: String,
    pub port: u32,
    pub timeout_secs: u64,
    pub max_redirects: usize,
    pub user_agent: String,
    /// Number of databases processed concurrently by fan-out; 0 or 1 runs inline.
    pub jobs: usize,
    /// Filter plugin command line: program followed by its arguments.
    pub filter: Option<Vec<String>>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: DEFAULT_PORT,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: format!("couchvault/{}", env!("CARGO_PKG_VERSION")),
            jobs: 0,
            filter: None,
        }
    }
}

impl VaultConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file_error = |msg: String| ConfigError::File {
            path: path.display().to_string(),
            msg,
        };

        let contents = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| file_error(e.to_string())),
            "json" => serde_json::from_str(&contents).map_err(|e| file_error(e.to_string())),
            _ => Err(file_error(format!("unsupported config file extension: {}", ext))),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() || self.port < 1 || self.port > 65535 {
            return Err(ConfigError::InvalidAddress {
                host: self.host.clone(),
                port: self.port,
            });
        }
        Ok(())
    }

    /// Server root URL. A host given with an explicit scheme is used as-is.
    pub fn base_url(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}", host, self.port)
        } else {
            format!("http://{}:{}", host, self.port)
        }
    }
}
