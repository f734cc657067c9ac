//! Error types shared across the dump, restore and fan-out paths.

use thiserror::Error;

/// Invalid or conflicting settings, detected before any network call.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Host is empty or the port is outside `1..=65535`.
    #[error("invalid server address: host '{host}', port {port}")]
    InvalidAddress {
        /// Configured host.
        host: String,
        /// Configured port.
        port: u32,
    },

    /// A single-database operation was requested without a database name.
    #[error("please specify a database name (-d <DATABASE>)")]
    MissingDatabase,

    /// Restore was requested without a file or directory to read from.
    #[error("please specify a dump file (-f <FILE>) or directory (-s <DIR>) to restore")]
    MissingSource,

    /// Binary attachment download only works on dumps without history.
    #[error("binary attachments (-A) require a dump without revision history (-X)")]
    BinaryAttachmentsWithHistory,

    /// The restore source does not exist or has the wrong type.
    #[error("restore source not usable: {0}")]
    Source(String),

    /// The filter program could not be resolved at startup.
    #[error("filter program not usable: {0}")]
    Filter(String),

    /// The configuration file could not be read or parsed.
    #[error("config file {path}: {msg}")]
    File {
        /// Path of the configuration file.
        path: String,
        /// Reader or parser message.
        msg: String,
    },

    /// The HTTP client could not be built from the configuration.
    #[error("cannot build HTTP client: {0}")]
    Client(String),
}

/// Failure to complete a request against the database server.
///
/// A non-success HTTP status is not a `ClientError`: callers receive the
/// status and decide. This only covers requests that never produced one.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection refused, timeout, redirect limit or body read failure.
    #[error("request {method} {path} failed: {msg}")]
    Transport {
        /// HTTP method of the failed request.
        method: String,
        /// Request path, relative to the server root.
        path: String,
        /// Underlying transport message.
        msg: String,
    },

    /// The response body was not the JSON the caller expected.
    #[error("invalid JSON in response to {path}: {source}")]
    InvalidJson {
        /// Request path, relative to the server root.
        path: String,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },
}
