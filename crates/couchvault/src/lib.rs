#![warn(missing_docs)]

//! couchvault: dump, restore and fan-out backup of document databases over their HTTP API

pub mod archive;
pub mod cli;
pub mod client;
pub mod config;
pub mod dump;
pub mod error;
pub mod fanout;
pub mod filter;
pub mod json;
pub mod paths;
pub mod restore;

#[cfg(test)]
mod mock;

pub use client::{Couch, CouchResponse, DocumentQuery, HttpTransport, Transport};
pub use config::VaultConfig;
pub use dump::{dump, DumpError, DumpOptions, DumpReport, Dumper};
pub use error::{ClientError, ConfigError};
pub use fanout::{fan_out, FanoutMode, FanoutOptions, FanoutSummary, RestoreTree};
pub use filter::{CommandFilter, DocumentFilter, FilterError, FnFilter};
pub use restore::{restore, RestoreError, RestoreOptions, RestoreReport, RestoreSource, Restorer};
