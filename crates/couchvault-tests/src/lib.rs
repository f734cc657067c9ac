//! couchvault test & validation infrastructure
//!
//! An axum-based mock of the database HTTP API plus a test environment
//! harness, and the end-to-end dump, restore and fan-out scenarios that run
//! the real reqwest transport against it.

pub mod harness;
pub mod mock_couch;

#[cfg(test)]
mod cli_tests;

pub use harness::TestEnv;
pub use mock_couch::{MockCouch, RevStatus};
