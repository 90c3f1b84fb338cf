//! Memberpass Shared Types and Utilities
//!
//! Types, errors, and database helpers shared by the billing engine, the API
//! server and the background worker.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
