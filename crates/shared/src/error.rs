//! Error types shared across Memberpass crates

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SharedError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid month: {0}")]
    InvalidMonth(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
