//! Authentication for operator routes

pub mod operator;

pub use operator::{require_operator, OperatorIdentity};
