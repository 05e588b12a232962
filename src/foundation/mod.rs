//! Shared value types and the crate-wide error model.

pub mod core;
pub mod error;
