//! Shared error types and the injectable debug log used across the lunaris crates.

pub mod errors;
pub mod log;
