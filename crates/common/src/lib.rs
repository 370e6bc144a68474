//! Shared error taxonomy used across all mememo crates.

pub mod error;

pub use error::{Error, FromMessage, Result, ensure};
