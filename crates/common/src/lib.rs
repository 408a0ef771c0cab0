//! Shared types and error utilities used across all embergram crates.

pub mod error;
pub mod types;

pub use {error::FromMessage, types::Recipient};
