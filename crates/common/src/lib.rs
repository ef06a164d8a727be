//! Shared error plumbing used across the `keyhold` crates.

pub mod error;

pub use error::{Error, FromMessage, Result};
