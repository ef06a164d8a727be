//! Environment-driven configuration for the authentication core.
//!
//! This crate has no file format of its own — the auth core's entire
//! configuration surface is a fixed set of environment variables.
//! `AuthEnvConfig` resolves them into a typed, `Default`-able struct the way
//! a config loader resolves a TOML file, including a tolerant-parse-with-
//! warning policy for malformed values.

pub mod env;

pub use env::AuthEnvConfig;
