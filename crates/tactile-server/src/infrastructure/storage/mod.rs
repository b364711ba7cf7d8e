//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the server's TOML configuration, falling
//! back to defaults when the file does not exist yet, and writes it back.

pub mod config;
