//! Configuration module for the pipeline
//!
//! YAML configuration with defaults for every section, `.env` loading and
//! API key resolution.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;
