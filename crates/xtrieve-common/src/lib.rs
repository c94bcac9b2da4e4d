//! Shared foundation for the Xtrieve engine.
//!
//! This crate holds the pieces every other Xtrieve crate depends on:
//! status codes and the error type, identifier newtypes, key descriptors
//! with their collation rules, and engine configuration.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::{StatusCode, XtrieveError, XtrieveResult};
