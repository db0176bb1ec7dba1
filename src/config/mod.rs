// src/config/mod.rs

//! Configuration loading and validation for jobflow.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate it into a `ConfigFile` (`validate.rs`).
//! - Turn it into tasks, workflows and edges for the engine (`catalog.rs`).

pub mod catalog;
pub mod loader;
pub mod model;
pub mod validate;

pub use catalog::Catalog;
pub use loader::{
    default_config_path, load_and_validate, load_from_path, parse_and_validate, parse_raw,
};
pub use model::{
    ConfigFile, EngineSection, LockBackend, LockSection, NotifySection, RawConfigFile, TaskConfig,
    WorkflowConfig,
};
