//! Common types, errors, and configuration for qjs-bridge.
//!
//! This crate provides shared functionality used across the qjs-bridge workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for the engine and per-machine limits
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{BridgeConfig, EngineConfig, MachineConfig};
pub use config_file::{ConfigFile, ConfigFileError, GuestConfig};
pub use error::{BridgeError, DEFAULT_EXCEPTION_MESSAGE};
