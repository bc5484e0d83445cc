//! Configuration file structures for qjs-bridge.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`GuestConfig`]: Where to find the guest interpreter module

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::BridgeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [bridge.engine]
/// max_wasm_stack_kb = 2048
///
/// [bridge.machine]
/// arena_size = 8_388_608
/// memory_limit = 67_108_864
/// max_contexts = 64
///
/// [guest]
/// path = "./guest/quickjs.wasm"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Bridge configuration (engine + machine settings).
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Guest module location.
    #[serde(default)]
    pub guest: GuestConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let config = Self::from_toml(&content)?;
        debug!(path = %path.display(), "Configuration file loaded");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Guest module settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GuestConfig {
    /// Path to the QuickJS guest module (`.wasm`, or `.cwasm` when precompiled).
    #[serde(default)]
    pub path: Option<String>,

    /// Treat `path` as a precompiled artifact produced by the same Wasmtime version.
    #[serde(default)]
    pub precompiled: bool,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert!(config.guest.path.is_none());
        assert!(!config.guest.precompiled);
        assert_eq!(config.bridge.machine.max_contexts, 1024);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [guest]
            path = "./quickjs.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.guest.path.as_deref(), Some("./quickjs.wasm"));
        // Defaults applied
        assert_eq!(config.bridge.machine.arena_size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [bridge.engine]
            pooling_allocator = true
            max_instances = 16
            max_wasm_stack_kb = 2048

            [bridge.machine]
            arena_size = 8_388_608
            memory_limit = 67_108_864
            max_stack_size = 262_144
            max_contexts = 64
            console = false
            capture_stack = false

            [guest]
            path = "./quickjs.cwasm"
            precompiled = true
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert!(config.bridge.engine.pooling_allocator);
        assert_eq!(config.bridge.engine.max_instances, 16);
        assert_eq!(config.bridge.engine.max_wasm_stack_kb, 2048);
        assert_eq!(config.bridge.machine.arena_size, 8 * 1024 * 1024);
        assert_eq!(config.bridge.machine.memory_limit, 64 * 1024 * 1024);
        assert_eq!(config.bridge.machine.max_stack_size, 256 * 1024);
        assert_eq!(config.bridge.machine.max_contexts, 64);
        assert!(!config.bridge.machine.console);
        assert!(!config.bridge.machine.capture_stack);
        assert!(config.guest.precompiled);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[bridge.machine]\nmax_contexts = 3").unwrap();

        let config = ConfigFile::from_file(file.path()).unwrap();
        assert_eq!(config.bridge.machine.max_contexts, 3);
    }

    #[test]
    fn test_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigFile::from_file(dir.path().join("missing.toml"));

        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }
}
