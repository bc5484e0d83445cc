//! Configuration structures for qjs-bridge.
//!
//! This module defines configuration options for the two layers of the bridge:
//! - [`BridgeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings shared by every machine
//! - [`MachineConfig`]: Per-machine limits (arena, guest heap, contexts)

use serde::{Deserialize, Serialize};

use crate::BridgeError;

/// Top-level bridge configuration.
///
/// Loaded from the `[bridge]` table of a config file, or built in code.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-machine configuration.
    #[serde(default)]
    pub machine: MachineConfig,
}

impl BridgeConfig {
    /// Check the configuration for values the bridge cannot operate with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        self.engine.validate()?;
        self.machine.validate()
    }
}

/// Wasmtime engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Use the pooling instance allocator.
    ///
    /// Worth enabling when many short-lived machines are created; each slot
    /// reserves `instance_memory_mb` of address space up front.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Linear memory per pooled instance in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled. Must leave room for
    /// the guest heap plus the host arena.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Maximum native stack the guest may use, in kilobytes.
    #[serde(default = "defaults::max_wasm_stack_kb")]
    pub max_wasm_stack_kb: u32,

    /// Compile with Cranelift's speed optimizations.
    #[serde(default = "defaults::optimize")]
    pub optimize: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            max_wasm_stack_kb: defaults::max_wasm_stack_kb(),
            optimize: defaults::optimize(),
        }
    }
}

impl EngineConfig {
    /// Maximum wasm stack in bytes.
    pub fn max_wasm_stack_bytes(&self) -> usize {
        self.max_wasm_stack_kb as usize * 1024
    }

    fn validate(&self) -> Result<(), BridgeError> {
        if self.max_wasm_stack_kb == 0 {
            return Err(BridgeError::invalid_config(
                "engine.max_wasm_stack_kb must be greater than zero",
            ));
        }
        if self.pooling_allocator && self.max_instances == 0 {
            return Err(BridgeError::invalid_config(
                "engine.max_instances must be greater than zero when pooling is enabled",
            ));
        }
        Ok(())
    }
}

/// Per-machine configuration.
///
/// These settings apply to each guest machine instance independently.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineConfig {
    /// Size of the host arena reserved in guest memory, in bytes.
    ///
    /// Rounded up to whole wasm pages when reserved.
    #[serde(default = "defaults::arena_size")]
    pub arena_size: u32,

    /// Guest heap limit in bytes passed to `qjs_set_memory_limit` (0 = unlimited).
    #[serde(default)]
    pub memory_limit: u32,

    /// Guest interpreter stack limit in bytes passed to `qjs_set_max_stack_size`
    /// (0 = keep the guest default).
    #[serde(default)]
    pub max_stack_size: u32,

    /// Maximum number of simultaneously open contexts per machine
    /// (1 to 65535).
    #[serde(default = "defaults::max_contexts")]
    pub max_contexts: u32,

    /// Buffer size for reading exception messages out of the guest.
    #[serde(default = "defaults::error_buffer_len")]
    pub error_buffer_len: u32,

    /// Install `print` and `console.*` in new contexts.
    #[serde(default = "defaults::console")]
    pub console: bool,

    /// Attach the guest stack trace to exception errors.
    #[serde(default = "defaults::capture_stack")]
    pub capture_stack: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            arena_size: defaults::arena_size(),
            memory_limit: 0,
            max_stack_size: 0,
            max_contexts: defaults::max_contexts(),
            error_buffer_len: defaults::error_buffer_len(),
            console: defaults::console(),
            capture_stack: defaults::capture_stack(),
        }
    }
}

impl MachineConfig {
    fn validate(&self) -> Result<(), BridgeError> {
        if self.arena_size < defaults::MIN_ARENA_SIZE {
            return Err(BridgeError::invalid_config(format!(
                "machine.arena_size must be at least {} bytes",
                defaults::MIN_ARENA_SIZE
            )));
        }
        if self.max_contexts == 0 || self.max_contexts > defaults::MAX_CONTEXTS {
            return Err(BridgeError::invalid_config(format!(
                "machine.max_contexts must be between 1 and {}",
                defaults::MAX_CONTEXTS
            )));
        }
        if self.error_buffer_len < 2 {
            return Err(BridgeError::invalid_config(
                "machine.error_buffer_len must hold at least one byte and a terminator",
            ));
        }
        Ok(())
    }
}

/// Default value functions for serde.
mod defaults {
    pub const MIN_ARENA_SIZE: u32 = 4096;
    pub const MAX_CONTEXTS: u32 = 65_535;

    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        64
    }

    pub const fn instance_memory_mb() -> u32 {
        256
    }

    pub const fn max_wasm_stack_kb() -> u32 {
        1024
    }

    pub const fn optimize() -> bool {
        true
    }

    pub const fn arena_size() -> u32 {
        4 * 1024 * 1024
    }

    pub const fn max_contexts() -> u32 {
        1024
    }

    pub const fn error_buffer_len() -> u32 {
        1024
    }

    pub const fn console() -> bool {
        true
    }

    pub const fn capture_stack() -> bool {
        true
    }
}
