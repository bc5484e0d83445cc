//! Wasmtime engine configuration and creation.
//!
//! The [`BridgeEngine`] is shared by every machine created from it. It is:
//! - Thread-safe and cheap to clone
//! - Synchronous: the guest never suspends, so no async support is compiled in
//! - Optionally backed by the pooling allocator for fast machine creation

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, InstanceAllocationStrategy, OptLevel, PoolingAllocationConfig};

use qjs_bridge_common::{BridgeError, EngineConfig};

/// Thread-safe WebAssembly engine wrapper.
///
/// Wraps a Wasmtime [`Engine`] configured for running the QuickJS guest. The
/// engine holds no per-machine state; compile the guest once and create as
/// many machines from it as needed.
///
/// # Example
///
/// ```ignore
/// use qjs_bridge_common::EngineConfig;
/// use qjs_bridge_core::BridgeEngine;
///
/// let engine = BridgeEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct BridgeEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl BridgeEngine {
    /// Create a new engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is rejected, for example
    /// when the pooling allocator cannot reserve its address space.
    pub fn new(config: &EngineConfig) -> Result<Self, BridgeError> {
        let mut wasmtime_config = Config::new();

        // Interpreter recursion is bounded by this, not by the host thread.
        wasmtime_config.max_wasm_stack(config.max_wasm_stack_bytes());

        wasmtime_config.cranelift_opt_level(if config.optimize {
            OptLevel::Speed
        } else {
            OptLevel::None
        });

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            BridgeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            max_wasm_stack_kb = config.max_wasm_stack_kb,
            optimize = config.optimize,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Create pooling allocation configuration.
    ///
    /// Each machine is one core instance with one memory and one table.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for BridgeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_instances", &self.config.max_instances)
            .field("max_wasm_stack_kb", &self.config.max_wasm_stack_kb)
            .finish_non_exhaustive()
    }
}
