//! Ready-to-use guest wiring.
//!
//! [`Bridge`] holds everything machines share: the engine, the compiled
//! guest, a linker with every host import registered, and the callback
//! table. Creating a machine from it is a single call.

use std::path::Path;
use std::sync::Arc;

use tracing::info;
use wasmtime::Linker;

use qjs_bridge_common::{BridgeConfig, BridgeError, ConfigFile};
use qjs_bridge_core::{BridgeEngine, CallbackTable, GuestModule, MachineState, Runtime};

use crate::linker::register_all;

/// Factory for guest machines.
///
/// Cheap to clone; clones share the compiled guest and the callback table.
#[derive(Clone)]
pub struct Bridge {
    engine: BridgeEngine,
    module: GuestModule,
    linker: Arc<Linker<MachineState>>,
    callbacks: Arc<CallbackTable>,
    config: BridgeConfig,
}

impl Bridge {
    /// Compile the guest from WebAssembly bytes.
    pub fn from_bytes(config: BridgeConfig, bytes: &[u8]) -> Result<Self, BridgeError> {
        config.validate()?;
        let engine = BridgeEngine::new(&config.engine)?;
        let module = GuestModule::from_bytes(engine.inner(), bytes)?;
        Self::assemble(engine, module, config)
    }

    /// Read and compile a guest `.wasm` file.
    pub fn from_file(config: BridgeConfig, path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        config.validate()?;
        let engine = BridgeEngine::new(&config.engine)?;
        let module = GuestModule::from_file(engine.inner(), path)?;
        Self::assemble(engine, module, config)
    }

    /// Load a guest artifact precompiled by the same Wasmtime version.
    pub fn from_precompiled(
        config: BridgeConfig,
        path: impl AsRef<Path>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        let engine = BridgeEngine::new(&config.engine)?;
        let module = GuestModule::from_precompiled(engine.inner(), path)?;
        Self::assemble(engine, module, config)
    }

    /// Compile a guest from WAT. Used by tests with mock guests.
    pub fn from_wat(config: BridgeConfig, wat: &str) -> Result<Self, BridgeError> {
        config.validate()?;
        let engine = BridgeEngine::new(&config.engine)?;
        let module = GuestModule::from_wat(engine.inner(), wat)?;
        Self::assemble(engine, module, config)
    }

    /// Build a bridge from a parsed configuration file.
    ///
    /// `guest_override` takes precedence over `[guest] path`.
    pub fn from_config_file(
        file: &ConfigFile,
        guest_override: Option<&Path>,
    ) -> Result<Self, BridgeError> {
        let path = guest_override
            .map(Path::to_path_buf)
            .or_else(|| file.guest.path.as_ref().map(Into::into))
            .ok_or_else(|| BridgeError::invalid_config("no guest module configured"))?;

        if file.guest.precompiled {
            Self::from_precompiled(file.bridge.clone(), path)
        } else {
            Self::from_file(file.bridge.clone(), path)
        }
    }

    fn assemble(
        engine: BridgeEngine,
        module: GuestModule,
        config: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        let missing = module.missing_exports();
        if !missing.is_empty() {
            return Err(BridgeError::missing_export(missing.join(", ")));
        }

        let mut linker = Linker::new(engine.inner());
        register_all(&mut linker)?;

        info!(
            content_hash = %module.content_hash(),
            pooling = engine.is_pooling_enabled(),
            "Bridge ready"
        );

        Ok(Self {
            engine,
            module,
            linker: Arc::new(linker),
            callbacks: Arc::new(CallbackTable::new()),
            config,
        })
    }

    /// Create a new machine.
    pub fn new_runtime(&self) -> Result<Runtime, BridgeError> {
        Runtime::new(
            &self.engine,
            &self.module,
            &self.linker,
            &self.config.machine,
            Arc::clone(&self.callbacks),
        )
    }

    /// The callback table shared by every machine of this bridge.
    pub fn callbacks(&self) -> &Arc<CallbackTable> {
        &self.callbacks
    }

    /// The compiled guest.
    pub fn module(&self) -> &GuestModule {
        &self.module
    }

    /// The configuration machines are created with.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("module", &self.module)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}
