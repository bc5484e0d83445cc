//! Guest module compilation and loading.
//!
//! [`GuestModule`] wraps the compiled QuickJS guest. It can be built from:
//! - raw `.wasm` bytes or a `.wasm` file (JIT, slower cold start)
//! - a precompiled artifact produced by `wasmtime compile` (fast cold start)
//! - WAT text, which the tests use for small mock guests

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmtime::{Engine, Module};

use qjs_bridge_common::BridgeError;

use crate::exports::GuestExports;

/// A compiled guest module.
///
/// Cheap to clone and shareable across threads; every machine instantiates
/// its own copy.
#[derive(Clone)]
pub struct GuestModule {
    module: Module,

    /// Hash of the source bytes, used to correlate logs.
    content_hash: String,
}

impl GuestModule {
    /// Compile a guest from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid core module.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, BridgeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            BridgeError::compilation_failed(format!("Guest module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Guest module compiled"
        );

        Ok(Self {
            module,
            content_hash,
        })
    }

    /// Read and compile a `.wasm` file.
    pub fn from_file(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        debug!(path = %path.display(), "Guest module read");
        Self::from_bytes(engine, &bytes)
    }

    /// Load a precompiled guest artifact (`.cwasm`).
    ///
    /// Only load artifacts produced by the same Wasmtime version and engine
    /// settings. Deserializing arbitrary bytes is undefined behavior.
    #[allow(unsafe_code)]
    #[instrument(skip(engine, path))]
    pub fn from_precompiled(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let start = Instant::now();

        // SAFETY: the caller vouches for the artifact's origin; Wasmtime still
        // checks version and configuration compatibility.
        let module = unsafe { Module::deserialize_file(engine, path) }.map_err(|e| {
            BridgeError::compilation_failed(format!(
                "Failed to load precompiled guest from {}: {e}",
                path.display()
            ))
        })?;

        // Convention: {hash}.cwasm
        let content_hash = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        debug!(
            path = %path.display(),
            content_hash = %content_hash,
            duration_us = start.elapsed().as_micros(),
            "Precompiled guest loaded"
        );

        Ok(Self {
            module,
            content_hash,
        })
    }

    /// Compile a guest from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, BridgeError> {
        let module = Module::new(engine, wat)
            .map_err(|e| BridgeError::compilation_failed(format!("WAT compilation failed: {e}")))?;

        let content_hash = compute_hash(wat.as_bytes());
        debug!(content_hash = %content_hash, "WAT guest compiled");

        Ok(Self {
            module,
            content_hash,
        })
    }

    /// Serialize the compiled guest for later [`GuestModule::from_precompiled`].
    pub fn serialize(&self) -> Result<Vec<u8>, BridgeError> {
        self.module.serialize().map_err(|e| {
            BridgeError::compilation_failed(format!("Guest serialization failed: {e}"))
        })
    }

    /// Names of required `qjs_*` exports this module does not provide.
    ///
    /// Only presence is checked here; signatures are checked at instantiation.
    pub fn missing_exports(&self) -> Vec<&'static str> {
        GuestExports::SIGNATURES
            .iter()
            .map(|signature| signature.name)
            .filter(|name| self.module.get_export(name).is_none())
            .collect()
    }

    /// Returns `true` if the module exports `name`.
    pub fn has_export(&self, name: &str) -> bool {
        self.module.get_export(name).is_some()
    }

    /// Get the content hash of the source bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.module
    }

    /// Validate the WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), BridgeError> {
        if bytes.len() < 8 {
            return Err(BridgeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(BridgeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for GuestModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BridgeEngine;
    use qjs_bridge_common::EngineConfig;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    fn engine() -> BridgeEngine {
        BridgeEngine::new(&EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_validate_wasm_header() {
        assert!(GuestModule::validate_wasm_header(MINIMAL_WASM).is_ok());
        assert!(GuestModule::validate_wasm_header(&[0x00, 0x61]).is_err());

        let bad_wasm = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        assert!(GuestModule::validate_wasm_header(bad_wasm).is_err());
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn test_empty_module_lacks_every_export() {
        let module = GuestModule::from_bytes(engine().inner(), MINIMAL_WASM).unwrap();

        assert!(!module.content_hash().is_empty());
        assert_eq!(module.missing_exports().len(), GuestExports::SIGNATURES.len());
        assert!(!module.has_export("qjs_eval"));
    }

    #[test]
    fn test_from_wat_export_check() {
        let module = GuestModule::from_wat(
            engine().inner(),
            r#"(module (func (export "qjs_reset_heap")))"#,
        )
        .unwrap();

        assert!(module.has_export("qjs_reset_heap"));
        assert!(!module.missing_exports().contains(&"qjs_reset_heap"));
        assert!(module.missing_exports().contains(&"qjs_eval"));
    }

    #[test]
    fn test_from_file_missing() {
        let err = GuestModule::from_file(engine().inner(), "/nonexistent/guest.wasm").unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let engine = engine();
        let module = GuestModule::from_bytes(engine.inner(), MINIMAL_WASM).unwrap();
        let bytes = module.serialize().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deadbeef.cwasm");
        std::fs::write(&path, bytes).unwrap();

        let loaded = GuestModule::from_precompiled(engine.inner(), &path).unwrap();
        assert_eq!(loaded.content_hash(), "deadbeef");
    }
}
