//! Error types for qjs-bridge.
//!
//! [`BridgeError`] covers every failure a bridge operation can report:
//! - allocation exhaustion (guest handle slots, arena, context registry)
//! - guest exceptions recovered by the evaluation pipeline
//! - faults at the wasm boundary (traps, bad pointers, missing exports)
//!
//! Misuse of handles (double release, resolving a stale handle, calling an
//! unregistered callback id) is deliberately absent: those paths degrade to
//! no-ops or `undefined` instead of producing an error.

use std::io;

use thiserror::Error;

/// Message used when the guest raised an exception without a readable message.
pub const DEFAULT_EXCEPTION_MESSAGE: &str = "JavaScript exception";

/// Errors surfaced by the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The evaluated code threw, or a guest operation left an exception pending.
    #[error("{message}")]
    Exception {
        /// The exception's `message` property (or its string form).
        message: String,
        /// The exception's `stack` property, when captured.
        stack: Option<String>,
    },

    /// The guest handle table had no free slot.
    #[error("Handle table exhausted during {operation}")]
    HandlesExhausted {
        /// The guest entry point that failed to allocate.
        operation: &'static str,
    },

    /// A single arena request exceeded the arena's total capacity.
    #[error("Arena exhausted: requested {requested} bytes, capacity {capacity} bytes")]
    ArenaExhausted {
        /// Requested size in bytes (after alignment).
        requested: usize,
        /// Total arena capacity in bytes.
        capacity: usize,
    },

    /// The machine already holds the configured maximum number of contexts.
    #[error("Context limit reached: {limit}")]
    ContextLimit {
        /// The configured limit.
        limit: u32,
    },

    /// A guest address range fell outside linear memory.
    #[error("Guest memory access out of bounds: ptr={ptr} len={len} memory_size={memory_size}")]
    OutOfBounds {
        /// Start address.
        ptr: u32,
        /// Length of the access.
        len: usize,
        /// Current size of linear memory in bytes.
        memory_size: usize,
    },

    /// The guest trapped.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// The guest module does not export a required entry point.
    #[error("Guest export missing or mistyped: {name}")]
    MissingExport {
        /// Name of the export.
        name: String,
    },

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Instantiating the guest or creating its runtime failed.
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed {
        /// Description of the failure.
        reason: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// The store was already borrowed on this thread outside a callback.
    #[error("Machine store is busy")]
    StoreBusy,

    /// A value was passed to a machine other than the one that created it.
    #[error("Value belongs to a different machine")]
    ForeignValue,

    /// A host function reported a failure.
    #[error("Host function error: {reason}")]
    Callback {
        /// Description of the failure, rethrown into the guest.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Create a new `Exception` error without a stack.
    pub fn exception(message: impl Into<String>) -> Self {
        Self::Exception {
            message: message.into(),
            stack: None,
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `MissingExport` error.
    pub fn missing_export(name: impl Into<String>) -> Self {
        Self::MissingExport { name: name.into() }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a new `Callback` error.
    pub fn callback(reason: impl Into<String>) -> Self {
        Self::Callback {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error is a guest exception.
    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Exception { .. })
    }

    /// Returns `true` if an allocation limit was hit.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            Self::HandlesExhausted { .. } | Self::ArenaExhausted { .. } | Self::ContextLimit { .. }
        )
    }

    /// The guest stack trace attached to an exception, if any.
    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Exception { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}
