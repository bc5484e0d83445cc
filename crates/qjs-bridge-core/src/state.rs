//! Per-machine store state.
//!
//! This module provides:
//! - [`MachineState`]: the data of a machine's Wasmtime store, reachable from
//!   host imports through [`wasmtime::Caller`]
//! - [`GuestLog`]: line buffering for guest diagnostic output

use std::sync::{Arc, Weak};

use tracing::{info, warn};
use uuid::Uuid;
use wasmtime::Store;
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use qjs_bridge_common::BridgeError;

use crate::BridgeEngine;
use crate::arena::BumpArena;
use crate::machine::MachineShared;

/// Receives each complete line of guest output.
pub type LogHandler = dyn Fn(&str) + Send + Sync;

/// Store data of one machine.
pub struct MachineState {
    /// WASI preview1 context: no preopens, no inherited environment.
    wasi: WasiP1Ctx,

    /// Back-reference used by callback dispatch.
    pub(crate) machine: Weak<MachineShared>,

    /// Unique machine identifier for tracing.
    machine_id: Uuid,

    pub(crate) log: GuestLog,

    /// Host-owned transient region inside guest memory.
    pub(crate) arena: BumpArena,

    /// Gate depth of the operation currently using the store.
    pub(crate) depth: usize,

    /// Arena wraps that happened below the outermost operation.
    pub(crate) nested_wraps: u64,
}

impl MachineState {
    /// Create state for a new machine.
    pub fn new(machine_id: Uuid) -> Self {
        let wasi = WasiCtxBuilder::new()
            .inherit_stdout()
            .inherit_stderr()
            .build_p1();

        Self {
            wasi,
            machine: Weak::new(),
            machine_id,
            log: GuestLog::default(),
            arena: BumpArena::empty(),
            depth: 0,
            nested_wraps: 0,
        }
    }

    /// The WASI context, for linking `wasi_snapshot_preview1`.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Unique identifier of the machine owning this store.
    pub fn machine_id(&self) -> Uuid {
        self.machine_id
    }

    /// Guest output buffer.
    pub fn log_mut(&mut self) -> &mut GuestLog {
        &mut self.log
    }

    /// Place `sizes.len()` buffers in the arena as one batch.
    ///
    /// A wrap while a nested operation is in flight may have invalidated
    /// buffers of the enclosing operation, so it is reported.
    pub(crate) fn arena_batch(&mut self, sizes: &[usize]) -> Result<Vec<u32>, BridgeError> {
        let (addrs, wrapped) = self.arena.alloc_many(sizes)?;
        if wrapped && self.depth > 1 {
            self.nested_wraps += 1;
            warn!(
                machine_id = %self.machine_id,
                depth = self.depth,
                capacity = self.arena.capacity(),
                "Arena wrapped during a nested operation"
            );
        }
        Ok(addrs)
    }
}

impl std::fmt::Debug for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineState")
            .field("machine_id", &self.machine_id)
            .field("arena", &self.arena)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

/// Line buffer for the guest's `env.host_log` output.
///
/// The guest emits fragments (`print("a", "b")` arrives as `a`, ` `, `b`,
/// `\n`), so output is delivered one complete line at a time.
#[derive(Default)]
pub struct GuestLog {
    partial: Vec<u8>,
    handler: Option<Arc<LogHandler>>,
}

impl GuestLog {
    /// Append a fragment and return every line it completed.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in fragment {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.partial);
                lines.push(String::from_utf8_lossy(&line).into_owned());
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    /// Take the unterminated tail, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            let line = std::mem::take(&mut self.partial);
            Some(String::from_utf8_lossy(&line).into_owned())
        }
    }

    /// Emit a line as a `guest_log` event and pass it to the handler.
    ///
    /// The handler runs while the guest is suspended inside an import, so
    /// it must not call back into the machine.
    pub fn deliver(&self, machine_id: Uuid, line: &str) {
        info!(machine_id = %machine_id, guest_log = true, "{}", line);
        if let Some(handler) = &self.handler {
            handler(line);
        }
    }

    /// Replace the line handler.
    pub fn set_handler(&mut self, handler: Option<Arc<LogHandler>>) {
        self.handler = handler;
    }

    /// Returns `true` if a handler is installed.
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }
}

impl std::fmt::Debug for GuestLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestLog")
            .field("partial_len", &self.partial.len())
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Create a new Wasmtime store for a machine.
pub fn create_store(engine: &BridgeEngine, machine_id: Uuid) -> Store<MachineState> {
    Store::new(engine.inner(), MachineState::new(machine_id))
}
