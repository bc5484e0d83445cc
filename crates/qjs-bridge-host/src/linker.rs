//! Host function registration for Wasmtime linkers.
//!
//! The QuickJS guest imports two functions from `env` plus WASI preview1.
//! This module registers all of them on a [`Linker<MachineState>`].

use qjs_bridge_common::BridgeError;
use qjs_bridge_core::MachineState;
use qjs_bridge_core::dispatch;
use qjs_bridge_core::exports::MEMORY_EXPORT;
use tracing::warn;
use wasmtime::{Caller, Linker};

use crate::logging::LoggingHost;

/// Register every import the guest needs.
///
/// This registers:
/// - `wasi_snapshot_preview1::*` from `wasmtime-wasi`
/// - `env::host_log` for guest diagnostic output
/// - `env::host_call_go` for callback dispatch
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(linker: &mut Linker<MachineState>) -> Result<(), BridgeError> {
    register_wasi(linker)?;
    register_logging(linker)?;
    register_dispatch(linker)?;
    Ok(())
}

/// Register WASI preview1.
///
/// The guest gets inherited stdout/stderr, no preopened directories and no
/// environment.
pub fn register_wasi(linker: &mut Linker<MachineState>) -> Result<(), BridgeError> {
    wasmtime_wasi::preview1::add_to_linker_sync(linker, MachineState::wasi_mut).map_err(|e| {
        BridgeError::invalid_config(format!("Failed to register WASI preview1: {e}"))
    })
}

/// Register the logging host function.
///
/// Registers `env::host_log(ptr: u32, len: u32)`, through which `print` and
/// `console.*` emit their output.
///
/// # Memory Protocol
///
/// The guest passes:
/// - `ptr`: pointer to the fragment in guest memory
/// - `len`: length of the fragment in bytes (UTF-8, no terminator)
///
/// A fragment is not necessarily a full line; see
/// [`qjs_bridge_core::GuestLog`].
pub fn register_logging(linker: &mut Linker<MachineState>) -> Result<(), BridgeError> {
    linker
        .func_wrap(
            "env",
            "host_log",
            |mut caller: Caller<'_, MachineState>, ptr: u32, len: u32| {
                let Some(memory) = caller
                    .get_export(MEMORY_EXPORT)
                    .and_then(wasmtime::Extern::into_memory)
                else {
                    warn!("Memory export not found in guest module");
                    return;
                };

                let fragment = match qjs_bridge_core::transport::read_bytes(
                    memory.data(&caller),
                    ptr,
                    len as usize,
                ) {
                    Ok(bytes) => bytes.to_vec(),
                    Err(e) => {
                        warn!(error = %e, "Guest log fragment out of bounds");
                        return;
                    }
                };

                LoggingHost::write(caller.data_mut(), &fragment);
            },
        )
        .map_err(|e| {
            BridgeError::invalid_config(format!("Failed to register host_log function: {e}"))
        })?;

    Ok(())
}

/// Register the callback dispatch host function.
///
/// Registers `env::host_call_go(ctx: u32, func_id: u32, argc: i32, argv: u32)
/// -> u32`, called by every guest function created with
/// `qjs_new_c_function`. The result is a guest handle.
pub fn register_dispatch(linker: &mut Linker<MachineState>) -> Result<(), BridgeError> {
    linker
        .func_wrap(
            "env",
            "host_call_go",
            |mut caller: Caller<'_, MachineState>,
             ctx_ptr: u32,
             func_id: u32,
             argc: i32,
             argv_ptr: u32|
             -> wasmtime::Result<u32> {
                dispatch::invoke(&mut caller, ctx_ptr, func_id, argc, argv_ptr)
                    .map_err(wasmtime::Error::new)
            },
        )
        .map_err(|e| {
            BridgeError::invalid_config(format!("Failed to register host_call_go function: {e}"))
        })?;

    Ok(())
}
