//! Guest-to-host callback dispatch.
//!
//! Every host function the guest can call is a `qjs_new_c_function` object
//! carrying a callback id. Calling it lands in `env.host_call_go`, which
//! forwards here. The callback runs while the guest is suspended inside that
//! import, so it reaches the store through the import's [`Caller`].

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, debug_span, warn};
use wasmtime::Caller;

use qjs_bridge_common::BridgeError;

use crate::context::Context;
use crate::machine::{MachineShared, PendingRelease};
use crate::state::MachineState;
use crate::value::Value;

/// Run the host callback `func_id` for a guest call.
///
/// `argv_ptr` points at `argc` guest handles. The handles belong to the
/// dispatcher and are released once the callback returns. The returned
/// handle is what the guest call evaluates to:
/// - `0` (undefined) when `func_id` is not registered
/// - the exception marker when the callback fails or panics
/// - otherwise the callback's result, whose ownership passes to the guest
///
/// # Errors
///
/// Fails only when the machine can no longer be used (it is poisoned or
/// being torn down). The import turns that into a trap.
pub fn invoke(
    caller: &mut Caller<'_, MachineState>,
    ctx_ptr: u32,
    func_id: u32,
    argc: i32,
    argv_ptr: u32,
) -> Result<u32, BridgeError> {
    let Some(machine) = caller.data().machine.upgrade() else {
        warn!(func_id, "Callback dispatched without a live machine");
        return Ok(0);
    };
    machine.callbacks_dispatched.fetch_add(1, Ordering::Relaxed);

    let token = machine.publish_caller(caller);
    let span = debug_span!(
        "host_call",
        machine_id = %machine.id(),
        ctx = ctx_ptr,
        func_id,
        depth = token.depth()
    );
    let _entered = span.enter();

    let count = usize::try_from(argc).unwrap_or(0);
    let handles = machine.with_store(|cx| machine.memory.read_u32_array(&*cx, argv_ptr, count))?;

    let ctx = Context::for_dispatch(&machine, ctx_ptr);
    let args: Vec<Value> = handles
        .into_iter()
        .map(|handle| Value::from_raw(ctx.clone(), handle))
        .collect();

    let Some(callback) = machine.callbacks.get(func_id) else {
        debug!("Unknown callback id, returning undefined");
        return Ok(0);
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| callback(&ctx, &args)));
    drop(args);
    drop(callback);

    let result = match outcome {
        Ok(Ok(value)) if Arc::ptr_eq(value.context().machine(), &machine) => value,
        Ok(Ok(_)) => ctx.throw_error(&BridgeError::ForeignValue.to_string())?,
        Ok(Err(e)) => {
            debug!(error = %e, "Host function failed");
            ctx.throw_error(&e.to_string())?
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(panic = %message, "Host function panicked");
            ctx.throw_error(&format!("host function panicked: {message}"))?
        }
    };

    hand_over(&machine, ctx_ptr, result)
}

/// Transfer a result handle to the guest.
///
/// The guest reads the slot after the import returns and keeps the value
/// without taking a new reference. For reference-counted values that
/// reference is the slot's own, so the slot can never be freed. Slots of
/// plain values are queued for release on the next store access.
fn hand_over(machine: &MachineShared, ctx_ptr: u32, result: Value) -> Result<u32, BridgeError> {
    let handle = result.into_raw();
    if handle == 0 {
        return Ok(0);
    }

    let plain = machine.with_store(|cx| {
        let e = &machine.exports;
        for predicate in [
            &e.is_undefined,
            &e.is_null,
            &e.is_bool,
            &e.is_number,
            &e.is_exception,
        ] {
            if machine.call(predicate, cx, (handle,))? != 0 {
                return Ok(true);
            }
        }
        Ok(false)
    })?;

    if plain {
        machine.queue(PendingRelease::Value {
            ctx: ctx_ptr,
            handle,
        });
    } else {
        machine
            .consumed_callback_slots
            .fetch_add(1, Ordering::Relaxed);
    }
    Ok(handle)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
