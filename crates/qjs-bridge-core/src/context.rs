//! Execution contexts.
//!
//! A [`Context`] is one `JSContext` inside a machine: an isolated global
//! scope sharing the machine's heap. Contexts are registered in the
//! machine's context table, which bounds how many may be open at once and
//! lets callback dispatch find the context a call came from.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument};
use wasmtime::StoreContextMut;

use qjs_bridge_common::BridgeError;

use crate::callbacks::{HostFunction, Registration};
use crate::machine::{ContextEntry, MachineShared, Runtime};
use crate::pipeline::{self, EvalMode, EvalOptions};
use crate::state::MachineState;
use crate::transport::encode_cstring;
use crate::value::Value;

/// An isolated JavaScript global scope.
///
/// Cloning yields another handle to the same context. The guest context is
/// freed when the last clone and every [`Value`] created in it are dropped.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    machine: Arc<MachineShared>,
    ptr: u32,
    /// Slot in the machine's context table; 0 for borrowed contexts.
    slot: u32,
    /// Host functions installed as globals live as long as the context.
    registrations: Mutex<Vec<Registration>>,
}

impl Context {
    #[instrument(skip_all, fields(machine_id = %machine.id()))]
    pub(crate) fn create(machine: &Arc<MachineShared>) -> Result<Self, BridgeError> {
        let slot = machine.contexts.lock().allocate(ContextEntry {
            ptr: 0,
            inner: std::sync::Weak::new(),
        });
        if slot == 0 {
            return Err(BridgeError::ContextLimit {
                limit: machine.config.max_contexts,
            });
        }

        let created = machine.with_store(|cx| {
            let ptr = machine.call(&machine.exports.new_context, cx, (machine.rt_ptr(),))?;
            if ptr != 0 && machine.config.console {
                machine.call(&machine.exports.std_add_console, cx, (ptr,))?;
            }
            Ok(ptr)
        });

        let ptr = match created {
            Ok(0) => Err(BridgeError::instantiation_failed(
                "Guest failed to create a context",
            )),
            other => other,
        };
        let ptr = match ptr {
            Ok(ptr) => ptr,
            Err(e) => {
                machine.contexts.lock().release(slot);
                return Err(e);
            }
        };

        let inner = Arc::new(ContextInner {
            machine: Arc::clone(machine),
            ptr,
            slot,
            registrations: Mutex::new(Vec::new()),
        });
        if let Some(entry) = machine.contexts.lock().resolve_mut(slot) {
            entry.ptr = ptr;
            entry.inner = Arc::downgrade(&inner);
        }

        debug!(ctx = ptr, slot, "Context created");
        Ok(Self { inner })
    }

    /// The context a guest callback was invoked from.
    ///
    /// Contexts opened through [`Runtime::new_context`] are found in the
    /// registry. Anything else is wrapped without taking ownership.
    pub(crate) fn for_dispatch(machine: &Arc<MachineShared>, ptr: u32) -> Self {
        let registered = machine
            .contexts
            .lock()
            .iter()
            .find(|(_, entry)| entry.ptr == ptr)
            .and_then(|(_, entry)| entry.inner.upgrade());

        let inner = registered.unwrap_or_else(|| {
            Arc::new(ContextInner {
                machine: Arc::clone(machine),
                ptr,
                slot: 0,
                registrations: Mutex::new(Vec::new()),
            })
        });
        Self { inner }
    }

    pub(crate) fn ptr(&self) -> u32 {
        self.inner.ptr
    }

    pub(crate) fn machine(&self) -> &Arc<MachineShared> {
        &self.inner.machine
    }

    /// The machine this context belongs to.
    pub fn runtime(&self) -> Runtime {
        Runtime::from_shared(Arc::clone(&self.inner.machine))
    }

    /// Returns `true` if both handles refer to the same guest context.
    pub fn same_context(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner.machine, &other.inner.machine) && self.inner.ptr == other.inner.ptr
    }

    /// Run `f` on the store with this context's guest pointer.
    pub(crate) fn with<R>(
        &self,
        f: impl FnOnce(&MachineShared, &mut StoreContextMut<'_, MachineState>, u32) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        let machine = &self.inner.machine;
        let ptr = self.inner.ptr;
        machine.with_store(|cx| f(machine, cx, ptr))
    }

    /// Run a guest call that yields a handle and wrap the checked result.
    pub(crate) fn produce(
        &self,
        operation: &'static str,
        f: impl FnOnce(&MachineShared, &mut StoreContextMut<'_, MachineState>, u32) -> Result<u32, BridgeError>,
    ) -> Result<Value, BridgeError> {
        let handle = self.with(|m, cx, ctx_ptr| {
            let handle = f(m, cx, ctx_ptr)?;
            pipeline::check(m, cx, ctx_ptr, handle, operation)
        })?;
        Ok(Value::from_raw(self.clone(), handle))
    }

    /// Reject values created by another machine.
    pub(crate) fn ensure_owned(&self, value: &Value) -> Result<(), BridgeError> {
        if Arc::ptr_eq(&self.inner.machine, value.context().machine()) {
            Ok(())
        } else {
            Err(BridgeError::ForeignValue)
        }
    }

    // Evaluation

    /// Evaluate a global script named `<eval>`.
    pub fn eval(&self, source: &str) -> Result<Value, BridgeError> {
        pipeline::evaluate(self, source, &EvalOptions::default())
    }

    /// Evaluate an ES module named `<module>`.
    ///
    /// Returns the module's evaluation promise.
    pub fn eval_module(&self, source: &str) -> Result<Value, BridgeError> {
        pipeline::evaluate(self, source, &EvalOptions::module())
    }

    /// Evaluate with explicit options.
    pub fn eval_with(&self, source: &str, options: &EvalOptions) -> Result<Value, BridgeError> {
        pipeline::evaluate(self, source, options)
    }

    /// Read and evaluate a file. `.mjs` files are evaluated as modules.
    pub fn eval_file(&self, path: impl AsRef<Path>) -> Result<Value, BridgeError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let mode = if path.extension().is_some_and(|ext| ext == "mjs") {
            EvalMode::Module
        } else {
            EvalMode::Global
        };
        let options = EvalOptions {
            filename: Some(path.display().to_string()),
            mode,
            strict: false,
        };
        pipeline::evaluate(self, &source, &options)
    }

    /// Parse JSON text into a value.
    pub fn parse_json(&self, json: &str) -> Result<Value, BridgeError> {
        self.produce("qjs_json_parse", |m, cx, ctx_ptr| {
            let text = encode_cstring(json);
            let [ptr] = m.stage(cx, [&text])?;
            let len = u32::try_from(json.len()).map_err(|_| BridgeError::ArenaExhausted {
                requested: json.len(),
                capacity: u32::MAX as usize,
            })?;
            m.call(&m.exports.json_parse, cx, (ctx_ptr, ptr, len))
        })
    }

    /// Returns `true` if an exception is pending in this context.
    pub fn has_exception(&self) -> Result<bool, BridgeError> {
        self.with(|m, cx, ctx_ptr| Ok(m.call(&m.exports.has_exception, cx, (ctx_ptr,))? != 0))
    }

    // Globals

    /// The global object.
    pub fn global(&self) -> Result<Value, BridgeError> {
        self.produce("qjs_get_global_object", |m, cx, ctx_ptr| {
            m.call(&m.exports.get_global_object, cx, (ctx_ptr,))
        })
    }

    /// Read a global variable.
    pub fn get_global(&self, name: &str) -> Result<Value, BridgeError> {
        self.global()?.get(name)
    }

    /// Assign a global variable.
    pub fn set_global(&self, name: &str, value: &Value) -> Result<(), BridgeError> {
        self.global()?.set(name, value)
    }

    // Host functions

    /// Create a guest function backed by a host closure.
    ///
    /// The closure stays registered as long as the returned [`HostFunction`]
    /// is alive. Calling the guest function after that yields `undefined`.
    pub fn function<F>(&self, name: &str, callback: F) -> Result<HostFunction, BridgeError>
    where
        F: Fn(&Context, &[Value]) -> Result<Value, BridgeError> + Send + Sync + 'static,
    {
        let registration = self.inner.machine.callbacks.register_scoped(callback)?;
        let func_id = registration.id();
        let value = self.produce("qjs_new_c_function", |m, cx, ctx_ptr| {
            let name = encode_cstring(name);
            let [name_ptr] = m.stage(cx, [&name])?;
            // Host functions are variadic; the guest reports length 0.
            m.call(&m.exports.new_c_function, cx, (ctx_ptr, func_id, name_ptr, 0))
        })?;
        Ok(HostFunction::new(value, registration))
    }

    /// Install a host closure as a global function.
    ///
    /// The registration lives as long as this context.
    pub fn set_global_function<F>(&self, name: &str, callback: F) -> Result<(), BridgeError>
    where
        F: Fn(&Context, &[Value]) -> Result<Value, BridgeError> + Send + Sync + 'static,
    {
        let function = self.function(name, callback)?;
        let (value, registration) = function.into_parts();
        self.set_global(name, &value)?;
        self.inner.registrations.lock().push(registration);
        Ok(())
    }

    // Exceptions

    fn throw_with(
        &self,
        select: fn(&crate::exports::GuestExports) -> &wasmtime::TypedFunc<(u32, u32), u32>,
        operation: &'static str,
        message: &str,
    ) -> Result<Value, BridgeError> {
        let handle = self.with(|m, cx, ctx_ptr| {
            let text = encode_cstring(message);
            let [ptr] = m.stage(cx, [&text])?;
            m.call(select(&m.exports), cx, (ctx_ptr, ptr))
        })?;
        if handle == 0 {
            return Err(BridgeError::HandlesExhausted { operation });
        }
        Ok(Value::from_raw(self.clone(), handle))
    }

    /// Throw an `InternalError` and return the exception marker.
    ///
    /// A host function returns the marker to make the guest call throw.
    pub fn throw_error(&self, message: &str) -> Result<Value, BridgeError> {
        self.throw_with(|e| &e.throw_error, "qjs_throw_error", message)
    }

    /// Throw a `TypeError`.
    pub fn throw_type_error(&self, message: &str) -> Result<Value, BridgeError> {
        self.throw_with(|e| &e.throw_type_error, "qjs_throw_type_error", message)
    }

    /// Throw a `RangeError`.
    pub fn throw_range_error(&self, message: &str) -> Result<Value, BridgeError> {
        self.throw_with(|e| &e.throw_range_error, "qjs_throw_range_error", message)
    }

    /// Throw a `SyntaxError`.
    pub fn throw_syntax_error(&self, message: &str) -> Result<Value, BridgeError> {
        self.throw_with(|e| &e.throw_syntax_error, "qjs_throw_syntax_error", message)
    }

    /// Throw a `ReferenceError`.
    pub fn throw_reference_error(&self, message: &str) -> Result<Value, BridgeError> {
        self.throw_with(
            |e| &e.throw_reference_error,
            "qjs_throw_reference_error",
            message,
        )
    }

    /// Throw an arbitrary value.
    pub fn throw_value(&self, value: &Value) -> Result<Value, BridgeError> {
        self.ensure_owned(value)?;
        let thrown = value.raw();
        let handle =
            self.with(|m, cx, ctx_ptr| m.call(&m.exports.throw, cx, (ctx_ptr, thrown)))?;
        if handle == 0 {
            return Err(BridgeError::HandlesExhausted {
                operation: "qjs_throw",
            });
        }
        Ok(Value::from_raw(self.clone(), handle))
    }

    // Constructors

    /// `undefined`.
    pub fn undefined(&self) -> Result<Value, BridgeError> {
        self.produce("qjs_new_undefined", |m, cx, _| {
            m.call(&m.exports.new_undefined, cx, ())
        })
    }

    /// `null`.
    pub fn null(&self) -> Result<Value, BridgeError> {
        self.produce("qjs_new_null", |m, cx, _| m.call(&m.exports.new_null, cx, ()))
    }

    pub fn bool(&self, value: bool) -> Result<Value, BridgeError> {
        self.produce("qjs_new_bool", |m, cx, _| {
            m.call(&m.exports.new_bool, cx, (i32::from(value),))
        })
    }

    pub fn int32(&self, value: i32) -> Result<Value, BridgeError> {
        self.produce("qjs_new_int32", |m, cx, _| {
            m.call(&m.exports.new_int32, cx, (value,))
        })
    }

    pub fn int64(&self, value: i64) -> Result<Value, BridgeError> {
        self.produce("qjs_new_int64", |m, cx, ctx_ptr| {
            m.call(&m.exports.new_int64, cx, (ctx_ptr, value))
        })
    }

    pub fn float64(&self, value: f64) -> Result<Value, BridgeError> {
        self.produce("qjs_new_float64", |m, cx, _| {
            m.call(&m.exports.new_float64, cx, (value,))
        })
    }

    /// A string. Interior NULs are preserved.
    pub fn string(&self, value: &str) -> Result<Value, BridgeError> {
        self.produce("qjs_new_string_len", |m, cx, ctx_ptr| {
            let [ptr] = m.stage(cx, [value.as_bytes()])?;
            let len = u32::try_from(value.len()).map_err(|_| BridgeError::ArenaExhausted {
                requested: value.len(),
                capacity: u32::MAX as usize,
            })?;
            m.call(&m.exports.new_string_len, cx, (ctx_ptr, ptr, len))
        })
    }

    /// An empty object.
    pub fn object(&self) -> Result<Value, BridgeError> {
        self.produce("qjs_new_object", |m, cx, ctx_ptr| {
            m.call(&m.exports.new_object, cx, (ctx_ptr,))
        })
    }

    /// An empty array.
    pub fn array(&self) -> Result<Value, BridgeError> {
        self.produce("qjs_new_array", |m, cx, ctx_ptr| {
            m.call(&m.exports.new_array, cx, (ctx_ptr,))
        })
    }

    pub fn big_int64(&self, value: i64) -> Result<Value, BridgeError> {
        self.produce("qjs_new_big_int64", |m, cx, ctx_ptr| {
            m.call(&m.exports.new_big_int64, cx, (ctx_ptr, value))
        })
    }

    pub fn big_uint64(&self, value: u64) -> Result<Value, BridgeError> {
        self.produce("qjs_new_big_uint64", |m, cx, ctx_ptr| {
            m.call(&m.exports.new_big_uint64, cx, (ctx_ptr, value))
        })
    }

    /// A `Date` from milliseconds since the Unix epoch.
    pub fn date(&self, epoch_ms: f64) -> Result<Value, BridgeError> {
        self.produce("qjs_new_date", |m, cx, ctx_ptr| {
            m.call(&m.exports.new_date, cx, (ctx_ptr, epoch_ms))
        })
    }

    /// An `ArrayBuffer` holding a copy of `data`.
    pub fn array_buffer(&self, data: &[u8]) -> Result<Value, BridgeError> {
        self.produce("qjs_new_array_buffer", |m, cx, ctx_ptr| {
            let [ptr] = m.stage(cx, [data])?;
            let len = u32::try_from(data.len()).map_err(|_| BridgeError::ArenaExhausted {
                requested: data.len(),
                capacity: u32::MAX as usize,
            })?;
            m.call(&m.exports.new_array_buffer, cx, (ctx_ptr, ptr, len))
        })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("machine_id", &self.inner.machine.id())
            .field("ptr", &self.inner.ptr)
            .field("owned", &(self.inner.slot != 0))
            .finish()
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if self.slot == 0 {
            return;
        }
        self.registrations.get_mut().clear();
        self.machine.contexts.lock().release(self.slot);
        self.machine.release_context(self.ptr);
        debug!(ctx = self.ptr, slot = self.slot, "Context released");
    }
}
