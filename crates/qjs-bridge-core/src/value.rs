//! Host-side references to guest values.

use std::fmt;

use tracing::warn;
use wasmtime::TypedFunc;

use qjs_bridge_common::BridgeError;

use crate::context::Context;
use crate::exports::GuestExports;
use crate::pipeline;
use crate::transport::{encode_cstring, encode_u32_array};

/// `JS_GPN_STRING_MASK | JS_GPN_ENUM_ONLY`.
const OWN_PROPERTY_FLAGS: i32 = 0x11;

type Predicate = fn(&GuestExports) -> &TypedFunc<(u32,), i32>;
type ContextPredicate = fn(&GuestExports) -> &TypedFunc<(u32, u32), i32>;

/// A guest value owned by the host.
///
/// Holds one slot of the guest handle table and keeps its [`Context`] alive.
/// Dropping the value frees the slot. If the store is busy at that moment
/// the release is queued and performed on the next store access.
pub struct Value {
    ctx: Context,
    handle: u32,
}

impl Value {
    pub(crate) fn from_raw(ctx: Context, handle: u32) -> Self {
        Self { ctx, handle }
    }

    /// The guest handle.
    pub fn raw(&self) -> u32 {
        self.handle
    }

    /// Give up ownership of the guest slot and return its handle.
    pub fn into_raw(mut self) -> u32 {
        std::mem::replace(&mut self.handle, 0)
    }

    /// The context this value was created in.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// A second reference to the same guest value in its own slot.
    pub fn try_clone(&self) -> Result<Value, BridgeError> {
        let handle = self.handle;
        self.ctx.produce("qjs_dup_value", |m, cx, ctx_ptr| {
            m.call(&m.exports.dup_value, cx, (ctx_ptr, handle))
        })
    }

    fn test(&self, select: Predicate) -> Result<bool, BridgeError> {
        let handle = self.handle;
        self.ctx
            .with(|m, cx, _| Ok(m.call(select(&m.exports), cx, (handle,))? != 0))
    }

    fn test_in_context(&self, select: ContextPredicate) -> Result<bool, BridgeError> {
        let handle = self.handle;
        self.ctx
            .with(|m, cx, ctx_ptr| Ok(m.call(select(&m.exports), cx, (ctx_ptr, handle))? > 0))
    }

    // Predicates

    pub fn is_undefined(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_undefined)
    }

    pub fn is_null(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_null)
    }

    pub fn is_bool(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_bool)
    }

    pub fn is_number(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_number)
    }

    pub fn is_string(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_string)
    }

    pub fn is_symbol(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_symbol)
    }

    pub fn is_object(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_object)
    }

    pub fn is_array(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_array)
    }

    pub fn is_error(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_error)
    }

    pub fn is_big_int(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_big_int)
    }

    pub fn is_date(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_date)
    }

    pub fn is_regexp(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_regexp)
    }

    pub fn is_map(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_map)
    }

    pub fn is_set(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_set)
    }

    /// Returns `true` for the exception marker produced by the throw helpers.
    pub fn is_exception(&self) -> Result<bool, BridgeError> {
        self.test(|e| &e.is_exception)
    }

    pub fn is_function(&self) -> Result<bool, BridgeError> {
        self.test_in_context(|e| &e.is_function)
    }

    /// Returns `true` for thenables: objects with a callable `then`.
    pub fn is_promise(&self) -> Result<bool, BridgeError> {
        self.test_in_context(|e| &e.is_promise)
    }

    // Conversions

    /// JavaScript truthiness.
    pub fn to_bool(&self) -> Result<bool, BridgeError> {
        let handle = self.handle;
        self.ctx.with(|m, cx, ctx_ptr| {
            let truthy = m.call(&m.exports.to_bool, cx, (ctx_ptr, handle))?;
            Ok(pipeline::check_status(m, cx, ctx_ptr, truthy)? != 0)
        })
    }

    /// `ToInt32`: wraps modulo 2^32, `NaN` becomes 0.
    pub fn to_i32(&self) -> Result<i32, BridgeError> {
        let handle = self.handle;
        self.ctx.with(|m, cx, ctx_ptr| {
            let out = cx.data_mut().arena_batch(&[4])?[0];
            let status = m.call(&m.exports.to_int32, cx, (ctx_ptr, handle, out))?;
            pipeline::check_status(m, cx, ctx_ptr, status)?;
            m.memory.read_i32(&*cx, out)
        })
    }

    /// `ToInt64`: saturates, `NaN` becomes 0.
    pub fn to_i64(&self) -> Result<i64, BridgeError> {
        self.read_i64(|e| &e.to_int64)
    }

    /// `ToNumber`.
    pub fn to_f64(&self) -> Result<f64, BridgeError> {
        let handle = self.handle;
        self.ctx.with(|m, cx, ctx_ptr| {
            let out = cx.data_mut().arena_batch(&[8])?[0];
            let status = m.call(&m.exports.to_float64, cx, (ctx_ptr, handle, out))?;
            pipeline::check_status(m, cx, ctx_ptr, status)?;
            m.memory.read_f64(&*cx, out)
        })
    }

    /// A `BigInt` (or a value convertible to one) as `i64`.
    pub fn to_big_i64(&self) -> Result<i64, BridgeError> {
        self.read_i64(|e| &e.to_big_int64)
    }

    fn read_i64(
        &self,
        select: fn(&GuestExports) -> &TypedFunc<(u32, u32, u32), i32>,
    ) -> Result<i64, BridgeError> {
        let handle = self.handle;
        self.ctx.with(|m, cx, ctx_ptr| {
            let out = cx.data_mut().arena_batch(&[8])?[0];
            let status = m.call(select(&m.exports), cx, (ctx_ptr, handle, out))?;
            pipeline::check_status(m, cx, ctx_ptr, status)?;
            m.memory.read_i64(&*cx, out)
        })
    }

    /// `ToString`. Invalid UTF-16 is replaced.
    #[allow(clippy::inherent_to_string_shadow_display)]
    pub fn to_string(&self) -> Result<String, BridgeError> {
        let handle = self.handle;
        self.ctx
            .with(|m, cx, ctx_ptr| pipeline::read_cstring_value(m, cx, ctx_ptr, handle))
    }

    /// Contents of an `ArrayBuffer`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BridgeError> {
        let handle = self.handle;
        self.ctx.with(|m, cx, ctx_ptr| {
            let len_ptr = cx.data_mut().arena_batch(&[4])?[0];
            let data = m.call(&m.exports.get_array_buffer, cx, (ctx_ptr, handle, len_ptr))?;
            if data == 0 {
                if m.call(&m.exports.has_exception, cx, (ctx_ptr,))? != 0 {
                    return Err(pipeline::take_exception(m, cx, ctx_ptr)?);
                }
                return Ok(Vec::new());
            }
            let len = m.memory.read_u32(&*cx, len_ptr)?;
            m.memory.read(&*cx, data, len as usize)
        })
    }

    /// `JSON.stringify`. Values JSON cannot represent yield `"undefined"`.
    pub fn to_json(&self) -> Result<String, BridgeError> {
        let handle = self.handle;
        let json = self.ctx.produce("qjs_json_stringify", |m, cx, ctx_ptr| {
            m.call(&m.exports.json_stringify, cx, (ctx_ptr, handle))
        })?;
        json.to_string()
    }

    /// The `typeof` string.
    pub fn type_of(&self) -> Result<String, BridgeError> {
        let handle = self.handle;
        let name = self.ctx.produce("qjs_typeof", |m, cx, ctx_ptr| {
            m.call(&m.exports.type_of, cx, (ctx_ptr, handle))
        })?;
        name.to_string()
    }

    // Properties

    /// Read a property.
    pub fn get(&self, key: &str) -> Result<Value, BridgeError> {
        let handle = self.handle;
        self.ctx.produce("qjs_get_property", |m, cx, ctx_ptr| {
            let key = encode_cstring(key);
            let [key_ptr] = m.stage(cx, [&key])?;
            m.call(&m.exports.get_property, cx, (ctx_ptr, handle, key_ptr))
        })
    }

    /// Assign a property. The guest takes its own reference to `value`.
    pub fn set(&self, key: &str, value: &Value) -> Result<(), BridgeError> {
        self.ctx.ensure_owned(value)?;
        let (handle, value) = (self.handle, value.handle);
        self.ctx.with(|m, cx, ctx_ptr| {
            let key = encode_cstring(key);
            let [key_ptr] = m.stage(cx, [&key])?;
            let status = m.call(&m.exports.set_property, cx, (ctx_ptr, handle, key_ptr, value))?;
            pipeline::check_status(m, cx, ctx_ptr, status).map(drop)
        })
    }

    /// `key in value`.
    pub fn has(&self, key: &str) -> Result<bool, BridgeError> {
        self.key_status(key, |e| &e.has_property)
    }

    /// `delete value[key]`. Returns `false` for non-configurable properties.
    pub fn delete(&self, key: &str) -> Result<bool, BridgeError> {
        self.key_status(key, |e| &e.delete_property)
    }

    fn key_status(
        &self,
        key: &str,
        select: fn(&GuestExports) -> &TypedFunc<(u32, u32, u32), i32>,
    ) -> Result<bool, BridgeError> {
        let handle = self.handle;
        self.ctx.with(|m, cx, ctx_ptr| {
            let key = encode_cstring(key);
            let [key_ptr] = m.stage(cx, [&key])?;
            let status = m.call(select(&m.exports), cx, (ctx_ptr, handle, key_ptr))?;
            Ok(pipeline::check_status(m, cx, ctx_ptr, status)? != 0)
        })
    }

    /// Read an indexed element.
    pub fn get_index(&self, index: u32) -> Result<Value, BridgeError> {
        let handle = self.handle;
        self.ctx.produce("qjs_get_property_uint32", |m, cx, ctx_ptr| {
            m.call(&m.exports.get_property_uint32, cx, (ctx_ptr, handle, index))
        })
    }

    /// Assign an indexed element.
    pub fn set_index(&self, index: u32, value: &Value) -> Result<(), BridgeError> {
        self.ctx.ensure_owned(value)?;
        let (handle, value) = (self.handle, value.handle);
        self.ctx.with(|m, cx, ctx_ptr| {
            let status = m.call(
                &m.exports.set_property_uint32,
                cx,
                (ctx_ptr, handle, index, value),
            )?;
            pipeline::check_status(m, cx, ctx_ptr, status).map(drop)
        })
    }

    /// The `length` property. Missing or negative lengths are 0.
    pub fn len(&self) -> Result<usize, BridgeError> {
        let length = self.get("length")?;
        if length.is_undefined()? {
            return Ok(0);
        }
        Ok(usize::try_from(length.to_i64()?).unwrap_or(0))
    }

    /// Returns `true` if [`Value::len`] is 0.
    pub fn is_empty(&self) -> Result<bool, BridgeError> {
        Ok(self.len()? == 0)
    }

    /// Own enumerable string-keyed property names, in guest order.
    pub fn own_property_names(&self) -> Result<Vec<String>, BridgeError> {
        let handle = self.handle;
        let names = self.ctx.with(|m, cx, ctx_ptr| {
            let count_ptr = cx.data_mut().arena_batch(&[4])?[0];
            let names = m.call(
                &m.exports.get_own_property_names,
                cx,
                (ctx_ptr, handle, count_ptr, OWN_PROPERTY_FLAGS),
            )?;
            if names == 0 {
                return Err(pipeline::pending_error(m, cx, ctx_ptr)?);
            }
            let count = m.memory.read_u32(&*cx, count_ptr)?;
            Ok((names, count))
        });
        let (names, count) = names?;
        let names = Value::from_raw(self.ctx.clone(), names);

        (0..count)
            .map(|index| names.get_index(index)?.to_string())
            .collect()
    }

    // Calls

    /// Call this function with `this` (or `undefined`) and `args`.
    pub fn call(&self, this: Option<&Value>, args: &[Value]) -> Result<Value, BridgeError> {
        let argv = self.handles(args)?;
        if let Some(this) = this {
            self.ctx.ensure_owned(this)?;
        }
        let handle = self.handle;
        let this = this.map_or(0, Value::raw);
        self.ctx.produce("qjs_call", |m, cx, ctx_ptr| {
            let (argc, argv_ptr) = stage_argv(m, cx, &argv)?;
            m.call(&m.exports.call, cx, (ctx_ptr, handle, this, argc, argv_ptr))
        })
    }

    /// Call the method `name` of this object.
    pub fn call_method(&self, name: &str, args: &[Value]) -> Result<Value, BridgeError> {
        let argv = self.handles(args)?;
        let handle = self.handle;
        self.ctx.produce("qjs_invoke", |m, cx, ctx_ptr| {
            let name = encode_cstring(name);
            let encoded = encode_u32_array(&argv);
            let argc = argc(&argv)?;
            let [name_ptr, argv_ptr] = m.stage(cx, [&name, &encoded])?;
            m.call(&m.exports.invoke, cx, (ctx_ptr, handle, name_ptr, argc, argv_ptr))
        })
    }

    /// `new this(...args)`.
    pub fn construct(&self, args: &[Value]) -> Result<Value, BridgeError> {
        let argv = self.handles(args)?;
        let handle = self.handle;
        self.ctx.produce("qjs_call_constructor", |m, cx, ctx_ptr| {
            let (argc, argv_ptr) = stage_argv(m, cx, &argv)?;
            m.call(&m.exports.call_constructor, cx, (ctx_ptr, handle, argc, argv_ptr))
        })
    }

    /// `this instanceof constructor`.
    pub fn instance_of(&self, constructor: &Value) -> Result<bool, BridgeError> {
        self.ctx.ensure_owned(constructor)?;
        let (handle, ctor) = (self.handle, constructor.handle);
        self.ctx.with(|m, cx, ctx_ptr| {
            let status = m.call(&m.exports.instance_of, cx, (ctx_ptr, handle, ctor))?;
            Ok(pipeline::check_status(m, cx, ctx_ptr, status)? != 0)
        })
    }

    /// `this === other`.
    pub fn strict_eq(&self, other: &Value) -> Result<bool, BridgeError> {
        self.ctx.ensure_owned(other)?;
        let (handle, other) = (self.handle, other.handle);
        self.ctx
            .with(|m, cx, _| Ok(m.call(&m.exports.strict_eq, cx, (handle, other))? != 0))
    }

    fn handles(&self, args: &[Value]) -> Result<Vec<u32>, BridgeError> {
        args.iter()
            .map(|arg| {
                self.ctx.ensure_owned(arg)?;
                Ok(arg.handle)
            })
            .collect()
    }
}

fn argc(argv: &[u32]) -> Result<i32, BridgeError> {
    i32::try_from(argv.len()).map_err(|_| BridgeError::ArenaExhausted {
        requested: argv.len().saturating_mul(4),
        capacity: i32::MAX as usize,
    })
}

fn stage_argv(
    m: &crate::machine::MachineShared,
    cx: &mut wasmtime::StoreContextMut<'_, crate::state::MachineState>,
    argv: &[u32],
) -> Result<(i32, u32), BridgeError> {
    let argc = argc(argv)?;
    if argv.is_empty() {
        return Ok((0, 0));
    }
    let [argv_ptr] = m.stage(cx, [&encode_u32_array(argv)])?;
    Ok((argc, argv_ptr))
}

impl Drop for Value {
    fn drop(&mut self) {
        if self.handle != 0 {
            self.ctx.machine().release_value(self.ctx.ptr(), self.handle);
        }
    }
}

impl Clone for Value {
    /// Duplicates the guest reference. If that fails the clone is a null
    /// handle, which every guest entry point treats as `undefined`.
    fn clone(&self) -> Self {
        self.try_clone().unwrap_or_else(|e| {
            warn!(handle = self.handle, error = %e, "Value duplication failed");
            Value::from_raw(self.ctx.clone(), 0)
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Value::to_string(self) {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str("[unprintable value]"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("ctx", &self.ctx.ptr())
            .field("handle", &self.handle)
            .finish()
    }
}
