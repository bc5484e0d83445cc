//! Typed bindings for the guest's `qjs_*` entry points.
//!
//! Every export the bridge calls is resolved once, at instantiation, into a
//! [`TypedFunc`]. A guest that lacks an export or exports it with a different
//! signature fails instantiation with [`BridgeError::MissingExport`] instead
//! of trapping later.

use qjs_bridge_common::BridgeError;
use wasmtime::{AsContextMut, Instance, TypedFunc};

/// Signature of one guest export in wasm value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSignature {
    /// Export name.
    pub name: &'static str,
    /// Parameter types (`i32`, `i64`, `f64`).
    pub params: &'static [&'static str],
    /// Result types.
    pub results: &'static [&'static str],
}

macro_rules! wasm_type {
    (u32) => {
        "i32"
    };
    (i32) => {
        "i32"
    };
    (u64) => {
        "i64"
    };
    (i64) => {
        "i64"
    };
    (f64) => {
        "f64"
    };
}

macro_rules! guest_exports {
    (@ret) => { () };
    (@ret $ret:tt) => { $ret };
    ($( $field:ident = $name:literal ( $($param:tt),* ) $(-> $ret:tt)? ; )*) => {
        /// The resolved guest entry points of one instance.
        #[derive(Clone)]
        pub struct GuestExports {
            $(
                pub(crate) $field: TypedFunc<($($param,)*), guest_exports!(@ret $($ret)?)>,
            )*
        }

        impl GuestExports {
            /// Every export the bridge requires, with its wasm signature.
            pub const SIGNATURES: &'static [ExportSignature] = &[
                $(
                    ExportSignature {
                        name: $name,
                        params: &[$(wasm_type!($param)),*],
                        results: &[$(wasm_type!($ret))?],
                    },
                )*
            ];

            /// Resolve every export from `instance`.
            pub fn resolve(instance: &Instance, mut store: impl AsContextMut) -> Result<Self, BridgeError> {
                Ok(Self {
                    $(
                        $field: instance
                            .get_typed_func(&mut store, $name)
                            .map_err(|_| BridgeError::missing_export($name))?,
                    )*
                })
            }
        }
    };
}

guest_exports! {
    new_runtime = "qjs_new_runtime"() -> u32;
    free_runtime = "qjs_free_runtime"(u32);
    new_context = "qjs_new_context"(u32) -> u32;
    free_context = "qjs_free_context"(u32);
    std_add_console = "qjs_std_add_console"(u32);
    reset_heap = "qjs_reset_heap"();

    eval = "qjs_eval"(u32, u32, u32, u32, i32) -> u32;
    eval_module = "qjs_eval_module"(u32, u32, u32, u32) -> u32;

    is_exception = "qjs_is_exception"(u32) -> i32;
    is_undefined = "qjs_is_undefined"(u32) -> i32;
    is_null = "qjs_is_null"(u32) -> i32;
    is_bool = "qjs_is_bool"(u32) -> i32;
    is_number = "qjs_is_number"(u32) -> i32;
    is_string = "qjs_is_string"(u32) -> i32;
    is_symbol = "qjs_is_symbol"(u32) -> i32;
    is_object = "qjs_is_object"(u32) -> i32;
    is_array = "qjs_is_array"(u32) -> i32;
    is_error = "qjs_is_error"(u32) -> i32;
    is_big_int = "qjs_is_big_int"(u32) -> i32;
    is_date = "qjs_is_date"(u32) -> i32;
    is_regexp = "qjs_is_regexp"(u32) -> i32;
    is_map = "qjs_is_map"(u32) -> i32;
    is_set = "qjs_is_set"(u32) -> i32;
    is_function = "qjs_is_function"(u32, u32) -> i32;
    is_promise = "qjs_is_promise"(u32, u32) -> i32;

    to_bool = "qjs_to_bool"(u32, u32) -> i32;
    to_int32 = "qjs_to_int32"(u32, u32, u32) -> i32;
    to_int64 = "qjs_to_int64"(u32, u32, u32) -> i32;
    to_float64 = "qjs_to_float64"(u32, u32, u32) -> i32;
    to_big_int64 = "qjs_to_big_int64"(u32, u32, u32) -> i32;
    to_cstring_len = "qjs_to_cstring_len"(u32, u32, u32) -> u32;
    free_cstring = "qjs_free_cstring"(u32, u32);
    to_string = "qjs_to_string"(u32, u32) -> u32;
    type_of = "qjs_typeof"(u32, u32) -> u32;
    get_array_buffer = "qjs_get_array_buffer"(u32, u32, u32) -> u32;

    new_undefined = "qjs_new_undefined"() -> u32;
    new_null = "qjs_new_null"() -> u32;
    new_bool = "qjs_new_bool"(i32) -> u32;
    new_int32 = "qjs_new_int32"(i32) -> u32;
    new_int64 = "qjs_new_int64"(u32, i64) -> u32;
    new_float64 = "qjs_new_float64"(f64) -> u32;
    new_string_len = "qjs_new_string_len"(u32, u32, u32) -> u32;
    new_object = "qjs_new_object"(u32) -> u32;
    new_array = "qjs_new_array"(u32) -> u32;
    new_big_int64 = "qjs_new_big_int64"(u32, i64) -> u32;
    new_big_uint64 = "qjs_new_big_uint64"(u32, u64) -> u32;
    new_date = "qjs_new_date"(u32, f64) -> u32;
    new_array_buffer = "qjs_new_array_buffer"(u32, u32, u32) -> u32;
    new_c_function = "qjs_new_c_function"(u32, u32, u32, i32) -> u32;

    get_property = "qjs_get_property"(u32, u32, u32) -> u32;
    set_property = "qjs_set_property"(u32, u32, u32, u32) -> i32;
    has_property = "qjs_has_property"(u32, u32, u32) -> i32;
    delete_property = "qjs_delete_property"(u32, u32, u32) -> i32;
    get_property_uint32 = "qjs_get_property_uint32"(u32, u32, u32) -> u32;
    set_property_uint32 = "qjs_set_property_uint32"(u32, u32, u32, u32) -> i32;
    get_global_object = "qjs_get_global_object"(u32) -> u32;
    get_own_property_names = "qjs_get_own_property_names"(u32, u32, u32, i32) -> u32;

    call = "qjs_call"(u32, u32, u32, i32, u32) -> u32;
    call_constructor = "qjs_call_constructor"(u32, u32, i32, u32) -> u32;
    invoke = "qjs_invoke"(u32, u32, u32, i32, u32) -> u32;

    get_exception = "qjs_get_exception"(u32) -> u32;
    has_exception = "qjs_has_exception"(u32) -> i32;
    throw = "qjs_throw"(u32, u32) -> u32;
    throw_error = "qjs_throw_error"(u32, u32) -> u32;
    throw_type_error = "qjs_throw_type_error"(u32, u32) -> u32;
    throw_range_error = "qjs_throw_range_error"(u32, u32) -> u32;
    throw_syntax_error = "qjs_throw_syntax_error"(u32, u32) -> u32;
    throw_reference_error = "qjs_throw_reference_error"(u32, u32) -> u32;
    get_error_message = "qjs_get_error_message"(u32, u32, u32, u32) -> u32;
    get_error_stack = "qjs_get_error_stack"(u32, u32) -> u32;

    dup_value = "qjs_dup_value"(u32, u32) -> u32;
    free_value = "qjs_free_value"(u32, u32);
    strict_eq = "qjs_strict_eq"(u32, u32) -> i32;
    instance_of = "qjs_instanceof"(u32, u32, u32) -> i32;

    json_parse = "qjs_json_parse"(u32, u32, u32) -> u32;
    json_stringify = "qjs_json_stringify"(u32, u32) -> u32;

    run_gc = "qjs_run_gc"(u32);
    execute_pending_jobs = "qjs_execute_pending_jobs"(u32) -> i32;
    set_memory_limit = "qjs_set_memory_limit"(u32, u32);
    set_max_stack_size = "qjs_set_max_stack_size"(u32, u32);
}

impl std::fmt::Debug for GuestExports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestExports")
            .field("count", &Self::SIGNATURES.len())
            .finish_non_exhaustive()
    }
}

/// Reactor initializer exported by WASI reactor modules.
pub const INITIALIZE_EXPORT: &str = "_initialize";

/// Name of the guest's exported linear memory.
pub const MEMORY_EXPORT: &str = "memory";
