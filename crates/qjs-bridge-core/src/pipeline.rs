//! Evaluation and exception recovery.
//!
//! Every guest call that can run script returns either a genuine result or
//! a marker meaning "an exception is pending". The functions here turn that
//! marker into [`BridgeError::Exception`] so no caller ever sees it as a
//! value.

use tracing::{debug, instrument};
use wasmtime::StoreContextMut;

use qjs_bridge_common::{BridgeError, DEFAULT_EXCEPTION_MESSAGE};

use crate::machine::MachineShared;
use crate::state::MachineState;
use crate::transport::encode_cstring;
use crate::{Context, Value};

/// `JS_EVAL_FLAG_STRICT`.
const EVAL_FLAG_STRICT: i32 = 1 << 3;

/// How source text is evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvalMode {
    /// Script in the global scope.
    #[default]
    Global,
    /// ES module. The result is the module's evaluation promise.
    Module,
}

/// Options for [`Context::eval_with`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalOptions {
    /// Name reported in stack traces. Defaults to `<eval>` or `<module>`.
    pub filename: Option<String>,
    /// Script or module evaluation.
    pub mode: EvalMode,
    /// Evaluate global scripts in strict mode.
    pub strict: bool,
}

impl EvalOptions {
    /// Options for an ES module.
    pub fn module() -> Self {
        Self {
            mode: EvalMode::Module,
            ..Self::default()
        }
    }

    /// Set the filename.
    #[must_use]
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Enable strict mode.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    fn resolved_filename(&self) -> &str {
        match (&self.filename, self.mode) {
            (Some(name), _) => name,
            (None, EvalMode::Global) => "<eval>",
            (None, EvalMode::Module) => "<module>",
        }
    }
}

/// Evaluate `source` in `ctx`.
///
/// Source and filename are staged in one arena batch. An exception thrown by
/// the code comes back as [`BridgeError::Exception`] and its marker handle is
/// released without being delivered.
///
/// # Errors
///
/// Returns an exception error when evaluation throws (including syntax
/// errors), [`BridgeError::HandlesExhausted`] when the guest has no free
/// slot for the result, and arena or trap errors from the transport.
#[instrument(skip_all, fields(ctx = ctx.ptr(), mode = ?options.mode, source_len = source.len()))]
pub fn evaluate(ctx: &Context, source: &str, options: &EvalOptions) -> Result<Value, BridgeError> {
    let filename = options.resolved_filename();
    let mode = options.mode;
    let flags = if options.strict { EVAL_FLAG_STRICT } else { 0 };

    ctx.produce("qjs_eval", |m, cx, ctx_ptr| {
        let code = encode_cstring(source);
        let name = encode_cstring(filename);
        let [code_ptr, name_ptr] = m.stage(cx, [&code, &name])?;
        // Length excludes the terminator; the guest parser still needs it.
        let code_len = u32::try_from(code.len() - 1).map_err(|_| BridgeError::ArenaExhausted {
            requested: code.len(),
            capacity: u32::MAX as usize,
        })?;

        match mode {
            EvalMode::Global => m.call(
                &m.exports.eval,
                cx,
                (ctx_ptr, code_ptr, code_len, name_ptr, flags),
            ),
            EvalMode::Module => m.call(
                &m.exports.eval_module,
                cx,
                (ctx_ptr, code_ptr, code_len, name_ptr),
            ),
        }
    })
}

/// Check a handle returned by a guest call.
///
/// Zero means the guest could not store the result. An exception marker is
/// released and replaced by the pending exception.
pub(crate) fn check(
    m: &MachineShared,
    cx: &mut StoreContextMut<'_, MachineState>,
    ctx_ptr: u32,
    handle: u32,
    operation: &'static str,
) -> Result<u32, BridgeError> {
    if handle == 0 {
        return Err(BridgeError::HandlesExhausted { operation });
    }
    if m.call(&m.exports.is_exception, cx, (handle,))? != 0 {
        m.call(&m.exports.free_value, cx, (ctx_ptr, handle))?;
        return Err(take_exception(m, cx, ctx_ptr)?);
    }
    Ok(handle)
}

/// Check a status code returned by a guest call. Negative means failure.
pub(crate) fn check_status(
    m: &MachineShared,
    cx: &mut StoreContextMut<'_, MachineState>,
    ctx_ptr: u32,
    status: i32,
) -> Result<i32, BridgeError> {
    if status < 0 {
        return Err(pending_error(m, cx, ctx_ptr)?);
    }
    Ok(status)
}

/// The pending exception, or a generic exception if none is pending.
///
/// Used where the guest signals failure without a marker handle.
pub(crate) fn pending_error(
    m: &MachineShared,
    cx: &mut StoreContextMut<'_, MachineState>,
    ctx_ptr: u32,
) -> Result<BridgeError, BridgeError> {
    if m.call(&m.exports.has_exception, cx, (ctx_ptr,))? != 0 {
        take_exception(m, cx, ctx_ptr)
    } else {
        Ok(BridgeError::exception(DEFAULT_EXCEPTION_MESSAGE))
    }
}

/// Take the pending exception out of the context and describe it.
///
/// The message goes through a fixed buffer of `error_buffer_len` bytes and
/// falls back to [`DEFAULT_EXCEPTION_MESSAGE`] when empty. The stack is read
/// only when `capture_stack` is configured.
pub(crate) fn take_exception(
    m: &MachineShared,
    cx: &mut StoreContextMut<'_, MachineState>,
    ctx_ptr: u32,
) -> Result<BridgeError, BridgeError> {
    let exception = m.call(&m.exports.get_exception, cx, (ctx_ptr,))?;
    if exception == 0 {
        return Ok(BridgeError::exception(DEFAULT_EXCEPTION_MESSAGE));
    }

    let described = describe(m, cx, ctx_ptr, exception);
    m.call(&m.exports.free_value, cx, (ctx_ptr, exception))?;
    let (message, stack) = described?;

    debug!(ctx = ctx_ptr, message = %message, "Guest exception recovered");
    Ok(BridgeError::Exception { message, stack })
}

fn describe(
    m: &MachineShared,
    cx: &mut StoreContextMut<'_, MachineState>,
    ctx_ptr: u32,
    exception: u32,
) -> Result<(String, Option<String>), BridgeError> {
    let buf_len = m.config.error_buffer_len;
    let buf = cx.data_mut().arena_batch(&[buf_len as usize])?[0];
    let written = m.call(
        &m.exports.get_error_message,
        cx,
        (ctx_ptr, exception, buf, buf_len),
    )?;
    let written = written.min(buf_len.saturating_sub(1));
    let message = m.memory.read_string(&*cx, buf, written as usize)?;
    let message = if message.is_empty() {
        DEFAULT_EXCEPTION_MESSAGE.to_string()
    } else {
        message
    };

    let stack = if m.config.capture_stack {
        read_stack(m, cx, ctx_ptr, exception)?
    } else {
        None
    };

    Ok((message, stack))
}

fn read_stack(
    m: &MachineShared,
    cx: &mut StoreContextMut<'_, MachineState>,
    ctx_ptr: u32,
    exception: u32,
) -> Result<Option<String>, BridgeError> {
    let handle = m.call(&m.exports.get_error_stack, cx, (ctx_ptr, exception))?;
    if handle == 0 {
        return Ok(None);
    }
    let stack = read_cstring_value(m, cx, ctx_ptr, handle);
    m.call(&m.exports.free_value, cx, (ctx_ptr, handle))?;

    // Reading the stack must not replace the original exception.
    match stack {
        Ok(stack) if !stack.is_empty() => Ok(Some(stack)),
        Ok(_) => Ok(None),
        Err(BridgeError::Exception { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Convert a guest value to a host string through `qjs_to_cstring_len`.
pub(crate) fn read_cstring_value(
    m: &MachineShared,
    cx: &mut StoreContextMut<'_, MachineState>,
    ctx_ptr: u32,
    handle: u32,
) -> Result<String, BridgeError> {
    let len_ptr = cx.data_mut().arena_batch(&[4])?[0];
    let str_ptr = m.call(&m.exports.to_cstring_len, cx, (ctx_ptr, handle, len_ptr))?;
    if str_ptr == 0 {
        return Err(pending_error(m, cx, ctx_ptr)?);
    }

    let len = m.memory.read_u32(&*cx, len_ptr)?;
    let text = m.memory.read_string(&*cx, str_ptr, len as usize);
    m.call(&m.exports.free_cstring, cx, (ctx_ptr, str_ptr))?;
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filenames() {
        assert_eq!(EvalOptions::default().resolved_filename(), "<eval>");
        assert_eq!(EvalOptions::module().resolved_filename(), "<module>");
        assert_eq!(
            EvalOptions::module().filename("main.mjs").resolved_filename(),
            "main.mjs"
        );
    }

    #[test]
    fn test_builder() {
        let options = EvalOptions::default().filename("a.js").strict();
        assert_eq!(options.mode, EvalMode::Global);
        assert!(options.strict);
        assert_eq!(options.filename.as_deref(), Some("a.js"));
    }
}
