//! Integration tests for qjs-bridge-core.
//!
//! These tests run the complete bridge against a small mock guest written in
//! WAT. The mock implements just enough of the guest ABI to exercise:
//! - the evaluation and exception pipeline
//! - callback dispatch, including reentrant evaluation
//! - handle release, deferred release and slot accounting
//! - guest output buffering
//! - serialization of concurrent callers
//!
//! Mock `qjs_eval` semantics, keyed on the first source byte:
//! - empty source: `undefined`
//! - `!`: throws, message "boom"
//! - `~`: traps
//! - `+`: increments a counter and returns it
//! - `?`: returns the number of live slots (before allocating the result)
//! - `#`: prints the rest of the source through `env.host_log`
//! - anything else: returns the source length
//!
//! Each context's global object keeps its own properties, keyed by the
//! context pointer, so sibling contexts do not see each other's globals.
//!
//! Every export the mock does not implement is generated as a stub from
//! `GuestExports::SIGNATURES`.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use qjs_bridge_common::{BridgeConfig, BridgeError, MachineConfig};
use qjs_bridge_core::{Context, GuestExports, Runtime, Value};
use qjs_bridge_host::Bridge;

const MOCK_GUEST: &str = r#"
(module
  (import "env" "host_log" (func $host_log (param i32 i32)))
  (import "env" "host_call_go" (func $host_call_go (param i32 i32 i32 i32) (result i32)))

  (memory (export "memory") 2)
  (data (i32.const 256) "boom")
  (data (i32.const 272) "undefined")
  (data (i32.const 288) "int")
  (data (i32.const 304) "not a function")

  (global $pending (mut i32) (i32.const 0))
  (global $err_ptr (mut i32) (i32.const 256))
  (global $err_len (mut i32) (i32.const 4))
  (global $heap (mut i32) (i32.const 8192))
  (global $next_ctx (mut i32) (i32.const 65536))
  (global $counter (mut i32) (i32.const 0))
  (global $live (mut i32) (i32.const 0))

  ;; Slot h (1..=256) is [tag, payload] at 1024 + 8h. Handle 0 reads as
  ;; undefined. Tags: 1 undefined, 2 int, 3 exception, 4 string,
  ;; 5 function, 6 object, 7 global object (payload is its context).
  (func $slot (param $h i32) (result i32)
    (i32.add (i32.const 1024) (i32.shl (local.get $h) (i32.const 3))))

  (func $tag (param $h i32) (result i32)
    (if (result i32) (i32.eqz (local.get $h))
      (then (i32.const 1))
      (else (i32.load (call $slot (local.get $h))))))

  (func $payload (param $h i32) (result i32)
    (if (result i32) (i32.eqz (local.get $h))
      (then (i32.const 0))
      (else (i32.load offset=4 (call $slot (local.get $h))))))

  (func $store (param $tag i32) (param $payload i32) (result i32)
    (local $h i32)
    (local.set $h (i32.const 1))
    (block $full
      (loop $scan
        (br_if $full (i32.gt_u (local.get $h) (i32.const 256)))
        (if (i32.eqz (i32.load (call $slot (local.get $h))))
          (then
            (i32.store (call $slot (local.get $h)) (local.get $tag))
            (i32.store offset=4 (call $slot (local.get $h)) (local.get $payload))
            (global.set $live (i32.add (global.get $live) (i32.const 1)))
            (return (local.get $h))))
        (local.set $h (i32.add (local.get $h) (i32.const 1)))
        (br $scan)))
    (i32.const 0))

  (func $copy (param $h i32) (result i32)
    (call $store (call $tag (local.get $h)) (call $payload (local.get $h))))

  (func $strlen (param $p i32) (result i32)
    (local $n i32)
    (block $done
      (loop $next
        (br_if $done (i32.eqz (i32.load8_u (i32.add (local.get $p) (local.get $n)))))
        (local.set $n (i32.add (local.get $n) (i32.const 1)))
        (br $next)))
    (local.get $n))

  ;; Copy bytes to the mock heap as [len, bytes] and return the record.
  (func $save (param $p i32) (param $len i32) (result i32)
    (local $rec i32)
    (local.set $rec (global.get $heap))
    (i32.store (local.get $rec) (local.get $len))
    (memory.copy (i32.add (local.get $rec) (i32.const 4)) (local.get $p) (local.get $len))
    (global.set $heap
      (i32.and
        (i32.add (i32.add (local.get $rec) (local.get $len)) (i32.const 7))
        (i32.const -4)))
    (local.get $rec))

  (func $raise (param $p i32) (param $len i32) (result i32)
    (global.set $err_ptr (local.get $p))
    (global.set $err_len (local.get $len))
    (global.set $pending (i32.const 1))
    (call $store (i32.const 3) (i32.const 0)))

  (func $raise_copy (param $msg i32) (result i32)
    (local $rec i32)
    (local.set $rec (call $save (local.get $msg) (call $strlen (local.get $msg))))
    (call $raise (i32.add (local.get $rec) (i32.const 4)) (i32.load (local.get $rec))))

  ;; Globals live at 5120 as 64 entries of [ctx, key hash, tag, payload].
  (func $key_hash (param $p i32) (result i32)
    (local $h i32)
    (local $c i32)
    (local.set $h (i32.const 5381))
    (block $done
      (loop $next
        (local.set $c (i32.load8_u (local.get $p)))
        (br_if $done (i32.eqz (local.get $c)))
        (local.set $h (i32.add (i32.mul (local.get $h) (i32.const 33)) (local.get $c)))
        (local.set $p (i32.add (local.get $p) (i32.const 1)))
        (br $next)))
    (local.get $h))

  ;; Entry for (ctx, hash), or 0 when absent.
  (func $global_find (param $ctx i32) (param $hash i32) (result i32)
    (local $e i32)
    (local.set $e (i32.const 5120))
    (block $done
      (loop $next
        (br_if $done (i32.ge_u (local.get $e) (i32.const 6144)))
        (if (i32.and
              (i32.eq (i32.load (local.get $e)) (local.get $ctx))
              (i32.eq (i32.load offset=4 (local.get $e)) (local.get $hash)))
          (then (return (local.get $e))))
        (local.set $e (i32.add (local.get $e) (i32.const 16)))
        (br $next)))
    (i32.const 0))

  (func (export "qjs_new_runtime") (result i32) (i32.const 1))
  (func (export "qjs_free_runtime") (param i32))
  (func (export "qjs_new_context") (param i32) (result i32)
    (global.set $next_ctx (i32.add (global.get $next_ctx) (i32.const 16)))
    (global.get $next_ctx))
  (func (export "qjs_free_context") (param i32))
  (func (export "qjs_std_add_console") (param i32))
  (func (export "qjs_reset_heap"))

  (func (export "qjs_eval")
    (param $ctx i32) (param $code i32) (param $len i32) (param $file i32) (param $flags i32)
    (result i32)
    (local $first i32)
    ;; Source must be NUL-terminated.
    (if (i32.load8_u (i32.add (local.get $code) (local.get $len)))
      (then (unreachable)))
    (if (i32.eqz (local.get $len))
      (then (return (call $store (i32.const 1) (i32.const 0)))))
    (local.set $first (i32.load8_u (local.get $code)))
    (if (i32.eq (local.get $first) (i32.const 33))
      (then (return (call $raise (i32.const 256) (i32.const 4)))))
    (if (i32.eq (local.get $first) (i32.const 126))
      (then (unreachable)))
    (if (i32.eq (local.get $first) (i32.const 43))
      (then
        (global.set $counter (i32.add (global.get $counter) (i32.const 1)))
        (return (call $store (i32.const 2) (global.get $counter)))))
    (if (i32.eq (local.get $first) (i32.const 63))
      (then (return (call $store (i32.const 2) (global.get $live)))))
    (if (i32.eq (local.get $first) (i32.const 35))
      (then
        (call $host_log
          (i32.add (local.get $code) (i32.const 1))
          (i32.sub (local.get $len) (i32.const 1)))
        (return (call $store (i32.const 1) (i32.const 0)))))
    (call $store (i32.const 2) (local.get $len)))

  (func (export "qjs_eval_module") (param i32 i32 i32 i32) (result i32)
    (call $store (i32.const 6) (i32.const 0)))

  (func (export "qjs_is_exception") (param $h i32) (result i32)
    (i32.eq (call $tag (local.get $h)) (i32.const 3)))
  (func (export "qjs_is_undefined") (param $h i32) (result i32)
    (i32.eq (call $tag (local.get $h)) (i32.const 1)))
  (func (export "qjs_is_number") (param $h i32) (result i32)
    (i32.eq (call $tag (local.get $h)) (i32.const 2)))
  (func (export "qjs_is_string") (param $h i32) (result i32)
    (i32.eq (call $tag (local.get $h)) (i32.const 4)))
  (func (export "qjs_is_object") (param $h i32) (result i32)
    (i32.ge_u (call $tag (local.get $h)) (i32.const 5)))
  (func (export "qjs_is_function") (param i32) (param $h i32) (result i32)
    (i32.eq (call $tag (local.get $h)) (i32.const 5)))

  (func (export "qjs_to_int32") (param i32) (param $h i32) (param $out i32) (result i32)
    (i32.store (local.get $out) (call $payload (local.get $h)))
    (i32.const 0))
  (func (export "qjs_to_float64") (param i32) (param $h i32) (param $out i32) (result i32)
    (f64.store (local.get $out) (f64.convert_i32_s (call $payload (local.get $h))))
    (i32.const 0))
  (func (export "qjs_to_cstring_len") (param i32) (param $h i32) (param $len_ptr i32) (result i32)
    (local $rec i32)
    (if (i32.eq (call $tag (local.get $h)) (i32.const 4))
      (then
        (local.set $rec (call $payload (local.get $h)))
        (i32.store (local.get $len_ptr) (i32.load (local.get $rec)))
        (return (i32.add (local.get $rec) (i32.const 4)))))
    (if (i32.eq (call $tag (local.get $h)) (i32.const 2))
      (then
        (i32.store (local.get $len_ptr) (i32.const 3))
        (return (i32.const 288))))
    (i32.store (local.get $len_ptr) (i32.const 9))
    (i32.const 272))
  (func (export "qjs_free_cstring") (param i32 i32))

  (func (export "qjs_new_undefined") (result i32)
    (call $store (i32.const 1) (i32.const 0)))
  (func (export "qjs_new_int32") (param $v i32) (result i32)
    (call $store (i32.const 2) (local.get $v)))
  (func (export "qjs_new_object") (param i32) (result i32)
    (call $store (i32.const 6) (i32.const 0)))
  (func (export "qjs_new_string_len") (param i32) (param $p i32) (param $len i32) (result i32)
    (call $store (i32.const 4) (call $save (local.get $p) (local.get $len))))
  (func (export "qjs_new_c_function") (param i32) (param $id i32) (param i32 i32) (result i32)
    (call $store (i32.const 5) (local.get $id)))

  ;; Arguments are duplicated into fresh slots, as the real guest does; the
  ;; host releases them. The callback result is copied into a new slot.
  (func (export "qjs_call")
    (param $ctx i32) (param $f i32) (param i32) (param $argc i32) (param $argv i32)
    (result i32)
    (local $i i32)
    (if (i32.ne (call $tag (local.get $f)) (i32.const 5))
      (then (return (call $raise (i32.const 304) (i32.const 14)))))
    (block $done
      (loop $next
        (br_if $done (i32.ge_s (local.get $i) (local.get $argc)))
        (i32.store
          (i32.add (i32.const 4096) (i32.shl (local.get $i) (i32.const 2)))
          (call $copy
            (i32.load (i32.add (local.get $argv) (i32.shl (local.get $i) (i32.const 2))))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $next)))
    (call $copy
      (call $host_call_go
        (local.get $ctx) (call $payload (local.get $f)) (local.get $argc) (i32.const 4096))))

  (func (export "qjs_get_exception") (param i32) (result i32)
    (if (i32.eqz (global.get $pending))
      (then (return (i32.const 0))))
    (global.set $pending (i32.const 0))
    (call $store (i32.const 6) (i32.const 0)))
  (func (export "qjs_has_exception") (param i32) (result i32)
    (global.get $pending))
  ;; Fails while an exception is pending.
  (func (export "qjs_execute_pending_jobs") (param i32) (result i32)
    (i32.sub (i32.const 0) (global.get $pending)))
  (func (export "qjs_throw_error") (param i32) (param $msg i32) (result i32)
    (call $raise_copy (local.get $msg)))
  (func (export "qjs_throw_type_error") (param i32) (param $msg i32) (result i32)
    (call $raise_copy (local.get $msg)))
  (func (export "qjs_get_error_message") (param i32 i32) (param $buf i32) (param $cap i32) (result i32)
    (local $n i32)
    (local.set $n (global.get $err_len))
    (if (i32.ge_u (local.get $n) (local.get $cap))
      (then (local.set $n (i32.sub (local.get $cap) (i32.const 1)))))
    (memory.copy (local.get $buf) (global.get $err_ptr) (local.get $n))
    (i32.store8 (i32.add (local.get $buf) (local.get $n)) (i32.const 0))
    (local.get $n))

  (func (export "qjs_dup_value") (param i32) (param $h i32) (result i32)
    (call $copy (local.get $h)))
  (func (export "qjs_free_value") (param i32) (param $h i32)
    (if (i32.eqz (local.get $h))
      (then (return)))
    (if (i32.gt_u (local.get $h) (i32.const 256))
      (then (return)))
    (if (i32.eqz (i32.load (call $slot (local.get $h))))
      (then (return)))
    (i32.store (call $slot (local.get $h)) (i32.const 0))
    (global.set $live (i32.sub (global.get $live) (i32.const 1))))
  (func (export "qjs_strict_eq") (param $a i32) (param $b i32) (result i32)
    (i32.and
      (i32.eq (call $tag (local.get $a)) (call $tag (local.get $b)))
      (i32.eq (call $payload (local.get $a)) (call $payload (local.get $b)))))

  (func (export "qjs_get_global_object") (param $ctx i32) (result i32)
    (call $store (i32.const 7) (local.get $ctx)))
  (func (export "qjs_get_property") (param i32) (param $obj i32) (param $key i32) (result i32)
    (local $e i32)
    (if (i32.eq (call $tag (local.get $obj)) (i32.const 7))
      (then
        (local.set $e
          (call $global_find (call $payload (local.get $obj)) (call $key_hash (local.get $key))))
        (if (local.get $e)
          (then
            (return
              (call $store
                (i32.load offset=8 (local.get $e))
                (i32.load offset=12 (local.get $e))))))))
    (call $store (i32.const 1) (i32.const 0)))
  (func (export "qjs_set_property")
    (param i32) (param $obj i32) (param $key i32) (param $val i32) (result i32)
    (local $owner i32)
    (local $hash i32)
    (local $e i32)
    (if (i32.ne (call $tag (local.get $obj)) (i32.const 7))
      (then (return (i32.const 1))))
    (local.set $owner (call $payload (local.get $obj)))
    (local.set $hash (call $key_hash (local.get $key)))
    (local.set $e (call $global_find (local.get $owner) (local.get $hash)))
    (if (i32.eqz (local.get $e))
      (then
        (local.set $e (call $global_find (i32.const 0) (i32.const 0)))
        (if (i32.eqz (local.get $e))
          (then (return (i32.const -1))))))
    (i32.store (local.get $e) (local.get $owner))
    (i32.store offset=4 (local.get $e) (local.get $hash))
    (i32.store offset=8 (local.get $e) (call $tag (local.get $val)))
    (i32.store offset=12 (local.get $e) (call $payload (local.get $val)))
    (i32.const 1))

  ;; stubs
)
"#;

/// The mock guest with a stub for every export it does not implement.
fn mock_guest() -> String {
    let mut stubs = String::new();
    for signature in GuestExports::SIGNATURES {
        if MOCK_GUEST.contains(&format!("(export \"{}\")", signature.name)) {
            continue;
        }
        let params = if signature.params.is_empty() {
            String::new()
        } else {
            format!(" (param {})", signature.params.join(" "))
        };
        let result = signature
            .results
            .first()
            .map(|ty| format!(" (result {ty}) ({ty}.const 0)"))
            .unwrap_or_default();
        writeln!(stubs, "  (func (export \"{}\"){params}{result})", signature.name).unwrap();
    }
    MOCK_GUEST.replace(";; stubs", &stubs)
}

fn bridge_with(machine: MachineConfig) -> Bridge {
    let config = BridgeConfig {
        machine,
        ..Default::default()
    };
    Bridge::from_wat(config, &mock_guest()).unwrap()
}

fn bridge() -> Bridge {
    bridge_with(MachineConfig {
        arena_size: 65_536,
        ..Default::default()
    })
}

fn machine(bridge: &Bridge) -> (Runtime, Context) {
    let runtime = bridge.new_runtime().unwrap();
    let ctx = runtime.new_context().unwrap();
    (runtime, ctx)
}

/// Live guest slots, as counted by the mock.
fn live(ctx: &Context) -> i32 {
    ctx.eval("?").unwrap().to_i32().unwrap()
}

fn add(ctx: &Context, args: &[Value]) -> Result<Value, BridgeError> {
    let mut sum = 0;
    for arg in args {
        sum += arg.to_i32()?;
    }
    ctx.int32(sum)
}

// ============================================================================
// Test: Evaluation Pipeline
// ============================================================================

#[test]
fn test_eval_returns_value() {
    let (_runtime, ctx) = machine(&bridge());

    let value = ctx.eval("hello").unwrap();
    assert!(value.is_number().unwrap());
    assert_eq!(value.to_i32().unwrap(), 5);
    assert_eq!(value.to_f64().unwrap(), 5.0);
}

#[test]
fn test_empty_source_is_undefined() {
    let (_runtime, ctx) = machine(&bridge());

    assert!(ctx.eval("").unwrap().is_undefined().unwrap());
}

#[test]
fn test_exception_becomes_error() {
    let (_runtime, ctx) = machine(&bridge());
    let base = live(&ctx);

    let err = ctx.eval("!throw").unwrap_err();
    assert!(err.is_exception());
    assert_eq!(err.to_string(), "boom");

    // Marker and exception object are both released, nothing stays pending.
    assert!(!ctx.has_exception().unwrap());
    assert_eq!(live(&ctx), base);
}

#[test]
fn test_eval_module_and_file() {
    let (_runtime, ctx) = machine(&bridge());

    assert!(ctx.eval_module("export {}").unwrap().is_object().unwrap());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("script.js");
    std::fs::write(&path, "hello world").unwrap();
    assert_eq!(ctx.eval_file(&path).unwrap().to_i32().unwrap(), 11);

    let err = ctx.eval_file(dir.path().join("missing.js")).unwrap_err();
    assert!(matches!(err, BridgeError::Io(_)));
}

#[test]
fn test_throw_helpers_leave_exception_pending() {
    let (_runtime, ctx) = machine(&bridge());

    let marker = ctx.throw_type_error("bad type").unwrap();
    assert!(marker.is_exception().unwrap());
    assert!(ctx.has_exception().unwrap());

    // The next failing evaluation takes it.
    assert!(ctx.eval("!").is_err());
    assert!(!ctx.has_exception().unwrap());
}

// ============================================================================
// Test: Handles
// ============================================================================

#[test]
fn test_values_release_their_slots() {
    let (_runtime, ctx) = machine(&bridge());
    let base = live(&ctx);

    let values: Vec<Value> = (0..10).map(|i| ctx.int32(i).unwrap()).collect();
    assert_eq!(live(&ctx), base + 10);

    let copy = values[3].try_clone().unwrap();
    assert!(copy.strict_eq(&values[3]).unwrap());
    assert_ne!(copy.raw(), values[3].raw());

    drop(values);
    drop(copy);
    assert_eq!(live(&ctx), base);
}

#[test]
fn test_handle_exhaustion_is_recoverable() {
    let (_runtime, ctx) = machine(&bridge());

    let mut values = Vec::new();
    let err = loop {
        match ctx.int32(1) {
            Ok(value) => values.push(value),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, BridgeError::HandlesExhausted { .. }));
    assert!(err.is_resource_limit());
    assert!(values.len() >= 250);

    values.truncate(1);
    assert_eq!(ctx.eval("abc").unwrap().to_i32().unwrap(), 3);
}

#[test]
fn test_string_round_trip() {
    let (_runtime, ctx) = machine(&bridge());

    let text = "h\u{e9}llo, w\u{f6}rld\0tail";
    let value = ctx.string(text).unwrap();
    assert!(value.is_string().unwrap());
    assert_eq!(value.to_string().unwrap(), text);
    assert_eq!(format!("{value}"), text);
}

#[test]
fn test_foreign_values_are_rejected() {
    let bridge = bridge();
    let (_first, ctx) = machine(&bridge);
    let (_second, other) = machine(&bridge);

    let object = ctx.object().unwrap();
    let foreign = other.int32(1).unwrap();
    let err = object.set("k", &foreign).unwrap_err();
    assert!(matches!(err, BridgeError::ForeignValue));

    let local = ctx.int32(1).unwrap();
    object.set("k", &local).unwrap();
}

// ============================================================================
// Test: Contexts
// ============================================================================

#[test]
fn test_globals_are_isolated_between_contexts() {
    let (runtime, first) = machine(&bridge());
    let second = runtime.new_context().unwrap();

    first.set_global("x", &first.int32(1).unwrap()).unwrap();

    assert_eq!(first.get_global("x").unwrap().to_i32().unwrap(), 1);
    assert!(second.get_global("x").unwrap().is_undefined().unwrap());

    second.set_global("x", &second.int32(2).unwrap()).unwrap();
    assert_eq!(first.get_global("x").unwrap().to_i32().unwrap(), 1);
    assert_eq!(second.get_global("x").unwrap().to_i32().unwrap(), 2);
    assert!(first.get_global("y").unwrap().is_undefined().unwrap());
}

#[test]
fn test_failed_eval_yields_no_value() {
    let (_runtime, ctx) = machine(&bridge());
    let base = live(&ctx);

    let result = ctx.eval("!syntax error");
    assert!(matches!(result, Err(BridgeError::Exception { .. })));
    assert_eq!(live(&ctx), base);
}

#[test]
fn test_context_limit() {
    let bridge = bridge_with(MachineConfig {
        arena_size: 65_536,
        max_contexts: 2,
        ..Default::default()
    });
    let runtime = bridge.new_runtime().unwrap();

    let first = runtime.new_context().unwrap();
    let second = runtime.new_context().unwrap();
    assert!(!first.same_context(&second));
    assert_eq!(runtime.stats().unwrap().contexts, 2);

    let err = runtime.new_context().unwrap_err();
    assert!(matches!(err, BridgeError::ContextLimit { limit: 2 }));

    drop(second);
    assert_eq!(runtime.stats().unwrap().contexts, 1);
    let third = runtime.new_context().unwrap();
    assert_eq!(third.eval("ok").unwrap().to_i32().unwrap(), 2);
}

#[test]
fn test_context_outlives_runtime_handle() {
    let bridge = bridge();
    let ctx = {
        let (_runtime, ctx) = machine(&bridge);
        ctx
    };

    assert_eq!(ctx.eval("abc").unwrap().to_i32().unwrap(), 3);
    assert!(!ctx.runtime().is_poisoned());
}

// ============================================================================
// Test: Callback Dispatch
// ============================================================================

#[test]
fn test_callback_end_to_end() {
    let (runtime, ctx) = machine(&bridge());

    let function = ctx.function("add", add).unwrap();
    assert!(function.is_function().unwrap());
    assert!(runtime.callbacks().contains(function.id()));

    let args = [ctx.int32(10).unwrap(), ctx.int32(20).unwrap()];
    assert_eq!(function.call(None, &args).unwrap().to_i32().unwrap(), 30);

    // Missing arguments fall back to 0 without crashing.
    assert_eq!(function.call(None, &[]).unwrap().to_i32().unwrap(), 0);
    assert_eq!(runtime.stats().unwrap().callbacks_dispatched, 2);
}

#[test]
fn test_callback_arguments_are_released() {
    let (_runtime, ctx) = machine(&bridge());
    let function = ctx.function("add", add).unwrap();
    let args = [ctx.int32(1).unwrap(), ctx.int32(2).unwrap()];
    let base = live(&ctx);

    for _ in 0..20 {
        function.call(None, &args).unwrap();
    }

    assert_eq!(live(&ctx), base);
}

#[test]
fn test_callback_error_is_thrown() {
    let (_runtime, ctx) = machine(&bridge());

    let function = ctx
        .function("fail", |_, _| Err(BridgeError::callback("nope")))
        .unwrap();

    let err = function.call(None, &[]).unwrap_err();
    assert!(err.is_exception());
    assert_eq!(err.to_string(), "Host function error: nope");
}

#[test]
fn test_callback_panic_is_contained() {
    let (runtime, ctx) = machine(&bridge());

    let function = ctx
        .function("explode", |_, _| -> Result<Value, BridgeError> { panic!("kaboom") })
        .unwrap();

    let err = function.call(None, &[]).unwrap_err();
    assert_eq!(err.to_string(), "host function panicked: kaboom");
    assert!(!runtime.is_poisoned());
    assert_eq!(ctx.eval("still fine").unwrap().to_i32().unwrap(), 10);
}

#[test]
fn test_unregistered_callback_yields_undefined() {
    let (runtime, ctx) = machine(&bridge());

    let (function, registration) = ctx.function("gone", add).unwrap().into_parts();
    let id = registration.id();
    drop(registration);
    assert!(!runtime.callbacks().contains(id));

    let args = [ctx.int32(1).unwrap()];
    assert!(function.call(None, &args).unwrap().is_undefined().unwrap());
}

#[test]
fn test_reentrant_eval_from_callback() {
    let (runtime, ctx) = machine(&bridge());
    let depth_seen = Arc::new(AtomicUsize::new(0));

    let depth = Arc::clone(&depth_seen);
    let function = ctx
        .function("double_eval", move |ctx, _| {
            let n = ctx.eval("abcd")?.to_i32()?;
            depth.store(ctx.runtime().stats()?.gate_depth, Ordering::SeqCst);
            ctx.int32(n * 2)
        })
        .unwrap();

    assert_eq!(function.call(None, &[]).unwrap().to_i32().unwrap(), 8);
    assert!(depth_seen.load(Ordering::SeqCst) >= 2);
    assert_eq!(runtime.stats().unwrap().gate_depth, 0);
}

#[test]
fn test_nested_callbacks() {
    let (_runtime, ctx) = machine(&bridge());

    let inner = ctx.function("inner", |ctx, _| ctx.int32(7)).unwrap();
    let outer = ctx
        .function("outer", |ctx, args| {
            let inner = args
                .first()
                .ok_or_else(|| BridgeError::callback("missing function"))?;
            let value = inner.call(None, &[])?.to_i32()?;
            ctx.int32(value + 1)
        })
        .unwrap();

    let args = [inner.try_clone().unwrap()];
    assert_eq!(outer.call(None, &args).unwrap().to_i32().unwrap(), 8);
}

#[test]
fn test_callback_result_slot_accounting() {
    let (runtime, ctx) = machine(&bridge());

    let number = ctx.function("number", |ctx, _| ctx.int32(1)).unwrap();
    let object = ctx.function("object", |ctx, _| ctx.object()).unwrap();

    number.call(None, &[]).unwrap();
    assert_eq!(runtime.stats().unwrap().consumed_callback_slots, 0);

    assert!(object.call(None, &[]).unwrap().is_object().unwrap());
    assert_eq!(runtime.stats().unwrap().consumed_callback_slots, 1);
}

#[test]
fn test_calling_a_non_function_throws() {
    let (_runtime, ctx) = machine(&bridge());

    let err = ctx.object().unwrap().call(None, &[]).unwrap_err();
    assert_eq!(err.to_string(), "not a function");
}

#[test]
fn test_arena_wrap_during_callback_is_counted() {
    let bridge = bridge_with(MachineConfig {
        arena_size: 4096,
        ..Default::default()
    });
    let (runtime, ctx) = machine(&bridge);

    // The arena is rounded up to one 64 KiB page.
    let function = ctx
        .function("fill", |ctx, _| {
            let big = "x".repeat(40_000);
            let first = ctx.string(&big)?;
            let second = ctx.string(&big)?;
            assert_eq!(second.to_string()?.len(), 40_000);
            drop(first);
            ctx.undefined()
        })
        .unwrap();

    function.call(None, &[]).unwrap();

    let stats = runtime.stats().unwrap();
    assert_eq!(stats.nested_arena_wraps, 1);
    assert!(stats.arena_wraps >= 1);
}

// ============================================================================
// Test: Guest Output
// ============================================================================

#[test]
fn test_log_lines_are_assembled() {
    let (runtime, ctx) = machine(&bridge());
    let lines = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&lines);
    runtime
        .set_log_handler(move |line| sink.lock().unwrap().push(line.to_string()))
        .unwrap();

    ctx.eval("#a").unwrap();
    ctx.eval("#b\n").unwrap();
    ctx.eval("#c\nd\n").unwrap();

    assert_eq!(*lines.lock().unwrap(), vec!["ab", "c", "d"]);
}

#[test]
fn test_release_from_log_handler_is_deferred() {
    let (runtime, ctx) = machine(&bridge());
    let base = live(&ctx);

    let parked = Arc::new(Mutex::new(Some(ctx.int32(7).unwrap())));
    let saw_busy = Arc::new(AtomicBool::new(false));

    let (slot, busy) = (Arc::clone(&parked), Arc::clone(&saw_busy));
    runtime
        .set_log_handler(move |_| {
            let value = slot.lock().unwrap().take();
            if let Some(value) = value {
                // The guest is suspended in host_log; the store is not reachable.
                let result = value.to_i32();
                busy.store(matches!(result, Err(BridgeError::StoreBusy)), Ordering::SeqCst);
            }
        })
        .unwrap();

    ctx.eval("#release\n").unwrap();

    assert!(saw_busy.load(Ordering::SeqCst));
    assert!(parked.lock().unwrap().is_none());
    assert_eq!(runtime.stats().unwrap().deferred_releases, 1);
    assert_eq!(live(&ctx), base);
}

// ============================================================================
// Test: Concurrency
// ============================================================================

#[test]
fn test_concurrent_serialization() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 100;

    let (runtime, ctx) = machine(&bridge());

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let ctx = ctx.clone();
            thread::spawn(move || {
                (0..ITERATIONS)
                    .map(|_| ctx.eval("+").and_then(|value| value.to_i32()))
                    .collect::<Result<Vec<_>, _>>()
            })
        })
        .collect();

    let mut seen: Vec<i32> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap().unwrap())
        .collect();
    seen.sort_unstable();
    seen.dedup();

    assert_eq!(seen.len(), THREADS * ITERATIONS);
    assert_eq!(
        ctx.eval("+").unwrap().to_i32().unwrap(),
        i32::try_from(THREADS * ITERATIONS + 1).unwrap()
    );
    assert_eq!(runtime.stats().unwrap().gate_depth, 0);
}

#[test]
fn test_machines_are_independent() {
    let bridge = bridge();
    let (_a, first) = machine(&bridge);
    let (_b, second) = machine(&bridge);

    first.eval("+").unwrap();
    first.eval("+").unwrap();

    assert_eq!(second.eval("+").unwrap().to_i32().unwrap(), 1);
}

// ============================================================================
// Test: Traps
// ============================================================================

#[test]
fn test_trap_poisons_machine() {
    let (runtime, ctx) = machine(&bridge());
    let survivor = ctx.int32(1).unwrap();

    let err = ctx.eval("~").unwrap_err();
    assert!(matches!(err, BridgeError::Trap { .. }));
    assert!(runtime.is_poisoned());

    let err = ctx.eval("anything").unwrap_err();
    assert!(matches!(err, BridgeError::Trap { .. }));

    // Dropping values of a poisoned machine must not panic.
    drop(survivor);
}

#[test]
fn test_failed_pending_jobs_are_reported() {
    let (runtime, ctx) = machine(&bridge());

    let _marker = ctx.throw_error("job failed").unwrap();
    let err = runtime.execute_pending_jobs().unwrap_err();
    assert!(err.is_exception());
    assert_eq!(err.to_string(), "JavaScript exception");
}

#[test]
fn test_runtime_maintenance() {
    let (runtime, _ctx) = machine(&bridge());

    runtime.run_gc().unwrap();
    assert_eq!(runtime.execute_pending_jobs().unwrap(), 0);
    runtime.set_memory_limit(64 * 1024 * 1024).unwrap();
    runtime.set_max_stack_size(256 * 1024).unwrap();

    let stats = runtime.stats().unwrap();
    assert_eq!(stats.contexts, 1);
    assert!(stats.memory_size >= 3 * 65_536);
}
