//! Core of the QuickJS bridge.
//!
//! This crate drives a QuickJS interpreter compiled to `wasm32-wasi`:
//! - [`BridgeEngine`]: configured Wasmtime engine, shared by every machine
//! - [`GuestModule`]: the compiled guest
//! - [`Runtime`]: one guest instance with its own memory and handle table
//! - [`Context`] and [`Value`]: the host-facing object model
//! - [`CallbackTable`]: host closures callable from guest code
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │               BridgeEngine + GuestModule                │
//! │  (Shared across machines, thread-safe)                  │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Runtime                          │
//! │  ExecutionGate ─▶ Store<MachineState> + Instance        │
//! │  - BumpArena (host-owned transfer region)               │
//! │  - context registry (HandleTable)                       │
//! │  - pending release queue                                │
//! └─────────────────────────────────────────────────────────┘
//!          │                                   ▲
//!          ▼                                   │
//! ┌──────────────────────┐        ┌──────────────────────────┐
//! │   Context / Value    │        │      CallbackTable       │
//! │ eval, properties,    │        │ env.host_call_go ─▶ id   │
//! │ calls, conversions   │        │ ─▶ host closure          │
//! └──────────────────────┘        └──────────────────────────┘
//! ```

pub mod arena;
pub mod callbacks;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod exports;
pub mod gate;
pub mod handles;
pub mod machine;
pub mod module;
pub mod pipeline;
pub mod state;
pub mod transport;
pub mod value;

pub use arena::BumpArena;
pub use callbacks::{CallbackTable, HostCallback, HostFunction, Registration};
pub use context::Context;
pub use engine::BridgeEngine;
pub use exports::GuestExports;
pub use gate::{ExecutionGate, GateGuard};
pub use handles::HandleTable;
pub use machine::{Runtime, RuntimeStats};
pub use module::GuestModule;
pub use pipeline::{EvalMode, EvalOptions};
pub use state::{GuestLog, MachineState};
pub use transport::GuestMemory;
pub use value::Value;
