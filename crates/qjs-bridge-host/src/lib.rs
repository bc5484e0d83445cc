//! Host side of the QuickJS bridge.
//!
//! This crate provides the host implementations of the guest's imports and
//! the wiring that turns a guest module into machines.
//!
//! # Imports
//!
//! - [`logging`]: `env.host_log`, line-buffered guest output
//! - [`linker`]: registration of `env.host_log`, `env.host_call_go` and
//!   WASI preview1
//! - [`bridge`]: [`Bridge`], the factory for machines

pub mod bridge;
pub mod linker;
pub mod logging;

pub use bridge::Bridge;
pub use linker::register_all;
pub use logging::LoggingHost;
