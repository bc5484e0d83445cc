//! Callback dispatch table.
//!
//! Host closures are exposed to the guest through a numeric indirection: the
//! guest function object stores an id, and calls come back through the single
//! `env.host_call_go` import, which looks the id up here.
//!
//! The table has its own lock and is independent of any machine, so one table
//! can be shared by several machines and filled before any of them exists.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use qjs_bridge_common::BridgeError;
use tracing::debug;

use crate::{Context, Value};

/// A host closure callable from guest code.
///
/// Receives the calling context and the arguments. Returning `Err` throws an
/// `InternalError` carrying the error message in the guest.
pub type HostCallback = dyn Fn(&Context, &[Value]) -> Result<Value, BridgeError> + Send + Sync;

/// Maps callback ids to host closures.
///
/// Ids start at 1 and increase monotonically. They are never reused, so a
/// stale guest function object can never reach a newer closure.
pub struct CallbackTable {
    entries: DashMap<u32, Arc<HostCallback>>,
    next_id: AtomicU32,
}

impl CallbackTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Register a closure and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::HandlesExhausted`] once the id space is used up.
    pub fn register<F>(&self, callback: F) -> Result<u32, BridgeError>
    where
        F: Fn(&Context, &[Value]) -> Result<Value, BridgeError> + Send + Sync + 'static,
    {
        let id = self
            .next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(1))
            .map_err(|_| BridgeError::HandlesExhausted {
                operation: "register callback",
            })?;

        self.entries.insert(id, Arc::new(callback));
        debug!(func_id = id, "Callback registered");
        Ok(id)
    }

    /// Register a closure whose entry is removed when the returned guard drops.
    pub fn register_scoped<F>(self: &Arc<Self>, callback: F) -> Result<Registration, BridgeError>
    where
        F: Fn(&Context, &[Value]) -> Result<Value, BridgeError> + Send + Sync + 'static,
    {
        let id = self.register(callback)?;
        Ok(Registration {
            table: Arc::downgrade(self),
            id,
        })
    }

    /// Remove a closure. Returns `false` if the id was not registered.
    pub fn unregister(&self, id: u32) -> bool {
        let removed = self.entries.remove(&id).is_some();
        if removed {
            debug!(func_id = id, "Callback unregistered");
        }
        removed
    }

    /// Look up a closure.
    ///
    /// The returned `Arc` keeps the closure alive even if it is unregistered
    /// while running.
    pub fn get(&self, id: u32) -> Option<Arc<HostCallback>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns `true` if `id` is registered.
    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of registered closures.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no closure is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTable")
            .field("registered", &self.entries.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

/// Keeps a callback registered; unregisters it on drop.
#[derive(Debug)]
#[must_use = "the callback is unregistered as soon as the registration is dropped"]
pub struct Registration {
    table: Weak<CallbackTable>,
    id: u32,
}

impl Registration {
    /// The registered id.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.unregister(self.id);
        }
    }
}

/// A guest function backed by a host closure.
///
/// Dereferences to the function [`Value`]. Dropping it unregisters the
/// closure; calls made through the guest function afterwards yield
/// `undefined`.
#[derive(Debug)]
pub struct HostFunction {
    value: Value,
    registration: Registration,
}

impl HostFunction {
    pub(crate) fn new(value: Value, registration: Registration) -> Self {
        Self {
            value,
            registration,
        }
    }

    /// The callback id the guest function dispatches to.
    pub fn id(&self) -> u32 {
        self.registration.id()
    }

    /// The guest function.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Split into the guest function and the registration keeping it alive.
    pub fn into_parts(self) -> (Value, Registration) {
        (self.value, self.registration)
    }
}

impl std::ops::Deref for HostFunction {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.value
    }
}
