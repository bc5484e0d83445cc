//! Machine instances.
//!
//! A [`Runtime`] is one guest instance: its own store, linear memory, guest
//! handle table and `JSRuntime`. Every access to the store goes through the
//! machine's [`ExecutionGate`], so a machine can be shared between threads
//! while the guest itself stays single-threaded.
//!
//! # Reentrancy
//!
//! While the guest runs, the store is mutably borrowed by the call that
//! entered it. When the guest calls back into the host, the only way to reach
//! the store is the import's [`Caller`]. Callback dispatch publishes that
//! caller in the [`StoreCell`] for the duration of the callback, and
//! [`MachineShared::with_store`] picks it up on the nested path.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;
use wasmtime::{
    AsContextMut, Caller, Linker, Store, StoreContextMut, Trap, TypedFunc, WasmParams,
    WasmResults,
};

use qjs_bridge_common::{BridgeError, MachineConfig};

use crate::arena::BumpArena;
use crate::callbacks::CallbackTable;
use crate::context::{Context, ContextInner};
use crate::exports::{GuestExports, INITIALIZE_EXPORT, MEMORY_EXPORT};
use crate::gate::ExecutionGate;
use crate::handles::HandleTable;
use crate::state::{MachineState, create_store};
use crate::transport::GuestMemory;
use crate::{BridgeEngine, GuestModule};

/// A guest machine instance.
///
/// Cloning is cheap and yields another handle to the same machine. The guest
/// runtime is freed once the last `Runtime`, [`Context`] and
/// [`Value`](crate::Value) referring to it are dropped.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<MachineShared>,
}

/// Counters describing a machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Open contexts created through [`Runtime::new_context`].
    pub contexts: usize,
    /// Arena wraparounds since creation.
    pub arena_wraps: u64,
    /// Wraparounds that happened while a nested operation was in flight.
    pub nested_arena_wraps: u64,
    /// Value and context releases deferred because the store was busy.
    pub deferred_releases: u64,
    /// Guest slots handed over by callback results and never reclaimed.
    pub consumed_callback_slots: u64,
    /// Callbacks dispatched from the guest.
    pub callbacks_dispatched: u64,
    /// Gate depth observed when the stats were taken.
    pub gate_depth: usize,
    /// Linear memory size in bytes.
    pub memory_size: usize,
}

impl Runtime {
    /// Instantiate the guest and create its `JSRuntime`.
    ///
    /// The linker must provide `env.host_log`, `env.host_call_go` and WASI
    /// preview1; see `qjs_bridge_host::linker::register_all`.
    ///
    /// # Errors
    ///
    /// Returns an error if instantiation fails, a required export is missing
    /// or mistyped, the arena cannot be reserved, or the guest cannot create
    /// its runtime.
    #[instrument(skip_all, fields(machine_id))]
    pub fn new(
        engine: &BridgeEngine,
        module: &GuestModule,
        linker: &Linker<MachineState>,
        config: &MachineConfig,
        callbacks: Arc<CallbackTable>,
    ) -> Result<Self, BridgeError> {
        let id = Uuid::new_v4();
        tracing::Span::current().record("machine_id", tracing::field::display(id));

        let mut store = create_store(engine, id);

        let instance = linker.instantiate(&mut store, module.inner()).map_err(|e| {
            BridgeError::instantiation_failed(format!("Guest instantiation failed: {e}"))
        })?;

        if let Some(init) = instance.get_func(&mut store, INITIALIZE_EXPORT) {
            let init = init
                .typed::<(), ()>(&store)
                .map_err(|_| BridgeError::missing_export(INITIALIZE_EXPORT))?;
            init.call(&mut store, ()).map_err(|e| trap_error(&e))?;
            debug!("Guest reactor initialized");
        }

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .map(GuestMemory::new)
            .ok_or_else(|| BridgeError::missing_export(MEMORY_EXPORT))?;
        let exports = GuestExports::resolve(&instance, &mut store)?;

        let (arena_base, arena_size) = memory.reserve(&mut store, config.arena_size as usize)?;
        store.data_mut().arena = BumpArena::new(arena_base, arena_size);

        let rt_ptr = exports
            .new_runtime
            .call(&mut store, ())
            .map_err(|e| trap_error(&e))?;
        if rt_ptr == 0 {
            return Err(BridgeError::instantiation_failed(
                "Guest failed to create a runtime",
            ));
        }
        if config.memory_limit > 0 {
            exports
                .set_memory_limit
                .call(&mut store, (rt_ptr, config.memory_limit))
                .map_err(|e| trap_error(&e))?;
        }
        if config.max_stack_size > 0 {
            exports
                .set_max_stack_size
                .call(&mut store, (rt_ptr, config.max_stack_size))
                .map_err(|e| trap_error(&e))?;
        }

        let shared = Arc::new_cyclic(|weak| {
            store.data_mut().machine = Weak::clone(weak);
            MachineShared {
                id,
                gate: ExecutionGate::new(StoreCell {
                    store: RefCell::new(store),
                    caller: Cell::new(0),
                }),
                exports,
                memory,
                rt_ptr,
                config: config.clone(),
                callbacks,
                contexts: Mutex::new(HandleTable::with_capacity(config.max_contexts)),
                pending: Mutex::new(Vec::new()),
                deferred_releases: AtomicU64::new(0),
                consumed_callback_slots: AtomicU64::new(0),
                callbacks_dispatched: AtomicU64::new(0),
                poisoned: AtomicBool::new(false),
            }
        });

        info!(
            arena_base,
            arena_size,
            max_contexts = config.max_contexts,
            "Machine created"
        );

        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<MachineShared>) -> Self {
        Self { shared }
    }

    /// Unique identifier of this machine, as used in log events.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Create a new execution context with its own global scope.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ContextLimit`] when `max_contexts` contexts are
    /// already open.
    pub fn new_context(&self) -> Result<Context, BridgeError> {
        Context::create(&self.shared)
    }

    /// Run the guest garbage collector.
    pub fn run_gc(&self) -> Result<(), BridgeError> {
        let machine = &self.shared;
        machine.with_store(|cx| machine.call(&machine.exports.run_gc, cx, (machine.rt_ptr,)))
    }

    /// Run queued promise jobs until none are left.
    ///
    /// Returns the guest's non-negative status.
    ///
    /// # Errors
    ///
    /// Returns an exception error if a job threw. The exception itself stays
    /// pending in the context that ran the job.
    pub fn execute_pending_jobs(&self) -> Result<i32, BridgeError> {
        let machine = &self.shared;
        let status = machine.with_store(|cx| {
            machine.call(&machine.exports.execute_pending_jobs, cx, (machine.rt_ptr,))
        })?;
        if status < 0 {
            return Err(BridgeError::exception(
                qjs_bridge_common::DEFAULT_EXCEPTION_MESSAGE,
            ));
        }
        Ok(status)
    }

    /// Limit the guest heap to `bytes` (0 removes the limit).
    pub fn set_memory_limit(&self, bytes: u32) -> Result<(), BridgeError> {
        let machine = &self.shared;
        machine.with_store(|cx| {
            machine.call(&machine.exports.set_memory_limit, cx, (machine.rt_ptr, bytes))
        })
    }

    /// Limit the interpreter stack to `bytes` (0 disables the check).
    pub fn set_max_stack_size(&self, bytes: u32) -> Result<(), BridgeError> {
        let machine = &self.shared;
        machine.with_store(|cx| {
            machine.call(&machine.exports.set_max_stack_size, cx, (machine.rt_ptr, bytes))
        })
    }

    /// Receive every line the guest prints through `print` or `console.*`.
    ///
    /// The handler runs while the guest is suspended; it must not call back
    /// into this machine.
    pub fn set_log_handler<F>(&self, handler: F) -> Result<(), BridgeError>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared.with_store(|cx| {
            cx.data_mut().log.set_handler(Some(Arc::new(handler)));
            Ok(())
        })
    }

    /// Remove the log handler. Lines are still emitted as trace events.
    pub fn clear_log_handler(&self) -> Result<(), BridgeError> {
        self.shared.with_store(|cx| {
            cx.data_mut().log.set_handler(None);
            Ok(())
        })
    }

    /// Snapshot of the machine's counters.
    pub fn stats(&self) -> Result<RuntimeStats, BridgeError> {
        let machine = &self.shared;
        let gate_depth = machine.gate.depth();
        let (arena_wraps, nested_arena_wraps, memory_size) = machine.with_store(|cx| {
            let memory_size = machine.memory.size(&*cx);
            let state = cx.data();
            Ok((state.arena.wraps(), state.nested_wraps, memory_size))
        })?;

        Ok(RuntimeStats {
            contexts: machine.contexts.lock().len(),
            arena_wraps,
            nested_arena_wraps,
            deferred_releases: machine.deferred_releases.load(Ordering::Relaxed),
            consumed_callback_slots: machine.consumed_callback_slots.load(Ordering::Relaxed),
            callbacks_dispatched: machine.callbacks_dispatched.load(Ordering::Relaxed),
            gate_depth,
            memory_size,
        })
    }

    /// The callback table this machine dispatches to.
    pub fn callbacks(&self) -> &Arc<CallbackTable> {
        &self.shared.callbacks
    }

    /// Returns `true` once the guest has trapped. A poisoned machine rejects
    /// every further operation.
    pub fn is_poisoned(&self) -> bool {
        self.shared.is_poisoned()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.shared.id)
            .field("poisoned", &self.shared.is_poisoned())
            .finish_non_exhaustive()
    }
}

/// The store together with the caller of the host import currently running.
pub(crate) struct StoreCell {
    store: RefCell<Store<MachineState>>,
    /// Address of a live `Caller<'_, MachineState>`, or 0.
    caller: Cell<usize>,
}

/// A release that could not run because the store was busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingRelease {
    Value { ctx: u32, handle: u32 },
    Context { ptr: u32 },
}

/// Registry entry for an open context.
#[derive(Debug)]
pub(crate) struct ContextEntry {
    pub(crate) ptr: u32,
    pub(crate) inner: Weak<ContextInner>,
}

/// State shared by every handle to one machine.
pub(crate) struct MachineShared {
    id: Uuid,
    gate: ExecutionGate<StoreCell>,
    pub(crate) exports: GuestExports,
    pub(crate) memory: GuestMemory,
    rt_ptr: u32,
    pub(crate) config: MachineConfig,
    pub(crate) callbacks: Arc<CallbackTable>,
    pub(crate) contexts: Mutex<HandleTable<ContextEntry>>,
    pending: Mutex<Vec<PendingRelease>>,
    deferred_releases: AtomicU64,
    pub(crate) consumed_callback_slots: AtomicU64,
    pub(crate) callbacks_dispatched: AtomicU64,
    poisoned: AtomicBool,
}

impl MachineShared {
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn rt_ptr(&self) -> u32 {
        self.rt_ptr
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Run `f` with exclusive access to the store.
    ///
    /// Acquires the gate, then reaches the store either through the caller
    /// published by an enclosing callback dispatch or by borrowing it. The
    /// outermost operation resets both arenas first. Deferred releases are
    /// drained before `f` runs.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::StoreBusy`] if the store is already borrowed on
    /// this thread outside a callback, and a trap error if the machine is
    /// poisoned.
    #[allow(unsafe_code)]
    pub(crate) fn with_store<R>(
        &self,
        f: impl FnOnce(&mut StoreContextMut<'_, MachineState>) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        if self.is_poisoned() {
            return Err(poisoned());
        }

        let guard = self.gate.enter();
        let depth = guard.depth();
        let restore = CallerRestore {
            cell: &guard.caller,
            addr: guard.caller.replace(0),
        };

        if restore.addr != 0 {
            // SAFETY: `dispatch::invoke` publishes the address of its `Caller`
            // only while it is suspended in the host callback, and only under
            // the gate this thread holds. Taking it out of the cell makes this
            // frame its sole user until `restore` puts it back.
            let caller = unsafe { &mut *(restore.addr as *mut Caller<'_, MachineState>) };
            let mut cx = caller.as_context_mut();
            return self.run_in_store(&mut cx, depth, false, f);
        }

        let Ok(mut store) = guard.store.try_borrow_mut() else {
            return Err(BridgeError::StoreBusy);
        };
        let mut cx = store.as_context_mut();
        self.run_in_store(&mut cx, depth, depth == 1, f)
    }

    fn run_in_store<R>(
        &self,
        cx: &mut StoreContextMut<'_, MachineState>,
        depth: usize,
        outermost: bool,
        f: impl FnOnce(&mut StoreContextMut<'_, MachineState>) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        let saved_depth = std::mem::replace(&mut cx.data_mut().depth, depth);

        let result = self.prepare(cx, outermost).and_then(|()| f(cx));

        cx.data_mut().depth = saved_depth;
        result
    }

    fn prepare(
        &self,
        cx: &mut StoreContextMut<'_, MachineState>,
        outermost: bool,
    ) -> Result<(), BridgeError> {
        if outermost {
            cx.data_mut().arena.reset();
            self.call(&self.exports.reset_heap, cx, ())?;
        }
        self.drain_pending(cx, outermost)
    }

    /// Call a guest export, poisoning the machine if it traps.
    pub(crate) fn call<P, R>(
        &self,
        func: &TypedFunc<P, R>,
        cx: &mut StoreContextMut<'_, MachineState>,
        params: P,
    ) -> Result<R, BridgeError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        if self.is_poisoned() {
            return Err(poisoned());
        }
        func.call(&mut *cx, params).map_err(|e| {
            self.poisoned.store(true, Ordering::Release);
            let err = trap_error(&e);
            error!(machine_id = %self.id, error = %err, "Guest trapped, machine poisoned");
            err
        })
    }

    /// Copy `buffers` into the arena as one batch and return their addresses.
    pub(crate) fn stage<const N: usize>(
        &self,
        cx: &mut StoreContextMut<'_, MachineState>,
        buffers: [&[u8]; N],
    ) -> Result<[u32; N], BridgeError> {
        let sizes = buffers.map(<[u8]>::len);
        let addrs = cx.data_mut().arena_batch(&sizes)?;
        for (&addr, data) in addrs.iter().zip(buffers) {
            self.memory.write(&mut *cx, addr, data)?;
        }
        Ok(std::array::from_fn(|i| addrs[i]))
    }

    /// Free a guest value now, or later if the store is busy.
    pub(crate) fn release_value(&self, ctx: u32, handle: u32) {
        let result = self.with_store(|cx| self.call(&self.exports.free_value, cx, (ctx, handle)));
        self.settle(result, PendingRelease::Value { ctx, handle });
    }

    /// Free a guest context now, or later if the store is busy.
    pub(crate) fn release_context(&self, ptr: u32) {
        let release = PendingRelease::Context { ptr };
        let in_callback = self.gate.enter().caller.get() != 0;
        if in_callback {
            self.defer(release);
            return;
        }
        let result = self.with_store(|cx| self.call(&self.exports.free_context, cx, (ptr,)));
        self.settle(result, release);
    }

    fn settle(&self, result: Result<(), BridgeError>, release: PendingRelease) {
        match result {
            Ok(()) => {}
            Err(BridgeError::StoreBusy) => self.defer(release),
            Err(e) => debug!(machine_id = %self.id, ?release, error = %e, "Release skipped"),
        }
    }

    /// Queue a release for the next store access.
    pub(crate) fn defer(&self, release: PendingRelease) {
        self.queue(release);
        self.deferred_releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue a release without counting it as deferred.
    ///
    /// Used for slots the guest still reads after the current import returns.
    pub(crate) fn queue(&self, release: PendingRelease) {
        self.pending.lock().push(release);
    }

    /// Perform queued releases.
    ///
    /// Contexts are only freed by an outermost operation: inside a callback
    /// the guest may still be executing in them.
    fn drain_pending(
        &self,
        cx: &mut StoreContextMut<'_, MachineState>,
        outermost: bool,
    ) -> Result<(), BridgeError> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut kept = Vec::new();
        for release in pending {
            match release {
                PendingRelease::Value { ctx, handle } => {
                    self.call(&self.exports.free_value, cx, (ctx, handle))?;
                }
                PendingRelease::Context { ptr } if outermost => {
                    self.call(&self.exports.free_context, cx, (ptr,))?;
                }
                PendingRelease::Context { .. } => kept.push(release),
            }
        }
        if !kept.is_empty() {
            let mut pending = self.pending.lock();
            kept.append(&mut pending);
            *pending = kept;
        }
        Ok(())
    }

    /// Publish the caller of a running host import for nested store access.
    ///
    /// The caller stays published, and the gate held, until the token drops.
    pub(crate) fn publish_caller(&self, caller: &mut Caller<'_, MachineState>) -> CallerToken<'_> {
        let guard = self.gate.enter();
        let addr = std::ptr::from_mut(caller) as usize;
        let previous = guard.caller.replace(addr);
        CallerToken { guard, previous }
    }
}

impl Drop for MachineShared {
    fn drop(&mut self) {
        let poisoned = self.is_poisoned();
        let pending = std::mem::take(self.pending.get_mut());
        let store = self.gate.get_mut().store.get_mut();

        if !poisoned {
            for release in pending {
                let released = match release {
                    PendingRelease::Value { ctx, handle } => {
                        self.exports.free_value.call(&mut *store, (ctx, handle))
                    }
                    PendingRelease::Context { ptr } => {
                        self.exports.free_context.call(&mut *store, (ptr,))
                    }
                };
                if let Err(e) = released {
                    debug!(machine_id = %self.id, error = %e, "Deferred release failed at shutdown");
                }
            }
            if let Err(e) = self.exports.free_runtime.call(&mut *store, (self.rt_ptr,)) {
                debug!(machine_id = %self.id, error = %e, "Guest runtime teardown trapped");
            }
        }

        let state = store.data_mut();
        if let Some(line) = state.log.flush() {
            state.log.deliver(self.id, &line);
        }
        debug!(machine_id = %self.id, "Machine released");
    }
}

/// Holds the gate while a callback's caller is published.
///
/// Dropping it restores the previously published caller.
pub(crate) struct CallerToken<'a> {
    guard: crate::gate::GateGuard<'a, StoreCell>,
    previous: usize,
}

impl CallerToken<'_> {
    /// Gate depth of the dispatch holding this token.
    pub(crate) fn depth(&self) -> usize {
        self.guard.depth()
    }
}

impl Drop for CallerToken<'_> {
    fn drop(&mut self) {
        self.guard.caller.set(self.previous);
    }
}

struct CallerRestore<'a> {
    cell: &'a Cell<usize>,
    addr: usize,
}

impl Drop for CallerRestore<'_> {
    fn drop(&mut self) {
        self.cell.set(self.addr);
    }
}

fn poisoned() -> BridgeError {
    BridgeError::trap("machine is poisoned by an earlier trap")
}

/// Map a Wasmtime call failure to a bridge error.
pub(crate) fn trap_error(error: &wasmtime::Error) -> BridgeError {
    match error.downcast_ref::<Trap>() {
        Some(trap) => BridgeError::trap(trap.to_string()),
        None => BridgeError::trap(format!("{error:#}")),
    }
}
