//! Reentrant execution gate.
//!
//! Every operation that touches a machine's guest state goes through its
//! [`ExecutionGate`]. The gate is a reentrant mutex keyed by OS thread
//! identity: a thread that already holds it (for example because the guest
//! called back into the host in the middle of an evaluation) enters again
//! without blocking, while other threads wait until the depth drops to zero.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// Reentrant mutual exclusion with an observable nesting depth.
#[derive(Debug)]
pub struct ExecutionGate<T> {
    lock: ReentrantMutex<T>,
    depth: AtomicUsize,
}

impl<T> ExecutionGate<T> {
    /// Create an unlocked gate protecting `value`.
    pub fn new(value: T) -> Self {
        Self {
            lock: ReentrantMutex::new(value),
            depth: AtomicUsize::new(0),
        }
    }

    /// Acquire the gate, blocking while another thread holds it.
    ///
    /// Re-entering from the owning thread increments the depth and returns
    /// immediately. The gate is released when the returned guard drops.
    pub fn enter(&self) -> GateGuard<'_, T> {
        let guard = self.lock.lock();
        let level = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        GateGuard {
            guard,
            depth: &self.depth,
            level,
        }
    }

    /// Acquire the gate only if no other thread holds it.
    pub fn try_enter(&self) -> Option<GateGuard<'_, T>> {
        let guard = self.lock.try_lock()?;
        let level = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        Some(GateGuard {
            guard,
            depth: &self.depth,
            level,
        })
    }

    /// Current nesting depth (0 when unlocked).
    ///
    /// Only meaningful as a snapshot; another thread may change it right after.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Returns `true` if some thread holds the gate.
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Mutable access without locking, available when the gate is uniquely owned.
    pub fn get_mut(&mut self) -> &mut T {
        self.lock.get_mut()
    }
}

/// Proof of holding an [`ExecutionGate`] at a given depth.
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard<'a, T> {
    guard: ReentrantMutexGuard<'a, T>,
    depth: &'a AtomicUsize,
    level: usize,
}

impl<T> GateGuard<'_, T> {
    /// Nesting depth of this acquisition (1 for the outermost).
    pub fn depth(&self) -> usize {
        self.level
    }

    /// Returns `true` for the outermost acquisition on this thread.
    pub fn is_outermost(&self) -> bool {
        self.level == 1
    }
}

impl<T> Deref for GateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for GateGuard<'_, T> {
    fn drop(&mut self) {
        // Runs before the inner guard unlocks.
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T> std::fmt::Debug for GateGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateGuard")
            .field("depth", &self.level)
            .finish_non_exhaustive()
    }
}
