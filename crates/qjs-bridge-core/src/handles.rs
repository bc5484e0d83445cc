//! Bounded handle table with an intrusive freelist.
//!
//! Handles are one-based `u32` indices. Handle `0` ([`NULL_HANDLE`]) is never
//! issued and doubles as the failure result of [`HandleTable::allocate`].
//!
//! The guest keeps a table of exactly this shape for its own values. The host
//! uses [`HandleTable`] for the per-machine registry of open contexts.

/// The reserved handle meaning "no value" or "allocation failed".
pub const NULL_HANDLE: u32 = 0;

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    /// Next free slot while this slot is on the freelist (0 terminates).
    next_free: u32,
}

/// A bounded slot array mapping handles to values.
///
/// - `allocate` pops the freelist head, appends a fresh slot while below
///   capacity, and returns [`NULL_HANDLE`] when full
/// - `resolve` is total: unknown handles resolve to `None`
/// - `release` of an unknown or already released handle is a no-op
/// - the freelist is LIFO, so the most recently released slot is reused first
///
/// Slots are created on demand, so memory follows the peak number of live
/// values rather than the capacity.
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    capacity: u32,
    free_head: u32,
    live: usize,
}

impl<T> HandleTable<T> {
    /// Largest capacity a table can have; handle `u32::MAX` is never issued.
    pub const MAX_CAPACITY: u32 = u32::MAX - 1;

    /// Create a table able to hold `capacity` live values.
    ///
    /// Capacities above [`Self::MAX_CAPACITY`] are clamped.
    pub fn with_capacity(capacity: u32) -> Self {
        // Slot 0 is reserved and never placed on the freelist.
        let reserved = Slot {
            value: None,
            next_free: 0,
        };
        Self {
            slots: vec![reserved],
            capacity: capacity.min(Self::MAX_CAPACITY),
            free_head: NULL_HANDLE,
            live: 0,
        }
    }

    /// Store `value` and return its handle, or [`NULL_HANDLE`] when full.
    pub fn allocate(&mut self, value: T) -> u32 {
        if self.free_head != NULL_HANDLE {
            let handle = self.free_head;
            let slot = &mut self.slots[handle as usize];
            self.free_head = slot.next_free;
            slot.next_free = 0;
            slot.value = Some(value);
            self.live += 1;
            return handle;
        }

        let Ok(handle) = u32::try_from(self.slots.len()) else {
            return NULL_HANDLE;
        };
        if handle > self.capacity {
            return NULL_HANDLE;
        }
        self.slots.push(Slot {
            value: Some(value),
            next_free: 0,
        });
        self.live += 1;
        handle
    }

    /// Look up a handle.
    pub fn resolve(&self, handle: u32) -> Option<&T> {
        if handle == NULL_HANDLE {
            return None;
        }
        self.slots.get(handle as usize)?.value.as_ref()
    }

    /// Look up a handle for mutation.
    pub fn resolve_mut(&mut self, handle: u32) -> Option<&mut T> {
        if handle == NULL_HANDLE {
            return None;
        }
        self.slots.get_mut(handle as usize)?.value.as_mut()
    }

    /// Release a handle, returning the value it held.
    pub fn release(&mut self, handle: u32) -> Option<T> {
        if handle == NULL_HANDLE {
            return None;
        }
        let slot = self.slots.get_mut(handle as usize)?;
        let value = slot.value.take()?;
        slot.next_free = self.free_head;
        self.free_head = handle;
        self.live -= 1;
        Some(value)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` if no handle is live.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Maximum number of live handles.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Iterate over live handles and their values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots.iter().enumerate().skip(1).filter_map(|(index, slot)| {
            let handle = u32::try_from(index).ok()?;
            slot.value.as_ref().map(|value| (handle, value))
        })
    }

    /// Release every live handle, returning the values.
    pub fn drain(&mut self) -> Vec<T> {
        let handles: Vec<u32> = self.iter().map(|(handle, _)| handle).collect();
        handles
            .into_iter()
            .filter_map(|handle| self.release(handle))
            .collect()
    }
}
