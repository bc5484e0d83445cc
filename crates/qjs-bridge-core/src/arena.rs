//! Bump arena for transient boundary data.
//!
//! The arena hands out 8-byte aligned ranges of a fixed region of guest
//! linear memory. There is no per-allocation free: the whole arena is reset
//! at the start of each top-level operation, and a request that does not fit
//! in the remaining space resets it and starts again from offset zero.
//!
//! An address is only valid until the next reset or wraparound, so data
//! written here must be consumed by the guest within the entry-point call it
//! was written for.

use qjs_bridge_common::BridgeError;

/// Alignment of every arena allocation.
pub const ARENA_ALIGN: usize = 8;

/// Round `size` up to [`ARENA_ALIGN`].
pub const fn align_up(size: usize) -> Option<usize> {
    match size.checked_add(ARENA_ALIGN - 1) {
        Some(padded) => Some(padded & !(ARENA_ALIGN - 1)),
        None => None,
    }
}

/// Result of an arena allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Guest address of the first byte.
    pub addr: u32,
    /// `true` if the arena wrapped to satisfy this request, invalidating
    /// every address handed out before it.
    pub wrapped: bool,
}

/// A reset-on-overflow bump allocator over `[base, base + capacity)`.
#[derive(Debug, Clone)]
pub struct BumpArena {
    base: u32,
    capacity: usize,
    offset: usize,
    wraps: u64,
}

impl BumpArena {
    /// Create an arena over the region starting at guest address `base`.
    ///
    /// The usable capacity is truncated to a multiple of [`ARENA_ALIGN`] and
    /// to what fits in the 32-bit address space.
    pub fn new(base: u32, capacity: usize) -> Self {
        let addressable = (u32::MAX - base) as usize;
        let capacity = capacity.min(addressable) & !(ARENA_ALIGN - 1);
        Self {
            base,
            capacity,
            offset: 0,
            wraps: 0,
        }
    }

    /// An arena with no backing region; every non-empty request fails.
    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    /// Allocate `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ArenaExhausted`] if `size` exceeds the whole arena.
    pub fn alloc(&mut self, size: usize) -> Result<Allocation, BridgeError> {
        let aligned = self.check_fits(size)?;
        let wrapped = self.make_room(aligned);
        let addr = self.addr_at(self.offset);
        self.offset += aligned;
        Ok(Allocation { addr, wrapped })
    }

    /// Allocate several buffers that must all stay valid together.
    ///
    /// The buffers are placed in one contiguous step: either all of them fit
    /// after the current offset, or the arena wraps once and places all of
    /// them from offset zero. Returns the addresses in request order and
    /// whether a wrap happened.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ArenaExhausted`] if the buffers together exceed
    /// the whole arena.
    pub fn alloc_many(&mut self, sizes: &[usize]) -> Result<(Vec<u32>, bool), BridgeError> {
        let mut total = 0usize;
        let mut aligned_sizes = Vec::with_capacity(sizes.len());
        for &size in sizes {
            let aligned = align_up(size).ok_or(self.exhausted(usize::MAX))?;
            total = total.checked_add(aligned).ok_or(self.exhausted(usize::MAX))?;
            aligned_sizes.push(aligned);
        }
        if total > self.capacity {
            return Err(self.exhausted(total));
        }

        let wrapped = self.make_room(total);
        let mut addrs = Vec::with_capacity(sizes.len());
        for aligned in aligned_sizes {
            addrs.push(self.addr_at(self.offset));
            self.offset += aligned;
        }
        Ok((addrs, wrapped))
    }

    /// Discard every allocation.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Guest address of the arena region.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Usable capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out since the last reset or wrap.
    pub fn used(&self) -> usize {
        self.offset
    }

    /// Number of wraparounds since creation.
    pub fn wraps(&self) -> u64 {
        self.wraps
    }

    /// Returns `true` if `[addr, addr + len)` lies inside the arena region.
    pub fn contains(&self, addr: u32, len: usize) -> bool {
        let start = addr as usize;
        let base = self.base as usize;
        start >= base
            && start
                .checked_add(len)
                .is_some_and(|end| end <= base + self.capacity)
    }

    fn check_fits(&self, size: usize) -> Result<usize, BridgeError> {
        match align_up(size) {
            Some(aligned) if aligned <= self.capacity => Ok(aligned),
            _ => Err(self.exhausted(size)),
        }
    }

    fn make_room(&mut self, aligned: usize) -> bool {
        if self.offset + aligned > self.capacity {
            self.offset = 0;
            self.wraps += 1;
            true
        } else {
            false
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn addr_at(&self, offset: usize) -> u32 {
        // `new` keeps base + capacity within u32.
        self.base + offset as u32
    }

    fn exhausted(&self, requested: usize) -> BridgeError {
        BridgeError::ArenaExhausted {
            requested,
            capacity: self.capacity,
        }
    }
}
