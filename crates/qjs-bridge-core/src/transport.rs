//! Byte-region transport between host buffers and guest linear memory.
//!
//! The free functions operate on a plain byte slice standing in for linear
//! memory, so they are testable without a guest. [`GuestMemory`] applies them
//! to a live wasmtime [`Memory`]. All multi-byte values are little-endian, as
//! in wasm32.

use std::ops::Range;

use qjs_bridge_common::BridgeError;
use wasmtime::{AsContext, AsContextMut, Memory};

/// Size of a wasm page in bytes.
pub const WASM_PAGE_SIZE: usize = 64 * 1024;

/// Validate `[ptr, ptr + len)` against a memory of `memory_size` bytes.
pub fn checked_range(memory_size: usize, ptr: u32, len: usize) -> Result<Range<usize>, BridgeError> {
    let start = ptr as usize;
    match start.checked_add(len) {
        Some(end) if end <= memory_size => Ok(start..end),
        _ => Err(BridgeError::OutOfBounds {
            ptr,
            len,
            memory_size,
        }),
    }
}

/// Borrow `len` bytes at `ptr`.
pub fn read_bytes(memory: &[u8], ptr: u32, len: usize) -> Result<&[u8], BridgeError> {
    let range = checked_range(memory.len(), ptr, len)?;
    Ok(&memory[range])
}

/// Copy `data` to `ptr`.
pub fn write_bytes(memory: &mut [u8], ptr: u32, data: &[u8]) -> Result<(), BridgeError> {
    let range = checked_range(memory.len(), ptr, data.len())?;
    memory[range].copy_from_slice(data);
    Ok(())
}

/// Read a little-endian `u32`.
pub fn read_u32(memory: &[u8], ptr: u32) -> Result<u32, BridgeError> {
    let bytes = read_bytes(memory, ptr, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a little-endian `i32`.
pub fn read_i32(memory: &[u8], ptr: u32) -> Result<i32, BridgeError> {
    let bytes = read_bytes(memory, ptr, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a little-endian `i64`.
pub fn read_i64(memory: &[u8], ptr: u32) -> Result<i64, BridgeError> {
    let bytes = read_bytes(memory, ptr, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(i64::from_le_bytes(raw))
}

/// Read a little-endian `f64`.
pub fn read_f64(memory: &[u8], ptr: u32) -> Result<f64, BridgeError> {
    let bytes = read_bytes(memory, ptr, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(f64::from_le_bytes(raw))
}

/// Read `count` consecutive `u32`s (a guest `uint32_t[]`).
pub fn read_u32_array(memory: &[u8], ptr: u32, count: usize) -> Result<Vec<u32>, BridgeError> {
    let len = count.checked_mul(4).ok_or(BridgeError::OutOfBounds {
        ptr,
        len: usize::MAX,
        memory_size: memory.len(),
    })?;
    let bytes = read_bytes(memory, ptr, len)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Encode `u32`s as a guest `uint32_t[]`.
pub fn encode_u32_array(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

/// Copy `s` with a trailing NUL, as the guest's C entry points expect.
pub fn encode_cstring(s: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    bytes
}

/// Read a NUL-terminated string of at most `max_len` bytes.
///
/// Stops at the first NUL, at `max_len`, or at the end of memory. Invalid
/// UTF-8 is replaced rather than rejected.
pub fn read_cstring(memory: &[u8], ptr: u32, max_len: usize) -> Result<String, BridgeError> {
    let start = ptr as usize;
    if start > memory.len() {
        return Err(BridgeError::OutOfBounds {
            ptr,
            len: 0,
            memory_size: memory.len(),
        });
    }
    let window = &memory[start..memory.len().min(start.saturating_add(max_len))];
    let end = window.iter().position(|&b| b == 0).unwrap_or(window.len());
    Ok(String::from_utf8_lossy(&window[..end]).into_owned())
}

/// Read `len` bytes at `ptr` as a string, replacing invalid UTF-8.
pub fn read_string(memory: &[u8], ptr: u32, len: usize) -> Result<String, BridgeError> {
    read_bytes(memory, ptr, len).map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

/// A guest's exported linear memory.
#[derive(Debug, Clone, Copy)]
pub struct GuestMemory {
    memory: Memory,
}

impl GuestMemory {
    /// Wrap an exported memory.
    pub fn new(memory: Memory) -> Self {
        Self { memory }
    }

    /// The underlying wasmtime memory.
    pub fn inner(&self) -> Memory {
        self.memory
    }

    /// Current size in bytes.
    pub fn size(&self, store: impl AsContext) -> usize {
        self.memory.data_size(store)
    }

    /// Copy `len` bytes out of the guest.
    pub fn read(&self, store: impl AsContext, ptr: u32, len: usize) -> Result<Vec<u8>, BridgeError> {
        read_bytes(self.memory.data(&store), ptr, len).map(<[u8]>::to_vec)
    }

    /// Copy `data` into the guest.
    pub fn write(&self, mut store: impl AsContextMut, ptr: u32, data: &[u8]) -> Result<(), BridgeError> {
        write_bytes(self.memory.data_mut(&mut store), ptr, data)
    }

    /// Read a `u32` out-parameter.
    pub fn read_u32(&self, store: impl AsContext, ptr: u32) -> Result<u32, BridgeError> {
        read_u32(self.memory.data(&store), ptr)
    }

    /// Read an `i32` out-parameter.
    pub fn read_i32(&self, store: impl AsContext, ptr: u32) -> Result<i32, BridgeError> {
        read_i32(self.memory.data(&store), ptr)
    }

    /// Read an `i64` out-parameter.
    pub fn read_i64(&self, store: impl AsContext, ptr: u32) -> Result<i64, BridgeError> {
        read_i64(self.memory.data(&store), ptr)
    }

    /// Read an `f64` out-parameter.
    pub fn read_f64(&self, store: impl AsContext, ptr: u32) -> Result<f64, BridgeError> {
        read_f64(self.memory.data(&store), ptr)
    }

    /// Read a guest `uint32_t[]`.
    pub fn read_u32_array(
        &self,
        store: impl AsContext,
        ptr: u32,
        count: usize,
    ) -> Result<Vec<u32>, BridgeError> {
        read_u32_array(self.memory.data(&store), ptr, count)
    }

    /// Read `len` bytes as a (lossy) UTF-8 string.
    pub fn read_string(&self, store: impl AsContext, ptr: u32, len: usize) -> Result<String, BridgeError> {
        read_string(self.memory.data(&store), ptr, len)
    }

    /// Grow memory by enough whole pages to hold `bytes` and return the guest
    /// address of the new region together with its size.
    ///
    /// The region lies above everything the guest allocator has claimed so far;
    /// later guest growth lands above it.
    pub fn reserve(&self, mut store: impl AsContextMut, bytes: usize) -> Result<(u32, usize), BridgeError> {
        let pages = bytes.div_ceil(WASM_PAGE_SIZE).max(1);
        let old_pages = self
            .memory
            .grow(&mut store, pages as u64)
            .map_err(|e| BridgeError::instantiation_failed(format!("Failed to reserve arena: {e}")))?;

        let base = usize::try_from(old_pages)
            .ok()
            .and_then(|p| p.checked_mul(WASM_PAGE_SIZE))
            .and_then(|b| u32::try_from(b).ok())
            .ok_or_else(|| BridgeError::instantiation_failed("Arena lies outside 32-bit memory"))?;

        Ok((base, pages * WASM_PAGE_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::BumpArena;

    #[test]
    fn test_checked_range() {
        assert_eq!(checked_range(16, 4, 8).unwrap(), 4..12);
        assert_eq!(checked_range(16, 16, 0).unwrap(), 16..16);
        assert!(checked_range(16, 12, 8).is_err());
        assert!(checked_range(16, u32::MAX, 2).is_err());
    }

    #[test]
    fn test_out_of_bounds_error() {
        let memory = [0u8; 8];
        let err = read_bytes(&memory, 6, 4).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::OutOfBounds {
                ptr: 6,
                len: 4,
                memory_size: 8
            }
        ));
    }

    #[test]
    fn test_u32_roundtrip_little_endian() {
        let mut memory = vec![0u8; 16];
        write_bytes(&mut memory, 4, &encode_u32_array(&[0x0102_0304, 7])).unwrap();

        assert_eq!(&memory[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(read_u32(&memory, 4).unwrap(), 0x0102_0304);
        assert_eq!(read_u32_array(&memory, 4, 2).unwrap(), vec![0x0102_0304, 7]);
    }

    #[test]
    fn test_read_i64_and_f64() {
        let mut memory = vec![0u8; 16];
        write_bytes(&mut memory, 0, &(-42i64).to_le_bytes()).unwrap();
        write_bytes(&mut memory, 8, &1.5f64.to_le_bytes()).unwrap();

        assert_eq!(read_i64(&memory, 0).unwrap(), -42);
        assert_eq!(read_i32(&memory, 0).unwrap(), -42);
        assert!((read_f64(&memory, 8).unwrap() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cstring() {
        let mut memory = vec![0xFFu8; 32];
        write_bytes(&mut memory, 2, &encode_cstring("hello")).unwrap();

        assert_eq!(read_cstring(&memory, 2, 32).unwrap(), "hello");
        assert_eq!(read_cstring(&memory, 2, 3).unwrap(), "hel");
        assert!(read_cstring(&memory, 40, 4).is_err());
    }

    #[test]
    fn test_read_string_is_lossy() {
        let memory = [b'o', b'k', 0xC3, 0x28];
        assert_eq!(read_string(&memory, 0, 2).unwrap(), "ok");
        assert_eq!(read_string(&memory, 0, 4).unwrap(), "ok\u{FFFD}(");
    }

    /// A string shorter than the arena written through an arena allocation
    /// reads back byte-for-byte.
    #[test]
    fn test_arena_string_roundtrip() {
        let base = 1024u32;
        let mut memory = vec![0u8; 1024 + 4096];
        let mut arena = BumpArena::new(base, 4096);

        let text = "héllo, wörld: \u{1F600} ".repeat(40);
        let encoded = encode_cstring(&text);
        arena.alloc(100).unwrap();
        let slot = arena.alloc(encoded.len()).unwrap();
        write_bytes(&mut memory, slot.addr, &encoded).unwrap();

        let back = read_bytes(&memory, slot.addr, text.len()).unwrap();
        assert_eq!(back, text.as_bytes());
        assert_eq!(read_cstring(&memory, slot.addr, encoded.len()).unwrap(), text);
    }
}
