//! Arena standing in for device memory on the host backend.
//!
//! Device addresses encode an allocation handle in the high bits and a byte
//! offset in the low bits, so `DevicePtr::offset` works the way it does on a
//! real device address space.

use std::collections::HashMap;

use devarray_core::{DevicePtr, DriverError};
use parking_lot::{const_mutex, Mutex};

// Status codes follow the CUDA driver's numbering.
pub const INVALID_VALUE: i32 = 1;
pub const OUT_OF_MEMORY: i32 = 2;
pub const DEINITIALIZED: i32 = 4;
pub const INVALID_CONTEXT: i32 = 201;
pub const ILLEGAL_ADDRESS: i32 = 700;

/// Driver error for a host status code.
pub fn status_error(code: i32) -> DriverError {
    let description = match code {
        INVALID_VALUE => "invalid argument",
        OUT_OF_MEMORY => "out of memory",
        DEINITIALIZED => "driver shutting down",
        INVALID_CONTEXT => "invalid device context",
        ILLEGAL_ADDRESS => "an illegal memory access was encountered",
        _ => "unknown error",
    };
    DriverError::new(code, description)
}

const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Handles must fit in the bits above the offset. Handle 0 is never issued,
/// so no allocation ever encodes to the null address.
const MAX_HANDLE: u64 = (1 << (u64::BITS - OFFSET_BITS)) - 1;

fn split(ptr: DevicePtr) -> (u64, usize) {
    (ptr.0 >> OFFSET_BITS, (ptr.0 & OFFSET_MASK) as usize)
}

/// Allocation handles, unique across every host context in the process.
///
/// A pointer of one context therefore never resolves inside another
/// context's arena. Freed handles are recycled before fresh ones are issued.
#[derive(Debug)]
pub(crate) struct HandlePool {
    next: u64,
    limit: u64,
    free: Vec<u64>,
}

impl HandlePool {
    pub const fn with_limit(limit: u64) -> Self {
        Self {
            next: 1,
            limit,
            free: Vec::new(),
        }
    }

    /// A handle not in use anywhere, or `None` once all are live.
    pub fn acquire(&mut self) -> Option<u64> {
        if let Some(handle) = self.free.pop() {
            return Some(handle);
        }
        if self.next > self.limit {
            return None;
        }
        let handle = self.next;
        self.next += 1;
        Some(handle)
    }

    pub fn release(&mut self, handle: u64) {
        self.free.push(handle);
    }
}

static HANDLES: Mutex<HandlePool> = const_mutex(HandlePool::with_limit(MAX_HANDLE));

/// Handle-keyed allocations with an optional capacity limit.
#[derive(Debug)]
pub(crate) struct HostArena {
    blocks: HashMap<u64, Vec<u8>>,
    used_bytes: usize,
    capacity: Option<usize>,
}

impl HostArena {
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            blocks: HashMap::new(),
            used_bytes: 0,
            capacity,
        }
    }

    pub fn alloc(&mut self, bytes: usize) -> Result<DevicePtr, DriverError> {
        if bytes as u64 > OFFSET_MASK {
            return Err(status_error(OUT_OF_MEMORY));
        }
        if let Some(capacity) = self.capacity {
            if self.used_bytes + bytes > capacity {
                return Err(status_error(OUT_OF_MEMORY));
            }
        }
        let handle = HANDLES
            .lock()
            .acquire()
            .ok_or_else(|| status_error(OUT_OF_MEMORY))?;
        self.blocks.insert(handle, vec![0u8; bytes]);
        self.used_bytes += bytes;
        Ok(DevicePtr(handle << OFFSET_BITS))
    }

    /// Free a base address previously returned by `alloc`.
    pub fn free(&mut self, ptr: DevicePtr) -> Result<(), DriverError> {
        let (handle, offset) = split(ptr);
        if offset != 0 {
            return Err(status_error(INVALID_VALUE));
        }
        let block = self
            .blocks
            .remove(&handle)
            .ok_or_else(|| status_error(INVALID_VALUE))?;
        self.used_bytes -= block.len();
        HANDLES.lock().release(handle);
        Ok(())
    }

    /// The `len` bytes starting at `ptr`, which must lie in one allocation.
    pub fn region(&mut self, ptr: DevicePtr, len: usize) -> Result<&mut [u8], DriverError> {
        let (handle, offset) = split(ptr);
        let block = self
            .blocks
            .get_mut(&handle)
            .ok_or_else(|| status_error(ILLEGAL_ADDRESS))?;
        match offset.checked_add(len) {
            Some(end) if end <= block.len() => Ok(&mut block[offset..end]),
            _ => Err(status_error(ILLEGAL_ADDRESS)),
        }
    }

    pub fn copy(&mut self, dst: DevicePtr, src: DevicePtr, len: usize) -> Result<(), DriverError> {
        let staged = self.region(src, len)?.to_vec();
        self.region(dst, len)?.copy_from_slice(&staged);
        Ok(())
    }

    /// Drop every allocation at once, as a context teardown does.
    pub fn clear(&mut self) {
        let mut handles = HANDLES.lock();
        for (handle, _) in self.blocks.drain() {
            handles.release(handle);
        }
        self.used_bytes = 0;
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn live_allocations(&self) -> usize {
        self.blocks.len()
    }
}

impl Default for HostArena {
    fn default() -> Self {
        Self::with_capacity(None)
    }
}

impl Drop for HostArena {
    fn drop(&mut self) {
        self.clear();
    }
}
