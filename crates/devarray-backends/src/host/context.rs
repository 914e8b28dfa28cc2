//! Host-emulated accelerator context.
//!
//! Behaves like a driver context for device arrays: allocations live in a
//! private arena, driver calls fail unless the context is current on the
//! calling thread, and torn-down contexts reclaim everything they own.
//! Stream work executes at submission, which trivially preserves stream
//! order. Call counters and one-shot failure injection make it usable as a
//! test double.

use std::any::Any;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use devarray_core::{ComputeContext, DeviceContext, DevicePtr, DriverError};
use parking_lot::Mutex;

use super::memory::{status_error, HostArena, DEINITIALIZED, INVALID_CONTEXT};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the host context current on this thread.
    static CURRENT: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Stream handle of a host context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostStream {
    context: u64,
}

/// Driver entry points, for counters and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    Alloc,
    Free,
    Upload,
    Download,
    DeviceCopy,
}

/// Driver calls issued against a host context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub activations: u64,
    pub allocations: u64,
    pub frees: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub device_copies: u64,
    /// Calls among the above that were enqueued on the stream.
    pub async_calls: u64,
}

struct HostState {
    arena: HostArena,
    stats: HostStats,
    injected: Option<(HostOp, i32)>,
}

/// An accelerator context backed by host memory.
pub struct HostContext {
    id: u64,
    ordinal: usize,
    valid: AtomicBool,
    state: Mutex<HostState>,
}

impl HostContext {
    /// Unbounded context for device `ordinal`.
    pub fn new(ordinal: usize) -> Arc<Self> {
        Self::with_capacity(ordinal, None)
    }

    /// Context whose allocations fail with out-of-memory past `capacity` bytes.
    pub fn with_capacity(ordinal: usize, capacity: Option<usize>) -> Arc<Self> {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(context = id, ordinal, ?capacity, "created host context");
        Arc::new(Self {
            id,
            ordinal,
            valid: AtomicBool::new(true),
            state: Mutex::new(HostState {
                arena: HostArena::with_capacity(capacity),
                stats: HostStats::default(),
                injected: None,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Id of the host context current on the calling thread.
    pub fn current_id() -> Option<u64> {
        CURRENT.with(|c| c.get())
    }

    pub fn is_current(&self) -> bool {
        Self::current_id() == Some(self.id)
    }

    /// Tear the context down. Every allocation is reclaimed; arrays still
    /// bound to it skip their own free on drop.
    pub fn invalidate(&self) {
        if self.valid.swap(false, Ordering::SeqCst) {
            let mut state = self.state.lock();
            tracing::debug!(
                context = self.id,
                reclaimed = state.arena.live_allocations(),
                "host context torn down"
            );
            state.arena.clear();
        }
    }

    /// Wait for stream work. Host streams run at submission, so this only
    /// checks the context is still alive.
    pub fn synchronize(&self) -> Result<(), DriverError> {
        if !self.is_valid() {
            return Err(status_error(DEINITIALIZED));
        }
        Ok(())
    }

    /// Make the next `op` call fail with `code`.
    pub fn inject_failure(&self, op: HostOp, code: i32) {
        self.state.lock().injected = Some((op, code));
    }

    pub fn stats(&self) -> HostStats {
        self.state.lock().stats
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().arena.used_bytes()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().arena.live_allocations()
    }

    /// Run a driver call: require this context current and alive, count the
    /// call, apply any injected failure, then hand over the arena.
    fn driver_call<R>(
        &self,
        op: HostOp,
        asynchronous: bool,
        f: impl FnOnce(&mut HostArena) -> Result<R, DriverError>,
    ) -> Result<R, DriverError> {
        if !self.is_current() {
            return Err(status_error(INVALID_CONTEXT));
        }
        if !self.is_valid() {
            return Err(status_error(DEINITIALIZED));
        }
        let mut state = self.state.lock();
        let stats = &mut state.stats;
        match op {
            HostOp::Alloc => stats.allocations += 1,
            HostOp::Free => stats.frees += 1,
            HostOp::Upload => stats.uploads += 1,
            HostOp::Download => stats.downloads += 1,
            HostOp::DeviceCopy => stats.device_copies += 1,
        }
        if asynchronous {
            stats.async_calls += 1;
        }
        if let Some((failing, code)) = state.injected {
            if failing == op {
                state.injected = None;
                return Err(status_error(code));
            }
        }
        f(&mut state.arena)
    }

    fn check_stream(&self, stream: HostStream) -> Result<(), DriverError> {
        if stream.context != self.id {
            return Err(status_error(INVALID_CONTEXT));
        }
        Ok(())
    }
}

impl ComputeContext for HostContext {
    fn backend_name(&self) -> &'static str {
        Self::BACKEND
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl DeviceContext for HostContext {
    const BACKEND: &'static str = "host";
    type Stream = HostStream;
    type Saved = Option<u64>;

    fn current_stream(&self) -> HostStream {
        HostStream { context: self.id }
    }

    fn make_current(&self) -> Result<Option<u64>, DriverError> {
        if !self.is_valid() {
            return Err(status_error(DEINITIALIZED));
        }
        self.state.lock().stats.activations += 1;
        Ok(CURRENT.with(|c| c.replace(Some(self.id))))
    }

    fn restore_current(&self, previous: Option<u64>) {
        CURRENT.with(|c| c.set(previous));
    }

    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, DriverError> {
        self.driver_call(HostOp::Alloc, false, |arena| arena.alloc(bytes))
    }

    unsafe fn mem_free(&self, ptr: DevicePtr) -> Result<(), DriverError> {
        self.driver_call(HostOp::Free, false, |arena| arena.free(ptr))
    }

    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DriverError> {
        self.driver_call(HostOp::Upload, false, |arena| {
            arena.region(dst, src.len())?.copy_from_slice(src);
            Ok(())
        })
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: HostStream,
    ) -> Result<(), DriverError> {
        self.check_stream(stream)?;
        self.driver_call(HostOp::Upload, true, |arena| {
            arena.region(dst, src.len())?.copy_from_slice(src);
            Ok(())
        })
    }

    unsafe fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverError> {
        self.driver_call(HostOp::Download, false, |arena| {
            dst.copy_from_slice(arena.region(src, dst.len())?);
            Ok(())
        })
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: HostStream,
    ) -> Result<(), DriverError> {
        self.check_stream(stream)?;
        self.driver_call(HostOp::Download, true, |arena| {
            dst.copy_from_slice(arena.region(src, dst.len())?);
            Ok(())
        })
    }

    unsafe fn memcpy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: HostStream,
    ) -> Result<(), DriverError> {
        self.check_stream(stream)?;
        self.driver_call(HostOp::DeviceCopy, true, |arena| arena.copy(dst, src, bytes))
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HostContext")
            .field("id", &self.id)
            .field("ordinal", &self.ordinal)
            .field("valid", &self.is_valid())
            .field("live_allocations", &state.arena.live_allocations())
            .field("used_bytes", &state.arena.used_bytes())
            .finish()
    }
}
