//! In-memory context double for unit tests.

use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{ComputeContext, DeviceContext, DevicePtr};
use crate::error::DriverError;

const HANDLE_SHIFT: u32 = 32;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Cell<Option<u64>> = const { Cell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Alloc,
    Free,
    HtoD,
    HtoDAsync,
    DtoH,
    DtoHAsync,
    DtoDAsync,
}

#[derive(Default)]
struct MockState {
    memory: HashMap<u64, Vec<u8>>,
    next_handle: u64,
    calls: HashMap<MockOp, usize>,
    activations: usize,
    fail: Option<(MockOp, i32)>,
    null_alloc: bool,
}

pub struct MockContext {
    id: u64,
    valid: AtomicBool,
    state: Mutex<MockState>,
}

impl MockContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            valid: AtomicBool::new(true),
            state: Mutex::new(MockState::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn current() -> Option<u64> {
        CURRENT.with(|c| c.get())
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn fail_next(&self, op: MockOp, code: i32) {
        self.state.lock().fail = Some((op, code));
    }

    /// Make the next allocation succeed with a null pointer.
    pub fn null_next_alloc(&self) {
        self.state.lock().null_alloc = true;
    }

    pub fn calls(&self, op: MockOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn activations(&self) -> usize {
        self.state.lock().activations
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().memory.len()
    }

    fn enter(&self, op: MockOp) -> Result<(), DriverError> {
        if Self::current() != Some(self.id) {
            return Err(DriverError::new(201, "invalid device context"));
        }
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;
        match state.fail {
            Some((failing, code)) if failing == op => {
                state.fail = None;
                Err(DriverError::new(code, "injected failure"))
            }
            _ => Ok(()),
        }
    }

    fn with_region<R>(
        &self,
        ptr: DevicePtr,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, DriverError> {
        let handle = ptr.0 >> HANDLE_SHIFT;
        let offset = (ptr.0 & ((1 << HANDLE_SHIFT) - 1)) as usize;
        let mut state = self.state.lock();
        let block = state
            .memory
            .get_mut(&handle)
            .filter(|b| offset + len <= b.len())
            .ok_or_else(|| DriverError::new(700, "an illegal memory access was encountered"))?;
        Ok(f(&mut block[offset..offset + len]))
    }
}

impl ComputeContext for MockContext {
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

impl DeviceContext for MockContext {
    const BACKEND: &'static str = "mock";
    type Stream = ();
    type Saved = Option<u64>;

    fn current_stream(&self) {}

    fn make_current(&self) -> Result<Option<u64>, DriverError> {
        if !self.is_valid() {
            return Err(DriverError::new(201, "invalid device context"));
        }
        self.state.lock().activations += 1;
        Ok(CURRENT.with(|c| c.replace(Some(self.id))))
    }

    fn restore_current(&self, previous: Option<u64>) {
        CURRENT.with(|c| c.set(previous));
    }

    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, DriverError> {
        self.enter(MockOp::Alloc)?;
        let mut state = self.state.lock();
        if std::mem::take(&mut state.null_alloc) {
            return Ok(DevicePtr::NULL);
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.memory.insert(handle, vec![0u8; bytes]);
        Ok(DevicePtr(handle << HANDLE_SHIFT))
    }

    unsafe fn mem_free(&self, ptr: DevicePtr) -> Result<(), DriverError> {
        self.enter(MockOp::Free)?;
        self.state
            .lock()
            .memory
            .remove(&(ptr.0 >> HANDLE_SHIFT))
            .map(|_| ())
            .ok_or_else(|| DriverError::new(1, "invalid argument"))
    }

    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DriverError> {
        self.enter(MockOp::HtoD)?;
        self.with_region(dst, src.len(), |region| region.copy_from_slice(src))
    }

    unsafe fn memcpy_htod_async(&self, dst: DevicePtr, src: &[u8], _: ()) -> Result<(), DriverError> {
        self.enter(MockOp::HtoDAsync)?;
        self.with_region(dst, src.len(), |region| region.copy_from_slice(src))
    }

    unsafe fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverError> {
        self.enter(MockOp::DtoH)?;
        self.with_region(src, dst.len(), |region| dst.copy_from_slice(region))
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        _: (),
    ) -> Result<(), DriverError> {
        self.enter(MockOp::DtoHAsync)?;
        self.with_region(src, dst.len(), |region| dst.copy_from_slice(region))
    }

    unsafe fn memcpy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        _: (),
    ) -> Result<(), DriverError> {
        self.enter(MockOp::DtoDAsync)?;
        let data = self.with_region(src, bytes, |region| region.to_vec())?;
        self.with_region(dst, bytes, |region| region.copy_from_slice(&data))
    }
}
