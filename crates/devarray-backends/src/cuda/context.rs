//! CUDA driver context.
//!
//! Retains the primary context of one device and owns a non-blocking
//! stream on it. Uses `cudarc`'s raw driver `result` API so that array
//! allocations map one-to-one onto `cuMemAlloc`/`cuMemFree`.

use std::any::Any;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cudarc::driver::{result, sys};
use devarray_core::{ComputeContext, DeviceContext, DevicePtr, DriverError};

/// Convert a cudarc driver error into a code plus the driver's message.
fn driver_error(err: cudarc::driver::DriverError) -> DriverError {
    let description = err
        .error_string()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| format!("{:?}", err.0));
    DriverError::new(err.0 as i32, description)
}

/// A CUDA device's primary context plus the stream arrays enqueue on.
pub struct CudaContext {
    ordinal: usize,
    device: sys::CUdevice,
    context: sys::CUcontext,
    stream: sys::CUstream,
    valid: AtomicBool,
}

// The driver API is thread-safe; the raw handles are only used with the
// context made current through a selector.
unsafe impl Send for CudaContext {}
unsafe impl Sync for CudaContext {}

impl CudaContext {
    /// Retain the primary context of device `ordinal` and create its stream.
    pub fn new(ordinal: usize) -> Result<Arc<Self>, DriverError> {
        result::init().map_err(driver_error)?;
        let device = result::device::get(ordinal as i32).map_err(driver_error)?;
        let context = unsafe { result::primary_ctx::retain(device) }.map_err(driver_error)?;

        let previous = result::ctx::get_current().map_err(driver_error)?;
        unsafe { result::ctx::set_current(context) }.map_err(driver_error)?;
        let stream = result::stream::create(result::stream::StreamKind::NonBlocking);
        if let Err(err) = unsafe { result::ctx::set_current(previous.unwrap_or(ptr::null_mut())) } {
            tracing::warn!(error = %driver_error(err), "failed to restore previous CUDA context");
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                unsafe {
                    let _ = result::primary_ctx::release(device);
                }
                return Err(driver_error(err));
            }
        };

        tracing::info!(ordinal, "retained CUDA primary context");
        Ok(Arc::new(Self {
            ordinal,
            device,
            context,
            stream,
            valid: AtomicBool::new(true),
        }))
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Block until all work enqueued on the context's stream has completed.
    pub fn synchronize(&self) -> Result<(), DriverError> {
        let previous = self.make_current()?;
        let synced = unsafe { result::stream::synchronize(self.stream) }.map_err(driver_error);
        self.restore_current(previous);
        synced
    }

    /// Mark the context torn down. Arrays still bound to it stop freeing
    /// their allocations; the driver reclaims them when the primary context
    /// is released.
    pub fn teardown(&self) {
        if self.valid.swap(false, Ordering::SeqCst) {
            tracing::debug!(ordinal = self.ordinal, "CUDA context torn down");
        }
    }
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        unsafe {
            if result::ctx::set_current(self.context).is_ok() {
                let _ = result::stream::destroy(self.stream);
            }
            let _ = result::primary_ctx::release(self.device);
        }
    }
}

impl ComputeContext for CudaContext {
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

impl DeviceContext for CudaContext {
    const BACKEND: &'static str = "cuda";
    type Stream = sys::CUstream;
    type Saved = sys::CUcontext;

    fn current_stream(&self) -> sys::CUstream {
        self.stream
    }

    fn make_current(&self) -> Result<sys::CUcontext, DriverError> {
        let previous = result::ctx::get_current().map_err(driver_error)?;
        unsafe { result::ctx::set_current(self.context) }.map_err(driver_error)?;
        Ok(previous.unwrap_or(ptr::null_mut()))
    }

    fn restore_current(&self, previous: sys::CUcontext) {
        if let Err(err) = unsafe { result::ctx::set_current(previous) } {
            tracing::warn!(error = %driver_error(err), "failed to restore previous CUDA context");
        }
    }

    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, DriverError> {
        unsafe { result::malloc_sync(bytes) }
            .map(DevicePtr)
            .map_err(driver_error)
    }

    unsafe fn mem_free(&self, ptr: DevicePtr) -> Result<(), DriverError> {
        result::free_sync(ptr.0).map_err(driver_error)
    }

    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DriverError> {
        result::memcpy_htod_sync(dst.0, src).map_err(driver_error)
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: sys::CUstream,
    ) -> Result<(), DriverError> {
        result::memcpy_htod_async(dst.0, src, stream).map_err(driver_error)
    }

    unsafe fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverError> {
        result::memcpy_dtoh_sync(dst, src.0).map_err(driver_error)
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: sys::CUstream,
    ) -> Result<(), DriverError> {
        result::memcpy_dtoh_async(dst, src.0, stream).map_err(driver_error)
    }

    unsafe fn memcpy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: sys::CUstream,
    ) -> Result<(), DriverError> {
        result::memcpy_dtod_async(dst.0, src.0, bytes, stream).map_err(driver_error)
    }
}

impl std::fmt::Debug for CudaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaContext")
            .field("ordinal", &self.ordinal)
            .field("valid", &self.is_valid())
            .finish()
    }
}
