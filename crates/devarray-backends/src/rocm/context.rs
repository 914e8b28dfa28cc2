//! HIP device context.
//!
//! HIP has no explicit context objects: the current device of the calling
//! thread plays that role, so making a context current means
//! `hipSetDevice` and restoring means setting the saved device back.

use std::any::Any;
use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use devarray_core::{ComputeContext, DeviceContext, DevicePtr, DriverError};

use super::ffi::{
    self, check_hip, HipApi, HipDeviceptr, HipStream, HIP_MEMCPY_DEVICE_TO_DEVICE,
    HIP_MEMCPY_DEVICE_TO_HOST, HIP_MEMCPY_HOST_TO_DEVICE, HIP_STREAM_NON_BLOCKING,
};

/// One HIP device plus the stream arrays enqueue on.
pub struct RocmContext {
    api: &'static HipApi,
    device: c_int,
    stream: HipStream,
    valid: AtomicBool,
}

// HIP streams may be used from any thread once created.
unsafe impl Send for RocmContext {}
unsafe impl Sync for RocmContext {}

impl RocmContext {
    /// Initialize HIP, select device `ordinal` and create its stream.
    pub fn new(ordinal: usize) -> Result<Arc<Self>, DriverError> {
        let api = ffi::hip_api().ok_or_else(ffi::not_available)?;
        let device = ordinal as c_int;
        check_hip(api, unsafe { (api.hip_init)(0) })?;

        let mut previous: c_int = 0;
        check_hip(api, unsafe { (api.hip_get_device)(&mut previous) })?;
        check_hip(api, unsafe { (api.hip_set_device)(device) })?;
        let mut stream: HipStream = std::ptr::null_mut();
        let created = check_hip(api, unsafe {
            (api.hip_stream_create_with_flags)(&mut stream, HIP_STREAM_NON_BLOCKING)
        });
        if let Err(err) = check_hip(api, unsafe { (api.hip_set_device)(previous) }) {
            tracing::warn!(error = %err, "failed to restore previous HIP device");
        }
        created?;

        tracing::info!(ordinal, "opened HIP device");
        Ok(Arc::new(Self {
            api,
            device,
            stream,
            valid: AtomicBool::new(true),
        }))
    }

    pub fn ordinal(&self) -> usize {
        self.device as usize
    }

    /// Block until all work enqueued on the context's stream has completed.
    pub fn synchronize(&self) -> Result<(), DriverError> {
        let previous = self.make_current()?;
        let synced = check_hip(self.api, unsafe {
            (self.api.hip_stream_synchronize)(self.stream)
        });
        self.restore_current(previous);
        synced
    }

    /// Mark the context torn down; arrays still bound to it stop freeing.
    pub fn teardown(&self) {
        if self.valid.swap(false, Ordering::SeqCst) {
            tracing::debug!(device = self.device, "HIP context torn down");
        }
    }

    fn memcpy(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        bytes: usize,
        kind: c_int,
    ) -> Result<(), DriverError> {
        check_hip(self.api, unsafe { (self.api.hip_memcpy)(dst, src, bytes, kind) })
    }

    fn memcpy_async(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        bytes: usize,
        kind: c_int,
        stream: HipStream,
    ) -> Result<(), DriverError> {
        check_hip(self.api, unsafe {
            (self.api.hip_memcpy_async)(dst, src, bytes, kind, stream)
        })
    }
}

fn device_ptr(ptr: DevicePtr) -> HipDeviceptr {
    ptr.0 as usize as HipDeviceptr
}

impl Drop for RocmContext {
    fn drop(&mut self) {
        if let Ok(previous) = self.make_current() {
            unsafe { (self.api.hip_stream_destroy)(self.stream) };
            self.restore_current(previous);
        }
    }
}

impl ComputeContext for RocmContext {
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

impl DeviceContext for RocmContext {
    const BACKEND: &'static str = "rocm";
    type Stream = HipStream;
    type Saved = c_int;

    fn current_stream(&self) -> HipStream {
        self.stream
    }

    fn make_current(&self) -> Result<c_int, DriverError> {
        let mut previous: c_int = 0;
        check_hip(self.api, unsafe { (self.api.hip_get_device)(&mut previous) })?;
        check_hip(self.api, unsafe { (self.api.hip_set_device)(self.device) })?;
        Ok(previous)
    }

    fn restore_current(&self, previous: c_int) {
        if let Err(err) = check_hip(self.api, unsafe { (self.api.hip_set_device)(previous) }) {
            tracing::warn!(error = %err, "failed to restore previous HIP device");
        }
    }

    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, DriverError> {
        let mut ptr: HipDeviceptr = std::ptr::null_mut();
        check_hip(self.api, unsafe { (self.api.hip_malloc)(&mut ptr, bytes) })?;
        Ok(DevicePtr(ptr as usize as u64))
    }

    unsafe fn mem_free(&self, ptr: DevicePtr) -> Result<(), DriverError> {
        check_hip(self.api, (self.api.hip_free)(device_ptr(ptr)))
    }

    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DriverError> {
        self.memcpy(
            device_ptr(dst),
            src.as_ptr() as *const c_void,
            src.len(),
            HIP_MEMCPY_HOST_TO_DEVICE,
        )
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: HipStream,
    ) -> Result<(), DriverError> {
        self.memcpy_async(
            device_ptr(dst),
            src.as_ptr() as *const c_void,
            src.len(),
            HIP_MEMCPY_HOST_TO_DEVICE,
            stream,
        )
    }

    unsafe fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverError> {
        self.memcpy(
            dst.as_mut_ptr() as *mut c_void,
            device_ptr(src),
            dst.len(),
            HIP_MEMCPY_DEVICE_TO_HOST,
        )
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: HipStream,
    ) -> Result<(), DriverError> {
        self.memcpy_async(
            dst.as_mut_ptr() as *mut c_void,
            device_ptr(src),
            dst.len(),
            HIP_MEMCPY_DEVICE_TO_HOST,
            stream,
        )
    }

    unsafe fn memcpy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: HipStream,
    ) -> Result<(), DriverError> {
        self.memcpy_async(
            device_ptr(dst),
            device_ptr(src),
            bytes,
            HIP_MEMCPY_DEVICE_TO_DEVICE,
            stream,
        )
    }
}

impl std::fmt::Debug for RocmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocmContext")
            .field("device", &self.device)
            .field("valid", &self.is_valid())
            .finish()
    }
}
