//! Runtime-loaded HIP memory and stream entry points via dlopen.
//!
//! Loading `libamdhip64.so` at runtime keeps the crate buildable without a
//! ROCm install and independent of the installed ROCm version.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::sync::OnceLock;

use devarray_core::DriverError;
use libloading::Library;

// ---------------------------------------------------------------------------
// HIP status codes and handles
// ---------------------------------------------------------------------------

pub type HipErrorT = c_int;
pub const HIP_SUCCESS: HipErrorT = 0;

// hipMemcpyKind enum values
pub const HIP_MEMCPY_HOST_TO_DEVICE: c_int = 1;
pub const HIP_MEMCPY_DEVICE_TO_HOST: c_int = 2;
pub const HIP_MEMCPY_DEVICE_TO_DEVICE: c_int = 3;

// hipStreamNonBlocking
pub const HIP_STREAM_NON_BLOCKING: c_uint = 1;

pub type HipDeviceptr = *mut c_void;
pub type HipStream = *mut c_void;

// ---------------------------------------------------------------------------
// Function signatures
// ---------------------------------------------------------------------------

type FnHipInit = unsafe extern "C" fn(c_uint) -> HipErrorT;
type FnHipGetDevice = unsafe extern "C" fn(*mut c_int) -> HipErrorT;
type FnHipSetDevice = unsafe extern "C" fn(c_int) -> HipErrorT;
type FnHipMalloc = unsafe extern "C" fn(*mut HipDeviceptr, usize) -> HipErrorT;
type FnHipFree = unsafe extern "C" fn(HipDeviceptr) -> HipErrorT;
type FnHipMemcpy = unsafe extern "C" fn(*mut c_void, *const c_void, usize, c_int) -> HipErrorT;
type FnHipMemcpyAsync = unsafe extern "C" fn(
    *mut c_void, *const c_void, usize, c_int, HipStream,
) -> HipErrorT;
type FnHipStreamCreateWithFlags = unsafe extern "C" fn(*mut HipStream, c_uint) -> HipErrorT;
type FnHipStreamDestroy = unsafe extern "C" fn(HipStream) -> HipErrorT;
type FnHipStreamSynchronize = unsafe extern "C" fn(HipStream) -> HipErrorT;
type FnHipGetErrorString = unsafe extern "C" fn(HipErrorT) -> *const c_char;

// ---------------------------------------------------------------------------
// Loaded API
// ---------------------------------------------------------------------------

pub struct HipApi {
    _lib: Library,
    pub hip_init: FnHipInit,
    pub hip_get_device: FnHipGetDevice,
    pub hip_set_device: FnHipSetDevice,
    pub hip_malloc: FnHipMalloc,
    pub hip_free: FnHipFree,
    pub hip_memcpy: FnHipMemcpy,
    pub hip_memcpy_async: FnHipMemcpyAsync,
    pub hip_stream_create_with_flags: FnHipStreamCreateWithFlags,
    pub hip_stream_destroy: FnHipStreamDestroy,
    pub hip_stream_synchronize: FnHipStreamSynchronize,
    pub hip_get_error_string: FnHipGetErrorString,
}

// Safety: the function pointers are process-global and the HIP runtime is
// internally synchronized.
unsafe impl Send for HipApi {}
unsafe impl Sync for HipApi {}

static HIP_API: OnceLock<Option<HipApi>> = OnceLock::new();

impl HipApi {
    fn try_load() -> Option<Self> {
        let lib = unsafe { Library::new("libamdhip64.so") }.ok()?;
        unsafe {
            let api = HipApi {
                hip_init: *lib.get::<FnHipInit>(b"hipInit\0").ok()?,
                hip_get_device: *lib.get::<FnHipGetDevice>(b"hipGetDevice\0").ok()?,
                hip_set_device: *lib.get::<FnHipSetDevice>(b"hipSetDevice\0").ok()?,
                hip_malloc: *lib.get::<FnHipMalloc>(b"hipMalloc\0").ok()?,
                hip_free: *lib.get::<FnHipFree>(b"hipFree\0").ok()?,
                hip_memcpy: *lib.get::<FnHipMemcpy>(b"hipMemcpy\0").ok()?,
                hip_memcpy_async: *lib.get::<FnHipMemcpyAsync>(b"hipMemcpyAsync\0").ok()?,
                hip_stream_create_with_flags: *lib
                    .get::<FnHipStreamCreateWithFlags>(b"hipStreamCreateWithFlags\0")
                    .ok()?,
                hip_stream_destroy: *lib.get::<FnHipStreamDestroy>(b"hipStreamDestroy\0").ok()?,
                hip_stream_synchronize: *lib
                    .get::<FnHipStreamSynchronize>(b"hipStreamSynchronize\0")
                    .ok()?,
                hip_get_error_string: *lib
                    .get::<FnHipGetErrorString>(b"hipGetErrorString\0")
                    .ok()?,
                _lib: lib,
            };
            Some(api)
        }
    }
}

/// The runtime-loaded HIP API, or `None` if `libamdhip64.so` is missing.
pub fn hip_api() -> Option<&'static HipApi> {
    HIP_API.get_or_init(HipApi::try_load).as_ref()
}

// ---------------------------------------------------------------------------
// Error checking
// ---------------------------------------------------------------------------

/// Check a HIP return code, attaching the runtime's description on failure.
pub fn check_hip(api: &HipApi, code: HipErrorT) -> Result<(), DriverError> {
    if code == HIP_SUCCESS {
        return Ok(());
    }
    let message = unsafe { (api.hip_get_error_string)(code) };
    let description = if message.is_null() {
        "unknown HIP error".to_string()
    } else {
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    };
    Err(DriverError::new(code, description))
}

/// Error reported when the HIP runtime library cannot be loaded.
pub fn not_available() -> DriverError {
    DriverError::new(-1, "ROCm/HIP not available (libamdhip64.so not found)")
}
