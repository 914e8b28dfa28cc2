//! ROCm/HIP backend.
//!
//! Parallel to `cuda/`. Uses `libloading` for runtime-loaded HIP function
//! pointers (no build-time ROCm dependency).

pub mod context;
pub mod ffi;

pub use context::RocmContext;

/// Device array in HIP device memory.
pub type RocmArray = devarray_core::DeviceArray<RocmContext>;
