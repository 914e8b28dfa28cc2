//! CUDA backend.
//!
//! Contexts wrap a device's primary context through the cudarc driver API.
//! Non-blocking transfers and device copies go to a per-context
//! non-blocking stream.

pub mod context;

pub use context::CudaContext;

/// Device array in CUDA device memory.
pub type CudaArray = devarray_core::DeviceArray<CudaContext>;
