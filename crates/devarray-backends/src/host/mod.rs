//! Host-emulated accelerator backend.
//!
//! Always available. Serves as the CPU fallback and as the context double
//! for exercising device arrays without an accelerator.

pub mod context;
pub mod memory;

pub use context::{HostContext, HostOp, HostStats, HostStream};

/// Device array in host-emulated memory.
pub type HostArray = devarray_core::DeviceArray<HostContext>;
