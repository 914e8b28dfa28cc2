//! # devarray-core
//!
//! Device-memory arrays for accelerator backends.
//!
//! Provides:
//! - `DeviceArray<C>`: owning or borrowed block of device memory bound to a context
//! - `ArrayInterface`: the backend-agnostic view held by the rest of an engine
//! - `ContextSelector`: scoped "make this context current" guard
//! - `ArrayError`: structured errors carrying array names and driver codes
//!
//! Concrete contexts (host emulation, CUDA, ROCm) live in `devarray-backends`.

pub mod array;
pub mod context;
pub mod error;
pub mod interface;

#[cfg(test)]
pub(crate) mod testing;

pub use array::DeviceArray;
pub use context::{downcast_context, ComputeContext, ContextSelector, DeviceContext, DevicePtr};
pub use error::{ArrayError, DriverError, ErrorKind, TransferOp};
pub use interface::{ArrayExt, ArrayInterface};

pub type Result<T> = std::result::Result<T, ArrayError>;
