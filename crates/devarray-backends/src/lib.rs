//! # devarray-backends
//!
//! Concrete accelerator contexts for `devarray-core` device arrays.
//!
//! Provides:
//! - `host`: host-memory emulated device (always built; CPU fallback and test double)
//! - `cuda`: CUDA driver contexts via cudarc (behind `cuda` feature flag)
//! - `rocm`: HIP contexts via runtime-loaded `libamdhip64.so` (behind `rocm` feature flag)
//! - `config`: JSON-loadable backend selection

pub mod config;
pub mod host;

#[cfg(feature = "cuda")]
pub mod cuda;

#[cfg(feature = "rocm")]
pub mod rocm;

pub use config::{BackendConfig, BackendError, BackendKind};
pub use host::{HostArray, HostContext};

#[cfg(feature = "cuda")]
pub use cuda::{CudaArray, CudaContext};

#[cfg(feature = "rocm")]
pub use rocm::{RocmArray, RocmContext};
