//! Backend configuration.
//!
//! Opens a context for a backend and device ordinal the caller has already
//! chosen, mainly for tests, benches and embedding applications that keep
//! that choice in a JSON file. Nothing here enumerates devices or picks one.
//! Every field has a default so partial files work.

use std::path::Path;
use std::sync::Arc;

use devarray_core::{ComputeContext, DriverError};
use serde::{Deserialize, Serialize};

use crate::host::HostContext;

/// Which context implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Host,
    Cuda,
    Rocm,
}

/// Configuration for opening a compute context.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend to open.
    pub backend: BackendKind,

    /// Device ordinal.
    pub device: usize,

    /// Memory limit for the host backend in bytes. `None` = unbounded.
    /// Ignored by accelerator backends.
    pub host_capacity_bytes: Option<usize>,
}

impl BackendConfig {
    pub fn host() -> Self {
        Self::default()
    }

    pub fn cuda(device: usize) -> Self {
        Self {
            backend: BackendKind::Cuda,
            device,
            ..Self::default()
        }
    }

    pub fn rocm(device: usize) -> Self {
        Self {
            backend: BackendKind::Rocm,
            device,
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, BackendError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, BackendError> {
        let text = std::fs::read_to_string(path).map_err(|source| BackendError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Open the context named by the configuration. The ordinal is used as
    /// given; an absent device surfaces as [`BackendError::Driver`].
    pub fn open(&self) -> Result<Arc<dyn ComputeContext>, BackendError> {
        tracing::info!(backend = ?self.backend, device = self.device, "opening compute context");
        match self.backend {
            BackendKind::Host => Ok(HostContext::with_capacity(
                self.device,
                self.host_capacity_bytes,
            )),
            BackendKind::Cuda => open_cuda(self.device),
            BackendKind::Rocm => open_rocm(self.device),
        }
    }
}

#[cfg(feature = "cuda")]
fn open_cuda(device: usize) -> Result<Arc<dyn ComputeContext>, BackendError> {
    let context = crate::cuda::CudaContext::new(device).map_err(|error| BackendError::Driver {
        backend: "cuda",
        device,
        error,
    })?;
    Ok(context)
}

#[cfg(not(feature = "cuda"))]
fn open_cuda(_device: usize) -> Result<Arc<dyn ComputeContext>, BackendError> {
    Err(BackendError::NotCompiled("cuda"))
}

#[cfg(feature = "rocm")]
fn open_rocm(device: usize) -> Result<Arc<dyn ComputeContext>, BackendError> {
    let context = crate::rocm::RocmContext::new(device).map_err(|error| BackendError::Driver {
        backend: "rocm",
        device,
        error,
    })?;
    Ok(context)
}

#[cfg(not(feature = "rocm"))]
fn open_rocm(_device: usize) -> Result<Arc<dyn ComputeContext>, BackendError> {
    Err(BackendError::NotCompiled("rocm"))
}

/// Errors opening a backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid backend config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("failed to read backend config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend '{0}' not compiled in (enable the `{0}` feature)")]
    NotCompiled(&'static str),

    #[error("failed to open {backend} device {device}: {error}")]
    Driver {
        backend: &'static str,
        device: usize,
        #[source]
        error: DriverError,
    },
}
