//! Accelerator context interface and scoped context selection.
//!
//! A context owns allocations and streams and must be current on the calling
//! thread before any driver call is issued. Backends implement
//! [`DeviceContext`]; arrays only ever reach the driver through a
//! [`ContextSelector`] held for the duration of the call sequence.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{ArrayError, DriverError};

/// Opaque address of a device allocation, `NULL` when unset.
///
/// Backends decide what the bits mean; the core only offsets it by byte
/// counts that stay inside the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Backend-agnostic handle to an accelerator context.
///
/// This is what the rest of the engine passes around; arrays resolve it to
/// their own backend's context with [`downcast_context`].
pub trait ComputeContext: Any + Send + Sync {
    /// Short backend identifier ("host", "cuda", "rocm").
    fn backend_name(&self) -> &'static str;

    /// Whether the context is still alive. Allocations of an invalid context
    /// have been reclaimed with it and must not be freed again.
    fn is_valid(&self) -> bool;

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Resolve a generic context handle to the concrete backend context `C`.
pub fn downcast_context<C: DeviceContext>(
    context: &Arc<dyn ComputeContext>,
) -> Result<Arc<C>, ArrayError> {
    let found = context.backend_name();
    Arc::clone(context)
        .as_any_arc()
        .downcast::<C>()
        .map_err(|_| ArrayError::BackendMismatch {
            expected: C::BACKEND,
            found,
            what: "context",
        })
}

/// Driver surface a backend context exposes to device arrays.
///
/// Every call assumes the context is current on the calling thread; use a
/// [`ContextSelector`] around them.
pub trait DeviceContext: ComputeContext + Sized {
    /// Backend identifier, equal to [`ComputeContext::backend_name`].
    const BACKEND: &'static str;

    /// Execution stream handle.
    type Stream: Copy + fmt::Debug;

    /// Whatever was current before [`make_current`](Self::make_current).
    type Saved;

    /// The stream non-blocking transfers are enqueued on.
    fn current_stream(&self) -> Self::Stream;

    /// Make this context current on the calling thread, returning the
    /// previously current one.
    fn make_current(&self) -> Result<Self::Saved, DriverError>;

    /// Reinstate a context saved by [`make_current`](Self::make_current).
    fn restore_current(&self, previous: Self::Saved);

    /// Allocate `bytes` bytes of device memory.
    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, DriverError>;

    /// Free an allocation returned by [`mem_alloc`](Self::mem_alloc).
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this context, freed at most once.
    unsafe fn mem_free(&self, ptr: DevicePtr) -> Result<(), DriverError>;

    /// Synchronous host-to-device copy of `src.len()` bytes.
    ///
    /// # Safety
    /// `dst` must address at least `src.len()` bytes of a live allocation.
    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DriverError>;

    /// Host-to-device copy enqueued on `stream`.
    ///
    /// # Safety
    /// As [`memcpy_htod`](Self::memcpy_htod); additionally `src` must stay
    /// valid and unmodified until the stream reaches the copy.
    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: Self::Stream,
    ) -> Result<(), DriverError>;

    /// Synchronous device-to-host copy of `dst.len()` bytes.
    ///
    /// # Safety
    /// `src` must address at least `dst.len()` bytes of a live allocation.
    unsafe fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverError>;

    /// Device-to-host copy enqueued on `stream`.
    ///
    /// # Safety
    /// As [`memcpy_dtoh`](Self::memcpy_dtoh); additionally `dst` must stay
    /// valid and untouched until the stream reaches the copy.
    unsafe fn memcpy_dtoh_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: Self::Stream,
    ) -> Result<(), DriverError>;

    /// Device-to-device copy of `bytes` bytes enqueued on `stream`.
    ///
    /// # Safety
    /// Both pointers must address at least `bytes` bytes of live allocations.
    unsafe fn memcpy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: Self::Stream,
    ) -> Result<(), DriverError>;
}

/// Keeps a context current for its lifetime and restores the previously
/// current context when dropped, on every exit path.
///
/// Selectors nest: inner guards restore before outer ones. The guard is
/// tied to the thread that created it.
#[must_use = "the context is only current while the selector is alive"]
pub struct ContextSelector<'a, C: DeviceContext> {
    context: &'a C,
    previous: Option<C::Saved>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, C: DeviceContext> ContextSelector<'a, C> {
    pub fn new(context: &'a C) -> Result<Self, ArrayError> {
        let previous = context
            .make_current()
            .map_err(|error| ArrayError::ContextActivation {
                backend: C::BACKEND,
                error,
            })?;
        Ok(Self {
            context,
            previous: Some(previous),
            _not_send: PhantomData,
        })
    }

    pub fn context(&self) -> &'a C {
        self.context
    }
}

impl<C: DeviceContext> Drop for ContextSelector<'_, C> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.context.restore_current(previous);
        }
    }
}
