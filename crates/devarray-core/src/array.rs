//! Device arrays: typed-size blocks of accelerator memory.
//!
//! A [`DeviceArray`] is either uninitialized (null pointer, zero size) or
//! bound to a context with a live allocation of `size * element_size`
//! bytes. Every driver call runs under a [`ContextSelector`]; every
//! precondition is checked from array state before the driver is touched.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::context::{downcast_context, ComputeContext, ContextSelector, DeviceContext, DevicePtr};
use crate::error::{ArrayError, TransferOp};
use crate::interface::ArrayInterface;
use crate::Result;

/// A contiguous array of fixed-size elements in the memory of context `C`.
///
/// Owning arrays free their allocation on drop, unless the context has been
/// torn down in the meantime (the allocation went with it). Borrowed arrays,
/// built with [`from_raw_parts`](Self::from_raw_parts), never free.
pub struct DeviceArray<C: DeviceContext> {
    pointer: DevicePtr,
    size: usize,
    element_size: usize,
    name: String,
    context: Option<Arc<C>>,
    owns_memory: bool,
}

impl<C: DeviceContext> DeviceArray<C> {
    /// An uninitialized array with no device allocation.
    pub fn new() -> Self {
        Self {
            pointer: DevicePtr::NULL,
            size: 0,
            element_size: 0,
            name: String::new(),
            context: None,
            owns_memory: false,
        }
    }

    /// Create and initialize in one step.
    pub fn with_context(
        context: &Arc<C>,
        size: usize,
        element_size: usize,
        name: impl Into<String>,
    ) -> Result<Self> {
        let mut array = Self::new();
        array.initialize(context, size, element_size, name)?;
        Ok(array)
    }

    /// A non-owning view over `size * element_size` bytes at `pointer`.
    ///
    /// The view can be read, written and copied, but never resized or freed.
    ///
    /// # Safety
    /// `pointer` must be a non-null allocation of `context` holding at least
    /// `size * element_size` bytes, and must outlive the returned view.
    pub unsafe fn from_raw_parts(
        context: Arc<C>,
        pointer: DevicePtr,
        size: usize,
        element_size: usize,
        name: impl Into<String>,
    ) -> Self {
        debug_assert!(!pointer.is_null(), "borrowed array over a null pointer");
        Self {
            pointer,
            size,
            element_size,
            name: name.into(),
            context: Some(context),
            owns_memory: false,
        }
    }

    /// Bind to `context` and allocate `size * element_size` bytes.
    ///
    /// On failure the array is left uninitialized.
    pub fn initialize(
        &mut self,
        context: &Arc<C>,
        size: usize,
        element_size: usize,
        name: impl Into<String>,
    ) -> Result<()> {
        if self.is_initialized() {
            return Err(ArrayError::AlreadyInitialized {
                name: self.name.clone(),
            });
        }
        let name = name.into();
        let bytes = size
            .checked_mul(element_size)
            .ok_or_else(|| ArrayError::TooLarge {
                name: name.clone(),
                size,
                element_size,
            })?;

        let pointer = {
            let _selector = ContextSelector::new(&**context)?;
            context
                .mem_alloc(bytes)
                .map_err(|error| ArrayError::Allocation {
                    name: name.clone(),
                    error,
                })?
        };
        if pointer.is_null() {
            return Err(ArrayError::NullAllocation { name, bytes });
        }

        tracing::debug!(
            array = %name,
            backend = C::BACKEND,
            size,
            element_size,
            bytes,
            pointer = %pointer,
            "allocated device array"
        );

        self.pointer = pointer;
        self.size = size;
        self.element_size = element_size;
        self.name = name;
        self.context = Some(Arc::clone(context));
        self.owns_memory = true;
        Ok(())
    }

    /// Free the allocation and allocate `size` elements in its place.
    ///
    /// Element size, name and context are kept; contents are not.
    pub fn resize(&mut self, size: usize) -> Result<()> {
        let context = Arc::clone(self.bound_context()?);
        if !self.owns_memory {
            return Err(ArrayError::BorrowedArray {
                name: self.name.clone(),
            });
        }

        // Safety: owning arrays hold a live allocation of their context.
        unsafe { release(&*context, self.pointer, &self.name)? };
        tracing::debug!(array = %self.name, from = self.size, to = size, "resizing device array");

        let element_size = self.element_size;
        let name = self.name.clone();
        self.pointer = DevicePtr::NULL;
        self.size = 0;
        self.element_size = 0;
        self.context = None;
        self.owns_memory = false;
        self.initialize(&context, size, element_size, name)
    }

    /// Copy `count` elements of host `data` into the array at element
    /// `offset`.
    ///
    /// With `blocking == false` the copy is only enqueued on the context's
    /// current stream; `data` must not be modified or freed until the stream
    /// has been synchronized.
    pub fn upload_sub_array(
        &mut self,
        data: &[u8],
        offset: usize,
        count: usize,
        blocking: bool,
    ) -> Result<()> {
        let context = self.bound_context()?;
        match offset.checked_add(count) {
            Some(end) if end <= self.size => {}
            _ => {
                return Err(ArrayError::Range {
                    name: self.name.clone(),
                    offset,
                    count,
                    size: self.size,
                })
            }
        }
        let bytes = count * self.element_size;
        self.check_host_len(bytes, data.len())?;
        let dst = self.pointer.offset(offset * self.element_size);
        let src = &data[..bytes];

        let _selector = ContextSelector::new(&**context)?;
        // Safety: offset + count <= size keeps the copy inside the allocation.
        let result = unsafe {
            if blocking {
                context.memcpy_htod(dst, src)
            } else {
                context.memcpy_htod_async(dst, src, context.current_stream())
            }
        };
        result.map_err(|error| ArrayError::Transfer {
            name: self.name.clone(),
            operation: TransferOp::Upload,
            error,
        })?;

        tracing::trace!(array = %self.name, offset, count, blocking, "uploaded");
        Ok(())
    }

    /// Copy the whole array into host `data`, which must hold at least
    /// [`byte_len`](Self::byte_len) bytes.
    ///
    /// With `blocking == false` the copy is only enqueued; `data` must not be
    /// read until the stream has been synchronized.
    pub fn download(&self, data: &mut [u8], blocking: bool) -> Result<()> {
        let context = self.bound_context()?;
        let bytes = self.byte_len();
        self.check_host_len(bytes, data.len())?;
        let dst = &mut data[..bytes];

        let _selector = ContextSelector::new(&**context)?;
        // Safety: the allocation holds exactly `bytes` bytes.
        let result = unsafe {
            if blocking {
                context.memcpy_dtoh(dst, self.pointer)
            } else {
                context.memcpy_dtoh_async(dst, self.pointer, context.current_stream())
            }
        };
        result.map_err(|error| ArrayError::Transfer {
            name: self.name.clone(),
            operation: TransferOp::Download,
            error,
        })?;

        tracing::trace!(array = %self.name, bytes, blocking, "downloaded");
        Ok(())
    }

    /// Enqueue a device-to-device copy of the whole array into `destination`.
    ///
    /// The destination must be initialized, have the same size and element
    /// size, and belong to the same context.
    pub fn copy_to(&self, destination: &mut dyn ArrayInterface) -> Result<()> {
        let context = self.bound_context()?;
        if !destination.is_initialized() {
            return Err(ArrayError::NotInitialized {
                name: destination.name().to_string(),
            });
        }
        if destination.size() != self.size || destination.element_size() != self.element_size {
            return Err(ArrayError::IncompatibleArray {
                src: self.name.clone(),
                dst: destination.name().to_string(),
                src_size: self.size,
                src_element_size: self.element_size,
                dst_size: destination.size(),
                dst_element_size: destination.element_size(),
            });
        }
        let found = destination.backend_name();
        let target = destination
            .as_any()
            .downcast_ref::<DeviceArray<C>>()
            .ok_or(ArrayError::BackendMismatch {
                expected: C::BACKEND,
                found,
                what: "array",
            })?;
        if !matches!(&target.context, Some(peer) if Arc::ptr_eq(peer, context)) {
            return Err(ArrayError::ContextMismatch {
                src: self.name.clone(),
                dst: target.name.clone(),
            });
        }
        let bytes = self.byte_len();

        let _selector = ContextSelector::new(&**context)?;
        // Safety: both allocations hold `bytes` bytes, checked above.
        unsafe {
            context.memcpy_dtod_async(target.pointer, self.pointer, bytes, context.current_stream())
        }
        .map_err(|error| ArrayError::Transfer {
            name: self.name.clone(),
            operation: TransferOp::Copy {
                destination: target.name.clone(),
            },
            error,
        })?;

        tracing::trace!(array = %self.name, destination = %target.name, bytes, "copied");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        !self.pointer.is_null()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// `size * element_size`.
    pub fn byte_len(&self) -> usize {
        self.size * self.element_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owns_memory(&self) -> bool {
        self.owns_memory
    }

    /// Raw device address, for kernel arguments.
    pub fn device_pointer(&self) -> DevicePtr {
        self.pointer
    }

    pub fn context(&self) -> Option<&Arc<C>> {
        self.context.as_ref()
    }

    fn bound_context(&self) -> Result<&Arc<C>> {
        match &self.context {
            Some(context) if self.is_initialized() => Ok(context),
            _ => Err(ArrayError::NotInitialized {
                name: self.name.clone(),
            }),
        }
    }

    fn check_host_len(&self, needed: usize, actual: usize) -> Result<()> {
        if actual < needed {
            return Err(ArrayError::HostBufferTooSmall {
                name: self.name.clone(),
                needed,
                actual,
            });
        }
        Ok(())
    }
}

/// Free `pointer` with `context` current.
///
/// # Safety
/// `pointer` must be a live allocation of `context` that nothing frees again.
unsafe fn release<C: DeviceContext>(context: &C, pointer: DevicePtr, name: &str) -> Result<()> {
    let _selector = ContextSelector::new(context)?;
    context
        .mem_free(pointer)
        .map_err(|error| ArrayError::Deallocation {
            name: name.to_string(),
            error,
        })
}

impl<C: DeviceContext> Default for DeviceArray<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: DeviceContext> Drop for DeviceArray<C> {
    fn drop(&mut self) {
        if self.pointer.is_null() || !self.owns_memory {
            return;
        }
        let Some(context) = self.context.take() else {
            return;
        };
        if !context.is_valid() {
            tracing::debug!(
                array = %self.name,
                "context already torn down, allocation reclaimed with it"
            );
            return;
        }
        // Safety: owning, initialized, and the context is still alive.
        if let Err(err) = unsafe { release(&*context, self.pointer, &self.name) } {
            // A failed free means the driver's bookkeeping is corrupt.
            tracing::error!(array = %self.name, error = %err, "device free failed");
            panic!("{err}");
        }
        tracing::debug!(array = %self.name, bytes = self.byte_len(), "freed device array");
    }
}

impl<C: DeviceContext> fmt::Debug for DeviceArray<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceArray")
            .field("backend", &C::BACKEND)
            .field("name", &self.name)
            .field("pointer", &self.pointer)
            .field("size", &self.size)
            .field("element_size", &self.element_size)
            .field("owns_memory", &self.owns_memory)
            .finish()
    }
}

impl<C: DeviceContext> ArrayInterface for DeviceArray<C> {
    fn size(&self) -> usize {
        self.size
    }

    fn element_size(&self) -> usize {
        self.element_size
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        DeviceArray::is_initialized(self)
    }

    fn backend_name(&self) -> &'static str {
        C::BACKEND
    }

    fn initialize(
        &mut self,
        context: &Arc<dyn ComputeContext>,
        size: usize,
        element_size: usize,
        name: &str,
    ) -> Result<()> {
        if DeviceArray::is_initialized(self) {
            return Err(ArrayError::AlreadyInitialized {
                name: self.name.clone(),
            });
        }
        let context = downcast_context::<C>(context)?;
        DeviceArray::initialize(self, &context, size, element_size, name)
    }

    fn resize(&mut self, size: usize) -> Result<()> {
        DeviceArray::resize(self, size)
    }

    fn upload_sub_array(
        &mut self,
        data: &[u8],
        offset: usize,
        count: usize,
        blocking: bool,
    ) -> Result<()> {
        DeviceArray::upload_sub_array(self, data, offset, count, blocking)
    }

    fn download(&self, data: &mut [u8], blocking: bool) -> Result<()> {
        DeviceArray::download(self, data, blocking)
    }

    fn copy_to(&self, destination: &mut dyn ArrayInterface) -> Result<()> {
        DeviceArray::copy_to(self, destination)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
