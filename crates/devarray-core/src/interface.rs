//! Backend-agnostic array interface.

use std::any::Any;
use std::sync::Arc;

use bytemuck::Pod;

use crate::context::ComputeContext;
use crate::error::ArrayError;
use crate::Result;

/// A contiguous block of fixed-size elements living on an accelerator.
///
/// Other subsystems hold arrays as `dyn ArrayInterface`; each backend
/// provides one concrete realization, and operations that cross arrays
/// resolve the peer with a checked downcast.
pub trait ArrayInterface: Any + Send {
    /// Element count.
    fn size(&self) -> usize;

    /// Bytes per element.
    fn element_size(&self) -> usize;

    /// Diagnostic label.
    fn name(&self) -> &str;

    fn is_initialized(&self) -> bool;

    /// Backend identifier of the concrete array type.
    fn backend_name(&self) -> &'static str;

    /// Allocate `size * element_size` bytes against `context`.
    fn initialize(
        &mut self,
        context: &Arc<dyn ComputeContext>,
        size: usize,
        element_size: usize,
        name: &str,
    ) -> Result<()>;

    /// Replace the allocation with one of `size` elements. Contents are lost.
    fn resize(&mut self, size: usize) -> Result<()>;

    /// Copy `count` elements from `data` into the array starting at element
    /// `offset`.
    fn upload_sub_array(
        &mut self,
        data: &[u8],
        offset: usize,
        count: usize,
        blocking: bool,
    ) -> Result<()>;

    /// Copy the whole array contents from `data`.
    fn upload(&mut self, data: &[u8], blocking: bool) -> Result<()> {
        let size = self.size();
        self.upload_sub_array(data, 0, size, blocking)
    }

    /// Copy the whole array into `data`.
    fn download(&self, data: &mut [u8], blocking: bool) -> Result<()>;

    /// Device-to-device copy into an array of identical shape.
    fn copy_to(&self, destination: &mut dyn ArrayInterface) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn ArrayInterface {
    /// Checked downcast to a concrete array type.
    pub fn downcast_ref<A: ArrayInterface>(&self) -> Option<&A> {
        self.as_any().downcast_ref::<A>()
    }

    pub fn downcast_mut<A: ArrayInterface>(&mut self) -> Option<&mut A> {
        self.as_any_mut().downcast_mut::<A>()
    }
}

/// Typed host transfers on top of the byte-level interface.
pub trait ArrayExt: ArrayInterface {
    /// Upload a host slice whose length equals the array size.
    fn upload_slice<T: Pod>(&mut self, data: &[T], blocking: bool) -> Result<()> {
        check_element_type::<T>(self)?;
        if data.len() != self.size() {
            return Err(ArrayError::LengthMismatch {
                name: self.name().to_string(),
                expected: self.size(),
                actual: data.len(),
            });
        }
        self.upload(bytemuck::cast_slice(data), blocking)
    }

    /// Download the whole array into a freshly allocated vector.
    ///
    /// Always blocking: the vector is handed back to the caller.
    fn download_vec<T: Pod>(&self) -> Result<Vec<T>> {
        check_element_type::<T>(self)?;
        let mut out = vec![T::zeroed(); self.size()];
        self.download(bytemuck::cast_slice_mut(&mut out), true)?;
        Ok(out)
    }
}

impl<A: ArrayInterface + ?Sized> ArrayExt for A {}

fn check_element_type<T: Pod>(array: &(impl ArrayInterface + ?Sized)) -> Result<()> {
    let actual = std::mem::size_of::<T>();
    if array.is_initialized() && array.element_size() != actual {
        return Err(ArrayError::ElementSizeMismatch {
            name: array.name().to_string(),
            expected: array.element_size(),
            actual,
        });
    }
    Ok(())
}
