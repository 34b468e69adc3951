//! RAII types around device allocations

use std::mem::{ManuallyDrop, size_of};

use bytemuck::Pod;
use tracing::warn;

use crate::backend::{Backend, DevicePtr};
use crate::error::Result;

/// One device allocation, freed when dropped.
///
/// Dropping can only report a failed free through the log; paths that must
/// surface the error call [`DeviceBuffer::free`] instead.
pub struct DeviceBuffer<'b, B: Backend> {
    backend: &'b B,
    ptr: DevicePtr,
    len: usize,
}

impl<'b, B: Backend> DeviceBuffer<'b, B> {
    pub fn alloc(backend: &'b B, len: usize) -> Result<Self> {
        let ptr = backend.alloc(len)?;
        Ok(Self { backend, ptr, len })
    }

    pub fn from_slice<T: Pod>(backend: &'b B, data: &[T]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = Self::alloc(backend, bytes.len())?;
        // on failure the guard frees the allocation
        buffer.upload(bytes)?;
        Ok(buffer)
    }

    /// Take ownership of an allocation made elsewhere.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of `len` bytes from `backend` that
    /// nothing else will free.
    pub unsafe fn from_raw(backend: &'b B, ptr: DevicePtr, len: usize) -> Self {
        Self { backend, ptr, len }
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn upload<T: Pod>(&self, data: &[T]) -> Result<()> {
        self.backend.copy_to_device(self.ptr, bytemuck::cast_slice(data))
    }

    /// Read the whole buffer back as `T`s; trailing bytes that do not fill a
    /// whole `T` are ignored.
    pub fn to_vec<T: Pod>(&self) -> Result<Vec<T>> {
        let mut data = vec![T::zeroed(); self.len / size_of::<T>()];
        self.backend.copy_from_device(bytemuck::cast_slice_mut(&mut data), self.ptr)?;
        Ok(data)
    }

    pub fn free(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        this.backend.free(this.ptr)
    }

    /// Give up ownership without freeing.
    pub fn into_raw(self) -> DevicePtr {
        ManuallyDrop::new(self).ptr
    }
}

impl<B: Backend> Drop for DeviceBuffer<'_, B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.free(self.ptr) {
            warn!("leaking device buffer {:#x}: {e}", self.ptr.0);
        }
    }
}
