//! Bottom-level acceleration structure over one triangle mesh.

use std::fmt;
use std::mem::{ManuallyDrop, size_of};
use std::time::Instant;

use tracing::{debug, warn};

use crate::backend::{Backend, DevicePtr, TraversableHandle, TriangleInput};
use crate::context::TraceContext;
use crate::error::{Error, Result};
use crate::launch::RayBuffers;
use crate::memory::DeviceBuffer;

/// Caller-owned device buffers describing a mesh: tightly packed `[f32; 3]`
/// vertices and `[u32; 3]` index triplets.
///
/// The buffers only need to outlive the build call; the built structure does
/// not reference them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshBuffers {
    pub vertices: DevicePtr,
    pub indices: DevicePtr,
    pub vertex_count: u64,
    pub triangle_count: u64,
}

impl MeshBuffers {
    pub(crate) fn to_input(&self) -> Result<TriangleInput> {
        let vertex_count = u32::try_from(self.vertex_count)
            .map_err(|_| Error::invalid(format!("vertex count {} exceeds u32", self.vertex_count)))?;
        let triangle_count = u32::try_from(self.triangle_count)
            .map_err(|_| Error::invalid(format!("triangle count {} exceeds u32", self.triangle_count)))?;

        if vertex_count > 0 && self.vertices.is_null() {
            return Err(Error::invalid("null vertex buffer"));
        }
        if triangle_count > 0 && self.indices.is_null() {
            return Err(Error::invalid("null index buffer"));
        }

        Ok(TriangleInput {
            vertices: self.vertices,
            vertex_count,
            vertex_stride: size_of::<[f32; 3]>() as u32,
            indices: self.indices,
            triangle_count,
            index_stride: size_of::<[u32; 3]>() as u32,
        })
    }
}

/// Plain-integer form of an acceleration structure, for host layers that pass
/// `(handle, backing)` pairs around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawAccel {
    pub handle: TraversableHandle,
    pub backing: DevicePtr,
}

impl From<RawAccel> for (u64, u64) {
    fn from(raw: RawAccel) -> Self {
        (raw.handle.0, raw.backing.0)
    }
}

impl From<(u64, u64)> for RawAccel {
    fn from((handle, backing): (u64, u64)) -> Self {
        RawAccel { handle: TraversableHandle(handle), backing: DevicePtr(backing) }
    }
}

/// A built acceleration structure. Owns its backing buffer: [`release`]
/// frees it, and dropping an unreleased structure frees it as well.
///
/// [`release`]: AccelStructure::release
pub struct AccelStructure<'ctx, B: Backend> {
    ctx: &'ctx TraceContext<B>,
    raw: RawAccel,
}

impl<'ctx, B: Backend> AccelStructure<'ctx, B> {
    pub(crate) fn new(ctx: &'ctx TraceContext<B>, raw: RawAccel) -> Self {
        Self { ctx, raw }
    }

    pub fn handle(&self) -> TraversableHandle {
        self.raw.handle
    }

    pub fn backing(&self) -> DevicePtr {
        self.raw.backing
    }

    pub fn raw(&self) -> RawAccel {
        self.raw
    }

    pub fn trace(&self, rays: &RayBuffers) -> Result<()> {
        self.ctx.trace_rays_raw(self.raw, rays)
    }

    pub fn release(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        this.ctx.release_raw(this.raw)
    }

    /// Detach from the context's RAII tracking. The structure stays
    /// registered and must be freed with [`TraceContext::release_raw`] (or is
    /// freed at shutdown).
    pub fn into_raw(self) -> RawAccel {
        ManuallyDrop::new(self).raw
    }
}

impl<B: Backend> fmt::Debug for AccelStructure<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccelStructure")
            .field("handle", &self.raw.handle)
            .field("backing", &self.raw.backing)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Drop for AccelStructure<'_, B> {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.release_raw(self.raw) {
            warn!("failed to release acceleration structure {:#x}: {e}", self.raw.handle.0);
        }
    }
}

/// Build one BLAS: size, allocate, build, wait, drop the scratch buffer.
/// Every failure path frees what was allocated; only the output buffer of a
/// successful build survives.
pub(crate) fn build_blas<B: Backend>(backend: &B, context: &B::Context, input: &TriangleInput) -> Result<RawAccel> {
    let t = Instant::now();

    let sizes = backend.accel_memory_usage(context, input)?;
    let temp = DeviceBuffer::alloc(backend, sizes.temp)?;
    let output = DeviceBuffer::alloc(backend, sizes.output)?;

    let handle = backend.accel_build(context, input, temp.ptr(), temp.len(), output.ptr(), output.len())?;
    backend.synchronize()?;
    temp.free()?;

    debug!(
        triangles = input.triangle_count,
        output_bytes = sizes.output,
        temp_bytes = sizes.temp,
        "acceleration structure built in {:.2}s",
        t.elapsed().as_secs_f64()
    );

    Ok(RawAccel { handle, backing: output.into_raw() })
}
