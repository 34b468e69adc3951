//! The device seam. Everything the core does to the GPU (or to a stand-in for
//! it) goes through [`Backend`].

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::diagnostics::{LogFilter, LogLevel};
use crate::error::Result;
use crate::pipeline::{ModuleCompileOptions, PipelineCompileOptions, PipelineLinkOptions, ProgramGroups, StackSizes};
use crate::sbt::ShaderBindingTable;

/// A device address. Not dereferenceable on the host.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, bytes: u64) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }
}

/// Opaque token naming a built acceleration structure. Only the backend that
/// produced it knows how to interpret the bits.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct TraversableHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Raygen,
    Miss,
    ClosestHit,
}

/// What the library needs when creating the device context.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub log: Arc<LogFilter>,
    /// Applied to the library's own filter; later changes only reach the
    /// process-side [`LogFilter`].
    pub log_level: LogLevel,
    pub device_ordinal: u32,
}

/// Single triangle-mesh build input: float3 vertices, uint3 index triplets,
/// one SBT record, no per-primitive flags or SBT index offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleInput {
    pub vertices: DevicePtr,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub indices: DevicePtr,
    pub triangle_count: u32,
    pub index_stride: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccelBufferSizes {
    pub output: usize,
    pub temp: usize,
}

/// Launch grid. Rays are laid out along `width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl LaunchDims {
    pub fn linear(width: u32) -> Self {
        Self { width, height: 1, depth: 1 }
    }

    pub fn count(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }
}

/// A ray-tracing device: context and program management, acceleration
/// structure builds, launches and raw device memory.
///
/// Implementations report failures with the [`crate::Error`] variant that
/// matches the operation (compilation stages return `Compilation` carrying the
/// full compiler log, memory calls return `DeviceMemory`, and so on).
pub trait Backend {
    type Context;
    type Module;
    type ProgramGroup;
    type Pipeline;

    /// Size of the opaque header at the start of every SBT record.
    const SBT_RECORD_HEADER_SIZE: usize;
    /// Required alignment of SBT records.
    const SBT_RECORD_ALIGNMENT: usize;

    /// Compiled device programs handed to [`Backend::create_module`].
    fn device_programs(&self) -> &[u8];

    fn initialize(&self) -> Result<()>;
    fn create_context(&self, options: &ContextOptions) -> Result<Self::Context>;
    fn destroy_context(&self, context: Self::Context) -> Result<()>;

    fn create_module(
        &self,
        context: &Self::Context,
        module_options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
        programs: &[u8],
    ) -> Result<Self::Module>;
    fn destroy_module(&self, module: Self::Module) -> Result<()>;

    fn create_program_group(
        &self,
        context: &Self::Context,
        module: &Self::Module,
        kind: ProgramKind,
        entry_point: &str,
    ) -> Result<Self::ProgramGroup>;
    fn destroy_program_group(&self, group: Self::ProgramGroup) -> Result<()>;

    fn create_pipeline(
        &self,
        context: &Self::Context,
        pipeline_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
        groups: &ProgramGroups<&Self::ProgramGroup>,
    ) -> Result<Self::Pipeline>;
    fn set_stack_size(&self, pipeline: &Self::Pipeline, sizes: &StackSizes) -> Result<()>;
    fn destroy_pipeline(&self, pipeline: Self::Pipeline) -> Result<()>;

    fn accel_memory_usage(&self, context: &Self::Context, input: &TriangleInput) -> Result<AccelBufferSizes>;

    /// Enqueue a build. `temp` and `output` must hold at least the sizes
    /// reported by [`Backend::accel_memory_usage`].
    fn accel_build(
        &self,
        context: &Self::Context,
        input: &TriangleInput,
        temp: DevicePtr,
        temp_size: usize,
        output: DevicePtr,
        output_size: usize,
    ) -> Result<TraversableHandle>;

    /// Write the header identifying `group` into `record`, which is at least
    /// [`Backend::SBT_RECORD_HEADER_SIZE`] bytes.
    fn pack_sbt_header(&self, group: &Self::ProgramGroup, record: &mut [u8]) -> Result<()>;

    fn launch(
        &self,
        pipeline: &Self::Pipeline,
        params: DevicePtr,
        params_size: usize,
        sbt: &ShaderBindingTable,
        dims: LaunchDims,
    ) -> Result<()>;

    /// Block until all enqueued device work has finished.
    fn synchronize(&self) -> Result<()>;

    fn alloc(&self, bytes: usize) -> Result<DevicePtr>;
    fn free(&self, ptr: DevicePtr) -> Result<()>;
    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()>;
    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr) -> Result<()>;
}
