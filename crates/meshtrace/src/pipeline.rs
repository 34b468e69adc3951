//! Module, program groups and pipeline: the fixed compile/link settings and
//! the per-stage builders used by [`crate::TraceContext::ensure_pipeline`].

use std::fmt;
use std::time::Instant;

use tracing::debug;

use crate::backend::{Backend, ProgramKind};
use crate::error::Result;

pub const LAUNCH_PARAMS_VARIABLE: &str = "optixLaunchParams";

pub const RAYGEN_ENTRY: &str = "__raygen__rg";
pub const MISS_ENTRY: &str = "__miss__far";
pub const CLOSEST_HIT_ENTRY: &str = "__closesthit__ch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleCompileOptions {
    pub max_register_count: u32,
    /// 0..=3
    pub optimization_level: u8,
    pub debug_info: bool,
}

impl ModuleCompileOptions {
    pub const FIXED: ModuleCompileOptions = ModuleCompileOptions {
        max_register_count: 50,
        optimization_level: 0,
        debug_info: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineCompileOptions {
    pub uses_motion_blur: bool,
    /// Only single-GAS traversable graphs are built.
    pub single_gas_only: bool,
    pub num_payload_values: u32,
    pub num_attribute_values: u32,
    pub exceptions: bool,
    pub launch_params_variable: &'static str,
}

impl PipelineCompileOptions {
    pub const FIXED: PipelineCompileOptions = PipelineCompileOptions {
        uses_motion_blur: false,
        single_gas_only: true,
        num_payload_values: 2,
        num_attribute_values: 2,
        exceptions: false,
        launch_params_variable: LAUNCH_PARAMS_VARIABLE,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineLinkOptions {
    pub max_trace_depth: u32,
}

impl PipelineLinkOptions {
    pub const FIXED: PipelineLinkOptions = PipelineLinkOptions { max_trace_depth: 2 };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSizes {
    /// Direct callables invoked from intersection or any-hit programs.
    pub direct_callable_from_traversal: u32,
    /// Direct callables invoked from raygen, miss or closest-hit programs.
    pub direct_callable_from_state: u32,
    pub continuation: u32,
    pub max_traversable_graph_depth: u32,
}

impl StackSizes {
    pub const FIXED: StackSizes = StackSizes {
        direct_callable_from_traversal: 1024,
        direct_callable_from_state: 2 * 1024,
        continuation: 2 * 1024,
        max_traversable_graph_depth: 1,
    };
}

/// The three program roles, by name. Linking and SBT packing always walk them
/// as `[raygen, miss, closest_hit]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramGroups<T> {
    pub raygen: T,
    pub miss: T,
    pub closest_hit: T,
}

impl<T> ProgramGroups<T> {
    pub fn ordered(&self) -> [&T; 3] {
        [&self.raygen, &self.miss, &self.closest_hit]
    }
}

/// Program groups created so far. Groups are created in role order, so a
/// retry after a failure picks up at the first missing one.
#[derive(Debug)]
pub(crate) struct PartialPrograms<T> {
    pub(crate) raygen: Option<T>,
    pub(crate) miss: Option<T>,
    pub(crate) closest_hit: Option<T>,
}

impl<T> PartialPrograms<T> {
    pub(crate) fn complete(&self) -> Option<ProgramGroups<&T>> {
        Some(ProgramGroups {
            raygen: self.raygen.as_ref()?,
            miss: self.miss.as_ref()?,
            closest_hit: self.closest_hit.as_ref()?,
        })
    }

    /// Empties the slots, closest-hit first.
    pub(crate) fn take_reversed(&mut self) -> impl Iterator<Item = T> + use<T> {
        [self.closest_hit.take(), self.miss.take(), self.raygen.take()].into_iter().flatten()
    }
}

impl<T> Default for PartialPrograms<T> {
    fn default() -> Self {
        Self { raygen: None, miss: None, closest_hit: None }
    }
}

/// Pipeline construction step, used to label compilation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Module,
    Program(ProgramKind),
    Link,
    StackSize,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineStage::Module => "create module",
            PipelineStage::Program(ProgramKind::Raygen) => "create raygen program",
            PipelineStage::Program(ProgramKind::Miss) => "create miss program",
            PipelineStage::Program(ProgramKind::ClosestHit) => "create hit program",
            PipelineStage::Link => "create pipeline",
            PipelineStage::StackSize => "set pipeline stack size",
        })
    }
}

pub fn entry_point(kind: ProgramKind) -> &'static str {
    match kind {
        ProgramKind::Raygen => RAYGEN_ENTRY,
        ProgramKind::Miss => MISS_ENTRY,
        ProgramKind::ClosestHit => CLOSEST_HIT_ENTRY,
    }
}

pub(crate) fn compile_module<B: Backend>(backend: &B, context: &B::Context) -> Result<B::Module> {
    let t = Instant::now();
    let programs = backend.device_programs();
    let module = backend.create_module(
        context,
        &ModuleCompileOptions::FIXED,
        &PipelineCompileOptions::FIXED,
        programs,
    )?;
    debug!(bytes = programs.len(), "module compiled in {:.2}s", t.elapsed().as_secs_f64());
    Ok(module)
}

pub(crate) fn create_program<B: Backend>(
    backend: &B,
    context: &B::Context,
    module: &B::Module,
    kind: ProgramKind,
) -> Result<B::ProgramGroup> {
    let entry = entry_point(kind);
    let group = backend.create_program_group(context, module, kind, entry)?;
    debug!(?kind, entry, "program group created");
    Ok(group)
}

/// Link the three groups and size the stacks. A pipeline whose stacks could
/// not be sized is destroyed again, so the next attempt relinks it.
pub(crate) fn link_pipeline<B: Backend>(
    backend: &B,
    context: &B::Context,
    programs: &ProgramGroups<&B::ProgramGroup>,
) -> Result<B::Pipeline> {
    let pipeline = backend.create_pipeline(
        context,
        &PipelineCompileOptions::FIXED,
        &PipelineLinkOptions::FIXED,
        programs,
    )?;

    if let Err(e) = backend.set_stack_size(&pipeline, &StackSizes::FIXED) {
        if let Err(destroy) = backend.destroy_pipeline(pipeline) {
            tracing::warn!("failed to destroy unsized pipeline: {destroy}");
        }
        return Err(e);
    }

    debug!("pipeline linked");
    Ok(pipeline)
}
