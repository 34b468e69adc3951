//! Software stand-in for the ray-tracing device.
//!
//! [`HostBackend`] keeps a simulated device address space and runs builds
//! and launches on the CPU with the same results as the device programs. It
//! also counts every call and can be told to fail a given operation, which is
//! what the tests use to check resumable initialization and leak freedom.

mod blas;
mod geometry;
mod memory;

use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use self::blas::Blas;
use self::geometry::{Ray, Vec3};
use self::memory::AddressSpace;
use crate::backend::{AccelBufferSizes, Backend, ContextOptions, DevicePtr, LaunchDims, ProgramKind, TraversableHandle, TriangleInput};
use crate::diagnostics::LogFilter;
use crate::error::{Error, MemoryOp, Result};
use crate::launch::{LaunchParams, MISS_DISTANCE, MISS_INDEX};
use crate::pipeline::{ModuleCompileOptions, PipelineCompileOptions, PipelineLinkOptions, PipelineStage, ProgramGroups, StackSizes};
use crate::sbt::ShaderBindingTable;

/// Entry points exported by the default host device programs.
pub const HOST_DEVICE_PROGRAMS: &[u8] = b"__raygen__rg\n__miss__far\n__closesthit__ch\n";

const HEADER_MAGIC: u32 = u32::from_le_bytes(*b"HSBT");
const HEADER_SIZE: usize = 32;

/// Operations that can be made to fail with [`HostBackend::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    Initialize,
    CreateContext,
    CreateModule,
    CreateProgramGroup,
    CreatePipeline,
    SetStackSize,
    MemoryUsage,
    Build,
    Launch,
    Synchronize,
    Alloc,
    Free,
    CopyToDevice,
    CopyFromDevice,
}

/// Successful calls per operation. Failed calls are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub initializations: u64,
    pub contexts_created: u64,
    pub contexts_destroyed: u64,
    pub modules_created: u64,
    pub modules_destroyed: u64,
    pub program_groups_created: u64,
    pub program_groups_destroyed: u64,
    pub pipelines_created: u64,
    pub pipelines_destroyed: u64,
    pub stack_sizes_set: u64,
    pub builds: u64,
    pub launches: u64,
    pub synchronizations: u64,
    pub allocations: u64,
    pub frees: u64,
}

impl HostStats {
    pub fn live_allocations(&self) -> u64 {
        self.allocations - self.frees
    }

    /// Contexts, modules, program groups and pipelines not yet destroyed.
    pub fn live_objects(&self) -> u64 {
        (self.contexts_created - self.contexts_destroyed)
            + (self.modules_created - self.modules_destroyed)
            + (self.program_groups_created - self.program_groups_destroyed)
            + (self.pipelines_created - self.pipelines_destroyed)
    }
}

#[derive(Debug)]
pub struct HostContext {
    log: Arc<LogFilter>,
    /// Library-side level, fixed at creation.
    level: u32,
}

impl HostContext {
    fn log(&self, level: u32, tag: &str, message: &str) {
        if self.level > 0 && level <= self.level {
            self.log.emit(level, tag, message);
        }
    }
}

#[derive(Debug)]
pub struct HostModule {
    entry_points: Vec<String>,
}

/// A program group. Its SBT header records the group's id and role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostProgramGroup {
    id: u64,
    kind: ProgramKind,
}

impl HostProgramGroup {
    pub fn new(id: u64, kind: ProgramKind) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    fn encode_header(&self, record: &mut [u8]) {
        let kind: u32 = match self.kind {
            ProgramKind::Raygen => 0,
            ProgramKind::Miss => 1,
            ProgramKind::ClosestHit => 2,
        };
        record[..HEADER_SIZE].fill(0);
        record[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        record[4..8].copy_from_slice(&kind.to_le_bytes());
        record[8..16].copy_from_slice(&self.id.to_le_bytes());
    }

    /// The group a packed SBT record header names, if it is one.
    pub fn decode_header(record: &[u8]) -> Option<HostProgramGroup> {
        let word = |at: usize| record.get(at..at + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        if word(0)? != HEADER_MAGIC {
            return None;
        }
        let kind = match word(4)? {
            0 => ProgramKind::Raygen,
            1 => ProgramKind::Miss,
            2 => ProgramKind::ClosestHit,
            _ => return None,
        };
        let id = u64::from(word(8)?) | u64::from(word(12)?) << 32;
        Some(HostProgramGroup { id, kind })
    }
}

#[derive(Debug)]
pub struct HostPipeline {
    groups: ProgramGroups<HostProgramGroup>,
}

#[derive(Debug)]
struct Fault {
    op: HostOp,
    skip: u32,
}

#[derive(Debug)]
struct HostState {
    memory: AddressSpace,
    stats: HostStats,
    faults: Vec<Fault>,
}

impl HostState {
    /// Consume a pending fault for `op`, if one is due.
    fn fault_due(&mut self, op: HostOp) -> bool {
        let Some(index) = self.faults.iter().position(|f| f.op == op) else {
            return false;
        };
        if self.faults[index].skip == 0 {
            self.faults.remove(index);
            return true;
        }
        self.faults[index].skip -= 1;
        false
    }
}

fn injected(op: HostOp) -> Error {
    const MESSAGE: &str = "injected failure";
    match op {
        HostOp::Initialize => Error::initialization("ray-tracing subsystem init", MESSAGE),
        HostOp::CreateContext => Error::initialization("device context creation", MESSAGE),
        HostOp::CreateModule => Error::compilation(PipelineStage::Module, MESSAGE),
        HostOp::CreateProgramGroup => Error::compilation(PipelineStage::Program(ProgramKind::Raygen), MESSAGE),
        HostOp::CreatePipeline => Error::compilation(PipelineStage::Link, MESSAGE),
        HostOp::SetStackSize => Error::compilation(PipelineStage::StackSize, MESSAGE),
        HostOp::MemoryUsage => Error::execution("accel memory usage", MESSAGE),
        HostOp::Build => Error::execution("accel build", MESSAGE),
        HostOp::Launch => Error::execution("launch", MESSAGE),
        HostOp::Synchronize => Error::execution("synchronize", MESSAGE),
        HostOp::Alloc => Error::memory(MemoryOp::Alloc, MESSAGE),
        HostOp::Free => Error::memory(MemoryOp::Free, MESSAGE),
        HostOp::CopyToDevice => Error::memory(MemoryOp::CopyToDevice, MESSAGE),
        HostOp::CopyFromDevice => Error::memory(MemoryOp::CopyFromDevice, MESSAGE),
    }
}

/// CPU emulation of the device. Exposes a single device, ordinal 0.
///
/// Clones are handles to the same simulated device, so a test can keep one
/// to inspect [`HostBackend::stats`] after the context that owned the other
/// has shut down.
#[derive(Debug, Clone)]
pub struct HostBackend {
    programs: Arc<[u8]>,
    state: Arc<Mutex<HostState>>,
    next_id: Arc<AtomicU64>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::with_device_programs(HOST_DEVICE_PROGRAMS)
    }

    /// Use `programs` as the module source: one entry point name per line.
    pub fn with_device_programs(programs: impl Into<Vec<u8>>) -> Self {
        let programs: Vec<u8> = programs.into();
        Self {
            programs: Arc::from(programs),
            state: Arc::new(Mutex::new(HostState {
                memory: AddressSpace::new(),
                stats: HostStats::default(),
                faults: Vec::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn stats(&self) -> HostStats {
        self.state.lock().stats
    }

    /// Make the next call of `op` fail.
    pub fn fail_next(&self, op: HostOp) {
        self.fail_after(op, 0);
    }

    /// Let `skip` calls of `op` succeed, then fail the one after.
    pub fn fail_after(&self, op: HostOp, skip: u32) {
        self.state.lock().faults.push(Fault { op, skip });
    }

    /// Drop pending injected failures.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    fn check(&self, op: HostOp) -> Result<parking_lot::MutexGuard<'_, HostState>> {
        let mut state = self.state.lock();
        if state.fault_due(op) {
            return Err(injected(op));
        }
        Ok(state)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_prefix(kind: ProgramKind) -> &'static str {
    match kind {
        ProgramKind::Raygen => "__raygen__",
        ProgramKind::Miss => "__miss__",
        ProgramKind::ClosestHit => "__closesthit__",
    }
}

fn verify_sbt(memory: &AddressSpace, pipeline: &HostPipeline, sbt: &ShaderBindingTable) -> std::result::Result<(), String> {
    let records = [
        (sbt.raygen_record, &pipeline.groups.raygen, HEADER_SIZE as u32, 1),
        (sbt.miss_record_base, &pipeline.groups.miss, sbt.miss_record_stride, sbt.miss_record_count),
        (sbt.hitgroup_record_base, &pipeline.groups.closest_hit, sbt.hitgroup_record_stride, sbt.hitgroup_record_count),
    ];

    for (address, expected, stride, count) in records {
        if count == 0 {
            return Err(format!("no SBT record for the {:?} group", expected.kind));
        }
        if (stride as usize) < HEADER_SIZE {
            return Err(format!("SBT stride {stride} is smaller than the record header"));
        }
        let header = memory.read(address, HEADER_SIZE)?;
        match HostProgramGroup::decode_header(header) {
            Some(group) if group == *expected => {}
            Some(group) => return Err(format!("SBT record at {:#x} names {group:?}, pipeline expects {expected:?}", address.0)),
            None => return Err(format!("SBT record at {:#x} has no program header", address.0)),
        }
    }
    Ok(())
}

impl Backend for HostBackend {
    type Context = HostContext;
    type Module = HostModule;
    type ProgramGroup = HostProgramGroup;
    type Pipeline = HostPipeline;

    const SBT_RECORD_HEADER_SIZE: usize = HEADER_SIZE;
    const SBT_RECORD_ALIGNMENT: usize = 16;

    fn device_programs(&self) -> &[u8] {
        &self.programs
    }

    fn initialize(&self) -> Result<()> {
        self.check(HostOp::Initialize)?.stats.initializations += 1;
        Ok(())
    }

    fn create_context(&self, options: &ContextOptions) -> Result<HostContext> {
        let mut state = self.check(HostOp::CreateContext)?;
        if options.device_ordinal != 0 {
            return Err(Error::initialization(
                "device context creation",
                format!("invalid device ordinal {} (1 device available)", options.device_ordinal),
            ));
        }

        state.stats.contexts_created += 1;
        let context = HostContext { log: options.log.clone(), level: options.log_level.get() };
        context.log(4, "HOST", "software device context created");
        Ok(context)
    }

    fn destroy_context(&self, _context: HostContext) -> Result<()> {
        self.state.lock().stats.contexts_destroyed += 1;
        Ok(())
    }

    fn create_module(
        &self,
        context: &HostContext,
        _module_options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
        programs: &[u8],
    ) -> Result<HostModule> {
        let mut state = self.check(HostOp::CreateModule)?;
        let fail = |log: String| {
            context.log(2, "COMPILER", &log);
            Err(Error::compilation(PipelineStage::Module, log))
        };

        let Ok(source) = std::str::from_utf8(programs) else {
            return fail("device programs are not valid text".to_string());
        };
        if pipeline_options.num_payload_values < 2 {
            return fail(format!(
                "programs use 2 payload values, pipeline allows {}",
                pipeline_options.num_payload_values
            ));
        }
        if pipeline_options.launch_params_variable.is_empty() {
            return fail("no launch parameter variable".to_string());
        }

        let entry_points: Vec<String> = source.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect();
        if entry_points.is_empty() {
            return fail("module exports no entry points".to_string());
        }

        state.stats.modules_created += 1;
        context.log(4, "COMPILER", &format!("module with {} entry points", entry_points.len()));
        Ok(HostModule { entry_points })
    }

    fn destroy_module(&self, _module: HostModule) -> Result<()> {
        self.state.lock().stats.modules_destroyed += 1;
        Ok(())
    }

    fn create_program_group(
        &self,
        context: &HostContext,
        module: &HostModule,
        kind: ProgramKind,
        entry_point: &str,
    ) -> Result<HostProgramGroup> {
        let mut state = self.state.lock();
        if state.fault_due(HostOp::CreateProgramGroup) {
            return Err(Error::compilation(PipelineStage::Program(kind), "injected failure"));
        }

        let log = if !entry_point.starts_with(entry_prefix(kind)) {
            Some(format!("{entry_point} is not a {kind:?} program"))
        } else if !module.entry_points.iter().any(|e| e == entry_point) {
            Some(format!("unresolved entry function \"{entry_point}\""))
        } else {
            None
        };
        if let Some(log) = log {
            context.log(2, "COMPILER", &log);
            return Err(Error::compilation(PipelineStage::Program(kind), log));
        }

        state.stats.program_groups_created += 1;
        Ok(HostProgramGroup::new(self.next_id(), kind))
    }

    fn destroy_program_group(&self, _group: HostProgramGroup) -> Result<()> {
        self.state.lock().stats.program_groups_destroyed += 1;
        Ok(())
    }

    fn create_pipeline(
        &self,
        _context: &HostContext,
        _pipeline_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
        groups: &ProgramGroups<&HostProgramGroup>,
    ) -> Result<HostPipeline> {
        let mut state = self.check(HostOp::CreatePipeline)?;
        if link_options.max_trace_depth == 0 {
            return Err(Error::compilation(PipelineStage::Link, "max trace depth 0 cannot trace rays"));
        }
        let roles = [
            (groups.raygen, ProgramKind::Raygen),
            (groups.miss, ProgramKind::Miss),
            (groups.closest_hit, ProgramKind::ClosestHit),
        ];
        if let Some((group, role)) = roles.iter().find(|(group, role)| group.kind != *role) {
            return Err(Error::compilation(PipelineStage::Link, format!("{:?} group linked as {role:?}", group.kind)));
        }

        state.stats.pipelines_created += 1;
        Ok(HostPipeline {
            groups: ProgramGroups { raygen: *groups.raygen, miss: *groups.miss, closest_hit: *groups.closest_hit },
        })
    }

    fn set_stack_size(&self, _pipeline: &HostPipeline, sizes: &StackSizes) -> Result<()> {
        let mut state = self.check(HostOp::SetStackSize)?;
        if sizes.continuation == 0 || sizes.max_traversable_graph_depth == 0 {
            return Err(Error::compilation(PipelineStage::StackSize, "continuation stack and graph depth must be non-zero"));
        }
        state.stats.stack_sizes_set += 1;
        Ok(())
    }

    fn destroy_pipeline(&self, _pipeline: HostPipeline) -> Result<()> {
        self.state.lock().stats.pipelines_destroyed += 1;
        Ok(())
    }

    fn accel_memory_usage(&self, _context: &HostContext, input: &TriangleInput) -> Result<AccelBufferSizes> {
        drop(self.check(HostOp::MemoryUsage)?);
        Ok(AccelBufferSizes {
            output: blas::output_size(input.triangle_count),
            temp: blas::temp_size(input.vertex_count),
        })
    }

    fn accel_build(
        &self,
        _context: &HostContext,
        input: &TriangleInput,
        temp: DevicePtr,
        temp_size: usize,
        output: DevicePtr,
        output_size: usize,
    ) -> Result<TraversableHandle> {
        let mut state = self.check(HostOp::Build)?;
        let fail = |message: String| Error::execution("accel build", message);

        let needed = blas::output_size(input.triangle_count);
        if output_size < needed || temp_size < blas::temp_size(input.vertex_count) {
            return Err(fail(format!("buffers too small: output {output_size} of {needed} bytes")));
        }
        state.memory.read(temp, temp_size).map_err(fail)?;

        let triangles = blas::gather(&state.memory, input).map_err(fail)?;
        state.memory.write(output, &blas::encode(&triangles)).map_err(fail)?;

        state.stats.builds += 1;
        Ok(blas::handle_for(output))
    }

    fn pack_sbt_header(&self, group: &HostProgramGroup, record: &mut [u8]) -> Result<()> {
        if record.len() < HEADER_SIZE {
            return Err(Error::invalid(format!("SBT record of {} bytes cannot hold a header", record.len())));
        }
        group.encode_header(record);
        Ok(())
    }

    fn launch(
        &self,
        pipeline: &HostPipeline,
        params: DevicePtr,
        params_size: usize,
        sbt: &ShaderBindingTable,
        dims: LaunchDims,
    ) -> Result<()> {
        let mut state = self.check(HostOp::Launch)?;
        let fail = |message: String| Error::execution("launch", message);

        if params_size != size_of::<LaunchParams>() {
            return Err(fail(format!("launch params are {params_size} bytes, programs expect {}", size_of::<LaunchParams>())));
        }
        let params: LaunchParams =
            bytemuck::pod_read_unaligned(state.memory.read(params, params_size).map_err(fail)?);
        verify_sbt(&state.memory, pipeline, sbt).map_err(fail)?;

        let count = usize::try_from(dims.count()).map_err(|_| fail(format!("launch of {} rays", dims.count())))?;
        if count > 0 {
            let memory = &state.memory;
            let blas = Blas::load(memory, TraversableHandle(params.traversable)).map_err(fail)?;
            let origins: Vec<Vec3> = blas::read_strided(memory, DevicePtr(params.rays_o), count, 12).map_err(fail)?;
            let directions: Vec<Vec3> = blas::read_strided(memory, DevicePtr(params.rays_d), count, 12).map_err(fail)?;

            let mut distances = Vec::with_capacity(count);
            let mut indices = Vec::with_capacity(count);
            for (&origin, &direction) in origins.iter().zip(&directions) {
                match blas.closest_hit(Ray { origin, direction }, params.t_max) {
                    Some((t, primitive)) => {
                        distances.push(t);
                        indices.push(primitive as i32);
                    }
                    None => {
                        distances.push(MISS_DISTANCE);
                        indices.push(MISS_INDEX);
                    }
                }
            }

            state.memory.write(DevicePtr(params.out_t), bytemuck::cast_slice(&distances)).map_err(fail)?;
            state.memory.write(DevicePtr(params.out_i), bytemuck::cast_slice(&indices)).map_err(fail)?;
        }

        state.stats.launches += 1;
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.check(HostOp::Synchronize)?.stats.synchronizations += 1;
        Ok(())
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr> {
        let mut state = self.check(HostOp::Alloc)?;
        let ptr = state.memory.alloc(bytes).map_err(|e| Error::memory(MemoryOp::Alloc, e))?;
        state.stats.allocations += 1;
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.check(HostOp::Free)?;
        state.memory.free(ptr).map_err(|e| Error::memory(MemoryOp::Free, e))?;
        state.stats.frees += 1;
        Ok(())
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        let mut state = self.check(HostOp::CopyToDevice)?;
        state.memory.write(dst, src).map_err(|e| Error::memory(MemoryOp::CopyToDevice, e))
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        let state = self.check(HostOp::CopyFromDevice)?;
        let bytes = state.memory.read(src, dst.len()).map_err(|e| Error::memory(MemoryOp::CopyFromDevice, e))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::LogLevel;
    use crate::error::ErrorKind;

    fn options() -> ContextOptions {
        ContextOptions { log: Arc::new(LogFilter::default()), log_level: LogLevel::PRINT, device_ordinal: 0 }
    }

    #[test]
    fn header_round_trip_and_rejects_garbage() {
        let group = HostProgramGroup::new(0x1_0000_0002, ProgramKind::Miss);
        let mut record = [0xffu8; 32];
        HostBackend::new().pack_sbt_header(&group, &mut record).unwrap();
        assert_eq!(HostProgramGroup::decode_header(&record), Some(group));

        assert_eq!(HostProgramGroup::decode_header(&[0u8; 32]), None);
        assert_eq!(HostProgramGroup::decode_header(&record[..8]), None);
    }

    #[test]
    fn only_device_zero_exists() {
        let backend = HostBackend::new();
        let mut opts = options();
        opts.device_ordinal = 1;
        assert_eq!(backend.create_context(&opts).unwrap_err().kind(), ErrorKind::Initialization);
        assert!(backend.create_context(&options()).is_ok());
    }

    #[test]
    fn unresolved_entry_point_is_a_compilation_error() {
        let backend = HostBackend::with_device_programs("__raygen__rg\n__miss__far\n");
        let ctx = backend.create_context(&options()).unwrap();
        let module = backend
            .create_module(&ctx, &ModuleCompileOptions::FIXED, &PipelineCompileOptions::FIXED, backend.device_programs())
            .unwrap();

        assert!(backend.create_program_group(&ctx, &module, ProgramKind::Miss, "__miss__far").is_ok());
        let err = backend.create_program_group(&ctx, &module, ProgramKind::ClosestHit, "__closesthit__ch").unwrap_err();
        match err {
            Error::Compilation { stage, log } => {
                assert_eq!(stage, PipelineStage::Program(ProgramKind::ClosestHit));
                assert!(log.contains("__closesthit__ch"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn faults_fire_once_after_skips() {
        let backend = HostBackend::new();
        backend.fail_after(HostOp::Alloc, 2);
        assert!(backend.alloc(8).is_ok());
        assert!(backend.alloc(8).is_ok());
        assert_eq!(backend.alloc(8).unwrap_err().kind(), ErrorKind::DeviceMemory);
        assert!(backend.alloc(8).is_ok());
        assert_eq!(backend.stats().allocations, 3);
    }

    #[test]
    fn free_of_unknown_pointer_fails() {
        let backend = HostBackend::new();
        let err = backend.free(DevicePtr(0x1234)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceMemory);
        assert_eq!(backend.stats().frees, 0);
    }

    #[test]
    fn build_rejects_short_buffers() {
        let backend = HostBackend::new();
        let ctx = backend.create_context(&options()).unwrap();
        let input = TriangleInput {
            vertices: DevicePtr::NULL,
            vertex_count: 0,
            vertex_stride: 12,
            indices: DevicePtr::NULL,
            triangle_count: 0,
            index_stride: 12,
        };
        let sizes = backend.accel_memory_usage(&ctx, &input).unwrap();
        let temp = backend.alloc(sizes.temp).unwrap();
        let output = backend.alloc(sizes.output).unwrap();

        let err = backend.accel_build(&ctx, &input, temp, sizes.temp, output, sizes.output - 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(backend.accel_build(&ctx, &input, temp, sizes.temp, output, sizes.output).is_ok());
    }
}
