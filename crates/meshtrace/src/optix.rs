//! OptiX 7 backend over the CUDA driver API.
//!
//! OptiX entry points dispatch through the function table that
//! `optixsys_init` fills in; `optix_call!` looks the entry up and calls it.
//! All work goes to the default stream of the backend's CUDA context.

use std::ffi::{CStr, CString, c_char, c_uint, c_void};
use std::ptr;
use std::sync::Arc;

use optix_sys as sys;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{AccelBufferSizes, Backend, ContextOptions, DevicePtr, LaunchDims, ProgramKind, TraversableHandle, TriangleInput};
use crate::diagnostics::LogFilter;
use crate::error::{Error, MemoryOp, Result};
use crate::pipeline::{ModuleCompileOptions, PipelineCompileOptions, PipelineLinkOptions, PipelineStage, ProgramGroups, StackSizes};
use crate::sbt::ShaderBindingTable;

static DEVICE_PROGRAMS: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/meshtrace_device.ptx"));

/// Initial size of the buffer OptiX writes compiler output into.
const LOG_CAPACITY: usize = 64 * 1024;

macro_rules! optix_call {
    ($name:ident($($arg:expr),* $(,)?)) => {{
        // SAFETY: the table is only read after optixsys_init succeeded
        let table = unsafe { &*sys::optixsys_function_table() };
        match table.$name {
            // SAFETY: argument validity is the caller's responsibility
            Some(f) => unsafe { f($($arg),*) },
            None => sys::OptixResult_OPTIX_ERROR_ENTRY_SYMBOL_NOT_FOUND,
        }
    }};
}

fn optix_error(result: sys::OptixResult) -> String {
    // SAFETY: see optix_call!
    let table = unsafe { &*sys::optixsys_function_table() };
    let text = |f: Option<unsafe extern "C" fn(sys::OptixResult) -> *const c_char>| {
        f.map(|f| unsafe { f(result) })
            .filter(|s| !s.is_null())
            .map(|s| unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned())
    };
    match (text(table.optixGetErrorName), text(table.optixGetErrorString)) {
        (Some(name), Some(description)) => format!("{name}: {description}"),
        _ => format!("OptiX error {result}"),
    }
}

fn optix_check(result: sys::OptixResult) -> std::result::Result<(), String> {
    if result == sys::OptixResult_OPTIX_SUCCESS {
        Ok(())
    } else {
        Err(optix_error(result))
    }
}

fn cuda_check(result: sys::CUresult) -> std::result::Result<(), String> {
    if result == sys::cudaError_enum_CUDA_SUCCESS {
        return Ok(());
    }
    let mut text: *const c_char = ptr::null();
    // SAFETY: cuGetErrorString only writes the out pointer
    let known = unsafe { sys::cuGetErrorString(result, &mut text) } == sys::cudaError_enum_CUDA_SUCCESS;
    if known && !text.is_null() {
        Err(unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned())
    } else {
        Err(format!("CUDA error {result}"))
    }
}

/// Compiler output written by a create call.
struct CompileLog {
    buffer: Vec<u8>,
    size: usize,
}

impl CompileLog {
    fn with_capacity(capacity: usize) -> Self {
        Self { buffer: vec![0; capacity], size: capacity }
    }

    fn overflowed(&self) -> bool {
        self.size > self.buffer.len()
    }

    fn ptr(&mut self) -> *mut c_char {
        self.buffer.as_mut_ptr().cast()
    }

    fn text(&self) -> String {
        let written = &self.buffer[..self.size.min(self.buffer.len())];
        let end = written.iter().position(|&b| b == 0).unwrap_or(written.len());
        let mut text = String::from_utf8_lossy(&written[..end]).into_owned();
        if self.overflowed() {
            text.push_str(&format!("\n[log truncated, {} bytes]", self.size));
        }
        text
    }

    fn into_error(self, stage: PipelineStage, result: sys::OptixResult) -> Error {
        let log = self.text();
        let error = optix_error(result);
        Error::compilation(stage, if log.is_empty() { error } else { format!("{error}\n{log}") })
    }
}

/// Run an OptiX create call that reports compiler output through a log buffer.
///
/// If the call fails with more output than fit, it is repeated once with a
/// buffer of the reported size so the error carries the whole log. Whatever
/// that repeat creates is destroyed again; the first result stands.
fn create_logged<T>(
    stage: PipelineStage,
    mut create: impl FnMut(&mut CompileLog) -> (sys::OptixResult, T),
    destroy: impl FnOnce(T),
) -> Result<T> {
    let mut log = CompileLog::with_capacity(LOG_CAPACITY);
    let (result, created) = create(&mut log);
    if result == sys::OptixResult_OPTIX_SUCCESS {
        return Ok(created);
    }

    if log.overflowed() {
        let mut full = CompileLog::with_capacity(log.size);
        let (again, created) = create(&mut full);
        if again == sys::OptixResult_OPTIX_SUCCESS {
            warn!("{stage} succeeded when repeated for its log; discarding");
            destroy(created);
        } else {
            log = full;
        }
    }
    Err(log.into_error(stage, result))
}

unsafe extern "C" fn log_callback(level: c_uint, tag: *const c_char, message: *const c_char, data: *mut c_void) {
    if data.is_null() || message.is_null() {
        return;
    }
    // SAFETY: `data` is the LogFilter kept alive by the OptixContext
    let filter = unsafe { &*(data as *const LogFilter) };
    let tag = if tag.is_null() { "".into() } else { unsafe { CStr::from_ptr(tag) }.to_string_lossy() };
    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    filter.emit(level, &tag, &message);
}

/// CUDA context the backend works in.
struct CudaContext {
    raw: sys::CUcontext,
    /// Set when the backend retained the device's primary context itself.
    primary: Option<sys::CUdevice>,
}

pub struct OptixContext {
    raw: sys::OptixDeviceContext,
    _log: Arc<LogFilter>,
}

pub struct OptixModule {
    raw: sys::OptixModule,
}

pub struct OptixProgramGroup {
    raw: sys::OptixProgramGroup,
}

pub struct OptixPipeline {
    raw: sys::OptixPipeline,
}

// SAFETY: OptiX objects may be used from any thread; TraceContext serializes
// all use behind its lock
unsafe impl Send for OptixContext {}
unsafe impl Sync for OptixContext {}
unsafe impl Send for OptixModule {}
unsafe impl Sync for OptixModule {}
unsafe impl Send for OptixProgramGroup {}
unsafe impl Sync for OptixProgramGroup {}
unsafe impl Send for OptixPipeline {}
unsafe impl Sync for OptixPipeline {}
unsafe impl Send for CudaContext {}

/// NVIDIA OptiX 7 device.
///
/// If a CUDA context is current on the thread that first touches the device,
/// it is adopted as-is; otherwise the primary context of `device_ordinal` is
/// retained and released again on drop.
pub struct OptixBackend {
    device_ordinal: u32,
    cuda: Mutex<Option<CudaContext>>,
}

impl OptixBackend {
    pub fn new(device_ordinal: u32) -> Self {
        Self { device_ordinal, cuda: Mutex::new(None) }
    }

    pub fn device_ordinal(&self) -> u32 {
        self.device_ordinal
    }

    /// Bind the backend's CUDA context to the calling thread, setting it up
    /// on first use.
    fn cuda_context(&self) -> std::result::Result<sys::CUcontext, String> {
        let mut cuda = self.cuda.lock();

        if let Some(ctx) = cuda.as_ref() {
            let mut current: sys::CUcontext = ptr::null_mut();
            cuda_check(unsafe { sys::cuCtxGetCurrent(&mut current) })?;
            if current != ctx.raw {
                cuda_check(unsafe { sys::cuCtxSetCurrent(ctx.raw) })?;
            }
            return Ok(ctx.raw);
        }

        cuda_check(unsafe { sys::cuInit(0) })?;
        let mut current: sys::CUcontext = ptr::null_mut();
        cuda_check(unsafe { sys::cuCtxGetCurrent(&mut current) })?;
        if !current.is_null() {
            debug!("using the current CUDA context");
            return Ok(cuda.insert(CudaContext { raw: current, primary: None }).raw);
        }

        let ordinal = i32::try_from(self.device_ordinal).map_err(|_| format!("device ordinal {} out of range", self.device_ordinal))?;
        let mut device: sys::CUdevice = 0;
        cuda_check(unsafe { sys::cuDeviceGet(&mut device, ordinal) })?;
        let mut primary: sys::CUcontext = ptr::null_mut();
        cuda_check(unsafe { sys::cuDevicePrimaryCtxRetain(&mut primary, device) })?;
        if let Err(e) = cuda_check(unsafe { sys::cuCtxSetCurrent(primary) }) {
            unsafe { sys::cuDevicePrimaryCtxRelease_v2(device) };
            return Err(e);
        }

        debug!(device = self.device_ordinal, "retained primary CUDA context");
        Ok(cuda.insert(CudaContext { raw: primary, primary: Some(device) }).raw)
    }

    fn bind(&self, operation: MemoryOp) -> Result<()> {
        self.cuda_context().map(|_| ()).map_err(|e| Error::memory(operation, e))
    }
}

impl Drop for OptixBackend {
    fn drop(&mut self) {
        if let Some(CudaContext { primary: Some(device), .. }) = self.cuda.get_mut().take() {
            if let Err(e) = cuda_check(unsafe { sys::cuDevicePrimaryCtxRelease_v2(device) }) {
                warn!("failed to release primary CUDA context: {e}");
            }
        }
    }
}

fn pipeline_compile_options(options: &PipelineCompileOptions, launch_params: &CStr) -> sys::OptixPipelineCompileOptions {
    let traversable_graph_flags = if options.single_gas_only {
        sys::OptixTraversableGraphFlags_OPTIX_TRAVERSABLE_GRAPH_FLAG_ALLOW_SINGLE_GAS
    } else {
        sys::OptixTraversableGraphFlags_OPTIX_TRAVERSABLE_GRAPH_FLAG_ALLOW_ANY
    };
    let exception_flags = if options.exceptions {
        sys::OptixExceptionFlags_OPTIX_EXCEPTION_FLAG_STACK_OVERFLOW | sys::OptixExceptionFlags_OPTIX_EXCEPTION_FLAG_TRACE_DEPTH
    } else {
        sys::OptixExceptionFlags_OPTIX_EXCEPTION_FLAG_NONE
    };

    sys::OptixPipelineCompileOptions {
        usesMotionBlur: options.uses_motion_blur as i32,
        traversableGraphFlags: traversable_graph_flags as _,
        numPayloadValues: options.num_payload_values as i32,
        numAttributeValues: options.num_attribute_values as i32,
        exceptionFlags: exception_flags as _,
        pipelineLaunchParamsVariableName: launch_params.as_ptr(),
        ..Default::default()
    }
}

fn launch_params_name(options: &PipelineCompileOptions) -> Result<CString> {
    CString::new(options.launch_params_variable)
        .map_err(|_| Error::invalid("launch parameter variable name contains NUL"))
}

fn triangle_build_input(input: &TriangleInput, vertex_buffer: &sys::CUdeviceptr, flags: &c_uint) -> sys::OptixBuildInput {
    let mut build_input = sys::OptixBuildInput {
        type_: sys::OptixBuildInputType_OPTIX_BUILD_INPUT_TYPE_TRIANGLES,
        ..Default::default()
    };
    build_input.__bindgen_anon_1.triangleArray = sys::OptixBuildInputTriangleArray {
        vertexBuffers: vertex_buffer,
        numVertices: input.vertex_count,
        vertexFormat: sys::OptixVertexFormat_OPTIX_VERTEX_FORMAT_FLOAT3,
        vertexStrideInBytes: input.vertex_stride,
        indexBuffer: input.indices.0,
        numIndexTriplets: input.triangle_count,
        indexFormat: sys::OptixIndicesFormat_OPTIX_INDICES_FORMAT_UNSIGNED_INT3,
        indexStrideInBytes: input.index_stride,
        flags,
        numSbtRecords: 1,
        ..Default::default()
    };
    build_input
}

fn accel_build_options() -> sys::OptixAccelBuildOptions {
    sys::OptixAccelBuildOptions {
        buildFlags: sys::OptixBuildFlags_OPTIX_BUILD_FLAG_NONE as _,
        operation: sys::OptixBuildOperation_OPTIX_BUILD_OPERATION_BUILD,
        motionOptions: sys::OptixMotionOptions { numKeys: 1, ..Default::default() },
    }
}

impl Backend for OptixBackend {
    type Context = OptixContext;
    type Module = OptixModule;
    type ProgramGroup = OptixProgramGroup;
    type Pipeline = OptixPipeline;

    const SBT_RECORD_HEADER_SIZE: usize = sys::OPTIX_SBT_RECORD_HEADER_SIZE as usize;
    const SBT_RECORD_ALIGNMENT: usize = sys::OPTIX_SBT_RECORD_ALIGNMENT as usize;

    fn device_programs(&self) -> &[u8] {
        DEVICE_PROGRAMS
    }

    fn initialize(&self) -> Result<()> {
        self.cuda_context().map_err(|e| Error::initialization("CUDA init", e))?;
        let result = unsafe { sys::optixsys_init() };
        if result != sys::OptixResult_OPTIX_SUCCESS {
            // the table is empty, so no error names are available yet
            return Err(Error::initialization("OptiX init", format!("optixInit returned {result}")));
        }
        Ok(())
    }

    fn create_context(&self, options: &ContextOptions) -> Result<OptixContext> {
        if options.device_ordinal != self.device_ordinal {
            return Err(Error::initialization(
                "device context",
                format!("backend drives device {}, context asked for {}", self.device_ordinal, options.device_ordinal),
            ));
        }
        let cuda = self.cuda_context().map_err(|e| Error::initialization("device context", e))?;

        let log = options.log.clone();
        let context_options = sys::OptixDeviceContextOptions {
            logCallbackFunction: Some(log_callback),
            logCallbackData: Arc::as_ptr(&log) as *mut c_void,
            logCallbackLevel: options.log_level.get() as i32,
            ..Default::default()
        };

        let mut raw: sys::OptixDeviceContext = ptr::null_mut();
        optix_check(optix_call!(optixDeviceContextCreate(cuda, &context_options, &mut raw)))
            .map_err(|e| Error::initialization("device context", e))?;
        Ok(OptixContext { raw, _log: log })
    }

    fn destroy_context(&self, context: OptixContext) -> Result<()> {
        optix_check(optix_call!(optixDeviceContextDestroy(context.raw)))
            .map_err(|e| Error::execution("destroy device context", e))
    }

    fn create_module(
        &self,
        context: &OptixContext,
        module_options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
        programs: &[u8],
    ) -> Result<OptixModule> {
        let opt_level = match module_options.optimization_level {
            0 => sys::OptixCompileOptimizationLevel_OPTIX_COMPILE_OPTIMIZATION_LEVEL_0,
            1 => sys::OptixCompileOptimizationLevel_OPTIX_COMPILE_OPTIMIZATION_LEVEL_1,
            2 => sys::OptixCompileOptimizationLevel_OPTIX_COMPILE_OPTIMIZATION_LEVEL_2,
            _ => sys::OptixCompileOptimizationLevel_OPTIX_COMPILE_OPTIMIZATION_LEVEL_3,
        };
        let debug_level = if module_options.debug_info {
            sys::OptixCompileDebugLevel_OPTIX_COMPILE_DEBUG_LEVEL_FULL
        } else {
            sys::OptixCompileDebugLevel_OPTIX_COMPILE_DEBUG_LEVEL_NONE
        };
        let module_compile_options = sys::OptixModuleCompileOptions {
            maxRegisterCount: module_options.max_register_count as i32,
            optLevel: opt_level,
            debugLevel: debug_level,
            ..Default::default()
        };
        let launch_params = launch_params_name(pipeline_options)?;
        let pipeline_compile_options = pipeline_compile_options(pipeline_options, &launch_params);

        let raw = create_logged(
            PipelineStage::Module,
            |log| {
                let mut raw: sys::OptixModule = ptr::null_mut();
                let result = optix_call!(optixModuleCreateFromPTX(
                    context.raw,
                    &module_compile_options,
                    &pipeline_compile_options,
                    programs.as_ptr().cast(),
                    programs.len(),
                    log.ptr(),
                    &mut log.size,
                    &mut raw,
                ));
                (result, raw)
            },
            |raw| {
                optix_call!(optixModuleDestroy(raw));
            },
        )?;
        Ok(OptixModule { raw })
    }

    fn destroy_module(&self, module: OptixModule) -> Result<()> {
        optix_check(optix_call!(optixModuleDestroy(module.raw)))
            .map_err(|e| Error::execution("destroy module", e))
    }

    fn create_program_group(
        &self,
        context: &OptixContext,
        module: &OptixModule,
        kind: ProgramKind,
        entry_point: &str,
    ) -> Result<OptixProgramGroup> {
        let entry = CString::new(entry_point).map_err(|_| Error::invalid("entry point name contains NUL"))?;

        let mut desc = sys::OptixProgramGroupDesc::default();
        match kind {
            ProgramKind::Raygen => {
                desc.kind = sys::OptixProgramGroupKind_OPTIX_PROGRAM_GROUP_KIND_RAYGEN;
                desc.__bindgen_anon_1.raygen = sys::OptixProgramGroupSingleModule {
                    module: module.raw,
                    entryFunctionName: entry.as_ptr(),
                };
            }
            ProgramKind::Miss => {
                desc.kind = sys::OptixProgramGroupKind_OPTIX_PROGRAM_GROUP_KIND_MISS;
                desc.__bindgen_anon_1.miss = sys::OptixProgramGroupSingleModule {
                    module: module.raw,
                    entryFunctionName: entry.as_ptr(),
                };
            }
            ProgramKind::ClosestHit => {
                desc.kind = sys::OptixProgramGroupKind_OPTIX_PROGRAM_GROUP_KIND_HITGROUP;
                desc.__bindgen_anon_1.hitgroup = sys::OptixProgramGroupHitgroup {
                    moduleCH: module.raw,
                    entryFunctionNameCH: entry.as_ptr(),
                    ..Default::default()
                };
            }
        }
        let group_options = sys::OptixProgramGroupOptions::default();

        let raw = create_logged(
            PipelineStage::Program(kind),
            |log| {
                let mut raw: sys::OptixProgramGroup = ptr::null_mut();
                let result = optix_call!(optixProgramGroupCreate(
                    context.raw,
                    &desc,
                    1,
                    &group_options,
                    log.ptr(),
                    &mut log.size,
                    &mut raw,
                ));
                (result, raw)
            },
            |raw| {
                optix_call!(optixProgramGroupDestroy(raw));
            },
        )?;
        Ok(OptixProgramGroup { raw })
    }

    fn destroy_program_group(&self, group: OptixProgramGroup) -> Result<()> {
        optix_check(optix_call!(optixProgramGroupDestroy(group.raw)))
            .map_err(|e| Error::execution("destroy program group", e))
    }

    fn create_pipeline(
        &self,
        context: &OptixContext,
        pipeline_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
        groups: &ProgramGroups<&OptixProgramGroup>,
    ) -> Result<OptixPipeline> {
        let launch_params = launch_params_name(pipeline_options)?;
        let pipeline_compile_options = pipeline_compile_options(pipeline_options, &launch_params);
        let pipeline_link_options = sys::OptixPipelineLinkOptions {
            maxTraceDepth: link_options.max_trace_depth,
            ..Default::default()
        };
        let raw_groups = groups.ordered().map(|group| group.raw);

        let raw = create_logged(
            PipelineStage::Link,
            |log| {
                let mut raw: sys::OptixPipeline = ptr::null_mut();
                let result = optix_call!(optixPipelineCreate(
                    context.raw,
                    &pipeline_compile_options,
                    &pipeline_link_options,
                    raw_groups.as_ptr(),
                    raw_groups.len() as c_uint,
                    log.ptr(),
                    &mut log.size,
                    &mut raw,
                ));
                (result, raw)
            },
            |raw| {
                optix_call!(optixPipelineDestroy(raw));
            },
        )?;
        Ok(OptixPipeline { raw })
    }

    fn set_stack_size(&self, pipeline: &OptixPipeline, sizes: &StackSizes) -> Result<()> {
        let result = optix_call!(optixPipelineSetStackSize(
            pipeline.raw,
            sizes.direct_callable_from_traversal,
            sizes.direct_callable_from_state,
            sizes.continuation,
            sizes.max_traversable_graph_depth,
        ));
        optix_check(result).map_err(|e| Error::compilation(PipelineStage::StackSize, e))
    }

    fn destroy_pipeline(&self, pipeline: OptixPipeline) -> Result<()> {
        optix_check(optix_call!(optixPipelineDestroy(pipeline.raw)))
            .map_err(|e| Error::execution("destroy pipeline", e))
    }

    fn accel_memory_usage(&self, context: &OptixContext, input: &TriangleInput) -> Result<AccelBufferSizes> {
        let vertex_buffer = input.vertices.0;
        let flags = sys::OptixGeometryFlags_OPTIX_GEOMETRY_FLAG_NONE as c_uint;
        let build_input = triangle_build_input(input, &vertex_buffer, &flags);
        let options = accel_build_options();

        let mut sizes = sys::OptixAccelBufferSizes::default();
        optix_check(optix_call!(optixAccelComputeMemoryUsage(context.raw, &options, &build_input, 1, &mut sizes)))
            .map_err(|e| Error::execution("accel memory usage", e))?;

        Ok(AccelBufferSizes { output: sizes.outputSizeInBytes, temp: sizes.tempSizeInBytes })
    }

    fn accel_build(
        &self,
        context: &OptixContext,
        input: &TriangleInput,
        temp: DevicePtr,
        temp_size: usize,
        output: DevicePtr,
        output_size: usize,
    ) -> Result<TraversableHandle> {
        let vertex_buffer = input.vertices.0;
        let flags = sys::OptixGeometryFlags_OPTIX_GEOMETRY_FLAG_NONE as c_uint;
        let build_input = triangle_build_input(input, &vertex_buffer, &flags);
        let options = accel_build_options();

        let mut handle: sys::OptixTraversableHandle = 0;
        let result = optix_call!(optixAccelBuild(
            context.raw,
            ptr::null_mut(),
            &options,
            &build_input,
            1,
            temp.0,
            temp_size,
            output.0,
            output_size,
            &mut handle,
            ptr::null(),
            0,
        ));
        optix_check(result).map_err(|e| Error::execution("accel build", e))?;
        Ok(TraversableHandle(handle))
    }

    fn pack_sbt_header(&self, group: &OptixProgramGroup, record: &mut [u8]) -> Result<()> {
        if record.len() < Self::SBT_RECORD_HEADER_SIZE {
            return Err(Error::invalid(format!("SBT record of {} bytes cannot hold a header", record.len())));
        }
        optix_check(optix_call!(optixSbtRecordPackHeader(group.raw, record.as_mut_ptr().cast())))
            .map_err(|e| Error::execution("pack SBT header", e))
    }

    fn launch(
        &self,
        pipeline: &OptixPipeline,
        params: DevicePtr,
        params_size: usize,
        sbt: &ShaderBindingTable,
        dims: LaunchDims,
    ) -> Result<()> {
        self.cuda_context().map_err(|e| Error::execution("launch", e))?;
        let table = sys::OptixShaderBindingTable {
            raygenRecord: sbt.raygen_record.0,
            missRecordBase: sbt.miss_record_base.0,
            missRecordStrideInBytes: sbt.miss_record_stride,
            missRecordCount: sbt.miss_record_count,
            hitgroupRecordBase: sbt.hitgroup_record_base.0,
            hitgroupRecordStrideInBytes: sbt.hitgroup_record_stride,
            hitgroupRecordCount: sbt.hitgroup_record_count,
            ..Default::default()
        };

        let result = optix_call!(optixLaunch(
            pipeline.raw,
            ptr::null_mut(),
            params.0,
            params_size,
            &table,
            dims.width,
            dims.height,
            dims.depth,
        ));
        optix_check(result).map_err(|e| Error::execution("launch", e))
    }

    fn synchronize(&self) -> Result<()> {
        self.cuda_context()
            .and_then(|_| cuda_check(unsafe { sys::cuCtxSynchronize() }))
            .map_err(|e| Error::execution("synchronize", e))
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr> {
        self.bind(MemoryOp::Alloc)?;
        let mut ptr: sys::CUdeviceptr = 0;
        cuda_check(unsafe { sys::cuMemAlloc_v2(&mut ptr, bytes) }).map_err(|e| Error::memory(MemoryOp::Alloc, e))?;
        Ok(DevicePtr(ptr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.bind(MemoryOp::Free)?;
        cuda_check(unsafe { sys::cuMemFree_v2(ptr.0) }).map_err(|e| Error::memory(MemoryOp::Free, e))
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        self.bind(MemoryOp::CopyToDevice)?;
        cuda_check(unsafe { sys::cuMemcpyHtoD_v2(dst.0, src.as_ptr().cast(), src.len()) })
            .map_err(|e| Error::memory(MemoryOp::CopyToDevice, e))
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        self.bind(MemoryOp::CopyFromDevice)?;
        cuda_check(unsafe { sys::cuMemcpyDtoH_v2(dst.as_mut_ptr().cast(), src.0, dst.len()) })
            .map_err(|e| Error::memory(MemoryOp::CopyFromDevice, e))
    }
}
