use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::accel::{self, AccelStructure, MeshBuffers, RawAccel};
use crate::backend::{Backend, ContextOptions, DevicePtr, ProgramKind, TraversableHandle};
use crate::config::TraceConfig;
use crate::diagnostics::{LogFilter, LogLevel};
use crate::error::{Error, Result};
use crate::launch::{self, RayBuffers};
use crate::pipeline::{self, PartialPrograms, ProgramGroups};

/// How far pipeline initialization has progressed. Only moves forward, except
/// through [`TraceContext::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InitState {
    Uninitialized,
    ContextReady,
    ModuleReady,
    ProgramsReady,
    PipelineReady,
}

struct Inner<B: Backend> {
    context: Option<B::Context>,
    module: Option<B::Module>,
    programs: PartialPrograms<B::ProgramGroup>,
    pipeline: Option<B::Pipeline>,
    /// Live acceleration structures, keyed by backing buffer.
    accels: HashMap<DevicePtr, TraversableHandle>,
    /// Set once subsystem or context creation failed; the library state is
    /// unknown afterwards.
    poisoned: Option<String>,
}

impl<B: Backend> Inner<B> {
    fn state(&self) -> InitState {
        if self.pipeline.is_some() {
            InitState::PipelineReady
        } else if self.programs.complete().is_some() {
            InitState::ProgramsReady
        } else if self.module.is_some() {
            InitState::ModuleReady
        } else if self.context.is_some() {
            InitState::ContextReady
        } else {
            InitState::Uninitialized
        }
    }
}

/// Everything needed to launch: borrowed out of the locked state.
struct Ready<'i, B: Backend> {
    context: &'i B::Context,
    programs: ProgramGroups<&'i B::ProgramGroup>,
    pipeline: &'i B::Pipeline,
}

fn get_or_try_insert<T>(slot: &mut Option<T>, f: impl FnOnce() -> Result<T>) -> Result<&mut T> {
    let value = match slot.take() {
        Some(value) => value,
        None => f()?,
    };
    Ok(slot.insert(value))
}

/// Owns one ray-tracing device context and the pipeline built on it.
///
/// Initialization is lazy: the first build or trace creates the context,
/// compiles the module, creates the program groups and links the pipeline.
/// A stage that fails is retried from that stage on the next call.
///
/// Every entry point takes one internal lock for its whole duration,
/// including the device synchronization, so calls never overlap.
pub struct TraceContext<B: Backend> {
    backend: B,
    config: TraceConfig,
    log: Arc<LogFilter>,
    inner: Mutex<Inner<B>>,
}

impl<B: Backend> TraceContext<B> {
    pub fn new(backend: B, config: TraceConfig) -> Self {
        Self {
            backend,
            config,
            log: Arc::new(LogFilter::new(config.log_level)),
            inner: Mutex::new(Inner {
                context: None,
                module: None,
                programs: PartialPrograms::default(),
                pipeline: None,
                accels: HashMap::new(),
                poisoned: None,
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn log_level(&self) -> LogLevel {
        self.log.level()
    }

    /// Change the threshold for library messages (0-4). Takes effect for the
    /// next message; the library's own filter keeps the level it was created
    /// with.
    pub fn set_log_level(&self, level: i32) -> Result<()> {
        let level = LogLevel::new(level)?;
        self.log.set_level(level);
        Ok(())
    }

    pub fn state(&self) -> InitState {
        self.inner.lock().state()
    }

    /// Number of acceleration structures built and not yet released.
    pub fn live_accels(&self) -> usize {
        self.inner.lock().accels.len()
    }

    pub fn ensure_context(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.ensure_context_locked(&mut inner).map(|_| ())
    }

    pub fn ensure_pipeline(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.ensure_pipeline_locked(&mut inner).map(|_| ())
    }

    fn create_device_context(&self) -> Result<B::Context> {
        self.backend.initialize()?;
        let options = ContextOptions {
            log: self.log.clone(),
            log_level: self.log.level(),
            device_ordinal: self.config.device_ordinal,
        };
        let context = self.backend.create_context(&options)?;
        debug!(device = self.config.device_ordinal, level = options.log_level.get(), "device context created");
        Ok(context)
    }

    fn ensure_context_locked<'i>(&self, inner: &'i mut Inner<B>) -> Result<&'i mut B::Context> {
        if let Some(reason) = &inner.poisoned {
            return Err(Error::initialization("device context", format!("previous initialization failed: {reason}")));
        }

        let Inner { context, poisoned, .. } = inner;
        get_or_try_insert(context, || {
            self.create_device_context().inspect_err(|e| *poisoned = Some(e.to_string()))
        })
    }

    fn ensure_pipeline_locked<'i>(&self, inner: &'i mut Inner<B>) -> Result<Ready<'i, B>> {
        let fresh = inner.pipeline.is_none();
        let t = Instant::now();

        self.ensure_context_locked(inner)?;
        let Inner { context, module, programs, pipeline: linked, .. } = inner;
        let Some(context) = context.as_ref() else {
            return Err(Error::initialization("device context", "context missing after creation"));
        };
        let backend = &self.backend;

        let module = &*get_or_try_insert(module, || pipeline::compile_module(backend, context))?;
        let raygen = &*get_or_try_insert(&mut programs.raygen, || {
            pipeline::create_program(backend, context, module, ProgramKind::Raygen)
        })?;
        let miss = &*get_or_try_insert(&mut programs.miss, || {
            pipeline::create_program(backend, context, module, ProgramKind::Miss)
        })?;
        let closest_hit = &*get_or_try_insert(&mut programs.closest_hit, || {
            pipeline::create_program(backend, context, module, ProgramKind::ClosestHit)
        })?;

        let programs = ProgramGroups { raygen, miss, closest_hit };
        let pipeline = &*get_or_try_insert(linked, || pipeline::link_pipeline(backend, context, &programs))?;

        if fresh {
            info!("pipeline ready: {:.2}s", t.elapsed().as_secs_f64());
        }

        Ok(Ready { context, programs, pipeline })
    }

    /// Build an acceleration structure over caller-owned vertex and index
    /// buffers, initializing the pipeline first if needed.
    pub fn build(&self, mesh: &MeshBuffers) -> Result<AccelStructure<'_, B>> {
        self.build_raw(mesh).map(|raw| AccelStructure::new(self, raw))
    }

    /// [`TraceContext::build`] without the RAII wrapper. The structure stays
    /// alive until [`TraceContext::release_raw`] or shutdown.
    pub fn build_raw(&self, mesh: &MeshBuffers) -> Result<RawAccel> {
        let input = mesh.to_input()?;

        let mut inner = self.inner.lock();
        let ready = self.ensure_pipeline_locked(&mut inner)?;
        let raw = accel::build_blas(&self.backend, ready.context, &input)?;

        inner.accels.insert(raw.backing, raw.handle);
        Ok(raw)
    }

    pub fn trace_rays(&self, accel: &AccelStructure<'_, B>, rays: &RayBuffers) -> Result<()> {
        self.trace_rays_raw(accel.raw(), rays)
    }

    /// Trace `rays.count` rays against a structure built by this context.
    /// Handles this context did not build, or already released, are refused
    /// before any device work.
    pub fn trace_rays_raw(&self, accel: RawAccel, rays: &RayBuffers) -> Result<()> {
        let width = rays.launch_width()?;

        let mut inner = self.inner.lock();
        if inner.accels.get(&accel.backing) != Some(&accel.handle) {
            return Err(Error::UnknownAccel { handle: accel.handle.0 });
        }

        let ready = self.ensure_pipeline_locked(&mut inner)?;
        if width == 0 {
            debug!("empty trace, nothing to launch");
            return Ok(());
        }

        launch::launch_trace(&self.backend, ready.pipeline, &ready.programs, accel.handle, rays, width)
    }

    /// Free the structure's backing buffer. Nothing else is torn down.
    pub fn release_raw(&self, accel: RawAccel) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.accels.get(&accel.backing) != Some(&accel.handle) {
            return Err(Error::UnknownAccel { handle: accel.handle.0 });
        }

        // forget it even if the free fails; a retry would be a double free
        inner.accels.remove(&accel.backing);
        self.backend.free(accel.backing)
    }

    fn teardown(&mut self) -> Result<()> {
        let inner = self.inner.get_mut();
        let mut first_error = None;
        let mut record = |result: Result<()>| {
            if let Err(e) = result {
                warn!("teardown: {e}");
                first_error.get_or_insert(e);
            }
        };

        for (backing, _) in inner.accels.drain() {
            record(self.backend.free(backing));
        }
        if let Some(pipeline) = inner.pipeline.take() {
            record(self.backend.destroy_pipeline(pipeline));
        }
        for group in inner.programs.take_reversed() {
            record(self.backend.destroy_program_group(group));
        }
        if let Some(module) = inner.module.take() {
            record(self.backend.destroy_module(module));
        }
        if let Some(context) = inner.context.take() {
            record(self.backend.destroy_context(context));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Free every registered acceleration structure and destroy the pipeline,
    /// program groups, module and device context, newest first. Reports the
    /// first failure; later steps still run.
    pub fn shutdown(mut self) -> Result<()> {
        self.teardown()
    }
}

impl<B: Backend> Drop for TraceContext<B> {
    fn drop(&mut self) {
        // failures were already logged
        let _ = self.teardown();
    }
}
