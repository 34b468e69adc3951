//! # Triangle-mesh ray casting on the GPU
//!
//! `meshtrace` builds an acceleration structure over a device-resident
//! triangle mesh and casts batches of rays against it, writing the closest
//! hit distance and primitive index for every ray.
//!
//! All device work goes through a [`Backend`]. [`OptixBackend`] (feature
//! `optix`) drives NVIDIA OptiX 7 through the CUDA driver; [`HostBackend`]
//! emulates the device on the CPU and is what the tests run against.
//!
//! ```
//! use meshtrace::{DeviceBuffer, HostBackend, MeshBuffers, RayBuffers, TraceConfig, TraceContext};
//!
//! # fn main() -> meshtrace::Result<()> {
//! let ctx = TraceContext::new(HostBackend::new(), TraceConfig::default());
//! let backend = ctx.backend();
//!
//! let vertices = DeviceBuffer::from_slice(backend, &[[0f32, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]])?;
//! let indices = DeviceBuffer::from_slice(backend, &[[0u32, 1, 2]])?;
//! let accel = ctx.build(&MeshBuffers {
//!     vertices: vertices.ptr(),
//!     indices: indices.ptr(),
//!     vertex_count: 3,
//!     triangle_count: 1,
//! })?;
//!
//! let origins = DeviceBuffer::from_slice(backend, &[[0.25f32, 0.25, 1.0]])?;
//! let directions = DeviceBuffer::from_slice(backend, &[[0f32, 0.0, -1.0]])?;
//! let distances = DeviceBuffer::alloc(backend, 4)?;
//! let hits = DeviceBuffer::alloc(backend, 4)?;
//! accel.trace(&RayBuffers {
//!     origins: origins.ptr(),
//!     directions: directions.ptr(),
//!     out_distance: distances.ptr(),
//!     out_index: hits.ptr(),
//!     max_distance: f32::MAX,
//!     count: 1,
//! })?;
//!
//! assert_eq!(distances.to_vec::<f32>()?, [1.0]);
//! assert_eq!(hits.to_vec::<i32>()?, [0]);
//! # Ok(())
//! # }
//! ```

mod accel;
mod backend;
mod config;
mod context;
mod diagnostics;
mod error;
pub mod host;
mod launch;
mod memory;
#[cfg(feature = "optix")]
mod optix;
pub mod pipeline;
pub mod sbt;

pub use accel::{AccelStructure, MeshBuffers, RawAccel};
pub use backend::{
    AccelBufferSizes, Backend, ContextOptions, DevicePtr, LaunchDims, ProgramKind, TraversableHandle, TriangleInput,
};
pub use config::TraceConfig;
pub use context::{InitState, TraceContext};
pub use diagnostics::{LogFilter, LogLevel};
pub use error::{Error, ErrorKind, MemoryOp, Result};
pub use host::{HostBackend, HostOp, HostStats};
pub use launch::{LaunchParams, MISS_DISTANCE, MISS_INDEX, RayBuffers};
pub use memory::DeviceBuffer;
#[cfg(feature = "optix")]
pub use optix::OptixBackend;
