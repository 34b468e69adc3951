//! Launch parameters and the trace launch itself.

use std::mem::size_of;
use std::time::Instant;

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::backend::{Backend, DevicePtr, LaunchDims, TraversableHandle};
use crate::error::{Error, Result};
use crate::memory::DeviceBuffer;
use crate::pipeline::ProgramGroups;
use crate::sbt::SbtRecords;

/// Distance written for a ray that hits nothing.
pub const MISS_DISTANCE: f32 = -1.0;
/// Primitive index written for a ray that hits nothing.
pub const MISS_INDEX: i32 = -1;

/// Uploaded once per launch; read by the device programs as
/// `optixLaunchParams`. Layout must match `csrc/launch_params.h`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct LaunchParams {
    pub traversable: u64,
    pub rays_o: u64,
    pub rays_d: u64,
    pub out_t: u64,
    pub out_i: u64,
    pub t_max: f32,
    _pad: u32,
}

impl LaunchParams {
    pub fn new(traversable: TraversableHandle, rays: &RayBuffers) -> Self {
        Self {
            traversable: traversable.0,
            rays_o: rays.origins.0,
            rays_d: rays.directions.0,
            out_t: rays.out_distance.0,
            out_i: rays.out_index.0,
            t_max: rays.max_distance,
            _pad: 0,
        }
    }
}

/// Caller-owned device buffers for one trace call, each holding at least
/// `count` elements: `[f32; 3]` origins and directions, `f32` distances and
/// `i32` primitive indices.
///
/// Results are valid once the trace call returns. A miss is reported as
/// [`MISS_DISTANCE`] / [`MISS_INDEX`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayBuffers {
    pub origins: DevicePtr,
    pub directions: DevicePtr,
    pub out_distance: DevicePtr,
    pub out_index: DevicePtr,
    pub max_distance: f32,
    pub count: u64,
}

impl RayBuffers {
    /// Check the arguments and return the launch width.
    pub(crate) fn launch_width(&self) -> Result<u32> {
        let width = u32::try_from(self.count)
            .map_err(|_| Error::invalid(format!("ray count {} exceeds the launch width limit", self.count)))?;

        if self.max_distance.is_nan() {
            return Err(Error::invalid("max distance is NaN"));
        }

        if width > 0 {
            let buffers = [
                ("ray origin", self.origins),
                ("ray direction", self.directions),
                ("output distance", self.out_distance),
                ("output index", self.out_index),
            ];
            if let Some((name, _)) = buffers.iter().find(|(_, ptr)| ptr.is_null()) {
                return Err(Error::invalid(format!("null {name} buffer")));
            }
        }

        Ok(width)
    }
}

/// Upload the SBT and launch parameters, launch `width` rays, wait, and free
/// both transient buffers on every path.
pub(crate) fn launch_trace<B: Backend>(
    backend: &B,
    pipeline: &B::Pipeline,
    programs: &ProgramGroups<&B::ProgramGroup>,
    traversable: TraversableHandle,
    rays: &RayBuffers,
    width: u32,
) -> Result<()> {
    let t = Instant::now();

    let records = SbtRecords::pack(backend, programs)?;
    let sbt_buffer = DeviceBuffer::from_slice(backend, records.as_bytes())?;
    let sbt = records.table(sbt_buffer.ptr())?;

    let params = LaunchParams::new(traversable, rays);
    let params_buffer = DeviceBuffer::from_slice(backend, bytemuck::bytes_of(&params))?;

    backend.launch(pipeline, params_buffer.ptr(), size_of::<LaunchParams>(), &sbt, LaunchDims::linear(width))?;
    backend.synchronize()?;

    params_buffer.free()?;
    sbt_buffer.free()?;

    debug!(rays = width, "trace finished in {:.3}s", t.elapsed().as_secs_f64());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::mem::offset_of;

    use super::*;
    use crate::error::ErrorKind;

    fn rays(count: u64) -> RayBuffers {
        RayBuffers {
            origins: DevicePtr(0x10),
            directions: DevicePtr(0x20),
            out_distance: DevicePtr(0x30),
            out_index: DevicePtr(0x40),
            max_distance: 100.0,
            count,
        }
    }

    #[test]
    fn params_layout_matches_device_struct() {
        assert_eq!(size_of::<LaunchParams>(), 48);
        assert_eq!(offset_of!(LaunchParams, traversable), 0);
        assert_eq!(offset_of!(LaunchParams, rays_o), 8);
        assert_eq!(offset_of!(LaunchParams, rays_d), 16);
        assert_eq!(offset_of!(LaunchParams, out_t), 24);
        assert_eq!(offset_of!(LaunchParams, out_i), 32);
        assert_eq!(offset_of!(LaunchParams, t_max), 40);
    }

    #[test]
    fn params_copy_ray_buffers() {
        let params = LaunchParams::new(TraversableHandle(99), &rays(4));
        assert_eq!(params.traversable, 99);
        assert_eq!(params.rays_d, 0x20);
        assert_eq!(params.out_i, 0x40);
        assert_eq!(params.t_max, 100.0);
    }

    #[test]
    fn width_validation() {
        assert_eq!(rays(0).launch_width().unwrap(), 0);
        assert_eq!(rays(1 << 20).launch_width().unwrap(), 1 << 20);
        assert_eq!(rays(u64::MAX).launch_width().unwrap_err().kind(), ErrorKind::InvalidArgument);

        let mut nan = rays(1);
        nan.max_distance = f32::NAN;
        assert_eq!(nan.launch_width().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn null_buffers_only_matter_for_non_empty_launches() {
        let mut r = rays(1);
        r.out_index = DevicePtr::NULL;
        assert_eq!(r.launch_width().unwrap_err().kind(), ErrorKind::InvalidArgument);

        r.count = 0;
        assert_eq!(r.launch_width().unwrap(), 0);
    }
}
