//! Serialized form of a host-built acceleration structure. The output buffer
//! holds a small header followed by the resolved triangle corners, so a
//! launch never touches the caller's vertex or index buffers.

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};

use super::geometry::{Ray, Vec3, ray_triangle_intersect};
use super::memory::{ALIGNMENT, AddressSpace};
use crate::backend::{DevicePtr, TraversableHandle, TriangleInput};

const BLAS_MAGIC: u32 = u32::from_le_bytes(*b"BLAS");
/// Low bits of a handle; the output address is 256-byte aligned.
const HANDLE_TAG: u64 = 0x0a;

pub(crate) type Triangle = [Vec3; 3];

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct BlasHeader {
    magic: u32,
    triangle_count: u32,
    _reserved: u64,
}

pub(crate) fn output_size(triangle_count: u32) -> usize {
    size_of::<BlasHeader>() + triangle_count as usize * size_of::<Triangle>()
}

pub(crate) fn temp_size(vertex_count: u32) -> usize {
    64 + vertex_count as usize * size_of::<Vec3>()
}

pub(crate) fn handle_for(output: DevicePtr) -> TraversableHandle {
    TraversableHandle(output.0 | HANDLE_TAG)
}

fn handle_address(handle: TraversableHandle) -> Option<DevicePtr> {
    (handle.0 % ALIGNMENT == HANDLE_TAG).then(|| DevicePtr(handle.0 - HANDLE_TAG))
}

/// `count` elements of `T`, `stride` bytes apart.
pub(crate) fn read_strided<T: Pod>(memory: &AddressSpace, ptr: DevicePtr, count: usize, stride: usize) -> Result<Vec<T>, String> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if stride < size_of::<T>() {
        return Err(format!("stride {stride} is smaller than the {}-byte element", size_of::<T>()));
    }

    let span = (count - 1) * stride + size_of::<T>();
    let bytes = memory.read(ptr, span)?;
    Ok((0..count)
        .map(|i| bytemuck::pod_read_unaligned(&bytes[i * stride..i * stride + size_of::<T>()]))
        .collect())
}

/// Resolve the index triplets of `input` into triangle corners.
pub(crate) fn gather(memory: &AddressSpace, input: &TriangleInput) -> Result<Vec<Triangle>, String> {
    let vertices: Vec<Vec3> = read_strided(memory, input.vertices, input.vertex_count as usize, input.vertex_stride as usize)?;
    let indices: Vec<[u32; 3]> = read_strided(memory, input.indices, input.triangle_count as usize, input.index_stride as usize)?;

    indices
        .iter()
        .enumerate()
        .map(|(primitive, triplet)| {
            let corner = |i: u32| {
                vertices
                    .get(i as usize)
                    .copied()
                    .ok_or_else(|| format!("triangle {primitive} references vertex {i} of {}", vertices.len()))
            };
            Ok([corner(triplet[0])?, corner(triplet[1])?, corner(triplet[2])?])
        })
        .collect()
}

pub(crate) fn encode(triangles: &[Triangle]) -> Vec<u8> {
    let header = BlasHeader { magic: BLAS_MAGIC, triangle_count: triangles.len() as u32, _reserved: 0 };
    let mut bytes = Vec::with_capacity(output_size(header.triangle_count));
    bytes.extend_from_slice(bytemuck::bytes_of(&header));
    bytes.extend_from_slice(bytemuck::cast_slice(triangles));
    bytes
}

#[derive(Debug)]
pub(crate) struct Blas {
    triangles: Vec<Triangle>,
}

impl Blas {
    pub(crate) fn load(memory: &AddressSpace, handle: TraversableHandle) -> Result<Self, String> {
        let base = handle_address(handle).ok_or_else(|| format!("{:#x} is not a traversable handle", handle.0))?;

        let header: BlasHeader = bytemuck::pod_read_unaligned(memory.read(base, size_of::<BlasHeader>())?);
        if header.magic != BLAS_MAGIC {
            return Err(format!("no acceleration structure at {:#x}", base.0));
        }

        let triangles = read_strided(
            memory,
            base.offset(size_of::<BlasHeader>() as u64),
            header.triangle_count as usize,
            size_of::<Triangle>(),
        )?;
        Ok(Self { triangles })
    }

    /// Nearest triangle crossed within `[0, t_max]`, as `(distance, primitive)`.
    pub(crate) fn closest_hit(&self, ray: Ray, t_max: f32) -> Option<(f32, u32)> {
        let mut closest: Option<(f32, u32)> = None;
        for (primitive, &[p0, p1, p2]) in self.triangles.iter().enumerate() {
            let Some(t) = ray_triangle_intersect(p0, p1, p2, ray) else {
                continue;
            };
            if t < 0.0 || t > t_max {
                continue;
            }
            if closest.is_none_or(|(best, _)| t < best) {
                closest = Some((t, primitive as u32));
            }
        }
        closest
    }
}
