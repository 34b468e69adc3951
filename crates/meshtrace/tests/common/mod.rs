#![allow(dead_code)]

use meshtrace::{DeviceBuffer, HostBackend, MeshBuffers, RayBuffers};

pub const UNIT_TRIANGLE: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
pub const DOWN: [f32; 3] = [0.0, 0.0, -1.0];

/// Vertex and index buffers of a mesh uploaded to the host device.
pub struct Mesh<'b> {
    pub vertices: DeviceBuffer<'b, HostBackend>,
    pub indices: DeviceBuffer<'b, HostBackend>,
    vertex_count: u64,
    triangle_count: u64,
}

impl<'b> Mesh<'b> {
    pub fn upload(backend: &'b HostBackend, vertices: &[[f32; 3]], triangles: &[[u32; 3]]) -> Self {
        Mesh {
            vertices: DeviceBuffer::from_slice(backend, vertices).unwrap(),
            indices: DeviceBuffer::from_slice(backend, triangles).unwrap(),
            vertex_count: vertices.len() as u64,
            triangle_count: triangles.len() as u64,
        }
    }

    pub fn triangle(backend: &'b HostBackend) -> Self {
        Self::upload(backend, &UNIT_TRIANGLE, &[[0, 1, 2]])
    }

    pub fn buffers(&self) -> MeshBuffers {
        MeshBuffers {
            vertices: self.vertices.ptr(),
            indices: self.indices.ptr(),
            vertex_count: self.vertex_count,
            triangle_count: self.triangle_count,
        }
    }
}

/// Ray inputs and result outputs for one batch.
pub struct Rays<'b> {
    pub origins: DeviceBuffer<'b, HostBackend>,
    pub directions: DeviceBuffer<'b, HostBackend>,
    pub distances: DeviceBuffer<'b, HostBackend>,
    pub indices: DeviceBuffer<'b, HostBackend>,
    count: u64,
}

impl<'b> Rays<'b> {
    pub fn upload(backend: &'b HostBackend, rays: &[([f32; 3], [f32; 3])]) -> Self {
        let origins: Vec<[f32; 3]> = rays.iter().map(|r| r.0).collect();
        let directions: Vec<[f32; 3]> = rays.iter().map(|r| r.1).collect();
        // outputs start out as garbage so unwritten slots stand out
        let poison_t = vec![f32::NAN; rays.len()];
        let poison_i = vec![i32::MIN; rays.len()];
        Rays {
            origins: DeviceBuffer::from_slice(backend, &origins).unwrap(),
            directions: DeviceBuffer::from_slice(backend, &directions).unwrap(),
            distances: DeviceBuffer::from_slice(backend, &poison_t).unwrap(),
            indices: DeviceBuffer::from_slice(backend, &poison_i).unwrap(),
            count: rays.len() as u64,
        }
    }

    pub fn buffers(&self, max_distance: f32) -> RayBuffers {
        RayBuffers {
            origins: self.origins.ptr(),
            directions: self.directions.ptr(),
            out_distance: self.distances.ptr(),
            out_index: self.indices.ptr(),
            max_distance,
            count: self.count,
        }
    }

    pub fn results(&self) -> (Vec<f32>, Vec<i32>) {
        (self.distances.to_vec().unwrap(), self.indices.to_vec().unwrap())
    }
}

pub fn assert_close(actual: f32, expected: f32) {
    assert!((actual - expected).abs() < 1e-5, "expected {expected}, got {actual}");
}
