mod common;

use std::thread;

use common::{DOWN, Mesh, Rays, UNIT_TRIANGLE, assert_close};
use meshtrace::{
    DevicePtr, ErrorKind, HostBackend, HostOp, MISS_DISTANCE, MISS_INDEX, MeshBuffers, RayBuffers, TraceConfig, TraceContext,
};
use rand::Rng;

fn context() -> (TraceContext<HostBackend>, HostBackend) {
    let backend = HostBackend::new();
    let probe = backend.clone();
    (TraceContext::new(backend, TraceConfig::default()), probe)
}

#[test]
fn single_triangle_hit_and_miss() {
    let (ctx, _probe) = context();
    let mesh = Mesh::triangle(ctx.backend());
    let accel = ctx.build(&mesh.buffers()).unwrap();

    let rays = Rays::upload(ctx.backend(), &[([0.25, 0.25, 1.0], DOWN), ([2.0, 2.0, 1.0], DOWN)]);
    accel.trace(&rays.buffers(f32::MAX)).unwrap();

    let (t, i) = rays.results();
    assert_close(t[0], 1.0);
    assert_eq!(i[0], 0);
    assert_eq!(t[1], MISS_DISTANCE);
    assert_eq!(i[1], MISS_INDEX);
}

#[test]
fn distance_scales_with_direction_length() {
    let (ctx, _probe) = context();
    let mesh = Mesh::triangle(ctx.backend());
    let accel = ctx.build(&mesh.buffers()).unwrap();

    let rays = Rays::upload(ctx.backend(), &[([0.25, 0.25, 3.0], [0.0, 0.0, -2.0])]);
    accel.trace(&rays.buffers(f32::MAX)).unwrap();
    assert_close(rays.results().0[0], 1.5);
}

#[test]
fn max_distance_bounds_hits() {
    let (ctx, _probe) = context();
    let mesh = Mesh::triangle(ctx.backend());
    let accel = ctx.build(&mesh.buffers()).unwrap();
    let rays = Rays::upload(ctx.backend(), &[([0.25, 0.25, 5.0], DOWN)]);

    accel.trace(&rays.buffers(4.0)).unwrap();
    assert_eq!(rays.results().1, [MISS_INDEX]);

    accel.trace(&rays.buffers(5.0)).unwrap();
    assert_eq!(rays.results().1, [0]);
}

#[test]
fn hits_behind_origin_are_ignored() {
    let (ctx, _probe) = context();
    let mesh = Mesh::triangle(ctx.backend());
    let accel = ctx.build(&mesh.buffers()).unwrap();

    let rays = Rays::upload(ctx.backend(), &[([0.25, 0.25, 1.0], [0.0, 0.0, 1.0])]);
    accel.trace(&rays.buffers(f32::MAX)).unwrap();
    assert_eq!(rays.results(), (vec![MISS_DISTANCE], vec![MISS_INDEX]));
}

#[test]
fn closest_of_overlapping_triangles() {
    let (ctx, _probe) = context();
    let layer = |z: f32| UNIT_TRIANGLE.map(|[x, y, _]| [x, y, z]);
    let vertices: Vec<[f32; 3]> = [layer(-3.0), layer(-1.0), layer(-2.0)].concat();
    let mesh = Mesh::upload(ctx.backend(), &vertices, &[[0, 1, 2], [3, 4, 5], [6, 7, 8]]);
    let accel = ctx.build(&mesh.buffers()).unwrap();

    let rays = Rays::upload(ctx.backend(), &[([0.1, 0.1, 0.0], DOWN)]);
    accel.trace(&rays.buffers(f32::MAX)).unwrap();
    let (t, i) = rays.results();
    assert_close(t[0], 1.0);
    assert_eq!(i[0], 1);
}

#[test]
fn zero_rays_do_no_device_work() {
    let (ctx, probe) = context();
    let mesh = Mesh::triangle(ctx.backend());
    let accel = ctx.build(&mesh.buffers()).unwrap();
    let before = probe.stats();

    let empty = RayBuffers {
        origins: DevicePtr::NULL,
        directions: DevicePtr::NULL,
        out_distance: DevicePtr::NULL,
        out_index: DevicePtr::NULL,
        max_distance: f32::MAX,
        count: 0,
    };
    accel.trace(&empty).unwrap();

    let after = probe.stats();
    assert_eq!(after.launches, before.launches);
    assert_eq!(after.allocations, before.allocations);
}

#[test]
fn invalid_ray_arguments_are_rejected_before_launch() {
    let (ctx, probe) = context();
    let mesh = Mesh::triangle(ctx.backend());
    let accel = ctx.build(&mesh.buffers()).unwrap();
    let rays = Rays::upload(ctx.backend(), &[([0.25, 0.25, 1.0], DOWN)]);

    let mut null_output = rays.buffers(f32::MAX);
    null_output.out_distance = DevicePtr::NULL;
    assert_eq!(accel.trace(&null_output).unwrap_err().kind(), ErrorKind::InvalidArgument);

    let mut too_many = rays.buffers(f32::MAX);
    too_many.count = u32::MAX as u64 + 1;
    assert_eq!(accel.trace(&too_many).unwrap_err().kind(), ErrorKind::InvalidArgument);

    assert_eq!(accel.trace(&rays.buffers(f32::NAN)).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(probe.stats().launches, 0);
}

#[test]
fn invalid_mesh_arguments_are_rejected_before_build() {
    let (ctx, probe) = context();
    let mesh = Mesh::triangle(ctx.backend());

    let mut buffers = mesh.buffers();
    buffers.vertices = DevicePtr::NULL;
    assert_eq!(ctx.build(&buffers).unwrap_err().kind(), ErrorKind::InvalidArgument);

    let huge = MeshBuffers { triangle_count: 1 << 40, ..mesh.buffers() };
    assert_eq!(ctx.build(&huge).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(probe.stats().builds, 0);
}

#[test]
fn out_of_range_index_fails_the_build() {
    let (ctx, probe) = context();
    let mesh = Mesh::upload(ctx.backend(), &UNIT_TRIANGLE, &[[0, 1, 3]]);
    let before = probe.stats().live_allocations();

    assert_eq!(ctx.build(&mesh.buffers()).unwrap_err().kind(), ErrorKind::Execution);
    assert_eq!(probe.stats().live_allocations(), before);
    assert_eq!(ctx.live_accels(), 0);
}

#[test]
fn allocations_balance_across_build_trace_release() {
    let (ctx, probe) = context();
    let mesh = Mesh::triangle(ctx.backend());
    let rays = Rays::upload(ctx.backend(), &[([0.25, 0.25, 1.0], DOWN), ([0.9, 0.9, 1.0], DOWN)]);
    let baseline = probe.stats().live_allocations();

    let accel = ctx.build(&mesh.buffers()).unwrap();
    assert_eq!(probe.stats().live_allocations(), baseline + 1);

    for _ in 0..3 {
        accel.trace(&rays.buffers(f32::MAX)).unwrap();
        assert_eq!(probe.stats().live_allocations(), baseline + 1);
    }

    accel.release().unwrap();
    let stats = probe.stats();
    assert_eq!(stats.live_allocations(), baseline);
    assert_eq!(stats.launches, 3);
}

#[test]
fn injected_build_failures_leak_nothing() {
    let (ctx, probe) = context();
    let mesh = Mesh::triangle(ctx.backend());
    ctx.ensure_pipeline().unwrap();
    let baseline = probe.stats().live_allocations();

    let faults = [
        (HostOp::MemoryUsage, 0, ErrorKind::Execution),
        (HostOp::Alloc, 0, ErrorKind::DeviceMemory),
        (HostOp::Alloc, 1, ErrorKind::DeviceMemory),
        (HostOp::Build, 0, ErrorKind::Execution),
        (HostOp::Synchronize, 0, ErrorKind::Execution),
    ];
    for (op, skip, kind) in faults {
        probe.fail_after(op, skip);
        let err = ctx.build(&mesh.buffers()).unwrap_err();
        assert_eq!(err.kind(), kind, "{op:?}");
        assert_eq!(probe.stats().live_allocations(), baseline, "{op:?} leaked");
        assert_eq!(ctx.live_accels(), 0);
    }

    ctx.build(&mesh.buffers()).unwrap().release().unwrap();
}

#[test]
fn injected_trace_failures_leak_nothing() {
    let (ctx, probe) = context();
    let mesh = Mesh::triangle(ctx.backend());
    let rays = Rays::upload(ctx.backend(), &[([0.25, 0.25, 1.0], DOWN)]);
    let accel = ctx.build(&mesh.buffers()).unwrap();
    let baseline = probe.stats().live_allocations();

    let faults = [
        (HostOp::Alloc, 0, ErrorKind::DeviceMemory),
        (HostOp::CopyToDevice, 0, ErrorKind::DeviceMemory),
        (HostOp::Alloc, 1, ErrorKind::DeviceMemory),
        (HostOp::CopyToDevice, 1, ErrorKind::DeviceMemory),
        (HostOp::Launch, 0, ErrorKind::Execution),
        (HostOp::Synchronize, 0, ErrorKind::Execution),
    ];
    for (op, skip, kind) in faults {
        probe.fail_after(op, skip);
        let err = accel.trace(&rays.buffers(f32::MAX)).unwrap_err();
        assert_eq!(err.kind(), kind, "{op:?}");
        assert_eq!(probe.stats().live_allocations(), baseline, "{op:?} leaked");
    }

    // the structure survives failed traces
    accel.trace(&rays.buffers(f32::MAX)).unwrap();
    assert_eq!(rays.results().1, [0]);
}

#[test]
fn large_launch_writes_every_result() {
    const COUNT: usize = 1 << 20;
    let (ctx, _probe) = context();
    let mesh = Mesh::upload(ctx.backend(), &[[-1.0, -1.0, 0.0], [4.0, -1.0, 0.0], [-1.0, 4.0, 0.0]], &[[0, 1, 2]]);
    let accel = ctx.build(&mesh.buffers()).unwrap();

    let mut rng = rand::rng();
    let rays: Vec<_> = (0..COUNT)
        .map(|_| ([rng.random::<f32>(), rng.random::<f32>(), 2.0], DOWN))
        .collect();
    let rays = Rays::upload(ctx.backend(), &rays);
    accel.trace(&rays.buffers(f32::MAX)).unwrap();

    let (t, i) = rays.results();
    assert_eq!(t.len(), COUNT);
    assert!(i.iter().all(|&i| i == 0));
    assert!(t.iter().all(|&t| (t - 2.0).abs() < 1e-5));
}

#[test]
fn random_rays_pick_the_right_half_of_a_quad() {
    let (ctx, _probe) = context();
    let vertices = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]];
    let mesh = Mesh::upload(ctx.backend(), &vertices, &[[0, 1, 2], [0, 2, 3]]);
    let accel = ctx.build(&mesh.buffers()).unwrap();

    let mut rng = rand::rng();
    let origins: Vec<[f32; 3]> = (0..4096)
        .map(|_| [rng.random_range(-0.5f32..1.5), rng.random_range(-0.5f32..1.5), 1.0])
        // stay clear of the shared diagonal and the outer edges
        .filter(|&[x, y, _]| (x - y).abs() > 1e-3 && [x, y].iter().all(|c: &f32| c.abs() > 1e-3 && (c - 1.0).abs() > 1e-3))
        .collect();
    let rays = Rays::upload(ctx.backend(), &origins.iter().map(|&o| (o, DOWN)).collect::<Vec<_>>());
    accel.trace(&rays.buffers(f32::MAX)).unwrap();

    let (t, i) = rays.results();
    for (k, &[x, y, _]) in origins.iter().enumerate() {
        let inside = (0.0..=1.0).contains(&x) && (0.0..=1.0).contains(&y);
        let expected = match (inside, y < x) {
            (false, _) => MISS_INDEX,
            (true, true) => 0,
            (true, false) => 1,
        };
        assert_eq!(i[k], expected, "ray at ({x}, {y})");
        if inside {
            assert_close(t[k], 1.0);
        } else {
            assert_eq!(t[k], MISS_DISTANCE);
        }
    }
}

#[test]
fn concurrent_traces_are_serialized() {
    let (ctx, probe) = context();
    let mesh = Mesh::triangle(ctx.backend());
    let accel = ctx.build(&mesh.buffers()).unwrap();

    thread::scope(|s| {
        for n in 0..4 {
            let (ctx, accel) = (&ctx, &accel);
            s.spawn(move || {
                let x = 0.1 + 0.1 * n as f32;
                let rays = Rays::upload(ctx.backend(), &[([x, 0.1, 1.0 + n as f32], DOWN), ([-x, 0.1, 1.0], DOWN)]);
                for _ in 0..8 {
                    ctx.trace_rays(accel, &rays.buffers(f32::MAX)).unwrap();
                }
                let (t, i) = rays.results();
                assert_close(t[0], 1.0 + n as f32);
                assert_eq!(i, [0, MISS_INDEX]);
            });
        }
    });

    assert_eq!(probe.stats().launches, 32);
}
