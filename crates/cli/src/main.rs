use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meshtrace::{Backend, DeviceBuffer, HostBackend, LogLevel, MeshBuffers, RayBuffers, TraceConfig, TraceContext};

mod mesh;
use mesh::Mesh;

#[derive(Debug, clap::Parser)]
struct CommandLineArguments {
    #[arg(long, value_enum, default_value_t = BackendKind::Host, help = "Device backend")]
    backend: BackendKind,

    #[arg(long, help = "Library log level, 0 (off) to 4 (everything)")]
    log_level: Option<i32>,
    #[arg(long, help = "CUDA device ordinal")]
    device: Option<u32>,
    #[arg(long, help = "JSON file with trace settings; flags override it")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum BackendKind {
    #[default]
    Host,
    Optix,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    #[command(about = "Trace a batch of rays against a triangle mesh")]
    Trace {
        #[arg(long, help = "Triangulated OBJ mesh")]
        mesh: PathBuf,
        #[arg(long, help = "JSON array of {origin, direction} rays")]
        rays: PathBuf,
        #[arg(long, default_value_t = f32::MAX, help = "Ignore hits farther than this")]
        max_distance: f32,
        #[arg(short, long, help = "Write results here instead of stdout")]
        output: Option<PathBuf>,
    },
    #[command(about = "Trace a known hit and a known miss against one triangle")]
    Selftest,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct RayRecord {
    origin: [f32; 3],
    direction: [f32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct HitRecord {
    distance: f32,
    index: i32,
}

fn load_rays(path: &Path) -> Result<Vec<RayRecord>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file)).with_context(|| format!("failed to parse rays from {}", path.display()))
}

fn write_hits(hits: &[HitRecord], output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, hits)?;
            writer.flush()?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            serde_json::to_writer(&mut lock, hits)?;
            writeln!(lock)?;
        }
    }
    Ok(())
}

/// Upload, build, trace and read back. Every device buffer is freed before
/// returning, and the context is shut down explicitly so teardown errors
/// surface.
fn trace_mesh<B: Backend>(backend: B, config: TraceConfig, mesh: &Mesh, rays: &[RayRecord], max_distance: f32) -> Result<Vec<HitRecord>> {
    if mesh.triangles.is_empty() {
        bail!("mesh has no triangles");
    }

    let ctx = TraceContext::new(backend, config);
    let hits = {
        let backend = ctx.backend();
        let t = Instant::now();
        ctx.ensure_pipeline().context("failed to set up the ray-tracing pipeline")?;
        info!("pipeline setup: {:.2}s", t.elapsed().as_secs_f64());

        let vertices = DeviceBuffer::from_slice(backend, &mesh.vertices)?;
        let indices = DeviceBuffer::from_slice(backend, &mesh.triangles)?;
        let t = Instant::now();
        let accel = ctx
            .build(&MeshBuffers {
                vertices: vertices.ptr(),
                indices: indices.ptr(),
                vertex_count: mesh.vertices.len() as u64,
                triangle_count: mesh.triangles.len() as u64,
            })
            .context("failed to build the acceleration structure")?;
        info!(triangles = mesh.triangles.len(), "build: {:.2}s", t.elapsed().as_secs_f64());

        // the structure no longer needs the mesh
        vertices.free()?;
        indices.free()?;

        if rays.is_empty() {
            warn!("no rays to trace");
            accel.release()?;
            Vec::new()
        } else {
            let origins: Vec<[f32; 3]> = rays.iter().map(|r| r.origin).collect();
            let directions: Vec<[f32; 3]> = rays.iter().map(|r| r.direction).collect();
            let origins = DeviceBuffer::from_slice(backend, &origins)?;
            let directions = DeviceBuffer::from_slice(backend, &directions)?;
            let distances = DeviceBuffer::alloc(backend, rays.len() * size_of::<f32>())?;
            let indices = DeviceBuffer::alloc(backend, rays.len() * size_of::<i32>())?;

            let t = Instant::now();
            accel
                .trace(&RayBuffers {
                    origins: origins.ptr(),
                    directions: directions.ptr(),
                    out_distance: distances.ptr(),
                    out_index: indices.ptr(),
                    max_distance,
                    count: rays.len() as u64,
                })
                .context("failed to trace rays")?;
            info!(rays = rays.len(), "trace: {:.3}s", t.elapsed().as_secs_f64());

            let distances = distances.to_vec::<f32>()?;
            let indices = indices.to_vec::<i32>()?;
            accel.release()?;

            distances
                .into_iter()
                .zip(indices)
                .map(|(distance, index)| HitRecord { distance, index })
                .collect()
        }
    };

    ctx.shutdown().context("failed to shut down the device context")?;
    Ok(hits)
}

fn selftest<B: Backend>(backend: B, config: TraceConfig) -> Result<()> {
    let mesh = Mesh {
        vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        triangles: vec![[0, 1, 2]],
    };
    let rays = [
        RayRecord { origin: [0.25, 0.25, 1.0], direction: [0.0, 0.0, -1.0] },
        RayRecord { origin: [2.0, 2.0, 1.0], direction: [0.0, 0.0, -1.0] },
    ];

    let hits = trace_mesh(backend, config, &mesh, &rays, f32::MAX)?;
    let expected = [HitRecord { distance: 1.0, index: 0 }, HitRecord { distance: -1.0, index: -1 }];

    let hit_ok = (hits[0].distance - expected[0].distance).abs() < 1e-4 && hits[0].index == expected[0].index;
    if !hit_ok || hits[1] != expected[1] {
        bail!("selftest failed: expected {expected:?}, got {hits:?}");
    }
    info!("selftest passed");
    Ok(())
}

fn run<B: Backend>(backend: B, config: TraceConfig, command: &Command) -> Result<()> {
    match command {
        Command::Trace { mesh, rays, max_distance, output } => {
            let mesh = Mesh::from_file(mesh)?;
            let rays = load_rays(rays)?;
            info!(vertices = mesh.vertices.len(), triangles = mesh.triangles.len(), rays = rays.len(), "inputs loaded");

            let hits = trace_mesh(backend, config, &mesh, &rays, *max_distance)?;
            write_hits(&hits, output.as_deref())
        }
        Command::Selftest => selftest(backend, config),
    }
}

fn load_config(cli_args: &CommandLineArguments) -> Result<TraceConfig> {
    let mut config = match &cli_args.config {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
            serde_json::from_reader(BufReader::new(file)).with_context(|| format!("invalid config {}", path.display()))?
        }
        None => TraceConfig::default(),
    };

    // override file / default settings
    if let Some(level) = cli_args.log_level {
        config = config.with_log_level(LogLevel::new(level)?);
    }
    if let Some(device) = cli_args.device {
        config = config.with_device_ordinal(device);
    }
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli_args = CommandLineArguments::parse();
    let config = load_config(&cli_args)?;

    match cli_args.backend {
        BackendKind::Host => run(HostBackend::new(), config, &cli_args.command),
        BackendKind::Optix => {
            #[cfg(feature = "optix")]
            {
                run(meshtrace::OptixBackend::new(config.device_ordinal), config, &cli_args.command)
            }
            #[cfg(not(feature = "optix"))]
            {
                bail!("OptiX backend not compiled (enable the 'optix' feature)")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Mesh {
        Mesh {
            vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            triangles: vec![[0, 1, 2]],
        }
    }

    #[test]
    fn json_rays_to_json_hits() {
        let rays: Vec<RayRecord> = serde_json::from_str(
            r#"[
                {"origin": [0.25, 0.25, 1.0], "direction": [0.0, 0.0, -1.0]},
                {"origin": [2.0, 2.0, 1.0], "direction": [0.0, 0.0, -1.0]}
            ]"#,
        )
        .unwrap();

        let hits = trace_mesh(HostBackend::new(), TraceConfig::default(), &triangle(), &rays, f32::MAX).unwrap();
        assert_eq!(
            serde_json::to_string(&hits).unwrap(),
            r#"[{"distance":1.0,"index":0},{"distance":-1.0,"index":-1}]"#
        );
    }

    #[test]
    fn max_distance_is_passed_through() {
        let rays = [RayRecord { origin: [0.25, 0.25, 3.0], direction: [0.0, 0.0, -1.0] }];
        let hits = trace_mesh(HostBackend::new(), TraceConfig::default(), &triangle(), &rays, 2.0).unwrap();
        assert_eq!(hits, [HitRecord { distance: -1.0, index: -1 }]);
    }

    #[test]
    fn no_rays_gives_no_hits() {
        let hits = trace_mesh(HostBackend::new(), TraceConfig::default(), &triangle(), &[], f32::MAX).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn empty_mesh_is_refused() {
        let err = trace_mesh(HostBackend::new(), TraceConfig::default(), &Mesh::default(), &[], f32::MAX).unwrap_err();
        assert!(err.to_string().contains("no triangles"));
    }

    #[test]
    fn selftest_passes_on_the_host_backend() {
        selftest(HostBackend::new(), TraceConfig::default()).unwrap();
    }
}
