#![cfg(not(target_arch = "wasm32"))]

//! Headless demo: generates random height-field meshes, renders a few frames
//! of an orbiting camera through the cluster filter and logs the statistics.
//!
//! Usage: `slop_cluster_cull [config.json]`

use std::backtrace::Backtrace;
use std::f32::consts::TAU;
use std::fs::File;
use std::io::Write;
use std::panic;

use anyhow::Context as _;
use glam::{Mat4, Vec3};
use log::{info, warn, LevelFilter};
use rand::{rngs::StdRng, SeedableRng};

use slop_cluster_cull::geometry::random_chunks;
use slop_cluster_cull::{DemoConfig, GeometryFilter, GpuBackend, RecordingBackend, WgpuBackend};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Spacing between instances on the ground grid.
const GRID_SPACING: f32 = 160.0;

fn main() -> anyhow::Result<()> {
    setup_cpu_math();
    setup_diagnostics();

    let config = match std::env::args().nth(1) {
        Some(path) => DemoConfig::load(&path).with_context(|| format!("loading demo config {path}"))?,
        None => DemoConfig::default(),
    };
    info!("Starting cluster cull demo: {:?}", config);

    let mut backend: Box<dyn GpuBackend> = match pollster::block_on(WgpuBackend::new(config.width, config.height)) {
        Ok(backend) => Box::new(backend),
        Err(err) => {
            warn!("GPU backend unavailable ({}), falling back to the recording backend", err);
            Box::new(RecordingBackend::default())
        }
    };
    info!("Backend capabilities: {:?}", backend.capabilities());

    let mut rng = StdRng::seed_from_u64(config.seed);
    let meshes = random_chunks(&mut rng, config.mesh_count, config.faces_per_mesh, config.face_variance);
    let vertex_counts: Vec<u32> = meshes.iter().map(|m| m.vertex_count()).collect();
    let face_counts: Vec<u32> = meshes.iter().map(|m| m.face_count()).collect();

    let mut filter = GeometryFilter::new(config.filter_desc())?;
    let handles = filter.register_meshes(backend.as_mut(), &vertex_counts, &face_counts);
    for (handle, mesh) in handles.iter().zip(&meshes) {
        filter.set_mesh_data(backend.as_mut(), *handle, &mesh.positions, &mesh.indices);
    }

    let placements = grid_placements(handles.len() * config.instances_per_mesh as usize);
    let aspect = config.width as f32 / config.height as f32;
    let projection = Mat4::perspective_rh(60f32.to_radians(), aspect, 1.0, 5000.0);
    let extent = placements.iter().map(|p| p.length()).fold(0.0, f32::max) + GRID_SPACING;

    for frame in 0..config.frames {
        let angle = frame as f32 / config.frames.max(1) as f32 * TAU;
        let eye = Vec3::new(angle.cos() * extent, angle.sin() * extent, extent * 0.5);
        let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Z);

        let mut recorder = filter.begin_render(
            backend.as_mut(),
            config.render,
            view,
            projection,
            config.width,
            config.height,
        );
        let mut placement = placements.iter();
        for handle in &handles {
            let worlds: Vec<Mat4> = placement
                .by_ref()
                .take(config.instances_per_mesh as usize)
                .map(|offset| Mat4::from_translation(*offset))
                .collect();
            recorder.render_mesh_instanced(*handle, &worlds);
        }

        match recorder.end_render() {
            Some(stats) => info!(
                "Frame {}: triangles {}/{} rendered ({} culled), clusters {}/{} rendered ({} culled)",
                frame,
                stats.triangles_rendered,
                stats.triangles_processed,
                stats.triangles_culled,
                stats.clusters_rendered,
                stats.clusters_processed,
                stats.clusters_culled
            ),
            None => info!("Frame {} submitted", frame),
        }
    }

    info!("Done after {} frames", config.frames);
    Ok(())
}

/// Square grid of instance origins in the XY plane, centred on the origin.
fn grid_placements(count: usize) -> Vec<Vec3> {
    let side = (count as f32).sqrt().ceil().max(1.0) as usize;
    let half = (side as f32 - 1.0) * 0.5;
    (0..count)
        .map(|i| {
            let (x, y) = ((i % side) as f32 - half, (i / side) as f32 - half);
            Vec3::new(x * GRID_SPACING, y * GRID_SPACING, 0.0)
        })
        .collect()
}

/// Flush-To-Zero (FTZ) and Denormals-Are-Zero (DAZ) for the CPU-side cone math.
fn setup_cpu_math() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        let mut mxcsr: u32 = 0;
        std::arch::asm!("stmxcsr [{}]", in(reg) &mut mxcsr);
        mxcsr |= (1 << 15) | (1 << 6);
        std::arch::asm!("ldmxcsr [{}]", in(reg) &mxcsr);
    }
}

/// Logger plus a panic hook that writes a crash report next to the binary.
fn setup_diagnostics() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();

        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };

        let location = panic_info.location().map_or("Unknown location".to_string(), |loc| {
            format!("{}:{}", loc.file(), loc.line())
        });

        let crash_msg = format!(
            "=== CLUSTER CULL CRASH ===\nReason: {}\nLocation: {}\n\nStack Trace:\n{}",
            msg, location, backtrace
        );

        eprintln!("\x1b[31;1m{}\x1b[0m", crash_msg);

        if let Ok(mut file) = File::create("cluster_cull_crash.log") {
            let _ = file.write_all(crash_msg.as_bytes());
            eprintln!("Crash report saved to cluster_cull_crash.log");
        }
    }));
}
