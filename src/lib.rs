// src/lib.rs
//! GPU-driven cluster culling for static meshes.
//!
//! Meshes are split into clusters of [`BATCH_SIZE`] triangles with a bounding
//! cone each. At render time draw requests are greedily packed into
//! fixed-capacity small batch chunks; each chunk is filtered by a compute
//! kernel and drawn with indirect draws.
//!
//! ```no_run
//! use glam::Mat4;
//! use slop_cluster_cull::{FilterDesc, GeometryFilter, RecordingBackend, RenderOptions};
//!
//! let mut backend = RecordingBackend::new(Default::default());
//! let mut filter = GeometryFilter::new(FilterDesc::default()).unwrap();
//! let meshes = filter.register_meshes(&mut backend, &[4], &[2]);
//! filter.set_mesh_data(
//!     &mut backend,
//!     meshes[0],
//!     &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
//!     &[0, 1, 2, 0, 2, 3],
//! );
//!
//! let mut frame = filter.begin_render(&mut backend, RenderOptions::default(), Mat4::IDENTITY, Mat4::IDENTITY, 64, 64);
//! frame.render_mesh(meshes[0], Mat4::IDENTITY);
//! frame.end_render();
//! ```

pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod gpu;
pub mod mesh_registry;
pub mod small_batch;

/// Triangles per cluster (and per small batch).
pub const BATCH_SIZE: u32 = 256;

pub use cluster::Cluster;
pub use config::{DemoConfig, FilterDesc, FilterFlags, RenderOptions};
pub use context::{Context, OptionContext};
pub use error::{Error, Result};
pub use filter::{FilterStatistics, FrameRecorder, GeometryFilter};
pub use gpu::recording::RecordingBackend;
pub use gpu::wgpu_backend::WgpuBackend;
pub use gpu::{BackendCapabilities, GpuBackend};
pub use mesh_registry::MeshHandle;
