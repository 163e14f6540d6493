// src/filter.rs
//! # Geometry filter (frame orchestrator)
//!
//! Owns the mesh registry and a fixed pool of [`SmallBatchChunk`]s. A frame is
//! recorded through a [`FrameRecorder`]:
//!
//! ```text
//! begin_render ──▶ render_mesh / render_mesh_instanced ──▶ end_render
//! ```
//!
//! With filtering enabled, instances are queued as draw requests and packed
//! into chunks at `end_render`; chunks are flushed round-robin whenever one
//! fills up. With filtering disabled every instance is drawn directly, one
//! draw call per instance.
//!
//! When statistics are requested the filter waits on a pipeline statistics
//! query after every submission. That stalls the CPU and is only meant for
//! diagnostics.

use glam::{Mat4, Vec3};
use log::{debug, info, warn};

use crate::config::{FilterDesc, FilterFlags, RenderOptions};
use crate::error::Result;
use crate::gpu::{
    byte_size, BufferDesc, BufferId, BufferUsage, DrawCallArguments, DrawState, FrameConstants,
    GpuBackend,
};
use crate::mesh_registry::{Mesh, MeshBuffers, MeshHandle, MeshRegistry, INDEX_STRIDE, VERTEX_STRIDE};
use crate::small_batch::{AddOutcome, ChunkResources, DrawRequest, SmallBatchChunk};

/// Per-frame counters. Reset at every `begin_render`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterStatistics {
    pub triangles_processed: i64,
    pub triangles_rendered: i64,
    pub triangles_culled: i64,
    pub clusters_processed: i64,
    pub clusters_rendered: i64,
    pub clusters_culled: i64,
}

impl FilterStatistics {
    fn add_triangles(&mut self, processed: u64, rendered: u64) {
        self.triangles_processed += processed as i64;
        self.triangles_rendered += rendered as i64;
        self.triangles_culled += processed as i64 - rendered as i64;
    }
}

/// State shared by all submissions of one frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameContext {
    pub view: Mat4,
    pub projection: Mat4,
    /// World-space eye position.
    pub eye: Vec3,
    pub width: u32,
    pub height: u32,
    pub filters: FilterFlags,
    /// `Some` when statistics are collected.
    pub statistics: Option<FilterStatistics>,
}

/// Buffers of the unfiltered path.
#[derive(Clone, Copy, Debug)]
struct DirectResources {
    draw_calls: BufferId,
    draw_ids: BufferId,
    max_draw_calls: u32,
}

#[derive(Clone, Copy, Debug)]
struct FrameResources {
    frame_constants: BufferId,
    direct: DirectResources,
}

pub struct GeometryFilter {
    desc: FilterDesc,
    registry: MeshRegistry,
    chunks: Vec<SmallBatchChunk>,
    resources: Option<FrameResources>,
    queue: Vec<DrawRequest>,
    statistics_warned: bool,
}

impl GeometryFilter {
    pub fn new(desc: FilterDesc) -> Result<Self> {
        desc.validate()?;
        Ok(Self {
            desc,
            registry: MeshRegistry::new(),
            chunks: Vec::new(),
            resources: None,
            queue: Vec::new(),
            statistics_warned: false,
        })
    }

    #[inline]
    pub fn desc(&self) -> &FilterDesc {
        &self.desc
    }

    /// Register every mesh up front and create all GPU resources.
    ///
    /// Must be called exactly once, before any other method.
    pub fn register_meshes<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        vertex_counts: &[u32],
        face_counts: &[u32],
    ) -> Vec<MeshHandle> {
        let handles = self.registry.allocate(backend, vertex_counts, face_counts);

        let frame_constants = backend.create_buffer(
            &BufferDesc {
                label: "frame constants",
                size: byte_size::<FrameConstants>(1),
                usage: BufferUsage::UNIFORM | BufferUsage::UPLOAD,
            },
            None,
        );

        let max_draw_calls = self
            .desc
            .maximum_draw_call_count
            .unwrap_or(handles.len() as u32)
            .max(1);
        let draw_ids: Vec<u32> = (0..max_draw_calls).collect();
        let direct = DirectResources {
            draw_calls: backend.create_buffer(
                &BufferDesc {
                    label: "direct draw call arguments",
                    size: byte_size::<DrawCallArguments>(max_draw_calls as usize),
                    usage: BufferUsage::STRUCTURED | BufferUsage::UPLOAD,
                },
                None,
            ),
            draw_ids: backend.create_buffer(
                &BufferDesc {
                    label: "direct draw id stream",
                    size: byte_size::<u32>(draw_ids.len()),
                    usage: BufferUsage::VERTEX,
                },
                Some(bytemuck::cast_slice(&draw_ids)),
            ),
            max_draw_calls,
        };

        let caps = backend.capabilities();
        let use_multi_draw = caps.multi_draw_indirect
            && caps.indirect_first_instance
            && !self.desc.emulate_multi_indirect_draw;
        if caps.multi_draw_indirect && self.desc.emulate_multi_indirect_draw {
            info!("Multi-draw-indirect available but emulation requested");
        } else if !use_multi_draw {
            info!("Multi-draw-indirect unavailable, issuing one indirect draw per slot");
        }

        self.chunks = (0..self.desc.chunk_count)
            .map(|_| SmallBatchChunk::new(&mut *backend, self.desc.batch_count, use_multi_draw))
            .collect();
        self.resources = Some(FrameResources { frame_constants, direct });

        info!(
            "Geometry filter ready: {} chunks x {} batches, {} direct draw slots",
            self.chunks.len(),
            self.desc.batch_count,
            max_draw_calls
        );

        handles
    }

    pub fn set_mesh_data<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        handle: MeshHandle,
        positions: &[[f32; 3]],
        indices: &[u32],
    ) {
        self.registry.set_data(backend, handle, positions, indices);
    }

    /// Shared buffers and byte offsets of one mesh.
    pub fn buffers_for_mesh(&self, handle: MeshHandle) -> MeshBuffers {
        self.registry.buffers_for_mesh(handle)
    }

    /// Index count of one mesh.
    pub fn mesh_info(&self, handle: MeshHandle) -> u32 {
        self.registry.index_count(handle)
    }

    pub fn mesh(&self, handle: MeshHandle) -> &Mesh {
        self.registry.get_mesh(handle)
    }

    pub fn registry(&self) -> &MeshRegistry {
        &self.registry
    }

    /// Start recording a frame. Statistics, when requested, cover exactly this
    /// frame.
    #[must_use = "the frame is only submitted by FrameRecorder::end_render"]
    pub fn begin_render<'a, B: GpuBackend + ?Sized>(
        &'a mut self,
        backend: &'a mut B,
        options: RenderOptions,
        view: Mat4,
        projection: Mat4,
        width: u32,
        height: u32,
    ) -> FrameRecorder<'a, B> {
        let resources = self.resources.expect("begin_render called before register_meshes");
        let storage = self
            .registry
            .storage()
            .expect("begin_render called before register_meshes");

        let frame = FrameContext {
            view,
            projection,
            eye: view.inverse().w_axis.truncate(),
            width,
            height,
            filters: options.enabled_filters,
            statistics: options.collect_statistics.then(FilterStatistics::default),
        };

        let constants = FrameConstants {
            view,
            projection,
            cull_flags: options.enabled_filters.bits(),
            width,
            height,
            _pad: 0,
        };
        backend.write_buffer(resources.frame_constants, 0, bytemuck::bytes_of(&constants));

        self.queue.clear();

        if !options.enable_filtering {
            backend.set_draw_state(&DrawState {
                index_buffer: storage.indices,
                positions: storage.vertices,
                position_offset: 0,
                draw_ids: resources.direct.draw_ids,
                draw_arguments: resources.direct.draw_calls,
                frame_constants: resources.frame_constants,
            });
            if options.collect_statistics && backend.capabilities().pipeline_statistics {
                backend.begin_query();
            }
        }

        FrameRecorder {
            filter: self,
            backend,
            options,
            frame,
            resources,
            current_draw_call: 0,
            direct_triangles: 0,
        }
    }
}

/// Records one frame. Created by [`GeometryFilter::begin_render`], submitted
/// by [`FrameRecorder::end_render`].
#[must_use = "call end_render to submit the frame"]
pub struct FrameRecorder<'a, B: GpuBackend + ?Sized> {
    filter: &'a mut GeometryFilter,
    backend: &'a mut B,
    options: RenderOptions,
    frame: FrameContext,
    resources: FrameResources,
    current_draw_call: u32,
    direct_triangles: u64,
}

impl<'a, B: GpuBackend + ?Sized> FrameRecorder<'a, B> {
    #[inline]
    pub fn frame(&self) -> &FrameContext {
        &self.frame
    }

    pub fn render_mesh(&mut self, handle: MeshHandle, world: Mat4) {
        self.render_mesh_instanced(handle, &[world]);
    }

    /// One draw request per world matrix.
    pub fn render_mesh_instanced(&mut self, handle: MeshHandle, worlds: &[Mat4]) {
        debug_assert!(self.filter.registry.contains(handle), "unknown mesh {:?}", handle);

        for world in worlds {
            let arguments = DrawCallArguments {
                world: *world,
                world_view: self.frame.view * *world,
                mesh_index: handle.0,
                _pad: [0; 3],
            };

            if self.options.enable_filtering {
                self.filter
                    .queue
                    .push(DrawRequest::new(handle, arguments, self.current_draw_call));
            } else {
                self.draw_direct(handle, &arguments);
            }

            self.current_draw_call += 1;
        }
    }

    fn draw_direct(&mut self, handle: MeshHandle, arguments: &DrawCallArguments) {
        let direct = self.resources.direct;
        let slot = self.current_draw_call;

        debug_assert!(
            slot < direct.max_draw_calls,
            "more than {} unfiltered draw calls in one frame",
            direct.max_draw_calls
        );
        if slot >= direct.max_draw_calls {
            if slot == direct.max_draw_calls {
                warn!(
                    "Unfiltered draw call limit of {} reached, dropping further draws this frame",
                    direct.max_draw_calls
                );
            }
            return;
        }

        let mesh = self.filter.registry.get_mesh(handle);
        let (index_count, first_index, base_vertex) = (
            mesh.index_count,
            (mesh.index_offset / INDEX_STRIDE) as u32,
            (mesh.vertex_offset / VERTEX_STRIDE) as i32,
        );

        self.backend.write_buffer(
            direct.draw_calls,
            byte_size::<DrawCallArguments>(slot as usize),
            bytemuck::bytes_of(arguments),
        );
        self.backend.draw_indexed(index_count, first_index, base_vertex, slot);
        self.direct_triangles += u64::from(index_count / 3);
    }

    /// Submit the frame. Returns the statistics when they were requested.
    pub fn end_render(mut self) -> Option<FilterStatistics> {
        if self.options.enable_filtering {
            self.render_chunked();
        } else if let Some(stats) = self.frame.statistics.as_mut() {
            let rendered = if self.backend.capabilities().pipeline_statistics {
                self.backend.end_query();
                wait_for_query(&mut *self.backend)
            } else {
                warn_missing_statistics(&mut self.filter.statistics_warned);
                self.direct_triangles
            };
            stats.add_triangles(self.direct_triangles, rendered);
        }

        self.backend.flush();

        if let Some(stats) = &self.frame.statistics {
            debug!(
                "Frame: {} / {} triangles rendered, {} / {} clusters rendered",
                stats.triangles_rendered,
                stats.triangles_processed,
                stats.clusters_rendered,
                stats.clusters_processed
            );
        }

        self.frame.statistics
    }

    fn render_chunked(&mut self) {
        let filter = &mut *self.filter;
        if filter.queue.is_empty() {
            return;
        }

        let resources = ChunkResources {
            storage: filter
                .registry
                .storage()
                .expect("begin_render called before register_meshes"),
            frame_constants: self.resources.frame_constants,
        };
        let query_supported = self.backend.capabilities().pipeline_statistics;

        let mut current = 0;
        for &request in &filter.queue {
            let mesh = filter.registry.get_mesh(request.mesh);
            let mut pending = request;

            loop {
                match filter.chunks[current].add_request(pending, mesh, &mut self.frame) {
                    AddOutcome::Consumed => break,
                    AddOutcome::Split(rest) | AddOutcome::Full(rest) => {
                        flush_chunk(
                            &mut filter.chunks[current],
                            &mut *self.backend,
                            &resources,
                            self.frame.statistics.as_mut(),
                            query_supported,
                            &mut filter.statistics_warned,
                        );
                        pending = rest;
                        current = (current + 1) % filter.chunks.len();
                    }
                }
            }
        }

        flush_chunk(
            &mut filter.chunks[current],
            &mut *self.backend,
            &resources,
            self.frame.statistics.as_mut(),
            query_supported,
            &mut filter.statistics_warned,
        );
    }
}

/// Render one chunk, wrapped in a statistics query when requested.
fn flush_chunk<B: GpuBackend + ?Sized>(
    chunk: &mut SmallBatchChunk,
    backend: &mut B,
    resources: &ChunkResources,
    statistics: Option<&mut FilterStatistics>,
    query_supported: bool,
    statistics_warned: &mut bool,
) {
    let faces = u64::from(chunk.face_count());

    let Some(stats) = statistics.filter(|_| !chunk.is_empty()) else {
        chunk.render(backend, resources);
        return;
    };

    if query_supported {
        backend.begin_query();
        chunk.render(backend, resources);
        backend.end_query();
        let rendered = wait_for_query(backend);
        stats.add_triangles(faces, rendered);
    } else {
        chunk.render(backend, resources);
        warn_missing_statistics(statistics_warned);
        stats.add_triangles(faces, faces);
    }
}

/// Spin until the last query resolves.
fn wait_for_query<B: GpuBackend + ?Sized>(backend: &mut B) -> u64 {
    loop {
        if let Some(stats) = backend.poll_query() {
            return stats.primitives;
        }
        std::thread::yield_now();
    }
}

fn warn_missing_statistics(warned: &mut bool) {
    if !*warned {
        warn!("Backend has no pipeline statistics, reporting all processed triangles as rendered");
        *warned = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DemoConfig;
    use crate::geometry::height_field;
    use crate::gpu::recording::{Command, RecordingBackend};
    use crate::gpu::{BackendCapabilities, Kernel};
    use crate::BATCH_SIZE;

    const EYE: Vec3 = Vec3::new(0.0, 0.0, 50.0);

    /// Flat fields facing +Z, seen from above by [`view`].
    fn setup(backend: &mut RecordingBackend, desc: FilterDesc, face_counts: &[u32]) -> (GeometryFilter, Vec<MeshHandle>) {
        let meshes: Vec<_> = face_counts.iter().map(|&f| height_field(f, 0.0)).collect();
        let vertex_counts: Vec<u32> = meshes.iter().map(|m| m.vertex_count()).collect();
        let mut filter = GeometryFilter::new(desc).unwrap();
        let handles = filter.register_meshes(backend, &vertex_counts, face_counts);
        for (handle, mesh) in handles.iter().zip(&meshes) {
            filter.set_mesh_data(backend, *handle, &mesh.positions, &mesh.indices);
        }
        (filter, handles)
    }

    fn view() -> Mat4 {
        Mat4::look_at_rh(EYE, Vec3::ZERO, Vec3::Y)
    }

    fn options(enable_filtering: bool, enabled_filters: FilterFlags) -> RenderOptions {
        RenderOptions { enable_filtering, enabled_filters, collect_statistics: true }
    }

    fn worlds(count: usize) -> Vec<Mat4> {
        (0..count)
            .map(|i| Mat4::from_translation(Vec3::new(i as f32 * 3.0, 0.0, 0.0)))
            .collect()
    }

    fn render(
        filter: &mut GeometryFilter,
        backend: &mut RecordingBackend,
        options: RenderOptions,
        handles: &[MeshHandle],
        instances: &[Mat4],
    ) -> FilterStatistics {
        let mut frame = filter.begin_render(backend, options, view(), Mat4::IDENTITY, 640, 480);
        for &handle in handles {
            frame.render_mesh_instanced(handle, instances);
        }
        frame.end_render().unwrap()
    }

    #[test]
    fn eye_is_recovered_from_the_view_matrix() {
        let mut backend = RecordingBackend::default();
        let (mut filter, _) = setup(&mut backend, FilterDesc::default(), &[32]);
        let frame = filter.begin_render(&mut backend, RenderOptions::default(), view(), Mat4::IDENTITY, 8, 8);
        assert!((frame.frame().eye - EYE).length() < 1e-4);
        assert_eq!(frame.end_render(), None);
    }

    #[test]
    fn empty_frame_issues_no_gpu_work() {
        let mut backend = RecordingBackend::default();
        let (mut filter, _) = setup(&mut backend, FilterDesc::default(), &[600]);
        backend.clear_commands();

        let stats = render(&mut filter, &mut backend, options(true, FilterFlags::all()), &[], &[]);

        assert_eq!(stats, FilterStatistics::default());
        assert!(!backend
            .commands()
            .iter()
            .any(|c| matches!(c, Command::Dispatch { .. } | Command::BeginQuery)));
    }

    #[test]
    fn statistics_balance_after_every_frame() {
        let mut backend = RecordingBackend::default();
        let desc = FilterDesc { batch_count: 8, chunk_count: 3, ..FilterDesc::default() };
        let (mut filter, handles) = setup(&mut backend, desc, &[600, 2000, 64]);

        for filters in [FilterFlags::all(), FilterFlags::empty()] {
            let stats = render(&mut filter, &mut backend, options(true, filters), &handles, &worlds(4));
            assert_eq!(stats.triangles_processed, stats.triangles_rendered + stats.triangles_culled);
            assert_eq!(stats.clusters_processed, stats.clusters_rendered + stats.clusters_culled);
            assert_eq!(stats.clusters_processed, 4 * (3 + 8 + 1));
        }
    }

    #[test]
    fn unfiltered_path_matches_filtering_without_cull_bits() {
        let face_counts = [600, 2000, 64];
        let total_faces: i64 = face_counts.iter().map(|&f| i64::from(f)).sum();
        let desc = FilterDesc {
            maximum_draw_call_count: Some(64),
            batch_count: 16,
            ..FilterDesc::default()
        };

        let mut backend = RecordingBackend::default();
        let (mut filter, handles) = setup(&mut backend, desc.clone(), &face_counts);
        let direct = render(&mut filter, &mut backend, options(false, FilterFlags::empty()), &handles, &worlds(5));

        let mut backend = RecordingBackend::default();
        let (mut filter, handles) = setup(&mut backend, desc, &face_counts);
        let filtered = render(&mut filter, &mut backend, options(true, FilterFlags::empty()), &handles, &worlds(5));

        assert_eq!(direct.triangles_processed, 5 * total_faces);
        assert_eq!(direct.triangles_rendered, filtered.triangles_rendered);
        assert_eq!(direct.triangles_processed, filtered.triangles_processed);
        assert_eq!(filtered.triangles_culled, 0);
        assert_eq!(direct.clusters_processed, 0);
    }

    #[test]
    fn demo_scene_draws_every_instance_without_filtering() {
        let config = DemoConfig::from_json(
            r#"{ "mesh_count": 2, "faces_per_mesh": 64, "face_variance": 0, "instances_per_mesh": 4,
                 "render": { "enable_filtering": false } }"#,
        )
        .unwrap();
        let faces = vec![config.faces_per_mesh; config.mesh_count as usize];
        let instances = worlds(config.instances_per_mesh as usize);
        let expected = i64::from(config.draw_count() * config.faces_per_mesh);

        let mut backend = RecordingBackend::default();
        let (mut filter, handles) = setup(&mut backend, config.filter_desc(), &faces);
        let direct = render(&mut filter, &mut backend, options(false, FilterFlags::empty()), &handles, &instances);
        let draws = backend.commands().iter().filter(|c| matches!(c, Command::DrawIndexed { .. })).count();

        let mut backend = RecordingBackend::default();
        let (mut filter, handles) = setup(&mut backend, config.filter_desc(), &faces);
        let filtered = render(&mut filter, &mut backend, options(true, FilterFlags::empty()), &handles, &instances);

        assert_eq!(draws, 8);
        assert_eq!(direct.triangles_processed, expected);
        assert_eq!(direct.triangles_rendered, expected);
        assert_eq!(filtered.triangles_rendered, direct.triangles_rendered);
    }

    #[test]
    fn unfiltered_draws_use_mesh_offsets_and_slots() {
        let mut backend = RecordingBackend::default();
        let desc = FilterDesc { maximum_draw_call_count: Some(8), ..FilterDesc::default() };
        let (mut filter, handles) = setup(&mut backend, desc, &[32, 64]);
        let second = filter.mesh(handles[1]).clone();
        backend.clear_commands();

        let mut frame = filter.begin_render(&mut backend, options(false, FilterFlags::all()), view(), Mat4::IDENTITY, 8, 8);
        frame.render_mesh(handles[0], Mat4::IDENTITY);
        frame.render_mesh_instanced(handles[1], &worlds(2));
        frame.end_render();

        let draws: Vec<_> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::DrawIndexed { index_count, first_index, base_vertex, draw_id } => {
                    Some((*index_count, *first_index, *base_vertex, *draw_id))
                }
                _ => None,
            })
            .collect();
        let first_index = (second.index_offset / 4) as u32;
        let base_vertex = (second.vertex_offset / 12) as i32;
        assert_eq!(
            draws,
            [(96, 0, 0, 0), (192, first_index, base_vertex, 1), (192, first_index, base_vertex, 2)]
        );
    }

    #[test]
    fn multi_draw_and_fallback_render_the_same_triangles() {
        let face_counts = [600, 2000];
        let mut results = Vec::new();

        for (caps, emulate) in [
            (BackendCapabilities { multi_draw_indirect: true, pipeline_statistics: true, indirect_first_instance: true }, false),
            (BackendCapabilities { multi_draw_indirect: true, pipeline_statistics: true, indirect_first_instance: true }, true),
            (BackendCapabilities { multi_draw_indirect: false, pipeline_statistics: true, indirect_first_instance: true }, false),
        ] {
            let mut backend = RecordingBackend::new(caps);
            let desc = FilterDesc { emulate_multi_indirect_draw: emulate, batch_count: 64, ..FilterDesc::default() };
            let (mut filter, handles) = setup(&mut backend, desc, &face_counts);
            backend.clear_commands();

            let stats = render(&mut filter, &mut backend, options(true, FilterFlags::empty()), &handles, &worlds(3));

            let multi = backend
                .commands()
                .iter()
                .filter(|c| matches!(c, Command::MultiDrawIndexedIndirect { .. }))
                .count();
            let single = backend
                .commands()
                .iter()
                .filter(|c| matches!(c, Command::DrawIndexedIndirect { .. }))
                .count();
            let use_multi = caps.multi_draw_indirect && !emulate;
            assert_eq!(multi > 0, use_multi);
            assert_eq!(single > 0, !use_multi);
            if !use_multi {
                // One indirect draw per request: all six fit in one chunk.
                assert_eq!(single, 6);
            }
            results.push(stats);
        }

        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn full_chunks_flush_round_robin() {
        let mut backend = RecordingBackend::default();
        let desc = FilterDesc { batch_count: 4, chunk_count: 2, ..FilterDesc::default() };
        // 10 clusters per instance.
        let (mut filter, handles) = setup(&mut backend, desc, &[10 * BATCH_SIZE]);
        backend.clear_commands();

        let stats = render(&mut filter, &mut backend, options(true, FilterFlags::empty()), &handles, &worlds(2));

        let filters: Vec<u32> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::Dispatch { kernel: Kernel::Filter, groups, .. } => Some(*groups),
                _ => None,
            })
            .collect();
        // 20 clusters through 4-slot chunks.
        assert_eq!(filters, [4, 4, 4, 4, 4]);
        assert_eq!(stats.triangles_processed, 20 * i64::from(BATCH_SIZE));
        assert_eq!(stats.triangles_rendered, stats.triangles_processed);

        // Flushes alternate between the two chunks' index buffers.
        let index_buffers: Vec<BufferId> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::SetDrawState(state) => Some(state.index_buffer),
                _ => None,
            })
            .collect();
        assert_eq!(index_buffers.len(), 5);
        assert_ne!(index_buffers[0], index_buffers[1]);
        assert_eq!(index_buffers[0], index_buffers[2]);
    }

    #[test]
    fn cone_culling_skips_clusters_facing_away() {
        let mut backend = RecordingBackend::default();
        let (mut filter, handles) = setup(&mut backend, FilterDesc::default(), &[600]);
        // Upside down, the eye sits behind every face of the field.
        let instances = [Mat4::IDENTITY, Mat4::from_rotation_x(std::f32::consts::PI)];

        let stats = render(&mut filter, &mut backend, options(true, FilterFlags::all()), &handles, &instances);
        assert_eq!(
            (stats.clusters_processed, stats.clusters_rendered, stats.clusters_culled),
            (6, 3, 3)
        );
        assert_eq!(stats.triangles_processed, 600);

        let stats = render(
            &mut filter,
            &mut backend,
            options(true, FilterFlags::all() - FilterFlags::CLUSTER_BACKFACE),
            &handles,
            &instances,
        );
        assert_eq!(stats.clusters_culled, 0);
        assert_eq!(stats.triangles_processed, 1200);
    }

    #[test]
    fn missing_statistics_capability_reports_processed_as_rendered() {
        let caps = BackendCapabilities { multi_draw_indirect: true, pipeline_statistics: false, indirect_first_instance: true };
        let mut backend = RecordingBackend::new(caps);
        let (mut filter, handles) = setup(&mut backend, FilterDesc::default(), &[600]);

        let stats = render(&mut filter, &mut backend, options(true, FilterFlags::empty()), &handles, &worlds(2));

        assert_eq!(stats.triangles_rendered, 1200);
        assert_eq!(stats.triangles_culled, 0);
        assert!(!backend.commands().iter().any(|c| matches!(c, Command::BeginQuery)));
    }
}
