// src/small_batch.rs
//! # Small batch chunks
//!
//! A chunk owns `capacity` batch slots and `capacity` draw-call slots. Draw
//! requests are split into clusters; every cluster that survives the cone
//! test takes one batch slot, and every request with at least one surviving
//! cluster takes one draw-call slot. A request always occupies a contiguous
//! run of batch slots, so the filter kernel can find all batches of a draw
//! from the first slot alone.
//!
//! When a request does not fit, the unprocessed tail comes back as a
//! remainder to be submitted to the next chunk. A request is split at most
//! once per chunk boundary.
//!
//! [`SmallBatchChunk::render`] turns the accumulated state into one clear
//! dispatch, one filter dispatch and the indirect draws, then resets the
//! chunk for reuse.

use glam::Vec3;
use log::debug;

use crate::config::FilterFlags;
use crate::filter::FrameContext;
use crate::gpu::{
    byte_size, Binding, BufferDesc, BufferId, BufferUsage, DrawCallArguments, DrawState,
    GpuBackend, IndirectArguments, Kernel, SmallBatchData, INDIRECT_ARGUMENTS_STRIDE,
};
use crate::mesh_registry::{Mesh, MeshHandle, SharedStorage};
use crate::BATCH_SIZE;

/// One instance of one mesh, possibly already partially processed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawRequest {
    pub mesh: MeshHandle,
    pub arguments: DrawCallArguments,
    /// Submission index within the frame.
    pub draw_call_id: u32,
    /// First face not yet assigned to a chunk. Always cluster aligned.
    pub first_triangle: u32,
}

impl DrawRequest {
    pub fn new(mesh: MeshHandle, arguments: DrawCallArguments, draw_call_id: u32) -> Self {
        Self { mesh, arguments, draw_call_id, first_triangle: 0 }
    }
}

/// Result of [`SmallBatchChunk::add_request`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AddOutcome {
    /// Every remaining face was assigned or culled.
    Consumed,
    /// Some faces were assigned; the rest must go to the next chunk.
    Split(DrawRequest),
    /// Nothing was assigned; the request is returned untouched.
    Full(DrawRequest),
}

/// Buffers shared by every chunk during a frame.
#[derive(Clone, Copy, Debug)]
pub struct ChunkResources {
    pub storage: SharedStorage,
    pub frame_constants: BufferId,
}

#[derive(Clone, Copy, Debug)]
struct ChunkBuffers {
    filtered_indices: BufferId,
    small_batches: BufferId,
    indirect_arguments: BufferId,
    draw_calls: BufferId,
    draw_ids: BufferId,
}

pub struct SmallBatchChunk {
    capacity: u32,
    batches: Vec<SmallBatchData>,
    draw_calls: Vec<DrawCallArguments>,
    face_count: u32,
    use_multi_draw: bool,
    buffers: ChunkBuffers,
}

impl SmallBatchChunk {
    /// Create the chunk's GPU buffers. `capacity` is the number of batch slots
    /// (and draw-call slots).
    pub fn new<B: GpuBackend + ?Sized>(backend: &mut B, capacity: u32, use_multi_draw: bool) -> Self {
        assert!(capacity > 0, "small batch chunk needs at least one slot");

        let slots = capacity as usize;
        let draw_ids: Vec<u32> = (0..capacity).collect();

        let buffers = ChunkBuffers {
            filtered_indices: backend.create_buffer(
                &BufferDesc {
                    label: "filtered index buffer",
                    size: byte_size::<u32>(slots * BATCH_SIZE as usize * 3),
                    usage: BufferUsage::INDEX | BufferUsage::UNORDERED_ACCESS,
                },
                None,
            ),
            small_batches: backend.create_buffer(
                &BufferDesc {
                    label: "small batch data",
                    size: byte_size::<SmallBatchData>(slots),
                    usage: BufferUsage::STRUCTURED | BufferUsage::UPLOAD,
                },
                None,
            ),
            indirect_arguments: backend.create_buffer(
                &BufferDesc {
                    label: "indirect draw arguments",
                    size: byte_size::<IndirectArguments>(slots),
                    usage: BufferUsage::INDIRECT | BufferUsage::UNORDERED_ACCESS,
                },
                None,
            ),
            draw_calls: backend.create_buffer(
                &BufferDesc {
                    label: "draw call arguments",
                    size: byte_size::<DrawCallArguments>(slots),
                    usage: BufferUsage::STRUCTURED | BufferUsage::UPLOAD,
                },
                None,
            ),
            draw_ids: backend.create_buffer(
                &BufferDesc {
                    label: "draw id stream",
                    size: byte_size::<u32>(slots),
                    usage: BufferUsage::VERTEX,
                },
                Some(bytemuck::cast_slice(&draw_ids)),
            ),
        };

        Self {
            capacity,
            batches: Vec::with_capacity(slots),
            draw_calls: Vec::with_capacity(slots),
            face_count: 0,
            use_multi_draw,
            buffers,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn batch_count(&self) -> u32 {
        self.batches.len() as u32
    }

    #[inline]
    pub fn draw_call_count(&self) -> u32 {
        self.draw_calls.len() as u32
    }

    /// Faces assigned since the last render.
    #[inline]
    pub fn face_count(&self) -> u32 {
        self.face_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    #[inline]
    pub fn batches(&self) -> &[SmallBatchData] {
        &self.batches
    }

    #[inline]
    pub fn draw_calls(&self) -> &[DrawCallArguments] {
        &self.draw_calls
    }

    /// Assign as many clusters of `request` as fit, starting at its cursor.
    ///
    /// `mesh` must be the mesh `request.mesh` refers to.
    pub fn add_request(&mut self, request: DrawRequest, mesh: &Mesh, frame: &mut FrameContext) -> AddOutcome {
        if self.draw_call_count() == self.capacity {
            return AddOutcome::Full(request);
        }

        debug_assert_eq!(request.mesh.index(), mesh.index as usize, "request and mesh disagree");
        debug_assert_eq!(request.first_triangle % BATCH_SIZE, 0, "cursor is not cluster aligned");
        debug_assert!(mesh.has_data() || mesh.face_count == 0, "mesh {} has no data", mesh.index);

        // Eye in object space: one inverse per request instead of moving
        // every cone into world space.
        let eye: Option<Vec3> = frame
            .filters
            .contains(FilterFlags::CLUSTER_BACKFACE)
            .then(|| request.arguments.world.inverse().transform_point3(frame.eye));

        let first_batch = self.batch_count();
        let draw_index = self.draw_call_count();
        let output_index_offset = first_batch * BATCH_SIZE * 3;

        let mut cursor = request.first_triangle;
        let mut walked = 0u32;

        while cursor < mesh.face_count && self.batch_count() < self.capacity {
            let face_count = BATCH_SIZE.min(mesh.face_count - cursor);
            let cluster = mesh.clusters.get((cursor / BATCH_SIZE) as usize);
            walked += 1;

            let culled = match (eye, cluster) {
                (Some(eye), Some(cluster)) => cluster.is_backfacing(eye),
                _ => false,
            };

            if !culled {
                self.batches.push(SmallBatchData {
                    mesh_index: request.arguments.mesh_index,
                    index_offset: cursor * 3,
                    face_count,
                    output_index_offset,
                    draw_index,
                    draw_batch_start: first_batch,
                });
                self.face_count += face_count;
            }

            cursor += face_count;
        }

        let rendered = self.batch_count() - first_batch;
        if let Some(stats) = frame.statistics.as_mut() {
            stats.clusters_processed += i64::from(walked);
            stats.clusters_rendered += i64::from(rendered);
            stats.clusters_culled += i64::from(walked - rendered);
        }

        if rendered > 0 {
            self.draw_calls.push(request.arguments);
        }

        if cursor >= mesh.face_count {
            AddOutcome::Consumed
        } else if cursor == request.first_triangle {
            AddOutcome::Full(request)
        } else {
            AddOutcome::Split(DrawRequest { first_triangle: cursor, ..request })
        }
    }

    /// Filter and draw everything accumulated, then reset.
    ///
    /// Does nothing (beyond the reset) when no batch was assigned.
    pub fn render<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, resources: &ChunkResources) {
        if self.batches.is_empty() {
            self.reset();
            return;
        }

        let buffers = self.buffers;
        let storage = resources.storage;

        backend.dispatch(
            Kernel::ClearIndirectArgs,
            &[Binding::read_write(1, buffers.indirect_arguments)],
            self.capacity,
        );

        backend.write_buffer(buffers.small_batches, 0, bytemuck::cast_slice(&self.batches));
        backend.write_buffer(buffers.draw_calls, 0, bytemuck::cast_slice(&self.draw_calls));

        backend.dispatch(
            Kernel::Filter,
            &[
                Binding::read_only(0, storage.vertices),
                Binding::read_only(1, storage.indices),
                Binding::read_only(2, storage.mesh_constants),
                Binding::read_only(3, buffers.draw_calls),
                Binding::read_only(4, buffers.small_batches),
                Binding::read_write(0, buffers.filtered_indices),
                Binding::read_write(1, buffers.indirect_arguments),
                Binding::uniform(1, resources.frame_constants),
            ],
            self.batch_count(),
        );

        backend.set_draw_state(&DrawState {
            index_buffer: buffers.filtered_indices,
            positions: storage.vertices,
            position_offset: 0,
            draw_ids: buffers.draw_ids,
            draw_arguments: buffers.draw_calls,
            frame_constants: resources.frame_constants,
        });

        let draws = self.draw_call_count();
        if self.use_multi_draw {
            backend.multi_draw_indexed_indirect(buffers.indirect_arguments, 0, draws);
        } else {
            for slot in 0..u64::from(draws) {
                backend.draw_indexed_indirect(buffers.indirect_arguments, slot * INDIRECT_ARGUMENTS_STRIDE);
            }
        }

        debug!(
            "Chunk flushed: {} batches, {} draws, {} faces",
            self.batches.len(),
            draws,
            self.face_count
        );

        self.reset();
    }

    fn reset(&mut self) {
        self.batches.clear();
        self.draw_calls.clear();
        self.face_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use glam::Mat4;

    use super::*;
    use crate::filter::FilterStatistics;
    use crate::geometry::{height_field, MeshData};
    use crate::gpu::recording::{Command, RecordingBackend};
    use crate::mesh_registry::MeshRegistry;

    fn registry_with(backend: &mut RecordingBackend, face_counts: &[u32]) -> (MeshRegistry, Vec<MeshHandle>) {
        let meshes: Vec<_> = face_counts.iter().map(|&f| height_field(f, 0.0)).collect();
        let vertex_counts: Vec<u32> = meshes.iter().map(|m| m.vertex_count()).collect();
        assert!(meshes.iter().zip(face_counts).all(|(m, &f)| m.face_count() == f));
        let mut registry = MeshRegistry::new();
        let handles = registry.allocate(backend, &vertex_counts, face_counts);
        for (handle, mesh) in handles.iter().zip(&meshes) {
            registry.set_data(backend, *handle, &mesh.positions, &mesh.indices);
        }
        (registry, handles)
    }

    fn request(handle: MeshHandle, world: Mat4, id: u32) -> DrawRequest {
        DrawRequest::new(
            handle,
            DrawCallArguments {
                world,
                world_view: world,
                mesh_index: handle.0,
                _pad: [0; 3],
            },
            id,
        )
    }

    /// Frame looking at the flat fields from above (their front side).
    fn frame(filters: FilterFlags) -> FrameContext {
        FrameContext {
            eye: Vec3::new(0.0, 0.0, 50.0),
            filters,
            statistics: Some(FilterStatistics::default()),
            ..FrameContext::default()
        }
    }

    #[test]
    fn request_that_fits_is_consumed_in_one_call() {
        let mut backend = RecordingBackend::default();
        let (registry, handles) = registry_with(&mut backend, &[600]);
        let mut chunk = SmallBatchChunk::new(&mut backend, 128, true);
        let mut frame = frame(FilterFlags::all());

        let outcome = chunk.add_request(request(handles[0], Mat4::IDENTITY, 0), registry.get_mesh(handles[0]), &mut frame);

        assert_eq!(outcome, AddOutcome::Consumed);
        assert_eq!(chunk.batch_count(), 3);
        assert_eq!(chunk.draw_call_count(), 1);
        assert_eq!(chunk.face_count(), 600);

        let faces: Vec<u32> = chunk.batches().iter().map(|b| b.face_count).collect();
        assert_eq!(faces, [256, 256, 88]);
        let offsets: Vec<u32> = chunk.batches().iter().map(|b| b.index_offset).collect();
        assert_eq!(offsets, [0, 768, 1536]);
        assert!(chunk.batches().iter().all(|b| b.output_index_offset == 0 && b.draw_batch_start == 0));

        let stats = frame.statistics.unwrap();
        assert_eq!((stats.clusters_processed, stats.clusters_rendered, stats.clusters_culled), (3, 3, 0));
    }

    #[test]
    fn request_larger_than_free_slots_is_split() {
        let mut backend = RecordingBackend::default();
        // 10 clusters.
        let (registry, handles) = registry_with(&mut backend, &[40, 2560]);
        let mut chunk = SmallBatchChunk::new(&mut backend, 4, true);
        let mut frame = frame(FilterFlags::empty());

        let small = request(handles[0], Mat4::IDENTITY, 0);
        assert_eq!(chunk.add_request(small, registry.get_mesh(handles[0]), &mut frame), AddOutcome::Consumed);

        let big = request(handles[1], Mat4::from_translation(Vec3::X), 1);
        let AddOutcome::Split(remainder) = chunk.add_request(big, registry.get_mesh(handles[1]), &mut frame) else {
            panic!("expected a split");
        };
        assert_eq!(remainder.first_triangle, 3 * BATCH_SIZE);
        assert_eq!(remainder.draw_call_id, 1);
        assert_eq!(remainder.arguments, big.arguments);

        assert_eq!(chunk.batch_count(), 4);
        assert_eq!(chunk.draw_call_count(), 2);
        let last = chunk.batches()[3];
        assert_eq!(last.draw_index, 1);
        assert_eq!(last.draw_batch_start, 1);
        assert_eq!(last.output_index_offset, BATCH_SIZE * 3);
        assert_eq!(last.index_offset, 2 * BATCH_SIZE * 3);

        // No batch slot left: the remainder bounces without progress.
        assert_eq!(
            chunk.add_request(remainder, registry.get_mesh(handles[1]), &mut frame),
            AddOutcome::Full(remainder)
        );
        assert_eq!(chunk.draw_call_count(), 2);
    }

    #[test]
    fn full_draw_table_returns_request_untouched() {
        let mut backend = RecordingBackend::default();
        let (registry, handles) = registry_with(&mut backend, &[32]);
        let mesh = registry.get_mesh(handles[0]);
        let mut chunk = SmallBatchChunk::new(&mut backend, 2, true);
        let mut frame = frame(FilterFlags::empty());

        for id in 0..2 {
            assert_eq!(chunk.add_request(request(handles[0], Mat4::IDENTITY, id), mesh, &mut frame), AddOutcome::Consumed);
        }
        let third = request(handles[0], Mat4::IDENTITY, 2);
        assert_eq!(chunk.add_request(third, mesh, &mut frame), AddOutcome::Full(third));
        assert_eq!(chunk.batch_count(), 2);
        assert_eq!(frame.statistics.unwrap().clusters_processed, 2);
    }

    #[test]
    fn remainder_chain_covers_every_face_once() {
        let mut backend = RecordingBackend::default();
        let face_counts = [700, 40, 3000, 256, 258];
        let (registry, handles) = registry_with(&mut backend, &face_counts);
        let mut chunk = SmallBatchChunk::new(&mut backend, 5, false);
        let chunk_resources = resources(&registry, &mut backend);
        let mut frame = frame(FilterFlags::empty());

        let mut covered: Vec<Vec<u32>> = face_counts.iter().map(|&f| vec![0; f as usize]).collect();
        let mut record = |chunk: &SmallBatchChunk| {
            for b in chunk.batches() {
                let first = b.index_offset / 3;
                for face in first..first + b.face_count {
                    covered[b.mesh_index as usize][face as usize] += 1;
                }
            }
        };

        for (id, &handle) in handles.iter().enumerate() {
            let mut pending = request(handle, Mat4::IDENTITY, id as u32);
            loop {
                match chunk.add_request(pending, registry.get_mesh(handle), &mut frame) {
                    AddOutcome::Consumed => break,
                    AddOutcome::Split(rest) | AddOutcome::Full(rest) => {
                        record(&chunk);
                        chunk.render(&mut backend, &chunk_resources);
                        pending = rest;
                    }
                }
            }
        }
        record(&chunk);

        for (mesh, faces) in covered.iter().enumerate() {
            assert!(faces.iter().all(|&n| n == 1), "mesh {mesh} not covered exactly once");
        }
    }

    /// One flat cluster per entry, side by side along X, facing +Z when true
    /// and -Z when false.
    fn alternating_patches(facing: &[bool]) -> MeshData {
        let mut mesh = MeshData::default();
        for (i, &front) in facing.iter().enumerate() {
            let patch = height_field(BATCH_SIZE, 0.0);
            let base = mesh.positions.len() as u32;
            let shift = i as f32 * 20.0;
            mesh.positions.extend(patch.positions.iter().map(|p| [p[0] + shift, p[1], p[2]]));
            for tri in patch.indices.chunks_exact(3) {
                let (a, b, c) = (tri[0] + base, tri[1] + base, tri[2] + base);
                let tri_idx = if front { [a, b, c] } else { [a, c, b] };
                mesh.indices.extend_from_slice(&tri_idx);
            }
        }
        mesh
    }

    #[test]
    fn split_skips_culled_clusters_between_survivors() {
        let facing = [true, false, false, true, false, true];
        let data = alternating_patches(&facing);
        let mut backend = RecordingBackend::default();
        let mut registry = MeshRegistry::new();
        let handle = registry.allocate(&mut backend, &[data.vertex_count()], &[data.face_count()])[0];
        registry.set_data(&mut backend, handle, &data.positions, &data.indices);
        let mesh = registry.get_mesh(handle);
        assert_eq!(mesh.clusters.len(), facing.len());

        let chunk_resources = resources(&registry, &mut backend);
        let mut chunk = SmallBatchChunk::new(&mut backend, 2, true);
        let mut frame = frame(FilterFlags::all());

        let mut batched = vec![0u32; facing.len()];
        let mut record = |chunk: &SmallBatchChunk| {
            for b in chunk.batches() {
                batched[(b.index_offset / (BATCH_SIZE * 3)) as usize] += 1;
            }
        };

        // Clusters 1 and 2 are culled without taking a slot, so both slots go
        // to clusters 0 and 3 and the cursor stops at cluster 4.
        let AddOutcome::Split(rest) = chunk.add_request(request(handle, Mat4::IDENTITY, 0), mesh, &mut frame) else {
            panic!("expected a split");
        };
        assert_eq!(rest.first_triangle, 4 * BATCH_SIZE);
        assert_eq!(chunk.batch_count(), 2);
        record(&chunk);
        chunk.render(&mut backend, &chunk_resources);

        assert_eq!(chunk.add_request(rest, mesh, &mut frame), AddOutcome::Consumed);
        assert_eq!(chunk.batch_count(), 1);
        record(&chunk);

        let expected: Vec<u32> = facing.iter().map(|&front| u32::from(front)).collect();
        assert_eq!(batched, expected);
        let stats = frame.statistics.unwrap();
        assert_eq!((stats.clusters_processed, stats.clusters_rendered, stats.clusters_culled), (6, 3, 3));
    }

    #[test]
    fn clusters_seen_from_behind_are_culled() {
        let mut backend = RecordingBackend::default();
        let (registry, handles) = registry_with(&mut backend, &[600]);
        let mesh = registry.get_mesh(handles[0]);
        let mut chunk = SmallBatchChunk::new(&mut backend, 16, true);

        // Flipping the instance upside down puts the eye behind every face.
        let flipped = Mat4::from_rotation_x(std::f32::consts::PI);
        let mut frame = frame(FilterFlags::all());
        assert_eq!(chunk.add_request(request(handles[0], flipped, 0), mesh, &mut frame), AddOutcome::Consumed);
        assert_eq!(chunk.batch_count(), 0);
        assert_eq!(chunk.draw_call_count(), 0);
        let stats = frame.statistics.unwrap();
        assert_eq!((stats.clusters_processed, stats.clusters_rendered, stats.clusters_culled), (3, 0, 3));

        // Same instance with the cone test disabled keeps everything.
        let mut frame = self::frame(FilterFlags::all() - FilterFlags::CLUSTER_BACKFACE);
        chunk.add_request(request(handles[0], flipped, 0), mesh, &mut frame);
        assert_eq!(chunk.batch_count(), 3);
    }

    fn resources(registry: &MeshRegistry, backend: &mut RecordingBackend) -> ChunkResources {
        let frame_constants = backend.create_buffer(
            &BufferDesc { label: "frame", size: 144, usage: BufferUsage::UNIFORM },
            None,
        );
        ChunkResources { storage: registry.storage().unwrap(), frame_constants }
    }

    #[test]
    fn render_issues_clear_filter_and_draws_then_resets() {
        let mut backend = RecordingBackend::default();
        let (registry, handles) = registry_with(&mut backend, &[600, 40]);
        let resources = resources(&registry, &mut backend);
        let mut frame = frame(FilterFlags::empty());

        for use_multi_draw in [true, false] {
            let mut chunk = SmallBatchChunk::new(&mut backend, 8, use_multi_draw);
            chunk.add_request(request(handles[0], Mat4::IDENTITY, 0), registry.get_mesh(handles[0]), &mut frame);
            chunk.add_request(request(handles[1], Mat4::IDENTITY, 1), registry.get_mesh(handles[1]), &mut frame);
            backend.clear_commands();

            chunk.render(&mut backend, &resources);

            let commands = backend.commands();
            assert!(matches!(
                &commands[0],
                Command::Dispatch { kernel: Kernel::ClearIndirectArgs, groups: 8, .. }
            ));
            assert!(matches!(&commands[1], Command::WriteBuffer { len: 96, .. }));
            assert!(matches!(&commands[2], Command::WriteBuffer { len: 288, .. }));
            assert!(matches!(&commands[3], Command::Dispatch { kernel: Kernel::Filter, groups: 4, .. }));
            assert!(matches!(&commands[4], Command::SetDrawState(_)));
            if use_multi_draw {
                assert!(matches!(&commands[5], Command::MultiDrawIndexedIndirect { count: 2, offset: 0, .. }));
                assert_eq!(commands.len(), 6);
            } else {
                assert!(matches!(&commands[5], Command::DrawIndexedIndirect { offset: 0, .. }));
                assert!(matches!(&commands[6], Command::DrawIndexedIndirect { offset: 20, .. }));
                assert_eq!(commands.len(), 7);
            }
            assert!(chunk.is_empty());
            assert_eq!(chunk.draw_call_count(), 0);
            assert_eq!(chunk.face_count(), 0);

            // Empty chunk: no GPU work.
            backend.clear_commands();
            chunk.render(&mut backend, &resources);
            assert!(backend.commands().is_empty());
        }
    }
}
