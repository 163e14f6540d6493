// src/gpu/mod.rs
//! # GPU execution backend interface
//!
//! The filter never talks to a graphics API directly. It records work through
//! [`GpuBackend`], which exposes exactly what the batching core needs:
//!
//! * **Buffers** – create (optionally with initial contents) and upload.
//! * **Compute** – dispatch one of the two kernels with numbered bindings.
//! * **Draw** – indexed draws, indexed-indirect draws and (capability gated)
//!   merged multi-draw-indirect.
//! * **Queries** – one pipeline-statistics query at a time, polled without
//!   blocking.
//!
//! Two implementations ship with the crate: [`wgpu_backend::WgpuBackend`] for
//! real hardware and [`recording::RecordingBackend`], a deterministic CPU
//! stand-in used by the tests and the demo fallback.
//!
//! The second half of this file holds the `#[repr(C)]` layouts shared with
//! the WGSL kernels in `shaders/`.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

pub mod recording;
pub mod wgpu_backend;

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Backend-issued buffer identifier. Only meaningful for the backend that
/// created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct BufferId(pub u32);

impl BufferId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// How a buffer will be used. Backends translate this to native flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Bound as a vertex stream.
        const VERTEX = 0x1;
        /// Bound as the index buffer of a draw.
        const INDEX = 0x2;
        /// Read-only structured/raw shader input.
        const STRUCTURED = 0x4;
        /// Read-write shader output (UAV / storage).
        const UNORDERED_ACCESS = 0x8;
        /// Source of indirect draw arguments.
        const INDIRECT = 0x10;
        /// Small constant block.
        const UNIFORM = 0x20;
        /// Written from the CPU after creation.
        const UPLOAD = 0x40;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Compute kernels the core dispatches. Their internals live outside the core;
/// only the binding contract below is fixed.
///
/// `ClearIndirectArgs`: rw slot 1 = indirect argument records. One workgroup
/// per record.
///
/// `Filter`: ro slots 0..=4 = vertex positions, source indices, mesh
/// constants, draw-call arguments, small batches; rw slot 0 = filtered
/// indices, rw slot 1 = indirect arguments; uniform slot 1 = frame constants.
/// One workgroup per small batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kernel {
    ClearIndirectArgs,
    Filter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingKind {
    ReadOnly,
    ReadWrite,
    Uniform,
}

/// A buffer bound to a numbered slot of a given kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    pub kind: BindingKind,
    pub slot: u32,
    pub buffer: BufferId,
}

impl Binding {
    pub const fn read_only(slot: u32, buffer: BufferId) -> Self {
        Self { kind: BindingKind::ReadOnly, slot, buffer }
    }

    pub const fn read_write(slot: u32, buffer: BufferId) -> Self {
        Self { kind: BindingKind::ReadWrite, slot, buffer }
    }

    pub const fn uniform(slot: u32, buffer: BufferId) -> Self {
        Self { kind: BindingKind::Uniform, slot, buffer }
    }

    /// Flat binding number used by the WGSL kernels.
    pub const fn shader_binding(&self) -> u32 {
        match self.kind {
            BindingKind::ReadOnly => self.slot,
            BindingKind::ReadWrite => 8 + self.slot,
            BindingKind::Uniform => 16 + self.slot,
        }
    }
}

/// Everything the depth-only pipeline reads for subsequent draws.
///
/// Stream 0 carries `float3` positions starting at `position_offset` bytes,
/// stream 1 one `u32` draw identifier per instance. `draw_arguments` is read
/// by the vertex stage at ro slot 3, `frame_constants` at uniform slot 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawState {
    pub index_buffer: BufferId,
    pub positions: BufferId,
    pub position_offset: u64,
    pub draw_ids: BufferId,
    pub draw_arguments: BufferId,
    pub frame_constants: BufferId,
}

/// What the backend negotiated with the device at construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// One call can submit N indirect draws.
    pub multi_draw_indirect: bool,
    /// Pipeline statistics queries are available.
    pub pipeline_statistics: bool,
    /// Indirect draws honour a non-zero `first_instance`.
    pub indirect_first_instance: bool,
}

/// Result of one pipeline-statistics query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStatistics {
    /// Primitives assembled by draws between `begin_query` and `end_query`.
    pub primitives: u64,
}

/// Command sink for one device. All calls are ordered submissions from a
/// single thread.
pub trait GpuBackend {
    fn capabilities(&self) -> BackendCapabilities;

    /// Create a buffer. `contents`, when given, must fit in `desc.size`.
    fn create_buffer(&mut self, desc: &BufferDesc<'_>, contents: Option<&[u8]>) -> BufferId;

    /// Upload `data` at `offset` bytes. Ordered with all recorded commands.
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]);

    fn dispatch(&mut self, kernel: Kernel, bindings: &[Binding], groups: u32);

    fn set_draw_state(&mut self, state: &DrawState);

    /// Plain indexed draw of one instance whose draw identifier is `draw_id`.
    fn draw_indexed(&mut self, index_count: u32, first_index: u32, base_vertex: i32, draw_id: u32);

    /// Draw reading one [`IndirectArguments`] record at `offset` bytes.
    fn draw_indexed_indirect(&mut self, arguments: BufferId, offset: u64);

    /// Draw `count` consecutive records starting at `offset`. Only valid when
    /// [`BackendCapabilities::multi_draw_indirect`] is set.
    fn multi_draw_indexed_indirect(&mut self, arguments: BufferId, offset: u64, count: u32);

    fn begin_query(&mut self);

    fn end_query(&mut self);

    /// Non-blocking. `None` while the last ended query is still in flight.
    fn poll_query(&mut self) -> Option<PipelineStatistics>;

    /// Hand everything recorded so far to the device.
    fn flush(&mut self);
}

// ---------------------------------------------------------------------------
// GPU-visible layouts (must match shaders/*.wgsl)
// ---------------------------------------------------------------------------

/// Per-frame constants, uploaded once in `begin_render`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FrameConstants {
    pub view: Mat4,
    pub projection: Mat4,
    pub cull_flags: u32,
    pub width: u32,
    pub height: u32,
    pub _pad: u32,
}

/// Per draw-call constants: one per accepted request in a chunk, or one per
/// instance on the unfiltered path.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct DrawCallArguments {
    pub world: Mat4,
    pub world_view: Mat4,
    pub mesh_index: u32,
    pub _pad: [u32; 3],
}

/// One cluster's worth of filter work inside a chunk submission.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SmallBatchData {
    /// Index into the mesh constants table.
    pub mesh_index: u32,
    /// First source index, relative to the mesh's first index.
    pub index_offset: u32,
    pub face_count: u32,
    /// First filtered index of the owning draw call.
    pub output_index_offset: u32,
    /// Draw-call slot inside the chunk.
    pub draw_index: u32,
    /// First batch slot of that draw call.
    pub draw_batch_start: u32,
}

/// Per mesh constants, in elements (vertices / indices), not bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MeshConstants {
    pub vertex_count: u32,
    pub face_count: u32,
    pub index_offset: u32,
    pub vertex_offset: u32,
}

/// Indexed indirect draw record, laid out as every API expects it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectArguments {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

impl IndirectArguments {
    /// Record as left by the clear kernel for draw slot `slot`.
    pub const fn cleared(slot: u32) -> Self {
        Self {
            index_count: 0,
            instance_count: 1,
            first_index: 0,
            base_vertex: 0,
            first_instance: slot,
        }
    }
}

pub const INDIRECT_ARGUMENTS_STRIDE: u64 = std::mem::size_of::<IndirectArguments>() as u64;

/// Size in bytes of `count` elements of `T`.
#[inline]
pub(crate) fn byte_size<T>(count: usize) -> u64 {
    (count * std::mem::size_of::<T>()) as u64
}
