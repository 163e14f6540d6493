// src/gpu/recording.rs
//! CPU reference backend.
//!
//! Keeps buffers in host memory, logs every command and emulates both kernels:
//! the clear kernel exactly, the filter kernel as a pass-through that keeps
//! every triangle. Pipeline statistics count the triangles each draw would
//! assemble and are available as soon as the query ends.

use bytemuck::Pod;
use log::warn;

use super::{
    BackendCapabilities, Binding, BindingKind, BufferDesc, BufferId, BufferUsage, DrawState,
    GpuBackend, IndirectArguments, Kernel, MeshConstants, PipelineStatistics, SmallBatchData,
    INDIRECT_ARGUMENTS_STRIDE,
};

/// One recorded backend call.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    CreateBuffer { buffer: BufferId, size: u64, usage: BufferUsage },
    WriteBuffer { buffer: BufferId, offset: u64, len: u64 },
    Dispatch { kernel: Kernel, bindings: Vec<Binding>, groups: u32 },
    SetDrawState(DrawState),
    DrawIndexed { index_count: u32, first_index: u32, base_vertex: i32, draw_id: u32 },
    DrawIndexedIndirect { arguments: BufferId, offset: u64 },
    MultiDrawIndexedIndirect { arguments: BufferId, offset: u64, count: u32 },
    BeginQuery,
    EndQuery,
    Flush,
}

pub struct RecordingBackend {
    capabilities: BackendCapabilities,
    buffers: Vec<Vec<u8>>,
    commands: Vec<Command>,
    draw_state: Option<DrawState>,
    active_query: Option<u64>,
    last_query: Option<u64>,
}

impl Default for RecordingBackend {
    /// Advertises every capability.
    fn default() -> Self {
        Self::new(BackendCapabilities {
            multi_draw_indirect: true,
            pipeline_statistics: true,
            indirect_first_instance: true,
        })
    }
}

impl RecordingBackend {
    pub fn new(capabilities: BackendCapabilities) -> Self {
        Self {
            capabilities,
            buffers: Vec::new(),
            commands: Vec::new(),
            draw_state: None,
            active_query: None,
            last_query: None,
        }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn buffer(&self, buffer: BufferId) -> &[u8] {
        &self.buffers[buffer.index()]
    }

    /// Copy a whole buffer out as `T` elements.
    pub fn read_buffer<T: Pod>(&self, buffer: BufferId) -> Vec<T> {
        bytemuck::pod_collect_to_vec(self.buffer(buffer))
    }

    fn read<T: Pod>(&self, buffer: BufferId, index: usize) -> Option<T> {
        let size = std::mem::size_of::<T>();
        let start = index * size;
        self.buffers
            .get(buffer.index())?
            .get(start..start + size)
            .map(bytemuck::pod_read_unaligned)
    }

    fn write<T: Pod>(&mut self, buffer: BufferId, index: usize, value: &T) -> bool {
        let bytes = bytemuck::bytes_of(value);
        let start = index * bytes.len();
        match self
            .buffers
            .get_mut(buffer.index())
            .and_then(|data| data.get_mut(start..start + bytes.len()))
        {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn count_primitives(&mut self, triangles: u64) {
        if let Some(primitives) = self.active_query.as_mut() {
            *primitives += triangles;
        }
    }

    fn clear_arguments(&mut self, bindings: &[Binding], groups: u32) {
        let Some(args) = find(bindings, BindingKind::ReadWrite, 1) else {
            warn!("clear kernel dispatched without an argument buffer");
            return;
        };
        for slot in 0..groups {
            if !self.write(args, slot as usize, &IndirectArguments::cleared(slot)) {
                warn!("clear kernel ran past the argument buffer at slot {}", slot);
                return;
            }
        }
    }

    /// Pass-through filter: every face of every batch survives.
    fn filter(&mut self, bindings: &[Binding], groups: u32) {
        let (Some(source), Some(meshes), Some(batches), Some(output), Some(args)) = (
            find(bindings, BindingKind::ReadOnly, 1),
            find(bindings, BindingKind::ReadOnly, 2),
            find(bindings, BindingKind::ReadOnly, 4),
            find(bindings, BindingKind::ReadWrite, 0),
            find(bindings, BindingKind::ReadWrite, 1),
        ) else {
            warn!("filter kernel dispatched with incomplete bindings");
            return;
        };

        for group in 0..groups as usize {
            let Some(batch) = self.read::<SmallBatchData>(batches, group) else {
                warn!("filter kernel ran past the small batch buffer at {}", group);
                return;
            };
            let (Some(mesh), Some(mut draw)) = (
                self.read::<MeshConstants>(meshes, batch.mesh_index as usize),
                self.read::<IndirectArguments>(args, batch.draw_index as usize),
            ) else {
                warn!("small batch {} references missing mesh or draw slot", group);
                continue;
            };

            let source_start = (mesh.index_offset + batch.index_offset) as usize;
            let output_start = (batch.output_index_offset + draw.index_count) as usize;
            for k in 0..(batch.face_count * 3) as usize {
                let index = self.read::<u32>(source, source_start + k).unwrap_or(0);
                self.write(output, output_start + k, &(index + mesh.vertex_offset));
            }

            draw.index_count += batch.face_count * 3;
            draw.first_index = batch.output_index_offset;
            self.write(args, batch.draw_index as usize, &draw);
        }
    }

    fn indirect_triangles(&self, arguments: BufferId, offset: u64, count: u32) -> u64 {
        let first = (offset / INDIRECT_ARGUMENTS_STRIDE) as usize;
        (first..first + count as usize)
            .filter_map(|slot| self.read::<IndirectArguments>(arguments, slot))
            .map(|args| u64::from(args.index_count / 3) * u64::from(args.instance_count))
            .sum()
    }
}

fn find(bindings: &[Binding], kind: BindingKind, slot: u32) -> Option<BufferId> {
    bindings
        .iter()
        .find(|b| b.kind == kind && b.slot == slot)
        .map(|b| b.buffer)
}

impl GpuBackend for RecordingBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>, contents: Option<&[u8]>) -> BufferId {
        let id = BufferId(self.buffers.len() as u32);
        let mut data = vec![0u8; desc.size as usize];
        if let Some(contents) = contents {
            debug_assert!(contents.len() <= data.len(), "initial contents overflow {}", desc.label);
            let len = contents.len().min(data.len());
            data[..len].copy_from_slice(&contents[..len]);
        }
        self.buffers.push(data);
        self.commands.push(Command::CreateBuffer { buffer: id, size: desc.size, usage: desc.usage });
        id
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) {
        let start = offset as usize;
        let dst = &mut self.buffers[buffer.index()];
        debug_assert!(start + data.len() <= dst.len(), "write past the end of buffer {:?}", buffer);
        if let Some(dst) = dst.get_mut(start..start + data.len()) {
            dst.copy_from_slice(data);
        }
        self.commands.push(Command::WriteBuffer { buffer, offset, len: data.len() as u64 });
    }

    fn dispatch(&mut self, kernel: Kernel, bindings: &[Binding], groups: u32) {
        match kernel {
            Kernel::ClearIndirectArgs => self.clear_arguments(bindings, groups),
            Kernel::Filter => self.filter(bindings, groups),
        }
        self.commands.push(Command::Dispatch { kernel, bindings: bindings.to_vec(), groups });
    }

    fn set_draw_state(&mut self, state: &DrawState) {
        self.draw_state = Some(*state);
        self.commands.push(Command::SetDrawState(*state));
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32, base_vertex: i32, draw_id: u32) {
        debug_assert!(self.draw_state.is_some(), "draw without draw state");
        self.count_primitives(u64::from(index_count / 3));
        self.commands.push(Command::DrawIndexed { index_count, first_index, base_vertex, draw_id });
    }

    fn draw_indexed_indirect(&mut self, arguments: BufferId, offset: u64) {
        debug_assert!(self.draw_state.is_some(), "draw without draw state");
        let triangles = self.indirect_triangles(arguments, offset, 1);
        self.count_primitives(triangles);
        self.commands.push(Command::DrawIndexedIndirect { arguments, offset });
    }

    fn multi_draw_indexed_indirect(&mut self, arguments: BufferId, offset: u64, count: u32) {
        debug_assert!(self.capabilities.multi_draw_indirect, "multi-draw without capability");
        debug_assert!(self.draw_state.is_some(), "draw without draw state");
        let triangles = self.indirect_triangles(arguments, offset, count);
        self.count_primitives(triangles);
        self.commands.push(Command::MultiDrawIndexedIndirect { arguments, offset, count });
    }

    fn begin_query(&mut self) {
        debug_assert!(self.active_query.is_none(), "nested pipeline statistics query");
        self.active_query = Some(0);
        self.last_query = None;
        self.commands.push(Command::BeginQuery);
    }

    fn end_query(&mut self) {
        self.last_query = self.active_query.take();
        self.commands.push(Command::EndQuery);
    }

    fn poll_query(&mut self) -> Option<PipelineStatistics> {
        self.last_query.map(|primitives| PipelineStatistics { primitives })
    }

    fn flush(&mut self) {
        self.commands.push(Command::Flush);
    }
}
