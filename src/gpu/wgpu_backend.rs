// src/gpu/wgpu_backend.rs
//! wgpu implementation of [`GpuBackend`].
//!
//! Commands are recorded into one pending `CommandEncoder`. Uploads go through
//! a `StagingBelt` on that encoder, compute kernels get their own pass, and
//! consecutive draws sharing a [`DrawState`] are batched into one depth-only
//! render pass. [`GpuBackend::flush`] submits everything recorded so far.
//!
//! Optional device features are negotiated at construction and reported
//! through [`BackendCapabilities`]:
//!
//! | capability                | wgpu feature                 |
//! |---------------------------|------------------------------|
//! | `multi_draw_indirect`     | `MULTI_DRAW_INDIRECT`        |
//! | `indirect_first_instance` | `INDIRECT_FIRST_INSTANCE`    |
//! | `pipeline_statistics`     | `PIPELINE_STATISTICS_QUERY`  |

use std::collections::HashMap;
use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::Arc;

use log::{debug, info, warn};
use lru::LruCache;
use parking_lot::Mutex;
use wgpu::util::StagingBelt;
use xxhash_rust::xxh3::xxh3_64;

use super::{
    BackendCapabilities, Binding, BindingKind, BufferDesc, BufferId, BufferUsage, DrawState,
    GpuBackend, Kernel, PipelineStatistics, INDIRECT_ARGUMENTS_STRIDE,
};
use crate::error::{Error, Result};

const STAGING_CHUNK_SIZE: u64 = 1 << 20;
const MIN_BUFFER_SIZE: u64 = 16;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Render passes one statistics query can span before its slots are drained.
const QUERY_SLOTS: u32 = 64;

const BIND_GROUP_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(n) => n,
    None => unreachable!(),
};

const POSITION_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x3];
const DRAW_ID_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![1 => Uint32];

/// Which pipeline layout a bind group was built against. Part of the cache key.
#[derive(Clone, Copy)]
#[repr(u32)]
enum LayoutKind {
    Clear = 0,
    Filter = 1,
    Depth = 2,
}

#[derive(Clone, Copy, Debug)]
enum PendingDraw {
    Indexed { index_count: u32, first_index: u32, base_vertex: i32, draw_id: u32 },
    Indirect { arguments: BufferId, offset: u64 },
    MultiIndirect { arguments: BufferId, offset: u64, count: u32 },
}

struct DepthTarget {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl DepthTarget {
    fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("depth target"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { _texture: texture, view }
    }
}

type MapResult = Arc<Mutex<Option<std::result::Result<(), wgpu::BufferAsyncError>>>>;

/// Pipeline-statistics query state. One slot per render pass while active.
struct StatisticsQueries {
    set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
    active: bool,
    used: u32,
    /// Primitives from slots drained while the query was still open.
    drained: u64,
    /// Slots whose results are being mapped, once the query has ended.
    in_flight: Option<(u32, MapResult)>,
    result: Option<u64>,
}

impl StatisticsQueries {
    fn new(device: &wgpu::Device) -> Self {
        let size = u64::from(QUERY_SLOTS) * 8;
        Self {
            set: device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("pipeline statistics"),
                ty: wgpu::QueryType::PipelineStatistics(
                    wgpu::PipelineStatisticsTypes::CLIPPER_INVOCATIONS,
                ),
                count: QUERY_SLOTS,
            }),
            resolve: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("statistics resolve"),
                size,
                usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }),
            readback: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("statistics readback"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            active: false,
            used: 0,
            drained: 0,
            in_flight: None,
            result: None,
        }
    }

    /// Record the resolve and readback copy for the slots used so far.
    fn record_resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.resolve_query_set(&self.set, 0..self.used, &self.resolve, 0);
        encoder.copy_buffer_to_buffer(&self.resolve, 0, &self.readback, 0, u64::from(self.used) * 8);
    }

    fn start_map(&self) -> MapResult {
        let status: MapResult = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&status);
        self.readback
            .slice(..u64::from(self.used) * 8)
            .map_async(wgpu::MapMode::Read, move |result| {
                *sink.lock() = Some(result);
            });
        status
    }

    fn read_sum(&self, slots: u32) -> u64 {
        let sum = {
            let range = self.readback.slice(..u64::from(slots) * 8).get_mapped_range();
            bytemuck::cast_slice::<u8, u64>(&range).iter().sum()
        };
        self.readback.unmap();
        sum
    }
}

/// Depth-only renderer driving the filter kernels on a real device.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    capabilities: BackendCapabilities,

    buffers: Vec<wgpu::Buffer>,
    belt: StagingBelt,
    encoder: Option<wgpu::CommandEncoder>,

    clear_pipeline: wgpu::ComputePipeline,
    filter_pipeline: wgpu::ComputePipeline,
    depth_pipeline: wgpu::RenderPipeline,
    bind_groups: LruCache<u64, wgpu::BindGroup>,

    depth: DepthTarget,
    clear_depth: bool,

    draw_state: Option<DrawState>,
    pending: Vec<PendingDraw>,
    queries: Option<StatisticsQueries>,
}

impl WgpuBackend {
    /// Pick a high-performance adapter and open a device on it.
    pub async fn new(width: u32, height: u32) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(Error::AdapterUnavailable)?;
        Self::from_adapter(&adapter, width, height).await
    }

    /// Open a device on `adapter`, enabling whichever optional features it has.
    pub async fn from_adapter(adapter: &wgpu::Adapter, width: u32, height: u32) -> Result<Self> {
        let wanted = wgpu::Features::MULTI_DRAW_INDIRECT
            | wgpu::Features::INDIRECT_FIRST_INSTANCE
            | wgpu::Features::PIPELINE_STATISTICS_QUERY;
        let features = adapter.features() & wanted;
        let info = adapter.get_info();
        info!("Adapter: {} ({:?}), optional features {:?}", info.name, info.backend, features);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("cluster cull device"),
                    required_features: features,
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;
        Ok(Self::from_device(device, queue, width, height))
    }

    /// Wrap an existing device. Capabilities follow `device.features()`.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue, width: u32, height: u32) -> Self {
        let features = device.features();
        let capabilities = BackendCapabilities {
            multi_draw_indirect: features.contains(wgpu::Features::MULTI_DRAW_INDIRECT),
            pipeline_statistics: features.contains(wgpu::Features::PIPELINE_STATISTICS_QUERY),
            indirect_first_instance: features.contains(wgpu::Features::INDIRECT_FIRST_INSTANCE),
        };
        debug!("Backend capabilities: {:?}", capabilities);

        let clear_module = device.create_shader_module(wgpu::include_wgsl!("../../shaders/clear_args.wgsl"));
        let filter_module = device.create_shader_module(wgpu::include_wgsl!("../../shaders/filter.wgsl"));
        let depth_module = device.create_shader_module(wgpu::include_wgsl!("../../shaders/depth_only.wgsl"));

        // Without indirect first-instance the argument records must carry 0.
        let clear_constants = HashMap::from([(
            "write_first_instance".to_string(),
            if capabilities.indirect_first_instance { 1.0 } else { 0.0 },
        )]);
        let clear_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("clear indirect args"),
            layout: None,
            module: &clear_module,
            entry_point: "main",
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &clear_constants,
                ..Default::default()
            },
            cache: None,
        });
        let filter_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("triangle filter"),
            layout: None,
            module: &filter_module,
            entry_point: "main",
            compilation_options: Default::default(),
            cache: None,
        });
        let depth_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("depth only"),
            layout: None,
            vertex: wgpu::VertexState {
                module: &depth_module,
                entry_point: "vs_main",
                compilation_options: Default::default(),
                buffers: &[
                    wgpu::VertexBufferLayout {
                        array_stride: 12,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &POSITION_ATTRIBUTES,
                    },
                    wgpu::VertexBufferLayout {
                        array_stride: 4,
                        step_mode: wgpu::VertexStepMode::Instance,
                        attributes: &DRAW_ID_ATTRIBUTES,
                    },
                ],
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: Some(wgpu::Face::Back),
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            fragment: None,
            multiview: None,
            cache: None,
        });

        let queries = capabilities.pipeline_statistics.then(|| StatisticsQueries::new(&device));
        let depth = DepthTarget::new(&device, width, height);

        Self {
            device,
            queue,
            capabilities,
            buffers: Vec::new(),
            belt: StagingBelt::new(STAGING_CHUNK_SIZE),
            encoder: None,
            clear_pipeline,
            filter_pipeline,
            depth_pipeline,
            bind_groups: LruCache::new(BIND_GROUP_CACHE_SIZE),
            depth,
            clear_depth: true,
            draw_state: None,
            pending: Vec::new(),
            queries,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn buffer(&self, buffer: BufferId) -> &wgpu::Buffer {
        &self.buffers[buffer.index()]
    }

    fn submit(&mut self) {
        self.end_render_pass();
        self.submit_encoder();
    }

    /// Submit the pending encoder without touching queued draws.
    fn submit_encoder(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.belt.finish();
            self.queue.submit(Some(encoder.finish()));
            self.belt.recall();
        }
    }

    /// Read back the query slots used so far while the query stays open.
    fn drain_query_slots(&mut self) {
        let Some(queries) = self.queries.as_ref() else {
            return;
        };
        let used = queries.used;
        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| new_encoder(device));
        queries.record_resolve(encoder);
        self.submit_encoder();

        let Some(queries) = self.queries.as_mut() else {
            return;
        };
        let status = queries.start_map();
        self.device.poll(wgpu::Maintain::Wait);
        let mapped = matches!(*status.lock(), Some(Ok(())));
        if mapped {
            queries.drained += queries.read_sum(used);
        } else {
            warn!("Statistics readback failed while draining {} query slots", used);
        }
        queries.used = 0;
        debug!("Drained {} statistics query slots", used);
    }

    /// Record every pending draw into one depth-only render pass.
    fn end_render_pass(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let Some(state) = self.draw_state else {
            warn!("Dropping {} draws recorded without draw state", self.pending.len());
            self.pending.clear();
            return;
        };

        if self.queries.as_ref().is_some_and(|q| q.active && q.used == QUERY_SLOTS) {
            self.drain_query_slots();
        }

        let device = &self.device;
        let buffers = &self.buffers;
        let encoder = self.encoder.get_or_insert_with(|| new_encoder(device));
        let bind_group = cached_bind_group(
            &mut self.bind_groups,
            device,
            LayoutKind::Depth,
            &self.depth_pipeline.get_bind_group_layout(0),
            buffers,
            &[
                Binding::read_only(3, state.draw_arguments),
                Binding::uniform(1, state.frame_constants),
            ],
        );

        let load = if self.clear_depth {
            wgpu::LoadOp::Clear(1.0)
        } else {
            wgpu::LoadOp::Load
        };
        self.clear_depth = false;

        let query = self.queries.as_mut().filter(|q| q.active).map(|q| {
            let slot = q.used;
            q.used += 1;
            (&q.set, slot)
        });

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("depth pass"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.depth.view,
                depth_ops: Some(wgpu::Operations { load, store: wgpu::StoreOp::Store }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        if let Some((set, slot)) = query {
            pass.begin_pipeline_statistics_query(set, slot);
        }

        let draw_ids = &buffers[state.draw_ids.index()];
        pass.set_pipeline(&self.depth_pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.set_index_buffer(buffers[state.index_buffer.index()].slice(..), wgpu::IndexFormat::Uint32);
        pass.set_vertex_buffer(0, buffers[state.positions.index()].slice(state.position_offset..));
        pass.set_vertex_buffer(1, draw_ids.slice(..));

        for draw in self.pending.drain(..) {
            match draw {
                PendingDraw::Indexed { index_count, first_index, base_vertex, draw_id } => {
                    pass.draw_indexed(first_index..first_index + index_count, base_vertex, draw_id..draw_id + 1);
                }
                PendingDraw::Indirect { arguments, offset } => {
                    if !self.capabilities.indirect_first_instance {
                        // Instance 0 has to land on this slot's draw id.
                        let slot = offset / INDIRECT_ARGUMENTS_STRIDE;
                        pass.set_vertex_buffer(1, draw_ids.slice(slot * 4..));
                    }
                    pass.draw_indexed_indirect(&buffers[arguments.index()], offset);
                }
                PendingDraw::MultiIndirect { arguments, offset, count } => {
                    pass.multi_draw_indexed_indirect(&buffers[arguments.index()], offset, count);
                }
            }
        }

        if query.is_some() {
            pass.end_pipeline_statistics_query();
        }
    }
}

fn new_encoder(device: &wgpu::Device) -> wgpu::CommandEncoder {
    device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("filter frame") })
}

fn buffer_usages(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::COPY_DST;
    if usage.contains(BufferUsage::VERTEX) {
        out |= wgpu::BufferUsages::VERTEX;
    }
    if usage.contains(BufferUsage::INDEX) {
        out |= wgpu::BufferUsages::INDEX;
    }
    if usage.intersects(BufferUsage::STRUCTURED | BufferUsage::UNORDERED_ACCESS) {
        out |= wgpu::BufferUsages::STORAGE;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        out |= wgpu::BufferUsages::INDIRECT;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        out |= wgpu::BufferUsages::UNIFORM;
    }
    out
}

/// Cache key: layout kind followed by (kind, slot, buffer) per binding.
fn bind_group_key(layout: LayoutKind, bindings: &[Binding]) -> u64 {
    let mut words = Vec::with_capacity(1 + bindings.len() * 3);
    words.push(layout as u32);
    for binding in bindings {
        let kind = match binding.kind {
            BindingKind::ReadOnly => 0u32,
            BindingKind::ReadWrite => 1,
            BindingKind::Uniform => 2,
        };
        words.extend_from_slice(&[kind, binding.slot, binding.buffer.0]);
    }
    xxh3_64(bytemuck::cast_slice(&words))
}

fn cached_bind_group<'c>(
    cache: &'c mut LruCache<u64, wgpu::BindGroup>,
    device: &wgpu::Device,
    kind: LayoutKind,
    layout: &wgpu::BindGroupLayout,
    buffers: &[wgpu::Buffer],
    bindings: &[Binding],
) -> &'c wgpu::BindGroup {
    cache.get_or_insert(bind_group_key(kind, bindings), || {
        let entries: Vec<wgpu::BindGroupEntry<'_>> = bindings
            .iter()
            .map(|binding| wgpu::BindGroupEntry {
                binding: binding.shader_binding(),
                resource: buffers[binding.buffer.index()].as_entire_binding(),
            })
            .collect();
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout,
            entries: &entries,
        })
    })
}

impl GpuBackend for WgpuBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>, contents: Option<&[u8]>) -> BufferId {
        let size = desc.size.max(MIN_BUFFER_SIZE).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size,
            usage: buffer_usages(desc.usage),
            mapped_at_creation: contents.is_some(),
        });
        if let Some(contents) = contents {
            debug_assert!(contents.len() as u64 <= size, "initial contents overflow {}", desc.label);
            {
                let mut mapped = buffer.slice(..).get_mapped_range_mut();
                let len = contents.len().min(mapped.len());
                mapped[..len].copy_from_slice(&contents[..len]);
            }
            buffer.unmap();
        }

        let id = BufferId(self.buffers.len() as u32);
        self.buffers.push(buffer);
        id
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) {
        let Some(size) = NonZeroU64::new(data.len() as u64) else {
            return;
        };
        if size.get() % wgpu::COPY_BUFFER_ALIGNMENT != 0 || offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            debug_assert!(false, "unaligned write of {} bytes at {}", size, offset);
            warn!("Skipping unaligned write of {} bytes at offset {}", size, offset);
            return;
        }

        // Draws recorded so far must see the old contents.
        self.end_render_pass();

        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| new_encoder(device));
        self.belt
            .write_buffer(encoder, &self.buffers[buffer.index()], offset, size, device)
            .copy_from_slice(data);
    }

    fn dispatch(&mut self, kernel: Kernel, bindings: &[Binding], groups: u32) {
        if groups == 0 {
            return;
        }
        self.end_render_pass();

        let (pipeline, layout_kind, label) = match kernel {
            Kernel::ClearIndirectArgs => (&self.clear_pipeline, LayoutKind::Clear, "clear indirect args"),
            Kernel::Filter => (&self.filter_pipeline, LayoutKind::Filter, "triangle filter"),
        };
        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| new_encoder(device));
        let bind_group = cached_bind_group(
            &mut self.bind_groups,
            device,
            layout_kind,
            &pipeline.get_bind_group_layout(0),
            &self.buffers,
            bindings,
        );

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(groups, 1, 1);
    }

    fn set_draw_state(&mut self, state: &DrawState) {
        if self.draw_state.as_ref() != Some(state) {
            self.end_render_pass();
            self.draw_state = Some(*state);
        }
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32, base_vertex: i32, draw_id: u32) {
        debug_assert!(self.draw_state.is_some(), "draw without draw state");
        self.pending.push(PendingDraw::Indexed { index_count, first_index, base_vertex, draw_id });
    }

    fn draw_indexed_indirect(&mut self, arguments: BufferId, offset: u64) {
        debug_assert!(self.draw_state.is_some(), "draw without draw state");
        self.pending.push(PendingDraw::Indirect { arguments, offset });
    }

    fn multi_draw_indexed_indirect(&mut self, arguments: BufferId, offset: u64, count: u32) {
        debug_assert!(self.capabilities.multi_draw_indirect, "multi-draw without capability");
        debug_assert!(self.draw_state.is_some(), "draw without draw state");
        self.pending.push(PendingDraw::MultiIndirect { arguments, offset, count });
    }

    fn begin_query(&mut self) {
        self.end_render_pass();
        let Some(queries) = self.queries.as_mut() else {
            return;
        };
        debug_assert!(!queries.active, "nested pipeline statistics query");
        if let Some((_, status)) = queries.in_flight.take() {
            // An unread readback is abandoned; wait so the buffer can be reused.
            self.device.poll(wgpu::Maintain::Wait);
            if matches!(*status.lock(), Some(Ok(()))) {
                queries.readback.unmap();
            }
        }
        queries.active = true;
        queries.used = 0;
        queries.drained = 0;
        queries.result = None;
    }

    fn end_query(&mut self) {
        self.end_render_pass();
        let Some(queries) = self.queries.as_mut() else {
            return;
        };
        queries.active = false;
        if queries.used == 0 {
            queries.result = Some(queries.drained);
            return;
        }

        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| new_encoder(device));
        queries.record_resolve(encoder);
        self.submit_encoder();

        if let Some(queries) = self.queries.as_mut() {
            let status = queries.start_map();
            queries.in_flight = Some((queries.used, status));
        }
    }

    fn poll_query(&mut self) -> Option<PipelineStatistics> {
        let queries = self.queries.as_mut()?;
        if queries.result.is_none() {
            let (slots, status) = queries.in_flight.as_ref()?;
            let slots = *slots;
            self.device.poll(wgpu::Maintain::Poll);
            let done = status.lock().take();
            match done {
                None => return None,
                Some(Ok(())) => {
                    queries.result = Some(queries.drained + queries.read_sum(slots));
                }
                Some(Err(err)) => {
                    warn!("Statistics readback failed: {}", err);
                    queries.result = Some(queries.drained);
                }
            }
            queries.in_flight = None;
        }
        queries.result.map(|primitives| PipelineStatistics { primitives })
    }

    fn flush(&mut self) {
        self.submit();
        self.clear_depth = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usages_always_allow_uploads() {
        let storage = buffer_usages(BufferUsage::STRUCTURED);
        assert!(storage.contains(wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST));

        let args = buffer_usages(BufferUsage::UNORDERED_ACCESS | BufferUsage::INDIRECT);
        assert!(args.contains(wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::INDIRECT));
        assert!(!args.contains(wgpu::BufferUsages::VERTEX));
    }

    #[test]
    fn bind_group_keys_separate_layouts_and_slots() {
        let a = [Binding::read_only(3, BufferId(7)), Binding::uniform(1, BufferId(2))];
        let b = [Binding::read_write(3, BufferId(7)), Binding::uniform(1, BufferId(2))];
        assert_eq!(bind_group_key(LayoutKind::Depth, &a), bind_group_key(LayoutKind::Depth, &a));
        assert_ne!(bind_group_key(LayoutKind::Depth, &a), bind_group_key(LayoutKind::Filter, &a));
        assert_ne!(bind_group_key(LayoutKind::Depth, &a), bind_group_key(LayoutKind::Depth, &b));
    }
}
