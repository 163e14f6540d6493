// src/mesh_registry.rs
//! Mesh registry: every registered mesh lives in one shared vertex buffer and
//! one shared index buffer. Meshes are stored in an arena indexed by
//! [`MeshHandle`] and are never freed individually.

use log::{debug, info};

use crate::cluster::{build_clusters, cluster_count, Cluster};
use crate::gpu::{byte_size, BufferDesc, BufferId, BufferUsage, GpuBackend, MeshConstants};

/// Bytes per vertex position (`float3`).
pub const VERTEX_STRIDE: u64 = 12;

/// Bytes per index (`u32`).
pub const INDEX_STRIDE: u64 = 4;

/// Index of a registered mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct MeshHandle(pub(crate) u32);

impl MeshHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One mesh's range inside the shared storage plus its clusters.
#[derive(Clone, Debug)]
pub struct Mesh {
    pub index: u32,
    pub vertex_count: u32,
    pub face_count: u32,
    pub index_count: u32,
    /// Byte offset into the shared vertex buffer.
    pub vertex_offset: u64,
    /// Byte offset into the shared index buffer.
    pub index_offset: u64,
    /// Empty until the mesh data has been set.
    pub clusters: Vec<Cluster>,
    has_data: bool,
}

impl Mesh {
    #[inline]
    pub fn has_data(&self) -> bool {
        self.has_data
    }

    /// Offsets in elements, as the filter kernel reads them.
    pub fn constants(&self) -> MeshConstants {
        MeshConstants {
            vertex_count: self.vertex_count,
            face_count: self.face_count,
            index_offset: (self.index_offset / INDEX_STRIDE) as u32,
            vertex_offset: (self.vertex_offset / VERTEX_STRIDE) as u32,
        }
    }
}

/// Where a mesh's geometry lives, for callers drawing it themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshBuffers {
    pub vertex_buffer: BufferId,
    pub vertex_offset: u64,
    pub index_buffer: BufferId,
    pub index_offset: u64,
}

/// Buffers shared by all meshes.
#[derive(Clone, Copy, Debug)]
pub struct SharedStorage {
    pub vertices: BufferId,
    pub indices: BufferId,
    pub mesh_constants: BufferId,
}

#[derive(Debug, Default)]
pub struct MeshRegistry {
    meshes: Vec<Mesh>,
    storage: Option<SharedStorage>,
}

impl MeshRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve shared storage for all meshes and assign their ranges.
    ///
    /// Must be called exactly once.
    pub fn allocate<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        vertex_counts: &[u32],
        face_counts: &[u32],
    ) -> Vec<MeshHandle> {
        assert!(self.storage.is_none(), "mesh registry allocated twice");
        assert_eq!(
            vertex_counts.len(),
            face_counts.len(),
            "vertex and face count tables differ in length"
        );

        let mut vertex_offset = 0u64;
        let mut index_offset = 0u64;
        self.meshes = vertex_counts
            .iter()
            .zip(face_counts)
            .enumerate()
            .map(|(i, (&vertex_count, &face_count))| {
                let index_count = face_count * 3;
                let mesh = Mesh {
                    index: i as u32,
                    vertex_count,
                    face_count,
                    index_count,
                    vertex_offset,
                    index_offset,
                    clusters: Vec::new(),
                    has_data: false,
                };
                vertex_offset += u64::from(vertex_count) * VERTEX_STRIDE;
                index_offset += u64::from(index_count) * INDEX_STRIDE;
                mesh
            })
            .collect();

        let vertices = backend.create_buffer(
            &BufferDesc {
                label: "global vertex buffer",
                size: vertex_offset,
                usage: BufferUsage::VERTEX | BufferUsage::STRUCTURED | BufferUsage::UPLOAD,
            },
            None,
        );
        let indices = backend.create_buffer(
            &BufferDesc {
                label: "global index buffer",
                size: index_offset,
                usage: BufferUsage::INDEX | BufferUsage::STRUCTURED | BufferUsage::UPLOAD,
            },
            None,
        );

        let constants: Vec<MeshConstants> = self.meshes.iter().map(Mesh::constants).collect();
        let mesh_constants = backend.create_buffer(
            &BufferDesc {
                label: "mesh constants",
                size: byte_size::<MeshConstants>(constants.len()),
                usage: BufferUsage::STRUCTURED,
            },
            Some(bytemuck::cast_slice(&constants)),
        );

        self.storage = Some(SharedStorage { vertices, indices, mesh_constants });

        info!(
            "Registered {} meshes ({} vertex bytes, {} index bytes)",
            self.meshes.len(),
            vertex_offset,
            index_offset
        );

        (0..self.meshes.len() as u32).map(MeshHandle).collect()
    }

    /// Upload one mesh's positions and mesh-relative indices and build its
    /// clusters. Once per mesh, after [`allocate`](Self::allocate).
    pub fn set_data<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        handle: MeshHandle,
        positions: &[[f32; 3]],
        indices: &[u32],
    ) {
        let storage = self.storage.expect("set_data called before allocate");
        let mesh = &mut self.meshes[handle.index()];

        debug_assert!(!mesh.has_data, "mesh {} data set twice", mesh.index);
        debug_assert_eq!(positions.len(), mesh.vertex_count as usize, "vertex count mismatch");
        debug_assert_eq!(indices.len(), mesh.index_count as usize, "index count mismatch");

        backend.write_buffer(storage.vertices, mesh.vertex_offset, bytemuck::cast_slice(positions));
        backend.write_buffer(storage.indices, mesh.index_offset, bytemuck::cast_slice(indices));

        mesh.clusters = build_clusters(positions, indices);
        mesh.has_data = true;

        debug!(
            "Mesh {}: {} faces in {} clusters ({} invalid)",
            mesh.index,
            mesh.face_count,
            mesh.clusters.len(),
            mesh.clusters.iter().filter(|c| !c.valid).count()
        );
        debug_assert_eq!(mesh.clusters.len() as u32, cluster_count(mesh.face_count));
    }

    #[inline]
    pub fn get_mesh(&self, handle: MeshHandle) -> &Mesh {
        &self.meshes[handle.index()]
    }

    #[inline]
    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    /// `None` before [`allocate`](Self::allocate).
    #[inline]
    pub fn storage(&self) -> Option<SharedStorage> {
        self.storage
    }

    /// True if `handle` addresses a registered mesh.
    #[inline]
    pub fn contains(&self, handle: MeshHandle) -> bool {
        handle.index() < self.meshes.len()
    }

    pub fn buffers_for_mesh(&self, handle: MeshHandle) -> MeshBuffers {
        let storage = self.storage.expect("buffers_for_mesh called before allocate");
        let mesh = self.get_mesh(handle);
        MeshBuffers {
            vertex_buffer: storage.vertices,
            vertex_offset: mesh.vertex_offset,
            index_buffer: storage.indices,
            index_offset: mesh.index_offset,
        }
    }

    #[inline]
    pub fn index_count(&self, handle: MeshHandle) -> u32 {
        self.get_mesh(handle).index_count
    }
}
