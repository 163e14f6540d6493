// src/config.rs
//! Configuration knobs for the geometry filter and the demo driver.
//!
//! Everything here is plain data with `Default` + `serde` so it can be
//! loaded from JSON once at startup.

use std::path::Path;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::ensure;
use crate::error::Result;

/// Largest workgroup count a single compute dispatch may use per dimension.
pub const MAX_DISPATCH_GROUPS: u32 = 65_535;

bitflags! {
    /// Cull tests selected for a frame.
    ///
    /// The bits are passed through to the filter kernel untouched. Only
    /// [`FilterFlags::CLUSTER_BACKFACE`] is evaluated on the CPU.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(from = "u32", into = "u32")]
    pub struct FilterFlags: u32 {
        const DUPLICATE_INDICES = 0x1;
        const BACKFACE = 0x2;
        const FRUSTUM = 0x8;
        const SMALL_PRIMITIVES = 0x20;
        const CLUSTER_BACKFACE = 0x1 << 10;
    }
}

// Unknown bits are retained so the kernel sees exactly what the caller set.
impl From<u32> for FilterFlags {
    fn from(bits: u32) -> Self {
        Self::from_bits_retain(bits)
    }
}

impl From<FilterFlags> for u32 {
    fn from(flags: FilterFlags) -> Self {
        flags.bits()
    }
}

impl Default for FilterFlags {
    fn default() -> Self {
        Self::all()
    }
}

/// Creation-time settings of a [`GeometryFilter`](crate::filter::GeometryFilter).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterDesc {
    /// Upper bound on unfiltered draw calls per frame. Every instance counts
    /// as one draw. `None` assumes each registered mesh is drawn once.
    pub maximum_draw_call_count: Option<u32>,
    /// Submit one indirect draw per slot even if the backend can merge them.
    pub emulate_multi_indirect_draw: bool,
    /// Batch slots (and draw-call slots) per small batch chunk.
    pub batch_count: u32,
    /// Number of chunks cycled round-robin within a frame.
    pub chunk_count: usize,
}

impl Default for FilterDesc {
    fn default() -> Self {
        Self {
            maximum_draw_call_count: None,
            emulate_multi_indirect_draw: false,
            batch_count: 1024,
            chunk_count: 16,
        }
    }
}

impl FilterDesc {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_count > 0, "batch_count must be at least 1");
        ensure!(
            self.batch_count <= MAX_DISPATCH_GROUPS,
            "batch_count {} exceeds the dispatch limit of {}",
            self.batch_count,
            MAX_DISPATCH_GROUPS
        );
        ensure!(self.chunk_count > 0, "chunk_count must be at least 1");
        if let Some(max) = self.maximum_draw_call_count {
            ensure!(max > 0, "maximum_draw_call_count must be at least 1 when set");
        }
        Ok(())
    }
}

/// Per-frame options passed to `begin_render`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// When false, every instance is drawn directly without clustering.
    pub enable_filtering: bool,
    pub enabled_filters: FilterFlags,
    /// Gather [`FilterStatistics`](crate::filter::FilterStatistics). Blocks on
    /// a GPU query after every submission, so it is slow.
    pub collect_statistics: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            enable_filtering: true,
            enabled_filters: FilterFlags::all(),
            collect_statistics: false,
        }
    }
}

/// Settings of the headless demo binary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub filter: FilterDesc,
    pub render: RenderOptions,
    /// Number of generated meshes.
    pub mesh_count: u32,
    /// Mean face count per generated mesh.
    pub faces_per_mesh: u32,
    /// Maximum deviation from `faces_per_mesh`.
    pub face_variance: u32,
    /// Instances drawn per mesh each frame.
    pub instances_per_mesh: u32,
    pub frames: u32,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            filter: FilterDesc::default(),
            render: RenderOptions {
                collect_statistics: true,
                ..RenderOptions::default()
            },
            mesh_count: 16,
            faces_per_mesh: 8192,
            face_variance: 2048,
            instances_per_mesh: 4,
            frames: 8,
            width: 1280,
            height: 720,
            seed: 0x5eed,
        }
    }
}

impl DemoConfig {
    /// Load from a JSON file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Instances drawn per frame, which is also the unfiltered draw count.
    pub fn draw_count(&self) -> u32 {
        self.mesh_count.saturating_mul(self.instances_per_mesh)
    }

    /// Filter settings with the unfiltered draw-call limit sized to the
    /// demo's scene when it is not set explicitly.
    pub fn filter_desc(&self) -> FilterDesc {
        FilterDesc {
            maximum_draw_call_count: Some(
                self.filter.maximum_draw_call_count.unwrap_or(self.draw_count().max(1)),
            ),
            ..self.filter.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.filter.validate()?;
        ensure!(self.mesh_count > 0, "mesh_count must be at least 1");
        if let Some(max) = self.filter.maximum_draw_call_count {
            ensure!(
                max >= self.draw_count(),
                "maximum_draw_call_count {} is below the {} instances drawn per frame",
                max,
                self.draw_count()
            );
        }
        ensure!(self.faces_per_mesh >= 2, "faces_per_mesh must be at least 2");
        ensure!(
            self.width > 0 && self.height > 0,
            "render target must be non-empty, got {}x{}",
            self.width,
            self.height
        );
        Ok(())
    }
}
