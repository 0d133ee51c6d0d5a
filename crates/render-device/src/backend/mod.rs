//! The seam between the device layer and a native graphics API.
//!
//! The device layer is written once against [`Backend`]. A backend owns the
//! native objects (adapter, device, queue, command allocator and list,
//! descriptor heaps, swap chain, fence) and refers to resources through typed
//! ids so that nothing above this module touches native handles.

use std::{ops::Range, time::Duration};

use geometry::{Extent, Px};
use raw_window_handle::RawWindowHandle;

use crate::{
    command::Command,
    descriptor::{CpuDescriptor, HeapAddress, HeapKind},
    resource::{Format, PipelineId, ResourceDesc, ResourceId},
    Error, PowerPreference, Result,
};

pub mod headless;

#[cfg(target_os = "windows")]
pub mod dx12;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AdapterId(pub u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterInfo {
    pub id: AdapterId,
    pub name: String,
    pub vendor_id: u32,
    pub dedicated_video_memory: u64,
    /// Software rasterizers (WARP and friends) are never selected.
    pub is_software: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeatureLevel {
    Level12_0,
    Level12_1,
    Level12_2,
}

impl FeatureLevel {
    /// Candidate levels, best first.
    pub const DESCENDING: [Self; 3] = [Self::Level12_2, Self::Level12_1, Self::Level12_0];
}

/// Where presented images go.
#[derive(Clone, Copy, Debug)]
pub enum SurfaceTarget {
    Window(RawWindowHandle),
    /// No window. Only meaningful for backends that can present to nothing.
    Offscreen,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapChainDesc {
    pub extent: Extent<u32, Px>,
    pub format: Format,
    pub buffer_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewDesc {
    RenderTarget { format: Format },
    DepthStencil { format: Format },
    ShaderResource { format: Format, mip_levels: u16 },
}

impl ViewDesc {
    #[must_use]
    pub fn heap_kind(&self) -> HeapKind {
        match self {
            Self::RenderTarget { .. } => HeapKind::RenderTarget,
            Self::DepthStencil { .. } => HeapKind::DepthStencil,
            Self::ShaderResource { .. } => HeapKind::ShaderResource,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputElement {
    pub semantic: &'static str,
    pub format: Format,
    pub offset: u32,
}

/// Everything needed to build a graphics pipeline. The root signature is read
/// from `root_signature` if present and from the vertex shader otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineDesc {
    pub name: Option<String>,
    pub vertex_shader: Vec<u8>,
    pub pixel_shader: Vec<u8>,
    pub root_signature: Option<Vec<u8>>,
    pub input_layout: Vec<InputElement>,
    pub render_target_format: Format,
    pub depth_format: Option<Format>,
    pub alpha_blend: bool,
}

/// The bytes `offset..offset + len` of a mapped resource of `size` bytes, or
/// an error if they don't all lie inside it.
pub(crate) fn mapped_range(size: u64, offset: u64, len: usize) -> Result<Range<usize>> {
    let end = offset
        .checked_add(len as u64)
        .filter(|&end| end <= size)
        .ok_or_else(|| {
            Error::backend(
                "Map",
                format!("{len} bytes at offset {offset} do not fit in {size} bytes"),
            )
        })?;

    Ok(offset as usize..end as usize)
}

/// A native graphics API.
///
/// Methods take `&self`; implementations use interior mutability where the
/// native API doesn't already provide it. Calls are made from a single
/// rendering thread.
pub trait Backend {
    fn name(&self) -> &str;

    /// Lists adapters in the order the platform prefers them for `preference`.
    fn enumerate_adapters(&self, preference: PowerPreference) -> Result<Vec<AdapterInfo>>;

    /// Creates the logical device. Fails if `adapter` can't support `level`.
    fn create_device(&self, adapter: AdapterId, level: FeatureLevel) -> Result<()>;

    /// Creates the direct queue and the command allocator and list bound to
    /// it.
    fn create_command_objects(&self) -> Result<()>;

    fn descriptor_stride(&self, kind: HeapKind) -> u32;

    fn create_descriptor_heap(&self, kind: HeapKind, capacity: u32) -> Result<HeapAddress>;

    fn create_resource(&self, desc: &ResourceDesc) -> Result<ResourceId>;

    fn release_resource(&self, resource: ResourceId);

    /// Copies `data` into a resource on the upload heap.
    fn write_resource(&self, resource: ResourceId, offset: u64, data: &[u8]) -> Result<()>;

    /// Copies bytes out of a resource on the readback heap.
    fn read_resource(&self, resource: ResourceId, offset: u64, len: usize) -> Result<Vec<u8>>;

    fn create_view(&self, resource: ResourceId, view: &ViewDesc, at: CpuDescriptor) -> Result<()>;

    /// Creates the swap chain on the direct queue and returns its buffers,
    /// which start out in the present state.
    fn create_swap_chain(&self, target: SurfaceTarget, desc: &SwapChainDesc)
        -> Result<Vec<ResourceId>>;

    fn current_back_buffer_index(&self) -> Result<u32>;

    fn present(&self, sync_interval: u32) -> Result<()>;

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId>;

    /// Replays `commands` onto the native list, closes it and submits it.
    fn execute(&self, commands: &[Command]) -> Result<()>;

    fn reset_command_allocator(&self) -> Result<()>;

    fn create_fence(&self, initial_value: u64) -> Result<()>;

    /// Enqueues a signal of `value` behind all previously submitted work.
    fn signal(&self, value: u64) -> Result<()>;

    fn completed_value(&self) -> u64;

    /// Blocks until the fence reaches `value`. Returns `false` if `timeout`
    /// expired first.
    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_range_stays_inside_the_resource() {
        assert_eq!(mapped_range(256, 0, 256).unwrap(), 0..256);
        assert_eq!(mapped_range(256, 200, 56).unwrap(), 200..256);
        assert_eq!(mapped_range(256, 256, 0).unwrap(), 256..256);

        assert!(matches!(
            mapped_range(256, 200, 100),
            Err(Error::Backend { call: "Map", .. })
        ));
        assert!(mapped_range(0, 0, 1).is_err());
        assert!(mapped_range(256, u64::MAX, 2).is_err());
    }
}
