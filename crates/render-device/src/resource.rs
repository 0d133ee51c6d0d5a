//! Backend-neutral descriptions of GPU resources and their usage states.

use bitflags::bitflags;

/// Opaque handle to a resource owned by a [`crate::Backend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u32);

impl ResourceId {
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Opaque handle to a compiled pipeline state object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineId(u32);

impl PipelineId {
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// The usage mode a resource is in. Transitions between states are declared
/// with barriers; using a resource in any other state is undefined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    Present,
    RenderTarget,
    DepthWrite,
    DepthRead,
    CopySource,
    CopyDest,
    PixelShaderResource,
    VertexAndConstantBuffer,
    IndexBuffer,
    GenericRead,
}

/// Where a resource's memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// Device-local memory. Not CPU accessible.
    Default,
    /// Write-combined host memory that the GPU reads from.
    Upload,
    /// Host memory that the GPU writes to for the CPU to read.
    Readback,
}

impl HeapType {
    /// Resources on CPU-visible heaps can't transition out of this state.
    #[must_use]
    pub fn required_state(self) -> Option<ResourceState> {
        match self {
            Self::Default => None,
            Self::Upload => Some(ResourceState::GenericRead),
            Self::Readback => Some(ResourceState::CopyDest),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    D24UnormS8Uint,
    R16Uint,
    R32Uint,
    Rg32Float,
    Rgb32Float,
    Rgba32Float,
}

impl Format {
    #[must_use]
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::R16Uint => 2,
            Self::Rgba8Unorm | Self::Rgba8UnormSrgb | Self::D24UnormS8Uint | Self::R32Uint => 4,
            Self::Rg32Float => 8,
            Self::Rgb32Float => 12,
            Self::Rgba32Float => 16,
        }
    }

    #[must_use]
    pub fn is_srgb(self) -> bool {
        matches!(self, Self::Rgba8UnormSrgb)
    }

    #[must_use]
    pub fn is_depth(self) -> bool {
        matches!(self, Self::D24UnormS8Uint)
    }

    /// The typeless storage shared by a format and its sRGB view variant.
    #[must_use]
    pub fn storage(self) -> Self {
        match self {
            Self::Rgba8UnormSrgb => Self::Rgba8Unorm,
            other => other,
        }
    }
}

bitflags! {
    #[derive(Default)]
    pub struct ResourceFlags: u32 {
        const ALLOW_RENDER_TARGET = 1 << 0;
        const ALLOW_DEPTH_STENCIL = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color { format: Format, color: [f32; 4] },
    DepthStencil { format: Format, depth: f32, stencil: u8 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceDimension {
    Buffer {
        size: u64,
    },
    Texture2d {
        width: u32,
        height: u32,
        mip_levels: u16,
        format: Format,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResourceDesc {
    pub name: Option<String>,
    pub heap: HeapType,
    pub dimension: ResourceDimension,
    pub flags: ResourceFlags,
    pub initial_state: ResourceState,
    pub clear_value: Option<ClearValue>,
}

impl ResourceDesc {
    #[must_use]
    pub fn buffer(heap: HeapType, size: u64, initial_state: ResourceState) -> Self {
        Self {
            name: None,
            heap,
            dimension: ResourceDimension::Buffer { size },
            flags: ResourceFlags::empty(),
            initial_state,
            clear_value: None,
        }
    }

    #[must_use]
    pub fn texture_2d(
        width: u32,
        height: u32,
        mip_levels: u16,
        format: Format,
        initial_state: ResourceState,
    ) -> Self {
        Self {
            name: None,
            heap: HeapType::Default,
            dimension: ResourceDimension::Texture2d {
                width,
                height,
                mip_levels,
                format,
            },
            flags: ResourceFlags::empty(),
            initial_state,
            clear_value: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_clear_value(mut self, clear_value: ClearValue) -> Self {
        self.clear_value = Some(clear_value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_shares_storage() {
        assert_eq!(Format::Rgba8UnormSrgb.storage(), Format::Rgba8Unorm);
        assert_eq!(Format::D24UnormS8Uint.storage(), Format::D24UnormS8Uint);
        assert_eq!(
            Format::Rgba8UnormSrgb.bytes_per_pixel(),
            Format::Rgba8Unorm.bytes_per_pixel()
        );
    }

    #[test]
    fn cpu_heaps_are_pinned() {
        assert_eq!(
            HeapType::Upload.required_state(),
            Some(ResourceState::GenericRead)
        );
        assert_eq!(
            HeapType::Readback.required_state(),
            Some(ResourceState::CopyDest)
        );
        assert_eq!(HeapType::Default.required_state(), None);
    }
}
