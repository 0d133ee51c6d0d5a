//! Low-level graphics device layer.
//!
//! ## Goals
//!
//! - Own the GPU and everything that talks to it directly.
//!  - Adapter and feature-level selection.
//!  - One direct queue, one command allocator, one command list.
//!  - Double-buffered presentation with a depth buffer.
//!  - Fixed-capacity descriptor heaps with stable slot indices.
//!  - A single fence for CPU/GPU synchronization.
//! - Move data into GPU memory.
//!  - Vertex, index and constant buffers.
//!  - Textures, including full mip chains.
//!   - Note: staging memory is released only once the fence says the GPU is
//!     done with it, never by the caller.
//! - Wrap every frame in the same protocol: transition, clear, record,
//!   transition back, submit, present, wait.
//!
//! ## Thoughts & Rationale
//!
//! - Everything above [`backend::Backend`] is written once. The Direct3D 12
//!   backend is the one that ships; the headless backend is a software GPU
//!   that checks resource states the way the debug layer does, and is what
//!   the tests run against.
//! - CPU and GPU work is serialized once per frame. This caps throughput, but
//!   means the allocator and staging memory can never be reused early.
//! - Device loss is not recovered from. A fence wait that doesn't return in
//!   time is reported as [`Error::DeviceLost`] and the context is unusable
//!   afterwards.

use std::time::Duration;

use geometry::{Extent, Px};

pub mod backend;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod image;
pub mod logging;
pub mod pacing;
pub mod resource;
pub mod shader;
pub mod surface;
pub mod sync;
pub mod texture;
pub mod upload;

pub use backend::{Backend, FeatureLevel, SurfaceTarget};
pub use descriptor::{DescriptorHandle, HeapKind, MAX_SRV_COUNT};
pub use error::{Error, Result};
pub use frame::{FrameRecorder, FrameState, GraphicsContext};
pub use self::image::{ImageDecoder, MipChain, PngDecoder};
pub use pacing::PacingConfig;
pub use texture::{TextureHandle, TextureRegistry};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Self = Self {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };

    pub const WHITE: Self = Self {
        r: 1.0,
        g: 1.0,
        b: 1.0,
        a: 1.0,
    };

    /// The default clear color.
    pub const SLATE: Self = Self {
        r: 0.1,
        g: 0.25,
        b: 0.5,
        a: 1.0,
    };

    #[must_use]
    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PowerPreference {
    LowPower,
    #[default]
    HighPerformance,
}

#[derive(Clone, Debug)]
pub struct GraphicsConfig {
    /// Whether or not to enable debugging features.
    ///
    /// This may have an outsized impact on performance. Defaults to `None`,
    /// which automatically enables debugging features in debug builds. Override
    /// with `Some(true)` or `Some(false)` to force enable or disable debugging.
    pub debug_mode: Option<bool>,

    /// The power preference used to order adapters.
    ///
    /// `LowPower` prefers integrated GPUs over discrete GPUs, and
    /// `HighPerformance` does the reverse. Defaults to `HighPerformance`.
    pub power_preference: PowerPreference,

    /// Feature levels to try, in any order. The highest one the adapter
    /// supports is used. Defaults to 12.2, 12.1 and 12.0.
    pub feature_levels: Vec<FeatureLevel>,

    /// The size of the output, in pixels. Defaults to 1280x720.
    pub extent: Extent<u32, Px>,

    /// The number of shader-resource descriptor slots. Defaults to
    /// [`MAX_SRV_COUNT`].
    pub srv_capacity: u32,

    /// Reserve the first shader-resource slot for the diagnostic overlay, so
    /// that textures start at slot 1. Defaults to `true`.
    pub reserve_overlay_slot: bool,

    /// Defaults to [`Color::SLATE`].
    pub clear_color: Color,

    /// How long to wait on the fence before declaring the device lost.
    /// `None` waits forever. Defaults to 10 seconds.
    pub fence_timeout: Option<Duration>,

    /// Hold frames to a fixed rate. Defaults to 60 Hz; `None` disables
    /// pacing.
    pub frame_pacing: Option<PacingConfig>,

    /// Passed through to present. Defaults to 0, since frames are paced
    /// on the CPU.
    pub sync_interval: u32,
}

impl GraphicsConfig {
    #[must_use]
    pub fn debug_enabled(&self) -> bool {
        self.debug_mode.unwrap_or(cfg!(debug_assertions))
    }
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            debug_mode: None,
            power_preference: PowerPreference::HighPerformance,
            feature_levels: FeatureLevel::DESCENDING.to_vec(),
            extent: Extent::new(1280, 720),
            srv_capacity: MAX_SRV_COUNT,
            reserve_overlay_slot: true,
            clear_color: Color::SLATE,
            fence_timeout: Some(Duration::from_secs(10)),
            frame_pacing: Some(PacingConfig::SIXTY_HZ),
            sync_interval: 0,
        }
    }
}
