use std::rc::Rc;

use geometry::{Extent, Px, Rect, Viewport};
use log::debug;

use crate::{
    backend::{Backend, SurfaceTarget, SwapChainDesc, ViewDesc},
    descriptor::{DescriptorAllocator, DescriptorHandle, HeapKind},
    resource::{ClearValue, Format, ResourceDesc, ResourceFlags, ResourceId, ResourceState},
    Error, Result,
};

pub struct BackBuffer {
    pub resource: ResourceId,
    pub rtv: DescriptorHandle,
}

/// A `FrameSurface` owns the swap chain's images, one render-target view per
/// image, and the depth buffer that is shared by all of them.
pub struct FrameSurface {
    backend: Rc<dyn Backend>,
    extent: Extent<u32, Px>,
    back_buffers: Vec<BackBuffer>,
    depth_buffer: ResourceId,
    dsv: DescriptorHandle,
    viewport: Viewport,
    scissor: Rect<u32, Px>,
}

impl FrameSurface {
    /// Double-buffered swapchain.
    pub const BUFFER_COUNT: u32 = 2;
    /// Storage format of the swap-chain images.
    pub const FORMAT: Format = Format::Rgba8Unorm;
    /// Render-target views write through sRGB encoding.
    pub const RTV_FORMAT: Format = Format::Rgba8UnormSrgb;
    pub const DEPTH_FORMAT: Format = Format::D24UnormS8Uint;

    pub fn new(
        backend: Rc<dyn Backend>,
        descriptors: &mut DescriptorAllocator,
        target: SurfaceTarget,
        extent: Extent<u32, Px>,
    ) -> Result<Self> {
        let buffers = backend.create_swap_chain(
            target,
            &SwapChainDesc {
                extent,
                format: Self::FORMAT,
                buffer_count: Self::BUFFER_COUNT,
            },
        )?;

        let back_buffers = buffers
            .into_iter()
            .map(|resource| {
                let rtv = descriptors.heap_mut(HeapKind::RenderTarget).allocate()?;
                backend.create_view(
                    resource,
                    &ViewDesc::RenderTarget {
                        format: Self::RTV_FORMAT,
                    },
                    rtv.cpu,
                )?;
                Ok(BackBuffer { resource, rtv })
            })
            .collect::<Result<Vec<_>>>()?;

        let depth_buffer = backend.create_resource(
            &ResourceDesc::texture_2d(
                extent.width,
                extent.height,
                1,
                Self::DEPTH_FORMAT,
                ResourceState::DepthWrite,
            )
            .with_name("Depth Buffer")
            .with_flags(ResourceFlags::ALLOW_DEPTH_STENCIL)
            .with_clear_value(ClearValue::DepthStencil {
                format: Self::DEPTH_FORMAT,
                depth: 1.0,
                stencil: 0,
            }),
        )?;

        let dsv = descriptors.heap_mut(HeapKind::DepthStencil).allocate()?;
        backend.create_view(
            depth_buffer,
            &ViewDesc::DepthStencil {
                format: Self::DEPTH_FORMAT,
            },
            dsv.cpu,
        )?;

        let viewport = Viewport::covering(extent);
        let scissor = viewport.scissor(extent);

        debug!(
            "created {}x{} surface with {} back buffers",
            extent.width,
            extent.height,
            back_buffers.len()
        );

        Ok(Self {
            backend,
            extent,
            back_buffers,
            depth_buffer,
            dsv,
            viewport,
            scissor,
        })
    }

    /// Asks the presentation engine which image to render into next. This is
    /// not necessarily the image after the one last presented.
    pub fn current_back_buffer_index(&self) -> Result<u32> {
        let index = self.backend.current_back_buffer_index()?;
        if index as usize >= self.back_buffers.len() {
            return Err(Error::backend(
                "GetCurrentBackBufferIndex",
                format!("index {index} is out of range"),
            ));
        }
        Ok(index)
    }

    /// Panics if `index` was not returned by
    /// [`Self::current_back_buffer_index`].
    #[must_use]
    pub fn back_buffer(&self, index: u32) -> &BackBuffer {
        &self.back_buffers[index as usize]
    }

    #[must_use]
    pub fn back_buffers(&self) -> &[BackBuffer] {
        &self.back_buffers
    }

    #[must_use]
    pub fn depth_buffer(&self) -> ResourceId {
        self.depth_buffer
    }

    #[must_use]
    pub fn dsv(&self) -> DescriptorHandle {
        self.dsv
    }

    #[must_use]
    pub fn extent(&self) -> Extent<u32, Px> {
        self.extent
    }

    #[must_use]
    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    #[must_use]
    pub fn scissor(&self) -> Rect<u32, Px> {
        self.scissor
    }

    /// Presents the current image. Image contents are discarded afterwards.
    pub fn present(&self, sync_interval: u32) -> Result<()> {
        self.backend.present(sync_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        headless::{HeadlessBackend, HeadlessConfig},
        AdapterId, FeatureLevel,
    };

    #[test]
    fn surface_views_and_depth() {
        let backend = HeadlessBackend::new(HeadlessConfig::default());
        backend
            .create_device(AdapterId(0), FeatureLevel::Level12_0)
            .unwrap();
        backend.create_command_objects().unwrap();
        let probe = backend.probe();
        let backend: Rc<dyn Backend> = Rc::new(backend);

        let mut descriptors = DescriptorAllocator::new(&backend, 2, 16).unwrap();
        let surface = FrameSurface::new(
            backend.clone(),
            &mut descriptors,
            SurfaceTarget::Offscreen,
            Extent::new(1280, 720),
        )
        .unwrap();

        assert_eq!(surface.back_buffers().len(), 2);
        assert_eq!(surface.back_buffer(0).rtv.index, 0);
        assert_eq!(surface.back_buffer(1).rtv.index, 1);
        assert_ne!(surface.back_buffer(0).rtv.cpu, surface.back_buffer(1).rtv.cpu);
        assert_eq!(descriptors.heap(HeapKind::RenderTarget).allocated(), 2);
        assert_eq!(descriptors.heap(HeapKind::DepthStencil).allocated(), 1);

        assert_eq!(
            probe.resource_state(surface.back_buffer(0).resource),
            Some(ResourceState::Present)
        );
        assert_eq!(
            probe.resource_state(surface.depth_buffer()),
            Some(ResourceState::DepthWrite)
        );

        assert_eq!(surface.viewport().width, 1280.0);
        assert_eq!(surface.scissor().extent(), Extent::new(1280, 720));
        assert_eq!(surface.current_back_buffer_index().unwrap(), 0);
    }

    #[test]
    fn third_buffer_does_not_fit() {
        let backend = HeadlessBackend::new(HeadlessConfig::default());
        backend
            .create_device(AdapterId(0), FeatureLevel::Level12_0)
            .unwrap();
        backend.create_command_objects().unwrap();
        let backend: Rc<dyn Backend> = Rc::new(backend);

        let mut descriptors = DescriptorAllocator::new(&backend, 1, 16).unwrap();
        assert!(matches!(
            FrameSurface::new(
                backend,
                &mut descriptors,
                SurfaceTarget::Offscreen,
                Extent::new(64, 64)
            ),
            Err(Error::DescriptorHeapExhausted {
                kind: HeapKind::RenderTarget,
                ..
            })
        ));
    }
}
