//! The per-frame protocol.
//!
//! ```text
//!            begin_frame                 end_frame
//!   Idle ---------------> Recording ---------------> Submitted
//!    ^                                                   |
//!    +------------- fence reached, allocator reset ------+
//! ```
//!
//! `begin_frame` moves the current back buffer from present to render-target
//! state, binds and clears it along with the depth buffer, and sets the
//! viewport. Draws are recorded through the returned [`FrameRecorder`].
//! `end_frame` moves the back buffer back to present state, submits, presents
//! and then blocks until the GPU has finished the frame, after which the
//! allocator, the list and any staging memory from the frame are recycled.

use std::rc::Rc;

use bytemuck::Pod;
use log::{debug, error, trace};

use crate::{
    backend::{Backend, PipelineDesc, SurfaceTarget, ViewDesc},
    command::{Command, CommandAllocator, CommandList, PrimitiveTopology},
    descriptor::{DescriptorAllocator, DescriptorHandle, HeapKind},
    device::DeviceContext,
    image::MipChain,
    pacing::{FramePacer, SystemClock},
    resource::{Format, PipelineId, ResourceState},
    surface::FrameSurface,
    sync::{FenceValue, FrameSynchronizer},
    upload::{Buffer, GarbageQueue, Texture, UploadPipeline},
    Error, GraphicsConfig, Result,
};

/// The name of the shader-resource range held for the diagnostic overlay.
pub const OVERLAY_RESERVATION: &str = "overlay";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording,
    Submitted,
}

/// Everything needed to render: the device, its descriptor heaps, the
/// presentation surface, the fence, and the single command list.
pub struct GraphicsContext {
    config: GraphicsConfig,
    device: DeviceContext,
    descriptors: DescriptorAllocator,
    surface: FrameSurface,
    sync: FrameSynchronizer,
    uploads: UploadPipeline,
    pacer: Option<FramePacer>,
    allocator: CommandAllocator,
    list: CommandList,
    garbage: GarbageQueue,
    state: FrameState,
    frame_index: u64,
    back_buffer: u32,
}

impl GraphicsContext {
    /// Creates the device, descriptor heaps, swap chain, depth buffer and
    /// fence, in that order.
    pub fn new(
        backend: Rc<dyn Backend>,
        target: SurfaceTarget,
        config: GraphicsConfig,
    ) -> Result<Self> {
        if config.debug_enabled() {
            debug!("graphics debugging enabled");
        }

        let device = DeviceContext::new(backend.clone(), &config)?;

        let mut descriptors =
            DescriptorAllocator::new(&backend, FrameSurface::BUFFER_COUNT, config.srv_capacity)?;

        if config.reserve_overlay_slot {
            descriptors
                .heap_mut(HeapKind::ShaderResource)
                .reserve(OVERLAY_RESERVATION, 1)?;
        }

        let surface = FrameSurface::new(backend.clone(), &mut descriptors, target, config.extent)?;
        let sync = FrameSynchronizer::new(backend.clone(), config.fence_timeout)?;
        let uploads = UploadPipeline::new(backend);

        let pacer = config
            .frame_pacing
            .map(|pacing| FramePacer::new(pacing, Box::new(SystemClock::new())));

        Ok(Self {
            config,
            device,
            descriptors,
            surface,
            sync,
            uploads,
            pacer,
            allocator: CommandAllocator::default(),
            list: CommandList::new(),
            garbage: GarbageQueue::default(),
            state: FrameState::Idle,
            frame_index: 0,
            back_buffer: 0,
        })
    }

    /// Replaces the frame pacer, or disables pacing with `None`.
    pub fn set_frame_pacer(&mut self, pacer: Option<FramePacer>) {
        self.pacer = pacer;
    }

    #[must_use]
    pub fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    #[must_use]
    pub fn backend(&self) -> &Rc<dyn Backend> {
        self.device.backend()
    }

    #[must_use]
    pub fn descriptors(&self) -> &DescriptorAllocator {
        &self.descriptors
    }

    #[must_use]
    pub fn surface(&self) -> &FrameSurface {
        &self.surface
    }

    #[must_use]
    pub fn sync(&self) -> &FrameSynchronizer {
        &self.sync
    }

    #[must_use]
    pub fn uploads(&self) -> &UploadPipeline {
        &self.uploads
    }

    #[must_use]
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// The number of frames that have completed.
    #[must_use]
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Staging buffers still waiting on the GPU.
    #[must_use]
    pub fn pending_uploads(&self) -> usize {
        self.garbage.len()
    }

    /// The back buffer chosen by the last `begin_frame`.
    #[must_use]
    pub fn back_buffer_index(&self) -> u32 {
        self.back_buffer
    }

    fn expect_state(&self, expected: FrameState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidFrameState {
                expected,
                actual: self.state,
            })
        }
    }

    pub fn begin_frame(&mut self) -> Result<FrameRecorder<'_>> {
        self.expect_state(FrameState::Idle)?;

        self.back_buffer = self.surface.current_back_buffer_index()?;
        let back_buffer = self.surface.back_buffer(self.back_buffer);
        let dsv = self.surface.dsv().cpu;

        self.list.barrier(
            back_buffer.resource,
            ResourceState::Present,
            ResourceState::RenderTarget,
        )?;

        self.list.record(Command::SetRenderTargets {
            render_target: back_buffer.rtv.cpu,
            depth_stencil: Some(dsv),
        })?;
        self.list.record(Command::ClearRenderTarget {
            view: back_buffer.rtv.cpu,
            color: self.config.clear_color.to_array(),
        })?;
        self.list.record(Command::ClearDepthStencil {
            view: dsv,
            depth: 1.0,
            stencil: 0,
        })?;
        self.list
            .record(Command::SetViewport(self.surface.viewport()))?;
        self.list.record(Command::SetScissor(self.surface.scissor()))?;
        self.list
            .record(Command::SetDescriptorHeap(HeapKind::ShaderResource))?;

        trace!(
            "frame {} recording into back buffer {}",
            self.frame_index,
            self.back_buffer
        );

        self.state = FrameState::Recording;
        Ok(FrameRecorder { context: self })
    }

    /// The recorder for the frame in progress.
    pub fn recorder(&mut self) -> Result<FrameRecorder<'_>> {
        self.expect_state(FrameState::Recording)?;
        Ok(FrameRecorder { context: self })
    }

    /// Ends the frame, presents it, and waits for the GPU to finish it.
    pub fn end_frame(&mut self) -> Result<()> {
        self.expect_state(FrameState::Recording)?;

        let back_buffer = self.surface.back_buffer(self.back_buffer).resource;
        self.list.barrier(
            back_buffer,
            ResourceState::RenderTarget,
            ResourceState::Present,
        )?;

        if let Some(pacer) = &mut self.pacer {
            pacer.pace();
        }

        self.submit()?;
        self.surface.present(self.config.sync_interval)?;
        self.finish_submission()?;

        self.frame_index += 1;
        Ok(())
    }

    /// Submits whatever has been recorded outside of a frame, such as texture
    /// uploads, and waits for it to complete.
    pub fn submit_and_wait(&mut self) -> Result<FenceValue> {
        self.expect_state(FrameState::Idle)?;
        self.submit()?;
        self.finish_submission()
    }

    fn submit(&mut self) -> Result<()> {
        self.list.close()?;
        self.state = FrameState::Submitted;

        self.backend().execute(self.list.commands())?;
        self.allocator.mark_submitted(self.sync.next_value().0);
        Ok(())
    }

    /// Waits for the submission and recycles everything it used.
    fn finish_submission(&mut self) -> Result<FenceValue> {
        let value = self.sync.signal_and_wait()?;
        let completed = self.sync.completed();

        let released = self.garbage.collect(self.device.backend().as_ref(), completed);
        if released > 0 {
            trace!("released {} staging buffers at fence {}", released, completed.0);
        }

        self.allocator.reset(completed.0)?;
        self.backend().reset_command_allocator()?;
        self.list.reset(&self.allocator)?;

        self.state = FrameState::Idle;
        Ok(value)
    }

    pub fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId> {
        self.backend().create_pipeline(desc)
    }

    /// The descriptor handle of a shader-resource slot.
    pub fn srv_handle(&self, slot: u32) -> Result<DescriptorHandle> {
        self.descriptors.handle_at(HeapKind::ShaderResource, slot)
    }

    /// Claims `count` shader-resource slots by name. Only possible before any
    /// texture has been created.
    pub fn reserve_srv(&mut self, name: &str, count: u32) -> Result<std::ops::Range<u32>> {
        self.descriptors
            .heap_mut(HeapKind::ShaderResource)
            .reserve(name, count)
    }

    /// Creates a texture, records its upload on the current list, and gives
    /// it a shader-resource view. The data is on the GPU once the next
    /// submission completes. A failure leaves no texture, staging buffer or
    /// slot behind.
    pub fn create_texture(&mut self, image: &MipChain) -> Result<(Texture, DescriptorHandle)> {
        if self.state == FrameState::Submitted {
            return Err(Error::InvalidFrameState {
                expected: FrameState::Idle,
                actual: self.state,
            });
        }

        // Once the upload is recorded the slot can no longer be refused.
        let heap = self.descriptors.heap(HeapKind::ShaderResource);
        if heap.allocated() >= heap.capacity() {
            return Err(Error::DescriptorHeapExhausted {
                kind: HeapKind::ShaderResource,
                capacity: heap.capacity(),
            });
        }

        let texture = self.uploads.create_gpu_texture(&image.metadata())?;
        let fence = self.sync.next_value();
        match self
            .uploads
            .upload_texture(&mut self.list, &texture, image, fence)
        {
            Ok(pending) => self.garbage.retire(pending),
            Err(e) => {
                self.backend().release_resource(texture.id);
                return Err(e);
            }
        }

        let handle = self
            .descriptors
            .heap_mut(HeapKind::ShaderResource)
            .allocate()?;

        let view = self.backend().create_view(
            texture.id,
            &ViewDesc::ShaderResource {
                format: image.format(),
                mip_levels: image.mip_levels(),
            },
            handle.cpu,
        );
        if let Err(e) = view {
            self.garbage.retire_resource(texture.id, fence);
            return Err(e);
        }

        debug!(
            "texture {:?} ({}x{}) in shader-resource slot {}",
            texture.id,
            image.width(),
            image.height(),
            handle.index
        );

        Ok((texture, handle))
    }

    /// A buffer the CPU writes directly, for data that changes every frame.
    pub fn create_upload_buffer(&self, size: u64) -> Result<Buffer> {
        self.uploads.create_upload_buffer(size)
    }

    pub fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        self.uploads.write_buffer(buffer, offset, data)
    }

    pub fn write_pod<T: Pod>(&self, buffer: &Buffer, offset: u64, values: &[T]) -> Result<()> {
        self.uploads.write_pod(buffer, offset, values)
    }

    /// Copies `values` into a new device-local buffer. Like textures, the
    /// data is on the GPU once the next submission completes.
    pub fn create_gpu_buffer<T: Pod>(&mut self, values: &[T]) -> Result<Buffer> {
        if self.state == FrameState::Submitted {
            return Err(Error::InvalidFrameState {
                expected: FrameState::Idle,
                actual: self.state,
            });
        }

        let bytes: &[u8] = bytemuck::cast_slice(values);
        let buffer = self.uploads.create_gpu_buffer(bytes.len() as u64)?;
        let pending =
            self.uploads
                .upload_buffer(&mut self.list, &buffer, bytes, self.sync.next_value())?;
        self.garbage.retire(pending);
        Ok(buffer)
    }

    /// Copies one mip level of a shader-readable texture back to the CPU,
    /// without row padding. Submits and waits.
    pub fn read_back_texture(&mut self, texture: &Texture, level: u16) -> Result<Vec<u8>> {
        self.expect_state(FrameState::Idle)?;

        let readback = self.uploads.copy_texture_to_readback(
            &mut self.list,
            texture,
            level,
            ResourceState::PixelShaderResource,
        )?;
        self.submit_and_wait()?;

        let data = self.uploads.read_texture(&readback);
        self.uploads.release(readback.buffer);
        data
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        // A lost device never signals again.
        if self.state == FrameState::Submitted {
            error!(
                "dropping after a failed submission, {} resources are abandoned",
                self.garbage.len()
            );
            return;
        }

        if let Err(e) = self.sync.flush() {
            error!("failed to wait for the GPU on shutdown: {}", e);
            return;
        }

        self.garbage
            .collect(self.device.backend().as_ref(), self.sync.completed());
    }
}

/// Records draws into the frame in progress.
pub struct FrameRecorder<'a> {
    context: &'a mut GraphicsContext,
}

impl<'a> FrameRecorder<'a> {
    fn record(&mut self, command: Command) -> Result<()> {
        self.context.list.record(command)
    }

    #[must_use]
    pub fn back_buffer_index(&self) -> u32 {
        self.context.back_buffer
    }

    pub fn set_pipeline(&mut self, pipeline: PipelineId) -> Result<()> {
        self.record(Command::SetPipeline(pipeline))
    }

    pub fn set_topology(&mut self, topology: PrimitiveTopology) -> Result<()> {
        self.record(Command::SetPrimitiveTopology(topology))
    }

    pub fn set_vertex_buffer(&mut self, buffer: &Buffer, stride: u32) -> Result<()> {
        self.record(Command::SetVertexBuffer {
            buffer: buffer.id,
            offset: 0,
            size: buffer_size(buffer)?,
            stride,
        })
    }

    pub fn set_index_buffer(&mut self, buffer: &Buffer, format: Format) -> Result<()> {
        self.record(Command::SetIndexBuffer {
            buffer: buffer.id,
            offset: 0,
            size: buffer_size(buffer)?,
            format,
        })
    }

    pub fn set_constant_buffer(
        &mut self,
        parameter: u32,
        buffer: &Buffer,
        offset: u64,
    ) -> Result<()> {
        self.record(Command::SetRootConstantBuffer {
            parameter,
            buffer: buffer.id,
            offset,
        })
    }

    /// Binds a descriptor table starting at shader-resource `slot`.
    pub fn set_texture(&mut self, parameter: u32, slot: u32) -> Result<()> {
        let base = self
            .context
            .srv_handle(slot)?
            .gpu
            .ok_or_else(|| {
                Error::backend("SetGraphicsRootDescriptorTable", "heap is not shader visible")
            })?;

        self.record(Command::SetRootDescriptorTable { parameter, base })
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> Result<()> {
        self.record(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance: 0,
        })
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32) -> Result<()> {
        self.record(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index: 0,
            base_vertex: 0,
            first_instance: 0,
        })
    }
}

fn buffer_size(buffer: &Buffer) -> Result<u32> {
    u32::try_from(buffer.size).map_err(|_| Error::InvalidResource(buffer.id))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::{
        backend::headless::{HeadlessBackend, HeadlessConfig, HeadlessProbe},
        pacing::{Clock, ManualClock, PacingConfig},
    };

    fn context(config: GraphicsConfig) -> (GraphicsContext, HeadlessProbe) {
        let backend = HeadlessBackend::new(HeadlessConfig::default());
        let probe = backend.probe();
        let context =
            GraphicsContext::new(Rc::new(backend), SurfaceTarget::Offscreen, config).unwrap();
        (context, probe)
    }

    fn small() -> GraphicsConfig {
        GraphicsConfig {
            extent: geometry::Extent::new(64, 32),
            srv_capacity: 8,
            frame_pacing: None,
            fence_timeout: Some(Duration::from_secs(5)),
            ..GraphicsConfig::default()
        }
    }

    #[test]
    fn frame_state_machine() {
        let (mut context, probe) = context(small());
        assert_eq!(context.state(), FrameState::Idle);

        assert!(matches!(
            context.end_frame(),
            Err(Error::InvalidFrameState {
                expected: FrameState::Recording,
                actual: FrameState::Idle
            })
        ));
        assert!(context.recorder().is_err());

        context.begin_frame().unwrap();
        assert_eq!(context.state(), FrameState::Recording);
        assert!(matches!(
            context.begin_frame(),
            Err(Error::InvalidFrameState {
                expected: FrameState::Idle,
                actual: FrameState::Recording
            })
        ));
        assert!(context.submit_and_wait().is_err());

        context.end_frame().unwrap();
        assert_eq!(context.state(), FrameState::Idle);
        assert_eq!(context.frame_index(), 1);
        assert!(probe.validation_errors().is_empty());
    }

    #[test]
    fn back_buffers_alternate() {
        let (mut context, probe) = context(small());

        for _ in 0..4 {
            context.begin_frame().unwrap();
            context.end_frame().unwrap();
        }

        let indices = probe.presents().iter().map(|p| p.index).collect::<Vec<_>>();
        assert_eq!(indices, [0, 1, 0, 1]);
    }

    #[test]
    fn clear_color_reaches_the_back_buffer() {
        let (mut context, probe) = context(GraphicsConfig {
            clear_color: crate::Color::WHITE,
            ..small()
        });

        context.begin_frame().unwrap();
        context.end_frame().unwrap();

        let buffer = context.surface().back_buffer(0).resource;
        let data = probe.subresource_data(buffer, 0).unwrap();
        assert!(data.iter().all(|&b| b == 0xFF));

        let depth = probe
            .subresource_data(context.surface().depth_buffer(), 0)
            .unwrap();
        assert_eq!(&depth[..4], &[0xFF, 0xFF, 0xFF, 0x00]);
    }

    #[test]
    fn overlay_slot_comes_first() {
        let (mut context, _probe) = context(small());

        assert_eq!(
            context
                .descriptors()
                .heap(HeapKind::ShaderResource)
                .reservation(OVERLAY_RESERVATION),
            Some(0..1)
        );

        let (_, handle) = context
            .create_texture(&MipChain::checkerboard(4, 2, [0; 4], [255; 4]))
            .unwrap();
        assert_eq!(handle.index, 1);

        assert!(matches!(
            context.reserve_srv("late", 1),
            Err(Error::ReservationConflict { .. })
        ));
    }

    #[test]
    fn no_overlay_starts_at_zero() {
        let (mut context, _probe) = context(GraphicsConfig {
            reserve_overlay_slot: false,
            ..small()
        });

        let (_, handle) = context
            .create_texture(&MipChain::checkerboard(4, 2, [0; 4], [255; 4]))
            .unwrap();
        assert_eq!(handle.index, 0);
    }

    #[test]
    fn staging_is_released_after_the_fence() {
        let (mut context, probe) = context(small());

        context
            .create_texture(&MipChain::checkerboard(16, 4, [0; 4], [255; 4]).with_generated_mips())
            .unwrap();
        assert_eq!(context.pending_uploads(), 1);
        let live = probe.live_resources();

        context.begin_frame().unwrap();
        context.end_frame().unwrap();

        assert_eq!(context.pending_uploads(), 0);
        assert_eq!(probe.live_resources(), live - 1);
        assert!(probe.validation_errors().is_empty());
    }

    #[test]
    fn failed_texture_creation_leaves_nothing_behind() {
        let (mut context, probe) = context(small());
        let image = MipChain::checkerboard(8, 2, [0; 4], [255; 4]);
        let live = probe.live_resources();
        let allocated = context.descriptors().heap(HeapKind::ShaderResource).allocated();

        context.list.close().unwrap();
        assert!(matches!(
            context.create_texture(&image),
            Err(Error::CommandListClosed)
        ));
        assert_eq!(probe.live_resources(), live);
        assert_eq!(
            context.descriptors().heap(HeapKind::ShaderResource).allocated(),
            allocated
        );
        assert_eq!(context.pending_uploads(), 0);

        context.list.reset(&context.allocator).unwrap();
        let (_, handle) = context.create_texture(&image).unwrap();
        assert_eq!(handle.index, allocated);
    }

    #[test]
    fn full_heap_is_refused_before_any_upload() {
        let (mut context, probe) = context(small());
        let image = MipChain::checkerboard(4, 2, [0; 4], [255; 4]);

        // One slot belongs to the overlay.
        for _ in 1..small().srv_capacity {
            context.create_texture(&image).unwrap();
        }
        let live = probe.live_resources();
        let recorded = context.list.commands().len();

        assert!(matches!(
            context.create_texture(&image),
            Err(Error::DescriptorHeapExhausted { capacity: 8, .. })
        ));
        assert_eq!(probe.live_resources(), live);
        assert_eq!(context.list.commands().len(), recorded);
    }

    #[test]
    fn dropping_a_lost_device_does_not_wait_again() {
        let timeout = Duration::from_millis(300);
        let (mut context, probe) = context(GraphicsConfig {
            fence_timeout: Some(timeout),
            ..small()
        });

        probe.set_hung(true);
        context.begin_frame().unwrap();
        assert!(matches!(
            context.end_frame(),
            Err(Error::DeviceLost { .. })
        ));

        let start = Instant::now();
        drop(context);
        assert!(start.elapsed() < timeout);
    }

    #[test]
    fn draws_need_bindings() {
        let (mut context, probe) = context(small());

        let pipeline = context
            .create_pipeline(&PipelineDesc {
                name: Some("Sprite".to_owned()),
                vertex_shader: vec![1],
                pixel_shader: vec![1],
                root_signature: None,
                input_layout: vec![],
                render_target_format: FrameSurface::RTV_FORMAT,
                depth_format: Some(FrameSurface::DEPTH_FORMAT),
                alpha_blend: true,
            })
            .unwrap();

        let vertices = context.create_gpu_buffer(&[0.0f32; 12]).unwrap();
        let constants = context.create_upload_buffer(256).unwrap();
        context.write_pod(&constants, 0, &[1.0f32; 16]).unwrap();

        let (_, texture) = context
            .create_texture(&MipChain::checkerboard(2, 1, [0; 4], [255; 4]))
            .unwrap();

        let mut frame = context.begin_frame().unwrap();
        frame.set_pipeline(pipeline).unwrap();
        frame.set_topology(PrimitiveTopology::TriangleList).unwrap();
        frame.set_vertex_buffer(&vertices, 12).unwrap();
        frame.set_constant_buffer(0, &constants, 0).unwrap();
        frame.set_texture(1, texture.index).unwrap();
        frame.draw(4, 1).unwrap();
        context.end_frame().unwrap();

        assert_eq!(probe.draw_calls(), 1);
        assert!(probe.validation_errors().is_empty());
    }

    #[test]
    fn paced_frames() {
        let (mut context, _probe) = context(small());
        let clock = ManualClock::new();
        context.set_frame_pacer(Some(FramePacer::new(
            PacingConfig::SIXTY_HZ,
            Box::new(clock.clone()),
        )));

        for _ in 0..3 {
            context.begin_frame().unwrap();
            context.end_frame().unwrap();
        }

        assert_eq!(clock.now(), PacingConfig::SIXTY_HZ.target * 3);
    }
}
