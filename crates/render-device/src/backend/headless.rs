//! A software GPU.
//!
//! Submitted work is executed by a worker thread in submission order, so fence
//! completion is genuinely asynchronous with respect to the recording thread.
//! Resources are plain byte arrays, and every command is checked the way a
//! debug layer would check it: barriers must name the state a resource is
//! actually in, copies must respect placement and pitch alignment, and draws
//! need a pipeline and a render target. Violations are logged and collected
//! rather than aborting, and can be inspected through a [`HeadlessProbe`].

use std::{
    cell::RefCell,
    collections::HashMap,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use super::{
    mapped_range, AdapterId, AdapterInfo, Backend, FeatureLevel, PipelineDesc, SurfaceTarget,
    SwapChainDesc, ViewDesc,
};
use crate::{
    command::{Command, PlacedFootprint},
    descriptor::{CpuDescriptor, GpuDescriptor, HeapAddress, HeapKind},
    image::{linear_to_srgb, mip_extent},
    resource::{
        Format, HeapType, PipelineId, ResourceDesc, ResourceDimension, ResourceFlags, ResourceId,
        ResourceState,
    },
    upload::{next_multiple_of, PLACEMENT_ALIGNMENT, ROW_PITCH_ALIGNMENT},
    Error, PowerPreference, Result,
};

#[derive(Clone, Debug)]
pub struct HeadlessConfig {
    /// The adapters to report, in preference order.
    pub adapters: Vec<AdapterInfo>,
    /// Feature levels that device creation succeeds for.
    pub feature_levels: Vec<FeatureLevel>,
    pub rtv_stride: u32,
    pub dsv_stride: u32,
    pub srv_stride: u32,
    /// How long the GPU takes to execute each submission.
    pub latency: Duration,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            adapters: vec![
                AdapterInfo {
                    id: AdapterId(0),
                    name: "Headless GPU".to_owned(),
                    vendor_id: 0x1414,
                    dedicated_video_memory: 256 * 1024 * 1024,
                    is_software: false,
                },
                AdapterInfo {
                    id: AdapterId(1),
                    name: "Headless Software Rasterizer".to_owned(),
                    vendor_id: 0x1414,
                    dedicated_video_memory: 0,
                    is_software: true,
                },
            ],
            feature_levels: vec![FeatureLevel::Level12_1, FeatureLevel::Level12_0],
            rtv_stride: 32,
            dsv_stride: 8,
            srv_stride: 32,
            latency: Duration::ZERO,
        }
    }
}

/// What the presentation engine saw when a buffer was presented.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentRecord {
    pub buffer: ResourceId,
    pub index: u32,
    pub state: ResourceState,
}

enum Work {
    Execute(Vec<Command>),
    Signal(u64),
    Present { buffer: ResourceId, index: u32 },
}

struct Subresource {
    width: u32,
    height: u32,
    bytes_per_pixel: u32,
    data: Vec<u8>,
}

impl Subresource {
    fn row_bytes(&self) -> usize {
        (self.width * self.bytes_per_pixel) as usize
    }
}

struct ResourceRecord {
    desc: ResourceDesc,
    state: ResourceState,
    subresources: Vec<Subresource>,
    released: bool,
}

impl ResourceRecord {
    fn new(desc: &ResourceDesc) -> Self {
        let subresources = match desc.dimension {
            ResourceDimension::Buffer { size } => vec![Subresource {
                width: u32::try_from(size).unwrap_or(u32::MAX),
                height: 1,
                bytes_per_pixel: 1,
                data: vec![0; size as usize],
            }],
            ResourceDimension::Texture2d {
                width,
                height,
                mip_levels,
                format,
            } => (0..u32::from(mip_levels.max(1)))
                .map(|level| {
                    let (width, height) = mip_extent(width, height, level);
                    let bytes_per_pixel = format.bytes_per_pixel();
                    Subresource {
                        width,
                        height,
                        bytes_per_pixel,
                        data: vec![0; (width * height * bytes_per_pixel) as usize],
                    }
                })
                .collect(),
        };

        Self {
            desc: desc.clone(),
            state: desc.initial_state,
            subresources,
            released: false,
        }
    }

    fn is_buffer(&self) -> bool {
        matches!(self.desc.dimension, ResourceDimension::Buffer { .. })
    }

    fn buffer(&self) -> &[u8] {
        &self.subresources[0].data
    }

    fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.subresources[0].data
    }
}

#[derive(Clone, Copy)]
struct ViewRecord {
    resource: ResourceId,
    desc: ViewDesc,
}

/// Pipeline state bound while executing a single submission.
#[derive(Default)]
struct Bindings {
    render_target: Option<CpuDescriptor>,
    pipeline: Option<PipelineId>,
    srv_heap: bool,
}

#[derive(Default)]
struct GpuState {
    resources: Vec<ResourceRecord>,
    views: HashMap<u64, ViewRecord>,
    pipelines: u32,
    completed: u64,
    hung: bool,
    validation_errors: Vec<String>,
    presents: Vec<PresentRecord>,
    draw_calls: u64,
    submissions: u64,
}

impl GpuState {
    fn report(&mut self, message: String) {
        warn!("headless validation: {}", message);
        self.validation_errors.push(message);
    }

    fn live(&mut self, id: ResourceId) -> Option<usize> {
        match self.resources.get(id.raw() as usize).map(|r| r.released) {
            Some(false) => Some(id.raw() as usize),
            Some(true) => {
                self.report(format!("{id:?} was used after it was released"));
                None
            }
            None => {
                self.report(format!("{id:?} does not exist"));
                None
            }
        }
    }

    fn expect_state(
        &mut self,
        id: ResourceId,
        allowed: &[ResourceState],
        usage: &str,
    ) -> Option<usize> {
        let index = self.live(id)?;
        let state = self.resources[index].state;
        if allowed.contains(&state) {
            Some(index)
        } else {
            self.report(format!(
                "{id:?} used as {usage} while in state {state:?} (expected one of {allowed:?})"
            ));
            None
        }
    }

    fn view(&mut self, at: CpuDescriptor, kind: HeapKind) -> Option<ViewRecord> {
        match self.views.get(&at.0).copied() {
            Some(view) if view.desc.heap_kind() == kind => Some(view),
            Some(view) => {
                self.report(format!(
                    "descriptor {:#x} holds a {:?} view, not a {:?} view",
                    at.0,
                    view.desc.heap_kind(),
                    kind
                ));
                None
            }
            None => {
                self.report(format!("descriptor {:#x} holds no view", at.0));
                None
            }
        }
    }

    fn execute(&mut self, commands: &[Command]) {
        let mut bindings = Bindings::default();
        self.submissions += 1;

        for command in commands {
            match *command {
                Command::Barrier(transition) => {
                    let Some(index) = self.live(transition.resource) else {
                        continue;
                    };

                    let (heap, actual) = {
                        let record = &self.resources[index];
                        (record.desc.heap, record.state)
                    };

                    if heap.required_state().is_some() {
                        self.report(format!(
                            "{:?} lives on the {:?} heap and cannot transition",
                            transition.resource, heap
                        ));
                    } else if actual != transition.before {
                        self.report(format!(
                            "barrier on {:?} expects {:?} but the resource is {:?}",
                            transition.resource, transition.before, actual
                        ));
                    }

                    // Real hardware would take the barrier at its word.
                    self.resources[index].state = transition.after;
                }
                Command::SetRenderTargets {
                    render_target,
                    depth_stencil,
                } => {
                    if self.view(render_target, HeapKind::RenderTarget).is_some() {
                        bindings.render_target = Some(render_target);
                    }

                    if let Some(depth_stencil) = depth_stencil {
                        let _ = self.view(depth_stencil, HeapKind::DepthStencil);
                    }
                }
                Command::ClearRenderTarget { view, color } => {
                    let Some(view) = self.view(view, HeapKind::RenderTarget) else {
                        continue;
                    };
                    let Some(index) = self.expect_state(
                        view.resource,
                        &[ResourceState::RenderTarget],
                        "a render target",
                    ) else {
                        continue;
                    };

                    let texel = encode_color(view.desc, color);
                    for chunk in self.resources[index].subresources[0].data.chunks_exact_mut(4) {
                        chunk.copy_from_slice(&texel);
                    }
                }
                Command::ClearDepthStencil {
                    view,
                    depth,
                    stencil,
                } => {
                    let Some(view) = self.view(view, HeapKind::DepthStencil) else {
                        continue;
                    };
                    let Some(index) = self.expect_state(
                        view.resource,
                        &[ResourceState::DepthWrite],
                        "a depth target",
                    ) else {
                        continue;
                    };

                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let depth = (depth.clamp(0.0, 1.0) * 16_777_215.0).round() as u32;
                    let texel = (depth | (u32::from(stencil) << 24)).to_le_bytes();
                    for chunk in self.resources[index].subresources[0].data.chunks_exact_mut(4) {
                        chunk.copy_from_slice(&texel);
                    }
                }
                Command::SetViewport(_) | Command::SetScissor(_) => {}
                Command::SetDescriptorHeap(kind) => {
                    if kind.is_shader_visible() {
                        bindings.srv_heap = true;
                    } else {
                        self.report(format!("{kind:?} heaps are not shader visible"));
                    }
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => self.copy_buffer(src, src_offset, dst, dst_offset, size),
                Command::CopyBufferToTexture {
                    src,
                    footprint,
                    dst,
                    subresource,
                } => self.copy_buffer_to_texture(src, footprint, dst, subresource),
                Command::CopyTextureToBuffer {
                    src,
                    subresource,
                    dst,
                    footprint,
                } => self.copy_texture_to_buffer(src, subresource, dst, footprint),
                Command::SetPipeline(pipeline) => {
                    if pipeline.raw() < self.pipelines {
                        bindings.pipeline = Some(pipeline);
                    } else {
                        self.report(format!("{pipeline:?} does not exist"));
                    }
                }
                Command::SetRootDescriptorTable { parameter, .. } => {
                    if !bindings.srv_heap {
                        self.report(format!(
                            "descriptor table bound to parameter {parameter} without a shader-visible heap"
                        ));
                    }
                }
                Command::SetRootConstantBuffer { buffer, .. } => {
                    self.expect_buffer_binding(buffer, ResourceState::VertexAndConstantBuffer);
                }
                Command::SetVertexBuffer { buffer, .. } => {
                    self.expect_buffer_binding(buffer, ResourceState::VertexAndConstantBuffer);
                }
                Command::SetIndexBuffer { buffer, format, .. } => {
                    if !matches!(format, Format::R16Uint | Format::R32Uint) {
                        self.report(format!("{format:?} is not an index format"));
                    }
                    self.expect_buffer_binding(buffer, ResourceState::IndexBuffer);
                }
                Command::SetPrimitiveTopology(_) => {}
                Command::Draw { .. } | Command::DrawIndexed { .. } => self.draw(&bindings),
            }
        }
    }

    fn expect_buffer_binding(&mut self, buffer: ResourceId, state: ResourceState) {
        self.expect_state(
            buffer,
            &[state, ResourceState::GenericRead],
            "a pipeline input",
        );
    }

    fn draw(&mut self, bindings: &Bindings) {
        if bindings.pipeline.is_none() {
            self.report("draw without a pipeline".to_owned());
            return;
        }

        let Some(render_target) = bindings.render_target else {
            self.report("draw without a render target".to_owned());
            return;
        };

        let Some(view) = self.view(render_target, HeapKind::RenderTarget) else {
            return;
        };

        if self
            .expect_state(view.resource, &[ResourceState::RenderTarget], "a render target")
            .is_some()
        {
            self.draw_calls += 1;
        }
    }

    fn copy_buffer(
        &mut self,
        src: ResourceId,
        src_offset: u64,
        dst: ResourceId,
        dst_offset: u64,
        size: u64,
    ) {
        let Some(src) = self.expect_state(
            src,
            &[ResourceState::GenericRead, ResourceState::CopySource],
            "a copy source",
        ) else {
            return;
        };
        let Some(dst) = self.expect_state(dst, &[ResourceState::CopyDest], "a copy destination")
        else {
            return;
        };

        let (src_range, dst_range) = (
            src_offset as usize..(src_offset + size) as usize,
            dst_offset as usize..(dst_offset + size) as usize,
        );

        if src_range.end > self.resources[src].buffer().len()
            || dst_range.end > self.resources[dst].buffer().len()
        {
            self.report(format!("buffer copy of {size} bytes is out of bounds"));
            return;
        }

        let bytes = self.resources[src].buffer()[src_range].to_vec();
        self.resources[dst].buffer_mut()[dst_range].copy_from_slice(&bytes);
    }

    fn check_footprint(
        &mut self,
        buffer: usize,
        footprint: &PlacedFootprint,
        texture: usize,
        subresource: u32,
    ) -> bool {
        if footprint.offset % PLACEMENT_ALIGNMENT != 0 {
            self.report(format!(
                "footprint offset {} is not {}-byte aligned",
                footprint.offset, PLACEMENT_ALIGNMENT
            ));
            return false;
        }

        if u64::from(footprint.row_pitch) % ROW_PITCH_ALIGNMENT != 0 {
            self.report(format!(
                "row pitch {} is not {}-byte aligned",
                footprint.row_pitch, ROW_PITCH_ALIGNMENT
            ));
            return false;
        }

        if !self.resources[buffer].is_buffer() || self.resources[texture].is_buffer() {
            self.report("texture copies need one buffer and one texture".to_owned());
            return false;
        }

        let Some(target) = self.resources[texture].subresources.get(subresource as usize) else {
            self.report(format!("subresource {subresource} does not exist"));
            return false;
        };

        if (target.width, target.height) != (footprint.width, footprint.height) {
            let (width, height) = (target.width, target.height);
            self.report(format!(
                "footprint is {}x{} but subresource {} is {}x{}",
                footprint.width, footprint.height, subresource, width, height
            ));
            return false;
        }

        if footprint.offset + footprint.span() > self.resources[buffer].buffer().len() as u64 {
            self.report("footprint extends past the end of the buffer".to_owned());
            return false;
        }

        true
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: ResourceId,
        footprint: PlacedFootprint,
        dst: ResourceId,
        subresource: u32,
    ) {
        let Some(src) = self.expect_state(
            src,
            &[ResourceState::GenericRead, ResourceState::CopySource],
            "a copy source",
        ) else {
            return;
        };
        let Some(dst) = self.expect_state(dst, &[ResourceState::CopyDest], "a copy destination")
        else {
            return;
        };

        if !self.check_footprint(src, &footprint, dst, subresource) {
            return;
        }

        let rows = (0..footprint.height as usize)
            .map(|row| {
                let start = footprint.offset as usize + row * footprint.row_pitch as usize;
                self.resources[src].buffer()[start..start + footprint.row_bytes() as usize].to_vec()
            })
            .collect::<Vec<_>>();

        let target = &mut self.resources[dst].subresources[subresource as usize];
        let row_bytes = target.row_bytes();
        for (row, bytes) in target.data.chunks_exact_mut(row_bytes).zip(rows) {
            row.copy_from_slice(&bytes);
        }
    }

    fn copy_texture_to_buffer(
        &mut self,
        src: ResourceId,
        subresource: u32,
        dst: ResourceId,
        footprint: PlacedFootprint,
    ) {
        let Some(src) = self.expect_state(src, &[ResourceState::CopySource], "a copy source")
        else {
            return;
        };
        let Some(dst) = self.expect_state(dst, &[ResourceState::CopyDest], "a copy destination")
        else {
            return;
        };

        if !self.check_footprint(dst, &footprint, src, subresource) {
            return;
        }

        let source = &self.resources[src].subresources[subresource as usize];
        let rows = source
            .data
            .chunks_exact(source.row_bytes())
            .map(<[u8]>::to_vec)
            .collect::<Vec<_>>();

        let buffer = self.resources[dst].buffer_mut();
        for (row, bytes) in rows.iter().enumerate() {
            let start = footprint.offset as usize + row * footprint.row_pitch as usize;
            buffer[start..start + bytes.len()].copy_from_slice(bytes);
        }
    }

    fn present(&mut self, buffer: ResourceId, index: u32) {
        let Some(slot) = self.live(buffer) else {
            return;
        };

        let state = self.resources[slot].state;
        if state != ResourceState::Present {
            self.report(format!(
                "back buffer {index} was presented in state {state:?}"
            ));
        }

        self.presents.push(PresentRecord {
            buffer,
            index,
            state,
        });
    }
}

fn encode_color(view: ViewDesc, color: [f32; 4]) -> [u8; 4] {
    let srgb = matches!(view, ViewDesc::RenderTarget { format } if format.is_srgb());
    let mut texel = [0; 4];
    for (i, channel) in color.iter().enumerate() {
        let value = if srgb && i < 3 {
            linear_to_srgb(*channel)
        } else {
            *channel
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            texel[i] = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
        }
    }
    texel
}

struct Shared {
    gpu: Mutex<GpuState>,
    fence_changed: Condvar,
}

impl Shared {
    fn run(&self, work: &Receiver<Work>, latency: Duration) {
        for item in work {
            match item {
                Work::Execute(commands) => {
                    if !latency.is_zero() {
                        std::thread::sleep(latency);
                    }
                    self.gpu.lock().execute(&commands);
                }
                Work::Signal(value) => {
                    let mut gpu = self.gpu.lock();
                    if gpu.hung {
                        continue;
                    }
                    gpu.completed = gpu.completed.max(value);
                    drop(gpu);
                    self.fence_changed.notify_all();
                }
                Work::Present { buffer, index } => self.gpu.lock().present(buffer, index),
            }
        }
    }
}

#[derive(Default)]
struct CpuState {
    device: Option<(AdapterId, FeatureLevel)>,
    command_objects: bool,
    fence: bool,
    heaps: HashMap<HeapKind, HeapAddress>,
    next_heap_offset: u64,
    back_buffers: Vec<ResourceId>,
    back_buffer_index: u32,
    /// Set by `execute`, cleared by the next `signal`.
    unfenced_work: bool,
    /// The fence value that covers everything recorded through the
    /// allocator since its last reset.
    allocator_fence: Option<u64>,
}

pub struct HeadlessBackend {
    config: HeadlessConfig,
    shared: Arc<Shared>,
    cpu: RefCell<CpuState>,
    work: Option<Sender<Work>>,
    worker: Option<JoinHandle<()>>,
}

impl HeadlessBackend {
    const CPU_HEAP_BASE: u64 = 0x0010_0000;
    const GPU_HEAP_BASE: u64 = 0x0400_0000_0000;

    #[must_use]
    pub fn new(config: HeadlessConfig) -> Self {
        let shared = Arc::new(Shared {
            gpu: Mutex::new(GpuState::default()),
            fence_changed: Condvar::new(),
        });

        let (sender, receiver) = unbounded();

        let worker = {
            let shared = shared.clone();
            let latency = config.latency;
            std::thread::Builder::new()
                .name("headless-gpu".to_owned())
                .spawn(move || shared.run(&receiver, latency))
                .ok()
        };

        if worker.is_none() {
            warn!("failed to spawn the headless GPU thread; submissions will never complete");
        }

        Self {
            config,
            shared,
            cpu: RefCell::new(CpuState::default()),
            work: Some(sender),
            worker,
        }
    }

    /// A handle for inspecting the simulated GPU after the backend has been
    /// handed to a context.
    #[must_use]
    pub fn probe(&self) -> HeadlessProbe {
        HeadlessProbe {
            shared: self.shared.clone(),
        }
    }

    fn send(&self, work: Work) -> Result<()> {
        self.work
            .as_ref()
            .and_then(|sender| sender.send(work).ok())
            .ok_or_else(|| Error::backend("ExecuteCommandLists", "the GPU thread has exited"))
    }

    fn require_device(&self, call: &'static str) -> Result<()> {
        if self.cpu.borrow().device.is_some() {
            Ok(())
        } else {
            Err(Error::backend(call, "the device has not been created"))
        }
    }

    fn require_command_objects(&self, call: &'static str) -> Result<()> {
        if self.cpu.borrow().command_objects {
            Ok(())
        } else {
            Err(Error::backend(call, "the command queue has not been created"))
        }
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        // Disconnecting the channel ends the worker loop.
        self.work.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Backend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn enumerate_adapters(&self, _preference: PowerPreference) -> Result<Vec<AdapterInfo>> {
        Ok(self
            .config
            .adapters
            .iter()
            .enumerate()
            .map(|(i, adapter)| AdapterInfo {
                id: AdapterId(i as u32),
                ..adapter.clone()
            })
            .collect())
    }

    fn create_device(&self, adapter: AdapterId, level: FeatureLevel) -> Result<()> {
        if adapter.0 as usize >= self.config.adapters.len() {
            return Err(Error::backend(
                "D3D12CreateDevice",
                format!("{adapter:?} does not exist"),
            ));
        }

        if !self.config.feature_levels.contains(&level) {
            return Err(Error::backend(
                "D3D12CreateDevice",
                format!("{level:?} is not supported"),
            ));
        }

        self.cpu.borrow_mut().device = Some((adapter, level));
        Ok(())
    }

    fn create_command_objects(&self) -> Result<()> {
        self.require_device("CreateCommandQueue")?;
        self.cpu.borrow_mut().command_objects = true;
        Ok(())
    }

    fn descriptor_stride(&self, kind: HeapKind) -> u32 {
        match kind {
            HeapKind::RenderTarget => self.config.rtv_stride,
            HeapKind::DepthStencil => self.config.dsv_stride,
            HeapKind::ShaderResource => self.config.srv_stride,
        }
    }

    fn create_descriptor_heap(&self, kind: HeapKind, capacity: u32) -> Result<HeapAddress> {
        let mut cpu = self.cpu.borrow_mut();

        if cpu.heaps.contains_key(&kind) {
            return Err(Error::backend(
                "CreateDescriptorHeap",
                format!("a {kind:?} heap already exists"),
            ));
        }

        let offset = cpu.next_heap_offset;
        let size = u64::from(capacity) * u64::from(self.descriptor_stride(kind));
        // Keep a gap between heaps so that overruns land on unmapped addresses.
        cpu.next_heap_offset += next_multiple_of(size, 0x1_0000) + 0x1_0000;

        let address = HeapAddress {
            cpu_base: CpuDescriptor(Self::CPU_HEAP_BASE + offset),
            gpu_base: kind
                .is_shader_visible()
                .then_some(GpuDescriptor(Self::GPU_HEAP_BASE + offset)),
        };

        cpu.heaps.insert(kind, address);
        Ok(address)
    }

    fn create_resource(&self, desc: &ResourceDesc) -> Result<ResourceId> {
        if let Some(required) = desc.heap.required_state() {
            if desc.initial_state != required {
                return Err(Error::backend(
                    "CreateCommittedResource",
                    format!(
                        "resources on the {:?} heap must start in {:?}",
                        desc.heap, required
                    ),
                ));
            }
        }

        if let ResourceDimension::Texture2d { width, height, .. } = desc.dimension {
            if desc.heap != HeapType::Default {
                return Err(Error::backend(
                    "CreateCommittedResource",
                    "textures must live on the default heap",
                ));
            }

            if width == 0 || height == 0 {
                return Err(Error::backend("CreateCommittedResource", "empty texture"));
            }
        }

        if desc.flags.contains(ResourceFlags::ALLOW_DEPTH_STENCIL)
            && !matches!(desc.dimension, ResourceDimension::Texture2d { format, .. } if format.is_depth())
        {
            return Err(Error::backend(
                "CreateCommittedResource",
                "depth-stencil resources need a depth format",
            ));
        }

        let mut gpu = self.shared.gpu.lock();
        let id = ResourceId::from_raw(gpu.resources.len() as u32);
        gpu.resources.push(ResourceRecord::new(desc));

        debug!(
            "created {:?} ({}) on the {:?} heap",
            id,
            desc.name.as_deref().unwrap_or("unnamed"),
            desc.heap
        );

        Ok(id)
    }

    fn release_resource(&self, resource: ResourceId) {
        let mut gpu = self.shared.gpu.lock();
        if let Some(record) = gpu.resources.get_mut(resource.raw() as usize) {
            record.released = true;
            record.subresources.clear();
        }
    }

    fn write_resource(&self, resource: ResourceId, offset: u64, data: &[u8]) -> Result<()> {
        let mut gpu = self.shared.gpu.lock();
        let record = gpu
            .resources
            .get_mut(resource.raw() as usize)
            .filter(|r| !r.released && r.desc.heap == HeapType::Upload)
            .ok_or(Error::InvalidResource(resource))?;

        let buffer = record.buffer_mut();
        let range = mapped_range(buffer.len() as u64, offset, data.len())?;
        buffer[range].copy_from_slice(data);
        Ok(())
    }

    fn read_resource(&self, resource: ResourceId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let gpu = self.shared.gpu.lock();
        let record = gpu
            .resources
            .get(resource.raw() as usize)
            .filter(|r| !r.released && r.desc.heap == HeapType::Readback)
            .ok_or(Error::InvalidResource(resource))?;

        let buffer = record.buffer();
        let range = mapped_range(buffer.len() as u64, offset, len)?;
        Ok(buffer[range].to_vec())
    }

    fn create_view(&self, resource: ResourceId, view: &ViewDesc, at: CpuDescriptor) -> Result<()> {
        let mut gpu = self.shared.gpu.lock();
        let record = gpu
            .resources
            .get(resource.raw() as usize)
            .filter(|r| !r.released)
            .ok_or(Error::InvalidResource(resource))?;

        let required = match view {
            ViewDesc::RenderTarget { .. } => ResourceFlags::ALLOW_RENDER_TARGET,
            ViewDesc::DepthStencil { .. } => ResourceFlags::ALLOW_DEPTH_STENCIL,
            ViewDesc::ShaderResource { .. } => ResourceFlags::empty(),
        };

        if !record.desc.flags.contains(required) {
            return Err(Error::backend(
                "CreateView",
                format!("{resource:?} was not created with {required:?}"),
            ));
        }

        gpu.views.insert(
            at.0,
            ViewRecord {
                resource,
                desc: *view,
            },
        );
        Ok(())
    }

    fn create_swap_chain(
        &self,
        target: SurfaceTarget,
        desc: &SwapChainDesc,
    ) -> Result<Vec<ResourceId>> {
        self.require_command_objects("CreateSwapChainForHwnd")?;

        debug!("creating a {}-buffer swap chain for {:?}", desc.buffer_count, target);

        let buffers = (0..desc.buffer_count)
            .map(|i| {
                self.create_resource(
                    &ResourceDesc::texture_2d(
                        desc.extent.width,
                        desc.extent.height,
                        1,
                        desc.format,
                        ResourceState::Present,
                    )
                    .with_name(format!("Swapchain Buffer {i}"))
                    .with_flags(ResourceFlags::ALLOW_RENDER_TARGET),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut cpu = self.cpu.borrow_mut();
        cpu.back_buffers = buffers.clone();
        cpu.back_buffer_index = 0;
        Ok(buffers)
    }

    fn current_back_buffer_index(&self) -> Result<u32> {
        let cpu = self.cpu.borrow();
        if cpu.back_buffers.is_empty() {
            return Err(Error::backend(
                "GetCurrentBackBufferIndex",
                "the swap chain has not been created",
            ));
        }
        Ok(cpu.back_buffer_index)
    }

    fn present(&self, _sync_interval: u32) -> Result<()> {
        let (buffer, index) = {
            let mut cpu = self.cpu.borrow_mut();
            let index = cpu.back_buffer_index;
            let buffer = *cpu
                .back_buffers
                .get(index as usize)
                .ok_or_else(|| Error::backend("Present", "the swap chain has not been created"))?;
            cpu.back_buffer_index = (index + 1) % cpu.back_buffers.len() as u32;
            (buffer, index)
        };

        self.send(Work::Present { buffer, index })
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId> {
        self.require_device("CreateGraphicsPipelineState")?;

        if desc.vertex_shader.is_empty() || desc.pixel_shader.is_empty() {
            return Err(Error::backend(
                "CreateGraphicsPipelineState",
                "missing shader bytecode",
            ));
        }

        let mut gpu = self.shared.gpu.lock();
        let id = PipelineId::from_raw(gpu.pipelines);
        gpu.pipelines += 1;
        Ok(id)
    }

    fn execute(&self, commands: &[Command]) -> Result<()> {
        self.require_command_objects("ExecuteCommandLists")?;
        self.cpu.borrow_mut().unfenced_work = true;
        self.send(Work::Execute(commands.to_vec()))
    }

    fn reset_command_allocator(&self) -> Result<()> {
        self.require_command_objects("ID3D12CommandAllocator::Reset")?;

        let mut cpu = self.cpu.borrow_mut();
        let completed = self.completed_value();

        let in_flight = match cpu.allocator_fence {
            _ if cpu.unfenced_work => true,
            Some(fence) => completed < fence,
            None => false,
        };

        if in_flight {
            let message = "command allocator reset while the GPU may still be reading it";
            self.shared.gpu.lock().report(message.to_owned());
            return Err(Error::backend("ID3D12CommandAllocator::Reset", message));
        }

        cpu.allocator_fence = None;
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> Result<()> {
        self.require_device("CreateFence")?;
        self.cpu.borrow_mut().fence = true;
        self.shared.gpu.lock().completed = initial_value;
        Ok(())
    }

    fn signal(&self, value: u64) -> Result<()> {
        {
            let mut cpu = self.cpu.borrow_mut();
            if !cpu.fence {
                return Err(Error::backend("Signal", "the fence has not been created"));
            }

            if cpu.unfenced_work {
                cpu.unfenced_work = false;
                cpu.allocator_fence = Some(value);
            }
        }

        self.send(Work::Signal(value))
    }

    fn completed_value(&self) -> u64 {
        self.shared.gpu.lock().completed
    }

    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut gpu = self.shared.gpu.lock();

        while gpu.completed < value {
            match deadline {
                Some(deadline) => {
                    if self.shared.fence_changed.wait_until(&mut gpu, deadline).timed_out() {
                        return Ok(gpu.completed >= value);
                    }
                }
                None => self.shared.fence_changed.wait(&mut gpu),
            }
        }

        Ok(true)
    }
}

/// Read-only view of the simulated GPU, plus a switch to make it hang.
#[derive(Clone)]
pub struct HeadlessProbe {
    shared: Arc<Shared>,
}

impl HeadlessProbe {
    #[must_use]
    pub fn presents(&self) -> Vec<PresentRecord> {
        self.shared.gpu.lock().presents.clone()
    }

    #[must_use]
    pub fn validation_errors(&self) -> Vec<String> {
        self.shared.gpu.lock().validation_errors.clone()
    }

    #[must_use]
    pub fn resource_state(&self, resource: ResourceId) -> Option<ResourceState> {
        self.shared
            .gpu
            .lock()
            .resources
            .get(resource.raw() as usize)
            .filter(|r| !r.released)
            .map(|r| r.state)
    }

    #[must_use]
    pub fn is_released(&self, resource: ResourceId) -> bool {
        self.shared
            .gpu
            .lock()
            .resources
            .get(resource.raw() as usize)
            .map_or(false, |r| r.released)
    }

    #[must_use]
    pub fn live_resources(&self) -> usize {
        self.shared
            .gpu
            .lock()
            .resources
            .iter()
            .filter(|r| !r.released)
            .count()
    }

    /// The texels of one subresource, tightly packed.
    #[must_use]
    pub fn subresource_data(&self, resource: ResourceId, subresource: u32) -> Option<Vec<u8>> {
        self.shared
            .gpu
            .lock()
            .resources
            .get(resource.raw() as usize)
            .and_then(|r| r.subresources.get(subresource as usize))
            .map(|s| s.data.clone())
    }

    #[must_use]
    pub fn completed_value(&self) -> u64 {
        self.shared.gpu.lock().completed
    }

    #[must_use]
    pub fn draw_calls(&self) -> u64 {
        self.shared.gpu.lock().draw_calls
    }

    #[must_use]
    pub fn submissions(&self) -> u64 {
        self.shared.gpu.lock().submissions
    }

    /// Stops the fence from advancing, as if the device had been removed.
    pub fn set_hung(&self, hung: bool) {
        self.shared.gpu.lock().hung = hung;
    }
}

#[cfg(test)]
mod tests {
    use geometry::Extent;

    use super::*;

    fn ready_backend(config: HeadlessConfig) -> HeadlessBackend {
        let backend = HeadlessBackend::new(config);
        backend
            .create_device(AdapterId(0), FeatureLevel::Level12_0)
            .unwrap();
        backend.create_command_objects().unwrap();
        backend.create_fence(0).unwrap();
        backend
    }

    #[test]
    fn device_creation_respects_feature_levels() {
        let backend = HeadlessBackend::new(HeadlessConfig::default());
        assert!(backend
            .create_device(AdapterId(0), FeatureLevel::Level12_2)
            .is_err());
        assert!(backend
            .create_device(AdapterId(0), FeatureLevel::Level12_1)
            .is_ok());
        assert!(backend
            .create_device(AdapterId(7), FeatureLevel::Level12_1)
            .is_err());
    }

    #[test]
    fn command_objects_need_a_device() {
        let backend = HeadlessBackend::new(HeadlessConfig::default());
        assert!(backend.create_command_objects().is_err());
        assert!(backend.create_fence(0).is_err());
    }

    #[test]
    fn fence_completes_asynchronously() {
        let backend = ready_backend(HeadlessConfig {
            latency: Duration::from_millis(5),
            ..HeadlessConfig::default()
        });

        backend.execute(&[]).unwrap();
        backend.signal(1).unwrap();
        assert!(backend
            .wait_for_value(1, Some(Duration::from_secs(5)))
            .unwrap());
        assert!(backend.completed_value() >= 1);
    }

    #[test]
    fn hung_fence_times_out() {
        let backend = ready_backend(HeadlessConfig::default());
        backend.probe().set_hung(true);
        backend.signal(1).unwrap();
        assert!(!backend
            .wait_for_value(1, Some(Duration::from_millis(20)))
            .unwrap());
        assert_eq!(backend.completed_value(), 0);
    }

    #[test]
    fn barrier_mismatch_is_reported() {
        let backend = ready_backend(HeadlessConfig::default());
        let probe = backend.probe();
        let texture = backend
            .create_resource(&ResourceDesc::texture_2d(
                4,
                4,
                1,
                Format::Rgba8Unorm,
                ResourceState::CopyDest,
            ))
            .unwrap();

        backend
            .execute(&[Command::Barrier(crate::command::Transition {
                resource: texture,
                before: ResourceState::RenderTarget,
                after: ResourceState::PixelShaderResource,
            })])
            .unwrap();
        backend.signal(1).unwrap();
        backend.wait_for_value(1, None).unwrap();

        assert_eq!(probe.validation_errors().len(), 1);
        assert_eq!(
            probe.resource_state(texture),
            Some(ResourceState::PixelShaderResource)
        );
    }

    #[test]
    fn allocator_reset_before_completion_is_rejected() {
        let backend = ready_backend(HeadlessConfig::default());
        backend.probe().set_hung(true);
        backend.execute(&[]).unwrap();
        assert!(backend.reset_command_allocator().is_err());

        backend.signal(1).unwrap();
        assert!(backend.reset_command_allocator().is_err());

        backend.probe().set_hung(false);
        backend.signal(1).unwrap();
        backend.wait_for_value(1, None).unwrap();
        backend.reset_command_allocator().unwrap();
    }

    #[test]
    fn present_cycles_buffers() {
        let backend = ready_backend(HeadlessConfig::default());
        let probe = backend.probe();
        let buffers = backend
            .create_swap_chain(
                SurfaceTarget::Offscreen,
                &SwapChainDesc {
                    extent: Extent::new(8, 8),
                    format: Format::Rgba8Unorm,
                    buffer_count: 2,
                },
            )
            .unwrap();

        assert_eq!(backend.current_back_buffer_index().unwrap(), 0);
        backend.present(1).unwrap();
        assert_eq!(backend.current_back_buffer_index().unwrap(), 1);
        backend.present(1).unwrap();
        assert_eq!(backend.current_back_buffer_index().unwrap(), 0);

        backend.signal(1).unwrap();
        backend.wait_for_value(1, None).unwrap();

        let presents = probe.presents();
        assert_eq!(presents.len(), 2);
        assert_eq!(presents[0].buffer, buffers[0]);
        assert_eq!(presents[1].buffer, buffers[1]);
        assert!(presents.iter().all(|p| p.state == ResourceState::Present));
    }

    #[test]
    fn upload_heap_is_cpu_writable_only() {
        let backend = ready_backend(HeadlessConfig::default());
        let upload = backend
            .create_resource(&ResourceDesc::buffer(
                HeapType::Upload,
                16,
                ResourceState::GenericRead,
            ))
            .unwrap();
        let local = backend
            .create_resource(&ResourceDesc::buffer(
                HeapType::Default,
                16,
                ResourceState::CopyDest,
            ))
            .unwrap();

        backend.write_resource(upload, 4, &[1, 2, 3, 4]).unwrap();
        assert!(backend.write_resource(upload, 14, &[1, 2, 3, 4]).is_err());
        assert!(matches!(
            backend.write_resource(local, 0, &[1]),
            Err(Error::InvalidResource(_))
        ));
        assert!(backend
            .create_resource(&ResourceDesc::buffer(
                HeapType::Upload,
                16,
                ResourceState::CopyDest
            ))
            .is_err());
    }
}
