//! Direct3D 12 backend.

use std::{
    cell::{OnceCell, RefCell},
    collections::HashMap,
    ops::Range,
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use raw_window_handle::RawWindowHandle;
#[allow(clippy::wildcard_imports)]
use windows::{
    core::{ComInterface, HSTRING, PCSTR},
    Win32::{
        Foundation::{CloseHandle, HANDLE, HWND, RECT, WAIT_OBJECT_0, WAIT_TIMEOUT},
        Graphics::{
            Direct3D12::*,
            Dxgi::{Common::*, *},
        },
        System::Threading::{CreateEventW, WaitForSingleObject},
    },
};

use super::{
    mapped_range, AdapterId, AdapterInfo, Backend, FeatureLevel, PipelineDesc, SurfaceTarget,
    SwapChainDesc, ViewDesc,
};
use crate::{
    command::Command,
    descriptor::{CpuDescriptor, GpuDescriptor, HeapAddress, HeapKind},
    resource::{ClearValue, HeapType, PipelineId, ResourceDesc, ResourceDimension, ResourceId},
    Error, PowerPreference, Result,
};

mod convert;
mod fxc;
mod pipeline;

pub use fxc::FxcCompiler;

use pipeline::Pipeline;

/// Turns a `windows` error into a backend error naming the failed call.
trait Check<T> {
    fn check(self, call: &'static str) -> Result<T>;
}

impl<T> Check<T> for windows::core::Result<T> {
    fn check(self, call: &'static str) -> Result<T> {
        self.map_err(|e| Error::backend(call, e))
    }
}

struct CommandObjects {
    queue: ID3D12CommandQueue,
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
}

struct Fence {
    fence: ID3D12Fence,
    event: HANDLE,
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.event) };
    }
}

struct Committed {
    resource: ID3D12Resource,
    heap: HeapType,
    /// Bytes that may be mapped. Zero for textures.
    size: u64,
}

pub struct Dx12Backend {
    is_debug: bool,
    factory: IDXGIFactory6,
    adapters: RefCell<Vec<IDXGIAdapter1>>,
    device: OnceCell<ID3D12Device>,
    commands: OnceCell<CommandObjects>,
    fence: OnceCell<Fence>,
    swap_chain: OnceCell<IDXGISwapChain3>,
    heaps: RefCell<HashMap<HeapKind, ID3D12DescriptorHeap>>,
    resources: RefCell<Vec<Option<Committed>>>,
    pipelines: RefCell<Vec<Pipeline>>,
}

impl Dx12Backend {
    /// Creates the DXGI factory. With `is_debug`, also enables the D3D12 debug
    /// layer and forwards its messages to the log once a device exists.
    pub fn new(is_debug: bool) -> Result<Self> {
        let flags = if is_debug {
            DXGI_CREATE_FACTORY_DEBUG
        } else {
            0
        };

        // IDXGIFactory6 for power preference selection
        let factory: IDXGIFactory6 =
            unsafe { CreateDXGIFactory2(flags) }.check("CreateDXGIFactory2")?;

        if is_debug {
            let mut dx_debug: Option<ID3D12Debug> = None;
            unsafe { D3D12GetDebugInterface(&mut dx_debug) }.check("D3D12GetDebugInterface")?;
            if let Some(dx_debug) = dx_debug {
                unsafe { dx_debug.EnableDebugLayer() };
            }
        }

        Ok(Self {
            is_debug,
            factory,
            adapters: RefCell::new(Vec::new()),
            device: OnceCell::new(),
            commands: OnceCell::new(),
            fence: OnceCell::new(),
            swap_chain: OnceCell::new(),
            heaps: RefCell::new(HashMap::new()),
            resources: RefCell::new(Vec::new()),
            pipelines: RefCell::new(Vec::new()),
        })
    }

    fn device(&self) -> Result<&ID3D12Device> {
        self.device
            .get()
            .ok_or_else(|| Error::backend("ID3D12Device", "the device has not been created"))
    }

    fn commands(&self) -> Result<&CommandObjects> {
        self.commands.get().ok_or_else(|| {
            Error::backend("ID3D12CommandQueue", "the command queue has not been created")
        })
    }

    fn fence(&self) -> Result<&Fence> {
        self.fence
            .get()
            .ok_or_else(|| Error::backend("ID3D12Fence", "the fence has not been created"))
    }

    fn swap_chain(&self) -> Result<&IDXGISwapChain3> {
        self.swap_chain.get().ok_or_else(|| {
            Error::backend("IDXGISwapChain3", "the swap chain has not been created")
        })
    }

    fn set_name(&self, object: &ID3D12Object, name: &str) {
        if self.is_debug {
            if let Err(e) = unsafe { object.SetName(&HSTRING::from(name)) } {
                debug!("failed to name {}: {}", name, e);
            }
        }
    }

    fn insert_resource(&self, resource: ID3D12Resource, heap: HeapType, size: u64) -> ResourceId {
        let mut resources = self.resources.borrow_mut();
        resources.push(Some(Committed {
            resource,
            heap,
            size,
        }));
        ResourceId::from_raw(resources.len() as u32 - 1)
    }

    fn resource(&self, id: ResourceId) -> Result<ID3D12Resource> {
        self.resources
            .borrow()
            .get(id.raw() as usize)
            .and_then(Option::as_ref)
            .map(|committed| committed.resource.clone())
            .ok_or(Error::InvalidResource(id))
    }

    /// The resource behind `id` and the byte range `offset..offset + len`
    /// within it, if `id` lives on `heap` and the range fits.
    fn mapped_resource(
        &self,
        id: ResourceId,
        heap: HeapType,
        offset: u64,
        len: usize,
    ) -> Result<(ID3D12Resource, Range<usize>)> {
        let resources = self.resources.borrow();
        let committed = resources
            .get(id.raw() as usize)
            .and_then(Option::as_ref)
            .filter(|committed| committed.heap == heap)
            .ok_or(Error::InvalidResource(id))?;

        let range = mapped_range(committed.size, offset, len)?;
        Ok((committed.resource.clone(), range))
    }

    fn register_debug_callback(&self, device: &ID3D12Device) {
        let Ok(queue) = device.cast::<ID3D12InfoQueue1>() else {
            warn!("the D3D12 info queue is unavailable; debug messages will not be logged");
            return;
        };

        let mut cookie = 0;
        if let Err(e) = unsafe {
            queue.RegisterMessageCallback(
                Some(d3d12_debug_callback),
                D3D12_MESSAGE_CALLBACK_IGNORE_FILTERS,
                std::ptr::null(),
                &mut cookie,
            )
        } {
            warn!("failed to register the D3D12 message callback: {}", e);
        }
    }

    fn replay(&self, list: &ID3D12GraphicsCommandList, commands: &[Command]) -> Result<()> {
        let resources = self.resources.borrow();
        let resource = |id: ResourceId| {
            resources
                .get(id.raw() as usize)
                .and_then(Option::as_ref)
                .map(|committed| &committed.resource)
                .ok_or(Error::InvalidResource(id))
        };

        let pipelines = self.pipelines.borrow();
        let heaps = self.heaps.borrow();

        for command in commands {
            match *command {
                Command::Barrier(transition) => unsafe {
                    list.ResourceBarrier(&[convert::transition_barrier(
                        resource(transition.resource)?,
                        convert::state(transition.before),
                        convert::state(transition.after),
                    )]);
                },
                Command::SetRenderTargets {
                    render_target,
                    depth_stencil,
                } => {
                    let render_target = cpu_handle(render_target);
                    let depth_stencil = depth_stencil.map(cpu_handle);
                    unsafe {
                        list.OMSetRenderTargets(
                            1,
                            Some(&render_target),
                            false,
                            depth_stencil.as_ref().map(|handle| handle as *const _),
                        );
                    }
                }
                Command::ClearRenderTarget { view, color } => unsafe {
                    list.ClearRenderTargetView(cpu_handle(view), color.as_ptr(), &[]);
                },
                Command::ClearDepthStencil {
                    view,
                    depth,
                    stencil,
                } => unsafe {
                    list.ClearDepthStencilView(
                        cpu_handle(view),
                        D3D12_CLEAR_FLAG_DEPTH | D3D12_CLEAR_FLAG_STENCIL,
                        depth,
                        stencil,
                        &[],
                    );
                },
                Command::SetViewport(viewport) => unsafe {
                    list.RSSetViewports(&[D3D12_VIEWPORT {
                        TopLeftX: viewport.x,
                        TopLeftY: viewport.y,
                        Width: viewport.width,
                        Height: viewport.height,
                        MinDepth: viewport.min_depth,
                        MaxDepth: viewport.max_depth,
                    }]);
                },
                Command::SetScissor(rect) => unsafe {
                    list.RSSetScissorRects(&[RECT {
                        left: rect.left() as i32,
                        top: rect.top() as i32,
                        right: rect.right() as i32,
                        bottom: rect.bottom() as i32,
                    }]);
                },
                Command::SetDescriptorHeap(kind) => {
                    let heap = heaps.get(&kind).cloned().ok_or_else(|| {
                        Error::backend("SetDescriptorHeaps", format!("no {kind:?} heap"))
                    })?;
                    unsafe { list.SetDescriptorHeaps(&[Some(heap)]) };
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => unsafe {
                    list.CopyBufferRegion(
                        resource(dst)?,
                        dst_offset,
                        resource(src)?,
                        src_offset,
                        size,
                    );
                },
                Command::CopyBufferToTexture {
                    src,
                    footprint,
                    dst,
                    subresource,
                } => {
                    let dst = convert::subresource_location(resource(dst)?, subresource);
                    let src = convert::footprint_location(resource(src)?, &footprint);
                    unsafe { list.CopyTextureRegion(&dst, 0, 0, 0, &src, None) };
                }
                Command::CopyTextureToBuffer {
                    src,
                    subresource,
                    dst,
                    footprint,
                } => {
                    let dst = convert::footprint_location(resource(dst)?, &footprint);
                    let src = convert::subresource_location(resource(src)?, subresource);
                    unsafe { list.CopyTextureRegion(&dst, 0, 0, 0, &src, None) };
                }
                Command::SetPipeline(pipeline) => {
                    let pipeline = pipelines
                        .get(pipeline.raw() as usize)
                        .ok_or_else(|| Error::backend("SetPipelineState", "unknown pipeline"))?;
                    unsafe {
                        list.SetGraphicsRootSignature(&pipeline.root_signature);
                        list.SetPipelineState(&pipeline.state);
                    }
                }
                Command::SetRootDescriptorTable { parameter, base } => unsafe {
                    list.SetGraphicsRootDescriptorTable(
                        parameter,
                        D3D12_GPU_DESCRIPTOR_HANDLE { ptr: base.0 },
                    );
                },
                Command::SetRootConstantBuffer {
                    parameter,
                    buffer,
                    offset,
                } => unsafe {
                    let address = resource(buffer)?.GetGPUVirtualAddress() + offset;
                    list.SetGraphicsRootConstantBufferView(parameter, address);
                },
                Command::SetVertexBuffer {
                    buffer,
                    offset,
                    size,
                    stride,
                } => unsafe {
                    list.IASetVertexBuffers(
                        0,
                        Some(&[D3D12_VERTEX_BUFFER_VIEW {
                            BufferLocation: resource(buffer)?.GetGPUVirtualAddress() + offset,
                            SizeInBytes: size,
                            StrideInBytes: stride,
                        }]),
                    );
                },
                Command::SetIndexBuffer {
                    buffer,
                    offset,
                    size,
                    format,
                } => unsafe {
                    let view = D3D12_INDEX_BUFFER_VIEW {
                        BufferLocation: resource(buffer)?.GetGPUVirtualAddress() + offset,
                        SizeInBytes: size,
                        Format: convert::format(format),
                    };
                    list.IASetIndexBuffer(Some(&view));
                },
                Command::SetPrimitiveTopology(topology) => unsafe {
                    list.IASetPrimitiveTopology(convert::topology(topology));
                },
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => unsafe {
                    list.DrawInstanced(vertex_count, instance_count, first_vertex, first_instance);
                },
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    base_vertex,
                    first_instance,
                } => unsafe {
                    list.DrawIndexedInstanced(
                        index_count,
                        instance_count,
                        first_index,
                        base_vertex,
                        first_instance,
                    );
                },
            }
        }

        Ok(())
    }
}

impl Backend for Dx12Backend {
    fn name(&self) -> &str {
        "d3d12"
    }

    fn enumerate_adapters(&self, preference: PowerPreference) -> Result<Vec<AdapterInfo>> {
        let preference = match preference {
            PowerPreference::LowPower => DXGI_GPU_PREFERENCE_MINIMUM_POWER,
            PowerPreference::HighPerformance => DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE,
        };

        let mut adapters = self.adapters.borrow_mut();
        adapters.clear();

        let mut infos = Vec::new();
        for i in 0.. {
            // Enumeration ends with DXGI_ERROR_NOT_FOUND.
            let Ok(adapter) = (unsafe {
                self.factory
                    .EnumAdapterByGpuPreference::<IDXGIAdapter1>(i, preference)
            }) else {
                break;
            };

            let desc = unsafe { adapter.GetDesc1() }.check("IDXGIAdapter1::GetDesc1")?;
            let name_len = desc
                .Description
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(desc.Description.len());

            infos.push(AdapterInfo {
                id: AdapterId(i),
                name: String::from_utf16_lossy(&desc.Description[..name_len]),
                vendor_id: desc.VendorId,
                dedicated_video_memory: desc.DedicatedVideoMemory as u64,
                is_software: desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0,
            });
            adapters.push(adapter);
        }

        Ok(infos)
    }

    fn create_device(&self, adapter: AdapterId, level: FeatureLevel) -> Result<()> {
        if self.device.get().is_some() {
            return Err(Error::backend("D3D12CreateDevice", "a device already exists"));
        }

        let adapter = self
            .adapters
            .borrow()
            .get(adapter.0 as usize)
            .cloned()
            .ok_or_else(|| {
                Error::backend("D3D12CreateDevice", format!("{adapter:?} does not exist"))
            })?;

        let mut device: Option<ID3D12Device> = None;
        unsafe { D3D12CreateDevice(&adapter, convert::feature_level(level), &mut device) }
            .check("D3D12CreateDevice")?;
        let device =
            device.ok_or_else(|| Error::backend("D3D12CreateDevice", "no device returned"))?;

        if self.is_debug {
            self.register_debug_callback(&device);
        }

        let _ = self.device.set(device);
        Ok(())
    }

    fn create_command_objects(&self) -> Result<()> {
        let device = self.device()?;

        let queue: ID3D12CommandQueue = unsafe {
            device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                ..Default::default()
            })
        }
        .check("CreateCommandQueue")?;

        let allocator: ID3D12CommandAllocator =
            unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }
                .check("CreateCommandAllocator")?;

        let list: ID3D12GraphicsCommandList = unsafe {
            device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None)
        }
        .check("CreateCommandList")?;

        self.set_name(&queue.cast().check("QueryInterface")?, "Graphics Queue");
        self.set_name(
            &allocator.cast().check("QueryInterface")?,
            "Graphics Command Allocator",
        );

        let _ = self.commands.set(CommandObjects {
            queue,
            allocator,
            list,
        });
        Ok(())
    }

    fn descriptor_stride(&self, kind: HeapKind) -> u32 {
        self.device
            .get()
            .map_or(0, |device| unsafe {
                device.GetDescriptorHandleIncrementSize(convert::heap_kind(kind))
            })
    }

    fn create_descriptor_heap(&self, kind: HeapKind, capacity: u32) -> Result<HeapAddress> {
        let device = self.device()?;

        let flags = if kind.is_shader_visible() {
            D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
        } else {
            D3D12_DESCRIPTOR_HEAP_FLAG_NONE
        };

        let heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: convert::heap_kind(kind),
                NumDescriptors: capacity,
                Flags: flags,
                NodeMask: 0,
            })
        }
        .check("CreateDescriptorHeap")?;

        let address = unsafe {
            HeapAddress {
                cpu_base: CpuDescriptor(heap.GetCPUDescriptorHandleForHeapStart().ptr as u64),
                gpu_base: kind
                    .is_shader_visible()
                    .then(|| GpuDescriptor(heap.GetGPUDescriptorHandleForHeapStart().ptr)),
            }
        };

        self.heaps.borrow_mut().insert(kind, heap);
        Ok(address)
    }

    fn create_resource(&self, desc: &ResourceDesc) -> Result<ResourceId> {
        let device = self.device()?;

        let resource_desc = match desc.dimension {
            ResourceDimension::Buffer { size } => D3D12_RESOURCE_DESC {
                Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
                Alignment: 0,
                Width: size,
                Height: 1,
                DepthOrArraySize: 1,
                MipLevels: 1,
                Format: DXGI_FORMAT_UNKNOWN,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
                Flags: convert::resource_flags(desc.flags),
            },
            ResourceDimension::Texture2d {
                width,
                height,
                mip_levels,
                format,
            } => D3D12_RESOURCE_DESC {
                Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
                Alignment: 0,
                Width: u64::from(width),
                Height: height,
                DepthOrArraySize: 1,
                MipLevels: mip_levels,
                Format: convert::format(format),
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
                Flags: convert::resource_flags(desc.flags),
            },
        };

        let clear_value = desc.clear_value.map(|clear| match clear {
            ClearValue::Color { format, color } => D3D12_CLEAR_VALUE {
                Format: convert::format(format),
                Anonymous: D3D12_CLEAR_VALUE_0 { Color: color },
            },
            ClearValue::DepthStencil {
                format,
                depth,
                stencil,
            } => D3D12_CLEAR_VALUE {
                Format: convert::format(format),
                Anonymous: D3D12_CLEAR_VALUE_0 {
                    DepthStencil: D3D12_DEPTH_STENCIL_VALUE {
                        Depth: depth,
                        Stencil: stencil,
                    },
                },
            },
        });

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            device.CreateCommittedResource(
                &D3D12_HEAP_PROPERTIES {
                    Type: convert::heap_type(desc.heap),
                    CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
                    MemoryPoolPreference: D3D12_MEMORY_POOL_UNKNOWN,
                    CreationNodeMask: 0,
                    VisibleNodeMask: 0,
                },
                D3D12_HEAP_FLAG_NONE,
                &resource_desc,
                convert::state(desc.initial_state),
                clear_value.as_ref().map(|clear| clear as *const _),
                &mut resource,
            )
        }
        .check("CreateCommittedResource")?;

        let resource = resource
            .ok_or_else(|| Error::backend("CreateCommittedResource", "no resource returned"))?;

        if let Some(name) = &desc.name {
            self.set_name(&resource.cast().check("QueryInterface")?, name);
        }

        let size = match desc.dimension {
            ResourceDimension::Buffer { size } => size,
            ResourceDimension::Texture2d { .. } => 0,
        };

        Ok(self.insert_resource(resource, desc.heap, size))
    }

    fn release_resource(&self, resource: ResourceId) {
        if let Some(slot) = self.resources.borrow_mut().get_mut(resource.raw() as usize) {
            if slot.take().is_some() {
                trace!("released {:?}", resource);
            }
        }
    }

    fn write_resource(&self, resource: ResourceId, offset: u64, data: &[u8]) -> Result<()> {
        let (resource, range) =
            self.mapped_resource(resource, HeapType::Upload, offset, data.len())?;

        unsafe {
            let mut ptr = std::ptr::null_mut();
            resource.Map(0, None, Some(&mut ptr)).check("Map")?;
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.cast::<u8>().add(range.start),
                range.len(),
            );
            resource.Unmap(0, None);
        }

        Ok(())
    }

    fn read_resource(&self, resource: ResourceId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let (resource, range) = self.mapped_resource(resource, HeapType::Readback, offset, len)?;

        let read = D3D12_RANGE {
            Begin: range.start,
            End: range.end,
        };

        let mut out = vec![0; range.len()];
        unsafe {
            let mut ptr = std::ptr::null_mut();
            resource.Map(0, Some(&read), Some(&mut ptr)).check("Map")?;
            std::ptr::copy_nonoverlapping(
                ptr.cast::<u8>().add(range.start),
                out.as_mut_ptr(),
                range.len(),
            );
            // Nothing was written.
            resource.Unmap(0, Some(&D3D12_RANGE { Begin: 0, End: 0 }));
        }

        Ok(out)
    }

    fn create_view(&self, resource: ResourceId, view: &ViewDesc, at: CpuDescriptor) -> Result<()> {
        let device = self.device()?;
        let resource = self.resource(resource)?;
        let handle = cpu_handle(at);

        unsafe {
            match *view {
                ViewDesc::RenderTarget { format } => {
                    let desc = D3D12_RENDER_TARGET_VIEW_DESC {
                        Format: convert::format(format),
                        ViewDimension: D3D12_RTV_DIMENSION_TEXTURE2D,
                        Anonymous: D3D12_RENDER_TARGET_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_RTV {
                                MipSlice: 0,
                                PlaneSlice: 0,
                            },
                        },
                    };
                    device.CreateRenderTargetView(&resource, Some(&desc), handle);
                }
                ViewDesc::DepthStencil { format } => {
                    let desc = D3D12_DEPTH_STENCIL_VIEW_DESC {
                        Format: convert::format(format),
                        ViewDimension: D3D12_DSV_DIMENSION_TEXTURE2D,
                        Flags: D3D12_DSV_FLAG_NONE,
                        Anonymous: D3D12_DEPTH_STENCIL_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_DSV { MipSlice: 0 },
                        },
                    };
                    device.CreateDepthStencilView(&resource, Some(&desc), handle);
                }
                ViewDesc::ShaderResource { format, mip_levels } => {
                    let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
                        Format: convert::format(format),
                        ViewDimension: D3D12_SRV_DIMENSION_TEXTURE2D,
                        Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                        Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_SRV {
                                MostDetailedMip: 0,
                                MipLevels: u32::from(mip_levels),
                                PlaneSlice: 0,
                                ResourceMinLODClamp: 0.0,
                            },
                        },
                    };
                    device.CreateShaderResourceView(&resource, Some(&desc), handle);
                }
            }
        }

        Ok(())
    }

    fn create_swap_chain(
        &self,
        target: SurfaceTarget,
        desc: &SwapChainDesc,
    ) -> Result<Vec<ResourceId>> {
        let commands = self.commands()?;

        let hwnd = match target {
            SurfaceTarget::Window(RawWindowHandle::Win32(handle)) => HWND(handle.hwnd as _),
            SurfaceTarget::Window(_) | SurfaceTarget::Offscreen => {
                return Err(Error::backend(
                    "CreateSwapChainForHwnd",
                    "a Win32 window handle is required",
                ))
            }
        };

        let swap_chain: IDXGISwapChain3 = unsafe {
            self.factory.CreateSwapChainForHwnd(
                &commands.queue,
                hwnd,
                &DXGI_SWAP_CHAIN_DESC1 {
                    Width: desc.extent.width,
                    Height: desc.extent.height,
                    Format: convert::format(desc.format),
                    Stereo: false.into(),
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                    BufferCount: desc.buffer_count,
                    Scaling: DXGI_SCALING_STRETCH,
                    SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
                    AlphaMode: DXGI_ALPHA_MODE_UNSPECIFIED,
                    Flags: 0,
                },
                None,
                None,
            )
        }
        .check("CreateSwapChainForHwnd")?
        .cast()
        .check("QueryInterface")?;

        // Disable fullscreen transitions
        unsafe { self.factory.MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER) }
            .check("MakeWindowAssociation")?;

        let buffers = (0..desc.buffer_count)
            .map(|i| {
                let buffer: ID3D12Resource =
                    unsafe { swap_chain.GetBuffer(i) }.check("IDXGISwapChain::GetBuffer")?;
                self.set_name(
                    &buffer.cast().check("QueryInterface")?,
                    &format!("Swapchain Buffer {i}"),
                );
                Ok(self.insert_resource(buffer, HeapType::Default, 0))
            })
            .collect::<Result<Vec<_>>>()?;

        let _ = self.swap_chain.set(swap_chain);
        Ok(buffers)
    }

    fn current_back_buffer_index(&self) -> Result<u32> {
        Ok(unsafe { self.swap_chain()?.GetCurrentBackBufferIndex() })
    }

    fn present(&self, sync_interval: u32) -> Result<()> {
        unsafe { self.swap_chain()?.Present(sync_interval, 0) }
            .ok()
            .check("Present")
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId> {
        let pipeline = Pipeline::new(self.device()?, desc)?;

        if let Some(name) = &desc.name {
            self.set_name(&pipeline.state.cast().check("QueryInterface")?, name);
        }

        let mut pipelines = self.pipelines.borrow_mut();
        pipelines.push(pipeline);
        Ok(PipelineId::from_raw(pipelines.len() as u32 - 1))
    }

    fn execute(&self, commands: &[Command]) -> Result<()> {
        let objects = self.commands()?;

        self.replay(&objects.list, commands)?;

        unsafe {
            objects.list.Close().check("ID3D12GraphicsCommandList::Close")?;
            let list = objects.list.cast().check("QueryInterface")?;
            objects.queue.ExecuteCommandLists(&[Some(list)]);
        }

        Ok(())
    }

    fn reset_command_allocator(&self) -> Result<()> {
        let objects = self.commands()?;
        unsafe {
            objects
                .allocator
                .Reset()
                .check("ID3D12CommandAllocator::Reset")?;
            objects
                .list
                .Reset(&objects.allocator, None)
                .check("ID3D12GraphicsCommandList::Reset")
        }
    }

    fn create_fence(&self, initial_value: u64) -> Result<()> {
        let device = self.device()?;
        let fence: ID3D12Fence = unsafe { device.CreateFence(initial_value, D3D12_FENCE_FLAG_NONE) }
            .check("CreateFence")?;
        self.set_name(&fence.cast().check("QueryInterface")?, "Graphics Fence");

        let event = unsafe { CreateEventW(None, false, false, None) }.check("CreateEventW")?;

        let _ = self.fence.set(Fence { fence, event });
        Ok(())
    }

    fn signal(&self, value: u64) -> Result<()> {
        let fence = self.fence()?;
        unsafe { self.commands()?.queue.Signal(&fence.fence, value) }.check("Signal")
    }

    fn completed_value(&self) -> u64 {
        self.fence
            .get()
            .map_or(0, |fence| unsafe { fence.fence.GetCompletedValue() })
    }

    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> Result<bool> {
        let fence = self.fence()?;

        if unsafe { fence.fence.GetCompletedValue() } >= value {
            return Ok(true);
        }

        unsafe { fence.fence.SetEventOnCompletion(value, fence.event) }
            .check("SetEventOnCompletion")?;

        // u32::MAX waits forever
        let millis = timeout.map_or(u32::MAX, |timeout| {
            u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1)
        });

        match unsafe { WaitForSingleObject(fence.event, millis) } {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            other => Err(Error::backend(
                "WaitForSingleObject",
                format!("unexpected result {other:?}"),
            )),
        }
    }
}

impl Drop for Dx12Backend {
    fn drop(&mut self) {
        if self.is_debug {
            if let Ok(dxgi_debug) = unsafe { DXGIGetDebugInterface1::<IDXGIDebug1>(0) } {
                let _ = unsafe {
                    dxgi_debug.ReportLiveObjects(
                        DXGI_DEBUG_ALL,
                        DXGI_DEBUG_RLO_SUMMARY | DXGI_DEBUG_RLO_IGNORE_INTERNAL,
                    )
                };
            }
        }
    }
}

fn cpu_handle(descriptor: CpuDescriptor) -> D3D12_CPU_DESCRIPTOR_HANDLE {
    D3D12_CPU_DESCRIPTOR_HANDLE {
        ptr: descriptor.0 as usize,
    }
}

extern "system" fn d3d12_debug_callback(
    _category: D3D12_MESSAGE_CATEGORY,
    severity: D3D12_MESSAGE_SEVERITY,
    id: D3D12_MESSAGE_ID,
    description: PCSTR,
    _context: *mut std::ffi::c_void,
) {
    let description = unsafe { description.display() };
    match severity {
        D3D12_MESSAGE_SEVERITY_CORRUPTION | D3D12_MESSAGE_SEVERITY_ERROR => {
            error!("D3D12: {:?} {}", id, description);
        }
        D3D12_MESSAGE_SEVERITY_WARNING => warn!("D3D12: {:?} {}", id, description),
        D3D12_MESSAGE_SEVERITY_INFO => info!("D3D12: {:?} {}", id, description),
        _ => debug!("D3D12: {:?} {}", id, description),
    }
}
