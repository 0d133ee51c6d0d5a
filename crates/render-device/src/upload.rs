//! Staging and device-local resources, and the copies between them.
//!
//! Uploads are recorded on whatever command list is currently open; they
//! execute when that list is submitted. The staging memory a copy reads from
//! must outlive the copy, so every upload returns a [`PendingUpload`] that
//! ties the staging buffer to the fence value of the submission that consumes
//! it. Pending uploads are parked in a [`GarbageQueue`] and released once the
//! fence has been observed to pass that value.

use std::{collections::VecDeque, rc::Rc};

use bytemuck::Pod;
use log::{debug, trace};

use crate::{
    backend::{mapped_range, Backend},
    command::{Command, CommandList, PlacedFootprint},
    image::{mip_extent, MipChain},
    resource::{Format, HeapType, ResourceDesc, ResourceId, ResourceState},
    sync::FenceValue,
    Error, Result,
};

/// Rows of texture data in a buffer must start on this boundary.
pub const ROW_PITCH_ALIGNMENT: u64 = 256;

/// Each subresource's data in a buffer must start on this boundary.
pub const PLACEMENT_ALIGNMENT: u64 = 512;

pub(crate) fn next_multiple_of(a: u64, b: u64) -> u64 {
    match a % b {
        0 => a,
        r => a + b - r,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureMetadata {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u16,
    pub format: Format,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Buffer {
    pub id: ResourceId,
    pub size: u64,
    pub heap: HeapType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Texture {
    pub id: ResourceId,
    pub metadata: TextureMetadata,
}

/// Lays out every mip level of a texture in a linear buffer, with rows padded
/// to [`ROW_PITCH_ALIGNMENT`] and levels placed on [`PLACEMENT_ALIGNMENT`].
/// Returns the footprints and the total buffer size needed.
#[must_use]
pub fn texture_footprints(metadata: &TextureMetadata) -> (Vec<PlacedFootprint>, u64) {
    let format = metadata.format.storage();
    let mut offset = 0;
    let mut footprints = Vec::with_capacity(usize::from(metadata.mip_levels));

    for level in 0..u32::from(metadata.mip_levels.max(1)) {
        let (width, height) = mip_extent(metadata.width, metadata.height, level);
        let row_pitch = next_multiple_of(
            u64::from(width) * u64::from(format.bytes_per_pixel()),
            ROW_PITCH_ALIGNMENT,
        );

        offset = next_multiple_of(offset, PLACEMENT_ALIGNMENT);
        footprints.push(PlacedFootprint {
            offset,
            format,
            width,
            height,
            row_pitch: row_pitch as u32,
        });
        offset += row_pitch * u64::from(height);
    }

    (footprints, offset)
}

/// A staging buffer that must stay alive until the GPU has consumed it.
#[derive(Debug)]
#[must_use = "the staging buffer leaks unless it is retired into a GarbageQueue"]
pub struct PendingUpload {
    pub staging: Buffer,
    pub fence: FenceValue,
}

/// Resources waiting for the GPU to finish with them.
#[derive(Debug, Default)]
pub struct GarbageQueue {
    pending: VecDeque<(ResourceId, FenceValue)>,
}

impl GarbageQueue {
    pub fn retire(&mut self, upload: PendingUpload) {
        self.retire_resource(upload.staging.id, upload.fence);
    }

    /// Queues any resource that recorded commands still reference.
    pub fn retire_resource(&mut self, resource: ResourceId, fence: FenceValue) {
        trace!("retiring {:?} until fence {}", resource, fence.0);
        self.pending.push_back((resource, fence));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Releases every resource whose fence value has been reached.
    /// Returns the number released.
    pub fn collect(&mut self, backend: &dyn Backend, completed: FenceValue) -> usize {
        let before = self.pending.len();

        // Fence values are retired in submission order, but don't rely on it.
        self.pending.retain(|&(resource, fence)| {
            if fence <= completed {
                backend.release_resource(resource);
                false
            } else {
                true
            }
        });

        before - self.pending.len()
    }
}

/// Bytes copied out of a texture, still in their padded footprint.
#[derive(Debug)]
pub struct Readback {
    pub buffer: Buffer,
    pub footprint: PlacedFootprint,
}

pub struct UploadPipeline {
    backend: Rc<dyn Backend>,
}

impl UploadPipeline {
    #[must_use]
    pub fn new(backend: Rc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// A CPU-writable buffer in host memory the GPU can read.
    pub fn create_upload_buffer(&self, size: u64) -> Result<Buffer> {
        self.create_buffer(HeapType::Upload, size, ResourceState::GenericRead, "Upload Buffer")
    }

    /// A device-local buffer, ready to be copied into.
    pub fn create_gpu_buffer(&self, size: u64) -> Result<Buffer> {
        self.create_buffer(HeapType::Default, size, ResourceState::CopyDest, "GPU Buffer")
    }

    /// A host-memory buffer the GPU can copy into for the CPU to read.
    pub fn create_readback_buffer(&self, size: u64) -> Result<Buffer> {
        self.create_buffer(
            HeapType::Readback,
            size,
            ResourceState::CopyDest,
            "Readback Buffer",
        )
    }

    /// A device-local texture, ready to be copied into.
    pub fn create_gpu_texture(&self, metadata: &TextureMetadata) -> Result<Texture> {
        let id = self.backend.create_resource(
            &ResourceDesc::texture_2d(
                metadata.width,
                metadata.height,
                metadata.mip_levels,
                metadata.format,
                ResourceState::CopyDest,
            )
            .with_name("Texture"),
        )?;

        Ok(Texture {
            id,
            metadata: *metadata,
        })
    }

    fn create_buffer(
        &self,
        heap: HeapType,
        size: u64,
        state: ResourceState,
        name: &str,
    ) -> Result<Buffer> {
        let id = self
            .backend
            .create_resource(&ResourceDesc::buffer(heap, size, state).with_name(name))?;
        Ok(Buffer { id, size, heap })
    }

    pub fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        if buffer.heap != HeapType::Upload {
            return Err(Error::InvalidResource(buffer.id));
        }

        mapped_range(buffer.size, offset, data.len())?;

        self.backend.write_resource(buffer.id, offset, data)
    }

    /// Writes plain-old-data values, such as vertices or constants.
    pub fn write_pod<T: Pod>(&self, buffer: &Buffer, offset: u64, values: &[T]) -> Result<()> {
        self.write_buffer(buffer, offset, bytemuck::cast_slice(values))
    }

    pub fn release(&self, buffer: Buffer) {
        self.backend.release_resource(buffer.id);
    }

    /// Records a copy of `data` into `dest` and a transition that makes
    /// `dest` readable as a vertex, index or constant buffer.
    pub fn upload_buffer(
        &self,
        list: &mut CommandList,
        dest: &Buffer,
        data: &[u8],
        fence: FenceValue,
    ) -> Result<PendingUpload> {
        if dest.heap != HeapType::Default || data.len() as u64 > dest.size {
            return Err(Error::InvalidResource(dest.id));
        }

        let staging = self.create_upload_buffer(data.len() as u64)?;
        let recorded = self.backend.write_resource(staging.id, 0, data).and_then(|()| {
            list.record(Command::CopyBuffer {
                src: staging.id,
                src_offset: 0,
                dst: dest.id,
                dst_offset: 0,
                size: data.len() as u64,
            })?;
            list.barrier(dest.id, ResourceState::CopyDest, ResourceState::GenericRead)
        });

        self.pending_or_release(staging, fence, recorded)
    }

    /// Nothing owns `staging` if recording failed, so it is released here.
    fn pending_or_release(
        &self,
        staging: Buffer,
        fence: FenceValue,
        recorded: Result<()>,
    ) -> Result<PendingUpload> {
        match recorded {
            Ok(()) => Ok(PendingUpload { staging, fence }),
            Err(e) => {
                self.release(staging);
                Err(e)
            }
        }
    }

    /// Records the upload of every level of `image` into `dest`, followed by
    /// a transition from copy destination to shader readable.
    ///
    /// `fence` is the value that will be signaled after the recording list is
    /// submitted; the staging buffer must not be released before then.
    pub fn upload_texture(
        &self,
        list: &mut CommandList,
        dest: &Texture,
        image: &MipChain,
        fence: FenceValue,
    ) -> Result<PendingUpload> {
        if image.metadata().mip_levels > dest.metadata.mip_levels
            || (image.width(), image.height()) != (dest.metadata.width, dest.metadata.height)
            || image.format().storage() != dest.metadata.format.storage()
        {
            return Err(Error::InvalidResource(dest.id));
        }

        let metadata = TextureMetadata {
            mip_levels: image.mip_levels(),
            ..dest.metadata
        };
        let (footprints, total) = texture_footprints(&metadata);

        let staging = self.create_upload_buffer(total)?;

        let mut bytes = vec![0u8; total as usize];
        for (footprint, level) in footprints.iter().zip(image.levels()) {
            for (y, row) in level.rows().enumerate() {
                let start = footprint.offset as usize + y * footprint.row_pitch as usize;
                bytes[start..start + row.len()].copy_from_slice(row);
            }
        }
        let recorded = self.backend.write_resource(staging.id, 0, &bytes).and_then(|()| {
            for (subresource, footprint) in footprints.iter().enumerate() {
                list.record(Command::CopyBufferToTexture {
                    src: staging.id,
                    footprint: *footprint,
                    dst: dest.id,
                    subresource: subresource as u32,
                })?;
            }

            list.barrier(
                dest.id,
                ResourceState::CopyDest,
                ResourceState::PixelShaderResource,
            )
        });

        let pending = self.pending_or_release(staging, fence, recorded)?;

        debug!(
            "recorded upload of {}x{} texture ({} levels, {} staging bytes)",
            metadata.width, metadata.height, metadata.mip_levels, total
        );

        Ok(pending)
    }

    /// Records a copy of mip `level` of `src` into a new readback buffer.
    /// `state` is the state `src` is in; it is restored afterwards.
    pub fn copy_texture_to_readback(
        &self,
        list: &mut CommandList,
        src: &Texture,
        level: u16,
        state: ResourceState,
    ) -> Result<Readback> {
        if level >= src.metadata.mip_levels {
            return Err(Error::InvalidResource(src.id));
        }

        let (footprints, _) = texture_footprints(&src.metadata);
        let footprint = PlacedFootprint {
            offset: 0,
            ..footprints[usize::from(level)]
        };

        let buffer = self.create_readback_buffer(
            u64::from(footprint.row_pitch) * u64::from(footprint.height),
        )?;

        let recorded = list
            .barrier(src.id, state, ResourceState::CopySource)
            .and_then(|()| {
                list.record(Command::CopyTextureToBuffer {
                    src: src.id,
                    subresource: u32::from(level),
                    dst: buffer.id,
                    footprint,
                })
            })
            .and_then(|()| list.barrier(src.id, ResourceState::CopySource, state));

        if let Err(e) = recorded {
            self.release(buffer);
            return Err(e);
        }

        Ok(Readback { buffer, footprint })
    }

    /// Reads a completed readback, dropping the row padding.
    pub fn read_texture(&self, readback: &Readback) -> Result<Vec<u8>> {
        let footprint = &readback.footprint;
        let padded = self.backend.read_resource(
            readback.buffer.id,
            0,
            readback.buffer.size as usize,
        )?;

        let row_bytes = footprint.row_bytes() as usize;
        Ok(padded
            .chunks(footprint.row_pitch as usize)
            .take(footprint.height as usize)
            .flat_map(|row| &row[..row_bytes])
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            headless::{HeadlessBackend, HeadlessConfig},
            AdapterId, FeatureLevel,
        },
        image::ColorSpace,
    };

    fn pipeline() -> (Rc<HeadlessBackend>, UploadPipeline) {
        let backend = Rc::new(HeadlessBackend::new(HeadlessConfig::default()));
        backend
            .create_device(AdapterId(0), FeatureLevel::Level12_0)
            .unwrap();
        backend.create_command_objects().unwrap();
        backend.create_fence(0).unwrap();
        let pipeline = UploadPipeline::new(backend.clone());
        (backend, pipeline)
    }

    fn submit(backend: &HeadlessBackend, list: &mut CommandList, value: u64) {
        list.close().unwrap();
        backend.execute(list.commands()).unwrap();
        backend.signal(value).unwrap();
        assert!(backend.wait_for_value(value, None).unwrap());
    }

    #[test]
    fn footprints_are_aligned() {
        let (footprints, total) = texture_footprints(&TextureMetadata {
            width: 100,
            height: 10,
            mip_levels: 3,
            format: Format::Rgba8UnormSrgb,
        });

        assert_eq!(footprints.len(), 3);
        assert_eq!(footprints[0].row_pitch, 512);
        assert_eq!(footprints[0].offset, 0);
        assert_eq!(footprints[1].row_pitch, 256);
        assert_eq!(footprints[1].offset, 512 * 10);
        assert_eq!((footprints[2].width, footprints[2].height), (25, 2));
        assert_eq!(footprints[2].offset, 512 * 10 + 256 * 5 + 256);
        assert_eq!(total, footprints[2].offset + 256 * 2);
        assert!(footprints
            .iter()
            .all(|f| f.offset % PLACEMENT_ALIGNMENT == 0
                && u64::from(f.row_pitch) % ROW_PITCH_ALIGNMENT == 0));
    }

    #[test]
    fn texture_round_trip() {
        let (backend, uploads) = pipeline();
        let probe = backend.probe();

        let (width, height) = (3, 5);
        let pixels = (0..width * height * 4).map(|i| i as u8).collect::<Vec<_>>();
        let image = MipChain::from_rgba8(width, height, pixels.clone(), ColorSpace::Linear).unwrap();

        let texture = uploads.create_gpu_texture(&image.metadata()).unwrap();
        let mut list = CommandList::new();
        let pending = uploads
            .upload_texture(&mut list, &texture, &image, FenceValue(1))
            .unwrap();
        let readback = uploads
            .copy_texture_to_readback(&mut list, &texture, 0, ResourceState::PixelShaderResource)
            .unwrap();
        submit(&backend, &mut list, 1);

        assert_eq!(uploads.read_texture(&readback).unwrap(), pixels);
        assert_eq!(
            probe.resource_state(texture.id),
            Some(ResourceState::PixelShaderResource)
        );
        assert!(probe.validation_errors().is_empty(), "{:?}", probe.validation_errors());

        let mut garbage = GarbageQueue::default();
        garbage.retire(pending);
        assert_eq!(garbage.collect(backend.as_ref(), FenceValue(1)), 1);
    }

    #[test]
    fn every_mip_level_is_uploaded() {
        let (backend, uploads) = pipeline();
        let probe = backend.probe();

        let image = MipChain::checkerboard(8, 1, [255, 0, 0, 255], [0, 0, 255, 255])
            .with_generated_mips();
        let texture = uploads.create_gpu_texture(&image.metadata()).unwrap();

        let mut list = CommandList::new();
        let _pending = uploads
            .upload_texture(&mut list, &texture, &image, FenceValue(1))
            .unwrap();
        submit(&backend, &mut list, 1);

        for (level, expected) in image.levels().iter().enumerate() {
            assert_eq!(
                probe.subresource_data(texture.id, level as u32).unwrap(),
                expected.bytes()
            );
        }
    }

    #[test]
    fn buffer_upload_transitions_to_generic_read() {
        let (backend, uploads) = pipeline();
        let probe = backend.probe();

        let vertices: [[f32; 2]; 3] = [[0.0, 0.5], [0.5, -0.5], [-0.5, -0.5]];
        let data = bytemuck::cast_slice::<_, u8>(&vertices);
        let dest = uploads.create_gpu_buffer(data.len() as u64).unwrap();

        let mut list = CommandList::new();
        let _pending = uploads
            .upload_buffer(&mut list, &dest, data, FenceValue(1))
            .unwrap();
        submit(&backend, &mut list, 1);

        assert_eq!(probe.resource_state(dest.id), Some(ResourceState::GenericRead));
        assert_eq!(probe.subresource_data(dest.id, 0).unwrap(), data);
    }

    #[test]
    fn garbage_waits_for_its_fence() {
        let (backend, uploads) = pipeline();
        let probe = backend.probe();

        let first = uploads.create_upload_buffer(64).unwrap();
        let second = uploads.create_upload_buffer(64).unwrap();

        let mut garbage = GarbageQueue::default();
        garbage.retire(PendingUpload {
            staging: first,
            fence: FenceValue(1),
        });
        garbage.retire(PendingUpload {
            staging: second,
            fence: FenceValue(2),
        });

        assert_eq!(garbage.collect(backend.as_ref(), FenceValue(0)), 0);
        assert_eq!(garbage.collect(backend.as_ref(), FenceValue(1)), 1);
        assert!(probe.is_released(first.id));
        assert!(!probe.is_released(second.id));
        assert_eq!(garbage.len(), 1);

        assert_eq!(garbage.collect(backend.as_ref(), FenceValue(5)), 1);
        assert!(garbage.is_empty());
    }

    #[test]
    fn writes_stay_inside_the_buffer() {
        let (backend, uploads) = pipeline();
        let probe = backend.probe();
        let buffer = uploads.create_upload_buffer(256).unwrap();

        uploads.write_buffer(&buffer, 200, &[7; 56]).unwrap();
        assert!(matches!(
            uploads.write_buffer(&buffer, 200, &[7; 100]),
            Err(Error::Backend { call: "Map", .. })
        ));
        assert!(uploads.write_buffer(&buffer, u64::MAX, &[7; 2]).is_err());
        assert!(probe.validation_errors().is_empty());
    }

    #[test]
    fn texture_format_must_match_the_image() {
        let (backend, uploads) = pipeline();
        let probe = backend.probe();

        let image = MipChain::checkerboard(200, 8, [0; 4], [255; 4]);
        let narrow = uploads
            .create_gpu_texture(&TextureMetadata {
                format: Format::R16Uint,
                ..image.metadata()
            })
            .unwrap();
        let live = probe.live_resources();

        let mut list = CommandList::new();
        assert!(matches!(
            uploads.upload_texture(&mut list, &narrow, &image, FenceValue(1)),
            Err(Error::InvalidResource(id)) if id == narrow.id
        ));
        assert!(list.is_empty());
        assert_eq!(probe.live_resources(), live);

        // sRGB and linear views of the same texels share a layout.
        let linear = uploads
            .create_gpu_texture(&TextureMetadata {
                format: Format::Rgba8Unorm,
                ..image.metadata()
            })
            .unwrap();
        let _pending = uploads
            .upload_texture(&mut list, &linear, &image, FenceValue(1))
            .unwrap();
    }

    #[test]
    fn failed_recording_releases_staging() {
        let (backend, uploads) = pipeline();
        let probe = backend.probe();

        let image = MipChain::checkerboard(8, 2, [0; 4], [255; 4]);
        let texture = uploads.create_gpu_texture(&image.metadata()).unwrap();
        let buffer = uploads.create_gpu_buffer(64).unwrap();
        let live = probe.live_resources();

        let mut list = CommandList::new();
        list.close().unwrap();

        assert!(matches!(
            uploads.upload_texture(&mut list, &texture, &image, FenceValue(1)),
            Err(Error::CommandListClosed)
        ));
        assert!(matches!(
            uploads.upload_buffer(&mut list, &buffer, &[1; 64], FenceValue(1)),
            Err(Error::CommandListClosed)
        ));
        assert!(matches!(
            uploads.copy_texture_to_readback(
                &mut list,
                &texture,
                0,
                ResourceState::CopyDest
            ),
            Err(Error::CommandListClosed)
        ));
        assert_eq!(probe.live_resources(), live);
    }

    #[test]
    fn pod_writes_need_an_upload_heap() {
        let (_backend, uploads) = pipeline();
        let upload = uploads.create_upload_buffer(16).unwrap();
        uploads.write_pod(&upload, 0, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();

        let local = uploads.create_gpu_buffer(16).unwrap();
        assert!(matches!(
            uploads.write_pod(&local, 0, &[1u32]),
            Err(Error::InvalidResource(_))
        ));
    }
}
