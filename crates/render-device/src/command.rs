//! Command recording.
//!
//! Commands are recorded into a backend-neutral [`CommandList`] and replayed
//! onto the native command list when the list is submitted. The list and its
//! [`CommandAllocator`] follow the native rules: a list must be closed before
//! it is submitted, and it may only be reset once the GPU has finished with
//! the allocator's previous contents.

use geometry::{Px, Rect, Viewport};
use log::trace;

use crate::{
    descriptor::{CpuDescriptor, GpuDescriptor, HeapKind},
    resource::{Format, PipelineId, ResourceId, ResourceState},
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub resource: ResourceId,
    pub before: ResourceState,
    pub after: ResourceState,
}

/// The layout of one texture subresource inside a linear buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlacedFootprint {
    /// Byte offset of the first row within the buffer.
    pub offset: u64,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    /// Distance in bytes between the starts of consecutive rows.
    pub row_pitch: u32,
}

impl PlacedFootprint {
    /// The number of meaningful bytes in each row. The rest of the pitch is
    /// padding.
    #[must_use]
    pub fn row_bytes(&self) -> u32 {
        self.width * self.format.bytes_per_pixel()
    }

    /// The number of bytes spanned by the footprint, excluding the padding
    /// after the last row.
    #[must_use]
    pub fn span(&self) -> u64 {
        if self.height == 0 {
            return 0;
        }

        u64::from(self.row_pitch) * u64::from(self.height - 1) + u64::from(self.row_bytes())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimitiveTopology {
    TriangleList,
    TriangleStrip,
    LineList,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    Barrier(Transition),
    SetRenderTargets {
        render_target: CpuDescriptor,
        depth_stencil: Option<CpuDescriptor>,
    },
    ClearRenderTarget {
        view: CpuDescriptor,
        color: [f32; 4],
    },
    ClearDepthStencil {
        view: CpuDescriptor,
        depth: f32,
        stencil: u8,
    },
    SetViewport(Viewport),
    SetScissor(Rect<u32, Px>),
    SetDescriptorHeap(HeapKind),
    CopyBuffer {
        src: ResourceId,
        src_offset: u64,
        dst: ResourceId,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: ResourceId,
        footprint: PlacedFootprint,
        dst: ResourceId,
        subresource: u32,
    },
    CopyTextureToBuffer {
        src: ResourceId,
        subresource: u32,
        dst: ResourceId,
        footprint: PlacedFootprint,
    },
    SetPipeline(PipelineId),
    SetRootDescriptorTable {
        parameter: u32,
        base: GpuDescriptor,
    },
    SetRootConstantBuffer {
        parameter: u32,
        buffer: ResourceId,
        offset: u64,
    },
    SetVertexBuffer {
        buffer: ResourceId,
        offset: u64,
        size: u32,
        stride: u32,
    },
    SetIndexBuffer {
        buffer: ResourceId,
        offset: u64,
        size: u32,
        format: Format,
    },
    SetPrimitiveTopology(PrimitiveTopology),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListState {
    Recording,
    Closed,
}

/// Tracks the GPU work recorded through an allocator so that it is only
/// reset after that work has completed.
#[derive(Debug, Default)]
pub struct CommandAllocator {
    in_flight: Option<u64>,
}

impl CommandAllocator {
    /// Records that the allocator's contents were submitted and will be done
    /// once the fence reaches `fence_value`.
    pub fn mark_submitted(&mut self, fence_value: u64) {
        self.in_flight = Some(fence_value);
    }

    #[must_use]
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    /// Resets the allocator, given the fence value the GPU has completed.
    pub fn reset(&mut self, completed: u64) -> Result<()> {
        match self.in_flight {
            Some(required) if completed < required => {
                Err(Error::AllocatorInUse { required, completed })
            }
            _ => {
                self.in_flight = None;
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
pub struct CommandList {
    state: ListState,
    commands: Vec<Command>,
}

impl CommandList {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ListState::Recording,
            commands: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ListState {
        self.state
    }

    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn record(&mut self, command: Command) -> Result<()> {
        if self.state == ListState::Closed {
            return Err(Error::CommandListClosed);
        }

        trace!("record {:?}", command);
        self.commands.push(command);
        Ok(())
    }

    pub fn barrier(
        &mut self,
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()> {
        self.record(Command::Barrier(Transition {
            resource,
            before,
            after,
        }))
    }

    pub fn close(&mut self) -> Result<()> {
        if self.state == ListState::Closed {
            return Err(Error::CommandListClosed);
        }

        self.state = ListState::Closed;
        Ok(())
    }

    /// Reopens the list for recording. The allocator must have been reset,
    /// which proves the GPU is done with the previous contents.
    pub fn reset(&mut self, allocator: &CommandAllocator) -> Result<()> {
        if self.state == ListState::Recording {
            return Err(Error::CommandListOpen);
        }

        if let Some(required) = allocator.in_flight() {
            return Err(Error::AllocatorInUse {
                required,
                completed: required.saturating_sub(1),
            });
        }

        self.commands.clear();
        self.state = ListState::Recording;
        Ok(())
    }
}

impl Default for CommandList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_list_rejects_commands() {
        let mut list = CommandList::new();
        list.record(Command::SetDescriptorHeap(HeapKind::ShaderResource))
            .unwrap();
        list.close().unwrap();

        assert!(matches!(
            list.record(Command::SetDescriptorHeap(HeapKind::ShaderResource)),
            Err(Error::CommandListClosed)
        ));
        assert!(matches!(list.close(), Err(Error::CommandListClosed)));
        assert_eq!(list.commands().len(), 1);
    }

    #[test]
    fn open_list_cannot_be_reset() {
        let mut list = CommandList::new();
        assert!(matches!(
            list.reset(&CommandAllocator::default()),
            Err(Error::CommandListOpen)
        ));
    }

    #[test]
    fn reset_waits_for_allocator() {
        let mut allocator = CommandAllocator::default();
        let mut list = CommandList::new();
        list.barrier(
            ResourceId::from_raw(0),
            ResourceState::Present,
            ResourceState::RenderTarget,
        )
        .unwrap();
        list.close().unwrap();
        allocator.mark_submitted(4);

        assert!(matches!(
            allocator.reset(3),
            Err(Error::AllocatorInUse {
                required: 4,
                completed: 3
            })
        ));
        assert!(list.reset(&allocator).is_err());

        allocator.reset(4).unwrap();
        list.reset(&allocator).unwrap();
        assert_eq!(list.state(), ListState::Recording);
        assert!(list.is_empty());
    }

    #[test]
    fn footprint_span_excludes_trailing_padding() {
        let footprint = PlacedFootprint {
            offset: 0,
            format: Format::Rgba8Unorm,
            width: 3,
            height: 2,
            row_pitch: 256,
        };
        assert_eq!(footprint.row_bytes(), 12);
        assert_eq!(footprint.span(), 256 + 12);
    }
}
