//! Fixed-capacity descriptor heaps with stable, append-only slot indices.
//!
//! Every heap is created once with an explicit capacity. Slots are handed out
//! by bumping a counter and are never reclaimed, so a slot index stays valid
//! (and keeps pointing at the same view) for the lifetime of the heap.
//!
//! Fixed consumers that need specific slots, such as a diagnostic overlay that
//! assumes it owns the first shader-resource slot, must claim them by name
//! with [`DescriptorHeap::reserve`] before general allocation begins.

use std::{ops::Range, rc::Rc};

use log::debug;
use smallvec::SmallVec;

use crate::{backend::Backend, Error, Result};

/// The number of shader-resource slots available when no capacity is
/// configured. Sized for the textures an application loads up front plus the
/// overlay slot.
pub const MAX_SRV_COUNT: u32 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapKind {
    RenderTarget,
    DepthStencil,
    ShaderResource,
}

impl HeapKind {
    /// Only shader-resource heaps are visible to shader code.
    #[must_use]
    pub fn is_shader_visible(self) -> bool {
        matches!(self, Self::ShaderResource)
    }
}

/// CPU address of a descriptor slot, used when writing views and binding
/// render targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptor(pub u64);

/// GPU address of a descriptor slot, used by shader-visible tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptor(pub u64);

/// The base addresses of a heap as reported by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapAddress {
    pub cpu_base: CpuDescriptor,
    pub gpu_base: Option<GpuDescriptor>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorHandle {
    pub index: u32,
    pub cpu: CpuDescriptor,
    pub gpu: Option<GpuDescriptor>,
}

struct Reservation {
    name: String,
    range: Range<u32>,
}

pub struct DescriptorHeap {
    kind: HeapKind,
    capacity: u32,
    stride: u32,
    base: HeapAddress,
    next: u32,
    general_allocations: bool,
    reservations: SmallVec<[Reservation; 2]>,
}

impl DescriptorHeap {
    pub fn new(backend: &dyn Backend, kind: HeapKind, capacity: u32) -> Result<Self> {
        let stride = backend.descriptor_stride(kind);
        let base = backend.create_descriptor_heap(kind, capacity)?;

        debug!(
            "created {:?} descriptor heap: {} slots, stride {}, cpu base {:#x}",
            kind, capacity, stride, base.cpu_base.0
        );

        Ok(Self {
            kind,
            capacity,
            stride,
            base,
            next: 0,
            general_allocations: false,
            reservations: SmallVec::new(),
        })
    }

    #[must_use]
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    #[must_use]
    pub fn base(&self) -> HeapAddress {
        self.base
    }

    /// The number of slots that have been handed out, reservations included.
    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.next
    }

    /// Computes the addresses of slot `index`.
    ///
    /// Fails if `index` lies outside the heap; writing a view through an out of
    /// range handle would overwrite whatever follows the heap in memory.
    pub fn handle_at(&self, index: u32) -> Result<DescriptorHandle> {
        if index >= self.capacity {
            return Err(Error::DescriptorOutOfRange {
                kind: self.kind,
                index,
                capacity: self.capacity,
            });
        }

        let offset = u64::from(index) * u64::from(self.stride);

        Ok(DescriptorHandle {
            index,
            cpu: CpuDescriptor(self.base.cpu_base.0 + offset),
            gpu: self.base.gpu_base.map(|gpu| GpuDescriptor(gpu.0 + offset)),
        })
    }

    /// Hands out the next free slot.
    pub fn allocate(&mut self) -> Result<DescriptorHandle> {
        let index = self.claim(1)?.start;
        self.general_allocations = true;
        self.handle_at(index)
    }

    /// Claims `count` contiguous slots under `name`.
    ///
    /// Reservations must be made before the first general allocation, which
    /// guarantees they occupy the front of the heap in the order requested.
    pub fn reserve(&mut self, name: &str, count: u32) -> Result<Range<u32>> {
        if self.general_allocations {
            return Err(Error::ReservationConflict {
                name: name.to_owned(),
                reason: "general allocation has already begun",
            });
        }

        if self.reservations.iter().any(|r| r.name == name) {
            return Err(Error::ReservationConflict {
                name: name.to_owned(),
                reason: "the name is already reserved",
            });
        }

        let range = self.claim(count)?;

        debug!(
            "reserved {:?} descriptors {:?} for '{}'",
            self.kind, range, name
        );

        self.reservations.push(Reservation {
            name: name.to_owned(),
            range: range.clone(),
        });

        Ok(range)
    }

    #[must_use]
    pub fn reservation(&self, name: &str) -> Option<Range<u32>> {
        self.reservations
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.range.clone())
    }

    fn claim(&mut self, count: u32) -> Result<Range<u32>> {
        let end = self
            .next
            .checked_add(count)
            .filter(|end| *end <= self.capacity)
            .ok_or(Error::DescriptorHeapExhausted {
                kind: self.kind,
                capacity: self.capacity,
            })?;

        let range = self.next..end;
        self.next = end;
        Ok(range)
    }
}

/// The three descriptor heaps the device layer needs: one render-target view
/// per swap-chain buffer, a single depth-stencil view, and the shader-visible
/// texture table.
pub struct DescriptorAllocator {
    rtv: DescriptorHeap,
    dsv: DescriptorHeap,
    srv: DescriptorHeap,
}

impl DescriptorAllocator {
    pub fn new(
        backend: &Rc<dyn Backend>,
        render_targets: u32,
        srv_capacity: u32,
    ) -> Result<Self> {
        Ok(Self {
            rtv: DescriptorHeap::new(backend.as_ref(), HeapKind::RenderTarget, render_targets)?,
            dsv: DescriptorHeap::new(backend.as_ref(), HeapKind::DepthStencil, 1)?,
            srv: DescriptorHeap::new(backend.as_ref(), HeapKind::ShaderResource, srv_capacity)?,
        })
    }

    #[must_use]
    pub fn heap(&self, kind: HeapKind) -> &DescriptorHeap {
        match kind {
            HeapKind::RenderTarget => &self.rtv,
            HeapKind::DepthStencil => &self.dsv,
            HeapKind::ShaderResource => &self.srv,
        }
    }

    pub fn heap_mut(&mut self, kind: HeapKind) -> &mut DescriptorHeap {
        match kind {
            HeapKind::RenderTarget => &mut self.rtv,
            HeapKind::DepthStencil => &mut self.dsv,
            HeapKind::ShaderResource => &mut self.srv,
        }
    }

    pub fn handle_at(&self, kind: HeapKind, index: u32) -> Result<DescriptorHandle> {
        self.heap(kind).handle_at(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, HeadlessConfig};

    fn heap(kind: HeapKind, capacity: u32) -> DescriptorHeap {
        let backend = HeadlessBackend::new(HeadlessConfig::default());
        DescriptorHeap::new(&backend, kind, capacity).unwrap()
    }

    #[test]
    fn handles_are_strictly_increasing() {
        for (kind, capacity) in [
            (HeapKind::RenderTarget, 2),
            (HeapKind::DepthStencil, 1),
            (HeapKind::ShaderResource, MAX_SRV_COUNT),
        ] {
            let heap = heap(kind, capacity);

            let handles = (0..capacity)
                .map(|i| heap.handle_at(i).unwrap())
                .collect::<Vec<_>>();

            for pair in handles.windows(2) {
                assert!(pair[0].cpu < pair[1].cpu);
                assert_eq!(pair[1].cpu.0 - pair[0].cpu.0, u64::from(heap.stride()));
                if kind.is_shader_visible() {
                    assert!(pair[0].gpu.unwrap() < pair[1].gpu.unwrap());
                }
            }

            assert_eq!(handles[0].cpu, heap.base().cpu_base);
            assert_eq!(handles[0].gpu.is_some(), kind.is_shader_visible());
        }
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let heap = heap(HeapKind::RenderTarget, 2);
        assert!(heap.handle_at(1).is_ok());
        assert!(matches!(
            heap.handle_at(2),
            Err(Error::DescriptorOutOfRange {
                index: 2,
                capacity: 2,
                ..
            })
        ));
    }

    #[test]
    fn allocation_is_append_only() {
        let mut heap = heap(HeapKind::ShaderResource, 3);
        assert_eq!(heap.allocate().unwrap().index, 0);
        assert_eq!(heap.allocate().unwrap().index, 1);
        assert_eq!(heap.allocate().unwrap().index, 2);
        assert!(matches!(
            heap.allocate(),
            Err(Error::DescriptorHeapExhausted { capacity: 3, .. })
        ));
        assert_eq!(heap.allocated(), 3);
    }

    #[test]
    fn reservations_come_first() {
        let mut heap = heap(HeapKind::ShaderResource, 8);
        assert_eq!(heap.reserve("overlay", 1).unwrap(), 0..1);
        assert_eq!(heap.reserve("fonts", 2).unwrap(), 1..3);
        assert_eq!(heap.allocate().unwrap().index, 3);
        assert_eq!(heap.reservation("fonts"), Some(1..3));
        assert_eq!(heap.reservation("missing"), None);
    }

    #[test]
    fn conflicting_reservations_are_rejected() {
        let mut heap = heap(HeapKind::ShaderResource, 8);
        heap.reserve("overlay", 1).unwrap();
        assert!(matches!(
            heap.reserve("overlay", 1),
            Err(Error::ReservationConflict { .. })
        ));

        heap.allocate().unwrap();
        assert!(matches!(
            heap.reserve("late", 1),
            Err(Error::ReservationConflict { .. })
        ));
    }

    #[test]
    fn oversized_reservation_is_exhaustion() {
        let mut heap = heap(HeapKind::ShaderResource, 4);
        assert!(matches!(
            heap.reserve("big", 5),
            Err(Error::DescriptorHeapExhausted { .. })
        ));
        assert_eq!(heap.allocated(), 0);
    }
}
