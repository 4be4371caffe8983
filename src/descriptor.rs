// Copyright (c) 2024 The fenced developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Descriptor heap management.
//!
//! Explicit APIs require descriptors — fixed-size opaque records selecting
//! a resource view — to live inside descriptor heaps. Two flavors are
//! managed here:
//!
//! - [`DescriptorHeapManager`] allocates single descriptors out of CPU-only
//!   heap pages for long-lived view and sampler objects. Each page keeps an
//!   ordered, coalescing free-list of address ranges; pages are never
//!   destroyed before the manager, so recorded work may refer to them.
//!
//! - [`OnlineDescriptorHeap`] owns the shader-visible heap that command
//!   recording copies descriptors into. Slots are suballocated through a
//!   [`FencedRingBuffer`] on the GPU timeline; when the ring is exhausted
//!   the whole heap *rolls over*: it is parked in a [`FencePool`] until the
//!   GPU is done with it and a recycled (or new) heap takes its place.
//!
//! The actual heap objects come from the embedder through
//! [`DescriptorDevice`].

use crate::{
    pool::FencePool,
    ring::{FencedRingBuffer, RingBufferError},
    AllocationError, DeviceSize, FenceValue,
};
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, sync::Arc};

/// The address of a single descriptor within a heap.
///
/// Addresses are in bytes, as reported by the device, and advance in steps
/// of the device's descriptor size.
pub type DescriptorHandle = DeviceSize;

/// Index of a page within a [`DescriptorHeapManager`].
pub type HeapIndex = u32;

/// The kind of descriptors a heap stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// Shader resource, constant buffer and unordered access views.
    View,
    Sampler,
    RenderTarget,
    DepthStencil,
}

/// Types that can create descriptor heaps.
///
/// Implemented by the embedder over the actual device. The returned heap
/// object is an opaque owning token; dropping it releases the underlying
/// heap, so implementations must not hand out heaps that are still
/// referenced elsewhere.
pub trait DescriptorDevice {
    type Heap;

    /// The address increment between adjacent descriptors of this kind.
    ///
    /// Queried once per manager, at construction.
    fn descriptor_size(&self, kind: DescriptorHeapKind) -> DeviceSize;

    /// Creates a heap of `num_descriptors` descriptors and returns it
    /// together with the address of its first descriptor.
    fn create_heap(
        &self,
        kind: DescriptorHeapKind,
        num_descriptors: u32,
        shader_visible: bool,
    ) -> Result<(Self::Heap, DescriptorHandle), AllocationError>;
}

/// A half-open range of free descriptor addresses within one page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeRange {
    start: DescriptorHandle,
    end: DescriptorHandle,
}

struct HeapPage<H> {
    heap: H,
    // Ordered by start address, non-overlapping, never touching: adjacent
    // ranges are coalesced on free.
    free_list: Vec<FreeRange>,
}

struct ManagerState<H> {
    // Pages are boxed and only ever appended, so a page (and the heap
    // inside it) never moves for the lifetime of the manager; recorded
    // work may hold references into it.
    pages: Vec<Box<HeapPage<H>>>,
    // Indices of pages that currently have free space.
    free_pages: VecDeque<HeapIndex>,
}

/// Allocates descriptors from CPU-only heaps.
///
/// The manager grows by whole pages of `descriptors_per_page` descriptors
/// and recycles freed slots through a per-page free-list. It locks
/// internally: descriptors are freed from object destructors, which may
/// run on any thread.
pub struct DescriptorHeapManager<D: DescriptorDevice> {
    device: Arc<D>,
    kind: DescriptorHeapKind,
    descriptors_per_page: u32,
    descriptor_size: DeviceSize,
    state: Mutex<ManagerState<D::Heap>>,
    // Makes `free` treat its next bookkeeping reservation as failed.
    #[cfg(test)]
    fail_bookkeeping: std::sync::atomic::AtomicBool,
}

impl<D: DescriptorDevice> DescriptorHeapManager<D> {
    /// Creates a manager for descriptors of the given kind.
    ///
    /// `descriptors_per_page` must be positive. The descriptor size is
    /// queried from the device once, here.
    pub fn new(device: Arc<D>, kind: DescriptorHeapKind, descriptors_per_page: u32) -> Self {
        assert!(descriptors_per_page > 0);

        let descriptor_size = device.descriptor_size(kind);

        DescriptorHeapManager {
            device,
            kind,
            descriptors_per_page,
            descriptor_size,
            state: Mutex::new(ManagerState {
                pages: Vec::new(),
                free_pages: VecDeque::new(),
            }),
            #[cfg(test)]
            fail_bookkeeping: std::sync::atomic::AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    fn bookkeeping_failed(&self) -> bool {
        self.fail_bookkeeping
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    #[cfg(not(test))]
    fn bookkeeping_failed(&self) -> bool {
        false
    }

    pub fn descriptor_size(&self) -> DeviceSize {
        self.descriptor_size
    }

    /// Allocates one descriptor slot.
    ///
    /// Takes the first free range of the first page with free space,
    /// creating a new page if none has any. The returned page index is
    /// needed to free the slot again.
    pub fn allocate(&self) -> Result<(DescriptorHandle, HeapIndex), AllocationError> {
        let mut state = self.state.lock();
        let state = &mut *state;

        if state.free_pages.is_empty() {
            let (heap, base) =
                self.device
                    .create_heap(self.kind, self.descriptors_per_page, false)?;

            let page = Box::new(HeapPage {
                heap,
                free_list: vec![FreeRange {
                    start: base,
                    end: base + DeviceSize::from(self.descriptors_per_page) * self.descriptor_size,
                }],
            });

            let index = state.pages.len() as HeapIndex;
            state.pages.push(page);
            state.free_pages.push_back(index);
        }

        let index = *state.free_pages.front().unwrap();
        let page = &mut state.pages[index as usize];
        let range = page
            .free_list
            .first_mut()
            .expect("a page in the free-page list has free space");

        let handle = range.start;
        range.start += self.descriptor_size;

        if range.start == range.end {
            page.free_list.remove(0);

            if page.free_list.is_empty() {
                state.free_pages.pop_front();
            }
        }

        Ok((handle, index))
    }

    /// Returns a descriptor slot to its page.
    ///
    /// The freed range is coalesced with any range it touches, keeping the
    /// free-list sorted, non-overlapping and touch-free. If bookkeeping
    /// memory cannot be allocated, the slot is silently leaked for the
    /// session; no invariant is violated.
    pub fn free(&self, handle: DescriptorHandle, index: HeapIndex) {
        let mut state = self.state.lock();
        let state = &mut *state;

        debug_assert!((index as usize) < state.pages.len());
        let page = &mut state.pages[index as usize];
        let was_exhausted = page.free_list.is_empty();

        let new_range = FreeRange {
            start: handle,
            end: handle + self.descriptor_size,
        };

        let mut found = false;

        for position in 0..page.free_list.len() {
            let range = page.free_list[position];
            debug_assert!(range.start <= range.end);

            if range.start == new_range.end {
                // Extend this range leftward over the freed slot, then
                // merge with the previous range if they now touch.
                page.free_list[position].start = new_range.start;

                if position > 0 && page.free_list[position - 1].end == new_range.start {
                    page.free_list[position - 1].end = page.free_list[position].end;
                    page.free_list.remove(position);
                }

                found = true;
            } else if range.end == new_range.start {
                // Extend this range rightward, then merge with the next
                // range if they now touch.
                page.free_list[position].end = new_range.end;

                if let Some(next) = page.free_list.get(position + 1).copied() {
                    if next.start == new_range.end {
                        page.free_list[position].end = next.end;
                        page.free_list.remove(position + 1);
                    }
                }

                found = true;
            } else {
                debug_assert!(range.end < new_range.start || range.start > new_range.start);

                if range.start > new_range.start {
                    if self.bookkeeping_failed() || page.free_list.try_reserve(1).is_err() {
                        // Leak the slot; there is nothing safe to do here.
                        return;
                    }

                    page.free_list.insert(position, new_range);
                    found = true;
                }
            }

            if found {
                break;
            }
        }

        if !found {
            if self.bookkeeping_failed()
                || page.free_list.try_reserve(1).is_err()
                || state.free_pages.try_reserve(1).is_err()
            {
                return;
            }

            page.free_list.push(new_range);
        }

        if was_exhausted {
            state.free_pages.push_back(index);
        }
    }

    /// The heap object backing page `index`.
    pub fn with_heap<T>(&self, index: HeapIndex, f: impl FnOnce(&D::Heap) -> T) -> T {
        let state = self.state.lock();
        f(&state.pages[index as usize].heap)
    }

    /// The number of pages allocated so far.
    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    #[cfg(test)]
    fn free_ranges(&self, index: HeapIndex) -> Vec<(DescriptorHandle, DescriptorHandle)> {
        let state = self.state.lock();
        state.pages[index as usize]
            .free_list
            .iter()
            .map(|range| (range.start, range.end))
            .collect()
    }

    #[cfg(test)]
    fn free_page_indices(&self) -> Vec<HeapIndex> {
        self.state.lock().free_pages.iter().copied().collect()
    }
}

impl<D: DescriptorDevice> fmt::Debug for DescriptorHeapManager<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorHeapManager")
            .field("kind", &self.kind)
            .field("descriptors_per_page", &self.descriptors_per_page)
            .field("descriptor_size", &self.descriptor_size)
            .finish_non_exhaustive()
    }
}

struct OnlineHeap<H> {
    heap: H,
    base: DescriptorHandle,
}

/// The shader-visible descriptor heap bound during command recording.
///
/// Slots are reserved out of a [`FencedRingBuffer`] keyed on the owning
/// queue's fence. When no contiguous span is free, [`reserve_slots`] rolls
/// the heap over: the current heap is returned to a pool tagged with the
/// current fence value, and a pooled heap whose fence has completed (or a
/// newly created one) replaces it with an empty ring.
///
/// Rolling over invalidates all previously reserved slots, so callers must
/// re-copy any descriptor tables they still need — the same contract as
/// switching heaps on a command list.
///
/// [`reserve_slots`]: Self::reserve_slots
pub struct OnlineDescriptorHeap<D: DescriptorDevice> {
    device: Arc<D>,
    kind: DescriptorHeapKind,
    num_descriptors: u32,
    descriptor_size: DeviceSize,
    current: OnlineHeap<D::Heap>,
    ring: FencedRingBuffer,
    pool: FencePool<OnlineHeap<D::Heap>>,
}

impl<D: DescriptorDevice> OnlineDescriptorHeap<D> {
    /// Creates the heap with room for `num_descriptors` descriptors.
    pub fn new(
        device: Arc<D>,
        kind: DescriptorHeapKind,
        num_descriptors: u32,
    ) -> Result<Self, AllocationError> {
        assert!(num_descriptors > 0);

        let descriptor_size = device.descriptor_size(kind);
        let (heap, base) = device.create_heap(kind, num_descriptors, true)?;

        Ok(OnlineDescriptorHeap {
            device,
            kind,
            num_descriptors,
            descriptor_size,
            current: OnlineHeap { heap, base },
            ring: FencedRingBuffer::new(num_descriptors),
            pool: FencePool::new(),
        })
    }

    /// Reserves `num_slots` contiguous slots for work on `current_fence`,
    /// rolling the heap over if the ring is exhausted.
    ///
    /// `num_slots` must be less than half the heap size. Returns the first
    /// reserved slot.
    pub fn reserve_slots(
        &mut self,
        num_slots: u32,
        current_fence: FenceValue,
        completed_fence: FenceValue,
    ) -> Result<u32, AllocationError> {
        debug_assert!(num_slots < self.num_descriptors / 2);

        match self.ring.allocate(num_slots, current_fence) {
            Ok(slot) => Ok(slot),
            Err(RingBufferError::OutOfCapacity | RingBufferError::LedgerExhausted) => {
                self.roll_over(current_fence, completed_fence)?;

                // The fresh ring can always satisfy a request below the
                // size precondition.
                self.ring
                    .allocate(num_slots, current_fence)
                    .map_err(|_| AllocationError::OutOfMemory)
            }
        }
    }

    /// Releases the slots of every fence value that has completed.
    pub fn retire_completed(&mut self, completed_fence: FenceValue) {
        self.ring.deallocate(completed_fence);
    }

    /// Parks the current heap in the pool and installs a recycled or new
    /// one with an empty ring.
    fn roll_over(
        &mut self,
        current_fence: FenceValue,
        completed_fence: FenceValue,
    ) -> Result<(), AllocationError> {
        let replacement = self.pool.retrieve(completed_fence, || {
            let (heap, base) = self.device.create_heap(self.kind, self.num_descriptors, true)?;
            Ok::<_, AllocationError>(OnlineHeap { heap, base })
        })?;

        let retired = std::mem::replace(&mut self.current, replacement);
        self.pool.return_to_pool(retired, current_fence);
        self.ring = FencedRingBuffer::new(self.num_descriptors);

        Ok(())
    }

    /// The address of `slot` in the current heap.
    pub fn slot_address(&self, slot: u32) -> DescriptorHandle {
        debug_assert!(slot < self.num_descriptors);
        self.current.base + DeviceSize::from(slot) * self.descriptor_size
    }

    /// The currently bound heap object.
    pub fn heap(&self) -> &D::Heap {
        &self.current.heap
    }

    /// The number of heaps parked in the pool.
    pub fn pooled_heaps(&self) -> usize {
        self.pool.len()
    }
}

impl<D: DescriptorDevice> fmt::Debug for OnlineDescriptorHeap<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnlineDescriptorHeap")
            .field("kind", &self.kind)
            .field("num_descriptors", &self.num_descriptors)
            .field("ring", &self.ring)
            .finish_non_exhaustive()
    }
}
