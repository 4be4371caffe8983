// Copyright (c) 2024 The fenced developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Suballocators divide large backing heaps into smaller blocks.
//!
//! Creating one GPU heap per resource is slow and wastes memory on
//! alignment, so transient resources are carved out of larger heaps
//! instead. Two backends exist:
//!
//! - [`BuddyAllocator`] — power-of-two splits within one large backing
//!   heap. Blocks of similar sizes recycle each other and freeing
//!   coalesces buddy nodes back together. Used for the common case.
//!
//! - [`DirectAllocator`] — one dedicated resource per block, at offset
//!   zero. Used above a size threshold, and for resources that must not be
//!   offset within a heap.
//!
//! [`ConditionalAllocator`] picks between them per allocation. The choice
//! is recorded in the returned [`SuballocationBlock`], so deallocation
//! routes back to the right backend without the caller's involvement.
//!
//! Suballocators only manage ranges; the backing resources themselves are
//! created through a caller-supplied closure and released by dropping the
//! last [`SuballocationBlock`] (or the allocator) that references them.

pub use self::{buddy::BuddyAllocator, direct::DirectAllocator};
use crate::{AllocationError, DeviceSize};
use parking_lot::Mutex;
use std::{
    error::Error,
    fmt::{self, Display},
    sync::Arc,
};

mod array_vec;
mod buddy;
mod direct;

/// A [`ConditionalAllocator`] shared between its owner and the retired
/// blocks that will be returned to it from the deletion queue.
///
/// The mutex makes the allocator free-threaded, so blocks can be released
/// from background object destruction.
pub type SharedAllocator<R> = Arc<Mutex<ConditionalAllocator<R>>>;

/// Types that divide a region of GPU memory into blocks.
///
/// The `create_resource` closure passed to [`allocate`] is invoked when the
/// allocator needs a new backing object: once for the whole region in the
/// buddy case, once per block in the direct case. Blocks keep their backing
/// alive through reference counting, so an allocator may be dropped before
/// the blocks it handed out.
///
/// [`allocate`]: Self::allocate
pub trait Suballocator<R> {
    /// Allocates a block of `size` bytes.
    fn allocate(
        &mut self,
        size: DeviceSize,
        create_resource: impl FnOnce(DeviceSize) -> Result<R, AllocationError>,
    ) -> Result<SuballocationBlock<R>, SuballocatorError>;

    /// Returns a block to the allocator.
    ///
    /// The block must have been allocated by `self`; this is enforced only
    /// by debug assertions.
    fn deallocate(&mut self, block: SuballocationBlock<R>);

    /// The total amount of free space left in the region, or
    /// [`DeviceSize::MAX`] for allocators without a fixed region.
    fn free_size(&self) -> DeviceSize;
}

/// A block handed out by a [`Suballocator`].
///
/// The block shares ownership of its backing resource and is move-only:
/// giving it back to [`Suballocator::deallocate`] consumes it, so a block
/// cannot be freed twice.
#[derive(Debug)]
pub struct SuballocationBlock<R> {
    resource: Arc<R>,
    offset: DeviceSize,
    size: DeviceSize,
    kind: BlockKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockKind {
    /// A dedicated resource; the block spans it entirely.
    Direct,
    /// A buddy node of `min_node_size << order` bytes.
    Buddy { order: u32 },
}

impl<R> SuballocationBlock<R> {
    pub(crate) fn new(resource: Arc<R>, offset: DeviceSize, size: DeviceSize, kind: BlockKind) -> Self {
        SuballocationBlock {
            resource,
            offset,
            size,
            kind,
        }
    }

    /// The backing resource this block lives in.
    #[inline]
    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// The byte offset of the block within its backing resource. Always
    /// zero for direct blocks.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// The requested size of the block.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Whether the block owns a dedicated resource.
    #[inline]
    pub fn is_direct(&self) -> bool {
        self.kind == BlockKind::Direct
    }

    pub(crate) fn kind(&self) -> BlockKind {
        self.kind
    }

    pub(crate) fn into_parts(self) -> (Arc<R>, DeviceSize, BlockKind) {
        (self.resource, self.offset, self.kind)
    }
}

/// Error that can be returned when allocating a [`SuballocationBlock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuballocatorError {
    /// Creating a backing or dedicated resource failed.
    Resource(AllocationError),

    /// There is no more space available in the region.
    OutOfRegionMemory,

    /// The region has enough free space to satisfy the request but is too
    /// fragmented.
    FragmentedRegion,
}

impl Error for SuballocatorError {}

impl Display for SuballocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(err) => write!(f, "creating a backing resource failed: {}", err),
            Self::OutOfRegionMemory => f.write_str("out of region memory"),
            Self::FragmentedRegion => f.write_str("the region is too fragmented"),
        }
    }
}

impl From<AllocationError> for SuballocatorError {
    fn from(err: AllocationError) -> Self {
        Self::Resource(err)
    }
}

impl From<SuballocatorError> for AllocationError {
    fn from(err: SuballocatorError) -> Self {
        match err {
            SuballocatorError::Resource(err) => err,
            // Both are recoverable by freeing GPU memory, which is what the
            // out-of-memory fallback path does.
            SuballocatorError::OutOfRegionMemory | SuballocatorError::FragmentedRegion => {
                AllocationError::OutOfMemory
            }
        }
    }
}

/// An allocator that picks a backend per allocation.
///
/// Allocations larger than `threshold`, and allocations that must not be
/// offset within a heap, get a dedicated resource; everything else is
/// suballocated from the buddy region.
#[derive(Debug)]
pub struct ConditionalAllocator<R> {
    direct: DirectAllocator,
    buddy: BuddyAllocator<R>,
    threshold: DeviceSize,
}

impl<R> ConditionalAllocator<R> {
    /// The default size above which an allocation gets its own resource.
    pub const DEFAULT_THRESHOLD: DeviceSize = 1024 * 1024;

    /// Creates an allocator with a buddy region of `region_size` bytes.
    ///
    /// `region_size` must be a power of two; `threshold` must not exceed
    /// it. The backing heap for the region is created lazily on the first
    /// buddy allocation.
    pub fn new(region_size: DeviceSize, threshold: DeviceSize) -> Self {
        assert!(threshold <= region_size);

        ConditionalAllocator {
            direct: DirectAllocator::new(),
            buddy: BuddyAllocator::new(region_size),
            threshold,
        }
    }

    fn needs_own_resource(&self, size: DeviceSize, cannot_be_offset: bool) -> bool {
        size > self.threshold || cannot_be_offset
    }

    /// Allocates a block, routing by size and the `cannot_be_offset` flag.
    pub fn allocate(
        &mut self,
        size: DeviceSize,
        cannot_be_offset: bool,
        create_resource: impl FnOnce(DeviceSize) -> Result<R, AllocationError>,
    ) -> Result<SuballocationBlock<R>, SuballocatorError> {
        if self.needs_own_resource(size, cannot_be_offset) {
            self.direct.allocate(size, create_resource)
        } else {
            self.buddy.allocate(size, create_resource)
        }
    }

    /// Returns a block to the backend that allocated it.
    pub fn deallocate(&mut self, block: SuballocationBlock<R>) {
        match block.kind() {
            BlockKind::Direct => self.direct.deallocate(block),
            BlockKind::Buddy { .. } => self.buddy.deallocate(block),
        }
    }

    /// Free space left in the buddy region.
    pub fn free_size(&self) -> DeviceSize {
        self.buddy.free_size()
    }
}
