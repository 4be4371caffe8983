// Copyright (c) 2024 The fenced developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    array_vec::ArrayVec, BlockKind, SuballocationBlock, Suballocator, SuballocatorError,
};
use crate::{AllocationError, DeviceSize};
use std::{cmp, sync::Arc};

/// Arbitrary maximum number of orders, used to avoid a two-dimensional
/// `Vec`. Together with the minimum node size this is enough for a 32 GiB
/// region.
const MAX_ORDERS: usize = 20;

/// A suballocator whose structure forms a binary tree of power-of-two-sized
/// blocks within one large backing heap.
///
/// All allocation sizes are rounded up to the next power of two, with a
/// minimum node size matching the heap placement alignment of explicit
/// APIs. This bounds external fragmentation at the expense of internal
/// fragmentation for awkward sizes, which suits transient upload and
/// readback traffic where sizes cluster around a few buckets.
///
/// # Algorithm
///
/// Each possible node size has an *order*: the minimum node size is order
/// 0, and the whole region is the highest order. Allocating searches the
/// per-order free lists from the requested order upward, then splits nodes
/// back down; the two halves of a split are *buddies*. Freeing walks the
/// orders upward, coalescing a node with its buddy whenever the buddy is
/// also free.
///
/// The backing heap is created lazily by the first allocation, through the
/// closure the caller passes in, and is shared with every block handed out.
#[derive(Debug)]
pub struct BuddyAllocator<R> {
    backing: Option<Arc<R>>,
    region_size: DeviceSize,
    // Total memory remaining in the region, internal fragmentation
    // excluded.
    free_size: DeviceSize,
    // Every order has its own free-list, sorted by offset so that the
    // lowest-offset fit is chosen first.
    free_list: ArrayVec<Vec<DeviceSize>, MAX_ORDERS>,
}

impl<R> BuddyAllocator<R> {
    /// The smallest block the allocator will hand out, matching the 64 KiB
    /// placement alignment of explicit-API heaps.
    pub const MIN_NODE_SIZE: DeviceSize = 64 * 1024;

    /// Creates an allocator for a region of `region_size` bytes.
    ///
    /// # Panics
    ///
    /// - Panics if `region_size` is not a power of two.
    /// - Panics if `region_size` is not in the range
    ///   \[[`MIN_NODE_SIZE`], 32 GiB\].
    ///
    /// [`MIN_NODE_SIZE`]: Self::MIN_NODE_SIZE
    pub fn new(region_size: DeviceSize) -> Self {
        const EMPTY_FREE_LIST: Vec<DeviceSize> = Vec::new();

        assert!(region_size.is_power_of_two());
        assert!(region_size >= Self::MIN_NODE_SIZE);

        let max_order = (region_size / Self::MIN_NODE_SIZE).trailing_zeros() as usize;

        assert!(max_order < MAX_ORDERS);

        let mut free_list = ArrayVec::new(max_order + 1, [EMPTY_FREE_LIST; MAX_ORDERS]);
        // The root node has the lowest offset and highest order, so it's
        // the whole region.
        free_list[max_order].push(0);

        BuddyAllocator {
            backing: None,
            region_size,
            free_size: region_size,
            free_list,
        }
    }

    /// The size of the region this allocator manages.
    pub fn region_size(&self) -> DeviceSize {
        self.region_size
    }

    fn ensure_backing(
        &mut self,
        create_resource: impl FnOnce(DeviceSize) -> Result<R, AllocationError>,
    ) -> Result<Arc<R>, SuballocatorError> {
        if let Some(backing) = &self.backing {
            return Ok(backing.clone());
        }

        let backing = Arc::new(create_resource(self.region_size)?);
        self.backing = Some(backing.clone());

        Ok(backing)
    }
}

impl<R> Suballocator<R> for BuddyAllocator<R> {
    fn allocate(
        &mut self,
        size: DeviceSize,
        create_resource: impl FnOnce(DeviceSize) -> Result<R, AllocationError>,
    ) -> Result<SuballocationBlock<R>, SuballocatorError> {
        /// Returns the largest power of two smaller or equal to the input,
        /// or zero if the input is zero.
        fn prev_power_of_two(val: DeviceSize) -> DeviceSize {
            if val == 0 {
                0
            } else {
                (DeviceSize::MAX / 2 + 1) >> val.leading_zeros()
            }
        }

        let node_size = cmp::max(size, Self::MIN_NODE_SIZE).next_power_of_two();

        if node_size > self.region_size {
            return Err(SuballocatorError::OutOfRegionMemory);
        }

        let min_order = (node_size / Self::MIN_NODE_SIZE).trailing_zeros() as usize;

        // Start searching at the lowest possible order going up; the free
        // lists are sorted, so the front is the lowest-offset fit.
        let order = (min_order..self.free_list.len())
            .find(|&order| !self.free_list[order].is_empty());

        let Some(order) = order else {
            return if prev_power_of_two(self.free_size) >= size.max(1) {
                // A node large enough could be formed if the region wasn't
                // so fragmented.
                Err(SuballocatorError::FragmentedRegion)
            } else {
                Err(SuballocatorError::OutOfRegionMemory)
            };
        };

        let backing = self.ensure_backing(create_resource)?;
        let offset = self.free_list[order].remove(0);

        // Go in the opposite direction, splitting nodes from higher orders.
        // The lowest order doesn't need any splitting.
        for split_order in (min_order..order).rev() {
            let split_size = Self::MIN_NODE_SIZE << split_order;
            let right_child = offset + split_size;

            // Insert the right child in sorted order; the left child is
            // split further (or allocated) in the next loop turn.
            let free_list = &mut self.free_list[split_order];
            let (Ok(position) | Err(position)) = free_list.binary_search(&right_child);
            free_list.insert(position, right_child);
        }

        self.free_size -= node_size;

        Ok(SuballocationBlock::new(
            backing,
            offset,
            size,
            BlockKind::Buddy {
                order: min_order as u32,
            },
        ))
    }

    fn deallocate(&mut self, block: SuballocationBlock<R>) {
        let (resource, mut offset, kind) = block.into_parts();

        debug_assert!(self
            .backing
            .as_ref()
            .map_or(false, |backing| Arc::ptr_eq(backing, &resource)));

        let BlockKind::Buddy { order } = kind else {
            debug_assert!(false, "the block was not allocated by a buddy allocator");
            return;
        };

        let min_order = order as usize;

        debug_assert!(!self.free_list[min_order].contains(&offset));

        // Try to coalesce nodes while incrementing the order.
        for order in min_order..self.free_list.len() {
            let node_size = Self::MIN_NODE_SIZE << order;
            let buddy_offset = offset ^ node_size;

            match self.free_list[order].binary_search(&buddy_offset) {
                // If the buddy is in the free list, coalesce.
                Ok(position) => {
                    self.free_list[order].remove(position);
                    offset = cmp::min(offset, buddy_offset);
                }
                // Otherwise free the node.
                Err(_) => {
                    let free_list = &mut self.free_list[order];
                    let (Ok(position) | Err(position)) = free_list.binary_search(&offset);
                    free_list.insert(position, offset);

                    self.free_size += Self::MIN_NODE_SIZE << min_order;

                    break;
                }
            }
        }
    }

    fn free_size(&self) -> DeviceSize {
        self.free_size
    }
}
