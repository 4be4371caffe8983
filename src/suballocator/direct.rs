// Copyright (c) 2024 The fenced developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{BlockKind, SuballocationBlock, Suballocator, SuballocatorError};
use crate::{AllocationError, DeviceSize};
use std::sync::Arc;

/// A suballocator that isn't: every block gets its own dedicated resource
/// and spans it entirely, at offset zero.
///
/// Used for allocations above the suballocation threshold, where the waste
/// of a buddy node would be worse than a dedicated heap, and for resources
/// that must start at the beginning of their heap. Deallocating a block
/// drops the last reference to its resource, which releases it.
#[derive(Debug, Default)]
pub struct DirectAllocator {
    outstanding_blocks: usize,
    outstanding_bytes: DeviceSize,
}

impl DirectAllocator {
    pub fn new() -> Self {
        DirectAllocator::default()
    }

    /// The number of blocks currently allocated.
    pub fn outstanding_blocks(&self) -> usize {
        self.outstanding_blocks
    }
}

impl<R> Suballocator<R> for DirectAllocator {
    fn allocate(
        &mut self,
        size: DeviceSize,
        create_resource: impl FnOnce(DeviceSize) -> Result<R, AllocationError>,
    ) -> Result<SuballocationBlock<R>, SuballocatorError> {
        let resource = Arc::new(create_resource(size)?);

        self.outstanding_blocks += 1;
        self.outstanding_bytes += size;

        Ok(SuballocationBlock::new(resource, 0, size, BlockKind::Direct))
    }

    fn deallocate(&mut self, block: SuballocationBlock<R>) {
        debug_assert_eq!(block.kind(), BlockKind::Direct);
        debug_assert!(self.outstanding_blocks > 0);

        self.outstanding_blocks -= 1;
        self.outstanding_bytes -= block.size();

        // Dropping the block releases the dedicated resource, unless the
        // caller still holds a reference for in-flight GPU work.
    }

    fn free_size(&self) -> DeviceSize {
        DeviceSize::MAX
    }
}
