// Copyright (c) 2024 The fenced developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Pools of objects that are recycled on specific fence values.
//!
//! A [`FencePool`] stores objects together with the fence value that was
//! current when they were returned. An object becomes eligible for reuse
//! once the GPU's completed fence has passed that value; until then,
//! retrieval falls back to creating a fresh object. Because fence values
//! only ever increase, insertion order and fence order coincide and the
//! eldest entry is always the first to become eligible.
//!
//! [`BoundedFencePool`] adds a maximum in-flight depth and blocks on a
//! caller-supplied fence wait instead of growing past it — the only source
//! of backpressure in this crate. [`MultiLevelPool`] buckets a pool per
//! size class and is safe to call from any thread.

use crate::{DeviceSize, FenceValue};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A pool of objects recycled on specific fence values.
///
/// The pool is designed for a single-threaded caller; wrap it in a
/// [`Mutex`] to share it. Entries are kept in insertion order, which is
/// also fence-value order.
#[derive(Debug)]
pub struct FencePool<R> {
    entries: VecDeque<PoolEntry<R>>,
}

#[derive(Debug)]
struct PoolEntry<R> {
    fence_value: FenceValue,
    resource: R,
}

impl<R> FencePool<R> {
    pub fn new() -> Self {
        FencePool {
            entries: VecDeque::new(),
        }
    }

    /// Returns `resource` to the pool, tagged with the given fence value.
    ///
    /// `fence_value` must not be smaller than the largest fence value
    /// already in the pool. This operation never fails observably: if the
    /// bookkeeping entry cannot be allocated, the resource is dropped
    /// instead, which releases the underlying object.
    pub fn return_to_pool(&mut self, resource: R, fence_value: FenceValue) {
        debug_assert!(self
            .entries
            .back()
            .map_or(true, |back| back.fence_value <= fence_value));

        if self.entries.try_reserve(1).is_err() {
            // Drop the resource rather than reporting the error; its
            // destructor releases the GPU object.
            return;
        }

        self.entries.push_back(PoolEntry {
            fence_value,
            resource,
        });
    }

    /// Retrieves the eldest eligible object, or creates a new one.
    ///
    /// The head of the pool is eligible if its fence value is less than or
    /// equal to `completed_fence`. If the pool is empty or the head is
    /// still in flight, `create` is invoked instead and its result returned
    /// as-is.
    pub fn retrieve<E>(
        &mut self,
        completed_fence: FenceValue,
        create: impl FnOnce() -> Result<R, E>,
    ) -> Result<R, E> {
        match self.entries.front() {
            Some(head) if head.fence_value <= completed_fence => {
                let entry = self.entries.pop_front().unwrap();
                Ok(entry.resource)
            }
            _ => create(),
        }
    }

    /// Drops the eldest entry if it has aged past `trim_threshold`.
    ///
    /// Removes at most one entry per call; callers are expected to pump
    /// this periodically (e.g. once per submission) so that destruction
    /// cost is amortized.
    pub fn trim(&mut self, trim_threshold: u64, completed_fence: FenceValue) {
        let Some(head) = self.entries.front() else {
            return;
        };

        if head.fence_value > completed_fence {
            return;
        }

        if completed_fence - head.fence_value >= trim_threshold {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<R> Default for FencePool<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`FencePool`] with a maximum number of objects in flight.
///
/// Retrieval never grows the pool past `max_in_flight_depth`: once the
/// limit is reached and the eldest entry is still in flight, the caller's
/// fence wait is invoked and the eldest entry is recycled after the wait
/// returns.
#[derive(Debug)]
pub struct BoundedFencePool<R> {
    pool: FencePool<R>,
    max_in_flight_depth: usize,
}

impl<R> BoundedFencePool<R> {
    pub fn new(max_in_flight_depth: usize) -> Self {
        BoundedFencePool {
            pool: FencePool::new(),
            max_in_flight_depth,
        }
    }

    /// Retrieves an object, blocking on `wait_for_fence` when the pool is
    /// at its in-flight limit.
    ///
    /// - If the pool is empty, `create` is invoked.
    /// - If the eldest entry is eligible, it is recycled.
    /// - If the eldest entry is in flight and the pool holds fewer than
    ///   `max_in_flight_depth` entries, `create` is invoked.
    /// - Otherwise `wait_for_fence` is called with the eldest entry's fence
    ///   value and must block until that value completes.
    ///
    /// The pool is re-checked after every wake-up rather than assuming the
    /// eldest entry is still there, so that several callers can share one
    /// pool behind a mutex.
    pub fn retrieve<E>(
        &mut self,
        completed_fence: FenceValue,
        mut wait_for_fence: impl FnMut(FenceValue) -> Result<(), E>,
        create: impl FnOnce() -> Result<R, E>,
    ) -> Result<R, E> {
        let mut completed_fence = completed_fence;

        loop {
            let Some(head) = self.pool.entries.front() else {
                return create();
            };

            if head.fence_value <= completed_fence {
                let entry = self.pool.entries.pop_front().unwrap();
                return Ok(entry.resource);
            }

            if self.pool.len() < self.max_in_flight_depth {
                return create();
            }

            let head_fence = head.fence_value;
            wait_for_fence(head_fence)?;
            completed_fence = completed_fence.max(head_fence);
        }
    }

    pub fn return_to_pool(&mut self, resource: R, fence_value: FenceValue) {
        self.pool.return_to_pool(resource, fence_value);
    }

    pub fn trim(&mut self, trim_threshold: u64, completed_fence: FenceValue) {
        self.pool.trim(trim_threshold, completed_fence);
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

/// A free-threaded pool bucketed by size class.
///
/// Bucket `i` holds objects of size `(i + 1) * size_multiple`; a request is
/// rounded up to its bucket size so that objects of similar sizes recycle
/// each other. The bucket vector grows on demand and never shrinks below
/// its high-water mark.
///
/// Unlike the single-level pools, this type locks internally: it is meant
/// to accept returns from background object destruction on any thread.
#[derive(Debug)]
pub struct MultiLevelPool<R> {
    pools: Mutex<Vec<FencePool<R>>>,
    size_multiple: DeviceSize,
    trim_threshold: u64,
}

impl<R> MultiLevelPool<R> {
    /// Creates a pool with the given bucket granularity.
    ///
    /// `size_multiple` must be positive.
    pub fn new(size_multiple: DeviceSize, trim_threshold: u64) -> Self {
        assert!(size_multiple > 0);

        MultiLevelPool {
            pools: Mutex::new(Vec::new()),
            size_multiple,
            trim_threshold,
        }
    }

    fn index_from_size(&self, size: DeviceSize) -> usize {
        if size == 0 {
            0
        } else {
            ((size - 1) / self.size_multiple) as usize
        }
    }

    /// The allocated size of objects in the bucket serving `size`.
    pub fn aligned_size(&self, size: DeviceSize) -> DeviceSize {
        (self.index_from_size(size) as DeviceSize + 1) * self.size_multiple
    }

    /// Returns an object of the given (unaligned) size to its bucket.
    pub fn return_to_pool(&self, size: DeviceSize, resource: R, fence_value: FenceValue) {
        let index = self.index_from_size(size);
        let mut pools = self.pools.lock();

        if index >= pools.len() {
            pools.resize_with(index + 1, FencePool::new);
        }

        pools[index].return_to_pool(resource, fence_value);
    }

    /// Retrieves an object whose size is at least `size`, rounded up to the
    /// bucket size. `create` receives the bucket size, not the requested
    /// one.
    pub fn retrieve<E>(
        &self,
        size: DeviceSize,
        completed_fence: FenceValue,
        create: impl FnOnce(DeviceSize) -> Result<R, E>,
    ) -> Result<R, E> {
        let index = self.index_from_size(size);
        let aligned_size = self.aligned_size(size);

        let mut pools = self.pools.lock();

        if index >= pools.len() {
            // The create call may be slow and doesn't touch shared state.
            drop(pools);
            return create(aligned_size);
        }

        // `retrieve` may itself call `create` with the lock held. This is
        // not optimized because once an application reaches steady state,
        // the pool no longer needs to grow.
        pools[index].retrieve(completed_fence, || create(aligned_size))
    }

    /// Pumps one trim round over every bucket.
    pub fn trim(&self, completed_fence: FenceValue) {
        let mut pools = self.pools.lock();

        for pool in pools.iter_mut() {
            pool.trim(self.trim_threshold, completed_fence);
        }
    }

    /// Total number of pooled entries across all buckets.
    pub fn len(&self) -> usize {
        self.pools.lock().iter().map(FencePool::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Barrier, thread};

    fn never<R>() -> Result<R, ()> {
        panic!("create must not be invoked");
    }

    #[test]
    fn recycles_in_fence_order() {
        let mut pool = FencePool::new();
        pool.return_to_pool("r1", 10);
        pool.return_to_pool("r2", 20);

        // Completed = 15: only the eldest entry is eligible.
        assert_eq!(pool.retrieve(15, never), Ok("r1"));
        assert_eq!(pool.retrieve(15, || Ok::<_, ()>("new")), Ok("new"));
        assert_eq!(pool.retrieve(25, never), Ok("r2"));
        assert!(pool.is_empty());
    }

    #[test]
    fn returns_entries_fifo() {
        let mut pool = FencePool::new();

        for fence in 1..=8u64 {
            pool.return_to_pool(fence, fence);
        }

        for fence in 1..=8u64 {
            assert_eq!(pool.retrieve(u64::MAX, never), Ok(fence));
        }
    }

    #[test]
    fn create_errors_surface() {
        let mut pool = FencePool::<()>::new();
        assert_eq!(pool.retrieve(0, || Err::<(), _>("oom")), Err("oom"));
    }

    #[test]
    fn trim_removes_one_entry_per_pump() {
        let mut pool = FencePool::new();
        pool.return_to_pool((), 1);
        pool.return_to_pool((), 2);
        pool.return_to_pool((), 3);

        pool.trim(10, 100);
        assert_eq!(pool.len(), 2);
        pool.trim(10, 100);
        pool.trim(10, 100);
        assert!(pool.is_empty());

        // Trimming an empty pool is a no-op.
        pool.trim(10, 100);
    }

    #[test]
    fn trim_respects_threshold_and_flight() {
        let mut pool = FencePool::new();
        pool.return_to_pool((), 50);

        // Not aged enough.
        pool.trim(100, 120);
        assert_eq!(pool.len(), 1);

        // Still in flight.
        pool.trim(0, 40);
        assert_eq!(pool.len(), 1);

        pool.trim(100, 150);
        assert!(pool.is_empty());
    }

    #[test]
    fn bounded_pool_blocks_at_depth_limit() {
        let mut pool = BoundedFencePool::new(1);
        pool.return_to_pool("r", 50);

        let mut waited_for = None;
        let retrieved = pool.retrieve(
            40,
            |fence| {
                waited_for = Some(fence);
                Ok::<_, ()>(())
            },
            never,
        );

        assert_eq!(waited_for, Some(50));
        assert_eq!(retrieved, Ok("r"));
    }

    #[test]
    fn bounded_pool_grows_below_depth_limit() {
        let mut pool = BoundedFencePool::new(2);
        pool.return_to_pool("in-flight", 50);

        let retrieved = pool.retrieve(
            40,
            |_| panic!("must not wait while below the depth limit"),
            || Ok::<_, ()>("new"),
        );

        assert_eq!(retrieved, Ok("new"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn bounded_pool_propagates_wait_failure() {
        let mut pool = BoundedFencePool::new(1);
        pool.return_to_pool((), 50);

        let retrieved = pool.retrieve(40, |_| Err("device lost"), || {
            panic!("create must not be invoked")
        });
        assert_eq!(retrieved, Err("device lost"));
        // The entry stays pooled for teardown to release.
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn multi_level_pool_buckets_by_size() {
        const KB64: DeviceSize = 64 * 1024;

        let pool = MultiLevelPool::new(KB64, 100);

        // 128 KiB lands in bucket 1; a 65 KiB request aligns to the same
        // bucket and recycles it.
        pool.return_to_pool(2 * KB64, "r", 10);
        assert_eq!(pool.aligned_size(KB64 + 1024), 2 * KB64);
        assert_eq!(pool.retrieve(KB64 + 1024, 10, |_| never()), Ok("r"));

        // An empty bucket creates at the aligned size.
        let created = pool.retrieve(KB64 + 1024, 10, |size| {
            assert_eq!(size, 2 * KB64);
            Ok::<_, ()>("new")
        });
        assert_eq!(created, Ok("new"));
    }

    #[test]
    fn multi_level_pool_zero_size_uses_first_bucket() {
        let pool = MultiLevelPool::<()>::new(256, 100);
        assert_eq!(pool.aligned_size(0), 256);
        assert_eq!(pool.aligned_size(1), 256);
        assert_eq!(pool.aligned_size(256), 256);
        assert_eq!(pool.aligned_size(257), 512);
    }

    #[test]
    fn multi_level_pool_trims_every_bucket() {
        let pool = MultiLevelPool::new(256, 10);
        pool.return_to_pool(100, (), 1);
        pool.return_to_pool(1000, (), 1);

        pool.trim(50);
        assert!(pool.is_empty());
    }

    #[test]
    fn multi_level_pool_is_free_threaded() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 100;

        let pool = MultiLevelPool::new(256, 100);
        let barrier = Barrier::new(THREADS);

        thread::scope(|scope| {
            for i in 0..THREADS {
                let (pool, barrier) = (&pool, &barrier);

                scope.spawn(move || {
                    barrier.wait();

                    for round in 0..ROUNDS {
                        let size = ((i * ROUNDS + round) % 4 + 1) as DeviceSize * 200;
                        let resource = pool
                            .retrieve(size, u64::MAX, |aligned| Ok::<_, ()>(aligned))
                            .unwrap();
                        // A single fence value keeps the per-bucket fence
                        // order trivially non-decreasing across threads.
                        pool.return_to_pool(size, resource, 1);
                    }
                });
            }
        });

        assert!(pool.len() <= THREADS * 4);
    }
}
