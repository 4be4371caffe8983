// Copyright (c) 2024 The fenced developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The submission engine: fence tracking and the glue around it.
//!
//! [`SubmissionEngine`] owns one monotonic fence per [`CommandListType`],
//! advanced on every submission through the embedder's [`QueueBackend`]s,
//! and the recycling machinery keyed on those fences: size-bucketed upload
//! and readback buffer pools, one suballocator per heap type, and the
//! deferred deletion queue.
//!
//! After every submission the engine pumps one round of trimming — a pool
//! entry per bucket and every ready deletion — so that steady submission
//! keeps memory bounded without a dedicated cleanup thread. Device loss is
//! sticky: once a backend reports it, waits fail and acquisitions
//! short-circuit, while release paths keep working so teardown can
//! complete.

use crate::{
    deletion::{DeferredDeletionQueue, DeferredWait, ResidencyToken},
    pool::MultiLevelPool,
    suballocator::{ConditionalAllocator, SharedAllocator, SuballocationBlock},
    AllocationError, CommandListType, DeviceSize, FenceValue, FenceValues,
};
use parking_lot::Mutex;
use std::{
    error::Error,
    fmt::{self, Display},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

/// Error returned when the device stopped executing commands.
///
/// Propagated out of fence waits; all later acquisitions fail with
/// [`AllocationError::DeviceLost`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLost;

impl Error for DeviceLost {}

impl Display for DeviceLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the device was lost")
    }
}

impl From<DeviceLost> for AllocationError {
    fn from(_: DeviceLost) -> Self {
        AllocationError::DeviceLost
    }
}

/// The embedder's queue for one command-list type.
///
/// The engine never records commands itself; it drives submission and
/// fence queries through this trait.
pub trait QueueBackend {
    /// Closes and submits the pending command list, then signals `value`
    /// on the queue's fence.
    fn submit_and_signal(&self, value: FenceValue) -> Result<(), DeviceLost>;

    /// Polls the largest fence value the GPU has completed.
    fn completed_value(&self) -> FenceValue;

    /// Blocks until the completed value reaches `value`.
    fn wait_for_value(&self, value: FenceValue) -> Result<(), DeviceLost>;
}

/// The kind of CPU-accessible heap a transient buffer lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum AllocatorHeapType {
    Upload = 0,
    Readback = 1,
}

impl AllocatorHeapType {
    pub const COUNT: usize = 2;

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Callbacks into the embedding layer.
#[derive(Default)]
pub struct EngineCallbacks {
    /// Invoked after every successful submission, once the engine's own
    /// trim pumping has run.
    pub post_submit: Option<Box<dyn Fn() + Send + Sync>>,
}

impl fmt::Debug for EngineCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCallbacks").finish_non_exhaustive()
    }
}

/// Parameters to create a new [`SubmissionEngine`].
#[derive(Clone, Debug)]
pub struct SubmissionEngineCreateInfo {
    /// Bucket granularity of the upload and readback buffer pools.
    ///
    /// The default value is 64 KiB, the buffer placement alignment of
    /// explicit APIs.
    pub buffer_pool_size_multiple: DeviceSize,

    /// How many fence values behind the completed fence a pooled buffer
    /// may fall before trimming drops it.
    ///
    /// The default value is `100`.
    pub buffer_pool_trim_threshold: u64,

    /// The size of each heap-type suballocator's buddy region.
    ///
    /// The default value is 32 MiB.
    pub suballocator_region_size: DeviceSize,

    /// Allocations above this size get a dedicated resource instead of a
    /// buddy block.
    ///
    /// The default value is [`ConditionalAllocator::DEFAULT_THRESHOLD`].
    pub suballocation_threshold: DeviceSize,
}

impl Default for SubmissionEngineCreateInfo {
    fn default() -> Self {
        SubmissionEngineCreateInfo {
            buffer_pool_size_multiple: 64 * 1024,
            buffer_pool_trim_threshold: 100,
            suballocator_region_size: 32 * 1024 * 1024,
            suballocation_threshold: ConditionalAllocator::<()>::DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Debug)]
struct QueueState<B> {
    backend: B,
    // Last value handed out by `submit`.
    submitted: AtomicU64,
    // Monotonic cache of the backend's completed value.
    completed: AtomicU64,
}

/// Owns the per-queue fences and the fence-keyed recycling machinery.
///
/// `B` is the embedder's queue backend and `R` its owning GPU resource
/// handle; dropping an `R` releases the underlying object.
#[derive(Debug)]
pub struct SubmissionEngine<B: QueueBackend, R> {
    queues: [QueueState<B>; CommandListType::COUNT],
    device_lost: AtomicBool,
    callbacks: EngineCallbacks,
    buffer_pools: [MultiLevelPool<R>; AllocatorHeapType::COUNT],
    suballocators: [SharedAllocator<R>; AllocatorHeapType::COUNT],
    // Drained in `drop` before anything else goes away: retired entries
    // call back into the suballocators and the embedder's residency
    // tracking.
    deletion_queue: Mutex<DeferredDeletionQueue<R>>,
}

impl<B: QueueBackend, R> SubmissionEngine<B, R> {
    /// Creates an engine over one backend per command-list type, in
    /// [`CommandListType::ALL`] order.
    pub fn new(
        backends: [B; CommandListType::COUNT],
        callbacks: EngineCallbacks,
        create_info: SubmissionEngineCreateInfo,
    ) -> Self {
        let queues = backends.map(|backend| QueueState {
            backend,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        });

        let buffer_pools = std::array::from_fn(|_| {
            MultiLevelPool::new(
                create_info.buffer_pool_size_multiple,
                create_info.buffer_pool_trim_threshold,
            )
        });

        let suballocators = std::array::from_fn(|_| {
            Arc::new(Mutex::new(ConditionalAllocator::new(
                create_info.suballocator_region_size,
                create_info.suballocation_threshold,
            )))
        });

        SubmissionEngine {
            queues,
            device_lost: AtomicBool::new(false),
            callbacks,
            buffer_pools,
            suballocators,
            deletion_queue: Mutex::new(DeferredDeletionQueue::new()),
        }
    }

    /// The last fence value submitted on the given queue.
    pub fn submitted_fence(&self, command_list_type: CommandListType) -> FenceValue {
        self.queues[command_list_type.index()]
            .submitted
            .load(Ordering::Relaxed)
    }

    /// The largest fence value the given queue has completed.
    ///
    /// Polls the backend and keeps a monotonic cache, so a backend whose
    /// reads are racy can never make the value go backwards.
    pub fn completed_fence(&self, command_list_type: CommandListType) -> FenceValue {
        let queue = &self.queues[command_list_type.index()];
        let polled = queue.backend.completed_value();

        queue.completed.fetch_max(polled, Ordering::Relaxed).max(polled)
    }

    /// Whether a backend has reported device loss.
    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Relaxed)
    }

    /// Blocks until `value` completes on the given queue.
    pub fn wait_for_fence(
        &self,
        command_list_type: CommandListType,
        value: FenceValue,
    ) -> Result<(), DeviceLost> {
        if self.is_device_lost() {
            return Err(DeviceLost);
        }

        if self.completed_fence(command_list_type) >= value {
            return Ok(());
        }

        let queue = &self.queues[command_list_type.index()];

        match queue.backend.wait_for_value(value) {
            Ok(()) => {
                queue.completed.fetch_max(value, Ordering::Relaxed);
                Ok(())
            }
            Err(DeviceLost) => {
                self.device_lost.store(true, Ordering::Relaxed);
                Err(DeviceLost)
            }
        }
    }

    /// Submits the pending work on the given queue and returns the fence
    /// value that will signal its completion.
    ///
    /// On success, one round of trimming is pumped and the embedder's
    /// post-submit callback is invoked.
    pub fn submit(&self, command_list_type: CommandListType) -> Result<FenceValue, DeviceLost> {
        if self.is_device_lost() {
            return Err(DeviceLost);
        }

        let queue = &self.queues[command_list_type.index()];
        let value = queue.submitted.fetch_add(1, Ordering::Relaxed) + 1;

        if let Err(DeviceLost) = queue.backend.submit_and_signal(value) {
            self.device_lost.store(true, Ordering::Relaxed);
            return Err(DeviceLost);
        }

        self.post_submit();

        Ok(value)
    }

    fn post_submit(&self) {
        self.trim_resource_pools();
        self.trim_deleted_objects();

        if let Some(post_submit) = &self.callbacks.post_submit {
            post_submit();
        }
    }

    /// Acquires a transient buffer of at least `size` bytes from the pool
    /// for the given heap type, eligible against `command_list_type`'s
    /// completed fence.
    pub fn acquire_buffer(
        &self,
        heap_type: AllocatorHeapType,
        size: DeviceSize,
        command_list_type: CommandListType,
        create: impl FnOnce(DeviceSize) -> Result<R, AllocationError>,
    ) -> Result<R, AllocationError> {
        if self.is_device_lost() {
            return Err(AllocationError::DeviceLost);
        }

        let completed = self.completed_fence(command_list_type);
        self.buffer_pools[heap_type.index()].retrieve(size, completed, create)
    }

    /// Returns a transient buffer to its pool, tagged with the fence value
    /// of the work that last used it.
    ///
    /// Fence values passed here must be non-decreasing per pool bucket;
    /// mixing queues is allowed only if the caller preserves that order.
    pub fn return_buffer(
        &self,
        heap_type: AllocatorHeapType,
        size: DeviceSize,
        resource: R,
        fence_value: FenceValue,
    ) {
        self.buffer_pools[heap_type.index()].return_to_pool(size, resource, fence_value);
    }

    /// Acquires a suballocated block for the given heap type.
    ///
    /// Wrap in [`allocate_with_fallback`] to retry after reclaiming
    /// retired memory.
    ///
    /// [`allocate_with_fallback`]: Self::allocate_with_fallback
    pub fn acquire_suballocation(
        &self,
        heap_type: AllocatorHeapType,
        size: DeviceSize,
        cannot_be_offset: bool,
        create: impl FnOnce(DeviceSize) -> Result<R, AllocationError>,
    ) -> Result<SuballocationBlock<R>, AllocationError> {
        if self.is_device_lost() {
            return Err(AllocationError::DeviceLost);
        }

        self.suballocators[heap_type.index()]
            .lock()
            .allocate(size, cannot_be_offset, create)
            .map_err(AllocationError::from)
    }

    /// Releases a suballocated block once the fences it was last recorded
    /// against have completed.
    ///
    /// A block that was never submitted (all values zero) is released
    /// immediately.
    pub fn release_suballocation(
        &self,
        heap_type: AllocatorHeapType,
        block: SuballocationBlock<R>,
        last_fence_values: FenceValues,
    ) {
        let completed = self.completed_snapshot();

        self.deletion_queue.lock().retire_suballocation(
            block,
            self.suballocators[heap_type.index()].clone(),
            last_fence_values,
            &completed,
        );
    }

    /// Retires a whole resource, to be destroyed when its fences complete
    /// and its deferred waits are satisfied.
    pub fn defer_destroy(
        &self,
        resource: R,
        residency: Option<ResidencyToken>,
        last_fence_values: FenceValues,
        completion_required: bool,
        deferred_waits: impl IntoIterator<Item = DeferredWait>,
    ) {
        self.deletion_queue.lock().retire_resource(
            resource,
            residency,
            last_fence_values,
            completion_required,
            deferred_waits,
        );
    }

    /// Destroys every retired object whose fences have completed.
    ///
    /// Returns true while the queue still holds entries.
    pub fn trim_deleted_objects(&self) -> bool {
        let completed = self.completed_snapshot();
        self.deletion_queue.lock().trim(&completed, false)
    }

    /// Pumps one trim round over the buffer pools.
    ///
    /// Pool entries may be tagged with any queue's fence, so trimming uses
    /// the smallest completed value across queues; this only ever errs
    /// toward keeping an entry longer.
    pub fn trim_resource_pools(&self) {
        let completed = self.completed_snapshot();
        let floor = completed.iter().copied().min().unwrap_or(0);

        for pool in &self.buffer_pools {
            pool.trim(floor);
        }
    }

    /// Runs `allocate`, reclaiming retired memory and retrying while it
    /// fails with [`AllocationError::OutOfMemory`].
    pub fn allocate_with_fallback<T>(
        &self,
        mut allocate: impl FnMut() -> Result<T, AllocationError>,
    ) -> Result<T, AllocationError> {
        loop {
            match allocate() {
                Ok(value) => return Ok(value),
                Err(AllocationError::OutOfMemory) => {
                    if !self.resource_allocation_fallback() {
                        return Err(AllocationError::OutOfMemory);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Tries to make memory reclaimable. Returns true if any retired
    /// object was destroyed.
    fn resource_allocation_fallback(&self) -> bool {
        let completed = self.completed_snapshot();

        let mut queue = self.deletion_queue.lock();
        let len_before = queue.len();
        queue.trim(&completed, false);

        if queue.len() < len_before {
            return true;
        }

        // Nothing was ready; wait for the fences that unblock the next
        // deletion. Suballocations come first: releasing them makes their
        // parent heaps reusable.
        let targets = queue
            .fence_values_for_suballocation_deletion()
            .or_else(|| queue.fence_values_for_object_deletion());

        // Don't hold the queue lock across a fence wait.
        drop(queue);

        let Some(targets) = targets else {
            return false;
        };

        for command_list_type in CommandListType::ALL {
            let value = targets[command_list_type.index()];

            if value > 0 && self.wait_for_fence(command_list_type, value).is_err() {
                return false;
            }
        }

        let completed = self.completed_snapshot();
        let mut queue = self.deletion_queue.lock();
        let len_before = queue.len();
        queue.trim(&completed, false);

        queue.len() < len_before
    }

    /// A snapshot of every queue's completed fence. After device loss the
    /// values saturate: nothing further will ever complete, so everything
    /// fence-gated is considered reached.
    fn completed_snapshot(&self) -> FenceValues {
        if self.is_device_lost() {
            return [FenceValue::MAX; CommandListType::COUNT];
        }

        let mut completed = [0; CommandListType::COUNT];

        for command_list_type in CommandListType::ALL {
            completed[command_list_type.index()] = self.completed_fence(command_list_type);
        }

        completed
    }
}

impl<B: QueueBackend, R> Drop for SubmissionEngine<B, R> {
    fn drop(&mut self) {
        // Wait for outstanding work, then drain the deletion queue while
        // the suballocators and the embedder's collaborators are still
        // alive. Entries whose completion is required stay gated on their
        // fences unless the device is lost.
        let mut completed = [0; CommandListType::COUNT];

        for command_list_type in CommandListType::ALL {
            let queue = &self.queues[command_list_type.index()];
            let submitted = queue.submitted.load(Ordering::Relaxed);

            completed[command_list_type.index()] =
                if submitted == 0 || queue.backend.wait_for_value(submitted).is_ok() {
                    submitted
                } else {
                    // Lost device: no fence will ever signal.
                    FenceValue::MAX
                };
        }

        self.deletion_queue.get_mut().trim(&completed, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deletion::single_fence;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct MockBackend {
        completed: AtomicU64,
        submissions: AtomicUsize,
        lost: AtomicBool,
    }

    impl MockBackend {
        fn set_completed(&self, value: FenceValue) {
            self.completed.store(value, Ordering::Relaxed);
        }

        fn make_lost(&self) {
            self.lost.store(true, Ordering::Relaxed);
        }
    }

    impl QueueBackend for &MockBackend {
        fn submit_and_signal(&self, _value: FenceValue) -> Result<(), DeviceLost> {
            if self.lost.load(Ordering::Relaxed) {
                return Err(DeviceLost);
            }

            self.submissions.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn completed_value(&self) -> FenceValue {
            self.completed.load(Ordering::Relaxed)
        }

        fn wait_for_value(&self, value: FenceValue) -> Result<(), DeviceLost> {
            if self.lost.load(Ordering::Relaxed) {
                return Err(DeviceLost);
            }

            // Pretend the GPU caught up.
            self.completed.fetch_max(value, Ordering::Relaxed);
            Ok(())
        }
    }

    fn engine<'a>(
        backends: &'a [MockBackend; 3],
        callbacks: EngineCallbacks,
        create_info: SubmissionEngineCreateInfo,
    ) -> SubmissionEngine<&'a MockBackend, u64> {
        let [graphics, compute, copy] = backends;
        SubmissionEngine::new([graphics, compute, copy], callbacks, create_info)
    }

    fn small_create_info() -> SubmissionEngineCreateInfo {
        SubmissionEngineCreateInfo {
            buffer_pool_size_multiple: 1024,
            buffer_pool_trim_threshold: 2,
            suballocator_region_size: 2 * 64 * 1024,
            suballocation_threshold: 64 * 1024,
        }
    }

    #[test]
    fn submission_advances_the_fence() {
        let backends = <[MockBackend; 3]>::default();
        let engine = engine(&backends, EngineCallbacks::default(), Default::default());

        assert_eq!(engine.submit(CommandListType::Graphics), Ok(1));
        assert_eq!(engine.submit(CommandListType::Graphics), Ok(2));
        assert_eq!(engine.submit(CommandListType::Copy), Ok(1));

        assert_eq!(engine.submitted_fence(CommandListType::Graphics), 2);
        assert_eq!(engine.completed_fence(CommandListType::Graphics), 0);
        assert_eq!(backends[0].submissions.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn post_submit_callback_observes_every_submission() {
        let backends = <[MockBackend; 3]>::default();
        let submits = Arc::new(AtomicUsize::new(0));
        let counter = submits.clone();

        let callbacks = EngineCallbacks {
            post_submit: Some(Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })),
        };

        let engine = engine(&backends, callbacks, Default::default());
        engine.submit(CommandListType::Compute).unwrap();
        engine.submit(CommandListType::Compute).unwrap();

        assert_eq!(submits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn completed_fence_is_monotonic() {
        let backends = <[MockBackend; 3]>::default();
        let engine = engine(&backends, EngineCallbacks::default(), Default::default());

        backends[1].set_completed(5);
        assert_eq!(engine.completed_fence(CommandListType::Compute), 5);

        // A racy backend read going backwards must not be visible.
        backends[1].set_completed(3);
        assert_eq!(engine.completed_fence(CommandListType::Compute), 5);
    }

    #[test]
    fn device_loss_is_sticky() {
        let backends = <[MockBackend; 3]>::default();
        let engine = engine(&backends, EngineCallbacks::default(), Default::default());

        backends[2].make_lost();
        assert_eq!(
            engine.wait_for_fence(CommandListType::Copy, 1),
            Err(DeviceLost),
        );

        // Acquisitions on every queue now short-circuit.
        let result = engine.acquire_buffer(
            AllocatorHeapType::Upload,
            100,
            CommandListType::Graphics,
            |_| panic!("must not create after device loss"),
        );
        assert_eq!(result.unwrap_err(), AllocationError::DeviceLost);
        assert_eq!(engine.submit(CommandListType::Graphics), Err(DeviceLost));
    }

    #[test]
    fn buffers_recycle_through_the_pool() {
        let backends = <[MockBackend; 3]>::default();
        let engine = engine(&backends, EngineCallbacks::default(), small_create_info());

        let buffer = engine
            .acquire_buffer(AllocatorHeapType::Upload, 100, CommandListType::Copy, |size| {
                Ok(size)
            })
            .unwrap();
        assert_eq!(buffer, 1024);

        engine.return_buffer(AllocatorHeapType::Upload, 100, buffer, 1);

        // Still in flight: a new buffer is created.
        let fresh = engine
            .acquire_buffer(AllocatorHeapType::Upload, 100, CommandListType::Copy, |size| {
                Ok(size + 1)
            })
            .unwrap();
        assert_eq!(fresh, 1025);

        backends[2].set_completed(1);
        let recycled = engine
            .acquire_buffer(AllocatorHeapType::Upload, 100, CommandListType::Copy, |_| {
                panic!("the pooled buffer must be recycled")
            })
            .unwrap();
        assert_eq!(recycled, 1024);
    }

    #[test]
    fn completed_suballocations_release_immediately() {
        let backends = <[MockBackend; 3]>::default();
        let engine = engine(&backends, EngineCallbacks::default(), small_create_info());

        let block = engine
            .acquire_suballocation(AllocatorHeapType::Upload, 1000, false, |size| Ok(size))
            .unwrap();

        backends[0].set_completed(3);
        engine.release_suballocation(
            AllocatorHeapType::Upload,
            block,
            single_fence(CommandListType::Graphics, 3),
        );

        assert!(!engine.trim_deleted_objects());
    }

    #[test]
    fn fallback_reclaims_retired_memory() {
        let backends = <[MockBackend; 3]>::default();
        let engine = engine(&backends, EngineCallbacks::default(), small_create_info());

        // Two 64 KiB nodes fill the whole buddy region.
        let first = engine
            .acquire_suballocation(AllocatorHeapType::Upload, 64 * 1024, false, |size| Ok(size))
            .unwrap();
        let _second = engine
            .acquire_suballocation(AllocatorHeapType::Upload, 64 * 1024, false, |size| Ok(size))
            .unwrap();

        // Retire the first block against an unfinished copy fence.
        engine.release_suballocation(
            AllocatorHeapType::Upload,
            first,
            single_fence(CommandListType::Copy, 1),
        );

        let direct = engine
            .acquire_suballocation(AllocatorHeapType::Upload, 64 * 1024, false, |_| {
                Err(AllocationError::OutOfMemory)
            })
            .unwrap_err();
        assert_eq!(direct, AllocationError::OutOfMemory);

        // The fallback waits on copy fence 1 (the mock completes it),
        // reclaims the block and retries successfully.
        let retried = engine.allocate_with_fallback(|| {
            engine.acquire_suballocation(AllocatorHeapType::Upload, 64 * 1024, false, |_| {
                Err(AllocationError::OutOfMemory)
            })
        });

        assert!(retried.is_ok());
        assert_eq!(engine.completed_fence(CommandListType::Copy), 1);
    }

    #[test]
    fn teardown_waits_and_drains_the_deletion_queue() {
        let backends = <[MockBackend; 3]>::default();
        let drops = Arc::new(AtomicUsize::new(0));

        {
            let [graphics, compute, copy] = &backends;
            let engine: SubmissionEngine<_, DropToken> = SubmissionEngine::new(
                [graphics, compute, copy],
                EngineCallbacks::default(),
                Default::default(),
            );

            engine.submit(CommandListType::Graphics).unwrap();
            engine.defer_destroy(
                DropToken(drops.clone()),
                None,
                single_fence(CommandListType::Graphics, 1),
                true,
                [],
            );

            // Not completed yet; the entry stays queued.
            assert!(engine.trim_deleted_objects());
            assert_eq!(drops.load(Ordering::Relaxed), 0);
        }

        // Dropping the engine waited for fence 1 and destroyed the entry.
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(backends[0].completed.load(Ordering::Relaxed), 1);
    }

    #[derive(Debug)]
    struct DropToken(Arc<AtomicUsize>);

    impl Drop for DropToken {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }
}
