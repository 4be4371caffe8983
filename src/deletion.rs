// Copyright (c) 2024 The fenced developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Deferred destruction of GPU-referenced objects.
//!
//! An object that was recorded into a command list cannot be destroyed
//! until every command list that touched it has completed on the GPU.
//! Instead of waiting at release time, objects are *retired*: wrapped
//! together with the fence values that were current on each queue when
//! they were last used, and pushed onto a FIFO queue. Trimming the queue
//! destroys every head entry whose fences have all completed — and whose
//! user-attached [`DeferredWait`]s, if any, are satisfied.
//!
//! Two kinds of objects are retired: whole resources (together with an
//! opaque residency token whose drop ends residency tracking) and
//! suballocated blocks, which return to their parent allocator rather than
//! being destroyed outright.
//!
//! The queue is not internally synchronized; its enclosing context is
//! expected to guard it with a coarse lock and to drain it *last* during
//! teardown, while the collaborators retired objects refer to are still
//! alive.

use crate::{
    suballocator::{SharedAllocator, SuballocationBlock},
    CommandListType, Fence, FenceValue, FenceValues,
};
use smallvec::SmallVec;
use std::{any::Any, collections::VecDeque, fmt, sync::Arc};

/// An opaque owning token stored alongside a retired resource.
///
/// Dropping the token must end whatever external tracking the resource was
/// registered for (typically residency management).
pub type ResidencyToken = Box<dyn Any + Send>;

/// A user-specified wait attached to a retired object.
///
/// The object is not destroyed until the external fence's completed value
/// reaches `value`, in addition to the object's own command-list fences.
#[derive(Clone)]
pub struct DeferredWait {
    pub fence: Arc<dyn Fence + Send + Sync>,
    pub value: FenceValue,
}

impl DeferredWait {
    fn is_satisfied(&self) -> bool {
        self.fence.completed_value() >= self.value
    }
}

impl fmt::Debug for DeferredWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredWait")
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

/// Builds a per-type fence array with a single entry set.
pub fn single_fence(command_list_type: CommandListType, value: FenceValue) -> FenceValues {
    let mut values = [0; CommandListType::COUNT];
    values[command_list_type.index()] = value;
    values
}

/// The bookkeeping shared by every retired object.
#[derive(Debug)]
struct RetiredObject {
    // Fence value current on each queue when the object was last touched;
    // 0 means the queue never touched it.
    last_fence_values: FenceValues,
    completion_required: bool,
    deferred_waits: SmallVec<[DeferredWait; 2]>,
}

impl RetiredObject {
    fn ready_to_destroy(&self, completed: &FenceValues, device_being_destroyed: bool) -> bool {
        if device_being_destroyed && !self.completion_required {
            // Teardown must not hang on fences that will never signal.
            return true;
        }

        for command_list_type in CommandListType::ALL {
            let last = self.last_fence_values[command_list_type.index()];

            if last > 0 && completed[command_list_type.index()] < last {
                return false;
            }
        }

        self.deferred_waits.iter().all(DeferredWait::is_satisfied)
    }
}

/// A resource awaiting destruction.
struct RetiredResource<R> {
    resource: R,
    residency: Option<ResidencyToken>,
    retired: RetiredObject,
}

impl<R> fmt::Debug for RetiredResource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetiredResource")
            .field("retired", &self.retired)
            .finish_non_exhaustive()
    }
}

/// A suballocated block awaiting release to its parent allocator.
struct RetiredSuballocation<R> {
    block: SuballocationBlock<R>,
    parent: SharedAllocator<R>,
    retired: RetiredObject,
}

impl<R> RetiredSuballocation<R> {
    fn destroy(self) {
        self.parent.lock().deallocate(self.block);
    }
}

impl<R> fmt::Debug for RetiredSuballocation<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetiredSuballocation")
            .field("retired", &self.retired)
            .finish_non_exhaustive()
    }
}

/// FIFO queues of retired resources and suballocations.
///
/// Enqueue paths never fail observably: if bookkeeping memory cannot be
/// obtained, the carried object is dropped (or, for suballocations, its
/// node leaked for the session) so that destructors stay reachable under
/// memory pressure.
#[derive(Debug)]
pub struct DeferredDeletionQueue<R> {
    objects: VecDeque<RetiredResource<R>>,
    suballocations: VecDeque<RetiredSuballocation<R>>,
}

impl<R> DeferredDeletionQueue<R> {
    pub fn new() -> Self {
        DeferredDeletionQueue {
            objects: VecDeque::new(),
            suballocations: VecDeque::new(),
        }
    }

    /// Retires a resource last touched at the given per-type fence values.
    ///
    /// If `completion_required` is false, the resource may be destroyed at
    /// device teardown even though its fences never completed. The
    /// residency token, if any, is dropped together with the resource.
    pub fn retire_resource(
        &mut self,
        resource: R,
        residency: Option<ResidencyToken>,
        last_fence_values: FenceValues,
        completion_required: bool,
        deferred_waits: impl IntoIterator<Item = DeferredWait>,
    ) {
        if self.objects.try_reserve(1).is_err() {
            // Drop the resource right away; nothing else can be done.
            return;
        }

        self.objects.push_back(RetiredResource {
            resource,
            residency,
            retired: RetiredObject {
                last_fence_values,
                completion_required,
                deferred_waits: deferred_waits.into_iter().collect(),
            },
        });
    }

    /// Retires a suballocated block, returning it to `parent` once every
    /// queue it was recorded on has completed.
    ///
    /// Blocks that were never actually submitted are released immediately,
    /// without passing through the queue.
    pub fn retire_suballocation(
        &mut self,
        block: SuballocationBlock<R>,
        parent: SharedAllocator<R>,
        last_fence_values: FenceValues,
        completed: &FenceValues,
    ) {
        let retired_block = RetiredSuballocation {
            block,
            parent,
            retired: RetiredObject {
                last_fence_values,
                completion_required: true,
                deferred_waits: SmallVec::new(),
            },
        };

        if retired_block.retired.ready_to_destroy(completed, false) {
            retired_block.destroy();
            return;
        }

        if self.suballocations.try_reserve(1).is_err() {
            // The block's node leaks for the session; dropping it still
            // releases its share of the backing heap.
            return;
        }

        self.suballocations.push_back(retired_block);
    }

    /// Destroys every queue head that is ready, in retirement order.
    ///
    /// Returns true while either queue still holds entries, as a hint to
    /// re-schedule trimming.
    pub fn trim(&mut self, completed: &FenceValues, device_being_destroyed: bool) -> bool {
        while let Some(head) = self.objects.front() {
            if !head.retired.ready_to_destroy(completed, device_being_destroyed) {
                break;
            }

            let RetiredResource {
                resource, residency, ..
            } = self.objects.pop_front().unwrap();

            // Release the GPU object before ending residency tracking.
            drop(resource);
            drop(residency);
        }

        while let Some(head) = self.suballocations.front() {
            if !head.retired.ready_to_destroy(completed, device_being_destroyed) {
                break;
            }

            self.suballocations.pop_front().unwrap().destroy();
        }

        !self.objects.is_empty() || !self.suballocations.is_empty()
    }

    /// The per-type fence values that would unblock the next resource
    /// deletion, or `None` if no resources are queued.
    ///
    /// The queues are FIFO, so the head is by construction the next entry
    /// to become ready.
    pub fn fence_values_for_object_deletion(&self) -> Option<FenceValues> {
        self.objects.front().map(|head| head.retired.last_fence_values)
    }

    /// Like [`fence_values_for_object_deletion`], for the suballocation
    /// queue. Reported separately because releasing suballocations early
    /// makes their parent heaps reusable.
    ///
    /// [`fence_values_for_object_deletion`]: Self::fence_values_for_object_deletion
    pub fn fence_values_for_suballocation_deletion(&self) -> Option<FenceValues> {
        self.suballocations
            .front()
            .map(|head| head.retired.last_fence_values)
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.suballocations.is_empty()
    }

    /// The number of retired entries across both queues.
    pub fn len(&self) -> usize {
        self.objects.len() + self.suballocations.len()
    }
}
