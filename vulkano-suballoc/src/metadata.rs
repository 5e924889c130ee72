// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Bookkeeping of the suballocations inside a single block of device memory.
//!
//! A block is described by a doubly-linked list of suballocations ordered by offset. The list
//! always covers the whole block without gaps, and two free suballocations are never adjacent
//! because freeing merges them. Free suballocations that are large enough are additionally kept
//! in a list sorted by size, which is what makes the best-fit search *O*(log(*n*)) in the common
//! case.

use self::host::SlotId;
use crate::{
    allocation::{Allocation, AllocationType, FrameContext},
    layout::{align_down, align_up, DeviceAlignment, DeviceLayout},
    stats::{PoolStats, StatInfo},
    DeviceSize,
};
use std::{
    cmp,
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    iter,
    sync::Arc,
};

/// Free suballocations smaller than this are not registered in the size-sorted list.
pub(crate) const MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER: DeviceSize = 16;

/// The cost of making one allocation lost, in addition to its size, when comparing eviction
/// candidates.
pub(crate) const LOST_ALLOCATION_COST: DeviceSize = 1_048_576;

/// Tells us if a suballocation is free, and if not, what kind of resource it holds. This is needed
/// in order to be able to respect the buffer-image granularity.
///
/// The order of the variants matters for [`has_granularity_conflict`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum SuballocationType {
    Free = 0,
    Unknown = 1,
    Buffer = 2,
    ImageUnknown = 3,
    ImageLinear = 4,
    ImageOptimal = 5,
}

impl From<AllocationType> for SuballocationType {
    #[inline]
    fn from(ty: AllocationType) -> Self {
        match ty {
            AllocationType::Unknown => SuballocationType::Unknown,
            AllocationType::Buffer => SuballocationType::Buffer,
            AllocationType::ImageUnknown => SuballocationType::ImageUnknown,
            AllocationType::ImageLinear => SuballocationType::ImageLinear,
            AllocationType::ImageOptimal => SuballocationType::ImageOptimal,
        }
    }
}

/// Returns whether resources of the two types must not share a page of `bufferImageGranularity`.
pub(crate) fn has_granularity_conflict(a: SuballocationType, b: SuballocationType) -> bool {
    let (a, b) = if a <= b { (a, b) } else { (b, a) };

    match a {
        SuballocationType::Free => false,
        SuballocationType::Unknown => true,
        SuballocationType::Buffer => matches!(
            b,
            SuballocationType::ImageUnknown | SuballocationType::ImageOptimal,
        ),
        SuballocationType::ImageUnknown => matches!(
            b,
            SuballocationType::ImageUnknown
                | SuballocationType::ImageLinear
                | SuballocationType::ImageOptimal,
        ),
        SuballocationType::ImageLinear => b == SuballocationType::ImageOptimal,
        SuballocationType::ImageOptimal => false,
    }
}

/// Checks if resouces A and B share a page.
///
/// > **Note**: Assumes `a_offset + a_size > 0` and `a_offset + a_size <= b_offset`.
fn are_blocks_on_same_page(
    a_offset: DeviceSize,
    a_size: DeviceSize,
    b_offset: DeviceSize,
    page_size: DeviceAlignment,
) -> bool {
    debug_assert!(a_offset + a_size > 0);
    debug_assert!(a_offset + a_size <= b_offset);

    let a_end = a_offset + a_size - 1;
    let a_end_page = align_down(a_end, page_size);
    let b_start_page = align_down(b_offset, page_size);

    a_end_page == b_start_page
}

#[derive(Debug)]
struct Suballocation {
    prev: Option<SlotId>,
    next: Option<SlotId>,
    offset: DeviceSize,
    size: DeviceSize,
    ty: SuballocationType,
    allocation: Option<Arc<Allocation>>,
}

impl Suballocation {
    fn is_evictable(&self, frames: FrameContext) -> bool {
        self.allocation
            .as_ref()
            .is_some_and(|allocation| allocation.is_evictable(frames))
    }
}

/// A place inside a block where an allocation fits, possibly at the cost of making other
/// allocations lost.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AllocationRequest {
    /// The offset of the allocation within the block.
    pub offset: DeviceSize,
    /// The number of free bytes spanned by the request.
    pub sum_free_size: DeviceSize,
    /// The number of bytes of allocations that must be made lost.
    pub sum_item_size: DeviceSize,
    /// The suballocation where the request starts.
    pub item: SlotId,
    /// The number of allocations that must be made lost.
    pub items_to_make_lost_count: usize,
}

impl AllocationRequest {
    pub fn cost(&self) -> DeviceSize {
        self.sum_item_size + self.items_to_make_lost_count as DeviceSize * LOST_ALLOCATION_COST
    }
}

/// The suballocation bookkeeping of one block.
#[derive(Debug)]
pub(crate) struct BlockMetadata {
    size: DeviceSize,
    nodes: host::SlotArena<Suballocation>,
    head: SlotId,
    free_count: usize,
    sum_free_size: DeviceSize,
    // Free suballocations with a size of at least `MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER`,
    // sorted by size in ascending order.
    free_suballocations_by_size: Vec<SlotId>,
    buffer_image_granularity: DeviceAlignment,
    debug_margin: DeviceSize,
    debug_alignment: DeviceAlignment,
}

impl BlockMetadata {
    /// Creates the metadata of a block of `size` bytes that is entirely free.
    pub fn new(
        size: DeviceSize,
        buffer_image_granularity: DeviceAlignment,
        debug_margin: DeviceSize,
        debug_alignment: DeviceAlignment,
    ) -> Self {
        debug_assert!(size > 0);

        let mut nodes = host::SlotArena::new(16);
        let head = nodes.allocate(Suballocation {
            prev: None,
            next: None,
            offset: 0,
            size,
            ty: SuballocationType::Free,
            allocation: None,
        });

        let mut metadata = BlockMetadata {
            size,
            nodes,
            head,
            free_count: 1,
            sum_free_size: size,
            free_suballocations_by_size: Vec::new(),
            buffer_image_granularity,
            debug_margin,
            debug_alignment,
        };
        metadata.register_free_suballocation(head);

        metadata
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub fn sum_free_size(&self) -> DeviceSize {
        self.sum_free_size
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.nodes.len() - self.free_count
    }

    /// Returns whether the whole block is one free suballocation.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1 && self.free_count == 1
    }

    /// Returns the size of the largest registered free suballocation.
    pub fn unused_range_size_max(&self) -> DeviceSize {
        self.free_suballocations_by_size
            .last()
            .map_or(0, |&id| self.nodes.get(id).size)
    }

    fn iter(&self) -> impl Iterator<Item = (SlotId, &Suballocation)> + '_ {
        iter::successors(Some(self.head), |&id| self.nodes.get(id).next)
            .map(|id| (id, self.nodes.get(id)))
    }

    /// Searches the block for a place where an allocation with the given `layout` fits.
    ///
    /// The size-sorted list is searched first for the smallest free suballocation that fits. If
    /// that fails and `frames` is given, every suballocation is considered as a starting point,
    /// including ones that would require allocations to be made lost, and the request with the
    /// lowest [cost] wins.
    ///
    /// [cost]: AllocationRequest::cost
    pub fn create_allocation_request(
        &self,
        layout: DeviceLayout,
        ty: SuballocationType,
        frames: Option<FrameContext>,
    ) -> Option<AllocationRequest> {
        let size = layout.size();

        if frames.is_none() && self.sum_free_size < size {
            return None;
        }

        let index = self
            .free_suballocations_by_size
            .partition_point(|&id| self.nodes.get(id).size < size);

        for &id in &self.free_suballocations_by_size[index..] {
            if let Some(request) = self.check_allocation(layout, ty, id, None) {
                return Some(request);
            }
        }

        let frames = frames?;
        let mut best_request: Option<AllocationRequest> = None;

        for (id, suballoc) in self.iter() {
            if suballoc.ty != SuballocationType::Free && !suballoc.is_evictable(frames) {
                continue;
            }

            if let Some(request) = self.check_allocation(layout, ty, id, Some(frames)) {
                if best_request.is_none_or(|best| request.cost() < best.cost()) {
                    best_request = Some(request);

                    if request.cost() == 0 {
                        break;
                    }
                }
            }
        }

        best_request
    }

    /// Checks whether an allocation with the given `layout` can be placed starting at the
    /// suballocation `item_id`.
    fn check_allocation(
        &self,
        layout: DeviceLayout,
        ty: SuballocationType,
        item_id: SlotId,
        frames: Option<FrameContext>,
    ) -> Option<AllocationRequest> {
        let size = layout.size();
        let item = self.nodes.get(item_id);
        let mut request = AllocationRequest {
            offset: 0,
            sum_free_size: 0,
            sum_item_size: 0,
            item: item_id,
            items_to_make_lost_count: 0,
        };

        match frames {
            Some(frames) => {
                if item.ty == SuballocationType::Free {
                    request.sum_free_size = item.size;
                } else if item.is_evictable(frames) {
                    request.items_to_make_lost_count += 1;
                    request.sum_item_size = item.size;
                } else {
                    return None;
                }

                if self.size - item.offset < size {
                    return None;
                }
            }
            None => {
                debug_assert_eq!(item.ty, SuballocationType::Free);

                request.sum_free_size = item.size;

                if item.size < size {
                    return None;
                }
            }
        }

        let offset = self.start_offset(item_id, layout.alignment(), ty);

        if offset >= item.offset + item.size {
            return None;
        }

        let padding_begin = offset - item.offset;
        let end_margin = if item.next.is_some() {
            self.debug_margin
        } else {
            0
        };
        let total_size = padding_begin + size + end_margin;

        let last_id = match frames {
            Some(frames) => {
                if item.offset + total_size > self.size {
                    return None;
                }

                let mut last_id = item_id;

                if total_size > item.size {
                    let mut remaining_size = total_size - item.size;

                    while remaining_size > 0 {
                        last_id = self.nodes.get(last_id).next?;
                        let last = self.nodes.get(last_id);

                        if last.ty == SuballocationType::Free {
                            request.sum_free_size += last.size;
                        } else if last.is_evictable(frames) {
                            request.items_to_make_lost_count += 1;
                            request.sum_item_size += last.size;
                        } else {
                            return None;
                        }

                        remaining_size = remaining_size.saturating_sub(last.size);
                    }
                }

                last_id
            }
            None => {
                if total_size > item.size {
                    return None;
                }

                item_id
            }
        };

        // Check the following suballocations for buffer-image granularity conflicts. When
        // allocations may be made lost, a conflicting neighbor is evicted together with every
        // allocation in between, so that the evicted suballocations stay contiguous.
        if self.buffer_image_granularity > DeviceAlignment::MIN {
            let mut pending_count = 0;
            let mut next_id = self.nodes.get(last_id).next;

            while let Some(id) = next_id {
                let next = self.nodes.get(id);

                if !are_blocks_on_same_page(offset, size, next.offset, self.buffer_image_granularity)
                {
                    break;
                }

                let conflict = has_granularity_conflict(ty, next.ty);

                match frames {
                    None => {
                        if conflict {
                            return None;
                        }
                    }
                    Some(_) if next.ty == SuballocationType::Free => {}
                    Some(frames) => {
                        if !next.is_evictable(frames) {
                            // An allocation that stays ends the run of evictions, so no conflict
                            // may follow it on the same page.
                            if conflict || self.has_conflict_on_page(id, offset, size, ty) {
                                return None;
                            }

                            break;
                        }

                        if conflict {
                            request.items_to_make_lost_count += pending_count + 1;
                            pending_count = 0;
                        } else {
                            pending_count += 1;
                        }
                    }
                }

                next_id = next.next;
            }
        }

        request.offset = offset;

        Some(request)
    }

    /// Returns whether any suballocation after `after_id` that shares a page with the given range
    /// conflicts with `ty`.
    fn has_conflict_on_page(
        &self,
        after_id: SlotId,
        offset: DeviceSize,
        size: DeviceSize,
        ty: SuballocationType,
    ) -> bool {
        iter::successors(self.nodes.get(after_id).next, |&id| self.nodes.get(id).next)
            .map(|id| self.nodes.get(id))
            .take_while(|next| {
                are_blocks_on_same_page(offset, size, next.offset, self.buffer_image_granularity)
            })
            .any(|next| has_granularity_conflict(ty, next.ty))
    }

    /// Computes where an allocation starting at the suballocation `item_id` would be placed,
    /// taking the debug margin, alignment and conflicts with preceding suballocations into
    /// account.
    fn start_offset(
        &self,
        item_id: SlotId,
        alignment: DeviceAlignment,
        ty: SuballocationType,
    ) -> DeviceSize {
        let item = self.nodes.get(item_id);
        let alignment = cmp::max(alignment, self.debug_alignment);
        let mut offset = item.offset;

        if item.prev.is_some() {
            offset += self.debug_margin;
        }

        // This can't overflow because suballocation offsets are constrained by the size of the
        // block, which can itself not exceed `DeviceLayout::MAX_SIZE`.
        offset = align_up(offset, alignment);

        if self.buffer_image_granularity > DeviceAlignment::MIN {
            let conflict =
                iter::successors(item.prev, |&id| self.nodes.get(id).prev)
                    .map(|id| self.nodes.get(id))
                    .take_while(|prev| {
                        are_blocks_on_same_page(
                            prev.offset,
                            prev.size,
                            offset,
                            self.buffer_image_granularity,
                        )
                    })
                    .any(|prev| has_granularity_conflict(prev.ty, ty));

            if conflict {
                offset = align_up(offset, self.buffer_image_granularity);
            }
        }

        offset
    }

    /// Makes lost the allocations that `request` needs to be evicted.
    ///
    /// Returns `false` if one of them couldn't be made lost, which happens when it was used again
    /// since the request was created. The allocations that were made lost before that stay lost.
    pub fn make_requested_allocations_lost(
        &mut self,
        request: &mut AllocationRequest,
        frames: FrameContext,
    ) -> bool {
        while request.items_to_make_lost_count > 0 {
            if self.nodes.get(request.item).ty == SuballocationType::Free {
                match self.nodes.get(request.item).next {
                    Some(next_id) => request.item = next_id,
                    None => return false,
                }
            }

            let made_lost = self
                .nodes
                .get(request.item)
                .allocation
                .as_ref()
                .is_some_and(|allocation| allocation.make_lost(frames));

            if !made_lost {
                return false;
            }

            request.item = self.free_suballocation(request.item);
            request.items_to_make_lost_count -= 1;
        }

        debug_assert_eq!(self.nodes.get(request.item).ty, SuballocationType::Free);

        true
    }

    /// Makes lost every allocation in the block that can become lost and wasn't used within the
    /// frames-in-use window. Returns the number of allocations that were made lost.
    pub fn make_allocations_lost(&mut self, frames: FrameContext) -> usize {
        let mut lost_count = 0;
        let mut next_id = Some(self.head);

        while let Some(mut id) = next_id {
            let suballoc = self.nodes.get(id);
            let made_lost = suballoc.ty != SuballocationType::Free
                && suballoc.allocation.as_ref().is_some_and(|allocation| {
                    allocation.can_become_lost() && allocation.make_lost(frames)
                });

            if made_lost {
                id = self.free_suballocation(id);
                lost_count += 1;
            }

            next_id = self.nodes.get(id).next;
        }

        lost_count
    }

    /// Places an allocation of `size` bytes where `request` says, splitting off free padding at
    /// either end.
    pub fn alloc(
        &mut self,
        request: &AllocationRequest,
        ty: SuballocationType,
        size: DeviceSize,
        allocation: Arc<Allocation>,
    ) {
        debug_assert_ne!(ty, SuballocationType::Free);

        let item_id = request.item;
        let item = self.nodes.get(item_id);

        debug_assert_eq!(item.ty, SuballocationType::Free);
        debug_assert!(request.offset >= item.offset);

        let padding_begin = request.offset - item.offset;

        debug_assert!(item.size >= padding_begin + size);

        let padding_end = item.size - padding_begin - size;
        let (prev, next, item_offset) = (item.prev, item.next, item.offset);

        self.unregister_free_suballocation(item_id);

        let item = self.nodes.get_mut(item_id);
        item.offset = request.offset;
        item.size = size;
        item.ty = ty;
        item.allocation = Some(allocation);

        if padding_end > 0 {
            let padding_id = self.nodes.allocate(Suballocation {
                prev: Some(item_id),
                next,
                offset: request.offset + size,
                size: padding_end,
                ty: SuballocationType::Free,
                allocation: None,
            });

            if let Some(next_id) = next {
                self.nodes.get_mut(next_id).prev = Some(padding_id);
            }

            self.nodes.get_mut(item_id).next = Some(padding_id);
            self.register_free_suballocation(padding_id);
            self.free_count += 1;
        }

        if padding_begin > 0 {
            let padding_id = self.nodes.allocate(Suballocation {
                prev,
                next: Some(item_id),
                offset: item_offset,
                size: padding_begin,
                ty: SuballocationType::Free,
                allocation: None,
            });

            match prev {
                Some(prev_id) => self.nodes.get_mut(prev_id).next = Some(padding_id),
                None => self.head = padding_id,
            }

            self.nodes.get_mut(item_id).prev = Some(padding_id);
            self.register_free_suballocation(padding_id);
            self.free_count += 1;
        }

        self.free_count -= 1;
        self.sum_free_size -= size;
    }

    /// Frees the suballocation that holds `allocation`. Returns `false` if there is none.
    pub fn free(&mut self, allocation: &Arc<Allocation>) -> bool {
        let id = self.iter().find_map(|(id, suballoc)| {
            suballoc
                .allocation
                .as_ref()
                .is_some_and(|other| Arc::ptr_eq(other, allocation))
                .then_some(id)
        });

        if let Some(id) = id {
            self.free_suballocation(id);
        }

        id.is_some()
    }

    /// Returns whether the suballocation at `offset` holds `allocation`.
    pub fn holds(&self, offset: DeviceSize, allocation: &Arc<Allocation>) -> bool {
        self.iter().any(|(_, suballoc)| {
            suballoc.offset == offset
                && suballoc
                    .allocation
                    .as_ref()
                    .is_some_and(|other| Arc::ptr_eq(other, allocation))
        })
    }

    /// Frees the used suballocation at `offset`. Returns `false` if there is none.
    pub fn free_at_offset(&mut self, offset: DeviceSize) -> bool {
        let id = self.iter().find_map(|(id, suballoc)| {
            (suballoc.ty != SuballocationType::Free && suballoc.offset == offset).then_some(id)
        });

        if let Some(id) = id {
            self.free_suballocation(id);
        }

        id.is_some()
    }

    /// Marks the suballocation as free and merges it with free neighbors. Returns the ID of the
    /// resulting free suballocation.
    fn free_suballocation(&mut self, id: SlotId) -> SlotId {
        let item = self.nodes.get_mut(id);
        item.ty = SuballocationType::Free;
        item.allocation = None;

        let (size, prev, next) = (item.size, item.prev, item.next);

        self.free_count += 1;
        self.sum_free_size += size;

        let is_free = |id: &SlotId| self.nodes.get(*id).ty == SuballocationType::Free;
        let free_next = next.filter(is_free);
        let free_prev = prev.filter(is_free);

        if let Some(next_id) = free_next {
            self.unregister_free_suballocation(next_id);
            self.merge_free_with_next(id);
        }

        if let Some(prev_id) = free_prev {
            self.unregister_free_suballocation(prev_id);
            self.merge_free_with_next(prev_id);
            self.register_free_suballocation(prev_id);

            prev_id
        } else {
            self.register_free_suballocation(id);

            id
        }
    }

    /// Merges the free suballocation following `id` into it.
    fn merge_free_with_next(&mut self, id: SlotId) {
        let Some(next_id) = self.nodes.get(id).next else {
            return;
        };
        let next = self.nodes.get(next_id);

        debug_assert_eq!(next.ty, SuballocationType::Free);

        let (next_size, next_next) = (next.size, next.next);

        let item = self.nodes.get_mut(id);
        item.size += next_size;
        item.next = next_next;

        if let Some(next_next_id) = next_next {
            self.nodes.get_mut(next_next_id).prev = Some(id);
        }

        self.nodes.free(next_id);
        self.free_count -= 1;
    }

    fn register_free_suballocation(&mut self, id: SlotId) {
        let suballoc = self.nodes.get(id);

        debug_assert_eq!(suballoc.ty, SuballocationType::Free);
        debug_assert!(suballoc.size > 0);

        let size = suballoc.size;

        if size >= MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
            let index = self
                .free_suballocations_by_size
                .partition_point(|&other| self.nodes.get(other).size < size);
            self.free_suballocations_by_size.insert(index, id);
        }
    }

    fn unregister_free_suballocation(&mut self, id: SlotId) {
        let size = self.nodes.get(id).size;

        if size >= MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
            // There may be multiple free suballocations with the same size, so we need to find the
            // one corresponding to the target ID among them.
            let start = self
                .free_suballocations_by_size
                .partition_point(|&other| self.nodes.get(other).size < size);
            let position = self.free_suballocations_by_size[start..]
                .iter()
                .take_while(|&&other| self.nodes.get(other).size == size)
                .position(|&other| other == id);

            debug_assert!(position.is_some(), "free suballocation is not registered");

            if let Some(position) = position {
                self.free_suballocations_by_size.remove(start + position);
            }
        }
    }

    /// Checks every invariant of the block.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut calculated_offset = 0;
        let mut calculated_free_count = 0;
        let mut calculated_sum_free_size = 0;
        let mut free_suballocations_to_register = 0;
        let mut prev_free = false;

        for (_, suballoc) in self.iter() {
            if suballoc.offset != calculated_offset {
                return Err(ValidationError::NotContiguous);
            }

            let is_free = suballoc.ty == SuballocationType::Free;

            if prev_free && is_free {
                return Err(ValidationError::AdjacentFreeSuballocations);
            }

            match (&suballoc.allocation, is_free) {
                (None, true) => {
                    calculated_sum_free_size += suballoc.size;
                    calculated_free_count += 1;

                    if suballoc.size >= MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
                        free_suballocations_to_register += 1;
                    }
                }
                (Some(allocation), false) => {
                    if allocation.offset() != suballoc.offset || allocation.size() != suballoc.size
                    {
                        return Err(ValidationError::AllocationMismatch);
                    }
                }
                (Some(_), true) | (None, false) => {
                    return Err(ValidationError::FreeStateMismatch);
                }
            }

            calculated_offset += suballoc.size;
            prev_free = is_free;
        }

        if self.free_suballocations_by_size.len() != free_suballocations_to_register {
            return Err(ValidationError::FreeListCountMismatch);
        }

        let mut last_size = 0;

        for &id in &self.free_suballocations_by_size {
            let suballoc = self.nodes.get(id);

            if suballoc.ty != SuballocationType::Free
                || suballoc.size < MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER
            {
                return Err(ValidationError::FreeListInvalidEntry);
            }

            if suballoc.size < last_size {
                return Err(ValidationError::FreeListUnsorted);
            }

            last_size = suballoc.size;
        }

        if calculated_offset != self.size {
            return Err(ValidationError::SizeMismatch);
        }

        if calculated_sum_free_size != self.sum_free_size {
            return Err(ValidationError::SumFreeSizeMismatch);
        }

        if calculated_free_count != self.free_count {
            return Err(ValidationError::FreeCountMismatch);
        }

        Ok(())
    }

    /// Computes the statistics of this block alone.
    pub fn calc_stat_info(&self) -> StatInfo {
        let mut info = StatInfo {
            block_count: 1,
            allocation_count: self.allocation_count() as u32,
            unused_range_count: self.free_count as u32,
            used_bytes: self.size - self.sum_free_size,
            unused_bytes: self.sum_free_size,
            ..StatInfo::new()
        };

        for (_, suballoc) in self.iter() {
            if suballoc.ty == SuballocationType::Free {
                info.unused_range_size_min = cmp::min(info.unused_range_size_min, suballoc.size);
                info.unused_range_size_max = cmp::max(info.unused_range_size_max, suballoc.size);
            } else {
                info.allocation_size_min = cmp::min(info.allocation_size_min, suballoc.size);
                info.allocation_size_max = cmp::max(info.allocation_size_max, suballoc.size);
            }
        }

        info
    }

    /// Adds the numbers of this block to `stats`.
    pub fn add_pool_stats(&self, stats: &mut PoolStats) {
        stats.size += self.size;
        stats.unused_size += self.sum_free_size;
        stats.allocation_count += self.allocation_count();
        stats.unused_range_count += self.free_count;
        stats.unused_range_size_max =
            cmp::max(stats.unused_range_size_max, self.unused_range_size_max());
    }
}

/// An invariant of a block's bookkeeping that was found to be violated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationError {
    /// A suballocation doesn't start where the previous one ends.
    NotContiguous,

    /// Two free suballocations are adjacent instead of merged.
    AdjacentFreeSuballocations,

    /// A free suballocation holds an allocation, or a used one doesn't.
    FreeStateMismatch,

    /// A used suballocation's offset or size differs from that of its allocation.
    AllocationMismatch,

    /// The size-sorted list doesn't contain exactly the free suballocations that are large enough.
    FreeListCountMismatch,

    /// The size-sorted list contains a suballocation that is used or too small.
    FreeListInvalidEntry,

    /// The size-sorted list is not sorted.
    FreeListUnsorted,

    /// The suballocations don't add up to the size of the block.
    SizeMismatch,

    /// The recorded number of free bytes is wrong.
    SumFreeSizeMismatch,

    /// The recorded number of free suballocations is wrong.
    FreeCountMismatch,
}

impl Error for ValidationError {}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let msg = match self {
            Self::NotContiguous => "a suballocation doesn't start where the previous one ends",
            Self::AdjacentFreeSuballocations => "two adjacent suballocations are both free",
            Self::FreeStateMismatch => {
                "a suballocation's free state doesn't match whether it holds an allocation"
            }
            Self::AllocationMismatch => {
                "a suballocation's offset or size doesn't match that of its allocation"
            }
            Self::FreeListCountMismatch => {
                "the free-list doesn't contain every registrable free suballocation"
            }
            Self::FreeListInvalidEntry => "the free-list contains an unregistrable suballocation",
            Self::FreeListUnsorted => "the free-list is not sorted by size",
            Self::SizeMismatch => "the suballocations don't cover the whole block",
            Self::SumFreeSizeMismatch => "the number of free bytes is wrong",
            Self::FreeCountMismatch => "the number of free suballocations is wrong",
        };

        f.write_str(msg)
    }
}

/// Storage for the nodes of the suballocation list.
mod host {
    use std::num::NonZeroUsize;

    /// Hands out slots of a growable vector, so that list nodes don't each need their own heap
    /// allocation and can refer to each other by index.
    ///
    /// Freed slots are reused by later allocations. Accessing a freed slot is a logic error; it
    /// returns whatever value was last stored there.
    #[derive(Debug)]
    pub(crate) struct SlotArena<T> {
        slots: Vec<T>,
        // Unsorted list of free slots.
        free_slots: Vec<SlotId>,
    }

    impl<T> SlotArena<T> {
        pub fn new(capacity: usize) -> Self {
            SlotArena {
                slots: Vec::with_capacity(capacity),
                free_slots: Vec::new(),
            }
        }

        /// Allocates a slot and initializes it with the provided value. Returns the ID of the slot.
        pub fn allocate(&mut self, val: T) -> SlotId {
            if let Some(id) = self.free_slots.pop() {
                *self.get_mut(id) = val;

                id
            } else {
                self.slots.push(val);

                SlotId(NonZeroUsize::MIN.saturating_add(self.slots.len() - 1))
            }
        }

        /// Returns the slot with the given ID to the arena to be reused.
        pub fn free(&mut self, id: SlotId) {
            debug_assert!(!self.free_slots.contains(&id));

            self.free_slots.push(id);
        }

        /// Returns the number of slots in use.
        pub fn len(&self) -> usize {
            self.slots.len() - self.free_slots.len()
        }

        pub fn get(&self, id: SlotId) -> &T {
            debug_assert!(!self.free_slots.contains(&id));

            &self.slots[id.0.get() - 1]
        }

        pub fn get_mut(&mut self, id: SlotId) -> &mut T {
            debug_assert!(!self.free_slots.contains(&id));

            &mut self.slots[id.0.get() - 1]
        }
    }

    /// ID of a slot in a `host::SlotArena`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct SlotId(NonZeroUsize);
}
