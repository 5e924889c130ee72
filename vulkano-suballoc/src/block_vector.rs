// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The set of blocks that allocations of one memory type are made from.

use crate::{
    allocation::{Allocation, AllocationType, FrameContext, UserData},
    allocator::{AllocationCreateFlags, AllocationError, Allocator},
    block::MemoryBlock,
    defragment::{Defragmentator, DefragmentationBudget, DefragmentationStats},
    device::MemoryDevice,
    layout::{DeviceAlignment, DeviceLayout},
    metadata::{AllocationRequest, BlockMetadata, SuballocationType, ValidationError},
    stats::{PoolStats, Stats},
    DeviceSize, NonExhaustive,
};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::Arc,
};

/// How many times the size of a new block may be halved in the default block vectors.
const NEW_BLOCK_SIZE_SHIFT_MAX: u32 = 3;

/// How many times the allocator searches for allocations to make lost before giving up, when
/// the candidates keep getting used by other threads in the meantime.
const MAX_EVICTION_TRIES: u32 = 32;

/// A custom pool of device memory blocks of one memory type.
///
/// Pools are created with [`Allocator::create_pool`] and are cheap to clone.
///
/// [`Allocator::create_pool`]: crate::Allocator::create_pool
#[derive(Clone)]
pub struct Pool(pub(crate) Arc<BlockVector>);

impl Pool {
    /// Returns the memory type that the pool allocates from.
    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.0.memory_type_index
    }

    /// Returns the size of the blocks of the pool.
    #[inline]
    pub fn block_size(&self) -> DeviceSize {
        self.0.preferred_block_size
    }

    #[inline]
    pub(crate) fn block_vector(&self) -> &BlockVector {
        &self.0
    }
}

impl PartialEq for Pool {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Pool {}

impl Debug for Pool {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Pool")
            .field("memory_type_index", &self.0.memory_type_index)
            .field("block_size", &self.0.preferred_block_size)
            .finish_non_exhaustive()
    }
}

bitflags! {
    /// Flags that can be passed when creating a [`Pool`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PoolCreateFlags: u32 {
        /// Ignore the buffer-image granularity in the pool.
        ///
        /// This can be set when the pool is only ever used for buffers, or only for images of
        /// optimal tiling, so that suballocations don't get padded needlessly.
        const IGNORE_BUFFER_IMAGE_GRANULARITY = 1 << 0;
    }
}

/// Parameters to create a new [`Pool`].
#[derive(Clone, Debug)]
pub struct PoolCreateInfo {
    /// The memory type that the pool allocates from.
    ///
    /// The default value is `0`.
    pub memory_type_index: u32,

    /// The default value is empty.
    pub flags: PoolCreateFlags,

    /// The size of each block of the pool in bytes. `0` means the preferred block size of the
    /// memory type.
    ///
    /// The default value is `0`.
    pub block_size: DeviceSize,

    /// The number of blocks that are created up front and always kept alive.
    ///
    /// The default value is `0`.
    pub min_block_count: usize,

    /// The maximum number of blocks that the pool may hold. `0` means no limit.
    ///
    /// The default value is `0`.
    pub max_block_count: usize,

    /// How many frames an allocation from the pool is protected from being made lost after it
    /// was last used.
    ///
    /// The default value is `0`.
    pub frame_in_use_count: u32,

    pub _ne: NonExhaustive,
}

impl Default for PoolCreateInfo {
    #[inline]
    fn default() -> Self {
        PoolCreateInfo {
            memory_type_index: 0,
            flags: PoolCreateFlags::empty(),
            block_size: 0,
            min_block_count: 0,
            max_block_count: 0,
            frame_in_use_count: 0,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// Parameters that a [`BlockVector`] is created with.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockVectorCreateInfo {
    pub memory_type_index: u32,
    pub preferred_block_size: DeviceSize,
    pub min_block_count: usize,
    pub max_block_count: usize,
    pub buffer_image_granularity: DeviceAlignment,
    pub frame_in_use_count: u32,
    pub is_custom_pool: bool,
    pub retain_empty_block: bool,
}

/// A growable set of blocks of one memory type.
///
/// The blocks are kept roughly sorted by ascending free space, so that allocations are packed
/// into the fullest blocks first.
pub(crate) struct BlockVector {
    memory_type_index: u32,
    preferred_block_size: DeviceSize,
    min_block_count: usize,
    max_block_count: usize,
    buffer_image_granularity: DeviceAlignment,
    frame_in_use_count: u32,
    is_custom_pool: bool,
    retain_empty_block: bool,
    state: Mutex<BlockVectorState>,
}

#[derive(Debug)]
struct BlockVectorState {
    blocks: Vec<MemoryBlock>,
    // Whether one of the blocks is currently empty.
    has_empty_block: bool,
}

/// The parameters of one allocation request going through a block vector.
pub(crate) struct BlockAllocateInfo<'a> {
    pub layout: DeviceLayout,
    pub allocation_type: AllocationType,
    pub flags: AllocationCreateFlags,
    pub pool: Option<&'a Pool>,
    pub current_frame_index: u32,
    pub user_data: UserData,
}

impl BlockVector {
    pub fn new(create_info: BlockVectorCreateInfo) -> Self {
        let BlockVectorCreateInfo {
            memory_type_index,
            preferred_block_size,
            min_block_count,
            max_block_count,
            buffer_image_granularity,
            frame_in_use_count,
            is_custom_pool,
            retain_empty_block,
        } = create_info;

        BlockVector {
            memory_type_index,
            preferred_block_size,
            min_block_count,
            max_block_count,
            buffer_image_granularity,
            frame_in_use_count,
            is_custom_pool,
            retain_empty_block,
            state: Mutex::new(BlockVectorState {
                blocks: Vec::new(),
                has_empty_block: false,
            }),
        }
    }

    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    #[inline]
    pub fn preferred_block_size(&self) -> DeviceSize {
        self.preferred_block_size
    }

    fn frames(&self, current_frame_index: u32) -> FrameContext {
        FrameContext {
            current_frame_index,
            frame_in_use_count: self.frame_in_use_count,
        }
    }

    /// Creates the minimum number of blocks.
    pub fn create_min_blocks<D: MemoryDevice>(
        &self,
        allocator: &Allocator<D>,
    ) -> Result<(), AllocationError> {
        let mut state = self.state.lock();

        while state.blocks.len() < self.min_block_count {
            let block = self.create_block(allocator, self.preferred_block_size)?;
            state.blocks.push(block);
            state.has_empty_block = true;
        }

        Ok(())
    }

    fn create_block<D: MemoryDevice>(
        &self,
        allocator: &Allocator<D>,
        block_size: DeviceSize,
    ) -> Result<MemoryBlock, AllocationError> {
        let block = MemoryBlock::new(
            allocator,
            self.memory_type_index,
            block_size,
            self.buffer_image_granularity,
        )?;

        log::debug!(
            "created block {:?} of {} bytes in memory type {}",
            block.memory().handle(),
            block_size,
            self.memory_type_index,
        );

        Ok(block)
    }

    /// Allocates memory from the blocks of the vector.
    ///
    /// The following is tried in order:
    ///
    /// 1. An existing block that has enough free space.
    /// 2. A new block, unless `NEVER_ALLOCATE` is given or the vector is full.
    /// 3. Making other allocations lost, if `CAN_MAKE_OTHER_LOST` is given.
    pub fn allocate<D: MemoryDevice>(
        &self,
        allocator: &Allocator<D>,
        allocate_info: BlockAllocateInfo<'_>,
    ) -> Result<Arc<Allocation>, AllocationError> {
        let layout = allocate_info.layout;
        let flags = allocate_info.flags;
        let suballocation_type = allocate_info.allocation_type.into();
        let can_make_other_lost = flags.intersects(AllocationCreateFlags::CAN_MAKE_OTHER_LOST);

        let mut state = self.state.lock();

        // 1. Search the existing blocks.
        for block_index in 0..state.blocks.len() {
            let request = state.blocks[block_index]
                .metadata()
                .create_allocation_request(layout, suballocation_type, None);

            if let Some(request) = request {
                log::trace!(
                    "returning allocation of {} bytes from existing block {}",
                    layout.size(),
                    block_index,
                );

                return self.allocate_from_block(
                    allocator,
                    &mut state,
                    block_index,
                    &request,
                    allocate_info,
                );
            }
        }

        // 2. Create a new block.
        let can_create_block = !flags.intersects(AllocationCreateFlags::NEVER_ALLOCATE)
            && state.blocks.len() < self.max_block_count;
        let mut error = AllocationError::OutOfDeviceMemory;

        if can_create_block {
            match self.create_block_for(allocator, &state.blocks, layout.size()) {
                Ok(block) => {
                    state.blocks.push(block);
                    let block_index = state.blocks.len() - 1;
                    let request = state.blocks[block_index]
                        .metadata()
                        .create_allocation_request(layout, suballocation_type, None);

                    if let Some(request) = request {
                        log::trace!(
                            "returning allocation of {} bytes from new block {}",
                            layout.size(),
                            block_index,
                        );

                        return self.allocate_from_block(
                            allocator,
                            &mut state,
                            block_index,
                            &request,
                            allocate_info,
                        );
                    }

                    // The allocation didn't fit after all, which can only be due to the debug
                    // margin. Keep the block around as the empty one.
                    state.has_empty_block = true;
                }
                Err(err) => error = err,
            }
        }

        // 3. Make other allocations lost.
        if can_make_other_lost {
            let frames = self.frames(allocate_info.current_frame_index);
            let eviction = make_room_by_eviction(
                &mut state.blocks,
                layout,
                suballocation_type,
                frames,
                BlockMetadata::make_requested_allocations_lost,
            );

            match eviction {
                Eviction::Ready {
                    block_index,
                    request,
                } => {
                    log::trace!(
                        "returning allocation of {} bytes from block {} after making {} \
                        allocations lost",
                        layout.size(),
                        block_index,
                        request.items_to_make_lost_count,
                    );

                    return self.allocate_from_block(
                        allocator,
                        &mut state,
                        block_index,
                        &request,
                        allocate_info,
                    );
                }
                Eviction::NoCandidates => {}
                Eviction::ContentionExhausted => {
                    log::warn!(
                        "gave up making allocations lost in memory type {} after {} tries",
                        self.memory_type_index,
                        MAX_EVICTION_TRIES,
                    );

                    return Err(AllocationError::ContentionExhausted);
                }
            }
        }

        Err(error)
    }

    /// Creates a new block that can hold an allocation of `size` bytes.
    ///
    /// In the default block vectors, the block starts out smaller than the preferred size as
    /// long as no existing block is as large, and shrinks further when the device is out of
    /// memory.
    fn create_block_for<D: MemoryDevice>(
        &self,
        allocator: &Allocator<D>,
        blocks: &[MemoryBlock],
        size: DeviceSize,
    ) -> Result<MemoryBlock, AllocationError> {
        let mut block_size = self.preferred_block_size;
        let mut shift = 0;

        if !self.is_custom_pool {
            let max_existing_block_size = blocks
                .iter()
                .map(|block| block.metadata().size())
                .max()
                .unwrap_or(0);

            while shift < NEW_BLOCK_SIZE_SHIFT_MAX {
                let smaller_block_size = block_size / 2;

                if smaller_block_size > max_existing_block_size
                    && smaller_block_size >= size.saturating_mul(2)
                {
                    block_size = smaller_block_size;
                    shift += 1;
                } else {
                    break;
                }
            }
        }

        let mut result = self.create_block(allocator, block_size);

        if !self.is_custom_pool {
            while let Err(err) = &result {
                let smaller_block_size = block_size / 2;

                if shift >= NEW_BLOCK_SIZE_SHIFT_MAX || smaller_block_size < size {
                    break;
                }

                log::warn!(
                    "failed to create block of {} bytes in memory type {} ({}), retrying with {} \
                    bytes",
                    block_size,
                    self.memory_type_index,
                    err,
                    smaller_block_size,
                );

                block_size = smaller_block_size;
                shift += 1;
                result = self.create_block(allocator, block_size);
            }
        }

        result
    }

    fn allocate_from_block<D: MemoryDevice>(
        &self,
        allocator: &Allocator<D>,
        state: &mut BlockVectorState,
        block_index: usize,
        request: &AllocationRequest,
        allocate_info: BlockAllocateInfo<'_>,
    ) -> Result<Arc<Allocation>, AllocationError> {
        let BlockAllocateInfo {
            layout,
            allocation_type,
            flags,
            pool,
            current_frame_index,
            user_data,
        } = allocate_info;

        let block = &mut state.blocks[block_index];
        let memory = block.memory().clone();

        if flags.intersects(AllocationCreateFlags::MAPPED) {
            // SAFETY: The block belongs to this allocator's device and is alive.
            if let Err(err) = unsafe { memory.map(allocator.device(), 1) } {
                // A block that was just created for this allocation stays behind empty.
                if block.metadata().is_empty() {
                    state.has_empty_block = true;
                }

                return Err(err.into());
            }
        }

        if block.metadata().is_empty() {
            state.has_empty_block = false;
        }

        let allocation = Allocation::new_block(
            memory,
            request.offset,
            layout,
            allocation_type,
            flags,
            pool.cloned(),
            current_frame_index,
            user_data,
        );

        let block = &mut state.blocks[block_index];
        block.metadata_mut().alloc(
            request,
            allocation_type.into(),
            layout.size(),
            allocation.clone(),
        );

        debug_assert!(block.validate().is_ok());

        Ok(allocation)
    }

    /// Gives the memory of `allocation` back to its block, destroying the block if it became
    /// empty and isn't needed anymore.
    pub fn free<D: MemoryDevice>(&self, allocator: &Allocator<D>, allocation: &Arc<Allocation>) {
        let Some(memory) = allocation.block() else {
            return;
        };

        let block_to_destroy = {
            let mut state = self.state.lock();
            let state = &mut *state;

            // Making an allocation lost happens under the lock, so this is up to date.
            if allocation.is_lost() {
                return;
            }

            let Some(block_index) = state.blocks.iter().position(|block| block.owns(&memory))
            else {
                log::warn!(
                    "freeing an allocation whose block doesn't belong to memory type {}",
                    self.memory_type_index,
                );

                return;
            };

            let block = &mut state.blocks[block_index];

            if block.metadata_mut().free(allocation) {
                // SAFETY: The block belongs to this allocator's device and is alive.
                unsafe { memory.unmap(allocator.device(), allocation.map_ref_count()) };
            } else {
                log::warn!(
                    "allocation at offset {} was not found in block {:?}",
                    allocation.offset(),
                    memory.handle(),
                );

                return;
            }

            debug_assert!(block.validate().is_ok());

            let block_count = state.blocks.len();
            let mut block_to_destroy = None;

            if state.blocks[block_index].metadata().is_empty() {
                if (state.has_empty_block || !self.retain_empty_block)
                    && block_count > self.min_block_count
                {
                    block_to_destroy = Some(state.blocks.remove(block_index));
                } else {
                    state.has_empty_block = true;
                }
            } else if state.has_empty_block && block_count > self.min_block_count {
                // Keep at most one empty block around, at the end where the emptiest blocks are.
                if state
                    .blocks
                    .last()
                    .is_some_and(|block| block.metadata().is_empty())
                {
                    block_to_destroy = state.blocks.pop();
                    state.has_empty_block = false;
                }
            }

            incrementally_sort_blocks(&mut state.blocks);

            block_to_destroy
        };

        if let Some(block) = block_to_destroy {
            log::debug!(
                "destroying empty block {:?} of memory type {}",
                block.memory().handle(),
                self.memory_type_index,
            );

            block.destroy(allocator);
        }
    }

    /// Makes lost every allocation that can become lost and wasn't used recently. Returns how
    /// many allocations were made lost.
    pub fn make_allocations_lost(&self, current_frame_index: u32) -> usize {
        let frames = self.frames(current_frame_index);
        let mut state = self.state.lock();
        let state = &mut *state;

        let lost_count = state
            .blocks
            .iter_mut()
            .map(|block| block.metadata_mut().make_allocations_lost(frames))
            .sum();

        state.has_empty_block = state
            .blocks
            .iter()
            .any(|block| block.metadata().is_empty());

        lost_count
    }

    /// Adds the statistics of every block to `stats`.
    pub fn add_stats(&self, stats: &mut Stats, heap_index: u32) {
        let state = self.state.lock();

        for block in &state.blocks {
            let info = block.metadata().calc_stat_info();
            stats.add(self.memory_type_index, heap_index, &info);
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut stats = PoolStats {
            block_count: state.blocks.len(),
            ..Default::default()
        };

        for block in &state.blocks {
            block.metadata().add_pool_stats(&mut stats);
        }

        stats
    }

    /// Moves the given allocations, which must belong to this vector, toward fewer blocks, and
    /// then destroys the blocks that became empty.
    ///
    /// `candidates` pairs each allocation with its index in the caller's list, which is the
    /// index that is set in `changed` when the allocation is moved. Returns `false` if the
    /// budget ran out before the defragmentation was complete.
    pub fn defragment<D: MemoryDevice>(
        &self,
        allocator: &Allocator<D>,
        candidates: &[(usize, &Arc<Allocation>)],
        budget: &mut DefragmentationBudget,
        changed: &mut [bool],
        stats: &mut DefragmentationStats,
    ) -> Result<bool, AllocationError> {
        let (result, blocks_to_destroy) = {
            let mut state = self.state.lock();
            let state = &mut *state;

            let mut defragmentator =
                Defragmentator::new(allocator.device(), &mut state.blocks, candidates);
            let result = defragmentator.defragment(budget, changed, stats);
            defragmentator.finish();

            let mut blocks_to_destroy = Vec::new();

            for block_index in (0..state.blocks.len()).rev() {
                if state.blocks[block_index].metadata().is_empty() {
                    if state.blocks.len() > self.min_block_count {
                        let block = state.blocks.remove(block_index);
                        stats.device_memory_blocks_freed += 1;
                        stats.bytes_freed += block.metadata().size();
                        blocks_to_destroy.push(block);
                    } else {
                        state.has_empty_block = true;
                    }
                }
            }

            (result, blocks_to_destroy)
        };

        for block in blocks_to_destroy {
            log::debug!(
                "destroying block {:?} of memory type {} emptied by defragmentation",
                block.memory().handle(),
                self.memory_type_index,
            );

            block.destroy(allocator);
        }

        result
    }

    /// Destroys all blocks. Every allocation must have been freed or lost.
    pub fn destroy_blocks<D: MemoryDevice>(&self, allocator: &Allocator<D>) {
        let blocks = {
            let mut state = self.state.lock();
            state.has_empty_block = false;

            std::mem::take(&mut state.blocks)
        };

        for block in blocks {
            block.destroy(allocator);
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let state = self.state.lock();

        state.blocks.iter().try_for_each(MemoryBlock::validate)
    }
}

impl Debug for BlockVector {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("BlockVector")
            .field("memory_type_index", &self.memory_type_index)
            .field("preferred_block_size", &self.preferred_block_size)
            .field("min_block_count", &self.min_block_count)
            .field("max_block_count", &self.max_block_count)
            .field("is_custom_pool", &self.is_custom_pool)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Performs one pass of bubble sort, so that the blocks become sorted by ascending free space
/// over time.
fn incrementally_sort_blocks(blocks: &mut [MemoryBlock]) {
    for index in 1..blocks.len() {
        if blocks[index - 1].metadata().sum_free_size() > blocks[index].metadata().sum_free_size()
        {
            blocks.swap(index - 1, index);
            return;
        }
    }
}

/// The outcome of searching for allocations to make lost.
#[derive(Debug)]
enum Eviction {
    /// The allocations were made lost and `request` can be allocated in the block.
    Ready {
        block_index: usize,
        request: AllocationRequest,
    },
    /// No block has enough space even when making allocations lost.
    NoCandidates,
    /// The chosen allocations kept being used by other threads before they could be made lost.
    ContentionExhausted,
}

/// Finds the cheapest request across `blocks` that fits `layout` by making allocations lost, and
/// makes them lost with `make_lost`. The search is repeated at most [`MAX_EVICTION_TRIES`] times
/// when `make_lost` fails.
fn make_room_by_eviction(
    blocks: &mut [MemoryBlock],
    layout: DeviceLayout,
    suballocation_type: SuballocationType,
    frames: FrameContext,
    mut make_lost: impl FnMut(&mut BlockMetadata, &mut AllocationRequest, FrameContext) -> bool,
) -> Eviction {
    for _ in 0..MAX_EVICTION_TRIES {
        let mut best: Option<(usize, AllocationRequest)> = None;

        for (block_index, block) in blocks.iter().enumerate() {
            let request = block.metadata().create_allocation_request(
                layout,
                suballocation_type,
                Some(frames),
            );

            if let Some(request) = request {
                if best.is_none_or(|(_, best)| request.cost() < best.cost()) {
                    best = Some((block_index, request));

                    if request.cost() == 0 {
                        break;
                    }
                }
            }
        }

        let Some((block_index, mut request)) = best else {
            return Eviction::NoCandidates;
        };

        if make_lost(blocks[block_index].metadata_mut(), &mut request, frames) {
            return Eviction::Ready {
                block_index,
                request,
            };
        }

        // Some of the allocations were used again in the meantime. Try again.
    }

    Eviction::ContentionExhausted
}
