// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Relocation of allocations toward fewer, better-packed blocks.
//!
//! The blocks of a block vector are ordered so that blocks containing allocations that can't be
//! moved come first, followed by the remaining blocks in ascending order of free space. The
//! earlier a block is in this order, the better it is as a destination. Allocations are then
//! taken from the back, largest first, and moved to the first place in an earlier block (or
//! earlier in the same block) where they fit.

use crate::{
    allocation::Allocation,
    allocator::AllocationError,
    block::{BlockMemory, MemoryBlock},
    device::MemoryDevice,
    layout::DeviceLayout,
    DeviceSize, NonExhaustive,
};
use foldhash::{HashMap, HashSet};
use std::{ptr, sync::Arc};

/// How many times the blocks are swept for allocations to move.
const ROUND_COUNT: usize = 2;

/// Parameters of [`Allocator::defragment`].
///
/// [`Allocator::defragment`]: crate::Allocator::defragment
#[derive(Clone, Debug)]
pub struct DefragmentationInfo {
    /// The maximum number of bytes that may be copied.
    ///
    /// The default value is [`DeviceSize::MAX`].
    pub max_bytes_to_move: DeviceSize,

    /// The maximum number of allocations that may be moved.
    ///
    /// The default value is [`u32::MAX`].
    pub max_allocations_to_move: u32,

    pub _ne: NonExhaustive,
}

impl Default for DefragmentationInfo {
    #[inline]
    fn default() -> Self {
        DefragmentationInfo {
            max_bytes_to_move: DeviceSize::MAX,
            max_allocations_to_move: u32::MAX,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// Statistics of one call to [`Allocator::defragment`].
///
/// [`Allocator::defragment`]: crate::Allocator::defragment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DefragmentationStats {
    /// Total number of bytes that have been copied.
    pub bytes_moved: DeviceSize,

    /// Total number of bytes of device memory that have been released.
    pub bytes_freed: DeviceSize,

    /// Number of allocations that have been moved.
    pub allocations_moved: u32,

    /// Number of device memory blocks that have been released.
    pub device_memory_blocks_freed: u32,
}

/// The result of [`Allocator::defragment`].
///
/// [`Allocator::defragment`]: crate::Allocator::defragment
#[derive(Clone, Debug, Default)]
pub struct DefragmentationOutcome {
    /// For every allocation that was passed in, whether it has been moved. The resources bound
    /// to moved allocations must be recreated and bound to the new location.
    pub changed: Vec<bool>,

    pub stats: DefragmentationStats,

    /// Whether the budget ran out before everything that could be moved was moved.
    pub incomplete: bool,
}

/// What is left of the budget of a defragmentation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DefragmentationBudget {
    pub max_bytes_to_move: DeviceSize,
    pub max_allocations_to_move: u32,
}

impl DefragmentationBudget {
    fn allows(&self, size: DeviceSize) -> bool {
        size <= self.max_bytes_to_move && self.max_allocations_to_move > 0
    }

    fn consume(&mut self, size: DeviceSize) {
        self.max_bytes_to_move -= size;
        self.max_allocations_to_move -= 1;
    }
}

#[derive(Clone, Copy)]
struct Candidate<'a> {
    // Index in the caller's list of allocations.
    index: usize,
    allocation: &'a Arc<Allocation>,
}

enum Move {
    Moved,
    NoPlace,
    OutOfBudget,
}

struct BlockInfo<'a> {
    // Index of the block in the block vector.
    block_index: usize,
    has_non_movable_allocations: bool,
    // Sorted by ascending size, so that the largest one is taken from the back first.
    candidates: Vec<Candidate<'a>>,
    // Whether the block was mapped for the duration of the defragmentation.
    mapped: bool,
}

/// Moves allocations within the blocks of one block vector.
///
/// The block vector's lock must be held for the lifetime of this object.
pub(crate) struct Defragmentator<'a, D> {
    device: &'a D,
    blocks: &'a mut [MemoryBlock],
    block_infos: Vec<BlockInfo<'a>>,
}

impl<'a, D: MemoryDevice> Defragmentator<'a, D> {
    /// Groups the `candidates` by their block. Candidates that are lost, that don't belong to one
    /// of `blocks`, or that were already given are ignored.
    pub fn new(
        device: &'a D,
        blocks: &'a mut [MemoryBlock],
        candidates: &[(usize, &'a Arc<Allocation>)],
    ) -> Self {
        let block_indices: HashMap<*const BlockMemory, usize> = blocks
            .iter()
            .enumerate()
            .map(|(block_index, block)| (Arc::as_ptr(block.memory()), block_index))
            .collect();

        let mut block_infos: Vec<BlockInfo<'a>> = (0..blocks.len())
            .map(|block_index| BlockInfo {
                block_index,
                has_non_movable_allocations: false,
                candidates: Vec::new(),
                mapped: false,
            })
            .collect();

        let mut seen: HashSet<*const Allocation> = HashSet::default();

        for &(index, allocation) in candidates {
            if allocation.is_lost() || !seen.insert(Arc::as_ptr(allocation)) {
                continue;
            }

            let block_index = allocation
                .block()
                .and_then(|memory| block_indices.get(&Arc::as_ptr(&memory)).copied());

            if let Some(block_index) = block_index {
                block_infos[block_index]
                    .candidates
                    .push(Candidate { index, allocation });
            }
        }

        for info in &mut block_infos {
            let metadata = blocks[info.block_index].metadata();
            info.has_non_movable_allocations =
                metadata.allocation_count() != info.candidates.len();
            info.candidates
                .sort_by_key(|candidate| candidate.allocation.size());
        }

        // Best destinations first.
        block_infos.sort_by(|a, b| {
            b.has_non_movable_allocations
                .cmp(&a.has_non_movable_allocations)
                .then_with(|| {
                    let a_free = blocks[a.block_index].metadata().sum_free_size();
                    let b_free = blocks[b.block_index].metadata().sum_free_size();

                    a_free.cmp(&b_free)
                })
        });

        Defragmentator {
            device,
            blocks,
            block_infos,
        }
    }

    /// Runs the defragmentation rounds. Returns `false` if the budget ran out.
    pub fn defragment(
        &mut self,
        budget: &mut DefragmentationBudget,
        changed: &mut [bool],
        stats: &mut DefragmentationStats,
    ) -> Result<bool, AllocationError> {
        for _ in 0..ROUND_COUNT {
            if !self.defragment_round(budget, changed, stats)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn defragment_round(
        &mut self,
        budget: &mut DefragmentationBudget,
        changed: &mut [bool],
        stats: &mut DefragmentationStats,
    ) -> Result<bool, AllocationError> {
        for src_info_index in (0..self.block_infos.len()).rev() {
            let mut candidate_index = self.block_infos[src_info_index].candidates.len();

            while candidate_index > 0 {
                candidate_index -= 1;

                let candidate = self.block_infos[src_info_index].candidates[candidate_index];

                match self.try_move(src_info_index, candidate, budget)? {
                    Move::Moved => {
                        changed[candidate.index] = true;
                        stats.allocations_moved += 1;
                        stats.bytes_moved += candidate.allocation.size();
                        self.block_infos[src_info_index]
                            .candidates
                            .remove(candidate_index);
                    }
                    Move::NoPlace => {}
                    Move::OutOfBudget => return Ok(false),
                }
            }
        }

        Ok(true)
    }

    /// Tries to move the candidate to the first better place.
    fn try_move(
        &mut self,
        src_info_index: usize,
        candidate: Candidate<'a>,
        budget: &mut DefragmentationBudget,
    ) -> Result<Move, AllocationError> {
        let allocation = candidate.allocation;
        let size = allocation.size();
        let src_offset = allocation.offset();
        let suballocation_type = allocation.suballocation_type();

        let src_block_index = self.block_infos[src_info_index].block_index;

        if !self.blocks[src_block_index]
            .metadata()
            .holds(src_offset, allocation)
        {
            log::warn!(
                "skipping allocation at offset {} that its block doesn't hold",
                src_offset,
            );

            return Ok(Move::NoPlace);
        }

        let Some(layout) = DeviceLayout::from_size_alignment(size, allocation.alignment().into())
        else {
            return Ok(Move::NoPlace);
        };

        for dst_info_index in 0..=src_info_index {
            let dst_block_index = self.block_infos[dst_info_index].block_index;
            let request = self.blocks[dst_block_index]
                .metadata()
                .create_allocation_request(layout, suballocation_type, None);

            let Some(request) = request else {
                continue;
            };

            if !move_makes_sense(dst_info_index, request.offset, src_info_index, src_offset) {
                continue;
            }

            if !budget.allows(size) {
                return Ok(Move::OutOfBudget);
            }

            let dst_ptr = self.ensure_mapping(dst_info_index)?;
            let src_ptr = self.ensure_mapping(src_info_index)?;

            // SAFETY: Both offsets lie within mapped blocks.
            let src = unsafe { src_ptr.add(src_offset as usize) };
            let dst = unsafe { dst_ptr.add(request.offset as usize) };

            // SAFETY: The destination range is free. `ptr::copy` handles the ranges overlapping
            // within the same block.
            unsafe { ptr::copy(src, dst, size as usize) };

            self.blocks[dst_block_index].metadata_mut().alloc(
                &request,
                suballocation_type,
                size,
                allocation.clone(),
            );
            let freed = self.blocks[src_block_index]
                .metadata_mut()
                .free_at_offset(src_offset);

            debug_assert!(freed);

            let dst_memory = self.blocks[dst_block_index].memory().clone();

            // SAFETY: The suballocation was moved to `dst_memory` above.
            unsafe {
                allocation.change_block_allocation(self.device, &dst_memory, request.offset)
            }?;

            debug_assert!(self.blocks[dst_block_index].validate().is_ok());
            debug_assert!(self.blocks[src_block_index].validate().is_ok());

            budget.consume(size);

            return Ok(Move::Moved);
        }

        Ok(Move::NoPlace)
    }

    /// Maps the block for the duration of the defragmentation, if it isn't already, and returns
    /// the pointer to its start.
    fn ensure_mapping(&mut self, info_index: usize) -> Result<*mut u8, AllocationError> {
        let info = &mut self.block_infos[info_index];
        let memory = self.blocks[info.block_index].memory();

        if info.mapped {
            if let Some(ptr) = memory.mapped_ptr() {
                return Ok(ptr.as_ptr().cast());
            }
        }

        // SAFETY: The block belongs to `self.device` and is alive.
        let ptr = unsafe { memory.map(self.device, 1) }?;
        info.mapped = true;

        Ok(ptr.as_ptr().cast())
    }

    /// Unmaps the blocks that were mapped by the defragmentation.
    pub fn finish(self) {
        for info in &self.block_infos {
            if info.mapped {
                let memory = self.blocks[info.block_index].memory();

                // SAFETY: The block was mapped by `ensure_mapping`.
                unsafe { memory.unmap(self.device, 1) };
            }
        }
    }
}

/// Returns whether moving from `src_offset` in the block at `src_info_index` to `dst_offset` in
/// the block at `dst_info_index` is progress.
fn move_makes_sense(
    dst_info_index: usize,
    dst_offset: DeviceSize,
    src_info_index: usize,
    src_offset: DeviceSize,
) -> bool {
    if dst_info_index != src_info_index {
        dst_info_index < src_info_index
    } else {
        dst_offset < src_offset
    }
}
