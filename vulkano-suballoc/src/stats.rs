// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{DeviceSize, MAX_MEMORY_HEAPS, MAX_MEMORY_TYPES};
use smallvec::SmallVec;
use std::cmp;

/// Statistics of memory usage for a set of blocks.
///
/// The `*_min` fields are [`DeviceSize::MAX`] when there was nothing to take the minimum of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StatInfo {
    /// Number of device memory objects.
    pub block_count: u32,

    /// Number of allocations.
    pub allocation_count: u32,

    /// Number of free ranges of memory between allocations.
    pub unused_range_count: u32,

    /// Total number of bytes occupied by all allocations.
    pub used_bytes: DeviceSize,

    /// Total number of bytes occupied by unused ranges.
    pub unused_bytes: DeviceSize,

    pub allocation_size_min: DeviceSize,
    pub allocation_size_avg: DeviceSize,
    pub allocation_size_max: DeviceSize,
    pub unused_range_size_min: DeviceSize,
    pub unused_range_size_avg: DeviceSize,
    pub unused_range_size_max: DeviceSize,
}

impl StatInfo {
    /// Returns statistics of nothing.
    pub const fn new() -> Self {
        StatInfo {
            block_count: 0,
            allocation_count: 0,
            unused_range_count: 0,
            used_bytes: 0,
            unused_bytes: 0,
            allocation_size_min: DeviceSize::MAX,
            allocation_size_avg: 0,
            allocation_size_max: 0,
            unused_range_size_min: DeviceSize::MAX,
            unused_range_size_avg: 0,
            unused_range_size_max: 0,
        }
    }

    /// Adds `other` to `self`. The averages are not updated; call [`postprocess`] afterward.
    ///
    /// [`postprocess`]: Self::postprocess
    pub(crate) fn add(&mut self, other: &StatInfo) {
        self.block_count += other.block_count;
        self.allocation_count += other.allocation_count;
        self.unused_range_count += other.unused_range_count;
        self.used_bytes += other.used_bytes;
        self.unused_bytes += other.unused_bytes;
        self.allocation_size_min = cmp::min(self.allocation_size_min, other.allocation_size_min);
        self.allocation_size_max = cmp::max(self.allocation_size_max, other.allocation_size_max);
        self.unused_range_size_min =
            cmp::min(self.unused_range_size_min, other.unused_range_size_min);
        self.unused_range_size_max =
            cmp::max(self.unused_range_size_max, other.unused_range_size_max);
    }

    /// Computes the averages from the sums and counts.
    pub(crate) fn postprocess(&mut self) {
        self.allocation_size_avg = round_div(self.used_bytes, self.allocation_count);
        self.unused_range_size_avg = round_div(self.unused_bytes, self.unused_range_count);
    }
}

impl Default for StatInfo {
    #[inline]
    fn default() -> Self {
        StatInfo::new()
    }
}

fn round_div(x: DeviceSize, y: u32) -> DeviceSize {
    if y == 0 {
        0
    } else {
        let y = DeviceSize::from(y);

        (x + y / 2) / y
    }
}

/// General statistics from the current state of an allocator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Stats {
    /// Statistics per memory type.
    pub memory_type: SmallVec<[StatInfo; MAX_MEMORY_TYPES]>,

    /// Statistics per memory heap.
    pub memory_heap: SmallVec<[StatInfo; MAX_MEMORY_HEAPS]>,

    /// Statistics over everything.
    pub total: StatInfo,
}

impl Stats {
    pub(crate) fn new(memory_type_count: usize, memory_heap_count: usize) -> Self {
        Stats {
            memory_type: SmallVec::from_elem(StatInfo::new(), memory_type_count),
            memory_heap: SmallVec::from_elem(StatInfo::new(), memory_heap_count),
            total: StatInfo::new(),
        }
    }

    /// Adds `info` to the total and to the given memory type and heap.
    pub(crate) fn add(&mut self, memory_type_index: u32, heap_index: u32, info: &StatInfo) {
        self.total.add(info);
        self.memory_type[memory_type_index as usize].add(info);
        self.memory_heap[heap_index as usize].add(info);
    }

    pub(crate) fn postprocess(&mut self) {
        self.total.postprocess();
        self.memory_type.iter_mut().for_each(StatInfo::postprocess);
        self.memory_heap.iter_mut().for_each(StatInfo::postprocess);
    }
}

/// Statistics of a [`Pool`].
///
/// [`Pool`]: crate::Pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolStats {
    /// Total number of bytes in the pool.
    pub size: DeviceSize,

    /// Total number of bytes in the pool not used by any allocation.
    pub unused_size: DeviceSize,

    /// Number of allocations in the pool.
    pub allocation_count: usize,

    /// Number of continuous memory ranges in the pool not used by any allocation.
    pub unused_range_count: usize,

    /// Size of the largest continuous free memory region.
    pub unused_range_size_max: DeviceSize,

    /// Number of blocks in the pool.
    pub block_count: usize,
}
