// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    allocation::MappedPtr,
    allocator::{AllocationError, Allocator},
    device::MemoryDevice,
    layout::DeviceAlignment,
    metadata::{BlockMetadata, ValidationError},
    DeviceSize,
};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// One `VkDeviceMemory` object that is suballocated.
///
/// Allocations inside the block hold on to this through an `Arc`, so that they can map the
/// memory and bind resources to it without going through the block vector.
#[derive(Debug)]
pub(crate) struct BlockMemory {
    handle: vk::DeviceMemory,
    memory_type_index: u32,
    size: DeviceSize,
    // Vulkan requires mapping, unmapping and binding of a memory object to be externally
    // synchronized.
    mapping: Mutex<Mapping>,
}

#[derive(Debug, Default)]
struct Mapping {
    count: u32,
    ptr: Option<MappedPtr>,
}

impl BlockMemory {
    pub fn new(handle: vk::DeviceMemory, memory_type_index: u32, size: DeviceSize) -> Self {
        BlockMemory {
            handle,
            memory_type_index,
            size,
            mapping: Mutex::new(Mapping::default()),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::DeviceMemory {
        self.handle
    }

    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the pointer to the start of the block if it is currently mapped.
    pub fn mapped_ptr(&self) -> Option<MappedPtr> {
        self.mapping.lock().ptr
    }

    /// Adds `count` references to the mapping of the block, mapping it if it wasn't already.
    /// Returns the pointer to the start of the block.
    ///
    /// # Safety
    ///
    /// - `device` must be the device that the memory was allocated from.
    /// - The memory must not have been freed.
    pub unsafe fn map(
        &self,
        device: &impl MemoryDevice,
        count: u32,
    ) -> Result<MappedPtr, vk::Result> {
        debug_assert!(count > 0);

        let mut mapping = self.mapping.lock();

        match mapping.ptr {
            Some(ptr) => {
                mapping.count += count;

                Ok(ptr)
            }
            None => {
                let ptr = MappedPtr::new(unsafe { device.map_memory(self.handle) }?);
                mapping.count = count;
                mapping.ptr = Some(ptr);

                Ok(ptr)
            }
        }
    }

    /// Removes `count` references to the mapping of the block, unmapping it once none are left.
    ///
    /// # Safety
    ///
    /// - `device` must be the device that the memory was allocated from.
    /// - The memory must not have been freed.
    pub unsafe fn unmap(&self, device: &impl MemoryDevice, count: u32) {
        if count == 0 {
            return;
        }

        let mut mapping = self.mapping.lock();

        debug_assert!(
            mapping.count >= count,
            "device memory block is being unmapped while it was not previously mapped",
        );

        if mapping.count >= count {
            mapping.count -= count;

            if mapping.count == 0 {
                mapping.ptr = None;
                unsafe { device.unmap_memory(self.handle) };
            }
        } else {
            log::warn!(
                "unmapping block {:?} {} times while it is mapped {} times",
                self.handle,
                count,
                mapping.count,
            );
        }
    }

    /// # Safety
    ///
    /// - `device` must be the device that the memory was allocated from.
    /// - The memory must not have been freed.
    /// - The range starting at `offset` must be owned by the caller and satisfy the requirements
    ///   of `buffer`.
    pub unsafe fn bind_buffer_memory(
        &self,
        device: &impl MemoryDevice,
        buffer: vk::Buffer,
        offset: DeviceSize,
    ) -> Result<(), vk::Result> {
        let _mapping = self.mapping.lock();

        unsafe { device.bind_buffer_memory(buffer, self.handle, offset) }
    }

    /// # Safety
    ///
    /// - `device` must be the device that the memory was allocated from.
    /// - The memory must not have been freed.
    /// - The range starting at `offset` must be owned by the caller and satisfy the requirements
    ///   of `image`.
    pub unsafe fn bind_image_memory(
        &self,
        device: &impl MemoryDevice,
        image: vk::Image,
        offset: DeviceSize,
    ) -> Result<(), vk::Result> {
        let _mapping = self.mapping.lock();

        unsafe { device.bind_image_memory(image, self.handle, offset) }
    }

    /// Creates a block that doesn't correspond to any device memory, for tests that only exercise
    /// the bookkeeping.
    #[cfg(test)]
    pub fn dummy(size: DeviceSize) -> Arc<Self> {
        Arc::new(BlockMemory::new(vk::DeviceMemory::null(), 0, size))
    }
}

/// A block of device memory together with the bookkeeping of its suballocations.
///
/// Blocks are owned by a [`BlockVector`], which is the only thing that modifies the metadata.
///
/// [`BlockVector`]: crate::block_vector::BlockVector
#[derive(Debug)]
pub(crate) struct MemoryBlock {
    metadata: BlockMetadata,
    memory: Arc<BlockMemory>,
}

impl MemoryBlock {
    /// Allocates a new block of `size` bytes from the given memory type.
    pub fn new<D: MemoryDevice>(
        allocator: &Allocator<D>,
        memory_type_index: u32,
        size: DeviceSize,
        buffer_image_granularity: DeviceAlignment,
    ) -> Result<Self, AllocationError> {
        let handle = allocator.allocate_device_memory(size, memory_type_index)?;

        Ok(MemoryBlock {
            metadata: BlockMetadata::new(
                size,
                buffer_image_granularity,
                allocator.debug_margin(),
                allocator.debug_alignment(),
            ),
            memory: Arc::new(BlockMemory::new(handle, memory_type_index, size)),
        })
    }

    #[inline]
    pub fn metadata(&self) -> &BlockMetadata {
        &self.metadata
    }

    #[inline]
    pub fn metadata_mut(&mut self) -> &mut BlockMetadata {
        &mut self.metadata
    }

    #[inline]
    pub fn memory(&self) -> &Arc<BlockMemory> {
        &self.memory
    }

    /// Returns whether `memory` is the memory of this block.
    #[inline]
    pub fn owns(&self, memory: &Arc<BlockMemory>) -> bool {
        Arc::ptr_eq(&self.memory, memory)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.memory.size() != self.metadata.size() {
            return Err(ValidationError::SizeMismatch);
        }

        self.metadata.validate()
    }

    /// Frees the device memory of the block.
    pub fn destroy<D: MemoryDevice>(self, allocator: &Allocator<D>) {
        if !self.metadata.is_empty() {
            log::warn!(
                "freeing device memory block {:?} that still holds {} allocations",
                self.memory.handle(),
                self.metadata.allocation_count(),
            );
        }

        // SAFETY: The block vector gave up the block, and allocations that still refer to the
        // memory are either lost or leaked by the user.
        unsafe {
            allocator.free_device_memory(
                self.memory.memory_type_index(),
                self.memory.handle(),
                self.memory.size(),
            )
        };
    }
}
