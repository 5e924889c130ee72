// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The device-memory collaborator that the allocator is built on.

use crate::{DeviceSize, MAX_MEMORY_HEAPS, MAX_MEMORY_TYPES};
use ash::vk;
use smallvec::SmallVec;
use std::{ffi::c_void, ptr::NonNull};

/// The memory types and heaps of a physical device.
#[derive(Clone, Debug, Default)]
pub struct MemoryProperties {
    pub memory_types: SmallVec<[MemoryType; MAX_MEMORY_TYPES]>,
    pub memory_heaps: SmallVec<[MemoryHeap; MAX_MEMORY_HEAPS]>,
}

impl From<&vk::PhysicalDeviceMemoryProperties> for MemoryProperties {
    fn from(val: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let memory_types = val.memory_types[..val.memory_type_count as usize]
            .iter()
            .map(|ty| MemoryType {
                property_flags: ty.property_flags,
                heap_index: ty.heap_index,
            })
            .collect();
        let memory_heaps = val.memory_heaps[..val.memory_heap_count as usize]
            .iter()
            .map(|heap| MemoryHeap {
                size: heap.size,
                flags: heap.flags,
            })
            .collect();

        MemoryProperties {
            memory_types,
            memory_heaps,
        }
    }
}

/// A memory type of a physical device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryType {
    /// The properties of this memory type.
    pub property_flags: vk::MemoryPropertyFlags,

    /// The index of the memory heap that this memory type corresponds to.
    pub heap_index: u32,
}

/// A memory heap of a physical device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryHeap {
    /// The size of the heap in bytes.
    pub size: DeviceSize,

    /// Attributes of the heap.
    pub flags: vk::MemoryHeapFlags,
}

/// Memory requirements of a buffer or image, as reported by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Number of bytes of memory required.
    pub size: DeviceSize,

    /// Required alignment of the offset within the memory. Must be a power of two.
    pub alignment: DeviceSize,

    /// Indicates which memory types can be used. Each bit that is set to 1 means that the memory
    /// type whose index is the same as the position of the bit can be used.
    pub memory_type_bits: u32,

    /// Whether the implementation prefers to use a dedicated allocation for the resource.
    pub prefers_dedicated_allocation: bool,

    /// Whether the implementation requires the use of a dedicated allocation for the resource.
    pub requires_dedicated_allocation: bool,
}

impl MemoryRequirements {
    fn from_vk(
        val: &vk::MemoryRequirements,
        dedicated: &vk::MemoryDedicatedRequirements<'_>,
    ) -> Self {
        MemoryRequirements {
            size: val.size,
            alignment: val.alignment,
            memory_type_bits: val.memory_type_bits,
            prefers_dedicated_allocation: dedicated.prefers_dedicated_allocation != vk::FALSE,
            requires_dedicated_allocation: dedicated.requires_dedicated_allocation != vk::FALSE,
        }
    }
}

/// The capabilities of a logical device that the allocator consumes.
///
/// Implementations only forward to the corresponding Vulkan commands. The allocator takes care of
/// the external synchronization that Vulkan demands for `vkMapMemory`, `vkUnmapMemory` and the
/// `vkBind*Memory` commands on a given memory object.
///
/// # Safety
///
/// - `memory_properties` and `buffer_image_granularity` must describe the physical device that
///   the logical device was created from, and must not change over the lifetime of the object.
/// - `allocate_memory` must return a new, unique memory object of exactly `allocation_size`
///   bytes.
/// - `map_memory` must map the whole memory object and return a pointer to its first byte.
pub unsafe trait MemoryDevice: Send + Sync {
    /// Returns the memory properties of the physical device.
    fn memory_properties(&self) -> &MemoryProperties;

    /// Returns the `bufferImageGranularity` limit of the physical device.
    fn buffer_image_granularity(&self) -> DeviceSize;

    /// Allocates a new memory object of the given size from the given memory type.
    ///
    /// # Safety
    ///
    /// - `memory_type_index` must be a valid index into the device's memory types.
    unsafe fn allocate_memory(
        &self,
        allocation_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, vk::Result>;

    /// Frees a memory object.
    ///
    /// # Safety
    ///
    /// - `memory` must have been allocated from this device and must not be mapped or in use.
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    /// Maps the whole memory object into host address space.
    ///
    /// # Safety
    ///
    /// - `memory` must have been allocated from a host-visible memory type and must not already
    ///   be mapped.
    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<c_void>, vk::Result>;

    /// Unmaps a memory object.
    ///
    /// # Safety
    ///
    /// - `memory` must currently be mapped.
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    /// Binds `memory` at `offset` to `buffer`.
    ///
    /// # Safety
    ///
    /// - `buffer` must not already be bound, and the range must satisfy its requirements.
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), vk::Result>;

    /// Binds `memory` at `offset` to `image`.
    ///
    /// # Safety
    ///
    /// - `image` must not already be bound, and the range must satisfy its requirements.
    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), vk::Result>;

    /// Queries the memory requirements of `buffer`.
    ///
    /// # Safety
    ///
    /// - `buffer` must be a valid buffer created from this device.
    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> MemoryRequirements;

    /// Queries the memory requirements of `image`.
    ///
    /// # Safety
    ///
    /// - `image` must be a valid image created from this device.
    unsafe fn image_memory_requirements(&self, image: vk::Image) -> MemoryRequirements;
}

/// A [`MemoryDevice`] implemented on top of Ash.
///
/// The device must support Vulkan 1.1 or the `VK_KHR_get_memory_requirements2` and
/// `VK_KHR_dedicated_allocation` extensions, because requirements are queried through
/// `vkGet*MemoryRequirements2`.
pub struct AshMemoryDevice {
    device: ash::Device,
    memory_properties: MemoryProperties,
    buffer_image_granularity: DeviceSize,
}

impl AshMemoryDevice {
    /// Creates a new `AshMemoryDevice` for `device`, which must have been created from
    /// `physical_device` using `instance`.
    ///
    /// # Safety
    ///
    /// - `physical_device` must be a valid handle obtained from `instance`.
    /// - `device` must have been created from `physical_device`.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        AshMemoryDevice {
            device,
            memory_properties: MemoryProperties::from(&memory_properties),
            buffer_image_granularity: properties.limits.buffer_image_granularity,
        }
    }

    /// Returns the wrapped Ash device.
    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }
}

unsafe impl MemoryDevice for AshMemoryDevice {
    #[inline]
    fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    #[inline]
    fn buffer_image_granularity(&self) -> DeviceSize {
        self.buffer_image_granularity
    }

    unsafe fn allocate_memory(
        &self,
        allocation_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(allocation_size)
            .memory_type_index(memory_type_index);

        unsafe { self.device.allocate_memory(&allocate_info, None) }
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<c_void>, vk::Result> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }?;

        NonNull::new(ptr).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) };
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), vk::Result> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), vk::Result> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> MemoryRequirements {
        let info = vk::BufferMemoryRequirementsInfo2::default().buffer(buffer);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::default().push_next(&mut dedicated);

        unsafe {
            self.device
                .get_buffer_memory_requirements2(&info, &mut requirements)
        };
        let memory_requirements = requirements.memory_requirements;

        MemoryRequirements::from_vk(&memory_requirements, &dedicated)
    }

    unsafe fn image_memory_requirements(&self, image: vk::Image) -> MemoryRequirements {
        let info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::default().push_next(&mut dedicated);

        unsafe {
            self.device
                .get_image_memory_requirements2(&info, &mut requirements)
        };
        let memory_requirements = requirements.memory_requirements;

        MemoryRequirements::from_vk(&memory_requirements, &dedicated)
    }
}
