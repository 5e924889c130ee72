// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The entry point of the crate.
//!
//! An [`Allocator`] owns one default [`BlockVector`] per memory type, the custom [`Pool`]s that
//! were created from it, and the dedicated allocations. Every allocation goes through
//! [`Allocator::allocate_memory`], which validates the request, picks a memory type, and then
//! decides between suballocating from a block and giving the allocation its own memory object.
//!
//! [`BlockVector`]: crate::block_vector::BlockVector

use crate::{
    allocation::{
        Allocation, AllocationInfo, AllocationType, MappedPtr, UserData, FRAME_INDEX_LOST,
    },
    block_vector::{
        BlockAllocateInfo, BlockVector, BlockVectorCreateInfo, Pool, PoolCreateFlags,
        PoolCreateInfo,
    },
    defragment::{DefragmentationBudget, DefragmentationInfo, DefragmentationOutcome},
    device::{MemoryDevice, MemoryProperties, MemoryRequirements},
    layout::{DeviceAlignment, DeviceLayout},
    metadata::ValidationError,
    stats::{PoolStats, StatInfo, Stats},
    DeviceSize, NonExhaustive, G, M, MAX_MEMORY_HEAPS,
};
use ash::vk;
use bitflags::bitflags;
use foldhash::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    cmp,
    error::Error,
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    mem,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

/// Heaps at most this large are considered small, and get blocks of an eighth of their size.
const SMALL_HEAP_MAX_SIZE: DeviceSize = G;

/// The default value of [`AllocatorCreateInfo::preferred_large_heap_block_size`].
const DEFAULT_LARGE_HEAP_BLOCK_SIZE: DeviceSize = 256 * M;

bitflags! {
    /// Flags that can be passed when allocating memory.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocationCreateFlags: u32 {
        /// The allocation gets its own device memory object.
        ///
        /// This can't be combined with [`NEVER_ALLOCATE`] or with a custom pool.
        ///
        /// [`NEVER_ALLOCATE`]: Self::NEVER_ALLOCATE
        const DEDICATED_MEMORY = 1 << 0;

        /// No new device memory object is ever created for the allocation. If it doesn't fit
        /// into an existing block, the allocation fails.
        const NEVER_ALLOCATE = 1 << 1;

        /// The allocation is persistently mapped for as long as it lives. Ignored for memory
        /// types that aren't host-visible.
        ///
        /// This can't be combined with [`CAN_BECOME_LOST`].
        ///
        /// [`CAN_BECOME_LOST`]: Self::CAN_BECOME_LOST
        const MAPPED = 1 << 2;

        /// The allocation may be made lost by another allocation that is created with
        /// [`CAN_MAKE_OTHER_LOST`], once it hasn't been used for more than the frames-in-use
        /// window.
        ///
        /// [`CAN_MAKE_OTHER_LOST`]: Self::CAN_MAKE_OTHER_LOST
        const CAN_BECOME_LOST = 1 << 3;

        /// The allocation may make other allocations lost when there is no space otherwise.
        const CAN_MAKE_OTHER_LOST = 1 << 4;

        /// The user data of the allocation is a string, which is copied into the allocation.
        const USER_DATA_COPY_STRING = 1 << 5;
    }
}

/// Describes what memory is going to be used for, which is translated into memory property flags
/// when choosing a memory type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// No intended usage. Only the required and preferred flags are used.
    #[default]
    Unknown,

    /// Memory that is only accessed by the device, such as images and vertex buffers that are
    /// uploaded once. Prefers device-local memory.
    GpuOnly,

    /// Memory that is accessed by the host, such as staging buffers. Requires host-visible and
    /// host-coherent memory.
    CpuOnly,

    /// Memory that is written by the host every frame and read by the device. Requires
    /// host-visible memory, and prefers device-local memory.
    CpuToGpu,

    /// Memory that is written by the device and read back by the host. Requires host-visible
    /// memory, and prefers host-coherent and host-cached memory.
    GpuToCpu,
}

/// Parameters to create a new [`Allocator`].
#[derive(Clone, Debug)]
pub struct AllocatorCreateInfo {
    /// The size of the blocks of memory types in heaps that are larger than 1 GiB.
    ///
    /// Memory types in smaller heaps use blocks of an eighth of the heap size.
    ///
    /// The default value is 256 MiB.
    pub preferred_large_heap_block_size: DeviceSize,

    /// How many frames an allocation is protected from being made lost after it was last used.
    ///
    /// The default value is `0`.
    pub frame_in_use_count: u32,

    /// For each memory heap, the maximum number of bytes that may be allocated from it. `None`
    /// or a missing entry means no limit.
    ///
    /// The default value is empty.
    pub heap_size_limits: Vec<Option<DeviceSize>>,

    /// Functions that are informed about every device memory allocation and free.
    ///
    /// The default value is no callbacks.
    pub device_memory_callbacks: DeviceMemoryCallbacks,

    /// Whether one empty block is kept around in each block vector, so that a new block doesn't
    /// have to be allocated right after the last allocation of a block was freed.
    ///
    /// The default value is `true`.
    pub retain_empty_block: bool,

    /// The number of bytes left free between suballocations.
    ///
    /// The default value is `0`.
    pub debug_margin: DeviceSize,

    /// The minimum alignment of all suballocations.
    ///
    /// The default value is [`DeviceAlignment::MIN`].
    pub debug_alignment: DeviceAlignment,

    pub _ne: NonExhaustive,
}

impl Default for AllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        AllocatorCreateInfo {
            preferred_large_heap_block_size: DEFAULT_LARGE_HEAP_BLOCK_SIZE,
            frame_in_use_count: 0,
            heap_size_limits: Vec::new(),
            device_memory_callbacks: DeviceMemoryCallbacks::default(),
            retain_empty_block: true,
            debug_margin: 0,
            debug_alignment: DeviceAlignment::MIN,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// A function that is informed about a device memory allocation or free, with the memory type
/// index, the memory object and its size.
pub type DeviceMemoryCallback = Arc<dyn Fn(u32, vk::DeviceMemory, DeviceSize) + Send + Sync>;

/// Functions that are informed about device memory allocations, for example to keep statistics.
#[derive(Clone, Default)]
pub struct DeviceMemoryCallbacks {
    /// Called after a device memory object was successfully allocated.
    pub allocate: Option<DeviceMemoryCallback>,

    /// Called before a device memory object is freed.
    pub free: Option<DeviceMemoryCallback>,
}

impl Debug for DeviceMemoryCallbacks {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("DeviceMemoryCallbacks")
            .field("allocate", &self.allocate.is_some())
            .field("free", &self.free.is_some())
            .finish()
    }
}

/// Parameters of an allocation.
#[derive(Clone, Debug)]
pub struct AllocationCreateInfo {
    /// The default value is empty.
    pub flags: AllocationCreateFlags,

    /// The intended usage of the memory. Ignored when allocating from a pool.
    ///
    /// The default value is [`MemoryUsage::Unknown`].
    pub usage: MemoryUsage,

    /// Memory property flags that the memory type must have. Ignored when allocating from a pool.
    ///
    /// The default value is empty.
    pub required_flags: vk::MemoryPropertyFlags,

    /// Memory property flags that the memory type should have. Ignored when allocating from a
    /// pool.
    ///
    /// The default value is empty.
    pub preferred_flags: vk::MemoryPropertyFlags,

    /// The memory types that may be used, in addition to those allowed by the memory
    /// requirements. `0` means all memory types.
    ///
    /// The default value is `0`.
    pub memory_type_bits: u32,

    /// The custom pool to allocate from, instead of the default block vectors.
    ///
    /// The default value is `None`.
    pub pool: Option<Pool>,

    /// The default value is [`UserData::None`].
    pub user_data: UserData,

    pub _ne: NonExhaustive,
}

impl Default for AllocationCreateInfo {
    #[inline]
    fn default() -> Self {
        AllocationCreateInfo {
            flags: AllocationCreateFlags::empty(),
            usage: MemoryUsage::Unknown,
            required_flags: vk::MemoryPropertyFlags::empty(),
            preferred_flags: vk::MemoryPropertyFlags::empty(),
            memory_type_bits: 0,
            pool: None,
            user_data: UserData::None,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// Suballocates device memory.
///
/// All operations take `&self`, so the allocator can be shared between threads. Allocations are
/// not freed automatically: every [`Allocation`] must be given back with [`free_memory`], and
/// whatever is still allocated when the allocator is dropped is freed with a warning.
///
/// [`free_memory`]: Self::free_memory
pub struct Allocator<D: MemoryDevice> {
    device: D,
    // The memory properties of the device, with heap sizes reduced to the heap size limits.
    memory_properties: MemoryProperties,
    buffer_image_granularity: DeviceAlignment,
    frame_in_use_count: u32,
    retain_empty_block: bool,
    debug_margin: DeviceSize,
    debug_alignment: DeviceAlignment,
    current_frame_index: AtomicU32,
    // One per memory type.
    block_vectors: Vec<BlockVector>,
    // One per memory type.
    dedicated_allocations: Vec<Mutex<Vec<Arc<Allocation>>>>,
    pools: Mutex<Vec<Pool>>,
    // The number of bytes that may still be allocated from each heap, if limited.
    heap_budgets: SmallVec<[Option<Mutex<DeviceSize>>; MAX_MEMORY_HEAPS]>,
    device_memory_callbacks: DeviceMemoryCallbacks,
}

impl<D: MemoryDevice> Allocator<D> {
    /// Creates a new `Allocator`.
    pub fn new(device: D, create_info: AllocatorCreateInfo) -> Self {
        let AllocatorCreateInfo {
            preferred_large_heap_block_size,
            frame_in_use_count,
            heap_size_limits,
            device_memory_callbacks,
            retain_empty_block,
            debug_margin,
            debug_alignment,
            _ne: _,
        } = create_info;

        let mut memory_properties = device.memory_properties().clone();
        let mut heap_budgets = SmallVec::new();

        for (heap_index, heap) in memory_properties.memory_heaps.iter_mut().enumerate() {
            let limit = heap_size_limits.get(heap_index).copied().flatten();

            if let Some(limit) = limit {
                heap.size = cmp::min(heap.size, limit);
            }

            heap_budgets.push(limit.map(Mutex::new));
        }

        // Vulkan guarantees that this is a power of two.
        let buffer_image_granularity =
            DeviceAlignment::new(device.buffer_image_granularity()).unwrap_or(DeviceAlignment::MIN);

        let block_vectors = memory_properties
            .memory_types
            .iter()
            .enumerate()
            .map(|(memory_type_index, memory_type)| {
                let heap_size = memory_properties.memory_heaps[memory_type.heap_index as usize].size;
                let preferred_block_size = if heap_size <= SMALL_HEAP_MAX_SIZE {
                    cmp::max(heap_size / 8, 1)
                } else {
                    preferred_large_heap_block_size
                };

                BlockVector::new(BlockVectorCreateInfo {
                    memory_type_index: memory_type_index as u32,
                    preferred_block_size,
                    min_block_count: 0,
                    max_block_count: usize::MAX,
                    buffer_image_granularity,
                    frame_in_use_count,
                    is_custom_pool: false,
                    retain_empty_block,
                })
            })
            .collect();

        let dedicated_allocations = memory_properties
            .memory_types
            .iter()
            .map(|_| Mutex::new(Vec::new()))
            .collect();

        Allocator {
            device,
            memory_properties,
            buffer_image_granularity,
            frame_in_use_count,
            retain_empty_block,
            debug_margin,
            debug_alignment,
            current_frame_index: AtomicU32::new(0),
            block_vectors,
            dedicated_allocations,
            pools: Mutex::new(Vec::new()),
            heap_budgets,
            device_memory_callbacks,
        }
    }

    /// Returns the device that the allocator allocates from.
    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Returns the memory properties of the device, with the heap sizes reduced to the heap size
    /// limits.
    #[inline]
    pub fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    #[inline]
    pub(crate) fn debug_margin(&self) -> DeviceSize {
        self.debug_margin
    }

    #[inline]
    pub(crate) fn debug_alignment(&self) -> DeviceAlignment {
        self.debug_alignment
    }

    /// Returns the index of the current frame.
    #[inline]
    pub fn current_frame_index(&self) -> u32 {
        self.current_frame_index.load(Ordering::Acquire)
    }

    /// Sets the index of the current frame, which is used to decide which allocations may be
    /// made lost.
    ///
    /// `u32::MAX` is reserved and ignored.
    pub fn set_current_frame_index(&self, frame_index: u32) {
        if frame_index == FRAME_INDEX_LOST {
            log::warn!("ignoring reserved frame index {}", frame_index);

            return;
        }

        self.current_frame_index
            .store(frame_index, Ordering::Release);
    }

    fn heap_index(&self, memory_type_index: u32) -> u32 {
        self.memory_properties.memory_types[memory_type_index as usize].heap_index
    }

    /// Allocates a device memory object, respecting the heap size limits and informing the
    /// callbacks.
    pub(crate) fn allocate_device_memory(
        &self,
        size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, AllocationError> {
        let heap_index = self.heap_index(memory_type_index) as usize;

        let memory = match &self.heap_budgets[heap_index] {
            Some(budget) => {
                let mut budget = budget.lock();

                if size > *budget {
                    return Err(AllocationError::OutOfDeviceMemory);
                }

                // SAFETY: The memory type index is valid for the device.
                let memory = unsafe { self.device.allocate_memory(size, memory_type_index) }?;
                *budget -= size;

                memory
            }
            // SAFETY: The memory type index is valid for the device.
            None => unsafe { self.device.allocate_memory(size, memory_type_index) }?,
        };

        if let Some(callback) = &self.device_memory_callbacks.allocate {
            callback(memory_type_index, memory, size);
        }

        Ok(memory)
    }

    /// Frees a device memory object that was allocated with [`allocate_device_memory`].
    ///
    /// # Safety
    ///
    /// - `memory` must have been allocated with `size` and `memory_type_index` by this allocator.
    /// - `memory` must not be in use.
    ///
    /// [`allocate_device_memory`]: Self::allocate_device_memory
    pub(crate) unsafe fn free_device_memory(
        &self,
        memory_type_index: u32,
        memory: vk::DeviceMemory,
        size: DeviceSize,
    ) {
        if let Some(callback) = &self.device_memory_callbacks.free {
            callback(memory_type_index, memory, size);
        }

        unsafe { self.device.free_memory(memory) };

        let heap_index = self.heap_index(memory_type_index) as usize;

        if let Some(budget) = &self.heap_budgets[heap_index] {
            *budget.lock() += size;
        }
    }

    /// Returns the memory type that fits `memory_type_bits` and the parameters of `create_info`
    /// best.
    ///
    /// A memory type fits if it is in `memory_type_bits` and
    /// [`AllocationCreateInfo::memory_type_bits`], and has all required flags. Among those, the
    /// one that has the most preferred flags wins.
    pub fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        create_info: &AllocationCreateInfo,
    ) -> Result<u32, AllocationError> {
        let mut memory_type_bits = memory_type_bits;

        if create_info.memory_type_bits != 0 {
            memory_type_bits &= create_info.memory_type_bits;
        }

        let mut required_flags = create_info.required_flags;
        let mut preferred_flags = create_info.preferred_flags;

        match create_info.usage {
            MemoryUsage::Unknown => {}
            MemoryUsage::GpuOnly => {
                preferred_flags |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
            }
            MemoryUsage::CpuOnly => {
                required_flags |=
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
            }
            MemoryUsage::CpuToGpu => {
                required_flags |= vk::MemoryPropertyFlags::HOST_VISIBLE;
                preferred_flags |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
            }
            MemoryUsage::GpuToCpu => {
                required_flags |= vk::MemoryPropertyFlags::HOST_VISIBLE;
                preferred_flags |=
                    vk::MemoryPropertyFlags::HOST_COHERENT | vk::MemoryPropertyFlags::HOST_CACHED;
            }
        }

        self.memory_properties
            .memory_types
            .iter()
            .map(|memory_type| memory_type.property_flags)
            .enumerate()
            // Filter out memory types which are supported by the memory type bits and have the
            // required flags set.
            .filter(|&(index, flags)| {
                index < u32::BITS as usize
                    && memory_type_bits & (1 << index) != 0
                    && flags.contains(required_flags)
            })
            // Rank memory types with more of the preferred flags higher.
            .min_by_key(|&(_, flags)| (preferred_flags & !flags).as_raw().count_ones())
            .map(|(index, _)| index as u32)
            .ok_or(AllocationError::NoSuitableMemoryType)
    }

    /// Allocates memory for a resource with the given requirements.
    pub fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        create_info: &AllocationCreateInfo,
        allocation_type: AllocationType,
    ) -> Result<Arc<Allocation>, AllocationError> {
        validate_create_info(requirements, create_info)?;

        let layout = DeviceLayout::from_size_alignment(requirements.size, requirements.alignment)
            .ok_or(InvalidUsage::InvalidLayout)?;

        if let Some(pool) = &create_info.pool {
            if layout.size() > pool.block_size() {
                return Err(InvalidUsage::SizeExceedsPoolBlockSize.into());
            }

            return pool.block_vector().allocate(
                self,
                BlockAllocateInfo {
                    layout,
                    allocation_type,
                    flags: create_info.flags,
                    pool: Some(pool),
                    current_frame_index: self.current_frame_index(),
                    user_data: create_info.user_data.clone(),
                },
            );
        }

        let mut memory_type_bits = requirements.memory_type_bits;
        let mut memory_type_index = self.find_memory_type_index(memory_type_bits, create_info)?;

        loop {
            let res = self.allocate_memory_of_type(
                requirements,
                layout,
                create_info,
                memory_type_index,
                allocation_type,
            );

            match res {
                Ok(allocation) => return Ok(allocation),
                // Try a different memory type.
                Err(err) => {
                    log::debug!(
                        "allocation of {} bytes from memory type {} failed: {}",
                        layout.size(),
                        memory_type_index,
                        err,
                    );

                    memory_type_bits &= !(1 << memory_type_index);
                    memory_type_index = self
                        .find_memory_type_index(memory_type_bits, create_info)
                        .map_err(|_| err)?;
                }
            }
        }
    }

    fn allocate_memory_of_type(
        &self,
        requirements: &MemoryRequirements,
        layout: DeviceLayout,
        create_info: &AllocationCreateInfo,
        memory_type_index: u32,
        allocation_type: AllocationType,
    ) -> Result<Arc<Allocation>, AllocationError> {
        let memory_type = &self.memory_properties.memory_types[memory_type_index as usize];
        let block_vector = &self.block_vectors[memory_type_index as usize];
        let mut flags = create_info.flags;

        if !memory_type
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            flags.remove(AllocationCreateFlags::MAPPED);
        }

        let never_allocate = flags.intersects(AllocationCreateFlags::NEVER_ALLOCATE);
        let prefers_dedicated = flags.intersects(AllocationCreateFlags::DEDICATED_MEMORY)
            || requirements.requires_dedicated_allocation
            || requirements.prefers_dedicated_allocation
            || layout.size() > block_vector.preferred_block_size() / 2;

        if prefers_dedicated && !never_allocate {
            return self.allocate_dedicated(
                layout,
                memory_type_index,
                flags,
                allocation_type,
                create_info.user_data.clone(),
            );
        }

        let res = block_vector.allocate(
            self,
            BlockAllocateInfo {
                layout,
                allocation_type,
                flags,
                pool: None,
                current_frame_index: self.current_frame_index(),
                user_data: create_info.user_data.clone(),
            },
        );

        match res {
            Ok(allocation) => Ok(allocation),
            Err(err) if never_allocate => Err(err),
            // Fall back to dedicated allocation. The block size that was tried may have been
            // smaller than the preferred one, so there's hope.
            Err(_) => self.allocate_dedicated(
                layout,
                memory_type_index,
                flags,
                allocation_type,
                create_info.user_data.clone(),
            ),
        }
    }

    fn allocate_dedicated(
        &self,
        layout: DeviceLayout,
        memory_type_index: u32,
        flags: AllocationCreateFlags,
        allocation_type: AllocationType,
        user_data: UserData,
    ) -> Result<Arc<Allocation>, AllocationError> {
        let size = layout.size();
        let memory = self.allocate_device_memory(size, memory_type_index)?;

        let mapped_ptr = if flags.intersects(AllocationCreateFlags::MAPPED) {
            // SAFETY: The memory was just allocated.
            match unsafe { self.device.map_memory(memory) } {
                Ok(ptr) => Some(MappedPtr::new(ptr)),
                Err(err) => {
                    // SAFETY: The memory was just allocated and isn't used by anything.
                    unsafe { self.free_device_memory(memory_type_index, memory, size) };

                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let allocation = Allocation::new_dedicated(
            memory,
            memory_type_index,
            layout,
            allocation_type,
            mapped_ptr,
            flags,
            self.current_frame_index(),
            user_data,
        );

        self.dedicated_allocations[memory_type_index as usize]
            .lock()
            .push(allocation.clone());

        log::debug!(
            "created dedicated allocation of {} bytes in memory type {}",
            size,
            memory_type_index,
        );

        Ok(allocation)
    }

    fn free_dedicated(&self, allocation: &Arc<Allocation>) {
        let (Some((memory, mapped_ptr)), Some(memory_type_index)) =
            (allocation.dedicated_memory(), allocation.memory_type_index())
        else {
            return;
        };

        {
            let mut dedicated_allocations =
                self.dedicated_allocations[memory_type_index as usize].lock();

            let Some(index) = dedicated_allocations
                .iter()
                .position(|other| Arc::ptr_eq(other, allocation))
            else {
                log::warn!("freeing dedicated allocation {:?} twice", memory);

                return;
            };

            dedicated_allocations.swap_remove(index);
        }

        if mapped_ptr.is_some() {
            // SAFETY: The memory is mapped, and the allocation was removed, so nothing else can
            // map or unmap it anymore.
            unsafe { self.device.unmap_memory(memory) };
        }

        // SAFETY: The caller of `free_memory` guarantees that the memory isn't in use.
        unsafe { self.free_device_memory(memory_type_index, memory, allocation.size()) };

        log::debug!(
            "freed dedicated allocation of {} bytes in memory type {}",
            allocation.size(),
            memory_type_index,
        );
    }

    /// Allocates memory for `buffer`, after querying its memory requirements.
    ///
    /// # Safety
    ///
    /// - `buffer` must be a valid buffer created from the device of the allocator.
    pub unsafe fn allocate_memory_for_buffer(
        &self,
        buffer: vk::Buffer,
        create_info: &AllocationCreateInfo,
    ) -> Result<Arc<Allocation>, AllocationError> {
        let requirements = unsafe { self.device.buffer_memory_requirements(buffer) };

        self.allocate_memory(&requirements, create_info, AllocationType::Buffer)
    }

    /// Allocates memory for `image`, after querying its memory requirements.
    ///
    /// # Safety
    ///
    /// - `image` must be a valid image created from the device of the allocator with `tiling`.
    pub unsafe fn allocate_memory_for_image(
        &self,
        image: vk::Image,
        tiling: vk::ImageTiling,
        create_info: &AllocationCreateInfo,
    ) -> Result<Arc<Allocation>, AllocationError> {
        let requirements = unsafe { self.device.image_memory_requirements(image) };
        let allocation_type = match tiling {
            vk::ImageTiling::OPTIMAL => AllocationType::ImageOptimal,
            vk::ImageTiling::LINEAR => AllocationType::ImageLinear,
            _ => AllocationType::ImageUnknown,
        };

        self.allocate_memory(&requirements, create_info, allocation_type)
    }

    /// Binds `buffer` to the memory of `allocation`.
    ///
    /// # Safety
    ///
    /// - `allocation` must have been allocated from this allocator and not freed.
    /// - `buffer` must be a valid buffer created from the device of the allocator, that isn't
    ///   bound yet and whose requirements the allocation satisfies.
    pub unsafe fn bind_buffer_memory(
        &self,
        allocation: &Allocation,
        buffer: vk::Buffer,
    ) -> Result<(), AllocationError> {
        if allocation.is_lost() {
            return Err(InvalidUsage::AllocationLost.into());
        }

        match allocation.block() {
            Some(block) => unsafe {
                block.bind_buffer_memory(&self.device, buffer, allocation.offset())
            }?,
            None => unsafe {
                self.device
                    .bind_buffer_memory(buffer, allocation.device_memory(), 0)
            }?,
        }

        Ok(())
    }

    /// Binds `image` to the memory of `allocation`.
    ///
    /// # Safety
    ///
    /// - `allocation` must have been allocated from this allocator and not freed.
    /// - `image` must be a valid image created from the device of the allocator, that isn't bound
    ///   yet and whose requirements the allocation satisfies.
    pub unsafe fn bind_image_memory(
        &self,
        allocation: &Allocation,
        image: vk::Image,
    ) -> Result<(), AllocationError> {
        if allocation.is_lost() {
            return Err(InvalidUsage::AllocationLost.into());
        }

        match allocation.block() {
            Some(block) => unsafe {
                block.bind_image_memory(&self.device, image, allocation.offset())
            }?,
            None => unsafe {
                self.device
                    .bind_image_memory(image, allocation.device_memory(), 0)
            }?,
        }

        Ok(())
    }

    /// Frees `allocation`.
    ///
    /// Freeing an allocation that became lost only releases the handle.
    ///
    /// # Safety
    ///
    /// - `allocation` must have been allocated from this allocator.
    /// - The memory of `allocation` must not be in use by the device.
    pub unsafe fn free_memory(&self, allocation: &Arc<Allocation>) {
        if allocation.is_lost() {
            return;
        }

        if allocation.is_dedicated() {
            self.free_dedicated(allocation);
        } else if let Some(pool) = allocation.pool() {
            pool.block_vector().free(self, allocation);
        } else if let Some(memory_type_index) = allocation.memory_type_index() {
            self.block_vectors[memory_type_index as usize].free(self, allocation);
        }
    }

    /// Returns the parameters of `allocation`.
    ///
    /// If the allocation can become lost, this also marks it as used in the current frame, like
    /// [`touch_allocation`]. A lost allocation reports no memory type and a null memory object.
    ///
    /// [`touch_allocation`]: Self::touch_allocation
    pub fn get_allocation_info(&self, allocation: &Allocation) -> AllocationInfo {
        if allocation.can_become_lost() && !allocation.touch(self.current_frame_index()) {
            return allocation.lost_info();
        }

        allocation.info()
    }

    /// Marks `allocation` as used in the current frame. Returns `false` if it is lost.
    #[inline]
    pub fn touch_allocation(&self, allocation: &Allocation) -> bool {
        allocation.touch(self.current_frame_index())
    }

    /// Creates an allocation that is lost from the start.
    ///
    /// This is useful as a placeholder for resources that haven't been created yet.
    #[inline]
    pub fn create_lost_allocation(&self) -> Arc<Allocation> {
        Allocation::new_lost()
    }

    /// Sets the user data of `allocation`.
    ///
    /// String user data requires the allocation to have been created with
    /// [`AllocationCreateFlags::USER_DATA_COPY_STRING`], and opaque user data requires it not to.
    pub fn set_allocation_user_data(
        &self,
        allocation: &Allocation,
        user_data: UserData,
    ) -> Result<(), AllocationError> {
        allocation.set_user_data(user_data)?;

        Ok(())
    }

    /// Maps `allocation` and returns a pointer to its start.
    ///
    /// Mapping is reference-counted: the memory stays mapped until [`unmap_memory`] has been
    /// called as many times as this. Allocations that can become lost can't be mapped.
    ///
    /// # Safety
    ///
    /// - `allocation` must have been allocated from this allocator and not freed.
    ///
    /// [`unmap_memory`]: Self::unmap_memory
    pub unsafe fn map_memory(&self, allocation: &Allocation) -> Result<MappedPtr, AllocationError> {
        if allocation.can_become_lost() {
            return Err(InvalidUsage::MapCanBecomeLost.into());
        }

        unsafe { allocation.map(&self.device) }
    }

    /// Undoes one call to [`map_memory`].
    ///
    /// # Safety
    ///
    /// - `allocation` must have been allocated from this allocator and not freed.
    /// - The pointer returned by the corresponding call to [`map_memory`] must not be used
    ///   anymore.
    ///
    /// [`map_memory`]: Self::map_memory
    pub unsafe fn unmap_memory(&self, allocation: &Allocation) -> Result<(), AllocationError> {
        if allocation.can_become_lost() {
            return Err(InvalidUsage::MapCanBecomeLost.into());
        }

        unsafe { allocation.unmap(&self.device) }
    }

    /// Creates a custom pool.
    pub fn create_pool(&self, create_info: PoolCreateInfo) -> Result<Pool, AllocationError> {
        let PoolCreateInfo {
            memory_type_index,
            flags,
            block_size,
            min_block_count,
            max_block_count,
            frame_in_use_count,
            _ne: _,
        } = create_info;

        let Some(default_vector) = self.block_vectors.get(memory_type_index as usize) else {
            return Err(InvalidUsage::InvalidMemoryTypeIndex.into());
        };

        let max_block_count = if max_block_count == 0 {
            usize::MAX
        } else {
            max_block_count
        };

        if min_block_count > max_block_count {
            return Err(InvalidUsage::InvalidPoolBlockCounts.into());
        }

        let preferred_block_size = if block_size == 0 {
            default_vector.preferred_block_size()
        } else {
            block_size
        };

        let buffer_image_granularity =
            if flags.intersects(PoolCreateFlags::IGNORE_BUFFER_IMAGE_GRANULARITY) {
                DeviceAlignment::MIN
            } else {
                self.buffer_image_granularity
            };

        let pool = Pool(Arc::new(BlockVector::new(BlockVectorCreateInfo {
            memory_type_index,
            preferred_block_size,
            min_block_count,
            max_block_count,
            buffer_image_granularity,
            frame_in_use_count,
            is_custom_pool: true,
            retain_empty_block: self.retain_empty_block,
        })));

        if let Err(err) = pool.block_vector().create_min_blocks(self) {
            pool.block_vector().destroy_blocks(self);

            return Err(err);
        }

        self.pools.lock().push(pool.clone());

        log::debug!(
            "created pool with blocks of {} bytes in memory type {}",
            preferred_block_size,
            memory_type_index,
        );

        Ok(pool)
    }

    /// Destroys `pool` and frees its blocks.
    ///
    /// # Safety
    ///
    /// - All allocations from the pool must have been freed or be lost.
    pub unsafe fn destroy_pool(&self, pool: &Pool) {
        {
            let mut pools = self.pools.lock();

            let Some(index) = pools.iter().position(|other| other == pool) else {
                log::warn!("destroying a pool that doesn't belong to the allocator");

                return;
            };

            pools.swap_remove(index);
        }

        pool.block_vector().destroy_blocks(self);

        log::debug!(
            "destroyed pool of memory type {}",
            pool.memory_type_index()
        );
    }

    /// Returns the statistics of `pool`.
    pub fn pool_stats(&self, pool: &Pool) -> PoolStats {
        pool.block_vector().pool_stats()
    }

    /// Makes lost every allocation of `pool` that can become lost and wasn't used within the
    /// frames-in-use window of the pool. Returns how many allocations were made lost.
    pub fn make_pool_allocations_lost(&self, pool: &Pool) -> usize {
        pool.block_vector()
            .make_allocations_lost(self.current_frame_index())
    }

    /// Computes statistics of everything that is currently allocated.
    pub fn calculate_stats(&self) -> Stats {
        let mut stats = Stats::new(
            self.memory_properties.memory_types.len(),
            self.memory_properties.memory_heaps.len(),
        );

        for block_vector in &self.block_vectors {
            let memory_type_index = block_vector.memory_type_index();
            block_vector.add_stats(&mut stats, self.heap_index(memory_type_index));
        }

        for pool in self.pools.lock().iter() {
            let memory_type_index = pool.memory_type_index();
            pool.block_vector()
                .add_stats(&mut stats, self.heap_index(memory_type_index));
        }

        for (memory_type_index, dedicated_allocations) in
            self.dedicated_allocations.iter().enumerate()
        {
            let memory_type_index = memory_type_index as u32;
            let heap_index = self.heap_index(memory_type_index);

            for allocation in dedicated_allocations.lock().iter() {
                let size = allocation.size();
                let info = StatInfo {
                    block_count: 1,
                    allocation_count: 1,
                    used_bytes: size,
                    allocation_size_min: size,
                    allocation_size_max: size,
                    ..StatInfo::new()
                };

                stats.add(memory_type_index, heap_index, &info);
            }
        }

        stats.postprocess();

        stats
    }

    /// Moves the given allocations toward fewer blocks, and frees the blocks that become empty.
    ///
    /// Only allocations that reside in blocks of host-visible memory types and aren't lost are
    /// moved; the rest are ignored. Resources that were bound to the allocations whose
    /// [`changed`] flag is set must be recreated and bound again.
    ///
    /// Running out of budget is not an error: the outcome is then marked as [`incomplete`].
    ///
    /// An allocation that is given more than once is only considered once, and all of its
    /// entries in [`changed`] agree.
    ///
    /// # Safety
    ///
    /// - The allocations must have been allocated from this allocator and not freed.
    /// - The memory of the allocations must not be in use by the device or mapped by the host.
    ///
    /// [`changed`]: DefragmentationOutcome::changed
    /// [`incomplete`]: DefragmentationOutcome::incomplete
    pub unsafe fn defragment(
        &self,
        allocations: &[Arc<Allocation>],
        defragmentation_info: &DefragmentationInfo,
    ) -> Result<DefragmentationOutcome, AllocationError> {
        let mut outcome = DefragmentationOutcome {
            changed: vec![false; allocations.len()],
            ..Default::default()
        };
        let mut budget = DefragmentationBudget {
            max_bytes_to_move: defragmentation_info.max_bytes_to_move,
            max_allocations_to_move: defragmentation_info.max_allocations_to_move,
        };

        let mut default_candidates: Vec<Vec<(usize, &Arc<Allocation>)>> =
            self.block_vectors.iter().map(|_| Vec::new()).collect();
        let mut pool_candidates: Vec<(&Pool, Vec<(usize, &Arc<Allocation>)>)> = Vec::new();

        let mut first_indices: HashMap<*const Allocation, usize> = HashMap::default();
        let mut duplicates: Vec<(usize, usize)> = Vec::new();

        for (index, allocation) in allocations.iter().enumerate() {
            let first_index = *first_indices
                .entry(Arc::as_ptr(allocation))
                .or_insert(index);

            if first_index != index {
                duplicates.push((index, first_index));
                continue;
            }

            let Some(memory_type_index) = allocation.memory_type_index() else {
                continue;
            };

            let is_host_visible = self.memory_properties.memory_types
                [memory_type_index as usize]
                .property_flags
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

            if !is_host_visible || allocation.is_dedicated() || allocation.is_lost() {
                continue;
            }

            match allocation.pool() {
                Some(pool) => match pool_candidates.iter_mut().find(|(other, _)| *other == pool) {
                    Some((_, candidates)) => candidates.push((index, allocation)),
                    None => pool_candidates.push((pool, vec![(index, allocation)])),
                },
                None => default_candidates[memory_type_index as usize].push((index, allocation)),
            }
        }

        let vectors = default_candidates
            .iter()
            .enumerate()
            .map(|(memory_type_index, candidates)| {
                (&self.block_vectors[memory_type_index], candidates)
            })
            .chain(
                pool_candidates
                    .iter()
                    .map(|(pool, candidates)| (pool.block_vector(), candidates)),
            );

        for (block_vector, candidates) in vectors {
            if candidates.is_empty() {
                continue;
            }

            let complete = block_vector.defragment(
                self,
                candidates,
                &mut budget,
                &mut outcome.changed,
                &mut outcome.stats,
            )?;

            if !complete {
                outcome.incomplete = true;
                break;
            }
        }

        for (index, first_index) in duplicates {
            outcome.changed[index] = outcome.changed[first_index];
        }

        log::debug!(
            "defragmentation moved {} allocations ({} bytes) and freed {} blocks",
            outcome.stats.allocations_moved,
            outcome.stats.bytes_moved,
            outcome.stats.device_memory_blocks_freed,
        );

        Ok(outcome)
    }

    /// Checks the bookkeeping of every block.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for block_vector in &self.block_vectors {
            block_vector.validate()?;
        }

        for pool in self.pools.lock().iter() {
            pool.block_vector().validate()?;
        }

        Ok(())
    }
}

impl<D: MemoryDevice> Drop for Allocator<D> {
    fn drop(&mut self) {
        let pools = mem::take(&mut *self.pools.lock());

        if !pools.is_empty() {
            log::warn!("dropping allocator with {} pools left", pools.len());
        }

        for pool in &pools {
            pool.block_vector().destroy_blocks(self);
        }

        for (memory_type_index, dedicated_allocations) in
            self.dedicated_allocations.iter().enumerate()
        {
            let dedicated_allocations = mem::take(&mut *dedicated_allocations.lock());

            if !dedicated_allocations.is_empty() {
                log::warn!(
                    "dropping allocator with {} dedicated allocations left in memory type {}",
                    dedicated_allocations.len(),
                    memory_type_index,
                );
            }

            for allocation in dedicated_allocations {
                if let Some((memory, mapped_ptr)) = allocation.dedicated_memory() {
                    if mapped_ptr.is_some() {
                        // SAFETY: The memory is mapped.
                        unsafe { self.device.unmap_memory(memory) };
                    }

                    // SAFETY: The allocator is going away, so the memory must not be in use.
                    unsafe {
                        self.free_device_memory(memory_type_index as u32, memory, allocation.size())
                    };
                }
            }
        }

        for block_vector in &self.block_vectors {
            block_vector.destroy_blocks(self);
        }
    }
}

impl<D: MemoryDevice> Debug for Allocator<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Allocator")
            .field("memory_properties", &self.memory_properties)
            .field("buffer_image_granularity", &self.buffer_image_granularity)
            .field("frame_in_use_count", &self.frame_in_use_count)
            .field("current_frame_index", &self.current_frame_index())
            .field("block_vectors", &self.block_vectors)
            .finish_non_exhaustive()
    }
}

fn validate_create_info(
    requirements: &MemoryRequirements,
    create_info: &AllocationCreateInfo,
) -> Result<(), InvalidUsage> {
    let flags = create_info.flags;

    if flags.contains(
        AllocationCreateFlags::DEDICATED_MEMORY | AllocationCreateFlags::NEVER_ALLOCATE,
    ) {
        return Err(InvalidUsage::DedicatedWithNeverAllocate);
    }

    if flags.contains(AllocationCreateFlags::MAPPED | AllocationCreateFlags::CAN_BECOME_LOST) {
        return Err(InvalidUsage::MappedWithCanBecomeLost);
    }

    if requirements.requires_dedicated_allocation {
        if flags.intersects(AllocationCreateFlags::NEVER_ALLOCATE) {
            return Err(InvalidUsage::RequiredDedicatedWithNeverAllocate);
        }

        if create_info.pool.is_some() {
            return Err(InvalidUsage::RequiredDedicatedWithPool);
        }
    }

    if create_info.pool.is_some() && flags.intersects(AllocationCreateFlags::DEDICATED_MEMORY) {
        return Err(InvalidUsage::DedicatedWithPool);
    }

    let is_string = flags.intersects(AllocationCreateFlags::USER_DATA_COPY_STRING);

    if !create_info.user_data.is_compatible(is_string) {
        return Err(InvalidUsage::UserDataKindMismatch);
    }

    Ok(())
}

/// Error that can be returned when allocating or using memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationError {
    /// There is not enough device memory, or a heap size limit was reached.
    OutOfDeviceMemory,

    /// There is not enough host memory.
    OutOfHostMemory,

    /// The device refused to create another memory object.
    TooManyObjects,

    /// Allocations that could have been made lost kept being used by other threads while trying
    /// to make them lost. Trying again later may succeed.
    ContentionExhausted,

    /// The operation was used incorrectly.
    InvalidUsage(InvalidUsage),

    /// No memory type satisfies the memory type bits and the required flags.
    NoSuitableMemoryType,

    /// Mapping the memory failed.
    MemoryMapFailed,

    /// Another error returned by the device.
    Device(vk::Result),
}

impl From<vk::Result> for AllocationError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => AllocationError::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => AllocationError::OutOfHostMemory,
            vk::Result::ERROR_TOO_MANY_OBJECTS => AllocationError::TooManyObjects,
            vk::Result::ERROR_MEMORY_MAP_FAILED => AllocationError::MemoryMapFailed,
            result => AllocationError::Device(result),
        }
    }
}

impl From<InvalidUsage> for AllocationError {
    #[inline]
    fn from(err: InvalidUsage) -> Self {
        AllocationError::InvalidUsage(err)
    }
}

impl Display for AllocationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::OutOfDeviceMemory => f.write_str("out of device memory"),
            Self::OutOfHostMemory => f.write_str("out of host memory"),
            Self::TooManyObjects => {
                f.write_str("too many `DeviceMemory` allocations exist already")
            }
            Self::ContentionExhausted => f.write_str(
                "the allocations that could be made lost kept being used by other threads",
            ),
            Self::InvalidUsage(_) => f.write_str("the operation was used incorrectly"),
            Self::NoSuitableMemoryType => {
                f.write_str("no memory type satisfies the requirements")
            }
            Self::MemoryMapFailed => f.write_str("failed to map memory"),
            Self::Device(_) => f.write_str("a device error occurred"),
        }
    }
}

impl Error for AllocationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidUsage(err) => Some(err),
            Self::Device(err) => Some(err),
            _ => None,
        }
    }
}

/// The ways in which the allocator can be used incorrectly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidUsage {
    /// `DEDICATED_MEMORY` was combined with `NEVER_ALLOCATE`.
    DedicatedWithNeverAllocate,

    /// `MAPPED` was combined with `CAN_BECOME_LOST`.
    MappedWithCanBecomeLost,

    /// The resource requires a dedicated allocation, but `NEVER_ALLOCATE` was given.
    RequiredDedicatedWithNeverAllocate,

    /// The resource requires a dedicated allocation, but a pool was given.
    RequiredDedicatedWithPool,

    /// `DEDICATED_MEMORY` was combined with a pool.
    DedicatedWithPool,

    /// String user data was given without `USER_DATA_COPY_STRING`, or opaque user data with it.
    UserDataKindMismatch,

    /// The allocation is larger than the blocks of the pool.
    SizeExceedsPoolBlockSize,

    /// The size is zero, or the alignment is not a power of two.
    InvalidLayout,

    /// The memory type index is out of range.
    InvalidMemoryTypeIndex,

    /// The minimum block count of a pool is greater than the maximum.
    InvalidPoolBlockCounts,

    /// An allocation that can become lost was mapped.
    MapCanBecomeLost,

    /// The allocation is lost.
    AllocationLost,

    /// The allocation was mapped too many times.
    TooManyMaps,

    /// The allocation was unmapped while it was not mapped.
    NotMapped,
}

impl Display for InvalidUsage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(match self {
            Self::DedicatedWithNeverAllocate => {
                "`DEDICATED_MEMORY` can't be combined with `NEVER_ALLOCATE`"
            }
            Self::MappedWithCanBecomeLost => "`MAPPED` can't be combined with `CAN_BECOME_LOST`",
            Self::RequiredDedicatedWithNeverAllocate => {
                "the resource requires a dedicated allocation, but `NEVER_ALLOCATE` was given"
            }
            Self::RequiredDedicatedWithPool => {
                "the resource requires a dedicated allocation, but a pool was given"
            }
            Self::DedicatedWithPool => "`DEDICATED_MEMORY` can't be combined with a pool",
            Self::UserDataKindMismatch => {
                "string user data requires `USER_DATA_COPY_STRING`, and other user data requires \
                it to be absent"
            }
            Self::SizeExceedsPoolBlockSize => {
                "the allocation size was greater than the block size of the pool"
            }
            Self::InvalidLayout => {
                "the size must be nonzero and the alignment must be a power of two"
            }
            Self::InvalidMemoryTypeIndex => "the memory type index is out of range",
            Self::InvalidPoolBlockCounts => {
                "the minimum block count is greater than the maximum block count"
            }
            Self::MapCanBecomeLost => "allocations that can become lost can't be mapped",
            Self::AllocationLost => "the allocation is lost",
            Self::TooManyMaps => "the allocation was mapped too many times",
            Self::NotMapped => "the allocation is not mapped",
        })
    }
}

impl Error for InvalidUsage {}
