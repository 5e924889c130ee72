// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A device backed by host memory, and tests of the allocator as a whole.

use crate::{
    allocation::UserData,
    block::BlockMemory,
    device::{MemoryHeap, MemoryType},
    AllocationCreateFlags, AllocationCreateInfo, AllocationError, AllocationType, Allocation,
    Allocator, AllocatorCreateInfo, DefragmentationInfo, DeviceLayout, DeviceMemoryCallbacks,
    DeviceSize, InvalidUsage, MemoryDevice, MemoryProperties, MemoryRequirements, MemoryUsage,
    Pool, PoolCreateInfo, K, M,
};
use ash::vk::{self, Handle};
use crossbeam_queue::ArrayQueue;
use foldhash::HashMap;
use parking_lot::Mutex;
use smallvec::smallvec;
use std::{
    ffi::c_void,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
};

/// The size of both heaps of the mock device.
pub(crate) const MOCK_HEAP_SIZE: DeviceSize = 64 * M;

/// Memory type 0 of the mock device.
const DEVICE_LOCAL_TYPE: u32 = 0b01;

/// Memory type 1 of the mock device.
const HOST_VISIBLE_TYPE: u32 = 0b10;

const ALL_TYPES: u32 = DEVICE_LOCAL_TYPE | HOST_VISIBLE_TYPE;

/// A device whose memory objects are host allocations.
///
/// Memory type 0 is device-local and can't be mapped. Memory type 1 is host-visible and
/// host-coherent. Each lives in its own heap of [`MOCK_HEAP_SIZE`] bytes. Clones share the same
/// state, so a test can keep a handle to the device that the allocator owns.
#[derive(Clone)]
pub(crate) struct MockDevice {
    inner: Arc<MockInner>,
}

struct MockInner {
    memory_properties: MemoryProperties,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    buffer_image_granularity: DeviceSize,
    fail_above: Option<DeviceSize>,
    fail_after: Option<usize>,
    next_handle: u64,
    memory: HashMap<vk::DeviceMemory, MockMemory>,
    requirements: HashMap<u64, MemoryRequirements>,
    bindings: Vec<(u64, vk::DeviceMemory, DeviceSize)>,
    allocation_count: usize,
    free_count: usize,
    map_calls: usize,
    unmap_calls: usize,
}

struct MockMemory {
    data: Box<[u8]>,
    memory_type_index: u32,
    mapped: bool,
}

impl MockDevice {
    pub fn new() -> Self {
        let memory_properties = MemoryProperties {
            memory_types: smallvec![
                MemoryType {
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
            ],
            memory_heaps: smallvec![
                MemoryHeap {
                    size: MOCK_HEAP_SIZE,
                    flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeap {
                    size: MOCK_HEAP_SIZE,
                    flags: vk::MemoryHeapFlags::empty(),
                },
            ],
        };

        MockDevice {
            inner: Arc::new(MockInner {
                memory_properties,
                state: Mutex::new(MockState {
                    buffer_image_granularity: 1,
                    ..Default::default()
                }),
            }),
        }
    }

    pub fn with_granularity(self, buffer_image_granularity: DeviceSize) -> Self {
        self.inner.state.lock().buffer_image_granularity = buffer_image_granularity;
        self
    }

    /// Makes allocations larger than `size` fail.
    pub fn fail_above(self, size: DeviceSize) -> Self {
        self.inner.state.lock().fail_above = Some(size);
        self
    }

    /// Makes allocations fail once `count` allocations have been made.
    pub fn fail_after(self, count: usize) -> Self {
        self.inner.state.lock().fail_after = Some(count);
        self
    }

    /// The number of successful allocations so far.
    pub fn allocation_count(&self) -> usize {
        self.inner.state.lock().allocation_count
    }

    pub fn free_count(&self) -> usize {
        self.inner.state.lock().free_count
    }

    /// The number of memory objects that are currently allocated.
    pub fn live_memory_count(&self) -> usize {
        self.inner.state.lock().memory.len()
    }

    pub fn map_calls(&self) -> usize {
        self.inner.state.lock().map_calls
    }

    pub fn unmap_calls(&self) -> usize {
        self.inner.state.lock().unmap_calls
    }

    /// The resources that have been bound, with the memory and offset they were bound to.
    pub fn bindings(&self) -> Vec<(u64, vk::DeviceMemory, DeviceSize)> {
        self.inner.state.lock().bindings.clone()
    }

    fn register(&self, requirements: MemoryRequirements) -> u64 {
        let mut state = self.inner.state.lock();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.requirements.insert(handle, requirements);

        handle
    }

    pub fn register_buffer(&self, requirements: MemoryRequirements) -> vk::Buffer {
        vk::Buffer::from_raw(self.register(requirements))
    }

    pub fn register_image(&self, requirements: MemoryRequirements) -> vk::Image {
        vk::Image::from_raw(self.register(requirements))
    }

    pub fn read(&self, memory: vk::DeviceMemory, offset: DeviceSize, len: usize) -> Vec<u8> {
        let state = self.inner.state.lock();
        let offset = offset as usize;

        state.memory[&memory].data[offset..offset + len].to_vec()
    }

    pub fn write(&self, memory: vk::DeviceMemory, offset: DeviceSize, bytes: &[u8]) {
        let mut state = self.inner.state.lock();
        let offset = offset as usize;
        let memory = state.memory.get_mut(&memory).unwrap();

        memory.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

unsafe impl MemoryDevice for MockDevice {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.inner.memory_properties
    }

    fn buffer_image_granularity(&self) -> DeviceSize {
        self.inner.state.lock().buffer_image_granularity
    }

    unsafe fn allocate_memory(
        &self,
        allocation_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        let mut state = self.inner.state.lock();

        if state
            .fail_after
            .is_some_and(|count| state.allocation_count >= count)
            || state.fail_above.is_some_and(|size| allocation_size > size)
        {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }

        state.next_handle += 1;
        let memory = vk::DeviceMemory::from_raw(state.next_handle);
        state.memory.insert(
            memory,
            MockMemory {
                data: vec![0; allocation_size as usize].into_boxed_slice(),
                memory_type_index,
                mapped: false,
            },
        );
        state.allocation_count += 1;

        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.inner.state.lock();

        // Freeing mapped memory implicitly unmaps it.
        assert!(state.memory.remove(&memory).is_some(), "freeing unknown memory");

        state.free_count += 1;
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<c_void>, vk::Result> {
        let mut state = self.inner.state.lock();
        let memory_type_index = state.memory[&memory].memory_type_index;
        let property_flags =
            self.inner.memory_properties.memory_types[memory_type_index as usize].property_flags;

        if !property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }

        let memory = state.memory.get_mut(&memory).unwrap();

        assert!(!memory.mapped, "mapping memory twice");

        memory.mapped = true;
        let ptr = NonNull::new(memory.data.as_mut_ptr().cast::<c_void>()).unwrap();
        state.map_calls += 1;

        Ok(ptr)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.inner.state.lock();
        let memory = state.memory.get_mut(&memory).unwrap();

        assert!(memory.mapped, "unmapping memory that isn't mapped");

        memory.mapped = false;
        state.unmap_calls += 1;
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), vk::Result> {
        let mut state = self.inner.state.lock();

        assert!(state.memory.contains_key(&memory));

        state.bindings.push((buffer.as_raw(), memory, offset));

        Ok(())
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), vk::Result> {
        let mut state = self.inner.state.lock();

        assert!(state.memory.contains_key(&memory));

        state.bindings.push((image.as_raw(), memory, offset));

        Ok(())
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> MemoryRequirements {
        self.inner.state.lock().requirements[&buffer.as_raw()]
    }

    unsafe fn image_memory_requirements(&self, image: vk::Image) -> MemoryRequirements {
        self.inner.state.lock().requirements[&image.as_raw()]
    }
}

pub(crate) fn allocator_with(
    device: MockDevice,
    create_info: AllocatorCreateInfo,
) -> Allocator<MockDevice> {
    Allocator::new(device, create_info)
}

/// Creates an allocation at `offset` in `block`, without any bookkeeping.
pub(crate) fn block_allocation(
    block: &Arc<BlockMemory>,
    offset: DeviceSize,
    size: DeviceSize,
    allocation_type: AllocationType,
    can_become_lost: bool,
    last_use_frame_index: u32,
) -> Arc<Allocation> {
    let flags = if can_become_lost {
        AllocationCreateFlags::CAN_BECOME_LOST
    } else {
        AllocationCreateFlags::empty()
    };

    Allocation::new_block(
        block.clone(),
        offset,
        DeviceLayout::from_size_alignment(size, 1).unwrap(),
        allocation_type,
        flags,
        None,
        last_use_frame_index,
        UserData::None,
    )
}

fn requirements(size: DeviceSize, alignment: DeviceSize, memory_type_bits: u32) -> MemoryRequirements {
    MemoryRequirements {
        size,
        alignment,
        memory_type_bits,
        prefers_dedicated_allocation: false,
        requires_dedicated_allocation: false,
    }
}

fn usage(usage: MemoryUsage) -> AllocationCreateInfo {
    AllocationCreateInfo {
        usage,
        ..Default::default()
    }
}

fn pool_create_info(info: AllocationCreateInfo, pool: &Pool) -> AllocationCreateInfo {
    AllocationCreateInfo {
        pool: Some(pool.clone()),
        ..info
    }
}

#[test]
fn allocate_and_free() {
    let device = MockDevice::new();
    let allocator = allocator_with(device.clone(), AllocatorCreateInfo::default());
    let create_info = usage(MemoryUsage::GpuOnly);

    let a = allocator
        .allocate_memory(&requirements(4 * K, 256, ALL_TYPES), &create_info, AllocationType::Buffer)
        .unwrap();
    let b = allocator
        .allocate_memory(&requirements(4 * K, 256, ALL_TYPES), &create_info, AllocationType::Buffer)
        .unwrap();

    assert_eq!(a.memory_type_index(), Some(0));
    assert!(!a.is_dedicated());

    let info_a = allocator.get_allocation_info(&a);
    let info_b = allocator.get_allocation_info(&b);
    assert_eq!(info_a.device_memory, info_b.device_memory);
    assert_eq!(info_a.offset, 0);
    assert_eq!(info_b.offset, 4 * K);
    assert_eq!(info_a.mapped_ptr, None);
    assert_eq!(device.allocation_count(), 1);
    allocator.validate().unwrap();

    unsafe { allocator.free_memory(&a) };
    unsafe { allocator.free_memory(&b) };

    // The empty block is retained.
    assert_eq!(device.live_memory_count(), 1);
    assert_eq!(allocator.calculate_stats().total.allocation_count, 0);

    drop(allocator);
    assert_eq!(device.live_memory_count(), 0);
}

#[test]
fn memory_type_selection() {
    let allocator = allocator_with(MockDevice::new(), AllocatorCreateInfo::default());

    let find = |create_info: &AllocationCreateInfo, memory_type_bits| {
        allocator.find_memory_type_index(memory_type_bits, create_info)
    };

    assert_eq!(find(&usage(MemoryUsage::GpuOnly), ALL_TYPES), Ok(0));
    assert_eq!(find(&usage(MemoryUsage::CpuOnly), ALL_TYPES), Ok(1));
    assert_eq!(find(&usage(MemoryUsage::CpuToGpu), ALL_TYPES), Ok(1));
    assert_eq!(find(&usage(MemoryUsage::GpuToCpu), ALL_TYPES), Ok(1));
    assert_eq!(find(&usage(MemoryUsage::Unknown), ALL_TYPES), Ok(0));

    // A memory type that lacks preferred flags is still better than none.
    assert_eq!(find(&usage(MemoryUsage::GpuOnly), HOST_VISIBLE_TYPE), Ok(1));

    let restricted = AllocationCreateInfo {
        memory_type_bits: HOST_VISIBLE_TYPE,
        ..usage(MemoryUsage::GpuOnly)
    };
    assert_eq!(find(&restricted, ALL_TYPES), Ok(1));

    let required = AllocationCreateInfo {
        required_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ..Default::default()
    };
    assert_eq!(
        find(&required, HOST_VISIBLE_TYPE),
        Err(AllocationError::NoSuitableMemoryType),
    );
}

#[test]
fn invalid_usage() {
    let allocator = allocator_with(MockDevice::new(), AllocatorCreateInfo::default());
    let pool = allocator
        .create_pool(PoolCreateInfo {
            memory_type_index: 1,
            block_size: 64 * K,
            ..Default::default()
        })
        .unwrap();

    let check = |requirements: MemoryRequirements,
                 create_info: AllocationCreateInfo,
                 expected: InvalidUsage| {
        let err = allocator
            .allocate_memory(&requirements, &create_info, AllocationType::Unknown)
            .unwrap_err();

        assert_eq!(err, AllocationError::InvalidUsage(expected));
    };

    let small = requirements(K, 1, ALL_TYPES);
    let flags = |flags| AllocationCreateInfo {
        flags,
        ..Default::default()
    };

    check(
        small,
        flags(AllocationCreateFlags::DEDICATED_MEMORY | AllocationCreateFlags::NEVER_ALLOCATE),
        InvalidUsage::DedicatedWithNeverAllocate,
    );
    check(
        small,
        flags(AllocationCreateFlags::MAPPED | AllocationCreateFlags::CAN_BECOME_LOST),
        InvalidUsage::MappedWithCanBecomeLost,
    );

    let dedicated = MemoryRequirements {
        requires_dedicated_allocation: true,
        ..small
    };
    check(
        dedicated,
        flags(AllocationCreateFlags::NEVER_ALLOCATE),
        InvalidUsage::RequiredDedicatedWithNeverAllocate,
    );
    check(
        dedicated,
        pool_create_info(AllocationCreateInfo::default(), &pool),
        InvalidUsage::RequiredDedicatedWithPool,
    );
    check(
        small,
        pool_create_info(flags(AllocationCreateFlags::DEDICATED_MEMORY), &pool),
        InvalidUsage::DedicatedWithPool,
    );
    check(
        small,
        AllocationCreateInfo {
            user_data: UserData::String("name".to_owned()),
            ..Default::default()
        },
        InvalidUsage::UserDataKindMismatch,
    );
    check(
        requirements(128 * K, 1, ALL_TYPES),
        pool_create_info(AllocationCreateInfo::default(), &pool),
        InvalidUsage::SizeExceedsPoolBlockSize,
    );
    check(
        requirements(0, 1, ALL_TYPES),
        AllocationCreateInfo::default(),
        InvalidUsage::InvalidLayout,
    );
    check(
        requirements(K, 3, ALL_TYPES),
        AllocationCreateInfo::default(),
        InvalidUsage::InvalidLayout,
    );

    unsafe { allocator.destroy_pool(&pool) };
}

#[test]
fn never_allocate_without_blocks() {
    let device = MockDevice::new();
    let allocator = allocator_with(device.clone(), AllocatorCreateInfo::default());
    let create_info = AllocationCreateInfo {
        flags: AllocationCreateFlags::NEVER_ALLOCATE,
        ..Default::default()
    };

    assert_eq!(
        allocator
            .allocate_memory(&requirements(K, 1, ALL_TYPES), &create_info, AllocationType::Buffer)
            .unwrap_err(),
        AllocationError::OutOfDeviceMemory,
    );
    assert_eq!(device.allocation_count(), 0);
}

#[test]
fn dedicated_allocations() {
    let device = MockDevice::new();
    let allocator = allocator_with(device.clone(), AllocatorCreateInfo::default());
    let create_info = usage(MemoryUsage::GpuOnly);

    // More than half of the preferred block size, which is an eighth of the heap.
    let large = allocator
        .allocate_memory(&requirements(5 * M, 256, ALL_TYPES), &create_info, AllocationType::Buffer)
        .unwrap();
    assert!(large.is_dedicated());
    assert_eq!(allocator.get_allocation_info(&large).offset, 0);

    let required = MemoryRequirements {
        requires_dedicated_allocation: true,
        ..requirements(K, 256, ALL_TYPES)
    };
    let small = allocator
        .allocate_memory(&required, &create_info, AllocationType::ImageOptimal)
        .unwrap();
    assert!(small.is_dedicated());
    assert_eq!(device.allocation_count(), 2);

    let stats = allocator.calculate_stats();
    assert_eq!(stats.total.block_count, 2);
    assert_eq!(stats.total.allocation_count, 2);
    assert_eq!(stats.total.used_bytes, 5 * M + K);
    assert_eq!(stats.total.allocation_size_max, 5 * M);

    unsafe { allocator.free_memory(&large) };
    unsafe { allocator.free_memory(&small) };
    assert_eq!(device.live_memory_count(), 0);

    // Freeing twice is caught.
    unsafe { allocator.free_memory(&small) };
    assert_eq!(device.free_count(), 2);
}

#[test]
fn statistics() {
    let allocator = allocator_with(MockDevice::new(), AllocatorCreateInfo::default());
    let create_info = usage(MemoryUsage::GpuOnly);

    let allocations: Vec<_> = [K, 2 * K, 5 * M]
        .into_iter()
        .map(|size| {
            allocator
                .allocate_memory(&requirements(size, 1, ALL_TYPES), &create_info, AllocationType::Buffer)
                .unwrap()
        })
        .collect();

    let stats = allocator.calculate_stats();

    // The first block of the default block vector is 1 MiB.
    assert_eq!(stats.total.block_count, 2);
    assert_eq!(stats.total.allocation_count, 3);
    assert_eq!(stats.total.used_bytes, 3 * K + 5 * M);
    assert_eq!(stats.total.unused_bytes, M - 3 * K);
    assert_eq!(stats.total.unused_range_count, 1);
    assert_eq!(stats.total.allocation_size_min, K);
    assert_eq!(stats.total.allocation_size_avg, (3 * K + 5 * M + 1) / 3);
    assert_eq!(stats.memory_type[0], stats.total);
    assert_eq!(stats.memory_heap[0], stats.total);
    assert_eq!(stats.memory_type[1].block_count, 0);

    for allocation in &allocations {
        unsafe { allocator.free_memory(allocation) };
    }
}

#[test]
fn buffer_image_granularity() {
    let device = MockDevice::new().with_granularity(K);
    let allocator = allocator_with(device, AllocatorCreateInfo::default());
    let create_info = usage(MemoryUsage::GpuOnly);
    let requirements = requirements(100, 1, ALL_TYPES);

    let buffer = allocator
        .allocate_memory(&requirements, &create_info, AllocationType::Buffer)
        .unwrap();
    let other_buffer = allocator
        .allocate_memory(&requirements, &create_info, AllocationType::Buffer)
        .unwrap();
    let image = allocator
        .allocate_memory(&requirements, &create_info, AllocationType::ImageOptimal)
        .unwrap();

    assert_eq!(buffer.offset(), 0);
    assert_eq!(other_buffer.offset(), 100);
    assert_eq!(image.offset(), K);

    for allocation in [&buffer, &other_buffer, &image] {
        unsafe { allocator.free_memory(allocation) };
    }
}

#[test]
fn mapping() {
    let device = MockDevice::new();
    let allocator = allocator_with(device.clone(), AllocatorCreateInfo::default());
    let create_info = usage(MemoryUsage::CpuOnly);
    let requirements = requirements(K, 1, ALL_TYPES);

    let a = allocator
        .allocate_memory(&requirements, &create_info, AllocationType::Buffer)
        .unwrap();
    let b = allocator
        .allocate_memory(&requirements, &create_info, AllocationType::Buffer)
        .unwrap();

    let ptr_a = unsafe { allocator.map_memory(&a) }.unwrap();
    let ptr_b = unsafe { allocator.map_memory(&b) }.unwrap();
    assert_eq!(ptr_b.as_ptr() as usize - ptr_a.as_ptr() as usize, K as usize);
    assert_eq!(device.map_calls(), 1);
    assert_eq!(allocator.get_allocation_info(&a).mapped_ptr, Some(ptr_a));

    unsafe { allocator.unmap_memory(&a) }.unwrap();
    assert_eq!(device.unmap_calls(), 0);
    assert_eq!(allocator.get_allocation_info(&a).mapped_ptr, None);
    unsafe { allocator.unmap_memory(&b) }.unwrap();
    assert_eq!(device.unmap_calls(), 1);

    assert_eq!(
        unsafe { allocator.unmap_memory(&a) },
        Err(AllocationError::InvalidUsage(InvalidUsage::NotMapped)),
    );

    // Freeing an allocation that is still mapped gives its references back.
    let ptr_a = unsafe { allocator.map_memory(&a) }.unwrap();
    assert!(!ptr_a.as_ptr().is_null());
    unsafe { allocator.free_memory(&a) };
    assert_eq!(device.unmap_calls(), 2);

    unsafe { allocator.free_memory(&b) };
}

#[test]
fn persistent_mapping() {
    let device = MockDevice::new();
    let allocator = allocator_with(device.clone(), AllocatorCreateInfo::default());
    let requirements = requirements(K, 1, ALL_TYPES);

    let mapped = AllocationCreateInfo {
        flags: AllocationCreateFlags::MAPPED,
        ..usage(MemoryUsage::CpuOnly)
    };
    let allocation = allocator
        .allocate_memory(&requirements, &mapped, AllocationType::Buffer)
        .unwrap();
    let ptr = allocator.get_allocation_info(&allocation).mapped_ptr.unwrap();

    // Mapping again returns the same pointer without another device call.
    assert_eq!(unsafe { allocator.map_memory(&allocation) }, Ok(ptr));
    unsafe { allocator.unmap_memory(&allocation) }.unwrap();
    assert_eq!(device.map_calls(), 1);
    assert_eq!(device.unmap_calls(), 0);

    unsafe { allocator.free_memory(&allocation) };
    assert_eq!(device.unmap_calls(), 1);

    // The flag is ignored for memory that isn't host-visible.
    let device_local = AllocationCreateInfo {
        flags: AllocationCreateFlags::MAPPED,
        ..usage(MemoryUsage::GpuOnly)
    };
    let allocation = allocator
        .allocate_memory(&requirements, &device_local, AllocationType::Buffer)
        .unwrap();
    assert_eq!(allocation.memory_type_index(), Some(0));
    assert_eq!(allocator.get_allocation_info(&allocation).mapped_ptr, None);

    unsafe { allocator.free_memory(&allocation) };
}

#[test]
fn map_can_become_lost() {
    let allocator = allocator_with(MockDevice::new(), AllocatorCreateInfo::default());
    let create_info = AllocationCreateInfo {
        flags: AllocationCreateFlags::CAN_BECOME_LOST,
        ..usage(MemoryUsage::CpuOnly)
    };

    let allocation = allocator
        .allocate_memory(&requirements(K, 1, ALL_TYPES), &create_info, AllocationType::Buffer)
        .unwrap();

    assert_eq!(
        unsafe { allocator.map_memory(&allocation) },
        Err(AllocationError::InvalidUsage(InvalidUsage::MapCanBecomeLost)),
    );

    unsafe { allocator.free_memory(&allocation) };
}

#[test]
fn lost_allocation_lifecycle() {
    let device = MockDevice::new();
    let allocator = allocator_with(device.clone(), AllocatorCreateInfo::default());
    let pool = allocator
        .create_pool(PoolCreateInfo {
            memory_type_index: 1,
            block_size: 64 * K,
            max_block_count: 1,
            frame_in_use_count: 1,
            ..Default::default()
        })
        .unwrap();
    let requirements = requirements(64 * K, 1, ALL_TYPES);

    let can_become_lost = pool_create_info(
        AllocationCreateInfo {
            flags: AllocationCreateFlags::CAN_BECOME_LOST,
            ..Default::default()
        },
        &pool,
    );
    let can_make_other_lost = pool_create_info(
        AllocationCreateInfo {
            flags: AllocationCreateFlags::CAN_MAKE_OTHER_LOST,
            ..Default::default()
        },
        &pool,
    );

    let victim = allocator
        .allocate_memory(&requirements, &can_become_lost, AllocationType::Buffer)
        .unwrap();
    assert!(allocator.touch_allocation(&victim));

    // Frame 1 is still inside the frames-in-use window of frame 0.
    allocator.set_current_frame_index(1);
    assert_eq!(
        allocator
            .allocate_memory(&requirements, &can_make_other_lost, AllocationType::Buffer)
            .unwrap_err(),
        AllocationError::OutOfDeviceMemory,
    );

    allocator.set_current_frame_index(2);
    let allocation = allocator
        .allocate_memory(&requirements, &can_make_other_lost, AllocationType::Buffer)
        .unwrap();
    assert!(victim.is_lost());
    assert_eq!(allocation.offset(), 0);
    assert_eq!(device.allocation_count(), 1);

    let info = allocator.get_allocation_info(&victim);
    assert_eq!(info.memory_type_index, None);
    assert_eq!(info.device_memory, vk::DeviceMemory::null());
    assert_eq!(info.offset, 0);
    assert!(!allocator.touch_allocation(&victim));

    unsafe { allocator.free_memory(&victim) };
    assert_eq!(allocator.pool_stats(&pool).allocation_count, 1);

    unsafe { allocator.free_memory(&allocation) };
    unsafe { allocator.destroy_pool(&pool) };
    assert_eq!(device.live_memory_count(), 0);
}

#[test]
fn create_lost_allocation() {
    let allocator = allocator_with(MockDevice::new(), AllocatorCreateInfo::default());
    let allocation = allocator.create_lost_allocation();

    assert!(allocation.is_lost());
    assert!(!allocator.touch_allocation(&allocation));
    assert_eq!(allocator.get_allocation_info(&allocation).memory_type_index, None);

    unsafe { allocator.free_memory(&allocation) };
}

#[test]
fn reserved_frame_index_is_ignored() {
    let allocator = allocator_with(MockDevice::new(), AllocatorCreateInfo::default());

    allocator.set_current_frame_index(7);
    allocator.set_current_frame_index(u32::MAX);

    assert_eq!(allocator.current_frame_index(), 7);
}

#[test]
fn make_pool_allocations_lost() {
    let allocator = allocator_with(MockDevice::new(), AllocatorCreateInfo::default());
    let pool = allocator
        .create_pool(PoolCreateInfo {
            memory_type_index: 0,
            block_size: 64 * K,
            frame_in_use_count: 1,
            ..Default::default()
        })
        .unwrap();
    let create_info = pool_create_info(
        AllocationCreateInfo {
            flags: AllocationCreateFlags::CAN_BECOME_LOST,
            ..Default::default()
        },
        &pool,
    );
    let requirements = requirements(K, 1, ALL_TYPES);

    let a = allocator
        .allocate_memory(&requirements, &create_info, AllocationType::Buffer)
        .unwrap();
    let b = allocator
        .allocate_memory(&requirements, &create_info, AllocationType::Buffer)
        .unwrap();

    allocator.set_current_frame_index(5);
    assert!(allocator.touch_allocation(&b));

    assert_eq!(allocator.make_pool_allocations_lost(&pool), 1);
    assert!(a.is_lost());
    assert!(!b.is_lost());
    assert_eq!(allocator.pool_stats(&pool).allocation_count, 1);

    unsafe { allocator.free_memory(&a) };
    unsafe { allocator.free_memory(&b) };
    unsafe { allocator.destroy_pool(&pool) };
}

#[test]
fn pools() {
    let device = MockDevice::new();
    let allocator = allocator_with(device.clone(), AllocatorCreateInfo::default());
    let pool = allocator
        .create_pool(PoolCreateInfo {
            memory_type_index: 0,
            block_size: 128 * K,
            min_block_count: 2,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(device.allocation_count(), 2);

    let stats = allocator.pool_stats(&pool);
    assert_eq!(stats.block_count, 2);
    assert_eq!(stats.size, 256 * K);
    assert_eq!(stats.unused_size, 256 * K);
    assert_eq!(stats.unused_range_count, 2);
    assert_eq!(stats.unused_range_size_max, 128 * K);

    let allocation = allocator
        .allocate_memory(
            &requirements(32 * K, 1, ALL_TYPES),
            &pool_create_info(AllocationCreateInfo::default(), &pool),
            AllocationType::Buffer,
        )
        .unwrap();
    assert_eq!(allocation.pool(), Some(&pool));

    let stats = allocator.pool_stats(&pool);
    assert_eq!(stats.allocation_count, 1);
    assert_eq!(stats.unused_size, 224 * K);

    // Pool blocks are part of the statistics.
    assert_eq!(allocator.calculate_stats().total.block_count, 2);

    // The pool never shrinks below its minimum.
    unsafe { allocator.free_memory(&allocation) };
    assert_eq!(allocator.pool_stats(&pool).block_count, 2);

    unsafe { allocator.destroy_pool(&pool) };
    assert_eq!(device.live_memory_count(), 0);
}

#[test]
fn invalid_pools() {
    let device = MockDevice::new().fail_after(1);
    let allocator = allocator_with(device.clone(), AllocatorCreateInfo::default());

    assert_eq!(
        allocator
            .create_pool(PoolCreateInfo {
                memory_type_index: 5,
                ..Default::default()
            })
            .unwrap_err(),
        AllocationError::InvalidUsage(InvalidUsage::InvalidMemoryTypeIndex),
    );
    assert_eq!(
        allocator
            .create_pool(PoolCreateInfo {
                min_block_count: 3,
                max_block_count: 2,
                ..Default::default()
            })
            .unwrap_err(),
        AllocationError::InvalidUsage(InvalidUsage::InvalidPoolBlockCounts),
    );

    // The second block can't be created, so the first one is released again.
    assert_eq!(
        allocator
            .create_pool(PoolCreateInfo {
                block_size: 64 * K,
                min_block_count: 2,
                ..Default::default()
            })
            .unwrap_err(),
        AllocationError::OutOfDeviceMemory,
    );
    assert_eq!(device.allocation_count(), 1);
    assert_eq!(device.live_memory_count(), 0);
}

#[test]
fn heap_size_limits_and_callbacks() {
    let allocated = Arc::new(AtomicU64::new(0));
    let freed = Arc::new(AtomicU64::new(0));

    let create_info = AllocatorCreateInfo {
        heap_size_limits: vec![None, Some(2 * M)],
        device_memory_callbacks: DeviceMemoryCallbacks {
            allocate: Some({
                let allocated = allocated.clone();
                Arc::new(move |_: u32, _: vk::DeviceMemory, size: DeviceSize| {
                    allocated.fetch_add(size, Ordering::Relaxed);
                })
            }),
            free: Some({
                let freed = freed.clone();
                Arc::new(move |_: u32, _: vk::DeviceMemory, size: DeviceSize| {
                    freed.fetch_add(size, Ordering::Relaxed);
                })
            }),
        },
        ..Default::default()
    };
    let device = MockDevice::new();
    let allocator = allocator_with(device.clone(), create_info);
    let create_info = usage(MemoryUsage::CpuOnly);

    assert_eq!(allocator.memory_properties().memory_heaps[1].size, 2 * M);

    let a = allocator
        .allocate_memory(&requirements(1536 * K, 1, ALL_TYPES), &create_info, AllocationType::Buffer)
        .unwrap();
    assert_eq!(allocated.load(Ordering::Relaxed), 1536 * K);

    // The heap limit is reached without asking the device.
    assert_eq!(
        allocator
            .allocate_memory(&requirements(M, 1, ALL_TYPES), &create_info, AllocationType::Buffer)
            .unwrap_err(),
        AllocationError::OutOfDeviceMemory,
    );
    assert_eq!(device.allocation_count(), 1);

    unsafe { allocator.free_memory(&a) };
    assert_eq!(freed.load(Ordering::Relaxed), 1536 * K);

    let b = allocator
        .allocate_memory(&requirements(M, 1, ALL_TYPES), &create_info, AllocationType::Buffer)
        .unwrap();

    unsafe { allocator.free_memory(&b) };
}

#[test]
fn user_data() {
    let allocator = allocator_with(MockDevice::new(), AllocatorCreateInfo::default());
    let create_info = AllocationCreateInfo {
        flags: AllocationCreateFlags::USER_DATA_COPY_STRING,
        user_data: UserData::String("vertex buffer".to_owned()),
        ..Default::default()
    };

    let allocation = allocator
        .allocate_memory(&requirements(K, 1, ALL_TYPES), &create_info, AllocationType::Buffer)
        .unwrap();
    assert_eq!(
        allocator.get_allocation_info(&allocation).user_data.as_str(),
        Some("vertex buffer"),
    );

    assert_eq!(
        allocator.set_allocation_user_data(&allocation, UserData::Opaque(Arc::new(1u8))),
        Err(AllocationError::InvalidUsage(InvalidUsage::UserDataKindMismatch)),
    );
    allocator
        .set_allocation_user_data(&allocation, UserData::String("index buffer".to_owned()))
        .unwrap();
    assert_eq!(allocation.user_data().as_str(), Some("index buffer"));

    unsafe { allocator.free_memory(&allocation) };
}

#[test]
fn bind_resources() {
    let device = MockDevice::new();
    let allocator = allocator_with(device.clone(), AllocatorCreateInfo::default());
    let create_info = usage(MemoryUsage::GpuOnly);

    let buffer = device.register_buffer(requirements(K, 256, ALL_TYPES));
    let buffer_allocation =
        unsafe { allocator.allocate_memory_for_buffer(buffer, &create_info) }.unwrap();
    assert_eq!(buffer_allocation.allocation_type(), AllocationType::Buffer);
    unsafe { allocator.bind_buffer_memory(&buffer_allocation, buffer) }.unwrap();

    let image = device.register_image(MemoryRequirements {
        requires_dedicated_allocation: true,
        ..requirements(4 * K, 256, ALL_TYPES)
    });
    let image_allocation = unsafe {
        allocator.allocate_memory_for_image(image, vk::ImageTiling::OPTIMAL, &create_info)
    }
    .unwrap();
    assert_eq!(image_allocation.allocation_type(), AllocationType::ImageOptimal);
    assert!(image_allocation.is_dedicated());
    unsafe { allocator.bind_image_memory(&image_allocation, image) }.unwrap();

    assert_eq!(
        device.bindings(),
        [
            (
                buffer.as_raw(),
                buffer_allocation.device_memory(),
                buffer_allocation.offset(),
            ),
            (image.as_raw(), image_allocation.device_memory(), 0),
        ],
    );

    let lost = allocator.create_lost_allocation();
    assert_eq!(
        unsafe { allocator.bind_buffer_memory(&lost, buffer) },
        Err(AllocationError::InvalidUsage(InvalidUsage::AllocationLost)),
    );

    unsafe { allocator.free_memory(&buffer_allocation) };
    unsafe { allocator.free_memory(&image_allocation) };
}

/// Creates a pool with two 64 KiB blocks: the first one holds an allocation of 48 KiB that isn't
/// going to be moved and has 16 KiB free at the end, the second one holds allocations of 8 KiB
/// and 4 KiB.
fn fragmented_pool(
    allocator: &Allocator<MockDevice>,
) -> (Pool, Arc<Allocation>, [Arc<Allocation>; 2]) {
    let pool = allocator
        .create_pool(PoolCreateInfo {
            memory_type_index: 1,
            block_size: 64 * K,
            ..Default::default()
        })
        .unwrap();
    let create_info = pool_create_info(AllocationCreateInfo::default(), &pool);
    let allocate = |size| {
        allocator
            .allocate_memory(&requirements(size, 1, ALL_TYPES), &create_info, AllocationType::Buffer)
            .unwrap()
    };

    let fixed = allocate(48 * K);
    let filler = allocate(16 * K);
    let large = allocate(8 * K);
    let small = allocate(4 * K);
    unsafe { allocator.free_memory(&filler) };

    assert_eq!(allocator.pool_stats(&pool).block_count, 2);
    assert_ne!(large.device_memory(), fixed.device_memory());
    assert_eq!(large.device_memory(), small.device_memory());

    (pool, fixed, [large, small])
}

#[test]
fn defragmentation_progress() {
    let device = MockDevice::new();
    let allocator = allocator_with(device.clone(), AllocatorCreateInfo::default());
    let (pool, fixed, movable) = fragmented_pool(&allocator);
    let [large, small] = &movable;

    device.write(large.device_memory(), large.offset(), &[0xAB; 8 * K as usize]);
    device.write(small.device_memory(), small.offset(), &[0xCD; 4 * K as usize]);

    let outcome =
        unsafe { allocator.defragment(&movable, &DefragmentationInfo::default()) }.unwrap();

    assert_eq!(outcome.changed, [true, true]);
    assert!(!outcome.incomplete);
    assert_eq!(outcome.stats.allocations_moved, 2);
    assert_eq!(outcome.stats.bytes_moved, 12 * K);
    assert_eq!(outcome.stats.device_memory_blocks_freed, 1);
    assert_eq!(outcome.stats.bytes_freed, 64 * K);

    // Both moved into the free space of the block that holds the fixed allocation, the larger one
    // first.
    assert_eq!(large.device_memory(), fixed.device_memory());
    assert_eq!(large.offset(), 48 * K);
    assert_eq!(small.device_memory(), fixed.device_memory());
    assert_eq!(small.offset(), 56 * K);
    assert_eq!(
        device.read(large.device_memory(), large.offset(), 8 * K as usize),
        [0xAB; 8 * K as usize],
    );
    assert_eq!(
        device.read(small.device_memory(), small.offset(), 4 * K as usize),
        [0xCD; 4 * K as usize],
    );

    assert_eq!(allocator.pool_stats(&pool).block_count, 1);
    assert_eq!(device.live_memory_count(), 1);
    assert_eq!(device.map_calls(), device.unmap_calls());
    allocator.validate().unwrap();

    // There is nothing left to gain, and allocations are never moved backward.
    let outcome =
        unsafe { allocator.defragment(&movable, &DefragmentationInfo::default()) }.unwrap();
    assert_eq!(outcome.changed, [false, false]);
    assert_eq!(outcome.stats.allocations_moved, 0);

    for allocation in [&fixed, large, small] {
        unsafe { allocator.free_memory(allocation) };
    }
    unsafe { allocator.destroy_pool(&pool) };
}

#[test]
fn defragmentation_budget() {
    let allocator = allocator_with(MockDevice::new(), AllocatorCreateInfo::default());
    let (pool, fixed, movable) = fragmented_pool(&allocator);
    let [large, small] = &movable;

    // The largest allocation doesn't fit into the byte budget, so nothing is moved.
    let outcome = unsafe {
        allocator.defragment(
            &movable,
            &DefragmentationInfo {
                max_bytes_to_move: 4 * K,
                ..Default::default()
            },
        )
    }
    .unwrap();
    assert!(outcome.incomplete);
    assert_eq!(outcome.changed, [false, false]);
    assert_eq!(outcome.stats.bytes_moved, 0);

    let outcome = unsafe {
        allocator.defragment(
            &movable,
            &DefragmentationInfo {
                max_allocations_to_move: 1,
                ..Default::default()
            },
        )
    }
    .unwrap();
    assert!(outcome.incomplete);
    assert_eq!(outcome.changed, [true, false]);
    assert_eq!(outcome.stats.allocations_moved, 1);
    assert_eq!(outcome.stats.bytes_moved, 8 * K);
    assert_eq!(outcome.stats.device_memory_blocks_freed, 0);
    assert_eq!(large.device_memory(), fixed.device_memory());
    assert_ne!(small.device_memory(), fixed.device_memory());

    for allocation in [&fixed, large, small] {
        unsafe { allocator.free_memory(allocation) };
    }
    unsafe { allocator.destroy_pool(&pool) };
}

#[test]
fn defragmentation_with_repeated_allocation() {
    let allocator = allocator_with(MockDevice::new(), AllocatorCreateInfo::default());
    let (pool, fixed, [large, small]) = fragmented_pool(&allocator);

    let allocations = [large.clone(), large.clone()];
    let outcome =
        unsafe { allocator.defragment(&allocations, &DefragmentationInfo::default()) }.unwrap();

    assert_eq!(outcome.changed, [true, true]);
    assert!(!outcome.incomplete);
    assert_eq!(outcome.stats.allocations_moved, 1);
    assert_eq!(outcome.stats.bytes_moved, 8 * K);
    assert_eq!(outcome.stats.device_memory_blocks_freed, 0);
    assert_eq!(large.device_memory(), fixed.device_memory());
    assert_eq!(large.offset(), 48 * K);

    let stats = allocator.pool_stats(&pool);
    assert_eq!(stats.block_count, 2);
    assert_eq!(stats.allocation_count, 3);
    assert_eq!(stats.unused_size, 128 * K - 60 * K);
    allocator.validate().unwrap();

    for allocation in [&fixed, &large, &small] {
        unsafe { allocator.free_memory(allocation) };
    }
    unsafe { allocator.destroy_pool(&pool) };
}

#[test]
fn defragmentation_skips_ineligible_allocations() {
    let allocator = allocator_with(MockDevice::new(), AllocatorCreateInfo::default());
    let requirements = requirements(K, 1, ALL_TYPES);

    let device_local = allocator
        .allocate_memory(&requirements, &usage(MemoryUsage::GpuOnly), AllocationType::Buffer)
        .unwrap();
    let dedicated = allocator
        .allocate_memory(
            &requirements,
            &AllocationCreateInfo {
                flags: AllocationCreateFlags::DEDICATED_MEMORY,
                ..usage(MemoryUsage::CpuOnly)
            },
            AllocationType::Buffer,
        )
        .unwrap();
    let lost = allocator.create_lost_allocation();
    let allocations = [device_local.clone(), dedicated.clone(), lost];

    let outcome =
        unsafe { allocator.defragment(&allocations, &DefragmentationInfo::default()) }.unwrap();
    assert_eq!(outcome.changed, [false, false, false]);
    assert!(!outcome.incomplete);

    unsafe { allocator.free_memory(&device_local) };
    unsafe { allocator.free_memory(&dedicated) };
}

#[test]
fn concurrent_allocations() {
    const THREADS: usize = 4;
    const ALLOCATIONS: usize = 64;

    let device = MockDevice::new();
    let allocator = allocator_with(device.clone(), AllocatorCreateInfo::default());
    let queue = ArrayQueue::new(THREADS * ALLOCATIONS);

    thread::scope(|scope| {
        for thread_index in 0..THREADS {
            let allocator = &allocator;
            let queue = &queue;

            scope.spawn(move || {
                let create_info = usage(if thread_index % 2 == 0 {
                    MemoryUsage::GpuOnly
                } else {
                    MemoryUsage::CpuOnly
                });
                let mut allocations = Vec::new();

                for index in 0..ALLOCATIONS {
                    let size = ((index % 7) as DeviceSize + 1) * 256;
                    let allocation = allocator
                        .allocate_memory(
                            &requirements(size, 64, ALL_TYPES),
                            &create_info,
                            AllocationType::Buffer,
                        )
                        .unwrap();
                    allocations.push(allocation);

                    // Give back every third allocation right away.
                    if index % 3 == 0 {
                        let allocation = allocations.pop().unwrap();
                        unsafe { allocator.free_memory(&allocation) };
                    }
                }

                for allocation in allocations {
                    queue.push(allocation).unwrap();
                }
            });
        }
    });

    allocator.validate().unwrap();

    let stats = allocator.calculate_stats();
    assert_eq!(stats.total.allocation_count as usize, queue.len());

    while let Some(allocation) = queue.pop() {
        unsafe { allocator.free_memory(&allocation) };
    }

    allocator.validate().unwrap();
    assert_eq!(allocator.calculate_stats().total.allocation_count, 0);

    drop(allocator);
    assert_eq!(device.live_memory_count(), 0);
}
