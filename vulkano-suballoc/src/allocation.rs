// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    allocator::{AllocationCreateFlags, AllocationError, InvalidUsage},
    block::BlockMemory,
    block_vector::Pool,
    device::MemoryDevice,
    layout::{DeviceAlignment, DeviceLayout},
    metadata::SuballocationType,
    DeviceSize,
};
use ash::vk;
use parking_lot::Mutex;
use std::{
    any::Any,
    ffi::c_void,
    fmt::{Debug, Formatter, Result as FmtResult},
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

/// The last-use frame index of an allocation that has been made lost.
pub(crate) const FRAME_INDEX_LOST: u32 = u32::MAX;

/// How many times an allocation can be mapped at the same time, not counting a persistent
/// mapping.
const MAX_MAP_COUNT: u8 = 0x7F;

/// The type of resource that an allocation is going to be used for.
///
/// This is needed to respect the buffer-image granularity, which is the granularity at which
/// linear and non-linear resources must be placed in adjacent memory to avoid aliasing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// The type of resource is unknown, or the allocation is going to be used for both linear and
    /// non-linear resources. Such allocations conflict with everything.
    #[default]
    Unknown,

    /// The allocation is going to be used for a buffer.
    Buffer,

    /// The allocation is going to be used for an image of unknown tiling.
    ImageUnknown,

    /// The allocation is going to be used for an image with linear tiling.
    ImageLinear,

    /// The allocation is going to be used for an image with optimal tiling.
    ImageOptimal,
}

/// The frame context in which allocations may be made lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FrameContext {
    pub current_frame_index: u32,
    pub frame_in_use_count: u32,
}

impl FrameContext {
    /// Returns whether an allocation last used in the given frame is outside of the
    /// frames-in-use window.
    fn allows_eviction(self, last_use_frame_index: u32) -> bool {
        u64::from(last_use_frame_index) + u64::from(self.frame_in_use_count)
            < u64::from(self.current_frame_index)
    }
}

/// A pointer to mapped device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MappedPtr(NonNull<c_void>);

// SAFETY: A mapped pointer is a plain address. Synchronizing access to the memory behind it is
// the user's responsibility, as with any device memory.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    #[inline]
    pub(crate) const fn new(ptr: NonNull<c_void>) -> Self {
        MappedPtr(ptr)
    }

    /// Returns the pointer as a raw pointer.
    #[inline]
    pub const fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Returns the pointer as a `NonNull`.
    #[inline]
    pub const fn as_non_null(self) -> NonNull<c_void> {
        self.0
    }

    /// # Safety
    ///
    /// - `offset` must be within the mapped range.
    #[inline]
    pub(crate) unsafe fn add(self, offset: DeviceSize) -> Self {
        MappedPtr(unsafe { self.0.byte_add(offset as usize) })
    }
}

/// Arbitrary data that the user attaches to an allocation.
#[derive(Clone, Default)]
pub enum UserData {
    /// No user data.
    #[default]
    None,

    /// An opaque value.
    Opaque(Arc<dyn Any + Send + Sync>),

    /// A string, which requires [`AllocationCreateFlags::USER_DATA_COPY_STRING`].
    String(String),
}

impl UserData {
    /// Returns whether this user data may be stored in an allocation that was created with or
    /// without [`AllocationCreateFlags::USER_DATA_COPY_STRING`].
    pub(crate) fn is_compatible(&self, is_string: bool) -> bool {
        match self {
            UserData::None => true,
            UserData::Opaque(_) => !is_string,
            UserData::String(_) => is_string,
        }
    }

    /// Returns the string, if this is string user data.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            UserData::String(string) => Some(string),
            _ => None,
        }
    }
}

impl Debug for UserData {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            UserData::None => f.write_str("None"),
            UserData::Opaque(_) => f.write_str("Opaque(..)"),
            UserData::String(string) => f.debug_tuple("String").field(string).finish(),
        }
    }
}

/// Parameters of an allocation, as returned by [`Allocator::get_allocation_info`].
///
/// [`Allocator::get_allocation_info`]: crate::Allocator::get_allocation_info
#[derive(Clone, Debug)]
pub struct AllocationInfo {
    /// The memory type that the allocation was made from, or `None` if the allocation is lost.
    pub memory_type_index: Option<u32>,

    /// The memory object that the allocation resides in, or null if the allocation is lost.
    ///
    /// The same memory object can be shared by multiple allocations, and it can change after
    /// defragmentation.
    pub device_memory: vk::DeviceMemory,

    /// The offset of the allocation within `device_memory`, or zero if the allocation is lost.
    ///
    /// This can change after defragmentation.
    pub offset: DeviceSize,

    /// The size of the allocation in bytes.
    pub size: DeviceSize,

    /// The pointer to the start of the allocation if it is currently mapped.
    pub mapped_ptr: Option<MappedPtr>,

    /// The user data of the allocation.
    pub user_data: UserData,
}

/// A region of device memory handed out by an [`Allocator`].
///
/// Allocations are reference-counted handles. They must be given back with
/// [`Allocator::free_memory`], including allocations that became lost; dropping the last handle
/// of an allocation that was never freed leaks its memory until the allocator is dropped.
///
/// [`Allocator`]: crate::Allocator
/// [`Allocator::free_memory`]: crate::Allocator::free_memory
pub struct Allocation {
    size: DeviceSize,
    alignment: DeviceAlignment,
    memory_type_index: Option<u32>,
    allocation_type: AllocationType,
    can_become_lost: bool,
    user_data_is_string: bool,
    pool: Option<Pool>,
    last_use_frame_index: AtomicU32,
    state: Mutex<AllocationState>,
}

struct AllocationState {
    kind: AllocationKind,
    // Number of times the user mapped the allocation, not counting a persistent mapping.
    map_count: u8,
    persistent_map: bool,
    user_data: UserData,
}

enum AllocationKind {
    Block {
        block: Arc<BlockMemory>,
        offset: DeviceSize,
    },
    Dedicated {
        memory: vk::DeviceMemory,
        mapped_ptr: Option<MappedPtr>,
    },
    // An allocation that was created lost, and never had any memory.
    Lost,
}

impl Allocation {
    pub(crate) fn new_block(
        block: Arc<BlockMemory>,
        offset: DeviceSize,
        layout: DeviceLayout,
        allocation_type: AllocationType,
        flags: AllocationCreateFlags,
        pool: Option<Pool>,
        current_frame_index: u32,
        user_data: UserData,
    ) -> Arc<Self> {
        Arc::new(Allocation {
            size: layout.size(),
            alignment: layout.alignment(),
            memory_type_index: Some(block.memory_type_index()),
            allocation_type,
            can_become_lost: flags.intersects(AllocationCreateFlags::CAN_BECOME_LOST),
            user_data_is_string: flags.intersects(AllocationCreateFlags::USER_DATA_COPY_STRING),
            pool,
            last_use_frame_index: AtomicU32::new(current_frame_index),
            state: Mutex::new(AllocationState {
                kind: AllocationKind::Block { block, offset },
                map_count: 0,
                persistent_map: flags.intersects(AllocationCreateFlags::MAPPED),
                user_data,
            }),
        })
    }

    pub(crate) fn new_dedicated(
        memory: vk::DeviceMemory,
        memory_type_index: u32,
        layout: DeviceLayout,
        allocation_type: AllocationType,
        mapped_ptr: Option<MappedPtr>,
        flags: AllocationCreateFlags,
        current_frame_index: u32,
        user_data: UserData,
    ) -> Arc<Self> {
        Arc::new(Allocation {
            size: layout.size(),
            alignment: layout.alignment(),
            memory_type_index: Some(memory_type_index),
            allocation_type,
            can_become_lost: false,
            user_data_is_string: flags.intersects(AllocationCreateFlags::USER_DATA_COPY_STRING),
            pool: None,
            last_use_frame_index: AtomicU32::new(current_frame_index),
            state: Mutex::new(AllocationState {
                kind: AllocationKind::Dedicated { memory, mapped_ptr },
                map_count: 0,
                persistent_map: mapped_ptr.is_some(),
                user_data,
            }),
        })
    }

    pub(crate) fn new_lost() -> Arc<Self> {
        Arc::new(Allocation {
            size: 0,
            alignment: DeviceAlignment::MIN,
            memory_type_index: None,
            allocation_type: AllocationType::Unknown,
            can_become_lost: true,
            user_data_is_string: false,
            pool: None,
            last_use_frame_index: AtomicU32::new(FRAME_INDEX_LOST),
            state: Mutex::new(AllocationState {
                kind: AllocationKind::Lost,
                map_count: 0,
                persistent_map: false,
                user_data: UserData::None,
            }),
        })
    }

    /// Returns the size of the allocation in bytes.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the alignment that the allocation was made with.
    #[inline]
    pub fn alignment(&self) -> DeviceAlignment {
        self.alignment
    }

    /// Returns the memory type that the allocation was made from, or `None` for an allocation
    /// that was created lost.
    #[inline]
    pub fn memory_type_index(&self) -> Option<u32> {
        self.memory_type_index
    }

    #[inline]
    pub fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    #[inline]
    pub(crate) fn suballocation_type(&self) -> SuballocationType {
        self.allocation_type.into()
    }

    /// Returns whether the allocation was created with
    /// [`AllocationCreateFlags::CAN_BECOME_LOST`] and resides in a block.
    #[inline]
    pub fn can_become_lost(&self) -> bool {
        self.can_become_lost
    }

    /// Returns the custom pool that the allocation was made from.
    #[inline]
    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    /// Returns whether the allocation owns its own memory object.
    pub fn is_dedicated(&self) -> bool {
        matches!(self.state.lock().kind, AllocationKind::Dedicated { .. })
    }

    /// Returns the index of the frame in which the allocation was last used.
    #[inline]
    pub fn last_use_frame_index(&self) -> u32 {
        self.last_use_frame_index.load(Ordering::Acquire)
    }

    /// Returns whether the allocation has been made lost.
    #[inline]
    pub fn is_lost(&self) -> bool {
        self.last_use_frame_index() == FRAME_INDEX_LOST
    }

    /// Returns the offset of the allocation within its memory object.
    pub fn offset(&self) -> DeviceSize {
        match self.state.lock().kind {
            AllocationKind::Block { offset, .. } => offset,
            AllocationKind::Dedicated { .. } | AllocationKind::Lost => 0,
        }
    }

    /// Returns the memory object that the allocation resides in.
    pub fn device_memory(&self) -> vk::DeviceMemory {
        match &self.state.lock().kind {
            AllocationKind::Block { block, .. } => block.handle(),
            AllocationKind::Dedicated { memory, .. } => *memory,
            AllocationKind::Lost => vk::DeviceMemory::null(),
        }
    }

    /// Returns a copy of the user data of the allocation.
    pub fn user_data(&self) -> UserData {
        self.state.lock().user_data.clone()
    }

    /// Returns the block that the allocation resides in, if any.
    pub(crate) fn block(&self) -> Option<Arc<BlockMemory>> {
        match &self.state.lock().kind {
            AllocationKind::Block { block, .. } => Some(block.clone()),
            AllocationKind::Dedicated { .. } | AllocationKind::Lost => None,
        }
    }

    /// Returns how many references to the mapping of its memory the allocation holds, including
    /// a persistent mapping.
    pub(crate) fn map_ref_count(&self) -> u32 {
        let state = self.state.lock();

        u32::from(state.map_count) + u32::from(state.persistent_map)
    }

    /// Returns whether the allocation could be made lost in the given frame context.
    pub(crate) fn is_evictable(&self, frames: FrameContext) -> bool {
        if !self.can_become_lost {
            return false;
        }

        let last_use_frame_index = self.last_use_frame_index();

        last_use_frame_index != FRAME_INDEX_LOST && frames.allows_eviction(last_use_frame_index)
    }

    /// Marks the allocation as used in the given frame. Returns `false` if the allocation is
    /// lost.
    ///
    /// The last-use frame index never decreases, even when threads race with different frame
    /// indices.
    pub(crate) fn touch(&self, current_frame_index: u32) -> bool {
        let mut last_use_frame_index = self.last_use_frame_index();

        loop {
            if last_use_frame_index == FRAME_INDEX_LOST {
                return false;
            }

            if last_use_frame_index >= current_frame_index {
                return true;
            }

            match self.last_use_frame_index.compare_exchange_weak(
                last_use_frame_index,
                current_frame_index,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => last_use_frame_index = actual,
            }
        }
    }

    /// Makes the allocation lost if it can become lost and wasn't used within the frames-in-use
    /// window. Returns whether the allocation was made lost by this call.
    pub(crate) fn make_lost(&self, frames: FrameContext) -> bool {
        if !self.can_become_lost {
            return false;
        }

        let mut last_use_frame_index = self.last_use_frame_index();

        loop {
            if last_use_frame_index == FRAME_INDEX_LOST
                || !frames.allows_eviction(last_use_frame_index)
            {
                return false;
            }

            match self.last_use_frame_index.compare_exchange_weak(
                last_use_frame_index,
                FRAME_INDEX_LOST,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => last_use_frame_index = actual,
            }
        }
    }

    /// Returns the parameters of the allocation, assuming that it is not lost.
    pub(crate) fn info(&self) -> AllocationInfo {
        let state = self.state.lock();
        let is_mapped = state.map_count != 0 || state.persistent_map;

        let (device_memory, offset, mapped_ptr) = match &state.kind {
            AllocationKind::Block { block, offset } => {
                let mapped_ptr = block
                    .mapped_ptr()
                    .filter(|_| is_mapped)
                    // SAFETY: The allocation is inside the mapped block.
                    .map(|ptr| unsafe { ptr.add(*offset) });

                (block.handle(), *offset, mapped_ptr)
            }
            AllocationKind::Dedicated { memory, mapped_ptr } => (*memory, 0, *mapped_ptr),
            AllocationKind::Lost => (vk::DeviceMemory::null(), 0, None),
        };

        AllocationInfo {
            memory_type_index: self.memory_type_index,
            device_memory,
            offset,
            size: self.size,
            mapped_ptr,
            user_data: state.user_data.clone(),
        }
    }

    /// Returns the parameters of a lost allocation.
    pub(crate) fn lost_info(&self) -> AllocationInfo {
        AllocationInfo {
            memory_type_index: None,
            device_memory: vk::DeviceMemory::null(),
            offset: 0,
            size: self.size,
            mapped_ptr: None,
            user_data: self.user_data(),
        }
    }

    pub(crate) fn set_user_data(&self, user_data: UserData) -> Result<(), InvalidUsage> {
        if !user_data.is_compatible(self.user_data_is_string) {
            return Err(InvalidUsage::UserDataKindMismatch);
        }

        self.state.lock().user_data = user_data;

        Ok(())
    }

    /// Maps the allocation, returning a pointer to its start.
    ///
    /// # Safety
    ///
    /// - `device` must be the device that the allocation was made from.
    /// - The allocation must not have been freed.
    pub(crate) unsafe fn map(&self, device: &impl MemoryDevice) -> Result<MappedPtr, AllocationError> {
        let mut state = self.state.lock();
        let state = &mut *state;

        if state.map_count >= MAX_MAP_COUNT {
            return Err(AllocationError::InvalidUsage(InvalidUsage::TooManyMaps));
        }

        let ptr = match &mut state.kind {
            AllocationKind::Block { block, offset } => {
                let ptr = unsafe { block.map(device, 1) }?;

                // SAFETY: The allocation is inside the mapped block.
                unsafe { ptr.add(*offset) }
            }
            AllocationKind::Dedicated { memory, mapped_ptr } => match *mapped_ptr {
                Some(ptr) => ptr,
                None => {
                    let ptr = MappedPtr::new(unsafe { device.map_memory(*memory) }?);
                    *mapped_ptr = Some(ptr);

                    ptr
                }
            },
            AllocationKind::Lost => {
                return Err(AllocationError::InvalidUsage(InvalidUsage::AllocationLost));
            }
        };

        state.map_count += 1;

        Ok(ptr)
    }

    /// Undoes one call to [`map`].
    ///
    /// # Safety
    ///
    /// - `device` must be the device that the allocation was made from.
    /// - The allocation must not have been freed.
    ///
    /// [`map`]: Self::map
    pub(crate) unsafe fn unmap(&self, device: &impl MemoryDevice) -> Result<(), AllocationError> {
        let mut state = self.state.lock();
        let state = &mut *state;

        if state.map_count == 0 {
            return Err(AllocationError::InvalidUsage(InvalidUsage::NotMapped));
        }

        state.map_count -= 1;

        match &mut state.kind {
            AllocationKind::Block { block, .. } => unsafe { block.unmap(device, 1) },
            AllocationKind::Dedicated { memory, mapped_ptr } => {
                if state.map_count == 0 && !state.persistent_map {
                    *mapped_ptr = None;
                    unsafe { device.unmap_memory(*memory) };
                }
            }
            AllocationKind::Lost => {}
        }

        Ok(())
    }

    /// Moves the allocation to `offset` within `new_block`, carrying its references to the
    /// mapping of the old block over to the new one.
    ///
    /// # Safety
    ///
    /// - `device` must be the device that both blocks were allocated from.
    /// - The block vector must have moved the suballocation accordingly.
    pub(crate) unsafe fn change_block_allocation(
        &self,
        device: &impl MemoryDevice,
        new_block: &Arc<BlockMemory>,
        new_offset: DeviceSize,
    ) -> Result<(), vk::Result> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let map_ref_count = u32::from(state.map_count) + u32::from(state.persistent_map);

        debug_assert!(matches!(state.kind, AllocationKind::Block { .. }));

        if let AllocationKind::Block { block, offset } = &mut state.kind {
            if !Arc::ptr_eq(block, new_block) && map_ref_count > 0 {
                unsafe { new_block.map(device, map_ref_count) }?;
                unsafe { block.unmap(device, map_ref_count) };
            }

            *block = new_block.clone();
            *offset = new_offset;
        }

        Ok(())
    }

    /// Takes the memory object and mapped pointer of a dedicated allocation, for freeing it.
    pub(crate) fn dedicated_memory(&self) -> Option<(vk::DeviceMemory, Option<MappedPtr>)> {
        match &self.state.lock().kind {
            AllocationKind::Dedicated { memory, mapped_ptr } => Some((*memory, *mapped_ptr)),
            AllocationKind::Block { .. } | AllocationKind::Lost => None,
        }
    }
}

impl Debug for Allocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Allocation")
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("memory_type_index", &self.memory_type_index)
            .field("allocation_type", &self.allocation_type)
            .field("can_become_lost", &self.can_become_lost)
            .field("last_use_frame_index", &self.last_use_frame_index())
            .finish_non_exhaustive()
    }
}
