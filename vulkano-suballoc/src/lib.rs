// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A general-purpose suballocator for Vulkan device memory.
//!
//! Allocating `VkDeviceMemory` is expensive, and implementations put a pretty low limit on the
//! number of memory objects that can exist at the same time. This crate amortizes that cost by
//! requesting large *blocks* of device memory and handing out regions of those blocks, which we
//! call *suballocations*, to the application.
//!
//! # Overview
//!
//! - The [`Allocator`] is the entry point. It owns one block vector per memory type, any number
//!   of custom [`Pool`]s, and the list of dedicated allocations.
//! - A block vector owns a growable set of blocks for one memory type and decides which block an
//!   allocation goes into, when new blocks are created and when empty blocks are released.
//! - Each block owns one `VkDeviceMemory` object together with the metadata that tracks its used
//!   and free ranges and implements the best-fit search.
//! - An [`Allocation`] is the handle returned to the application. It is either bound to a range
//!   inside a block or owns a dedicated memory object.
//!
//! # Lost allocations
//!
//! Allocations created with [`AllocationCreateFlags::CAN_BECOME_LOST`] may be reclaimed by the
//! allocator when another allocation with [`AllocationCreateFlags::CAN_MAKE_OTHER_LOST`] needs
//! the space, as long as they haven't been used during the last `frame_in_use_count` frames.
//! Whether an allocation is still alive is checked, and its lifetime extended, with
//! [`Allocator::touch_allocation`]. A lost allocation still has to be freed.
//!
//! # Defragmentation
//!
//! [`Allocator::defragment`] moves the contents of host-visible block allocations toward fewer,
//! better-packed blocks and rewrites their offsets. Resources bound to moved allocations must be
//! recreated and bound again by the application.
//!
//! # The device
//!
//! The allocator never calls Vulkan directly. Instead it goes through the [`MemoryDevice`]
//! trait, which is implemented for Ash by [`AshMemoryDevice`].

pub use self::{
    allocation::{Allocation, AllocationInfo, AllocationType, MappedPtr, UserData},
    allocator::{
        AllocationCreateFlags, AllocationCreateInfo, AllocationError, Allocator,
        AllocatorCreateInfo, DeviceMemoryCallback, DeviceMemoryCallbacks, InvalidUsage,
        MemoryUsage,
    },
    block_vector::{Pool, PoolCreateFlags, PoolCreateInfo},
    defragment::{DefragmentationInfo, DefragmentationOutcome, DefragmentationStats},
    device::{
        AshMemoryDevice, MemoryDevice, MemoryHeap, MemoryProperties, MemoryRequirements,
        MemoryType,
    },
    layout::{align_down, align_up, DeviceAlignment, DeviceLayout},
    metadata::ValidationError,
    stats::{PoolStats, StatInfo, Stats},
};

/// Represents memory size and offset values on a Vulkan device.
/// Analogous to the Rust `usize` type on the host.
pub use ash::vk::DeviceSize;

/// A [`DeviceSize`] that is known not to equal zero.
pub type NonZeroDeviceSize = std::num::NonZeroU64;

mod allocation;
mod allocator;
mod block;
mod block_vector;
mod defragment;
mod device;
mod layout;
mod metadata;
mod stats;
#[cfg(test)]
mod tests;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)] // add traits as needed
pub struct NonExhaustive(pub(crate) ());

const B: DeviceSize = 1;
const K: DeviceSize = 1024 * B;
const M: DeviceSize = 1024 * K;
const G: DeviceSize = 1024 * M;

/// The maximum number of memory types a Vulkan implementation can report.
pub const MAX_MEMORY_TYPES: usize = ash::vk::MAX_MEMORY_TYPES;

/// The maximum number of memory heaps a Vulkan implementation can report.
pub const MAX_MEMORY_HEAPS: usize = ash::vk::MAX_MEMORY_HEAPS;
