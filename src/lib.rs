//! Device-memory sub-allocation for Vulkan-like graphics APIs.
//!
//! Native device-memory allocations are expensive and implementations limit how many of them may
//! exist at once, so resources should not each get their own. Instead, this crate allocates a
//! small number of large *chunks* and places resources into sub-ranges of them. Memory is managed
//! in a small hierarchy:
//!
//! - **Chunk**: a single physically-backed allocation obtained from the native API through the
//!   [`MemoryDevice`] trait.
//! - **Block**: the [`FreeListSuballocator`] layered over exactly one chunk, tracking which byte
//!   ranges of the chunk are occupied and which are free.
//! - **Region**: a caller-visible handle ([`DeviceMemoryAlloc`]) to a placed, in-use sub-range of
//!   a chunk, carrying the native handle and the offset needed to bind a resource.
//!
//! The entry point is [`DeviceMemoryAllocator`], which owns the chunks of every memory type and
//! exposes the allocate/deallocate/usage surface. It is generic over a [`MemoryDevice`], the one
//! seam to the native API, so any backend that can allocate and free whole memory objects can sit
//! underneath it.
//!
//! # Example
//!
//! ```
//! use devmem::{
//!     DeviceLayout, DeviceMemoryAllocator, DeviceMemoryAllocatorCreateInfo, DeviceSize,
//!     MemoryDevice, MemoryHeap, MemoryProperties, MemoryPropertyFlags, MemoryType,
//!     OutOfDeviceMemory,
//! };
//!
//! // A stand-in for a real backend. An `ash`-based implementation would call
//! // `vkAllocateMemory` / `vkFreeMemory` here.
//! struct Device;
//!
//! impl MemoryDevice for Device {
//!     type Memory = ();
//!
//!     fn allocate_memory(
//!         &self,
//!         _size: DeviceSize,
//!         _memory_type_index: u32,
//!     ) -> Result<Self::Memory, OutOfDeviceMemory> {
//!         Ok(())
//!     }
//!
//!     fn deallocate_memory(&self, _memory: Self::Memory) {}
//! }
//!
//! let memory_properties = MemoryProperties {
//!     memory_types: vec![MemoryType {
//!         property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
//!         heap_index: 0,
//!     }],
//!     memory_heaps: vec![MemoryHeap { size: 1 << 30 }],
//! };
//!
//! let allocator = DeviceMemoryAllocator::new(
//!     Device,
//!     &memory_properties,
//!     DeviceMemoryAllocatorCreateInfo::default(),
//! );
//!
//! let layout = DeviceLayout::from_size_alignment(1024, 256).unwrap();
//! let alloc = allocator
//!     .allocate(layout, !0, MemoryPropertyFlags::DEVICE_LOCAL)
//!     .unwrap();
//! assert_eq!(alloc.offset() % 256, 0);
//! allocator.deallocate(alloc).unwrap();
//! ```

pub use self::{
    allocator::{
        ChunkId, DeviceMemoryAlloc, DeviceMemoryAllocator, DeviceMemoryAllocatorCreateInfo,
        MemoryAllocatorError, MemoryUsage,
    },
    device::{MemoryDevice, OutOfDeviceMemory},
    layout::{DeviceAlignment, DeviceLayout},
    memory::{MemoryHeap, MemoryProperties, MemoryPropertyFlags, MemoryType},
    suballocator::{
        FreeListSuballocator, Region, Suballocation, SuballocationNode, SuballocationType,
        SuballocatorError,
    },
};

pub mod allocator;
pub mod device;
pub mod layout;
pub mod memory;
pub mod suballocator;

/// Represents an amount of device memory, in bytes.
pub type DeviceSize = u64;

/// A [`DeviceSize`] that is known not to equal zero.
pub type NonZeroDeviceSize = std::num::NonZeroU64;

pub(crate) const fn align_up(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    align_down(val + (alignment.as_devicesize() - 1), alignment)
}

pub(crate) const fn align_down(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    val & !(alignment.as_devicesize() - 1)
}

pub(crate) const fn is_aligned(val: DeviceSize, alignment: DeviceAlignment) -> bool {
    val & (alignment.as_devicesize() - 1) == 0
}
