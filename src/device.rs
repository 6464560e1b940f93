//! The seam between the allocator and the native API.

use crate::DeviceSize;
use std::{
    error::Error,
    fmt::{self, Display},
};

/// A device that can allocate and free whole memory objects, for the allocator to suballocate.
///
/// This is the only point at which the allocator touches the native API. Implementations wrap
/// whatever entry points the backend provides for device-memory allocation; for Vulkan that would
/// be `vkAllocateMemory` and `vkFreeMemory` with the given memory type index.
///
/// Allocating a memory object is expensive and implementations commonly limit how many may exist
/// at once, which is the reason this crate suballocates them instead of handing every resource
/// its own.
pub trait MemoryDevice {
    /// Opaque handle to one physically-backed memory object.
    ///
    /// Handles are cloned into every allocation made from the object, so that callers can bind
    /// resources against it; they must therefore be cheap to clone.
    type Memory: Clone;

    /// Allocates a new memory object of the given size from the given memory type.
    ///
    /// This call may have unbounded latency dictated by the driver. The allocator invokes it only
    /// when no existing chunk can satisfy a request.
    fn allocate_memory(
        &self,
        size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<Self::Memory, OutOfDeviceMemory>;

    /// Frees a memory object previously returned by [`allocate_memory`].
    ///
    /// The allocator guarantees that no suballocations of the object are tracked as occupied when
    /// this is called.
    ///
    /// [`allocate_memory`]: Self::allocate_memory
    fn deallocate_memory(&self, memory: Self::Memory);
}

/// Error returned when the device fails to allocate a memory object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfDeviceMemory;

impl Error for OutOfDeviceMemory {}

impl Display for OutOfDeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the device has run out of memory")
    }
}
