//! The memory-type table a device exposes.
//!
//! [`MemoryProperties`] is supplied once when constructing a
//! [`DeviceMemoryAllocator`](crate::DeviceMemoryAllocator) and is immutable for the allocator's
//! lifetime. The allocator only ever looks at the property flags and heap indices; everything
//! else about the table is the backend's business.

use crate::DeviceSize;
use std::{
    fmt,
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign},
};

/// The maximum number of memory types a device may expose.
pub const MAX_MEMORY_TYPES: usize = 32;

/// Properties of the memory available to a device.
#[derive(Clone, Debug, Default)]
pub struct MemoryProperties {
    /// The available memory types.
    pub memory_types: Vec<MemoryType>,

    /// The available memory heaps.
    pub memory_heaps: Vec<MemoryHeap>,
}

/// A memory type exposed by a device.
#[derive(Clone, Copy, Debug)]
pub struct MemoryType {
    /// The properties of this memory type.
    pub property_flags: MemoryPropertyFlags,

    /// The index of the memory heap that this memory type corresponds to.
    pub heap_index: u32,
}

/// A memory heap exposed by a device.
#[derive(Clone, Copy, Debug)]
pub struct MemoryHeap {
    /// The size of the heap in bytes.
    pub size: DeviceSize,
}

/// Properties of a memory type.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MemoryPropertyFlags(u32);

impl MemoryPropertyFlags {
    /// The memory is located on the device. Device-local memory is typically the fastest for the
    /// device to access and is preferred for data that only the device touches.
    pub const DEVICE_LOCAL: Self = Self(1 << 0);

    /// The memory can be mapped into the address space of the host and accessed as regular RAM.
    pub const HOST_VISIBLE: Self = Self(1 << 1);

    /// Host writes and device writes are coherent without explicit flushes or invalidations.
    pub const HOST_COHERENT: Self = Self(1 << 2);

    /// The memory is cached by the host, making reads and random access from the host fast.
    pub const HOST_CACHED: Self = Self(1 << 3);

    /// The memory is committed lazily by the implementation, based on need.
    pub const LAZILY_ALLOCATED: Self = Self(1 << 4);

    /// Only the device can access the memory, and only protected operations may do so.
    pub const PROTECTED: Self = Self(1 << 5);

    /// Returns a `MemoryPropertyFlags` with none of the flags set.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns whether no flags are set in `self`.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns whether all flags in `other` are set in `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns whether any flags are set in both `self` and `other`.
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns the union of `self` and `other`.
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns the intersection of `self` and `other`.
    #[inline]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }
}

impl BitOr for MemoryPropertyFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for MemoryPropertyFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl BitAnd for MemoryPropertyFlags {
    type Output = Self;

    #[inline]
    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

impl BitAndAssign for MemoryPropertyFlags {
    #[inline]
    fn bitand_assign(&mut self, rhs: Self) {
        *self = self.intersection(rhs);
    }
}

impl fmt::Debug for MemoryPropertyFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(MemoryPropertyFlags, &str); 6] = [
            (MemoryPropertyFlags::DEVICE_LOCAL, "DEVICE_LOCAL"),
            (MemoryPropertyFlags::HOST_VISIBLE, "HOST_VISIBLE"),
            (MemoryPropertyFlags::HOST_COHERENT, "HOST_COHERENT"),
            (MemoryPropertyFlags::HOST_CACHED, "HOST_CACHED"),
            (MemoryPropertyFlags::LAZILY_ALLOCATED, "LAZILY_ALLOCATED"),
            (MemoryPropertyFlags::PROTECTED, "PROTECTED"),
        ];

        if self.is_empty() {
            return f.write_str("empty()");
        }

        let mut first = true;

        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }

        Ok(())
    }
}
