//! Size and alignment of device-memory allocation requests.

use crate::{DeviceSize, NonZeroDeviceSize};
use std::{
    error::Error,
    fmt::{self, Debug, Display},
};

/// The layout of a device-memory allocation request: a non-zero size together with a power-of-two
/// alignment.
///
/// Constructing the layout up front means the allocator never has to validate sizes and alignments
/// per call: a `DeviceLayout` is always valid to allocate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceLayout {
    size: NonZeroDeviceSize,
    alignment: DeviceAlignment,
}

impl DeviceLayout {
    /// The maximum size of a memory block after its layout's size has been rounded up to the
    /// nearest multiple of its layout's alignment.
    ///
    /// This invariant is enforced to avoid arithmetic overflows when rounding offsets and sizes up
    /// to the alignment.
    pub const MAX_SIZE: DeviceSize = DeviceAlignment::MAX.as_devicesize() - 1;

    /// Creates a new `DeviceLayout` from the given `size` and `alignment`.
    ///
    /// Returns [`None`] if `size` is zero, `alignment` is not a power of two, or if `size` would
    /// exceed [`DeviceLayout::MAX_SIZE`] when rounded up to the nearest multiple of `alignment`.
    #[inline]
    pub const fn from_size_alignment(size: DeviceSize, alignment: DeviceSize) -> Option<Self> {
        if let (Some(size), Some(alignment)) = (
            NonZeroDeviceSize::new(size),
            DeviceAlignment::new(alignment),
        ) {
            DeviceLayout::new(size, alignment)
        } else {
            None
        }
    }

    /// Creates a new `DeviceLayout` from the given `size` and `alignment`.
    ///
    /// Returns [`None`] if `size` would exceed [`DeviceLayout::MAX_SIZE`] when rounded up to the
    /// nearest multiple of `alignment`.
    #[inline]
    pub const fn new(size: NonZeroDeviceSize, alignment: DeviceAlignment) -> Option<Self> {
        if size.get() > Self::max_size_for_alignment(alignment) {
            None
        } else {
            Some(DeviceLayout { size, alignment })
        }
    }

    // `DeviceLayout::MAX_SIZE` is `DeviceAlignment::MAX - 1`, so this can't overflow.
    const fn max_size_for_alignment(alignment: DeviceAlignment) -> DeviceSize {
        DeviceLayout::MAX_SIZE - (alignment.as_devicesize() - 1)
    }

    /// Returns the minimum size in bytes for a memory block of this layout.
    #[inline]
    pub const fn size(&self) -> DeviceSize {
        self.size.get()
    }

    /// Returns the minimum alignment for a memory block of this layout.
    #[inline]
    pub const fn alignment(&self) -> DeviceAlignment {
        self.alignment
    }
}

/// A [`DeviceSize`] that is guaranteed to be a power of two, and therefore a valid alignment for
/// device memory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DeviceAlignment(NonZeroDeviceSize);

impl DeviceAlignment {
    /// The smallest possible alignment, 1.
    pub const MIN: Self = Self(NonZeroDeviceSize::MIN);

    /// The largest possible alignment, 2<sup>63</sup>.
    // SAFETY: `1 << 63` is a power of two.
    pub const MAX: Self = Self(unsafe { NonZeroDeviceSize::new_unchecked(1 << 63) });

    /// Tries to create a `DeviceAlignment` from a [`DeviceSize`], returning [`None`] if it's not
    /// a power of two.
    #[inline]
    pub const fn new(alignment: DeviceSize) -> Option<Self> {
        if alignment.is_power_of_two() {
            // SAFETY: A power of two is never zero.
            Some(Self(unsafe { NonZeroDeviceSize::new_unchecked(alignment) }))
        } else {
            None
        }
    }

    /// Returns the alignment as a [`DeviceSize`].
    #[inline]
    pub const fn as_devicesize(self) -> DeviceSize {
        self.0.get()
    }

    /// Returns the alignment as a [`NonZeroDeviceSize`].
    #[inline]
    pub const fn as_nonzero(self) -> NonZeroDeviceSize {
        self.0
    }

    /// Returns the base-2 logarithm of the alignment.
    #[inline]
    pub const fn log2(self) -> u32 {
        self.0.trailing_zeros()
    }
}

impl Debug for DeviceAlignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (1 << {:?})", self.as_nonzero(), self.log2())
    }
}

impl TryFrom<DeviceSize> for DeviceAlignment {
    type Error = TryFromIntError;

    #[inline]
    fn try_from(alignment: DeviceSize) -> Result<Self, Self::Error> {
        DeviceAlignment::new(alignment).ok_or(TryFromIntError)
    }
}

impl From<DeviceAlignment> for DeviceSize {
    #[inline]
    fn from(alignment: DeviceAlignment) -> Self {
        alignment.as_devicesize()
    }
}

/// Error that can happen when converting a [`DeviceSize`] to a [`DeviceAlignment`].
///
/// It occurs when the value is not a power of two.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TryFromIntError;

impl Error for TryFromIntError {}

impl Display for TryFromIntError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("attempted to convert a non-power-of-two value to a `DeviceAlignment`")
    }
}
