//! Suballocation of a single region of device memory.
//!
//! The [`FreeListSuballocator`] is the *block* layered over exactly one chunk of device memory:
//! it tracks which byte ranges of its [region] are occupied and which are free, places new
//! suballocations into free ranges, and merges neighboring free ranges back together when a
//! suballocation is freed.
//!
//! [region]: Region

use crate::{align_up, is_aligned, DeviceLayout, DeviceSize};
use foldhash::HashMap;
use smallvec::{smallvec, SmallVec};
use std::{
    error::Error,
    fmt::{self, Display},
};

/// A region of device memory for a suballocator to place suballocations in.
///
/// In order to prevent arithmetic overflow when allocating, the region's end must not exceed
/// [`DeviceLayout::MAX_SIZE`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    offset: DeviceSize,
    size: DeviceSize,
}

impl Region {
    /// Creates a new `Region` from the given `offset` and `size`.
    ///
    /// Returns [`None`] if the end of the region would exceed [`DeviceLayout::MAX_SIZE`].
    #[inline]
    pub const fn new(offset: DeviceSize, size: DeviceSize) -> Option<Self> {
        if offset.saturating_add(size) <= DeviceLayout::MAX_SIZE {
            Some(Region { offset, size })
        } else {
            None
        }
    }

    /// Returns the offset where the region begins.
    #[inline]
    pub const fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// Returns the size of the region.
    #[inline]
    pub const fn size(&self) -> DeviceSize {
        self.size
    }
}

/// A suballocation made using a [`FreeListSuballocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Suballocation {
    /// The **absolute** offset within the [region]. That means that this is already offset by the
    /// region's offset, **not relative to the beginning of the region**. This offset is aligned
    /// to the requested alignment.
    ///
    /// [region]: Region
    pub offset: DeviceSize,

    /// The size of the suballocation. This is exactly equal to the requested size.
    pub size: DeviceSize,
}

/// A suballocator managing the free and occupied ranges of one region.
///
/// The free ranges are kept sorted by offset and a new suballocation is placed into the *first*
/// free range that can hold it after alignment: first-fit. This favors scan cost over
/// fragmentation-minimizing placement such as best-fit, and makes a freed range the preferred
/// target for the next request of the same size. Adjacent free ranges are merged on every
/// deallocation, so fragmentation is bounded by the number of live suballocations rather than by
/// the total churn the suballocator has seen.
///
/// # Invariants
///
/// At all times, the free ranges and the occupied suballocations partition the region exactly:
/// they never overlap, and their union is the region's whole byte range. No two free ranges are
/// ever byte-adjacent.
#[derive(Debug)]
pub struct FreeListSuballocator {
    region: Region,
    free_size: DeviceSize,
    // Free ranges sorted by offset, never adjacent, never overlapping.
    free_list: SmallVec<[FreeRange; 8]>,
    // Occupied suballocations keyed by offset, for release lookups and double-free detection.
    occupied: HashMap<DeviceSize, DeviceSize>,
}

#[derive(Clone, Copy, Debug)]
struct FreeRange {
    offset: DeviceSize,
    size: DeviceSize,
}

impl FreeListSuballocator {
    /// Creates a new `FreeListSuballocator` for the given [region].
    ///
    /// [region]: Region
    pub fn new(region: Region) -> Self {
        FreeListSuballocator {
            region,
            free_size: region.size(),
            free_list: smallvec![FreeRange {
                offset: region.offset(),
                size: region.size(),
            }],
            occupied: HashMap::default(),
        }
    }

    /// Creates a new suballocation within the region.
    ///
    /// The free ranges are scanned in offset order and the suballocation is placed at the lowest
    /// aligned offset that fits. Leading padding caused by alignment stays in the free list, and
    /// trailing slack is returned to it as a new free range.
    ///
    /// # Errors
    ///
    /// - Returns [`SuballocatorError::OutOfRegionMemory`] if no free range is large enough to
    ///   satisfy the request. The suballocator is left unchanged.
    pub fn allocate(&mut self, layout: DeviceLayout) -> Result<Suballocation, SuballocatorError> {
        let size = layout.size();
        let alignment = layout.alignment();

        for (index, &range) in self.free_list.iter().enumerate() {
            // This can't overflow because regions are bounded by `DeviceLayout::MAX_SIZE`.
            let offset = align_up(range.offset, alignment);
            let padding = offset - range.offset;

            if padding + size <= range.size {
                debug_assert!(is_aligned(offset, alignment));

                let trailing = range.size - padding - size;

                match (padding > 0, trailing > 0) {
                    (false, false) => {
                        self.free_list.remove(index);
                    }
                    (true, false) => {
                        self.free_list[index].size = padding;
                    }
                    (false, true) => {
                        self.free_list[index] = FreeRange {
                            offset: offset + size,
                            size: trailing,
                        };
                    }
                    (true, true) => {
                        self.free_list[index].size = padding;
                        self.free_list.insert(
                            index + 1,
                            FreeRange {
                                offset: offset + size,
                                size: trailing,
                            },
                        );
                    }
                }

                self.free_size -= size;
                self.occupied.insert(offset, size);

                return Ok(Suballocation { offset, size });
            }
        }

        Err(SuballocatorError::OutOfRegionMemory)
    }

    /// Deallocates the given `suballocation`, returning its range to the free list and merging it
    /// with the preceding and/or following free range if they are byte-adjacent.
    ///
    /// # Errors
    ///
    /// - Returns [`SuballocatorError::InvalidSuballocation`] if `suballocation` is not currently
    ///   tracked as occupied, which means it was either never allocated here or has already been
    ///   deallocated. The suballocator is left unchanged.
    pub fn deallocate(&mut self, suballocation: Suballocation) -> Result<(), SuballocatorError> {
        let Suballocation { offset, size } = suballocation;

        match self.occupied.get(&offset) {
            Some(&tracked_size) if tracked_size == size => {
                self.occupied.remove(&offset);
            }
            _ => return Err(SuballocatorError::InvalidSuballocation),
        }

        let index = self.free_list.partition_point(|range| range.offset < offset);

        let merges_prev = index > 0 && {
            let prev = self.free_list[index - 1];
            prev.offset + prev.size == offset
        };
        let merges_next = index < self.free_list.len() && {
            offset + size == self.free_list[index].offset
        };

        match (merges_prev, merges_next) {
            (true, true) => {
                let next = self.free_list.remove(index);
                self.free_list[index - 1].size += size + next.size;
            }
            (true, false) => {
                self.free_list[index - 1].size += size;
            }
            (false, true) => {
                let next = &mut self.free_list[index];
                next.size += size;
                next.offset = offset;
            }
            (false, false) => {
                self.free_list.insert(index, FreeRange { offset, size });
            }
        }

        self.free_size += size;

        Ok(())
    }

    /// Returns the region this suballocator was created with.
    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    /// Returns the total amount of free space left in the region.
    ///
    /// Note that this is the sum of all free ranges; a request of this size may still fail due to
    /// alignment or fragmentation.
    #[inline]
    pub fn free_size(&self) -> DeviceSize {
        self.free_size
    }

    /// Returns whether the suballocator has no occupied suballocations.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.occupied.is_empty()
    }

    /// Returns an iterator over the free and occupied ranges of the region, in offset order.
    pub fn suballocations(&self) -> impl ExactSizeIterator<Item = SuballocationNode> {
        let mut nodes: Vec<SuballocationNode> = self
            .free_list
            .iter()
            .map(|range| SuballocationNode {
                offset: range.offset,
                size: range.size,
                ty: SuballocationType::Free,
            })
            .chain(self.occupied.iter().map(|(&offset, &size)| {
                SuballocationNode {
                    offset,
                    size,
                    ty: SuballocationType::Occupied,
                }
            }))
            .collect();

        nodes.sort_unstable_by_key(|node| node.offset);

        nodes.into_iter()
    }
}

/// A node within a [suballocator]'s list of ranges, as reported by
/// [`FreeListSuballocator::suballocations`].
///
/// [suballocator]: FreeListSuballocator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SuballocationNode {
    /// The **absolute** offset within the [region].
    ///
    /// [region]: Region
    pub offset: DeviceSize,

    /// The size of the range.
    pub size: DeviceSize,

    /// Whether the range is free or occupied.
    pub ty: SuballocationType,
}

/// Tells us if a range within a [suballocator]'s region is occupied by a suballocation or free.
///
/// [suballocator]: FreeListSuballocator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SuballocationType {
    /// The range is occupied by a live suballocation.
    Occupied,

    /// The range is free.
    Free,
}

/// Error that can be returned when using a [`FreeListSuballocator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuballocatorError {
    /// There is no more space available in the region.
    OutOfRegionMemory,

    /// The given suballocation is not currently tracked as occupied.
    InvalidSuballocation,
}

impl Error for SuballocatorError {}

impl Display for SuballocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfRegionMemory => "out of region memory",
            Self::InvalidSuballocation => "the suballocation is not tracked as occupied",
        };

        f.write_str(msg)
    }
}
