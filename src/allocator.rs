//! The top-level device-memory allocator.
//!
//! See [`DeviceMemoryAllocator`].

use crate::{
    device::{MemoryDevice, OutOfDeviceMemory},
    layout::DeviceLayout,
    memory::{MemoryProperties, MemoryPropertyFlags, MemoryType, MAX_MEMORY_TYPES},
    suballocator::{FreeListSuballocator, Region, Suballocation},
    DeviceSize,
};
use log::debug;
use parking_lot::Mutex;
use std::{
    cmp,
    error::Error,
    fmt::{self, Display},
    mem,
};

/// A device-memory allocator that suballocates large chunks instead of making one native
/// allocation per resource.
///
/// The allocator keeps a pool of chunks for each memory type the device exposes. An allocation
/// request first resolves a memory type from the request's type bitmask and required property
/// flags, then scans that type's chunks in order and places the request into the first chunk
/// whose [`FreeListSuballocator`] has room: first-fit at both levels. Only when no chunk has room
/// is a new one allocated from the [`MemoryDevice`], sized to at least
/// [`chunk_size`](DeviceMemoryAllocatorCreateInfo::chunk_size) so that native allocation calls
/// stay rare.
///
/// Chunks are not returned to the device when they become empty, unless
/// [`free_empty_chunks`](DeviceMemoryAllocatorCreateInfo::free_empty_chunks) is set. An empty
/// chunk costs memory but makes the next allocation of its type cheap; callers that prefer to
/// reclaim the memory can call [`compact`](Self::compact) at a safe point such as between frames.
/// All chunks are freed when the allocator is dropped.
///
/// # Locking behavior
///
/// All operations serialize on one internal lock covering every pool, because an allocation may
/// need to inspect several chunks atomically with respect to releases. The lock is never held
/// across anything but the allocator's own bookkeeping and the [`MemoryDevice`] call that grows a
/// pool; it is not shared with any other part of the system.
pub struct DeviceMemoryAllocator<D: MemoryDevice> {
    device: D,
    // The immutable memory-type table, supplied at construction.
    memory_types: Vec<MemoryType>,
    chunk_size: DeviceSize,
    free_empty_chunks: bool,
    pools: Mutex<Vec<Pool<D::Memory>>>,
}

#[derive(Debug)]
struct Pool<M> {
    // Freed chunks leave a `None` tombstone behind so that the `ChunkId`s of outstanding
    // allocations keep pointing at the right slot.
    chunks: Vec<Option<Chunk<M>>>,
}

#[derive(Debug)]
struct Chunk<M> {
    memory: M,
    size: DeviceSize,
    suballocator: FreeListSuballocator,
}

impl<D: MemoryDevice> DeviceMemoryAllocator<D> {
    /// Creates a new `DeviceMemoryAllocator` managing memory of the given `device`.
    ///
    /// `memory_properties` is the device's memory-type table. It is captured once and assumed
    /// immutable, which is what makes [type resolution](Self::find_memory_type_index)
    /// deterministic.
    ///
    /// # Panics
    ///
    /// - Panics if `memory_properties.memory_types` has more than [`MAX_MEMORY_TYPES`] entries or
    ///   contains a heap index out of bounds of `memory_properties.memory_heaps`.
    /// - Panics if `create_info.chunk_size` is zero or exceeds [`DeviceLayout::MAX_SIZE`].
    pub fn new(
        device: D,
        memory_properties: &MemoryProperties,
        create_info: DeviceMemoryAllocatorCreateInfo,
    ) -> Self {
        let DeviceMemoryAllocatorCreateInfo {
            chunk_size,
            free_empty_chunks,
        } = create_info;

        assert!(
            memory_properties.memory_types.len() <= MAX_MEMORY_TYPES,
            "`memory_properties.memory_types` must not have more than `MAX_MEMORY_TYPES` entries",
        );
        assert!(
            memory_properties
                .memory_types
                .iter()
                .all(|memory_type| (memory_type.heap_index as usize)
                    < memory_properties.memory_heaps.len()),
            "`memory_properties.memory_types` must not contain out-of-bounds heap indices",
        );
        assert!(
            chunk_size != 0 && chunk_size <= DeviceLayout::MAX_SIZE,
            "`create_info.chunk_size` must be non-zero and not exceed `DeviceLayout::MAX_SIZE`",
        );

        let memory_types = memory_properties.memory_types.clone();
        let pools = (0..memory_types.len())
            .map(|_| Pool { chunks: Vec::new() })
            .collect();

        DeviceMemoryAllocator {
            device,
            memory_types,
            chunk_size,
            free_empty_chunks,
            pools: Mutex::new(pools),
        }
    }

    /// Returns the device this allocator was created with.
    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Finds the lowest-indexed memory type that is contained in `memory_type_bits` and whose
    /// property flags are a superset of `required_properties`.
    ///
    /// The memory-type table is immutable, so for fixed arguments the result never changes.
    #[inline]
    pub fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        required_properties: MemoryPropertyFlags,
    ) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .find_map(|(index, memory_type)| {
                (memory_type_bits & (1 << index) != 0
                    && memory_type.property_flags.contains(required_properties))
                .then_some(index as u32)
            })
    }

    /// Allocates device memory for the given `layout`.
    ///
    /// `memory_type_bits` is a bitmask of the memory-type indices acceptable to the resource that
    /// will be bound, as reported by the native API's memory-requirements query;
    /// `required_properties` are the property flags the chosen memory type must have.
    ///
    /// On success the returned allocation's offset is aligned to `layout.alignment()` and its
    /// size equals `layout.size()`. On failure the allocator is left exactly as it was.
    ///
    /// # Errors
    ///
    /// - Returns [`MemoryAllocatorError::NoCompatibleMemoryType`] if no memory type satisfies
    ///   both `memory_type_bits` and `required_properties`. Retrying cannot succeed, since the
    ///   memory-type table never changes.
    /// - Returns [`MemoryAllocatorError::OutOfDeviceMemory`] if a new chunk was needed and the
    ///   device failed to allocate it. No smaller size is retried: the minimum viable size for
    ///   the request is already known.
    pub fn allocate(
        &self,
        layout: DeviceLayout,
        memory_type_bits: u32,
        required_properties: MemoryPropertyFlags,
    ) -> Result<DeviceMemoryAlloc<D::Memory>, MemoryAllocatorError> {
        let memory_type_index = self
            .find_memory_type_index(memory_type_bits, required_properties)
            .ok_or(MemoryAllocatorError::NoCompatibleMemoryType)?;

        let mut pools = self.pools.lock();
        let pool = &mut pools[memory_type_index as usize];

        // First-fit: take the first chunk of this memory type that has room.
        for (index, slot) in pool.chunks.iter_mut().enumerate() {
            let Some(chunk) = slot else { continue };

            if let Ok(suballocation) = chunk.suballocator.allocate(layout) {
                return Ok(DeviceMemoryAlloc {
                    memory: chunk.memory.clone(),
                    chunk_id: ChunkId {
                        memory_type_index,
                        index: index as u32,
                    },
                    offset: suballocation.offset,
                    size: suballocation.size,
                });
            }
        }

        // No chunk has room, grow the pool. Oversized requests get a chunk of their own size;
        // everything else gets `chunk_size` to amortize the native allocation calls.
        let allocation_size = cmp::max(self.chunk_size, layout.size());
        let region =
            Region::new(0, allocation_size).ok_or(MemoryAllocatorError::OutOfDeviceMemory)?;
        let memory = self
            .device
            .allocate_memory(allocation_size, memory_type_index)?;

        debug!("allocated a {allocation_size} B chunk of memory type {memory_type_index}");

        let mut suballocator = FreeListSuballocator::new(region);
        let suballocation = match suballocator.allocate(layout) {
            Ok(suballocation) => suballocation,
            Err(_) => {
                // A fresh chunk is sized to fit the request at offset zero, so this is
                // unreachable; make sure the chunk is not leaked regardless.
                self.device.deallocate_memory(memory);
                return Err(MemoryAllocatorError::OutOfDeviceMemory);
            }
        };

        let chunk = Chunk {
            memory: memory.clone(),
            size: allocation_size,
            suballocator,
        };
        let index = match pool.chunks.iter().position(Option::is_none) {
            Some(index) => {
                pool.chunks[index] = Some(chunk);
                index
            }
            None => {
                pool.chunks.push(Some(chunk));
                pool.chunks.len() - 1
            }
        };

        Ok(DeviceMemoryAlloc {
            memory,
            chunk_id: ChunkId {
                memory_type_index,
                index: index as u32,
            },
            offset: suballocation.offset,
            size: suballocation.size,
        })
    }

    /// Deallocates the given allocation, returning its range to the owning chunk's free list and
    /// coalescing it with byte-adjacent free ranges.
    ///
    /// If the allocator was created with
    /// [`free_empty_chunks`](DeviceMemoryAllocatorCreateInfo::free_empty_chunks) and this was the
    /// chunk's last allocation, the chunk is returned to the device.
    ///
    /// The allocation must not be used for binding concurrently with this call; handles cloned
    /// from it become dangling.
    ///
    /// # Errors
    ///
    /// - Returns [`MemoryAllocatorError::InvalidRegion`] if the allocation's chunk no longer
    ///   exists or its range is not tracked as occupied. This means the allocation was already
    ///   deallocated or never came from this allocator, and indicates a bug in the caller.
    pub fn deallocate(
        &self,
        alloc: DeviceMemoryAlloc<D::Memory>,
    ) -> Result<(), MemoryAllocatorError> {
        let ChunkId {
            memory_type_index,
            index,
        } = alloc.chunk_id;

        let mut pools = self.pools.lock();
        let slot = pools
            .get_mut(memory_type_index as usize)
            .and_then(|pool| pool.chunks.get_mut(index as usize))
            .ok_or(MemoryAllocatorError::InvalidRegion)?;
        let chunk = slot.as_mut().ok_or(MemoryAllocatorError::InvalidRegion)?;

        chunk
            .suballocator
            .deallocate(Suballocation {
                offset: alloc.offset,
                size: alloc.size,
            })
            .map_err(|_| MemoryAllocatorError::InvalidRegion)?;

        if self.free_empty_chunks && chunk.suballocator.is_empty() {
            if let Some(chunk) = slot.take() {
                debug!(
                    "freeing empty {} B chunk of memory type {memory_type_index}",
                    chunk.size,
                );
                self.device.deallocate_memory(chunk.memory);
            }
        }

        Ok(())
    }

    /// Returns a snapshot of the allocator's memory usage, aggregated over all chunks.
    ///
    /// This walks every chunk and is intended for diagnostics; it never influences allocation
    /// decisions.
    pub fn usage(&self) -> MemoryUsage {
        let pools = self.pools.lock();
        let mut usage = MemoryUsage::default();

        for chunk in pools.iter().flat_map(|pool| pool.chunks.iter().flatten()) {
            usage.allocated += chunk.size;
            usage.used += chunk.size - chunk.suballocator.free_size();
            usage.chunk_count += 1;
        }

        usage
    }

    /// Returns every wholly-empty chunk to the device, and returns the number of bytes released.
    ///
    /// This is never done implicitly (unless
    /// [`free_empty_chunks`](DeviceMemoryAllocatorCreateInfo::free_empty_chunks) is set); call it
    /// at a point where the extra native-API traffic is acceptable, such as between frames.
    pub fn compact(&self) -> DeviceSize {
        let mut pools = self.pools.lock();
        let mut released = 0;

        for (memory_type_index, pool) in pools.iter_mut().enumerate() {
            for slot in &mut pool.chunks {
                if slot
                    .as_ref()
                    .is_some_and(|chunk| chunk.suballocator.is_empty())
                {
                    if let Some(chunk) = slot.take() {
                        debug!(
                            "freeing empty {} B chunk of memory type {memory_type_index}",
                            chunk.size,
                        );
                        released += chunk.size;
                        self.device.deallocate_memory(chunk.memory);
                    }
                }
            }
        }

        released
    }
}

impl<D: MemoryDevice> fmt::Debug for DeviceMemoryAllocator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemoryAllocator")
            .field("memory_types", &self.memory_types)
            .field("chunk_size", &self.chunk_size)
            .field("free_empty_chunks", &self.free_empty_chunks)
            .finish_non_exhaustive()
    }
}

impl<D: MemoryDevice> Drop for DeviceMemoryAllocator<D> {
    fn drop(&mut self) {
        let pools = mem::take(self.pools.get_mut());

        for pool in pools {
            for chunk in pool.chunks.into_iter().flatten() {
                self.device.deallocate_memory(chunk.memory);
            }
        }
    }
}

/// Identifies a chunk within a [`DeviceMemoryAllocator`].
///
/// This is an index into the allocator's chunk collection, not a reference: the chunk's lifetime
/// is governed solely by the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkId {
    memory_type_index: u32,
    index: u32,
}

impl ChunkId {
    /// Returns the index of the memory type the chunk was allocated from.
    #[inline]
    pub fn memory_type_index(self) -> u32 {
        self.memory_type_index
    }
}

/// An allocation made using a [`DeviceMemoryAllocator`]: a placed, in-use sub-range of a chunk.
///
/// The handle carries everything needed to bind a resource: the native memory handle of the
/// owning chunk and the byte offset within it. It is an immutable value and may be cloned and
/// read from any number of threads; the only constraint is that it must not be used for binding
/// concurrently with its own [deallocation].
///
/// [deallocation]: DeviceMemoryAllocator::deallocate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceMemoryAlloc<M> {
    memory: M,
    chunk_id: ChunkId,
    offset: DeviceSize,
    size: DeviceSize,
}

impl<M> DeviceMemoryAlloc<M> {
    /// Returns the native handle of the chunk the allocation was placed in.
    #[inline]
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Returns the identifier of the chunk the allocation was placed in.
    #[inline]
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Returns the index of the memory type the allocation was placed in.
    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.chunk_id.memory_type_index
    }

    /// Returns the offset of the allocation within its chunk. This is aligned to the alignment
    /// that was requested.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// Returns the size of the allocation.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }
}

/// Parameters to create a new [`DeviceMemoryAllocator`].
#[derive(Clone, Debug)]
pub struct DeviceMemoryAllocatorCreateInfo {
    /// The minimum size of a chunk. Requests larger than this get a chunk of exactly their own
    /// size.
    ///
    /// The default value is 10 MiB.
    pub chunk_size: DeviceSize,

    /// Whether a chunk should be returned to the device as soon as its last allocation is freed.
    ///
    /// When `false`, empty chunks are kept for reuse and are only freed by
    /// [`DeviceMemoryAllocator::compact`] or on drop.
    ///
    /// The default value is `false`.
    pub free_empty_chunks: bool,
}

impl Default for DeviceMemoryAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        DeviceMemoryAllocatorCreateInfo {
            chunk_size: 10 * 1024 * 1024,
            free_empty_chunks: false,
        }
    }
}

/// A snapshot of a [`DeviceMemoryAllocator`]'s memory usage, as returned by
/// [`usage`](DeviceMemoryAllocator::usage).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// The total number of bytes allocated from the device.
    pub allocated: DeviceSize,

    /// The number of bytes currently occupied by allocations. Alignment padding in front of an
    /// allocation stays on the free list and does not count as used.
    pub used: DeviceSize,

    /// The number of chunks currently allocated from the device.
    pub chunk_count: usize,
}

/// Error that can be returned when using a [`DeviceMemoryAllocator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryAllocatorError {
    /// No memory type satisfies both the requested memory-type bitmask and the required property
    /// flags. The memory-type table is immutable, so retrying the same request cannot succeed.
    NoCompatibleMemoryType,

    /// Allocating a new chunk from the device failed.
    OutOfDeviceMemory,

    /// The given allocation is not currently tracked as occupied: either its chunk no longer
    /// exists or it has already been deallocated. This indicates a bug in the caller and is
    /// reported rather than ignored, since accepting it would corrupt the free-list invariants.
    InvalidRegion,
}

impl Error for MemoryAllocatorError {}

impl Display for MemoryAllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NoCompatibleMemoryType => {
                "no memory type satisfies the requested type bitmask and property flags"
            }
            Self::OutOfDeviceMemory => "the device has run out of memory",
            Self::InvalidRegion => "the allocation is not tracked as occupied",
        };

        f.write_str(msg)
    }
}

impl From<OutOfDeviceMemory> for MemoryAllocatorError {
    #[inline]
    fn from(OutOfDeviceMemory: OutOfDeviceMemory) -> Self {
        MemoryAllocatorError::OutOfDeviceMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHeap;
    use crossbeam_queue::ArrayQueue;
    use std::{
        sync::{
            atomic::{AtomicU64, AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    const DEVICE_LOCAL: MemoryPropertyFlags = MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST_VISIBLE: MemoryPropertyFlags = MemoryPropertyFlags::HOST_VISIBLE;

    /// Stands in for the driver: hands out numbered memory objects against a byte budget.
    #[derive(Clone, Debug)]
    struct MockDevice {
        budget: DeviceSize,
        allocated: Arc<AtomicU64>,
        live_chunks: Arc<AtomicUsize>,
        next_id: Arc<AtomicU64>,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct MockMemory {
        id: u64,
        size: DeviceSize,
    }

    impl MockDevice {
        fn new() -> Self {
            Self::with_budget(DeviceSize::MAX)
        }

        fn with_budget(budget: DeviceSize) -> Self {
            MockDevice {
                budget,
                allocated: Arc::new(AtomicU64::new(0)),
                live_chunks: Arc::new(AtomicUsize::new(0)),
                next_id: Arc::new(AtomicU64::new(0)),
            }
        }

        fn live_chunks(&self) -> usize {
            self.live_chunks.load(Ordering::Relaxed)
        }
    }

    impl MemoryDevice for MockDevice {
        type Memory = MockMemory;

        fn allocate_memory(
            &self,
            size: DeviceSize,
            _memory_type_index: u32,
        ) -> Result<Self::Memory, OutOfDeviceMemory> {
            if self.allocated.fetch_add(size, Ordering::Relaxed) + size > self.budget {
                self.allocated.fetch_sub(size, Ordering::Relaxed);
                return Err(OutOfDeviceMemory);
            }

            self.live_chunks.fetch_add(1, Ordering::Relaxed);

            Ok(MockMemory {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                size,
            })
        }

        fn deallocate_memory(&self, memory: Self::Memory) {
            self.allocated.fetch_sub(memory.size, Ordering::Relaxed);
            self.live_chunks.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn single_type_properties() -> MemoryProperties {
        MemoryProperties {
            memory_types: vec![MemoryType {
                property_flags: DEVICE_LOCAL,
                heap_index: 0,
            }],
            memory_heaps: vec![MemoryHeap { size: 1 << 30 }],
        }
    }

    fn allocator_with_chunk_size(
        chunk_size: DeviceSize,
    ) -> DeviceMemoryAllocator<MockDevice> {
        DeviceMemoryAllocator::new(
            MockDevice::new(),
            &single_type_properties(),
            DeviceMemoryAllocatorCreateInfo {
                chunk_size,
                ..Default::default()
            },
        )
    }

    fn layout(size: DeviceSize, alignment: DeviceSize) -> DeviceLayout {
        DeviceLayout::from_size_alignment(size, alignment).unwrap()
    }

    #[test]
    fn places_consecutive_allocations_in_one_chunk() {
        let allocator = allocator_with_chunk_size(1024);

        let a = allocator.allocate(layout(100, 16), 1, DEVICE_LOCAL).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(a.size(), 100);

        // The next 16-aligned offset after 100.
        let b = allocator.allocate(layout(200, 16), 1, DEVICE_LOCAL).unwrap();
        assert_eq!(b.offset(), 112);
        assert_eq!(b.chunk_id(), a.chunk_id());

        let usage = allocator.usage();
        assert_eq!(usage.chunk_count, 1);
        assert_eq!(usage.allocated, 1024);
        assert_eq!(usage.used, 300);
    }

    #[test]
    fn grows_beyond_the_minimum_chunk_size() {
        let allocator = allocator_with_chunk_size(1024);

        let alloc = allocator.allocate(layout(2048, 16), 1, DEVICE_LOCAL).unwrap();
        assert_eq!(alloc.offset(), 0);

        let usage = allocator.usage();
        assert_eq!(usage.chunk_count, 1);
        assert!(usage.allocated >= 2048);
    }

    #[test]
    fn reuses_a_freed_range_before_fresh_space() {
        let allocator = allocator_with_chunk_size(1024);

        let a = allocator.allocate(layout(100, 1), 1, DEVICE_LOCAL).unwrap();
        let b = allocator.allocate(layout(100, 1), 1, DEVICE_LOCAL).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 100);

        allocator.deallocate(a).unwrap();

        // First-fit: the freed range at offset 0 comes before the untouched tail of the chunk.
        let c = allocator.allocate(layout(100, 1), 1, DEVICE_LOCAL).unwrap();
        assert_eq!(c.offset(), 0);
        assert_eq!(c.chunk_id(), b.chunk_id());
    }

    #[test]
    fn allocate_release_round_trip_reuses_the_offset() {
        let allocator = allocator_with_chunk_size(4096);

        let first = allocator.allocate(layout(768, 64), 1, DEVICE_LOCAL).unwrap();
        let usage = allocator.usage();

        let offset = first.offset();
        allocator.deallocate(first).unwrap();

        let second = allocator.allocate(layout(768, 64), 1, DEVICE_LOCAL).unwrap();
        assert_eq!(second.offset(), offset);
        assert_eq!(allocator.usage(), usage);
    }

    #[test]
    fn respects_alignment() {
        let allocator = allocator_with_chunk_size(1 << 20);

        for log2 in 0..12 {
            let alignment = 1 << log2;
            let alloc = allocator
                .allocate(layout(100, alignment), 1, DEVICE_LOCAL)
                .unwrap();
            assert_eq!(alloc.offset() % alignment, 0);
        }
    }

    #[test]
    fn allocation_handles_compare_by_value() {
        let allocator = allocator_with_chunk_size(1024);

        let a = allocator.allocate(layout(100, 1), 1, DEVICE_LOCAL).unwrap();
        let b = allocator.allocate(layout(100, 1), 1, DEVICE_LOCAL).unwrap();

        // A handle and its clone refer to the same placed range.
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn double_release_fails() {
        let allocator = allocator_with_chunk_size(1024);

        let alloc = allocator.allocate(layout(100, 1), 1, DEVICE_LOCAL).unwrap();
        let copy = alloc.clone();

        allocator.deallocate(alloc).unwrap();
        assert_eq!(
            allocator.deallocate(copy),
            Err(MemoryAllocatorError::InvalidRegion),
        );

        // The failed release must not have corrupted the accounting.
        assert_eq!(allocator.usage().used, 0);
    }

    #[test]
    fn no_compatible_memory_type_leaves_state_unchanged() {
        let allocator = allocator_with_chunk_size(1024);

        let _pinned = allocator.allocate(layout(100, 1), 1, DEVICE_LOCAL).unwrap();
        let usage = allocator.usage();

        assert_eq!(
            allocator.allocate(layout(100, 1), 1, HOST_VISIBLE),
            Err(MemoryAllocatorError::NoCompatibleMemoryType),
        );
        assert_eq!(
            allocator.allocate(layout(100, 1), 0, DEVICE_LOCAL),
            Err(MemoryAllocatorError::NoCompatibleMemoryType),
        );
        assert_eq!(allocator.usage(), usage);
    }

    #[test]
    fn out_of_device_memory_leaves_state_unchanged() {
        let device = MockDevice::with_budget(1024);
        let allocator = DeviceMemoryAllocator::new(
            device.clone(),
            &single_type_properties(),
            DeviceMemoryAllocatorCreateInfo {
                chunk_size: 1024,
                ..Default::default()
            },
        );

        let _pinned = allocator.allocate(layout(512, 1), 1, DEVICE_LOCAL).unwrap();
        let usage = allocator.usage();

        // 600 bytes don't fit in the remainder of the chunk, and the budget is exhausted.
        assert_eq!(
            allocator.allocate(layout(600, 1), 1, DEVICE_LOCAL),
            Err(MemoryAllocatorError::OutOfDeviceMemory),
        );
        assert_eq!(allocator.usage(), usage);
        assert_eq!(device.live_chunks(), 1);
    }

    #[test]
    fn type_resolution_is_deterministic_and_picks_the_lowest_index() {
        let memory_properties = MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: DEVICE_LOCAL | HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 0,
                },
            ],
            memory_heaps: vec![MemoryHeap { size: 1 << 30 }, MemoryHeap { size: 1 << 28 }],
        };
        let allocator = DeviceMemoryAllocator::new(
            MockDevice::new(),
            &memory_properties,
            DeviceMemoryAllocatorCreateInfo::default(),
        );

        assert_eq!(allocator.find_memory_type_index(!0, HOST_VISIBLE), Some(1));
        assert_eq!(allocator.find_memory_type_index(!0, HOST_VISIBLE), Some(1));
        assert_eq!(allocator.find_memory_type_index(!0, DEVICE_LOCAL), Some(0));
        assert_eq!(
            allocator.find_memory_type_index(!0, DEVICE_LOCAL | HOST_VISIBLE),
            Some(2),
        );
        // The type bitmask can veto an otherwise matching type.
        assert_eq!(
            allocator.find_memory_type_index(0b100, HOST_VISIBLE),
            Some(2),
        );
        assert_eq!(
            allocator.find_memory_type_index(!0, MemoryPropertyFlags::HOST_CACHED),
            None,
        );
    }

    #[test]
    fn separates_memory_types_into_their_own_chunks() {
        let memory_properties = MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: HOST_VISIBLE,
                    heap_index: 1,
                },
            ],
            memory_heaps: vec![MemoryHeap { size: 1 << 30 }, MemoryHeap { size: 1 << 28 }],
        };
        let allocator = DeviceMemoryAllocator::new(
            MockDevice::new(),
            &memory_properties,
            DeviceMemoryAllocatorCreateInfo::default(),
        );

        let a = allocator.allocate(layout(100, 1), !0, DEVICE_LOCAL).unwrap();
        let b = allocator.allocate(layout(100, 1), !0, HOST_VISIBLE).unwrap();

        assert_eq!(a.memory_type_index(), 0);
        assert_eq!(b.memory_type_index(), 1);
        assert_ne!(a.memory(), b.memory());
        assert_eq!(allocator.usage().chunk_count, 2);
    }

    #[test]
    fn compact_frees_only_empty_chunks() {
        let device = MockDevice::new();
        let allocator = DeviceMemoryAllocator::new(
            device.clone(),
            &single_type_properties(),
            DeviceMemoryAllocatorCreateInfo {
                chunk_size: 256,
                ..Default::default()
            },
        );

        let a = allocator.allocate(layout(256, 1), 1, DEVICE_LOCAL).unwrap();
        let b = allocator.allocate(layout(256, 1), 1, DEVICE_LOCAL).unwrap();
        assert_eq!(device.live_chunks(), 2);

        allocator.deallocate(a).unwrap();

        assert_eq!(allocator.compact(), 256);
        assert_eq!(device.live_chunks(), 1);
        assert_eq!(allocator.usage().chunk_count, 1);

        // The remaining chunk's identifier survived the compaction.
        allocator.deallocate(b).unwrap();
        assert_eq!(allocator.compact(), 256);
        assert_eq!(device.live_chunks(), 0);

        // The vacated slot is reused by the next chunk.
        let _c = allocator.allocate(layout(100, 1), 1, DEVICE_LOCAL).unwrap();
        assert_eq!(allocator.usage().chunk_count, 1);
    }

    #[test]
    fn free_empty_chunks_releases_on_the_last_deallocation() {
        let device = MockDevice::new();
        let allocator = DeviceMemoryAllocator::new(
            device.clone(),
            &single_type_properties(),
            DeviceMemoryAllocatorCreateInfo {
                chunk_size: 1024,
                free_empty_chunks: true,
            },
        );

        let a = allocator.allocate(layout(100, 1), 1, DEVICE_LOCAL).unwrap();
        let b = allocator.allocate(layout(100, 1), 1, DEVICE_LOCAL).unwrap();
        assert_eq!(device.live_chunks(), 1);

        allocator.deallocate(a).unwrap();
        assert_eq!(device.live_chunks(), 1);

        let b_copy = b.clone();
        allocator.deallocate(b).unwrap();
        assert_eq!(device.live_chunks(), 0);
        assert_eq!(allocator.usage(), MemoryUsage::default());

        // The chunk is gone, so a stale handle is rejected.
        assert_eq!(
            allocator.deallocate(b_copy),
            Err(MemoryAllocatorError::InvalidRegion),
        );
    }

    #[test]
    fn drop_frees_all_chunks() {
        let device = MockDevice::new();

        {
            let allocator = DeviceMemoryAllocator::new(
                device.clone(),
                &single_type_properties(),
                DeviceMemoryAllocatorCreateInfo {
                    chunk_size: 256,
                    ..Default::default()
                },
            );

            let _a = allocator.allocate(layout(256, 1), 1, DEVICE_LOCAL).unwrap();
            let _b = allocator.allocate(layout(256, 1), 1, DEVICE_LOCAL).unwrap();
            assert_eq!(device.live_chunks(), 2);
        }

        assert_eq!(device.live_chunks(), 0);
    }

    #[test]
    fn concurrent_allocate_and_release() {
        const THREADS: usize = 8;
        const ALLOCATIONS_PER_THREAD: usize = 100;

        let allocator = allocator_with_chunk_size(1 << 20);
        let allocs = ArrayQueue::new(THREADS * ALLOCATIONS_PER_THREAD);

        thread::scope(|scope| {
            for i in 1..=THREADS {
                let (allocator, allocs) = (&allocator, &allocs);

                scope.spawn(move || {
                    for _ in 0..ALLOCATIONS_PER_THREAD {
                        let alloc = allocator
                            .allocate(layout(i as DeviceSize * 117, 16), 1, DEVICE_LOCAL)
                            .unwrap();
                        assert_eq!(alloc.offset() % 16, 0);
                        allocs.push(alloc).unwrap();
                    }
                });
            }
        });

        assert_eq!(
            allocator.usage().used,
            (1..=THREADS).sum::<usize>() as DeviceSize * 117 * ALLOCATIONS_PER_THREAD as DeviceSize,
        );

        while let Some(alloc) = allocs.pop() {
            allocator.deallocate(alloc).unwrap();
        }

        assert_eq!(allocator.usage().used, 0);
    }
}
