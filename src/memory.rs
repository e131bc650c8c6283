//! # Dynamic Memory
//!
//! Segmented first-fit allocator. Each physically distinct memory area
//! (on-chip SRAM, the two external SDRAM banks) is a [`Region`] with its own
//! free list, and every block, live or free, starts with a [`BlockHeader`]
//! that records which region it belongs to. A bare pointer is therefore
//! enough to free a block.
//!
//! ## Region layout
//!
//! ```text
//!  start                                                   end
//!   │                                                       │
//!   ▼                                                       ▼
//!   ┌────┬──────────┬────┬───────┬────┬────────────────┬────┐
//!   │ hdr│ payload  │ hdr│ (free)│ hdr│ payload        │ hdr│ ◄ end sentinel
//!   └────┴──────────┴────┴───────┴────┴────────────────┴────┘  size 0, used
//!            used          │ free        used
//!   head ──────────────────┘  next ──► sentinel
//! ```
//!
//! The free list is singly linked in ascending address order. Allocation
//! walks it from the lowest address and takes the first block that fits,
//! splitting off the tail when the remainder is still worth keeping. Free
//! blocks are put back through one merge-insert routine that joins them
//! with the free neighbours on both sides, so no two free blocks are ever
//! byte-adjacent. The split path of `allocate` and `free` share it.
//!
//! The allocator has no lock of its own. The kernel reaches it through the
//! singleton in `kernel.rs`, inside a critical section.

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use heapless::String;

use crate::config::{HEAP_ALIGNMENT, HEAP_MINIMUM_BLOCK, MAX_REGION_NAME_LEN};
use crate::error::{KernelError, KernelResult};

// ---------------------------------------------------------------------------
// Region identifiers
// ---------------------------------------------------------------------------

/// Memory regions known to the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RegionId {
    /// Fast on-chip SRAM, between `.bss` and the main stack.
    Sram = 0,
    /// External SDRAM, first bank.
    DramBank0 = 1,
    /// External SDRAM, second bank.
    DramBank1 = 2,
}

impl RegionId {
    pub const COUNT: usize = 3;
    pub const ALL: [RegionId; Self::COUNT] = [Self::Sram, Self::DramBank0, Self::DramBank1];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Sram),
            1 => Some(Self::DramBank0),
            2 => Some(Self::DramBank1),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Block header
// ---------------------------------------------------------------------------

const BLOCK_FREE: u8 = 0x46;
const BLOCK_USED: u8 = 0x55;

/// Header in front of every block. `next` links free blocks and is zero
/// while the block is allocated; `size` covers header and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct BlockHeader {
    next: usize,
    size: usize,
    region: u8,
    state: u8,
}

impl BlockHeader {
    const fn free(next: usize, size: usize, region: RegionId) -> Self {
        Self {
            next,
            size,
            region: region as u8,
            state: BLOCK_FREE,
        }
    }

    const fn used(size: usize, region: RegionId) -> Self {
        Self {
            next: 0,
            size,
            region: region as u8,
            state: BLOCK_USED,
        }
    }
}

/// Bytes reserved in front of every payload.
pub const HEADER_SIZE: usize = align_up(size_of::<BlockHeader>(), HEAP_ALIGNMENT);

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

// ---------------------------------------------------------------------------
// Region configuration
// ---------------------------------------------------------------------------

/// Static description of a region, handed to [`Heap::configure`]. The
/// bounds need not be aligned.
#[derive(Debug, Clone, Copy)]
pub struct RegionConfig {
    pub id: RegionId,
    pub name: &'static str,
    pub start: usize,
    pub end: usize,
    pub alignment: usize,
    pub minimum_block: usize,
}

impl RegionConfig {
    pub const fn new(id: RegionId, name: &'static str, start: usize, end: usize) -> Self {
        Self {
            id,
            name,
            start,
            end,
            alignment: HEAP_ALIGNMENT,
            minimum_block: HEAP_MINIMUM_BLOCK,
        }
    }

    pub const fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub const fn with_minimum_block(mut self, minimum_block: usize) -> Self {
        self.minimum_block = minimum_block;
        self
    }
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// Runtime state of one configured region.
#[derive(Debug)]
pub struct Region {
    id: RegionId,
    name: String<MAX_REGION_NAME_LEN>,
    start: usize,
    /// Address of the end sentinel.
    end: usize,
    total: usize,
    free: usize,
    alignment: usize,
    minimum_block: usize,
    /// Lowest free block, or `end` when the region is exhausted.
    head: usize,
}

impl Region {
    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_size(&self) -> usize {
        self.total
    }

    pub fn free_size(&self) -> usize {
        self.free
    }

    pub fn used_size(&self) -> usize {
        self.total - self.free
    }

    pub fn used_percentage(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.used_size() as u64 * 100) / self.total as u64) as u8
    }

    /// Whether `addr` lies inside the usable part of the region.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Size of the largest free block, header included.
    pub fn largest_free_block(&self) -> usize {
        self.free_blocks().map(|(_, size)| size).max().unwrap_or(0)
    }

    pub fn free_block_count(&self) -> usize {
        self.free_blocks().count()
    }

    /// Walk the free list as `(address, size)` pairs.
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            region: self,
            cursor: self.head,
            last: None,
        }
    }

    fn block_size_for(&self, size: usize) -> Option<usize> {
        size.max(self.minimum_block)
            .checked_add(HEADER_SIZE)?
            .checked_add(self.alignment - 1)
            .map(|s| align_down(s, self.alignment))
    }

    fn header(&self, addr: usize) -> BlockHeader {
        // SAFETY: `addr` is aligned and lies inside memory handed over by
        // `Heap::configure`; the region owns it for its whole lifetime.
        unsafe { ptr::read(addr as *const BlockHeader) }
    }

    fn set_header(&mut self, addr: usize, header: BlockHeader) {
        // SAFETY: as in `header`.
        unsafe { ptr::write(addr as *mut BlockHeader, header) }
    }

    /// Read a free-list entry and check it has not been trampled.
    fn free_header(&self, addr: usize, after: Option<usize>) -> BlockHeader {
        assert!(
            self.contains(addr) && addr % self.alignment == 0,
            "{}: free list points outside the region ({:#x})",
            self.name,
            addr
        );
        if let Some(prev) = after {
            assert!(addr > prev, "{}: free list out of order at {:#x}", self.name, addr);
        }
        let header = self.header(addr);
        assert!(
            header.state == BLOCK_FREE && header.region == self.id as u8 && header.size != 0,
            "{}: corrupted free block at {:#x}",
            self.name,
            addr
        );
        header
    }

    fn link_after(&mut self, prev: Option<usize>, next: usize) {
        match prev {
            None => self.head = next,
            Some(p) => {
                let mut header = self.header(p);
                header.next = next;
                self.set_header(p, header);
            }
        }
    }

    /// Put a free block back in address order, merging it with the free
    /// neighbours on either side. Never merges into the end sentinel.
    fn insert_free(&mut self, block: usize) {
        let size = self.header(block).size;

        let mut prev = None;
        let mut next = self.head;
        while next != self.end && next < block {
            let header = self.free_header(next, prev);
            prev = Some(next);
            next = header.next;
        }
        assert!(next != block, "{}: block {:#x} is already free", self.name, block);

        let mut base = block;
        let mut merged_size = size;
        let mut merged_into_prev = false;

        if let Some(p) = prev {
            let header = self.header(p);
            if p + header.size == block {
                base = p;
                merged_size += header.size;
                merged_into_prev = true;
            }
        }

        let mut after = next;
        if next != self.end && base + merged_size == next {
            let header = self.free_header(next, prev);
            merged_size += header.size;
            after = header.next;
        }

        self.set_header(base, BlockHeader::free(after, merged_size, self.id));
        if !merged_into_prev {
            self.link_after(prev, base);
        }
    }
}

/// Iterator over a region's free list.
pub struct FreeBlocks<'a> {
    region: &'a Region,
    cursor: usize,
    last: Option<usize>,
}

impl Iterator for FreeBlocks<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        if self.cursor == self.region.end {
            return None;
        }
        let addr = self.cursor;
        let header = self.region.free_header(addr, self.last);
        self.last = Some(addr);
        self.cursor = header.next;
        Some((addr, header.size))
    }
}

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

/// All configured regions.
#[derive(Debug)]
pub struct Heap {
    regions: [Option<Region>; RegionId::COUNT],
}

impl Heap {
    pub const fn new() -> Self {
        Self {
            regions: [None, None, None],
        }
    }

    /// Take ownership of a memory area: align its bounds, reserve the end
    /// sentinel, zero it and publish one free block spanning it.
    /// Reconfiguring a region forgets every block in it.
    ///
    /// # Safety
    /// `config.start..config.end` must be valid, writable memory that
    /// nothing else uses for as long as the heap lives.
    ///
    /// # Panics
    /// On an alignment that is not a power of two, smaller than the header
    /// alignment or not dividing the header size, and on a range too small
    /// to hold one minimum block.
    pub unsafe fn configure(&mut self, config: RegionConfig) {
        let alignment = config.alignment;
        assert!(
            alignment.is_power_of_two()
                && alignment >= align_of::<BlockHeader>()
                && HEADER_SIZE % alignment == 0,
            "{}: unsupported alignment {}",
            config.name,
            alignment
        );

        let start = align_up(config.start, alignment);
        let end = align_down(config.end, alignment);
        assert!(
            end > start && end - start >= 2 * HEADER_SIZE + config.minimum_block.max(1),
            "{}: region too small",
            config.name
        );

        ptr::write_bytes(start as *mut u8, 0, end - start);

        let sentinel = end - HEADER_SIZE;
        let total = sentinel - start;

        let mut name = String::new();
        for c in config.name.chars() {
            if name.push(c).is_err() {
                break;
            }
        }

        let mut region = Region {
            id: config.id,
            name,
            start,
            end: sentinel,
            total,
            free: total,
            alignment,
            minimum_block: config.minimum_block,
            head: start,
        };
        region.set_header(start, BlockHeader::free(sentinel, total, config.id));
        region.set_header(sentinel, BlockHeader::used(0, config.id));

        log::info!(
            "memory: {} at {:#x}..{:#x}, {} bytes",
            config.name,
            start,
            end,
            total
        );
        self.regions[config.id.index()] = Some(region);
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions[id.index()].as_ref()
    }

    /// Configured regions in id order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter().flatten()
    }

    fn region_mut(&mut self, id: RegionId) -> KernelResult<&mut Region> {
        self.regions[id.index()]
            .as_mut()
            .ok_or(KernelError::RegionNotConfigured(id))
    }

    /// First-fit allocation of `size` zeroed bytes, aligned to the region's
    /// alignment.
    ///
    /// # Panics
    /// On `size == 0` and on a corrupted free list.
    pub fn allocate(&mut self, id: RegionId, size: usize) -> KernelResult<NonNull<u8>> {
        assert!(size != 0, "zero-sized allocation from {:?}", id);

        let region = self.region_mut(id)?;
        let out_of_memory = KernelError::OutOfMemory {
            region: id,
            requested: size,
        };

        let block_size = region.block_size_for(size).ok_or(out_of_memory)?;
        if block_size > region.free {
            return Err(out_of_memory);
        }

        let mut prev = None;
        let mut cursor = region.head;
        let found = loop {
            if cursor == region.end {
                return Err(out_of_memory);
            }
            let header = region.free_header(cursor, prev);
            if header.size >= block_size {
                break header;
            }
            prev = Some(cursor);
            cursor = header.next;
        };

        region.link_after(prev, found.next);

        let mut taken = found.size;
        if found.size - block_size >= region.minimum_block + HEADER_SIZE {
            let rest = cursor + block_size;
            region.set_header(rest, BlockHeader::free(0, found.size - block_size, id));
            region.insert_free(rest);
            taken = block_size;
        }

        region.free -= taken;
        region.set_header(cursor, BlockHeader::used(taken, id));

        let payload = cursor + HEADER_SIZE;
        // SAFETY: the payload lies inside the block just taken off the list.
        unsafe { ptr::write_bytes(payload as *mut u8, 0, taken - HEADER_SIZE) };

        NonNull::new(payload as *mut u8).ok_or(out_of_memory)
    }

    /// Return a block to its region. The region is read from the header.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`Heap::allocate`] on this heap.
    /// Freeing the same block twice is detected and panics.
    ///
    /// # Panics
    /// When the header is already marked free, carries a free-list link,
    /// names an unknown or unconfigured region, or does not fit its region.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let block = addr
            .checked_sub(HEADER_SIZE)
            .unwrap_or_else(|| panic!("free of invalid pointer {:#x}", addr));
        let header = ptr::read(block as *const BlockHeader);

        assert!(header.state != BLOCK_FREE, "double free of {:#x}", addr);
        assert!(
            header.state == BLOCK_USED && header.next == 0,
            "corrupted block header at {:#x}",
            block
        );

        let id = RegionId::from_index(header.region)
            .unwrap_or_else(|| panic!("corrupted region tag at {:#x}", block));
        let region = self.regions[id.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("free into unconfigured region {:?}", id));
        assert!(
            region.contains(block)
                && header.size >= HEADER_SIZE
                && block + header.size <= region.end,
            "{}: block {:#x} does not fit the region",
            region.name,
            block
        );

        region.set_header(block, BlockHeader::free(0, header.size, id));
        region.free += header.size;
        region.insert_free(block);
    }

    pub fn total_size(&self, id: RegionId) -> usize {
        self.region(id).map_or(0, Region::total_size)
    }

    pub fn used_size(&self, id: RegionId) -> usize {
        self.region(id).map_or(0, Region::used_size)
    }

    pub fn free_size(&self, id: RegionId) -> usize {
        self.region(id).map_or(0, Region::free_size)
    }

    pub fn used_percentage(&self, id: RegionId) -> u8 {
        self.region(id).map_or(0, Region::used_percentage)
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
