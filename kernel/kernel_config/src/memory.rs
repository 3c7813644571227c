//! The virtual and physical memory map that nexke assumes.
//!
//! The address space is split in half: user mappings live in the canonical
//! lower half, the kernel owns the canonical upper half. The page-table
//! cache windows sit at the very top of the kernel half, below nothing.

/// 64-bit architecture results in 8 bytes per address.
pub const BYTES_PER_ADDR: usize = core::mem::size_of::<usize>();

/// The lower 12 bits of an address select a byte within a page frame.
pub const PAGE_SHIFT: usize = 12;
/// Page size is 4096 bytes, 4KiB pages.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of radix levels in the portable page-table layout.
pub const PT_LEVELS: usize = 4;
/// Value: 512. Each table level is one page of 8-byte entries.
pub const ENTRIES_PER_TABLE: usize = PAGE_SIZE / BYTES_PER_ADDR;
/// Value: 9. Each level consumes this many bits of the page number.
pub const PT_INDEX_BITS: usize = 9;
/// Mask applied to a shifted page number to extract one level's index.
pub const PT_INDEX_MASK: usize = ENTRIES_PER_TABLE - 1;

pub const MAX_VIRTUAL_ADDRESS: usize = usize::MAX;
pub const MAX_PAGE_NUMBER: usize = MAX_VIRTUAL_ADDRESS / PAGE_SIZE;

/// First address of the kernel half.
/// Actual value: 0xFFFF_8000_0000_0000, the lowest canonical upper-half address.
pub const KERNEL_SPACE_START: usize = 0xFFFF_8000_0000_0000;
/// Last valid address of the kernel half (inclusive).
pub const KERNEL_SPACE_END: usize = MAX_VIRTUAL_ADDRESS;

/// First address handed out to user regions. Page 0 stays unmapped so that
/// null dereferences always fault.
pub const USER_SPACE_START: usize = PAGE_SIZE;
/// Last valid address of the user half (inclusive).
/// Actual value: 0x0000_7FFF_FFFF_FFFF.
pub const USER_SPACE_END: usize = 0x0000_7FFF_FFFF_FFFF;

/// Base virtual address of the page-table cache windows (PTCACHE).
/// The top 2 MiB of the kernel half is reserved for them.
pub const PT_CACHE_BASE: usize = 0xFFFF_FFFF_FFE0_0000;
/// Number of PTCACHE window slots. Must be at least `PT_LEVELS + 1` so a
/// full walk plus the target data page can be held at once.
pub const PT_CACHE_SLOTS: usize = PT_LEVELS + 2;

/// The size in pages of each kernel stack.
/// If it's too small, deep kernel paths will overflow into a fault.
#[cfg(not(debug_assertions))]
pub const KERNEL_STACK_SIZE_IN_PAGES: usize = 16;
#[cfg(debug_assertions)]
pub const KERNEL_STACK_SIZE_IN_PAGES: usize = 32; // debug builds need more stack space.

/// Physical addresses below this bound form the low zone, kept apart for
/// callers with device-style addressing limits (`alloc_pages_at`).
pub const LOW_ZONE_PHYS_LIMIT: usize = 16 * 1024 * 1024; // 16 MiB

/// Size in bytes of the statically-reserved slab bootstrap pool, carved out
/// at link time so object caches exist before the frame allocator's full
/// initialization.
pub const SLAB_BOOTSTRAP_POOL_SIZE: usize = 64 * 1024;

/// Size in bytes of the relocated kernel log ring.
pub const LOG_RING_SIZE: usize = 64 * 1024;
