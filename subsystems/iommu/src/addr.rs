//! # Address Types
//!
//! Table slots, bus addresses and CPU virtual addresses are different
//! quantities; each gets its own type so they cannot be mixed up.

use core::fmt;
use core::ops::Add;

use crate::{IOMMU_PAGE_MASK, IOMMU_PAGE_SHIFT, IOMMU_PAGE_SIZE};

// =============================================================================
// Slot
// =============================================================================

/// Index of one page-sized entry inside a table bitmap
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Slot(usize);

impl Slot {
    /// Create a slot from a raw bitmap index
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Raw bitmap index
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Absolute bus page number of this slot in a table starting at `offset`
    #[inline]
    pub const fn bus_page(self, offset: u64) -> u64 {
        offset + self.0 as u64
    }

    /// Bus address of the first byte of this slot
    #[inline]
    pub const fn dma_addr(self, offset: u64) -> DmaAddr {
        DmaAddr::from_page(self.bus_page(offset))
    }
}

impl Add<usize> for Slot {
    type Output = Slot;

    #[inline]
    fn add(self, rhs: usize) -> Slot {
        Slot(self.0 + rhs)
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.0)
    }
}

// =============================================================================
// Bus Address
// =============================================================================

/// Device-visible bus address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DmaAddr(u64);

impl DmaAddr {
    /// Distinguished "no mapping" bus address
    pub const MAPPING_ERROR: DmaAddr = DmaAddr(!0);

    /// Create a bus address from its raw value
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Bus address of the first byte of a bus page
    #[inline]
    pub const fn from_page(page: u64) -> Self {
        Self(page << IOMMU_PAGE_SHIFT)
    }

    /// Raw value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this is the mapping error sentinel
    #[inline]
    pub const fn is_error(self) -> bool {
        self.0 == Self::MAPPING_ERROR.0
    }

    /// Bus page number containing this address
    #[inline]
    pub const fn page(self) -> u64 {
        self.0 >> IOMMU_PAGE_SHIFT
    }

    /// Offset of this address inside its page
    #[inline]
    pub const fn page_offset(self) -> usize {
        (self.0 & !IOMMU_PAGE_MASK) as usize
    }

    /// Set the intra-page byte offset
    #[inline]
    pub const fn with_offset(self, offset: usize) -> Self {
        Self(self.0 | (offset as u64 & !IOMMU_PAGE_MASK))
    }

    /// Address `bytes` further on
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes as u64))
    }
}

impl fmt::Debug for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmaAddr({:#x})", self.0)
    }
}

impl fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// Virtual Address
// =============================================================================

/// Kernel virtual address of a CPU-side buffer
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Create a virtual address
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Virtual address of a pointer
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Raw value
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Pointer to the address
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Start of the page containing this address
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(IOMMU_PAGE_SIZE - 1))
    }

    /// Offset of this address inside its page
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (IOMMU_PAGE_SIZE - 1)
    }

    /// Address `bytes` further on
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

// =============================================================================
// Page Arithmetic
// =============================================================================

/// Round `size` up to a whole number of IOMMU pages
///
/// `None` if the rounded size does not fit in a `usize`.
#[inline]
pub const fn page_align_up(size: usize) -> Option<usize> {
    match size.checked_add(IOMMU_PAGE_SIZE - 1) {
        Some(end) => Some(end & !(IOMMU_PAGE_SIZE - 1)),
        None => None,
    }
}

/// Number of IOMMU pages touched by `[addr, addr + len)`
///
/// `None` if the range wraps the address space.
#[inline]
pub const fn num_pages(addr: usize, len: usize) -> Option<usize> {
    match addr.checked_add(len) {
        Some(end) => Some(end.div_ceil(IOMMU_PAGE_SIZE) - (addr >> IOMMU_PAGE_SHIFT)),
        None => None,
    }
}

/// Number of pages spanned by a bus range
#[inline]
pub const fn dma_num_pages(addr: DmaAddr, len: usize) -> Option<usize> {
    num_pages(addr.page_offset(), len)
}

/// Smallest page order whose block holds `size` bytes
#[inline]
pub const fn get_order(size: usize) -> u32 {
    let pages = size.div_ceil(IOMMU_PAGE_SIZE);
    if pages <= 1 {
        0
    } else {
        usize::BITS - (pages - 1).leading_zeros()
    }
}
