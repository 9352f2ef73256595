//! # Platform Interface
//!
//! The table never touches hardware itself. Translation entries are written
//! through a [`TceBackend`], and coherent buffers come from a
//! [`PageAllocator`]. Each platform (or a test) supplies its own.
//!
//! Entry numbers handed to the backend are absolute bus page numbers, i.e.
//! the table offset plus the bitmap slot.

use crate::addr::VirtAddr;
use crate::direction::TcePermissions;
use crate::table::TableGeometry;

/// Hardware translation-entry operations
///
/// Only one table may drive a given hardware translation window.
pub trait TceBackend: Send + Sync {
    /// Point `npages` entries starting at bus page `entry` at consecutive
    /// pages of the buffer starting at `vaddr` (page aligned)
    fn build(
        &self,
        table: &TableGeometry,
        entry: u64,
        npages: usize,
        vaddr: VirtAddr,
        perms: TcePermissions,
    );

    /// Invalidate `npages` entries starting at bus page `entry`
    fn free(&self, table: &TableGeometry, entry: u64, npages: usize);

    /// Flush the translation cache, if the hardware has one
    fn flush(&self, _table: &TableGeometry) {}
}

/// Physically contiguous page allocator
pub trait PageAllocator {
    /// Allocate `1 << order` contiguous pages
    ///
    /// The returned range must be writable for `IOMMU_PAGE_SIZE << order`
    /// bytes until it is handed back to [`free_pages`](Self::free_pages).
    fn alloc_pages(&self, order: u32) -> Option<VirtAddr>;

    /// Return pages obtained from [`alloc_pages`](Self::alloc_pages)
    fn free_pages(&self, vaddr: VirtAddr, order: u32);
}
