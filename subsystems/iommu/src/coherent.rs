//! # Coherent Buffers
//!
//! Long-lived DMA buffers (descriptor rings, mailboxes) that are allocated
//! and mapped once. The memory comes from the platform page allocator in a
//! power-of-two block, is zeroed, and is mapped bidirectionally.

use crate::addr::{get_order, page_align_up, DmaAddr, VirtAddr};
use crate::diag::Diagnostic;
use crate::direction::DmaDirection;
use crate::error::{IommuError, IommuResult};
use crate::platform::{PageAllocator, TceBackend};
use crate::table::IommuTable;
use crate::{IOMAP_MAX_ORDER, IOMMU_PAGE_SHIFT};

/// A mapped coherent buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoherentBuffer {
    /// CPU address of the buffer
    pub vaddr: VirtAddr,
    /// Bus address the device uses
    pub dma_handle: DmaAddr,
    /// Mapped length in bytes, a whole number of pages
    pub size: usize,
}

impl CoherentBuffer {
    /// Number of mapped pages
    #[inline]
    pub const fn npages(&self) -> usize {
        self.size >> IOMMU_PAGE_SHIFT
    }

    /// Page order of the backing block
    #[inline]
    pub const fn order(&self) -> u32 {
        get_order(self.size)
    }

    /// Pointer to the first byte
    #[inline]
    pub const fn as_mut_ptr(&self) -> *mut u8 {
        self.vaddr.as_mut_ptr()
    }
}

impl<B: TceBackend> IommuTable<B> {
    /// Allocate, zero and map a buffer of at least `size` bytes
    ///
    /// Nothing is left allocated when this fails.
    pub fn alloc_coherent<P>(&self, pages: &P, size: usize) -> IommuResult<CoherentBuffer>
    where
        P: PageAllocator + ?Sized,
    {
        let order = get_order(size);
        let aligned = page_align_up(size).filter(|_| order < IOMAP_MAX_ORDER);
        let Some(size) = aligned else {
            self.report(Diagnostic::OrderTooLarge { size, order });
            return Err(IommuError::OrderTooLarge { order });
        };

        let vaddr = pages.alloc_pages(order).ok_or(IommuError::PageAllocationFailed)?;

        // SAFETY: the allocator hands out at least `PAGE_SIZE << order`
        // writable bytes, and `size` fits in that block
        unsafe { core::ptr::write_bytes(vaddr.as_mut_ptr::<u8>(), 0, size) };

        let npages = size >> IOMMU_PAGE_SHIFT;
        let slot = match self.alloc_mapped(vaddr, npages, DmaDirection::Bidirectional) {
            Ok(slot) => slot,
            Err(err) => {
                pages.free_pages(vaddr, order);
                return Err(err);
            },
        };

        self.stats().record_coherent_alloc();

        Ok(CoherentBuffer {
            vaddr,
            dma_handle: slot.dma_addr(self.geometry().offset),
            size,
        })
    }

    /// Unmap a coherent buffer and return its pages
    pub fn free_coherent<P>(&self, pages: &P, buffer: CoherentBuffer)
    where
        P: PageAllocator + ?Sized,
    {
        self.free_mapped(buffer.dma_handle, buffer.npages());
        pages.free_pages(buffer.vaddr, buffer.order());
        self.stats().record_coherent_free();
    }
}
