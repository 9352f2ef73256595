//! # DMA Mapping Operations
//!
//! The interface a bus hands to its device drivers. Drivers are written
//! against [`DmaOps`] and never see the table, its bitmap, or the hardware
//! backend.

use crate::addr::{DmaAddr, VirtAddr};
use crate::coherent::CoherentBuffer;
use crate::direction::DmaDirection;
use crate::error::IommuResult;
use crate::platform::{PageAllocator, TceBackend};
use crate::sg::ScatterEntry;
use crate::table::IommuTable;

/// DMA mapping provider
///
/// Every `dir` argument must be a transfer direction; passing
/// [`DmaDirection::None`] panics.
pub trait DmaOps: Send + Sync {
    /// Map one buffer; the result keeps the buffer's offset within its page
    fn map_single(&self, vaddr: VirtAddr, size: usize, dir: DmaDirection) -> IommuResult<DmaAddr>;

    /// Undo [`map_single`](Self::map_single)
    fn unmap_single(&self, dma_addr: DmaAddr, size: usize, dir: DmaDirection);

    /// Map a scatter-gather list, returning the number of output segments
    fn map_sg(&self, sglist: &mut [ScatterEntry], dir: DmaDirection) -> IommuResult<usize>;

    /// Undo [`map_sg`](Self::map_sg)
    fn unmap_sg(&self, sglist: &[ScatterEntry], dir: DmaDirection);

    /// Allocate and map a zeroed long-lived buffer
    fn alloc_coherent(&self, pages: &dyn PageAllocator, size: usize) -> IommuResult<CoherentBuffer>;

    /// Unmap and release a coherent buffer
    fn free_coherent(&self, pages: &dyn PageAllocator, buffer: CoherentBuffer);
}

impl<B: TceBackend> DmaOps for IommuTable<B> {
    fn map_single(&self, vaddr: VirtAddr, size: usize, dir: DmaDirection) -> IommuResult<DmaAddr> {
        IommuTable::map_single(self, vaddr, size, dir)
    }

    fn unmap_single(&self, dma_addr: DmaAddr, size: usize, dir: DmaDirection) {
        IommuTable::unmap_single(self, dma_addr, size, dir)
    }

    fn map_sg(&self, sglist: &mut [ScatterEntry], dir: DmaDirection) -> IommuResult<usize> {
        IommuTable::map_sg(self, sglist, dir)
    }

    fn unmap_sg(&self, sglist: &[ScatterEntry], dir: DmaDirection) {
        IommuTable::unmap_sg(self, sglist, dir)
    }

    fn alloc_coherent(&self, pages: &dyn PageAllocator, size: usize) -> IommuResult<CoherentBuffer> {
        IommuTable::alloc_coherent(self, pages, size)
    }

    fn free_coherent(&self, pages: &dyn PageAllocator, buffer: CoherentBuffer) {
        IommuTable::free_coherent(self, pages, buffer)
    }
}
