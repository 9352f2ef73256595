//! # Single Buffer Mapping
//!
//! Maps one virtually contiguous kernel buffer into the table's bus window.
//! The returned bus address carries the buffer's offset within its first
//! page, so the device starts at the right byte.

use crate::addr::{dma_num_pages, num_pages, DmaAddr, Slot, VirtAddr};
use crate::direction::DmaDirection;
use crate::error::{IommuError, IommuResult};
use crate::platform::TceBackend;
use crate::table::IommuTable;

impl<B: TceBackend> IommuTable<B> {
    /// Map `size` bytes at `vaddr` for a device transfer
    ///
    /// # Panics
    ///
    /// If `dir` is [`DmaDirection::None`].
    pub fn map_single(&self, vaddr: VirtAddr, size: usize, dir: DmaDirection) -> IommuResult<DmaAddr> {
        dir.assert_valid();

        let npages = num_pages(vaddr.as_usize(), size).ok_or(IommuError::InvalidPageCount)?;
        let slot = self.alloc_mapped(vaddr, npages, dir)?;
        self.stats().record_single_map();

        Ok(slot.dma_addr(self.geometry().offset).with_offset(vaddr.page_offset()))
    }

    /// Undo [`map_single`](Self::map_single)
    ///
    /// A bus range outside the window (including one too long to describe)
    /// is reported and otherwise ignored.
    ///
    /// # Panics
    ///
    /// If `dir` is [`DmaDirection::None`].
    pub fn unmap_single(&self, dma_addr: DmaAddr, size: usize, dir: DmaDirection) {
        dir.assert_valid();

        let npages = dma_num_pages(dma_addr, size).unwrap_or(usize::MAX);
        self.free_mapped(dma_addr, npages);
        self.stats().record_single_unmap();
    }

    /// Reserve `npages` slots and point them at the pages under `vaddr`
    pub(crate) fn alloc_mapped(&self, vaddr: VirtAddr, npages: usize, dir: DmaDirection) -> IommuResult<Slot> {
        let slot = {
            let mut state = self.lock_state();
            let slot = self.range_alloc(&mut state, npages, None)?;
            self.build_entries(slot, npages, vaddr, dir);
            self.flush();
            slot
        };

        self.barrier();
        Ok(slot)
    }

    /// Clear `npages` translations starting at `dma_addr`
    pub(crate) fn free_mapped(&self, dma_addr: DmaAddr, npages: usize) {
        let mut state = self.lock_state();
        self.free_locked(&mut state, dma_addr, npages);
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direction::TcePermissions;
    use crate::table::TableGeometry;
    use crate::testing::{table, MockTce};
    use crate::{IommuConfig, IOMMU_PAGE_SIZE};

    #[test]
    fn test_map_single_keeps_page_offset() {
        let tbl = table(1024);
        let dma = tbl
            .map_single(VirtAddr::new(0x4000_0123), 0x100, DmaDirection::ToDevice)
            .unwrap();

        assert_eq!(dma.as_u64(), 0x123);
        assert_eq!(tbl.pages_in_use(), 1);
        assert_eq!(
            tbl.backend().entry(0),
            Some((VirtAddr::new(0x4000_0000), TcePermissions::READ))
        );
        assert_eq!(tbl.backend().flushes(), 1);
    }

    #[test]
    fn test_map_single_spanning_pages() {
        let tbl = IommuTable::new(TableGeometry::new(0x800, 1024), IommuConfig::new(), MockTce::default());
        let vaddr = VirtAddr::new(0x10_0ff0);
        let dma = tbl.map_single(vaddr, 0x20, DmaDirection::Bidirectional).unwrap();

        assert_eq!(dma.page(), 0x800);
        assert_eq!(dma.page_offset(), 0xff0);
        assert_eq!(tbl.pages_in_use(), 2);
        assert_eq!(tbl.backend().entry(0x801).map(|e| e.0), Some(VirtAddr::new(0x10_1000)));
    }

    #[test]
    fn test_unmap_single_round_trip() {
        let tbl = table(1024);
        tbl.alloc_range(5).unwrap();
        let before = tbl.bitmap_snapshot();

        let size = 3 * IOMMU_PAGE_SIZE + 10;
        let dma = tbl.map_single(VirtAddr::new(0x7000_0008), size, DmaDirection::FromDevice).unwrap();
        assert_eq!(tbl.pages_in_use(), 5 + 4);

        tbl.unmap_single(dma, size, DmaDirection::FromDevice);
        assert_eq!(tbl.bitmap_snapshot(), before);
        assert_eq!(tbl.backend().live_entries(), 0);
        assert_eq!(tbl.stats().snapshot().single_unmaps, 1);
    }

    #[test]
    fn test_map_single_exhausted() {
        let tbl = table(16);
        let err = tbl
            .map_single(VirtAddr::new(0), 17 * IOMMU_PAGE_SIZE, DmaDirection::ToDevice)
            .unwrap_err();
        assert_eq!(err, IommuError::Exhausted { npages: 17 });
        assert_eq!(tbl.pages_in_use(), 0);
        assert_eq!(tbl.backend().live_entries(), 0);
    }

    #[test]
    fn test_unmap_outside_window_is_dropped() {
        let tbl = IommuTable::new(TableGeometry::new(0x100, 64), IommuConfig::new(), MockTce::default());
        let dma = tbl.map_single(VirtAddr::new(0x2000), 64, DmaDirection::ToDevice).unwrap();

        // A physical address passed by mistake
        tbl.unmap_single(DmaAddr::new(0x2000), 64, DmaDirection::ToDevice);
        assert_eq!(tbl.pages_in_use(), 1);
        assert_eq!(tbl.stats().snapshot().invalid_frees, 1);

        tbl.unmap_single(dma, 64, DmaDirection::ToDevice);
        assert_eq!(tbl.pages_in_use(), 0);
    }

    #[test]
    fn test_wrapping_length_rejected() {
        let tbl = table(64);
        let err = tbl
            .map_single(VirtAddr::new(0x1000), usize::MAX, DmaDirection::ToDevice)
            .unwrap_err();
        assert_eq!(err, IommuError::InvalidPageCount);
        assert_eq!(tbl.pages_in_use(), 0);

        let dma = tbl.map_single(VirtAddr::new(0x1000), 8, DmaDirection::ToDevice).unwrap();
        tbl.unmap_single(dma, usize::MAX, DmaDirection::ToDevice);
        assert_eq!(tbl.pages_in_use(), 1);
        assert_eq!(tbl.stats().snapshot().invalid_frees, 1);
    }

    #[test]
    #[should_panic]
    fn test_map_single_none_direction() {
        let tbl = table(64);
        let _ = tbl.map_single(VirtAddr::new(0x1000), 8, DmaDirection::None);
    }
}
