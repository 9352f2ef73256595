//! # Scatter-Gather Mapping
//!
//! Maps a list of buffer segments as one transfer. Each segment gets its own
//! run of slots, but every search resumes where the previous run ended, so
//! consecutive segments usually land back to back in bus space. When they do
//! (and merging is enabled) they are reported to the driver as one longer
//! DMA segment.
//!
//! ```text
//!   input   [ seg0: 4K ]  [ seg1: 4K ]  [ seg2: 4K ]     scattered in RAM
//!                │             │             │
//!   bus     ┌────▼────┬────────▼────┬────────▼────┐
//!           │ slot n  │  slot n+1   │  slot n+2   │     contiguous
//!           └─────────┴─────────────┴─────────────┘
//!   output  [ dma_address = n << 12, dma_length = 12K ]  [ dma_length = 0 ]
//! ```
//!
//! The whole list is mapped under one acquisition of the table lock. If any
//! segment cannot be placed, everything already placed for this list is
//! released before the lock is dropped.

use alloc::vec::Vec;

use crate::addr::{dma_num_pages, num_pages, DmaAddr, VirtAddr};
use crate::direction::DmaDirection;
use crate::error::{IommuError, IommuResult};
use crate::platform::TceBackend;
use crate::table::{AllocCursor, IommuTable, TableState};

// =============================================================================
// Scatter Entry
// =============================================================================

/// One element of a scatter-gather list
///
/// `vaddr`/`length` describe the CPU buffer and are read by
/// [`IommuTable::map_sg`]; `dma_address`/`dma_length` are written by it.
/// Output entries are packed at the front of the list; when there are fewer
/// outputs than inputs, the entry after the last output has `dma_length == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterEntry {
    /// CPU address of the segment
    pub vaddr: VirtAddr,
    /// Segment length in bytes
    pub length: usize,
    /// Bus address of the output segment stored in this slot
    pub dma_address: DmaAddr,
    /// Length of the output segment stored in this slot
    pub dma_length: usize,
}

impl ScatterEntry {
    /// An unmapped entry
    pub const fn new(vaddr: VirtAddr, length: usize) -> Self {
        Self {
            vaddr,
            length,
            dma_address: DmaAddr::MAPPING_ERROR,
            dma_length: 0,
        }
    }
}

/// Output segments of a mapped list, up to the terminator
pub fn dma_segments(sglist: &[ScatterEntry]) -> impl Iterator<Item = (DmaAddr, usize)> + '_ {
    sglist
        .iter()
        .take_while(|e| e.dma_length != 0)
        .map(|e| (e.dma_address, e.dma_length))
}

// =============================================================================
// Mapping State
// =============================================================================

/// Contiguous bus range handed to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DmaSegment {
    dma_address: DmaAddr,
    dma_length: usize,
}

impl DmaSegment {
    fn npages(&self) -> usize {
        dma_num_pages(self.dma_address, self.dma_length).unwrap_or(usize::MAX)
    }
}

/// Result of placing every segment of a list
#[derive(Debug)]
enum SgOutcome {
    /// Every segment placed
    Mapped(Vec<DmaSegment>),
    /// Placement stopped; `produced` is exactly what was placed before
    Failed {
        produced: Vec<DmaSegment>,
        error: IommuError,
    },
}

impl<B: TceBackend> IommuTable<B> {
    /// Map a scatter-gather list
    ///
    /// Returns the number of output segments written to the front of
    /// `sglist`. On error the table is left exactly as before the call.
    /// An empty list maps to zero segments without touching the table.
    ///
    /// # Panics
    ///
    /// If `dir` is [`DmaDirection::None`].
    pub fn map_sg(&self, sglist: &mut [ScatterEntry], dir: DmaDirection) -> IommuResult<usize> {
        dir.assert_valid();
        if sglist.is_empty() {
            return Ok(0);
        }

        let segments = {
            let mut state = self.lock_state();
            match self.place_segments(&mut state, sglist, dir) {
                SgOutcome::Mapped(segments) => segments,
                SgOutcome::Failed { produced, error } => {
                    self.unwind_segments(&mut state, &produced);
                    drop(state);
                    self.stats().record_sg_rollback();
                    log::debug!(
                        "iommu: map_sg of {} entries failed, released {} segments",
                        sglist.len(),
                        produced.len()
                    );
                    return Err(error);
                },
            }
        };

        self.flush();
        self.barrier();

        for (entry, segment) in sglist.iter_mut().zip(&segments) {
            entry.dma_address = segment.dma_address;
            entry.dma_length = segment.dma_length;
        }

        let outcount = segments.len();
        if let Some(terminator) = sglist.get_mut(outcount) {
            terminator.dma_address = DmaAddr::MAPPING_ERROR;
            terminator.dma_length = 0;
        }

        self.stats().record_sg_map();
        Ok(outcount)
    }

    /// Undo [`map_sg`](Self::map_sg)
    ///
    /// Walks the output segments up to the zero-length terminator.
    ///
    /// # Panics
    ///
    /// If `dir` is [`DmaDirection::None`].
    pub fn unmap_sg(&self, sglist: &[ScatterEntry], dir: DmaDirection) {
        dir.assert_valid();

        {
            let mut state = self.lock_state();
            for (dma_address, dma_length) in dma_segments(sglist) {
                let npages = dma_num_pages(dma_address, dma_length).unwrap_or(usize::MAX);
                self.free_locked(&mut state, dma_address, npages);
            }
            self.flush();
        }

        self.stats().record_sg_unmap();
    }

    /// Allocate and build entries for every input segment, coalescing
    /// segments that land contiguously
    fn place_segments(&self, state: &mut TableState, sglist: &[ScatterEntry], dir: DmaDirection) -> SgOutcome {
        let merge = self.config().merge.merges();
        let offset = self.geometry().offset;

        let mut cursor = AllocCursor::default();
        let mut segments: Vec<DmaSegment> = Vec::with_capacity(sglist.len());
        let mut dma_next: Option<DmaAddr> = None;

        for entry in sglist.iter().filter(|e| e.length != 0) {
            let Some(npages) = num_pages(entry.vaddr.as_usize(), entry.length) else {
                return SgOutcome::Failed {
                    produced: segments,
                    error: IommuError::InvalidPageCount,
                };
            };

            let slot = match self.range_alloc(state, npages, Some(&mut cursor)) {
                Ok(slot) => slot,
                Err(error) => {
                    return SgOutcome::Failed {
                        produced: segments,
                        error,
                    }
                },
            };

            self.build_entries(slot, npages, entry.vaddr, dir);
            let dma_address = slot.dma_addr(offset).with_offset(entry.vaddr.page_offset());

            match segments.last_mut() {
                Some(open) if merge && dma_next == Some(dma_address) => {
                    open.dma_length += entry.length;
                    self.stats().record_sg_merge();
                },
                _ => segments.push(DmaSegment {
                    dma_address,
                    dma_length: entry.length,
                }),
            }

            dma_next = Some(dma_address.offset(entry.length));
        }

        SgOutcome::Mapped(segments)
    }

    /// Release the ranges of a partially placed list
    ///
    /// The entries were never handed to a device, so no cache flush is done.
    fn unwind_segments(&self, state: &mut TableState, produced: &[DmaSegment]) {
        for segment in produced.iter().filter(|s| s.dma_length != 0) {
            self.free_locked(state, segment.dma_address, segment.npages());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IommuConfig, MergePolicy};
    use crate::testing::table_with;
    use crate::IOMMU_PAGE_SIZE;

    const PAGE: usize = IOMMU_PAGE_SIZE;

    fn merging() -> IommuConfig {
        IommuConfig::new().with_merge(MergePolicy::Merge)
    }

    fn scattered(lengths: &[usize]) -> Vec<ScatterEntry> {
        lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| ScatterEntry::new(VirtAddr::new(0x10_0000 + i * 0x4_0000), len))
            .collect()
    }

    #[test]
    fn test_contiguous_segments_merge() {
        let tbl = table_with(1024, merging());
        let mut sg = scattered(&[PAGE, PAGE, PAGE]);

        let count = tbl.map_sg(&mut sg, DmaDirection::ToDevice).unwrap();
        assert_eq!(count, 1);
        assert_eq!(sg[0].dma_address, DmaAddr::new(0));
        assert_eq!(sg[0].dma_length, 3 * PAGE);
        assert_eq!(sg[1].dma_length, 0);
        assert_eq!(dma_segments(&sg).count(), 1);
        assert_eq!(tbl.stats().snapshot().sg_merges, 2);

        // Bus pages point at the scattered CPU pages
        assert_eq!(tbl.backend().entry(1).map(|e| e.0), Some(VirtAddr::new(0x14_0000)));
        assert_eq!(tbl.backend().flushes(), 1);
    }

    #[test]
    fn test_novmerge_keeps_segments_apart() {
        let tbl = table_with(1024, IommuConfig::new().with_merge(MergePolicy::NoMerge));
        let mut sg = scattered(&[PAGE, PAGE, PAGE]);

        let count = tbl.map_sg(&mut sg, DmaDirection::ToDevice).unwrap();
        assert_eq!(count, 3);
        let outputs: Vec<_> = dma_segments(&sg).collect();
        assert_eq!(
            outputs,
            [(DmaAddr::new(0), PAGE), (DmaAddr::new(0x1000), PAGE), (DmaAddr::new(0x2000), PAGE)]
        );

        // Every entry is an output, so there is no terminator to stop at
        tbl.unmap_sg(&sg, DmaDirection::ToDevice);
        assert!(tbl.bitmap_snapshot().is_clear());
        assert_eq!(tbl.backend().live_entries(), 0);
    }

    #[test]
    fn test_wrapping_segment_rolls_back() {
        let tbl = table_with(1024, merging());
        let mut sg = [
            ScatterEntry::new(VirtAddr::new(0x10_0000), PAGE),
            ScatterEntry::new(VirtAddr::new(0x20_0000), usize::MAX),
        ];

        assert_eq!(tbl.map_sg(&mut sg, DmaDirection::ToDevice), Err(IommuError::InvalidPageCount));
        assert!(tbl.bitmap_snapshot().is_clear());
        assert_eq!(tbl.stats().snapshot().sg_rollbacks, 1);
    }

    #[test]
    #[should_panic]
    fn test_empty_list_with_none_direction() {
        let tbl = table_with(64, merging());
        let mut sg: [ScatterEntry; 0] = [];
        let _ = tbl.map_sg(&mut sg, DmaDirection::None);
    }

    #[test]
    fn test_zero_length_segments_are_skipped() {
        let tbl = table_with(1024, merging());
        let mut sg = scattered(&[PAGE, 0, PAGE]);

        let count = tbl.map_sg(&mut sg, DmaDirection::FromDevice).unwrap();
        assert_eq!(count, 1);
        assert_eq!(sg[0].dma_length, 2 * PAGE);
        assert_eq!(sg[1].dma_length, 0);
        assert_eq!(tbl.pages_in_use(), 2);
    }

    #[test]
    fn test_unaligned_segments_do_not_merge() {
        let tbl = table_with(1024, merging());
        let mut sg = [
            ScatterEntry::new(VirtAddr::new(0x5000_0100), 0x100),
            ScatterEntry::new(VirtAddr::new(0x6000_0000), 0x100),
        ];

        let count = tbl.map_sg(&mut sg, DmaDirection::Bidirectional).unwrap();
        assert_eq!(count, 2);
        assert_eq!(sg[0].dma_address, DmaAddr::new(0x100));
        assert_eq!(sg[1].dma_address, DmaAddr::new(0x1000));
    }

    #[test]
    fn test_failure_rolls_back_everything() {
        let tbl = table_with(16, merging());
        // Leave only slots 14 and 15 free
        tbl.alloc_range(14).unwrap();
        let before = tbl.bitmap_snapshot();

        let mut sg = scattered(&[PAGE, PAGE, PAGE]);
        let err = tbl.map_sg(&mut sg, DmaDirection::ToDevice).unwrap_err();

        assert_eq!(err, IommuError::Exhausted { npages: 1 });
        assert_eq!(tbl.bitmap_snapshot(), before);
        assert_eq!(tbl.backend().live_entries(), 0);
        assert_eq!(tbl.backend().flushes(), 0);
        assert_eq!(tbl.stats().snapshot().sg_rollbacks, 1);
        assert!(sg.iter().all(|e| e.dma_length == 0));
    }

    #[test]
    fn test_unmap_sg_round_trip() {
        let tbl = table_with(1024, merging());
        tbl.alloc_range(3).unwrap();
        let before = tbl.bitmap_snapshot();

        let mut sg = scattered(&[PAGE, 2 * PAGE + 1, 10, PAGE]);
        let count = tbl.map_sg(&mut sg, DmaDirection::ToDevice).unwrap();
        // [0] and [1] merge; [2] ends mid-page so [3] cannot follow it
        assert_eq!(count, 3);

        tbl.unmap_sg(&sg, DmaDirection::ToDevice);
        assert_eq!(tbl.bitmap_snapshot(), before);
        assert_eq!(tbl.backend().live_entries(), 0);
    }

    #[test]
    fn test_empty_list_does_nothing() {
        let tbl = table_with(64, merging());
        let mut sg: [ScatterEntry; 0] = [];
        assert_eq!(tbl.map_sg(&mut sg, DmaDirection::ToDevice), Ok(0));
        assert_eq!(tbl.backend().flushes(), 0);
    }

    #[test]
    fn test_large_segment_in_list() {
        let tbl = table_with(1024, IommuConfig::new().with_merge(MergePolicy::NoMerge));
        let mut sg = scattered(&[PAGE, 20 * PAGE]);

        assert_eq!(tbl.map_sg(&mut sg, DmaDirection::ToDevice), Ok(2));
        assert_eq!(sg[0].dma_address, DmaAddr::new(0));
        // Large runs live above the half point
        assert!(sg[1].dma_address.page() >= tbl.half_point() as u64);
        assert_eq!(tbl.pages_in_use(), 21);
    }
}
