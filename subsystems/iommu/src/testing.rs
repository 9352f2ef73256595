//! Fakes for host unit tests.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::addr::VirtAddr;
use crate::config::IommuConfig;
use crate::diag::{Diagnostic, DiagnosticSink};
use crate::direction::TcePermissions;
use crate::platform::{PageAllocator, TceBackend};
use crate::table::{IommuTable, TableGeometry};
use crate::IOMMU_PAGE_SIZE;

/// Translation entries kept in a map instead of hardware
#[derive(Debug, Default)]
pub(crate) struct MockTce {
    entries: Mutex<BTreeMap<u64, (VirtAddr, TcePermissions)>>,
    freed: Mutex<Vec<(u64, usize)>>,
    flushes: AtomicUsize,
}

impl MockTce {
    /// Installed entry for a bus page
    pub(crate) fn entry(&self, bus_page: u64) -> Option<(VirtAddr, TcePermissions)> {
        self.entries.lock().get(&bus_page).copied()
    }

    /// Number of installed entries
    pub(crate) fn live_entries(&self) -> usize {
        self.entries.lock().len()
    }

    /// Every `free` call, in order
    pub(crate) fn freed(&self) -> Vec<(u64, usize)> {
        self.freed.lock().clone()
    }

    pub(crate) fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl TceBackend for MockTce {
    fn build(
        &self,
        _table: &TableGeometry,
        entry: u64,
        npages: usize,
        vaddr: VirtAddr,
        perms: TcePermissions,
    ) {
        let mut entries = self.entries.lock();
        for i in 0..npages {
            entries.insert(entry + i as u64, (vaddr.offset(i * IOMMU_PAGE_SIZE), perms));
        }
    }

    fn free(&self, _table: &TableGeometry, entry: u64, npages: usize) {
        let mut entries = self.entries.lock();
        for i in 0..npages {
            entries.remove(&(entry + i as u64));
        }
        self.freed.lock().push((entry, npages));
    }

    fn flush(&self, _table: &TableGeometry) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Page allocator over the global heap
///
/// Fresh pages are filled with `0xa5` so zeroing is observable.
#[derive(Debug, Default)]
pub(crate) struct HeapPages {
    live: Mutex<BTreeMap<usize, u32>>,
    fail: AtomicBool,
}

impl HeapPages {
    fn layout(order: u32) -> Layout {
        Layout::from_size_align(IOMMU_PAGE_SIZE << order, IOMMU_PAGE_SIZE).expect("page layout")
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.live.lock().len()
    }
}

impl PageAllocator for HeapPages {
    fn alloc_pages(&self, order: u32) -> Option<VirtAddr> {
        if self.fail.load(Ordering::SeqCst) {
            return None;
        }
        let layout = Self::layout(order);
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        // SAFETY: freshly allocated block of layout.size() bytes
        unsafe { core::ptr::write_bytes(ptr, 0xa5, layout.size()) };
        self.live.lock().insert(ptr as usize, order);
        Some(VirtAddr::from_ptr(ptr))
    }

    fn free_pages(&self, vaddr: VirtAddr, order: u32) {
        let recorded = self.live.lock().remove(&vaddr.as_usize());
        assert_eq!(recorded, Some(order), "free of unknown block {:?}", vaddr);
        // SAFETY: the block came from alloc_pages with the same order
        unsafe { alloc::alloc::dealloc(vaddr.as_mut_ptr(), Self::layout(order)) };
    }
}

/// Sink that keeps every diagnostic
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<Diagnostic>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<Diagnostic> {
        self.events.lock().clone()
    }
}

impl DiagnosticSink for RecordingSink {
    fn report(&self, diagnostic: &Diagnostic) {
        self.events.lock().push(*diagnostic);
    }
}

/// Table of `size` slots at bus page 0 with the default configuration
pub(crate) fn table(size: usize) -> IommuTable<MockTce> {
    table_with(size, IommuConfig::new())
}

pub(crate) fn table_with(size: usize, config: IommuConfig) -> IommuTable<MockTce> {
    IommuTable::new(TableGeometry::new(0, size), config, MockTce::default())
}
