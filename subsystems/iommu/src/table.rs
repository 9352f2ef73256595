//! # IOMMU Table
//!
//! One [`IommuTable`] owns the bus address window of one IOMMU: its geometry,
//! the slot bitmap, the two rotating search hints, and the lock that
//! serializes every change to them.
//!
//! ## Layout
//!
//! ```text
//!   slot 0                       half_point                    size
//!   ├──────────── small ────────────┼─────────── large ───────────┤
//!   │  ≤ 15 pages, from `hint`      │  > 15 pages, from           │
//!   │                               │  `large_hint`               │
//! ```
//!
//! ## Search
//!
//! A request is tried in up to three passes:
//!
//! | Pass | Small request            | Large request            |
//! |------|--------------------------|--------------------------|
//! | 0    | `[hint, half_point)`     | `[large_hint, size)`     |
//! | 1    | `[half_point, size)`     | `[0, half_point)`        |
//! | 2    | `[0, size)`              | `[0, size)`              |
//!
//! Within a pass, a candidate run that hits a busy slot restarts the scan just
//! past that slot.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::mem::{self, ManuallyDrop};
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{fence, Ordering};

use spin::{Mutex, MutexGuard};

use crate::addr::{DmaAddr, Slot, VirtAddr};
use crate::bitmap::Bitmap;
use crate::config::IommuConfig;
use crate::diag::{Diagnostic, DiagnosticSink, IommuStats, RateLimit};
use crate::direction::DmaDirection;
use crate::error::{IommuError, IommuResult};
use crate::platform::TceBackend;
use crate::LARGE_ALLOC_THRESHOLD;

// =============================================================================
// Geometry
// =============================================================================

/// Fixed description of a table's bus window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableGeometry {
    /// Bus number the window belongs to
    pub bus_number: u32,
    /// Window index on that bus
    pub index: u32,
    /// Bus page number mapped by slot 0
    pub offset: u64,
    /// Number of slots
    pub size: usize,
}

impl TableGeometry {
    /// Geometry for a window of `size` slots starting at bus page `offset`
    pub const fn new(offset: u64, size: usize) -> Self {
        Self {
            bus_number: 0,
            index: 0,
            offset,
            size,
        }
    }

    /// Set the bus number and window index
    pub const fn on_bus(mut self, bus_number: u32, index: u32) -> Self {
        self.bus_number = bus_number;
        self.index = index;
        self
    }

    /// Whether `npages` starting at bus page `entry` lie inside the window
    #[inline]
    pub fn contains(&self, entry: u64, npages: usize) -> bool {
        entry
            .checked_sub(self.offset)
            .and_then(|rel| rel.checked_add(npages as u64))
            .is_some_and(|end| end <= self.size as u64)
    }
}

// =============================================================================
// Locked State
// =============================================================================

/// Search hints, as slot indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableHints {
    /// Where the next small search starts
    pub hint: usize,
    /// Where the next large search starts
    pub large_hint: usize,
}

/// Everything the table lock protects
pub(crate) struct TableState {
    map: Bitmap,
    hint: usize,
    large_hint: usize,
    /// Diagnostics raised under the lock, handed to the sink on unlock
    deferred: Vec<Diagnostic>,
}

/// Table lock guard
///
/// Releasing it delivers the diagnostics queued while it was held, so a
/// [`DiagnosticSink`] may call back into the table.
pub(crate) struct TableGuard<'a, B: TceBackend> {
    table: &'a IommuTable<B>,
    state: ManuallyDrop<MutexGuard<'a, TableState>>,
}

impl<B: TceBackend> Deref for TableGuard<'_, B> {
    type Target = TableState;

    fn deref(&self) -> &TableState {
        &self.state
    }
}

impl<B: TceBackend> DerefMut for TableGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut TableState {
        &mut self.state
    }
}

impl<B: TceBackend> Drop for TableGuard<'_, B> {
    fn drop(&mut self) {
        let deferred = mem::take(&mut self.state.deferred);
        // SAFETY: `state` is never used again after this
        unsafe { ManuallyDrop::drop(&mut self.state) };
        for diagnostic in &deferred {
            self.table.notify(diagnostic);
        }
    }
}

/// Resume point for chained allocations
///
/// Scatter-gather mapping threads one cursor through every segment so each
/// search starts where the previous segment's run ended.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AllocCursor(Option<usize>);

/// Search window for one pass
#[derive(Debug, Clone, Copy)]
struct Window {
    start: usize,
    limit: usize,
}

// =============================================================================
// Table
// =============================================================================

/// Bitmap-managed IOMMU bus address window
pub struct IommuTable<B: TceBackend> {
    geometry: TableGeometry,
    half_point: usize,
    config: IommuConfig,
    state: Mutex<TableState>,
    backend: B,
    stats: IommuStats,
    ratelimit: RateLimit,
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl<B: TceBackend> IommuTable<B> {
    /// Create a table with every slot free
    pub fn new(geometry: TableGeometry, config: IommuConfig, backend: B) -> Self {
        // Split the table: small allocations below, large ones in the top quarter
        let half_point = geometry.size * 3 / 4;

        log::debug!(
            "iommu: table bus {} index {} offset {:#x} size {:#x} half {:#x}",
            geometry.bus_number,
            geometry.index,
            geometry.offset,
            geometry.size,
            half_point
        );

        Self {
            geometry,
            half_point,
            config,
            state: Mutex::new(TableState {
                map: Bitmap::new(geometry.size),
                hint: 0,
                large_hint: half_point,
                deferred: Vec::new(),
            }),
            backend,
            stats: IommuStats::default(),
            ratelimit: RateLimit::default(),
            sink: None,
        }
    }

    /// Attach a diagnostic observer
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the warning rate limiter
    pub fn with_rate_limit(mut self, ratelimit: RateLimit) -> Self {
        self.ratelimit = ratelimit;
        self
    }

    /// Window geometry
    #[inline]
    pub fn geometry(&self) -> &TableGeometry {
        &self.geometry
    }

    /// Configuration
    #[inline]
    pub fn config(&self) -> &IommuConfig {
        &self.config
    }

    /// First slot of the large-allocation region
    #[inline]
    pub fn half_point(&self) -> usize {
        self.half_point
    }

    /// Hardware backend
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Counters
    #[inline]
    pub fn stats(&self) -> &IommuStats {
        &self.stats
    }

    /// Number of allocated slots
    pub fn pages_in_use(&self) -> usize {
        self.state.lock().map.count_ones()
    }

    /// Whether a slot is allocated
    pub fn is_allocated(&self, slot: Slot) -> bool {
        slot.index() < self.geometry.size && self.state.lock().map.test(slot.index())
    }

    /// Current search hints
    pub fn hints(&self) -> TableHints {
        let state = self.state.lock();
        TableHints {
            hint: state.hint,
            large_hint: state.large_hint,
        }
    }

    /// Copy of the slot bitmap
    pub fn bitmap_snapshot(&self) -> Bitmap {
        self.state.lock().map.clone()
    }

    // -------------------------------------------------------------------------
    // Range allocation
    // -------------------------------------------------------------------------

    /// Reserve `npages` consecutive slots
    ///
    /// No translation entries are written; see
    /// [`map_single`](Self::map_single) for that.
    pub fn alloc_range(&self, npages: usize) -> IommuResult<Slot> {
        let mut state = self.lock_state();
        self.range_alloc(&mut state, npages, None)
    }

    /// Release slots obtained from [`alloc_range`](Self::alloc_range)
    pub fn free_range(&self, slot: Slot, npages: usize) {
        let mut state = self.lock_state();
        self.free_locked(&mut state, slot.dma_addr(self.geometry.offset), npages);
    }

    pub(crate) fn lock_state(&self) -> TableGuard<'_, B> {
        TableGuard {
            table: self,
            state: ManuallyDrop::new(self.state.lock()),
        }
    }

    /// Find and mark a run of `npages` free slots; the lock must be held
    pub(crate) fn range_alloc(
        &self,
        state: &mut TableState,
        npages: usize,
        cursor: Option<&mut AllocCursor>,
    ) -> IommuResult<Slot> {
        if npages == 0 {
            if self.ratelimit.allow() {
                log::warn!("iommu: zero-page range request on bus {}", self.geometry.bus_number);
            }
            return Err(IommuError::InvalidPageCount);
        }

        let size = self.geometry.size;
        let half = self.half_point;
        let large = npages > LARGE_ALLOC_THRESHOLD;

        let resume = cursor.as_ref().and_then(|c| c.0);
        let mut start = resume.unwrap_or(if large { state.large_hint } else { state.hint });
        let limit = if large { size } else { half };

        if large && start < half {
            start = half;
        }

        // A small run chained after a large one, or a hint left at the very
        // end of the region: go back to the beginning of the region.
        if start >= limit {
            start = if large {
                state.large_hint = half;
                half
            } else {
                state.hint = 0;
                0
            };
        }

        let passes = [
            Window { start, limit },
            if large {
                Window { start: 0, limit: half }
            } else {
                Window { start: half, limit: size }
            },
            Window { start: 0, limit: size },
        ];

        let Some(n) = passes
            .into_iter()
            .find_map(|window| Self::scan(&state.map, window, npages))
        else {
            self.defer(state, Diagnostic::Exhausted { npages });
            return Err(IommuError::Exhausted { npages });
        };

        let end = n + npages;
        state.map.set_range(n, npages);

        // Hints stay inside their region; one left at the end wraps to the start
        if large {
            // Large hints are never rounded
            state.large_hint = if (half..size).contains(&end) { end } else { half };
        } else {
            let mask = self.config.block_size - 1;
            let rounded = (end + mask) & !mask;
            state.hint = if rounded < half { rounded } else { 0 };
        }

        if let Some(cursor) = cursor {
            cursor.0 = Some(end);
        }

        Ok(Slot::new(n))
    }

    /// First run of `npages` clear bits inside `window`
    fn scan(map: &Bitmap, window: Window, npages: usize) -> Option<usize> {
        let mut start = window.start;
        loop {
            let n = map.find_next_zero(start, window.limit);
            if n + npages > window.limit {
                return None;
            }
            match map.first_set_in(n, npages) {
                Some(busy) => start = busy + 1,
                None => return Some(n),
            }
        }
    }

    /// Drop translations and bitmap bits for a bus range; the lock must be held
    ///
    /// Ranges outside the window are reported and ignored.
    pub(crate) fn free_locked(&self, state: &mut TableState, dma_addr: DmaAddr, npages: usize) {
        let entry = dma_addr.page();

        if !self.geometry.contains(entry, npages) {
            let diagnostic = Diagnostic::InvalidFree {
                entry,
                dma_addr,
                npages,
                table_offset: self.geometry.offset,
                table_size: self.geometry.size,
            };
            self.defer(state, diagnostic);
            return;
        }

        self.backend.free(&self.geometry, entry, npages);

        let free_entry = (entry - self.geometry.offset) as usize;
        state.map.clear_range(free_entry, npages);
    }

    // -------------------------------------------------------------------------
    // Hardware helpers
    // -------------------------------------------------------------------------

    /// Write translation entries for a freshly reserved run
    pub(crate) fn build_entries(&self, slot: Slot, npages: usize, vaddr: VirtAddr, dir: DmaDirection) {
        self.backend.build(
            &self.geometry,
            slot.bus_page(self.geometry.offset),
            npages,
            vaddr.page_base(),
            dir.permissions(),
        );
    }

    /// Flush the hardware translation cache
    #[inline]
    pub(crate) fn flush(&self) {
        self.backend.flush(&self.geometry);
    }

    /// Order entry writes before a bus address escapes to a device
    #[inline]
    pub(crate) fn barrier(&self) {
        fence(Ordering::SeqCst);
    }

    /// Count and log a diagnostic, then pass it to the sink; the lock must
    /// not be held
    pub(crate) fn report(&self, diagnostic: Diagnostic) {
        self.record(&diagnostic);
        self.notify(&diagnostic);
    }

    /// Count and log a diagnostic now, and queue it for the sink until the
    /// lock is released
    fn defer(&self, state: &mut TableState, diagnostic: Diagnostic) {
        self.record(&diagnostic);
        if self.sink.is_some() {
            state.deferred.push(diagnostic);
        }
    }

    fn record(&self, diagnostic: &Diagnostic) {
        match diagnostic {
            Diagnostic::Exhausted { .. } => self.stats.record_exhausted(),
            Diagnostic::InvalidFree { .. } => self.stats.record_invalid_free(),
            Diagnostic::OrderTooLarge { .. } => self.stats.record_oversized(),
        }

        if self.ratelimit.allow() {
            log::warn!("iommu (bus {}): {}", self.geometry.bus_number, diagnostic);
        }
    }

    fn notify(&self, diagnostic: &Diagnostic) {
        if let Some(sink) = &self.sink {
            sink.report(diagnostic);
        }
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Tear the table down and hand back its backend
    ///
    /// Refused while any slot is still allocated; the table is returned
    /// untouched in that case.
    pub fn destroy(self) -> Result<B, (IommuError, Self)> {
        let pages_in_use = self.pages_in_use();
        if pages_in_use != 0 {
            log::error!(
                "iommu: destroying table bus {} index {} with {} pages mapped",
                self.geometry.bus_number,
                self.geometry.index,
                pages_in_use
            );
            return Err((IommuError::TableBusy { pages_in_use }, self));
        }
        Ok(self.backend)
    }
}

impl<B: TceBackend> fmt::Debug for IommuTable<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("IommuTable");
        s.field("geometry", &self.geometry)
            .field("half_point", &self.half_point)
            .field("config", &self.config);
        match self.state.try_lock() {
            Some(state) => s
                .field("in_use", &state.map.count_ones())
                .field("hint", &state.hint)
                .field("large_hint", &state.large_hint),
            None => s.field("state", &"<locked>"),
        };
        s.finish()
    }
}
