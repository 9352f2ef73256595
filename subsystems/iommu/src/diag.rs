//! # Diagnostics
//!
//! Failure reporting for the IOMMU table:
//!
//! - [`IommuStats`]: lock-free counters, always on
//! - [`DiagnosticSink`]: optional observer receiving structured events
//! - [`RateLimit`]: keeps `log` output bounded under sustained pressure

use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::addr::DmaAddr;

// =============================================================================
// Diagnostic Events
// =============================================================================

/// A failure observed by the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// A range allocation found no space
    Exhausted {
        /// Pages requested
        npages: usize,
    },
    /// A free named a range outside the table
    InvalidFree {
        /// Absolute bus page of the freed address
        entry: u64,
        /// Bus address passed by the caller
        dma_addr: DmaAddr,
        /// Pages the caller asked to free
        npages: usize,
        /// First bus page of the table
        table_offset: u64,
        /// Table size in slots
        table_size: usize,
    },
    /// A coherent request exceeded the maximum page order
    OrderTooLarge {
        /// Requested size in bytes
        size: usize,
        /// Page order of the request
        order: u32,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { npages } => write!(f, "iommu_alloc failed, npages {}", npages),
            Self::InvalidFree {
                entry,
                dma_addr,
                npages,
                table_offset,
                table_size,
            } => write!(
                f,
                "iommu_free: invalid entry {:#x} dma_addr {} npages {} (table offset {:#x} size {:#x})",
                entry, dma_addr, npages, table_offset, table_size
            ),
            Self::OrderTooLarge { size, order } => {
                write!(f, "iommu_alloc_coherent size too large: {:#x} (order {})", size, order)
            },
        }
    }
}

/// Observer for table diagnostics
///
/// Reports are delivered after the table lock is released, so an
/// implementation may query the table (for example to dump its state).
pub trait DiagnosticSink: Send + Sync {
    /// Called once per diagnostic, outside of any rate limiting
    fn report(&self, diagnostic: &Diagnostic);
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Count-based message limiter
///
/// The first `burst` events pass; after that one in every `interval` does.
#[derive(Debug)]
pub struct RateLimit {
    burst: usize,
    interval: usize,
    events: AtomicUsize,
}

impl RateLimit {
    /// Default burst before throttling
    pub const DEFAULT_BURST: usize = 10;
    /// Default throttled interval
    pub const DEFAULT_INTERVAL: usize = 100;

    /// Create a limiter
    pub const fn new(burst: usize, interval: usize) -> Self {
        Self {
            burst,
            interval: if interval == 0 { 1 } else { interval },
            events: AtomicUsize::new(0),
        }
    }

    /// Record one event; returns whether it should be emitted
    pub fn allow(&self) -> bool {
        let n = self.events.fetch_add(1, Ordering::Relaxed);
        n < self.burst || (n - self.burst) % self.interval == 0
    }

    /// Events seen so far
    pub fn events(&self) -> usize {
        self.events.load(Ordering::Relaxed)
    }

    /// Events that were not emitted
    pub fn suppressed(&self) -> usize {
        let n = self.events();
        if n <= self.burst {
            0
        } else {
            let over = n - self.burst;
            over - over.div_ceil(self.interval)
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BURST, Self::DEFAULT_INTERVAL)
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Table statistics
#[derive(Debug, Default)]
pub struct IommuStats {
    single_maps: AtomicU64,
    single_unmaps: AtomicU64,
    sg_maps: AtomicU64,
    sg_unmaps: AtomicU64,
    sg_merges: AtomicU64,
    sg_rollbacks: AtomicU64,
    coherent_allocs: AtomicU64,
    coherent_frees: AtomicU64,
    exhausted: AtomicU64,
    invalid_frees: AtomicU64,
    oversized: AtomicU64,
}

/// Point-in-time copy of [`IommuStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Successful single-buffer mappings
    pub single_maps: u64,
    /// Single-buffer unmaps
    pub single_unmaps: u64,
    /// Successful scatter-gather mappings
    pub sg_maps: u64,
    /// Scatter-gather unmaps
    pub sg_unmaps: u64,
    /// Input segments folded into a previous output segment
    pub sg_merges: u64,
    /// Scatter-gather mappings unwound after a failure
    pub sg_rollbacks: u64,
    /// Successful coherent allocations
    pub coherent_allocs: u64,
    /// Coherent frees
    pub coherent_frees: u64,
    /// Range allocations that found no space
    pub exhausted: u64,
    /// Frees dropped by the bounds check
    pub invalid_frees: u64,
    /// Coherent requests above the maximum order
    pub oversized: u64,
}

macro_rules! counter {
    ($($inc:ident => $field:ident),* $(,)?) => {
        impl IommuStats {
            $(
                #[inline]
                pub(crate) fn $inc(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Copy the counters
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counter! {
    record_single_map => single_maps,
    record_single_unmap => single_unmaps,
    record_sg_map => sg_maps,
    record_sg_unmap => sg_unmaps,
    record_sg_merge => sg_merges,
    record_sg_rollback => sg_rollbacks,
    record_coherent_alloc => coherent_allocs,
    record_coherent_free => coherent_frees,
    record_exhausted => exhausted,
    record_invalid_free => invalid_frees,
    record_oversized => oversized,
}
