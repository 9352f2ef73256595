//! # Helix IOMMU
//!
//! Bitmap-indexed allocator for IOMMU bus address space, and the DMA
//! mapping layers built on top of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Device drivers                             │
//! │        map_single / map_sg / alloc_coherent  (DmaOps)           │
//! └───────────────┬──────────────────┬──────────────────┬───────────┘
//!                 │                  │                  │
//!        ┌────────▼──────┐  ┌────────▼───────┐  ┌───────▼────────┐
//!        │ Single buffer │  │ Scatter-gather │  │   Coherent     │
//!        │   mapping     │  │  map + merge   │  │  allocation    │
//!        └────────┬──────┘  └────────┬───────┘  └───────┬────────┘
//!                 └──────────────────┼──────────────────┘
//!                           ┌────────▼────────┐
//!                           │   IommuTable    │  lock, hints, geometry
//!                           │  ┌───────────┐  │
//!                           │  │  Bitmap   │  │  one bit per slot
//!                           │  └───────────┘  │
//!                           └────────┬────────┘
//!                                    │ TceBackend (build / free / flush)
//!                           ┌────────▼────────┐
//!                           │ IOMMU hardware  │
//!                           └─────────────────┘
//! ```
//!
//! ## Allocation Policy
//!
//! Requests of more than [`LARGE_ALLOC_THRESHOLD`] pages are "large" and are
//! steered to the top quarter of the table; small requests use the bottom
//! three quarters. Each class keeps a rotating hint so successive searches
//! resume where the previous allocation ended.
//!
//! ## Invariants
//!
//! 1. A bitmap bit is set if and only if a live mapping owns the slot.
//! 2. Every bitmap mutation happens under the table lock.
//! 3. A failed scatter-gather mapping leaves the table exactly as it was.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod addr;
pub mod bitmap;
pub mod coherent;
pub mod config;
pub mod diag;
pub mod direction;
pub mod error;
pub mod ops;
pub mod platform;
pub mod sg;
pub mod single;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;

use static_assertions::const_assert;

pub use addr::{DmaAddr, Slot, VirtAddr};
pub use coherent::CoherentBuffer;
pub use config::{IommuConfig, MergePolicy};
pub use diag::{Diagnostic, DiagnosticSink, IommuStats, RateLimit, StatsSnapshot};
pub use direction::{DmaDirection, TcePermissions};
pub use error::{IommuError, IommuResult};
pub use ops::DmaOps;
pub use platform::{PageAllocator, TceBackend};
pub use sg::{dma_segments, ScatterEntry};
pub use table::{IommuTable, TableGeometry, TableHints};

// =============================================================================
// Page Geometry
// =============================================================================

/// Shift of one IOMMU page (one table slot)
pub const IOMMU_PAGE_SHIFT: u32 = 12;

/// Size of one IOMMU page in bytes
pub const IOMMU_PAGE_SIZE: usize = 1 << IOMMU_PAGE_SHIFT;

/// Mask selecting the page-aligned part of an address
pub const IOMMU_PAGE_MASK: u64 = !(IOMMU_PAGE_SIZE as u64 - 1);

/// Coherent allocations of this page order or above are refused
pub const IOMAP_MAX_ORDER: u32 = 13;

/// Requests of more pages than this are served from the large region
pub const LARGE_ALLOC_THRESHOLD: usize = 15;

const_assert!(IOMMU_PAGE_SIZE.is_power_of_two());
const_assert!(IOMAP_MAX_ORDER < usize::BITS - IOMMU_PAGE_SHIFT);
