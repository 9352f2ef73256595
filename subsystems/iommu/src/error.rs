//! # IOMMU Errors
//!
//! Every failure is reported synchronously to the immediate caller. Nothing
//! in this crate is fatal: a bad free is logged and dropped, an exhausted
//! table returns an error and leaves the bitmap untouched.

use core::fmt;

/// Result type for IOMMU operations
pub type IommuResult<T> = Result<T, IommuError>;

/// IOMMU error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuError {
    /// No run of free slots large enough was found
    Exhausted {
        /// Pages requested
        npages: usize,
    },
    /// A range request for zero pages, or a length that wraps the address space
    InvalidPageCount,
    /// Coherent request above the maximum page order
    OrderTooLarge {
        /// Order that was requested
        order: u32,
    },
    /// The platform page allocator had nothing to give
    PageAllocationFailed,
    /// Table still has live mappings
    TableBusy {
        /// Slots still allocated
        pages_in_use: usize,
    },
}

impl fmt::Display for IommuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { npages } => write!(f, "no free run of {} IOMMU pages", npages),
            Self::InvalidPageCount => write!(f, "invalid IOMMU page count"),
            Self::OrderTooLarge { order } => write!(f, "coherent allocation order {} too large", order),
            Self::PageAllocationFailed => write!(f, "page allocation failed"),
            Self::TableBusy { pages_in_use } => {
                write!(f, "IOMMU table still has {} pages mapped", pages_in_use)
            },
        }
    }
}
