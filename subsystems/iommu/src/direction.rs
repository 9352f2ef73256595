//! DMA transfer direction and the translation-entry permissions it implies.

use bitflags::bitflags;

/// Direction of a DMA transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Bidirectional
    Bidirectional,
    /// Memory to device
    ToDevice,
    /// Device to memory
    FromDevice,
    /// No transfer; never valid for a mapping request
    None,
}

bitflags! {
    /// Access a translation entry grants to the device
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcePermissions: u8 {
        /// Device may read memory
        const READ = 1 << 0;
        /// Device may write memory
        const WRITE = 1 << 1;
    }
}

impl DmaDirection {
    /// Whether this direction may be used for a mapping
    #[inline]
    pub fn is_valid(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Entry permissions for this direction
    #[inline]
    pub fn permissions(self) -> TcePermissions {
        match self {
            Self::Bidirectional => TcePermissions::READ | TcePermissions::WRITE,
            Self::ToDevice => TcePermissions::READ,
            Self::FromDevice => TcePermissions::WRITE,
            Self::None => TcePermissions::empty(),
        }
    }

    /// Panic on `DmaDirection::None`
    ///
    /// Passing `None` to a mapping call is a driver bug, not a runtime
    /// condition.
    #[inline]
    #[track_caller]
    pub(crate) fn assert_valid(self) {
        assert!(self.is_valid(), "DMA mapping requested with DmaDirection::None");
    }
}
