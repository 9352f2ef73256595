//! # IOMMU Configuration
//!
//! The only externally visible tunable is whether scatter-gather segments
//! may be coalesced. The build default comes from the `vmerge` feature and
//! can be overridden on the kernel command line with `iommu=novmerge` or
//! `iommu=vmerge`.

/// Scatter-gather coalescing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Merge segments whose bus ranges are contiguous
    Merge,
    /// Keep every segment separately addressable
    NoMerge,
}

impl MergePolicy {
    /// Build-time default
    pub const fn build_default() -> Self {
        if cfg!(feature = "vmerge") {
            Self::Merge
        } else {
            Self::NoMerge
        }
    }

    /// Whether merging is allowed
    #[inline]
    pub fn merges(self) -> bool {
        matches!(self, Self::Merge)
    }
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self::build_default()
    }
}

/// Per-table configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IommuConfig {
    /// Scatter-gather merge policy
    pub merge: MergePolicy,
    /// Small-allocation hints are rounded up to a multiple of this many slots
    pub block_size: usize,
}

impl IommuConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            merge: MergePolicy::build_default(),
            block_size: 1,
        }
    }

    /// Set the merge policy
    pub const fn with_merge(mut self, merge: MergePolicy) -> Self {
        self.merge = merge;
        self
    }

    /// Set the hint block size (rounded up to a power of two)
    pub const fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = if block_size == 0 {
            1
        } else {
            block_size.next_power_of_two()
        };
        self
    }

    /// Apply an `iommu=` boot option value such as `"novmerge"`
    ///
    /// Words are comma separated; unrecognised words are ignored.
    pub fn apply_boot_option(&mut self, value: &str) {
        for word in value.split(',').map(str::trim).filter(|w| !w.is_empty()) {
            match word {
                "novmerge" => {
                    log::info!("iommu: disabling virtual merging");
                    self.merge = MergePolicy::NoMerge;
                },
                "vmerge" => {
                    log::info!("iommu: enabling virtual merging");
                    self.merge = MergePolicy::Merge;
                },
                other => log::debug!("iommu: ignoring unknown option '{}'", other),
            }
        }
    }

    /// Configuration from a kernel command line
    ///
    /// Every `iommu=` argument is applied in order, so the last one wins.
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::new();
        for arg in cmdline.split_whitespace() {
            if let Some(value) = arg.strip_prefix("iommu=") {
                config.apply_boot_option(value);
            }
        }
        config
    }
}

impl Default for IommuConfig {
    fn default() -> Self {
        Self::new()
    }
}
