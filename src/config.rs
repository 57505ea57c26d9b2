//! Tunables of the bad-block layer.

use std::time::Duration;

/// Blocks of every reservoir reserved for metadata: UPCB, LPCB, TPCB and REF
pub const METADATA_BLOCKS: u32 = 4;

/// Configuration shared by every die of a volume
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BmlConfig {
    /// Size of the spare pool of each die, in blocks (including [METADATA_BLOCKS])
    pub reservoir_blocks: u32,

    /// For hybrid dies, how many of `reservoir_blocks` sit on the SLC side of the boundary
    pub slc_reservoir_blocks: u32,

    /// Delay inserted before reporting hardware errors upward, so that an external power-fail
    /// detector can settle first
    pub error_report_delay: Option<Duration>,

    /// The device is being pre-programmed (e.g. by a factory image writer), so hardware locks
    /// are neither lifted nor reapplied
    pub preprogrammed: bool,

    /// Lock the PI record after writing it at format time
    pub lock_pi: bool,

    /// How many tracked blocks a [crate::refresh::RefreshScope::Partial] batch refreshes
    pub refresh_partial_quota: usize,
}

impl Default for BmlConfig {
    fn default() -> Self {
        Self {
            reservoir_blocks: 24,
            slc_reservoir_blocks: 8,
            error_report_delay: None,
            preprogrammed: false,
            lock_pi: false,
            refresh_partial_quota: 16,
        }
    }
}

impl BmlConfig {
    pub fn reservoir_blocks(mut self, blocks: u32) -> Self {
        self.reservoir_blocks = blocks;
        self
    }

    pub fn slc_reservoir_blocks(mut self, blocks: u32) -> Self {
        self.slc_reservoir_blocks = blocks;
        self
    }

    pub fn error_report_delay(mut self, delay: Duration) -> Self {
        self.error_report_delay = Some(delay);
        self
    }

    pub fn preprogrammed(mut self, preprogrammed: bool) -> Self {
        self.preprogrammed = preprogrammed;
        self
    }
}
