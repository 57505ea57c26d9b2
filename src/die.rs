//! The per-die context: the reservoir, the metadata log state and the partition snapshot of one
//! die, and the low-level helpers shared by replacement, refresh and the metadata log.

use std::thread;

use tracing::{debug, warn};

use crate::config::BmlConfig;
use crate::error::{BmlError, NandError, Result};
use crate::nand::{BadMark, LockState, Nand, NandLayout, PageUtil};
use crate::partition::PartitionTable;
use crate::pcb::layout::PcbRole;
use crate::pcb::log::PcbState;
use crate::reservoir::bmi::Bmf;
use crate::reservoir::Reservoir;

/// What [Die::copy_block] does about uncorrectable source pages
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ReadErrors {
    /// Leave the page out of the copy
    Skip,

    /// Stop and report the error
    Abort,
}

#[derive(Debug, Clone)]
pub struct Die {
    pub index: u32,
    pub rsv: Reservoir,
    pub pcb: PcbState,
    pub partitions: PartitionTable,

    pub(crate) layout: NandLayout,
    pub(crate) config: BmlConfig,

    /// Live indirection entries, as handed to the layer above
    bad_units: Vec<Bmf>,
}

impl Die {
    pub(crate) fn new(
        layout: NandLayout,
        config: BmlConfig,
        rsv: Reservoir,
        pcb: PcbState,
        partitions: PartitionTable,
    ) -> Self {
        let mut die = Self {
            index: rsv.die,
            rsv,
            pcb,
            partitions,
            layout,
            config,
            bad_units: Vec::new(),
        };
        die.rebuild_bad_units();
        die
    }

    /// Semi-physical blocks that were moved, and where to
    pub fn bad_units(&self) -> &[Bmf] {
        &self.bad_units
    }

    pub(crate) fn rebuild_bad_units(&mut self) {
        self.bad_units = self
            .rsv
            .bmi
            .entries()
            .iter()
            .filter(|x| !self.rsv.contains(x.original))
            .copied()
            .collect();
    }

    /// Wait out the configured delay before handing a hardware error upward
    pub(crate) fn report(&self, err: BmlError) -> BmlError {
        if let Some(delay) = self.config.error_report_delay {
            thread::sleep(delay);
        }
        err
    }

    /// The log role that must record a change to `sbn`
    pub(crate) fn role_for(&self, sbn: u32) -> PcbRole {
        if self.partitions.is_lock_tight(sbn) {
            PcbRole::Lockable
        } else {
            PcbRole::Unlockable
        }
    }

    pub(crate) fn block_pages<N: Nand>(&self, nand: &N, pbn: u32) -> Result<u32> {
        Ok(nand.block_info(pbn)?.pages)
    }

    /// Write the bad-block marker into pages 0 and 1 of `pbn`, and into the MSB pages sharing
    /// cells with them
    ///
    /// Failures are only logged: a block that cannot even be marked is already out of use.
    pub(crate) fn mark_bad<N: Nand>(&self, nand: &mut N, pbn: u32, mark: BadMark) {
        let mut pages = vec![0, 1];
        pages.extend([0, 1].iter().filter_map(|&x| nand.paired_page(pbn, x)));

        debug!(die = self.index, pbn, ?mark, "marking block bad");
        for page in pages {
            if let Err(e) = nand.write_bad_mark(pbn, page, mark) {
                warn!(die = self.index, pbn, page, "could not write bad mark: {e}");
            }
        }
    }

    /// Copy the written pages of `src` below `limit` into `dst`
    pub(crate) fn copy_block<N: Nand>(
        &self,
        nand: &mut N,
        src: u32,
        dst: u32,
        limit: Option<u32>,
        read_errors: ReadErrors,
    ) -> Result<(), NandError> {
        let pages = std::cmp::min(nand.block_info(src)?.pages, nand.block_info(dst)?.pages);
        let pages = limit.map_or(pages, |x| x.min(pages));
        let mut buf = vec![0u8; self.layout.bytes_per_page];

        for page in 0..pages {
            match nand.read_page(src, page, &mut buf) {
                Ok(_) => {}
                Err(NandError::UncorrectableRead { .. }) if read_errors == ReadErrors::Skip => {
                    warn!(die = self.index, src, page, "skipping unreadable page");
                    continue;
                }
                Err(e) => return Err(e),
            }

            if buf.is_erased() {
                continue;
            }
            nand.write_page(dst, page, &buf)?;
        }

        nand.flush()
    }

    /// The lock state of `pbn`, or `None` if it cannot be determined
    ///
    /// Pre-programmed devices are never relocked, so they always read as unlocked.
    pub(crate) fn query_lock<N: Nand>(&self, nand: &mut N, pbn: u32) -> Option<LockState> {
        if self.config.preprogrammed {
            return Some(LockState::Unlocked);
        }

        match nand.lock_state(pbn) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(die = self.index, pbn, "lock state lookup failed: {e}");
                None
            }
        }
    }

    pub(crate) fn set_lock<N: Nand>(&self, nand: &mut N, pbn: u32, state: LockState) -> Result<()> {
        if self.config.preprogrammed {
            return Ok(());
        }

        nand.set_lock(pbn, 1, state)
            .map_err(|source| BmlError::LockFailed { pbn, source })
    }
}
