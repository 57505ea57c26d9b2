//! Finding free blocks in the reservoir.

use tracing::{debug, trace};

use super::Reservoir;
use crate::nand::CellType;

/// What an allocation is for
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Purpose {
    /// Replacing user blocks that went bad
    BadBlock,

    /// PCB or REF blocks; always a single block, never paired, never a candidate
    Metadata,

    /// Format-time replacement of factory-bad user blocks; single blocks only
    FactoryBad,
}

/// A set of blocks handed out by [Reservoir::find_free]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Allocation {
    /// On a paired allocation, `blocks[n]` sits in plane `n`
    pub blocks: Vec<u32>,
    pub paired: bool,
}

impl Reservoir {
    /// Iterate over `range` in allocation order for `cell`, stepping by `step`
    fn scan_order(&self, cell: CellType, step: u32) -> Vec<u32> {
        let range = self.sub_range(cell);
        let start = range.start.div_ceil(step) * step;
        let mut order: Vec<u32> = (start..range.end)
            .step_by(step as usize)
            .filter(|&x| x + step <= range.end)
            .collect();
        if !self.ascending(cell) {
            order.reverse();
        }
        order
    }

    /// Tier 1: a whole plane group, every block of which is free
    fn find_paired(&mut self, cell: CellType) -> Option<Allocation> {
        let planes = self.planes;
        let base = self
            .scan_order(cell, planes)
            .into_iter()
            .find(|&base| (base..base + planes).all(|x| !self.bitmap.is_allocated(x)))?;

        let blocks: Vec<u32> = (base..base + planes).collect();
        for &pbn in &blocks {
            self.bitmap.mark_allocated(pbn);
        }
        Some(Allocation {
            blocks,
            paired: true,
        })
    }

    /// Tier 2: one free block of the reservoir
    fn find_single(&mut self, cell: CellType) -> Option<u32> {
        let pbn = self
            .scan_order(cell, 1)
            .into_iter()
            .find(|&x| !self.bitmap.is_allocated(x))?;
        self.bitmap.mark_allocated(pbn);
        Some(pbn)
    }

    /// Tier 3: a candidate block of the right cell type, not already picked
    fn find_candidate(&self, cell: CellType, picked: &[u32]) -> Option<u32> {
        self.bmi
            .candidates()
            .find(|&x| self.cell_type_of(x) == cell && !picked.contains(&x))
    }

    /// Find `count` free blocks of the given cell type
    ///
    /// On multi-plane dies, bad-block allocations first try to take a whole plane group (which
    /// may return more blocks than requested), then single blocks, and finally reuse candidate
    /// blocks. Reservoir blocks are marked allocated; candidates stay in the candidate list
    /// until they are registered as a replacement.
    ///
    /// Returns `None` when the pool is exhausted.
    pub fn find_free(
        &mut self,
        count: u32,
        cell: CellType,
        purpose: Purpose,
    ) -> Option<Allocation> {
        let multi_plane = self.planes > 1 && purpose == Purpose::BadBlock;

        if multi_plane && count <= self.planes {
            if let Some(allocation) = self.find_paired(cell) {
                debug!(die = self.die, blocks = ?allocation.blocks, "paired allocation");
                return Some(allocation);
            }
        }

        let mut blocks = Vec::with_capacity(count as usize);
        while blocks.len() < count as usize {
            match self.find_single(cell) {
                Some(pbn) => blocks.push(pbn),
                None => break,
            }
        }

        if multi_plane {
            while blocks.len() < count as usize {
                match self.find_candidate(cell, &blocks) {
                    Some(pbn) => {
                        trace!(die = self.die, pbn, "reusing candidate block");
                        blocks.push(pbn);
                    }
                    None => break,
                }
            }
        }

        if blocks.len() < count as usize {
            self.release(&blocks);
            debug!(die = self.die, ?cell, count, "reservoir exhausted");
            return None;
        }

        Some(Allocation {
            blocks,
            paired: false,
        })
    }

    /// Give back blocks from an allocation that ended up unused
    pub fn release(&mut self, blocks: &[u32]) {
        for &pbn in blocks {
            self.bitmap.mark_free(pbn);
        }
    }

    /// Free blocks left for the given cell type
    pub fn free_blocks(&self, cell: CellType) -> u32 {
        self.sub_range(cell)
            .filter(|&x| !self.bitmap.is_allocated(x))
            .count() as u32
    }
}
