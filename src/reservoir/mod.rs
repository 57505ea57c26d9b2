//! The per-die reservoir: the pool of spare blocks, and all of the state describing how it is
//! used.
//!
//! A reservoir sits at the end of a single-technology die:
//!
//! ```text
//! | user blocks ..................................... | reservoir |
//! ```
//!
//! On a hybrid ("Flex") die, it straddles the SLC/MLC boundary recorded in the die's PI record,
//! so that both cell types have their own spares:
//!
//! ```text
//! | SLC user blocks ... | SLC reservoir | MLC reservoir | MLC user blocks ... |
//!                                       ^ boundary
//! ```
//!
//! SLC spares are handed out in ascending order, everything else in descending order, so that
//! both sides grow away from the boundary.

pub mod alloc;
pub mod bitmap;
pub mod bmi;
pub mod erl;

use std::ops::Range;

use crate::config::{BmlConfig, METADATA_BLOCKS};
use crate::error::{BmlError, Result};
use crate::nand::{CellLayout, CellType, NandLayout, PiRecord};

use self::bitmap::AllocBitmap;
use self::bmi::IndirectionTable;
use self::erl::EraseRefreshList;

/// Sentinel for "no block" in metadata block fields
pub const NO_BLOCK: u32 = u32::MAX;

/// Largest reservoir whose allocation bitmap fits one metadata sector
pub const MAX_RESERVOIR_BLOCKS: u32 = 4096;

/// The blocks of a reservoir reserved for metadata
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MetaBlocks {
    pub upcb: u32,
    pub lpcb: u32,
    pub tpcb: u32,
    pub ref_block: u32,
}

impl Default for MetaBlocks {
    fn default() -> Self {
        Self {
            upcb: NO_BLOCK,
            lpcb: NO_BLOCK,
            tpcb: NO_BLOCK,
            ref_block: NO_BLOCK,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reservoir {
    pub die: u32,
    pub kind: CellLayout,
    pub planes: u32,

    /// Blocks of the die, `die_first..die_end`
    pub die_first: u32,
    pub die_end: u32,

    /// First and last (inclusive) block of the reservoir
    pub first: u32,
    pub last: u32,

    /// First MLC block of the die
    pub boundary: u32,

    pub bitmap: AllocBitmap,
    pub bmi: IndirectionTable,
    pub erl: EraseRefreshList,
    pub meta: MetaBlocks,
}

impl Reservoir {
    /// Lay out the reservoir of `die`, given the die's current PI record
    pub fn new(layout: &NandLayout, config: &BmlConfig, die: u32, pi: PiRecord) -> Result<Self> {
        let planes = layout.planes.max(1);
        let size = config.reservoir_blocks;
        let die_first = layout.die_base(die);
        let die_end = die_first + layout.blocks_per_die;

        if size % planes != 0 || size < METADATA_BLOCKS + planes || size > MAX_RESERVOIR_BLOCKS {
            return Err(BmlError::InvalidArgument(format!(
                "reservoir of {size} blocks does not fit {planes} planes and metadata"
            )));
        }

        let (first, boundary) = match layout.cells {
            CellLayout::SlcOnly => (die_end.checked_sub(size), die_end),
            CellLayout::MlcOnly => (die_end.checked_sub(size), die_first),
            CellLayout::Hybrid => {
                let slc = config.slc_reservoir_blocks;
                if slc % planes != 0 || slc == 0 || slc >= size {
                    return Err(BmlError::InvalidArgument(format!(
                        "SLC share of {slc} blocks is not usable"
                    )));
                }
                let boundary = die_first + pi.slc_blocks;
                (boundary.checked_sub(slc), boundary)
            }
        };

        let first = first
            .filter(|&x| x > die_first && x % planes == 0 && x + size <= die_end)
            .ok_or_else(|| {
                let msg = format!("reservoir of {size} blocks does not fit die {die}");
                BmlError::InvalidArgument(msg)
            })?;
        let last = first + size - 1;

        let capacity = bmi_capacity(size);
        Ok(Self {
            die,
            kind: layout.cells,
            planes,
            die_first,
            die_end,
            first,
            last,
            boundary,
            bitmap: AllocBitmap::new(first, size),
            bmi: IndirectionTable::new(capacity),
            erl: EraseRefreshList::new(),
            meta: Default::default(),
        })
    }

    pub fn len(&self) -> u32 {
        self.last - self.first + 1
    }

    /// Does `pbn` lie in the reservoir's address space?
    pub fn contains(&self, pbn: u32) -> bool {
        (self.first..=self.last).contains(&pbn)
    }

    pub fn contains_die_block(&self, pbn: u32) -> bool {
        (self.die_first..self.die_end).contains(&pbn)
    }

    pub fn cell_type_of(&self, pbn: u32) -> CellType {
        match self.kind {
            CellLayout::SlcOnly => CellType::Slc,
            CellLayout::MlcOnly => CellType::Mlc,
            CellLayout::Hybrid if pbn < self.boundary => CellType::Slc,
            CellLayout::Hybrid => CellType::Mlc,
        }
    }

    /// The part of the reservoir holding spares of the given cell type
    pub fn sub_range(&self, cell: CellType) -> Range<u32> {
        match (self.kind, cell) {
            (CellLayout::Hybrid, CellType::Slc) => self.first..self.boundary,
            (CellLayout::Hybrid, CellType::Mlc) => self.boundary..self.last + 1,
            _ => self.first..self.last + 1,
        }
    }

    /// Spares are searched upwards only on the SLC side of a hybrid reservoir
    pub fn ascending(&self, cell: CellType) -> bool {
        self.kind == CellLayout::Hybrid && cell == CellType::Slc
    }

    /// The cell type metadata blocks should be allocated from
    pub fn pcb_cell(&self) -> CellType {
        match self.kind {
            CellLayout::MlcOnly => CellType::Mlc,
            _ => CellType::Slc,
        }
    }

    /// REF must hold a full copy of any block, so it comes from MLC on a hybrid die
    pub fn ref_cell(&self) -> CellType {
        match self.kind {
            CellLayout::SlcOnly => CellType::Slc,
            _ => CellType::Mlc,
        }
    }

    /// Number of SLC user blocks at the start of the die
    pub fn slc_user_blocks(&self) -> u32 {
        match self.kind {
            CellLayout::Hybrid | CellLayout::SlcOnly => self.first - self.die_first,
            CellLayout::MlcOnly => 0,
        }
    }

    /// The PI record matching the current boundary
    pub fn pi_record(&self) -> PiRecord {
        PiRecord {
            slc_blocks: self.boundary - self.die_first,
        }
    }

    /// Move the SLC/MLC boundary inside the reservoir by `delta` blocks
    ///
    /// Only valid while formatting; both sides must keep at least one plane group.
    pub fn shift_boundary(&mut self, delta: i64) -> Result<()> {
        let boundary = i64::from(self.boundary) + delta;
        let lowest = i64::from(self.first + self.planes);
        let highest = i64::from(self.last + 1 - self.planes);
        if self.kind != CellLayout::Hybrid || boundary < lowest || boundary > highest {
            return Err(BmlError::InvalidArgument(format!(
                "cannot move boundary of die {} by {delta}",
                self.die
            )));
        }

        self.boundary = boundary as u32;
        Ok(())
    }

    /// Is `pbn` one of the metadata blocks (PCBs or REF)?
    pub fn is_meta_block(&self, pbn: u32) -> bool {
        let MetaBlocks {
            upcb,
            lpcb,
            tpcb,
            ref_block,
        } = self.meta;
        [upcb, lpcb, tpcb, ref_block].contains(&pbn)
    }
}

/// Capacity of the indirection table of a reservoir of `size` blocks
///
/// Replacements of replacements need a second entry, hence the 3/2.
pub fn bmi_capacity(size: u32) -> usize {
    (size.saturating_sub(METADATA_BLOCKS) as usize) * 3 / 2
}
