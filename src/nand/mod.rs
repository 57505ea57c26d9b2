//! Abstractions and code to access NAND flash

use std::str::FromStr;

use crate::error::NandError;

#[cfg(target_os = "linux")]
pub mod mtd;
mod sim;

pub use sim::SimNand;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;

    /// Does this page contain the all-0s bit pattern?
    fn is_zeroed(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }

    fn is_zeroed(&self) -> bool {
        self.iter().all(|&x| x == 0x00)
    }
}

/// The cell technology of a single block
#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
pub enum CellType {
    Slc,
    Mlc,
}

/// How cell technologies are spread over each die
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum CellLayout {
    #[default]
    SlcOnly,
    MlcOnly,

    /// "Flex" dies: SLC blocks from the start of the die up to the PI boundary, MLC after it
    Hybrid,
}

impl From<CellLayout> for u8 {
    fn from(value: CellLayout) -> Self {
        match value {
            CellLayout::SlcOnly => 1,
            CellLayout::MlcOnly => 2,
            CellLayout::Hybrid => 3,
        }
    }
}

impl TryFrom<u8> for CellLayout {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::SlcOnly),
            2 => Ok(Self::MlcOnly),
            3 => Ok(Self::Hybrid),
            _ => Err(()),
        }
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
///
/// Block numbers are device-global: die `d` owns blocks `d * blocks_per_die ..`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub dies: u32,
    pub planes: u32,
    pub blocks_per_die: u32,

    /// Pages in an MLC block (or in any block of a single-technology device). SLC blocks of a
    /// hybrid device have half as many.
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub cells: CellLayout,
}

impl NandLayout {
    pub fn dies(mut self, dies: u32) -> Self {
        self.dies = dies;
        self
    }

    pub fn planes(mut self, planes: u32) -> Self {
        self.planes = planes;
        self
    }

    pub fn cells(mut self, cells: CellLayout) -> Self {
        self.cells = cells;
        self
    }

    pub fn blocks_per_device(&self) -> u32 {
        self.blocks_per_die * self.dies
    }

    pub fn die_of(&self, pbn: u32) -> u32 {
        pbn / self.blocks_per_die
    }

    pub fn die_base(&self, die: u32) -> u32 {
        die * self.blocks_per_die
    }

    /// Pages in a block of the given cell type
    pub fn pages_for(&self, cell: CellType) -> u32 {
        match (self.cells, cell) {
            (CellLayout::Hybrid, CellType::Slc) => self.pages_per_block / 2,
            _ => self.pages_per_block,
        }
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES", describing a single-plane, single-die SLC device
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks_per_die = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;

        Ok(NandLayout {
            dies: 1,
            planes: 1,
            blocks_per_die,
            pages_per_block,
            bytes_per_page,
            cells: CellLayout::SlcOnly,
        })
    }
}

/// Per-block information reported by the device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockInfo {
    pub cell: CellType,
    pub pages: u32,
}

/// The outcome of a successful page read
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadStatus {
    Clean,

    /// The data was corrected, but enough bits flipped that the block should be refreshed
    Disturbed,
}

/// Hardware write-protection state of a block
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum LockState {
    #[default]
    Unlocked,
    Locked,

    /// Locked until the next power cycle; cannot be unlocked by software
    LockTight,
}

/// The partition-information record of a die: where its SLC area ends
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PiRecord {
    /// Number of SLC blocks at the start of the die
    pub slc_blocks: u32,
}

/// Patterns written into pages 0/1 of a block retired as bad
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BadMark {
    Erase,
    Write,

    /// Retired because its lock state could not be restored
    Lock,
}

impl From<BadMark> for u16 {
    fn from(value: BadMark) -> Self {
        match value {
            BadMark::Erase => 0x2222,
            BadMark::Write => 0x4444,
            BadMark::Lock => 0x6666,
        }
    }
}

/// Represents a NAND flash device (the low-level driver underneath the bad-block layer)
///
/// All calls are blocking. A non-blocking driver reports failures of earlier operations as
/// [NandError::PreviousOp], at the latest from [Nand::flush].
pub trait Nand {
    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;

    /// Get the cell type and page count of a block
    fn block_info(&self, pbn: u32) -> Result<BlockInfo, NandError>;

    /// Read one page into `data`, which must be page-sized
    fn read_page(&mut self, pbn: u32, page: u32, data: &mut [u8]) -> Result<ReadStatus, NandError>;

    /// Program one page
    ///
    /// Pages within a block must be programmed in ascending order. Programming an all-1s page
    /// is a no-op and does not count as a write.
    fn write_page(&mut self, pbn: u32, page: u32, data: &[u8]) -> Result<(), NandError>;

    /// Erase a block, making all pages writable again
    fn erase_block(&mut self, pbn: u32) -> Result<(), NandError>;

    /// Wait for any outstanding operation and report its status
    fn flush(&mut self) -> Result<(), NandError> {
        Ok(())
    }

    /// Check the factory bad-block markers of the plane group containing `pbn`
    ///
    /// Returns a mask with bit `n` set if the block in plane `n` is bad; 0 means all good.
    fn check_factory_bad(&mut self, pbn: u32) -> Result<u8, NandError>;

    /// Write the bad-block marker into the spare area of one page
    fn write_bad_mark(&mut self, pbn: u32, page: u32, mark: BadMark) -> Result<(), NandError>;

    /// For MLC blocks, the MSB page sharing cells with the given LSB page
    fn paired_page(&self, _pbn: u32, _page: u32) -> Option<u32> {
        None
    }

    fn lock_state(&mut self, pbn: u32) -> Result<LockState, NandError>;

    /// Apply a lock state to `count` blocks starting at `pbn`
    fn set_lock(&mut self, pbn: u32, count: u32, state: LockState) -> Result<(), NandError>;

    fn read_pi(&mut self, die: u32) -> Result<PiRecord, NandError>;

    /// Write the PI record of a die, optionally locking it against further changes
    fn write_pi(&mut self, die: u32, pi: PiRecord, lock: bool) -> Result<(), NandError>;
}

#[test]
fn test_layout_from_str() {
    let layout: NandLayout = "64x16x512".parse().unwrap();
    assert_eq!(layout.blocks_per_die, 64);
    assert_eq!(layout.pages_per_block, 16);
    assert_eq!(layout.bytes_per_page, 512);
    assert_eq!(layout.planes, 1);

    assert!("64x16".parse::<NandLayout>().is_err());
    assert!("64xfoox512".parse::<NandLayout>().is_err());
}

#[test]
fn test_layout_helpers() {
    let layout: NandLayout = "128x64x2048".parse().unwrap();
    let layout = layout.dies(2).planes(2).cells(CellLayout::Hybrid);

    assert_eq!(layout.blocks_per_device(), 256);
    assert_eq!(layout.die_of(127), 0);
    assert_eq!(layout.die_of(128), 1);
    assert_eq!(layout.die_base(1), 128);
    assert_eq!(layout.pages_for(CellType::Slc), 32);
    assert_eq!(layout.pages_for(CellType::Mlc), 64);
}
