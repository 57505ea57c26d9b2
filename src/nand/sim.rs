//! A simulated in-memory NAND flash, for testing purposes

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

use super::{
    BadMark, BlockInfo, CellLayout, CellType, LockState, Nand, NandLayout, PageUtil, PiRecord,
    ReadStatus,
};
use crate::error::NandError;

/// Byte used to fill the image of a bad block in [SimNand::save]
const BAD_BLOCK_FILL: u8 = 0xBD;

/// A simulated in-memory NAND flash, with injectable faults
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
    pi: Vec<(PiRecord, bool)>,
    faults: Faults,
}

/// Failures the simulation will produce on request
#[derive(Debug, Default, Clone)]
struct Faults {
    /// Programs to `pbn` fail from this page onwards
    write: HashMap<u32, u32>,
    erase: HashSet<u32>,
    read: HashSet<(u32, u32)>,
    disturbed: HashSet<u32>,
    lock_query: HashSet<u32>,
    set_lock: HashSet<u32>,
}

/// A block of SimNand
#[derive(Debug, Clone)]
struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// Bad-block markers written into the spare area, by page
    marks: Vec<(u32, BadMark)>,

    factory_bad: bool,
    lock: LockState,
}

impl SimBlock {
    fn new() -> Self {
        Self {
            data: Default::default(),
            marks: Default::default(),
            factory_bad: false,
            lock: LockState::Unlocked,
        }
    }

    fn is_bad(&self) -> bool {
        self.factory_bad || !self.marks.is_empty()
    }

    fn write_page(
        &mut self,
        index: u32,
        page_count: u32,
        content: &[u8],
    ) -> Result<(), NandError> {
        if index >= page_count {
            return Err(NandError::Unsupported("page index out of bounds"));
        }

        let begin = index as usize * content.len();
        if begin < self.data.len() {
            return Err(NandError::Unsupported("write in already-written area"));
        }

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) {
        let begin = index as usize * content.len();
        let end = begin + content.len();

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }
    }
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    ///
    /// Hybrid dies start out with half of their blocks in SLC mode.
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(); layout.blocks_per_device() as usize];
        let blocks = blocks.into_boxed_slice();

        let slc_blocks = match layout.cells {
            CellLayout::SlcOnly => layout.blocks_per_die,
            CellLayout::MlcOnly => 0,
            CellLayout::Hybrid => layout.blocks_per_die / 2,
        };
        let pi = vec![(PiRecord { slc_blocks }, false); layout.dies as usize];

        Self {
            blocks,
            layout,
            pi,
            faults: Default::default(),
        }
    }

    /// Mark a block as bad from the factory
    pub fn set_factory_bad(&mut self, pbn: u32) {
        if let Some(block) = self.blocks.get_mut(pbn as usize) {
            block.factory_bad = true;
        }
    }

    /// Make every program of `pbn` at or after `page` fail
    pub fn fail_writes(&mut self, pbn: u32, page: u32) {
        self.faults.write.insert(pbn, page);
    }

    pub fn fail_erases(&mut self, pbn: u32) {
        self.faults.erase.insert(pbn);
    }

    pub fn fail_read(&mut self, pbn: u32, page: u32) {
        self.faults.read.insert((pbn, page));
    }

    /// Make reads of `pbn` report disturbance until it is next erased
    pub fn disturb(&mut self, pbn: u32) {
        self.faults.disturbed.insert(pbn);
    }

    pub fn fail_lock_query(&mut self, pbn: u32) {
        self.faults.lock_query.insert(pbn);
    }

    pub fn fail_set_lock(&mut self, pbn: u32) {
        self.faults.set_lock.insert(pbn);
    }

    /// Remove all injected faults (but not bad marks)
    pub fn clear_faults(&mut self) {
        self.faults = Default::default();
    }

    /// The bad-block markers written to a block, by page
    pub fn bad_marks(&self, pbn: u32) -> Vec<(u32, BadMark)> {
        self.blocks
            .get(pbn as usize)
            .map(|x| x.marks.clone())
            .unwrap_or_default()
    }

    /// Read a whole block, for test comparisons
    pub fn block_data(&self, pbn: u32) -> Vec<u8> {
        self.blocks
            .get(pbn as usize)
            .map(|x| x.data.clone())
            .unwrap_or_default()
    }

    fn block_mut(&mut self, pbn: u32) -> Result<&mut SimBlock, NandError> {
        self.blocks
            .get_mut(pbn as usize)
            .ok_or(NandError::OutOfRange(pbn))
    }

    fn check_page(&self, pbn: u32, page: u32, len: usize) -> Result<BlockInfo, NandError> {
        let info = self.block_info(pbn)?;
        if len != self.layout.bytes_per_page {
            return Err(NandError::Unsupported("content not page-sized"));
        }
        if page >= info.pages {
            return Err(NandError::Unsupported("page index out of bounds"));
        }
        Ok(info)
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    ///
    /// Blocks that were saved as bad come back as factory-bad.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let size = self.layout.bytes_per_page * self.layout.pages_per_block as usize;
        let mut buf = vec![0; size];

        for pbn in 0..self.layout.blocks_per_device() {
            read.read_exact(&mut buf)?;

            let pages = self.block_info(pbn)?.pages as usize;
            let page_size = self.layout.bytes_per_page;
            let block = &mut self.blocks[pbn as usize];
            *block = SimBlock::new();
            if buf.iter().all(|&x| x == BAD_BLOCK_FILL) {
                block.factory_bad = true;
                continue;
            }

            for (page, chunk) in buf.chunks(page_size).take(pages).enumerate() {
                block.write_page(page as u32, pages as u32, chunk)?;
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND block out to a writable stream (such as a File)
    pub fn save<W: Write>(&mut self, write: &mut W) -> anyhow::Result<()> {
        let size = self.layout.bytes_per_page * self.layout.pages_per_block as usize;
        let mut buf = vec![0; size];

        for block in self.blocks.iter() {
            if block.is_bad() {
                buf.fill(BAD_BLOCK_FILL);
            } else {
                buf.fill(0xFF);
                let len = std::cmp::min(size, block.data.len());
                buf[..len].copy_from_slice(&block.data[..len]);
            }

            write.write_all(&buf)?;
        }

        Ok(())
    }
}

impl Nand for SimNand {
    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn block_info(&self, pbn: u32) -> Result<BlockInfo, NandError> {
        if pbn >= self.layout.blocks_per_device() {
            return Err(NandError::OutOfRange(pbn));
        }

        let die = self.layout.die_of(pbn);
        let offset = pbn - self.layout.die_base(die);
        let cell = if offset < self.pi[die as usize].0.slc_blocks {
            CellType::Slc
        } else {
            CellType::Mlc
        };

        Ok(BlockInfo {
            cell,
            pages: self.layout.pages_for(cell),
        })
    }

    fn read_page(&mut self, pbn: u32, page: u32, data: &mut [u8]) -> Result<ReadStatus, NandError> {
        self.check_page(pbn, page, data.len())?;

        if self.faults.read.contains(&(pbn, page)) {
            return Err(NandError::UncorrectableRead { pbn, page });
        }

        self.blocks[pbn as usize].read_page(page, data);

        if self.faults.disturbed.contains(&pbn) {
            Ok(ReadStatus::Disturbed)
        } else {
            Ok(ReadStatus::Clean)
        }
    }

    fn write_page(&mut self, pbn: u32, page: u32, data: &[u8]) -> Result<(), NandError> {
        let info = self.check_page(pbn, page, data.len())?;

        if self.faults.write.get(&pbn).is_some_and(|&from| page >= from) {
            return Err(NandError::Write { pbn, page });
        }

        let block = self.block_mut(pbn)?;
        if block.lock != LockState::Unlocked {
            return Err(NandError::Locked { pbn });
        }

        block.write_page(page, info.pages, data)
    }

    fn erase_block(&mut self, pbn: u32) -> Result<(), NandError> {
        let failing = self.faults.erase.contains(&pbn);

        let block = self.block_mut(pbn)?;
        if block.lock != LockState::Unlocked {
            return Err(NandError::Locked { pbn });
        }
        if failing {
            return Err(NandError::Erase { pbn });
        }

        block.data.clear();
        self.faults.disturbed.remove(&pbn);

        Ok(())
    }

    fn check_factory_bad(&mut self, pbn: u32) -> Result<u8, NandError> {
        let planes = self.layout.planes;
        let first = pbn - pbn % planes;

        let mut mask = 0u8;
        for plane in 0..planes {
            let block = self
                .blocks
                .get(first as usize + plane as usize)
                .ok_or(NandError::OutOfRange(first + plane))?;
            if block.is_bad() {
                mask |= 1 << plane;
            }
        }

        Ok(mask)
    }

    fn write_bad_mark(&mut self, pbn: u32, page: u32, mark: BadMark) -> Result<(), NandError> {
        let block = self.block_mut(pbn)?;
        if block.lock != LockState::Unlocked {
            return Err(NandError::Locked { pbn });
        }
        block.marks.push((page, mark));
        Ok(())
    }

    /// MLC pages `n` (LSB) and `n + 2` (MSB) share cells, for the first pages of a block
    fn paired_page(&self, pbn: u32, page: u32) -> Option<u32> {
        let info = self.block_info(pbn).ok()?;
        match info.cell {
            CellType::Mlc if page < 2 && page + 2 < info.pages => Some(page + 2),
            _ => None,
        }
    }

    fn lock_state(&mut self, pbn: u32) -> Result<LockState, NandError> {
        if self.faults.lock_query.contains(&pbn) {
            return Err(NandError::Unsupported("lock state unavailable"));
        }
        Ok(self.block_mut(pbn)?.lock)
    }

    fn set_lock(&mut self, pbn: u32, count: u32, state: LockState) -> Result<(), NandError> {
        for pbn in pbn..pbn + count {
            if self.faults.set_lock.contains(&pbn) {
                return Err(NandError::Unsupported("lock command rejected"));
            }

            let block = self.block_mut(pbn)?;
            if block.lock == LockState::LockTight && state != LockState::LockTight {
                return Err(NandError::Locked { pbn });
            }
            block.lock = state;
        }
        Ok(())
    }

    fn read_pi(&mut self, die: u32) -> Result<PiRecord, NandError> {
        self.pi
            .get(die as usize)
            .map(|&(pi, _)| pi)
            .ok_or(NandError::OutOfRange(die))
    }

    fn write_pi(&mut self, die: u32, pi: PiRecord, lock: bool) -> Result<(), NandError> {
        let blocks_per_die = self.layout.blocks_per_die;
        let entry = self
            .pi
            .get_mut(die as usize)
            .ok_or(NandError::OutOfRange(die))?;

        if entry.1 && entry.0 != pi {
            return Err(NandError::Locked { pbn: die * blocks_per_die });
        }
        if pi.slc_blocks > blocks_per_die {
            return Err(NandError::Unsupported("PI boundary beyond end of die"));
        }

        *entry = (pi, lock);
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    dies: 1,
    planes: 2,
    blocks_per_die: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    cells: CellLayout::SlcOnly,
};

#[test]
fn test_sim_block_range() {
    let nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block_info(0).is_ok());
    assert!(nand.block_info(TEST_LAYOUT.blocks_per_die - 1).is_ok());
    assert!(nand.block_info(TEST_LAYOUT.blocks_per_die).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert_eq!(nand.check_factory_bad(2).unwrap(), 0);

    nand.write_bad_mark(3, 0, BadMark::Write).unwrap();
    assert_eq!(nand.check_factory_bad(2).unwrap(), 0b10);
    assert_eq!(nand.check_factory_bad(3).unwrap(), 0b10);

    nand.set_factory_bad(2);
    assert_eq!(nand.check_factory_bad(2).unwrap(), 0b11);
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page];
    let mut data_out = data_in.clone();

    nand.write_page(0, 2, &data_in).unwrap();
    assert!(nand.write_page(0, 1, &data_in).is_err());

    nand.read_page(0, 1, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    nand.read_page(0, 2, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    nand.read_page(0, 3, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_faults() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let page = vec![0x11u8; TEST_LAYOUT.bytes_per_page];
    let mut buf = page.clone();

    nand.fail_writes(1, 3);
    nand.write_page(1, 2, &page).unwrap();
    assert!(nand.write_page(1, 3, &page).unwrap_err().is_write_error());

    nand.fail_erases(1);
    assert!(nand.erase_block(1).unwrap_err().is_erase_error());

    nand.fail_read(1, 2);
    assert!(matches!(
        nand.read_page(1, 2, &mut buf),
        Err(NandError::UncorrectableRead { pbn: 1, page: 2 })
    ));

    nand.disturb(4);
    assert_eq!(nand.read_page(4, 0, &mut buf).unwrap(), ReadStatus::Disturbed);
    nand.erase_block(4).unwrap();
    assert_eq!(nand.read_page(4, 0, &mut buf).unwrap(), ReadStatus::Clean);
}

#[test]
fn test_sim_locks() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let page = vec![0x22u8; TEST_LAYOUT.bytes_per_page];

    nand.set_lock(4, 2, LockState::Locked).unwrap();
    assert_eq!(nand.lock_state(5).unwrap(), LockState::Locked);
    assert!(matches!(
        nand.write_page(4, 0, &page),
        Err(NandError::Locked { pbn: 4 })
    ));

    nand.set_lock(4, 1, LockState::Unlocked).unwrap();
    nand.write_page(4, 0, &page).unwrap();

    nand.set_lock(6, 1, LockState::LockTight).unwrap();
    assert!(nand.set_lock(6, 1, LockState::Unlocked).is_err());
}

#[test]
fn test_sim_hybrid_pi() {
    let layout = TEST_LAYOUT.cells(CellLayout::Hybrid);
    let mut nand = SimNand::new(layout);

    assert_eq!(nand.read_pi(0).unwrap().slc_blocks, 4);
    assert_eq!(nand.block_info(3).unwrap().cell, CellType::Slc);
    assert_eq!(nand.block_info(3).unwrap().pages, 8);
    assert_eq!(nand.block_info(4).unwrap().cell, CellType::Mlc);
    assert_eq!(nand.paired_page(4, 1), Some(3));
    assert_eq!(nand.paired_page(3, 1), None);

    nand.write_pi(0, PiRecord { slc_blocks: 6 }, true).unwrap();
    assert_eq!(nand.block_info(5).unwrap().cell, CellType::Slc);
    assert!(nand.write_pi(0, PiRecord { slc_blocks: 2 }, false).is_err());
}

#[test]
fn test_sim_save_load() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.write_page(0, 0, &vec![0x55u8; TEST_LAYOUT.bytes_per_page])?;
    nand.set_factory_bad(5);

    let mut image = Vec::new();
    nand.save(&mut image)?;

    let mut copy = SimNand::new(TEST_LAYOUT);
    copy.load(&mut &image[..])?;

    assert_eq!(copy.block_data(0), nand.block_data(0));
    assert_eq!(copy.check_factory_bad(4)?, 0b10);

    Ok(())
}
