//! A whole device under bad-block management: the entry points used by the layer above.
//!
//! User blocks are addressed by semi-physical block number (sbn); a [Volume] resolves them
//! through the indirection table of their die on every access.

use tracing::{debug, info, warn};

use crate::config::BmlConfig;
use crate::die::Die;
use crate::error::{BmlError, NandError, OpKind, Result};
use crate::nand::{BadMark, CellLayout, CellType, Nand, NandLayout, PageUtil, ReadStatus};
use crate::partition::{PartitionAttr, PartitionTable};
use crate::pcb::layout::{Geometry, PcbRole, PrevOpHeader, UnitShape, UpdateKind};
use crate::pcb::log::{MetaSlot, PcbState};
use crate::pcb::scan::mount;
use crate::refresh::{Disturbance, RefreshReport, RefreshScope};
use crate::reservoir::alloc::Purpose;
use crate::reservoir::bmi::Bmf;
use crate::reservoir::Reservoir;

/// Data backed up into REF on behalf of the layer above
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PreviousOp {
    pub sbn: u32,
    pub page: u32,
    pub data: Vec<u8>,
}

/// Occupancy of a die's reservoir, for diagnostics
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReservoirStats {
    pub first: u32,
    pub last: u32,
    pub boundary: u32,
    pub free_slc: u32,
    pub free_mlc: u32,
    pub entries: usize,
    pub candidates: usize,
    pub tracked: usize,
}

#[derive(Debug)]
pub struct Volume<N: Nand> {
    nand: N,
    layout: NandLayout,
    config: BmlConfig,
    dies: Vec<Die>,
}

impl<N: Nand> Volume<N> {
    /// Lay out a reservoir on every die of `nand`, and write its first metadata
    ///
    /// Everything in the reservoirs is erased; user blocks are left as they are, except that
    /// factory-bad ones get replacements.
    pub fn format(mut nand: N, config: BmlConfig, partitions: PartitionTable) -> Result<Self> {
        let layout = nand.get_layout();
        let dies = (0..layout.dies)
            .map(|die| format_die(&mut nand, &layout, &config, &partitions, die))
            .collect::<Result<Vec<_>>>()?;

        let mut volume = Self {
            nand,
            layout,
            config,
            dies,
        };
        volume.apply_locks(&partitions)?;

        info!(dies = layout.dies, "volume formatted");
        Ok(volume)
    }

    /// Mount every die of a formatted device, and finish any refresh cut short by power loss
    pub fn open(mut nand: N, config: BmlConfig) -> Result<Self> {
        let layout = nand.get_layout();
        let mut dies = Vec::with_capacity(layout.dies as usize);
        for die in 0..layout.dies {
            let mut die = mount(&mut nand, &config, die)?;
            die.resume_interrupted(&mut nand)?;
            dies.push(die);
        }

        Ok(Self {
            nand,
            layout,
            config,
            dies,
        })
    }

    pub fn into_nand(self) -> N {
        self.nand
    }

    pub fn nand(&self) -> &N {
        &self.nand
    }

    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.nand
    }

    pub fn layout(&self) -> NandLayout {
        self.layout
    }

    pub fn config(&self) -> &BmlConfig {
        &self.config
    }

    pub fn die(&self, index: u32) -> Result<&Die> {
        self.dies.get(index as usize).ok_or_else(|| no_such_die(index))
    }

    pub fn die_mut(&mut self, index: u32) -> Result<&mut Die> {
        self.dies.get_mut(index as usize).ok_or_else(|| no_such_die(index))
    }

    /// Borrow a die together with the device, for calling [Die] operations directly
    pub fn split_die(&mut self, index: u32) -> Result<(&mut Die, &mut N)> {
        let die = self.dies.get_mut(index as usize).ok_or_else(|| no_such_die(index))?;
        Ok((die, &mut self.nand))
    }

    /// The die owning user block `sbn`
    fn user_die(&mut self, sbn: u32) -> Result<(&mut Die, &mut N)> {
        if sbn >= self.layout.blocks_per_device() {
            return Err(BmlError::InvalidArgument(format!("block {sbn} out of range")));
        }

        let die = &mut self.dies[self.layout.die_of(sbn) as usize];
        if die.rsv.contains(sbn) {
            return Err(BmlError::InvalidArgument(format!(
                "block {sbn} belongs to the reservoir of die {}",
                die.index
            )));
        }
        Ok((die, &mut self.nand))
    }

    /// Replace the partition table, keeping every locked partition as it is
    pub fn repartition(&mut self, partitions: PartitionTable) -> Result<()> {
        for die in &self.dies {
            die.partitions.check_compatible(&partitions)?;
            check_partitions(&die.rsv, &partitions)?;
        }

        for die in &mut self.dies {
            die.partitions = partitions.clone();
            die.update_log(&mut self.nand, PcbRole::Unlockable, UpdateKind::Repartition)?;
            die.update_log(&mut self.nand, PcbRole::Lockable, UpdateKind::Repartition)?;
        }

        info!(partitions = partitions.iter().count(), "repartitioned");
        Ok(())
    }

    pub fn handle_bad_block(
        &mut self,
        sbn: u32,
        failed_page: u32,
        group_len: u32,
        cause: OpKind,
    ) -> Result<()> {
        let (die, nand) = self.user_die(sbn)?;
        die.handle_bad_block(nand, sbn, failed_page, group_len, cause)
    }

    pub fn note_disturbance(&mut self, sbn: u32, reason: Disturbance) -> Result<()> {
        let (die, nand) = self.user_die(sbn)?;
        die.note_disturbance(nand, sbn, reason)
    }

    /// Run a refresh batch on every die
    ///
    /// Unreadable blocks of all dies are reported together, after every die had its turn. A
    /// die that fails does not keep the others from running, unless the failure is fatal; the
    /// first failure is returned.
    pub fn refresh_batch(
        &mut self,
        scope: RefreshScope,
        notify_read_error: bool,
    ) -> Result<RefreshReport> {
        let mut total = RefreshReport::default();
        let mut unreadable = Vec::new();
        let mut failure = None;

        for die in &mut self.dies {
            let report = match die.refresh_batch(&mut self.nand, scope, notify_read_error) {
                Ok(report) => report,
                Err(BmlError::RefreshReadError { blocks, report }) => {
                    unreadable.extend(blocks);
                    report
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(die = die.index, "refresh failed: {e}");
                    if failure.is_none() {
                        failure = Some(e);
                    }
                    continue;
                }
            };
            total.refreshed += report.refreshed;
            total.dropped += report.dropped;
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if !unreadable.is_empty() {
            return Err(BmlError::RefreshReadError {
                blocks: unreadable,
                report: total,
            });
        }
        Ok(total)
    }

    /// Returns whether any die had a refresh to finish
    pub fn resume_interrupted(&mut self) -> Result<bool> {
        let mut resumed = false;
        for die in &mut self.dies {
            resumed |= die.resume_interrupted(&mut self.nand)?;
        }
        Ok(resumed)
    }

    /// Save data the layer above is about to write into `sbn`, so that it survives power loss
    ///
    /// The backup lives in the REF block of the die, and is gone after the next refresh.
    pub fn backup_previous_op(&mut self, sbn: u32, page: u32, data: &[u8]) -> Result<()> {
        let page_size = self.layout.bytes_per_page;
        let (die, nand) = self.user_die(sbn)?;

        let header = PrevOpHeader::new(sbn, page, data);
        let mut header_page = vec![0xFFu8; page_size];
        header.encode(&mut header_page)?;

        loop {
            die.erase_ref(nand)?;
            let ref_block = die.rsv.meta.ref_block;
            let pages = die.block_pages(nand, ref_block)?;
            if data.len().div_ceil(page_size) + 1 > pages as usize {
                return Err(BmlError::InvalidArgument(format!(
                    "{} bytes do not fit the REF block",
                    data.len()
                )));
            }

            match write_backup(nand, ref_block, &header_page, data) {
                Ok(()) => {
                    debug!(die = die.index, sbn, page, len = data.len(), "previous op backed up");
                    return Ok(());
                }
                Err(e) if e.is_block_failure() => {
                    warn!(die = die.index, pbn = ref_block, "REF block failed: {e}");
                    die.replace_meta_block(nand, MetaSlot::Ref, BadMark::Write)?;
                    die.update_log(nand, PcbRole::Unlockable, UpdateKind::MetaBlock)?;
                }
                Err(e) => return Err(die.report(e.into())),
            }
        }
    }

    /// Read back the data saved by [Self::backup_previous_op] on `die`, if it is intact
    pub fn restore_previous_op(&mut self, die: u32) -> Result<Option<PreviousOp>> {
        let page_size = self.layout.bytes_per_page;
        let ref_block = self.die(die)?.rsv.meta.ref_block;

        let mut buf = vec![0u8; page_size];
        if self.nand.read_page(ref_block, 0, &mut buf).is_err() || buf.is_erased() {
            return Ok(None);
        }
        let Some(header) = PrevOpHeader::decode(&buf) else {
            return Ok(None);
        };

        let len = header.len as usize;
        let mut data = vec![0u8; len.div_ceil(page_size) * page_size];
        for (n, chunk) in data.chunks_mut(page_size).enumerate() {
            if self.nand.read_page(ref_block, 1 + n as u32, chunk).is_err() {
                return Ok(None);
            }
        }
        data.truncate(len);

        if !header.check_data(&data) {
            warn!(die, "previous-op backup does not match its checksum");
            return Ok(None);
        }

        Ok(Some(PreviousOp {
            sbn: header.sbn,
            page: header.page,
            data,
        }))
    }

    pub fn discard_previous_op(&mut self, die: u32) -> Result<()> {
        let (die, nand) = self.split_die(die)?;
        die.erase_ref(nand)
    }

    /// Moved blocks of `die`, as (original, replacement) pairs
    pub fn bad_block_map(&self, die: u32) -> Result<&[Bmf]> {
        Ok(self.die(die)?.bad_units())
    }

    pub fn reservoir_stats(&self, die: u32) -> Result<ReservoirStats> {
        let rsv = &self.die(die)?.rsv;
        let free = |cell| match (rsv.kind, cell) {
            (CellLayout::Hybrid, _) => rsv.free_blocks(cell),
            (CellLayout::SlcOnly, CellType::Slc) | (CellLayout::MlcOnly, CellType::Mlc) => {
                rsv.free_blocks(cell)
            }
            _ => 0,
        };

        Ok(ReservoirStats {
            first: rsv.first,
            last: rsv.last,
            boundary: rsv.boundary,
            free_slc: free(CellType::Slc),
            free_mlc: free(CellType::Mlc),
            entries: rsv.bmi.len(),
            candidates: rsv.bmi.candidates().count(),
            tracked: rsv.erl.len(),
        })
    }

    /// The physical block currently holding user block `sbn`
    pub fn resolve(&mut self, sbn: u32) -> Result<u32> {
        let (die, _) = self.user_die(sbn)?;
        Ok(die.rsv.resolve(sbn))
    }

    /// Read a page of user block `sbn`
    ///
    /// A disturbed read still succeeds; the block is queued for refresh instead.
    pub fn read_page(&mut self, sbn: u32, page: u32, data: &mut [u8]) -> Result<()> {
        let (die, nand) = self.user_die(sbn)?;
        let pbn = die.rsv.resolve(sbn);

        match nand.read_page(pbn, page, data)? {
            ReadStatus::Clean => Ok(()),
            ReadStatus::Disturbed => {
                debug!(die = die.index, sbn, pbn, page, "read disturbance");
                die.note_disturbance(nand, sbn, Disturbance::Update)
            }
        }
    }

    /// Program a page of user block `sbn`, moving the block if the program fails
    pub fn write_page(&mut self, sbn: u32, page: u32, data: &[u8]) -> Result<()> {
        let (die, nand) = self.user_die(sbn)?;

        loop {
            let pbn = die.rsv.resolve(sbn);
            match nand.write_page(pbn, page, data).and_then(|_| nand.flush()) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_write_error() => {
                    warn!(die = die.index, sbn, pbn, page, "program failed: {e}");
                    die.handle_bad_block(nand, sbn, page, 1, OpKind::Write)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Erase user block `sbn`, moving the block if the erase fails
    pub fn erase_block(&mut self, sbn: u32) -> Result<()> {
        let (die, nand) = self.user_die(sbn)?;

        loop {
            let pbn = die.rsv.resolve(sbn);
            match nand.erase_block(pbn).and_then(|_| nand.flush()) {
                Ok(()) => break,
                Err(e) if e.is_erase_error() => {
                    warn!(die = die.index, sbn, pbn, "erase failed: {e}");
                    die.handle_bad_block(nand, sbn, 0, 1, OpKind::Erase)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Erasing cures whatever disturbance the block had
        if die.rsv.erl.contains(sbn) {
            die.note_disturbance(nand, sbn, Disturbance::Delete)?;
        }
        Ok(())
    }

    /// Put the hardware locks of the partition table in place
    fn apply_locks(&mut self, partitions: &PartitionTable) -> Result<()> {
        if self.config.preprogrammed {
            return Ok(());
        }

        for part in partitions.iter().filter(|x| x.attr != PartitionAttr::ReadWrite) {
            for sbn in part.first..part.first + part.blocks {
                let die = &self.dies[self.layout.die_of(sbn) as usize];
                let pbn = die.rsv.resolve(sbn);
                die.set_lock(&mut self.nand, pbn, part.attr.into())
                    .map_err(|e| die.report(e))?;
            }
            debug!(id = part.id, attr = ?part.attr, "partition locked");
        }

        Ok(())
    }
}

fn no_such_die(index: u32) -> BmlError {
    BmlError::InvalidArgument(format!("no die {index}"))
}

/// Header page first, then the data padded to whole pages
fn write_backup<N: Nand>(
    nand: &mut N,
    ref_block: u32,
    header_page: &[u8],
    data: &[u8],
) -> Result<(), NandError> {
    let page_size = header_page.len();
    nand.write_page(ref_block, 0, header_page)?;

    for (n, chunk) in data.chunks(page_size).enumerate() {
        let mut buf = vec![0xFFu8; page_size];
        buf[..chunk.len()].copy_from_slice(chunk);
        nand.write_page(ref_block, 1 + n as u32, &buf)?;
    }

    nand.flush()
}

/// Partitions must stay clear of the reservoir
fn check_partitions(rsv: &Reservoir, partitions: &PartitionTable) -> Result<()> {
    for part in partitions.iter() {
        let end = part.first + part.blocks;
        if part.first <= rsv.last && end > rsv.first {
            return Err(BmlError::InvalidArgument(format!(
                "partition {} overlaps the reservoir of die {}",
                part.id, rsv.die
            )));
        }
    }
    Ok(())
}

fn format_die<N: Nand>(
    nand: &mut N,
    layout: &NandLayout,
    config: &BmlConfig,
    partitions: &PartitionTable,
    die: u32,
) -> Result<Die> {
    let pi = nand.read_pi(die)?;
    let mut rsv = Reservoir::new(layout, config, die, pi)?;
    check_partitions(&rsv, partitions)?;
    let planes = rsv.planes;

    let rpt = howudoin::new()
        .label(format!("Scanning die {die} for bad blocks"))
        .set_len(u64::from(layout.blocks_per_die / planes));
    let mut factory_bad = Vec::new();
    for base in (rsv.die_first..rsv.die_end).step_by(planes as usize) {
        let mask = nand.check_factory_bad(base)?;
        factory_bad.extend((0..planes).filter(|x| mask & (1 << x) != 0).map(|x| base + x));
        rpt.inc();
    }
    rpt.close();
    debug!(die, blocks = ?factory_bad, "factory-bad blocks");

    if rsv.kind == CellLayout::Hybrid {
        let has_good = |rsv: &Reservoir, cell| {
            rsv.sub_range(cell).any(|x| !factory_bad.contains(&x))
        };
        let delta = if !has_good(&rsv, CellType::Slc) {
            i64::from(planes)
        } else if !has_good(&rsv, CellType::Mlc) {
            -i64::from(planes)
        } else {
            0
        };

        if delta != 0 {
            while !(has_good(&rsv, CellType::Slc) && has_good(&rsv, CellType::Mlc)) {
                rsv.shift_boundary(delta)?;
            }
            info!(die, boundary = rsv.boundary, "moved SLC/MLC boundary");
        }

        if rsv.pi_record() != pi || config.lock_pi {
            nand.write_pi(die, rsv.pi_record(), config.lock_pi)?;
        }
    }

    for pbn in rsv.first..=rsv.last {
        if factory_bad.contains(&pbn) {
            rsv.bitmap.mark_allocated(pbn);
            continue;
        }
        if let Err(e) = nand.erase_block(pbn).and_then(|_| nand.flush()) {
            if !e.is_block_failure() {
                return Err(e.into());
            }
            warn!(die, pbn, "reservoir block failed to erase: {e}");
            rsv.bitmap.mark_allocated(pbn);
        }
    }

    for slot in [MetaSlot::Upcb, MetaSlot::Lpcb, MetaSlot::Tpcb, MetaSlot::Ref] {
        let cell = match slot {
            MetaSlot::Ref => rsv.ref_cell(),
            _ => rsv.pcb_cell(),
        };
        let allocation = rsv
            .find_free(1, cell, Purpose::Metadata)
            .ok_or(BmlError::PoolExhausted { die })?;
        rsv.meta.set(slot, allocation.blocks[0]);
    }

    let outside: Vec<u32> = factory_bad.iter().copied().filter(|&x| !rsv.contains(x)).collect();
    for sbn in outside {
        if rsv.kind == CellLayout::Hybrid && sbn == rsv.die_first {
            return Err(BmlError::Critical(format!(
                "first block of hybrid die {die} is bad"
            )));
        }
        let allocation = rsv
            .find_free(1, rsv.cell_type_of(sbn), Purpose::FactoryBad)
            .ok_or(BmlError::PoolExhausted { die })?;
        rsv.register(sbn, allocation.blocks[0], None)?;
    }

    let capacity = rsv.bmi.capacity();
    let shape = UnitShape::new(layout.bytes_per_page, capacity, rsv.bmi.candidate_capacity())?;
    let pcb = PcbState::formatted(shape, Geometry::from(layout));

    let mut die = Die::new(*layout, config.clone(), rsv, pcb, partitions.clone());
    die.update_log(nand, PcbRole::Unlockable, UpdateKind::Format)?;
    die.update_log(nand, PcbRole::Lockable, UpdateKind::Format)?;

    info!(
        die = die.index,
        first = die.rsv.first,
        last = die.rsv.last,
        factory_bad = factory_bad.len(),
        "die formatted"
    );
    Ok(die)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::die::test::HYBRID_LAYOUT;
    use crate::nand::{LockState, PiRecord, SimNand};
    use crate::partition::Partition;

    fn hybrid_nand() -> SimNand {
        let mut nand = SimNand::new(HYBRID_LAYOUT);
        nand.write_pi(0, PiRecord { slc_blocks: 100 }, false).unwrap();
        nand
    }

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; 512]
    }

    #[test]
    fn test_format_and_open() -> Result<()> {
        let mut nand = hybrid_nand();
        nand.set_factory_bad(50);
        nand.set_factory_bad(103);

        let volume = Volume::format(nand, BmlConfig::default(), Default::default())?;
        assert_eq!(volume.bad_block_map(0)?, [Bmf { original: 50, replacement: 95 }]);

        let stats = volume.reservoir_stats(0)?;
        assert_eq!((stats.first, stats.last, stats.boundary), (92, 115, 100));
        assert_eq!(stats.free_slc, 4);
        assert_eq!(stats.free_mlc, 14);

        let volume = Volume::open(volume.into_nand(), BmlConfig::default())?;
        assert_eq!(volume.bad_block_map(0)?, [Bmf { original: 50, replacement: 95 }]);
        assert_eq!(volume.reservoir_stats(0)?, stats);
        Ok(())
    }

    #[test]
    fn test_format_moves_boundary() -> Result<()> {
        let mut nand = hybrid_nand();
        for pbn in 100..116 {
            nand.set_factory_bad(pbn);
        }

        let mut volume = Volume::format(nand, BmlConfig::default(), Default::default())?;
        assert_eq!(volume.die(0)?.rsv.boundary, 98);
        assert_eq!(volume.nand_mut().read_pi(0)?, PiRecord { slc_blocks: 98 });
        assert_eq!(volume.die(0)?.rsv.meta.ref_block, 99);

        let volume = Volume::open(volume.into_nand(), BmlConfig::default())?;
        assert_eq!((volume.die(0)?.rsv.first, volume.die(0)?.rsv.boundary), (92, 98));
        Ok(())
    }

    #[test]
    fn test_format_locks_partitions() -> Result<()> {
        let partitions = PartitionTable::new(vec![
            Partition::new(0, 0, 4).attr(PartitionAttr::LockTight),
            Partition::new(1, 4, 4).attr(PartitionAttr::Locked),
        ])?;
        let mut volume = Volume::format(hybrid_nand(), BmlConfig::default(), partitions)?;

        assert_eq!(volume.nand_mut().lock_state(2)?, LockState::LockTight);
        assert_eq!(volume.nand_mut().lock_state(6)?, LockState::Locked);
        assert_eq!(volume.nand_mut().lock_state(8)?, LockState::Unlocked);
        Ok(())
    }

    #[test]
    fn test_partition_in_reservoir_rejected() {
        let partitions = PartitionTable::new(vec![Partition::new(0, 80, 20)]).unwrap();
        let result = Volume::format(hybrid_nand(), BmlConfig::default(), partitions);
        assert!(matches!(result, Err(BmlError::InvalidArgument(_))));
    }

    #[test]
    fn test_repartition() -> Result<()> {
        let config = BmlConfig::default().preprogrammed(true);
        let partitions = PartitionTable::new(vec![
            Partition::new(0, 0, 8).attr(PartitionAttr::Locked),
            Partition::new(1, 8, 40),
        ])?;
        let mut volume = Volume::format(hybrid_nand(), config.clone(), partitions)?;

        let moved_lock = PartitionTable::new(vec![
            Partition::new(0, 0, 10).attr(PartitionAttr::Locked),
            Partition::new(1, 10, 40),
        ])?;
        assert!(matches!(
            volume.repartition(moved_lock),
            Err(BmlError::PartitionMismatch { id: 0 })
        ));

        let grown = PartitionTable::new(vec![
            Partition::new(0, 0, 8).attr(PartitionAttr::Locked),
            Partition::new(1, 8, 60),
        ])?;
        volume.repartition(grown.clone())?;

        let volume = Volume::open(volume.into_nand(), config)?;
        assert_eq!(volume.die(0)?.partitions, grown);
        Ok(())
    }

    #[test]
    fn test_write_failure_moves_block() -> Result<()> {
        let mut volume = Volume::format(hybrid_nand(), BmlConfig::default(), Default::default())?;
        for n in 0..10 {
            volume.write_page(42, n, &page(n as u8))?;
        }
        volume.write_page(43, 0, &page(0xA0))?;
        volume.nand_mut().fail_writes(42, 10);

        volume.write_page(42, 10, &page(10))?;

        assert_eq!(volume.resolve(42)?, 96);
        assert_eq!(volume.resolve(43)?, 97);
        let mut buf = page(0);
        for n in 0..11 {
            volume.read_page(42, n, &mut buf)?;
            assert_eq!(buf, page(n as u8));
        }
        volume.read_page(43, 0, &mut buf)?;
        assert_eq!(buf, page(0xA0));
        Ok(())
    }

    #[test]
    fn test_erase_failure_moves_block() -> Result<()> {
        let mut volume = Volume::format(hybrid_nand(), BmlConfig::default(), Default::default())?;
        volume.write_page(200, 0, &page(1))?;
        volume.nand_mut().fail_erases(200);

        volume.erase_block(200)?;

        // MLC spares are handed out from the top, a plane group at a time; 115 is REF
        assert_eq!(volume.resolve(200)?, 112);
        assert_eq!(volume.resolve(201)?, 113);
        let mut buf = page(0);
        volume.read_page(200, 0, &mut buf)?;
        assert!(buf.is_erased());
        Ok(())
    }

    #[test]
    fn test_disturbed_read_is_tracked() -> Result<()> {
        let mut volume = Volume::format(hybrid_nand(), BmlConfig::default(), Default::default())?;
        volume.write_page(30, 0, &page(3))?;
        volume.nand_mut().disturb(30);

        let mut buf = page(0);
        volume.read_page(30, 0, &mut buf)?;
        assert!(volume.die(0)?.rsv.erl.contains(30));

        volume.erase_block(30)?;
        assert!(volume.die(0)?.rsv.erl.is_empty());
        Ok(())
    }

    #[test]
    fn test_reservoir_blocks_rejected() {
        let mut volume =
            Volume::format(hybrid_nand(), BmlConfig::default(), Default::default()).unwrap();
        assert!(volume.write_page(100, 0, &page(1)).is_err());
        assert!(volume.resolve(256).is_err());
    }

    #[test]
    fn test_unknown_die_rejected() {
        let mut volume =
            Volume::format(hybrid_nand(), BmlConfig::default(), Default::default()).unwrap();
        assert!(matches!(volume.reservoir_stats(3), Err(BmlError::InvalidArgument(_))));
        assert!(volume.bad_block_map(1).is_err());
        assert!(volume.restore_previous_op(1).is_err());
        assert!(volume.discard_previous_op(1).is_err());
        assert!(volume.split_die(1).is_err());
        assert!(volume.die(0).is_ok());
    }

    #[test]
    fn test_previous_op_backup() -> Result<()> {
        let mut volume = Volume::format(hybrid_nand(), BmlConfig::default(), Default::default())?;
        assert_eq!(volume.restore_previous_op(0)?, None);

        let data: Vec<u8> = (0..1000u32).map(|x| x as u8).collect();
        volume.backup_previous_op(42, 3, &data)?;

        let mut volume = Volume::open(volume.into_nand(), BmlConfig::default())?;
        let expected = PreviousOp { sbn: 42, page: 3, data };
        assert_eq!(volume.restore_previous_op(0)?, Some(expected));

        volume.discard_previous_op(0)?;
        assert_eq!(volume.restore_previous_op(0)?, None);
        Ok(())
    }

    #[test]
    fn test_multi_die() -> Result<()> {
        let layout: NandLayout = "64x16x512".parse().unwrap();
        let layout = layout.dies(2);
        let config = BmlConfig::default().reservoir_blocks(8);

        let mut volume = Volume::format(SimNand::new(layout), config.clone(), Default::default())?;
        assert_eq!(volume.die(1)?.rsv.first, 120);

        volume.nand_mut().fail_writes(70, 0);
        volume.write_page(70, 0, &page(7))?;
        assert_eq!(volume.resolve(70)?, 123);
        assert!(volume.bad_block_map(0)?.is_empty());

        let mut volume = Volume::open(volume.into_nand(), config)?;
        assert_eq!(volume.resolve(70)?, 123);
        Ok(())
    }

    fn two_dies() -> Result<Volume<SimNand>> {
        let layout: NandLayout = "64x16x512".parse().unwrap();
        let config = BmlConfig::default().reservoir_blocks(8);
        let mut volume = Volume::format(SimNand::new(layout.dies(2)), config, Default::default())?;
        for sbn in [10, 70] {
            volume.write_page(sbn, 0, &page(3))?;
            volume.note_disturbance(sbn, Disturbance::Update)?;
        }
        Ok(volume)
    }

    #[test]
    fn test_multi_die_read_error_keeps_counts() -> Result<()> {
        let mut volume = two_dies()?;
        volume.nand_mut().fail_read(10, 0);

        let err = volume.refresh_batch(RefreshScope::All, true).unwrap_err();
        let BmlError::RefreshReadError { blocks, report } = err else {
            panic!("unexpected error");
        };
        assert_eq!(blocks, [10]);
        assert_eq!(report, RefreshReport { refreshed: 1, dropped: 1 });
        assert!(volume.die(1)?.rsv.erl.is_empty());
        Ok(())
    }

    #[test]
    fn test_multi_die_refresh_runs_past_failed_die() -> Result<()> {
        let mut volume = two_dies()?;
        volume.nand_mut().set_lock(10, 1, LockState::Locked)?;
        volume.nand_mut().fail_set_lock(10);

        let err = volume.refresh_batch(RefreshScope::All, true).unwrap_err();
        assert!(matches!(err, BmlError::LockFailed { pbn: 10, .. }));
        assert!(volume.die(0)?.rsv.erl.contains(10));
        assert!(volume.die(1)?.rsv.erl.is_empty());
        assert_eq!(volume.nand().block_data(70), page(3));
        Ok(())
    }
}
