//! Mounting a die: finding the newest committed meta-page unit and rebuilding the die's state
//! from it.

use tracing::{debug, info, warn};

use super::layout::{Geometry, MetaSnapshot, PcbHeader, PcbRole};
use super::log::{MetaSlot, PcbState, RoleState};
use crate::config::BmlConfig;
use crate::die::Die;
use crate::error::{BmlError, Result};
use crate::nand::{CellLayout, Nand, NandLayout, PageUtil};
use crate::reservoir::bitmap::AllocBitmap;
use crate::reservoir::bmi::IndirectionTable;
use crate::reservoir::{bmi_capacity, Reservoir};

/// What the scan found in one block holding meta-page units
#[derive(Debug)]
struct BlockLog {
    pbn: u32,

    /// First page after the last unit
    next_page: u32,

    /// The last unit of the block is committed, and nothing follows it but erased pages
    clean: bool,

    role: Option<PcbRole>,
    pcb_age: u32,
    global_age: u32,

    /// The last committed unit
    newest: Option<MetaSnapshot>,
}

/// Walk the units of `pbn`, or return `None` if it does not start with one
fn scan_block<N: Nand>(nand: &mut N, layout: &NandLayout, pbn: u32) -> Result<Option<BlockLog>> {
    let pages = nand.block_info(pbn)?.pages;
    let page_size = layout.bytes_per_page;
    let mut buf = vec![0u8; page_size];

    if nand.read_page(pbn, 0, &mut buf).is_err() || PcbHeader::decode(&buf).is_none() {
        return Ok(None);
    }

    let mut log = BlockLog {
        pbn,
        next_page: 0,
        clean: true,
        role: None,
        pcb_age: 0,
        global_age: 0,
        newest: None,
    };

    let mut page = 0;
    while page < pages {
        let header = match nand.read_page(pbn, page, &mut buf) {
            Ok(_) if buf.is_erased() => break,
            Ok(_) => PcbHeader::decode(&buf),
            Err(_) => None,
        };

        // Anything but a unit or erased flash means the block can take no more units
        let Some(header) = header.filter(|x| page + x.shape.unit_pages() <= pages) else {
            log.clean = false;
            page = pages;
            break;
        };

        let mut data = vec![0xFFu8; header.shape.data_pages as usize * page_size];
        let mut readable = true;
        for (n, chunk) in data.chunks_mut(page_size).enumerate() {
            readable &= nand.read_page(pbn, page + n as u32, chunk).is_ok();
        }
        let confirm = page + header.shape.data_pages;
        let confirmed = nand.read_page(pbn, confirm, &mut buf).is_ok() && buf.is_zeroed();

        log.role = Some(header.role);
        log.pcb_age = log.pcb_age.max(header.pcb_age);
        log.global_age = log.global_age.max(header.global_age);

        let snapshot = (readable && confirmed)
            .then(|| MetaSnapshot::decode(header, &data))
            .flatten();
        log.clean = snapshot.is_some();
        if snapshot.is_some() {
            log.newest = snapshot;
        } else {
            debug!(pbn, page, "uncommitted metadata unit");
        }

        page += header.shape.unit_pages();
    }

    log.next_page = page;
    Ok(Some(log))
}

impl Reservoir {
    /// Replace the whole state of the reservoir with a snapshot
    pub(crate) fn restore(&mut self, snapshot: &MetaSnapshot) -> Result<()> {
        let header = &snapshot.header;
        let in_die = |x: u32| self.contains_die_block(x);
        let boundary_ok = self.kind != CellLayout::Hybrid
            || (header.rsv_first..=header.rsv_last).contains(&header.boundary);
        if header.rsv_first > header.rsv_last
            || !in_die(header.rsv_first)
            || !in_die(header.rsv_last)
            || !boundary_ok
        {
            return Err(BmlError::Incompatible(format!(
                "reservoir {}..={} does not fit die {}",
                header.rsv_first, header.rsv_last, self.die
            )));
        }

        self.first = header.rsv_first;
        self.last = header.rsv_last;
        self.boundary = header.boundary;
        self.meta = header.meta;

        self.bitmap = AllocBitmap::new(self.first, self.len());
        self.bitmap.load(&snapshot.bitmap);
        self.bmi = IndirectionTable::new(bmi_capacity(self.len()));
        self.bmi.load(snapshot.bmf.clone(), &snapshot.candidates)?;
        self.erl.load(&snapshot.erl);

        Ok(())
    }
}

/// Rebuild the context of `die` from flash
///
/// Blocks around the nominal reservoir are scanned as well, since the boundary of a hybrid die
/// may have moved at format time. If the newest unit of either log role never committed, that
/// role is rewritten right away.
pub fn mount<N: Nand>(nand: &mut N, config: &BmlConfig, die: u32) -> Result<Die> {
    let layout = nand.get_layout();
    let pi = nand.read_pi(die)?;
    let mut rsv = Reservoir::new(&layout, config, die, pi)?;

    let span = rsv.len();
    let lo = rsv.first.saturating_sub(span).max(rsv.die_first);
    let hi = (rsv.last + span).min(rsv.die_end - 1);

    let rpt = howudoin::new()
        .label(format!("Scanning metadata of die {die}"))
        .set_len(u64::from(hi - lo + 1));
    let mut logs = Vec::new();
    for pbn in lo..=hi {
        if let Some(log) = scan_block(nand, &layout, pbn)? {
            logs.push(log);
        }
        rpt.inc();
    }
    rpt.close();

    let newest = logs
        .iter()
        .filter_map(|x| x.newest.as_ref())
        .max_by_key(|x| x.header.global_age)
        .ok_or(BmlError::Unformatted { die })?;

    let header = &newest.header;
    let geometry = Geometry::from(&layout);
    if header.geometry != geometry || header.cells != layout.cells {
        return Err(BmlError::Incompatible(format!(
            "metadata describes {:?} ({:?}), device is {geometry:?} ({:?})",
            header.geometry, header.cells, layout.cells
        )));
    }

    rsv.restore(newest)?;

    let mut pcb = PcbState::formatted(header.shape, geometry);
    pcb.global_age = logs.iter().map(|x| x.global_age).max().unwrap_or_default();

    let mut unconfirmed = Vec::new();
    for role in [PcbRole::Unlockable, PcbRole::Lockable] {
        let block = rsv.meta.get(MetaSlot::from(role));
        let age = logs
            .iter()
            .filter(|x| x.role == Some(role))
            .map(|x| x.pcb_age)
            .max()
            .unwrap_or_default();

        let state = match logs.iter().find(|x| x.pbn == block) {
            Some(log) => {
                if !log.clean {
                    unconfirmed.push(role);
                }
                RoleState {
                    next_page: log.next_page,
                    keep: log.clean,
                    first_write_done: false,
                    age,
                }
            }
            None => RoleState {
                age,
                ..Default::default()
            },
        };
        *pcb.role_mut(role) = state;
    }

    info!(
        die,
        first = rsv.first,
        last = rsv.last,
        age = header.global_age,
        entries = rsv.bmi.len(),
        "mounted"
    );

    let partitions = newest.partitions.clone();
    let mut die = Die::new(layout, config.clone(), rsv, pcb, partitions);

    for role in unconfirmed {
        warn!(die = die.index, ?role, "shedding unconfirmed metadata unit");
        die.force_program(nand, role)?;
    }

    Ok(die)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::die::test::HYBRID_LAYOUT;
    use crate::nand::{PiRecord, SimNand};
    use crate::partition::{Partition, PartitionAttr, PartitionTable};
    use crate::pcb::layout::UpdateKind;
    use crate::volume::Volume;

    fn formatted() -> Volume<SimNand> {
        let mut nand = SimNand::new(HYBRID_LAYOUT);
        nand.write_pi(0, PiRecord { slc_blocks: 100 }, false).unwrap();
        let partitions = PartitionTable::new(vec![
            Partition::new(0, 0, 16).attr(PartitionAttr::LockTight),
            Partition::new(1, 16, 76),
        ])
        .unwrap();
        let config = BmlConfig::default().preprogrammed(true);
        Volume::format(nand, config, partitions).unwrap()
    }

    #[test]
    fn test_mount_restores_state() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        die.rsv.register(20, 96, None)?;
        die.rsv.erl.add(30);
        die.update_log(nand, PcbRole::Unlockable, UpdateKind::BadBlock)?;
        let expected = die.rsv.clone();

        let mut nand = volume.into_nand();
        let die = mount(&mut nand, &BmlConfig::default(), 0)?;
        assert_eq!(die.rsv.bmi, expected.bmi);
        assert_eq!(die.rsv.bitmap, expected.bitmap);
        assert_eq!(die.rsv.meta, expected.meta);
        assert!(die.rsv.erl.contains(30));
        assert_eq!(die.partitions.attr_of(3), PartitionAttr::LockTight);
        assert_eq!(die.bad_units().len(), 1);

        // Appending is never attempted before the first write after mount
        assert!(!die.pcb.unlockable.first_write_done);
        assert!(die.pcb.unlockable.keep);
        assert_eq!(die.pcb.unlockable.next_page, 2 * die.pcb.shape.unit_pages());
        Ok(())
    }

    #[test]
    fn test_unconfirmed_unit_is_ignored() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        let age = die.pcb.global_age;
        let block = die.rsv.meta.upcb;
        let page = die.pcb.unlockable.next_page;

        // A unit whose confirm page never made it to flash
        die.rsv.register(20, 96, None)?;
        let data = die
            .snapshot(PcbRole::Unlockable, UpdateKind::BadBlock)
            .encode(512)?;
        for (n, chunk) in data.chunks(512).enumerate() {
            nand.write_page(block, page + n as u32, chunk)?;
        }

        let mut nand = volume.into_nand();
        let die = mount(&mut nand, &BmlConfig::default(), 0)?;
        assert_eq!(die.rsv.resolve(20), 20);

        // The unconfirmed role was rewritten to a fresh block at mount
        assert_ne!(die.rsv.meta.upcb, block);
        assert_eq!(die.rsv.meta.tpcb, block);
        assert!(die.pcb.global_age > age);
        Ok(())
    }

    #[test]
    fn test_unformatted() {
        let mut nand = SimNand::new(HYBRID_LAYOUT);
        assert!(matches!(
            mount(&mut nand, &BmlConfig::default(), 0),
            Err(BmlError::Unformatted { die: 0 })
        ));
    }
}
