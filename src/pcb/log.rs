//! Writing the metadata log.

use tracing::{debug, trace, warn};

use super::layout::{
    confirm_page, Geometry, MetaSnapshot, PcbHeader, PcbRole, UnitShape, UpdateKind,
};
use crate::die::Die;
use crate::error::{BmlError, NandError, Result};
use crate::nand::{BadMark, Nand};
use crate::reservoir::alloc::Purpose;
use crate::reservoir::MetaBlocks;

/// Per-role state of the log
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct RoleState {
    /// First page after the last unit written to the active block
    pub next_page: u32,

    /// The content of the active block can be trusted, so units may be appended to it
    pub keep: bool,

    /// A unit was written since mount; until then, appending is never attempted
    pub first_write_done: bool,
    pub age: u32,
}

#[derive(Debug, Clone)]
pub struct PcbState {
    pub unlockable: RoleState,
    pub lockable: RoleState,
    pub global_age: u32,
    pub shape: UnitShape,
    pub geometry: Geometry,
}

impl PcbState {
    /// State of a freshly formatted die, whose PCBs are all erased
    pub fn formatted(shape: UnitShape, geometry: Geometry) -> Self {
        let fresh = RoleState {
            next_page: 0,
            keep: true,
            first_write_done: true,
            age: 0,
        };

        Self {
            unlockable: fresh,
            lockable: fresh,
            global_age: 0,
            shape,
            geometry,
        }
    }

    pub fn role(&self, role: PcbRole) -> &RoleState {
        match role {
            PcbRole::Unlockable => &self.unlockable,
            PcbRole::Lockable => &self.lockable,
        }
    }

    pub fn role_mut(&mut self, role: PcbRole) -> &mut RoleState {
        match role {
            PcbRole::Unlockable => &mut self.unlockable,
            PcbRole::Lockable => &mut self.lockable,
        }
    }
}

/// One of the metadata blocks of a reservoir
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MetaSlot {
    Upcb,
    Lpcb,
    Tpcb,
    Ref,
}

impl From<PcbRole> for MetaSlot {
    fn from(value: PcbRole) -> Self {
        match value {
            PcbRole::Unlockable => MetaSlot::Upcb,
            PcbRole::Lockable => MetaSlot::Lpcb,
        }
    }
}

impl MetaBlocks {
    pub fn get(&self, slot: MetaSlot) -> u32 {
        match slot {
            MetaSlot::Upcb => self.upcb,
            MetaSlot::Lpcb => self.lpcb,
            MetaSlot::Tpcb => self.tpcb,
            MetaSlot::Ref => self.ref_block,
        }
    }

    pub fn set(&mut self, slot: MetaSlot, pbn: u32) {
        match slot {
            MetaSlot::Upcb => self.upcb = pbn,
            MetaSlot::Lpcb => self.lpcb = pbn,
            MetaSlot::Tpcb => self.tpcb = pbn,
            MetaSlot::Ref => self.ref_block = pbn,
        }
    }
}

impl Die {
    /// Capture the current state of the die as the next unit of `role`
    pub(crate) fn snapshot(&self, role: PcbRole, kind: UpdateKind) -> MetaSnapshot {
        let rsv = &self.rsv;
        let header = PcbHeader {
            role,
            pcb_age: self.pcb.role(role).age + 1,
            global_age: self.pcb.global_age + 1,
            kind,
            meta: rsv.meta,
            rsv_first: rsv.first,
            rsv_last: rsv.last,
            boundary: rsv.boundary,
            cells: rsv.kind,
            shape: self.pcb.shape,
            geometry: self.pcb.geometry,
            bmf_count: 0,
            rcb_count: 0,
            body_crc: 0,
        };

        MetaSnapshot {
            header,
            partitions: self.partitions.clone(),
            erl: rsv.erl.slots().to_vec(),
            bitmap: rsv.bitmap.as_bytes().to_vec(),
            bmf: rsv.bmi.entries().to_vec(),
            candidates: rsv.bmi.candidate_slots().to_vec(),
        }
    }

    /// Persist the current state of the die through the log of `role`
    ///
    /// Write failures are absorbed by moving the log to a fresh reservoir block; only pool
    /// exhaustion (or an indirection table overflow) makes this fail.
    pub fn update_log<N: Nand>(
        &mut self,
        nand: &mut N,
        role: PcbRole,
        kind: UpdateKind,
    ) -> Result<()> {
        let slot = MetaSlot::from(role);
        let unit_pages = self.pcb.shape.unit_pages();

        let state = *self.pcb.role(role);
        let pages = self.block_pages(nand, self.rsv.meta.get(slot))?;
        if !(state.keep && state.first_write_done && state.next_page + unit_pages <= pages) {
            self.rotate(nand, role)?;
        }

        loop {
            let block = self.rsv.meta.get(slot);
            let page = self.pcb.role(role).next_page;
            let data = self.snapshot(role, kind).encode(self.layout.bytes_per_page)?;

            match self.program_unit(nand, block, page, &data) {
                Ok(()) => {
                    trace!(die = self.index, ?role, ?kind, block, page, "metadata unit written");
                    let state = self.pcb.role_mut(role);
                    state.next_page = page + unit_pages;
                    state.keep = true;
                    state.first_write_done = true;
                    state.age += 1;
                    self.pcb.global_age += 1;
                    self.rsv.erl.clear_pending();
                    return Ok(());
                }

                Err(e) if e.is_block_failure() => {
                    warn!(die = self.index, ?role, block, "metadata write failed: {e}");
                    self.replace_meta_block(nand, slot, BadMark::Write)?;
                    self.erase_meta_block(nand, slot)?;
                    self.pcb.role_mut(role).next_page = 0;
                }

                Err(e) => return Err(self.report(e.into())),
            }
        }
    }

    /// Force the next unit of `role` to go to a freshly erased block, and write it now
    pub(crate) fn force_program<N: Nand>(&mut self, nand: &mut N, role: PcbRole) -> Result<()> {
        self.pcb.role_mut(role).keep = false;
        self.update_log(nand, role, UpdateKind::Forced)
    }

    /// Swap the active block of `role` with the TPCB, and erase it
    fn rotate<N: Nand>(&mut self, nand: &mut N, role: PcbRole) -> Result<()> {
        let slot = MetaSlot::from(role);
        let active = self.rsv.meta.get(slot);
        let temp = self.rsv.meta.tpcb;

        debug!(die = self.index, ?role, from = active, to = temp, "rotating metadata log");
        self.rsv.meta.set(slot, temp);
        self.rsv.meta.tpcb = active;
        self.pcb.role_mut(role).next_page = 0;

        self.erase_meta_block(nand, slot)
    }

    fn program_unit<N: Nand>(
        &self,
        nand: &mut N,
        block: u32,
        page: u32,
        data: &[u8],
    ) -> Result<(), NandError> {
        let page_size = self.layout.bytes_per_page;
        for (n, chunk) in data.chunks(page_size).enumerate() {
            nand.write_page(block, page + n as u32, chunk)?;
        }

        let confirm = page + self.pcb.shape.data_pages;
        nand.write_page(block, confirm, &confirm_page(page_size))?;
        nand.flush()
    }

    /// Erase the metadata block in `slot`, replacing it for as long as erasing fails
    pub(crate) fn erase_meta_block<N: Nand>(&mut self, nand: &mut N, slot: MetaSlot) -> Result<()> {
        loop {
            let pbn = self.rsv.meta.get(slot);
            match nand.erase_block(pbn).and_then(|_| nand.flush()) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_block_failure() => {
                    warn!(die = self.index, ?slot, pbn, "metadata block erase failed: {e}");
                    self.replace_meta_block(nand, slot, BadMark::Erase)?;
                }
                Err(e) => return Err(self.report(e.into())),
            }
        }
    }

    /// Retire the metadata block in `slot` as bad and put a fresh reservoir block in its place
    ///
    /// The new block is not erased, and nothing is persisted; callers do both.
    pub(crate) fn replace_meta_block<N: Nand>(
        &mut self,
        nand: &mut N,
        slot: MetaSlot,
        mark: BadMark,
    ) -> Result<u32> {
        let old = self.rsv.meta.get(slot);
        let cell = match slot {
            MetaSlot::Ref => self.rsv.ref_cell(),
            _ => self.rsv.pcb_cell(),
        };

        let new = match self.rsv.find_free(1, cell, Purpose::Metadata) {
            Some(allocation) => allocation.blocks[0],
            None => return Err(self.report(BmlError::PoolExhausted { die: self.index })),
        };

        debug!(die = self.index, ?slot, old, new, "replacing metadata block");
        self.rsv.register(old, new, None)?;
        self.rsv.meta.set(slot, new);

        if let Err(e) = nand.erase_block(old) {
            debug!(die = self.index, pbn = old, "erasing retired block failed: {e}");
        }
        self.mark_bad(nand, old, mark);

        Ok(new)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::BmlConfig;
    use crate::die::test::HYBRID_LAYOUT;
    use crate::nand::{PiRecord, SimNand};
    use crate::partition::PartitionTable;
    use crate::pcb::layout::PcbHeader;
    use crate::volume::Volume;

    fn formatted() -> Volume<SimNand> {
        let mut nand = SimNand::new(HYBRID_LAYOUT);
        nand.write_pi(0, PiRecord { slc_blocks: 100 }, false).unwrap();
        Volume::format(nand, BmlConfig::default(), PartitionTable::default()).unwrap()
    }

    fn header_at(volume: &mut Volume<SimNand>, pbn: u32, page: u32) -> Option<PcbHeader> {
        let mut buf = vec![0u8; 512];
        volume.nand_mut().read_page(pbn, page, &mut buf).ok()?;
        PcbHeader::decode(&buf)
    }

    #[test]
    fn test_format_allocates_meta_blocks() {
        let volume = formatted();
        let meta = volume.die(0).unwrap().rsv.meta;
        assert_eq!((meta.upcb, meta.lpcb, meta.tpcb, meta.ref_block), (92, 93, 94, 115));
    }

    #[test]
    fn test_append_then_rotate() -> Result<()> {
        let mut volume = formatted();
        let unit_pages = volume.die(0)?.pcb.shape.unit_pages();
        assert_eq!(unit_pages, 7);

        // The format unit sits at page 0; the next one is appended after it
        let die = volume.die_mut(0)?;
        let first = die.rsv.meta.upcb;
        assert_eq!(die.pcb.unlockable.next_page, unit_pages);

        let (die, nand) = volume.split_die(0)?;
        die.update_log(nand, PcbRole::Unlockable, UpdateKind::Refresh)?;
        assert_eq!(die.rsv.meta.upcb, first);
        assert_eq!(die.pcb.unlockable.next_page, 2 * unit_pages);

        // SLC blocks of this device have 16 pages, so a third unit does not fit
        let temp = die.rsv.meta.tpcb;
        die.update_log(nand, PcbRole::Unlockable, UpdateKind::Refresh)?;
        assert_eq!(die.rsv.meta.upcb, temp);
        assert_eq!(die.rsv.meta.tpcb, first);
        assert_eq!(die.pcb.unlockable.next_page, unit_pages);

        // And the next rotation goes back to the first block
        die.update_log(nand, PcbRole::Unlockable, UpdateKind::Refresh)?;
        die.update_log(nand, PcbRole::Unlockable, UpdateKind::Refresh)?;
        assert_eq!(die.rsv.meta.upcb, first);
        assert_eq!(die.rsv.meta.tpcb, temp);

        let header = header_at(&mut volume, first, 0).unwrap();
        assert_eq!(header.role, PcbRole::Unlockable);
        assert_eq!(header.meta.tpcb, temp);
        Ok(())
    }

    #[test]
    fn test_unconfirmed_unit_forces_rotation() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        let first = die.rsv.meta.upcb;

        die.pcb.unlockable.keep = false;
        die.update_log(nand, PcbRole::Unlockable, UpdateKind::Refresh)?;
        assert_ne!(die.rsv.meta.upcb, first);
        assert_eq!(die.rsv.meta.tpcb, first);
        Ok(())
    }

    #[test]
    fn test_write_failure_replaces_pcb() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        let first = die.rsv.meta.upcb;
        let age = die.pcb.global_age;

        nand.fail_writes(first, 0);
        die.update_log(nand, PcbRole::Unlockable, UpdateKind::Refresh)?;

        let new = die.rsv.meta.upcb;
        assert_ne!(new, first);
        assert!(die.rsv.contains(new));
        assert_eq!(die.rsv.resolve(first), new);
        assert!(!nand.bad_marks(first).is_empty());
        assert_eq!(die.pcb.unlockable.next_page, die.pcb.shape.unit_pages());
        assert_eq!(die.pcb.global_age, age + 1);
        Ok(())
    }

    #[test]
    fn test_exhaustion_is_fatal() {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0).unwrap();

        // Every SLC spare is gone, and the log's block keeps failing
        for pbn in die.rsv.sub_range(die.rsv.pcb_cell()) {
            die.rsv.bitmap.mark_allocated(pbn);
        }
        nand.fail_writes(die.rsv.meta.upcb, 0);

        let err = die
            .update_log(nand, PcbRole::Unlockable, UpdateKind::Refresh)
            .unwrap_err();
        assert!(matches!(err, BmlError::PoolExhausted { die: 0 }));
        assert!(err.is_fatal());
    }
}
