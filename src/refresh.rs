//! The erase-refresh engine: curing read disturbance by copying a block to REF, erasing it, and
//! copying it back.
//!
//! A block's ERL entry moves to [RefreshProgress::Copied] and is logged before the block is
//! erased, so a power loss anywhere in the cure is finished by [Die::resume_interrupted].

use tracing::{debug, info, warn};

use crate::die::{Die, ReadErrors};
use crate::error::{BmlError, NandError, OpKind, Result};
use crate::nand::{BadMark, LockState, Nand};
use crate::pcb::layout::{PcbRole, UpdateKind};
use crate::pcb::log::MetaSlot;
use crate::reservoir::erl::{AddOutcome, RefreshProgress};

/// Why the erase-refresh state of a block is being touched
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Disturbance {
    /// A read of the block reported disturbance; start tracking it
    Update,

    /// Write entries added since the last log update
    ProgramLog,

    /// Write the log to a freshly erased block
    ForcedProgram,

    Delete,

    /// Forget the block, leaving its slot empty until the list is next compacted
    DeleteFromLogOnly,
}

/// How many tracked blocks a batch cures
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RefreshScope {
    /// Up to [crate::config::BmlConfig::refresh_partial_quota] blocks
    Partial,
    All,
    User(usize),
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct RefreshReport {
    pub refreshed: usize,

    /// Entries given up on: lock-tight blocks, unknown lock state, unreadable source
    pub dropped: usize,
}

enum Outcome {
    Refreshed,
    Dropped,
    Unreadable,
}

impl Die {
    pub fn note_disturbance<N: Nand>(
        &mut self,
        nand: &mut N,
        sbn: u32,
        reason: Disturbance,
    ) -> Result<()> {
        let role = self.role_for(sbn);

        match reason {
            Disturbance::Update => match self.rsv.erl.add(sbn) {
                AddOutcome::Added => debug!(die = self.index, sbn, "tracking disturbed block"),
                AddOutcome::AlreadyTracked => {}
                AddOutcome::Full => {
                    warn!(die = self.index, sbn, "erase-refresh list full, ignoring block")
                }
            },

            Disturbance::ProgramLog => {
                if self.rsv.erl.pending() > 0 {
                    self.update_log(nand, role, UpdateKind::Refresh)?;
                }
            }

            Disturbance::ForcedProgram => self.force_program(nand, role)?,

            Disturbance::Delete => {
                if self.rsv.erl.remove(sbn) {
                    self.update_log(nand, role, UpdateKind::Refresh)?;
                }
            }

            Disturbance::DeleteFromLogOnly => {
                if self.rsv.erl.remove_leave_gap(sbn) {
                    self.update_log(nand, role, UpdateKind::Refresh)?;
                }
            }
        }

        Ok(())
    }

    /// Cure tracked blocks, in list order, until the quota of `scope` is met
    ///
    /// Blocks with uncorrectable reads are dropped from the list; with `notify_read_error` set,
    /// they are reported as [BmlError::RefreshReadError] once the whole batch is done.
    pub fn refresh_batch<N: Nand>(
        &mut self,
        nand: &mut N,
        scope: RefreshScope,
        notify_read_error: bool,
    ) -> Result<RefreshReport> {
        let quota = match scope {
            RefreshScope::Partial => self.config.refresh_partial_quota,
            RefreshScope::All => usize::MAX,
            RefreshScope::User(n) => n,
        };
        let targets: Vec<u32> = self.rsv.erl.iter().map(|x| x.sbn).take(quota).collect();
        if targets.is_empty() {
            return Ok(Default::default());
        }

        let rpt = howudoin::new()
            .label(format!("Refreshing die {}", self.index))
            .set_len(targets.len() as u64);

        let mut report = RefreshReport::default();
        let mut unreadable = Vec::new();
        let mut failure = None;
        for sbn in targets {
            // Moving a sibling during an earlier cure takes it off the list
            if !self.rsv.erl.contains(sbn) {
                debug!(die = self.index, sbn, "no longer tracked, skipping");
                rpt.inc();
                continue;
            }

            match self.refresh_one(nand, sbn) {
                Ok(Outcome::Refreshed) => report.refreshed += 1,
                Ok(Outcome::Dropped) => report.dropped += 1,
                Ok(Outcome::Unreadable) => {
                    report.dropped += 1;
                    unreadable.push(sbn);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            rpt.inc();
        }
        rpt.close();

        // REF goes back to erased even when the batch stopped early
        let erased = self.erase_ref(nand);
        if let Some(e) = failure {
            warn!(die = self.index, ?report, "refresh batch stopped: {e}");
            return Err(e);
        }
        erased?;

        info!(die = self.index, ?report, "refresh batch done");
        if notify_read_error && !unreadable.is_empty() {
            let blocks = unreadable;
            return Err(self.report(BmlError::RefreshReadError { blocks, report }));
        }
        Ok(report)
    }

    /// Finish a refresh that lost power after its block reached REF
    ///
    /// Returns whether there was one.
    pub fn resume_interrupted<N: Nand>(&mut self, nand: &mut N) -> Result<bool> {
        let Some(entry) = self.rsv.erl.find_copied() else {
            return Ok(false);
        };

        info!(die = self.index, sbn = entry.sbn, "resuming interrupted refresh");
        let lock = self.unlock_for_refresh(nand, entry.sbn)?;
        self.cure(nand, entry.sbn)?;
        self.erase_ref(nand)?;
        if let Some(state) = lock {
            self.relock_after_refresh(nand, entry.sbn, state)?;
        }

        Ok(true)
    }

    fn refresh_one<N: Nand>(&mut self, nand: &mut N, sbn: u32) -> Result<Outcome> {
        let pbn = self.rsv.resolve(sbn);
        let state = match self.query_lock(nand, pbn) {
            None => {
                self.drop_entry(nand, sbn)?;
                return Ok(Outcome::Dropped);
            }
            Some(LockState::LockTight) => {
                info!(die = self.index, sbn, pbn, "lock-tight block cannot be refreshed");
                self.drop_entry(nand, sbn)?;
                return Ok(Outcome::Dropped);
            }
            Some(state) => state,
        };
        if state == LockState::Locked {
            self.set_lock(nand, pbn, LockState::Unlocked)
                .map_err(|e| self.report(e))?;
        }

        if !self.preserve(nand, sbn)? {
            if state == LockState::Locked {
                self.relock_after_refresh(nand, sbn, state)?;
            }
            self.drop_entry(nand, sbn)?;
            return Ok(Outcome::Unreadable);
        }

        self.rsv.erl.set_progress(sbn, RefreshProgress::Copied);
        self.update_log(nand, self.role_for(sbn), UpdateKind::Refresh)?;

        self.cure(nand, sbn)?;
        if state == LockState::Locked {
            self.relock_after_refresh(nand, sbn, state)?;
        }

        debug!(die = self.index, sbn, "block refreshed");
        Ok(Outcome::Refreshed)
    }

    /// Stage 1: copy the whole block into a freshly erased REF
    ///
    /// Returns `false` if the block cannot be read back.
    fn preserve<N: Nand>(&mut self, nand: &mut N, sbn: u32) -> Result<bool> {
        let pbn = self.rsv.resolve(sbn);

        loop {
            self.erase_ref(nand)?;
            let ref_block = self.rsv.meta.ref_block;

            match self.copy_block(nand, pbn, ref_block, None, ReadErrors::Abort) {
                Ok(()) => return Ok(true),
                Err(NandError::UncorrectableRead { page, .. }) => {
                    warn!(die = self.index, sbn, pbn, page, "unreadable, dropped from refresh");
                    return Ok(false);
                }
                Err(e) if e.is_block_failure() => {
                    warn!(die = self.index, pbn = ref_block, "REF block failed: {e}");
                    self.replace_meta_block(nand, MetaSlot::Ref, BadMark::Write)?;
                    self.update_log(nand, PcbRole::Unlockable, UpdateKind::MetaBlock)?;
                }
                Err(e) => return Err(self.report(e.into())),
            }
        }
    }

    /// Stage 2: erase the block and copy REF back into it, then forget the entry
    ///
    /// A block that fails here is replaced, and the copy goes to its replacement instead.
    fn cure<N: Nand>(&mut self, nand: &mut N, sbn: u32) -> Result<()> {
        loop {
            let pbn = self.rsv.resolve(sbn);
            let ref_block = self.rsv.meta.ref_block;

            let cause = match nand.erase_block(pbn).and_then(|_| nand.flush()) {
                Ok(()) => match self.copy_block(nand, ref_block, pbn, None, ReadErrors::Skip) {
                    Ok(()) => break,
                    Err(e) if e.is_write_error() => OpKind::Write,
                    Err(e) => return Err(self.report(e.into())),
                },
                Err(e) if e.is_erase_error() => OpKind::Erase,
                Err(e) => return Err(self.report(e.into())),
            };

            warn!(die = self.index, sbn, pbn, ?cause, "block failed during refresh");
            self.replace_blocks(nand, sbn, 0, 1, cause, true)?;
        }

        self.rsv.erl.remove(sbn);
        self.update_log(nand, self.role_for(sbn), UpdateKind::Refresh)
    }

    /// Erase REF, logging the change if the block had to be replaced
    pub(crate) fn erase_ref<N: Nand>(&mut self, nand: &mut N) -> Result<()> {
        let before = self.rsv.meta.ref_block;
        self.erase_meta_block(nand, MetaSlot::Ref)?;
        if self.rsv.meta.ref_block != before {
            self.update_log(nand, PcbRole::Unlockable, UpdateKind::MetaBlock)?;
        }
        Ok(())
    }

    fn drop_entry<N: Nand>(&mut self, nand: &mut N, sbn: u32) -> Result<()> {
        self.rsv.erl.remove(sbn);
        self.update_log(nand, self.role_for(sbn), UpdateKind::Refresh)
    }

    /// Lift the lock of a tracked block; returns the state to put back afterwards
    fn unlock_for_refresh<N: Nand>(&mut self, nand: &mut N, sbn: u32) -> Result<Option<LockState>> {
        let pbn = self.rsv.resolve(sbn);
        match self.query_lock(nand, pbn) {
            Some(LockState::Locked) => {
                self.set_lock(nand, pbn, LockState::Unlocked)
                    .map_err(|e| self.report(e))?;
                Ok(Some(LockState::Locked))
            }
            _ => Ok(None),
        }
    }

    fn relock_after_refresh<N: Nand>(
        &mut self,
        nand: &mut N,
        sbn: u32,
        state: LockState,
    ) -> Result<()> {
        let pbn = self.rsv.resolve(sbn);
        self.set_lock(nand, pbn, state).map_err(|e| self.report(e))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::BmlConfig;
    use crate::die::test::HYBRID_LAYOUT;
    use crate::nand::{PageUtil, PiRecord, SimNand};
    use crate::volume::Volume;

    fn formatted() -> Volume<SimNand> {
        let mut nand = SimNand::new(HYBRID_LAYOUT);
        nand.write_pi(0, PiRecord { slc_blocks: 100 }, false).unwrap();
        Volume::format(nand, BmlConfig::default(), Default::default()).unwrap()
    }

    fn fill(nand: &mut SimNand, pbn: u32, pages: u32) {
        let mut page = vec![0u8; 512];
        for n in 0..pages {
            page.fill(pbn as u8 ^ n as u8);
            nand.write_page(pbn, n, &page).unwrap();
        }
    }

    #[test]
    fn test_single_entry_refresh() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        fill(nand, 30, 12);
        nand.disturb(30);
        let before = nand.block_data(30);
        let allocated = die.rsv.bitmap.count_allocated();

        die.note_disturbance(nand, 30, Disturbance::Update)?;
        let report = die.refresh_batch(nand, RefreshScope::All, true)?;

        assert_eq!(report, RefreshReport { refreshed: 1, dropped: 0 });
        assert_eq!(nand.block_data(30), before);
        assert!(die.rsv.erl.is_empty());
        assert!(nand.block_data(die.rsv.meta.ref_block).is_erased());
        assert_eq!(die.rsv.bitmap.count_allocated(), allocated);
        assert_eq!(die.rsv.bmi.candidates().count(), 0);
        assert!(die.rsv.bmi.is_empty());
        Ok(())
    }

    #[test]
    fn test_duplicate_update() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;

        die.note_disturbance(nand, 30, Disturbance::Update)?;
        die.note_disturbance(nand, 30, Disturbance::Update)?;
        assert_eq!(die.rsv.erl.len(), 1);
        assert_eq!(die.rsv.erl.pending(), 1);

        // Only a pending change is worth a log write
        let age = die.pcb.global_age;
        die.note_disturbance(nand, 30, Disturbance::ProgramLog)?;
        die.note_disturbance(nand, 30, Disturbance::ProgramLog)?;
        assert_eq!(die.pcb.global_age, age + 1);
        Ok(())
    }

    #[test]
    fn test_delete_reasons() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        for sbn in [30, 31, 32] {
            die.note_disturbance(nand, sbn, Disturbance::Update)?;
        }

        die.note_disturbance(nand, 30, Disturbance::DeleteFromLogOnly)?;
        assert!(die.rsv.erl.slots()[0].is_none());
        die.note_disturbance(nand, 31, Disturbance::Delete)?;
        assert_eq!(die.rsv.erl.slots()[0].map(|x| x.sbn), Some(32));
        assert_eq!(die.rsv.erl.len(), 1);

        let upcb = die.rsv.meta.upcb;
        die.note_disturbance(nand, 32, Disturbance::ForcedProgram)?;
        assert_ne!(die.rsv.meta.upcb, upcb);
        Ok(())
    }

    #[test]
    fn test_delete_untracked_block() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        die.note_disturbance(nand, 30, Disturbance::Update)?;
        let (age, pending) = (die.pcb.global_age, die.rsv.erl.pending());

        die.note_disturbance(nand, 31, Disturbance::Delete)?;
        die.note_disturbance(nand, 32, Disturbance::DeleteFromLogOnly)?;
        assert_eq!(die.pcb.global_age, age);
        assert_eq!(die.rsv.erl.pending(), pending);
        assert_eq!(die.rsv.erl.len(), 1);
        Ok(())
    }

    #[test]
    fn test_crash_after_preserve() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        fill(nand, 30, 9);
        let before = nand.block_data(30);

        die.note_disturbance(nand, 30, Disturbance::Update)?;
        assert!(die.preserve(nand, 30)?);
        die.rsv.erl.set_progress(30, RefreshProgress::Copied);
        die.update_log(nand, PcbRole::Unlockable, UpdateKind::Refresh)?;

        // Power is lost right after the block was erased
        nand.erase_block(30)?;

        let nand = volume.into_nand();
        let volume = Volume::open(nand, BmlConfig::default())?;
        let die = volume.die(0)?;
        assert_eq!(volume.nand().block_data(30), before);
        assert!(die.rsv.erl.is_empty());
        assert!(volume.nand().block_data(die.rsv.meta.ref_block).is_erased());
        Ok(())
    }

    #[test]
    fn test_lock_query_failure_drops_entry() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        fill(nand, 30, 2);
        nand.fail_lock_query(30);

        die.note_disturbance(nand, 30, Disturbance::Update)?;
        let report = die.refresh_batch(nand, RefreshScope::All, false)?;
        assert_eq!(report, RefreshReport { refreshed: 0, dropped: 1 });
        assert!(die.rsv.erl.is_empty());
        Ok(())
    }

    #[test]
    fn test_locked_block_is_relocked() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        fill(nand, 30, 2);
        nand.set_lock(30, 1, LockState::Locked)?;

        die.note_disturbance(nand, 30, Disturbance::Update)?;
        die.refresh_batch(nand, RefreshScope::All, false)?;
        assert_eq!(nand.lock_state(30)?, LockState::Locked);
        assert_eq!(nand.block_data(30).len(), 2 * 512);
        Ok(())
    }

    #[test]
    fn test_read_error_reported_after_batch() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        fill(nand, 30, 4);
        fill(nand, 40, 4);
        nand.fail_read(30, 2);
        die.note_disturbance(nand, 30, Disturbance::Update)?;
        die.note_disturbance(nand, 40, Disturbance::Update)?;

        let err = die.refresh_batch(nand, RefreshScope::All, true).unwrap_err();
        let BmlError::RefreshReadError { blocks, report } = err else {
            panic!("unexpected error");
        };
        assert_eq!(blocks, [30]);
        assert_eq!(report, RefreshReport { refreshed: 1, dropped: 1 });

        // The rest of the batch still ran, and the unreadable block was left alone
        assert!(die.rsv.erl.is_empty());
        assert_eq!(nand.block_data(30).len(), 4 * 512);
        Ok(())
    }

    #[test]
    fn test_copy_back_failure_replaces_block() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        fill(nand, 30, 6);
        let before = nand.block_data(30);
        nand.fail_writes(30, 0);

        die.note_disturbance(nand, 30, Disturbance::Update)?;
        die.refresh_batch(nand, RefreshScope::All, false)?;

        assert_eq!(die.rsv.resolve(30), 96);
        assert_eq!(nand.block_data(96), before);
        assert!(!nand.bad_marks(30).is_empty());
        assert!(die.rsv.erl.is_empty());
        Ok(())
    }

    #[test]
    fn test_moved_sibling_is_not_refreshed_again() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        fill(nand, 30, 6);
        fill(nand, 31, 3);
        let before_31 = nand.block_data(31);
        nand.fail_writes(30, 0);

        die.note_disturbance(nand, 30, Disturbance::Update)?;
        die.note_disturbance(nand, 31, Disturbance::Update)?;
        let report = die.refresh_batch(nand, RefreshScope::All, false)?;

        // 31 went along with 30 into the paired replacement
        assert_eq!(report, RefreshReport { refreshed: 1, dropped: 0 });
        assert_eq!(die.rsv.resolve(31), 97);
        assert_eq!(nand.block_data(97), before_31);
        assert!(die.rsv.erl.is_empty());
        Ok(())
    }

    #[test]
    fn test_lock_failure_still_erases_ref() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        fill(nand, 30, 4);
        fill(nand, 40, 4);
        nand.set_lock(40, 1, LockState::Locked)?;
        nand.fail_set_lock(40);

        die.note_disturbance(nand, 30, Disturbance::Update)?;
        die.note_disturbance(nand, 40, Disturbance::Update)?;
        let err = die.refresh_batch(nand, RefreshScope::All, false).unwrap_err();

        assert!(matches!(err, BmlError::LockFailed { pbn: 40, .. }));
        assert!(!die.rsv.erl.contains(30));
        assert!(die.rsv.erl.contains(40));
        assert!(nand.block_data(die.rsv.meta.ref_block).is_erased());
        Ok(())
    }

    #[test]
    fn test_partial_quota() -> Result<()> {
        let mut volume = formatted();
        let (die, nand) = volume.split_die(0)?;
        for sbn in 40..60 {
            die.note_disturbance(nand, sbn, Disturbance::Update)?;
        }

        let report = die.refresh_batch(nand, RefreshScope::Partial, false)?;
        assert_eq!(report.refreshed, 16);
        assert_eq!(die.rsv.erl.len(), 4);
        assert_eq!(die.rsv.erl.iter().next().map(|x| x.sbn), Some(56));

        die.refresh_batch(nand, RefreshScope::User(3), false)?;
        assert_eq!(die.rsv.erl.len(), 1);
        Ok(())
    }
}
