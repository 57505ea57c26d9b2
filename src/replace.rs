//! The bad-block replacement protocol.
//!
//! A replacement runs as a small phase machine:
//!
//! ```text
//! Unlock -> Allocate -> Copy -> Commit -> Mark -> Relock -> Done
//!              ^         |                          |
//!              +---------+--------------------------+
//! ```
//!
//! A failing target block sends it back to `Allocate`, as does a new block that refuses its lock
//! state. The loop only ends on success, or when the reservoir runs dry.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::die::{Die, ReadErrors};
use crate::error::{BmlError, OpKind, Result};
use crate::nand::{BadMark, CellLayout, LockState, Nand};
use crate::pcb::layout::UpdateKind;
use crate::reservoir::alloc::Purpose;

/// One block's worth of data changing place
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Move {
    sbn: u32,

    /// The physical block the data moves out of
    old: u32,
    new: u32,

    /// `false` for a good sibling moved along with a paired allocation
    bad: bool,

    /// Pages of `old` worth copying; `None` for all of them
    pages: Option<u32>,
}

#[derive(Debug)]
enum Phase {
    Unlock,
    Allocate,
    Copy(Vec<Move>),
    Commit(Vec<Move>),
    Mark(Vec<Move>),
    Relock(Vec<Move>),
    Done,
}

/// The parts of a replacement that outlive a single attempt
#[derive(Debug)]
struct Job {
    /// The failing blocks, all in one plane group
    group: Vec<u32>,
    limit: Option<u32>,
    mark: BadMark,

    /// Keep the erase-refresh entry of `group[0]`; refresh is still working on it
    retain_refresh_entry: bool,

    /// Lock states found before the replacement started, by semi-physical block
    locks: HashMap<u32, LockState>,
}

impl Die {
    /// Move the data of failing blocks into fresh blocks of the reservoir
    ///
    /// `group_len` failing blocks start at `sbn`, all in the same plane group. For a write
    /// failure, the pages below `failed_page` are carried over; for an erase failure nothing is.
    pub fn handle_bad_block<N: Nand>(
        &mut self,
        nand: &mut N,
        sbn: u32,
        failed_page: u32,
        group_len: u32,
        cause: OpKind,
    ) -> Result<()> {
        self.replace_blocks(nand, sbn, failed_page, group_len, cause, false)
    }

    pub(crate) fn replace_blocks<N: Nand>(
        &mut self,
        nand: &mut N,
        sbn: u32,
        failed_page: u32,
        group_len: u32,
        cause: OpKind,
        retain_refresh_entry: bool,
    ) -> Result<()> {
        let planes = self.rsv.planes;
        let last = sbn + group_len.saturating_sub(1);
        if group_len == 0
            || group_len > planes
            || sbn / planes != last / planes
            || !self.rsv.contains_die_block(sbn)
            || !self.rsv.contains_die_block(last)
            || self.rsv.contains(sbn)
            || self.rsv.contains(last)
        {
            return Err(BmlError::InvalidArgument(format!(
                "cannot replace {group_len} blocks from {sbn} on die {}",
                self.index
            )));
        }
        if self.rsv.kind == CellLayout::Hybrid && sbn == self.rsv.die_first {
            return Err(BmlError::InvalidArgument(format!(
                "first block of hybrid die {} cannot be replaced",
                self.index
            )));
        }

        let (limit, mark) = match cause {
            OpKind::Write => (Some(failed_page), BadMark::Write),
            OpKind::Erase => (Some(0), BadMark::Erase),
        };
        let mut job = Job {
            group: (sbn..=last).collect(),
            limit,
            mark,
            retain_refresh_entry,
            locks: HashMap::new(),
        };

        info!(die = self.index, sbn, group_len, ?cause, failed_page, "replacing bad block");

        let mut phase = Phase::Unlock;
        loop {
            phase = match phase {
                Phase::Unlock => {
                    self.unlock_group(nand, &mut job)?;
                    Phase::Allocate
                }

                Phase::Allocate => Phase::Copy(self.allocate_moves(&job)?),

                Phase::Copy(moves) => {
                    if self.copy_moves(nand, &moves)? {
                        Phase::Commit(moves)
                    } else {
                        Phase::Allocate
                    }
                }

                Phase::Commit(moves) => {
                    self.commit_moves(nand, &job, &moves)?;
                    Phase::Mark(moves)
                }

                Phase::Mark(moves) => {
                    for m in moves.iter().filter(|x| x.bad) {
                        self.mark_bad(nand, m.old, job.mark);
                    }
                    Phase::Relock(moves)
                }

                Phase::Relock(moves) => match self.relock_moves(nand, &job, &moves) {
                    None => Phase::Done,
                    Some(m) => {
                        let (sbn, pbn) = (m.sbn, m.new);
                        warn!(die = self.index, sbn, pbn, "relock failed, retiring new block");
                        job.group = vec![m.sbn];
                        job.limit = None;
                        job.mark = BadMark::Lock;
                        Phase::Allocate
                    }
                },

                Phase::Done => return Ok(()),
            };
        }
    }

    /// Remember the lock state of the plane group, and unlock the failing blocks
    fn unlock_group<N: Nand>(&mut self, nand: &mut N, job: &mut Job) -> Result<()> {
        let planes = self.rsv.planes;
        let base = job.group[0] - job.group[0] % planes;

        for sbn in base..base + planes {
            let pbn = self.rsv.resolve(sbn);
            let Some(state) = self.query_lock(nand, pbn) else {
                continue;
            };
            job.locks.insert(sbn, state);

            if state == LockState::Locked && job.group.contains(&sbn) {
                debug!(die = self.index, sbn, pbn, "unlocking for replacement");
                self.set_lock(nand, pbn, LockState::Unlocked)
                    .map_err(|e| self.report(e))?;
            }
        }

        Ok(())
    }

    /// Can `sbn` follow its failing sibling into a paired allocation?
    fn sibling_movable(&self, sbn: u32) -> bool {
        self.rsv.contains_die_block(sbn)
            && !self.rsv.contains(sbn)
            && self.rsv.bmi.lookup(sbn).is_none()
    }

    fn allocate_moves(&mut self, job: &Job) -> Result<Vec<Move>> {
        let first = job.group[0];
        let cell = self.rsv.cell_type_of(first);
        let count = job.group.len() as u32;

        let Some(allocation) = self.rsv.find_free(count, cell, Purpose::BadBlock) else {
            return Err(self.report(BmlError::PoolExhausted { die: self.index }));
        };

        let bad_move = |die: &Self, sbn: u32, new: u32| Move {
            sbn,
            old: die.rsv.resolve(sbn),
            new,
            bad: true,
            pages: job.limit,
        };

        let mut moves = Vec::with_capacity(allocation.blocks.len());
        if allocation.paired {
            let base = first - first % self.rsv.planes;
            for (plane, &new) in allocation.blocks.iter().enumerate() {
                let sbn = base + plane as u32;
                if job.group.contains(&sbn) {
                    moves.push(bad_move(self, sbn, new));
                } else if self.sibling_movable(sbn) {
                    moves.push(Move {
                        sbn,
                        old: sbn,
                        new,
                        bad: false,
                        pages: None,
                    });
                } else {
                    self.rsv.release(&[new]);
                }
            }
        } else {
            for (&sbn, &new) in job.group.iter().zip(&allocation.blocks) {
                moves.push(bad_move(self, sbn, new));
            }
        }

        debug!(die = self.index, ?moves, "replacement planned");
        Ok(moves)
    }

    /// Prepare the target blocks and carry the data over
    ///
    /// Returns `false` if a target failed; it is retired, the others are released, and the
    /// caller must allocate again.
    fn copy_moves<N: Nand>(&mut self, nand: &mut N, moves: &[Move]) -> Result<bool> {
        for m in moves {
            // A candidate keeps the lock of the sibling that left it
            if !self.rsv.contains(m.new) && self.query_lock(nand, m.new) == Some(LockState::Locked)
            {
                if let Err(e) = self.set_lock(nand, m.new, LockState::Unlocked) {
                    warn!(die = self.index, pbn = m.new, "could not unlock candidate: {e}");
                    self.retire_target(nand, m.new, BadMark::Lock);
                    for other in moves.iter().filter(|x| x.new != m.new) {
                        self.rsv.release(&[other.new]);
                    }
                    return Ok(false);
                }
            }

            let result = nand.erase_block(m.new).and_then(|_| nand.flush());
            let (result, mark) = match result {
                Ok(()) if m.pages == Some(0) => continue,
                Ok(()) => (
                    self.copy_block(nand, m.old, m.new, m.pages, ReadErrors::Skip),
                    BadMark::Write,
                ),
                Err(e) => (Err(e), BadMark::Erase),
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_block_failure() => {
                    warn!(die = self.index, pbn = m.new, "replacement block failed: {e}");
                    self.retire_target(nand, m.new, mark);
                    for other in moves.iter().filter(|x| x.new != m.new) {
                        self.rsv.release(&[other.new]);
                    }
                    return Ok(false);
                }
                Err(e) => return Err(self.report(e.into())),
            }
        }

        Ok(true)
    }

    /// Take a target block that failed out of circulation
    fn retire_target<N: Nand>(&mut self, nand: &mut N, pbn: u32, mark: BadMark) {
        if !self.rsv.contains(pbn) {
            self.rsv.bmi.delete_candidate(pbn);
        }
        self.mark_bad(nand, pbn, mark);
    }

    fn commit_moves<N: Nand>(&mut self, nand: &mut N, job: &Job, moves: &[Move]) -> Result<()> {
        for m in moves {
            let retained = job.retain_refresh_entry && m.sbn == job.group[0];
            if !retained {
                self.rsv.erl.remove(m.sbn);
            }

            let candidate = (!m.bad).then_some(m.old);
            self.rsv.register(m.sbn, m.new, candidate)?;
        }

        let role = self.role_for(job.group[0]);
        self.update_log(nand, role, UpdateKind::BadBlock)?;
        self.rebuild_bad_units();

        for m in moves {
            info!(die = self.index, sbn = m.sbn, old = m.old, new = m.new, "block replaced");
        }
        Ok(())
    }

    /// Put the saved lock states back; returns the move whose new block refused its lock
    fn relock_moves<N: Nand>(&mut self, nand: &mut N, job: &Job, moves: &[Move]) -> Option<Move> {
        for m in moves {
            let state = match job.locks.get(&m.sbn) {
                Some(&state) if state != LockState::Unlocked => state,
                _ => continue,
            };

            if m.bad {
                if let Err(e) = self.set_lock(nand, m.old, state) {
                    warn!(die = self.index, pbn = m.old, "could not relock retired block: {e}");
                }
            }
            if let Err(e) = self.set_lock(nand, m.new, state) {
                warn!(die = self.index, pbn = m.new, "could not lock new block: {e}");
                return Some(*m);
            }
        }

        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::BmlConfig;
    use crate::die::test::HYBRID_LAYOUT;
    use crate::nand::{PageUtil, PiRecord, SimNand};
    use crate::partition::{Partition, PartitionAttr, PartitionTable};
    use crate::volume::Volume;

    fn formatted(config: BmlConfig) -> Volume<SimNand> {
        let mut nand = SimNand::new(HYBRID_LAYOUT);
        nand.write_pi(0, PiRecord { slc_blocks: 100 }, false).unwrap();
        let partitions = PartitionTable::new(vec![
            Partition::new(0, 0, 16).attr(PartitionAttr::LockTight),
            Partition::new(1, 16, 76),
        ])
        .unwrap();
        Volume::format(nand, config.preprogrammed(true), partitions).unwrap()
    }

    fn fill(nand: &mut SimNand, pbn: u32, pages: u32, seed: u8) {
        let mut page = vec![0u8; 512];
        for n in 0..pages {
            page.fill(seed.wrapping_add(n as u8));
            nand.write_page(pbn, n, &page).unwrap();
        }
    }

    #[test]
    fn test_paired_replacement_scenario() -> Result<()> {
        let mut volume = formatted(BmlConfig::default());
        let (die, nand) = volume.split_die(0)?;
        fill(nand, 42, 11, 0x10);
        fill(nand, 43, 5, 0x80);
        let before_42 = nand.block_data(42);
        let before_43 = nand.block_data(43);
        die.rsv.erl.add(42);
        let ages = (die.pcb.unlockable.age, die.pcb.lockable.age);

        die.handle_bad_block(nand, 42, 10, 1, OpKind::Write)?;

        assert_eq!(die.rsv.resolve(42), 96);
        assert_eq!(die.rsv.resolve(43), 97);
        assert!(die.rsv.bmi.is_candidate(43));
        assert!(!die.rsv.erl.contains(42));

        // Only pages 0-9 of 42 made it over, all of 43 did
        assert_eq!(nand.block_data(96), before_42[..10 * 512]);
        assert_eq!(nand.block_data(97), before_43);

        assert!(!nand.bad_marks(42).is_empty());
        assert!(nand.bad_marks(43).is_empty());

        assert_eq!(die.pcb.unlockable.age, ages.0 + 1);
        assert_eq!(die.pcb.lockable.age, ages.1);
        assert_eq!(die.bad_units().len(), 2);
        Ok(())
    }

    #[test]
    fn test_lock_tight_partition_uses_lockable_log() -> Result<()> {
        let mut volume = formatted(BmlConfig::default());
        let (die, nand) = volume.split_die(0)?;
        let ages = (die.pcb.unlockable.age, die.pcb.lockable.age);

        die.handle_bad_block(nand, 4, 0, 2, OpKind::Erase)?;
        assert_eq!(die.pcb.lockable.age, ages.1 + 1);
        assert_eq!(die.pcb.unlockable.age, ages.0);

        // Both blocks of the group were bad, so there is no candidate
        assert_eq!(die.rsv.bmi.candidates().count(), 0);
        assert_eq!(nand.bad_marks(4)[0], (0, BadMark::Erase));
        assert_eq!(nand.bad_marks(5)[0], (0, BadMark::Erase));
        Ok(())
    }

    #[test]
    fn test_failed_copy_retries() -> Result<()> {
        let mut volume = formatted(BmlConfig::default());
        let (die, nand) = volume.split_die(0)?;
        fill(nand, 42, 4, 1);
        nand.fail_writes(96, 0);

        die.handle_bad_block(nand, 42, 4, 1, OpKind::Write)?;

        assert_eq!(die.rsv.resolve(42), 98);
        assert_eq!(die.rsv.resolve(43), 99);
        assert!(die.rsv.bitmap.is_allocated(96));
        assert_eq!(nand.bad_marks(96)[0], (0, BadMark::Write));
        assert_eq!(nand.block_data(98).len(), 4 * 512);
        Ok(())
    }

    #[test]
    fn test_unmovable_sibling_releases_pair_block() -> Result<()> {
        let mut volume = formatted(BmlConfig::default());
        let (die, nand) = volume.split_die(0)?;

        die.handle_bad_block(nand, 43, 0, 1, OpKind::Erase)?;
        assert_eq!(die.rsv.resolve(43), 97);
        assert_eq!(die.rsv.resolve(42), 96);

        // 43 is mapped now, so it cannot tag along with 42 again
        die.handle_bad_block(nand, 42, 0, 1, OpKind::Erase)?;
        assert_eq!(die.rsv.resolve(42), 98);
        assert!(!die.rsv.bitmap.is_allocated(99));
        assert_eq!(die.rsv.resolve(43), 97);
        Ok(())
    }

    #[test]
    fn test_relock_failure_retires_new_block() -> Result<()> {
        let mut nand = SimNand::new(HYBRID_LAYOUT);
        nand.write_pi(0, PiRecord { slc_blocks: 100 }, false).unwrap();
        let mut volume = Volume::format(nand, BmlConfig::default(), Default::default())?;
        let (die, nand) = volume.split_die(0)?;

        fill(nand, 42, 3, 7);
        nand.set_lock(42, 1, LockState::Locked).unwrap();
        nand.fail_set_lock(96);

        die.handle_bad_block(nand, 42, 3, 1, OpKind::Write)?;

        assert_eq!(die.rsv.resolve(42), 98);
        assert!(nand.bad_marks(96).iter().any(|x| x.1 == BadMark::Lock));
        assert_eq!(nand.lock_state(98).unwrap(), LockState::Locked);
        assert_eq!(nand.lock_state(42).unwrap(), LockState::Locked);
        assert_eq!(nand.block_data(98).len(), 3 * 512);
        Ok(())
    }

    #[test]
    fn test_locked_candidate_is_unlocked_for_reuse() -> Result<()> {
        let mut nand = SimNand::new(HYBRID_LAYOUT);
        nand.write_pi(0, PiRecord { slc_blocks: 100 }, false).unwrap();
        let partitions =
            PartitionTable::new(vec![Partition::new(0, 40, 8).attr(PartitionAttr::Locked)])?;
        let mut volume = Volume::format(nand, BmlConfig::default(), partitions)?;
        let (die, nand) = volume.split_die(0)?;

        die.handle_bad_block(nand, 42, 0, 1, OpKind::Erase)?;
        assert_eq!(die.rsv.resolve(43), 97);
        assert!(die.rsv.bmi.is_candidate(43));
        assert_eq!(nand.lock_state(43).unwrap(), LockState::Locked);

        // Only the candidate is left
        for pbn in [95, 98, 99] {
            die.rsv.bitmap.mark_allocated(pbn);
        }
        die.handle_bad_block(nand, 50, 0, 1, OpKind::Erase)?;

        assert_eq!(die.rsv.resolve(50), 43);
        assert!(!die.rsv.bmi.is_candidate(43));
        assert_eq!(nand.lock_state(43).unwrap(), LockState::Unlocked);
        assert!(nand.block_data(43).is_erased());
        Ok(())
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut volume = formatted(BmlConfig::default());
        let (die, nand) = volume.split_die(0).unwrap();
        for pbn in die.rsv.sub_range(die.rsv.cell_type_of(42)) {
            die.rsv.bitmap.mark_allocated(pbn);
        }

        let err = die.handle_bad_block(nand, 42, 0, 1, OpKind::Erase).unwrap_err();
        assert!(matches!(err, BmlError::PoolExhausted { die: 0 }));
        assert!(nand.bad_marks(42).is_empty());
    }

    #[test]
    fn test_invalid_groups() {
        let mut volume = formatted(BmlConfig::default());
        let (die, nand) = volume.split_die(0).unwrap();

        // Crossing a plane group, or pointing into the reservoir
        assert!(die.handle_bad_block(nand, 43, 0, 2, OpKind::Erase).is_err());
        assert!(die.handle_bad_block(nand, 96, 0, 1, OpKind::Erase).is_err());
        assert!(die.handle_bad_block(nand, 0, 0, 1, OpKind::Erase).is_err());
        assert!(nand.block_data(96).is_erased());
    }
}
