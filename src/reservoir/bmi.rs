//! The block indirection table (BMI): semi-physical to physical block mappings (BMFs), plus the
//! list of reservoir candidates (RCBs).
//!
//! Resolution is single-hop. A replacement that later fails itself is handled by rewriting the
//! original's entry to the newest replacement, and recording the retired replacement as an
//! entry of its own (`old replacement -> new replacement`) so that the failed block stays
//! accounted for.

use tracing::{debug, warn};

use super::Reservoir;
use crate::error::{BmlError, Result};

/// A single indirection entry
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Bmf {
    pub original: u32,
    pub replacement: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IndirectionTable {
    /// Kept sorted by `original`
    entries: Vec<Bmf>,
    capacity: usize,

    /// Fixed number of slots; `None` is an empty slot
    candidates: Vec<Option<u32>>,
}

impl IndirectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            candidates: vec![None; capacity / 2],
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn candidate_capacity(&self) -> usize {
        self.candidates.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Bmf] {
        &self.entries
    }

    fn position(&self, original: u32) -> Option<usize> {
        self.entries.iter().position(|x| x.original == original)
    }

    pub fn lookup(&self, original: u32) -> Option<Bmf> {
        self.position(original).map(|i| self.entries[i])
    }

    /// Find the physical block currently holding `original`; unmapped blocks are their own
    /// physical block
    pub fn resolve(&self, original: u32) -> u32 {
        self.lookup(original).map_or(original, |x| x.replacement)
    }

    /// Is `pbn` the replacement target of any entry?
    pub fn is_replacement(&self, pbn: u32) -> bool {
        self.entries.iter().any(|x| x.replacement == pbn)
    }

    pub fn candidates(&self) -> impl Iterator<Item = u32> + '_ {
        self.candidates.iter().flatten().copied()
    }

    pub fn candidate_slots(&self) -> &[Option<u32>] {
        &self.candidates
    }

    pub fn is_candidate(&self, pbn: u32) -> bool {
        self.candidates().any(|x| x == pbn)
    }

    /// Returns `false` if the list is full
    pub fn insert_candidate(&mut self, pbn: u32) -> bool {
        if self.is_candidate(pbn) {
            return true;
        }
        match self.candidates.iter_mut().find(|x| x.is_none()) {
            Some(slot) => {
                *slot = Some(pbn);
                true
            }
            None => false,
        }
    }

    /// Clear the candidate slot holding `pbn`, if there is one
    pub fn delete_candidate(&mut self, pbn: u32) -> bool {
        match self.candidates.iter_mut().find(|x| **x == Some(pbn)) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    fn sort(&mut self) {
        self.entries.sort_unstable_by_key(|x| x.original);
    }

    /// Restore the table from a metadata snapshot
    pub fn load(&mut self, entries: Vec<Bmf>, candidates: &[Option<u32>]) -> Result<()> {
        if entries.len() > self.capacity || candidates.len() > self.candidates.len() {
            return Err(BmlError::Incompatible(format!(
                "snapshot holds {} entries, table holds {}",
                entries.len(),
                self.capacity
            )));
        }

        self.entries = entries;
        self.sort();
        self.candidates.fill(None);
        self.candidates[..candidates.len()].copy_from_slice(candidates);
        Ok(())
    }
}

impl Reservoir {
    /// Record that `original` now lives in `replacement`
    ///
    /// `candidate` is a still-good block vacated by paired replacement; it joins the candidate
    /// list. If `replacement` was itself a candidate, it leaves the list.
    pub fn register(
        &mut self,
        original: u32,
        replacement: u32,
        candidate: Option<u32>,
    ) -> Result<()> {
        let overflow = BmlError::TableOverflow {
            die: self.die,
            capacity: self.bmi.capacity,
        };

        match self.bmi.position(original) {
            None => {
                if self.bmi.len() + 1 > self.bmi.capacity {
                    return Err(overflow);
                }
                self.bmi.entries.push(Bmf {
                    original,
                    replacement,
                });
            }

            Some(i) => {
                let old = self.bmi.entries[i].replacement;
                self.bmi.entries[i].replacement = replacement;

                // A failed reservoir block keeps an entry of its own, so it is never handed out
                // again. A failed candidate lives outside the reservoir, and only needs the
                // rewrite above.
                if self.contains(old) && old != replacement {
                    debug!(die = self.die, original, old, replacement, "re-replacement");
                    match self.bmi.position(old) {
                        Some(j) => self.bmi.entries[j].replacement = replacement,
                        None => {
                            if self.bmi.len() + 1 > self.bmi.capacity {
                                return Err(overflow);
                            }
                            self.bmi.entries.push(Bmf {
                                original: old,
                                replacement,
                            });
                        }
                    }
                    self.bitmap.mark_allocated(old);
                }
            }
        }

        self.bitmap.mark_allocated(replacement);
        if !self.contains(replacement) {
            self.bmi.delete_candidate(replacement);
        }

        if let Some(candidate) = candidate {
            if !self.bmi.insert_candidate(candidate) {
                warn!(die = self.die, candidate, "candidate list full, block not reusable");
            }
        }

        self.bmi.sort();
        Ok(())
    }

    /// Physical block currently holding semi-physical block `sbn`
    pub fn resolve(&self, sbn: u32) -> u32 {
        self.bmi.resolve(sbn)
    }
}

#[cfg(test)]
mod test {
    use super::super::test::hybrid_reservoir;
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_register_and_resolve() -> Result<()> {
        let mut rsv = hybrid_reservoir();

        rsv.register(50, 96, None)?;
        rsv.register(20, 97, None)?;
        assert_eq!(rsv.resolve(50), 96);
        assert_eq!(rsv.resolve(20), 97);
        assert_eq!(rsv.resolve(21), 21);

        let originals: Vec<u32> = rsv.bmi.entries().iter().map(|x| x.original).collect();
        assert_eq!(originals, [20, 50]);
        assert!(rsv.bitmap.is_allocated(96));
        assert!(rsv.bitmap.is_allocated(97));

        Ok(())
    }

    #[test]
    fn test_re_replacement() -> Result<()> {
        let mut rsv = hybrid_reservoir();

        rsv.register(50, 96, None)?;
        rsv.register(50, 98, None)?;

        assert_eq!(rsv.resolve(50), 98);
        assert_eq!(rsv.bmi.lookup(96), Some(Bmf { original: 96, replacement: 98 }));
        assert_eq!(rsv.bmi.len(), 2);
        assert!(rsv.bitmap.is_allocated(96));

        Ok(())
    }

    #[test]
    fn test_candidates() -> Result<()> {
        let mut rsv = hybrid_reservoir();

        // 42 failed, its sibling 43 moved along with it
        rsv.register(42, 96, None)?;
        rsv.register(43, 97, Some(43))?;
        assert!(rsv.bmi.is_candidate(43));

        // The candidate is later consumed as a replacement
        rsv.register(10, 43, None)?;
        assert!(!rsv.bmi.is_candidate(43));
        assert_eq!(rsv.resolve(10), 43);

        // ... and fails in turn: the old target is outside the reservoir, so only the entry of
        // 10 is rewritten
        rsv.register(10, 98, None)?;
        assert_eq!(rsv.resolve(10), 98);
        assert_eq!(rsv.resolve(43), 97);
        assert_eq!(rsv.bmi.len(), 3);

        Ok(())
    }

    #[test]
    fn test_overflow() {
        let mut rsv = hybrid_reservoir();
        let capacity = rsv.bmi.capacity() as u32;

        for sbn in 0..capacity {
            rsv.register(sbn, 200 + sbn, None).unwrap();
        }
        assert!(matches!(
            rsv.register(capacity, 92, None),
            Err(BmlError::TableOverflow { .. })
        ));
    }

    #[test]
    fn test_candidate_slots() {
        let mut table = IndirectionTable::new(4);
        assert_eq!(table.candidate_capacity(), 2);
        assert!(table.insert_candidate(7));
        assert!(table.insert_candidate(9));
        assert!(!table.insert_candidate(11));
        assert!(table.delete_candidate(7));
        assert!(table.insert_candidate(11));
        assert_eq!(table.candidate_slots(), &[Some(11), Some(9)]);
    }

    proptest! {
        #[test]
        fn live_entries_stay_exclusive(failures in proptest::collection::vec(0u32..40, 1..12)) {
            let mut rsv = hybrid_reservoir();
            let mut next = rsv.first;

            for sbn in failures {
                if next > rsv.last {
                    break;
                }
                rsv.register(sbn, next, None).unwrap();
                next += 1;

                // Resolution is a pure function of the table
                prop_assert_eq!(rsv.resolve(sbn), rsv.resolve(sbn));
            }

            let live: Vec<u32> = rsv
                .bmi
                .entries()
                .iter()
                .filter(|x| !rsv.contains(x.original))
                .map(|x| x.replacement)
                .collect();
            let mut unique = live.clone();
            unique.sort_unstable();
            unique.dedup();
            prop_assert_eq!(unique.len(), live.len());

            for bmf in rsv.bmi.entries() {
                prop_assert!(rsv.bitmap.is_allocated(bmf.replacement));
            }
            let sorted = rsv.bmi.entries().windows(2).all(|w| w[0].original < w[1].original);
            prop_assert!(sorted);
        }
    }
}
