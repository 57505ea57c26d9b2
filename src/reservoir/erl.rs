//! The erase-refresh list (ERL): blocks whose reads reported disturbance, waiting to be cured
//! by an erase and rewrite.

/// Number of slots in the list
pub const MAX_ERL_ITEMS: usize = 60;

/// How far the refresh of a tracked block has gotten
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RefreshProgress {
    /// Tracked, not yet touched
    Updated,

    /// A full copy of the block is in the REF block; the block itself may already be erased
    Copied,
}

impl From<RefreshProgress> for u8 {
    fn from(value: RefreshProgress) -> Self {
        match value {
            RefreshProgress::Updated => 1,
            RefreshProgress::Copied => 2,
        }
    }
}

impl TryFrom<u8> for RefreshProgress {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Updated),
            2 => Ok(Self::Copied),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ErlEntry {
    pub sbn: u32,
    pub progress: RefreshProgress,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AddOutcome {
    Added,
    AlreadyTracked,
    Full,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EraseRefreshList {
    slots: Vec<Option<ErlEntry>>,
    count: usize,

    /// Entries added since the list was last written to the metadata log; never persisted
    pending: usize,
}

impl Default for EraseRefreshList {
    fn default() -> Self {
        Self::new()
    }
}

impl EraseRefreshList {
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAX_ERL_ITEMS],
            count: 0,
            pending: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == MAX_ERL_ITEMS
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn clear_pending(&mut self) {
        self.pending = 0;
    }

    fn position(&self, sbn: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|x| x.is_some_and(|e| e.sbn == sbn))
    }

    pub fn contains(&self, sbn: u32) -> bool {
        self.position(sbn).is_some()
    }

    pub fn get(&self, sbn: u32) -> Option<ErlEntry> {
        self.position(sbn).and_then(|i| self.slots[i])
    }

    /// Tracked entries, in list order
    pub fn iter(&self) -> impl Iterator<Item = &ErlEntry> + '_ {
        self.slots.iter().flatten()
    }

    /// Raw slots, gaps included, for snapshots
    pub fn slots(&self) -> &[Option<ErlEntry>] {
        &self.slots
    }

    /// Start tracking `sbn`
    pub fn add(&mut self, sbn: u32) -> AddOutcome {
        if self.contains(sbn) {
            return AddOutcome::AlreadyTracked;
        }
        if self.is_full() {
            return AddOutcome::Full;
        }

        // Append after the last used slot, closing gaps first if the tail is taken
        let mut tail = self.slots.iter().rposition(Option::is_some).map_or(0, |i| i + 1);
        if tail == MAX_ERL_ITEMS {
            self.compact();
            tail = self.count;
        }

        self.slots[tail] = Some(ErlEntry {
            sbn,
            progress: RefreshProgress::Updated,
        });
        self.count += 1;
        self.pending += 1;
        AddOutcome::Added
    }

    /// Stop tracking `sbn` and close the gap it leaves
    pub fn remove(&mut self, sbn: u32) -> bool {
        let removed = self.remove_leave_gap(sbn);
        if removed {
            self.compact();
        }
        removed
    }

    /// Stop tracking `sbn`, leaving its slot empty until the next [Self::compact]
    pub fn remove_leave_gap(&mut self, sbn: u32) -> bool {
        match self.position(sbn) {
            Some(i) => {
                self.slots[i] = None;
                self.count -= 1;
                true
            }
            None => false,
        }
    }

    /// Move all entries to the front, preserving their order
    pub fn compact(&mut self) {
        let mut entries: Vec<Option<ErlEntry>> =
            self.slots.iter().filter(|x| x.is_some()).copied().collect();
        entries.resize(MAX_ERL_ITEMS, None);
        self.slots = entries;
    }

    pub fn set_progress(&mut self, sbn: u32, progress: RefreshProgress) -> bool {
        match self.position(sbn) {
            Some(i) => {
                self.slots[i] = Some(ErlEntry { sbn, progress });
                true
            }
            None => false,
        }
    }

    /// The entry whose refresh was interrupted after its content reached REF, if any
    pub fn find_copied(&self) -> Option<ErlEntry> {
        self.iter()
            .find(|x| x.progress == RefreshProgress::Copied)
            .copied()
    }

    /// Restore the list from a metadata snapshot
    pub fn load(&mut self, slots: &[Option<ErlEntry>]) {
        self.slots.fill(None);
        let n = std::cmp::min(slots.len(), MAX_ERL_ITEMS);
        self.slots[..n].copy_from_slice(&slots[..n]);
        self.count = self.slots.iter().flatten().count();
        self.pending = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_add_twice() {
        let mut erl = EraseRefreshList::new();
        assert_eq!(erl.add(7), AddOutcome::Added);
        assert_eq!(erl.add(7), AddOutcome::AlreadyTracked);
        assert_eq!(erl.len(), 1);
        assert_eq!(erl.pending(), 1);
    }

    #[test]
    fn test_gaps_and_order() {
        let mut erl = EraseRefreshList::new();
        for sbn in [5, 6, 7, 8] {
            erl.add(sbn);
        }

        assert!(erl.remove_leave_gap(6));
        assert_eq!(erl.len(), 3);
        assert_eq!(erl.slots()[1], None);

        erl.add(9);
        let order: Vec<u32> = erl.iter().map(|x| x.sbn).collect();
        assert_eq!(order, [5, 7, 8, 9]);

        assert!(erl.remove(7));
        assert_eq!(erl.slots()[1].map(|x| x.sbn), Some(8));
        assert!(!erl.remove(7));
    }

    #[test]
    fn test_progress() {
        let mut erl = EraseRefreshList::new();
        erl.add(3);
        erl.add(4);
        assert_eq!(erl.find_copied(), None);

        erl.set_progress(4, RefreshProgress::Copied);
        assert_eq!(
            erl.find_copied(),
            Some(ErlEntry {
                sbn: 4,
                progress: RefreshProgress::Copied
            })
        );
    }

    #[test]
    fn test_full_list_with_gaps_compacts() {
        let mut erl = EraseRefreshList::new();
        for sbn in 0..MAX_ERL_ITEMS as u32 {
            erl.add(sbn);
        }
        erl.remove_leave_gap(0);

        assert_eq!(erl.add(1000), AddOutcome::Added);
        assert_eq!(erl.iter().last().map(|x| x.sbn), Some(1000));
        assert_eq!(erl.iter().next().map(|x| x.sbn), Some(1));
    }

    proptest! {
        #[test]
        fn capacity_is_never_exceeded(blocks in proptest::collection::vec(0u32..200, 0..300)) {
            let mut erl = EraseRefreshList::new();
            let mut first = Vec::new();

            for sbn in blocks {
                let before = erl.len();
                match erl.add(sbn) {
                    AddOutcome::Added => {
                        prop_assert_eq!(erl.len(), before + 1);
                        first.push(sbn);
                    }
                    AddOutcome::AlreadyTracked => prop_assert!(first.contains(&sbn)),
                    AddOutcome::Full => prop_assert_eq!(before, MAX_ERL_ITEMS),
                }
                prop_assert!(erl.len() <= MAX_ERL_ITEMS);
            }

            let tracked: Vec<u32> = erl.iter().map(|x| x.sbn).collect();
            prop_assert_eq!(tracked, first);
            prop_assert_eq!(erl.slots().iter().flatten().count(), erl.len());
        }
    }
}
