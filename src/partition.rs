//! Partitions of the semi-physical block space, and their hardware lock attributes.
//!
//! Parsing a partition table out of some boot record is the caller's business; this layer only
//! keeps a copy of it (the PIA sector of every meta-page unit) so that it knows which blocks
//! are locked, and so that a repartition can be checked against the current layout.

use deku::prelude::*;

use crate::error::{BmlError, Result};
use crate::nand::LockState;

/// Partitions that fit in one PIA sector
pub const MAX_PARTITIONS: usize = 31;

/// The lock attribute of a partition
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum PartitionAttr {
    #[default]
    ReadWrite,
    Locked,
    LockTight,
}

impl From<PartitionAttr> for LockState {
    fn from(value: PartitionAttr) -> Self {
        match value {
            PartitionAttr::ReadWrite => LockState::Unlocked,
            PartitionAttr::Locked => LockState::Locked,
            PartitionAttr::LockTight => LockState::LockTight,
        }
    }
}

impl From<PartitionAttr> for u8 {
    fn from(value: PartitionAttr) -> Self {
        match value {
            PartitionAttr::ReadWrite => 0,
            PartitionAttr::Locked => 1,
            PartitionAttr::LockTight => 2,
        }
    }
}

impl TryFrom<u8> for PartitionAttr {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ReadWrite),
            1 => Ok(Self::Locked),
            2 => Ok(Self::LockTight),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Partition {
    pub id: u32,

    /// First semi-physical block
    pub first: u32,
    pub blocks: u32,
    pub attr: PartitionAttr,
}

impl Partition {
    pub fn new(id: u32, first: u32, blocks: u32) -> Self {
        Self {
            id,
            first,
            blocks,
            attr: PartitionAttr::ReadWrite,
        }
    }

    pub fn attr(mut self, attr: PartitionAttr) -> Self {
        self.attr = attr;
        self
    }

    pub fn contains(&self, sbn: u32) -> bool {
        sbn >= self.first && sbn - self.first < self.blocks
    }

    fn end(&self) -> u64 {
        u64::from(self.first) + u64::from(self.blocks)
    }
}

/// On-media form of a [Partition]
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct PartRecord {
    id: u32,
    attr: u8,
    padding: [u8; 3],
    first: u32,
    blocks: u32,
}

/// On-media header of the PIA sector
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct PiaHeader {
    count: u32,
    reserved: u32,
}

const PART_RECORD_SIZE: usize = 16;
const PIA_HEADER_SIZE: usize = 8;

#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct PartitionTable {
    parts: Vec<Partition>,
}

impl PartitionTable {
    /// Build a table, rejecting overlapping or excess partitions
    pub fn new(mut parts: Vec<Partition>) -> Result<Self> {
        if parts.len() > MAX_PARTITIONS {
            return Err(BmlError::InvalidArgument(format!(
                "{} partitions, at most {MAX_PARTITIONS} supported",
                parts.len()
            )));
        }

        parts.sort_by_key(|x| x.first);
        for pair in parts.windows(2) {
            if pair[0].end() > u64::from(pair[1].first) {
                return Err(BmlError::InvalidArgument(format!(
                    "partitions {} and {} overlap",
                    pair[0].id, pair[1].id
                )));
            }
        }

        Ok(Self { parts })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> + '_ {
        self.parts.iter()
    }

    pub fn find(&self, sbn: u32) -> Option<&Partition> {
        self.parts.iter().find(|x| x.contains(sbn))
    }

    pub fn attr_of(&self, sbn: u32) -> PartitionAttr {
        self.find(sbn).map_or(PartitionAttr::ReadWrite, |x| x.attr)
    }

    pub fn is_lock_tight(&self, sbn: u32) -> bool {
        self.attr_of(sbn) == PartitionAttr::LockTight
    }

    /// Check that `new` keeps every locked partition exactly where it is, and adds none
    pub fn check_compatible(&self, new: &PartitionTable) -> Result<()> {
        let locked = |table: &PartitionTable| -> Vec<Partition> {
            table
                .parts
                .iter()
                .filter(|x| x.attr != PartitionAttr::ReadWrite)
                .copied()
                .collect()
        };

        let (old_locked, new_locked) = (locked(self), locked(new));
        for part in old_locked.iter().chain(new_locked.iter()) {
            let same = |x: &Partition| {
                (x.first, x.blocks, x.attr) == (part.first, part.blocks, part.attr)
            };
            if !old_locked.iter().any(same) || !new_locked.iter().any(same) {
                return Err(BmlError::PartitionMismatch { id: part.id });
            }
        }

        Ok(())
    }

    /// Write the table into a PIA sector
    pub fn encode(&self, sector: &mut [u8]) -> Result<()> {
        let mut bytes = PiaHeader {
            count: self.parts.len() as u32,
            reserved: 0,
        }
        .to_bytes()
        .map_err(|e| BmlError::Critical(e.to_string()))?;

        for part in &self.parts {
            let record = PartRecord {
                id: part.id,
                attr: part.attr.into(),
                padding: [0; 3],
                first: part.first,
                blocks: part.blocks,
            };
            bytes.extend(record.to_bytes().map_err(|e| BmlError::Critical(e.to_string()))?);
        }

        let out = sector
            .get_mut(..bytes.len())
            .ok_or_else(|| BmlError::Critical("PIA sector too small".into()))?;
        out.copy_from_slice(&bytes);
        Ok(())
    }

    /// Read a table back from a PIA sector
    pub fn decode(sector: &[u8]) -> Option<Self> {
        let (_, header) = PiaHeader::from_bytes((sector, 0)).ok()?;
        let count = header.count as usize;
        if count > MAX_PARTITIONS {
            return None;
        }

        let records = sector.get(PIA_HEADER_SIZE..PIA_HEADER_SIZE + count * PART_RECORD_SIZE)?;
        let mut parts = Vec::with_capacity(count);
        for chunk in records.chunks_exact(PART_RECORD_SIZE) {
            let (_, record) = PartRecord::from_bytes((chunk, 0)).ok()?;
            parts.push(Partition {
                id: record.id,
                first: record.first,
                blocks: record.blocks,
                attr: record.attr.try_into().ok()?,
            });
        }

        Self::new(parts).ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table() -> PartitionTable {
        PartitionTable::new(vec![
            Partition::new(1, 0, 10).attr(PartitionAttr::LockTight),
            Partition::new(2, 10, 20).attr(PartitionAttr::Locked),
            Partition::new(3, 30, 50),
        ])
        .unwrap()
    }

    #[test]
    fn test_lookup() {
        let table = table();
        assert_eq!(table.find(15).map(|x| x.id), Some(2));
        assert!(table.is_lock_tight(9));
        assert!(!table.is_lock_tight(10));
        assert_eq!(table.attr_of(500), PartitionAttr::ReadWrite);
    }

    #[test]
    fn test_overlap_rejected() {
        let parts = vec![Partition::new(1, 0, 10), Partition::new(2, 9, 5)];
        assert!(PartitionTable::new(parts).is_err());
    }

    #[test]
    fn test_compatibility() {
        let old = table();

        // Resizing an unlocked partition is fine
        let resized = PartitionTable::new(vec![
            Partition::new(1, 0, 10).attr(PartitionAttr::LockTight),
            Partition::new(2, 10, 20).attr(PartitionAttr::Locked),
            Partition::new(3, 30, 20),
            Partition::new(4, 50, 30),
        ])
        .unwrap();
        assert!(old.check_compatible(&resized).is_ok());

        // Moving a locked one is not
        let moved = PartitionTable::new(vec![
            Partition::new(1, 0, 12).attr(PartitionAttr::LockTight),
            Partition::new(2, 12, 18).attr(PartitionAttr::Locked),
        ])
        .unwrap();
        assert!(matches!(
            old.check_compatible(&moved),
            Err(BmlError::PartitionMismatch { id: 1 })
        ));

        // Nor is locking a new range
        let locked = PartitionTable::new(vec![
            Partition::new(1, 0, 10).attr(PartitionAttr::LockTight),
            Partition::new(2, 10, 20).attr(PartitionAttr::Locked),
            Partition::new(3, 30, 50).attr(PartitionAttr::Locked),
        ])
        .unwrap();
        assert!(matches!(
            old.check_compatible(&locked),
            Err(BmlError::PartitionMismatch { id: 3 })
        ));
    }

    #[test]
    fn test_encode() -> Result<()> {
        let table = table();
        let mut sector = vec![0xFFu8; 512];
        table.encode(&mut sector)?;
        assert_eq!(PartitionTable::decode(&sector), Some(table));
        Ok(())
    }
}
