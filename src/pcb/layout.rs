//! The on-media layout of meta-page units and of the previous-operation backup, with CRC
//! verification/computation.
//!
//! A meta-page unit is a run of 512-byte sectors, padded to whole pages and followed by an
//! all-zero confirm page:
//!
//! ```text
//! | header | PIA | ERL | bitmap | BMS x N | RCBS x M | padding | confirm page |
//! ```
//!
//! The header carries a CRC of its own and one over the body sectors (PIA through the last
//! RCBS). A unit is committed only once its confirm page reads back as all zeros.

use crc::{Crc, CRC_32_ISO_HDLC};
pub use deku::{DekuContainerRead, DekuContainerWrite};
use deku::prelude::*;

use crate::error::{BmlError, Result};
use crate::nand::{CellLayout, NandLayout};
use crate::partition::PartitionTable;
use crate::reservoir::bmi::Bmf;
use crate::reservoir::erl::{ErlEntry, MAX_ERL_ITEMS};
use crate::reservoir::{MetaBlocks, NO_BLOCK};

pub const PCB_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const PCB_VERSION: u8 = 1;

pub const SECTOR_SIZE: usize = 512;

/// Header, PIA, ERL and bitmap
const FIXED_SECTORS: usize = 4;

pub const BMF_PER_SECTOR: usize = 63;
pub const RCB_PER_SECTOR: usize = 127;

const UPCB_MAGIC: &[u8; 4] = b"UPCB";
const LPCB_MAGIC: &[u8; 4] = b"LPCB";
const PREV_MAGIC: &[u8; 4] = b"PREV";

/// Parsing headers from byteslices, with magic, version and CRC verification
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn magic_ok(&self) -> bool;
    fn get_hdr_version(&self) -> u8;

    fn parse(buf: &'a [u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((buf, 0)).ok()?;

        if !header.magic_ok() || header.get_hdr_version() != PCB_VERSION {
            return None;
        }

        if !header.check_crc() {
            return None;
        }

        Some(header)
    }
}

/// Computing the CRC of a header, which is always its last field
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        let header_bytes = self.to_bytes().unwrap_or_default();
        let header_len = header_bytes.len().saturating_sub(std::mem::size_of::<u32>());
        PCB_CRC.checksum(&header_bytes[..header_len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

/// Raw header sector of a meta-page unit
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct PcbHdr {
    magic: [u8; 4],
    version: u8,
    update_kind: u8,
    cell_layout: u8,
    padding: u8,

    pcb_age: u32,
    global_age: u32,

    upcb: u32,
    lpcb: u32,
    tpcb: u32,
    ref_block: u32,

    rsv_first: u32,
    rsv_last: u32,
    boundary: u32,

    unit_pages: u32,
    bms_sectors: u16,
    rcbs_sectors: u16,

    planes: u32,
    dies: u32,
    blocks_per_die: u32,
    blocks_per_device: u32,

    bmf_count: u32,
    rcb_count: u32,
    body_crc: u32,

    hdr_crc: u32,
}

impl ParseHeader<'_> for PcbHdr {
    fn magic_ok(&self) -> bool {
        &self.magic == UPCB_MAGIC || &self.magic == LPCB_MAGIC
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

impl ComputeCrc for PcbHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

/// Raw header page of a previous-operation backup in REF
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct PrevHdr {
    magic: [u8; 4],
    version: u8,
    padding: [u8; 3],
    sbn: u32,
    page: u32,
    len: u32,
    data_crc: u32,
    hdr_crc: u32,
}

impl ParseHeader<'_> for PrevHdr {
    fn magic_ok(&self) -> bool {
        &self.magic == PREV_MAGIC
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

impl ComputeCrc for PrevHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

/// The two roles of the metadata log
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PcbRole {
    /// Written for everything except changes to lock-tight partitions
    Unlockable,

    /// Written when the change concerns a lock-tight partition
    Lockable,
}

impl PcbRole {
    fn magic(self) -> &'static [u8; 4] {
        match self {
            PcbRole::Unlockable => UPCB_MAGIC,
            PcbRole::Lockable => LPCB_MAGIC,
        }
    }

    pub fn other(self) -> Self {
        match self {
            PcbRole::Unlockable => PcbRole::Lockable,
            PcbRole::Lockable => PcbRole::Unlockable,
        }
    }
}

/// Why a meta-page unit was written
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UpdateKind {
    Format,
    BadBlock,
    Refresh,
    Repartition,

    /// A PCB or REF block was replaced
    MetaBlock,

    /// Rewritten at mount to shed an unconfirmed unit
    Forced,
}

impl From<UpdateKind> for u8 {
    fn from(value: UpdateKind) -> Self {
        match value {
            UpdateKind::Format => 1,
            UpdateKind::BadBlock => 2,
            UpdateKind::Refresh => 3,
            UpdateKind::Repartition => 4,
            UpdateKind::MetaBlock => 5,
            UpdateKind::Forced => 6,
        }
    }
}

impl TryFrom<u8> for UpdateKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Format),
            2 => Ok(Self::BadBlock),
            3 => Ok(Self::Refresh),
            4 => Ok(Self::Repartition),
            5 => Ok(Self::MetaBlock),
            6 => Ok(Self::Forced),
            _ => Err(()),
        }
    }
}

/// Snapshot of the device geometry, checked for compatibility at mount
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    pub planes: u32,
    pub dies: u32,
    pub blocks_per_die: u32,
    pub blocks_per_device: u32,
}

impl From<&NandLayout> for Geometry {
    fn from(value: &NandLayout) -> Self {
        Self {
            planes: value.planes,
            dies: value.dies,
            blocks_per_die: value.blocks_per_die,
            blocks_per_device: value.blocks_per_device(),
        }
    }
}

/// How many sectors and pages a meta-page unit takes
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UnitShape {
    pub bms_sectors: u32,
    pub rcbs_sectors: u32,

    /// Pages holding sectors, not counting the confirm page
    pub data_pages: u32,
}

impl UnitShape {
    pub fn new(bytes_per_page: usize, bmf_capacity: usize, rcb_capacity: usize) -> Result<Self> {
        if bytes_per_page < SECTOR_SIZE || bytes_per_page % SECTOR_SIZE != 0 {
            return Err(BmlError::InvalidArgument(format!(
                "page size {bytes_per_page} is not a multiple of {SECTOR_SIZE}"
            )));
        }

        let bms_sectors = bmf_capacity.div_ceil(BMF_PER_SECTOR).max(1);
        let rcbs_sectors = rcb_capacity.div_ceil(RCB_PER_SECTOR).max(1);
        let sectors = FIXED_SECTORS + bms_sectors + rcbs_sectors;
        let data_pages = (sectors * SECTOR_SIZE).div_ceil(bytes_per_page);

        Ok(Self {
            bms_sectors: bms_sectors as u32,
            rcbs_sectors: rcbs_sectors as u32,
            data_pages: data_pages as u32,
        })
    }

    /// Pages of a whole unit, confirm page included
    pub fn unit_pages(&self) -> u32 {
        self.data_pages + 1
    }

    fn sectors(&self) -> usize {
        FIXED_SECTORS + self.bms_sectors as usize + self.rcbs_sectors as usize
    }
}

/// The fields of a meta-page unit header
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PcbHeader {
    pub role: PcbRole,

    /// Counts the units written for this role
    pub pcb_age: u32,

    /// Counts the units written for either role; the newest unit of a die wins at mount
    pub global_age: u32,
    pub kind: UpdateKind,
    pub meta: MetaBlocks,

    pub rsv_first: u32,
    pub rsv_last: u32,
    pub boundary: u32,
    pub cells: CellLayout,

    pub shape: UnitShape,
    pub geometry: Geometry,

    pub bmf_count: u32,
    pub rcb_count: u32,
    pub body_crc: u32,
}

impl PcbHeader {
    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        PcbHdr::parse(bytes).and_then(|x| x.try_into().ok())
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> Result<()> {
        let bytes = PcbHdr::from(self).to_bytes().map_err(deku_error)?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or_else(|| BmlError::Critical("header sector too small".into()))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl TryFrom<PcbHdr> for PcbHeader {
    type Error = ();

    fn try_from(value: PcbHdr) -> Result<Self, Self::Error> {
        let PcbHdr {
            magic,
            update_kind,
            cell_layout,
            pcb_age,
            global_age,
            upcb,
            lpcb,
            tpcb,
            ref_block,
            rsv_first,
            rsv_last,
            boundary,
            unit_pages,
            bms_sectors,
            rcbs_sectors,
            planes,
            dies,
            blocks_per_die,
            blocks_per_device,
            bmf_count,
            rcb_count,
            body_crc,
            ..
        } = value;

        let role = if &magic == UPCB_MAGIC {
            PcbRole::Unlockable
        } else {
            PcbRole::Lockable
        };

        Ok(Self {
            role,
            pcb_age,
            global_age,
            kind: update_kind.try_into()?,
            meta: MetaBlocks {
                upcb,
                lpcb,
                tpcb,
                ref_block,
            },
            rsv_first,
            rsv_last,
            boundary,
            cells: cell_layout.try_into()?,
            shape: UnitShape {
                bms_sectors: bms_sectors.into(),
                rcbs_sectors: rcbs_sectors.into(),
                data_pages: unit_pages.checked_sub(1).ok_or(())?,
            },
            geometry: Geometry {
                planes,
                dies,
                blocks_per_die,
                blocks_per_device,
            },
            bmf_count,
            rcb_count,
            body_crc,
        })
    }
}

impl From<PcbHeader> for PcbHdr {
    fn from(value: PcbHeader) -> PcbHdr {
        let PcbHeader {
            role,
            pcb_age,
            global_age,
            kind,
            meta,
            rsv_first,
            rsv_last,
            boundary,
            cells,
            shape,
            geometry,
            bmf_count,
            rcb_count,
            body_crc,
        } = value;

        let mut target = Self {
            magic: *role.magic(),
            version: PCB_VERSION,
            update_kind: kind.into(),
            cell_layout: cells.into(),
            padding: Default::default(),

            pcb_age,
            global_age,

            upcb: meta.upcb,
            lpcb: meta.lpcb,
            tpcb: meta.tpcb,
            ref_block: meta.ref_block,

            rsv_first,
            rsv_last,
            boundary,

            unit_pages: shape.unit_pages(),
            bms_sectors: shape.bms_sectors as u16,
            rcbs_sectors: shape.rcbs_sectors as u16,

            planes: geometry.planes,
            dies: geometry.dies,
            blocks_per_die: geometry.blocks_per_die,
            blocks_per_device: geometry.blocks_per_device,

            bmf_count,
            rcb_count,
            body_crc,

            hdr_crc: Default::default(),
        };

        target.fix_crc();
        target
    }
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct ErlRecord {
    sbn: u32,
    progress: u8,
    padding: [u8; 3],
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct ErlSectorHdr {
    count: u32,
    reserved: u32,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct BmsHdr {
    index: u16,
    count: u16,
    reserved: u32,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct BmfRecord {
    original: u32,
    replacement: u32,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct RcbsHdr {
    index: u16,
    count: u16,
}

const ERL_RECORD_SIZE: usize = 8;
const BMF_RECORD_SIZE: usize = 8;

fn deku_error(e: DekuError) -> BmlError {
    BmlError::Critical(format!("encoding metadata: {e}"))
}

/// Serialize `value` at the start of `out`, returning the number of bytes written
fn put<T: DekuContainerWrite>(out: &mut [u8], value: &T) -> Result<usize> {
    let bytes = value.to_bytes().map_err(deku_error)?;
    out.get_mut(..bytes.len())
        .ok_or_else(|| BmlError::Critical("metadata sector overflow".into()))?
        .copy_from_slice(&bytes);
    Ok(bytes.len())
}

/// Everything a meta-page unit holds
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MetaSnapshot {
    pub header: PcbHeader,
    pub partitions: PartitionTable,
    pub erl: Vec<Option<ErlEntry>>,
    pub bitmap: Vec<u8>,
    pub bmf: Vec<Bmf>,
    pub candidates: Vec<Option<u32>>,
}

impl MetaSnapshot {
    /// Lay out the unit's data pages; the header's counts and body CRC are filled in here
    pub fn encode(&self, bytes_per_page: usize) -> Result<Vec<u8>> {
        let shape = self.header.shape;
        let mut out = vec![0xFFu8; shape.data_pages as usize * bytes_per_page];
        if out.len() < shape.sectors() * SECTOR_SIZE {
            return Err(BmlError::Critical("meta-page unit shape too small".into()));
        }
        let mut sectors = out.chunks_exact_mut(SECTOR_SIZE);
        let mut next = || {
            sectors
                .next()
                .ok_or_else(|| BmlError::Critical("meta-page unit overflow".into()))
        };

        // The header goes in last, once the body CRC is known
        next()?;

        self.partitions.encode(next()?)?;

        let erl_sector = next()?;
        let count = self.erl.iter().flatten().count() as u32;
        let mut offset = put(erl_sector, &ErlSectorHdr { count, reserved: 0 })?;
        for slot in self.erl.iter().take(MAX_ERL_ITEMS) {
            let record = match slot {
                Some(entry) => ErlRecord {
                    sbn: entry.sbn,
                    progress: entry.progress.into(),
                    padding: [0; 3],
                },
                None => ErlRecord {
                    sbn: NO_BLOCK,
                    progress: 0xFF,
                    padding: [0xFF; 3],
                },
            };
            offset += put(&mut erl_sector[offset..], &record)?;
        }

        let bitmap_sector = next()?;
        bitmap_sector
            .get_mut(..self.bitmap.len())
            .ok_or_else(|| BmlError::Critical("allocation bitmap exceeds a sector".into()))?
            .copy_from_slice(&self.bitmap);

        let mut bmf = self.bmf.chunks(BMF_PER_SECTOR);
        for index in 0..shape.bms_sectors {
            let sector = next()?;
            let chunk = bmf.next().unwrap_or_default();
            let hdr = BmsHdr {
                index: index as u16,
                count: chunk.len() as u16,
                reserved: 0,
            };
            let mut offset = put(sector, &hdr)?;
            for x in chunk {
                let record = BmfRecord {
                    original: x.original,
                    replacement: x.replacement,
                };
                offset += put(&mut sector[offset..], &record)?;
            }
        }
        if bmf.next().is_some() {
            return Err(BmlError::Critical("indirection table exceeds its sectors".into()));
        }

        let mut rcb = self.candidates.chunks(RCB_PER_SECTOR);
        for index in 0..shape.rcbs_sectors {
            let sector = next()?;
            let chunk = rcb.next().unwrap_or_default();
            let hdr = RcbsHdr {
                index: index as u16,
                count: chunk.len() as u16,
            };
            let mut offset = put(sector, &hdr)?;
            for slot in chunk {
                let pbn = slot.unwrap_or(NO_BLOCK);
                sector[offset..offset + 4].copy_from_slice(&pbn.to_le_bytes());
                offset += 4;
            }
        }
        if rcb.next().is_some() {
            return Err(BmlError::Critical("candidate list exceeds its sectors".into()));
        }

        let body_end = shape.sectors() * SECTOR_SIZE;
        let header = PcbHeader {
            bmf_count: self.bmf.len() as u32,
            rcb_count: self.candidates.iter().flatten().count() as u32,
            body_crc: PCB_CRC.checksum(&out[SECTOR_SIZE..body_end]),
            ..self.header
        };
        header.encode(&mut out[..SECTOR_SIZE])?;

        Ok(out)
    }

    /// Parse a unit's data pages, given its already decoded header
    ///
    /// Returns `None` if the body does not match the header's CRC or does not parse.
    pub fn decode(header: PcbHeader, data: &[u8]) -> Option<Self> {
        let body_end = header.shape.sectors() * SECTOR_SIZE;
        let body = data.get(SECTOR_SIZE..body_end)?;
        if PCB_CRC.checksum(body) != header.body_crc {
            return None;
        }

        let mut sectors = data[..body_end].chunks_exact(SECTOR_SIZE).skip(1);

        let partitions = PartitionTable::decode(sectors.next()?)?;

        let erl_sector = sectors.next()?;
        let mut erl = Vec::with_capacity(MAX_ERL_ITEMS);
        let records = erl_sector.get(8..8 + MAX_ERL_ITEMS * ERL_RECORD_SIZE)?;
        for chunk in records.chunks_exact(ERL_RECORD_SIZE) {
            let (_, record) = ErlRecord::from_bytes((chunk, 0)).ok()?;
            erl.push(match record.sbn {
                NO_BLOCK => None,
                sbn => Some(ErlEntry {
                    sbn,
                    progress: record.progress.try_into().ok()?,
                }),
            });
        }

        let rsv_len = header.rsv_last.checked_sub(header.rsv_first)? + 1;
        let bitmap = sectors.next()?.get(..rsv_len.div_ceil(8) as usize)?.to_vec();

        let mut bmf = Vec::with_capacity(header.bmf_count as usize);
        for _ in 0..header.shape.bms_sectors {
            let sector = sectors.next()?;
            let (_, hdr) = BmsHdr::from_bytes((sector, 0)).ok()?;
            let records = sector.get(8..8 + hdr.count as usize * BMF_RECORD_SIZE)?;
            for chunk in records.chunks_exact(BMF_RECORD_SIZE) {
                let (_, record) = BmfRecord::from_bytes((chunk, 0)).ok()?;
                bmf.push(Bmf {
                    original: record.original,
                    replacement: record.replacement,
                });
            }
        }
        if bmf.len() != header.bmf_count as usize {
            return None;
        }

        let mut candidates = Vec::new();
        for _ in 0..header.shape.rcbs_sectors {
            let sector = sectors.next()?;
            let (_, hdr) = RcbsHdr::from_bytes((sector, 0)).ok()?;
            let records = sector.get(4..4 + hdr.count as usize * 4)?;
            for chunk in records.chunks_exact(4) {
                let pbn = u32::from_le_bytes(chunk.try_into().ok()?);
                candidates.push((pbn != NO_BLOCK).then_some(pbn));
            }
        }

        Some(Self {
            header,
            partitions,
            erl,
            bitmap,
            bmf,
            candidates,
        })
    }
}

/// The page that commits a meta-page unit
pub fn confirm_page(bytes_per_page: usize) -> Vec<u8> {
    vec![0u8; bytes_per_page]
}

/// Header of data backed up into REF on behalf of the layer above
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PrevOpHeader {
    /// The semi-physical block the data was being written to
    pub sbn: u32,
    pub page: u32,

    /// Length of the backed-up data, in bytes
    pub len: u32,
    pub data_crc: u32,
}

impl PrevOpHeader {
    pub fn new(sbn: u32, page: u32, data: &[u8]) -> Self {
        Self {
            sbn,
            page,
            len: data.len() as u32,
            data_crc: PCB_CRC.checksum(data),
        }
    }

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let hdr = PrevHdr::parse(bytes)?;
        Some(Self {
            sbn: hdr.sbn,
            page: hdr.page,
            len: hdr.len,
            data_crc: hdr.data_crc,
        })
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> Result<()> {
        let mut hdr = PrevHdr {
            magic: *PREV_MAGIC,
            version: PCB_VERSION,
            padding: Default::default(),
            sbn: self.sbn,
            page: self.page,
            len: self.len,
            data_crc: self.data_crc,
            hdr_crc: Default::default(),
        };
        hdr.fix_crc();
        put(out_bytes, &hdr).map(|_| ())
    }

    /// Does `data` match what this header describes?
    pub fn check_data(&self, data: &[u8]) -> bool {
        data.len() == self.len as usize && PCB_CRC.checksum(data) == self.data_crc
    }
}
