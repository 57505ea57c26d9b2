//! NAND abstraction layer implementation over the Linux MTD subsystem
//!
//! MTD does not expose SLC/MLC partitioning, so an `MtdNand` always presents a single-die,
//! single-plane, SLC-only device whose PI record covers the whole die.

use super::{
    BadMark, BlockInfo, CellLayout, CellType, LockState, Nand, NandLayout, PiRecord, ReadStatus,
};
use crate::error::NandError;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

use tracing::debug;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, layout })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        anyhow::bail!("MTD device {name} could not be found");
    }

    /// Compute the number of bytes in a block
    fn block_size(&self) -> u32 {
        self.layout.pages_per_block * self.layout.bytes_per_page as u32
    }

    /// Ensure that the block and page are in range, and compute the /dev/mtdX offset for the page
    fn offset_for(&self, pbn: u32, page: u32, bytes: usize) -> Result<u64, NandError> {
        if pbn >= self.layout.blocks_per_device() {
            return Err(NandError::OutOfRange(pbn));
        }
        if bytes != self.layout.bytes_per_page {
            return Err(NandError::Unsupported("buffer not page-sized"));
        }
        if page >= self.layout.pages_per_block {
            return Err(NandError::Unsupported("page index out of bounds"));
        }

        Ok(u64::from(self.block_size()) * u64::from(pbn)
            + (self.layout.bytes_per_page as u64) * u64::from(page))
    }

    fn erase_info(&self, pbn: u32, count: u32) -> Result<ioctl::erase_info_user, NandError> {
        erase_range(self.block_size(), pbn, count)
    }
}

/// The byte range of `count` blocks from `pbn`, as the 32-bit erase ioctls take it
fn erase_range(block_size: u32, pbn: u32, count: u32) -> Result<ioctl::erase_info_user, NandError> {
    let start = u64::from(block_size) * u64::from(pbn);
    let length = u64::from(block_size) * u64::from(count);
    Ok(ioctl::erase_info_user {
        start: u32::try_from(start).map_err(|_| NandError::OutOfRange(pbn))?,
        length: u32::try_from(length).map_err(|_| NandError::OutOfRange(pbn))?,
    })
}

impl Nand for MtdNand {
    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn block_info(&self, pbn: u32) -> Result<BlockInfo, NandError> {
        if pbn >= self.layout.blocks_per_device() {
            return Err(NandError::OutOfRange(pbn));
        }
        Ok(BlockInfo {
            cell: CellType::Slc,
            pages: self.layout.pages_per_block,
        })
    }

    fn read_page(&mut self, pbn: u32, page: u32, data: &mut [u8]) -> Result<ReadStatus, NandError> {
        let offset = self.offset_for(pbn, page, data.len())?;
        match self.file.read_exact_at(data, offset) {
            Ok(()) => Ok(ReadStatus::Clean),

            // EUCLEAN: corrected bitflips above the ECC threshold
            Err(e) if e.raw_os_error() == Some(nix::libc::EUCLEAN) => Ok(ReadStatus::Disturbed),
            Err(e) if e.raw_os_error() == Some(nix::libc::EBADMSG) => {
                Err(NandError::UncorrectableRead { pbn, page })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_page(&mut self, pbn: u32, page: u32, data: &[u8]) -> Result<(), NandError> {
        let offset = self.offset_for(pbn, page, data.len())?;
        self.file.write_all_at(data, offset).map_err(|e| {
            debug!(pbn, page, error = %e, "MTD write failed");
            NandError::Write { pbn, page }
        })
    }

    fn erase_block(&mut self, pbn: u32) -> Result<(), NandError> {
        if pbn >= self.layout.blocks_per_device() {
            return Err(NandError::OutOfRange(pbn));
        }
        let erase_info = self.erase_info(pbn, 1)?;
        unsafe { ioctl::memerase(self.file.as_raw_fd(), &erase_info) }.map_err(|e| {
            debug!(pbn, error = %e, "MTD erase failed");
            NandError::Erase { pbn }
        })?;
        Ok(())
    }

    fn check_factory_bad(&mut self, pbn: u32) -> Result<u8, NandError> {
        if pbn >= self.layout.blocks_per_device() {
            return Err(NandError::OutOfRange(pbn));
        }
        let block_base = u64::from(self.block_size()) * u64::from(pbn);
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base)? };
        Ok(u8::from(bad != 0))
    }

    /// MTD owns the marker format, so any mark on any page becomes MEMSETBADBLOCK
    fn write_bad_mark(&mut self, pbn: u32, _page: u32, _mark: BadMark) -> Result<(), NandError> {
        let block_base = u64::from(self.block_size()) * u64::from(pbn);
        unsafe {
            ioctl::memsetbadblock(self.file.as_raw_fd(), &block_base)?;
        }
        Ok(())
    }

    fn lock_state(&mut self, pbn: u32) -> Result<LockState, NandError> {
        let mut erase_info = self.erase_info(pbn, 1)?;
        let locked = unsafe { ioctl::memislocked(self.file.as_raw_fd(), &mut erase_info)? };
        Ok(match locked {
            0 => LockState::Unlocked,
            _ => LockState::Locked,
        })
    }

    fn set_lock(&mut self, pbn: u32, count: u32, state: LockState) -> Result<(), NandError> {
        let erase_info = self.erase_info(pbn, count)?;
        unsafe {
            match state {
                LockState::Unlocked => ioctl::memunlock(self.file.as_raw_fd(), &erase_info)?,
                LockState::Locked => ioctl::memlock(self.file.as_raw_fd(), &erase_info)?,
                LockState::LockTight => {
                    return Err(NandError::Unsupported("MTD has no lock-tight"))
                }
            };
        }
        Ok(())
    }

    fn read_pi(&mut self, die: u32) -> Result<PiRecord, NandError> {
        if die != 0 {
            return Err(NandError::OutOfRange(die));
        }
        Ok(PiRecord {
            slc_blocks: self.layout.blocks_per_die,
        })
    }

    fn write_pi(&mut self, die: u32, pi: PiRecord, _lock: bool) -> Result<(), NandError> {
        if self.read_pi(die)? != pi {
            return Err(NandError::Unsupported("MTD cannot move the SLC/MLC boundary"));
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::{CellLayout, NandLayout};

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(mut self) -> anyhow::Result<NandLayout> {
            if self.writesize == 1 {
                // Hack for debugging on mtdram devices
                self.writesize = 512;
            }

            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            Ok(NandLayout {
                dies: 1,
                planes: 1,
                blocks_per_die: self.size / self.erasesize,
                pages_per_block: self.erasesize / self.writesize,
                bytes_per_page: self.writesize as usize,
                cells: CellLayout::SlcOnly,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);
    ioctl_write_ptr!(memlock, MTD_IOC_MAGIC, 5, erase_info_user);
    ioctl_write_ptr!(memunlock, MTD_IOC_MAGIC, 6, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);
    ioctl_read!(memislocked, MTD_IOC_MAGIC, 23, erase_info_user);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_erase_range() {
        let info = erase_range(128 * 1024, 3, 2).unwrap();
        assert_eq!((info.start, info.length), (3 * 128 * 1024, 2 * 128 * 1024));

        let info = erase_range(128 * 1024, 32767, 1).unwrap();
        assert_eq!(info.start, u32::MAX - 128 * 1024 + 1);

        // 4 GiB in
        assert!(matches!(
            erase_range(128 * 1024, 32768, 1),
            Err(NandError::OutOfRange(32768))
        ));
    }
}
