//! Byte storage holding an envfs archive.
//!
//! Archives live on plain files, EFI variables, or raw flash partitions. Flash needs to
//! be unlocked and erased before it can be rewritten; everything else simply reports
//! those operations as unsupported, which callers treat as success.
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::path::Path;

use crate::error::{IoContext, Result};

/// Passed as `len` to [`EnvStorage::protect`] and [`EnvStorage::erase`] to cover
/// everything from `offset` to the end of the device.
pub const WHOLE_DEVICE: u64 = u64::MAX;

/// Value of an erased flash byte, used to pad writes to the device's write size.
pub const ERASED_BYTE: u8 = 0xff;

pub trait EnvStorage: Read + Write + Seek {
    /// Reads up to `buf.len()` bytes at `offset` without moving the stream position.
    /// Returns fewer bytes only at the end of the storage.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let position = self.stream_position()?;
        self.seek(SeekFrom::Start(offset))?;
        let result = read_full(self, buf);
        self.seek(SeekFrom::Start(position))?;
        result
    }

    /// Write-protects (`enable`) or unprotects a range of the storage.
    fn protect(&mut self, _len: u64, _offset: u64, _enable: bool) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    /// Erases a range of the storage so it can be written.
    fn erase(&mut self, _len: u64, _offset: u64) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    /// Writes must cover a multiple of this many bytes.
    fn write_granularity(&self) -> usize {
        1
    }
}

/// Whether `err` means the storage has no such capability, as opposed to a real failure.
pub fn is_unsupported(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Unsupported
        || matches!(
            err.raw_os_error(),
            Some(libc::ENOSYS | libc::EOPNOTSUPP | libc::ENOTTY)
        )
}

/// Reads until `buf` is full or the reader is exhausted.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl EnvStorage for File {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match FileExt::read_at(self, &mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl EnvStorage for Cursor<Vec<u8>> {}

/// `struct mtd_info_user` from `<mtd/mtd-abi.h>`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MtdInfo {
    pub kind: u8,
    pub flags: u32,
    pub size: u32,
    pub erasesize: u32,
    pub writesize: u32,
    pub oobsize: u32,
    pub padding: u64,
}

/// `struct erase_info_user` from `<mtd/mtd-abi.h>`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseInfo {
    pub start: u32,
    pub length: u32,
}

mod ioctl {
    nix::ioctl_read!(mem_get_info, b'M', 1, super::MtdInfo);
    nix::ioctl_write_ptr!(mem_erase, b'M', 2, super::EraseInfo);
    nix::ioctl_write_ptr!(mem_lock, b'M', 5, super::EraseInfo);
    nix::ioctl_write_ptr!(mem_unlock, b'M', 6, super::EraseInfo);
}

fn mtd_info(file: &File) -> io::Result<MtdInfo> {
    let mut info = MtdInfo::default();
    // SAFETY: `info` is a valid, writable `mtd_info_user` for the duration of the call
    // and the descriptor stays open while `file` is borrowed.
    unsafe { ioctl::mem_get_info(file.as_raw_fd(), &raw mut info) }?;
    Ok(info)
}

/// A Linux MTD character device (`/dev/mtdN`).
#[derive(Debug)]
pub struct MtdDevice {
    file: File,
    info: MtdInfo,
}

impl MtdDevice {
    pub fn new(file: File) -> io::Result<Self> {
        let info = mtd_info(&file)?;
        tracing::debug!(
            size = info.size,
            erasesize = info.erasesize,
            writesize = info.writesize,
            "Opened MTD device"
        );
        Ok(Self { file, info })
    }

    pub const fn info(&self) -> &MtdInfo {
        &self.info
    }

    /// Clamps a byte range to the device and widens it to whole erase blocks.
    pub fn erase_range(&self, len: u64, offset: u64) -> io::Result<EraseInfo> {
        let size = u64::from(self.info.size);
        let block = u64::from(self.info.erasesize.max(1));
        if offset > size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset {offset} is beyond the device size {size}"),
            ));
        }

        let start = offset - offset % block;
        let end = if len == WHOLE_DEVICE {
            size
        } else {
            offset.saturating_add(len).div_ceil(block).saturating_mul(block).min(size)
        };

        let invalid = |_| io::Error::from(io::ErrorKind::InvalidInput);
        Ok(EraseInfo {
            start: u32::try_from(start).map_err(invalid)?,
            length: u32::try_from(end - start).map_err(invalid)?,
        })
    }
}

impl Read for MtdDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for MtdDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for MtdDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl EnvStorage for MtdDevice {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        EnvStorage::read_at(&mut self.file, buf, offset)
    }

    fn protect(&mut self, len: u64, offset: u64, enable: bool) -> io::Result<()> {
        let range = self.erase_range(len, offset)?;
        let fd = self.file.as_raw_fd();
        if enable {
            // SAFETY: `range` outlives the call and `fd` belongs to the open device.
            unsafe { ioctl::mem_lock(fd, &raw const range) }?;
        } else {
            // SAFETY: as above.
            unsafe { ioctl::mem_unlock(fd, &raw const range) }?;
        }
        Ok(())
    }

    fn erase(&mut self, len: u64, offset: u64) -> io::Result<()> {
        let range = self.erase_range(len, offset)?;
        tracing::debug!(start = range.start, length = range.length, "Erasing flash");
        // SAFETY: `range` outlives the call and the descriptor belongs to the open device.
        unsafe { ioctl::mem_erase(self.file.as_raw_fd(), &raw const range) }?;
        Ok(())
    }

    /// NAND pages are written whole; NOR reports a write size of 1.
    fn write_granularity(&self) -> usize {
        usize::try_from(self.info.writesize).map_or(1, |size| size.max(1))
    }
}

/// Opens the storage at `path`.
///
/// Character devices that answer `MEMGETINFO` are driven as MTD flash, anything else as
/// a plain file. Writable opens create a missing file with mode `0600`.
pub fn open(path: &Path, writable: bool) -> Result<Box<dyn EnvStorage>> {
    let file = if writable {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
    } else {
        File::open(path)
    }
    .with_path("open", path)?;

    let file_type = file.metadata().with_path("stat", path)?.file_type();
    if file_type.is_char_device() {
        match mtd_info(&file) {
            Ok(_) => return Ok(Box::new(MtdDevice::new(file).with_path("open", path)?)),
            Err(e) => tracing::debug!("{} is not an MTD device: {}", path.display(), e),
        }
    }

    Ok(Box::new(file))
}
