use crate::error::{Error, Result};

pub const ENVFS_MAGIC: u32 = 0x798f_ba79;
pub const ENVFS_MAJOR: u8 = 1;
pub const ENVFS_MINOR: u8 = 0;

/// The archive carries no entries; load must fall back to the built-in defaults.
pub const FLAG_FORCE_BUILT_IN: u32 = 1 << 0;

pub const SUPERBLOCK_SIZE: usize = 24;
/// Size of the attribute word in front of archives stored in EFI variables
pub const EFI_PREFIX_SIZE: usize = 4;

/// Fixed-size archive header.
///
/// `sb_crc` covers every other field and must be checked before anything else is
/// trusted; `crc` covers the entry region that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub major: u8,
    pub minor: u8,
    pub future: u16,
    pub flags: u32,
    /// Length of the entry region in bytes
    pub size: u32,
    pub crc: u32,
    pub sb_crc: u32,
}

impl Superblock {
    /// Builds the superblock for `region`, computing both checksums.
    pub fn new(flags: u32, region: &[u8]) -> Result<Self> {
        let size = u32::try_from(region.len())
            .map_err(|_| Error::format(format!("entry region of {} bytes is too large", region.len())))?;

        let mut superblock = Self {
            magic: ENVFS_MAGIC,
            major: ENVFS_MAJOR,
            minor: ENVFS_MINOR,
            future: 0,
            flags,
            size,
            crc: crc32fast::hash(region),
            sb_crc: 0,
        };
        superblock.sb_crc = crc32fast::hash(&superblock.to_bytes()[..SUPERBLOCK_SIZE - 4]);
        Ok(superblock)
    }

    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut bytes = [0u8; SUPERBLOCK_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_ne_bytes());
        bytes[4] = self.major;
        bytes[5] = self.minor;
        bytes[6..8].copy_from_slice(&self.future.to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.flags.to_ne_bytes());
        bytes[12..16].copy_from_slice(&self.size.to_ne_bytes());
        bytes[16..20].copy_from_slice(&self.crc.to_ne_bytes());
        bytes[20..24].copy_from_slice(&self.sb_crc.to_ne_bytes());
        bytes
    }

    /// Parses and validates a superblock: `sb_crc` first, then the magic, then the
    /// format version.
    pub fn parse(bytes: &[u8; SUPERBLOCK_SIZE]) -> Result<Self> {
        let word = |at: usize| u32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        let superblock = Self {
            magic: word(0),
            major: bytes[4],
            minor: bytes[5],
            future: u16::from_ne_bytes([bytes[6], bytes[7]]),
            flags: word(8),
            size: word(12),
            crc: word(16),
            sb_crc: word(20),
        };

        let expected = crc32fast::hash(&bytes[..SUPERBLOCK_SIZE - 4]);
        if expected != superblock.sb_crc {
            return Err(Error::format(format!(
                "wrong crc on env superblock (stored {:#010x}, computed {expected:#010x})",
                superblock.sb_crc
            )));
        }

        if superblock.magic != ENVFS_MAGIC {
            return Err(Error::format(format!(
                "no envfs (magic {:#010x}) - envfs never written?",
                superblock.magic
            )));
        }

        if superblock.major != ENVFS_MAJOR {
            return Err(Error::format(format!(
                "unsupported envfs version {}.{} (expected {ENVFS_MAJOR}.x)",
                superblock.major, superblock.minor
            )));
        }

        if superblock.minor != ENVFS_MINOR {
            tracing::debug!(
                "envfs version {}.{} loaded into {ENVFS_MAJOR}.{ENVFS_MINOR}",
                superblock.major,
                superblock.minor
            );
        }

        Ok(superblock)
    }

    /// Checks the entry region against the stored `crc`.
    pub fn check_data(&self, region: &[u8]) -> Result<()> {
        let crc = crc32fast::hash(region);
        if crc != self.crc {
            return Err(Error::format(format!(
                "wrong crc on env (stored {:#010x}, computed {crc:#010x})",
                self.crc
            )));
        }
        Ok(())
    }

    pub const fn is_force_builtin(&self) -> bool {
        self.flags & FLAG_FORCE_BUILT_IN != 0
    }

    pub const fn region_len(&self) -> usize {
        self.size as usize
    }
}
