//! Saving the live environment to storage and loading it back.
//!
//! A save stores only what differs from the default environment, plus a tombstone for
//! every default file that was deleted. A load writes the stored entries over whatever
//! is already in the environment directory, which at boot is a fresh copy of the
//! defaults.
use std::fs::{self, Permissions};
use std::io::{self, Read, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::archive::{
    self, EFI_PREFIX_SIZE, ENVFS_MAGIC, Entry, EntryKind, FLAG_FORCE_BUILT_IN, SUPERBLOCK_SIZE,
    Superblock,
};
use crate::defaults::{DefaultEnvironment, Snapshot};
use crate::diff::DiffFilter;
use crate::error::{Error, IoContext, Result};
use crate::storage::{self, ERASED_BYTE, EnvStorage, WHOLE_DEVICE, is_unsupported};
use crate::tombstone::collect_tombstones;
use crate::util::remove_non_dir;
use crate::walk::{self, Visit, WalkOptions};


#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveFlags {
    /// Store an empty archive that makes the next load install the defaults
    pub force_builtin: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadFlags {
    /// Leave files that already exist in the environment untouched
    pub no_overwrite: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Number of entries stored, tombstones included
    pub entries: usize,
    pub tombstones: usize,
    /// Bytes written to the storage, EFI prefix and write-size padding included
    pub bytes_written: usize,
    pub efi_prefix: bool,
    pub force_builtin: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub regular: usize,
    pub tombstones: usize,
    /// Entries left alone because of [`LoadFlags::no_overwrite`]
    pub skipped: usize,
    pub efi_prefix: bool,
    pub force_builtin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The saved archive was applied on top of the defaults
    Loaded(LoadReport),
    /// No usable archive; the environment holds the defaults only
    Defaults,
}

/// What sits in front of the superblock.
enum Prefix {
    /// Less than two words of storage
    TooShort,
    Absent,
    Efi([u8; EFI_PREFIX_SIZE]),
}

impl Prefix {
    const fn len(&self) -> usize {
        match self {
            Self::Efi(_) => EFI_PREFIX_SIZE,
            Self::TooShort | Self::Absent => 0,
        }
    }
}

/// Save and load operations against one default environment.
///
/// Without defaults (host mode) every file is persisted and no tombstones are written,
/// which is how images are prepared on a build host.
#[derive(Clone, Copy)]
pub struct Environment<'a> {
    defaults: Option<&'a dyn DefaultEnvironment>,
    staging: Option<&'a Path>,
}

impl std::fmt::Debug for Environment<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("defaults", &self.defaults.map(|d| d.describe()))
            .field("staging", &self.staging)
            .finish()
    }
}

impl<'a> Environment<'a> {
    pub const fn new(defaults: &'a dyn DefaultEnvironment) -> Self {
        Self {
            defaults: Some(defaults),
            staging: None,
        }
    }

    pub const fn host() -> Self {
        Self {
            defaults: None,
            staging: None,
        }
    }

    /// Creates staging snapshots below `dir` instead of the system temporary directory.
    #[must_use]
    pub const fn with_staging(mut self, dir: &'a Path) -> Self {
        self.staging = Some(dir);
        self
    }

    pub const fn defaults(&self) -> Option<&'a dyn DefaultEnvironment> {
        self.defaults
    }

    /// Collects the entries a save of `env_root` would store, in archive order.
    pub fn collect_entries(&self, env_root: &Path) -> Result<Vec<Entry>> {
        let snapshot = self
            .defaults
            .map(|defaults| Snapshot::create(defaults, self.staging))
            .transpose()?;
        let snapshot_root = snapshot.as_ref().map(Snapshot::path);

        let filter = DiffFilter::new(env_root, snapshot_root);
        let mut entries = Vec::new();
        walk::walk(
            env_root,
            &WalkOptions::sorted(),
            |path, metadata, _| {
                if let Some(entry) = filter.entry_for(path, metadata)? {
                    entries.push(entry);
                }
                Ok(Visit::Continue)
            },
            walk::descend,
        )?;

        if let Some(snapshot_root) = snapshot_root {
            entries.extend(collect_tombstones(snapshot_root, env_root)?);
        }
        Ok(entries)
    }

    /// Stores the difference between `env_root` and the defaults in `storage`.
    #[tracing::instrument(skip_all, fields(env_root = %env_root.display()))]
    pub fn save<S: EnvStorage + ?Sized>(
        &self,
        storage: &mut S,
        env_root: &Path,
        flags: SaveFlags,
    ) -> Result<SaveReport> {
        let (entries, superblock_flags) = if flags.force_builtin {
            tracing::debug!("Forcing the built-in environment");
            (Vec::new(), FLAG_FORCE_BUILT_IN)
        } else {
            (self.collect_entries(env_root)?, 0)
        };

        let image = archive::build_image(superblock_flags, &entries)?;

        let prefix = read_prefix(storage)?;
        let mut buffer = Vec::with_capacity(prefix.len() + image.len());
        if let Prefix::Efi(attributes) = &prefix {
            tracing::debug!("Keeping EFI variable attributes {:02x?}", attributes);
            buffer.extend_from_slice(attributes);
        }
        buffer.extend_from_slice(&image);

        let granularity = storage.write_granularity().max(1);
        let padded = buffer.len().next_multiple_of(granularity);
        if padded != buffer.len() {
            tracing::debug!(granularity, padding = padded - buffer.len(), "Padding archive");
            buffer.resize(padded, ERASED_BYTE);
        }

        write_archive(storage, &buffer)?;

        let report = SaveReport {
            entries: entries.len(),
            tombstones: entries.iter().filter(|e| e.is_tombstone()).count(),
            bytes_written: buffer.len(),
            efi_prefix: matches!(prefix, Prefix::Efi(_)),
            force_builtin: flags.force_builtin,
        };
        tracing::info!(
            entries = report.entries,
            tombstones = report.tombstones,
            bytes = report.bytes_written,
            "Saved environment"
        );
        Ok(report)
    }

    pub fn save_to_path(&self, path: &Path, env_root: &Path, flags: SaveFlags) -> Result<SaveReport> {
        let mut storage = storage::open(path, true)?;
        self.save(&mut *storage, env_root, flags)
    }

    /// Loads the archive in `storage` into `env_root`.
    ///
    /// The whole archive is validated before anything is written to `env_root`.
    #[tracing::instrument(skip_all, fields(env_root = %env_root.display()))]
    pub fn load<S: EnvStorage + ?Sized>(
        &self,
        storage: &mut S,
        env_root: &Path,
        flags: LoadFlags,
    ) -> Result<LoadReport> {
        let prefix = read_prefix(storage)?;
        if matches!(prefix, Prefix::TooShort) {
            return Err(Error::format("archive is truncated"));
        }
        let offset = prefix.len() as u64;

        let mut header = [0u8; SUPERBLOCK_SIZE];
        read_exact_at(storage, &mut header, offset, "superblock")?;
        let superblock = Superblock::parse(&header)?;

        if superblock.is_force_builtin() {
            let defaults = self.defaults.ok_or(Error::NoDefaults)?;
            tracing::info!(
                "Archive forces the built-in environment, installing {}",
                defaults.describe()
            );
            defaults.materialize(env_root)?;
            return Ok(LoadReport {
                efi_prefix: offset != 0,
                force_builtin: true,
                ..LoadReport::default()
            });
        }

        let region = read_region(storage, offset + SUPERBLOCK_SIZE as u64, superblock.region_len())?;
        superblock.check_data(&region)?;
        let entries = archive::decode_entries(&region)?;

        let report = LoadReport {
            efi_prefix: offset != 0,
            ..materialize_entries(&entries, env_root, flags)?
        };
        tracing::info!(
            regular = report.regular,
            tombstones = report.tombstones,
            skipped = report.skipped,
            "Loaded environment"
        );
        Ok(report)
    }

    pub fn load_from_path(&self, path: &Path, env_root: &Path, flags: LoadFlags) -> Result<LoadReport> {
        let mut storage = storage::open(path, false)?;
        self.load(&mut *storage, env_root, flags)
    }

    /// Boot-time restore: installs the defaults into `env_root`, then loads the archive
    /// at `archive_path` on top.
    ///
    /// A missing or unreadable archive leaves the defaults in place.
    #[tracing::instrument(skip_all, fields(archive = %archive_path.display()))]
    pub fn restore(
        &self,
        archive_path: &Path,
        env_root: &Path,
        flags: LoadFlags,
    ) -> Result<RestoreOutcome> {
        let defaults = self.defaults.ok_or(Error::NoDefaults)?;
        tracing::debug!("Installing default environment from {}", defaults.describe());
        defaults.materialize(env_root)?;

        let mut storage = match storage::open(archive_path, false) {
            Ok(storage) => storage,
            Err(e) if e.is_not_found() => {
                tracing::warn!("{e}, using default environment");
                return Ok(RestoreOutcome::Defaults);
            }
            Err(e) => return Err(e),
        };

        match self.load(&mut *storage, env_root, flags) {
            Ok(report) => Ok(RestoreOutcome::Loaded(report)),
            Err(e) if e.is_corrupt() => {
                tracing::warn!(
                    "Cannot load environment from {}: {e}, using default environment",
                    archive_path.display()
                );
                Ok(RestoreOutcome::Defaults)
            }
            Err(e) => Err(e),
        }
    }
}

/// Writes decoded entries into `env_root`.
///
/// An existing non-directory at an entry's path is replaced, so a tombstone takes the
/// place of a default file and a stored file takes the place of a tombstone.
pub fn materialize_entries(entries: &[Entry], env_root: &Path, flags: LoadFlags) -> Result<LoadReport> {
    fs::create_dir_all(env_root).with_path("create directory", env_root)?;

    let mut report = LoadReport::default();
    for entry in entries {
        let path = entry_path(env_root, &entry.name)?;
        check_ancestors(env_root, &entry.name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path("create directory", parent)?;
        }

        if flags.no_overwrite && fs::symlink_metadata(&path).is_ok() {
            tracing::trace!(name = %entry.name, "Already exists, skipping");
            report.skipped += 1;
            continue;
        }
        remove_non_dir(&path).with_path("remove", &path)?;

        match &entry.kind {
            EntryKind::Regular { content, mode } => {
                tracing::trace!(name = %entry.name, size = content.len(), mode = format!("{mode:o}"), "Writing");
                fs::write(&path, content).with_path("write", &path)?;
                fs::set_permissions(&path, Permissions::from_mode(*mode))
                    .with_path("set permissions of", &path)?;
                report.regular += 1;
            }
            EntryKind::Tombstone { target } => {
                tracing::trace!(name = %entry.name, %target, "Creating tombstone");
                std::os::unix::fs::symlink(target, &path).with_path("create symlink", &path)?;
                report.tombstones += 1;
            }
        }
    }
    Ok(report)
}

/// Resolves an entry name below `env_root`.
///
/// Names are `/`-separated runs of plain components; empty, `.` and `..` components
/// are refused, and so are absolute names.
fn entry_path(env_root: &Path, name: &str) -> Result<PathBuf> {
    let plain = name
        .split('/')
        .all(|part| !part.is_empty() && part != "." && part != "..");
    if !plain {
        return Err(Error::format(format!("entry name {name:?} escapes the environment")));
    }
    Ok(env_root.join(name))
}

/// Refuses entries whose existing parent directories below `env_root` include a symlink.
fn check_ancestors(env_root: &Path, name: &str) -> Result<()> {
    let Some((parents, _)) = name.rsplit_once('/') else {
        return Ok(());
    };
    let mut ancestor = env_root.to_path_buf();
    for part in parents.split('/') {
        ancestor.push(part);
        match fs::symlink_metadata(&ancestor) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(Error::format(format!(
                    "entry {name:?} passes through symlink {}",
                    ancestor.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(e).with_path("stat", &ancestor),
        }
    }
    Ok(())
}

fn read_prefix<S: EnvStorage + ?Sized>(storage: &mut S) -> Result<Prefix> {
    let mut magic = [0u8; 4];
    let read = storage
        .read_at(&mut magic, EFI_PREFIX_SIZE as u64)
        .map_err(|e| Error::io("Failed to read archive", e))?;
    if read < magic.len() {
        return Ok(Prefix::TooShort);
    }
    if magic != ENVFS_MAGIC.to_ne_bytes() {
        return Ok(Prefix::Absent);
    }

    let mut attributes = [0u8; EFI_PREFIX_SIZE];
    read_exact_at(storage, &mut attributes, 0, "EFI attributes")?;
    Ok(Prefix::Efi(attributes))
}

fn read_exact_at<S: EnvStorage + ?Sized>(
    storage: &mut S,
    buf: &mut [u8],
    offset: u64,
    what: &str,
) -> Result<()> {
    let read = storage
        .read_at(buf, offset)
        .map_err(|e| Error::io(format!("Failed to read {what}"), e))?;
    if read < buf.len() {
        return Err(Error::format(format!(
            "premature end of {what} ({read} of {} bytes)",
            buf.len()
        )));
    }
    Ok(())
}

/// Reads `len` bytes at `offset`, growing the buffer only as far as the storage goes.
fn read_region<S: EnvStorage + ?Sized>(storage: &mut S, offset: u64, len: usize) -> Result<Vec<u8>> {
    storage
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io("Failed to seek archive storage", e))?;
    let mut region = Vec::new();
    Read::take(&mut *storage, len as u64)
        .read_to_end(&mut region)
        .map_err(|e| Error::io("Failed to read entry region", e))?;
    if region.len() < len {
        return Err(Error::format(format!(
            "premature end of entry region ({} of {len} bytes)",
            region.len()
        )));
    }
    Ok(region)
}

fn write_archive<S: EnvStorage + ?Sized>(storage: &mut S, buffer: &[u8]) -> Result<()> {
    tolerate_unsupported(storage.protect(WHOLE_DEVICE, 0, false), "unprotect")?;
    tolerate_unsupported(storage.erase(WHOLE_DEVICE, 0), "erase")?;

    storage
        .seek(SeekFrom::Start(0))
        .map_err(|e| Error::io("Failed to seek archive storage", e))?;
    storage
        .write_all(buffer)
        .map_err(|e| Error::io("Failed to write archive", e))?;
    storage
        .flush()
        .map_err(|e| Error::io("Failed to flush archive", e))?;

    tolerate_unsupported(storage.protect(WHOLE_DEVICE, 0, true), "protect")
}

fn tolerate_unsupported(result: io::Result<()>, action: &str) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if is_unsupported(&e) => {
            tracing::debug!("Storage cannot {action}: {e}");
            Ok(())
        }
        Err(e) => Err(Error::io(format!("Failed to {action} archive storage"), e)),
    }
}
