//! Diff filter: decides which files of the live environment need to be persisted.
//!
//! A file identical to its counterpart in the default environment is restored from the
//! built-in defaults at boot, so it does not need to take up space in the archive.
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::archive::Entry;
use crate::error::{Error, IoContext, Result};
use crate::util::{entry_name, files_identical};

/// Compares files below `env_root` with the same relative path below `snapshot_root`.
///
/// Without a snapshot every file is persisted.
#[derive(Debug, Clone, Copy)]
pub struct DiffFilter<'a> {
    env_root: &'a Path,
    snapshot_root: Option<&'a Path>,
}

impl<'a> DiffFilter<'a> {
    pub const fn new(env_root: &'a Path, snapshot_root: Option<&'a Path>) -> Self {
        Self {
            env_root,
            snapshot_root,
        }
    }

    /// Returns `true` if `path` has no default counterpart or differs from it.
    pub fn should_persist(&self, path: &Path) -> Result<bool> {
        let Some(snapshot_root) = self.snapshot_root else {
            return Ok(true);
        };
        should_persist(path, self.env_root, snapshot_root)
    }

    /// Reads `path` into an archive entry, or returns `None` when it matches the defaults
    /// or cannot be stored.
    ///
    /// Symlinks become tombstone entries carrying their link target.
    pub fn entry_for(&self, path: &Path, metadata: &Metadata) -> Result<Option<Entry>> {
        let file_type = metadata.file_type();
        if !(file_type.is_file() || file_type.is_symlink()) {
            tracing::warn!("Skipping special file: {}", path.display());
            return Ok(None);
        }

        if !self.should_persist(path)? {
            tracing::trace!(path = %path.display(), "Unchanged from default, skipping");
            return Ok(None);
        }

        let name = entry_name(self.env_root, path)?;
        let entry = if file_type.is_symlink() {
            let target = fs::read_link(path).with_path("read link", path)?;
            let target = target.to_str().ok_or_else(|| {
                Error::format(format!("link target of {} is not UTF-8", path.display()))
            })?;
            Entry::tombstone(name, target)
        } else {
            let content = fs::read(path).with_path("read", path)?;
            Entry::regular(name, content, metadata.permissions().mode())
        };

        tracing::debug!(
            name = %entry.name,
            size = entry.wire_size(),
            tombstone = entry.is_tombstone(),
            "Persisting"
        );
        Ok(Some(entry))
    }
}

/// Returns `true` if the file at `path` (below `env_root`) must be persisted: it has no
/// counterpart below `snapshot_root`, the counterpart is of another type, or the content
/// (link target, for symlinks) differs.
pub fn should_persist(path: &Path, env_root: &Path, snapshot_root: &Path) -> Result<bool> {
    let relative = path.strip_prefix(env_root).map_err(|_| {
        Error::format(format!(
            "{} is not inside {}",
            path.display(),
            env_root.display()
        ))
    })?;
    let counterpart = snapshot_root.join(relative);

    let live = fs::symlink_metadata(path).with_path("stat", path)?;
    let default = match fs::symlink_metadata(&counterpart) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(Error::io(format!("Failed to stat {}", counterpart.display()), e)),
    };

    if live.file_type().is_symlink() && default.file_type().is_symlink() {
        let live_target = fs::read_link(path).with_path("read link", path)?;
        let default_target = fs::read_link(&counterpart).with_path("read link", &counterpart)?;
        return Ok(live_target != default_target);
    }

    if live.is_file() && default.is_file() {
        let identical = files_identical(path, &counterpart).map_err(|e| {
            Error::io(
                format!(
                    "Failed to compare {} with {}",
                    path.display(),
                    counterpart.display()
                ),
                e,
            )
        })?;
        return Ok(!identical);
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::EntryKind;
    use tempfile::TempDir;

    struct Trees {
        _temp_dir: TempDir,
        live: std::path::PathBuf,
        defaults: std::path::PathBuf,
    }

    fn trees() -> Trees {
        let temp_dir = TempDir::new().unwrap();
        let live = temp_dir.path().join("env");
        let defaults = temp_dir.path().join("defaultenv");
        for root in [&live, &defaults] {
            fs::create_dir_all(root.join("bin")).unwrap();
            fs::create_dir_all(root.join("config")).unwrap();
            fs::write(root.join("bin/init"), "A").unwrap();
        }
        fs::write(defaults.join("config/hostname"), "myhost").unwrap();
        Trees {
            _temp_dir: temp_dir,
            live,
            defaults,
        }
    }

    #[test]
    fn test_identical_file_is_skipped() {
        let trees = trees();
        let path = trees.live.join("bin/init");
        assert!(!should_persist(&path, &trees.live, &trees.defaults).unwrap());
    }

    #[test]
    fn test_changed_and_new_files_are_persisted() {
        let trees = trees();
        fs::write(trees.live.join("config/hostname"), "other").unwrap();
        fs::write(trees.live.join("config/new"), "new").unwrap();

        for name in ["config/hostname", "config/new"] {
            let path = trees.live.join(name);
            assert!(should_persist(&path, &trees.live, &trees.defaults).unwrap(), "{name}");
        }
    }

    #[test]
    fn test_tombstone_differs_from_default_file() {
        let trees = trees();
        let path = trees.live.join("config/hostname");
        std::os::unix::fs::symlink("hostname", &path).unwrap();

        assert!(should_persist(&path, &trees.live, &trees.defaults).unwrap());

        let filter = DiffFilter::new(&trees.live, Some(&trees.defaults));
        let metadata = fs::symlink_metadata(&path).unwrap();
        let entry = filter.entry_for(&path, &metadata).unwrap().unwrap();
        assert_eq!(entry, Entry::tombstone("config/hostname", "hostname"));
    }

    #[test]
    fn test_identical_symlinks_are_skipped() {
        let trees = trees();
        std::os::unix::fs::symlink("init", trees.live.join("bin/start")).unwrap();
        std::os::unix::fs::symlink("init", trees.defaults.join("bin/start")).unwrap();

        let path = trees.live.join("bin/start");
        assert!(!should_persist(&path, &trees.live, &trees.defaults).unwrap());
    }

    #[test]
    fn test_without_snapshot_everything_is_persisted() {
        let trees = trees();
        let filter = DiffFilter::new(&trees.live, None);
        let path = trees.live.join("bin/init");
        let metadata = fs::symlink_metadata(&path).unwrap();

        let entry = filter.entry_for(&path, &metadata).unwrap().unwrap();
        assert_eq!(entry.name, "bin/init");
        assert!(matches!(entry.kind, EntryKind::Regular { ref content, .. } if content == b"A"));
    }
}
