//! Tombstones record that a file of the default environment was deleted by the user.
//!
//! A tombstone is stored as a symlink entry named after the deleted file and pointing at
//! its own basename. Loading it leaves a dangling link in place of the default file, and
//! because a link never matches a regular default file, the next save persists it again.
use std::fs;
use std::io;
use std::path::Path;

use crate::archive::Entry;
use crate::error::{Error, Result};
use crate::util::entry_name;
use crate::walk::{self, Visit, WalkOptions};

/// Builds the tombstone for a deleted file called `name`.
pub fn tombstone_for(name: &str) -> Entry {
    let basename = name.rsplit('/').next().unwrap_or(name);
    Entry::tombstone(name, basename)
}

/// Walks the default environment snapshot and returns a tombstone for every regular file
/// that no longer exists below `env_root`.
///
/// Anything at the live path, including an earlier tombstone link, counts as present, so
/// a file never gets both its own entry and a synthesized tombstone.
pub fn collect_tombstones(snapshot_root: &Path, env_root: &Path) -> Result<Vec<Entry>> {
    let mut tombstones = Vec::new();

    walk::walk(
        snapshot_root,
        &WalkOptions::sorted(),
        |path, metadata, _| {
            if !metadata.is_file() {
                return Ok(Visit::Continue);
            }

            let name = entry_name(snapshot_root, path)?;
            let live = env_root.join(&name);
            match fs::symlink_metadata(&live) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(%name, "Default file was deleted, adding tombstone");
                    tombstones.push(tombstone_for(&name));
                }
                Err(e) => {
                    return Err(Error::io(format!("Failed to stat {}", live.display()), e));
                }
            }
            Ok(Visit::Continue)
        },
        walk::descend,
    )?;

    Ok(tombstones)
}
