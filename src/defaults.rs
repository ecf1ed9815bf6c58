//! The default environment: the tree a board boots with when nothing has been saved.
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::archive;
use crate::environment::{LoadFlags, materialize_entries};
use crate::error::{IoContext, Result};
use crate::util::copy_dir_all;

pub trait DefaultEnvironment {
    /// Writes the default environment into `dest`, creating it if needed.
    fn materialize(&self, dest: &Path) -> Result<()>;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;
}

/// Defaults kept as a plain directory tree.
#[derive(Debug, Clone)]
pub struct DirectoryDefaults {
    pub root: PathBuf,
}

impl DirectoryDefaults {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DefaultEnvironment for DirectoryDefaults {
    fn materialize(&self, dest: &Path) -> Result<()> {
        tracing::debug!(
            "Installing default environment from {} into {}",
            self.root.display(),
            dest.display()
        );
        copy_dir_all(&self.root, dest).with_path("copy default environment from", &self.root)
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}

/// Defaults compiled in as an envfs image, the way firmware carries them.
#[derive(Debug, Clone)]
pub struct ImageDefaults {
    pub image: Cow<'static, [u8]>,
}

impl ImageDefaults {
    pub const fn from_static(image: &'static [u8]) -> Self {
        Self {
            image: Cow::Borrowed(image),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let image = fs::read(path).with_path("read default environment image", path)?;
        Ok(Self {
            image: Cow::Owned(image),
        })
    }
}

impl DefaultEnvironment for ImageDefaults {
    fn materialize(&self, dest: &Path) -> Result<()> {
        let (superblock, entries) = archive::parse_image(&self.image)?;
        fs::create_dir_all(dest).with_path("create directory", dest)?;
        if superblock.is_force_builtin() {
            return Ok(());
        }

        tracing::debug!(
            entries = entries.len(),
            "Installing default environment image into {}",
            dest.display()
        );
        materialize_entries(&entries, dest, LoadFlags::default())?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("built-in image ({} bytes)", self.image.len())
    }
}

/// A scoped copy of the default environment used to diff against during a save.
///
/// The directory is removed when the snapshot is dropped.
#[derive(Debug)]
pub struct Snapshot {
    dir: TempDir,
}

impl Snapshot {
    /// Materializes `defaults` into a fresh `.defaultenv*` directory below `parent`, or
    /// below the system temporary directory when `parent` is `None`.
    pub fn create(defaults: &dyn DefaultEnvironment, parent: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(".defaultenv");
        let dir = match parent {
            Some(parent) => builder
                .tempdir_in(parent)
                .with_path("create staging directory in", parent)?,
            None => builder
                .tempdir()
                .with_path("create staging directory in", &std::env::temp_dir())?,
        };

        tracing::debug!(
            "Staging default environment from {} in {}",
            defaults.describe(),
            dir.path().display()
        );
        defaults.materialize(dir.path())?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}
