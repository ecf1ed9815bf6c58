//! Configuration for the `envfs` tool.
//!
//! Read from `/etc/envfs.toml` (or `--config`) when present, for example:
//!
//! ```toml
//! archive = "/dev/mtd3"
//! env_dir = "/env"
//! defaults = { dir = "/usr/share/envfs/defaultenv" }
//! ```
//!
//! Command line flags and `ENVFS_*` variables take precedence over the file.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::defaults::{DefaultEnvironment, DirectoryDefaults, ImageDefaults};
use crate::error::{Error, IoContext, Result};

/// Where the default environment comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DefaultsSource {
    /// A directory tree
    Dir(PathBuf),
    /// An envfs image file
    Image(PathBuf),
}

impl DefaultsSource {
    pub fn open(&self) -> Result<Box<dyn DefaultEnvironment>> {
        Ok(match self {
            Self::Dir(root) => Box::new(DirectoryDefaults::new(root)),
            Self::Image(path) => Box::new(ImageDefaults::from_file(path)?),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Storage holding the archive: a file, an MTD partition, an EFI variable
    pub archive: PathBuf,
    /// Root of the live environment
    pub env_dir: PathBuf,
    pub defaults: Option<DefaultsSource>,
    /// Parent directory for staging snapshots, the system temporary directory if unset
    pub staging_dir: Option<PathBuf>,
    pub lock_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            archive: PathBuf::from("/dev/env0"),
            env_dir: PathBuf::from("/env"),
            defaults: None,
            staging_dir: None,
            lock_dir: PathBuf::from("/run/envfs"),
        }
    }
}

/// Values given on the command line or in the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub archive: Option<PathBuf>,
    pub env_dir: Option<PathBuf>,
    pub defaults: Option<DefaultsSource>,
}

impl Config {
    pub const DEFAULT_PATH: &'static str = "/etc/envfs.toml";

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path("read config", path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Loads `path`, or [`Config::DEFAULT_PATH`] if it exists, or the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let default_path = Path::new(Self::DEFAULT_PATH);
        if default_path.exists() {
            tracing::debug!("Using config {}", default_path.display());
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(archive) = overrides.archive {
            self.archive = archive;
        }
        if let Some(env_dir) = overrides.env_dir {
            self.env_dir = env_dir;
        }
        if let Some(defaults) = overrides.defaults {
            self.defaults = Some(defaults);
        }
        self
    }

    pub fn lock_path(&self) -> PathBuf {
        self.lock_dir.join("envfs.lock")
    }
}
