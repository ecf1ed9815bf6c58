//! envfs: persistent environment storage.
//!
//! The live environment is a directory tree of small configuration files. Saving it
//! stores only the files that differ from a default environment, plus tombstones for
//! deleted defaults, in a compact checksummed archive; loading writes them back.

pub mod archive;
pub mod cli;
pub mod config;
pub mod defaults;
pub mod diff;
pub mod environment;
pub mod error;
pub mod storage;
pub mod tombstone;
pub mod util;
pub mod walk;

pub use defaults::{DefaultEnvironment, DirectoryDefaults, ImageDefaults};
pub use environment::{Environment, LoadFlags, LoadReport, RestoreOutcome, SaveFlags, SaveReport};
pub use error::{Error, Result};
