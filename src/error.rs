use std::io;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error, with the path or action it happened on.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The archive is corrupt, truncated, or not an envfs archive at all.
    #[error("invalid envfs archive: {0}")]
    Format(String),

    #[error("no default environment is configured")]
    NoDefaults,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// True when the stored archive cannot be trusted and should be treated
    /// as "no saved environment".
    pub const fn is_corrupt(&self) -> bool {
        matches!(self, Self::Format(_))
    }

    /// True when the archive storage itself does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Attaches a path to an `io::Result`, in the spirit of `map_err(|e| format!(...))`.
pub trait IoContext<T> {
    fn with_path(self, action: &str, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn with_path(self, action: &str, path: &Path) -> Result<T> {
        self.map_err(|e| Error::io(format!("Failed to {action} {}", path.display()), e))
    }
}
