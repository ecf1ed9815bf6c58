//! Deterministic recursive directory traversal.
//!
//! Directories are handed to a directory callback which can veto recursion, everything
//! else (regular files, symlinks, special files) to a file callback. Below the root,
//! symlinks are never followed, so a dangling tombstone link is reported as itself.
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};

use crate::error::{Error, IoContext, Result};

/// What a callback wants the walker to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    /// Do not descend into this directory
    Skip,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkOptions {
    /// Descend into subdirectories
    pub recurse: bool,
    /// Visit the entries of each directory in byte order of their names
    pub sort: bool,
    /// Resolve the root itself if it is a symlink
    pub follow_root_symlink: bool,
    /// Call the directory callback after a directory's contents instead of before
    pub depth_first: bool,
}

impl WalkOptions {
    /// Recursive, sorted walk that resolves a symlinked root. Both save passes use this.
    pub const fn sorted() -> Self {
        Self {
            recurse: true,
            sort: true,
            follow_root_symlink: true,
            depth_first: false,
        }
    }
}

struct Walker<'o, F, D> {
    options: &'o WalkOptions,
    file_cb: F,
    dir_cb: D,
    first_error: Option<Error>,
}

impl<F, D> Walker<'_, F, D>
where
    F: FnMut(&Path, &Metadata, usize) -> Result<Visit>,
    D: FnMut(&Path, &Metadata, usize) -> Result<Visit>,
{
    fn record(&mut self, path: &Path, err: Error) {
        tracing::warn!(path = %path.display(), error = %err, "Walk callback failed");
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }

    fn read_children(&mut self, dir: &Path) -> Result<Vec<(PathBuf, Metadata)>> {
        let mut entries = fs::read_dir(dir)
            .with_path("open directory", dir)?
            .collect::<Result<Vec<_>, _>>()
            .with_path("read directory", dir)?;

        if self.options.sort {
            entries.sort_by_key(fs::DirEntry::file_name);
        }

        let mut children = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = entry.path();
            // Does NOT follow symlinks
            match fs::symlink_metadata(&path).with_path("stat", &path) {
                Ok(metadata) => children.push((path, metadata)),
                Err(e) => self.record(&path, e),
            }
        }
        Ok(children)
    }

    fn visit_dir(&mut self, dir: &Path, metadata: &Metadata, depth: usize) -> Result<()> {
        if !self.options.depth_first && (self.dir_cb)(dir, metadata, depth)? == Visit::Skip {
            tracing::trace!(path = %dir.display(), "Skipping directory");
            return Ok(());
        }

        let children = match self.read_children(dir) {
            Ok(children) => children,
            Err(e) if depth > 0 => {
                self.record(dir, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for (path, child) in children {
            if child.is_dir() {
                self.visit_dir(&path, &child, depth + 1)?;
            } else if let Err(e) = (self.file_cb)(&path, &child, depth + 1) {
                self.record(&path, e);
            }
        }

        if self.options.depth_first {
            (self.dir_cb)(dir, metadata, depth)?;
        }
        Ok(())
    }
}

/// Walks `root`, calling `file_cb` for non-directories and `dir_cb` for directories.
///
/// A root that is not a directory gets exactly one `file_cb` call whose result is the
/// result of the walk. A failing `file_cb` below the root does not stop the traversal,
/// but the walk then returns the first failure once it is done. Errors from `dir_cb`
/// abort immediately.
pub fn walk<F, D>(root: &Path, options: &WalkOptions, mut file_cb: F, mut dir_cb: D) -> Result<()>
where
    F: FnMut(&Path, &Metadata, usize) -> Result<Visit>,
    D: FnMut(&Path, &Metadata, usize) -> Result<Visit>,
{
    let metadata = if options.follow_root_symlink {
        fs::metadata(root)
    } else {
        fs::symlink_metadata(root)
    }
    .with_path("stat", root)?;

    if !metadata.is_dir() {
        return file_cb(root, &metadata, 0).map(|_| ());
    }

    if !options.recurse {
        return dir_cb(root, &metadata, 0).map(|_| ());
    }

    let mut walker = Walker {
        options,
        file_cb,
        dir_cb,
        first_error: None,
    };
    walker.visit_dir(root, &metadata, 0)?;

    walker.first_error.map_or(Ok(()), Err)
}

/// Directory callback that descends everywhere.
pub fn descend(_: &Path, _: &Metadata, _: usize) -> Result<Visit> {
    Ok(Visit::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("b/nested")).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("z.txt"), "z").unwrap();
        fs::write(root.join("b/nested/deep"), "deep").unwrap();
        fs::write(root.join("b/file"), "file").unwrap();
        fs::write(root.join("a/one"), "one").unwrap();
        temp_dir
    }

    fn relative(root: &Path, path: &Path) -> String {
        path.strip_prefix(root).unwrap().to_string_lossy().into_owned()
    }

    #[test]
    fn test_sorted_walk_order() {
        let temp_dir = sample_tree();
        let root = temp_dir.path();

        let mut files = Vec::new();
        let mut dirs = Vec::new();
        walk(
            root,
            &WalkOptions::sorted(),
            |path, _, _| {
                files.push(relative(root, path));
                Ok(Visit::Continue)
            },
            |path, _, depth| {
                dirs.push((relative(root, path), depth));
                Ok(Visit::Continue)
            },
        )
        .unwrap();

        assert_eq!(files, vec!["a/one", "b/file", "b/nested/deep", "z.txt"]);
        assert_eq!(
            dirs,
            vec![
                (String::new(), 0),
                ("a".to_owned(), 1),
                ("b".to_owned(), 1),
                ("b/nested".to_owned(), 2)
            ]
        );
    }

    #[test]
    fn test_skip_prevents_descent() {
        let temp_dir = sample_tree();
        let root = temp_dir.path();

        let mut files = Vec::new();
        walk(
            root,
            &WalkOptions::sorted(),
            |path, _, _| {
                files.push(relative(root, path));
                Ok(Visit::Continue)
            },
            |path, _, _| {
                if path.ends_with("b") {
                    Ok(Visit::Skip)
                } else {
                    Ok(Visit::Continue)
                }
            },
        )
        .unwrap();

        assert_eq!(files, vec!["a/one", "z.txt"]);
    }

    #[test]
    fn test_failing_file_callback_continues_but_fails_walk() {
        let temp_dir = sample_tree();
        let root = temp_dir.path();

        let mut visited = 0;
        let result = walk(
            root,
            &WalkOptions::sorted(),
            |path, _, _| {
                visited += 1;
                if path.ends_with("b/file") {
                    Err(Error::format("rejected"))
                } else {
                    Ok(Visit::Continue)
                }
            },
            descend,
        );

        assert_eq!(visited, 4);
        assert!(result.unwrap_err().to_string().contains("rejected"));
    }

    #[test]
    fn test_symlinks_are_reported_not_followed() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("real")).unwrap();
        fs::write(root.join("real/file"), "x").unwrap();
        std::os::unix::fs::symlink("real", root.join("linkdir")).unwrap();
        std::os::unix::fs::symlink("hostname", root.join("hostname")).unwrap();

        let mut symlinks = Vec::new();
        let mut files = Vec::new();
        walk(
            root,
            &WalkOptions::sorted(),
            |path, metadata, _| {
                if metadata.file_type().is_symlink() {
                    symlinks.push(relative(root, path));
                } else {
                    files.push(relative(root, path));
                }
                Ok(Visit::Continue)
            },
            descend,
        )
        .unwrap();

        assert_eq!(symlinks, vec!["hostname", "linkdir"]);
        assert_eq!(files, vec!["real/file"]);
    }

    #[test]
    fn test_file_root_and_non_recursive_root() {
        let temp_dir = sample_tree();
        let root = temp_dir.path();

        let mut calls = 0;
        walk(
            &root.join("z.txt"),
            &WalkOptions::sorted(),
            |path, _, depth| {
                calls += 1;
                assert!(path.ends_with("z.txt"));
                assert_eq!(depth, 0);
                Ok(Visit::Continue)
            },
            |_, _, _| panic!("no directory expected"),
        )
        .unwrap();
        assert_eq!(calls, 1);

        let mut dirs = 0;
        walk(
            root,
            &WalkOptions::default(),
            |_, _, _| panic!("non-recursive walk must not visit files"),
            |_, _, _| {
                dirs += 1;
                Ok(Visit::Continue)
            },
        )
        .unwrap();
        assert_eq!(dirs, 1);
    }

    #[test]
    fn test_depth_first_visits_directories_last() {
        let temp_dir = sample_tree();
        let root = temp_dir.path();

        let order = std::cell::RefCell::new(Vec::new());
        let options = WalkOptions {
            depth_first: true,
            ..WalkOptions::sorted()
        };
        walk(
            &root.join("b"),
            &options,
            |path, _, _| {
                order.borrow_mut().push(relative(root, path));
                Ok(Visit::Continue)
            },
            |path, _, _| {
                order.borrow_mut().push(relative(root, path));
                Ok(Visit::Continue)
            },
        )
        .unwrap();

        assert_eq!(
            order.into_inner(),
            vec!["b/file", "b/nested/deep", "b/nested", "b"]
        );
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = walk(
            &temp_dir.path().join("missing"),
            &WalkOptions::sorted(),
            |_, _, _| Ok(Visit::Continue),
            descend,
        );
        assert!(result.unwrap_err().is_not_found());
    }
}
