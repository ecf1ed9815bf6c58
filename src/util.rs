use std::fs;
use std::io::{self, Read};
use std::path::Path;

use crate::error::{Error, IoContext, Result};
use crate::walk::{self, Visit, WalkOptions};

/// Returns `path` relative to `root` as an archive entry name.
///
/// Entry names are stored as `/`-separated UTF-8 without a leading slash, so paths that
/// are not valid UTF-8 cannot be persisted.
pub fn entry_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        Error::format(format!(
            "{} is not inside {}",
            path.display(),
            root.display()
        ))
    })?;

    relative
        .to_str()
        .map(str::to_owned)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::format(format!("cannot store path {}", path.display())))
}

/// Byte-compares two regular files, checking their length first.
pub fn files_identical(a: &Path, b: &Path) -> io::Result<bool> {
    let (meta_a, meta_b) = (fs::metadata(a)?, fs::metadata(b)?);
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    let mut file_a = io::BufReader::new(fs::File::open(a)?);
    let mut file_b = io::BufReader::new(fs::File::open(b)?);
    let mut buf_a = [0u8; 4096];
    let mut buf_b = [0u8; 4096];

    loop {
        let read = file_a.read(&mut buf_a)?;
        if read == 0 {
            // Same length, so `b` must be exhausted too
            return Ok(true);
        }
        file_b.read_exact(&mut buf_b[..read])?;
        if buf_a[..read] != buf_b[..read] {
            return Ok(false);
        }
    }
}

/// Copy a directory tree, preserving permissions and symlinks.
pub fn copy_dir_all(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let src_path = src.as_ref();
    let dst_path = dst.as_ref();

    tracing::debug!(
        "Copying directory from {} to {}",
        src_path.display(),
        dst_path.display()
    );

    fs::create_dir_all(dst_path)?;
    let mode = fs::metadata(src_path)?.permissions().mode();
    fs::set_permissions(dst_path, fs::Permissions::from_mode(mode))?;

    for entry in fs::read_dir(src_path)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let path = entry.path();
        let target = dst_path.join(entry.file_name());

        if ty.is_dir() {
            copy_dir_all(&path, &target)?;
        } else if ty.is_file() {
            tracing::trace!("Copying file {} to {}", path.display(), target.display());
            remove_non_dir(&target)?;
            // fs::copy carries the permission bits over
            fs::copy(&path, &target)?;
        } else if ty.is_symlink() {
            tracing::trace!("Copying symlink {} to {}", path.display(), target.display());
            copy_symlink(&path, &target)?;
        } else {
            tracing::warn!("Skipping special file: {}", path.display());
        }
    }

    Ok(())
}

fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link_target = fs::read_link(src)?;
    remove_non_dir(dst)?;
    std::os::unix::fs::symlink(&link_target, dst)
}

/// Removes whatever non-directory exists at `path`; missing paths are fine.
pub fn remove_non_dir(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if !metadata.is_dir() => fs::remove_file(path),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes everything below `root`, keeping `root` itself.
pub fn clear_directory(root: &Path) -> Result<()> {
    tracing::debug!("Clearing {}", root.display());
    let options = WalkOptions {
        depth_first: true,
        ..WalkOptions::sorted()
    };

    walk::walk(
        root,
        &options,
        |path, _, depth| {
            if depth == 0 {
                return Err(Error::format(format!("{} is not a directory", path.display())));
            }
            fs::remove_file(path).with_path("remove", path)?;
            Ok(Visit::Continue)
        },
        |path, _, depth| {
            if depth > 0 {
                fs::remove_dir(path).with_path("remove directory", path)?;
            }
            Ok(Visit::Continue)
        },
    )
}

/// Runs `fsync()` on every regular file and directory below `dir`.
pub fn fsync_tree(dir: &Path) -> io::Result<()> {
    tracing::trace!("Running fsync() on {}", dir.display());

    // Symlinks are not followed; tombstones point nowhere
    let walker = jwalk::WalkDir::new(dir).follow_links(false);

    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type();

        if !(file_type.is_file() || file_type.is_dir()) {
            tracing::trace!("Skipping non-regular file for sync: {}", path.display());
            continue;
        }

        match fs::File::open(&path) {
            Ok(file) => {
                if let Err(e) = rustix::fs::fsync(&file) {
                    tracing::debug!("Failed to sync {}: {}", path.display(), e);
                }
            }
            Err(e) => {
                tracing::debug!("Failed to open {} for sync: {}", path.display(), e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_entry_name() {
        let root = Path::new("/env");
        assert_eq!(
            entry_name(root, Path::new("/env/config/hostname")).unwrap(),
            "config/hostname"
        );
        assert!(entry_name(root, Path::new("/env")).is_err());
        assert!(entry_name(root, Path::new("/other/file")).is_err());
    }

    #[test]
    fn test_files_identical() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a");
        let b = temp_dir.path().join("b");
        let c = temp_dir.path().join("c");
        let big = vec![7u8; 10_000];

        fs::write(&a, &big).unwrap();
        fs::write(&b, &big).unwrap();
        let mut changed = big.clone();
        changed[9_999] = 8;
        fs::write(&c, &changed).unwrap();

        assert!(files_identical(&a, &b).unwrap());
        assert!(!files_identical(&a, &c).unwrap());

        fs::write(&c, b"short").unwrap();
        assert!(!files_identical(&a, &c).unwrap());
    }

    #[test]
    fn test_copy_dir_all_preserves_modes_and_links() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/init"), "A").unwrap();
        fs::set_permissions(src.join("bin/init"), fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("init", src.join("bin/start")).unwrap();

        copy_dir_all(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("bin/init")).unwrap(), b"A");
        let mode = fs::metadata(dst.join("bin/init")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            fs::read_link(dst.join("bin/start")).unwrap(),
            Path::new("init")
        );
    }

    #[test]
    fn test_clear_directory_keeps_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/c"), "c").unwrap();
        fs::write(root.join("top"), "t").unwrap();
        std::os::unix::fs::symlink("gone", root.join("a/tombstone")).unwrap();

        clear_directory(root).unwrap();

        assert!(root.is_dir());
        assert_eq!(fs::read_dir(root).unwrap().count(), 0);
    }

    #[test]
    fn test_fsync_tree() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("dir")).unwrap();
        fs::write(temp_dir.path().join("dir/file"), "x").unwrap();
        std::os::unix::fs::symlink("dangling", temp_dir.path().join("link")).unwrap();
        fsync_tree(temp_dir.path()).unwrap();
    }
}
