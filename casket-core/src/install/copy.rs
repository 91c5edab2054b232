// casket-core/src/install/copy.rs
use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

/// Recursively copies `source` to `target`, keeping symlinks as symlinks and
/// unix permissions as they are.
pub(crate) fn copy_tree(source: &Path, target: &Path) -> io::Result<()> {
    let meta = source.symlink_metadata()?;
    if !meta.is_dir() {
        return copy_entry(source, target, &meta);
    }
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let dest = target.join(rel);
        let meta = entry.path().symlink_metadata()?;
        if meta.is_dir() {
            fs::create_dir_all(&dest)?;
            fs::set_permissions(&dest, meta.permissions())?;
        } else {
            copy_entry(entry.path(), &dest, &meta)?;
        }
    }
    Ok(())
}

fn copy_entry(source: &Path, dest: &Path, meta: &fs::Metadata) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if meta.file_type().is_symlink() {
        let link = fs::read_link(source)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&link, dest)?;
        #[cfg(not(unix))]
        fs::copy(source, dest).map(|_| ())?;
        return Ok(());
    }
    fs::copy(source, dest)?;
    Ok(())
}

/// Moves `source` to `target`, copying across filesystems when a rename is not possible.
pub(crate) fn move_path(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(
                "rename {} -> {} failed ({}), copying instead",
                source.display(),
                target.display(),
                e
            );
            copy_tree(source, target)?;
            remove_any(source)
        }
    }
}

/// Removes a file, symlink or directory tree. A missing path is not an error.
pub(crate) fn remove_any(path: &Path) -> io::Result<()> {
    let meta = match path.symlink_metadata() {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn copies_trees_with_symlinks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("Foo.app");
        fs::create_dir_all(src.join("Contents/MacOS")).unwrap();
        fs::write(src.join("Contents/MacOS/foo"), "bin").unwrap();
        std::os::unix::fs::symlink("MacOS/foo", src.join("Contents/current")).unwrap();

        let dst = tmp.path().join("out/Foo.app");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("Contents/MacOS/foo")).unwrap(), "bin");
        assert_eq!(
            fs::read_link(dst.join("Contents/current")).unwrap(),
            Path::new("MacOS/foo")
        );
    }

    #[test]
    fn remove_any_tolerates_missing_paths() {
        let tmp = TempDir::new().unwrap();
        remove_any(&tmp.path().join("nope")).unwrap();
        let link = tmp.path().join("dangling");
        std::os::unix::fs::symlink("/nonexistent/target", &link).unwrap();
        remove_any(&link).unwrap();
        assert!(link.symlink_metadata().is_err());
    }
}
