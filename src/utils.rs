//! Filesystem primitives shared by every component.

use crate::{
    error::{IoResultExt, KilnError, Result},
    logging::Log,
    paths::ProjectPath,
};
use sha1::{Digest, Sha1};
use std::{
    collections::BTreeSet,
    fs,
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use walkdir::WalkDir;

/// Canonicalize the path, platform-agnostic.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    dunce::canonicalize(path).err_path(path)
}

/// Canonicalizes but does not treat a non-existing path as an error.
pub fn canonicalized(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    canonicalize(&path).unwrap_or(path)
}

/// Returns `target` relative to `base` iff `target` is within `base`'s
/// canonical directory.
pub fn relativize(base: &Path, target: &Path) -> Option<PathBuf> {
    let base = canonicalized(base);
    let target = canonicalized(target);
    target.strip_prefix(&base).ok().map(Path::to_path_buf)
}

/// Modification time in milliseconds since the epoch, `0` when missing.
pub fn last_modified(path: &Path) -> u64 {
    path.metadata()
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Creates the parent directory of `file` and all its ancestors.
pub fn create_parent_dir_all(file: &Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).err_path(parent)?;
    }
    Ok(())
}

/// Copies each source into `dest_dir` preserving its relative path,
/// recreating the directory structure. Destinations newer than their source
/// are left alone. Returns the set of destination paths.
pub fn copy<'a>(
    sources: impl IntoIterator<Item = &'a ProjectPath>,
    dest_dir: &Path,
) -> Result<BTreeSet<PathBuf>> {
    let mut copied = BTreeSet::new();
    for source in sources {
        let dest = dest_dir.join(source.relative_path());
        copy_file(source.as_file(), &dest)?;
        copied.insert(dest);
    }
    Ok(copied)
}

/// Copies by filename only. On a name collision the last write wins, and the
/// returned set records one destination per unique name.
pub fn copy_flat<'a>(
    sources: impl IntoIterator<Item = &'a ProjectPath>,
    dest_dir: &Path,
) -> Result<BTreeSet<PathBuf>> {
    let mut copied = BTreeSet::new();
    for source in sources {
        let Some(name) = source.as_file().file_name() else { continue };
        let dest = dest_dir.join(name);
        create_parent_dir_all(&dest)?;
        fs::copy(source.as_file(), &dest).err_path(source.as_file())?;
        copied.insert(dest);
    }
    Ok(copied)
}

fn copy_file(source: &Path, dest: &Path) -> Result<()> {
    if dest.exists() && last_modified(dest) >= last_modified(source) {
        return Ok(());
    }
    create_parent_dir_all(dest)?;
    if source.is_dir() {
        fs::create_dir_all(dest).err_path(dest)?;
    } else {
        fs::copy(source, dest).err_path(source)?;
    }
    Ok(())
}

/// Copies everything under `source_dir` into `dest_dir`, then deletes files
/// in `dest_dir` absent from the source. Returns the destination paths kept.
pub fn sync(source_dir: &Path, dest_dir: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut kept = BTreeSet::new();
    for entry in WalkDir::new(source_dir).follow_links(true) {
        let entry = entry.map_err(|err| KilnError::msg(err))?;
        let Some(relative) = relativize(source_dir, entry.path()) else { continue };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest = dest_dir.join(&relative);
        copy_file(entry.path(), &dest)?;
        kept.insert(dest);
    }
    if dest_dir.exists() {
        let stale: Vec<PathBuf> = WalkDir::new(dest_dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.path().to_path_buf())
            .filter(|path| !kept.contains(path))
            .collect();
        for path in stale {
            fs::remove_file(&path).err_path(&path)?;
        }
        prune_empty_directories(dest_dir)?;
    }
    Ok(kept)
}

fn prune_empty_directories(dir: &Path) -> Result<()> {
    let entries: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.path().to_path_buf())
        .collect();
    // deepest first, so emptied parents go too
    for path in entries.into_iter().rev() {
        if path != dir && fs::read_dir(&path).map(|mut it| it.next().is_none()).unwrap_or(false) {
            fs::remove_dir(&path).err_path(&path)?;
        }
    }
    Ok(())
}

/// Recursively deletes each path. Missing paths are not an error.
pub fn clean<'a>(
    paths: impl IntoIterator<Item = &'a Path>,
    quiet: bool,
    log: &dyn Log,
) -> Result<()> {
    for path in paths {
        if !path.exists() {
            continue;
        }
        if path.is_dir() {
            if !quiet {
                log.info(&format!("Deleting directory {}", path.display()));
            }
            fs::remove_dir_all(path).err_path(path)?;
        } else {
            if !quiet {
                log.debug(&format!("Deleting file {}", path.display()));
            }
            fs::remove_file(path).err_path(path)?;
        }
    }
    Ok(())
}

pub fn read_string(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(fs::File::open(path).err_path(path)?);
    let mut content = String::new();
    reader.read_to_string(&mut content).err_path(path)?;
    Ok(content)
}

pub fn write_string(path: &Path, content: &str) -> Result<()> {
    write_bytes(path, content.as_bytes())
}

pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let mut reader = BufReader::new(fs::File::open(path).err_path(path)?);
    let mut content = Vec::new();
    reader.read_to_end(&mut content).err_path(path)?;
    Ok(content)
}

pub fn write_bytes(path: &Path, content: &[u8]) -> Result<()> {
    create_parent_dir_all(path)?;
    let mut writer = BufWriter::new(fs::File::create(path).err_path(path)?);
    writer.write_all(content).err_path(path)?;
    writer.flush().err_path(path)
}

/// Buffered scoped read: hands the open reader to `f`.
pub fn read_value<T>(
    path: &Path,
    f: impl FnOnce(&mut BufReader<fs::File>) -> std::io::Result<T>,
) -> Result<T> {
    let mut reader = BufReader::new(fs::File::open(path).err_path(path)?);
    f(&mut reader).err_path(path)
}

/// Buffered scoped write: hands the open writer to `f`, creating parents.
pub fn write_value<T>(
    path: &Path,
    f: impl FnOnce(&mut BufWriter<fs::File>) -> std::io::Result<T>,
) -> Result<T> {
    create_parent_dir_all(path)?;
    let mut writer = BufWriter::new(fs::File::create(path).err_path(path)?);
    let value = f(&mut writer).err_path(path)?;
    writer.flush().err_path(path)?;
    Ok(value)
}

/// Ensures `path` exists as a file, updating its modification time.
pub fn touch(path: &Path) -> Result<()> {
    create_parent_dir_all(path)?;
    fs::OpenOptions::new().create(true).write(true).truncate(false).open(path).err_path(path)?;
    let file = fs::OpenOptions::new().write(true).open(path).err_path(path)?;
    file.set_modified(std::time::SystemTime::now()).err_path(path)?;
    Ok(())
}

const TEMPORARY_ATTEMPTS: usize = 10;

/// Creates a fresh temporary directory, retrying with a new randomized name
/// a bounded number of times. The directory is the caller's to delete.
pub fn create_temporary_directory() -> Result<PathBuf> {
    let mut last_error = None;
    for _ in 0..TEMPORARY_ATTEMPTS {
        match tempfile::Builder::new().prefix("kiln_").tempdir() {
            Ok(dir) => return Ok(dir.into_path()),
            Err(err) => last_error = Some(err),
        }
    }
    Err(KilnError::msg(format!(
        "could not create temporary directory: {}",
        last_error.map(|err| err.to_string()).unwrap_or_default()
    )))
}

/// Scoped acquisition of a temporary directory, deleted on all exit paths.
pub fn do_in_temporary_directory<T>(f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
    let dir = tempfile::Builder::new()
        .prefix("kiln_")
        .tempdir()
        .map_err(|err| KilnError::msg(format!("could not create temporary directory: {err}")))?;
    f(dir.path())
}

/// SHA-1 of the given bytes, hex-encoded.
pub fn hash_bytes(content: &[u8]) -> String {
    hex::encode(Sha1::digest(content))
}

/// SHA-1 of the file contents, hex-encoded.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut hasher = Sha1::new();
    let mut reader = BufReader::new(fs::File::open(path).err_path(path)?);
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer).err_path(path)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::ConsoleLogger;
    use crate::paths::ProjectPath;

    fn tempdir() -> tempfile::TempDir {
        tempfile::Builder::new().prefix("kiln_test").tempdir().unwrap()
    }

    #[test]
    fn relativize_requires_containment() {
        let dir = tempdir();
        let inner = dir.path().join("a/b.txt");
        fs::create_dir_all(inner.parent().unwrap()).unwrap();
        fs::write(&inner, b"x").unwrap();
        assert_eq!(relativize(dir.path(), &inner), Some(PathBuf::from("a/b.txt")));
        assert_eq!(relativize(&dir.path().join("a"), dir.path()), None);
    }

    #[test]
    fn copy_preserves_relative_paths() {
        let dir = tempdir();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/f.txt"), b"content").unwrap();

        let root = ProjectPath::root(dir.path());
        let source = root.resolve(Path::new("src/nested/f.txt")).unwrap();
        let dest_dir = dir.path().join("out");
        let copied = copy([&source], &dest_dir).unwrap();

        let expected = dest_dir.join("src/nested/f.txt");
        assert!(copied.contains(&expected));
        assert_eq!(fs::read(expected).unwrap(), b"content");
    }

    #[test]
    fn copy_flat_last_write_wins() {
        let dir = tempdir();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("a/f.txt"), b"first").unwrap();
        fs::write(dir.path().join("b/f.txt"), b"second").unwrap();

        let root = ProjectPath::root(dir.path());
        let first = root.resolve(Path::new("a/f.txt")).unwrap();
        let second = root.resolve(Path::new("b/f.txt")).unwrap();
        let dest = dir.path().join("out");
        let copied = copy_flat([&first, &second], &dest).unwrap();
        assert_eq!(copied.len(), 1);
        assert_eq!(fs::read(dest.join("f.txt")).unwrap(), b"second");
    }

    #[test]
    fn sync_deletes_stale_files() {
        let dir = tempdir();
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(dest.join("old")).unwrap();
        fs::write(src.join("keep.txt"), b"k").unwrap();
        fs::write(dest.join("old/stale.txt"), b"s").unwrap();

        sync(&src, &dest).unwrap();
        assert!(dest.join("keep.txt").exists());
        assert!(!dest.join("old/stale.txt").exists());
        assert!(!dest.join("old").exists());
    }

    #[test]
    fn clean_removes_recursively() {
        let dir = tempdir();
        let target = dir.path().join("target");
        fs::create_dir_all(target.join("classes")).unwrap();
        fs::write(target.join("classes/A.class"), b"").unwrap();
        let log = ConsoleLogger::new();
        clean([target.as_path()], true, &log).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn scoped_temporary_directory_is_deleted() {
        let mut seen = PathBuf::new();
        do_in_temporary_directory(|dir| {
            seen = dir.to_path_buf();
            assert!(dir.is_dir());
            Ok(())
        })
        .unwrap();
        assert!(!seen.exists());
    }

    #[test]
    fn hash_changes_with_content() {
        let dir = tempdir();
        let file = dir.path().join("f.txt");
        fs::write(&file, b"one").unwrap();
        let first = hash_file(&file).unwrap();
        assert_eq!(first, hash_bytes(b"one"));
        fs::write(&file, b"two").unwrap();
        assert_ne!(hash_file(&file).unwrap(), first);
    }
}
