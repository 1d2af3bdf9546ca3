use anyhow::{Context, Result};
use rand::RngCore;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Prefix of temporary entries created next to their final name.
pub const TEMP_PREFIX: &str = ".tmp-";

/// Filesystem helpers for the package cache.
pub struct IOUtil;

impl IOUtil {
    /// A random sibling path of `path` in the same directory, suitable as
    /// the source of an atomic rename onto `path`.
    pub fn temp_sibling(path: &Path) -> PathBuf {
        let mut token = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut token);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        dir.join(format!("{}{}-{}", TEMP_PREFIX, name, hex::encode(token)))
    }

    /// Write `data` to `path` so that readers see either nothing or the
    /// complete file: the bytes go to a temporary sibling first, which is
    /// then renamed into place.
    pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let temp = Self::temp_sibling(path);
        fs::write(&temp, data)
            .with_context(|| format!("Failed to write temporary file '{}'", temp.display()))?;
        if let Err(e) = fs::rename(&temp, path) {
            let _ = fs::remove_file(&temp);
            return Err(e)
                .with_context(|| format!("Failed to move '{}' into place", path.display()));
        }
        Ok(())
    }

    /// Point the symlink `link` at `target` (a name relative to the link's
    /// directory). A new link is created under a temporary name and renamed
    /// over `link`, so a concurrent reader resolving `link` sees either the
    /// old or the new target.
    #[cfg(unix)]
    pub fn replace_symlink(target: &str, link: &Path) -> Result<()> {
        let temp = Self::temp_sibling(link);
        std::os::unix::fs::symlink(target, &temp)
            .with_context(|| format!("Failed to create link '{}'", temp.display()))?;
        if let Err(e) = fs::rename(&temp, link) {
            let _ = fs::remove_file(&temp);
            return Err(e).with_context(|| {
                format!("Failed to rotate link '{}' -> '{}'", link.display(), target)
            });
        }
        Ok(())
    }

    /// Name of every entry (files, links, directories) directly in `dir`.
    pub fn list_file_names(dir: &Path) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to list '{}'", dir.display()))?
        {
            let entry = entry?;
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    /// Remove a file or symlink. Missing entries are not an error.
    pub fn delete_file(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete '{}'", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_sibling_stays_in_directory() {
        let temp = IOUtil::temp_sibling(Path::new("/var/cache/pkgs/runner.tgz"));
        assert_eq!(temp.parent(), Some(Path::new("/var/cache/pkgs")));
        let name = temp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".tmp-runner.tgz-"));
    }

    #[test]
    fn write_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.tar.gz");
        IOUtil::write_atomic(&path, b"payload").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"payload");
        let names = IOUtil::list_file_names(dir.path()).unwrap();
        assert_eq!(names.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn replace_symlink_rotates_target() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("v1"), b"one").unwrap();
        fs::write(dir.path().join("v2"), b"two").unwrap();
        let link = dir.path().join("latest");

        IOUtil::replace_symlink("v1", &link).unwrap();
        assert_eq!(fs::read(&link).unwrap(), b"one");

        IOUtil::replace_symlink("v2", &link).unwrap();
        assert_eq!(fs::read(&link).unwrap(), b"two");
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("v2"));

        let names = IOUtil::list_file_names(dir.path()).unwrap();
        let expected: BTreeSet<String> =
            ["latest", "v1", "v2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn delete_file_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(IOUtil::delete_file(&dir.path().join("nope")).is_ok());
    }
}
