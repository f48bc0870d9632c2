//! Operating system services with one implementation per platform.
//!
//! Two guarantees are needed that the standard library does not expose portably: resolving
//! the current location of an open directory (to detect a watched root that was renamed
//! under us) and opening file content so that other processes can still delete the file
//! while it is read.
//!
//! * Linux resolves an open directory through `/proc/self/fd`.
//! * Other Unix systems compare the device and inode of the remembered path with the ones
//!   captured when the handle was opened.
//! * Windows only checks that the remembered path is still a directory.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// A directory opened at subscription time, used to find out where it lives now.
#[derive(Debug)]
pub struct DirectoryHandle {
    initial: PathBuf,
    #[cfg(target_os = "linux")]
    file: File,
    #[cfg(all(unix, not(target_os = "linux")))]
    identity: (u64, u64),
}

impl DirectoryHandle {
    #[cfg(target_os = "linux")]
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let initial = resolve_fd(&file).unwrap_or_else(|| path.to_path_buf());
        Ok(Self { initial, file })
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    pub fn open(path: &Path) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let metadata = std::fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(io::Error::new(io::ErrorKind::Other, "not a directory"));
        }
        Ok(Self {
            initial: path.to_path_buf(),
            identity: (metadata.dev(), metadata.ino()),
        })
    }

    #[cfg(not(unix))]
    pub fn open(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(io::Error::new(io::ErrorKind::Other, "not a directory"));
        }
        Ok(Self {
            initial: path.to_path_buf(),
        })
    }

    /// Path recorded when the handle was opened.
    pub fn initial_path(&self) -> &Path {
        &self.initial
    }

    /// Where the directory is now, or `None` if it was deleted or cannot be located.
    #[cfg(target_os = "linux")]
    pub fn current_path(&self) -> Option<PathBuf> {
        resolve_fd(&self.file)
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    pub fn current_path(&self) -> Option<PathBuf> {
        use std::os::unix::fs::MetadataExt;

        let metadata = std::fs::metadata(&self.initial).ok()?;
        ((metadata.dev(), metadata.ino()) == self.identity).then(|| self.initial.clone())
    }

    #[cfg(not(unix))]
    pub fn current_path(&self) -> Option<PathBuf> {
        self.initial.is_dir().then(|| self.initial.clone())
    }
}

#[cfg(target_os = "linux")]
fn resolve_fd(file: &File) -> Option<PathBuf> {
    use std::os::unix::io::AsRawFd;

    let link = std::fs::read_link(format!("/proc/self/fd/{}", file.as_raw_fd())).ok()?;
    let text = link.to_string_lossy();
    if text.ends_with(" (deleted)") {
        return None;
    }
    Some(link)
}

/// Create `link` as a hard link to `existing`.
pub fn create_hard_link(existing: &Path, link: &Path) -> io::Result<()> {
    std::fs::hard_link(existing, link)
}

/// Open a temporary hard link for reading so that it disappears once the reader is done.
///
/// On Unix the link is unlinked right after opening; the open descriptor keeps the content
/// alive. On Windows the file is opened with delete-on-close and full sharing.
#[cfg(unix)]
pub fn open_temporary(link: &Path) -> io::Result<File> {
    let file = File::open(link)?;
    std::fs::remove_file(link)?;
    Ok(file)
}

#[cfg(windows)]
pub fn open_temporary(link: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;

    const GENERIC_READ: u32 = 0x8000_0000;
    const DELETE: u32 = 0x0001_0000;
    const FILE_FLAG_DELETE_ON_CLOSE: u32 = 0x0400_0000;
    const FILE_FLAG_SEQUENTIAL_SCAN: u32 = 0x0800_0000;
    const SHARE_ALL: u32 = 0x1 | 0x2 | 0x4;

    std::fs::OpenOptions::new()
        .read(true)
        .access_mode(GENERIC_READ | DELETE)
        .share_mode(SHARE_ALL)
        .custom_flags(FILE_FLAG_DELETE_ON_CLOSE | FILE_FLAG_SEQUENTIAL_SCAN)
        .open(link)
}

/// Open a file for reading while letting other processes write, rename or delete it.
#[cfg(windows)]
pub fn open_shared(path: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;

    const SHARE_ALL: u32 = 0x1 | 0x2 | 0x4;
    std::fs::OpenOptions::new()
        .read(true)
        .share_mode(SHARE_ALL)
        .open(path)
}

#[cfg(not(windows))]
pub fn open_shared(path: &Path) -> io::Result<File> {
    File::open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_directory_handle_reports_initial_path() {
        let dir = TempDir::new().unwrap();
        let handle = DirectoryHandle::open(dir.path()).unwrap();

        let current = handle.current_path().unwrap();
        assert_eq!(
            current.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_directory_handle_follows_rename() {
        let dir = TempDir::new().unwrap();
        let before = dir.path().join("before");
        let after = dir.path().join("after");
        std::fs::create_dir(&before).unwrap();

        let handle = DirectoryHandle::open(&before).unwrap();
        std::fs::rename(&before, &after).unwrap();

        assert_eq!(
            handle.current_path().unwrap(),
            after.canonicalize().unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_handle_detects_deletion() {
        let dir = TempDir::new().unwrap();
        let watched = dir.path().join("watched");
        std::fs::create_dir(&watched).unwrap();

        let handle = DirectoryHandle::open(&watched).unwrap();
        std::fs::remove_dir(&watched).unwrap();

        assert!(handle.current_path().is_none());
    }

    #[test]
    fn test_open_temporary_removes_link() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("original.txt");
        let link = dir.path().join("link");
        std::fs::write(&original, "shared content").unwrap();

        create_hard_link(&original, &link).unwrap();
        let mut file = open_temporary(&link).unwrap();
        let mut text = String::new();
        file.read_to_string(&mut text).unwrap();
        drop(file);

        assert_eq!(text, "shared content");
        assert!(!link.exists());
        assert!(original.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_content_survives_deletion_of_original() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("original.txt");
        let link = dir.path().join("link");
        std::fs::write(&original, "still readable").unwrap();

        create_hard_link(&original, &link).unwrap();
        let mut file = open_temporary(&link).unwrap();
        std::fs::remove_file(&original).unwrap();

        let mut text = String::new();
        file.read_to_string(&mut text).unwrap();
        assert_eq!(text, "still readable");
    }
}
