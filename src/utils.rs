//! Utility functions shared across modules

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Format bytes for human readability (e.g., 1048576 -> "1.00 MB")
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.2} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.2} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Normalize a path string for case-insensitive comparison.
///
/// Converts all path separators to forward slashes and lowercases the path. Paths
/// that differ only in case or separator style compare equal, which is the
/// comparison rule used by the entry tree and watch targets.
///
/// # Examples
///
/// ```
/// use live_index::utils::normalize_path_for_comparison;
///
/// assert_eq!(normalize_path_for_comparison("C:\\Users\\Dev"), "c:/users/dev");
/// assert_eq!(normalize_path_for_comparison("/home/dev"), "/home/dev");
/// assert_eq!(normalize_path_for_comparison("/Home/Dev"), "/home/dev");
/// ```
pub fn normalize_path_for_comparison(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized.to_lowercase()
}

/// Case-insensitive lookup key for a single path segment.
pub fn segment_key(name: &str) -> String {
    name.to_lowercase()
}

/// Compare two paths ignoring case and separator style.
pub fn paths_equal(a: &Path, b: &Path) -> bool {
    normalize_path_for_comparison(&a.to_string_lossy())
        == normalize_path_for_comparison(&b.to_string_lossy())
}

/// Split an absolute path into segments.
///
/// The first segment is the filesystem root (`/` on Unix, `C:\` on Windows), the rest are
/// the names of nested entries. Returns `None` for relative paths.
pub fn split_path(path: &Path) -> Option<Vec<String>> {
    if !path.is_absolute() {
        return None;
    }

    let mut root = String::new();
    let mut segments: Vec<String> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => root.push_str(&prefix.as_os_str().to_string_lossy()),
            Component::RootDir => root.push(std::path::MAIN_SEPARATOR),
            Component::CurDir => {}
            Component::ParentDir => {
                segments.pop();
            }
            Component::Normal(name) => segments.push(name.to_string_lossy().into_owned()),
        }
    }

    segments.insert(0, root);
    Some(segments)
}

/// Inverse of [`split_path`].
pub fn combine_segments<S: AsRef<OsStr>>(segments: &[S]) -> PathBuf {
    let mut path = PathBuf::new();
    for segment in segments {
        path.push(segment.as_ref());
    }
    path
}

/// The root component of an absolute path (`/` or `C:\`).
pub fn path_root(path: &Path) -> Option<PathBuf> {
    split_path(path).map(|segments| PathBuf::from(&segments[0]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_windows_path() {
        assert_eq!(
            normalize_path_for_comparison("C:\\Users\\Developer\\project"),
            "c:/users/developer/project"
        );
    }

    #[test]
    fn test_normalize_mixed_case() {
        assert_eq!(
            normalize_path_for_comparison("/Home/Developer/Project"),
            "/home/developer/project"
        );
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 bytes");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[cfg(unix)]
    #[test]
    fn test_split_and_combine_roundtrip() {
        let path = Path::new("/home/dev/project/file.txt");
        let segments = split_path(path).unwrap();
        assert_eq!(segments, vec!["/", "home", "dev", "project", "file.txt"]);
        assert_eq!(combine_segments(&segments), path);
    }

    #[cfg(unix)]
    #[test]
    fn test_split_resolves_parent_components() {
        let segments = split_path(Path::new("/a/b/../c")).unwrap();
        assert_eq!(segments, vec!["/", "a", "c"]);
    }

    #[test]
    fn test_split_rejects_relative_path() {
        assert!(split_path(Path::new("relative/path")).is_none());
    }

    #[test]
    fn test_paths_equal_ignores_case() {
        assert!(paths_equal(Path::new("/Data/File.TXT"), Path::new("/data/file.txt")));
        assert!(!paths_equal(Path::new("/data/a"), Path::new("/data/b")));
    }
}
