//! Shared helpers for the four file channel kinds: path validation and the
//! opaque change-detection tag.
//!
//! Grounded on `cockpitfsread.c`/`test-fs.c`'s tag format (device, inode,
//! mtime) — the encoding itself is undocumented as wire contract (only
//! "different content produces a different tag" is), so this crate picks
//! one and keeps it stable across the four channel kinds that share it.

use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use crate::error::Problem;

/// Tag meaning "file does not exist" — distinct from any real tag because
/// no real device/inode/mtime tuple renders this way.
pub const MISSING_TAG: &str = "-";

/// Reject paths that are empty or attempt to climb above their own root via
/// a literal `..` component. Relative paths are otherwise accepted — the
/// caller is expected to run with an appropriate working directory.
pub fn validate_path(path: &str) -> Result<(), Problem> {
    if path.is_empty() {
        return Err(Problem::ProtocolError);
    }
    if Path::new(path).components().any(|c| c == std::path::Component::ParentDir) {
        return Err(Problem::AccessDenied);
    }
    Ok(())
}

/// Compute the change-detection tag for an existing file's metadata.
#[must_use]
pub fn tag_for_metadata(meta: &std::fs::Metadata) -> String {
    format!("{}:{}:{}:{}", meta.dev(), meta.ino(), meta.mtime(), meta.mtime_nsec())
}

/// Look up the current tag for `path`, or [`MISSING_TAG`] if it doesn't exist.
pub async fn current_tag(path: &str) -> Result<String, Problem> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(tag_for_metadata(&meta)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(MISSING_TAG.to_owned()),
        Err(err) => Err(Problem::from_io_error(&err)),
    }
}

/// Classify a directory entry's file type the way `fswatch1`/`fsdir1` report
/// it: `file`, `directory`, `link`, `special`, or `unknown`.
#[must_use]
pub fn entry_type_name(file_type: std::fs::FileType) -> &'static str {
    if file_type.is_symlink() {
        "link"
    } else if file_type.is_file() {
        "file"
    } else if file_type.is_dir() {
        "directory"
    } else if file_type.is_block_device()
        || file_type.is_char_device()
        || file_type.is_fifo()
        || file_type.is_socket()
    {
        "special"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_traversal_paths() {
        assert!(validate_path("").is_err());
        assert!(validate_path("../etc/passwd").is_err());
        assert!(validate_path("a/../b").is_err());
        assert!(validate_path("/etc/passwd").is_ok());
        assert!(validate_path("relative/path").is_ok());
    }

    #[tokio::test]
    async fn missing_file_yields_missing_tag() {
        let tag = current_tag("/definitely/does/not/exist/on/this/machine").await.unwrap();
        assert_eq!(tag, MISSING_TAG);
    }

    #[tokio::test]
    async fn existing_file_yields_stable_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        tokio::fs::write(&path, b"hi").await.unwrap();
        let a = current_tag(path.to_str().unwrap()).await.unwrap();
        let b = current_tag(path.to_str().unwrap()).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, MISSING_TAG);
    }
}
