//! Atomic file write utility.
//!
//! Write-to-temp-then-rename, used for the persisted peer id so a crash
//! mid-write never leaves a truncated id behind.

use std::path::Path;
use tracing::error;

/// Atomically write `content` to `path` via a temporary sibling and rename.
///
/// Parent directories are created if absent. On rename failure the temp
/// file is removed.
pub fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(event = "atomic_write_failure", path = %tmp_path.display(), error = %e);
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_overwrites_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("peer_id");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!path.with_extension("tmp").exists());
    }
}
