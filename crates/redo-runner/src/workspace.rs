use anyhow::Result;
use chrono::Utc;
use glob::Pattern;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum OutputSpaceError {
    #[error("failed to create output location {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("output location {0} is not an empty directory after reset")]
    NotEmpty(PathBuf),
}

/// True when `location` is a directory holding at least one regular file whose
/// name matches `marker`. Missing or unreadable directories count as not
/// complete.
pub fn is_complete(location: &Path, marker: &Pattern) -> bool {
    let Ok(entries) = fs::read_dir(location) else {
        return false;
    };
    entries.filter_map(|e| e.ok()).any(|entry| {
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        is_file
            && entry
                .file_name()
                .to_str()
                .map(|name| marker.matches(name))
                .unwrap_or(false)
    })
}

/// Removes `location` recursively and recreates it empty.
///
/// A missing location is the normal first-run case. Other removal failures
/// are logged against `tag` and the reset carries on; the empty-directory
/// postcondition is checked at the end instead.
pub fn reset_output_location(tag: &str, location: &Path) -> Result<(), OutputSpaceError> {
    match fs::remove_dir_all(location) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(
                dataset = tag,
                path = %location.display(),
                error = %e,
                "failed to remove stale output location"
            );
        }
    }
    ensure_dir(location).map_err(|source| OutputSpaceError::Create {
        path: location.to_path_buf(),
        source,
    })?;
    if !dir_is_empty(location) {
        return Err(OutputSpaceError::NotEmpty(location.to_path_buf()));
    }
    Ok(())
}

fn dir_is_empty(path: &Path) -> bool {
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => false,
    }
}

pub(crate) fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Writes through a sibling temp file and renames it into place so readers
/// never observe a partial file.
pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub(crate) fn atomic_write_json_pretty(path: &Path, value: &serde_json::Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scratch_dir;

    fn marker() -> Pattern {
        Pattern::new("*_final.pdb").expect("pattern")
    }

    #[test]
    fn missing_location_is_not_complete() {
        let root = scratch_dir("oracle_missing");
        assert!(!is_complete(&root.join("ds1"), &marker()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn marker_file_signals_completion() {
        let root = scratch_dir("oracle_marker");
        let location = root.join("ds1");
        ensure_dir(&location).expect("dir");
        fs::write(location.join("feedback.txt"), "partial").expect("write");
        assert!(!is_complete(&location, &marker()));

        fs::write(location.join("ds1_final.pdb"), "ATOM").expect("write");
        assert!(is_complete(&location, &marker()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn marker_named_directory_does_not_count() {
        let root = scratch_dir("oracle_dir_marker");
        let location = root.join("ds1");
        ensure_dir(&location.join("old_final.pdb")).expect("dir");
        assert!(!is_complete(&location, &marker()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reset_clears_existing_contents() {
        let root = scratch_dir("reset_existing");
        let location = root.join("ds1");
        ensure_dir(&location.join("nested")).expect("dir");
        fs::write(location.join("nested/stale.log"), "old").expect("write");
        fs::write(location.join("feedback.txt"), "old").expect("write");

        reset_output_location("ds1", &location).expect("reset");
        assert!(location.is_dir());
        assert_eq!(fs::read_dir(&location).expect("read").count(), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reset_creates_missing_location() {
        let root = scratch_dir("reset_missing");
        let location = root.join("nested").join("ds1");
        reset_output_location("ds1", &location).expect("reset");
        assert!(location.is_dir());
        assert_eq!(fs::read_dir(&location).expect("read").count(), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reset_fails_when_location_is_blocked_by_file() {
        let root = scratch_dir("reset_blocked");
        let blocker = root.join("blocker");
        fs::write(&blocker, "file").expect("write");
        let err = reset_output_location("ds1", &blocker.join("ds1")).expect_err("must fail");
        assert!(matches!(err, OutputSpaceError::Create { .. }), "{:?}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let root = scratch_dir("atomic_write");
        let path = root.join("out").join("summary.json");
        atomic_write_bytes(&path, b"first").expect("write");
        atomic_write_bytes(&path, b"second").expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
        let leftovers: Vec<_> = fs::read_dir(root.join("out"))
            .expect("read")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(root);
    }
}
