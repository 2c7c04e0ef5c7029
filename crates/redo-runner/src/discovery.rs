use glob::Pattern;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::CompiledPatterns;

/// One dataset: the sub-directory name plus the two input files found in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub tag: String,
    pub structure: PathBuf,
    pub reflections: PathBuf,
}

pub type TargetSet = BTreeMap<String, Target>;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("input root not found: {0}")]
    RootNotFound(PathBuf),
    #[error("input root is not a directory: {0}")]
    RootNotDirectory(PathBuf),
    #[error("input root unreadable: {path}: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Scans the immediate sub-directories of `input_root`. A sub-directory
/// becomes a target only when both patterns match a file directly inside it;
/// anything else is left out of the set without error.
pub fn discover_targets(
    input_root: &Path,
    patterns: &CompiledPatterns,
) -> Result<TargetSet, DiscoveryError> {
    match fs::metadata(input_root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Err(DiscoveryError::RootNotDirectory(input_root.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(DiscoveryError::RootNotFound(input_root.to_path_buf()))
        }
        Err(e) => {
            return Err(DiscoveryError::RootUnreadable {
                path: input_root.to_path_buf(),
                source: e,
            })
        }
    }

    let mut targets = TargetSet::new();
    let walker = WalkDir::new(input_root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(DiscoveryError::RootUnreadable {
                    path: input_root.to_path_buf(),
                    source: e.into(),
                })
            }
            Err(e) => {
                warn!(error = %e, "skipping unreadable input entry");
                continue;
            }
        };
        let tag = entry.file_name().to_string_lossy().to_string();
        if tag.starts_with('.') {
            continue;
        }
        if tag == crate::RUN_SUMMARY_FILE {
            debug!(entry = %entry.path().display(), "name reserved for the run summary");
            continue;
        }
        if !entry.path().is_dir() {
            debug!(entry = %entry.path().display(), "not a dataset directory");
            continue;
        }
        if let Some(target) = target_from_dir(&tag, entry.path(), patterns) {
            targets.insert(tag, target);
        }
    }
    Ok(targets)
}

fn target_from_dir(tag: &str, dir: &Path, patterns: &CompiledPatterns) -> Option<Target> {
    let files = match list_files(dir) {
        Ok(files) => files,
        Err(e) => {
            warn!(dataset = tag, error = %e, "dataset directory unreadable; excluded");
            return None;
        }
    };
    let Some(structure) = pick_match(tag, "structure", &files, &patterns.structure) else {
        debug!(dataset = tag, "no structure file; excluded");
        return None;
    };
    let Some(reflections) = pick_match(tag, "reflections", &files, &patterns.reflections) else {
        debug!(dataset = tag, "no reflection data file; excluded");
        return None;
    };
    Some(Target {
        tag: tag.to_string(),
        structure,
        reflections,
    })
}

/// Regular files directly inside `dir`, sorted by file name.
fn list_files(dir: &Path) -> walkdir::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        if entry.path().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Lexicographically first match wins; extra matches are reported.
fn pick_match(tag: &str, kind: &str, files: &[PathBuf], pattern: &Pattern) -> Option<PathBuf> {
    let matches: Vec<&PathBuf> = files
        .iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| pattern.matches(n))
                .unwrap_or(false)
        })
        .collect();
    let first = matches.first()?;
    if matches.len() > 1 {
        warn!(
            dataset = tag,
            kind,
            chosen = %first.display(),
            ignored = ?matches[1..].iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
            "multiple candidate files; using the first by name"
        );
    }
    Some((*first).clone())
}
