//! Resource expansion
//!
//! Before a resource send, every directory argument is expanded
//! breadth-first into its flat list of contained files. Each file's wire
//! name is its path relative to the directory's parent, joined with `/`, so
//! nested directories round-trip on the receiving side. Plain file
//! arguments keep just their file name.
//!
//! Files that fail to stat are skipped rather than failing the whole batch;
//! the skip count is logged so the caller can at least see it happened.

use crate::device::FileEntry;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Expanded batch: flat file list plus the summed byte count
#[derive(Debug, Default)]
pub struct Manifest {
    pub files: Vec<FileEntry>,
    pub total_bytes: u64,
}

/// Expand file and directory arguments into a flat manifest.
///
/// Directory contents are discovered breadth-first; entries that cannot be
/// stat'd or read are skipped silently (counted in the warning log only).
pub fn expand_resources(resources: &[PathBuf]) -> Manifest {
    let mut manifest = Manifest::default();
    let mut skipped = 0usize;

    for resource in resources {
        let info = match fs::metadata(resource) {
            Ok(info) => info,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };

        if info.is_dir() {
            expand_dir(resource, &mut manifest, &mut skipped);
        } else {
            let name = match file_name(resource) {
                Some(name) => name,
                None => {
                    skipped += 1;
                    continue;
                }
            };
            manifest.total_bytes += info.len();
            manifest
                .files
                .push(FileEntry::new(resource.clone(), name, info.len()));
        }
    }

    if skipped > 0 {
        warn!(skipped, "skipped unreadable entries during expansion");
    }
    manifest
}

fn expand_dir(root: &Path, manifest: &mut Manifest, skipped: &mut usize) {
    let root_name = match file_name(root) {
        Some(name) => name,
        None => {
            *skipped += 1;
            return;
        }
    };

    let mut queue: VecDeque<(PathBuf, String)> = VecDeque::new();
    queue.push_back((root.to_path_buf(), root_name));

    while let Some((dir, dir_name)) = queue.pop_front() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => {
                *skipped += 1;
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => {
                    *skipped += 1;
                    continue;
                }
            };
            let sub_path = entry.path();
            let sub_name = match file_name(&sub_path) {
                Some(name) => format!("{dir_name}/{name}"),
                None => {
                    *skipped += 1;
                    continue;
                }
            };

            match fs::metadata(&sub_path) {
                Ok(info) if info.is_dir() => queue.push_back((sub_path, sub_name)),
                Ok(info) => {
                    manifest.total_bytes += info.len();
                    manifest
                        .files
                        .push(FileEntry::new(sub_path, sub_name, info.len()));
                }
                Err(_) => *skipped += 1,
            }
        }
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}
