//! Destructive store operations
//!
//! Deletion keeps going after a failure so as much as possible is removed;
//! every failure is returned for reporting and nothing is rolled back.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::engine::store_files;
use crate::error::StoreError;

/// Failed deletions, each with the path it was about
pub(crate) type DeleteFailures = Vec<(PathBuf, StoreError)>;

/// Delete a store file and its sidecars
///
/// Missing files are not an error.
pub(crate) fn delete_store(path: &Path) -> DeleteFailures {
    let mut failures = Vec::new();
    let mut removed = 0;

    for file in store_files(path) {
        match fs::remove_file(&file) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => failures.push((
                file.clone(),
                StoreError::Delete { path: file, source },
            )),
        }
    }

    if removed > 0 {
        info!("Deleted store {:?} ({} files)", path, removed);
    }
    failures
}

/// Delete a directory and everything in it
pub(crate) fn delete_directory(path: &Path) -> DeleteFailures {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            info!("Deleted {:?}", path);
            Vec::new()
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(source) => vec![(
            path.to_path_buf(),
            StoreError::Delete {
                path: path.to_path_buf(),
                source,
            },
        )],
    }
}
