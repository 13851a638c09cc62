//! Coordinator error handling
//!
//! Every failure inside the coordinator is reported with the operation it
//! happened in ([`ErrorCause`]), a typed [`StoreError`] and an
//! [`ErrorContext`] describing what was being touched.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;
use crate::models::BackendKind;

/// Operation during which a failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCause {
    /// Deleting a store file or its transaction logs
    DeleteStore,
    /// Creating the directory a store is saved in
    CreateStorePath,
    /// Detaching the active store
    ClearStore,
    /// Opening the local store
    OpenLocalStore,
    /// Opening the cloud store
    OpenCloudStore,
    /// Seeding the cloud store from the local store
    MigrateLocalToCloudStore,
    /// Merging imported cloud changes into the application's context
    ImportChanges,
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCause::DeleteStore => "delete store",
            ErrorCause::CreateStorePath => "create store path",
            ErrorCause::ClearStore => "clear store",
            ErrorCause::OpenLocalStore => "open local store",
            ErrorCause::OpenCloudStore => "open cloud store",
            ErrorCause::MigrateLocalToCloudStore => "migrate local store to cloud",
            ErrorCause::ImportChanges => "import changes",
        };
        f.write_str(name)
    }
}

/// What the failing operation was working on
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorContext {
    None,
    Path(PathBuf),
    Store { kind: BackendKind, path: PathBuf },
    Changes { origin: String, count: usize },
}

/// Errors reported by the coordinator
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to create a store directory
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// File not found (when expected to exist)
    #[error("File not found: '{path}'")]
    NotFound { path: PathBuf },

    /// Failed to remove a file or directory
    #[error("Failed to delete '{path}': {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Generic I/O error on a path
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Persistence engine error
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Identity register error
    #[error("Identity register error: {0}")]
    Register(String),

    /// Target of a migration already holds data
    #[error("Refusing to seed '{path}': a store already exists there")]
    TargetExists { path: PathBuf },

    /// No cloud container is available
    #[error("No cloud container is available")]
    NoContainer,

    /// Application data context rejected the operation
    #[error("Data context error: {0}")]
    Context(String),

    /// The switch worker thread could not be started
    #[error("Failed to start store worker: {0}")]
    WorkerStart(#[source] io::Error),

    /// The switch worker is no longer running
    #[error("Store worker has stopped")]
    Stopped,
}

impl StoreError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StoreError::PermissionDenied {
                path,
                source: error,
            },
            io::ErrorKind::NotFound => StoreError::NotFound { path },
            _ if is_disk_full_error(&error) => StoreError::DiskFull {
                path,
                source: error,
            },
            _ => StoreError::Io {
                path,
                source: error,
            },
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            StoreError::DiskFull { .. } | StoreError::PermissionDenied { .. } => true,
            StoreError::Engine(engine) => engine.is_permission_denied(),
            _ => false,
        }
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StoreError::DiskFull { .. } => Some("Free up disk space and try again."),
            StoreError::Engine(engine) if !engine.is_permission_denied() => None,
            StoreError::PermissionDenied { .. } | StoreError::Engine(_) => Some(
                "Check file and directory permissions. You may need to change ownership of the store directory.",
            ),
            StoreError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            StoreError::TargetExists { .. } => {
                Some("Delete the cloud store or enable the cloud without seeding.")
            }
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for coordinator operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StoreError::from_io(io_err, PathBuf::from("/test/path"));

        assert!(matches!(err, StoreError::PermissionDenied { .. }));
        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_not_found_classification() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = StoreError::from_io(io_err, PathBuf::from("/missing/file"));

        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_disk_full_detection() {
        let io_err = io::Error::new(io::ErrorKind::Other, "No space left on device");
        let err = StoreError::from_io(io_err, PathBuf::from("/full/disk"));

        assert!(matches!(err, StoreError::DiskFull { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_engine_permission_error_has_suggestion() {
        let err = StoreError::from(EngineError::PermissionDenied {
            path: PathBuf::from("/cloud/Notes.sqlite"),
        });

        assert!(err.is_recoverable());
        assert!(err
            .recovery_suggestion()
            .is_some_and(|hint| hint.contains("permissions")));
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::PermissionDenied {
            path: PathBuf::from("/test/file"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };

        let msg = err.to_string();
        assert!(msg.contains("Permission denied"));
        assert!(msg.contains("/test/file"));
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(ErrorCause::OpenCloudStore.to_string(), "open cloud store");
        assert_eq!(
            ErrorCause::MigrateLocalToCloudStore.to_string(),
            "migrate local store to cloud"
        );
    }
}
