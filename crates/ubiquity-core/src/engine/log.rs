//! Append-only transaction log of a cloud store
//!
//! Each device appends its own `<device>.jsonl` file inside the store's
//! log directory; one JSON line per applied change. Replaying every file
//! in timestamp order rebuilds the store.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{EngineError, EngineResult};
use crate::models::RecordChange;

const LOG_EXTENSION: &str = "jsonl";

/// One logged change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub device: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub change: RecordChange,
}

/// Writer for this device's log file
#[derive(Debug)]
pub struct TransactionLog {
    dir: PathBuf,
    device: String,
    next_sequence: u64,
}

impl TransactionLog {
    /// Open (creating the directory if needed) the log for `device`
    pub fn open(dir: &Path, device: &str) -> EngineResult<Self> {
        fs::create_dir_all(dir).map_err(|source| EngineError::Log {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut log = Self {
            dir: dir.to_path_buf(),
            device: device.to_string(),
            next_sequence: 0,
        };
        log.next_sequence = read_file(&log.file_path())?
            .last()
            .map(|entry| entry.sequence + 1)
            .unwrap_or(0);

        Ok(log)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// This device's log file
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.device, LOG_EXTENSION))
    }

    /// Append changes and sync them to disk
    pub fn append(&mut self, changes: &[RecordChange]) -> EngineResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let path = self.file_path();
        let log_err = |source| EngineError::Log {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(log_err)?;

        let now = Utc::now();
        let mut buffer = Vec::new();
        for change in changes {
            let entry = LogEntry {
                device: self.device.clone(),
                sequence: self.next_sequence,
                timestamp: now,
                change: change.clone(),
            };
            serde_json::to_writer(&mut buffer, &entry)?;
            buffer.push(b'\n');
            self.next_sequence += 1;
        }

        file.write_all(&buffer).map_err(log_err)?;
        file.sync_all().map_err(log_err)?;
        Ok(())
    }

    /// Read every device's entries, oldest first
    pub fn read_all(dir: &Path) -> EngineResult<Vec<LogEntry>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let listing = fs::read_dir(dir).map_err(|source| EngineError::Log {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut entries = Vec::new();
        for item in listing {
            let item = item.map_err(|source| EngineError::Log {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = item.path();
            if path.extension().map_or(false, |ext| ext == LOG_EXTENSION) {
                entries.extend(read_file(&path)?);
            }
        }

        entries.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.device.cmp(&b.device))
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        Ok(entries)
    }
}

/// Parse one log file; unreadable lines are skipped
fn read_file(path: &Path) -> EngineResult<Vec<LogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).map_err(|source| EngineError::Log {
        path: path.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| EngineError::Log {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("Skipping bad log line {} in {:?}: {}", number + 1, path, e),
        }
    }
    Ok(entries)
}
