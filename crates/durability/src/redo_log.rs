//! Append-only redo log file
//!
//! One file, framed records, append at the end. Reading tolerates a torn
//! tail: the first frame that fails to parse ends the scan with a warning,
//! and subsequent appends continue after the last good record.

use crate::record::RedoLogRecord;
use amber_core::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// The redo log file.
pub struct RedoLog {
    file: File,
    path: PathBuf,
}

impl RedoLog {
    /// Open (or create) the redo log at `path` and position for appending.
    ///
    /// Returns the log plus every record that survives a tail-tolerant scan,
    /// in append order. The write position is placed after the last good
    /// record so a torn tail is overwritten by the next append.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<RedoLogRecord>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut reader = BufReader::new(file.try_clone()?);
        let mut records = Vec::new();
        let mut good_end = 0u64;
        loop {
            match RedoLogRecord::read_frame(&mut reader) {
                Ok(Some(record)) => {
                    records.push(record);
                    good_end = reader.stream_position()?;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        offset = good_end,
                        error = %e,
                        "redo log tail unreadable, truncating scan"
                    );
                    break;
                }
            }
        }

        let mut log = RedoLog { file, path };
        log.file.set_len(good_end)?;
        log.file.seek(SeekFrom::Start(good_end))?;
        Ok((log, records))
    }

    /// Append a record. Does not sync; call [`RedoLog::sync`] for durability.
    pub fn append(&mut self, record: &RedoLogRecord) -> Result<()> {
        let frame = record.to_frame()?;
        self.file.write_all(&frame)?;
        Ok(())
    }

    /// Flush buffered writes and fsync the file
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
