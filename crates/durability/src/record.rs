//! Redo-log record format
//!
//! On-disk frame layout:
//!
//! ```text
//! [ body_len: u32 LE ][ crc32(body): u32 LE ][ body: bincode(RedoLogRecord) ]
//! ```
//!
//! The CRC covers the serialized body only. A frame whose length or checksum
//! does not add up marks the torn tail of the log; readers stop there.

use amber_core::{AmberError, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// A single committed transaction's durable record.
///
/// The operation buffer is opaque at this layer; the transaction engine
/// serializes its undo log into it at commit time and decodes it again
/// during replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedoLogRecord {
    /// Id of the committing transaction
    pub transaction_id: u64,
    /// Serialized undo-operation buffer
    pub operations: Vec<u8>,
}

impl RedoLogRecord {
    /// Create a record for a local transaction commit
    pub fn new(transaction_id: u64, operations: Vec<u8>) -> Self {
        RedoLogRecord {
            transaction_id,
            operations,
        }
    }

    /// Serialize into a self-delimiting frame
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let crc = crc32fast::hash(&body);
        let mut frame = Vec::with_capacity(8 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Read one frame from `reader`.
    ///
    /// Returns `Ok(None)` at a clean end of input. A short read mid-frame or
    /// a checksum mismatch is reported as a corruption error; callers treat
    /// it as the torn tail of the log.
    pub fn read_frame(reader: &mut impl Read) -> Result<Option<RedoLogRecord>> {
        let mut header = [0u8; 8];
        match read_exact_or_eof(reader, &mut header)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Partial => {
                return Err(AmberError::Serialization(
                    "truncated redo record header".to_string(),
                ))
            }
            ReadOutcome::Full => {}
        }
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut body = vec![0u8; len];
        match read_exact_or_eof(reader, &mut body)? {
            ReadOutcome::Full => {}
            _ => {
                return Err(AmberError::Serialization(
                    "truncated redo record body".to_string(),
                ))
            }
        }
        if crc32fast::hash(&body) != expected_crc {
            return Err(AmberError::Serialization(
                "redo record checksum mismatch".to_string(),
            ));
        }
        Ok(Some(bincode::deserialize(&body)?))
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Partial
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}
