//! Log entry data structure and its on-disk record format.

use std::io::{Read, Write};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{Error, Result};

/// Fixed part of a record body: term (8) + index (8) + name length (4).
const RECORD_FIXED_LEN: u32 = 20;

/// Upper bound on a single record. A length prefix beyond this is treated
/// as a corrupted tail rather than an allocation request.
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// A single entry in the replicated log.
///
/// The durable fields are `index`, `term`, `command_name` and `command`.
/// The commit notifier and apply-result slot are transient: they exist only
/// on the server that created the entry for a waiting client, and are never
/// written to disk or carried across the wire.
///
/// # Binary format
///
/// ```text
/// ┌────────────────┬───────────────┬──────────────┬───────────────┬──────────────────┬───────────────┐
/// │ Length (4)     │ CRC-32 (4)    │ Term (8)     │ Index (8)     │ Name len (4)     │ Name ∥ Command │
/// └────────────────┴───────────────┴──────────────┴───────────────┴──────────────────┴───────────────┘
/// ```
///
/// `Length` covers everything after the CRC field; `CRC-32` (IEEE) is
/// computed over that same span, so a torn tail or flipped byte is detected
/// on replay.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogEntry {
    index: u64,
    term: u64,
    command_name: String,
    command: Vec<u8>,
    #[serde(skip)]
    commit: Mutex<Option<oneshot::Sender<()>>>,
    #[serde(skip)]
    result: Mutex<Option<Result<Vec<u8>>>>,
}

impl LogEntry {
    /// Creates a new log entry with empty transient slots.
    pub fn new(index: u64, term: u64, command_name: String, command: Vec<u8>) -> Self {
        LogEntry {
            index,
            term,
            command_name,
            command,
            commit: Mutex::new(None),
            result: Mutex::new(None),
        }
    }

    /// Returns the index of this entry (1-based).
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Returns the term under which this entry was created.
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Returns the registered name of the command.
    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    /// Returns the serialized command payload.
    pub fn command(&self) -> &[u8] {
        &self.command
    }

    /// Creates a one-shot commit notifier for this entry and returns the
    /// receiving half. Only the server that appends the entry on behalf of a
    /// waiting client calls this; replicated copies have no notifier.
    pub(crate) fn attach_commit_signal(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.commit.lock().unwrap() = Some(tx);
        rx
    }

    /// Fires the commit notifier, if one is attached. The sender is consumed
    /// so the signal can fire at most once; a receiver that already gave up
    /// waiting is ignored.
    pub(crate) fn fire_commit_signal(&self) {
        if let Some(tx) = self.commit.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    /// Stores the state machine's result for this entry.
    pub(crate) fn set_result(&self, result: Result<Vec<u8>>) {
        *self.result.lock().unwrap() = Some(result);
    }

    /// Takes the stored apply result, if any.
    pub(crate) fn take_result(&self) -> Option<Result<Vec<u8>>> {
        self.result.lock().unwrap().take()
    }

    /// Returns the total size of this entry when serialized, including the
    /// length and checksum prefix.
    pub fn serialized_size(&self) -> u64 {
        8 + u64::from(RECORD_FIXED_LEN) + self.command_name.len() as u64 + self.command.len() as u64
    }

    /// Writes this entry as one framed record and returns the bytes written.
    pub(crate) fn encode<W: Write>(&self, writer: &mut W) -> Result<u64> {
        let body_len = RECORD_FIXED_LEN as usize + self.command_name.len() + self.command.len();
        let mut body = Vec::with_capacity(body_len);
        body.write_u64::<LittleEndian>(self.term)?;
        body.write_u64::<LittleEndian>(self.index)?;
        body.write_u32::<LittleEndian>(self.command_name.len() as u32)?;
        body.extend_from_slice(self.command_name.as_bytes());
        body.extend_from_slice(&self.command);

        writer.write_u32::<LittleEndian>(body.len() as u32)?;
        writer.write_u32::<LittleEndian>(crc32fast::hash(&body))?;
        writer.write_all(&body)?;
        Ok(8 + body.len() as u64)
    }

    /// Reads one framed record. Any framing violation (short read, absurd
    /// length, checksum mismatch) is an error; the caller decides whether it
    /// means "corrupted tail" or "real corruption".
    pub(crate) fn decode<R: Read>(reader: &mut R) -> Result<(LogEntry, u64)> {
        let body_len = reader.read_u32::<LittleEndian>()?;
        if body_len < RECORD_FIXED_LEN || body_len > MAX_RECORD_LEN {
            return Err(Error::BadRecord(format!(
                "record length {} outside valid range",
                body_len
            )));
        }
        let expected_crc = reader.read_u32::<LittleEndian>()?;

        let mut body = vec![0u8; body_len as usize];
        reader.read_exact(&mut body)?;
        let actual_crc = crc32fast::hash(&body);
        if actual_crc != expected_crc {
            return Err(Error::ChecksumMismatch {
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        let mut cursor = &body[..];
        let term = cursor.read_u64::<LittleEndian>()?;
        let index = cursor.read_u64::<LittleEndian>()?;
        let name_len = cursor.read_u32::<LittleEndian>()? as usize;
        if name_len > body_len as usize - RECORD_FIXED_LEN as usize {
            return Err(Error::BadRecord(format!(
                "command name length {} exceeds record body",
                name_len
            )));
        }
        let command_name = String::from_utf8(cursor[..name_len].to_vec())
            .map_err(|e| Error::BadRecord(format!("command name is not UTF-8: {}", e)))?;
        let command = cursor[name_len..].to_vec();

        Ok((
            LogEntry::new(index, term, command_name, command),
            8 + body_len as u64,
        ))
    }
}

/// Cloning detaches the transient slots: a copy that crosses the wire or is
/// re-appended on a follower must never share a commit notifier with the
/// original.
impl Clone for LogEntry {
    fn clone(&self) -> Self {
        LogEntry::new(
            self.index,
            self.term,
            self.command_name.clone(),
            self.command.clone(),
        )
    }
}

/// Equality covers the durable fields only.
impl PartialEq for LogEntry {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self.term == other.term
            && self.command_name == other.command_name
            && self.command == other.command
    }
}

impl Eq for LogEntry {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_entry_round_trip() {
        let original = LogEntry::new(10, 5, "set".to_string(), b"key=value".to_vec());
        let mut buffer = Vec::new();

        let written = original.encode(&mut buffer).unwrap();
        assert_eq!(written, buffer.len() as u64);
        assert_eq!(written, original.serialized_size());

        let mut cursor = Cursor::new(buffer);
        let (restored, read) = LogEntry::decode(&mut cursor).unwrap();
        assert_eq!(read, written);
        assert_eq!(restored, original);
        assert_eq!(restored.command_name(), "set");
        assert_eq!(restored.command(), b"key=value");
    }

    #[test]
    fn test_empty_command_round_trip() {
        let original = LogEntry::new(1, 1, "noop".to_string(), Vec::new());
        let mut buffer = Vec::new();
        original.encode(&mut buffer).unwrap();

        let (restored, _) = LogEntry::decode(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(restored, original);
        assert!(restored.command().is_empty());
    }

    #[test]
    fn test_decode_detects_flipped_byte() {
        let entry = LogEntry::new(3, 2, "set".to_string(), b"payload".to_vec());
        let mut buffer = Vec::new();
        entry.encode(&mut buffer).unwrap();

        // Flip one byte of the body; the CRC no longer matches.
        let last = buffer.len() - 1;
        buffer[last] ^= 0xFF;

        match LogEntry::decode(&mut Cursor::new(buffer)) {
            Err(Error::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_detects_truncated_record() {
        let entry = LogEntry::new(3, 2, "set".to_string(), b"payload".to_vec());
        let mut buffer = Vec::new();
        entry.encode(&mut buffer).unwrap();

        buffer.truncate(buffer.len() - 3);
        assert!(LogEntry::decode(&mut Cursor::new(buffer)).is_err());
    }

    #[test]
    fn test_decode_rejects_absurd_length() {
        let mut buffer = Vec::new();
        buffer.write_u32::<LittleEndian>(u32::MAX).unwrap();
        buffer.write_u32::<LittleEndian>(0).unwrap();

        match LogEntry::decode(&mut Cursor::new(buffer)) {
            Err(Error::BadRecord(_)) => {}
            other => panic!("expected bad record, got {:?}", other),
        }
    }

    #[test]
    fn test_clone_detaches_transient_state() {
        let entry = LogEntry::new(1, 1, "set".to_string(), b"v".to_vec());
        let mut rx = entry.attach_commit_signal();

        let copy = entry.clone();
        copy.fire_commit_signal();
        assert!(rx.try_recv().is_err());

        entry.fire_commit_signal();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_commit_signal_fires_at_most_once() {
        let entry = LogEntry::new(1, 1, "set".to_string(), b"v".to_vec());
        let mut rx = entry.attach_commit_signal();

        entry.fire_commit_signal();
        entry.fire_commit_signal();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_equality_ignores_transient_state() {
        let a = LogEntry::new(2, 1, "set".to_string(), b"v".to_vec());
        let b = LogEntry::new(2, 1, "set".to_string(), b"v".to_vec());
        let _ = a.attach_commit_signal();
        assert_eq!(a, b);

        let c = LogEntry::new(2, 2, "set".to_string(), b"v".to_vec());
        assert_ne!(a, c);
    }
}
