//! Durable, ordered storage for log entries plus the apply pipeline.
//!
//! The log is a single append-only file: a fixed header carrying the
//! compaction base, followed by length-prefixed, CRC-tagged records. An
//! in-memory mirror of the entries backs all reads; the file is the source
//! of truth across restarts. Replay stops at the first malformed record and
//! truncates the file there, so a torn tail from a crash mid-append heals
//! on the next open.

use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;

use crate::entry::LogEntry;
use crate::{Error, Result};

/// Magic number identifying a log file.
const LOG_MAGIC: u32 = 0x524C_4F47; // "RLOG" in ASCII

/// Current version of the log file format.
const LOG_VERSION: u32 = 1;

/// Header size: magic (4) + version (4) + start index (8) + start term (8).
const HEADER_LEN: u64 = 24;

/// Callback that hands a committed entry to the state machine and returns
/// its result.
pub type ApplyFunc = Box<dyn Fn(&LogEntry) -> Result<Vec<u8>> + Send + Sync>;

/// The persistent replicated log.
///
/// Entries start at `start_index + 1` with base term `start_term`; both
/// advance only through snapshot compaction. Every entry at or below
/// `commit_index` has been handed to the apply callback exactly once, in
/// index order.
pub struct Log {
    apply: ApplyFunc,
    inner: Mutex<LogInner>,
}

struct LogInner {
    file: Option<File>,
    path: PathBuf,
    entries: Vec<Arc<LogEntry>>,
    /// File offset where each in-memory entry's record begins. Kept parallel
    /// to `entries` so truncation can cut the file tail exactly.
    offsets: Vec<u64>,
    commit_index: u64,
    start_index: u64,
    start_term: u64,
}

impl LogInner {
    fn current_index(&self) -> u64 {
        self.start_index + self.entries.len() as u64
    }

    fn current_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term())
            .unwrap_or(self.start_term)
    }

    /// Position of a log index in the entries vector. Caller must have
    /// checked `start_index < index <= current_index()`.
    fn position(&self, index: u64) -> usize {
        (index - self.start_index - 1) as usize
    }

    fn check_next(&self, entry: &LogEntry) -> Result<()> {
        let expected = self.current_index() + 1;
        if entry.index() != expected {
            return Err(Error::IndexOutOfOrder {
                index: entry.index(),
                expected,
            });
        }
        let last = self.current_term();
        if entry.term() < last {
            return Err(Error::StaleTerm {
                term: entry.term(),
                last,
            });
        }
        Ok(())
    }

    /// Writes the records to the file with a single fsync, then mirrors
    /// them in memory. Validation must already have happened.
    fn append_records(&mut self, new: Vec<Arc<LogEntry>>) -> Result<()> {
        let mut buf = Vec::new();
        let mut sizes = Vec::with_capacity(new.len());
        for entry in &new {
            sizes.push(entry.encode(&mut buf)?);
        }

        let mut offset = {
            let file = self
                .file
                .as_mut()
                .ok_or_else(|| Error::Config("log is not open".to_string()))?;
            let offset = file.seek(SeekFrom::End(0))?;
            file.write_all(&buf)?;
            file.sync_all()?;
            offset
        };

        for (entry, size) in new.into_iter().zip(sizes) {
            self.offsets.push(offset);
            offset += size;
            self.entries.push(entry);
        }
        Ok(())
    }

    /// Discards in-memory entries from vector position `pos` onward and cuts
    /// the file back to match.
    fn cut_at(&mut self, pos: usize) -> Result<()> {
        if pos >= self.entries.len() {
            return Ok(());
        }
        let offset = self.offsets[pos];
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Config("log is not open".to_string()))?;
        file.set_len(offset)?;
        file.sync_all()?;
        self.entries.truncate(pos);
        self.offsets.truncate(pos);
        Ok(())
    }
}

impl Log {
    /// Creates a closed log. `apply` is invoked for every committed entry,
    /// in index order, from within `set_commit_index`.
    pub fn new(apply: ApplyFunc) -> Self {
        Log {
            apply,
            inner: Mutex::new(LogInner {
                file: None,
                path: PathBuf::new(),
                entries: Vec::new(),
                offsets: Vec::new(),
                commit_index: 0,
                start_index: 0,
                start_term: 0,
            }),
        }
    }

    /// Opens or creates the log file at `path` and replays every record into
    /// memory. A malformed record truncates the file at the last good offset
    /// with a warning; everything before it survives.
    pub fn open(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.path = path.to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            if len > 0 {
                warn!("log {}: header is incomplete, resetting file", path.display());
            }
            file.set_len(0)?;
            write_header(&mut file, 0, 0)?;
            file.sync_all()?;
            inner.start_index = 0;
            inner.start_term = 0;
        } else {
            file.seek(SeekFrom::Start(0))?;
            match read_header(&mut file) {
                Ok((start_index, start_term)) => {
                    inner.start_index = start_index;
                    inner.start_term = start_term;
                }
                Err(e) => {
                    warn!("log {}: bad header ({}), resetting file", path.display(), e);
                    file.set_len(0)?;
                    file.seek(SeekFrom::Start(0))?;
                    write_header(&mut file, 0, 0)?;
                    file.sync_all()?;
                    inner.start_index = 0;
                    inner.start_term = 0;
                }
            }
        }

        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(HEADER_LEN))?;
        file.read_to_end(&mut buf)?;
        let end = HEADER_LEN + buf.len() as u64;

        inner.entries.clear();
        inner.offsets.clear();
        let mut cursor = Cursor::new(&buf[..]);
        let mut offset = HEADER_LEN;
        while (cursor.position() as usize) < buf.len() {
            match LogEntry::decode(&mut cursor) {
                Ok((entry, size)) => {
                    if entry.index() <= inner.start_index {
                        // Remnant of a compacted prefix; skip it.
                        offset += size;
                        continue;
                    }
                    let expected = inner.current_index() + 1;
                    if entry.index() != expected {
                        warn!(
                            "log {}: record at offset {} has index {} (expected {}), truncating",
                            path.display(),
                            offset,
                            entry.index(),
                            expected
                        );
                        break;
                    }
                    inner.offsets.push(offset);
                    offset += size;
                    inner.entries.push(Arc::new(entry));
                }
                Err(e) => {
                    warn!(
                        "log {}: truncating corrupted tail at offset {}: {}",
                        path.display(),
                        offset,
                        e
                    );
                    break;
                }
            }
        }
        if offset < end {
            file.set_len(offset)?;
            file.sync_all()?;
        }

        inner.file = Some(file);
        Ok(())
    }

    /// Closes the file and drops the in-memory mirror.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.file = None;
        inner.entries.clear();
        inner.offsets.clear();
        inner.commit_index = 0;
    }

    /// Index of the last entry, or the compaction base if empty.
    pub fn current_index(&self) -> u64 {
        self.inner.lock().unwrap().current_index()
    }

    /// Term of the last entry, or the compaction base term if empty.
    pub fn current_term(&self) -> u64 {
        self.inner.lock().unwrap().current_term()
    }

    /// Highest index known to be committed.
    pub fn commit_index(&self) -> u64 {
        self.inner.lock().unwrap().commit_index
    }

    /// Index below which the log has been compacted away.
    pub fn start_index(&self) -> u64 {
        self.inner.lock().unwrap().start_index
    }

    /// Index and term of the last entry (falling back to the compaction
    /// base when the log is empty).
    pub fn last_info(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.current_index(), inner.current_term())
    }

    /// Index and term at the commit pointer.
    pub fn commit_info(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        if inner.commit_index == 0 {
            return (0, 0);
        }
        if inner.commit_index == inner.start_index {
            return (inner.start_index, inner.start_term);
        }
        let pos = inner.position(inner.commit_index);
        (inner.commit_index, inner.entries[pos].term())
    }

    /// True when the log holds no entries and was never compacted.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.entries.is_empty() && inner.start_index == 0
    }

    /// Command name of the last entry, if any.
    pub fn last_command_name(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.entries.last().map(|e| e.command_name().to_string())
    }

    /// Snapshot of every in-memory entry, oldest first. Intended for
    /// debugging and tests.
    pub fn entries(&self) -> Vec<Arc<LogEntry>> {
        self.inner.lock().unwrap().entries.clone()
    }

    /// Returns the entry at `index` if it is present (not compacted away,
    /// not beyond the end).
    pub fn get_entry(&self, index: u64) -> Option<Arc<LogEntry>> {
        let inner = self.inner.lock().unwrap();
        if index <= inner.start_index || index > inner.current_index() {
            return None;
        }
        Some(inner.entries[inner.position(index)].clone())
    }

    /// Builds a new entry carrying the next index. The entry is not
    /// persisted until `append_entry`.
    pub fn create_entry(&self, term: u64, command_name: String, command: Vec<u8>) -> Arc<LogEntry> {
        let inner = self.inner.lock().unwrap();
        Arc::new(LogEntry::new(
            inner.current_index() + 1,
            term,
            command_name,
            command,
        ))
    }

    /// Appends a single entry: validates ordering, writes and fsyncs the
    /// record, then mirrors it in memory.
    pub fn append_entry(&self, entry: Arc<LogEntry>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_next(&entry)?;
        inner.append_records(vec![entry])
    }

    /// Batched append with a single fsync. Validation happens up front so
    /// the in-memory mirror never holds a partial batch; a partial disk
    /// write is healed by truncation on the next open.
    pub fn append_entries(&self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();

        let mut expected = inner.current_index() + 1;
        let mut last_term = inner.current_term();
        for entry in &entries {
            if entry.index() != expected {
                return Err(Error::IndexOutOfOrder {
                    index: entry.index(),
                    expected,
                });
            }
            if entry.term() < last_term {
                return Err(Error::StaleTerm {
                    term: entry.term(),
                    last: last_term,
                });
            }
            expected += 1;
            last_term = entry.term();
        }

        inner.append_records(entries.into_iter().map(Arc::new).collect())
    }

    /// Enforces the log-matching rule at `prev_index`/`prev_term`.
    ///
    /// Committed history can never be rewritten; an index beyond the end is
    /// reported as missing so the leader backs up. A term conflict at
    /// `prev_index` discards that entry and everything after it (memory and
    /// file tail) and still returns the mismatch, so the caller replies
    /// `success = false` and the leader retries one index earlier. A
    /// matching entry discards only what follows it.
    pub fn truncate(&self, prev_index: u64, prev_term: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if prev_index < inner.commit_index || prev_index < inner.start_index {
            return Err(Error::CommittedIndex(prev_index));
        }
        if prev_index > inner.current_index() {
            return Err(Error::EntryMissing(prev_index));
        }
        if prev_index == inner.start_index {
            // Matching against the compaction base (or an empty log): any
            // existing suffix is superseded.
            return inner.cut_at(0);
        }

        let pos = inner.position(prev_index);
        let actual = inner.entries[pos].term();
        if actual != prev_term {
            inner.cut_at(pos)?;
            return Err(Error::EntryMismatch {
                index: prev_index,
                expected: prev_term,
                actual,
            });
        }
        inner.cut_at(pos + 1)
    }

    /// Advances the commit pointer to `target` (clamped to the last index),
    /// applying each newly committed entry in order. The apply result is
    /// stored on the entry and its commit signal fires exactly once,
    /// success or error; apply errors surface only to the waiting client.
    pub fn set_commit_index(&self, target: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let target = target.min(inner.current_index());
        if target <= inner.commit_index {
            return Ok(());
        }

        while inner.commit_index < target {
            let next = inner.commit_index + 1;
            if next <= inner.start_index {
                // Covered by a snapshot; the state machine was restored from it.
                inner.commit_index = next;
                continue;
            }
            let entry = inner.entries[inner.position(next)].clone();
            assert_eq!(
                entry.index(),
                next,
                "applying entry out of order: log invariant violated"
            );
            let result = (self.apply)(&entry);
            entry.set_result(result);
            entry.fire_commit_signal();
            inner.commit_index = next;
        }
        Ok(())
    }

    /// Moves the commit pointer without applying anything. Only snapshot
    /// installation uses this: the state machine is restored from the
    /// snapshot image instead of replay.
    pub fn update_commit_index(&self, index: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.commit_index = index;
    }

    /// Takes the apply result stored on a committed entry.
    pub fn entry_result(&self, entry: &LogEntry) -> Result<Vec<u8>> {
        entry
            .take_result()
            .unwrap_or_else(|| Err(Error::Command("no result recorded for entry".to_string())))
    }

    /// Returns detached copies of all entries after `prev_index` together
    /// with the term at `prev_index`, or `None` when that index has been
    /// compacted away and the follower needs a snapshot instead.
    pub fn entries_after(&self, prev_index: u64) -> Option<(Vec<LogEntry>, u64)> {
        let inner = self.inner.lock().unwrap();
        if prev_index < inner.start_index {
            return None;
        }
        let prev_index = prev_index.min(inner.current_index());
        let prev_term = if prev_index == inner.start_index {
            inner.start_term
        } else {
            inner.entries[inner.position(prev_index)].term()
        };
        let from = (prev_index - inner.start_index) as usize;
        let entries = inner.entries[from..]
            .iter()
            .map(|e| (**e).clone())
            .collect();
        Some((entries, prev_term))
    }

    /// Drops every entry at or below `last_index` after a snapshot has
    /// captured state through `(last_index, last_term)`. The surviving
    /// suffix is rewritten to a temporary file which is renamed over the
    /// log, so a crash mid-compaction leaves the old file intact.
    pub fn compact(&self, last_index: u64, last_term: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if last_index <= inner.start_index {
            return Ok(());
        }
        if inner.file.is_none() {
            return Err(Error::Config("log is not open".to_string()));
        }

        let keep: Vec<Arc<LogEntry>> = if last_index >= inner.current_index() {
            Vec::new()
        } else {
            let from = (last_index - inner.start_index) as usize;
            inner.entries[from..].to_vec()
        };

        let tmp = inner.path.with_extension("new");
        let mut file = File::create(&tmp)?;
        write_header(&mut file, last_index, last_term)?;
        let mut offsets = Vec::with_capacity(keep.len());
        let mut offset = HEADER_LEN;
        for entry in &keep {
            offsets.push(offset);
            offset += entry.encode(&mut file)?;
        }
        file.sync_all()?;
        fs::rename(&tmp, &inner.path)?;

        inner.file = Some(OpenOptions::new().read(true).write(true).open(&inner.path)?);
        inner.entries = keep;
        inner.offsets = offsets;
        inner.start_index = last_index;
        inner.start_term = last_term;
        Ok(())
    }
}

fn write_header<W: Write>(writer: &mut W, start_index: u64, start_term: u64) -> Result<()> {
    writer.write_u32::<LittleEndian>(LOG_MAGIC)?;
    writer.write_u32::<LittleEndian>(LOG_VERSION)?;
    writer.write_u64::<LittleEndian>(start_index)?;
    writer.write_u64::<LittleEndian>(start_term)?;
    Ok(())
}

fn read_header<R: Read>(reader: &mut R) -> Result<(u64, u64)> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != LOG_MAGIC {
        return Err(Error::BadRecord(format!(
            "invalid log magic number: {:08x}",
            magic
        )));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != LOG_VERSION {
        return Err(Error::BadRecord(format!(
            "unsupported log version: {}",
            version
        )));
    }
    let start_index = reader.read_u64::<LittleEndian>()?;
    let start_term = reader.read_u64::<LittleEndian>()?;
    Ok((start_index, start_term))
}
