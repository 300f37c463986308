//! Point-in-time captures of the state machine plus cluster metadata.
//!
//! A snapshot file is a CRC-32 line followed by the JSON payload:
//!
//! ```text
//! %08x\n                                        checksum of the payload
//! {"last_index":..,"last_term":..,"peers":[..],"state":[..]}
//! ```
//!
//! Files live under `<storage>/snapshot/` and are named
//! `<last_term>_<last_index>.ss`; startup picks the numerically greatest
//! `(term, index)` pair.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A persisted state-machine image covering a prefix of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last log index covered by this snapshot.
    pub last_index: u64,
    /// Term of the entry at `last_index`.
    pub last_term: u64,
    /// Cluster membership at snapshot time, including the local server.
    pub peers: Vec<String>,
    /// Opaque state machine bytes.
    pub state: Vec<u8>,
    /// Where this snapshot lives on disk.
    #[serde(skip)]
    pub path: PathBuf,
}

impl Snapshot {
    pub fn new(
        last_index: u64,
        last_term: u64,
        peers: Vec<String>,
        state: Vec<u8>,
        path: PathBuf,
    ) -> Self {
        Snapshot {
            last_index,
            last_term,
            peers,
            state,
            path,
        }
    }

    /// Persists the snapshot: payload and checksum are written to a
    /// temporary file which is renamed into place, so readers never observe
    /// a half-written snapshot.
    pub fn save(&self) -> Result<()> {
        let payload = serde_json::to_vec(self)?;
        let checksum = crc32fast::hash(&payload);

        let tmp = self.path.with_extension("ss.tmp");
        let mut file = File::create(&tmp)?;
        write!(file, "{:08x}\n", checksum)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Reads a snapshot back, verifying the checksum before deserializing.
    pub fn load(path: &Path) -> Result<Snapshot> {
        let data = fs::read(path)?;
        let newline = data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| Error::BadSnapshot("missing checksum line".to_string()))?;

        let header = std::str::from_utf8(&data[..newline])
            .map_err(|_| Error::BadSnapshot("checksum line is not UTF-8".to_string()))?;
        let expected = u32::from_str_radix(header.trim(), 16)
            .map_err(|_| Error::BadSnapshot(format!("invalid checksum line: {:?}", header)))?;

        let payload = &data[newline + 1..];
        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let mut snapshot: Snapshot = serde_json::from_slice(payload)?;
        snapshot.path = path.to_path_buf();
        Ok(snapshot)
    }

    /// Deletes the snapshot file.
    pub fn remove(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Builds the canonical snapshot filename for a `(term, index)` pair.
pub(crate) fn snapshot_file_name(last_term: u64, last_index: u64) -> String {
    format!("{}_{}.ss", last_term, last_index)
}

/// Parses `<term>_<index>.ss` back into its numeric pair. Filenames that do
/// not match the convention are ignored by startup.
pub(crate) fn parse_snapshot_file_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".ss")?;
    let (term, index) = stem.split_once('_')?;
    Some((term.parse().ok()?, index.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(dir: &TempDir) -> Snapshot {
        Snapshot::new(
            1000,
            3,
            vec!["n1".to_string(), "n2".to_string(), "n3".to_string()],
            b"state machine image".to_vec(),
            dir.path().join(snapshot_file_name(3, 1000)),
        )
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let snapshot = sample(&dir);
        snapshot.save().expect("save failed");

        let loaded = Snapshot::load(&snapshot.path).expect("load failed");
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.last_index, 1000);
        assert_eq!(loaded.last_term, 3);
        assert_eq!(loaded.peers.len(), 3);
        assert_eq!(loaded.state, b"state machine image");
    }

    #[test]
    fn test_any_flipped_payload_byte_fails_the_checksum() {
        let dir = TempDir::new().unwrap();
        let snapshot = sample(&dir);
        snapshot.save().unwrap();

        let clean = fs::read(&snapshot.path).unwrap();
        let payload_start = clean.iter().position(|&b| b == b'\n').unwrap() + 1;

        for victim in payload_start..clean.len() {
            let mut data = clean.clone();
            data[victim] ^= 0x01;
            fs::write(&snapshot.path, &data).unwrap();

            match Snapshot::load(&snapshot.path) {
                Err(Error::ChecksumMismatch { .. }) => {}
                other => panic!("byte {} accepted corrupt payload: {:?}", victim, other),
            }
        }
    }

    #[test]
    fn test_load_rejects_garbage_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1_1.ss");
        fs::write(&path, b"not a snapshot at all").unwrap();
        assert!(matches!(Snapshot::load(&path), Err(Error::BadSnapshot(_))));
    }

    #[test]
    fn test_remove_deletes_the_file() {
        let dir = TempDir::new().unwrap();
        let snapshot = sample(&dir);
        snapshot.save().unwrap();
        assert!(snapshot.path.exists());

        snapshot.remove().unwrap();
        assert!(!snapshot.path.exists());
    }

    #[test]
    fn test_file_name_round_trip() {
        assert_eq!(snapshot_file_name(3, 1000), "3_1000.ss");
        assert_eq!(parse_snapshot_file_name("3_1000.ss"), Some((3, 1000)));
        assert_eq!(parse_snapshot_file_name("10_2.ss"), Some((10, 2)));
        assert_eq!(parse_snapshot_file_name("junk"), None);
        assert_eq!(parse_snapshot_file_name("a_b.ss"), None);
    }

    #[test]
    fn test_numeric_ordering_beats_lexicographic() {
        // "10_2.ss" sorts before "9_1.ss" lexicographically; the parsed
        // pairs must still order term 10 above term 9.
        let a = parse_snapshot_file_name("10_2.ss").unwrap();
        let b = parse_snapshot_file_name("9_1.ss").unwrap();
        assert!(a > b);

        // Same term: index 10 above index 9 despite "1000".."999" ordering.
        let c = parse_snapshot_file_name("2_1000.ss").unwrap();
        let d = parse_snapshot_file_name("2_999.ss").unwrap();
        assert!(c > d);
    }
}
