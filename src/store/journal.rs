//! Append-only journal backing the durable engine.
//!
//! Every committed unit of work becomes one [`JournalEntry`]. On open the
//! journal is replayed to rebuild the row set. A trailing entry cut short by
//! a crash is discarded; a complete entry with a bad checksum is an error.

use super::{Row, RowId};
use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"RFJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Header size: magic + version.
const HEADER_SIZE: u64 = 5;

/// Sanity bound on one encoded entry.
const MAX_ENTRY_BYTES: usize = 64 * 1024 * 1024;

/// A single row-level change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    Insert(Row),
    Delete(Vec<RowId>),
}

/// All changes of one committed unit of work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub ops: Vec<JournalOp>,
}

/// Outcome of reading one entry during replay.
enum ReadOutcome {
    Entry(JournalEntry, u64),
    /// Clean end of file.
    End,
    /// Partial entry at the tail.
    Torn,
}

/// Append-only journal file.
pub struct Journal {
    path: PathBuf,
    file: File,
    next_seq: u64,
    /// File length covering every successfully appended entry.
    committed_len: u64,
    /// Set when a failed append could not be rolled back; no further
    /// appends are accepted.
    poisoned: bool,
    /// fsync after every append.
    sync_on_append: bool,
    /// Bytes of the next frame to write before failing it.
    #[cfg(test)]
    fail_next_append: Option<usize>,
}

impl Journal {
    /// Open or create a journal, returning it together with the entries to
    /// replay (oldest first).
    pub fn open(path: impl AsRef<Path>, sync_on_append: bool) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();

        let entries = if path.exists() {
            Self::replay(&path)?
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            Self::write_header(&mut file)?;
            Vec::new()
        };

        let next_seq = entries.last().map_or(1, |entry| entry.seq + 1);
        let file = OpenOptions::new().append(true).open(&path)?;
        let committed_len = file.metadata()?.len();

        debug!(path = %path.display(), entries = entries.len(), "journal opened");

        Ok((
            Self {
                path,
                file,
                next_seq,
                committed_len,
                poisoned: false,
                sync_on_append,
                #[cfg(test)]
                fail_next_append: None,
            },
            entries,
        ))
    }

    /// Append one unit of work. The entry is written (and synced if
    /// configured) before this returns.
    ///
    /// On failure the file is cut back to its last committed length, so a
    /// failed entry never reaches a later replay.
    pub fn append(&mut self, ops: Vec<JournalOp>) -> Result<u64> {
        if self.poisoned {
            return Err(StoreError::WriteFailed(
                "journal holds an unrecoverable partial entry".into(),
            ));
        }

        let seq = self.next_seq;
        let frame = Self::encode_entry(&JournalEntry { seq, ops })?;

        if let Err(e) = self.write_frame(&frame) {
            self.rollback();
            return Err(e);
        }

        self.committed_len += frame.len() as u64;
        self.next_seq += 1;
        Ok(seq)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        #[cfg(test)]
        let injected = self.fail_next_append.take();
        #[cfg(not(test))]
        let injected: Option<usize> = None;

        if let Some(limit) = injected {
            self.file.write_all(&frame[..limit.min(frame.len())])?;
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure").into());
        }

        self.file.write_all(frame)?;
        if self.sync_on_append {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Drop whatever a failed append left behind.
    fn rollback(&mut self) {
        match self.file.set_len(self.committed_len) {
            Ok(()) => warn!(
                path = %self.path.display(),
                len = self.committed_len,
                "rolled back failed journal append"
            ),
            Err(e) => {
                self.poisoned = true;
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "journal rollback failed, refusing further appends"
                );
            }
        }
    }

    /// Make the next append write only `bytes` of its frame and then fail.
    #[cfg(test)]
    pub(crate) fn fail_next_append(&mut self, bytes: usize) {
        self.fail_next_append = Some(bytes);
    }

    /// Replace the journal with a single entry holding `rows`.
    ///
    /// The new file is written beside the old one and renamed over it.
    pub fn compact(&mut self, rows: &[Row]) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            Self::write_header(&mut file)?;
            let mut writer = BufWriter::new(file);
            if !rows.is_empty() {
                let entry = JournalEntry {
                    seq: 1,
                    ops: rows.iter().cloned().map(JournalOp::Insert).collect(),
                };
                writer.write_all(&Self::encode_entry(&entry)?)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.committed_len = self.file.metadata()?.len();
        self.poisoned = false;
        self.next_seq = if rows.is_empty() { 1 } else { 2 };

        debug!(path = %self.path.display(), rows = rows.len(), "journal compacted");
        Ok(())
    }

    /// Current size of the journal file in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path) -> Result<Vec<JournalEntry>> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut entries = Vec::new();
        let mut offset = HEADER_SIZE;
        loop {
            match Self::read_entry(&mut reader)? {
                ReadOutcome::Entry(entry, len) => {
                    offset += len;
                    entries.push(entry);
                }
                ReadOutcome::End => break,
                ReadOutcome::Torn => {
                    warn!(
                        path = %path.display(),
                        valid_bytes = offset,
                        dropped_bytes = file_size - offset,
                        "discarding torn journal tail"
                    );
                    OpenOptions::new().write(true).open(path)?.set_len(offset)?;
                    break;
                }
            }
        }

        Ok(entries)
    }

    fn write_header(file: &mut File) -> Result<()> {
        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    /// Frame an entry as `len | payload | crc32`.
    fn encode_entry(entry: &JournalEntry) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(entry)?;

        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());

        Ok(frame)
    }

    fn read_entry(reader: &mut BufReader<File>) -> Result<ReadOutcome> {
        let mut len_bytes = [0u8; 4];
        match read_full(reader, &mut len_bytes)? {
            0 => return Ok(ReadOutcome::End),
            n if n < len_bytes.len() => return Ok(ReadOutcome::Torn),
            _ => {}
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_BYTES {
            return Err(StoreError::Corruption("journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        if read_full(reader, &mut encoded)? < len {
            return Ok(ReadOutcome::Torn);
        }

        let mut checksum_bytes = [0u8; 4];
        if read_full(reader, &mut checksum_bytes)? < checksum_bytes.len() {
            return Ok(ReadOutcome::Torn);
        }
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok(ReadOutcome::Entry(entry, (4 + len + 4) as u64))
    }
}

/// Read until `buf` is full or EOF, returning the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use tempfile::TempDir;

    fn insert(id: u64, ts: i64) -> JournalOp {
        JournalOp::Insert(Row {
            id: RowId(id),
            timestamp: Some(Timestamp(ts)),
        })
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.journal");

        {
            let (mut journal, entries) = Journal::open(&path, true).unwrap();
            assert!(entries.is_empty());
            assert_eq!(journal.append(vec![insert(1, 10)]).unwrap(), 1);
            assert_eq!(
                journal.append(vec![insert(2, 20), JournalOp::Delete(vec![RowId(1)])]).unwrap(),
                2
            );
        }

        let (mut journal, entries) = Journal::open(&path, true).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].ops.len(), 2);
        // Sequence continues after replay
        assert_eq!(journal.append(vec![insert(3, 30)]).unwrap(), 3);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.journal");

        let intact_size = {
            let (mut journal, _) = Journal::open(&path, true).unwrap();
            journal.append(vec![insert(1, 10)]).unwrap();
            journal.size().unwrap()
        };

        // Simulate a crash halfway through the next entry
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(&[1, 2, 3]).unwrap();
        }

        let (journal, entries) = Journal::open(&path, true).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(journal.size().unwrap(), intact_size);
    }

    #[test]
    fn test_checksum_mismatch_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.journal");

        {
            let (mut journal, _) = Journal::open(&path, true).unwrap();
            journal.append(vec![insert(1, 10)]).unwrap();
        }

        // Flip the last byte (part of the checksum)
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let result = Journal::open(&path, true);
        assert!(matches!(result, Err(StoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_failed_append_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.journal");

        let (mut journal, _) = Journal::open(&path, true).unwrap();
        journal.append(vec![insert(1, 10)]).unwrap();
        let committed = journal.size().unwrap();

        // Half of the next frame reaches the file before the write fails
        journal.fail_next_append(6);
        let result = journal.append(vec![JournalOp::Delete(vec![RowId(1)])]);
        assert!(matches!(result, Err(StoreError::Io(_))));
        assert_eq!(journal.size().unwrap(), committed);

        // The sequence number of the failed entry is handed out again
        assert_eq!(journal.append(vec![insert(2, 20)]).unwrap(), 2);
        drop(journal);

        let (_, entries) = Journal::open(&path, true).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ops, vec![insert(1, 10)]);
        assert_eq!(entries[1].seq, 2);
        assert_eq!(entries[1].ops, vec![insert(2, 20)]);
    }

    #[test]
    fn test_failed_append_before_any_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.journal");

        let (mut journal, _) = Journal::open(&path, true).unwrap();
        journal.fail_next_append(0);
        assert!(journal.append(vec![insert(1, 10)]).is_err());
        assert_eq!(journal.size().unwrap(), HEADER_SIZE);
        drop(journal);

        let (_, entries) = Journal::open(&path, true).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.journal");
        fs::write(&path, b"NOPE\x01").unwrap();

        let result = Journal::open(&path, true);
        assert!(matches!(result, Err(StoreError::InvalidFormat(_))));
    }

    #[test]
    fn test_compact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.journal");

        let (mut journal, _) = Journal::open(&path, true).unwrap();
        for i in 1..=20 {
            journal.append(vec![insert(i, i as i64)]).unwrap();
        }
        journal.append(vec![JournalOp::Delete((1..=19).map(RowId).collect())]).unwrap();
        let before = journal.size().unwrap();

        let survivor = Row {
            id: RowId(20),
            timestamp: Some(Timestamp(20)),
        };
        journal.compact(&[survivor.clone()]).unwrap();
        assert!(journal.size().unwrap() < before);
        journal.append(vec![insert(21, 21)]).unwrap();
        drop(journal);

        let (_, entries) = Journal::open(&path, true).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ops, vec![JournalOp::Insert(survivor)]);
        assert_eq!(entries[1].seq, 2);
    }
}
