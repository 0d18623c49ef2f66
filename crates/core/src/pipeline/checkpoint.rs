//! Checkpoint journal for pipeline state.
//!
//! Every document state transition is appended before the orchestrator acts on
//! it. Frames are `[u32 length BE][u32 CRC32 BE][bincode payload]`, flushed
//! and fsynced per append. Replay stops at the first short or corrupt frame and
//! cuts the file back to the last good frame, so a crash mid-append leaves the
//! journal at the last committed transition.
//!
//! The log only grows between compactions. [`Journal::compact`] rewrites it as
//! one `Transition` per live document, atomically replacing the file.

use super::DocState;
use crate::error::{Error, Result};
use crate::snapshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const JOURNAL_FILE: &str = "journal.bin";

/// One journaled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// A document moved to `state`.
    Transition {
        document_id: Uuid,
        origin: String,
        state: DocState,
        at: u64,
    },
    /// A document was deleted.
    Forget { document_id: Uuid },
}

/// Replayed state of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocRecord {
    pub document_id: Uuid,
    pub origin: String,
    pub state: DocState,
    /// Unix seconds of the last transition.
    pub updated_at: u64,
}

/// What replay found.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReplayStats {
    pub applied: usize,
    /// Bytes cut from the tail because the last frame was short or corrupt.
    pub discarded_bytes: u64,
}

struct JournalWriter {
    file: BufWriter<File>,
    /// Frames in the file, replayed ones included.
    entries: usize,
}

/// Append-only transition log.
pub struct Journal {
    writer: Mutex<JournalWriter>,
    path: PathBuf,
}

fn open_append(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
}

impl Journal {
    /// Open (creating if needed) the journal in `dir` and replay it.
    pub fn open(dir: &Path) -> Result<(Self, BTreeMap<Uuid, DocRecord>, ReplayStats)> {
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);
        let (records, stats, good_len) = if path.exists() {
            replay(&path)?
        } else {
            (BTreeMap::new(), ReplayStats::default(), 0)
        };
        if stats.discarded_bytes > 0 {
            tracing::warn!(
                path = ?path,
                discarded = stats.discarded_bytes,
                "journal tail was torn, discarding it"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(good_len)?;
            file.sync_all()?;
        }

        let file = open_append(&path)?;
        tracing::debug!(path = ?path, entries = stats.applied, "journal opened");
        Ok((
            Self {
                writer: Mutex::new(JournalWriter {
                    file: BufWriter::new(file),
                    entries: stats.applied,
                }),
                path,
            },
            records,
            stats,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and fsync before returning.
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        self.append_all(std::slice::from_ref(entry))
    }

    /// Append several entries with a single fsync.
    pub fn append_all(&self, entries: &[JournalEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut framed = Vec::new();
        for entry in entries {
            frame(entry, &mut framed)?;
        }
        let mut w = self.writer.lock();
        w.file.write_all(&framed)?;
        w.file.flush()?;
        w.file.get_mut().sync_all()?;
        w.entries += entries.len();
        Ok(())
    }

    /// Number of frames in the log.
    pub fn entries(&self) -> usize {
        self.writer.lock().entries
    }

    /// Replace the log with one `Transition` per record, then reopen it for
    /// appending. `records` must be the current replayed state; appends are
    /// blocked while the file is swapped. Returns the frames dropped.
    pub fn compact(&self, records: &BTreeMap<Uuid, DocRecord>) -> Result<usize> {
        let mut framed = Vec::new();
        for record in records.values() {
            frame(
                &JournalEntry::Transition {
                    document_id: record.document_id,
                    origin: record.origin.clone(),
                    state: record.state.clone(),
                    at: record.updated_at,
                },
                &mut framed,
            )?;
        }
        let mut w = self.writer.lock();
        w.file.flush()?;
        snapshot::write_atomic(&self.path, &framed)?;
        w.file = BufWriter::new(open_append(&self.path)?);
        let dropped = w.entries.saturating_sub(records.len());
        w.entries = records.len();
        tracing::info!(
            path = ?self.path,
            kept = records.len(),
            dropped,
            bytes = framed.len(),
            "journal compacted"
        );
        Ok(dropped)
    }
}

fn frame(entry: &JournalEntry, out: &mut Vec<u8>) -> Result<()> {
    let bytes = bincode::serialize(entry).map_err(|e| io::Error::other(e.to_string()))?;
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc32fast::hash(&bytes).to_be_bytes());
    out.extend_from_slice(&bytes);
    Ok(())
}

/// Fold every good frame into per-document records. Returns the records, the
/// stats and the byte length of the good prefix.
fn replay(path: &Path) -> Result<(BTreeMap<Uuid, DocRecord>, ReplayStats, u64)> {
    let total = fs::metadata(path)?.len();
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = BTreeMap::new();
    let mut stats = ReplayStats::default();
    let mut good: u64 = 0;
    let mut header = [0u8; 8];

    loop {
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if good + 8 + len > total {
            break;
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            break;
        }
        let entry: JournalEntry = match bincode::deserialize(&payload) {
            Ok(entry) => entry,
            Err(e) => {
                return Err(Error::corrupt(
                    path,
                    format!("journal frame at byte {good} has a valid checksum but does not decode: {e}"),
                ))
            }
        };
        apply(&mut records, entry);
        stats.applied += 1;
        good += 8 + len;
    }
    stats.discarded_bytes = total - good;
    Ok((records, stats, good))
}

fn apply(records: &mut BTreeMap<Uuid, DocRecord>, entry: JournalEntry) {
    match entry {
        JournalEntry::Transition {
            document_id,
            origin,
            state,
            at,
        } => {
            records.insert(
                document_id,
                DocRecord {
                    document_id,
                    origin,
                    state,
                    updated_at: at,
                },
            );
        }
        JournalEntry::Forget { document_id } => {
            records.remove(&document_id);
        }
    }
}
