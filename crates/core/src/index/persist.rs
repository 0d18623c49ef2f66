//! On-disk index format.
//!
//! An index directory holds two files:
//!
//! - `vectors.bin`: the arena and graph as a checksummed bincode snapshot
//!   (see [`crate::snapshot`]).
//! - `index.json`: a human-readable sidecar with the format version, the
//!   dimension, the HNSW build parameters, the blob's CRC32 and the
//!   chunk id → insertion sequence map.
//!
//! Loading cross-checks the two. Any disagreement, checksum failure or
//! dimension mismatch is reported as `CorruptIndex`; nothing is repaired
//! silently.
//!
//! Saving stages both files as `*.next` first. The staged sidecar is the
//! commit point: once it exists the pair is promoted by rename, and a load
//! that finds it (after a crash mid-promotion) finishes the promotion. A
//! staged blob without a staged sidecar is an aborted save and is dropped.

use crate::config::{HnswParams, IndexSettings};
use crate::error::{Error, Result};
use crate::index::{IndexData, VectorIndex};
use crate::snapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const VECTORS_FILE: &str = "vectors.bin";
pub const SIDECAR_FILE: &str = "index.json";
const STAGED_SUFFIX: &str = ".next";
pub const FORMAT_VERSION: u32 = 1;
const VECTORS_MAGIC: &[u8; 4] = b"CKV1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSidecar {
    pub format_version: u32,
    pub dimension: usize,
    pub params: HnswParams,
    pub live_entries: usize,
    pub slots: usize,
    pub next_seq: u64,
    pub vectors_crc32: u32,
    pub entries: BTreeMap<Uuid, u64>,
}

fn staged(dir: &Path, file: &str) -> PathBuf {
    dir.join(format!("{file}{STAGED_SUFFIX}"))
}

/// Whether `dir` contains a persisted index, committed or staged.
pub fn exists(dir: &Path) -> bool {
    dir.join(SIDECAR_FILE).exists()
        || dir.join(VECTORS_FILE).exists()
        || staged(dir, SIDECAR_FILE).exists()
}

/// Finish or discard a save interrupted by a crash.
fn settle(dir: &Path) -> Result<()> {
    let vectors_next = staged(dir, VECTORS_FILE);
    let sidecar_next = staged(dir, SIDECAR_FILE);
    if sidecar_next.exists() {
        if vectors_next.exists() {
            fs::rename(&vectors_next, dir.join(VECTORS_FILE))?;
        }
        fs::rename(&sidecar_next, dir.join(SIDECAR_FILE))?;
        tracing::warn!(dir = %dir.display(), "completed an interrupted index save");
    } else if vectors_next.exists() {
        fs::remove_file(&vectors_next)?;
        tracing::warn!(dir = %dir.display(), "discarded an uncommitted index blob");
    }
    Ok(())
}

/// Stage the blob, then the sidecar that vouches for it, then promote both.
pub(crate) fn save(dir: &Path, data: &IndexData) -> Result<()> {
    fs::create_dir_all(dir)?;
    // A leftover from an earlier crash must not be promoted over this save.
    settle(dir)?;
    let vectors_next = staged(dir, VECTORS_FILE);
    let sidecar_next = staged(dir, SIDECAR_FILE);
    let crc = snapshot::write(&vectors_next, VECTORS_MAGIC, data)?;
    let entries: BTreeMap<Uuid, u64> = data
        .slot_of
        .iter()
        .map(|(id, &slot)| (*id, data.arena.seq(slot)))
        .collect();
    let sidecar = IndexSidecar {
        format_version: FORMAT_VERSION,
        dimension: data.arena.dimension,
        params: data.graph.params.clone(),
        live_entries: entries.len(),
        slots: data.arena.slot_count(),
        next_seq: data.next_seq,
        vectors_crc32: crc,
        entries,
    };
    let json = serde_json::to_vec_pretty(&sidecar)
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    snapshot::write_atomic(&sidecar_next, &json)?;
    fs::rename(&vectors_next, dir.join(VECTORS_FILE))?;
    fs::rename(&sidecar_next, dir.join(SIDECAR_FILE))?;
    tracing::info!(
        dir = %dir.display(),
        live = sidecar.live_entries,
        crc = format_args!("{:#010x}", crc),
        "index saved"
    );
    Ok(())
}

/// Read the sidecar alone.
pub fn read_sidecar(dir: &Path) -> Result<IndexSidecar> {
    let path = dir.join(SIDECAR_FILE);
    let raw = fs::read(&path)?;
    serde_json::from_slice(&raw).map_err(|e| Error::corrupt(&path, format!("sidecar: {}", e)))
}

/// Load and validate a persisted index.
///
/// Graph parameters come from the file; tolerance, churn ratio and the
/// exact-scan threshold come from `settings`.
pub fn load(dir: &Path, settings: IndexSettings) -> Result<VectorIndex> {
    settle(dir)?;
    if !dir.join(SIDECAR_FILE).exists() && !dir.join(VECTORS_FILE).exists() {
        return VectorIndex::new(settings);
    }
    let sidecar = read_sidecar(dir)?;
    let vectors_path = dir.join(VECTORS_FILE);
    if sidecar.format_version != FORMAT_VERSION {
        return Err(Error::corrupt(
            dir,
            format!("unsupported format version {}", sidecar.format_version),
        ));
    }
    if sidecar.dimension != settings.dimension {
        return Err(Error::corrupt(
            dir,
            format!(
                "index dimension {} does not match configured dimension {}",
                sidecar.dimension, settings.dimension
            ),
        ));
    }

    let (mut data, crc): (IndexData, u32) = snapshot::read(&vectors_path, VECTORS_MAGIC)?;
    if crc != sidecar.vectors_crc32 {
        return Err(Error::corrupt(
            &vectors_path,
            format!(
                "checksum {:#010x} does not match sidecar {:#010x}",
                crc, sidecar.vectors_crc32
            ),
        ));
    }
    validate(&mut data, &sidecar).map_err(|reason| Error::corrupt(&vectors_path, reason))?;

    let settings = IndexSettings {
        hnsw: data.graph.params.clone(),
        ..settings
    };
    tracing::info!(
        dir = %dir.display(),
        live = sidecar.live_entries,
        dimension = sidecar.dimension,
        "index loaded"
    );
    Ok(VectorIndex::from_data(settings, data))
}

fn validate(data: &mut IndexData, sidecar: &IndexSidecar) -> std::result::Result<(), String> {
    if data.arena.dimension != sidecar.dimension {
        return Err(format!(
            "blob dimension {} disagrees with sidecar {}",
            data.arena.dimension, sidecar.dimension
        ));
    }
    data.arena.validate()?;
    data.graph.validate(data.arena.slot_count())?;
    data.index_slots()?;
    if data.arena.slot_count() != sidecar.slots || data.next_seq != sidecar.next_seq {
        return Err("slot count or sequence counter disagrees with sidecar".into());
    }
    if data.slot_of.len() != sidecar.entries.len() {
        return Err(format!(
            "{} live entries but sidecar lists {}",
            data.slot_of.len(),
            sidecar.entries.len()
        ));
    }
    for (id, &slot) in &data.slot_of {
        match sidecar.entries.get(id) {
            Some(&seq) if seq == data.arena.seq(slot) => {}
            Some(&seq) => {
                return Err(format!(
                    "chunk {} has sequence {} but sidecar says {}",
                    id,
                    data.arena.seq(slot),
                    seq
                ))
            }
            None => return Err(format!("chunk {} missing from sidecar", id)),
        }
        if data.arena.seq(slot) >= data.next_seq {
            return Err(format!("chunk {} sequence beyond counter", id));
        }
    }
    data.churn = 0;
    Ok(())
}
