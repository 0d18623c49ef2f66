//! Checksummed snapshot files.
//!
//! Layout: `[bincode payload][4-byte magic][u32 CRC32 BE]`. Writes go to a
//! temp file that is fsynced and renamed over the target, so a crash leaves
//! either the old snapshot or the new one, never a torn file.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

const FOOTER_LEN: usize = 8;

/// Serialize `value` and atomically replace `path`. Returns the payload CRC32.
pub fn write<T: Serialize>(path: &Path, magic: &[u8; 4], value: &T) -> Result<u32> {
    let payload = bincode::serialize(value)
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    let crc = crc32fast::hash(&payload);

    let mut out = Vec::with_capacity(payload.len() + FOOTER_LEN);
    out.extend_from_slice(&payload);
    out.extend_from_slice(magic);
    out.extend_from_slice(&crc.to_be_bytes());
    write_atomic(path, &out)?;

    tracing::debug!(
        path = %path.display(),
        bytes = payload.len(),
        crc = format_args!("{:#010x}", crc),
        "snapshot written"
    );
    Ok(crc)
}

/// Read and verify a snapshot written by [`write`]. Any mismatch is `CorruptIndex`.
/// Returns the decoded value and its payload CRC32.
pub fn read<T: DeserializeOwned>(path: &Path, magic: &[u8; 4]) -> Result<(T, u32)> {
    let raw = fs::read(path)?;
    if raw.len() < FOOTER_LEN {
        return Err(Error::corrupt(path, "file shorter than checksum footer"));
    }
    let (payload, footer) = raw.split_at(raw.len() - FOOTER_LEN);
    if &footer[..4] != magic {
        return Err(Error::corrupt(path, "bad snapshot magic"));
    }
    let stored = u32::from_be_bytes([footer[4], footer[5], footer[6], footer[7]]);
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(Error::corrupt(
            path,
            format!(
                "crc32 mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            ),
        ));
    }
    let value = bincode::deserialize(payload)
        .map_err(|e| Error::corrupt(path, format!("decode failed: {}", e)))?;
    Ok((value, stored))
}

/// Write `bytes` to `path` through a fsynced temp file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
