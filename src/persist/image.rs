//! Checksummed store image (`store.bin`).
//!
//! Layout: magic (4) | version (1) | payload length (u64 LE) | payload |
//! crc32 of payload (u32 LE). The payload is a MessagePack `StoreImage`.

use crate::blocks::Block;
use crate::branches::RegistryExport;
use crate::error::{Result, StoreError};
use crate::types::{BlockId, Branch, Hash, OpLogEntry, Snapshot, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub const IMAGE_FILE: &str = "store.bin";

const IMAGE_MAGIC: &[u8; 4] = b"BRI\0";
const IMAGE_VERSION: u8 = 1;

/// Magic, format version and payload length.
const HEADER_LEN: u64 = 4 + 1 + 8;
const CHECKSUM_LEN: u64 = 4;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BlockRecord {
    id: BlockId,
    version: Version,
    ref_count: usize,
    hash: Hash,
    rows: Vec<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BranchRecord {
    meta: Branch,
    snapshot: Snapshot,
    log: Vec<OpLogEntry>,
}

/// Everything needed to rebuild a store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreImage {
    blocks: Vec<BlockRecord>,
    last_block_id: u64,
    last_version: Version,
    /// In creation order, `main` first.
    branches: Vec<BranchRecord>,
    created: u64,
}

/// Parts a verified image decodes into.
pub(crate) struct ImageParts {
    pub blocks: Vec<Block>,
    pub last_block_id: u64,
    pub last_version: Version,
    pub branches: Vec<(Branch, Snapshot, Vec<OpLogEntry>)>,
    pub created: u64,
}

impl StoreImage {
    pub(crate) fn from_export(export: RegistryExport) -> Self {
        let blocks = export
            .blocks
            .into_iter()
            .map(|block| {
                let hash = block.content_hash();
                BlockRecord {
                    id: block.id,
                    version: block.version,
                    ref_count: block.ref_count,
                    hash,
                    rows: block.rows.as_ref().clone(),
                }
            })
            .collect();

        let branches = export
            .branches
            .into_iter()
            .map(|(meta, snapshot, log)| BranchRecord {
                meta,
                snapshot,
                log,
            })
            .collect();

        Self {
            blocks,
            last_block_id: export.last_block_id,
            last_version: export.last_version,
            branches,
            created: export.created,
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Check every block hash and reference count, then split the image
    /// into the parts the block store and registry are rebuilt from.
    pub(crate) fn into_parts(self) -> Result<ImageParts> {
        let mut references: HashMap<BlockId, usize> = HashMap::new();
        for branch in &self.branches {
            for id in branch.snapshot.values() {
                *references.entry(*id).or_default() += 1;
            }
        }

        let mut blocks = Vec::with_capacity(self.blocks.len());
        for record in self.blocks {
            let got = Hash::of_rows(&record.rows);
            if got != record.hash {
                return Err(StoreError::HashMismatch {
                    block: record.id,
                    expected: record.hash,
                    got,
                });
            }

            let referenced = references.remove(&record.id).unwrap_or(0);
            if referenced != record.ref_count {
                return Err(StoreError::Corruption(format!(
                    "block {} has ref count {} but {} snapshot references",
                    record.id, record.ref_count, referenced
                )));
            }
            if record.id.0 > self.last_block_id || record.version > self.last_version {
                return Err(StoreError::Corruption(format!(
                    "block {} is ahead of the store counters",
                    record.id
                )));
            }

            blocks.push(Block {
                id: record.id,
                rows: Arc::new(record.rows),
                version: record.version,
                ref_count: record.ref_count,
            });
        }

        if let Some(missing) = references.keys().next() {
            return Err(StoreError::Corruption(format!(
                "snapshot references missing block {}",
                missing
            )));
        }

        Ok(ImageParts {
            blocks,
            last_block_id: self.last_block_id,
            last_version: self.last_version,
            branches: self
                .branches
                .into_iter()
                .map(|b| (b.meta, b.snapshot, b.log))
                .collect(),
            created: self.created,
        })
    }
}

/// Write `image` to `dir/store.bin`, replacing any previous image.
pub fn save_image(dir: &Path, image: &StoreImage) -> Result<()> {
    let payload = rmp_serde::to_vec_named(image)?;
    let checksum = crc32fast::hash(&payload);

    let tmp_path = dir.join(format!("{}.tmp", IMAGE_FILE));
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(IMAGE_MAGIC)?;
        writer.write_all(&[IMAGE_VERSION])?;
        writer.write_all(&(payload.len() as u64).to_le_bytes())?;
        writer.write_all(&payload)?;
        writer.write_all(&checksum.to_le_bytes())?;

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, dir.join(IMAGE_FILE))?;

    debug!(
        blocks = image.block_count(),
        branches = image.branch_count(),
        bytes = payload.len(),
        "saved store image"
    );
    Ok(())
}

/// Read `dir/store.bin`. `None` if no image was ever written.
pub fn load_image(dir: &Path) -> Result<Option<StoreImage>> {
    let path = dir.join(IMAGE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != IMAGE_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid store image magic".into()));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != IMAGE_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported store image version: {}",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes);
    // The length is unverified until the checksum is read; never trust it
    // past what the file can hold.
    if len > file_len.saturating_sub(HEADER_LEN + CHECKSUM_LEN) {
        return Err(StoreError::Corruption(format!(
            "store image payload length {} exceeds file size {}",
            len, file_len
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let expected = u32::from_le_bytes(checksum_bytes);
    let got = crc32fast::hash(&payload);
    if expected != got {
        return Err(StoreError::ChecksumMismatch { expected, got });
    }

    let image: StoreImage = rmp_serde::from_slice(&payload)?;
    debug!(
        blocks = image.block_count(),
        branches = image.branch_count(),
        "loaded store image"
    );
    Ok(Some(image))
}
