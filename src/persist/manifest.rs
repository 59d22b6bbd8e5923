//! Store manifest and directory lock.

use crate::error::{Result, StoreError};
use fs2::FileExt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

pub const MANIFEST_FILE: &str = "MANIFEST";
pub const LOCK_FILE: &str = "LOCK";

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"BRS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

pub fn write_manifest(dir: &Path) -> Result<()> {
    let mut file = File::create(dir.join(MANIFEST_FILE))?;
    file.write_all(STORE_MAGIC)?;
    file.write_all(&[STORE_VERSION])?;
    file.sync_all()?;
    Ok(())
}

pub fn verify_manifest(dir: &Path) -> Result<()> {
    let path = dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Err(StoreError::NotInitialized);
    }
    let mut file = File::open(path)?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != STORE_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid store magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != STORE_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported store version: {}",
            version[0]
        )));
    }

    Ok(())
}

/// Take the directory's exclusive lock. Released when the file is dropped.
pub fn acquire_lock(dir: &Path) -> Result<File> {
    let lock_file = File::create(dir.join(LOCK_FILE))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| StoreError::Locked)?;
    Ok(lock_file)
}
