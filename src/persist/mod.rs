//! On-disk persistence.
//!
//! A store directory holds:
//!
//! - `MANIFEST`: magic bytes and format version
//! - `LOCK`: exclusive lock held while a store is open
//! - `store.bin`: the latest image of every block and branch, written by
//!   `Store::sync`
//!
//! The image is replaced atomically (write to a temp file, then rename) and
//! carries a CRC32 over its payload. Each block also carries the SHA-256 of
//! its rows, checked on load.

mod image;
mod manifest;

pub use image::{load_image, save_image, StoreImage, IMAGE_FILE};
pub use manifest::{acquire_lock, verify_manifest, write_manifest, LOCK_FILE, MANIFEST_FILE};
