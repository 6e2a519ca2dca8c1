//! Shared fixtures: deterministic keys and in-memory container builders.
#![allow(dead_code)]

use ctrkit::keys::{KeySet, KeySlot};
use ctrkit::storage::{MemoryStorage, SharedStorage};

pub mod images;

pub use images::{CiaImage, ExeFsImage, NcchImage, RomFsImage, cci_image, ivfc_image};

pub const PRIMARY_KEY: [u8; 16] = [0x2C; 16];
pub const SECONDARY_KEY: [u8; 16] = [0x25; 16];
pub const COMMON_KEY: [u8; 16] = [0xC0; 16];
pub const TITLE_KEY: [u8; 16] = [0x7E; 16];
pub const PARTITION_ID: u64 = 0x0004_0000_0012_3400;

/// Keys able to open every image built here.
pub fn test_keys() -> KeySet {
    let mut keys = KeySet::new();
    keys.common_keys[0] = Some(COMMON_KEY);
    keys.ncch_keys.insert((PARTITION_ID, KeySlot::Slot0x2C), PRIMARY_KEY);
    keys.ncch_keys.insert((PARTITION_ID, KeySlot::Slot0x25), SECONDARY_KEY);
    keys
}

pub fn memory(data: Vec<u8>) -> SharedStorage {
    MemoryStorage::shared(data)
}

/// Deterministic filler of `len` bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Install a test subscriber once, so `RUST_LOG=ctrkit=trace` shows library
/// logs while debugging a test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
