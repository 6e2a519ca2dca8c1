//! **ctrkit** - open, decrypt, verify and mount 3DS containers.
//!
//! A container is read through a stack of [`storage`] layers: the raw file,
//! a window per partition, a [`DecryptStorage`](storage::DecryptStorage)
//! that decrypts keyed regions on demand, a chain of
//! [`VerifiedStorage`](storage::VerifiedStorage) hash-tree levels, and
//! finally a walker from [`formats`] that turns the plaintext into a
//! [`VirtualFileSystem`](vfs::VirtualFileSystem).
//!
//! # Supported formats
//! | Module | Format |
//! |--------|--------|
//! | [`formats::cci`]   | CCI / NCSD - game card image |
//! | [`formats::cia`]   | CIA - installable archive |
//! | [`formats::ncch`]  | NCCH - CXI / CFA partition |
//! | [`formats::exefs`] | ExeFS - executable file system |
//! | [`formats::ivfc`]  | IVFC - RomFS hash tree |
//! | [`formats::romfs`] | RomFS - read-only file system |
//! | [`formats::ticket`], [`formats::tmd`] | Ticket and title metadata |
//!
//! Cipher modes (ECB and XTS with ciphertext stealing, CBC, CTR) live in
//! [`crypto`]; key material is supplied through [`keys::KeySet`].

pub mod crypto;
pub mod error;
pub mod formats;
pub mod keys;
pub mod storage;
pub mod utils;
pub mod vfs;

pub use error::{Error, Result};
