//! Low-level I/O primitives shared by all parsers.
//!
//! Each reader function reads exactly the bytes it promises or returns an
//! error - there is no partial-read ambiguity.

use std::io::Read;

use crate::{Error, Result};

/// Read one byte.
#[inline]
pub(crate) fn u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

/// Read a little-endian `u16`.
#[inline]
pub(crate) fn le_u16<R: Read>(r: &mut R) -> Result<u16> {
    Ok(u16::from_le_bytes(bytesa(r)?))
}

/// Read a little-endian `u32`.
#[inline]
pub(crate) fn le_u32<R: Read>(r: &mut R) -> Result<u32> {
    Ok(u32::from_le_bytes(bytesa(r)?))
}

/// Read a little-endian `u64`.
#[inline]
pub(crate) fn le_u64<R: Read>(r: &mut R) -> Result<u64> {
    Ok(u64::from_le_bytes(bytesa(r)?))
}

/// Read a big-endian `u16`. Signed tickets and TMDs are big-endian.
#[inline]
pub(crate) fn be_u16<R: Read>(r: &mut R) -> Result<u16> {
    Ok(u16::from_be_bytes(bytesa(r)?))
}

/// Read a big-endian `u32`.
#[inline]
pub(crate) fn be_u32<R: Read>(r: &mut R) -> Result<u32> {
    Ok(u32::from_be_bytes(bytesa(r)?))
}

/// Read a big-endian `u64`.
#[inline]
pub(crate) fn be_u64<R: Read>(r: &mut R) -> Result<u64> {
    Ok(u64::from_be_bytes(bytesa(r)?))
}

/// Read exactly `N` bytes into a fixed-size array.
#[inline]
pub(crate) fn bytesa<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
    let mut b = [0u8; N];
    r.read_exact(&mut b)?;
    Ok(b)
}

/// Read exactly `len` bytes into a `Vec`.
#[inline]
pub(crate) fn bytesv<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut b = vec![0u8; len];
    r.read_exact(&mut b)?;
    Ok(b)
}

/// Verify that the next `N` bytes in the stream match `expected`.
///
/// Returns [`Error::BadMagic`] on mismatch.
#[inline]
pub(crate) fn magic<R: Read, const N: usize>(r: &mut R, expected: &[u8; N]) -> Result<()> {
    let got = bytesa::<N>(r)?;
    if &got != expected {
        return Err(Error::BadMagic);
    }
    Ok(())
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
///
/// Returns [`Error::InvalidRange`] on overflow.
#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> Result<u64> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
        .ok_or(Error::InvalidRange)
}

/// `offset + len`, failing with [`Error::InvalidRange`] on overflow.
#[inline]
pub(crate) fn end_of(offset: u64, len: u64) -> Result<u64> {
    offset.checked_add(len).ok_or(Error::InvalidRange)
}

/// Little-endian `u32` at `offset` inside an already-loaded table.
#[inline]
pub(crate) fn le_u32_at(buf: &[u8], offset: usize) -> Result<u32> {
    let b = buf.get(offset..offset + 4).ok_or(Error::InvalidRange)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Little-endian `u64` at `offset` inside an already-loaded table.
#[inline]
pub(crate) fn le_u64_at(buf: &[u8], offset: usize) -> Result<u64> {
    let lo = le_u32_at(buf, offset)? as u64;
    let hi = le_u32_at(buf, offset + 4)? as u64;
    Ok(lo | (hi << 32))
}

/// Decode a UTF-16LE name of `byte_len` bytes at `offset`.
///
/// Returns [`Error::InvalidName`] for odd lengths or unpaired surrogates.
pub(crate) fn utf16_name(buf: &[u8], offset: usize, byte_len: usize) -> Result<String> {
    if byte_len % 2 != 0 {
        return Err(Error::InvalidName);
    }
    let raw = buf
        .get(offset..offset + byte_len)
        .ok_or(Error::InvalidRange)?;
    let units = raw.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]]));
    char::decode_utf16(units)
        .collect::<std::result::Result<String, _>>()
        .map_err(|_| Error::InvalidName)
}

/// Decode a fixed-width, NUL-padded ASCII field (ExeFS section names,
/// product codes).
pub(crate) fn padded_ascii(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
