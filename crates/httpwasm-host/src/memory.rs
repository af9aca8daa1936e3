//! Reads and writes into guest linear memory.
//!
//! Everything here works on the raw memory slice so the host functions can
//! borrow memory and store state at the same time via
//! `Memory::data_and_store_mut`.

use crate::abi::pack;
use crate::error::GuestFault;

/// Borrow `len` bytes at `offset`, faulting if the region is out of bounds.
pub fn read_bytes(memory: &[u8], offset: u32, len: u32) -> Result<&[u8], GuestFault> {
    if len == 0 {
        return Ok(&[]);
    }
    let range = region(memory.len(), offset, len)?;
    Ok(&memory[range])
}

/// Read a UTF-8 string at `offset`.
pub fn read_string(
    memory: &[u8],
    offset: u32,
    len: u32,
    what: &'static str,
) -> Result<String, GuestFault> {
    let bytes = read_bytes(memory, offset, len)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| GuestFault::InvalidUtf8 { what })
}

/// Mutably borrow `len` bytes at `offset`.
pub fn slice_mut(memory: &mut [u8], offset: u32, len: u32) -> Result<&mut [u8], GuestFault> {
    if len == 0 {
        return Ok(&mut []);
    }
    let range = region(memory.len(), offset, len)?;
    Ok(&mut memory[range])
}

/// Write `bytes` at `offset` if they fit in `limit`.
///
/// Always returns the true length so the guest can retry with a larger
/// buffer. Nothing is written when the value is empty or too large.
pub fn write_if_under_limit(
    memory: &mut [u8],
    offset: u32,
    limit: u32,
    bytes: &[u8],
) -> Result<u32, GuestFault> {
    let len = checked_len(bytes.len())?;
    if len == 0 || len > limit {
        return Ok(len);
    }
    slice_mut(memory, offset, len)?.copy_from_slice(bytes);
    Ok(len)
}

/// Write a NUL-delimited list of names at `offset` if it fits in `limit`.
///
/// Returns `(count << 32) | byte_count`, where `byte_count` includes one NUL
/// per name.
pub fn write_nul_terminated<S: AsRef<str>>(
    memory: &mut [u8],
    offset: u32,
    limit: u32,
    names: &[S],
) -> Result<u64, GuestFault> {
    if names.is_empty() {
        return Ok(0);
    }
    let count = checked_len(names.len())?;
    let byte_count = checked_len(names.iter().map(|n| n.as_ref().len() + 1).sum())?;
    let encoded = pack(count, byte_count);
    if byte_count > limit {
        return Ok(encoded);
    }

    let out = slice_mut(memory, offset, byte_count)?;
    let mut pos = 0;
    for name in names {
        let name = name.as_ref().as_bytes();
        out[pos..pos + name.len()].copy_from_slice(name);
        pos += name.len();
        out[pos] = 0;
        pos += 1;
    }
    Ok(encoded)
}

/// Split a NUL-delimited list back into its names.
pub fn decode_nul_terminated(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

fn region(size: usize, offset: u32, len: u32) -> Result<std::ops::Range<usize>, GuestFault> {
    let start = offset as usize;
    match start.checked_add(len as usize) {
        Some(end) if end <= size => Ok(start..end),
        _ => Err(GuestFault::OutOfBounds { offset, len, size }),
    }
}

fn checked_len(len: usize) -> Result<u32, GuestFault> {
    u32::try_from(len).map_err(|_| GuestFault::OutOfBounds {
        offset: 0,
        len: u32::MAX,
        size: len,
    })
}
