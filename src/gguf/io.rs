//! GGUF primitive readers
//!
//! Little-endian primitive reads over an in-memory cursor. Every read is
//! exact: running off the end of the buffer is an `IoError`.

use std::io::{Cursor, Read};

use crate::error::{AdaptarError, Result};

fn read_array<const N: usize>(cursor: &mut Cursor<&[u8]>, operation: &str) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| AdaptarError::io(operation, &e))?;
    Ok(buf)
}

/// Read a single u8 from the cursor.
pub(crate) fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    Ok(read_array::<1>(cursor, "read_u8")?[0])
}

/// Read a single i8 from the cursor.
pub(crate) fn read_i8(cursor: &mut Cursor<&[u8]>) -> Result<i8> {
    Ok(i8::from_le_bytes(read_array(cursor, "read_i8")?))
}

/// Read a u16 (little-endian) from the cursor.
pub(crate) fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    Ok(u16::from_le_bytes(read_array(cursor, "read_u16")?))
}

/// Read an i16 (little-endian) from the cursor.
pub(crate) fn read_i16(cursor: &mut Cursor<&[u8]>) -> Result<i16> {
    Ok(i16::from_le_bytes(read_array(cursor, "read_i16")?))
}

/// Read a u32 (little-endian) from the cursor.
pub(crate) fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(cursor, "read_u32")?))
}

/// Read an i32 (little-endian) from the cursor.
pub(crate) fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32> {
    Ok(i32::from_le_bytes(read_array(cursor, "read_i32")?))
}

/// Read an f32 (little-endian) from the cursor.
pub(crate) fn read_f32(cursor: &mut Cursor<&[u8]>) -> Result<f32> {
    Ok(f32::from_le_bytes(read_array(cursor, "read_f32")?))
}

/// Read a bool from the cursor.
pub(crate) fn read_bool(cursor: &mut Cursor<&[u8]>) -> Result<bool> {
    Ok(read_array::<1>(cursor, "read_bool")?[0] != 0)
}

/// Read a u64 (little-endian) from the cursor.
pub(crate) fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(cursor, "read_u64")?))
}

/// Read an i64 (little-endian) from the cursor.
pub(crate) fn read_i64(cursor: &mut Cursor<&[u8]>) -> Result<i64> {
    Ok(i64::from_le_bytes(read_array(cursor, "read_i64")?))
}

/// Read an f64 (little-endian) from the cursor.
pub(crate) fn read_f64(cursor: &mut Cursor<&[u8]>) -> Result<f64> {
    Ok(f64::from_le_bytes(read_array(cursor, "read_f64")?))
}
