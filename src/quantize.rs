//! Element codecs for merge arithmetic
//!
//! The merge engine works in f32. This module converts tensor bytes to f32
//! (`decode`) and back (`encode`) for the encodings a merge can read and
//! write:
//!
//! - `F32`, `F16`: plain IEEE floats
//! - `Q4_0`: 2 bytes (f16 scale) + 16 bytes of nibbles per 32 values
//! - `Q4_1`: 2 bytes (f16 scale) + 2 bytes (f16 min) + 16 bytes of nibbles
//! - `Q8_0`: 2 bytes (f16 scale) + 32 int8 values
//!
//! Nibble layout follows GGML: low nibbles hold positions 0-15 of a block,
//! high nibbles hold positions 16-31.

use half::f16;

use crate::error::{AdaptarError, Result};
use crate::tensor::ElementType;

/// Block size for `Q4_0`, `Q4_1` and `Q8_0`
pub const BLOCK_SIZE: usize = 32;

const Q4_0_BLOCK_BYTES: usize = 2 + 16;
const Q4_1_BLOCK_BYTES: usize = 2 + 2 + 16;
const Q8_0_BLOCK_BYTES: usize = 2 + 32;

fn check_block_multiple(kind: &str, len: usize, unit: usize) -> Result<()> {
    if len % unit != 0 {
        return Err(AdaptarError::InvalidShape {
            reason: format!("{kind} data length {len} is not a multiple of block size {unit}"),
        });
    }
    Ok(())
}

fn check_output_len(kind: &str, want: usize, got: usize) -> Result<()> {
    if want != got {
        return Err(AdaptarError::InvalidShape {
            reason: format!("{kind} needs a {want} element output, got {got}"),
        });
    }
    Ok(())
}

fn read_f16(bytes: &[u8]) -> f32 {
    f16::from_le_bytes([bytes[0], bytes[1]]).to_f32()
}

/// Bytes and values per block for a supported encoding
fn layout(dtype: ElementType) -> Result<(usize, usize)> {
    match dtype {
        ElementType::F32 => Ok((4, 1)),
        ElementType::F16 => Ok((2, 1)),
        ElementType::Q4_0 => Ok((Q4_0_BLOCK_BYTES, BLOCK_SIZE)),
        ElementType::Q4_1 => Ok((Q4_1_BLOCK_BYTES, BLOCK_SIZE)),
        ElementType::Q8_0 => Ok((Q8_0_BLOCK_BYTES, BLOCK_SIZE)),
        other => Err(AdaptarError::UnsupportedOperation {
            operation: "codec".to_string(),
            reason: format!("no codec for element type {other}"),
        }),
    }
}

fn decode_block(dtype: ElementType, block: &[u8], out: &mut [f32]) {
    match dtype {
        ElementType::F32 => out[0] = f32::from_le_bytes([block[0], block[1], block[2], block[3]]),
        ElementType::F16 => out[0] = read_f16(block),
        ElementType::Q4_0 => {
            let scale = read_f16(&block[0..2]);
            for (j, &byte) in block[2..].iter().enumerate() {
                let low = i16::from(byte & 0x0F) - 8;
                let high = i16::from(byte >> 4) - 8;
                out[j] = scale * f32::from(low);
                out[j + 16] = scale * f32::from(high);
            }
        },
        ElementType::Q4_1 => {
            let d = read_f16(&block[0..2]);
            let min = read_f16(&block[2..4]);
            for (j, &byte) in block[4..].iter().enumerate() {
                out[j] = d * f32::from(byte & 0x0F) + min;
                out[j + 16] = d * f32::from(byte >> 4) + min;
            }
        },
        _ => {
            let scale = read_f16(&block[0..2]);
            for (dst, &b) in out.iter_mut().zip(&block[2..]) {
                *dst = scale * f32::from(i8::from_le_bytes([b]));
            }
        },
    }
}

fn encode_block(dtype: ElementType, chunk: &[f32], out: &mut [u8]) {
    match dtype {
        ElementType::F32 => out.copy_from_slice(&chunk[0].to_le_bytes()),
        ElementType::F16 => out.copy_from_slice(&f16::from_f32(chunk[0]).to_le_bytes()),
        ElementType::Q4_0 => {
            // scale maps the signed value of largest magnitude to -8
            let max = chunk
                .iter()
                .copied()
                .fold(0.0f32, |acc, v| if v.abs() > acc.abs() { v } else { acc });
            let d = max / -8.0;
            let id = if d == 0.0 { 0.0 } else { 1.0 / d };

            out[0..2].copy_from_slice(&f16::from_f32(d).to_le_bytes());
            for j in 0..16 {
                let lo = ((chunk[j] * id + 8.5) as i32).clamp(0, 15) as u8;
                let hi = ((chunk[j + 16] * id + 8.5) as i32).clamp(0, 15) as u8;
                out[2 + j] = lo | (hi << 4);
            }
        },
        ElementType::Q4_1 => {
            let min = chunk.iter().copied().fold(f32::INFINITY, f32::min);
            let max = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let d = (max - min) / 15.0;
            let id = if d == 0.0 { 0.0 } else { 1.0 / d };

            out[0..2].copy_from_slice(&f16::from_f32(d).to_le_bytes());
            out[2..4].copy_from_slice(&f16::from_f32(min).to_le_bytes());
            for j in 0..16 {
                let lo = (((chunk[j] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
                let hi = (((chunk[j + 16] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
                out[4 + j] = lo | (hi << 4);
            }
        },
        _ => {
            let amax = chunk.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
            let d = amax / 127.0;
            let id = if d == 0.0 { 0.0 } else { 1.0 / d };

            out[0..2].copy_from_slice(&f16::from_f32(d).to_le_bytes());
            for (dst, &v) in out[2..].iter_mut().zip(chunk) {
                let q = (v * id).round().clamp(-128.0, 127.0) as i8;
                *dst = q.to_le_bytes()[0];
            }
        },
    }
}

/// Number of f32 values `nbytes` of `dtype` decode to
///
/// # Errors
///
/// Returns `UnsupportedOperation` for encodings without a codec, or
/// `InvalidShape` for a length that is not a whole number of blocks.
pub fn decoded_len(dtype: ElementType, nbytes: usize) -> Result<usize> {
    let (block_bytes, block_values) = layout(dtype)?;
    check_block_multiple(&dtype.to_string(), nbytes, block_bytes)?;
    Ok(nbytes / block_bytes * block_values)
}

/// Number of bytes `nvalues` f32 values encode to as `dtype`
///
/// # Errors
///
/// Returns `UnsupportedOperation` for encodings without a codec, or
/// `InvalidShape` for a count that is not a whole number of blocks.
pub fn encoded_len(dtype: ElementType, nvalues: usize) -> Result<usize> {
    let (block_bytes, block_values) = layout(dtype)?;
    check_block_multiple(&dtype.to_string(), nvalues, block_values)?;
    Ok(nvalues / block_values * block_bytes)
}

/// Decode tensor bytes into a caller-owned f32 slice
///
/// `out` must hold exactly [`decoded_len`] values.
///
/// # Errors
///
/// Returns `UnsupportedOperation` for encodings without a decoder, or
/// `InvalidShape` for a partial block or a wrongly sized `out`.
pub fn decode_into(dtype: ElementType, data: &[u8], out: &mut [f32]) -> Result<()> {
    let (block_bytes, block_values) = layout(dtype)?;
    check_output_len(&dtype.to_string(), decoded_len(dtype, data.len())?, out.len())?;
    for (block, dst) in data
        .chunks_exact(block_bytes)
        .zip(out.chunks_exact_mut(block_values))
    {
        decode_block(dtype, block, dst);
    }
    Ok(())
}

/// Encode f32 values into a caller-owned byte slice
///
/// `out` must hold exactly [`encoded_len`] bytes.
///
/// # Errors
///
/// Returns `UnsupportedOperation` for encodings without an encoder, or
/// `InvalidShape` for a partial block or a wrongly sized `out`.
pub fn encode_into(dtype: ElementType, values: &[f32], out: &mut [u8]) -> Result<()> {
    let (block_bytes, block_values) = layout(dtype)?;
    check_output_len(&dtype.to_string(), encoded_len(dtype, values.len())?, out.len())?;
    for (chunk, dst) in values
        .chunks_exact(block_values)
        .zip(out.chunks_exact_mut(block_bytes))
    {
        encode_block(dtype, chunk, dst);
    }
    Ok(())
}

/// Decode little-endian F32 bytes
///
/// # Errors
///
/// Returns error if data length is not a multiple of 4 bytes
pub fn decode_f32(data: &[u8]) -> Result<Vec<f32>> {
    decode(ElementType::F32, data)
}

/// Dequantize `F16` format weights to `F32`
///
/// # Errors
///
/// Returns error if data length is not a multiple of 2 bytes
pub fn dequantize_f16(data: &[u8]) -> Result<Vec<f32>> {
    decode(ElementType::F16, data)
}

/// Dequantize `Q4_0` format weights
///
/// # Errors
///
/// Returns error if data length is not a multiple of block size
pub fn dequantize_q4_0(data: &[u8]) -> Result<Vec<f32>> {
    decode(ElementType::Q4_0, data)
}

/// Dequantize `Q4_1` format weights
///
/// # Errors
///
/// Returns error if data length is not a multiple of block size
pub fn dequantize_q4_1(data: &[u8]) -> Result<Vec<f32>> {
    decode(ElementType::Q4_1, data)
}

/// Dequantize `Q8_0` format weights
///
/// # Errors
///
/// Returns error if data length is not a multiple of block size
pub fn dequantize_q8_0(data: &[u8]) -> Result<Vec<f32>> {
    decode(ElementType::Q8_0, data)
}

/// Quantize f32 values to `Q4_0`
///
/// Scale is chosen from the signed value of largest magnitude so that it
/// maps to -8, matching GGML's reference quantizer.
///
/// # Errors
///
/// Returns error if length is not a multiple of 32
pub fn quantize_q4_0(values: &[f32]) -> Result<Vec<u8>> {
    encode(ElementType::Q4_0, values)
}

/// Quantize f32 values to `Q4_1`
///
/// # Errors
///
/// Returns error if length is not a multiple of 32
pub fn quantize_q4_1(values: &[f32]) -> Result<Vec<u8>> {
    encode(ElementType::Q4_1, values)
}

/// Quantize f32 values to `Q8_0`
///
/// Symmetric quantization: `scale = max(abs(values)) / 127`.
///
/// # Errors
///
/// Returns error if length is not a multiple of 32
pub fn quantize_q8_0(values: &[f32]) -> Result<Vec<u8>> {
    encode(ElementType::Q8_0, values)
}

/// True if [`decode`] and [`encode`] support this element type
#[must_use]
pub fn is_supported(dtype: ElementType) -> bool {
    layout(dtype).is_ok()
}

/// Decode tensor bytes of the given element type to f32
///
/// # Errors
///
/// Returns `UnsupportedOperation` for encodings without a decoder, or
/// `InvalidShape` for a length that is not a whole number of blocks.
pub fn decode(dtype: ElementType, data: &[u8]) -> Result<Vec<f32>> {
    let mut out = vec![0.0f32; decoded_len(dtype, data.len())?];
    decode_into(dtype, data, &mut out)?;
    Ok(out)
}

/// Encode f32 values to the given element type
///
/// # Errors
///
/// Returns `UnsupportedOperation` for encodings without an encoder, or
/// `InvalidShape` for a length that is not a whole number of blocks.
pub fn encode(dtype: ElementType, values: &[f32]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; encoded_len(dtype, values.len())?];
    encode_into(dtype, values, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 - 16.0) / 4.0).collect()
    }

    #[test]
    fn test_f32_bytes_are_preserved() {
        let values = vec![1.5f32, -2.25, 0.0, 1e-7];
        let bytes = encode(ElementType::F32, &values).unwrap();
        assert_eq!(decode(ElementType::F32, &bytes).unwrap(), values);
    }

    #[test]
    fn test_f16_exact_values() {
        let values = vec![1.0f32, -0.5, 2048.0, 0.0];
        let bytes = encode(ElementType::F16, &values).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(dequantize_f16(&bytes).unwrap(), values);
    }

    #[test]
    fn test_q8_0_error_is_bounded_by_half_step() {
        let values = ramp(64);
        let bytes = quantize_q8_0(&values).unwrap();
        assert_eq!(bytes.len(), 2 * Q8_0_BLOCK_BYTES);
        let back = dequantize_q8_0(&bytes).unwrap();
        let step = 4.0 / 127.0;
        for (a, b) in values.iter().zip(&back) {
            assert!((a - b).abs() <= step, "{a} vs {b}");
        }
    }

    #[test]
    fn test_q4_0_error_is_bounded() {
        let values = ramp(32);
        let back = dequantize_q4_0(&quantize_q4_0(&values).unwrap()).unwrap();
        let step = 4.0 / 8.0;
        for (a, b) in values.iter().zip(&back) {
            assert!((a - b).abs() <= step, "{a} vs {b}");
        }
    }

    #[test]
    fn test_q4_1_error_is_bounded() {
        let values = ramp(32);
        let back = dequantize_q4_1(&quantize_q4_1(&values).unwrap()).unwrap();
        let step = (values[31] - values[0]) / 15.0;
        for (a, b) in values.iter().zip(&back) {
            assert!((a - b).abs() <= step, "{a} vs {b}");
        }
    }

    #[test]
    fn test_zero_block_quantizes_to_zero() {
        let zeros = vec![0.0f32; 32];
        for dtype in [ElementType::Q4_0, ElementType::Q4_1, ElementType::Q8_0] {
            let back = decode(dtype, &encode(dtype, &zeros).unwrap()).unwrap();
            assert!(back.iter().all(|&v| v == 0.0), "{dtype}");
        }
    }

    #[test]
    fn test_partial_block_rejected() {
        assert!(quantize_q8_0(&[1.0; 31]).is_err());
        assert!(dequantize_q4_0(&[0u8; 17]).is_err());
        assert!(dequantize_q8_0(&[0u8; 33]).is_err());
        assert!(decode_f32(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_k_quants_unsupported() {
        assert!(!is_supported(ElementType::Q4_K));
        let err = decode(ElementType::Q4_K, &[0u8; 144]).unwrap_err();
        assert!(matches!(err, AdaptarError::UnsupportedOperation { .. }));
        assert!(encode(ElementType::Q6_K, &[0.0; 256]).is_err());
    }

    #[test]
    fn test_into_variants_reject_wrong_output_length() {
        let bytes = encode(ElementType::Q8_0, &ramp(32)).unwrap();
        let mut short = vec![0.0f32; 31];
        let err = decode_into(ElementType::Q8_0, &bytes, &mut short).unwrap_err();
        assert!(matches!(err, AdaptarError::InvalidShape { .. }));

        let mut long = vec![0u8; Q8_0_BLOCK_BYTES + 1];
        assert!(encode_into(ElementType::Q8_0, &ramp(32), &mut long).is_err());
    }

    #[test]
    fn test_lengths_follow_block_layout() {
        assert_eq!(decoded_len(ElementType::Q4_1, 2 * Q4_1_BLOCK_BYTES).unwrap(), 64);
        assert_eq!(encoded_len(ElementType::F16, 5).unwrap(), 10);
        assert!(encoded_len(ElementType::Q4_0, 33).is_err());
        assert!(decoded_len(ElementType::Q4_K, 144).is_err());
    }
}
