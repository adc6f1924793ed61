//! CPU quantize / dequantize routines used as the correctness oracle for the
//! device path. Rounding follows GGML's `*_reference` functions so that the
//! packed bytes match what a GGUF file would contain.

use half::f16;

use super::block::{BlockQ4_0, BlockQ6K, QK4_0, QK_K};
use crate::error::{DequantError, Result};

fn check_len(what: &str, len: usize, block: usize) -> Result<()> {
    if !len.is_multiple_of(block) {
        return Err(DequantError::invalid_tensor(
            what,
            format!("length {len} is not a multiple of block size {block}"),
        ));
    }
    Ok(())
}

/// Quantize one row of `f32` to `Q4_0` blocks.
///
/// The signed value with the largest magnitude maps to nibble 0, so the scale
/// is `max / -8` and every other value lands in `0..=15`.
pub fn quantize_row_q4_0(x: &[f32]) -> Result<Vec<u8>> {
    check_len("q4_0 row", x.len(), QK4_0)?;
    let mut out = vec![0u8; x.len() / QK4_0 * BlockQ4_0::BYTES];

    for (values, dst) in x
        .chunks_exact(QK4_0)
        .zip(out.chunks_exact_mut(BlockQ4_0::BYTES))
    {
        let mut amax = 0.0f32;
        let mut max = 0.0f32;
        for &v in values {
            if amax < v.abs() {
                amax = v.abs();
                max = v;
            }
        }

        let d = max / -8.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        let mut qs = [0u8; QK4_0 / 2];
        for (j, q) in qs.iter_mut().enumerate() {
            let x0 = values[j] * id;
            let x1 = values[QK4_0 / 2 + j] * id;
            let xi0 = ((x0 + 8.5) as i8).min(15) as u8;
            let xi1 = ((x1 + 8.5) as i8).min(15) as u8;
            *q = xi0 | (xi1 << 4);
        }

        BlockQ4_0 {
            d: f16::from_f32(d),
            qs,
        }
        .write_to(dst);
    }
    Ok(out)
}

/// Dequantize `Q4_0` blocks into `y`; `y.len()` must be `blocks * 32`.
pub fn dequantize_row_q4_0(blocks: &[u8], y: &mut [f32]) -> Result<()> {
    check_len("q4_0 row", y.len(), QK4_0)?;
    let expected = y.len() / QK4_0 * BlockQ4_0::BYTES;
    if blocks.len() != expected {
        return Err(DequantError::invalid_tensor(
            "q4_0 row",
            format!("expected {expected} bytes, got {}", blocks.len()),
        ));
    }
    for (src, dst) in blocks
        .chunks_exact(BlockQ4_0::BYTES)
        .zip(y.chunks_exact_mut(QK4_0))
    {
        BlockQ4_0::from_bytes(src).dequantize_into(dst);
    }
    Ok(())
}

/// Quantize one row of `f32` to `Q6_K` super-blocks.
///
/// Each 16-element sub-block gets a float scale mapping its extreme value to
/// -32; the sub-scales are then quantized to `i8` against the super-block
/// scale `d` and the 6-bit values recomputed against `d * scale`.
pub fn quantize_row_q6_k(x: &[f32]) -> Result<Vec<u8>> {
    check_len("q6_K row", x.len(), QK_K)?;
    let mut out = vec![0u8; x.len() / QK_K * BlockQ6K::BYTES];

    for (values, dst) in x.chunks_exact(QK_K).zip(out.chunks_exact_mut(BlockQ6K::BYTES)) {
        let mut sub_scales = [0.0f32; QK_K / 16];
        let mut max_scale = 0.0f32;
        let mut max_abs_scale = 0.0f32;

        for (ib, sub) in values.chunks_exact(16).enumerate() {
            let mut amax = 0.0f32;
            let mut max = 0.0f32;
            for &v in sub {
                if amax < v.abs() {
                    amax = v.abs();
                    max = v;
                }
            }
            let scale = max / -32.0;
            sub_scales[ib] = scale;
            if scale.abs() > max_abs_scale {
                max_abs_scale = scale.abs();
                max_scale = scale;
            }
        }

        let mut block = BlockQ6K {
            ql: [0; QK_K / 2],
            qh: [0; QK_K / 4],
            scales: [0; QK_K / 16],
            d: f16::ZERO,
        };

        // Six-bit codes, offset by 32; 32 decodes to zero.
        let mut levels = [32u8; QK_K];

        if max_abs_scale > 0.0 {
            let iscale = -128.0 / max_scale;
            block.d = f16::from_f32(1.0 / iscale);
            for (s, &sub) in block.scales.iter_mut().zip(&sub_scales) {
                *s = (iscale * sub).round().clamp(-128.0, 127.0) as i8;
            }

            let d = block.d.to_f32();
            for (ib, sub) in values.chunks_exact(16).enumerate() {
                let dd = d * block.scales[ib] as f32;
                if dd == 0.0 {
                    continue;
                }
                for (ii, &v) in sub.iter().enumerate() {
                    let l = (v / dd).round().clamp(-32.0, 31.0) as i32;
                    levels[ib * 16 + ii] = (l + 32) as u8;
                }
            }
        }

        for half in 0..2 {
            let lv = &levels[half * 128..];
            for l in 0..32 {
                let q1 = lv[l] & 0xF;
                let q2 = lv[l + 32] & 0xF;
                let q3 = lv[l + 64] & 0xF;
                let q4 = lv[l + 96] & 0xF;
                block.ql[half * 64 + l] = q1 | (q3 << 4);
                block.ql[half * 64 + l + 32] = q2 | (q4 << 4);
                block.qh[half * 32 + l] = (lv[l] >> 4)
                    | ((lv[l + 32] >> 4) << 2)
                    | ((lv[l + 64] >> 4) << 4)
                    | ((lv[l + 96] >> 4) << 6);
            }
        }

        block.write_to(dst);
    }
    Ok(out)
}

/// Dequantize `Q6_K` super-blocks into `y`; `y.len()` must be `blocks * 256`.
pub fn dequantize_row_q6_k(blocks: &[u8], y: &mut [f32]) -> Result<()> {
    check_len("q6_K row", y.len(), QK_K)?;
    let expected = y.len() / QK_K * BlockQ6K::BYTES;
    if blocks.len() != expected {
        return Err(DequantError::invalid_tensor(
            "q6_K row",
            format!("expected {expected} bytes, got {}", blocks.len()),
        ));
    }
    for (src, dst) in blocks
        .chunks_exact(BlockQ6K::BYTES)
        .zip(y.chunks_exact_mut(QK_K))
    {
        BlockQ6K::from_bytes(src).dequantize_into(dst);
    }
    Ok(())
}

/// Encode `f32` values as little-endian bytes, the host layout of an F32 tensor.
pub fn f32_to_bytes(x: &[f32]) -> Vec<u8> {
    x.iter().flat_map(|v| v.to_le_bytes()).collect()
}
