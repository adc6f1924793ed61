//! CPU execution of the dequantization kernels.
//!
//! Reads the same planes and writes the same half-precision output as the
//! WGSL shaders. Each output row is one rayon work item; blocks inside a row
//! run sequentially.

use half::f16;
use rayon::prelude::*;

use super::dispatch::KernelInfo;
use super::kernel::KernelKind;
use crate::error::{DequantError, Result};
use crate::quant::{BlockQ4_0, BlockQ6K, GgmlType, Packing, QK_K};

/// A zero-filled host buffer, failing instead of aborting when memory is short.
pub(crate) fn zeroed(bytes: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(bytes)
        .map_err(|e| DequantError::AllocationFailed {
            bytes,
            reason: e.to_string(),
        })?;
    buf.resize(bytes, 0);
    Ok(buf)
}

pub(crate) fn execute(kind: KernelKind, weights: &[u8], metadata: &[u8], output: &mut [u8], info: KernelInfo) {
    let ne0 = info.ne0 as usize;
    let rows = info.rows as usize;
    let weight_stride = info.weight_stride as usize;
    let metadata_stride = info.metadata_stride as usize;
    let row_out = ne0 * 2;
    if ne0 == 0 || rows == 0 {
        return;
    }

    output[..row_out * rows]
        .par_chunks_mut(row_out)
        .enumerate()
        .for_each(|(row, out)| {
            let w = &weights[row * weight_stride..];
            match kind {
                KernelKind::ConvertF16 => out.copy_from_slice(&w[..row_out]),
                KernelKind::DequantizeQ4_0 => {
                    let m = &metadata[row * metadata_stride..];
                    dequantize_row(GgmlType::Q4_0, w, m, out, |block, values| {
                        BlockQ4_0::from_bytes(block).dequantize_into(values)
                    });
                }
                KernelKind::DequantizeQ6K => {
                    let m = &metadata[row * metadata_stride..];
                    dequantize_row(GgmlType::Q6_K, w, m, out, |block, values| {
                        BlockQ6K::from_bytes(block).dequantize_into(values)
                    });
                }
            }
        });
}

/// Reassemble each host block from its two planes, decode it, store as f16.
fn dequantize_row(
    ggml_type: GgmlType,
    weights: &[u8],
    metadata: &[u8],
    out: &mut [u8],
    decode: impl Fn(&[u8], &mut [f32]),
) {
    let Some(Packing::Split {
        block_elems,
        block_bytes,
        weights: wspan,
        metadata: mspan,
    }) = ggml_type.packing()
    else {
        return;
    };

    let mut block = [0u8; BlockQ6K::BYTES];
    let mut values = [0f32; QK_K];
    let block = &mut block[..block_bytes];
    let values = &mut values[..block_elems];

    for (j, out_block) in out.chunks_exact_mut(block_elems * 2).enumerate() {
        block[wspan.offset..wspan.offset + wspan.len]
            .copy_from_slice(&weights[j * wspan.len..(j + 1) * wspan.len]);
        block[mspan.offset..mspan.offset + mspan.len]
            .copy_from_slice(&metadata[j * mspan.len..(j + 1) * mspan.len]);
        decode(block, values);
        for (dst, v) in out_block.chunks_exact_mut(2).zip(values.iter()) {
            dst.copy_from_slice(&f16::from_f32(*v).to_le_bytes());
        }
    }
}
