//! Block formats and the CPU reference quantizers.

pub mod block;
pub mod reference;

#[cfg(test)]
mod tests;

pub use block::{BlockQ4_0, BlockQ6K, ByteSpan, GgmlType, Packing, QK4_0, QK_K};
pub use reference::{
    dequantize_row_q4_0, dequantize_row_q6_k, f32_to_bytes, quantize_row_q4_0, quantize_row_q6_k,
};
