//! Fixed byte layouts of the supported GGML block formats.
//!
//! Layouts follow GGML exactly (little-endian, no padding):
//!
//! ```text
//! Q4_0 (18 bytes / 32 elements)     Q6_K (210 bytes / 256 elements)
//! +------+------------------+       +-----------+----------+-------------+-----+
//! | d:f16| qs: [u8; 16]     |       | ql: [128] | qh: [64] | scales: [16]| d   |
//! +------+------------------+       +-----------+----------+-------------+-----+
//! ```
//!
//! [`Packing`] records which bytes of a block land in the weights plane and
//! which in the metadata plane when a tensor is transcoded for the device.

use std::fmt;

use half::f16;

/// Elements per `Q4_0` block.
pub const QK4_0: usize = 32;

/// Elements per K-quant super-block.
pub const QK_K: usize = 256;

/// GGML tensor element type codes as stored in GGUF tensor descriptors.
///
/// Codes without a named variant (the IQ families, removed types) are kept as
/// [`GgmlType::Unknown`] so a file holding them can still be indexed.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2_K,
    Q3_K,
    Q4_K,
    Q5_K,
    Q6_K,
    Q8_K,
    I8,
    I16,
    I32,
    I64,
    F64,
    BF16,
    Unknown(u32),
}

impl GgmlType {
    /// Map a GGUF dtype code to a type tag.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            6 => Self::Q5_0,
            7 => Self::Q5_1,
            8 => Self::Q8_0,
            9 => Self::Q8_1,
            10 => Self::Q2_K,
            11 => Self::Q3_K,
            12 => Self::Q4_K,
            13 => Self::Q5_K,
            14 => Self::Q6_K,
            15 => Self::Q8_K,
            24 => Self::I8,
            25 => Self::I16,
            26 => Self::I32,
            27 => Self::I64,
            28 => Self::F64,
            30 => Self::BF16,
            other => Self::Unknown(other),
        }
    }

    /// GGUF dtype code for this type.
    pub fn code(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q5_0 => 6,
            Self::Q5_1 => 7,
            Self::Q8_0 => 8,
            Self::Q8_1 => 9,
            Self::Q2_K => 10,
            Self::Q3_K => 11,
            Self::Q4_K => 12,
            Self::Q5_K => 13,
            Self::Q6_K => 14,
            Self::Q8_K => 15,
            Self::I8 => 24,
            Self::I16 => 25,
            Self::I32 => 26,
            Self::I64 => 27,
            Self::F64 => 28,
            Self::BF16 => 30,
            Self::Unknown(code) => code,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Q4_0 => "q4_0",
            Self::Q4_1 => "q4_1",
            Self::Q5_0 => "q5_0",
            Self::Q5_1 => "q5_1",
            Self::Q8_0 => "q8_0",
            Self::Q8_1 => "q8_1",
            Self::Q2_K => "q2_K",
            Self::Q3_K => "q3_K",
            Self::Q4_K => "q4_K",
            Self::Q5_K => "q5_K",
            Self::Q6_K => "q6_K",
            Self::Q8_K => "q8_K",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F64 => "f64",
            Self::BF16 => "bf16",
            Self::Unknown(_) => "unknown",
        }
    }

    /// `(elements, bytes)` of one block; plain scalar types are one-element blocks.
    fn block(self) -> Option<(usize, usize)> {
        Some(match self {
            Self::F32 => (1, 4),
            Self::F16 | Self::BF16 => (1, 2),
            Self::I8 => (1, 1),
            Self::I16 => (1, 2),
            Self::I32 => (1, 4),
            Self::I64 | Self::F64 => (1, 8),
            Self::Q4_0 => (QK4_0, BlockQ4_0::BYTES),
            Self::Q4_1 => (QK4_0, 20),
            Self::Q5_0 => (QK4_0, 22),
            Self::Q5_1 => (QK4_0, 24),
            Self::Q8_0 => (QK4_0, 34),
            Self::Q8_1 => (QK4_0, 36),
            Self::Q2_K => (QK_K, 84),
            Self::Q3_K => (QK_K, 110),
            Self::Q4_K => (QK_K, 144),
            Self::Q5_K => (QK_K, 176),
            Self::Q6_K => (QK_K, BlockQ6K::BYTES),
            Self::Q8_K => (QK_K, 292),
            Self::Unknown(_) => return None,
        })
    }

    /// Elements per block, `None` for an unknown type.
    pub fn block_elems(self) -> Option<usize> {
        self.block().map(|(elems, _)| elems)
    }

    /// Bytes per block in the GGML host layout, `None` for an unknown type.
    pub fn block_bytes(self) -> Option<usize> {
        self.block().map(|(_, bytes)| bytes)
    }

    /// Host bytes occupied by `num_elements` elements.
    ///
    /// `None` for an unknown type, a partial trailing block, or a size that
    /// overflows `usize`.
    pub fn byte_size(self, num_elements: usize) -> Option<usize> {
        let (elems, bytes) = self.block()?;
        if !num_elements.is_multiple_of(elems) {
            return None;
        }
        (num_elements / elems).checked_mul(bytes)
    }

    /// How this type is split into device planes, or `None` when it cannot be offloaded.
    pub fn packing(self) -> Option<Packing> {
        match self {
            Self::Q4_0 => Some(Packing::Split {
                block_elems: QK4_0,
                block_bytes: BlockQ4_0::BYTES,
                weights: ByteSpan::new(2, QK4_0 / 2),
                metadata: ByteSpan::new(0, 2),
            }),
            Self::Q6_K => Some(Packing::Split {
                block_elems: QK_K,
                block_bytes: BlockQ6K::BYTES,
                weights: ByteSpan::new(0, QK_K / 2 + QK_K / 4),
                metadata: ByteSpan::new(QK_K / 2 + QK_K / 4, QK_K / 16 + 2),
            }),
            Self::F32 => Some(Packing::NarrowF32),
            _ => None,
        }
    }
}

impl fmt::Display for GgmlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => f.pad(&format!("type#{code}")),
            _ => f.pad(self.name()),
        }
    }
}

/// A contiguous run of bytes inside one host block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSpan {
    pub offset: usize,
    pub len: usize,
}

impl ByteSpan {
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub fn slice<'a>(&self, block: &'a [u8]) -> &'a [u8] {
        &block[self.offset..self.offset + self.len]
    }
}

/// Rule for splitting one host row into a weights-plane row and a metadata-plane row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    /// Quantized blocks: `weights` bytes of every block go to the weights plane,
    /// `metadata` bytes to the metadata plane, both densely packed per row.
    Split {
        block_elems: usize,
        block_bytes: usize,
        weights: ByteSpan,
        metadata: ByteSpan,
    },
    /// Plain `f32` elements narrowed to `f16` in the weights plane; no metadata plane.
    NarrowF32,
}

impl Packing {
    /// Row length must be a multiple of this.
    pub fn block_elems(&self) -> usize {
        match self {
            Self::Split { block_elems, .. } => *block_elems,
            Self::NarrowF32 => 1,
        }
    }

    /// Bytes of one host row of `ne0` elements.
    pub fn host_row_bytes(&self, ne0: usize) -> usize {
        match self {
            Self::Split {
                block_elems,
                block_bytes,
                ..
            } => block_bytes * (ne0 / block_elems),
            Self::NarrowF32 => std::mem::size_of::<f32>() * ne0,
        }
    }

    /// Unpadded weights-plane bytes for a row of `ne0` elements.
    pub fn weight_row_bytes(&self, ne0: usize) -> usize {
        match self {
            Self::Split {
                block_elems,
                weights,
                ..
            } => weights.len * (ne0 / block_elems),
            Self::NarrowF32 => std::mem::size_of::<f16>() * ne0,
        }
    }

    /// Unpadded metadata-plane bytes for a row of `ne0` elements.
    pub fn metadata_row_bytes(&self, ne0: usize) -> usize {
        match self {
            Self::Split {
                block_elems,
                metadata,
                ..
            } => metadata.len * (ne0 / block_elems),
            Self::NarrowF32 => 0,
        }
    }
}

/// `Q4_0` block: one f16 scale and 32 signed-offset nibbles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockQ4_0 {
    /// Block scale (`delta`).
    pub d: f16,
    /// Byte `j`: element `j` in the low nibble, element `j + 16` in the high nibble.
    pub qs: [u8; QK4_0 / 2],
}

impl BlockQ4_0 {
    pub const BYTES: usize = 2 + QK4_0 / 2;

    /// Parse from exactly [`Self::BYTES`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), Self::BYTES);
        let mut qs = [0u8; QK4_0 / 2];
        qs.copy_from_slice(&bytes[2..Self::BYTES]);
        Self {
            d: f16::from_le_bytes([bytes[0], bytes[1]]),
            qs,
        }
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.d.to_le_bytes());
        out[2..Self::BYTES].copy_from_slice(&self.qs);
    }

    /// Reconstruct the 32 values: `(nibble - 8) * d`.
    pub fn dequantize_into(&self, out: &mut [f32]) {
        let d = self.d.to_f32();
        for (j, &byte) in self.qs.iter().enumerate() {
            out[j] = ((byte & 0x0F) as i32 - 8) as f32 * d;
            out[j + QK4_0 / 2] = ((byte >> 4) as i32 - 8) as f32 * d;
        }
    }
}

/// `Q6_K` super-block: 6-bit values split into low 4 bits and high 2 bits,
/// sixteen 8-bit sub-block scales and one f16 super-block scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockQ6K {
    pub ql: [u8; QK_K / 2],
    pub qh: [u8; QK_K / 4],
    pub scales: [i8; QK_K / 16],
    pub d: f16,
}

impl BlockQ6K {
    pub const BYTES: usize = QK_K / 2 + QK_K / 4 + QK_K / 16 + 2;

    /// Parse from exactly [`Self::BYTES`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), Self::BYTES);
        let mut ql = [0u8; QK_K / 2];
        let mut qh = [0u8; QK_K / 4];
        let mut scales = [0i8; QK_K / 16];
        ql.copy_from_slice(&bytes[..128]);
        qh.copy_from_slice(&bytes[128..192]);
        for (s, &b) in scales.iter_mut().zip(&bytes[192..208]) {
            *s = b as i8;
        }
        Self {
            ql,
            qh,
            scales,
            d: f16::from_le_bytes([bytes[208], bytes[209]]),
        }
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[..128].copy_from_slice(&self.ql);
        out[128..192].copy_from_slice(&self.qh);
        for (o, &s) in out[192..208].iter_mut().zip(&self.scales) {
            *o = s as u8;
        }
        out[208..210].copy_from_slice(&self.d.to_le_bytes());
    }

    /// Reconstruct the 256 values in GGML order.
    ///
    /// Each half of the super-block (128 values) draws on 64 `ql` bytes, 32 `qh`
    /// bytes and 8 scales. Within a half, `ql[l]` carries elements `l` (low
    /// nibble) and `l + 64` (high nibble), `ql[l + 32]` elements `l + 32` and
    /// `l + 96`, and `qh[l]` the two high bits of all four.
    pub fn dequantize_into(&self, out: &mut [f32]) {
        let d = self.d.to_f32();
        for half in 0..2 {
            let ql = &self.ql[half * 64..];
            let qh = &self.qh[half * 32..];
            let sc = &self.scales[half * 8..];
            let y = &mut out[half * 128..];
            for l in 0..32 {
                let is = l / 16;
                let q1 = ((ql[l] & 0xF) | ((qh[l] & 3) << 4)) as i32 - 32;
                let q2 = ((ql[l + 32] & 0xF) | (((qh[l] >> 2) & 3) << 4)) as i32 - 32;
                let q3 = ((ql[l] >> 4) | (((qh[l] >> 4) & 3) << 4)) as i32 - 32;
                let q4 = ((ql[l + 32] >> 4) | (((qh[l] >> 6) & 3) << 4)) as i32 - 32;
                y[l] = d * sc[is] as f32 * q1 as f32;
                y[l + 32] = d * sc[is + 2] as f32 * q2 as f32;
                y[l + 64] = d * sc[is + 4] as f32 * q3 as f32;
                y[l + 96] = d * sc[is + 6] as f32 * q4 as f32;
            }
        }
    }
}
