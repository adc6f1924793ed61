//! Layout transcoder: GGML host tensor -> two strided device planes.
//!
//! Each row of a quantized tensor is split block by block into a weights plane
//! (packed values) and a metadata plane (scales). Both planes use a row stride
//! padded to 64 bytes so every row starts on a cache line.

use std::fmt;

use half::f16;
use tracing::debug;

use super::context::{DeviceBuffer, DeviceContext, Planes};
use super::dispatch::KernelInfo;
use super::host;
use crate::error::{DequantError, Result};
use crate::quant::{GgmlType, Packing};
use crate::tensor::TensorSource;

/// Row strides of both planes are multiples of this.
pub const STRIDE_ALIGN: usize = 64;

/// Round a row length in bytes up to the next multiple of [`STRIDE_ALIGN`].
pub fn padded_stride(bytes: usize) -> usize {
    bytes.next_multiple_of(STRIDE_ALIGN)
}

/// Device-side geometry of one tensor, computed without touching a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorLayout {
    pub ggml_type: GgmlType,
    pub packing: Packing,
    /// 1 or 2.
    pub rank: usize,
    /// Elements per dimension, innermost first; the missing dimension is 1.
    pub ne: [usize; 2],
    pub weight_stride: usize,
    /// 0 when the format has no metadata plane.
    pub metadata_stride: usize,
}

impl TensorLayout {
    /// Validate `tensor` and work out its plane strides.
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` for types without a packing rule, `InvalidTensor`
    /// for rank outside 1..=2, ragged rows, short data, or a tensor too large
    /// for 32-bit device offsets.
    pub fn for_tensor<T: TensorSource + ?Sized>(tensor: &T) -> Result<Self> {
        let ggml_type = tensor.ggml_type();
        let packing = ggml_type
            .packing()
            .ok_or(DequantError::UnsupportedFormat { ggml_type })?;

        let dims = tensor.dims();
        let rank = dims.len();
        if !(1..=2).contains(&rank) {
            return Err(DequantError::invalid_tensor(
                tensor.name(),
                format!("rank {rank} is not supported, expected 1 or 2"),
            ));
        }
        let ne = [dims[0], dims.get(1).copied().unwrap_or(1)];
        if ne[0] == 0 || ne[1] == 0 {
            return Err(DequantError::invalid_tensor(tensor.name(), "tensor has no elements"));
        }
        if !ne[0].is_multiple_of(packing.block_elems()) {
            return Err(DequantError::invalid_tensor(
                tensor.name(),
                format!(
                    "row length {} is not a multiple of the {ggml_type} block size {}",
                    ne[0],
                    packing.block_elems()
                ),
            ));
        }

        let needed = packing
            .host_row_bytes(ne[0])
            .checked_mul(ne[1])
            .ok_or_else(|| DequantError::invalid_tensor(tensor.name(), "tensor size overflows"))?;
        if tensor.data().len() < needed {
            return Err(DequantError::invalid_tensor(
                tensor.name(),
                format!("data holds {} bytes, {needed} needed", tensor.data().len()),
            ));
        }

        let layout = Self {
            ggml_type,
            packing,
            rank,
            ne,
            weight_stride: padded_stride(packing.weight_row_bytes(ne[0])),
            metadata_stride: padded_stride(packing.metadata_row_bytes(ne[0])),
        };

        let largest = layout.weights_bytes().max(layout.output_bytes());
        if u32::try_from(largest).is_err() {
            return Err(DequantError::invalid_tensor(
                tensor.name(),
                format!("{largest} bytes exceed 32-bit device addressing"),
            ));
        }
        Ok(layout)
    }

    pub fn rows(&self) -> usize {
        self.ne[1]
    }

    pub fn num_elements(&self) -> usize {
        self.ne[0] * self.ne[1]
    }

    /// Size of the weights plane.
    pub fn weights_bytes(&self) -> usize {
        self.weight_stride * self.rows()
    }

    /// Size of the metadata plane, 0 when there is none.
    pub fn metadata_bytes(&self) -> usize {
        self.metadata_stride * self.rows()
    }

    /// Half-precision output of the whole tensor, in whole 32-bit words.
    pub fn output_bytes(&self) -> usize {
        (self.num_elements() * std::mem::size_of::<f16>()).next_multiple_of(4)
    }

    pub(crate) fn kernel_info(&self) -> KernelInfo {
        // for_tensor bounds every quantity here by the weights or output size.
        KernelInfo {
            ne0: self.ne[0] as u32,
            rows: self.rows() as u32,
            weight_stride: self.weight_stride as u32,
            metadata_stride: self.metadata_stride as u32,
        }
    }

    /// Build the host staging buffers of both planes. Padding bytes are zero.
    pub fn repack<T: TensorSource + ?Sized>(&self, tensor: &T) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let row_bytes = self.packing.host_row_bytes(self.ne[0]);
        let rows = tensor.data()[..row_bytes * self.rows()].chunks_exact(row_bytes);
        let mut weights = host::zeroed(self.weights_bytes())?;

        match self.packing {
            Packing::Split {
                block_bytes,
                weights: wspan,
                metadata: mspan,
                ..
            } => {
                let mut metadata = host::zeroed(self.metadata_bytes())?;
                let planes = weights
                    .chunks_exact_mut(self.weight_stride)
                    .zip(metadata.chunks_exact_mut(self.metadata_stride));
                for (src, (wrow, mrow)) in rows.zip(planes) {
                    for (j, block) in src.chunks_exact(block_bytes).enumerate() {
                        wrow[j * wspan.len..(j + 1) * wspan.len].copy_from_slice(wspan.slice(block));
                        mrow[j * mspan.len..(j + 1) * mspan.len].copy_from_slice(mspan.slice(block));
                    }
                }
                Ok((weights, Some(metadata)))
            }
            Packing::NarrowF32 => {
                for (src, wrow) in rows.zip(weights.chunks_exact_mut(self.weight_stride)) {
                    for (x, dst) in src.chunks_exact(4).zip(wrow.chunks_exact_mut(2)) {
                        let x = f32::from_le_bytes([x[0], x[1], x[2], x[3]]);
                        dst.copy_from_slice(&f16::from_f32(x).to_le_bytes());
                    }
                }
                Ok((weights, None))
            }
        }
    }
}

/// A tensor resident on a [`DeviceContext`], ready to dequantize.
///
/// Borrows its context, so it cannot outlive it. The device buffers are
/// freed when the tensor is released or dropped.
pub struct DeviceTensor<'ctx> {
    ctx: &'ctx DeviceContext,
    name: String,
    layout: TensorLayout,
    weights: DeviceBuffer,
    metadata: Option<DeviceBuffer>,
}

impl fmt::Debug for DeviceTensor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl<'ctx> DeviceTensor<'ctx> {
    /// Transcode `tensor` and upload both planes. The staging memory is dropped
    /// once the upload completes.
    pub fn from_host<T: TensorSource + ?Sized>(ctx: &'ctx DeviceContext, tensor: &T) -> Result<Self> {
        let layout = TensorLayout::for_tensor(tensor)?;
        ctx.check_size(layout.weights_bytes())?;
        ctx.check_size(layout.metadata_bytes())?;

        let (weights, metadata) = layout.repack(tensor)?;
        let weights = ctx.upload(weights)?;
        let metadata = metadata.map(|plane| ctx.upload(plane)).transpose()?;

        debug!(
            tensor = tensor.name(),
            ggml_type = %layout.ggml_type,
            ne0 = layout.ne[0],
            ne1 = layout.ne[1],
            weight_stride = layout.weight_stride,
            metadata_stride = layout.metadata_stride,
            "Uploaded tensor"
        );

        Ok(Self {
            ctx,
            name: tensor.name().to_string(),
            layout,
            weights,
            metadata,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ggml_type(&self) -> GgmlType {
        self.layout.ggml_type
    }

    pub fn rank(&self) -> usize {
        self.layout.rank
    }

    pub fn ne(&self) -> [usize; 2] {
        self.layout.ne
    }

    pub fn num_elements(&self) -> usize {
        self.layout.num_elements()
    }

    pub fn weight_stride(&self) -> usize {
        self.layout.weight_stride
    }

    pub fn metadata_stride(&self) -> usize {
        self.layout.metadata_stride
    }

    pub fn layout(&self) -> &TensorLayout {
        &self.layout
    }

    /// Bytes held on the device by both planes.
    pub fn device_bytes(&self) -> usize {
        self.weights.len() + self.metadata.as_ref().map_or(0, DeviceBuffer::len)
    }

    pub fn context(&self) -> &'ctx DeviceContext {
        self.ctx
    }

    pub(crate) fn planes(&self) -> Planes<'_> {
        Planes {
            weights: &self.weights,
            metadata: self.metadata.as_ref(),
        }
    }

    /// Free the device buffers.
    pub fn release(self) {
        debug!(tensor = %self.name, bytes = self.device_bytes(), "Releasing tensor");
    }
}
