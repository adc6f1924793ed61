//! Host-side tensor handle consumed by the layout transcoder.

use crate::error::{DequantError, Result};
use crate::quant::GgmlType;

/// Read-only view of a host tensor: type tag, dimensions (innermost first, as
/// in GGML's `ne`), row-major block data, and a display name.
pub trait TensorSource {
    fn name(&self) -> &str;
    fn ggml_type(&self) -> GgmlType;
    fn dims(&self) -> &[usize];
    fn data(&self) -> &[u8];

    fn num_elements(&self) -> usize {
        self.dims().iter().product()
    }
}

/// An owned host tensor.
#[derive(Debug, Clone)]
pub struct HostTensor {
    name: String,
    ggml_type: GgmlType,
    dims: Vec<usize>,
    data: Vec<u8>,
}

impl HostTensor {
    /// Wrap raw GGML block data.
    ///
    /// `dims` lists the element count per dimension, innermost first. The data
    /// length must match the type's byte size for that many elements. A type
    /// with no known block size is `UnsupportedFormat`.
    pub fn new(
        name: impl Into<String>,
        ggml_type: GgmlType,
        dims: Vec<usize>,
        data: Vec<u8>,
    ) -> Result<Self> {
        let name = name.into();
        let block_elems = ggml_type
            .block_elems()
            .ok_or(DequantError::UnsupportedFormat { ggml_type })?;
        let ne0 = dims.first().copied().unwrap_or(0);
        if !ne0.is_multiple_of(block_elems) {
            return Err(DequantError::invalid_tensor(
                &name,
                format!("row length {ne0} is not a multiple of the {ggml_type} block size {block_elems}"),
            ));
        }
        let expected = dims
            .iter()
            .try_fold(1usize, |n, &d| n.checked_mul(d))
            .and_then(|n| ggml_type.byte_size(n))
            .ok_or_else(|| DequantError::invalid_tensor(&name, format!("{dims:?} overflows the address space")))?;
        if data.len() != expected {
            return Err(DequantError::invalid_tensor(
                &name,
                format!("expected {expected} bytes of {ggml_type} data, got {}", data.len()),
            ));
        }
        Ok(Self {
            name,
            ggml_type,
            dims,
            data,
        })
    }
}

impl TensorSource for HostTensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn ggml_type(&self) -> GgmlType {
        self.ggml_type
    }

    fn dims(&self) -> &[usize] {
        &self.dims
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}
