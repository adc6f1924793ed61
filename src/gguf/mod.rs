//! GGUF model files as a tensor source.
//!
//! [`GgufReader`] indexes a file; [`upload_all`] transcodes every tensor it
//! lists onto a device context.

pub mod reader;

#[cfg(test)]
mod tests;

use std::io::{Read, Seek};

use tracing::{debug, warn};

use crate::device::{DeviceContext, DeviceTensor};
use crate::error::{DequantError, Result};

pub use reader::{GgufReader, GgufTensorInfo, GgufValueType};

/// Result of uploading one tensor of a file.
#[derive(Debug)]
pub struct UploadOutcome<'ctx> {
    pub name: String,
    /// Byte offset of the tensor within the data section.
    pub offset: u64,
    pub tensor: Result<DeviceTensor<'ctx>>,
}

/// Read every tensor of `reader`, in file order, and upload it to `ctx`.
///
/// Errors reading the file abort the walk. Errors for an individual tensor
/// (unsupported type, unsupported rank, allocation failure) are recorded in
/// its outcome and the walk continues. Tensors of an unsupported type are
/// not read at all.
pub fn upload_all<'ctx, R: Read + Seek>(
    ctx: &'ctx DeviceContext,
    reader: &mut GgufReader<R>,
) -> Result<Vec<UploadOutcome<'ctx>>> {
    let names: Vec<String> = reader.tensor_names().map(str::to_string).collect();
    let mut outcomes = Vec::with_capacity(names.len());

    for name in names {
        let (ggml_type, offset) = reader
            .tensor_info(&name)
            .map(|info| (info.ggml_type(), info.offset()))
            .ok_or_else(|| DequantError::format(format!("tensor `{name}` vanished from the index")))?;
        let tensor = if ggml_type.packing().is_none() {
            Err(DequantError::UnsupportedFormat { ggml_type })
        } else {
            let host = reader.read_tensor(&name)?;
            DeviceTensor::from_host(ctx, &host)
        };
        match &tensor {
            Ok(t) => debug!(tensor = %name, bytes = t.device_bytes(), "Tensor resident"),
            Err(e) => warn!(tensor = %name, error = %e, "Tensor not uploaded"),
        }
        outcomes.push(UploadOutcome {
            name,
            offset,
            tensor,
        });
    }
    Ok(outcomes)
}
