//! Error type shared by the transcoder, the dispatch driver and the GGUF reader.

use thiserror::Error;

use crate::quant::GgmlType;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DequantError>;

/// Everything that can go wrong between a host tensor and its dequantized values.
///
/// None of these abort the process; the caller decides whether to retry,
/// fall back to the host backend, or give up.
#[derive(Debug, Error)]
pub enum DequantError {
    /// No qualifying compute adapter, or the runtime refused to create a client for it.
    #[error("no compute device available: {reason}")]
    DeviceUnavailable { reason: String },

    /// A kernel failed to build. `log` carries the runtime's diagnostic text.
    #[error("kernel `{kernel}` failed to compile:\n{log}")]
    CompilationFailed { kernel: &'static str, log: String },

    /// The tensor element type has no transcoding / dequantization rule.
    #[error("unsupported tensor format {ggml_type}")]
    UnsupportedFormat { ggml_type: GgmlType },

    /// A device (or host staging) buffer could not be allocated.
    #[error("failed to allocate {bytes} bytes: {reason}")]
    AllocationFailed { bytes: usize, reason: String },

    /// Kernel launch or readback failed.
    #[error("dispatch of `{kernel}` failed: {reason}")]
    DispatchFailed { kernel: &'static str, reason: String },

    /// The tensor's rank, shape or data length does not fit the request.
    #[error("invalid tensor `{name}`: {reason}")]
    InvalidTensor { name: String, reason: String },

    /// Malformed GGUF input.
    #[error("GGUF format error: {reason}")]
    Format { reason: String },

    /// Runtime configuration could not be read or parsed.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DequantError {
    pub(crate) fn invalid_tensor(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTensor {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn format(reason: impl Into<String>) -> Self {
        Self::Format {
            reason: reason.into(),
        }
    }
}
