//! # GPU Dequant
//!
//! Dequantizes GGML block-quantized tensors (`Q4_0`, `Q6_K`, plus an `F32`
//! pass-through) on a GPU through wgpu compute shaders, producing half
//! precision values widened to `f32`.
//!
//! ## Pipeline
//!
//! ```text
//! GGUF / HostTensor -> TensorLayout (64-byte strided weights + metadata planes)
//!   -> DeviceTensor (uploaded) -> kernel (row groups x lanes) -> Vec<f32>
//! ```
//!
//! ```no_run
//! use gpu_dequant::{dequantize, DeviceContext, DeviceTensor, DispatchConfig, GgmlType, HostTensor};
//!
//! # fn main() -> gpu_dequant::Result<()> {
//! let ctx = DeviceContext::init()?;
//! let values: Vec<f32> = (0..4096).map(|i| i as f32 / 100.0).collect();
//! let blocks = gpu_dequant::quant::quantize_row_q4_0(&values)?;
//! let host = HostTensor::new("w", GgmlType::Q4_0, vec![4096], blocks)?;
//! let tensor = DeviceTensor::from_host(&ctx, &host)?;
//! let out = dequantize(&tensor, 4096, &DispatchConfig::for_context(&ctx))?;
//! assert_eq!(out.len(), 4096);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod gguf;
pub mod quant;
pub mod tensor;
pub mod validate;

pub use config::RuntimeConfig;
pub use device::{
    dequantize, dequantize_into, DeviceContext, DeviceOptions, DeviceTensor, DispatchConfig,
    KernelKind, TensorLayout,
};
pub use error::{DequantError, Result};
pub use quant::GgmlType;
pub use tensor::{HostTensor, TensorSource};
pub use validate::{run_scenario, Scenario, ValidationReport};
