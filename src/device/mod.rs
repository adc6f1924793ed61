//! Device offload of tensor dequantization.
//!
//! ```text
//! HostTensor --TensorLayout::repack--> weights plane + metadata plane
//!            --DeviceTensor::from_host--> device buffers
//!            --dequantize--> kernel (row groups x lanes) --> f16 --> Vec<f32>
//! ```
//!
//! The same pipeline runs on a wgpu adapter through cubecl, or on the host
//! thread pool when no GPU is present.

pub mod context;
pub mod dispatch;
pub(crate) mod host;
pub mod kernel;
pub mod tensor;


pub use context::{AdapterSummary, DeviceContext, DeviceOptions};
pub use dispatch::{dequantize, dequantize_into, DispatchConfig, WorkShape};
pub use kernel::KernelKind;
pub use tensor::{padded_stride, DeviceTensor, TensorLayout, STRIDE_ALIGN};
