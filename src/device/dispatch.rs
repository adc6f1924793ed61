//! Dispatch driver: work decomposition, launch and readback.

use half::f16;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::context::{AdapterSummary, DeviceContext};
use super::kernel::KernelKind;
use super::tensor::DeviceTensor;
use crate::error::{DequantError, Result};

/// Tuning knobs of the two-level decomposition.
///
/// Workgroups ("warps") of `warp_size` lanes walk rows; the number of row
/// groups is `num_cores * min(ne0 / num_cores, max_warps_per_core)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub warp_size: u32,
    pub num_cores: u32,
    pub max_warps_per_core: u32,
    /// Upper bound on row groups, from the adapter's per-dimension limit.
    pub max_row_groups: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            warp_size: 16,
            num_cores: 4,
            max_warps_per_core: 8,
            max_row_groups: 65_535,
        }
    }
}

impl DispatchConfig {
    /// Defaults clamped to what the context's adapter accepts.
    pub fn for_context(ctx: &DeviceContext) -> Self {
        Self::for_adapter(ctx.adapter())
    }

    pub fn for_adapter(adapter: &AdapterSummary) -> Self {
        Self::default().clamp_to(adapter)
    }

    /// Clamp a (possibly user supplied) config to the adapter's limits.
    pub fn clamp_to(self, adapter: &AdapterSummary) -> Self {
        Self {
            warp_size: self.warp_size.clamp(1, adapter.max_workgroup_size_x.max(1)),
            num_cores: self.num_cores.max(1),
            max_warps_per_core: self.max_warps_per_core.max(1),
            max_row_groups: self
                .max_row_groups
                .clamp(1, adapter.max_workgroups_per_dimension.max(1)),
        }
    }

    /// Global and local work shape for a tensor with rows of `ne0` elements.
    pub fn work_shape(&self, ne0: usize) -> WorkShape {
        let warp = self.warp_size.max(1);
        let cores = self.num_cores.max(1);
        let per_core = (ne0 / cores as usize).min(self.max_warps_per_core as usize) as u32;
        let row_groups = cores
            .saturating_mul(per_core)
            .clamp(1, self.max_row_groups.max(1));
        WorkShape {
            global: [warp, row_groups],
            local: [warp, 1],
        }
    }
}

/// Work-item counts per dimension (`global`) and per workgroup (`local`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkShape {
    pub global: [u32; 2],
    pub local: [u32; 2],
}

impl WorkShape {
    /// Workgroups per dimension.
    pub fn groups(&self) -> [u32; 2] {
        [
            self.global[0] / self.local[0],
            self.global[1] / self.local[1],
        ]
    }
}

/// The info buffer every kernel reads: `[ne0, rows, weight_stride, metadata_stride]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KernelInfo {
    pub ne0: u32,
    pub rows: u32,
    pub weight_stride: u32,
    pub metadata_stride: u32,
}

impl KernelInfo {
    pub fn to_bytes(self) -> Vec<u8> {
        [self.ne0, self.rows, self.weight_stride, self.metadata_stride]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }
}

/// Dequantize the first `k` values of `tensor`.
///
/// The kernel always reconstructs the whole tensor; `k` may be anything up to
/// its element count.
pub fn dequantize(tensor: &DeviceTensor<'_>, k: usize, config: &DispatchConfig) -> Result<Vec<f32>> {
    check_count(tensor, k)?;
    let mut out = vec![0f32; k];
    dequantize_into(tensor, &mut out, config)?;
    Ok(out)
}

/// Dequantize the first `out.len()` values of `tensor` into `out`.
pub fn dequantize_into(tensor: &DeviceTensor<'_>, out: &mut [f32], config: &DispatchConfig) -> Result<()> {
    let k = out.len();
    check_count(tensor, k)?;

    let ggml_type = tensor.ggml_type();
    let kind = KernelKind::for_type(ggml_type).ok_or(DequantError::UnsupportedFormat { ggml_type })?;
    let ctx = tensor.context();
    let config = config.clamp_to(ctx.adapter());
    let kernel = ctx.kernel(kind)?.with_warp_size(config.warp_size);
    let layout = tensor.layout();
    let shape = config.work_shape(layout.ne[0]);

    let mut output = ctx.alloc(layout.output_bytes())?;
    debug!(
        tensor = tensor.name(),
        kernel = kind.name(),
        global = ?shape.global,
        local = ?shape.local,
        k,
        "Dispatching"
    );
    ctx.run(kernel, tensor.planes(), &mut output, layout.kernel_info(), shape)?;
    ctx.read_with(&output, kind, |bytes| widen_f16(&bytes[..k * 2], out))
}

fn check_count(tensor: &DeviceTensor<'_>, k: usize) -> Result<()> {
    if k > tensor.num_elements() {
        return Err(DequantError::invalid_tensor(
            tensor.name(),
            format!("requested {k} values from a tensor of {}", tensor.num_elements()),
        ));
    }
    Ok(())
}

fn widen_f16(bytes: &[u8], out: &mut [f32]) {
    for (dst, src) in out.iter_mut().zip(bytes.chunks_exact(2)) {
        *dst = f16::from_le_bytes([src[0], src[1]]).to_f32();
    }
}
