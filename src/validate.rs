//! End-to-end check of the device path against the CPU reference.
//!
//! A scenario produces synthetic values, quantizes them row by row, and then
//! dequantizes the same blocks twice: once with the CPU reference routines
//! and once on the device. The harness reports the worst relative error
//! between the two.

use std::fmt;

use tracing::info;

use crate::device::{dequantize, DeviceContext, DeviceTensor, DispatchConfig};
use crate::error::{DequantError, Result};
use crate::quant::{
    dequantize_row_q4_0, dequantize_row_q6_k, f32_to_bytes, quantize_row_q4_0, quantize_row_q6_k,
    GgmlType,
};
use crate::tensor::HostTensor;

/// Synthetic input: element `i` of the flattened tensor is `i / 100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Ramp1d { n: usize },
    Ramp2d { rows: usize, cols: usize },
}

impl Scenario {
    /// 1,048,576 elements in one row.
    pub const RANK1: Scenario = Scenario::Ramp1d { n: 1 << 20 };
    /// 1024 rows of 1024.
    pub const RANK2: Scenario = Scenario::Ramp2d {
        rows: 1024,
        cols: 1024,
    };

    /// Dimensions, innermost first.
    pub fn dims(&self) -> Vec<usize> {
        match *self {
            Self::Ramp1d { n } => vec![n],
            Self::Ramp2d { rows, cols } => vec![cols, rows],
        }
    }

    pub fn num_elements(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn values(&self) -> Vec<f32> {
        (0..self.num_elements()).map(|i| i as f32 / 100.0).collect()
    }

    fn row_len(&self) -> usize {
        self.dims()[0]
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ramp1d { n } => write!(f, "ramp[{n}]"),
            Self::Ramp2d { rows, cols } => write!(f, "ramp[{rows}x{cols}]"),
        }
    }
}

/// Worst element of a device/CPU comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationReport {
    pub max_rel_error: f32,
    /// Flat index of the worst element.
    pub index: usize,
    pub cpu: f32,
    pub device: f32,
    /// Elements compared (NaNs of the reference are skipped).
    pub compared: usize,
}

impl ValidationReport {
    pub fn passes(&self, tolerance: f32) -> bool {
        self.max_rel_error < tolerance
    }
}

/// Quantize `scenario` to `format` and return the tensor along with the CPU
/// dequantization of exactly those blocks.
pub fn build_tensor(scenario: Scenario, format: GgmlType) -> Result<(HostTensor, Vec<f32>)> {
    let values = scenario.values();
    let row_len = scenario.row_len();
    let name = format!("{scenario}.{format}");

    let (data, reference) = match format {
        GgmlType::Q4_0 => {
            let mut data = Vec::with_capacity(format.byte_size(values.len()).unwrap_or(0));
            for row in values.chunks(row_len) {
                data.extend(quantize_row_q4_0(row)?);
            }
            let mut reference = vec![0f32; values.len()];
            dequantize_row_q4_0(&data, &mut reference)?;
            (data, reference)
        }
        GgmlType::Q6_K => {
            let mut data = Vec::with_capacity(format.byte_size(values.len()).unwrap_or(0));
            for row in values.chunks(row_len) {
                data.extend(quantize_row_q6_k(row)?);
            }
            let mut reference = vec![0f32; values.len()];
            dequantize_row_q6_k(&data, &mut reference)?;
            (data, reference)
        }
        GgmlType::F32 => (f32_to_bytes(&values), values),
        ggml_type => return Err(DequantError::UnsupportedFormat { ggml_type }),
    };

    let tensor = HostTensor::new(name, format, scenario.dims(), data)?;
    Ok((tensor, reference))
}

/// Largest `|cpu - device| / |cpu|`, skipping NaNs of the reference.
///
/// Where the reference is exactly zero the device must be zero too; any other
/// value there is an infinite relative error.
pub fn max_relative_error(cpu: &[f32], device: &[f32]) -> ValidationReport {
    let mut report = ValidationReport {
        max_rel_error: 0.0,
        index: 0,
        cpu: cpu.first().copied().unwrap_or(0.0),
        device: device.first().copied().unwrap_or(0.0),
        compared: 0,
    };
    for (i, (&c, &d)) in cpu.iter().zip(device).enumerate() {
        if c.is_nan() {
            continue;
        }
        report.compared += 1;
        let err = if c == 0.0 {
            if d == 0.0 {
                0.0
            } else {
                f32::INFINITY
            }
        } else {
            (c - d).abs() / c.abs()
        };
        // A NaN on the device side is always the worst element.
        if err.is_nan() || err > report.max_rel_error {
            report = ValidationReport {
                max_rel_error: if err.is_nan() { f32::INFINITY } else { err },
                index: i,
                cpu: c,
                device: d,
                ..report
            };
        }
    }
    report
}

/// Run `scenario` through the device and compare against the CPU reference.
pub fn run_scenario(
    ctx: &DeviceContext,
    scenario: Scenario,
    format: GgmlType,
    config: &DispatchConfig,
) -> Result<ValidationReport> {
    let (host, reference) = build_tensor(scenario, format)?;
    let tensor = DeviceTensor::from_host(ctx, &host)?;
    drop(host);

    let device = dequantize(&tensor, reference.len(), config)?;
    tensor.release();

    let report = max_relative_error(&reference, &device);
    info!(
        %scenario,
        %format,
        adapter = %ctx.adapter().name,
        max_rel_error = report.max_rel_error,
        index = report.index,
        cpu = report.cpu,
        device = report.device,
        "Validation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorSource;

    #[test]
    fn test_scenario_shapes() {
        assert_eq!(Scenario::RANK1.dims(), vec![1 << 20]);
        assert_eq!(Scenario::RANK2.dims(), vec![1024, 1024]);
        let v = Scenario::Ramp2d { rows: 2, cols: 3 }.values();
        assert_eq!(v, vec![0.0, 0.01, 0.02, 0.03, 0.04, 0.05]);
    }

    #[test]
    fn test_relative_error_metric() {
        let report = max_relative_error(&[0.0, 2.0, -4.0, f32::NAN], &[0.0, 2.1, -4.0, 1.0]);
        assert_eq!(report.compared, 3);
        assert_eq!(report.index, 1);
        assert!((report.max_rel_error - 0.05).abs() < 1e-6);
        assert!(report.passes(0.1));
        assert!(!report.passes(0.01));

        let report = max_relative_error(&[1.0, 1.0], &[1.0, f32::NAN]);
        assert_eq!(report.index, 1);
        assert!(report.max_rel_error.is_infinite());
    }

    #[test]
    fn test_relative_error_garbage_at_zero_reference_fails() {
        let report = max_relative_error(&[0.0, 1.0], &[5.0, 1.0]);
        assert_eq!(report.compared, 2);
        assert_eq!(report.index, 0);
        assert_eq!(report.device, 5.0);
        assert!(report.max_rel_error.is_infinite());
        assert!(!report.passes(0.01));

        // Either sign of zero matches.
        let report = max_relative_error(&[0.0, 1.0], &[-0.0, 1.0]);
        assert_eq!(report.max_rel_error, 0.0);
        assert!(report.passes(0.01));
    }

    #[test]
    fn test_build_tensor_rejects_unsupported() {
        let err = build_tensor(Scenario::Ramp1d { n: 64 }, GgmlType::Q8_0).unwrap_err();
        assert!(matches!(err, DequantError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_q4_0_round_trip_within_half_step() {
        let scenario = Scenario::Ramp2d { rows: 4, cols: 128 };
        let (tensor, reference) = build_tensor(scenario, GgmlType::Q4_0).unwrap();
        assert_eq!(tensor.dims(), &[128, 4]);
        for (block, (x, y)) in scenario
            .values()
            .chunks(32)
            .zip(reference.chunks(32))
            .enumerate()
        {
            let amax = x.iter().fold(0f32, |m, v| m.max(v.abs()));
            let bound = amax / 16.0 * 1.01 + 1e-6;
            for (a, b) in x.iter().zip(y) {
                assert!((a - b).abs() <= bound, "block {block}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_host_scenarios_pass() {
        let ctx = DeviceContext::host().unwrap();
        let config = DispatchConfig::for_context(&ctx);
        for (scenario, format) in [
            (Scenario::Ramp1d { n: 8192 }, GgmlType::Q4_0),
            (Scenario::Ramp2d { rows: 32, cols: 256 }, GgmlType::Q4_0),
            (Scenario::Ramp2d { rows: 8, cols: 512 }, GgmlType::Q6_K),
            (Scenario::Ramp2d { rows: 5, cols: 7 }, GgmlType::F32),
        ] {
            let report = run_scenario(&ctx, scenario, format, &config).unwrap();
            assert!(report.passes(1e-2), "{scenario} {format}: {report:?}");
        }
    }
}
