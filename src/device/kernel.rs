//! Kernel registry: which compute shader dequantizes which format.
//!
//! The WGSL sources live next to this file and are launched through Burn's
//! custom kernel API, with the workgroup width substituted at build time.

use burn::backend::wgpu::{KernelSource, SourceTemplate};
use cubecl::prelude::KernelId;

use crate::quant::GgmlType;

/// Every kernel the device context builds at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    /// `Q4_0` blocks, scale plane of f16.
    DequantizeQ4_0,
    /// `Q6_K` super-blocks, scale plane of i8 sub-scales + f16.
    DequantizeQ6K,
    /// F32 tensors narrowed to f16 during transcoding.
    ConvertF16,
}

impl KernelKind {
    pub const ALL: [KernelKind; 3] = [Self::DequantizeQ4_0, Self::DequantizeQ6K, Self::ConvertF16];

    /// The kernel that reconstructs values of the given type.
    pub fn for_type(ggml_type: GgmlType) -> Option<Self> {
        match ggml_type {
            GgmlType::Q4_0 => Some(Self::DequantizeQ4_0),
            GgmlType::Q6_K => Some(Self::DequantizeQ6K),
            GgmlType::F32 => Some(Self::ConvertF16),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::DequantizeQ4_0 => "dequantize_tensor_q4_0",
            Self::DequantizeQ6K => "dequantize_tensor_q6_k",
            Self::ConvertF16 => "convert_tensor_f16",
        }
    }

    /// Whether the kernel binds a metadata plane.
    pub fn uses_metadata(self) -> bool {
        !matches!(self, Self::ConvertF16)
    }

    /// A type that exercises this kernel during the start-up build.
    pub(crate) fn probe_type(self) -> GgmlType {
        match self {
            Self::DequantizeQ4_0 => GgmlType::Q4_0,
            Self::DequantizeQ6K => GgmlType::Q6_K,
            Self::ConvertF16 => GgmlType::F32,
        }
    }

    fn wgsl(self) -> &'static str {
        match self {
            Self::DequantizeQ4_0 => include_str!("shaders/dequantize_q4_0.wgsl"),
            Self::DequantizeQ6K => include_str!("shaders/dequantize_q6_k.wgsl"),
            Self::ConvertF16 => include_str!("shaders/convert_f16.wgsl"),
        }
    }
}

/// WGSL source for one kernel at a given workgroup width.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DequantKernel {
    pub kind: KernelKind,
    pub warp_size: u32,
}

impl DequantKernel {
    pub fn new(kind: KernelKind, warp_size: u32) -> Self {
        Self { kind, warp_size }
    }
}

impl KernelSource for DequantKernel {
    fn source(&self) -> SourceTemplate {
        SourceTemplate::new(self.kind.wgsl())
            .register("workgroup_size_x", self.warp_size.to_string())
            .register("workgroup_size_y", "1".to_string())
    }

    fn id(&self) -> KernelId {
        KernelId::new::<Self>().info(((self.kind as u32) << 16) | self.warp_size)
    }
}

/// A cache entry: how to run one kernel on the context's backend.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CompiledKernel {
    /// Shader built and validated on the wgpu device.
    Wgsl(DequantKernel),
    /// Rayon emulation of the same decomposition.
    Host(KernelKind),
}

impl CompiledKernel {
    pub fn kind(&self) -> KernelKind {
        match self {
            Self::Wgsl(kernel) => kernel.kind,
            Self::Host(kind) => *kind,
        }
    }

    /// The same kernel built for another workgroup width. Host kernels ignore it.
    pub fn with_warp_size(self, warp_size: u32) -> Self {
        match self {
            Self::Wgsl(kernel) if kernel.warp_size != warp_size => {
                Self::Wgsl(DequantKernel::new(kernel.kind, warp_size))
            }
            other => other,
        }
    }
}
