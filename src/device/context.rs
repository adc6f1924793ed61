//! Process-wide compute context: one adapter, one compute client (in-order
//! queue), and the kernels built for it.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use burn::backend::wgpu::graphics::{Dx12, Metal, OpenGl, Vulkan, WebGpu};
use burn::backend::wgpu::{
    init_setup, AutoCompiler, CubeDim, RuntimeOptions, SourceKernel, WgpuDevice, WgpuRuntime,
};
use cubecl::client::ComputeClient;
use cubecl::server::{Bindings, CubeCount, Handle};
use cubecl::{CubeTask, Runtime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::dispatch::{DispatchConfig, KernelInfo, WorkShape};
use super::host;
use super::kernel::{CompiledKernel, DequantKernel, KernelKind};
use super::tensor::TensorLayout;
use crate::error::{DequantError, Result};
use crate::tensor::HostTensor;

/// Adapter selection knobs. The defaults pick the first hardware GPU.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// Fall back to a CPU-type wgpu adapter (llvmpipe, lavapipe, SwiftShader)
    /// when no hardware GPU matches.
    pub allow_software_adapter: bool,
    /// Only consider adapters whose name contains this (case-insensitive).
    pub adapter_name: Option<String>,
}

/// What the context knows about its device.
#[derive(Debug, Clone)]
pub struct AdapterSummary {
    pub name: String,
    pub device_type: String,
    pub backend: String,
    /// `shader-f16` support. Informational: the kernels convert through packed
    /// 32-bit words and do not need it.
    pub shader_f16: bool,
    pub max_workgroup_size_x: u32,
    pub max_workgroups_per_dimension: u32,
    /// Largest buffer that can be bound as storage.
    pub max_buffer_bytes: u64,
}

impl AdapterSummary {
    fn from_wgpu(adapter: &wgpu::Adapter) -> Self {
        let info = adapter.get_info();
        let limits = adapter.limits();
        Self {
            name: info.name,
            device_type: format!("{:?}", info.device_type),
            backend: format!("{:?}", info.backend),
            shader_f16: adapter.features().contains(wgpu::Features::SHADER_F16),
            max_workgroup_size_x: limits.max_compute_workgroup_size_x,
            max_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
            max_buffer_bytes: limits
                .max_buffer_size
                .min(u64::from(limits.max_storage_buffer_binding_size)),
        }
    }

    fn host(threads: usize) -> Self {
        Self {
            name: format!("host ({threads} threads)"),
            device_type: "Cpu".to_string(),
            backend: "rayon".to_string(),
            shader_f16: false,
            max_workgroup_size_x: 1024,
            max_workgroups_per_dimension: 65_535,
            max_buffer_bytes: isize::MAX as u64,
        }
    }
}

enum Backend {
    Wgpu {
        device: WgpuDevice,
        client: ComputeClient<WgpuRuntime>,
    },
    Host {
        pool: rayon::ThreadPool,
    },
}

enum Storage {
    Wgpu(Handle),
    Host(Vec<u8>),
}

/// A buffer owned by a [`DeviceContext`]. Dropping it frees the device memory.
pub(crate) struct DeviceBuffer {
    bytes: usize,
    storage: Storage,
}

impl DeviceBuffer {
    pub fn len(&self) -> usize {
        self.bytes
    }
}

/// The buffers one kernel launch reads.
pub(crate) struct Planes<'a> {
    pub weights: &'a DeviceBuffer,
    pub metadata: Option<&'a DeviceBuffer>,
}

/// Owns the compute device, its queue and the kernel cache.
///
/// Every operation is fenced before returning, so the context behaves as a
/// synchronous device from the caller's side. It is not meant to be driven
/// from several host threads at once.
pub struct DeviceContext {
    backend: Backend,
    adapter: AdapterSummary,
    kernels: HashMap<KernelKind, CompiledKernel>,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("adapter", &self.adapter)
            .field("kernels", &self.kernels.len())
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    /// Open the first GPU-class adapter and build every kernel.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` when no GPU adapter exists, `CompilationFailed`
    /// when a kernel does not build on it.
    pub fn init() -> Result<Self> {
        Self::with_options(&DeviceOptions::default())
    }

    /// Like [`init`](Self::init) with explicit adapter selection options.
    pub fn with_options(options: &DeviceOptions) -> Result<Self> {
        let (device, backend, adapter) = select_adapter(options)?;
        info!(
            adapter = %adapter.name,
            device_type = %adapter.device_type,
            backend = %adapter.backend,
            "Selected compute adapter"
        );
        if adapter.shader_f16 {
            info!("shader-f16 extension available");
        } else {
            debug!("shader-f16 extension not available");
        }

        register_device(&device, backend)?;
        let client = guarded(|| WgpuRuntime::client(&device))
            .map_err(|reason| DequantError::DeviceUnavailable { reason })?;

        let mut ctx = Self {
            backend: Backend::Wgpu { device, client },
            adapter,
            kernels: HashMap::new(),
        };
        ctx.build_kernels()?;
        Ok(ctx)
    }

    /// A CPU "device": the same kernels, run as rayon work items.
    pub fn host() -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("dequant-host-{i}"))
            .build()
            .map_err(|e| DequantError::DeviceUnavailable {
                reason: format!("failed to start host thread pool: {e}"),
            })?;
        let adapter = AdapterSummary::host(pool.current_num_threads());
        info!(adapter = %adapter.name, "Using host compute backend");

        let mut ctx = Self {
            backend: Backend::Host { pool },
            adapter,
            kernels: HashMap::new(),
        };
        ctx.build_kernels()?;
        Ok(ctx)
    }

    pub fn adapter(&self) -> &AdapterSummary {
        &self.adapter
    }

    pub fn is_host(&self) -> bool {
        matches!(self.backend, Backend::Host { .. })
    }

    /// The wgpu device backing this context, if any.
    pub fn wgpu_device(&self) -> Option<&WgpuDevice> {
        match &self.backend {
            Backend::Wgpu { device, .. } => Some(device),
            Backend::Host { .. } => None,
        }
    }

    /// Build every kernel by running it once on a single zero block, so a
    /// broken shader surfaces here instead of on the first real tensor.
    fn build_kernels(&mut self) -> Result<()> {
        let config = DispatchConfig::for_adapter(&self.adapter);
        for kind in KernelKind::ALL {
            let kernel = match self.backend {
                Backend::Wgpu { .. } => CompiledKernel::Wgsl(DequantKernel::new(kind, config.warp_size)),
                Backend::Host { .. } => CompiledKernel::Host(kind),
            };
            self.probe(kernel, &config)?;
            debug!(kernel = kind.name(), "Kernel built");
            self.kernels.insert(kind, kernel);
        }
        Ok(())
    }

    /// Only a failed launch is a build failure; upload and readback errors
    /// pass through unchanged.
    fn probe(&self, kernel: CompiledKernel, config: &DispatchConfig) -> Result<()> {
        let ggml_type = kernel.kind().probe_type();
        let packing = ggml_type
            .packing()
            .ok_or(DequantError::UnsupportedFormat { ggml_type })?;
        let ne0 = packing.block_elems().max(2);
        let probe = HostTensor::new(
            kernel.kind().name(),
            ggml_type,
            vec![ne0],
            vec![0u8; packing.host_row_bytes(ne0)],
        )?;
        let layout = TensorLayout::for_tensor(&probe)?;
        let (weights, metadata) = layout.repack(&probe)?;
        let weights = self.upload(weights)?;
        let metadata = metadata.map(|m| self.upload(m)).transpose()?;
        let mut output = self.alloc(layout.output_bytes())?;
        self.run(
            kernel,
            Planes {
                weights: &weights,
                metadata: metadata.as_ref(),
            },
            &mut output,
            layout.kernel_info(),
            config.work_shape(ne0),
        )
        .map_err(|e| DequantError::CompilationFailed {
            kernel: kernel.kind().name(),
            log: e.to_string(),
        })?;
        self.read_with(&output, kernel.kind(), |_| ())
    }

    pub(crate) fn kernel(&self, kind: KernelKind) -> Result<CompiledKernel> {
        self.kernels
            .get(&kind)
            .copied()
            .ok_or(DequantError::DispatchFailed {
                kernel: kind.name(),
                reason: "kernel was not built for this context".to_string(),
            })
    }

    pub(crate) fn check_size(&self, bytes: usize) -> Result<()> {
        if bytes as u64 > self.adapter.max_buffer_bytes {
            return Err(DequantError::AllocationFailed {
                bytes,
                reason: format!(
                    "exceeds the adapter's {} byte buffer limit",
                    self.adapter.max_buffer_bytes
                ),
            });
        }
        Ok(())
    }

    /// Copy a staging buffer to the device, consuming it.
    pub(crate) fn upload(&self, mut staging: Vec<u8>) -> Result<DeviceBuffer> {
        // Storage buffers are addressed as array<u32>.
        if !staging.len().is_multiple_of(4) {
            staging.resize(staging.len().next_multiple_of(4), 0);
        }
        let bytes = staging.len();
        self.check_size(bytes)?;
        let storage = match &self.backend {
            Backend::Wgpu { client, .. } => {
                let handle = guarded(|| client.create_from_slice(&staging)).map_err(|reason| {
                    DequantError::AllocationFailed { bytes, reason }
                })?;
                Storage::Wgpu(handle)
            }
            Backend::Host { .. } => Storage::Host(staging),
        };
        Ok(DeviceBuffer { bytes, storage })
    }

    /// Allocate an uninitialised device buffer of at least `bytes` bytes.
    pub(crate) fn alloc(&self, bytes: usize) -> Result<DeviceBuffer> {
        let bytes = bytes.next_multiple_of(4);
        self.check_size(bytes)?;
        let storage = match &self.backend {
            Backend::Wgpu { client, .. } => {
                let handle = guarded(|| client.empty(bytes))
                    .map_err(|reason| DequantError::AllocationFailed { bytes, reason })?;
                Storage::Wgpu(handle)
            }
            Backend::Host { .. } => Storage::Host(host::zeroed(bytes)?),
        };
        Ok(DeviceBuffer { bytes, storage })
    }

    /// Launch one kernel over `planes`, writing `output`.
    pub(crate) fn run(
        &self,
        kernel: CompiledKernel,
        planes: Planes<'_>,
        output: &mut DeviceBuffer,
        info: KernelInfo,
        shape: WorkShape,
    ) -> Result<()> {
        let kind = kernel.kind();
        let dispatch_err = |reason: String| DequantError::DispatchFailed {
            kernel: kind.name(),
            reason,
        };
        if kind.uses_metadata() && planes.metadata.is_none() {
            return Err(dispatch_err("kernel needs a metadata plane".to_string()));
        }

        match (&self.backend, kernel) {
            (Backend::Wgpu { client, .. }, CompiledKernel::Wgsl(source)) => {
                let (Storage::Wgpu(weights), Storage::Wgpu(out)) =
                    (&planes.weights.storage, &output.storage)
                else {
                    return Err(dispatch_err("buffer belongs to another backend".to_string()));
                };

                let mut bindings = Bindings::new().with_buffer(weights.clone().binding());
                if kind.uses_metadata() {
                    if let Some(DeviceBuffer {
                        storage: Storage::Wgpu(metadata),
                        ..
                    }) = planes.metadata
                    {
                        bindings = bindings.with_buffer(metadata.clone().binding());
                    }
                }

                let groups = shape.groups();
                guarded(|| {
                    let info_handle = client.create_from_slice(&info.to_bytes());
                    let bindings = bindings
                        .with_buffer(out.clone().binding())
                        .with_buffer(info_handle.binding());
                    let task = SourceKernel::new(source, CubeDim::new_2d(shape.local[0], shape.local[1]));
                    client
                        .launch(
                            Box::new(task) as Box<dyn CubeTask<AutoCompiler>>,
                            CubeCount::new_2d(groups[0], groups[1]),
                            bindings,
                        )
                        .map_err(|e| format!("{e:?}"))
                })
                .and_then(|launched| launched)
                .map_err(dispatch_err)
            }
            (Backend::Host { pool }, CompiledKernel::Host(kind)) => {
                let Storage::Host(weights) = &planes.weights.storage else {
                    return Err(dispatch_err("buffer belongs to another backend".to_string()));
                };
                let metadata = match planes.metadata.map(|m| &m.storage) {
                    Some(Storage::Host(bytes)) => bytes.as_slice(),
                    Some(Storage::Wgpu(_)) => {
                        return Err(dispatch_err("buffer belongs to another backend".to_string()))
                    }
                    None => &[],
                };
                let Storage::Host(out) = &mut output.storage else {
                    return Err(dispatch_err("buffer belongs to another backend".to_string()));
                };
                pool.install(|| host::execute(kind, weights, metadata, out, info));
                Ok(())
            }
            _ => Err(dispatch_err("kernel was built for another backend".to_string())),
        }
    }

    /// Block until `buffer` is readable and hand its bytes to `f`.
    pub(crate) fn read_with<R>(
        &self,
        buffer: &DeviceBuffer,
        kind: KernelKind,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        match (&self.backend, &buffer.storage) {
            (Backend::Wgpu { client, .. }, Storage::Wgpu(handle)) => {
                let bytes = guarded(|| client.read_one(handle.clone())).map_err(|reason| {
                    DequantError::DispatchFailed {
                        kernel: kind.name(),
                        reason,
                    }
                })?;
                let raw: &[u8] = &bytes;
                Ok(f(raw))
            }
            (Backend::Host { .. }, Storage::Host(bytes)) => Ok(f(bytes)),
            _ => Err(DequantError::DispatchFailed {
                kernel: kind.name(),
                reason: "buffer belongs to another backend".to_string(),
            }),
        }
    }
}

/// First GPU-class adapter in enumeration order, or the first CPU adapter when
/// software adapters are allowed and no GPU matches.
fn select_adapter(options: &DeviceOptions) -> Result<(WgpuDevice, wgpu::Backend, AdapterSummary)> {
    let instance = wgpu::Instance::default();
    let adapters = instance.enumerate_adapters(wgpu::Backends::all());

    let mut seen: Vec<(wgpu::Backend, wgpu::DeviceType)> = Vec::new();
    let mut considered = Vec::new();
    let mut software = None;
    for adapter in adapters {
        let info = adapter.get_info();
        // WgpuDevice indices count adapters of one type on one backend.
        let index = seen
            .iter()
            .filter(|(backend, ty)| *backend == info.backend && *ty == info.device_type)
            .count();
        seen.push((info.backend, info.device_type));
        considered.push(format!("{} ({:?}, {:?})", info.name, info.device_type, info.backend));

        if let Some(filter) = &options.adapter_name {
            if !info.name.to_lowercase().contains(&filter.to_lowercase()) {
                continue;
            }
        }
        let device = match info.device_type {
            wgpu::DeviceType::DiscreteGpu => WgpuDevice::DiscreteGpu(index),
            wgpu::DeviceType::IntegratedGpu => WgpuDevice::IntegratedGpu(index),
            wgpu::DeviceType::VirtualGpu => WgpuDevice::VirtualGpu(index),
            wgpu::DeviceType::Cpu if options.allow_software_adapter && software.is_none() => {
                software = Some((WgpuDevice::Cpu, info.backend, AdapterSummary::from_wgpu(&adapter)));
                continue;
            }
            _ => continue,
        };
        return Ok((device, info.backend, AdapterSummary::from_wgpu(&adapter)));
    }
    if let Some(selected) = software {
        return Ok(selected);
    }

    let reason = if considered.is_empty() {
        "no wgpu adapters found".to_string()
    } else {
        format!("no GPU-class adapter among: {}", considered.join(", "))
    };
    Err(DequantError::DeviceUnavailable { reason })
}

/// Devices already set up with cubecl in this process.
static REGISTERED: Mutex<Vec<WgpuDevice>> = Mutex::new(Vec::new());

/// Set up `device` with cubecl on the graphics API it was enumerated on.
///
/// Left alone, cubecl resolves a `WgpuDevice` against its default API only,
/// which can be a different adapter or none at all.
fn register_device(device: &WgpuDevice, backend: wgpu::Backend) -> Result<()> {
    let unavailable = |reason: String| DequantError::DeviceUnavailable { reason };
    let mut registered = REGISTERED
        .lock()
        .map_err(|_| unavailable("device registry lock poisoned".to_string()))?;
    if registered.contains(device) {
        return Ok(());
    }

    guarded(|| {
        let options = RuntimeOptions::default();
        match backend {
            wgpu::Backend::Vulkan => init_setup::<Vulkan>(device, options),
            wgpu::Backend::Metal => init_setup::<Metal>(device, options),
            wgpu::Backend::Dx12 => init_setup::<Dx12>(device, options),
            wgpu::Backend::Gl => init_setup::<OpenGl>(device, options),
            wgpu::Backend::BrowserWebGpu => init_setup::<WebGpu>(device, options),
            other => return Err(format!("no compute runtime for the {other:?} backend")),
        };
        Ok(())
    })
    .and_then(|setup| setup)
    .map_err(unavailable)?;

    debug!(?device, ?backend, "Registered device with the compute runtime");
    registered.push(device.clone());
    Ok(())
}

/// Run a runtime call, turning a panic inside the GPU stack into an error message.
fn guarded<T>(f: impl FnOnce() -> T) -> std::result::Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "GPU runtime panicked".to_string()
    }
}
