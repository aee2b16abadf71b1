//! GPU-accelerated kernels using WGPU.
//!
//! This module implements the GPU backend with WGPU + WGSL. It handles GPU
//! context initialization, shader validation and pipeline creation (once, via
//! `lazy_static`), and compute dispatch for:
//!
//! - batch-normalization forward (batch statistics or caller statistics)
//! - batch-normalization backward (training form)
//! - embedding scatter-add
//!
//! Buffers are uploaded per call and results are mapped back before a
//! function returns. A machine without a usable adapter simply reports
//! [`is_available`] as `false`; nothing here panics on missing hardware.

use std::sync::mpsc;

use briny::prelude::*;
use tracing::debug;
use wgpu::util::DeviceExt;

use super::{BatchNormBackward, BatchNormCache, BatchNormForward, Buckets, NormDescriptor};
use crate::backend::{ACCELERATED_MIN_EPS, Backend, OpKind, Probe};
use crate::tensors::{DType, Device};

const BN_STATS: &str = include_str!("shaders/bn_stats.wgsl");
const BN_NORMALIZE: &str = include_str!("shaders/bn_normalize.wgsl");
const BN_BACKWARD_REDUCE: &str = include_str!("shaders/bn_backward_reduce.wgsl");
const BN_BACKWARD_APPLY: &str = include_str!("shaders/bn_backward_apply.wgsl");
const EMBED_BACKWARD: &str = include_str!("shaders/embed_backward.wgsl");

const WORKGROUP_SIZE: u32 = 64;
const MAX_WORKGROUPS_PER_DIM: u32 = 65_535;

/// Basic wrapper for common GPU errors.
#[derive(Debug)]
pub enum GpuError {
    /// An error in requesting the adapter.
    Adapter(wgpu::RequestAdapterError),
    /// An error in requesting the GPU (device).
    Device(wgpu::RequestDeviceError),
    /// The device could not be polled to completion.
    Poll(wgpu::PollError),
    /// A result buffer could not be mapped.
    Map(wgpu::BufferAsyncError),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuError::Adapter(e) => write!(f, "Adapter error: {e}"),
            GpuError::Device(e) => write!(f, "Device error: {e}"),
            GpuError::Poll(e) => write!(f, "Poll error: {e}"),
            GpuError::Map(e) => write!(f, "Map error: {e}"),
        }
    }
}

/// Wrapper for a `GpuError` or `ValidationError` depending on how it fails.
#[derive(Debug)]
pub enum GpuFailureKind {
    /// An error resulting from the GPU.
    Gpu(GpuError),
    /// A shader failed source validation.
    Validation(ValidationError),
}

impl std::fmt::Display for GpuFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuFailureKind::Gpu(err) => write!(f, "GPU error: {err}"),
            GpuFailureKind::Validation(err) => write!(f, "Validation error: {err}"),
        }
    }
}

/// A failure of the GPU backend, either at initialisation or during a call.
#[derive(Debug)]
pub struct GpuFailure {
    /// The optional type of failure that occured.
    pub kind: Option<GpuFailureKind>,
    /// The optional message explaining the failure.
    pub message: Option<String>,
}

impl From<GpuError> for GpuFailure {
    fn from(kind: GpuError) -> Self {
        Self {
            kind: Some(GpuFailureKind::Gpu(kind)),
            message: None,
        }
    }
}

impl From<ValidationError> for GpuFailure {
    fn from(kind: ValidationError) -> Self {
        Self {
            kind: Some(GpuFailureKind::Validation(kind)),
            message: None,
        }
    }
}

impl From<wgpu::PollError> for GpuFailure {
    fn from(err: wgpu::PollError) -> Self {
        GpuError::Poll(err).into()
    }
}

impl From<&str> for GpuFailure {
    fn from(msg: &str) -> Self {
        Self {
            kind: None,
            message: Some(msg.to_string()),
        }
    }
}

impl From<String> for GpuFailure {
    fn from(msg: String) -> Self {
        Self {
            kind: None,
            message: Some(msg),
        }
    }
}

impl std::fmt::Display for GpuFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(kind) = &self.kind {
            write!(f, "GPU failure: {kind}")
        } else if let Some(msg) = &self.message {
            write!(f, "GPU failure: {msg}")
        } else {
            write!(f, "Unknown GPU failure")
        }
    }
}

impl std::error::Error for GpuFailure {}

/// Holds the WGPU device and queue used for executing compute pipelines.
///
/// Initialized once globally and reused for all operations via `lazy_static`.
pub struct GpuContext {
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// A queue for information related to the device.
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Initializes a new GPU context, selecting the default adapter and creating a device + queue.
    ///
    /// # Returns
    /// - `Ok(GpuContext)` if the GPU is successfully initialized
    /// - `Err(GpuError)` if adapter or device acquisition fails
    ///
    /// # Internals
    /// - Uses `pollster::block_on` to synchronously wait for async WGPU calls
    /// - Selects the default adapter with default options (typically the most performant)
    /// - Enables default limits and features for broad compatibility
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(GpuError::Adapter)?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_kernels"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(GpuError::Device)?;

        Ok(Self { device, queue })
    }
}

/// Secure wrapper for WGSL source code compiled into the crate.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;

        if src.len() > 65536 {
            return Err(ValidationError);
        }

        if !src.contains("fn main") {
            return Err(ValidationError);
        }

        if src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }

        let forbidden = ["asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }

        Ok(())
    }
}

/// Validates a WGSL shader and compiles it on `device`.
pub fn load_shader(
    device: &wgpu::Device,
    label: &str,
    source: &str,
) -> Result<wgpu::ShaderModule, GpuFailure> {
    WgslSource(source).validate()?;

    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

/// Binding kinds of a kernel, in binding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Uniform,
    Read,
    ReadWrite,
}

/// A compiled compute pipeline and the layout of its single bind group.
struct Kernel {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl Kernel {
    fn new(ctx: &GpuContext, label: &str, source: &str, slots: &[Slot]) -> Result<Self, GpuFailure> {
        let device = &ctx.device;
        let module = load_shader(device, label, source)?;
        let entries: Vec<wgpu::BindGroupLayoutEntry> = slots
            .iter()
            .enumerate()
            .map(|(binding, slot)| wgpu::BindGroupLayoutEntry {
                binding: binding as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match slot {
                        Slot::Uniform => wgpu::BufferBindingType::Uniform,
                        Slot::Read => wgpu::BufferBindingType::Storage { read_only: true },
                        Slot::ReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        Ok(Self { layout, pipeline })
    }
}

struct Kernels {
    bn_stats: Kernel,
    bn_normalize: Kernel,
    bn_backward_reduce: Kernel,
    bn_backward_apply: Kernel,
    embed_backward: Kernel,
}

impl Kernels {
    fn new(ctx: &GpuContext) -> Result<Self, GpuFailure> {
        use Slot::*;
        Ok(Self {
            bn_stats: Kernel::new(ctx, "bn_stats", BN_STATS, &[Uniform, Read, ReadWrite])?,
            bn_normalize: Kernel::new(
                ctx,
                "bn_normalize",
                BN_NORMALIZE,
                &[Uniform, Read, Read, ReadWrite, ReadWrite],
            )?,
            bn_backward_reduce: Kernel::new(
                ctx,
                "bn_backward_reduce",
                BN_BACKWARD_REDUCE,
                &[Uniform, Read, Read, ReadWrite],
            )?,
            bn_backward_apply: Kernel::new(
                ctx,
                "bn_backward_apply",
                BN_BACKWARD_APPLY,
                &[Uniform, Read, Read, Read, ReadWrite],
            )?,
            embed_backward: Kernel::new(
                ctx,
                "embed_backward",
                EMBED_BACKWARD,
                &[Uniform, Read, Read, Read, ReadWrite],
            )?,
        })
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: Option<GpuContext> = match GpuContext::new() {
        Ok(ctx) => Some(ctx),
        Err(err) => {
            debug!(%err, "no usable GPU adapter");
            None
        }
    };
    static ref KERNELS: Option<Kernels> = GPU_CONTEXT.as_ref().and_then(|ctx| {
        Kernels::new(ctx)
            .map_err(|err| debug!(%err, "GPU kernels failed to build"))
            .ok()
    });
}

/// Whether a GPU adapter was found and every kernel compiled.
pub fn is_available() -> bool {
    KERNELS.is_some()
}

fn runtime() -> Result<(&'static GpuContext, &'static Kernels), GpuFailure> {
    match (GPU_CONTEXT.as_ref(), KERNELS.as_ref()) {
        (Some(ctx), Some(kernels)) => Ok((ctx, kernels)),
        _ => Err("GPU backend is not available".into()),
    }
}

fn as_bytes<T: Copy>(data: &[T]) -> &[u8] {
    let len = std::mem::size_of_val(data);
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, len) }
}

fn bytes_to_f32_slice(data: &[u8]) -> Result<&[f32], &'static str> {
    use std::mem::{align_of, size_of};

    if data.as_ptr() as usize % align_of::<f32>() != 0 {
        return Err("unaligned buffer");
    }

    if data.len() % size_of::<f32>() != 0 {
        return Err("buffer length is not a multiple of f32");
    }

    let len = data.len() / size_of::<f32>();
    let ptr = data.as_ptr() as *const f32;
    unsafe { Ok(std::slice::from_raw_parts(ptr, len)) }
}

/// One bind group entry of a dispatch.
enum Arg<'a> {
    /// Four 32-bit words of parameters.
    Params([u32; 4]),
    /// Read-only storage.
    Read(&'a [u8]),
    /// Read-write storage initialised from host data and read back.
    InOut(&'a [f32]),
    /// Write-only result of this many `f32`s, read back.
    Out(usize),
}

fn params(d: NormDescriptor, scale: f32) -> Result<[u32; 4], GpuFailure> {
    let word = |v: usize| u32::try_from(v).map_err(|_| GpuFailure::from("dimension exceeds u32"));
    Ok([word(d.n)?, word(d.c)?, word(d.spatial)?, scale.to_bits()])
}

/// Workgroup grid covering `invocations`, folded into two dimensions when
/// one would exceed the per-dimension limit. Shaders recover the flat index
/// as `gid.x + gid.y * 65535 * 64`.
fn grid(invocations: usize) -> Result<(u32, u32), GpuFailure> {
    let groups = u32::try_from(invocations.div_ceil(WORKGROUP_SIZE as usize))
        .map_err(|_| GpuFailure::from("dispatch too large"))?;
    let x = groups.min(MAX_WORKGROUPS_PER_DIM).max(1);
    let y = groups.div_ceil(MAX_WORKGROUPS_PER_DIM).max(1);
    if y > MAX_WORKGROUPS_PER_DIM {
        return Err("dispatch too large".into());
    }
    Ok((x, y))
}

/// Uploads `args`, runs `kernel` over `invocations` threads and returns the
/// contents of every `InOut`/`Out` buffer, in argument order.
fn dispatch(kernel: &Kernel, label: &str, args: &[Arg<'_>], invocations: usize) -> Result<Vec<Vec<f32>>, GpuFailure> {
    let (ctx, _) = runtime()?;
    let device = &ctx.device;

    let mut buffers = Vec::with_capacity(args.len());
    let mut readback = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        let buffer = match arg {
            Arg::Params(words) => device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: as_bytes(words),
                usage: wgpu::BufferUsages::UNIFORM,
            }),
            Arg::Read(bytes) => {
                if bytes.is_empty() {
                    return Err(format!("{label}: empty input buffer").into());
                }
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents: bytes,
                    usage: wgpu::BufferUsages::STORAGE,
                })
            }
            Arg::InOut(data) => {
                if data.is_empty() {
                    return Err(format!("{label}: empty output buffer").into());
                }
                readback.push((i, std::mem::size_of_val(*data) as u64));
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents: as_bytes(data),
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                })
            }
            Arg::Out(len) => {
                if *len == 0 {
                    return Err(format!("{label}: empty output buffer").into());
                }
                let size = (*len * 4) as u64;
                readback.push((i, size));
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(label),
                    size,
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                })
            }
        };
        buffers.push(buffer);
    }

    let entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(i, buffer)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout: &kernel.layout,
        entries: &entries,
    });

    let (gx, gy) = grid(invocations)?;
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some(label),
    });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernel.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(gx, gy, 1);
    }

    let staging: Vec<wgpu::Buffer> = readback
        .iter()
        .map(|&(i, size)| {
            let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("staging"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            encoder.copy_buffer_to_buffer(&buffers[i], 0, &buffer, 0, size);
            buffer
        })
        .collect();

    ctx.queue.submit(Some(encoder.finish()));

    let receivers: Vec<_> = staging
        .iter()
        .map(|buffer| {
            let (tx, rx) = mpsc::channel();
            buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
            rx
        })
        .collect();
    device.poll(wgpu::PollType::Wait)?;

    let mut out = Vec::with_capacity(staging.len());
    for (buffer, rx) in staging.iter().zip(receivers) {
        rx.recv()
            .map_err(|_| GpuFailure::from("map callback was dropped"))?
            .map_err(GpuError::Map)?;
        let view = buffer.slice(..).get_mapped_range();
        out.push(bytes_to_f32_slice(&view)?.to_vec());
        drop(view);
        buffer.unmap();
    }
    Ok(out)
}

fn take(outputs: &mut Vec<Vec<f32>>) -> Result<Vec<f32>, GpuFailure> {
    if outputs.is_empty() {
        return Err("missing kernel output".into());
    }
    Ok(outputs.remove(0))
}

/// Per-element normalization with known per-channel statistics.
fn normalize(
    kernels: &Kernels,
    x: &[f32],
    chan: &[f32],
    d: NormDescriptor,
) -> Result<(Vec<f32>, Vec<f32>), GpuFailure> {
    let mut outputs = dispatch(
        &kernels.bn_normalize,
        "bn_normalize",
        &[
            Arg::Params(params(d, 0.0)?),
            Arg::Read(as_bytes(x)),
            Arg::Read(as_bytes(chan)),
            Arg::Out(d.len()),
            Arg::Out(d.len()),
        ],
        d.len(),
    )?;
    let y = take(&mut outputs)?;
    let x_hat = take(&mut outputs)?;
    Ok((y, x_hat))
}

/// Training forward: batch statistics on the device, then normalization.
pub fn batch_norm_forward_training(
    x: &[f32],
    gamma: &[f32],
    beta: &[f32],
    d: NormDescriptor,
    eps: f32,
) -> Result<BatchNormForward, GpuFailure> {
    let (_, kernels) = runtime()?;
    let mut outputs = dispatch(
        &kernels.bn_stats,
        "bn_stats",
        &[
            Arg::Params(params(d, eps)?),
            Arg::Read(as_bytes(x)),
            Arg::Out(3 * d.c),
        ],
        d.c,
    )?;
    let stats = take(&mut outputs)?;
    let (mean, rest) = stats.split_at(d.c);
    let (var, std) = rest.split_at(d.c);

    let chan = [mean, std, gamma, beta].concat();
    let (y, x_hat) = normalize(kernels, x, &chan, d)?;
    Ok(BatchNormForward {
        y,
        cache: BatchNormCache {
            mean: mean.to_vec(),
            var: var.to_vec(),
            std: std.to_vec(),
            x_hat,
        },
    })
}

/// Forward with caller-supplied statistics.
pub fn batch_norm_forward_inference(
    x: &[f32],
    gamma: &[f32],
    beta: &[f32],
    mean: &[f32],
    var: &[f32],
    d: NormDescriptor,
    eps: f32,
) -> Result<Vec<f32>, GpuFailure> {
    let (_, kernels) = runtime()?;
    let std: Vec<f32> = var.iter().map(|&v| (v + eps).sqrt()).collect();
    let chan = [mean, std.as_slice(), gamma, beta].concat();
    let (y, _) = normalize(kernels, x, &chan, d)?;
    Ok(y)
}

/// Training backward from a cache produced by any backend.
pub fn batch_norm_backward(
    gy: &[f32],
    gamma: &[f32],
    cache: &BatchNormCache,
    d: NormDescriptor,
) -> Result<BatchNormBackward, GpuFailure> {
    let (_, kernels) = runtime()?;
    let mut outputs = dispatch(
        &kernels.bn_backward_reduce,
        "bn_backward_reduce",
        &[
            Arg::Params(params(d, 0.0)?),
            Arg::Read(as_bytes(gy)),
            Arg::Read(as_bytes(&cache.x_hat)),
            Arg::Out(2 * d.c),
        ],
        d.c,
    )?;
    let mut red = take(&mut outputs)?;
    let gbeta = red.split_off(d.c);
    let ggamma = red;

    let chan = [gamma, cache.std.as_slice(), ggamma.as_slice(), gbeta.as_slice()].concat();
    let inv_m = 1.0 / d.reduce_len() as f32;
    let mut outputs = dispatch(
        &kernels.bn_backward_apply,
        "bn_backward_apply",
        &[
            Arg::Params(params(d, inv_m)?),
            Arg::Read(as_bytes(gy)),
            Arg::Read(as_bytes(&cache.x_hat)),
            Arg::Read(as_bytes(&chan)),
            Arg::Out(d.len()),
        ],
        d.len(),
    )?;
    let gx = take(&mut outputs)?;
    Ok(BatchNormBackward { gx, ggamma, gbeta })
}

/// Scatter-add of `gy` rows into `gw` rows selected by `x`.
///
/// Each invocation owns one element of `gw` and sums its bucket in ascending
/// position order, matching the sequential loop bit for bit.
pub fn embed_backward(gw: &mut [f32], dim: usize, x: &[i32], gy: &[f32]) -> Result<(), GpuFailure> {
    if dim == 0 || x.is_empty() {
        return Ok(());
    }
    let (_, kernels) = runtime()?;
    let rows = gw.len() / dim;
    let buckets = Buckets::build(x, rows);
    let words = [
        u32::try_from(rows).map_err(|_| GpuFailure::from("vocabulary exceeds u32"))?,
        u32::try_from(dim).map_err(|_| GpuFailure::from("dimension exceeds u32"))?,
        0,
        0,
    ];
    let mut outputs = dispatch(
        &kernels.embed_backward,
        "embed_backward",
        &[
            Arg::Params(words),
            Arg::Read(as_bytes(&buckets.offsets)),
            Arg::Read(as_bytes(&buckets.positions)),
            Arg::Read(as_bytes(gy)),
            Arg::InOut(gw),
        ],
        gw.len(),
    )?;
    let updated = take(&mut outputs)?;
    gw.copy_from_slice(&updated);
    Ok(())
}

/// Capability report of the GPU backend.
#[derive(Debug, Clone, Copy)]
pub struct GpuProbe {
    enabled: bool,
}

impl GpuProbe {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Probe for GpuProbe {
    fn backend(&self) -> Backend {
        Backend::Gpu
    }

    fn available(&self) -> bool {
        self.enabled && is_available()
    }

    fn supports(&self, kind: OpKind, rank: usize, dtype: DType) -> bool {
        match kind {
            OpKind::BatchNormForward | OpKind::BatchNormBackward => {
                dtype == DType::F32 && matches!(rank, 2 | 4)
            }
            OpKind::EmbedBackward => dtype == DType::I32 && rank == 1,
            OpKind::EmbedForward | OpKind::ConvForward | OpKind::ConvBackward => false,
        }
    }

    fn required_device(&self) -> Option<Device> {
        Some(Device::Gpu)
    }

    fn min_eps(&self) -> f32 {
        ACCELERATED_MIN_EPS
    }
}
