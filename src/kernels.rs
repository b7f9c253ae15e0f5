//! The compute-kernel library: every WGSL pipeline compiled once per session.

use crate::gpu::GpuContext;

/// Workgroup sizes baked into the WGSL sources. Dispatch counts are rounded
/// up against these and every kernel masks out-of-range invocations.
pub const WG_1D: u32 = 64;
pub const WG_2D: u32 = 8;
pub const WG_3D: u32 = 4;

/// A compiled compute pipeline and the bind-group layout it was built with.
pub struct Kernel {
    pub pipeline: wgpu::ComputePipeline,
    pub layout: wgpu::BindGroupLayout,
}

/// Binding slots of a kernel, in `@binding` order.
#[derive(Clone, Copy)]
enum Slot {
    /// `var<storage, read>`
    Read,
    /// `var<storage, read_write>`
    Write,
    /// `var<uniform>`
    Uniform,
}

fn layout_entry(binding: u32, slot: Slot) -> wgpu::BindGroupLayoutEntry {
    let ty = match slot {
        Slot::Read => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        Slot::Write => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        Slot::Uniform => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
    };
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty,
        count: None,
    }
}

fn compile(ctx: &GpuContext, label: &str, source: &str, slots: &[Slot]) -> Kernel {
    let module = ctx
        .device
        .create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

    let entries: Vec<wgpu::BindGroupLayoutEntry> = slots
        .iter()
        .enumerate()
        .map(|(i, &slot)| layout_entry(i as u32, slot))
        .collect();
    let layout = ctx
        .device
        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &entries,
        });
    let pipeline_layout = ctx
        .device
        .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
    let pipeline = ctx
        .device
        .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });
    Kernel { pipeline, layout }
}

/// The full kernel set. Compiled once during initialization and retained for
/// the session; shader validation failures are fatal.
pub struct Kernels {
    pub matmul: Kernel,
    pub rmsnorm_squares_and_sum: Kernel,
    pub sum: Kernel,
    pub max: Kernel,
    pub argmax_set_index: Kernel,
    pub argmax: Kernel,
    pub softmax_exp_and_sum: Kernel,
    pub softmax_normalize: Kernel,
    pub rmsnorm_scale: Kernel,
    pub rmsnorm_scale_inplace: Kernel,
    pub accum: Kernel,
    pub rope: Kernel,
    pub att_scores: Kernel,
    pub att_mat: Kernel,
    pub att_softmax_pack: Kernel,
    pub att_softmax_unpack: Kernel,
    pub silu_mul: Kernel,
    pub temperature: Kernel,
}

impl Kernels {
    pub fn compile(ctx: &GpuContext) -> Self {
        use Slot::{Read, Uniform, Write};
        Self {
            matmul: compile(
                ctx,
                "matmul",
                include_str!("shaders/matmul.wgsl"),
                &[Read, Read, Write, Uniform],
            ),
            rmsnorm_squares_and_sum: compile(
                ctx,
                "rmsnorm_squares_and_sum",
                include_str!("shaders/rmsnorm_squares_and_sum.wgsl"),
                &[Read, Write, Uniform],
            ),
            sum: compile(
                ctx,
                "sum",
                include_str!("shaders/sum.wgsl"),
                &[Read, Write, Uniform],
            ),
            max: compile(
                ctx,
                "max",
                include_str!("shaders/max.wgsl"),
                &[Read, Write, Uniform],
            ),
            argmax_set_index: compile(
                ctx,
                "argmax_set_index",
                include_str!("shaders/argmax_set_index.wgsl"),
                &[Write, Uniform],
            ),
            argmax: compile(
                ctx,
                "argmax",
                include_str!("shaders/argmax.wgsl"),
                &[Read, Read, Write, Write, Uniform],
            ),
            softmax_exp_and_sum: compile(
                ctx,
                "softmax_exp_and_sum",
                include_str!("shaders/softmax_exp_and_sum.wgsl"),
                &[Read, Read, Write, Uniform],
            ),
            softmax_normalize: compile(
                ctx,
                "softmax_normalize",
                include_str!("shaders/softmax_normalize.wgsl"),
                &[Read, Read, Write, Uniform],
            ),
            rmsnorm_scale: compile(
                ctx,
                "rmsnorm_scale",
                include_str!("shaders/rmsnorm_scale.wgsl"),
                &[Read, Read, Read, Write, Uniform],
            ),
            rmsnorm_scale_inplace: compile(
                ctx,
                "rmsnorm_scale_inplace",
                include_str!("shaders/rmsnorm_scale_inplace.wgsl"),
                &[Read, Read, Write, Uniform],
            ),
            accum: compile(
                ctx,
                "accum",
                include_str!("shaders/accum.wgsl"),
                &[Write, Read, Uniform],
            ),
            rope: compile(
                ctx,
                "rope",
                include_str!("shaders/rope.wgsl"),
                &[Read, Read, Write, Write, Uniform],
            ),
            att_scores: compile(
                ctx,
                "att_scores",
                include_str!("shaders/att_scores.wgsl"),
                &[Read, Read, Write, Uniform],
            ),
            att_mat: compile(
                ctx,
                "att_mat",
                include_str!("shaders/att_mat.wgsl"),
                &[Read, Read, Write, Uniform],
            ),
            att_softmax_pack: compile(
                ctx,
                "att_softmax_pack",
                include_str!("shaders/att_softmax_pack.wgsl"),
                &[Read, Write, Uniform],
            ),
            att_softmax_unpack: compile(
                ctx,
                "att_softmax_unpack",
                include_str!("shaders/att_softmax_unpack.wgsl"),
                &[Read, Write, Uniform],
            ),
            silu_mul: compile(
                ctx,
                "silu_mul",
                include_str!("shaders/silu_mul.wgsl"),
                &[Write, Read, Uniform],
            ),
            temperature: compile(
                ctx,
                "temperature",
                include_str!("shaders/temperature.wgsl"),
                &[Write, Uniform],
            ),
        }
    }
}
