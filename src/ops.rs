//! Host wrappers around the compute kernels: one dispatch per call, each in
//! its own compute pass so later dispatches observe its storage writes.

use crate::gpu::{GpuBuffer, GpuContext};
use crate::kernels::{Kernel, Kernels, WG_1D, WG_2D, WG_3D};
use wgpu::util::DeviceExt;

fn groups(count: usize, wg: u32) -> u32 {
    (count as u32).div_ceil(wg)
}

/// Bind `buffers` in slot order (params uniform in the trailing slot), record
/// one compute pass, and submit it.
fn dispatch(
    ctx: &GpuContext,
    kernel: &Kernel,
    label: &str,
    buffers: &[&GpuBuffer],
    params: &[u8],
    workgroups: (u32, u32, u32),
) {
    let params_buf = ctx
        .device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: params,
            usage: wgpu::BufferUsages::UNIFORM,
        });

    let mut entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(i, b)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: b.buffer.as_entire_binding(),
        })
        .collect();
    entries.push(wgpu::BindGroupEntry {
        binding: buffers.len() as u32,
        resource: params_buf.as_entire_binding(),
    });

    let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout: &kernel.layout,
        entries: &entries,
    });

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernel.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(workgroups.0, workgroups.1, workgroups.2);
    }
    ctx.queue.submit(Some(encoder.finish()));
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct MatmulParams {
    n: u32,
    d: u32,
    x_offset: u32,
    w_offset: u32,
}

/// `xout = W[w_offset..] (d, n) @ x[x_offset..] (n,)`.
#[allow(clippy::too_many_arguments)]
pub fn matmul(
    ctx: &GpuContext,
    kernels: &Kernels,
    xout: &GpuBuffer,
    x: &GpuBuffer,
    w: &GpuBuffer,
    n: usize,
    d: usize,
    x_offset: usize,
    w_offset: usize,
) {
    let params = MatmulParams {
        n: n as u32,
        d: d as u32,
        x_offset: x_offset as u32,
        w_offset: w_offset as u32,
    };
    dispatch(
        ctx,
        &kernels.matmul,
        "matmul",
        &[x, w, xout],
        bytemuck::bytes_of(&params),
        (groups(d, WG_1D), 1, 1),
    );
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PairwiseParams {
    insize: u32,
    shape0: u32,
    rows: u32,
    _pad0: u32,
}

/// First pass of the sum-of-squares tree: `out[i] = in[2i]^2 + in[2i+1]^2`.
pub fn squares_step(
    ctx: &GpuContext,
    kernels: &Kernels,
    input: &GpuBuffer,
    output: &GpuBuffer,
    insize: usize,
) {
    let out_count = insize.div_ceil(2);
    let params = PairwiseParams {
        insize: insize as u32,
        shape0: out_count as u32,
        rows: 1,
        _pad0: 0,
    };
    dispatch(
        ctx,
        &kernels.rmsnorm_squares_and_sum,
        "rmsnorm_squares_and_sum",
        &[input, output],
        bytemuck::bytes_of(&params),
        (groups(out_count, WG_1D), 1, 1),
    );
}

/// One pairwise-add step over the fast axis of a `rows x insize` grid.
pub fn sum_step(
    ctx: &GpuContext,
    kernels: &Kernels,
    input: &GpuBuffer,
    output: &GpuBuffer,
    insize: usize,
    shape0: usize,
    rows: usize,
) {
    let params = PairwiseParams {
        insize: insize as u32,
        shape0: shape0 as u32,
        rows: rows as u32,
        _pad0: 0,
    };
    dispatch(
        ctx,
        &kernels.sum,
        "sum",
        &[input, output],
        bytemuck::bytes_of(&params),
        (groups(shape0, WG_2D), groups(rows, WG_2D), 1),
    );
}

/// One pairwise-max step over the fast axis of a `rows x insize` grid.
pub fn max_step(
    ctx: &GpuContext,
    kernels: &Kernels,
    input: &GpuBuffer,
    output: &GpuBuffer,
    insize: usize,
    shape0: usize,
    rows: usize,
) {
    let params = PairwiseParams {
        insize: insize as u32,
        shape0: shape0 as u32,
        rows: rows as u32,
        _pad0: 0,
    };
    dispatch(
        ctx,
        &kernels.max,
        "max",
        &[input, output],
        bytemuck::bytes_of(&params),
        (groups(shape0, WG_2D), groups(rows, WG_2D), 1),
    );
}

/// Per row: `out[i] = exp(in[2i] - max[row]) + exp(in[2i+1] - max[row])`.
#[allow(clippy::too_many_arguments)]
pub fn exp_sum_step(
    ctx: &GpuContext,
    kernels: &Kernels,
    input: &GpuBuffer,
    max_vals: &GpuBuffer,
    output: &GpuBuffer,
    insize: usize,
    shape0: usize,
    rows: usize,
) {
    let params = PairwiseParams {
        insize: insize as u32,
        shape0: shape0 as u32,
        rows: rows as u32,
        _pad0: 0,
    };
    dispatch(
        ctx,
        &kernels.softmax_exp_and_sum,
        "softmax_exp_and_sum",
        &[input, max_vals, output],
        bytemuck::bytes_of(&params),
        (groups(shape0, WG_2D), groups(rows, WG_2D), 1),
    );
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct NormalizeParams {
    size: u32,
    rows: u32,
    _pad0: u32,
    _pad1: u32,
}

/// `x[row, i] = exp(x[row, i] - max[row]) / sums[row]`.
pub fn softmax_normalize(
    ctx: &GpuContext,
    kernels: &Kernels,
    sums: &GpuBuffer,
    max_vals: &GpuBuffer,
    x: &GpuBuffer,
    size: usize,
    rows: usize,
) {
    let params = NormalizeParams {
        size: size as u32,
        rows: rows as u32,
        _pad0: 0,
        _pad1: 0,
    };
    dispatch(
        ctx,
        &kernels.softmax_normalize,
        "softmax_normalize",
        &[sums, max_vals, x],
        bytemuck::bytes_of(&params),
        (groups(size, WG_2D), groups(rows, WG_2D), 1),
    );
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct CountParams {
    count: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

/// Seed the argmax index buffer: `indices[i] = i`.
pub fn argmax_set_index(ctx: &GpuContext, kernels: &Kernels, indices: &GpuBuffer, count: usize) {
    let params = CountParams {
        count: count as u32,
        _pad0: 0,
        _pad1: 0,
        _pad2: 0,
    };
    dispatch(
        ctx,
        &kernels.argmax_set_index,
        "argmax_set_index",
        &[indices],
        bytemuck::bytes_of(&params),
        (groups(count, WG_1D), 1, 1),
    );
}

/// One pairwise argmax step; the surviving element carries its index.
#[allow(clippy::too_many_arguments)]
pub fn argmax_step(
    ctx: &GpuContext,
    kernels: &Kernels,
    values: &GpuBuffer,
    indices: &GpuBuffer,
    out_values: &GpuBuffer,
    out_indices: &GpuBuffer,
    insize: usize,
    shape0: usize,
) {
    let params = PairwiseParams {
        insize: insize as u32,
        shape0: shape0 as u32,
        rows: 1,
        _pad0: 0,
    };
    dispatch(
        ctx,
        &kernels.argmax,
        "argmax",
        &[values, indices, out_values, out_indices],
        bytemuck::bytes_of(&params),
        (groups(shape0, WG_1D), 1, 1),
    );
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ScaleParams {
    size: u32,
    weight_offset: u32,
    _pad0: u32,
    _pad1: u32,
}

/// Final RMSNorm pass into a separate output buffer.
#[allow(clippy::too_many_arguments)]
pub fn rmsnorm_scale(
    ctx: &GpuContext,
    kernels: &Kernels,
    ss: &GpuBuffer,
    weight: &GpuBuffer,
    x: &GpuBuffer,
    o: &GpuBuffer,
    size: usize,
    weight_offset: usize,
) {
    let params = ScaleParams {
        size: size as u32,
        weight_offset: weight_offset as u32,
        _pad0: 0,
        _pad1: 0,
    };
    dispatch(
        ctx,
        &kernels.rmsnorm_scale,
        "rmsnorm_scale",
        &[ss, weight, x, o],
        bytemuck::bytes_of(&params),
        (groups(size, WG_1D), 1, 1),
    );
}

/// Final RMSNorm pass operating in place on `x`.
pub fn rmsnorm_scale_inplace(
    ctx: &GpuContext,
    kernels: &Kernels,
    ss: &GpuBuffer,
    weight: &GpuBuffer,
    x: &GpuBuffer,
    size: usize,
    weight_offset: usize,
) {
    let params = ScaleParams {
        size: size as u32,
        weight_offset: weight_offset as u32,
        _pad0: 0,
        _pad1: 0,
    };
    dispatch(
        ctx,
        &kernels.rmsnorm_scale_inplace,
        "rmsnorm_scale_inplace",
        &[ss, weight, x],
        bytemuck::bytes_of(&params),
        (groups(size, WG_1D), 1, 1),
    );
}

/// Residual add: `a[i] += b[i]`.
pub fn accum(ctx: &GpuContext, kernels: &Kernels, a: &GpuBuffer, b: &GpuBuffer, size: usize) {
    let params = CountParams {
        count: size as u32,
        _pad0: 0,
        _pad1: 0,
        _pad2: 0,
    };
    dispatch(
        ctx,
        &kernels.accum,
        "accum",
        &[a, b],
        bytemuck::bytes_of(&params),
        (groups(size, WG_1D), 1, 1),
    );
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct RopeParams {
    freq_offset: u32,
    head_size: u32,
    half_dim: u32,
    _pad0: u32,
}

/// Rotate every (even, odd) pair of `q` and `k` by the position's complex
/// factor from the precomputed tables. Q and K are bound at distinct slots.
#[allow(clippy::too_many_arguments)]
pub fn rope(
    ctx: &GpuContext,
    kernels: &Kernels,
    freq_cis_real: &GpuBuffer,
    freq_cis_imag: &GpuBuffer,
    q: &GpuBuffer,
    k: &GpuBuffer,
    freq_offset: usize,
    head_size: usize,
    half_dim: usize,
) {
    let params = RopeParams {
        freq_offset: freq_offset as u32,
        head_size: head_size as u32,
        half_dim: half_dim as u32,
        _pad0: 0,
    };
    dispatch(
        ctx,
        &kernels.rope,
        "rope",
        &[freq_cis_real, freq_cis_imag, q, k],
        bytemuck::bytes_of(&params),
        (groups(half_dim, WG_1D), 1, 1),
    );
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct AttParams {
    seq_len: u32,
    pos: u32,
    head_size: u32,
    dim: u32,
    layer_idx: u32,
    n_heads: u32,
    _pad0: u32,
    _pad1: u32,
}

/// Scaled dot-product scores against the key cache for times `0..=pos`.
#[allow(clippy::too_many_arguments)]
pub fn att_scores(
    ctx: &GpuContext,
    kernels: &Kernels,
    q: &GpuBuffer,
    key_cache: &GpuBuffer,
    att: &GpuBuffer,
    seq_len: usize,
    pos: usize,
    head_size: usize,
    dim: usize,
    layer_idx: usize,
    n_heads: usize,
) {
    let params = AttParams {
        seq_len: seq_len as u32,
        pos: pos as u32,
        head_size: head_size as u32,
        dim: dim as u32,
        layer_idx: layer_idx as u32,
        n_heads: n_heads as u32,
        _pad0: 0,
        _pad1: 0,
    };
    dispatch(
        ctx,
        &kernels.att_scores,
        "att_scores",
        &[q, key_cache, att],
        bytemuck::bytes_of(&params),
        (groups(n_heads, WG_2D), groups(pos + 1, WG_2D), 1),
    );
}

/// Stage attention-weighted values as `(n_heads, head_size, pos+1)` with a
/// contiguous last axis.
#[allow(clippy::too_many_arguments)]
pub fn att_mat(
    ctx: &GpuContext,
    kernels: &Kernels,
    value_cache: &GpuBuffer,
    att: &GpuBuffer,
    att_mat: &GpuBuffer,
    seq_len: usize,
    pos: usize,
    head_size: usize,
    dim: usize,
    layer_idx: usize,
    n_heads: usize,
) {
    let params = AttParams {
        seq_len: seq_len as u32,
        pos: pos as u32,
        head_size: head_size as u32,
        dim: dim as u32,
        layer_idx: layer_idx as u32,
        n_heads: n_heads as u32,
        _pad0: 0,
        _pad1: 0,
    };
    dispatch(
        ctx,
        &kernels.att_mat,
        "att_mat",
        &[value_cache, att, att_mat],
        bytemuck::bytes_of(&params),
        (
            groups(n_heads, WG_3D),
            groups(head_size, WG_3D),
            groups(pos + 1, WG_3D),
        ),
    );
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PackParams {
    seq_len: u32,
    pos: u32,
    n_heads: u32,
    _pad0: u32,
}

/// Repack strided per-head scores into tight rows of length `pos+1`.
pub fn att_softmax_pack(
    ctx: &GpuContext,
    kernels: &Kernels,
    att: &GpuBuffer,
    packed: &GpuBuffer,
    seq_len: usize,
    pos: usize,
    n_heads: usize,
) {
    let params = PackParams {
        seq_len: seq_len as u32,
        pos: pos as u32,
        n_heads: n_heads as u32,
        _pad0: 0,
    };
    dispatch(
        ctx,
        &kernels.att_softmax_pack,
        "att_softmax_pack",
        &[att, packed],
        bytemuck::bytes_of(&params),
        (groups(n_heads, WG_2D), groups(pos + 1, WG_2D), 1),
    );
}

/// Copy the packed softmax rows back into the strided score buffer.
pub fn att_softmax_unpack(
    ctx: &GpuContext,
    kernels: &Kernels,
    packed: &GpuBuffer,
    att: &GpuBuffer,
    seq_len: usize,
    pos: usize,
    n_heads: usize,
) {
    let params = PackParams {
        seq_len: seq_len as u32,
        pos: pos as u32,
        n_heads: n_heads as u32,
        _pad0: 0,
    };
    dispatch(
        ctx,
        &kernels.att_softmax_unpack,
        "att_softmax_unpack",
        &[packed, att],
        bytemuck::bytes_of(&params),
        (groups(n_heads, WG_2D), groups(pos + 1, WG_2D), 1),
    );
}

/// SwiGLU fuse: `hb[i] = silu(hb[i]) * hb2[i]`.
pub fn silu_mul(ctx: &GpuContext, kernels: &Kernels, hb: &GpuBuffer, hb2: &GpuBuffer, size: usize) {
    let params = CountParams {
        count: size as u32,
        _pad0: 0,
        _pad1: 0,
        _pad2: 0,
    };
    dispatch(
        ctx,
        &kernels.silu_mul,
        "silu_mul",
        &[hb, hb2],
        bytemuck::bytes_of(&params),
        (groups(size, WG_1D), 1, 1),
    );
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct TemperatureParams {
    size: u32,
    temperature: f32,
    _pad0: u32,
    _pad1: u32,
}

/// Divide every logit by the sampling temperature.
pub fn temperature_scale(
    ctx: &GpuContext,
    kernels: &Kernels,
    logits: &GpuBuffer,
    size: usize,
    temperature: f32,
) {
    let params = TemperatureParams {
        size: size as u32,
        temperature,
        _pad0: 0,
        _pad1: 0,
    };
    dispatch(
        ctx,
        &kernels.temperature,
        "temperature",
        &[logits],
        bytemuck::bytes_of(&params),
        (groups(size, WG_1D), 1, 1),
    );
}
