//! Host drivers for the log-depth pairwise reductions.
//!
//! Every reduction runs as `ceil(log2 N)` dispatches, each halving the
//! working size, ping-ponging between two scratch buffers. The tree shape is
//! fixed (pairwise over adjacent elements), so float summation order, and
//! with it the sampled output, is reproducible across runs.

use crate::gpu::{GpuBuffer, GpuContext};
use crate::kernels::Kernels;
use crate::ops;
use crate::state::RunState;
use anyhow::Result;

/// Reduce `x[0..size]` to a single sum of squares. Returns the buffer whose
/// word 0 holds the result (one of `state.mul[0]`/`state.mul[1]`).
fn sum_of_squares<'a>(
    ctx: &GpuContext,
    kernels: &Kernels,
    state: &'a RunState,
    x: &GpuBuffer,
    size: usize,
) -> &'a GpuBuffer {
    let mut step = size;
    let mut out = step.div_ceil(2);
    ops::squares_step(ctx, kernels, x, &state.mul[1], step);

    let (mut data, mut scratch) = (1usize, 0usize);
    while out != 1 {
        step = out;
        out = step.div_ceil(2);
        ops::sum_step(ctx, kernels, &state.mul[data], &state.mul[scratch], step, out, 1);
        std::mem::swap(&mut data, &mut scratch);
    }
    &state.mul[data]
}

/// RMSNorm `src` into `dst`: sum-of-squares tree, then normalize-and-scale
/// with the weight row at `weight_offset`.
#[allow(clippy::too_many_arguments)]
pub fn rmsnorm(
    ctx: &GpuContext,
    kernels: &Kernels,
    state: &RunState,
    dst: &GpuBuffer,
    src: &GpuBuffer,
    weight: &GpuBuffer,
    size: usize,
    weight_offset: usize,
) {
    let ss = sum_of_squares(ctx, kernels, state, src, size);
    ops::rmsnorm_scale(ctx, kernels, ss, weight, src, dst, size, weight_offset);
}

/// In-place RMSNorm, used for the final norm before the classifier.
pub fn rmsnorm_inplace(
    ctx: &GpuContext,
    kernels: &Kernels,
    state: &RunState,
    x: &GpuBuffer,
    weight: &GpuBuffer,
    size: usize,
    weight_offset: usize,
) {
    let ss = sum_of_squares(ctx, kernels, state, x, size);
    ops::rmsnorm_scale_inplace(ctx, kernels, ss, weight, x, size, weight_offset);
}

/// Softmax `rows` contiguous rows of length `size` in place: per-row max
/// tree, exponential partial sums, sum tree, then normalization.
///
/// Uses `state.mul[0..3]` as scratch; `x` may be `state.mul[3]` (the packed
/// attention rows) or the logits buffer.
pub fn softmax(
    ctx: &GpuContext,
    kernels: &Kernels,
    state: &RunState,
    x: &GpuBuffer,
    size: usize,
    rows: usize,
) {
    // Per-row maxima, reduced into stride-1 rows.
    let mut step = size;
    let mut out = step.div_ceil(2);
    ops::max_step(ctx, kernels, x, &state.mul[1], step, out, rows);
    let (mut data, mut scratch) = (1usize, 0usize);
    while out != 1 {
        step = out;
        out = step.div_ceil(2);
        ops::max_step(ctx, kernels, &state.mul[data], &state.mul[scratch], step, out, rows);
        std::mem::swap(&mut data, &mut scratch);
    }
    let max_idx = data;
    let free_idx = 1 - max_idx;

    // Per-row sums of shifted exponentials.
    let mut step = size;
    let mut out = step.div_ceil(2);
    ops::exp_sum_step(ctx, kernels, x, &state.mul[max_idx], &state.mul[2], step, out, rows);
    let (mut data, mut scratch) = (2usize, free_idx);
    while out != 1 {
        step = out;
        out = step.div_ceil(2);
        ops::sum_step(ctx, kernels, &state.mul[data], &state.mul[scratch], step, out, rows);
        std::mem::swap(&mut data, &mut scratch);
    }
    let sum_idx = data;

    ops::softmax_normalize(
        ctx,
        kernels,
        &state.mul[sum_idx],
        &state.mul[max_idx],
        x,
        size,
        rows,
    );
}

/// Sum-reduce the staged attention tensor in `state.mul[3]` along its
/// contiguous last axis of length `len = pos + 1`, writing the per-head
/// context vectors into `xb`. Always performs at least one step so a
/// single-column tensor (`pos == 0`) still lands in `xb`.
pub fn att_weighted_sum(
    ctx: &GpuContext,
    kernels: &Kernels,
    state: &RunState,
    xb: &GpuBuffer,
    rows: usize,
    len: usize,
) {
    let (mut data, mut scratch) = (3usize, 0usize);
    let mut step = len;
    loop {
        let out = step.div_ceil(2);
        if out == 1 {
            ops::sum_step(ctx, kernels, &state.mul[data], xb, step, out, rows);
            return;
        }
        ops::sum_step(ctx, kernels, &state.mul[data], &state.mul[scratch], step, out, rows);
        std::mem::swap(&mut data, &mut scratch);
        step = out;
    }
}

/// GPU argmax over `values[0..n]`: seed an index buffer, run the pairwise
/// tree carrying indices alongside values, read back the surviving index.
/// Ties resolve to the smaller index.
pub fn argmax(
    ctx: &GpuContext,
    kernels: &Kernels,
    state: &RunState,
    values: &GpuBuffer,
    n: usize,
) -> Result<u32> {
    ops::argmax_set_index(ctx, kernels, &state.mul[1], n);

    let mut step = n;
    let mut out = step.div_ceil(2);
    ops::argmax_step(ctx, kernels, values, &state.mul[1], &state.mul[2], &state.mul[3], step, out);

    let (mut dv, mut di) = (2usize, 3usize);
    let (mut sv, mut si) = (0usize, 1usize);
    while out != 1 {
        step = out;
        out = step.div_ceil(2);
        ops::argmax_step(
            ctx,
            kernels,
            &state.mul[dv],
            &state.mul[di],
            &state.mul[sv],
            &state.mul[si],
            step,
            out,
        );
        std::mem::swap(&mut dv, &mut sv);
        std::mem::swap(&mut di, &mut si);
    }

    let index = state.mul[di].read_u32(ctx, 1)?;
    Ok(index[0])
}
