//! Pre-allocated GPU buffers for the forward pass and sampling.

use crate::config::Config;
use crate::gpu::{GpuBuffer, GpuContext};
use crate::sampler::ProbIndex;

/// Activation, attention, cache and scratch buffers for one session.
///
/// Buffer sizes are fixed by the model config. The four mul buffers are the
/// ping-pong scratch for every pairwise reduction and for the attention
/// staging tensor; ownership is strictly serial (single queue, no
/// concurrency), so they are never aliased across passes in flight.
pub struct RunState {
    /// Residual stream at the current position (dim)
    pub x: GpuBuffer,
    /// Residual-branch scratch (dim)
    pub xb: GpuBuffer,
    /// Second activation scratch (dim)
    pub xb2: GpuBuffer,
    /// FFN scratch (hidden_dim)
    pub hb: GpuBuffer,
    /// FFN scratch (hidden_dim)
    pub hb2: GpuBuffer,
    /// Query projection (dim)
    pub q: GpuBuffer,
    /// Key projection (dim)
    pub k: GpuBuffer,
    /// Value projection (dim)
    pub v: GpuBuffer,
    /// Per-head attention scores (n_heads * seq_len)
    pub att: GpuBuffer,
    /// Classifier output (vocab_size)
    pub logits: GpuBuffer,
    /// Key cache, indexed `[layer, t, dim]` (n_layers * seq_len * dim)
    pub key_cache: GpuBuffer,
    /// Value cache, same layout as `key_cache`
    pub value_cache: GpuBuffer,
    /// Reduction / staging scratch, each `max(dim * seq_len, vocab_size)` words
    pub mul: [GpuBuffer; 4],
    /// Host-side scratch for top-p sampling (vocab_size)
    pub prob_index: Vec<ProbIndex>,
}

impl RunState {
    pub fn new(ctx: &GpuContext, config: &Config) -> Self {
        let dim = config.dim;
        let cache_len = config.n_layers * config.seq_len * dim;
        let mul_len = (dim * config.seq_len).max(config.vocab_size);
        Self {
            x: GpuBuffer::zeroed(ctx, "x", dim),
            xb: GpuBuffer::zeroed(ctx, "xb", dim),
            xb2: GpuBuffer::zeroed(ctx, "xb2", dim),
            hb: GpuBuffer::zeroed(ctx, "hb", config.hidden_dim),
            hb2: GpuBuffer::zeroed(ctx, "hb2", config.hidden_dim),
            q: GpuBuffer::zeroed(ctx, "q", dim),
            k: GpuBuffer::zeroed(ctx, "k", dim),
            v: GpuBuffer::zeroed(ctx, "v", dim),
            att: GpuBuffer::zeroed(ctx, "att", config.n_heads * config.seq_len),
            logits: GpuBuffer::zeroed(ctx, "logits", config.vocab_size),
            key_cache: GpuBuffer::zeroed(ctx, "key_cache", cache_len),
            value_cache: GpuBuffer::zeroed(ctx, "value_cache", cache_len),
            mul: [
                GpuBuffer::zeroed(ctx, "mul_0", mul_len),
                GpuBuffer::zeroed(ctx, "mul_1", mul_len),
                GpuBuffer::zeroed(ctx, "mul_2", mul_len),
                GpuBuffer::zeroed(ctx, "mul_3", mul_len),
            ],
            prob_index: vec![ProbIndex { prob: 0.0, index: 0 }; config.vocab_size],
        }
    }
}
