//! The transformer: weights, one forward pass per token, token selection and
//! the generation loop.

use anyhow::{Context, Result, ensure};
use log::{debug, info};
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use crate::config::Config;
use crate::gpu::GpuContext;
use crate::kernels::Kernels;
use crate::ops;
use crate::reduce;
use crate::sampler::{self, SamplingParams, TokenRng};
use crate::state::RunState;
use crate::tokenizer::Tokenizer;
use crate::weights::{Checkpoint, GpuWeights};

/// Beginning-of-sequence token; also terminates generation.
pub const BOS_TOKEN: usize = 1;

/// Summary of one generation run.
pub struct GenerationStats {
    /// Positions stepped through (prompt included).
    pub steps: usize,
    /// Throughput over all but the first step; `None` when fewer than two
    /// steps ran.
    pub tok_per_sec: Option<f64>,
}

/// A loaded model: device context, compiled kernels, uploaded weights and the
/// per-session run state. Buffers, pipelines and the device release in
/// reverse order when this drops.
pub struct Transformer {
    pub ctx: GpuContext,
    pub config: Config,
    kernels: Kernels,
    checkpoint: Checkpoint,
    weights: GpuWeights,
    state: RunState,
}

impl Transformer {
    pub fn load(checkpoint_path: &Path) -> Result<Self> {
        let checkpoint = Checkpoint::open(checkpoint_path)?;
        let config = checkpoint.config;
        info!(
            "model config: dim={} hidden_dim={} n_layers={} n_heads={} vocab_size={} seq_len={}",
            config.dim,
            config.hidden_dim,
            config.n_layers,
            config.n_heads,
            config.vocab_size,
            config.seq_len
        );

        let start = Instant::now();
        let ctx = GpuContext::new()?;
        let kernels = Kernels::compile(&ctx);
        let weights = GpuWeights::upload(&ctx, &checkpoint);
        let state = RunState::new(&ctx, &config);
        ctx.sync().context("GPU initialization failed")?;
        info!("GPU ready: elapsed_ms={}", start.elapsed().as_millis());

        Ok(Self {
            ctx,
            config,
            kernels,
            checkpoint,
            weights,
            state,
        })
    }

    /// One forward pass: embed `token` at position `pos`, run every layer,
    /// leave the classifier output in the logits buffer.
    pub fn forward(&mut self, token: usize, pos: usize) -> Result<()> {
        let p = &self.config;
        ensure!(token < p.vocab_size, "token {token} out of range");
        ensure!(pos < p.seq_len, "position {pos} out of range");

        let ctx = &self.ctx;
        let k = &self.kernels;
        let s = &self.state;
        let w = &self.weights;
        let dim = p.dim;
        let hidden_dim = p.hidden_dim;
        let head_size = p.head_size();

        s.x.write(ctx, 0, self.checkpoint.embedding_row_bytes(token));

        // row `pos` of the RoPE cos/sin table
        let freq_offset = pos * head_size / 2;

        for l in 0..p.n_layers {
            reduce::rmsnorm(ctx, k, s, &s.xb, &s.x, &w.rms_att_weight, dim, l * dim);

            ops::matmul(ctx, k, &s.q, &s.xb, &w.wq, dim, dim, 0, l * dim * dim);
            ops::matmul(ctx, k, &s.k, &s.xb, &w.wk, dim, dim, 0, l * dim * dim);
            ops::matmul(ctx, k, &s.v, &s.xb, &w.wv, dim, dim, 0, l * dim * dim);

            ops::rope(
                ctx,
                k,
                &w.freq_cis_real,
                &w.freq_cis_imag,
                &s.q,
                &s.k,
                freq_offset,
                head_size,
                dim / 2,
            );

            // append this step's K/V to the cache at [l, pos, :]
            let cache_offset = ((l * p.seq_len + pos) * dim * 4) as u64;
            ctx.copy_buffer(&s.k, 0, &s.key_cache, cache_offset, (dim * 4) as u64);
            ctx.copy_buffer(&s.v, 0, &s.value_cache, cache_offset, (dim * 4) as u64);

            ops::att_scores(
                ctx, k, &s.q, &s.key_cache, &s.att, p.seq_len, pos, head_size, dim, l, p.n_heads,
            );

            // softmax per head over times 0..=pos; the generic softmax wants
            // contiguous rows, so repack through the staging buffer
            ops::att_softmax_pack(ctx, k, &s.att, &s.mul[3], p.seq_len, pos, p.n_heads);
            reduce::softmax(ctx, k, s, &s.mul[3], pos + 1, p.n_heads);
            ops::att_softmax_unpack(ctx, k, &s.mul[3], &s.att, p.seq_len, pos, p.n_heads);

            ops::att_mat(
                ctx,
                k,
                &s.value_cache,
                &s.att,
                &s.mul[3],
                p.seq_len,
                pos,
                head_size,
                dim,
                l,
                p.n_heads,
            );
            reduce::att_weighted_sum(ctx, k, s, &s.xb, p.n_heads * head_size, pos + 1);

            ops::matmul(ctx, k, &s.xb2, &s.xb, &w.wo, dim, dim, 0, l * dim * dim);
            ops::accum(ctx, k, &s.x, &s.xb2, dim);

            reduce::rmsnorm(ctx, k, s, &s.xb, &s.x, &w.rms_ffn_weight, dim, l * dim);

            ops::matmul(ctx, k, &s.hb, &s.xb, &w.w1, dim, hidden_dim, 0, l * dim * hidden_dim);
            ops::matmul(ctx, k, &s.hb2, &s.xb, &w.w3, dim, hidden_dim, 0, l * dim * hidden_dim);
            ops::silu_mul(ctx, k, &s.hb, &s.hb2, hidden_dim);
            ops::matmul(ctx, k, &s.xb, &s.hb, &w.w2, hidden_dim, dim, 0, l * dim * hidden_dim);
            ops::accum(ctx, k, &s.x, &s.xb, dim);
        }

        reduce::rmsnorm_inplace(ctx, k, s, &s.x, &w.rms_final_weight, dim, 0);
        ops::matmul(ctx, k, &s.logits, &s.x, &w.wcls, dim, p.vocab_size, 0, 0);
        Ok(())
    }

    /// Select the next token from the logits left by [`Self::forward`].
    pub fn next_token(&mut self, params: &SamplingParams, rng: &mut TokenRng) -> Result<usize> {
        let vocab_size = self.config.vocab_size;
        if params.is_greedy() {
            let index =
                reduce::argmax(&self.ctx, &self.kernels, &self.state, &self.state.logits, vocab_size)?;
            return Ok(index as usize);
        }

        ops::temperature_scale(
            &self.ctx,
            &self.kernels,
            &self.state.logits,
            vocab_size,
            params.temperature,
        );
        reduce::softmax(&self.ctx, &self.kernels, &self.state, &self.state.logits, vocab_size, 1);
        // the only full readback: probabilities for the CPU-side draw
        let probs = self.state.logits.read_f32(&self.ctx, vocab_size)?;

        if params.topp <= 0.0 {
            Ok(sampler::sample_multinomial(&probs, rng))
        } else {
            Ok(sampler::sample_topp(
                &probs,
                params.topp,
                &mut self.state.prob_index,
                rng,
            ))
        }
    }

    /// Read the logits buffer back to the host (diagnostics and tests).
    pub fn logits(&self) -> Result<Vec<f32>> {
        self.state.logits.read_f32(&self.ctx, self.config.vocab_size)
    }

    /// Run the token loop: force prompt tokens while they last, then sample;
    /// stream decoded pieces to `out`; stop at `steps` positions or on BOS.
    pub fn generate(
        &mut self,
        tokenizer: &Tokenizer,
        prompt_tokens: &[usize],
        steps: usize,
        params: &SamplingParams,
        rng: &mut TokenRng,
        out: &mut dyn Write,
    ) -> Result<GenerationStats> {
        let mut token = BOS_TOKEN;
        let mut pos = 0usize;
        let mut start: Option<Instant> = None;

        while pos < steps {
            self.forward(token, pos)?;

            let next = if pos < prompt_tokens.len() {
                prompt_tokens[pos]
            } else {
                self.next_token(params, rng)?
            };
            pos += 1;

            if next == BOS_TOKEN {
                break;
            }

            // after BOS the sentencepiece decoder strips one leading space
            let piece = tokenizer.piece(next);
            let piece = if token == BOS_TOKEN && piece.first() == Some(&b' ') {
                &piece[1..]
            } else {
                piece
            };
            out.write_all(piece)?;
            out.flush()?;
            debug!("pos={pos} token={next}");

            token = next;
            // the first iteration pays for pipeline warm-up; time the rest
            if start.is_none() {
                start = Some(Instant::now());
            }
        }

        let tok_per_sec = match start {
            Some(t) if pos > 1 => Some((pos - 1) as f64 / t.elapsed().as_secs_f64()),
            _ => None,
        };
        Ok(GenerationStats {
            steps: pos,
            tok_per_sec,
        })
    }
}
