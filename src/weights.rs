//! Checkpoint parsing and weight upload.
//!
//! The checkpoint is memory-mapped read-only; tensors live at fixed element
//! offsets computed from the header. Everything except the token embedding
//! table is copied into immutable GPU storage buffers at load time; the
//! embedding table stays host-resident so each step can push one row into
//! the residual buffer with a cheap sub-range write.

use crate::config::{Config, HEADER_BYTES};
use crate::gpu::{GpuBuffer, GpuContext};
use anyhow::{Context, Result, bail};
use std::fs::File;
use std::ops::Range;
use std::path::Path;

type Span = Range<usize>;

/// Element offsets of every tensor in the float region of the file, in the
/// exact order they are stored.
#[derive(Debug)]
struct TensorSpans {
    token_embedding: Span,
    rms_att_weight: Span,
    wq: Span,
    wk: Span,
    wv: Span,
    wo: Span,
    rms_ffn_weight: Span,
    w1: Span,
    w2: Span,
    w3: Span,
    rms_final_weight: Span,
    freq_cis_real: Span,
    freq_cis_imag: Span,
    wcls: Span,
    total_elems: usize,
}

impl TensorSpans {
    fn layout(config: &Config) -> Self {
        let dim = config.dim;
        let hidden_dim = config.hidden_dim;
        let n_layers = config.n_layers;
        let head_size = config.head_size();

        let mut offset = 0usize;
        let mut span = |elems: usize| {
            let s = offset..offset + elems;
            offset += elems;
            s
        };

        let token_embedding = span(config.vocab_size * dim);
        let rms_att_weight = span(n_layers * dim);
        let wq = span(n_layers * dim * dim);
        let wk = span(n_layers * dim * dim);
        let wv = span(n_layers * dim * dim);
        let wo = span(n_layers * dim * dim);
        let rms_ffn_weight = span(n_layers * dim);
        let w1 = span(n_layers * hidden_dim * dim);
        let w2 = span(n_layers * dim * hidden_dim);
        let w3 = span(n_layers * hidden_dim * dim);
        let rms_final_weight = span(dim);
        let freq_cis_real = span(config.seq_len * head_size / 2);
        let freq_cis_imag = span(config.seq_len * head_size / 2);
        let wcls = if config.shared_weights {
            token_embedding.clone()
        } else {
            span(config.vocab_size * dim)
        };

        Self {
            token_embedding,
            rms_att_weight,
            wq,
            wk,
            wv,
            wo,
            rms_ffn_weight,
            w1,
            w2,
            w3,
            rms_final_weight,
            freq_cis_real,
            freq_cis_imag,
            wcls,
            total_elems: offset,
        }
    }
}

/// A memory-mapped checkpoint with its parsed header.
#[derive(Debug)]
pub struct Checkpoint {
    mmap: memmap2::Mmap,
    pub config: Config,
    spans: TensorSpans,
}

impl Checkpoint {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("couldn't open checkpoint {}", path.display()))?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }
            .with_context(|| format!("couldn't mmap checkpoint {}", path.display()))?;
        if mmap.len() < HEADER_BYTES {
            bail!("checkpoint {} is truncated", path.display());
        }
        let config = Config::from_header(&mmap[..HEADER_BYTES])?;
        let spans = TensorSpans::layout(&config);
        let expected = HEADER_BYTES + spans.total_elems * 4;
        if mmap.len() != expected {
            bail!(
                "checkpoint {} size mismatch: expected {expected} bytes for {:?}, got {}",
                path.display(),
                config,
                mmap.len()
            );
        }
        Ok(Self { mmap, config, spans })
    }

    fn tensor_bytes(&self, span: &Span) -> &[u8] {
        &self.mmap[HEADER_BYTES + span.start * 4..HEADER_BYTES + span.end * 4]
    }

    /// The embedding row for `token`, as raw bytes ready for a sub-range
    /// upload into the residual buffer.
    pub fn embedding_row_bytes(&self, token: usize) -> &[u8] {
        let dim = self.config.dim;
        let start = self.spans.token_embedding.start + token * dim;
        self.tensor_bytes(&(start..start + dim))
    }

    /// The embedding row for `token` as floats.
    pub fn embedding_row(&self, token: usize) -> &[f32] {
        bytemuck::cast_slice(self.embedding_row_bytes(token))
    }
}

/// GPU copies of every weight tensor except the token embedding table.
pub struct GpuWeights {
    pub rms_att_weight: GpuBuffer,
    pub wq: GpuBuffer,
    pub wk: GpuBuffer,
    pub wv: GpuBuffer,
    pub wo: GpuBuffer,
    pub rms_ffn_weight: GpuBuffer,
    pub w1: GpuBuffer,
    pub w2: GpuBuffer,
    pub w3: GpuBuffer,
    pub rms_final_weight: GpuBuffer,
    pub freq_cis_real: GpuBuffer,
    pub freq_cis_imag: GpuBuffer,
    /// Classifier weights; holds the embedding table when weights are shared.
    pub wcls: GpuBuffer,
}

impl GpuWeights {
    pub fn upload(ctx: &GpuContext, checkpoint: &Checkpoint) -> Self {
        let spans = &checkpoint.spans;
        let tensor =
            |label: &str, span: &Span| GpuBuffer::from_bytes(ctx, label, checkpoint.tensor_bytes(span));

        let weights = Self {
            rms_att_weight: tensor("rms_att_weight", &spans.rms_att_weight),
            wq: tensor("wq", &spans.wq),
            wk: tensor("wk", &spans.wk),
            wv: tensor("wv", &spans.wv),
            wo: tensor("wo", &spans.wo),
            rms_ffn_weight: tensor("rms_ffn_weight", &spans.rms_ffn_weight),
            w1: tensor("w1", &spans.w1),
            w2: tensor("w2", &spans.w2),
            w3: tensor("w3", &spans.w3),
            rms_final_weight: tensor("rms_final_weight", &spans.rms_final_weight),
            freq_cis_real: tensor("freq_cis_real", &spans.freq_cis_real),
            freq_cis_imag: tensor("freq_cis_imag", &spans.freq_cis_imag),
            wcls: tensor("wcls", &spans.wcls),
        };
        log::info!(
            "uploaded {} MB of weights to GPU",
            (spans.total_elems - spans.token_embedding.len()) * 4 / (1024 * 1024)
        );
        weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::io::Write;

    fn tiny_config() -> Config {
        Config {
            dim: 8,
            hidden_dim: 16,
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 2,
            vocab_size: 10,
            seq_len: 4,
            shared_weights: true,
        }
    }

    /// Serialize a checkpoint image: header plus `total_elems` floats.
    fn checkpoint_bytes(config: &Config, fill: impl Fn(usize) -> f32) -> Vec<u8> {
        let spans = TensorSpans::layout(config);
        let mut bytes = Vec::new();
        let vocab = if config.shared_weights {
            config.vocab_size as i32
        } else {
            -(config.vocab_size as i32)
        };
        for v in [
            config.dim as i32,
            config.hidden_dim as i32,
            config.n_layers as i32,
            config.n_heads as i32,
            config.n_kv_heads as i32,
            vocab,
            config.seq_len as i32,
        ] {
            bytes.write_i32::<LittleEndian>(v).unwrap();
        }
        for i in 0..spans.total_elems {
            bytes.write_f32::<LittleEndian>(fill(i)).unwrap();
        }
        bytes
    }

    fn write_checkpoint(config: &Config, fill: impl Fn(usize) -> f32) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&checkpoint_bytes(config, fill)).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn span_layout_is_sequential_and_disjoint() {
        let config = tiny_config();
        let spans = TensorSpans::layout(&config);
        let ordered = [
            &spans.token_embedding,
            &spans.rms_att_weight,
            &spans.wq,
            &spans.wk,
            &spans.wv,
            &spans.wo,
            &spans.rms_ffn_weight,
            &spans.w1,
            &spans.w2,
            &spans.w3,
            &spans.rms_final_weight,
            &spans.freq_cis_real,
            &spans.freq_cis_imag,
        ];
        let mut offset = 0;
        for span in ordered {
            assert_eq!(span.start, offset);
            offset = span.end;
        }
        assert_eq!(spans.total_elems, offset);
        assert_eq!(spans.token_embedding.len(), 10 * 8);
        assert_eq!(spans.wq.len(), 2 * 8 * 8);
        assert_eq!(spans.w2.len(), 2 * 8 * 16);
        assert_eq!(spans.freq_cis_real.len(), 4 * 4 / 2);
        // shared classifier aliases the embedding table
        assert_eq!(spans.wcls, spans.token_embedding);
    }

    #[test]
    fn unshared_classifier_has_its_own_span() {
        let config = Config {
            shared_weights: false,
            ..tiny_config()
        };
        let spans = TensorSpans::layout(&config);
        assert_eq!(spans.wcls.start, spans.freq_cis_imag.end);
        assert_eq!(spans.wcls.len(), 10 * 8);
    }

    #[test]
    fn opens_a_well_formed_checkpoint() {
        let config = tiny_config();
        let file = write_checkpoint(&config, |i| i as f32);
        let checkpoint = Checkpoint::open(file.path()).unwrap();
        assert_eq!(checkpoint.config, config);
        // embedding row 3 starts at element 3 * dim
        assert_eq!(checkpoint.embedding_row(3)[0], 24.0);
        assert_eq!(checkpoint.embedding_row(3).len(), 8);
    }

    #[test]
    fn rejects_truncated_checkpoint() {
        let config = tiny_config();
        let mut bytes = checkpoint_bytes(&config, |_| 0.0);
        bytes.truncate(bytes.len() - 4);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        let err = Checkpoint::open(file.path()).unwrap_err();
        assert!(err.to_string().contains("size mismatch"));
    }
}
