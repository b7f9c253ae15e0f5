//! Model hyperparameters read from the checkpoint header.

use anyhow::{Result, bail};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Size of the checkpoint header: seven little-endian `i32` values.
pub const HEADER_BYTES: usize = 7 * 4;

/// Transformer hyperparameters, in checkpoint header order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Transformer embedding dimension
    pub dim: usize,
    /// FFN intermediate dimension
    pub hidden_dim: usize,
    /// Number of decoder layers
    pub n_layers: usize,
    /// Number of query heads
    pub n_heads: usize,
    /// Number of key/value heads
    pub n_kv_heads: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Maximum context length
    pub seq_len: usize,
    /// Classifier weights are tied to the token embedding table
    pub shared_weights: bool,
}

impl Config {
    /// Parse the seven-int header. A negative `vocab_size` in the file
    /// signals that the classifier weights are stored separately; the
    /// absolute value is used either way.
    pub fn from_header(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_BYTES {
            bail!(
                "checkpoint header too short: need {HEADER_BYTES} bytes, got {}",
                bytes.len()
            );
        }
        let mut cursor = Cursor::new(bytes);
        let dim = cursor.read_i32::<LittleEndian>()?;
        let hidden_dim = cursor.read_i32::<LittleEndian>()?;
        let n_layers = cursor.read_i32::<LittleEndian>()?;
        let n_heads = cursor.read_i32::<LittleEndian>()?;
        let n_kv_heads = cursor.read_i32::<LittleEndian>()?;
        let vocab_size = cursor.read_i32::<LittleEndian>()?;
        let seq_len = cursor.read_i32::<LittleEndian>()?;

        let shared_weights = vocab_size > 0;
        let config = Self {
            dim: dim as usize,
            hidden_dim: hidden_dim as usize,
            n_layers: n_layers as usize,
            n_heads: n_heads as usize,
            n_kv_heads: n_kv_heads as usize,
            vocab_size: vocab_size.unsigned_abs() as usize,
            seq_len: seq_len as usize,
            shared_weights,
        };
        config.validate(dim, hidden_dim, n_layers, n_heads, n_kv_heads, seq_len)?;
        Ok(config)
    }

    fn validate(
        &self,
        dim: i32,
        hidden_dim: i32,
        n_layers: i32,
        n_heads: i32,
        n_kv_heads: i32,
        seq_len: i32,
    ) -> Result<()> {
        for (name, value) in [
            ("dim", dim),
            ("hidden_dim", hidden_dim),
            ("n_layers", n_layers),
            ("n_heads", n_heads),
            ("n_kv_heads", n_kv_heads),
            ("seq_len", seq_len),
        ] {
            if value <= 0 {
                bail!("invalid checkpoint header: {name} = {value}");
            }
        }
        if self.vocab_size == 0 {
            bail!("invalid checkpoint header: vocab_size = 0");
        }
        if self.dim % self.n_heads != 0 {
            bail!(
                "invalid checkpoint header: dim {} not divisible by n_heads {}",
                self.dim,
                self.n_heads
            );
        }
        if self.n_kv_heads != self.n_heads {
            bail!(
                "grouped-query attention is not supported: n_kv_heads {} != n_heads {}",
                self.n_kv_heads,
                self.n_heads
            );
        }
        Ok(())
    }

    #[inline]
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    /// The sequence cannot run past the context window; non-positive or
    /// oversized step counts clamp to `seq_len`.
    pub fn clamp_steps(&self, steps: i32) -> usize {
        if steps <= 0 || steps as usize > self.seq_len {
            self.seq_len
        } else {
            steps as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn header(values: [i32; 7]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in values {
            bytes.write_i32::<LittleEndian>(v).unwrap();
        }
        bytes
    }

    #[test]
    fn parses_stories15m_header() {
        let bytes = header([288, 768, 6, 6, 6, 32000, 256]);
        let config = Config::from_header(&bytes).unwrap();
        assert_eq!(config.dim, 288);
        assert_eq!(config.hidden_dim, 768);
        assert_eq!(config.n_layers, 6);
        assert_eq!(config.n_heads, 6);
        assert_eq!(config.vocab_size, 32000);
        assert_eq!(config.seq_len, 256);
        assert!(config.shared_weights);
        assert_eq!(config.head_size(), 48);
    }

    #[test]
    fn negative_vocab_means_unshared_classifier() {
        let config = Config::from_header(&header([64, 128, 2, 4, 4, -1000, 32])).unwrap();
        assert_eq!(config.vocab_size, 1000);
        assert!(!config.shared_weights);
    }

    #[test]
    fn rejects_gqa_checkpoints() {
        let err = Config::from_header(&header([64, 128, 2, 8, 4, 1000, 32])).unwrap_err();
        assert!(err.to_string().contains("grouped-query"));
    }

    #[test]
    fn rejects_indivisible_head_count() {
        let err = Config::from_header(&header([65, 128, 2, 4, 4, 1000, 32])).unwrap_err();
        assert!(err.to_string().contains("not divisible"));
    }

    #[test]
    fn rejects_non_positive_dims() {
        assert!(Config::from_header(&header([0, 128, 2, 4, 4, 1000, 32])).is_err());
        assert!(Config::from_header(&header([64, 128, -2, 4, 4, 1000, 32])).is_err());
    }

    #[test]
    fn rejects_short_header() {
        assert!(Config::from_header(&[0u8; 12]).is_err());
    }

    #[test]
    fn clamps_steps_to_context_window() {
        let config = Config::from_header(&header([64, 128, 2, 4, 4, 1000, 32])).unwrap();
        assert_eq!(config.clamp_steps(10), 10);
        assert_eq!(config.clamp_steps(32), 32);
        assert_eq!(config.clamp_steps(0), 32);
        assert_eq!(config.clamp_steps(-5), 32);
        assert_eq!(config.clamp_steps(1_000_000), 32);
    }
}
