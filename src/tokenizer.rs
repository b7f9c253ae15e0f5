//! `tokenizer.bin` loading and greedy-merge BPE encoding.
//!
//! Vocabulary pieces are raw byte strings, so encode → decode → concatenate
//! reproduces the input byte-for-byte.

use anyhow::{Context, Result, bail};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub struct Tokenizer {
    vocab: Vec<Vec<u8>>,
    scores: Vec<f32>,
    lookup: HashMap<Vec<u8>, usize>,
    max_token_length: u32,
}

impl Tokenizer {
    /// Load from the binary vocabulary format: an int32 `max_token_length`
    /// header, then `vocab_size` entries of (f32 score, i32 len, len bytes).
    pub fn from_file(path: &Path, vocab_size: usize) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("couldn't load tokenizer {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let max_token_length = reader
            .read_u32::<LittleEndian>()
            .context("failed to read tokenizer header")?;

        let mut vocab = Vec::with_capacity(vocab_size);
        let mut scores = Vec::with_capacity(vocab_size);
        for i in 0..vocab_size {
            let score = reader
                .read_f32::<LittleEndian>()
                .with_context(|| format!("failed to read score of token {i}"))?;
            let len = reader
                .read_i32::<LittleEndian>()
                .with_context(|| format!("failed to read length of token {i}"))?;
            let mut piece = vec![0u8; len as usize];
            reader
                .read_exact(&mut piece)
                .with_context(|| format!("failed to read bytes of token {i}"))?;
            scores.push(score);
            vocab.push(piece);
        }

        Ok(Self::from_parts(vocab, scores, max_token_length))
    }

    /// Assemble a tokenizer from already-parsed pieces; the first occurrence
    /// of a duplicated piece wins lookups.
    pub fn from_parts(vocab: Vec<Vec<u8>>, scores: Vec<f32>, max_token_length: u32) -> Self {
        assert_eq!(vocab.len(), scores.len());
        let mut lookup = HashMap::with_capacity(vocab.len());
        for (i, piece) in vocab.iter().enumerate() {
            lookup.entry(piece.clone()).or_insert(i);
        }
        Self {
            vocab,
            scores,
            lookup,
            max_token_length,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn max_token_length(&self) -> u32 {
        self.max_token_length
    }

    /// The raw bytes of a token's piece.
    pub fn piece(&self, token: usize) -> &[u8] {
        &self.vocab[token]
    }

    /// BPE encode: map each input byte to its single-byte vocabulary entry,
    /// then repeatedly merge the adjacent pair whose concatenation exists in
    /// the vocabulary with the highest score.
    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        let mut tokens = Vec::with_capacity(text.len());
        for &byte in text.as_bytes() {
            match self.lookup.get(std::slice::from_ref(&byte)) {
                Some(&id) => tokens.push(id),
                None => bail!("byte 0x{byte:02x} is not in the vocabulary"),
            }
        }

        let mut merged = Vec::new();
        loop {
            let mut best_score = f32::NEG_INFINITY;
            let mut best: Option<(usize, usize)> = None; // (position, merged id)

            for i in 0..tokens.len().saturating_sub(1) {
                merged.clear();
                merged.extend_from_slice(&self.vocab[tokens[i]]);
                merged.extend_from_slice(&self.vocab[tokens[i + 1]]);
                if let Some(&id) = self.lookup.get(&merged) {
                    if self.scores[id] > best_score {
                        best_score = self.scores[id];
                        best = Some((i, id));
                    }
                }
            }

            let Some((i, id)) = best else { break };
            tokens[i] = id;
            tokens.remove(i + 1);
        }

        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    /// Single-byte entries for printable ASCII plus explicit merge pieces.
    fn test_tokenizer(merges: &[(&str, f32)]) -> Tokenizer {
        let mut vocab: Vec<Vec<u8>> = (0x20u8..0x7f).map(|b| vec![b]).collect();
        let mut scores = vec![0.0f32; vocab.len()];
        for &(piece, score) in merges {
            vocab.push(piece.as_bytes().to_vec());
            scores.push(score);
        }
        Tokenizer::from_parts(vocab, scores, 16)
    }

    #[test]
    fn encodes_single_bytes_without_merges() {
        let tok = test_tokenizer(&[]);
        let ids = tok.encode("hi").unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(tok.piece(ids[0]), b"h");
        assert_eq!(tok.piece(ids[1]), b"i");
    }

    #[test]
    fn merges_highest_score_first() {
        // "ll" scores above "he", so "hello" merges "ll" before anything else
        let tok = test_tokenizer(&[("he", 1.0), ("ll", 2.0), ("hell", 3.0), ("hello", 4.0)]);
        let ids = tok.encode("hello").unwrap();
        // merge order: ll, he, hell, hello
        let pieces: Vec<&[u8]> = ids.iter().map(|&id| tok.piece(id)).collect();
        assert_eq!(pieces, vec![b"hello".as_slice()]);
    }

    #[test]
    fn stops_when_no_merge_applies() {
        let tok = test_tokenizer(&[("ab", 1.0)]);
        let ids = tok.encode("aba").unwrap();
        let pieces: Vec<&[u8]> = ids.iter().map(|&id| tok.piece(id)).collect();
        assert_eq!(pieces, vec![b"ab".as_slice(), b"a".as_slice()]);
    }

    #[test]
    fn roundtrips_input_bytes() {
        let tok = test_tokenizer(&[("on", 1.5), ("ce", 1.0), ("once", 2.0), (" upon", 0.5)]);
        let input = "once upon a time";
        let ids = tok.encode(input).unwrap();
        let bytes: Vec<u8> = ids.iter().flat_map(|&id| tok.piece(id).to_vec()).collect();
        assert_eq!(bytes, input.as_bytes());
    }

    #[test]
    fn rejects_bytes_outside_vocabulary() {
        let tok = test_tokenizer(&[]);
        let err = tok.encode("héllo").unwrap_err();
        assert!(err.to_string().contains("not in the vocabulary"));
    }

    #[test]
    fn empty_prompt_encodes_to_nothing() {
        let tok = test_tokenizer(&[]);
        assert!(tok.encode("").unwrap().is_empty());
    }

    #[test]
    fn loads_the_binary_format() {
        let vocab: Vec<Vec<u8>> = vec![b"a".to_vec(), b"b".to_vec(), b"ab".to_vec()];
        let scores = [0.0f32, 0.0, 1.0];

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_u32::<LittleEndian>(8).unwrap();
        for (piece, score) in vocab.iter().zip(scores) {
            file.write_f32::<LittleEndian>(score).unwrap();
            file.write_i32::<LittleEndian>(piece.len() as i32).unwrap();
            file.write_all(piece).unwrap();
        }
        file.flush().unwrap();

        let tok = Tokenizer::from_file(file.path(), 3).unwrap();
        assert_eq!(tok.vocab_size(), 3);
        assert_eq!(tok.max_token_length(), 8);
        assert_eq!(tok.encode("ab").unwrap(), vec![2]);
    }

    #[test]
    fn truncated_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_u32::<LittleEndian>(8).unwrap();
        file.write_f32::<LittleEndian>(0.0).unwrap();
        file.flush().unwrap();
        assert!(Tokenizer::from_file(file.path(), 2).is_err());
    }
}
